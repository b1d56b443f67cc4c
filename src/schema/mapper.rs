//! Heuristic Semantic Mapper
//!
//! Bootstrap role inference from column names and types, used when no
//! governed contract covers a column. Everything produced here is tagged
//! `RoleSource::Heuristic` and can never lift a response to `high`.

use super::{Aggregation, DataType, RoleCandidate, RoleSource, SemanticRole, TableSchema, TimeGrain};

const ENTITY_KEYWORDS: &[&str] = &[
    "country", "customer", "product", "category", "region", "segment", "name", "city",
];
const MEASURE_KEYWORDS: &[&str] = &[
    "amount", "revenue", "price", "total", "qty", "quantity", "sales", "value", "score",
];
const TIME_KEYWORDS: &[&str] = &["date", "time", "created", "updated", "timestamp"];

/// Minimum score for a column to be proposed at all
const MIN_SCORE: f64 = 0.45;

fn keyword_score(name: &str, keywords: &[&str], weight: f64) -> f64 {
    let lowered = name.to_lowercase();
    if keywords.iter().any(|k| lowered.contains(k)) {
        weight
    } else {
        0.0
    }
}

/// Concept name derived from a column name: `customer_id` -> `customer`
fn concept_name(column: &str) -> String {
    let lowered = column.to_lowercase();
    let trimmed = lowered
        .strip_suffix("_id")
        .or_else(|| lowered.strip_suffix("_key"))
        .unwrap_or(&lowered);
    trimmed.replace('_', " ")
}

fn round4(value: f64) -> f64 {
    (value.min(1.0) * 10_000.0).round() / 10_000.0
}

/// Infer entity, measure and time candidates for every table
pub fn heuristic_roles(tables: &[TableSchema]) -> Vec<RoleCandidate> {
    let mut entities = Vec::new();
    let mut measures = Vec::new();
    let mut times = Vec::new();

    for table in tables {
        let populated = table.row_count.map(|n| n > 0).unwrap_or(false);

        for column in &table.columns {
            let concept = concept_name(&column.name);
            let mut aliases = Vec::new();
            let spaced = column.name.to_lowercase().replace('_', " ");
            if spaced != concept {
                aliases.push(spaced);
            }

            if matches!(column.data_type, DataType::Text | DataType::Integer) {
                let mut score = 0.1 + keyword_score(&column.name, ENTITY_KEYWORDS, 0.6);
                if !column.is_primary_key {
                    score += 0.2;
                }
                if populated {
                    score += 0.1;
                }
                if score >= MIN_SCORE {
                    entities.push(candidate(table, &column.name, &concept, &aliases, SemanticRole::Entity, score));
                }
            }

            if column.data_type.is_numeric() {
                let mut score = 0.2 + keyword_score(&column.name, MEASURE_KEYWORDS, 0.6);
                if populated {
                    score += 0.1;
                }
                if score >= MIN_SCORE {
                    let mut measure =
                        candidate(table, &column.name, &concept, &aliases, SemanticRole::Measure, score);
                    measure.default_aggregation = Some(Aggregation::Sum);
                    measures.push(measure);
                }
            }

            if column.data_type.is_temporal() {
                let score = 0.3 + keyword_score(&column.name, TIME_KEYWORDS, 0.6);
                if score >= MIN_SCORE {
                    let mut time = candidate(table, &column.name, &concept, &aliases, SemanticRole::Time, score);
                    time.default_grain = Some(TimeGrain::Month);
                    times.push(time);
                }
            }
        }
    }

    for group in [&mut entities, &mut measures, &mut times] {
        group.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.table.cmp(&b.table))
                .then_with(|| a.column.cmp(&b.column))
        });
    }

    entities.into_iter().chain(measures).chain(times).collect()
}

fn candidate(
    table: &TableSchema,
    column: &str,
    concept: &str,
    aliases: &[String],
    role: SemanticRole,
    score: f64,
) -> RoleCandidate {
    RoleCandidate {
        concept: concept.to_string(),
        role,
        table: table.name.clone(),
        column: column.to_string(),
        aliases: aliases.to_vec(),
        confidence: round4(score),
        source: RoleSource::Heuristic,
        default_aggregation: None,
        supported_grains: Vec::new(),
        default_grain: None,
    }
}
