//! Keyword Planner
//!
//! Deterministic planning from question cues and phrase matches against the
//! context's role candidates. Never binds a concept that is not a candidate.

use super::{
    candidate_order, choose_time_binding, is_excluded, offered_concepts, ClarificationNeeded, CompareAgainst,
    EntityScope, MetricBinding, Plan, PlanHint, PlanInput, PlanOutcome, PlanStrategy, SlotBinding, TaskType,
};
use crate::error::Result;
use crate::schema::{Aggregation, RoleCandidate, SchemaContext, SemanticRole, TimeGrain};
use async_trait::async_trait;
use std::collections::HashSet;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "by", "per", "for", "each", "every", "in", "over", "across", "of", "with",
    "from", "to", "during", "on", "at", "last", "this", "that", "what", "which", "is", "are", "was", "were", "show",
    "me", "give", "list", "find", "how", "much", "many", "did", "do", "top", "than", "v", "vs", "versus",
    "against", "their", "our", "all", "total",
];
const TIME_WORDS: &[&str] = &["time", "period", "date", "trend"];
const TREND_WORDS: &[&str] = &["trend", "trending", "evolution", "timeline"];
const SEGMENT_WORDS: &[&str] = &["segmentation", "segmenting", "cluster", "clustering", "rfm"];
const COMPARE_WORDS: &[&str] = &["compare", "comparison", "versus", "vs", "v", "growth", "change"];
const PREVIOUS_WORDS: &[&str] = &["previous", "prior", "preceding"];
const GLOBAL_WORDS: &[&str] = &["global", "overall", "baseline", "average"];
const GROUPING_WORDS: &[&str] = &["by", "per", "across", "each"];

/// Fold a word to a rough singular so `countries` matches `country`
fn singular(word: &str) -> String {
    if word.len() > 4 && word.ends_with("ies") {
        return format!("{}y", &word[..word.len() - 3]);
    }
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") && !word.ends_with("us") && !word.ends_with("is") {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}

/// Lowercase, split on non-alphanumerics, fold plurals
pub(crate) fn normalize_phrase(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(singular)
        .collect()
}

struct PhraseMatch<'a> {
    candidate: &'a RoleCandidate,
    start: usize,
    len: usize,
}

fn find_occurrence(tokens: &[String], phrase: &[String]) -> Option<usize> {
    if phrase.is_empty() || phrase.len() > tokens.len() {
        return None;
    }
    (0..=tokens.len() - phrase.len()).find(|&i| tokens[i..i + phrase.len()] == *phrase)
}

fn phrase_matches<'a>(
    tokens: &[String],
    context: &'a SchemaContext,
    role: SemanticRole,
    hint: Option<&PlanHint>,
) -> Vec<PhraseMatch<'a>> {
    let mut out = Vec::new();
    for candidate in context.candidates(role) {
        if is_excluded(candidate, hint) {
            continue;
        }
        let best = candidate
            .surface_forms()
            .iter()
            .map(|form| normalize_phrase(form))
            .filter_map(|phrase| find_occurrence(tokens, &phrase).map(|start| (start, phrase.len())))
            .max_by_key(|(_, len)| *len);
        if let Some((start, len)) = best {
            out.push(PhraseMatch { candidate, start, len });
        }
    }
    out
}

enum Pick {
    Bound(SlotBinding),
    BelowFloor(String),
    Missing,
}

fn pick(matches: &[PhraseMatch<'_>], floor: f64) -> Pick {
    if matches.is_empty() {
        return Pick::Missing;
    }
    let mut ranked: Vec<&PhraseMatch<'_>> = matches.iter().collect();
    ranked.sort_by(|a, b| b.len.cmp(&a.len).then_with(|| candidate_order(a.candidate, b.candidate)));
    match ranked.iter().find(|m| m.candidate.confidence >= floor) {
        Some(m) => Pick::Bound(SlotBinding::from_candidate(m.candidate)),
        None => Pick::BelowFloor(ranked[0].candidate.concept.clone()),
    }
}

/// Deterministic planner driven by question cues
#[derive(Debug, Clone, Default)]
pub struct KeywordPlanner;

impl KeywordPlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn plan_question(&self, input: &PlanInput<'_>, context: &SchemaContext) -> PlanOutcome {
        let tokens = normalize_phrase(input.question);
        let floor = input.confidence_floor;
        let has = |words: &[&str]| tokens.iter().any(|t| words.contains(&t.as_str()));

        // top N
        let top_index = tokens.iter().position(|t| t == "top");
        let n = top_index
            .and_then(|i| tokens.get(i + 1))
            .and_then(|t| t.parse::<u32>().ok());

        let grain = tokens
            .iter()
            .filter_map(|t| TimeGrain::parse(t))
            .find(|g| g.is_specified())
            .unwrap_or(TimeGrain::Unspecified);

        let previous_period = has(PREVIOUS_WORDS)
            || contains_sequence(&tokens, &["over", "month"])
            || contains_sequence(&tokens, &["over", "year"]);
        let global_baseline = GLOBAL_WORDS.iter().any(|w| {
            tokens.iter().enumerate().any(|(i, t)| {
                t == w && (*w != "average" || (i > 0 && ["v", "vs", "versus", "against", "than"].contains(&tokens[i - 1].as_str())))
            })
        });

        let task_type = if top_index.is_some() {
            TaskType::TopN
        } else if has(SEGMENT_WORDS) {
            TaskType::Segment
        } else if has(COMPARE_WORDS) || previous_period || global_baseline {
            TaskType::Compare
        } else if has(TREND_WORDS) || contains_sequence(&tokens, &["over", "time"]) || grain.is_specified() {
            TaskType::Trend
        } else {
            TaskType::Aggregate
        };

        let compare_against = if previous_period {
            CompareAgainst::PreviousPeriod
        } else if global_baseline {
            CompareAgainst::Global
        } else {
            CompareAgainst::None
        };

        let measure_matches = phrase_matches(&tokens, context, SemanticRole::Measure, input.hint);
        let entity_matches = phrase_matches(&tokens, context, SemanticRole::Entity, input.hint);
        let time_matches = phrase_matches(&tokens, context, SemanticRole::Time, input.hint);

        // every grouping term must be grounded in something
        let mut covered: HashSet<usize> = HashSet::new();
        for m in measure_matches.iter().chain(&entity_matches).chain(&time_matches) {
            covered.extend(m.start..m.start + m.len);
        }
        for (i, t) in tokens.iter().enumerate() {
            if TIME_WORDS.contains(&t.as_str()) || TimeGrain::parse(t).map(|g| g.is_specified()).unwrap_or(false) {
                covered.insert(i);
            }
        }
        for (position, term) in grouping_terms(&tokens, top_index) {
            if term.iter().any(|i| covered.contains(i)) {
                continue;
            }
            let words: Vec<&str> = term.iter().map(|i| tokens[*i].as_str()).collect();
            let slot = if task_type == TaskType::TopN && position == TermPosition::AfterBy {
                ("metric", SemanticRole::Measure)
            } else {
                ("entity_dimension", SemanticRole::Entity)
            };
            return PlanOutcome::Clarification(ClarificationNeeded {
                slot: slot.0.to_string(),
                term: Some(words.join(" ")),
                reason: format!("'{}' does not match any known {} in this dataset", words.join(" "), slot.1),
                candidates: offered_concepts(context, slot.1, floor),
            });
        }

        let measure = match pick(&measure_matches, floor) {
            Pick::Bound(b) => b,
            Pick::BelowFloor(concept) => {
                return clarify(context, "metric", Some(concept.clone()), SemanticRole::Measure, floor, format!(
                    "measure '{}' is mapped below the confidence floor {:.2}",
                    concept, floor
                ))
            }
            Pick::Missing => {
                return clarify(context, "metric", None, SemanticRole::Measure, floor,
                    "question does not name a measure known to this dataset".to_string())
            }
        };

        let entity = match pick(&entity_matches, floor) {
            Pick::Bound(b) => Some(b),
            Pick::BelowFloor(concept) => {
                return clarify(context, "entity_dimension", Some(concept.clone()), SemanticRole::Entity, floor, format!(
                    "entity '{}' is mapped below the confidence floor {:.2}",
                    concept, floor
                ))
            }
            Pick::Missing if task_type.requires_entity() => {
                return clarify(context, "entity_dimension", None, SemanticRole::Entity, floor,
                    format!("a {} question needs an entity dimension", task_type))
            }
            Pick::Missing => None,
        };

        let aggregation = aggregation_cue(&tokens, global_baseline).unwrap_or_else(|| {
            context
                .candidate_for(SemanticRole::Measure, &measure.column_ref())
                .and_then(|c| c.default_aggregation)
                .unwrap_or(Aggregation::Sum)
        });

        let time_dimension = if task_type.requires_time() || grain.is_specified() {
            match pick(&time_matches, floor) {
                Pick::Bound(b) => Some(b),
                _ => choose_time_binding(context, Some(&measure.table), floor, input.hint),
            }
        } else {
            None
        };

        let entity_scope = if task_type == TaskType::TopN {
            EntityScope::TopN
        } else {
            EntityScope::All
        };

        PlanOutcome::Planned(Plan {
            question: input.question.to_string(),
            task_type,
            entity_dimension: entity,
            entity_scope,
            n: if entity_scope == EntityScope::TopN { n } else { None },
            metric: Some(MetricBinding { measure, aggregation }),
            time_dimension,
            time_grain: grain,
            compare_against,
            planner_source: "keyword".to_string(),
            schema_hash: String::new(),
        })
    }
}

#[async_trait]
impl PlanStrategy for KeywordPlanner {
    fn name(&self) -> &'static str {
        "keyword"
    }

    async fn propose(&self, input: &PlanInput<'_>, context: &SchemaContext) -> Result<PlanOutcome> {
        Ok(self.plan_question(input, context))
    }
}

fn clarify(
    context: &SchemaContext,
    slot: &str,
    term: Option<String>,
    role: SemanticRole,
    floor: f64,
    reason: String,
) -> PlanOutcome {
    PlanOutcome::Clarification(ClarificationNeeded {
        slot: slot.to_string(),
        term,
        reason,
        candidates: offered_concepts(context, role, floor),
    })
}

fn contains_sequence(tokens: &[String], seq: &[&str]) -> bool {
    let seq: Vec<String> = seq.iter().map(|s| s.to_string()).collect();
    find_occurrence(tokens, &seq).is_some()
}

fn aggregation_cue(tokens: &[String], average_is_baseline: bool) -> Option<Aggregation> {
    let has = |w: &str| tokens.iter().any(|t| t == w);
    if (has("average") && !average_is_baseline) || has("avg") || has("mean") {
        return Some(Aggregation::Avg);
    }
    if has("count") || has("number") || contains_sequence(tokens, &["how", "many"]) {
        return Some(Aggregation::Count);
    }
    if has("maximum") || has("max") {
        return Some(Aggregation::Max);
    }
    if has("minimum") || has("min") {
        return Some(Aggregation::Min);
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TermPosition {
    AfterTop,
    AfterBy,
}

/// Token index runs that name a grouping: the noun after `top N`, and
/// whatever follows `by` / `per` / `across` / `each`
fn grouping_terms(tokens: &[String], top_index: Option<usize>) -> Vec<(TermPosition, Vec<usize>)> {
    let mut terms = Vec::new();
    let collect = |start: usize| -> Vec<usize> {
        (start..tokens.len())
            .take_while(|&i| !STOP_WORDS.contains(&tokens[i].as_str()) && tokens[i].parse::<f64>().is_err())
            .take(3)
            .collect()
    };

    if let Some(i) = top_index {
        let start = if tokens.get(i + 1).map(|t| t.parse::<u32>().is_ok()).unwrap_or(false) {
            i + 2
        } else {
            i + 1
        };
        let term = collect(start);
        if !term.is_empty() {
            terms.push((TermPosition::AfterTop, term));
        }
    }
    for (i, t) in tokens.iter().enumerate() {
        if GROUPING_WORDS.contains(&t.as_str()) {
            let term = collect(i + 1);
            if !term.is_empty() {
                terms.push((TermPosition::AfterBy, term));
            }
        }
    }
    terms
}
