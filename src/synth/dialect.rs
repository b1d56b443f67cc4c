//! Dialect rendering
//!
//! The compiler builds a dialect-neutral [`QuerySpec`]; each engine renders
//! it with its own date bucketing and numeric rounding.

use crate::schema::{Aggregation, ColumnRef, JoinStep, TimeGrain};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Postgres,
    Sqlite,
    Mysql,
}

impl Dialect {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Dialect::Postgres),
            "sqlite" => Some(Dialect::Sqlite),
            "mysql" => Some(Dialect::Mysql),
            _ => None,
        }
    }

    /// Expression truncating `column` to the start of its `grain` bucket
    pub fn date_bucket(&self, column: &str, grain: TimeGrain) -> String {
        let grain = if grain.is_specified() { grain } else { TimeGrain::Month };
        match self {
            Dialect::Postgres => format!("date_trunc('{}', {})::date", grain.as_str(), column),
            Dialect::Sqlite => match grain {
                TimeGrain::Day => format!("date({})", column),
                TimeGrain::Week => format!("date({}, 'weekday 0', '-6 days')", column),
                TimeGrain::Quarter => format!(
                    "date(strftime('%Y-', {c}) || printf('%02d', ((cast(strftime('%m', {c}) as integer) - 1) / 3) * 3 + 1) || '-01')",
                    c = column
                ),
                TimeGrain::Year => format!("date(strftime('%Y-01-01', {}))", column),
                _ => format!("date(strftime('%Y-%m-01', {}))", column),
            },
            Dialect::Mysql => match grain {
                TimeGrain::Day => format!("date({})", column),
                TimeGrain::Week => format!("date(date_sub({c}, interval weekday({c}) day))", c = column),
                TimeGrain::Quarter => format!(
                    "makedate(year({c}), 1) + interval (quarter({c}) - 1) quarter",
                    c = column
                ),
                TimeGrain::Year => format!("str_to_date(concat(year({}), '-01-01'), '%Y-%m-%d')", column),
                _ => format!("str_to_date(date_format({}, '%Y-%m-01'), '%Y-%m-%d')", column),
            },
        }
    }

    /// Text every bucket expression for `grain` contains; used to check GROUP BY coverage
    pub fn bucket_signature(&self, grain: TimeGrain) -> String {
        let grain = if grain.is_specified() { grain } else { TimeGrain::Month };
        match (self, grain) {
            (Dialect::Postgres, g) => format!("date_trunc('{}'", g.as_str()),
            (Dialect::Sqlite, TimeGrain::Day) | (Dialect::Mysql, TimeGrain::Day) => "date(".to_string(),
            (Dialect::Sqlite, TimeGrain::Week) => "'weekday 0'".to_string(),
            (Dialect::Sqlite, TimeGrain::Quarter) => "strftime('%m'".to_string(),
            (Dialect::Sqlite, TimeGrain::Year) => "'%y-01-01'".to_string(),
            (Dialect::Sqlite, _) => "'%y-%m-01'".to_string(),
            (Dialect::Mysql, TimeGrain::Week) => "weekday(".to_string(),
            (Dialect::Mysql, TimeGrain::Quarter) => "quarter(".to_string(),
            (Dialect::Mysql, TimeGrain::Year) => "'-01-01'".to_string(),
            (Dialect::Mysql, _) => "'%y-%m-01'".to_string(),
        }
    }

    /// Aggregate rounded to four places
    pub fn rounded_aggregate(&self, aggregation: Aggregation, column: &str) -> String {
        let inner = match aggregation {
            Aggregation::Count => format!("COUNT({})", column),
            other => format!("{}({})", other.sql_function(), column),
        };
        match self {
            Dialect::Postgres => format!("ROUND(CAST({} AS numeric), 4)", inner),
            _ => format!("ROUND({}, 4)", inner),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Postgres => write!(f, "postgres"),
            Dialect::Sqlite => write!(f, "sqlite"),
            Dialect::Mysql => write!(f, "mysql"),
        }
    }
}

/// A grouping column of the query
#[derive(Debug, Clone, PartialEq)]
pub enum Dimension {
    Column { column: ColumnRef, alias: String },
    TimeBucket { column: ColumnRef, grain: TimeGrain, alias: String },
}

impl Dimension {
    pub fn alias(&self) -> &str {
        match self {
            Dimension::Column { alias, .. } | Dimension::TimeBucket { alias, .. } => alias,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricExpr {
    pub aggregation: Aggregation,
    pub column: ColumnRef,
    pub alias: String,
}

/// Post-aggregation shape
#[derive(Debug, Clone, PartialEq)]
pub enum QueryShape {
    /// One aggregated row per dimension tuple
    Grouped,
    /// Grouped series plus the previous bucket's value per entity
    PreviousPeriod,
    /// Grouped series plus the global average as baseline
    GlobalBaseline,
    /// Grouped rows ranked into quartiles by the metric
    Quartiles,
}

/// Dialect-neutral description of one analytical query
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub base_table: String,
    pub joins: Vec<JoinStep>,
    pub dimensions: Vec<Dimension>,
    pub metric: MetricExpr,
    pub shape: QueryShape,
    /// `(output alias, descending)`
    pub order_by: Vec<(String, bool)>,
    pub limit: Option<u32>,
}

impl QuerySpec {
    /// Table aliases: base is `t0`, each joined table gets the next number
    pub fn table_aliases(&self) -> BTreeMap<String, String> {
        let mut aliases = BTreeMap::new();
        aliases.insert(self.base_table.clone(), "t0".to_string());
        for step in &self.joins {
            let next = format!("t{}", aliases.len());
            aliases.entry(step.to_table.clone()).or_insert(next);
        }
        aliases
    }
}

pub trait SqlRenderer {
    fn render(&self, spec: &QuerySpec) -> String;
}

impl SqlRenderer for Dialect {
    fn render(&self, spec: &QuerySpec) -> String {
        let aliases = spec.table_aliases();
        let qualify = |column: &ColumnRef| -> String {
            let alias = aliases.get(&column.table).map(String::as_str).unwrap_or(column.table.as_str());
            format!("{}.{}", alias, column.column)
        };

        let dimension_exprs: Vec<(String, &str)> = spec
            .dimensions
            .iter()
            .map(|d| match d {
                Dimension::Column { column, alias } => (qualify(column), alias.as_str()),
                Dimension::TimeBucket { column, grain, alias } => {
                    (self.date_bucket(&qualify(column), *grain), alias.as_str())
                }
            })
            .collect();

        let mut select: Vec<String> = dimension_exprs
            .iter()
            .map(|(expr, alias)| format!("{} AS {}", expr, alias))
            .collect();
        select.push(format!(
            "{} AS {}",
            self.rounded_aggregate(spec.metric.aggregation, &qualify(&spec.metric.column)),
            spec.metric.alias
        ));
        if spec.shape == QueryShape::Quartiles {
            select.push(format!(
                "NTILE(4) OVER (ORDER BY {}({}) DESC) AS segment",
                spec.metric.aggregation.sql_function(),
                qualify(&spec.metric.column)
            ));
        }

        let mut lines = vec![format!("SELECT {}", select.join(", "))];
        lines.push(format!("FROM {} AS t0", spec.base_table));
        for step in &spec.joins {
            let left = aliases.get(&step.from_table).map(String::as_str).unwrap_or(step.from_table.as_str());
            let right = aliases.get(&step.to_table).map(String::as_str).unwrap_or(step.to_table.as_str());
            lines.push(format!(
                "JOIN {} AS {} ON {}.{} = {}.{}",
                step.to_table, right, left, step.from_column, right, step.to_column
            ));
        }
        if !dimension_exprs.is_empty() {
            let group: Vec<&str> = dimension_exprs.iter().map(|(expr, _)| expr.as_str()).collect();
            lines.push(format!("GROUP BY {}", group.join(", ")));
        }

        let order = render_order(&spec.order_by);
        match spec.shape {
            QueryShape::Grouped | QueryShape::Quartiles => {
                if !order.is_empty() {
                    lines.push(format!("ORDER BY {}", order));
                }
                if let Some(limit) = spec.limit {
                    lines.push(format!("LIMIT {}", limit));
                }
                lines.join("\n")
            }
            QueryShape::PreviousPeriod | QueryShape::GlobalBaseline => {
                let inner = lines.join("\n  ");
                let metric = &spec.metric.alias;
                let keys: Vec<&str> = spec.dimensions.iter().map(|d| d.alias()).collect();
                let window = match spec.shape {
                    QueryShape::PreviousPeriod => {
                        let period = spec
                            .dimensions
                            .iter()
                            .find(|d| matches!(d, Dimension::TimeBucket { .. }))
                            .map(|d| d.alias())
                            .unwrap_or("period");
                        let partition: Vec<&str> = keys.iter().copied().filter(|k| *k != period).collect();
                        let over = if partition.is_empty() {
                            format!("ORDER BY {}", period)
                        } else {
                            format!("PARTITION BY {} ORDER BY {}", partition.join(", "), period)
                        };
                        format!(
                            "LAG({m}) OVER ({o}) AS previous_{m}, {m} - LAG({m}) OVER ({o}) AS change",
                            m = metric,
                            o = over
                        )
                    }
                    _ => format!(
                        "ROUND(AVG({m}) OVER (), 4) AS baseline_{m}, ROUND({m} - AVG({m}) OVER (), 4) AS delta",
                        m = metric
                    ),
                };
                let mut outer = vec![
                    format!("WITH series AS (\n  {}\n)", inner),
                    format!("SELECT {}, {}, {}", keys.join(", "), metric, window),
                    "FROM series".to_string(),
                ];
                if !order.is_empty() {
                    outer.push(format!("ORDER BY {}", order));
                }
                if let Some(limit) = spec.limit {
                    outer.push(format!("LIMIT {}", limit));
                }
                outer.join("\n")
            }
        }
    }
}

fn render_order(order_by: &[(String, bool)]) -> String {
    order_by
        .iter()
        .map(|(alias, desc)| format!("{} {}", alias, if *desc { "DESC" } else { "ASC" }))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Cardinality;

    fn topn_spec() -> QuerySpec {
        QuerySpec {
            base_table: "fact_sales".to_string(),
            joins: vec![JoinStep {
                from_table: "fact_sales".to_string(),
                from_column: "customer_id".to_string(),
                to_table: "dim_customer".to_string(),
                to_column: "customer_id".to_string(),
                cardinality: Cardinality::ManyToOne,
            }],
            dimensions: vec![Dimension::Column {
                column: ColumnRef::new("dim_customer", "country"),
                alias: "country".to_string(),
            }],
            metric: MetricExpr {
                aggregation: Aggregation::Sum,
                column: ColumnRef::new("fact_sales", "total_amount"),
                alias: "revenue".to_string(),
            },
            shape: QueryShape::Grouped,
            order_by: vec![("revenue".to_string(), true), ("country".to_string(), false)],
            limit: Some(5),
        }
    }

    #[test]
    fn test_render_topn_sqlite() {
        let sql = Dialect::Sqlite.render(&topn_spec());
        assert_eq!(
            sql,
            "SELECT t1.country AS country, ROUND(SUM(t0.total_amount), 4) AS revenue\n\
             FROM fact_sales AS t0\n\
             JOIN dim_customer AS t1 ON t0.customer_id = t1.customer_id\n\
             GROUP BY t1.country\n\
             ORDER BY revenue DESC, country ASC\n\
             LIMIT 5"
        );
    }

    #[test]
    fn test_postgres_rounds_through_numeric() {
        let sql = Dialect::Postgres.render(&topn_spec());
        assert!(sql.contains("ROUND(CAST(SUM(t0.total_amount) AS numeric), 4)"));
    }

    #[test]
    fn test_date_buckets() {
        assert_eq!(
            Dialect::Postgres.date_bucket("t0.ts", TimeGrain::Month),
            "date_trunc('month', t0.ts)::date"
        );
        assert_eq!(Dialect::Sqlite.date_bucket("t0.ts", TimeGrain::Year), "date(strftime('%Y-01-01', t0.ts))");
        assert_eq!(Dialect::Sqlite.date_bucket("t0.ts", TimeGrain::Day), "date(t0.ts)");
        for dialect in [Dialect::Postgres, Dialect::Sqlite, Dialect::Mysql] {
            for grain in TimeGrain::ALL {
                let bucket = dialect.date_bucket("t0.ts", grain).to_lowercase();
                assert!(bucket.contains(&dialect.bucket_signature(grain)), "{} {}", dialect, grain);
            }
        }
    }

    #[test]
    fn test_previous_period_wraps_in_cte() {
        let mut spec = topn_spec();
        spec.dimensions.push(Dimension::TimeBucket {
            column: ColumnRef::new("fact_sales", "invoice_timestamp"),
            grain: TimeGrain::Month,
            alias: "period".to_string(),
        });
        spec.shape = QueryShape::PreviousPeriod;
        spec.order_by = vec![("country".to_string(), false), ("period".to_string(), false)];
        spec.limit = None;
        let sql = Dialect::Sqlite.render(&spec);
        assert!(sql.starts_with("WITH series AS ("));
        assert!(sql.contains("LAG(revenue) OVER (PARTITION BY country ORDER BY period) AS previous_revenue"));
    }
}
