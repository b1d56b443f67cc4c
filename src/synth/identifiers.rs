//! Identifier extraction over SQL text.
//!
//! Regex based on purpose: it has to work on whatever a generator emits,
//! including statements `sqlparser` later rejects. String literals are
//! blanked first so quoted text never reads as an identifier.

use crate::schema::{ColumnRef, SchemaContext};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};

lazy_static! {
    static ref STRING_LITERAL: Regex = Regex::new(r"'(?:[^']|'')*'").unwrap();
    static ref EXTRACT_FROM: Regex = Regex::new(r"(?i)\bextract\s*\(\s*\w+\s+from\b").unwrap();
    static ref DISTINCT_FROM: Regex = Regex::new(r"(?i)\bis\s+(?:not\s+)?distinct\s+from\b").unwrap();
    static ref CTE_NAME: Regex = Regex::new(r"(?i)(?:\bwith\s+(?:recursive\s+)?|,\s*)([a-z_][a-z0-9_]*)\s+as\s*\(").unwrap();
    static ref TABLE_REF: Regex =
        Regex::new(r"(?i)\b(?:from|join)\s+([a-z_][a-z0-9_\.]*)(?:\s+(?:as\s+)?([a-z_][a-z0-9_]*))?").unwrap();
    static ref QUALIFIED_COLUMN: Regex = Regex::new(r"(?i)\b([a-z_][a-z0-9_]*)\.([a-z_][a-z0-9_]*|\*)").unwrap();
}

/// Words that can follow a table name and must not be read as its alias
const NOT_AN_ALIAS: &[&str] = &[
    "where", "join", "inner", "left", "right", "full", "outer", "cross", "natural", "on", "using", "group",
    "order", "limit", "having", "union", "except", "intersect", "window", "offset", "fetch", "lateral", "as",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

/// Tables, CTE names and `qualifier.column` references found in a statement
#[derive(Debug, Clone, Default)]
pub struct SqlIdentifiers {
    /// FROM/JOIN references in order, with repeats
    pub tables: Vec<TableRef>,
    pub ctes: HashSet<String>,
    /// `(qualifier, column)` pairs, lowercased
    pub qualified_columns: Vec<(String, String)>,
}

/// Blank string literals and the FROM keywords that are not table references
pub fn normalize(sql: &str) -> String {
    let stripped = STRING_LITERAL.replace_all(sql, "''");
    let stripped = EXTRACT_FROM.replace_all(&stripped, "extract(");
    DISTINCT_FROM.replace_all(&stripped, "<>").into_owned()
}

pub fn extract(sql: &str) -> SqlIdentifiers {
    let text = normalize(sql).to_lowercase();

    let ctes: HashSet<String> = CTE_NAME
        .captures_iter(&text)
        .map(|c| c[1].to_string())
        .collect();

    let tables = TABLE_REF
        .captures_iter(&text)
        .map(|c| {
            let raw = &c[1];
            let name = raw.rsplit('.').next().unwrap_or(raw).to_string();
            let alias = c
                .get(2)
                .map(|m| m.as_str().to_string())
                .filter(|a| !NOT_AN_ALIAS.contains(&a.as_str()));
            TableRef { name, alias }
        })
        .collect();

    let qualified_columns = QUALIFIED_COLUMN
        .captures_iter(&text)
        .filter(|c| {
            // schema-qualified table names in FROM/JOIN are not column refs
            let start = c.get(0).map(|m| m.start()).unwrap_or(0);
            let before = text[..start].trim_end();
            !(before.ends_with("from") || before.ends_with("join"))
        })
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect();

    SqlIdentifiers {
        tables,
        ctes,
        qualified_columns,
    }
}

impl SqlIdentifiers {
    /// Physical tables referenced (CTE references excluded)
    pub fn physical_tables(&self) -> impl Iterator<Item = &TableRef> {
        self.tables.iter().filter(move |t| !self.ctes.contains(&t.name))
    }

    /// Reference count per physical table
    pub fn table_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for table in self.physical_tables() {
            *counts.entry(table.name.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Table a qualifier stands for: an alias, or a table named directly
    pub fn resolve_qualifier(&self, qualifier: &str) -> Option<&str> {
        self.tables
            .iter()
            .find(|t| t.alias.as_deref() == Some(qualifier))
            .or_else(|| self.tables.iter().find(|t| t.name == qualifier))
            .map(|t| t.name.as_str())
    }

    pub fn is_cte(&self, name: &str) -> bool {
        self.ctes.contains(name)
    }

    /// Distinct physical table names in first-seen order
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for table in self.physical_tables() {
            if !names.contains(&table.name) {
                names.push(table.name.clone());
            }
        }
        names
    }

    /// Column references resolved to physical tables, deduplicated
    pub fn column_refs(&self) -> Vec<ColumnRef> {
        let mut out: Vec<ColumnRef> = Vec::new();
        for (qualifier, column) in &self.qualified_columns {
            if column == "*" {
                continue;
            }
            if let Some(table) = self.resolve_qualifier(qualifier) {
                if self.is_cte(table) {
                    continue;
                }
                let r = ColumnRef::new(table, column.as_str());
                if !out.contains(&r) {
                    out.push(r);
                }
            }
        }
        out
    }

    /// First identifier outside the allow-list, described for a rejection message
    pub fn first_violation(&self, context: &SchemaContext) -> Option<String> {
        let allowed = context.table_names();
        for table in self.physical_tables() {
            if !allowed.contains(table.name.as_str()) {
                return Some(format!("table '{}' is not allow-listed", table.name));
            }
        }
        for (qualifier, column) in &self.qualified_columns {
            let table = match self.resolve_qualifier(qualifier) {
                Some(t) => t,
                None if self.is_cte(qualifier) => continue,
                None => return Some(format!("unknown qualifier '{}' in {}.{}", qualifier, qualifier, column)),
            };
            if self.is_cte(table) || column == "*" {
                continue;
            }
            if context.column(table, column).is_none() {
                return Some(format!("column '{}.{}' is not allow-listed in {}", qualifier, column, table));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixtures::retail_context;

    #[test]
    fn test_tables_aliases_and_columns() {
        let ids = extract(
            "SELECT t1.country, SUM(t0.total_amount) AS revenue FROM fact_sales AS t0 \
             JOIN dim_customer t1 ON t0.customer_id = t1.customer_id WHERE t1.country <> 'x.y' GROUP BY t1.country",
        );
        assert_eq!(ids.table_names(), vec!["fact_sales", "dim_customer"]);
        assert_eq!(ids.resolve_qualifier("t1"), Some("dim_customer"));
        assert!(ids.column_refs().contains(&ColumnRef::new("fact_sales", "total_amount")));
        assert!(ids.first_violation(&retail_context()).is_none());
    }

    #[test]
    fn test_cte_names_are_not_tables() {
        let ids = extract(
            "WITH series AS (SELECT f.customer_id FROM fact_sales f) SELECT series.customer_id FROM series",
        );
        assert!(ids.is_cte("series"));
        assert_eq!(ids.table_counts().get("fact_sales"), Some(&1));
        assert!(ids.table_counts().get("series").is_none());
        assert!(ids.first_violation(&retail_context()).is_none());
    }

    #[test]
    fn test_repeated_table_is_counted() {
        let ids = extract(
            "SELECT c.country FROM fact_sales f JOIN dim_customer c ON f.customer_id = c.customer_id \
             JOIN fact_sales f2 ON f2.customer_id = c.customer_id",
        );
        assert_eq!(ids.table_counts().get("fact_sales"), Some(&2));
    }

    #[test]
    fn test_violations() {
        let ctx = retail_context();
        assert!(extract("SELECT * FROM suppliers").first_violation(&ctx).unwrap().contains("suppliers"));
        assert!(extract("SELECT f.margin FROM fact_sales f").first_violation(&ctx).unwrap().contains("margin"));
        assert!(extract("SELECT x.total_amount FROM fact_sales f").first_violation(&ctx).is_some());
    }

    #[test]
    fn test_extract_keyword_is_not_a_table() {
        let ids = extract("SELECT EXTRACT(YEAR FROM f.invoice_timestamp) FROM fact_sales f");
        assert_eq!(ids.table_names(), vec!["fact_sales"]);
    }
}
