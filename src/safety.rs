//! Safety Validator
//!
//! Deterministic guard in front of the executor. A candidate passes only
//! as a single read-only SELECT/WITH statement over allow-listed
//! identifiers with bounded rows and a bounded timeout. It rejects or
//! passes; it never warns.

use crate::schema::SchemaContext;
use crate::synth::identifiers;
use crate::synth::{CandidateSql, Dialect};
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Expr, Ident, Query, Select, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins, Value, Visit, Visitor,
};
use sqlparser::dialect::{GenericDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use tracing::warn;

/// Statement kinds that name themselves in a rejection
const DENYLIST: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "create", "truncate", "grant", "revoke", "copy", "call", "do",
    "vacuum", "comment", "attach", "pragma",
];

/// A statement cleared for execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckedSql {
    pub statement: String,
    pub row_limit: u32,
    pub timeout_ms: u64,
    pub limit_injected: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyVerdict {
    Pass(CheckedSql),
    Reject(String),
}

#[derive(Debug, Clone)]
pub struct SafetyValidator {
    dialect: Dialect,
    default_row_limit: u32,
    max_row_limit: u32,
    max_timeout_ms: u64,
}

impl SafetyValidator {
    pub fn new(dialect: Dialect, default_row_limit: u32, max_row_limit: u32, max_timeout_ms: u64) -> Self {
        Self {
            dialect,
            default_row_limit,
            max_row_limit,
            max_timeout_ms,
        }
    }

    pub fn check(&self, candidate: &CandidateSql, context: &SchemaContext) -> SafetyVerdict {
        match self.check_inner(candidate, context) {
            Ok(checked) => SafetyVerdict::Pass(checked),
            Err(reason) => {
                warn!("safety rejected: {}", reason);
                SafetyVerdict::Reject(reason)
            }
        }
    }

    fn check_inner(&self, candidate: &CandidateSql, context: &SchemaContext) -> Result<CheckedSql, String> {
        let text = candidate.statement_text.trim();
        if text.is_empty() {
            return Err("empty statement".to_string());
        }

        // a single trailing semicolon is tolerated
        let body = text.strip_suffix(';').unwrap_or(text).trim_end();
        let normalized = identifiers::normalize(body).to_lowercase();
        if normalized.contains(';') {
            return Err("multiple statements are not allowed".to_string());
        }

        let statements = self.parse(body)?;
        if statements.len() != 1 {
            return Err(format!("expected one statement, found {}", statements.len()));
        }
        let query = match &statements[0] {
            Statement::Query(query) => query,
            other => {
                let kind = other.to_string();
                let head = kind.split_whitespace().next().unwrap_or("unknown").to_lowercase();
                if DENYLIST.contains(&head.as_str()) {
                    return Err(format!("forbidden keyword '{}'", head));
                }
                return Err(format!("only SELECT/WITH queries are allowed, got {}", head.to_uppercase()));
            }
        };

        let ids = identifiers::extract(body);
        if let Some(violation) = ids.first_violation(context) {
            return Err(violation);
        }
        ScopeResolver::new(context).query(query, &Names::new())?;

        let timeout_ms = match candidate.timeout_ms {
            None => return Err("missing timeout directive".to_string()),
            Some(0) => return Err("timeout directive must be positive".to_string()),
            Some(ms) if ms > self.max_timeout_ms => {
                return Err(format!("timeout {} ms exceeds maximum {} ms", ms, self.max_timeout_ms))
            }
            Some(ms) => ms,
        };

        let row_limit = candidate.row_limit.unwrap_or(self.default_row_limit);
        if row_limit == 0 || row_limit > self.max_row_limit {
            return Err(format!("row limit {} outside [1, {}]", row_limit, self.max_row_limit));
        }

        let (statement, limit_injected) = match &query.limit {
            Some(Expr::Value(Value::Number(raw, _))) => {
                let limit: u64 = raw
                    .parse()
                    .map_err(|_| format!("LIMIT '{}' is not a whole number", raw))?;
                if limit > self.max_row_limit as u64 {
                    return Err(format!("LIMIT {} exceeds maximum {}", limit, self.max_row_limit));
                }
                (body.to_string(), false)
            }
            Some(other) => return Err(format!("LIMIT must be a literal, got '{}'", other)),
            None => (format!("{}\nLIMIT {}", body, row_limit), true),
        };

        Ok(CheckedSql {
            statement,
            row_limit,
            timeout_ms,
            limit_injected,
        })
    }

    fn parse(&self, sql: &str) -> Result<Vec<Statement>, String> {
        let result = match self.dialect {
            Dialect::Postgres => Parser::parse_sql(&PostgreSqlDialect {}, sql),
            Dialect::Sqlite => Parser::parse_sql(&SQLiteDialect {}, sql),
            Dialect::Mysql => Parser::parse_sql(&MySqlDialect {}, sql),
        };
        result
            .or_else(|_| Parser::parse_sql(&GenericDialect {}, sql))
            .map_err(|e| format!("parse error: {}", e))
    }
}

/// Lowercased names a bare identifier may resolve to
type Names = HashSet<String>;

fn ident_name(ident: &Ident) -> String {
    ident.value.to_lowercase()
}

/// Output name of an unaliased projection item
fn expr_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident_name(ident)),
        Expr::CompoundIdentifier(parts) => parts.last().map(ident_name),
        _ => None,
    }
}

/// Output names a query declares without looking at its FROM scope
fn declared_outputs(body: &SetExpr) -> Names {
    match body {
        SetExpr::Select(select) => select
            .projection
            .iter()
            .filter_map(|item| match item {
                SelectItem::ExprWithAlias { alias, .. } => Some(ident_name(alias)),
                SelectItem::UnnamedExpr(expr) => expr_name(expr),
                _ => None,
            })
            .collect(),
        SetExpr::SetOperation { left, .. } => declared_outputs(left),
        SetExpr::Query(query) => declared_outputs(&query.body),
        _ => Names::new(),
    }
}

/// Collects bare identifiers of one scope. Nested subqueries and derived
/// tables belong to their own scope: they are counted by depth and the
/// expression subqueries are handed back for a separate pass.
#[derive(Default)]
struct BareIdentifiers {
    depth: usize,
    names: Vec<String>,
    subqueries: Vec<Query>,
}

fn subquery_of(expr: &Expr) -> Option<&Query> {
    match expr {
        Expr::Subquery(query)
        | Expr::ArraySubquery(query)
        | Expr::Exists { subquery: query, .. }
        | Expr::InSubquery { subquery: query, .. } => Some(query.as_ref()),
        _ => None,
    }
}

impl Visitor for BareIdentifiers {
    type Break = ();

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        if let Some(query) = subquery_of(expr) {
            if self.depth == 0 {
                self.subqueries.push(query.clone());
            }
            self.depth += 1;
        } else if let Expr::Identifier(ident) = expr {
            if self.depth == 0 {
                self.names.push(ident_name(ident));
            }
        }
        ControlFlow::Continue(())
    }

    fn post_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        if subquery_of(expr).is_some() {
            self.depth -= 1;
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<()> {
        if matches!(factor, TableFactor::Derived { .. }) {
            self.depth += 1;
        }
        ControlFlow::Continue(())
    }

    fn post_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<()> {
        if matches!(factor, TableFactor::Derived { .. }) {
            self.depth -= 1;
        }
        ControlFlow::Continue(())
    }
}

/// Resolves unqualified column references against the FROM scope they
/// appear in: columns of the allow-listed tables there, columns a CTE or
/// derived table exposes, and output aliases where SQL allows them.
struct ScopeResolver<'a> {
    context: &'a SchemaContext,
    ctes: HashMap<String, Names>,
}

impl<'a> ScopeResolver<'a> {
    fn new(context: &'a SchemaContext) -> Self {
        Self {
            context,
            ctes: HashMap::new(),
        }
    }

    /// Check a query and return its output names
    fn query(&mut self, query: &Query, outer: &Names) -> Result<Names, String> {
        let visible_ctes = self.ctes.clone();
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let name = ident_name(&cte.alias.name);
                let declared: Names = cte.alias.columns.iter().map(ident_name).collect();
                // a recursive member references the CTE by its declared outputs
                let provisional = if declared.is_empty() {
                    declared_outputs(&cte.query.body)
                } else {
                    declared.clone()
                };
                self.ctes.insert(name.clone(), provisional);
                let outputs = self.query(&cte.query, outer)?;
                self.ctes.insert(name, if declared.is_empty() { outputs } else { declared });
            }
        }

        let (mut scope, outputs) = self.set_expr(&query.body, outer)?;
        scope.extend(outputs.iter().cloned());
        for item in &query.order_by {
            self.resolve(&item.expr, &scope)?;
        }

        self.ctes = visible_ctes;
        Ok(outputs)
    }

    /// Returns the names ORDER BY may use and the output names
    fn set_expr(&mut self, body: &SetExpr, outer: &Names) -> Result<(Names, Names), String> {
        match body {
            SetExpr::Select(select) => self.select(select, outer),
            SetExpr::Query(query) => {
                let outputs = self.query(query, outer)?;
                Ok((outputs.clone(), outputs))
            }
            SetExpr::SetOperation { left, right, .. } => {
                let (_, outputs) = self.set_expr(left, outer)?;
                self.set_expr(right, outer)?;
                Ok((outputs.clone(), outputs))
            }
            SetExpr::Insert(_) => Err("forbidden keyword 'insert'".to_string()),
            SetExpr::Update(_) => Err("forbidden keyword 'update'".to_string()),
            _ => Ok((Names::new(), Names::new())),
        }
    }

    fn select(&mut self, select: &Select, outer: &Names) -> Result<(Names, Names), String> {
        let mut local = Names::new();
        for table in &select.from {
            self.table_with_joins(table, outer, &mut local)?;
        }
        let mut scope = outer.clone();
        scope.extend(local.iter().cloned());

        let mut outputs = Names::new();
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => {
                    self.resolve(expr, &scope)?;
                    outputs.extend(expr_name(expr));
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    self.resolve(expr, &scope)?;
                    outputs.insert(ident_name(alias));
                }
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => outputs.extend(local.iter().cloned()),
            }
        }
        for table in &select.from {
            self.resolve(table, &scope)?;
        }

        // WHERE, GROUP BY and HAVING may also name output aliases
        scope.extend(outputs.iter().cloned());
        self.resolve(&select.selection, &scope)?;
        self.resolve(&select.group_by, &scope)?;
        self.resolve(&select.having, &scope)?;
        Ok((scope, outputs))
    }

    fn table_with_joins(&mut self, table: &TableWithJoins, outer: &Names, local: &mut Names) -> Result<(), String> {
        self.table_factor(&table.relation, outer, local)?;
        for join in &table.joins {
            self.table_factor(&join.relation, outer, local)?;
        }
        Ok(())
    }

    fn table_factor(&mut self, factor: &TableFactor, outer: &Names, local: &mut Names) -> Result<(), String> {
        match factor {
            TableFactor::Table { name, .. } => {
                let table = name.0.last().map(ident_name).unwrap_or_default();
                if let Some(columns) = self.ctes.get(&table) {
                    local.extend(columns.iter().cloned());
                } else if let Some(schema) = self.context.table(&table) {
                    local.extend(schema.columns.iter().map(|c| c.name.to_lowercase()));
                } else {
                    return Err(format!("table '{}' is not allow-listed", table));
                }
            }
            TableFactor::Derived { subquery, alias, .. } => {
                let outputs = self.query(subquery, outer)?;
                let declared: Names = alias
                    .iter()
                    .flat_map(|a| a.columns.iter().map(ident_name))
                    .collect();
                local.extend(if declared.is_empty() { outputs } else { declared });
            }
            TableFactor::NestedJoin { table_with_joins, .. } => {
                self.table_with_joins(table_with_joins, outer, local)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Reject the first bare identifier of `node` that `scope` does not
    /// cover, then check its subqueries with `scope` as their outer scope
    fn resolve<N: Visit>(&mut self, node: &N, scope: &Names) -> Result<(), String> {
        let mut collector = BareIdentifiers::default();
        let _ = node.visit(&mut collector);
        if let Some(name) = collector.names.iter().find(|n| !scope.contains(n.as_str())) {
            return Err(format!("column '{}' does not resolve to an allow-listed column", name));
        }
        for subquery in &collector.subqueries {
            self.query(subquery, scope)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixtures::retail_context;
    use crate::synth::GenerationMode;

    fn candidate(sql: &str) -> CandidateSql {
        let mut c = CandidateSql::from_statement(sql.to_string(), GenerationMode::Synthesized, Vec::new());
        c.row_limit = Some(100);
        c.timeout_ms = Some(15_000);
        c
    }

    fn validator() -> SafetyValidator {
        SafetyValidator::new(Dialect::Sqlite, 100, 2000, 120_000)
    }

    fn rejected(sql: &str) -> String {
        match validator().check(&candidate(sql), &retail_context()) {
            SafetyVerdict::Reject(reason) => reason,
            SafetyVerdict::Pass(p) => panic!("expected rejection, passed: {}", p.statement),
        }
    }

    #[test]
    fn test_passes_select_and_keeps_limit() {
        let sql = "SELECT t1.country, SUM(t0.total_amount) AS revenue FROM fact_sales AS t0 \
                   JOIN dim_customer AS t1 ON t0.customer_id = t1.customer_id GROUP BY t1.country LIMIT 5;";
        match validator().check(&candidate(sql), &retail_context()) {
            SafetyVerdict::Pass(checked) => {
                assert!(!checked.limit_injected);
                assert!(!checked.statement.ends_with(';'));
                assert_eq!(checked.timeout_ms, 15_000);
            }
            SafetyVerdict::Reject(r) => panic!("unexpected rejection: {}", r),
        }
    }

    #[test]
    fn test_injects_default_limit() {
        match validator().check(&candidate("SELECT f.invoice_no FROM fact_sales f"), &retail_context()) {
            SafetyVerdict::Pass(checked) => {
                assert!(checked.limit_injected);
                assert!(checked.statement.ends_with("LIMIT 100"));
            }
            SafetyVerdict::Reject(r) => panic!("unexpected rejection: {}", r),
        }
    }

    #[test]
    fn test_rejections() {
        assert!(rejected("").contains("empty"));
        assert!(rejected("SELECT 1; SELECT 2").contains("multiple"));
        assert!(rejected("DELETE FROM fact_sales").contains("delete"));
        assert!(rejected("SELECT * FROM suppliers").contains("suppliers"));
        assert!(rejected("SELECT f.margin FROM fact_sales f").contains("margin"));
        assert!(rejected("SELECT f.invoice_no FROM fact_sales f LIMIT 5000").contains("exceeds"));
        assert!(rejected("SELEC f.invoice_no FROM fact_sales f").contains("parse error"));
    }

    #[test]
    fn test_bare_columns_resolve_against_from_scope() {
        assert!(rejected("SELECT secret_margin FROM fact_sales").contains("secret_margin"));
        assert!(rejected("SELECT country FROM fact_sales").contains("country"));
        assert!(rejected("SELECT f.invoice_no FROM fact_sales f WHERE secret_margin > 0").contains("secret_margin"));
        assert!(
            rejected("SELECT c.country FROM dim_customer c WHERE EXISTS (SELECT 1 FROM fact_sales WHERE hidden = 1)")
                .contains("hidden")
        );
        // an output alias never vouches for the expression it names
        assert!(rejected("SELECT secret_margin AS secret_margin FROM fact_sales").contains("secret_margin"));

        for sql in [
            "SELECT invoice_no, total_amount FROM fact_sales",
            "SELECT country FROM fact_sales JOIN dim_customer ON fact_sales.customer_id = dim_customer.customer_id",
            "SELECT SUM(total_amount) AS revenue FROM fact_sales ORDER BY revenue DESC",
            "SELECT k FROM (SELECT customer_id AS k FROM fact_sales) AS sub",
            "SELECT c.country FROM dim_customer c WHERE EXISTS (SELECT 1 FROM fact_sales WHERE customer_id = c.customer_id)",
            "WITH RECURSIVE spin AS (SELECT 1 AS x UNION ALL SELECT x + 1 FROM spin WHERE x < 10) SELECT COUNT(*) FROM spin",
        ] {
            let verdict = validator().check(&candidate(sql), &retail_context());
            assert!(matches!(verdict, SafetyVerdict::Pass(_)), "{}: {:?}", sql, verdict);
        }
    }

    #[test]
    fn test_denied_words_only_count_as_statements() {
        assert!(rejected("DROP TABLE fact_sales").contains("drop"));
        for sql in [
            "SELECT COUNT(f.invoice_no) AS comment FROM fact_sales f",
            "SELECT SUM(f.quantity) AS call_count FROM fact_sales f ORDER BY call_count DESC",
        ] {
            let verdict = validator().check(&candidate(sql), &retail_context());
            assert!(matches!(verdict, SafetyVerdict::Pass(_)), "{}: {:?}", sql, verdict);
        }
    }

    #[test]
    fn test_keyword_inside_literal_is_fine() {
        let sql = "SELECT c.country FROM dim_customer c WHERE c.country <> 'drop; delete'";
        assert!(matches!(
            validator().check(&candidate(sql), &retail_context()),
            SafetyVerdict::Pass(_)
        ));
    }

    #[test]
    fn test_timeout_directive_required() {
        let mut c = candidate("SELECT f.invoice_no FROM fact_sales f");
        c.timeout_ms = None;
        assert!(matches!(validator().check(&c, &retail_context()), SafetyVerdict::Reject(ref r) if r.contains("timeout")));
        c.timeout_ms = Some(500_000);
        assert!(matches!(validator().check(&c, &retail_context()), SafetyVerdict::Reject(ref r) if r.contains("exceeds")));
    }

    #[test]
    fn test_cte_passes() {
        let sql = "WITH series AS (SELECT t0.customer_id AS k, SUM(t0.total_amount) AS revenue FROM fact_sales AS t0 GROUP BY t0.customer_id) \
                   SELECT k, revenue FROM series ORDER BY revenue DESC";
        assert!(matches!(
            validator().check(&candidate(sql), &retail_context()),
            SafetyVerdict::Pass(_)
        ));
    }
}
