//! Schema Context
//!
//! Read-only snapshot of one dataset: allow-listed tables and columns,
//! the foreign-key join graph, and semantic role candidates tagged with
//! where they came from (governed contract or bootstrap heuristic).

pub mod join_graph;
pub mod mapper;
pub mod provider;

pub use join_graph::{Cardinality, JoinGraph, JoinStep};
pub use provider::{InMemorySchemaProvider, SchemaProvider, SchemaSnapshot};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

/// Normalized column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Integer,
    Numeric,
    Text,
    Date,
    Timestamp,
    Boolean,
    Other,
}

impl DataType {
    /// Map an engine type name (postgres, sqlite or mysql spelling) to a normalized type
    pub fn from_sql_type(raw: &str) -> Self {
        let lowered = raw.trim().to_lowercase();
        if lowered.is_empty() {
            return DataType::Other;
        }
        if lowered.starts_with("bool") {
            return DataType::Boolean;
        }
        if lowered.contains("int") || lowered == "serial" || lowered == "bigserial" {
            return DataType::Integer;
        }
        if ["real", "floa", "doub", "dec", "num", "money"]
            .iter()
            .any(|tok| lowered.contains(tok))
        {
            return DataType::Numeric;
        }
        if lowered.contains("timestamp") || lowered.contains("datetime") {
            return DataType::Timestamp;
        }
        if lowered == "date" {
            return DataType::Date;
        }
        if lowered.contains("time") {
            return DataType::Timestamp;
        }
        if ["char", "text", "clob", "string", "uuid"]
            .iter()
            .any(|tok| lowered.contains(tok))
        {
            return DataType::Text;
        }
        DataType::Other
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Integer | DataType::Numeric)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, DataType::Date | DataType::Timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub is_primary_key: bool,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub row_count: Option<u64>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> Vec<&ColumnSchema> {
        self.columns.iter().filter(|c| c.is_primary_key).collect()
    }
}

/// Foreign-key edge: `from_table.from_column` references `to_table.to_column`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForeignKey {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

/// Fully qualified column reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticRole {
    Entity,
    Measure,
    Time,
}

impl fmt::Display for SemanticRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemanticRole::Entity => write!(f, "entity"),
            SemanticRole::Measure => write!(f, "measure"),
            SemanticRole::Time => write!(f, "time"),
        }
    }
}

/// Where a role mapping came from. Downstream confidence branches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleSource {
    Contract,
    Heuristic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Avg => "avg",
            Aggregation::Count => "count",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
        }
    }

    pub fn sql_function(&self) -> &'static str {
        match self {
            Aggregation::Sum => "SUM",
            Aggregation::Avg => "AVG",
            Aggregation::Count => "COUNT",
            Aggregation::Min => "MIN",
            Aggregation::Max => "MAX",
        }
    }

    /// Additive aggregations are inflated by row duplication
    pub fn is_additive(&self) -> bool {
        matches!(self, Aggregation::Sum | Aggregation::Count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGrain {
    Day,
    Week,
    Month,
    Quarter,
    Year,
    Unspecified,
}

impl TimeGrain {
    pub const ALL: [TimeGrain; 5] = [
        TimeGrain::Day,
        TimeGrain::Week,
        TimeGrain::Month,
        TimeGrain::Quarter,
        TimeGrain::Year,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeGrain::Day => "day",
            TimeGrain::Week => "week",
            TimeGrain::Month => "month",
            TimeGrain::Quarter => "quarter",
            TimeGrain::Year => "year",
            TimeGrain::Unspecified => "unspecified",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "day" | "daily" => Some(TimeGrain::Day),
            "week" | "weekly" => Some(TimeGrain::Week),
            "month" | "monthly" => Some(TimeGrain::Month),
            "quarter" | "quarterly" => Some(TimeGrain::Quarter),
            "year" | "yearly" | "annual" => Some(TimeGrain::Year),
            "unspecified" | "" => Some(TimeGrain::Unspecified),
            _ => None,
        }
    }

    pub fn is_specified(&self) -> bool {
        !matches!(self, TimeGrain::Unspecified)
    }
}

impl fmt::Display for TimeGrain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A semantic role hint for one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleCandidate {
    /// Business concept name, e.g. `revenue` or `country`
    pub concept: String,
    pub role: SemanticRole,
    pub table: String,
    pub column: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub confidence: f64,
    pub source: RoleSource,
    #[serde(default)]
    pub default_aggregation: Option<Aggregation>,
    /// Grains a time column may be bucketed at; empty means all
    #[serde(default)]
    pub supported_grains: Vec<TimeGrain>,
    #[serde(default)]
    pub default_grain: Option<TimeGrain>,
}

impl RoleCandidate {
    pub fn column_ref(&self) -> ColumnRef {
        ColumnRef::new(&self.table, &self.column)
    }

    /// All surface forms the planner may match in a question
    pub fn surface_forms(&self) -> Vec<String> {
        let mut forms = vec![self.concept.to_lowercase().replace('_', " ")];
        for alias in &self.aliases {
            let alias = alias.to_lowercase().replace('_', " ");
            if !forms.contains(&alias) {
                forms.push(alias);
            }
        }
        forms
    }

    pub fn supports_grain(&self, grain: TimeGrain) -> bool {
        grain.is_specified() && (self.supported_grains.is_empty() || self.supported_grains.contains(&grain))
    }
}

/// Governed semantic contract entries for a dataset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SemanticContract {
    #[serde(default)]
    pub entries: Vec<RoleCandidate>,
    #[serde(default)]
    pub approved_joins: Vec<ForeignKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaContext {
    pub dataset_id: String,
    pub tables: Vec<TableSchema>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub roles: Vec<RoleCandidate>,
    /// Join edges the contract approves; empty means no contract opinion
    #[serde(default)]
    pub approved_joins: Vec<ForeignKey>,
}

impl SchemaContext {
    pub fn new(dataset_id: impl Into<String>, tables: Vec<TableSchema>, foreign_keys: Vec<ForeignKey>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            tables,
            foreign_keys,
            roles: Vec::new(),
            approved_joins: Vec::new(),
        }
    }

    /// Attach bootstrap heuristic roles inferred from names and types
    pub fn with_heuristic_roles(mut self) -> Self {
        let inferred = mapper::heuristic_roles(&self.tables);
        for candidate in inferred {
            let exists = self.roles.iter().any(|r| {
                r.role == candidate.role && r.table == candidate.table && r.column == candidate.column
            });
            if !exists {
                self.roles.push(candidate);
            }
        }
        self
    }

    /// Overlay governed contract entries. A contract entry replaces any
    /// heuristic entry for the same column and role.
    pub fn with_contract(mut self, contract: SemanticContract) -> Self {
        for mut entry in contract.entries {
            entry.source = RoleSource::Contract;
            self.roles.retain(|r| !(r.role == entry.role && r.table == entry.table && r.column == entry.column));
            self.roles.push(entry);
        }
        self.approved_joins = contract.approved_joins;
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnSchema> {
        self.table(table).and_then(|t| t.column(column))
    }

    pub fn has_column(&self, column: &ColumnRef) -> bool {
        self.column(&column.table, &column.column).is_some()
    }

    pub fn table_names(&self) -> HashSet<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn candidates(&self, role: SemanticRole) -> impl Iterator<Item = &RoleCandidate> {
        self.roles.iter().filter(move |r| r.role == role)
    }

    /// The role candidate bound to a column in a given role, if any
    pub fn candidate_for(&self, role: SemanticRole, column: &ColumnRef) -> Option<&RoleCandidate> {
        self.roles
            .iter()
            .filter(|r| r.role == role && r.table == column.table && r.column == column.column)
            .max_by(|a, b| rank(a).partial_cmp(&rank(b)).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn join_graph(&self) -> JoinGraph {
        JoinGraph::from_foreign_keys(&self.foreign_keys)
    }

    /// SHA-256 over the canonical JSON form of the snapshot
    pub fn schema_hash(&self) -> String {
        let mut hasher = Sha256::new();
        match serde_json::to_vec(self) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(self.dataset_id.as_bytes()),
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Contract entries outrank heuristic ones, then confidence decides
fn rank(candidate: &RoleCandidate) -> (u8, f64) {
    let source = match candidate.source {
        RoleSource::Contract => 1,
        RoleSource::Heuristic => 0,
    };
    (source, candidate.confidence)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    fn col(name: &str, data_type: DataType, pk: bool) -> ColumnSchema {
        ColumnSchema {
            name: name.to_string(),
            data_type,
            nullable: !pk,
            is_primary_key: pk,
        }
    }

    /// Star schema used across unit tests
    pub fn retail_context() -> SchemaContext {
        let tables = vec![
            TableSchema {
                name: "fact_sales".to_string(),
                columns: vec![
                    col("invoice_no", DataType::Text, true),
                    col("customer_id", DataType::Integer, false),
                    col("product_id", DataType::Integer, false),
                    col("invoice_timestamp", DataType::Timestamp, false),
                    col("quantity", DataType::Integer, false),
                    col("total_amount", DataType::Numeric, false),
                ],
                row_count: Some(6),
            },
            TableSchema {
                name: "dim_customer".to_string(),
                columns: vec![
                    col("customer_id", DataType::Integer, true),
                    col("country", DataType::Text, false),
                ],
                row_count: Some(4),
            },
            TableSchema {
                name: "dim_product".to_string(),
                columns: vec![
                    col("product_id", DataType::Integer, true),
                    col("category", DataType::Text, false),
                    col("unit_price", DataType::Numeric, false),
                ],
                row_count: Some(3),
            },
        ];
        let fks = vec![
            ForeignKey {
                from_table: "fact_sales".to_string(),
                from_column: "customer_id".to_string(),
                to_table: "dim_customer".to_string(),
                to_column: "customer_id".to_string(),
            },
            ForeignKey {
                from_table: "fact_sales".to_string(),
                from_column: "product_id".to_string(),
                to_table: "dim_product".to_string(),
                to_column: "product_id".to_string(),
            },
        ];
        SchemaContext::new("retail", tables, fks)
            .with_heuristic_roles()
            .with_contract(retail_contract())
    }

    pub fn retail_contract() -> SemanticContract {
        SemanticContract {
            entries: vec![
                RoleCandidate {
                    concept: "country".to_string(),
                    role: SemanticRole::Entity,
                    table: "dim_customer".to_string(),
                    column: "country".to_string(),
                    aliases: vec!["countries".to_string(), "market".to_string()],
                    confidence: 0.95,
                    source: RoleSource::Contract,
                    default_aggregation: None,
                    supported_grains: Vec::new(),
                    default_grain: None,
                },
                RoleCandidate {
                    concept: "revenue".to_string(),
                    role: SemanticRole::Measure,
                    table: "fact_sales".to_string(),
                    column: "total_amount".to_string(),
                    aliases: vec!["sales".to_string(), "total amount".to_string()],
                    confidence: 0.95,
                    source: RoleSource::Contract,
                    default_aggregation: Some(Aggregation::Sum),
                    supported_grains: Vec::new(),
                    default_grain: None,
                },
                RoleCandidate {
                    concept: "invoice date".to_string(),
                    role: SemanticRole::Time,
                    table: "fact_sales".to_string(),
                    column: "invoice_timestamp".to_string(),
                    aliases: Vec::new(),
                    confidence: 0.9,
                    source: RoleSource::Contract,
                    default_aggregation: None,
                    supported_grains: vec![TimeGrain::Day, TimeGrain::Week, TimeGrain::Month, TimeGrain::Year],
                    default_grain: Some(TimeGrain::Month),
                },
            ],
            approved_joins: Vec::new(),
        }
    }
}
