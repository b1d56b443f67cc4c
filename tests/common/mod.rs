#![allow(dead_code)]

use rusqlite::Connection;
use spyne_analyst::{
    AgentConfig, AnalysisAgent, InMemorySchemaProvider, SchemaContext, SemanticContract, SqliteBackend,
};
use std::sync::Arc;

pub const DATASET: &str = "retail";

/// UK revenue: 5000000.25 + 2308391.304
pub const UK_REVENUE: f64 = 7308391.554;

/// Retail star schema: one fact table, two dimensions
pub fn retail_connection() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE dim_customer (
             customer_id INTEGER PRIMARY KEY,
             country TEXT
         );
         CREATE TABLE dim_product (
             product_id INTEGER PRIMARY KEY,
             category TEXT,
             unit_price REAL
         );
         CREATE TABLE fact_sales (
             invoice_no TEXT PRIMARY KEY,
             customer_id INTEGER REFERENCES dim_customer(customer_id),
             product_id INTEGER REFERENCES dim_product(product_id),
             invoice_timestamp TIMESTAMP,
             quantity INTEGER,
             total_amount REAL
         );
         INSERT INTO dim_customer VALUES
             (1, 'United Kingdom'), (2, 'France'), (3, 'Germany'), (4, 'Spain');
         INSERT INTO dim_product VALUES
             (1, 'Home', 2.5), (2, 'Garden', 4.0), (3, 'Toys', 1.25);
         INSERT INTO fact_sales VALUES
             ('A1', 1, 1, '2011-01-04 10:00:00', 10, 5000000.25),
             ('A2', 1, 2, '2011-02-10 12:30:00', 4, 2308391.304),
             ('A3', 2, 1, '2011-01-15 09:15:00', 6, 1200.5),
             ('A4', 3, 3, '2011-02-20 16:45:00', 8, 980.0),
             ('A5', 4, 2, '2011-03-02 11:00:00', 2, 450.75),
             ('A6', 2, 3, '2011-03-09 14:20:00', 3, 300.0);",
    )
    .unwrap();
    conn
}

/// Governed roles for the retail fixture, in the JSON shape the CLI reads
pub fn retail_contract() -> SemanticContract {
    serde_json::from_value(serde_json::json!({
        "entries": [
            {
                "concept": "country",
                "role": "entity",
                "table": "dim_customer",
                "column": "country",
                "aliases": ["countries", "market"],
                "confidence": 0.95,
                "source": "contract"
            },
            {
                "concept": "revenue",
                "role": "measure",
                "table": "fact_sales",
                "column": "total_amount",
                "aliases": ["sales", "total amount"],
                "confidence": 0.95,
                "source": "contract",
                "default_aggregation": "sum"
            },
            {
                "concept": "invoice date",
                "role": "time",
                "table": "fact_sales",
                "column": "invoice_timestamp",
                "confidence": 0.9,
                "source": "contract",
                "supported_grains": ["day", "week", "month", "year"],
                "default_grain": "month"
            }
        ],
        "approved_joins": []
    }))
    .unwrap()
}

pub fn retail_backend() -> Arc<SqliteBackend> {
    Arc::new(SqliteBackend::from_connection(retail_connection()))
}

pub fn retail_context(backend: &SqliteBackend) -> SchemaContext {
    backend
        .introspect(DATASET)
        .unwrap()
        .with_heuristic_roles()
        .with_contract(retail_contract())
}

pub fn retail_schemas(backend: &SqliteBackend) -> Arc<InMemorySchemaProvider> {
    let schemas = Arc::new(InMemorySchemaProvider::new());
    schemas.publish(retail_context(backend)).unwrap();
    schemas
}

/// Agent over the fixture with default config and the deterministic pipeline
pub fn retail_agent() -> AnalysisAgent {
    let backend = retail_backend();
    AnalysisAgent::builder(AgentConfig::default(), retail_schemas(&backend), backend)
        .build()
        .unwrap()
}
