#![allow(dead_code)]

use oxide_tables::prelude::*;

pub async fn memory_db() -> Database {
    Database::open("sqlite::memory:")
        .await
        .expect("Failed to open in-memory database")
}

pub fn schema(json: &str) -> Schema {
    DatabaseConfig::from_json(json)
        .and_then(DatabaseConfig::into_schema)
        .unwrap_or_else(|e| panic!("Invalid schema: {e}\n{json}"))
}

/// Values of `field` across `records`, sorted.
pub fn values(records: &[Record], field: &str) -> Vec<String> {
    let mut values: Vec<String> = records
        .iter()
        .map(|r| r.get(field).cloned().unwrap_or_default())
        .collect();
    values.sort();
    values
}
