//! Schema bootstrap
//!
//! One-shot, idempotent database preparation: ensure the database and every
//! model's table exist, then create the declared secondary indexes. Indexes
//! named in the rebuild set are dropped and recreated, which is how an
//! operator ships a changed index definition.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::db::Database;
use crate::error::Result;
use crate::schema::Schema;

/// Prepare tables and indexes for every model in the schema.
///
/// `indexes_to_build` names indexes to drop and recreate even when they
/// already exist. Safe to run repeatedly.
pub async fn init(
    db: &dyn Database,
    schema: &Schema,
    indexes_to_build: &HashSet<String>,
) -> Result<()> {
    db.ensure_database().await?;

    let existing_tables = db.table_list().await?;
    for (model, model_schema) in schema.models() {
        if !existing_tables.iter().any(|t| t == model) {
            info!(table = %model, "creating table");
            db.table_create(model).await?;
        }

        let existing_indexes = db.index_list(model).await?;
        for index in &model_schema.indexes {
            let exists = existing_indexes.iter().any(|n| n == &index.name);
            let rebuild = indexes_to_build.contains(&index.name);
            if exists && rebuild {
                info!(table = %model, index = %index.name, "rebuilding index");
                db.index_drop(model, &index.name).await?;
                db.index_create(model, index).await?;
            } else if !exists {
                debug!(table = %model, index = %index.name, "creating index");
                db.index_create(model, index).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use crate::schema::constraint::string;
    use crate::schema::{IndexSpec, ModelSchema};

    fn schema() -> Schema {
        Schema::builder()
            .model(
                "Item",
                ModelSchema::new()
                    .field("id", string())
                    .field("owner", string())
                    .index(IndexSpec::simple("owner"))
                    .index(IndexSpec::compound(
                        "ownerKind",
                        vec!["owner".to_string(), "kind".to_string()],
                    )),
            )
            .model("User", ModelSchema::new().field("id", string()))
            .build()
    }

    #[tokio::test]
    async fn test_init_creates_tables_and_indexes() {
        let db = MemoryDatabase::new();
        init(&db, &schema(), &HashSet::new()).await.unwrap();

        let mut tables = db.table_list().await.unwrap();
        tables.sort();
        assert_eq!(tables, vec!["Item", "User"]);
        let indexes = db.index_list("Item").await.unwrap();
        assert_eq!(indexes, vec!["owner", "ownerKind"]);
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let db = MemoryDatabase::new();
        let schema = schema();
        init(&db, &schema, &HashSet::new()).await.unwrap();
        init(&db, &schema, &HashSet::new()).await.unwrap();
        assert_eq!(db.index_list("Item").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_init_rebuilds_named_indexes() {
        let db = MemoryDatabase::new();
        let schema = schema();
        init(&db, &schema, &HashSet::new()).await.unwrap();

        let rebuild: HashSet<String> = ["owner".to_string()].into_iter().collect();
        init(&db, &schema, &rebuild).await.unwrap();
        let indexes = db.index_list("Item").await.unwrap();
        assert!(indexes.iter().any(|n| n == "owner"), "index recreated");
        assert_eq!(indexes.len(), 2);
    }
}
