//! MongoDB CRUD models
//!
//! Declares document schemas once and derives from them validation, storage
//! conversion and index management, with support for:
//! - Nested documents and lists
//! - Auto incremented fields
//! - Versioned records with rollback
//! - Audit trails
//! - Query parsers for a REST layer
//!
//! ```no_run
//! use mongodb_crud::{load, Column, CrudModel};
//! use mongodb::bson::doc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let model = CrudModel::builder("user")
//!     .column(Column::string("name").primary_key())
//!     .column(Column::int("age"))
//!     .audited()
//!     .build()?;
//! let db = load("mongodb://localhost:27017/test", &[&model]).await?;
//! model.bind(&db).set_user("admin").add(doc! {"name": "smko", "age": 30}).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod audit;
pub mod column;
pub mod counter;
pub mod error;
pub mod event;
pub mod fields;
pub mod memory;
pub mod model;
pub mod query_builder;
pub mod store;
pub mod versioning;

pub use column::{Choices, Column, DefaultValue, DictShape, EnumKind, FieldKind, IndexType};
pub use error::{
    ConfigError, Error, ErrorMap, Failure, LoadError, Result, StoreError, ValidationFailed,
};
pub use event::Action;
pub use fields::Fields;
pub use model::{CrudModel, CrudModelBuilder, Model, Persistence};
pub use store::{Collection, Database};

use mongodb::bson::{doc, DateTime, Document};
use serde::Serialize;

/// Connects to `database_connection_url` and registers every model (and its
/// audit model) on it.
///
/// # Errors
/// - `NoDatabaseProvided` for an empty URL
/// - `NoRelatedModels` when no model is given
pub async fn load(
    database_connection_url: &str,
    models: &[&CrudModel],
) -> std::result::Result<Database, LoadError> {
    if database_connection_url.is_empty() {
        return Err(LoadError::NoDatabaseProvided);
    }
    if models.is_empty() {
        return Err(LoadError::NoRelatedModels);
    }
    log::info!("Connecting to {database_connection_url}...");
    let db = Database::connect(database_connection_url).await?;
    log::debug!("Creating models...");
    for model in models {
        model.register(&db).await?;
    }
    Ok(db)
}

/// Removes every document and counter of every collection.
///
/// Collections are dropped too unless `keep_indexes` is set.
pub async fn reset(db: &Database, keep_indexes: bool) -> std::result::Result<(), StoreError> {
    for name in db.collection_names().await? {
        if name == counter::COUNTERS {
            continue;
        }
        log::info!("Resetting all data related to \"{name}\" collection...");
        let collection = db.collection(&name);
        let removed = collection.delete_many(doc! {}).await?;
        log::info!("{removed} records deleted.");
        if !keep_indexes {
            log::info!("Drop collection \"{name}\".");
            collection.drop().await?;
        }
        let removed = counter::reset(db, &name).await?;
        log::info!("{removed} counter records deleted");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Pass,
    Fail,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Pass => "pass",
            HealthStatus::Fail => "fail",
        }
    }
}

/// Pings the store, details are keyed by `<backend>:ping`.
pub async fn check(db: &Database) -> (HealthStatus, Document) {
    let key = format!("{}:ping", db.backend_name());
    let time = column::format_datetime(DateTime::now());
    let (status, mut details) = match db.ping().await {
        Ok(observed) => (HealthStatus::Pass, doc! {"observedValue": observed}),
        Err(error) => {
            log::error!("Unable to ping {}: {error}", db.name());
            (HealthStatus::Fail, doc! {"output": error.to_string()})
        }
    };
    details.insert("componentType", "datastore");
    details.insert("status", status.as_str());
    details.insert("time", time);
    (status, doc! {key: details})
}
