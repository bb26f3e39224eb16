//! Atomic sequences backing auto-incremented fields.
//!
//! One counter document per category (`_id` is the category, usually the
//! collection name), one sub-document per counter name:
//! `{"_id": "test", "key": {"counter": 3, "timestamp": "2018-10-11T15:05:05"}}`.

use crate::column::format_datetime;
use crate::error::StoreError;
use crate::store::Database;
use mongodb::bson::{doc, Bson};

pub const COUNTERS: &str = "counters";

/// Next value of `(category, name)`. Relies on a single find-and-modify with
/// upsert so concurrent callers never observe the same value.
pub async fn increment(db: &Database, category: &str, name: &str) -> Result<i64, StoreError> {
    let counter_key = format!("{name}.counter");
    let timestamp_key = format!("{name}.timestamp");
    let update = doc! {
        "$inc": {counter_key: 1_i64},
        "$set": {timestamp_key: format_datetime(db.now())},
    };
    let counter = db
        .collection(COUNTERS)
        .find_one_and_update(doc! {"_id": category}, update, true)
        .await?;
    let value = counter
        .as_ref()
        .and_then(|counter| counter.get_document(name).ok())
        .and_then(|counter| counter.get("counter"));
    match value {
        Some(Bson::Int64(value)) => Ok(*value),
        Some(Bson::Int32(value)) => Ok(i64::from(*value)),
        _ => Err(StoreError::Invalid(format!(
            "counter {name} of {category} could not be incremented"
        ))),
    }
}

/// Forgets every counter of a category.
pub async fn reset(db: &Database, category: &str) -> Result<u64, StoreError> {
    db.collection(COUNTERS)
        .delete_many(doc! {"_id": category})
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_are_independent_per_category_and_name() {
        let db = Database::in_memory("test");
        assert_eq!(increment(&db, "test", "key").await.unwrap(), 1);
        assert_eq!(increment(&db, "test", "key").await.unwrap(), 2);
        assert_eq!(increment(&db, "test", "other").await.unwrap(), 1);
        assert_eq!(increment(&db, "audit_test", "key").await.unwrap(), 1);
        assert_eq!(reset(&db, "test").await.unwrap(), 1);
        assert_eq!(increment(&db, "test", "key").await.unwrap(), 1);
    }
}
