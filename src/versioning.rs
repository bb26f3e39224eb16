//! Temporal versioning of records.
//!
//! A versioned model never overwrites or removes a record. Each revision
//! carries a validity window `[valid_since_utc, valid_until_utc)`; the
//! currently valid revision has no `valid_until_utc`. Updating closes the
//! current revision and inserts the merged one, deleting closes it.
//!
//! The close and the insert are two writes. A failure in between leaves a key
//! without any current revision, [`Model::repair`] reopens the latest one.

use crate::column::{Column, Mode};
use crate::error::{Error, ErrorMap, Result, StoreError, ValidationFailed};
use crate::event::{self, Action};
use crate::model::{merge, Model, NO_DATA};
use crate::store::Database;
use mongodb::bson::{doc, Bson, DateTime, Document};

pub const VALID_SINCE: &str = "valid_since_utc";
pub const VALID_UNTIL: &str = "valid_until_utc";
/// Instant requested by a rollback.
pub const VALIDITY: &str = "validity";

/// Adds the validity columns. Primary keys join the unique index so that
/// `(key, valid_until_utc)` identifies a revision.
pub(crate) fn with_validity(columns: Vec<Column>) -> Vec<Column> {
    let mut columns: Vec<Column> = columns
        .into_iter()
        .map(|column| {
            if column.is_primary_key() {
                column.unique()
            } else {
                column
            }
        })
        .collect();
    columns.push(Column::datetime(VALID_SINCE).description("Record is valid since this date."));
    columns.push(
        Column::datetime(VALID_UNTIL)
            .description("Record is valid until this date.")
            .allow_none_as_filter()
            .unique(),
    );
    columns
}

/// Stamps documents about to be inserted as the current revision.
pub(crate) fn open(db: &Database, documents: &mut [Document]) {
    let now = db.now();
    for document in documents {
        document.insert(VALID_SINCE, now);
        document.remove(VALID_UNTIL);
    }
}

fn current(filter: &Document) -> Document {
    let mut current = filter.clone();
    current.insert(VALID_UNTIL, Bson::Null);
    current
}

/// Closes the current revision of `keys` and inserts the updated one.
pub(crate) async fn update_one(
    model: &Model<'_>,
    keys: Document,
    mut updated: Document,
) -> Result<(Document, Document)> {
    updated.remove(VALID_SINCE);
    updated.remove(VALID_UNTIL);
    let collection = model.collection();
    let previous = model
        .find_one(current(&keys))
        .await?
        .ok_or_else(|| Error::ModelCouldNotBeFound {
            criteria: keys.clone(),
        })?;

    let now = model.db().now();
    collection
        .update_one(current(&keys), doc! {"$set": {VALID_UNTIL: now}})
        .await?;
    let mut new = previous.clone();
    merge(&mut new, &keys, updated);
    new.insert(VALID_SINCE, now);
    collection.insert_one(&new).await?;
    Ok((previous, new))
}

/// Closes every current revision matching `filter`.
///
/// Returns how many were closed and the closed revisions.
pub(crate) async fn close(
    model: &Model<'_>,
    filter: Document,
) -> std::result::Result<(u64, Vec<Document>), StoreError> {
    let filter = current(&filter);
    let collection = model.collection();
    let mut documents = collection.find(model.query(filter.clone())).await?;
    let now = model.db().now();
    let closed = collection
        .update_many(filter, doc! {"$set": {VALID_UNTIL: now}})
        .await?;
    for document in &mut documents {
        document.insert(VALID_UNTIL, now);
    }
    Ok((closed, documents))
}

impl Model<'_> {
    /// Makes the revisions that were valid at `filters["validity"]` current
    /// again, for the records matching the other filters.
    ///
    /// Records unchanged since then are left alone. Returns how many
    /// records were rolled back.
    pub async fn rollback_to(&self, filters: Document) -> Result<u64> {
        self.ensure_versioned(&filters)?;
        let mut filters = filters;
        let validity = take_validity(&mut filters)?;
        let mut filter = self.query_filter(filters)?;
        filter.remove(VALID_SINCE);
        filter.remove(VALID_UNTIL);
        filter.insert(VALID_SINCE, doc! {"$lte": validity});
        filter.insert(VALID_UNTIL, doc! {"$gt": validity});

        let collection = self.collection();
        let mut revisions = collection.find(self.query(filter)).await?;
        if revisions.is_empty() {
            return Ok(0);
        }
        let now = self.db().now();
        for revision in &mut revisions {
            let keys = self.schema().primary_key_values(revision);
            collection
                .update_one(current(&keys), doc! {"$set": {VALID_UNTIL: now}})
                .await?;
            revision.insert(VALID_SINCE, now);
            revision.remove(VALID_UNTIL);
        }
        collection.insert_many(&revisions).await?;
        event::finish(self, Action::Rollback, &revisions).await?;
        Ok(revisions.len() as u64)
    }

    /// Revisions matching `filters` that were valid at `validity`.
    pub async fn get_valid_at(
        &self,
        filters: Document,
        validity: DateTime,
    ) -> Result<Vec<Document>> {
        self.ensure_versioned(&filters)?;
        let mut filter = self.query_filter(filters)?;
        filter.remove(VALID_SINCE);
        filter.remove(VALID_UNTIL);
        filter.insert(VALID_SINCE, doc! {"$lte": validity});
        filter.insert(
            "$or",
            vec![
                doc! {VALID_UNTIL: Bson::Null},
                doc! {VALID_UNTIL: {"$gt": validity}},
            ],
        );
        let found = self.collection().find(self.query(filter)).await?;
        Ok(found
            .into_iter()
            .map(|document| self.schema().serialize(document))
            .collect())
    }

    /// Reopens the latest revision of every key matching `filters` that has no
    /// current revision. Deleted records look the same, so `filters` should
    /// only target keys known to be broken and cannot be empty.
    pub async fn repair(&self, filters: Document) -> Result<u64> {
        self.ensure_versioned(&filters)?;
        if filters.is_empty() {
            return Err(ValidationFailed::message(filters, NO_DATA).into());
        }
        let filter = self.query_filter(filters)?;
        let collection = self.collection();
        let revisions = collection.find(self.query(filter)).await?;

        // latest revision per key, None once a current one is seen
        let mut latest: Vec<(Document, Option<Document>)> = vec![];
        for revision in revisions {
            let keys = self.schema().primary_key_values(&revision);
            let position = match latest.iter().position(|(known, _)| *known == keys) {
                Some(position) => position,
                None => {
                    latest.push((keys, Some(revision.clone())));
                    latest.len() - 1
                }
            };
            let entry = &mut latest[position].1;
            let Some(until) = valid_until(&revision) else {
                *entry = None;
                continue;
            };
            if let Some(best) = entry {
                if valid_until(best).is_some_and(|best| best < until) {
                    *best = revision;
                }
            }
        }

        let mut reopened = vec![];
        for (keys, revision) in latest {
            let Some(mut revision) = revision else {
                continue;
            };
            let Some(until) = valid_until(&revision) else {
                continue;
            };
            let mut filter = keys;
            filter.insert(VALID_UNTIL, until);
            collection
                .update_one(filter, doc! {"$unset": {VALID_UNTIL: ""}})
                .await?;
            revision.remove(VALID_UNTIL);
            log::warn!(
                "Reopened revision of {} valid since {:?}.",
                self.schema().collection_name(),
                revision.get(VALID_SINCE)
            );
            reopened.push(revision);
        }
        if !reopened.is_empty() {
            event::finish(self, Action::Rollback, &reopened).await?;
        }
        Ok(reopened.len() as u64)
    }

    fn ensure_versioned(&self, filters: &Document) -> Result<()> {
        if self.schema().is_versioned() {
            return Ok(());
        }
        let message = format!("{} is not versioned.", self.schema().collection_name());
        Err(ValidationFailed::message(filters.clone(), message).into())
    }
}

fn valid_until(document: &Document) -> Option<DateTime> {
    document.get_datetime(VALID_UNTIL).ok().copied()
}

/// Removes the mandatory `validity` entry from `filters`.
fn take_validity(filters: &mut Document) -> Result<DateTime> {
    let received = filters.clone();
    let column = Column::datetime(VALIDITY).not_nullable();
    let mut validity = Document::new();
    if let Some(value) = filters.remove(VALIDITY) {
        validity.insert(VALIDITY, value);
    }
    let errors: ErrorMap = column.validate(&validity, Mode::Insert);
    if !errors.is_empty() {
        return Err(ValidationFailed::fields(received, errors).into());
    }
    column.deserialize(&mut validity, Mode::Insert);
    match validity.get(VALIDITY) {
        Some(Bson::DateTime(validity)) => Ok(*validity),
        _ => Err(ValidationFailed::fields(
            received,
            ErrorMap::from([(VALIDITY.to_string(), vec!["Not a valid datetime.".to_string()])]),
        )
        .into()),
    }
}
