use crate::audit;
use crate::column::{Column, IndexType, MISSING};
use crate::counter;
use crate::error::{ConfigError, Error, ErrorMap, Result, StoreError, ValidationFailed};
use crate::event::{self, Action};
use crate::fields::Fields;
use crate::query_builder::QueryBuilder;
use crate::store::{Collection, Database};
use crate::versioning;
use mongodb::bson::{doc, Bson, Document};
use std::collections::BTreeMap;
use std::slice;
use std::sync::Arc;

pub(crate) const NO_DATA: &str = "No data provided.";
const ALREADY_EXISTS: &str = "This document already exists.";
const MORE_THAN_ONE: &str = "More than one result: Consider another filtering.";
pub const LIMIT: &str = "limit";
pub const OFFSET: &str = "offset";

/// How records reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Records are overwritten and deleted in place.
    Plain,
    /// Every write opens a new revision, see [`crate::versioning`].
    Versioned,
}

/// Schema bound to one collection.
///
/// Built once with [`CrudModel::builder`] and shared afterwards; operations go
/// through [`CrudModel::bind`].
#[derive(Debug, Clone)]
pub struct CrudModel {
    collection_name: String,
    fields: Fields,
    persistence: Persistence,
    audit: Option<Arc<CrudModel>>,
}

#[derive(Debug)]
pub struct CrudModelBuilder {
    collection_name: String,
    columns: Vec<Column>,
    versioned: bool,
    audited: bool,
}

impl CrudModelBuilder {
    pub fn column(mut self, column: Column) -> CrudModelBuilder {
        self.columns.push(column);
        self
    }

    pub fn columns(mut self, columns: impl IntoIterator<Item = Column>) -> CrudModelBuilder {
        self.columns.extend(columns);
        self
    }

    /// Keep every revision, see [`crate::versioning`].
    pub fn versioned(mut self) -> CrudModelBuilder {
        self.versioned = true;
        self
    }

    /// Record every write in an `audit_<collection>` collection.
    pub fn audited(mut self) -> CrudModelBuilder {
        self.audited = true;
        self
    }

    pub fn build(self) -> std::result::Result<CrudModel, ConfigError> {
        if self.collection_name.is_empty() {
            return Err(ConfigError::MissingCollectionName);
        }
        let mut columns = self.columns;
        let persistence = if self.versioned {
            if columns.iter().any(|column| column.name() == "_id") {
                return Err(ConfigError::VersionedIdField(self.collection_name));
            }
            columns = versioning::with_validity(columns);
            Persistence::Versioned
        } else {
            Persistence::Plain
        };
        let mut model = CrudModel {
            collection_name: self.collection_name,
            fields: Fields::new(columns)?,
            persistence,
            audit: None,
        };
        if self.audited {
            model.audit = Some(Arc::new(audit::shadow(&model)?));
        }
        Ok(model)
    }
}

impl CrudModel {
    pub fn builder(collection_name: &str) -> CrudModelBuilder {
        CrudModelBuilder {
            collection_name: collection_name.to_string(),
            columns: vec![],
            versioned: false,
            audited: false,
        }
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    pub fn is_versioned(&self) -> bool {
        self.persistence == Persistence::Versioned
    }

    pub fn audit_model(&self) -> Option<&CrudModel> {
        self.audit.as_deref()
    }

    /// Prepares a call chain on `db`.
    pub fn bind<'a>(&'a self, db: &'a Database) -> Model<'a> {
        Model {
            schema: self,
            db,
            user: None,
        }
    }

    /// Stored document to transport form.
    pub fn serialize(&self, mut document: Document) -> Document {
        self.fields.serialize(&mut document);
        document
    }

    /// Projection of every read, hides the store generated `_id` unless it is
    /// a declared field.
    pub fn projection(&self) -> Option<Document> {
        match self.fields.get("_id") {
            Some(_) => None,
            None => Some(doc! {"_id": 0}),
        }
    }

    /// Primary key values found in `document`.
    pub fn primary_key_values(&self, document: &Document) -> Document {
        let mut keys = Document::new();
        for column in self.fields.primary_keys() {
            if let Some(value) = document.get(column.name()) {
                keys.insert(column.name(), value.clone());
            }
        }
        keys
    }

    /// Recreates the declared indexes of this model and of its audit model.
    ///
    /// This will:
    /// 1. Drop every existing index
    /// 2. Create one unique index over all unique fields
    /// 3. Create one index over all non unique fields
    pub async fn register(&self, db: &Database) -> std::result::Result<(), StoreError> {
        self.register_indexes(db).await?;
        if let Some(audit) = &self.audit {
            audit.register_indexes(db).await?;
        }
        Ok(())
    }

    async fn register_indexes(&self, db: &Database) -> std::result::Result<(), StoreError> {
        let collection = db.collection(&self.collection_name);
        if let Err(error) = collection.drop_indexes().await {
            log::warn!("Can't drop indexes of {}: {error}", self.collection_name);
        }
        self.create_indexes(&collection, IndexType::Unique).await?;
        self.create_indexes(&collection, IndexType::NonUnique).await
    }

    async fn create_indexes(
        &self,
        collection: &Collection,
        index_type: IndexType,
    ) -> std::result::Result<(), StoreError> {
        let criteria = self.fields.index_fields(index_type);
        if criteria.is_empty() {
            return Ok(());
        }
        let mut keys = Document::new();
        for path in &criteria {
            keys.insert(path.clone(), 1);
        }
        // generated names can exceed the store limit on deeply nested paths
        let (unique, name) = match index_type {
            IndexType::Unique => (true, format!("uidx{}", self.collection_name)),
            IndexType::NonUnique => (false, format!("idx{}", self.collection_name)),
        };
        log::debug!(
            "Create {name} {index_type:?} index on {} using {criteria:?} criteria.",
            self.collection_name
        );
        collection
            .create_index(keys, unique, &name)
            .await
            .inspect_err(|error| log::error!("Can't create index {name} : {error}"))
    }
}

/// A [`CrudModel`] bound to a [`Database`], optionally on behalf of a user.
#[derive(Debug, Clone)]
pub struct Model<'a> {
    schema: &'a CrudModel,
    db: &'a Database,
    user: Option<String>,
}

impl<'a> Model<'a> {
    /// Set the user recorded in audit records
    pub fn set_user(mut self, user: impl Into<String>) -> Model<'a> {
        self.user = Some(user.into());
        self
    }

    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or_default()
    }

    pub fn schema(&self) -> &'a CrudModel {
        self.schema
    }

    pub fn db(&self) -> &'a Database {
        self.db
    }

    pub fn collection(&self) -> Collection {
        self.db.collection(&self.schema.collection_name)
    }

    /// Inserts one document.
    ///
    /// # Errors
    /// - `ValidationFailed` for an empty or invalid document, or when a unique
    ///   index already holds the same values
    pub async fn add(&self, document: Document) -> Result<Document> {
        if document.is_empty() {
            return Err(ValidationFailed::message(document, NO_DATA).into());
        }
        let mut inserted = self
            .prepare_insert(&document)
            .map_err(|errors| ValidationFailed::fields(document.clone(), errors))?;
        self.increment(&mut inserted).await?;
        self.schema.fields.deserialize_insert(&mut inserted);

        let mut documents = vec![inserted];
        self.insert(&mut documents)
            .await
            .map_err(|error| conflict(error, document))?;
        event::finish(self, Action::Insert, &documents).await?;
        let inserted = documents.pop().unwrap_or_default();
        Ok(self.schema.serialize(inserted))
    }

    /// Inserts all documents or none: a single invalid document rejects the
    /// batch, errors being reported per batch position.
    pub async fn add_all(&self, documents: Vec<Document>) -> Result<Vec<Document>> {
        let received = || Bson::from(documents.clone());
        if documents.is_empty() || documents.iter().any(Document::is_empty) {
            return Err(ValidationFailed::message(received(), NO_DATA).into());
        }
        let mut errors = BTreeMap::new();
        let mut prepared = Vec::with_capacity(documents.len());
        for (position, document) in documents.iter().enumerate() {
            match self.prepare_insert(document) {
                Ok(document) => prepared.push(document),
                Err(document_errors) => {
                    errors.insert(position, document_errors);
                }
            }
        }
        if !errors.is_empty() {
            return Err(ValidationFailed::batch(received(), errors).into());
        }
        for document in &mut prepared {
            self.increment(document).await?;
            self.schema.fields.deserialize_insert(document);
        }
        self.insert(&mut prepared)
            .await
            .map_err(|error| conflict(error, received()))?;
        event::finish(self, Action::Insert, &prepared).await?;
        Ok(prepared
            .into_iter()
            .map(|inserted| self.schema.serialize(inserted))
            .collect())
    }

    /// Updates the record identified by the primary key of `document`.
    ///
    /// Returns the previous and the new version of the record.
    ///
    /// # Errors
    /// - `ModelCouldNotBeFound` when no record has this primary key
    pub async fn update(&self, document: Document) -> Result<(Document, Document)> {
        if document.is_empty() {
            return Err(ValidationFailed::message(document, NO_DATA).into());
        }
        let mut updated = document.clone();
        for column in self.schema.fields.primary_keys() {
            column.apply_default(&mut updated);
        }
        let errors = self.schema.fields.validate_update(&updated);
        if !errors.is_empty() {
            return Err(ValidationFailed::fields(document, errors).into());
        }
        self.schema.fields.deserialize_update(&mut updated);
        let keys = self.primary_key_filter(&document, &updated)?;

        let (previous, new) = match self.schema.persistence {
            Persistence::Plain => self.update_one(keys, updated).await,
            Persistence::Versioned => versioning::update_one(self, keys, updated).await,
        }
        .map_err(|error| match error {
            Error::Store(error) => conflict(error, document),
            other => other,
        })?;
        event::finish(self, Action::Update, slice::from_ref(&new)).await?;
        Ok((self.schema.serialize(previous), self.schema.serialize(new)))
    }

    /// Removes every record matching `filters`, returns how many were removed.
    pub async fn remove(&self, filters: Document) -> Result<u64> {
        let filter = self.query_filter(filters)?;
        let (removed, documents) = match self.schema.persistence {
            Persistence::Plain => {
                let collection = self.collection();
                let documents = if self.schema.audit.is_some() {
                    collection.find(self.query(filter.clone())).await?
                } else {
                    vec![]
                };
                (collection.delete_many(filter).await?, documents)
            }
            Persistence::Versioned => versioning::close(self, filter).await?,
        };
        event::finish(self, Action::Delete, &documents).await?;
        Ok(removed)
    }

    /// The only record matching `filters`, if any.
    ///
    /// # Errors
    /// - `ValidationFailed` when more than one record matches
    pub async fn get(&self, filters: Document) -> Result<Option<Document>> {
        let filter = self.query_filter(filters.clone())?;
        let found = self.collection().find(self.query(filter).limit(2)).await?;
        if found.len() > 1 {
            return Err(ValidationFailed::message(filters, MORE_THAN_ONE).into());
        }
        Ok(found
            .into_iter()
            .next()
            .map(|document| self.schema.serialize(document)))
    }

    /// Records matching `filters`; `limit` and `offset` entries paginate.
    pub async fn get_all(&self, filters: Document) -> Result<Vec<Document>> {
        let mut filters = filters;
        let received = filters.clone();
        let mut errors = ErrorMap::new();
        let limit = take_count(&mut filters, LIMIT, 1, &mut errors);
        let offset = take_count(&mut filters, OFFSET, 0, &mut errors);
        if !errors.is_empty() {
            return Err(ValidationFailed::fields(received, errors).into());
        }
        let filter = self.query_filter(filters)?;
        let query = self
            .query(filter)
            .skip(offset.unwrap_or(0).unsigned_abs())
            .limit(limit.unwrap_or(0));
        let found = self.collection().find(query).await?;
        Ok(found
            .into_iter()
            .map(|document| self.schema.serialize(document))
            .collect())
    }

    /// Audit records matching `filters`.
    pub async fn get_audit(&self, filters: Document) -> Result<Vec<Document>> {
        let Some(audit) = self.schema.audit_model() else {
            let message = format!("{} is not audited.", self.schema.collection_name);
            return Err(ValidationFailed::message(filters, message).into());
        };
        audit.bind(self.db).get_all(filters).await
    }

    /// Query over `filter` with this model's projection.
    pub(crate) fn query(&self, filter: Document) -> QueryBuilder {
        let query = QueryBuilder::new(filter);
        match self.schema.projection() {
            Some(projection) => query.select(projection),
            None => query,
        }
    }

    pub(crate) async fn find_one(
        &self,
        filter: Document,
    ) -> std::result::Result<Option<Document>, StoreError> {
        let found = self.collection().find(self.query(filter).limit(1)).await?;
        Ok(found.into_iter().next())
    }

    /// Validated filters in their storage form.
    pub(crate) fn query_filter(&self, filters: Document) -> Result<Document> {
        let errors = self.schema.fields.validate_query(&filters);
        if !errors.is_empty() {
            return Err(ValidationFailed::fields(filters, errors).into());
        }
        let mut filter = filters;
        self.schema.fields.deserialize_query(&mut filter);
        Ok(filter)
    }

    /// Assigns the next counter value to every auto incremented field.
    pub(crate) async fn increment(
        &self,
        document: &mut Document,
    ) -> std::result::Result<(), StoreError> {
        for column in self.schema.fields.auto_incremented() {
            let value = counter::increment(
                self.db,
                &self.schema.collection_name,
                column.get_counter_name(),
            )
            .await?;
            document.insert(column.name(), value);
        }
        Ok(())
    }

    fn prepare_insert(&self, document: &Document) -> std::result::Result<Document, ErrorMap> {
        let mut prepared = document.clone();
        self.schema.fields.apply_defaults(&mut prepared);
        let errors = self.schema.fields.validate_insert(&prepared);
        if errors.is_empty() {
            Ok(prepared)
        } else {
            Err(errors)
        }
    }

    async fn insert(&self, documents: &mut [Document]) -> std::result::Result<(), StoreError> {
        if self.schema.persistence == Persistence::Versioned {
            versioning::open(self.db, documents);
        }
        match documents {
            [document] => self.collection().insert_one(document).await,
            documents => self.collection().insert_many(documents).await,
        }
    }

    fn primary_key_filter(&self, received: &Document, document: &Document) -> Result<Document> {
        if self.schema.fields.primary_keys().next().is_none() {
            let message = format!("{} has no primary key.", self.schema.collection_name);
            return Err(ValidationFailed::message(received.clone(), message).into());
        }
        let mut errors = ErrorMap::new();
        for column in self.schema.fields.primary_keys() {
            if matches!(document.get(column.name()), None | Some(Bson::Null)) {
                errors.insert(column.name().to_string(), vec![MISSING.to_string()]);
            }
        }
        if !errors.is_empty() {
            return Err(ValidationFailed::fields(received.clone(), errors).into());
        }
        Ok(self.schema.primary_key_values(document))
    }

    async fn update_one(&self, keys: Document, updated: Document) -> Result<(Document, Document)> {
        let collection = self.collection();
        let not_found = || Error::ModelCouldNotBeFound {
            criteria: keys.clone(),
        };
        let previous = self
            .find_one(keys.clone())
            .await?
            .ok_or_else(not_found)?;
        let changes = changes(&keys, updated);
        if !changes.is_empty() {
            collection.update_one(keys.clone(), changes).await?;
        }
        let new = self
            .find_one(keys.clone())
            .await?
            .ok_or_else(not_found)?;
        Ok((previous, new))
    }
}

/// `$set` / `$unset` operations of an update, primary key fields excluded.
fn changes(keys: &Document, updated: Document) -> Document {
    let mut set = Document::new();
    let mut unset = Document::new();
    for (name, value) in updated {
        if keys.contains_key(&name) {
            continue;
        }
        match value {
            Bson::Null => {
                unset.insert(name, "");
            }
            value => {
                set.insert(name, value);
            }
        }
    }
    let mut changes = Document::new();
    if !set.is_empty() {
        changes.insert("$set", set);
    }
    if !unset.is_empty() {
        changes.insert("$unset", unset);
    }
    changes
}

/// Applies an update (explicit nulls remove the field) to a copy of a record.
pub(crate) fn merge(record: &mut Document, keys: &Document, updated: Document) {
    for (name, value) in updated {
        if keys.contains_key(&name) {
            continue;
        }
        match value {
            Bson::Null => {
                record.remove(&name);
            }
            value => {
                record.insert(name, value);
            }
        }
    }
}

fn conflict(error: StoreError, received: impl Into<Bson>) -> Error {
    if error.is_duplicate_key() {
        log::debug!("Duplicate key: {error}");
        ValidationFailed::message(received, ALREADY_EXISTS).into()
    } else {
        error.into()
    }
}

/// Removes a pagination entry, which must be an integer of at least `minimum`.
fn take_count(
    filters: &mut Document,
    name: &str,
    minimum: i64,
    errors: &mut ErrorMap,
) -> Option<i64> {
    let value = match filters.remove(name)? {
        Bson::Null => return None,
        Bson::Int32(value) => Some(i64::from(value)),
        Bson::Int64(value) => Some(value),
        Bson::String(value) => value.trim().parse::<i64>().ok(),
        _ => None,
    };
    match value {
        Some(value) if value >= minimum => Some(value),
        _ => {
            let expected = if minimum > 0 { "positive" } else { "natural" };
            errors.insert(name.to_string(), vec![format!("Not a valid {expected} integer.")]);
            None
        }
    }
}
