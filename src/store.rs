use crate::error::StoreError;
use crate::memory::{MemoryCollection, MemoryDatabase};
use crate::query_builder::QueryBuilder;
use futures_util::StreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Bson, DateTime, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, IndexModel};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// URL prefix selecting the in-memory backend.
pub const MOCK_SCHEME: &str = "mongomock";

#[derive(Debug, Clone)]
enum Backend {
    Mongo(mongodb::Database),
    Memory(MemoryDatabase),
}

/// Store connection handed to every model operation.
#[derive(Debug, Clone)]
pub struct Database {
    backend: Backend,
    clock: Arc<AtomicI64>,
}

impl Database {
    /// Connects to `mongodb://host/name` (any URL the driver accepts) or to a
    /// fresh in-memory store for `mongomock` / `mongomock://name`.
    pub async fn connect(database_connection_url: &str) -> Result<Database, StoreError> {
        if let Some(rest) = database_connection_url.strip_prefix(MOCK_SCHEME) {
            let name = rest.trim_start_matches("://").trim_matches('/');
            return Ok(Database::in_memory(if name.is_empty() { "test" } else { name }));
        }
        let options = ClientOptions::parse(database_connection_url).await?;
        let name = options
            .default_database
            .clone()
            .unwrap_or_else(|| basename(database_connection_url));
        let client = Client::with_options(options)?;
        Ok(Database::mongo(client.database(&name)))
    }

    pub fn mongo(db: mongodb::Database) -> Database {
        Database::with_backend(Backend::Mongo(db))
    }

    pub fn in_memory(name: &str) -> Database {
        Database::with_backend(Backend::Memory(MemoryDatabase::new(name)))
    }

    fn with_backend(backend: Backend) -> Database {
        Database {
            backend,
            clock: Arc::default(),
        }
    }

    pub fn name(&self) -> &str {
        match &self.backend {
            Backend::Mongo(db) => db.name(),
            Backend::Memory(db) => db.name(),
        }
    }

    /// Name reported by health checks.
    pub fn backend_name(&self) -> &'static str {
        match &self.backend {
            Backend::Mongo(_) => "mongo",
            Backend::Memory(_) => MOCK_SCHEME,
        }
    }

    pub fn collection(&self, name: &str) -> Collection {
        match &self.backend {
            Backend::Mongo(db) => Collection::Mongo(db.collection::<Document>(name)),
            Backend::Memory(db) => Collection::Memory(db.collection(name)),
        }
    }

    pub async fn collection_names(&self) -> Result<Vec<String>, StoreError> {
        match &self.backend {
            Backend::Mongo(db) => Ok(db.list_collection_names().await?),
            Backend::Memory(db) => Ok(db.collection_names().await),
        }
    }

    pub async fn ping(&self) -> Result<Document, StoreError> {
        match &self.backend {
            Backend::Mongo(db) => Ok(db.run_command(doc! {"ping": 1}).await?),
            Backend::Memory(_) => Ok(doc! {"ok": 1.0}),
        }
    }

    /// Current UTC instant, strictly increasing for this connection so that two
    /// revisions written back to back never share a validity bound.
    pub fn now(&self) -> DateTime {
        let now = DateTime::now().timestamp_millis();
        let previous = self
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        DateTime::from_millis(now.max(previous + 1))
    }
}

/// Position of the first rejected document of an ordered `insert_many`.
fn first_failed_write(error: &mongodb::error::Error) -> Option<usize> {
    match error.kind.as_ref() {
        ErrorKind::InsertMany(failure) => failure
            .write_errors
            .as_ref()?
            .iter()
            .map(|write_error| write_error.index)
            .min(),
        _ => None,
    }
}

fn basename(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Handle on one collection of a [`Database`].
#[derive(Debug, Clone)]
pub enum Collection {
    Mongo(mongodb::Collection<Document>),
    Memory(MemoryCollection),
}

impl Collection {
    pub fn name(&self) -> &str {
        match self {
            Collection::Mongo(collection) => collection.name(),
            Collection::Memory(collection) => collection.name(),
        }
    }

    pub async fn insert_one(&self, document: &Document) -> Result<(), StoreError> {
        match self {
            Collection::Mongo(collection) => {
                collection.insert_one(document).await?;
                Ok(())
            }
            Collection::Memory(collection) => collection.insert_one(document).await,
        }
    }

    pub async fn insert_many(&self, documents: &[Document]) -> Result<(), StoreError> {
        if documents.is_empty() {
            return Ok(());
        }
        match self {
            Collection::Mongo(collection) => {
                // ordered inserts keep what precedes a failure, ids allow undoing it
                let documents: Vec<Document> = documents
                    .iter()
                    .map(|document| {
                        let mut document = document.clone();
                        if !document.contains_key("_id") {
                            document.insert("_id", ObjectId::new());
                        }
                        document
                    })
                    .collect();
                let Err(error) = collection.insert_many(&documents).await else {
                    return Ok(());
                };
                let inserted = first_failed_write(&error).unwrap_or(0);
                let error = StoreError::from(error);
                if error.is_duplicate_key() && inserted > 0 {
                    let ids: Vec<Bson> = documents[..inserted]
                        .iter()
                        .filter_map(|document| document.get("_id").cloned())
                        .collect();
                    let undone = collection
                        .delete_many(doc! {"_id": {"$in": ids}})
                        .await?
                        .deleted_count;
                    log::debug!("Undid {undone} documents of a rejected batch.");
                }
                Err(error)
            }
            Collection::Memory(collection) => collection.insert_many(documents).await,
        }
    }

    pub async fn find(&self, query: QueryBuilder) -> Result<Vec<Document>, StoreError> {
        match self {
            Collection::Mongo(collection) => {
                let mut find = collection.find(query.filter());
                if query.skip > 0 {
                    find = find.skip(query.skip);
                }
                if query.limit > 0 {
                    find = find.limit(query.limit);
                }
                if let Some(select) = query.select {
                    find = find.projection(select);
                }
                let mut cursor = find.await?;
                let mut found = vec![];
                while let Some(document) = cursor.next().await {
                    found.push(document?);
                }
                Ok(found)
            }
            Collection::Memory(collection) => collection.find(&query).await,
        }
    }

    /// Applies `update` to the first match (creating it when `upsert`) and
    /// returns the document as it is after the update.
    pub async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<Option<Document>, StoreError> {
        match self {
            Collection::Mongo(collection) => Ok(collection
                .find_one_and_update(filter, update)
                .upsert(upsert)
                .return_document(ReturnDocument::After)
                .await?),
            Collection::Memory(collection) => {
                collection
                    .find_one_and_update(&filter, &update, upsert)
                    .await
            }
        }
    }

    /// Returns the number of matched documents.
    pub async fn update_one(&self, filter: Document, update: Document) -> Result<u64, StoreError> {
        match self {
            Collection::Mongo(collection) => {
                Ok(collection.update_one(filter, update).await?.matched_count)
            }
            Collection::Memory(collection) => collection.update_one(&filter, &update).await,
        }
    }

    /// Returns the number of matched documents.
    pub async fn update_many(
        &self,
        filter: Document,
        update: Document,
    ) -> Result<u64, StoreError> {
        match self {
            Collection::Mongo(collection) => {
                Ok(collection.update_many(filter, update).await?.matched_count)
            }
            Collection::Memory(collection) => collection.update_many(&filter, &update).await,
        }
    }

    pub async fn delete_many(&self, filter: Document) -> Result<u64, StoreError> {
        match self {
            Collection::Mongo(collection) => {
                Ok(collection.delete_many(filter).await?.deleted_count)
            }
            Collection::Memory(collection) => collection.delete_many(&filter).await,
        }
    }

    /// Drops every index but the one on `_id`.
    pub async fn drop_indexes(&self) -> Result<(), StoreError> {
        match self {
            Collection::Mongo(collection) => Ok(collection.drop_indexes().await?),
            Collection::Memory(collection) => collection.drop_indexes().await,
        }
    }

    pub async fn create_index(
        &self,
        keys: Document,
        unique: bool,
        name: &str,
    ) -> Result<(), StoreError> {
        match self {
            Collection::Mongo(collection) => {
                let opts = IndexOptions::builder()
                    .unique(unique)
                    .name(name.to_string())
                    .build();
                let index = IndexModel::builder().keys(keys).options(opts).build();
                collection.create_index(index).await?;
                Ok(())
            }
            Collection::Memory(collection) => collection.create_index(&keys, unique, name).await,
        }
    }

    pub async fn index_names(&self) -> Result<Vec<String>, StoreError> {
        match self {
            Collection::Mongo(collection) => Ok(collection.list_index_names().await?),
            Collection::Memory(collection) => Ok(collection.index_names().await),
        }
    }

    pub async fn drop(&self) -> Result<(), StoreError> {
        match self {
            Collection::Mongo(collection) => Ok(collection.drop().await?),
            Collection::Memory(collection) => collection.drop().await,
        }
    }
}
