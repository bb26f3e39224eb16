//! In-memory document store used through `mongomock` connection URLs.
//!
//! It follows the conventional document-store semantics for the subset this
//! crate issues: equality (with array containment and null matching missing),
//! `$in`, `$all`, `$ne`, `$exists`, `$lt`, `$lte`, `$gt`, `$gte`, `$and`, `$or`
//! filters, `$set`, `$unset`, `$inc` updates and unique compound indexes.

use crate::error::StoreError;
use crate::query_builder::QueryBuilder;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{Bson, Document};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct MemoryIndex {
    name: String,
    keys: Vec<String>,
    unique: bool,
}

#[derive(Debug, Default)]
struct CollectionData {
    documents: Vec<Document>,
    indexes: Vec<MemoryIndex>,
}

#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    name: String,
    collections: Arc<Mutex<BTreeMap<String, CollectionData>>>,
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> MemoryDatabase {
        MemoryDatabase {
            name: name.into(),
            collections: Arc::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self, name: &str) -> MemoryCollection {
        MemoryCollection {
            name: name.to_string(),
            db: self.clone(),
        }
    }

    pub async fn collection_names(&self) -> Vec<String> {
        self.collections.lock().await.keys().cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct MemoryCollection {
    name: String,
    db: MemoryDatabase,
}

impl MemoryCollection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn insert_one(&self, document: &Document) -> Result<(), StoreError> {
        let mut collections = self.db.collections.lock().await;
        let data = collections.entry(self.name.clone()).or_default();
        let document = with_id(document);
        check_unique(data, &document, None)?;
        data.documents.push(document);
        Ok(())
    }

    /// Inserts every document or none of them.
    pub async fn insert_many(&self, documents: &[Document]) -> Result<(), StoreError> {
        let mut collections = self.db.collections.lock().await;
        let data = collections.entry(self.name.clone()).or_default();
        let before = data.documents.len();
        for document in documents {
            let document = with_id(document);
            if let Err(error) = check_unique(data, &document, None) {
                data.documents.truncate(before);
                return Err(error);
            }
            data.documents.push(document);
        }
        Ok(())
    }

    pub async fn find(&self, query: &QueryBuilder) -> Result<Vec<Document>, StoreError> {
        let collections = self.db.collections.lock().await;
        let Some(data) = collections.get(&self.name) else {
            return Ok(vec![]);
        };
        let filter = query.filter();
        let mut found = vec![];
        for document in &data.documents {
            if matches(document, &filter)? {
                found.push(document);
            }
        }
        let limit = usize::try_from(query.limit)
            .ok()
            .filter(|limit| *limit > 0)
            .unwrap_or(usize::MAX);
        let skip = usize::try_from(query.skip).unwrap_or(usize::MAX);
        Ok(found
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|document| project(document, query.select.as_ref()))
            .collect())
    }

    pub async fn find_one_and_update(
        &self,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<Option<Document>, StoreError> {
        let mut collections = self.db.collections.lock().await;
        let data = collections.entry(self.name.clone()).or_default();
        let mut position = None;
        for (index, document) in data.documents.iter().enumerate() {
            if matches(document, filter)? {
                position = Some(index);
                break;
            }
        }
        match position {
            Some(index) => {
                let mut updated = data.documents[index].clone();
                apply_update(&mut updated, update)?;
                check_unique(data, &updated, Some(index))?;
                data.documents[index] = updated.clone();
                Ok(Some(updated))
            }
            None if upsert => {
                let mut created = equality_fields(filter);
                apply_update(&mut created, update)?;
                let created = with_id(&created);
                check_unique(data, &created, None)?;
                data.documents.push(created.clone());
                Ok(Some(created))
            }
            None => Ok(None),
        }
    }

    /// Returns the number of matched documents.
    pub async fn update_one(
        &self,
        filter: &Document,
        update: &Document,
    ) -> Result<u64, StoreError> {
        self.update(filter, update, false).await
    }

    /// Returns the number of matched documents.
    pub async fn update_many(
        &self,
        filter: &Document,
        update: &Document,
    ) -> Result<u64, StoreError> {
        self.update(filter, update, true).await
    }

    async fn update(
        &self,
        filter: &Document,
        update: &Document,
        many: bool,
    ) -> Result<u64, StoreError> {
        let mut collections = self.db.collections.lock().await;
        let Some(data) = collections.get_mut(&self.name) else {
            return Ok(0);
        };
        let mut matched = 0;
        for index in 0..data.documents.len() {
            if !matches(&data.documents[index], filter)? {
                continue;
            }
            let mut updated = data.documents[index].clone();
            apply_update(&mut updated, update)?;
            check_unique(data, &updated, Some(index))?;
            data.documents[index] = updated;
            matched += 1;
            if !many {
                break;
            }
        }
        Ok(matched)
    }

    pub async fn delete_many(&self, filter: &Document) -> Result<u64, StoreError> {
        let mut collections = self.db.collections.lock().await;
        let Some(data) = collections.get_mut(&self.name) else {
            return Ok(0);
        };
        let mut doomed = Vec::with_capacity(data.documents.len());
        for document in &data.documents {
            doomed.push(matches(document, filter)?);
        }
        let deleted = doomed.iter().filter(|doomed| **doomed).count() as u64;
        let mut doomed = doomed.into_iter();
        data.documents.retain(|_| !doomed.next().unwrap_or(false));
        Ok(deleted)
    }

    pub async fn create_index(
        &self,
        keys: &Document,
        unique: bool,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut collections = self.db.collections.lock().await;
        let data = collections.entry(self.name.clone()).or_default();
        let index = MemoryIndex {
            name: name.to_string(),
            keys: keys.keys().cloned().collect(),
            unique,
        };
        if unique {
            for (position, document) in data.documents.iter().enumerate() {
                let key = index_key(&index, document);
                let clash = data.documents[position + 1..]
                    .iter()
                    .any(|other| same_key(&key, &index_key(&index, other)));
                if clash {
                    return Err(StoreError::DuplicateKey(format!(
                        "index {name} cannot be built on {}",
                        self.name
                    )));
                }
            }
        }
        data.indexes.retain(|existing| existing.name != index.name);
        data.indexes.push(index);
        Ok(())
    }

    pub async fn drop_indexes(&self) -> Result<(), StoreError> {
        let mut collections = self.db.collections.lock().await;
        if let Some(data) = collections.get_mut(&self.name) {
            data.indexes.clear();
        }
        Ok(())
    }

    pub async fn index_names(&self) -> Vec<String> {
        let collections = self.db.collections.lock().await;
        collections
            .get(&self.name)
            .map(|data| data.indexes.iter().map(|index| index.name.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn drop(&self) -> Result<(), StoreError> {
        self.db.collections.lock().await.remove(&self.name);
        Ok(())
    }
}

fn with_id(document: &Document) -> Document {
    if document.contains_key("_id") {
        return document.clone();
    }
    let mut stored = Document::new();
    stored.insert("_id", ObjectId::new());
    stored.extend(document.clone());
    stored
}

fn index_key(index: &MemoryIndex, document: &Document) -> Vec<Bson> {
    index
        .keys
        .iter()
        .map(|key| lookup(document, key).cloned().unwrap_or(Bson::Null))
        .collect()
}

fn same_key(left: &[Bson], right: &[Bson]) -> bool {
    left.len() == right.len() && left.iter().zip(right).all(|(l, r)| bson_eq(l, r))
}

fn check_unique(
    data: &CollectionData,
    document: &Document,
    skip: Option<usize>,
) -> Result<(), StoreError> {
    for index in data.indexes.iter().filter(|index| index.unique) {
        let key = index_key(index, document);
        let clash = data
            .documents
            .iter()
            .enumerate()
            .filter(|(position, _)| Some(*position) != skip)
            .any(|(_, other)| same_key(&key, &index_key(index, other)));
        if clash {
            return Err(StoreError::DuplicateKey(format!(
                "index {} dup key {key:?}",
                index.name
            )));
        }
    }
    Ok(())
}

fn project(document: &Document, projection: Option<&Document>) -> Document {
    let mut projected = document.clone();
    if let Some(projection) = projection {
        for (key, include) in projection {
            let excluded = match include {
                Bson::Int32(value) => *value == 0,
                Bson::Int64(value) => *value == 0,
                Bson::Boolean(value) => !value,
                _ => false,
            };
            if excluded {
                projected.remove(key);
            }
        }
    }
    projected
}

/// Values of a dotted path, `None` when any segment is missing.
pub(crate) fn lookup<'d>(document: &'d Document, path: &str) -> Option<&'d Bson> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = current.as_document()?.get(segment)?;
    }
    Some(current)
}

fn set_path(document: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(document.get(head), Some(Bson::Document(_))) {
                document.insert(head, Document::new());
            }
            if let Some(Bson::Document(child)) = document.get_mut(head) {
                set_path(child, rest, value);
            }
        }
    }
}

fn remove_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            document.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(child)) = document.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

/// Fields of a filter that an upsert copies into the created document.
fn equality_fields(filter: &Document) -> Document {
    let mut created = Document::new();
    for (key, value) in filter {
        if key.starts_with('$') || is_operator_document(value) {
            continue;
        }
        set_path(&mut created, key, value.clone());
    }
    created
}

fn apply_update(document: &mut Document, update: &Document) -> Result<(), StoreError> {
    for (operator, fields) in update {
        let fields = fields.as_document().ok_or_else(|| {
            StoreError::Invalid(format!("{operator} expects a document of fields"))
        })?;
        match operator.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(document, path, value.clone());
                }
            }
            "$unset" => {
                for (path, _) in fields {
                    remove_path(document, path);
                }
            }
            "$inc" => {
                for (path, increment) in fields {
                    let incremented = match (lookup(document, path), increment) {
                        (None | Some(Bson::Null), increment) => increment.clone(),
                        (Some(Bson::Int32(current)), Bson::Int32(by)) => {
                            Bson::Int32(current + by)
                        }
                        (Some(current), by) => match (as_i64(current), as_i64(by)) {
                            (Some(current), Some(by)) => Bson::Int64(current + by),
                            _ => match (as_f64(current), as_f64(by)) {
                                (Some(current), Some(by)) => Bson::Double(current + by),
                                _ => {
                                    return Err(StoreError::Invalid(format!(
                                        "cannot increment non numeric field {path}"
                                    )))
                                }
                            },
                        },
                    };
                    set_path(document, path, incremented);
                }
            }
            other => return Err(StoreError::UnsupportedOperator(other.to_string())),
        }
    }
    Ok(())
}

fn is_operator_document(value: &Bson) -> bool {
    matches!(value, Bson::Document(d) if d.keys().next().is_some_and(|k| k.starts_with('$')))
}

pub(crate) fn matches(document: &Document, filter: &Document) -> Result<bool, StoreError> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(key, condition)? {
                    all &= matches(document, clause)?;
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(key, condition)? {
                    any |= matches(document, clause)?;
                }
                any
            }
            operator if operator.starts_with('$') => {
                return Err(StoreError::UnsupportedOperator(operator.to_string()))
            }
            path => matches_condition(lookup(document, path), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'c>(operator: &str, condition: &'c Bson) -> Result<Vec<&'c Document>, StoreError> {
    let invalid = || StoreError::Invalid(format!("{operator} expects an array of documents"));
    condition
        .as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|clause| clause.as_document().ok_or_else(invalid))
        .collect()
}

fn matches_condition(value: Option<&Bson>, condition: &Bson) -> Result<bool, StoreError> {
    let Bson::Document(operators) = condition else {
        return Ok(equals_or_contains(value, condition));
    };
    if !is_operator_document(condition) {
        return Ok(equals_or_contains(value, condition));
    }
    for (operator, operand) in operators {
        let matched = match operator.as_str() {
            "$in" => operand
                .as_array()
                .ok_or_else(|| StoreError::Invalid("$in expects an array".into()))?
                .iter()
                .any(|candidate| equals_or_contains(value, candidate)),
            "$all" => operand
                .as_array()
                .ok_or_else(|| StoreError::Invalid("$all expects an array".into()))?
                .iter()
                .all(|candidate| equals_or_contains(value, candidate)),
            "$ne" => !equals_or_contains(value, operand),
            "$exists" => value.is_some() == operand.as_bool().unwrap_or(true),
            "$lt" => compares(value, operand, |o| o == Ordering::Less),
            "$lte" => compares(value, operand, |o| o != Ordering::Greater),
            "$gt" => compares(value, operand, |o| o == Ordering::Greater),
            "$gte" => compares(value, operand, |o| o != Ordering::Less),
            other => return Err(StoreError::UnsupportedOperator(other.to_string())),
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn compares(value: Option<&Bson>, operand: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        Some(Bson::Array(items)) => items
            .iter()
            .any(|item| compare_bson(item, operand).is_some_and(&accept)),
        Some(value) => compare_bson(value, operand).is_some_and(accept),
        None => false,
    }
}

fn equals_or_contains(value: Option<&Bson>, expected: &Bson) -> bool {
    match (value, expected) {
        (None | Some(Bson::Null), Bson::Null) => true,
        (None, _) => false,
        (Some(Bson::Array(items)), expected) => {
            bson_eq(&Bson::Array(items.clone()), expected)
                || items.iter().any(|item| bson_eq(item, expected))
        }
        (Some(value), expected) => bson_eq(value, expected),
    }
}

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(value) => Some(i64::from(*value)),
        Bson::Int64(value) => Some(*value),
        _ => None,
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(value) => Some(f64::from(*value)),
        Bson::Int64(value) => Some(*value as f64),
        Bson::Double(value) => Some(*value),
        _ => None,
    }
}

/// Equality with numeric values compared across their BSON representations.
pub(crate) fn bson_eq(left: &Bson, right: &Bson) -> bool {
    match (as_i64(left), as_i64(right)) {
        (Some(l), Some(r)) => l == r,
        _ => match (as_f64(left), as_f64(right)) {
            (Some(l), Some(r)) => l == r,
            _ => match (left, right) {
                (Bson::Array(l), Bson::Array(r)) => {
                    l.len() == r.len() && l.iter().zip(r).all(|(l, r)| bson_eq(l, r))
                }
                (Bson::Document(l), Bson::Document(r)) => {
                    l.len() == r.len()
                        && l.iter().all(|(k, v)| r.get(k).is_some_and(|o| bson_eq(v, o)))
                }
                _ => left == right,
            },
        },
    }
}

/// Ordering between values of the same kind, `None` when they are not comparable.
pub(crate) fn compare_bson(left: &Bson, right: &Bson) -> Option<Ordering> {
    if let (Some(l), Some(r)) = (as_i64(left), as_i64(right)) {
        return Some(l.cmp(&r));
    }
    if let (Some(l), Some(r)) = (as_f64(left), as_f64(right)) {
        return l.partial_cmp(&r);
    }
    match (left, right) {
        (Bson::String(l), Bson::String(r)) => Some(l.cmp(r)),
        (Bson::DateTime(l), Bson::DateTime(r)) => Some(l.cmp(r)),
        (Bson::Boolean(l), Bson::Boolean(r)) => Some(l.cmp(r)),
        (Bson::ObjectId(l), Bson::ObjectId(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{doc, DateTime};

    #[test]
    fn null_filter_matches_missing_field() {
        let document = doc! {"key": "a"};
        assert!(matches(&document, &doc! {"other": Bson::Null}).unwrap());
        assert!(!matches(&document, &doc! {"key": Bson::Null}).unwrap());
    }

    #[test]
    fn scalar_filter_matches_array_element() {
        let document = doc! {"tags": ["a", "b"]};
        assert!(matches(&document, &doc! {"tags": "b"}).unwrap());
        assert!(matches(&document, &doc! {"tags": {"$all": ["a", "b"]}}).unwrap());
        assert!(!matches(&document, &doc! {"tags": {"$all": ["a", "c"]}}).unwrap());
    }

    #[test]
    fn numbers_compare_across_representations() {
        let document = doc! {"key": 1_i64, "nested": {"value": 2.5}};
        assert!(matches(&document, &doc! {"key": 1}).unwrap());
        assert!(matches(&document, &doc! {"key": {"$in": [3, 1]}}).unwrap());
        assert!(matches(&document, &doc! {"nested.value": {"$gt": 2}}).unwrap());
    }

    #[test]
    fn range_operators_ignore_missing_and_null() {
        let since = DateTime::from_millis(1_000);
        let document = doc! {"since": since, "until": Bson::Null};
        let filter = doc! {
            "since": {"$lte": DateTime::from_millis(2_000)},
            "until": {"$gt": DateTime::from_millis(2_000)},
        };
        assert!(!matches(&document, &filter).unwrap());
        let open = doc! {"$or": [{"until": Bson::Null}, {"until": {"$gt": since}}]};
        assert!(matches(&document, &open).unwrap());
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let result = matches(&doc! {"key": 1}, &doc! {"key": {"$regex": "a"}});
        assert!(matches!(result, Err(StoreError::UnsupportedOperator(_))));
    }

    #[test]
    fn increment_creates_nested_counter() {
        let mut document = doc! {"_id": "test"};
        apply_update(&mut document, &doc! {"$inc": {"key.counter": 1_i64}}).unwrap();
        apply_update(&mut document, &doc! {"$inc": {"key.counter": 1_i64}}).unwrap();
        assert_eq!(lookup(&document, "key.counter"), Some(&Bson::Int64(2)));
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicates() {
        let collection = MemoryDatabase::new("test").collection("test");
        collection
            .create_index(&doc! {"key": 1, "until": 1}, true, "uidxtest")
            .await
            .unwrap();
        collection.insert_one(&doc! {"key": "a"}).await.unwrap();
        collection
            .insert_one(&doc! {"key": "a", "until": DateTime::from_millis(1)})
            .await
            .unwrap();
        let duplicate = collection.insert_one(&doc! {"key": "a"}).await;
        assert!(duplicate.is_err_and(|e| e.is_duplicate_key()));
    }

    #[tokio::test]
    async fn upsert_copies_equality_filter() {
        let collection = MemoryDatabase::new("test").collection("counters");
        let created = collection
            .find_one_and_update(
                &doc! {"_id": "test"},
                &doc! {"$inc": {"key.counter": 1_i64}},
                true,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created, doc! {"_id": "test", "key": {"counter": 1_i64}});
    }
}
