use crate::column::{Column, FieldKind, IndexType, Mode};
use crate::error::{ConfigError, ErrorMap};
use mongodb::bson::{Bson, Document};
use std::collections::HashSet;

/// Ordered set of columns describing one document shape.
///
/// Runs the validate, deserialize and serialize pipeline for a whole document;
/// models and nested dictionary fields both rely on it.
#[derive(Debug, Clone)]
pub struct Fields {
    columns: Vec<Column>,
}

impl Fields {
    pub fn new(columns: Vec<Column>) -> Result<Fields, ConfigError> {
        let mut names = HashSet::new();
        for column in &columns {
            column.check()?;
            if !names.insert(column.name()) {
                return Err(ConfigError::DuplicateField(column.name().to_string()));
            }
        }
        Ok(Fields { columns })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name() == name)
    }

    pub fn primary_keys(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|column| column.is_primary_key())
    }

    pub fn auto_incremented(&self) -> impl Iterator<Item = &Column> {
        self.columns
            .iter()
            .filter(|column| column.should_auto_increment())
    }

    /// Paths of indexed fields, nested dictionary fields prefixed by their parent.
    pub fn index_fields(&self, index_type: IndexType) -> Vec<String> {
        let mut paths = vec![];
        for column in &self.columns {
            if column.index_type() == Some(index_type) {
                paths.push(column.name().to_string());
            }
            if let FieldKind::Dict(shape) = column.kind() {
                for nested in shape.fields().index_fields(index_type) {
                    paths.push(format!("{}.{nested}", column.name()));
                }
            }
        }
        paths
    }

    pub fn apply_defaults(&self, document: &mut Document) {
        for column in &self.columns {
            column.apply_default(document);
        }
    }

    /// Every non-nullable field must be there.
    pub fn validate_insert(&self, document: &Document) -> ErrorMap {
        self.validate(document, Mode::Insert)
    }

    /// Same policy as insert.
    pub fn validate_update(&self, document: &Document) -> ErrorMap {
        self.validate(document, Mode::Update)
    }

    /// Absent fields are never an error; `parent.child` filters are checked by
    /// the nested field they target.
    pub fn validate_query(&self, document: &Document) -> ErrorMap {
        self.validate(document, Mode::Query)
    }

    pub(crate) fn validate(&self, document: &Document, mode: Mode) -> ErrorMap {
        let mut errors = ErrorMap::new();
        for column in &self.columns {
            errors.extend(column.validate(document, mode));
        }
        if mode == Mode::Query {
            let dotted = group_dotted(
                document
                    .iter()
                    .filter(|(key, _)| key.contains('.'))
                    .map(|(key, value)| (key.clone(), value.clone())),
            );
            for (head, nested) in dotted {
                if let Some(FieldKind::Dict(shape)) = self.get(&head).map(Column::kind) {
                    for (key, messages) in shape.fields_for(document).validate(&nested, mode) {
                        errors.insert(format!("{head}.{key}"), messages);
                    }
                }
            }
        }
        errors
    }

    pub fn deserialize_insert(&self, document: &mut Document) {
        self.deserialize(document, Mode::Insert);
    }

    /// Explicit nulls are kept so that the caller can unset them.
    pub fn deserialize_update(&self, document: &mut Document) {
        self.deserialize(document, Mode::Update);
    }

    pub fn deserialize_query(&self, document: &mut Document) {
        self.deserialize(document, Mode::Query);
    }

    pub(crate) fn deserialize(&self, document: &mut Document, mode: Mode) {
        let dotted = match mode {
            Mode::Query => take_dotted(document),
            _ => vec![],
        };
        for column in &self.columns {
            column.deserialize(document, mode);
        }
        self.drop_unknown(document, true);
        for (head, mut nested) in dotted {
            let Some(FieldKind::Dict(shape)) = self.get(&head).map(Column::kind) else {
                log::warn!("Skipping unknown filter {head}.");
                continue;
            };
            shape.fields_for(document).deserialize(&mut nested, mode);
            for (key, value) in nested {
                document.insert(format!("{head}.{key}"), value);
            }
        }
    }

    pub fn serialize(&self, document: &mut Document) {
        for column in &self.columns {
            column.serialize(document);
        }
        self.drop_unknown(document, false);
    }

    fn drop_unknown(&self, document: &mut Document, warn: bool) {
        let unknown: Vec<String> = document
            .keys()
            .filter(|key| self.get(key).is_none())
            .cloned()
            .collect();
        if unknown.is_empty() {
            return;
        }
        for key in &unknown {
            document.remove(key);
        }
        if warn {
            log::warn!("Skipping unknown fields {unknown:?}.");
        }
    }
}

fn take_dotted(document: &mut Document) -> Vec<(String, Document)> {
    let keys: Vec<String> = document
        .keys()
        .filter(|key| key.contains('.'))
        .cloned()
        .collect();
    group_dotted(
        keys.into_iter()
            .filter_map(|key| document.remove(&key).map(|value| (key, value))),
    )
}

/// `{"a.b": 1, "a.c": 2}` becomes `[("a", {"b": 1, "c": 2})]`.
fn group_dotted(entries: impl Iterator<Item = (String, Bson)>) -> Vec<(String, Document)> {
    let mut grouped: Vec<(String, Document)> = vec![];
    for (key, value) in entries {
        let Some((head, rest)) = key.split_once('.') else {
            continue;
        };
        match grouped.iter_mut().find(|(existing, _)| existing == head) {
            Some((_, nested)) => {
                nested.insert(rest, value);
            }
            None => {
                let mut nested = Document::new();
                nested.insert(rest, value);
                grouped.push((head.to_string(), nested));
            }
        }
    }
    grouped
}
