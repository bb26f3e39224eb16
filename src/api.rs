//! Descriptions of a model for a REST layer: documentation of the fields,
//! query string parsers and example values.

use crate::column::{Column, DefaultValue, FieldKind};
use crate::model::{CrudModel, LIMIT, OFFSET};
use crate::versioning::{VALIDITY, VALID_SINCE, VALID_UNTIL};
use mongodb::bson::{Bson, Document};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WireType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
    List,
    Raw,
}

impl WireType {
    pub fn of(kind: &FieldKind) -> WireType {
        match kind {
            FieldKind::Str | FieldKind::ObjectId | FieldKind::Enum(_) => WireType::String,
            FieldKind::Int => WireType::Integer,
            FieldKind::Float => WireType::Float,
            FieldKind::Bool => WireType::Boolean,
            FieldKind::Date => WireType::Date,
            FieldKind::DateTime => WireType::DateTime,
            FieldKind::List(_) => WireType::List,
            FieldKind::Dict(_) => WireType::Raw,
        }
    }
}

/// One query string argument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryArgument {
    pub name: String,
    #[serde(rename = "type")]
    pub wire_type: WireType,
    /// Given once per value.
    pub repeatable: bool,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
}

impl QueryArgument {
    pub fn new(name: &str, wire_type: WireType) -> QueryArgument {
        QueryArgument {
            name: name.to_string(),
            wire_type,
            repeatable: false,
            required: false,
            minimum: None,
            choices: None,
        }
    }

    fn from_column(column: &Column) -> QueryArgument {
        // list filters are given as repeated strings
        let wire_type = match column.kind() {
            FieldKind::List(_) => WireType::String,
            kind => WireType::of(kind),
        };
        QueryArgument {
            repeatable: matches!(column.kind(), FieldKind::List(_)),
            choices: column.choice_names(),
            ..QueryArgument::new(column.name(), wire_type)
        }
    }

    pub fn required(mut self) -> QueryArgument {
        self.required = true;
        self
    }

    pub fn minimum(mut self, minimum: i64) -> QueryArgument {
        self.minimum = Some(minimum);
        self
    }
}

/// Ordered set of query string arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct QueryParser {
    arguments: Vec<QueryArgument>,
}

impl QueryParser {
    /// Replaces any argument with the same name.
    pub fn add(&mut self, argument: QueryArgument) {
        self.remove(&argument.name);
        self.arguments.push(argument);
    }

    pub fn remove(&mut self, name: &str) -> Option<QueryArgument> {
        let position = self.arguments.iter().position(|a| a.name == name)?;
        Some(self.arguments.remove(position))
    }

    pub fn get(&self, name: &str) -> Option<&QueryArgument> {
        self.arguments.iter().find(|a| a.name == name)
    }

    pub fn arguments(&self) -> &[QueryArgument] {
        &self.arguments
    }
}

/// Documentation of one field of a JSON body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonField {
    #[serde(rename = "type")]
    pub wire_type: WireType,
    /// Type of list items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<WireType>,
    pub required: bool,
    pub example: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Assigned by the store.
    pub readonly: bool,
}

impl JsonField {
    fn from_column(column: &Column) -> JsonField {
        let items = match column.kind() {
            FieldKind::List(item) => Some(WireType::of(item.kind())),
            _ => None,
        };
        JsonField {
            wire_type: WireType::of(column.kind()),
            items,
            required: column.is_required(),
            example: example(column),
            description: column.get_description().map(str::to_string),
            choices: column.choice_names(),
            default: static_default(column),
            readonly: column.should_auto_increment(),
        }
    }
}

impl CrudModel {
    /// `{"collection": <collection name>, <field>: <field>, ...}`
    pub fn description_dictionary(&self) -> Document {
        let mut description = Document::new();
        description.insert("collection", self.collection_name());
        for column in self.fields().columns() {
            description.insert(column.name(), column.name());
        }
        description
    }

    /// Description of every described field.
    pub fn field_descriptions(&self) -> BTreeMap<String, String> {
        self.fields()
            .columns()
            .iter()
            .filter_map(|column| {
                let description = column.get_description()?;
                Some((column.name().to_string(), description.to_string()))
            })
            .collect()
    }

    pub fn json_fields(&self) -> BTreeMap<String, JsonField> {
        self.fields()
            .columns()
            .iter()
            .map(|column| (column.name().to_string(), JsonField::from_column(column)))
            .collect()
    }

    /// Filters of `get_all`, with its pagination.
    pub fn query_get_parser(&self) -> QueryParser {
        let mut parser = self.query_parser();
        parser.add(QueryArgument::new(LIMIT, WireType::Integer).minimum(1));
        parser.add(QueryArgument::new(OFFSET, WireType::Integer).minimum(0));
        parser
    }

    pub fn query_delete_parser(&self) -> QueryParser {
        self.query_parser()
    }

    /// Filters of `rollback_to`, `None` for models that are not versioned.
    pub fn query_rollback_parser(&self) -> Option<QueryParser> {
        if !self.is_versioned() {
            return None;
        }
        let mut parser = self.query_parser();
        parser.remove(VALID_SINCE);
        parser.remove(VALID_UNTIL);
        parser.add(QueryArgument::new(VALIDITY, WireType::DateTime).required());
        Some(parser)
    }

    fn query_parser(&self) -> QueryParser {
        let mut parser = QueryParser::default();
        for column in self.fields().columns() {
            parser.add(QueryArgument::from_column(column));
        }
        parser
    }
}

fn static_default(column: &Column) -> Option<Value> {
    match column.get_default_value()? {
        DefaultValue::Static(Bson::Null) | DefaultValue::Computed(_) => None,
        DefaultValue::Static(value) => Some(value.clone().into_relaxed_extjson()),
    }
}

/// Example value documented for a field.
pub fn example(column: &Column) -> Value {
    if let Some(default) = static_default(column) {
        return default;
    }
    match column.kind() {
        FieldKind::Enum(kind) => {
            if let Some(name) = kind.names().into_iter().next() {
                return Value::String(name);
            }
        }
        _ => {
            if let Some(choice) = column.choice_names().and_then(|names| names.into_iter().next()) {
                return Value::String(choice);
            }
        }
    }
    match column.kind() {
        FieldKind::Int => json!(0),
        FieldKind::Float => json!(0.0),
        FieldKind::Bool => json!(true),
        FieldKind::Date => json!("2017-09-24"),
        FieldKind::DateTime => json!("2017-09-24T15:36:09"),
        FieldKind::List(item) => json!([example(item)]),
        FieldKind::Dict(shape) => Value::Object(
            shape
                .fields()
                .columns()
                .iter()
                .map(|nested| (nested.name().to_string(), example(nested)))
                .collect::<Map<String, Value>>(),
        ),
        _ => json!("sample_value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::EnumKind;

    fn model() -> CrudModel {
        CrudModel::builder("test")
            .column(Column::string("key").primary_key().description("Key"))
            .column(Column::int("counter").auto_increment())
            .column(Column::list("tags", Column::string("tag")))
            .column(Column::enumeration("color", EnumKind::from_names("Color", &["Red", "Blue"])))
            .column(Column::float("ratio").default_value(0.5))
            .column(Column::dict("nested", vec![Column::date("day")]).unwrap())
            .versioned()
            .build()
            .unwrap()
    }

    #[test]
    fn description_dictionary_lists_fields() {
        let description = model().description_dictionary();
        assert_eq!(description.get_str("collection").unwrap(), "test");
        assert_eq!(description.get_str("tags").unwrap(), "tags");
    }

    #[test]
    fn get_parser_adds_pagination() {
        let parser = model().query_get_parser();
        let tags = parser.get("tags").unwrap();
        assert!(tags.repeatable);
        assert_eq!(tags.wire_type, WireType::String);
        assert_eq!(parser.get(LIMIT).unwrap().minimum, Some(1));
        assert_eq!(parser.get(OFFSET).unwrap().minimum, Some(0));
        assert!(model().query_delete_parser().get(LIMIT).is_none());
    }

    #[test]
    fn rollback_parser_requires_validity() {
        let parser = model().query_rollback_parser().unwrap();
        assert!(parser.get(VALID_SINCE).is_none());
        assert!(parser.get(VALID_UNTIL).is_none());
        let validity = parser.get(VALIDITY).unwrap();
        assert!(validity.required);
        assert_eq!(validity.wire_type, WireType::DateTime);
    }

    #[test]
    fn json_fields_document_examples() {
        let fields = serde_json::to_value(model().json_fields()).unwrap();
        assert_eq!(fields["counter"]["readonly"], json!(true));
        assert_eq!(fields["counter"]["example"], json!(0));
        assert_eq!(fields["tags"]["type"], json!("list"));
        assert_eq!(fields["tags"]["items"], json!("string"));
        assert_eq!(fields["color"]["example"], json!("Red"));
        assert_eq!(fields["color"]["enum"], json!(["Red", "Blue"]));
        assert_eq!(fields["ratio"]["example"], json!(0.5));
        assert_eq!(fields["nested"]["example"], json!({"day": "2017-09-24"}));
        assert_eq!(fields["key"]["description"], json!("Key"));
        assert_eq!(fields["valid_since_utc"]["type"], json!("datetime"));
    }
}
