use crate::error::{ConfigError, ErrorMap};
use crate::fields::Fields;
use crate::memory::{bson_eq, compare_bson};
use chrono::{NaiveDate, NaiveDateTime};
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Bson, DateTime, Document};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

pub(crate) const MISSING: &str = "Missing data for required field.";

const MILLIS_PER_DAY: i64 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    Unique,
    NonUnique,
}

/// Which pipeline a document is going through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Insert,
    Update,
    Query,
}

/// Named variants, each stored as its own value.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumKind {
    name: String,
    variants: Vec<(String, Bson)>,
}

impl EnumKind {
    pub fn new<N, V>(name: &str, variants: impl IntoIterator<Item = (N, V)>) -> EnumKind
    where
        N: Into<String>,
        V: Into<Bson>,
    {
        EnumKind {
            name: name.to_string(),
            variants: variants
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }

    /// Variants stored under their own name.
    pub fn from_names(name: &str, names: &[&str]) -> EnumKind {
        EnumKind::new(name, names.iter().map(|n| (n.to_string(), n.to_string())))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn names(&self) -> Vec<String> {
        self.variants.iter().map(|(name, _)| name.clone()).collect()
    }

    fn storage_value(&self, value: &Bson) -> Option<&Bson> {
        self.variants
            .iter()
            .find(|(name, stored)| {
                matches!(value, Bson::String(s) if s == name) || bson_eq(stored, value)
            })
            .map(|(_, stored)| stored)
    }

    fn has_name(&self, value: &Bson) -> bool {
        matches!(value, Bson::String(s) if self.variants.iter().any(|(name, _)| name == s))
    }

    fn variant_name(&self, stored: &Bson) -> Option<&str> {
        self.variants
            .iter()
            .find(|(_, value)| bson_eq(value, stored))
            .map(|(name, _)| name.as_str())
    }
}

type DocumentFn = Arc<dyn Fn(&Document) -> Bson + Send + Sync>;
type ShapeSelector = Arc<dyn Fn(&Document) -> Option<String> + Send + Sync>;

/// Value used when a field is absent. Values are given in their transport form.
#[derive(Clone)]
pub enum DefaultValue {
    Static(Bson),
    /// Computed from the enclosing document.
    Computed(DocumentFn),
}

impl DefaultValue {
    pub fn computed(provider: impl Fn(&Document) -> Bson + Send + Sync + 'static) -> Self {
        DefaultValue::Computed(Arc::new(provider))
    }

    pub fn value(&self, document: &Document) -> Bson {
        match self {
            DefaultValue::Static(value) => value.clone(),
            DefaultValue::Computed(provider) => provider(document),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Static(value) => write!(f, "Static({value})"),
            DefaultValue::Computed(_) => f.write_str("Computed"),
        }
    }
}

/// Restricted set of accepted values for a scalar field.
#[derive(Clone)]
pub enum Choices {
    Static(Vec<Bson>),
    Computed(Arc<dyn Fn() -> Vec<Bson> + Send + Sync>),
}

impl Choices {
    pub fn values(&self) -> Vec<Bson> {
        match self {
            Choices::Static(values) => values.clone(),
            Choices::Computed(provider) => provider(),
        }
    }
}

impl fmt::Debug for Choices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Choices::Static(values) => f.debug_tuple("Static").field(values).finish(),
            Choices::Computed(_) => f.write_str("Computed"),
        }
    }
}

/// Field set of a dictionary field, optionally varying with the enclosing document.
///
/// Every shape is built once, when the column is declared; the selector only
/// picks among them.
#[derive(Clone)]
pub struct DictShape {
    fields: Arc<Fields>,
    variants: Vec<(String, Arc<Fields>)>,
    selector: Option<ShapeSelector>,
}

impl DictShape {
    /// Fields used for a document. Unknown shape names fall back to the base fields.
    pub fn fields_for(&self, document: &Document) -> &Fields {
        let Some(selector) = &self.selector else {
            return &self.fields;
        };
        selector(document)
            .and_then(|name| self.variants.iter().find(|(shape, _)| *shape == name))
            .map_or(&self.fields, |(_, fields)| fields)
    }

    /// Fields declared regardless of the document, used for index discovery.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }
}

impl fmt::Debug for DictShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DictShape")
            .field("fields", &self.fields)
            .field("variants", &self.variants.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum FieldKind {
    Str,
    Int,
    Float,
    Bool,
    Date,
    DateTime,
    ObjectId,
    Enum(EnumKind),
    Dict(DictShape),
    List(Box<Column>),
}

impl FieldKind {
    /// Name used in "Not a valid ..." messages.
    pub fn type_name(&self) -> &str {
        match self {
            FieldKind::Str => "str",
            FieldKind::Int => "int",
            FieldKind::Float => "float",
            FieldKind::Bool => "bool",
            FieldKind::Date => "date",
            FieldKind::DateTime => "datetime",
            FieldKind::ObjectId => "ObjectId",
            FieldKind::Enum(kind) => kind.name(),
            FieldKind::Dict(_) => "dict",
            FieldKind::List(_) => "list",
        }
    }
}

/// Definition of one document field.
#[derive(Debug, Clone)]
pub struct Column {
    name: String,
    kind: FieldKind,
    description: Option<String>,
    index_type: Option<IndexType>,
    is_primary_key: bool,
    is_nullable: bool,
    is_required: bool,
    should_auto_increment: bool,
    counter_name: Option<String>,
    allow_none_as_filter: bool,
    default_value: Option<DefaultValue>,
    choices: Option<Choices>,
    sorted: bool,
}

impl Column {
    pub fn new(name: &str, kind: FieldKind) -> Column {
        Column {
            name: name.to_string(),
            kind,
            description: None,
            index_type: None,
            is_primary_key: false,
            is_nullable: true,
            is_required: false,
            should_auto_increment: false,
            counter_name: None,
            allow_none_as_filter: false,
            default_value: None,
            choices: None,
            sorted: false,
        }
    }

    pub fn string(name: &str) -> Column {
        Column::new(name, FieldKind::Str)
    }

    pub fn int(name: &str) -> Column {
        Column::new(name, FieldKind::Int)
    }

    pub fn float(name: &str) -> Column {
        Column::new(name, FieldKind::Float)
    }

    pub fn boolean(name: &str) -> Column {
        Column::new(name, FieldKind::Bool)
    }

    pub fn date(name: &str) -> Column {
        Column::new(name, FieldKind::Date)
    }

    pub fn datetime(name: &str) -> Column {
        Column::new(name, FieldKind::DateTime)
    }

    pub fn object_id(name: &str) -> Column {
        Column::new(name, FieldKind::ObjectId)
    }

    pub fn enumeration(name: &str, kind: EnumKind) -> Column {
        Column::new(name, FieldKind::Enum(kind))
    }

    /// Nested document with a fixed set of fields.
    pub fn dict(name: &str, fields: Vec<Column>) -> Result<Column, ConfigError> {
        Column::dict_by(name, fields, vec![], None::<fn(&Document) -> Option<String>>)
    }

    /// Nested document whose fields depend on the enclosing document: `selector`
    /// names one of `variants`, `fields` is used when it names none.
    pub fn dict_by(
        name: &str,
        fields: Vec<Column>,
        variants: Vec<(&str, Vec<Column>)>,
        selector: Option<impl Fn(&Document) -> Option<String> + Send + Sync + 'static>,
    ) -> Result<Column, ConfigError> {
        let nested = |columns: Vec<Column>| -> Result<Arc<Fields>, ConfigError> {
            if columns.is_empty() {
                return Err(ConfigError::EmptyNestedFields(name.to_string()));
            }
            if let Some(column) = columns.iter().find(|c| c.should_auto_increment) {
                return Err(ConfigError::NestedAutoIncrement(format!(
                    "{name}.{}",
                    column.name
                )));
            }
            Ok(Arc::new(Fields::new(columns)?))
        };
        let shape = DictShape {
            fields: nested(fields)?,
            variants: variants
                .into_iter()
                .map(|(shape, columns)| Ok((shape.to_string(), nested(columns)?)))
                .collect::<Result<_, ConfigError>>()?,
            selector: selector.map(|s| Arc::new(s) as ShapeSelector),
        };
        Ok(Column::new(name, FieldKind::Dict(shape)))
    }

    /// Homogeneous list, `item` is renamed after the list.
    pub fn list(name: &str, item: Column) -> Column {
        let item = Column {
            name: name.to_string(),
            ..item
        };
        Column::new(name, FieldKind::List(Box::new(item)))
    }

    pub fn description(mut self, description: &str) -> Column {
        self.description = Some(description.to_string());
        self
    }

    pub fn primary_key(mut self) -> Column {
        self.is_primary_key = true;
        self
    }

    pub fn not_nullable(mut self) -> Column {
        self.is_nullable = false;
        self
    }

    /// Documented as required on insert for API consumers.
    pub fn required(mut self) -> Column {
        self.is_required = true;
        self
    }

    pub fn index(mut self, index_type: IndexType) -> Column {
        self.index_type = Some(index_type);
        self
    }

    pub fn unique(self) -> Column {
        self.index(IndexType::Unique)
    }

    /// Values come from the counter named after the field (or `counter_name`).
    pub fn auto_increment(mut self) -> Column {
        self.should_auto_increment = true;
        self
    }

    pub fn counter_name(mut self, counter_name: &str) -> Column {
        self.counter_name = Some(counter_name.to_string());
        self
    }

    /// A null filter value matches missing/null values instead of being ignored.
    pub fn allow_none_as_filter(mut self) -> Column {
        self.allow_none_as_filter = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Bson>) -> Column {
        self.default_value = Some(DefaultValue::Static(value.into()));
        self
    }

    pub fn default_with(
        mut self,
        provider: impl Fn(&Document) -> Bson + Send + Sync + 'static,
    ) -> Column {
        self.default_value = Some(DefaultValue::computed(provider));
        self
    }

    pub fn choices(mut self, values: Vec<Bson>) -> Column {
        self.choices = Some(Choices::Static(values));
        self
    }

    pub fn choices_with(
        mut self,
        provider: impl Fn() -> Vec<Bson> + Send + Sync + 'static,
    ) -> Column {
        self.choices = Some(Choices::Computed(Arc::new(provider)));
        self
    }

    /// Lists only: keep items ordered.
    pub fn sorted(mut self) -> Column {
        self.sorted = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn get_description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn index_type(&self) -> Option<IndexType> {
        self.index_type
    }

    pub fn is_primary_key(&self) -> bool {
        self.is_primary_key
    }

    pub fn is_nullable(&self) -> bool {
        self.is_nullable
    }

    pub fn is_required(&self) -> bool {
        self.is_required
    }

    pub fn should_auto_increment(&self) -> bool {
        self.should_auto_increment
    }

    pub fn get_counter_name(&self) -> &str {
        self.counter_name.as_deref().unwrap_or(&self.name)
    }

    pub fn get_default_value(&self) -> Option<&DefaultValue> {
        self.default_value.as_ref()
    }

    /// Accepted values as names: enum variants or declared choices.
    pub fn choice_names(&self) -> Option<Vec<String>> {
        match (&self.kind, &self.choices) {
            (FieldKind::Enum(kind), _) => Some(kind.names()),
            (_, Some(choices)) => Some(choices.values().iter().map(display).collect()),
            _ => None,
        }
    }

    /// Copy used by audit tables: same shape, none of the key/index/counter roles.
    pub(crate) fn for_audit(&self) -> Column {
        Column {
            index_type: None,
            is_primary_key: false,
            is_nullable: true,
            should_auto_increment: false,
            counter_name: None,
            ..self.clone()
        }
    }

    pub(crate) fn check(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingFieldName);
        }
        if self.name.contains(['.', '$']) {
            return Err(ConfigError::InvalidFieldName(self.name.clone()));
        }
        if self.should_auto_increment && !matches!(self.kind, FieldKind::Int) {
            return Err(ConfigError::AutoIncrementNotInt(self.name.clone()));
        }
        if !self.is_nullable {
            if self.should_auto_increment {
                return Err(ConfigError::MandatoryAutoIncrement(self.name.clone()));
            }
            if self.default_value.is_some() {
                return Err(ConfigError::MandatoryWithDefault(self.name.clone()));
            }
        }
        if let FieldKind::List(item) = &self.kind {
            item.check()?;
        }
        Ok(())
    }

    /// Fills an absent field with its default; recurses into nested documents.
    pub(crate) fn apply_default(&self, document: &mut Document) {
        let current = document.get(&self.name);
        if matches!(current, None | Some(Bson::Null)) {
            if let Some(default) = &self.default_value {
                let value = default.value(document);
                if value != Bson::Null {
                    document.insert(self.name.clone(), value);
                }
            }
            return;
        }
        if let FieldKind::Dict(shape) = &self.kind {
            if let Some(Bson::Document(mut nested)) = document.remove(&self.name) {
                shape.fields_for(document).apply_defaults(&mut nested);
                document.insert(self.name.clone(), nested);
            }
        }
    }

    pub(crate) fn validate(&self, document: &Document, mode: Mode) -> ErrorMap {
        match document.get(&self.name) {
            None | Some(Bson::Null) => {
                if mode != Mode::Query && !self.is_nullable {
                    return single(&self.name, MISSING);
                }
                ErrorMap::new()
            }
            Some(value) => self.validate_value(&self.name, value, document, mode),
        }
    }

    fn validate_value(&self, key: &str, value: &Bson, document: &Document, mode: Mode) -> ErrorMap {
        match (&self.kind, value) {
            (FieldKind::Dict(shape), Bson::Document(nested)) => {
                prefixed(key, shape.fields_for(document).validate(nested, mode))
            }
            (FieldKind::List(item), Bson::Array(items)) => {
                let mut errors = ErrorMap::new();
                for (position, value) in items.iter().enumerate() {
                    let key = format!("{key}[{position}]");
                    errors.extend(item.validate_value(&key, value, document, mode));
                }
                errors
            }
            (FieldKind::List(item), value) if mode == Mode::Query => {
                item.validate_value(key, value, document, mode)
            }
            (FieldKind::Dict(_) | FieldKind::List(_), _) => {
                single(key, &format!("Not a valid {}.", self.kind.type_name()))
            }
            (_, Bson::Array(values)) if mode == Mode::Query => {
                let mut errors = ErrorMap::new();
                for value in values {
                    errors.extend(self.validate_value(key, value, document, mode));
                }
                errors
            }
            (_, value) => match self.check_scalar(value) {
                Ok(()) => ErrorMap::new(),
                Err(message) => single(key, &message),
            },
        }
    }

    fn check_scalar(&self, value: &Bson) -> Result<(), String> {
        let valid = match (&self.kind, value) {
            (FieldKind::Str, Bson::String(_)) => true,
            (FieldKind::Int, Bson::Int32(_) | Bson::Int64(_)) => true,
            (FieldKind::Float, Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_)) => true,
            (FieldKind::Bool, Bson::Boolean(_)) => true,
            (FieldKind::Date | FieldKind::DateTime, Bson::DateTime(_)) => true,
            (FieldKind::Date | FieldKind::DateTime, Bson::String(s)) => parse_datetime(s).is_some(),
            (FieldKind::ObjectId, Bson::ObjectId(_)) => true,
            (FieldKind::ObjectId, Bson::String(s)) => ObjectId::parse_str(s).is_ok(),
            (FieldKind::Enum(kind), value) => {
                return match kind.storage_value(value) {
                    Some(_) => Ok(()),
                    None => Err(not_within(value, &kind.names())),
                };
            }
            _ => false,
        };
        if !valid {
            return Err(format!("Not a valid {}.", self.kind.type_name()));
        }
        if let Some(choices) = &self.choices {
            let choices = choices.values();
            if !choices.iter().any(|choice| bson_eq(choice, value)) {
                let names: Vec<String> = choices.iter().map(display).collect();
                return Err(not_within(value, &names));
            }
        }
        Ok(())
    }

    /// Converts a validated field to its storage form. Absent or null values are
    /// omitted, except explicit nulls on update (unset) and on nullable filters.
    pub(crate) fn deserialize(&self, document: &mut Document, mode: Mode) {
        let Some(value) = document.remove(&self.name) else {
            return;
        };
        if value == Bson::Null {
            let keep_null = match mode {
                Mode::Insert => false,
                Mode::Update => true,
                Mode::Query => self.allow_none_as_filter,
            };
            if keep_null {
                document.insert(self.name.clone(), Bson::Null);
            }
            return;
        }
        let stored = self.to_storage(value, document, mode);
        document.insert(self.name.clone(), stored);
    }

    fn to_storage(&self, value: Bson, document: &Document, mode: Mode) -> Bson {
        match (&self.kind, value) {
            (FieldKind::Dict(shape), Bson::Document(mut nested)) => {
                shape.fields_for(document).deserialize(&mut nested, mode);
                Bson::Document(nested)
            }
            (FieldKind::List(item), Bson::Array(items)) => {
                let mut items: Vec<Bson> = items
                    .into_iter()
                    .map(|value| item.to_storage(value, document, mode))
                    .collect();
                if self.sorted {
                    sort(&mut items);
                }
                match mode {
                    Mode::Query => Bson::Document(doc! {"$all": items}),
                    _ => Bson::Array(items),
                }
            }
            (FieldKind::List(item), value) => item.to_storage(value, document, mode),
            (_, Bson::Array(values)) if mode == Mode::Query => {
                let values: Vec<Bson> = values
                    .into_iter()
                    .map(|value| self.to_storage(value, document, mode))
                    .collect();
                Bson::Document(doc! {"$in": values})
            }
            (FieldKind::Int, Bson::Int32(value)) => Bson::Int64(i64::from(value)),
            (FieldKind::Float, Bson::Int32(value)) => Bson::Double(f64::from(value)),
            (FieldKind::Float, Bson::Int64(value)) => Bson::Double(value as f64),
            (FieldKind::DateTime, Bson::String(value)) => {
                parse_datetime(&value).map_or(Bson::String(value), Bson::DateTime)
            }
            (FieldKind::Date, Bson::String(value)) => match parse_datetime(&value) {
                Some(datetime) => Bson::DateTime(midnight(datetime)),
                None => Bson::String(value),
            },
            (FieldKind::Date, Bson::DateTime(datetime)) => Bson::DateTime(midnight(datetime)),
            (FieldKind::ObjectId, Bson::String(value)) => {
                ObjectId::parse_str(&value).map_or(Bson::String(value), Bson::ObjectId)
            }
            (FieldKind::Enum(kind), value) => kind.storage_value(&value).cloned().unwrap_or(value),
            (_, value) => value,
        }
    }

    /// Converts a stored field to its transport form, filling defaults when absent.
    pub(crate) fn serialize(&self, document: &mut Document) {
        let value = match document.remove(&self.name) {
            None | Some(Bson::Null) => self.absent_value(document),
            Some(value) => self.to_transport(value, document),
        };
        document.insert(self.name.clone(), value);
    }

    fn absent_value(&self, document: &Document) -> Bson {
        if let Some(default) = &self.default_value {
            let value = default.value(document);
            return self.to_transport(value, document);
        }
        match &self.kind {
            FieldKind::List(_) => Bson::Array(vec![]),
            FieldKind::Dict(_) => self.to_transport(Bson::Document(Document::new()), document),
            _ => Bson::Null,
        }
    }

    fn to_transport(&self, value: Bson, document: &Document) -> Bson {
        match (&self.kind, value) {
            (FieldKind::Dict(shape), Bson::Document(mut nested)) => {
                shape.fields_for(document).serialize(&mut nested);
                Bson::Document(nested)
            }
            (FieldKind::List(item), Bson::Array(mut items)) => {
                if self.sorted {
                    sort(&mut items);
                }
                Bson::Array(
                    items
                        .into_iter()
                        .map(|value| item.to_transport(value, document))
                        .collect(),
                )
            }
            (FieldKind::Date, Bson::DateTime(datetime)) => Bson::String(format_date(datetime)),
            (FieldKind::DateTime, Bson::DateTime(datetime)) => {
                Bson::String(format_datetime(datetime))
            }
            (FieldKind::ObjectId, Bson::ObjectId(id)) => Bson::String(id.to_hex()),
            (FieldKind::Int, Bson::Int32(value)) => Bson::Int64(i64::from(value)),
            (FieldKind::Enum(kind), value) => match kind.variant_name(&value) {
                Some(name) => Bson::String(name.to_string()),
                None if kind.has_name(&value) => value,
                None => {
                    log::warn!("Stored value {value} is not a known {} variant.", kind.name());
                    value
                }
            },
            (_, value) => value,
        }
    }
}

fn single(key: &str, message: &str) -> ErrorMap {
    ErrorMap::from([(key.to_string(), vec![message.to_string()])])
}

fn prefixed(prefix: &str, errors: ErrorMap) -> ErrorMap {
    errors
        .into_iter()
        .map(|(key, messages)| (format!("{prefix}.{key}"), messages))
        .collect()
}

fn not_within(value: &Bson, choices: &[String]) -> String {
    format!("Value \"{}\" is not within [{}].", display(value), choices.join(", "))
}

/// Plain rendering of a value, strings without quotes.
pub(crate) fn display(value: &Bson) -> String {
    match value {
        Bson::String(value) => value.clone(),
        other => other.to_string(),
    }
}

fn sort(items: &mut [Bson]) {
    items.sort_by(|a, b| compare_bson(a, b).unwrap_or(Ordering::Equal));
}

/// Parses RFC 3339 or naive ISO-8601 datetimes (taken as UTC) and plain dates.
pub(crate) fn parse_datetime(value: &str) -> Option<DateTime> {
    if let Ok(datetime) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(DateTime::from_millis(datetime.timestamp_millis()));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(value, format) {
            return Some(DateTime::from_millis(datetime.and_utc().timestamp_millis()));
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| DateTime::from_millis(datetime.and_utc().timestamp_millis()))
}

fn midnight(datetime: DateTime) -> DateTime {
    let millis = datetime.timestamp_millis();
    DateTime::from_millis(millis - millis.rem_euclid(MILLIS_PER_DAY))
}

/// `YYYY-MM-DDTHH:MM:SS`, with microseconds only when they are not zero.
pub(crate) fn format_datetime(datetime: DateTime) -> String {
    match chrono::DateTime::from_timestamp_millis(datetime.timestamp_millis()) {
        Some(datetime) if datetime.timestamp_subsec_micros() == 0 => {
            datetime.format("%Y-%m-%dT%H:%M:%S").to_string()
        }
        Some(datetime) => datetime.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        None => datetime.to_string(),
    }
}

pub(crate) fn format_date(datetime: DateTime) -> String {
    match chrono::DateTime::from_timestamp_millis(datetime.timestamp_millis()) {
        Some(datetime) => datetime.format("%Y-%m-%d").to_string(),
        None => datetime.to_string(),
    }
}
