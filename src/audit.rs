//! Audit trail of a model.
//!
//! Every write on an audited model appends, once the write succeeded, one
//! record per affected document to `audit_<collection>`. Audit records are
//! never updated nor removed and their `revision` keeps increasing, even across
//! a deletion of the audited record.

use crate::column::Column;
use crate::error::{ConfigError, StoreError};
use crate::event::Action;
use crate::model::{CrudModel, Model};
use mongodb::bson::Document;

pub const AUDIT_ACTION: &str = "audit_action";
pub const AUDIT_DATE: &str = "audit_date_utc";
pub const AUDIT_USER: &str = "audit_user";
pub const REVISION: &str = "revision";

/// Schema of the audit collection of `parent`.
///
/// Parent fields are copied without their key, index and counter roles. A
/// parent field named like one of the audit fields is rejected.
pub(crate) fn shadow(parent: &CrudModel) -> Result<CrudModel, ConfigError> {
    let columns = parent
        .fields()
        .columns()
        .iter()
        .filter(|column| column.name() != "_id")
        .map(Column::for_audit);
    CrudModel::builder(&format!("audit_{}", parent.collection_name()))
        .columns(columns)
        .column(
            Column::enumeration(AUDIT_ACTION, Action::kind())
                .description("Action performed on the record."),
        )
        .column(Column::datetime(AUDIT_DATE).description("Date of the action (UTC)."))
        .column(
            Column::string(AUDIT_USER)
                .default_value("")
                .description("User performing the action."),
        )
        .column(
            Column::int(REVISION)
                .auto_increment()
                .unique()
                .description("Sequence of audit records in this collection."),
        )
        .build()
}

/// Appends one audit record per document (given in storage form).
pub(crate) async fn record(
    model: &Model<'_>,
    audit: &CrudModel,
    action: Action,
    documents: &[Document],
) -> Result<(), StoreError> {
    let audit_model = audit.bind(model.db());
    let collection = audit_model.collection();
    for document in documents {
        let mut entry = document.clone();
        entry.remove("_id");
        entry.insert(AUDIT_ACTION, action.as_str());
        entry.insert(AUDIT_DATE, model.db().now());
        entry.insert(AUDIT_USER, model.user());
        audit_model.increment(&mut entry).await?;
        collection.insert_one(&entry).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_schema_strips_key_roles() {
        let parent = CrudModel::builder("test")
            .column(Column::int("key").primary_key().auto_increment().unique())
            .column(Column::string("mandatory").not_nullable())
            .build()
            .unwrap();
        let audit = shadow(&parent).unwrap();
        assert_eq!(audit.collection_name(), "audit_test");
        let key = audit.fields().get("key").unwrap();
        assert!(!key.is_primary_key());
        assert!(!key.should_auto_increment());
        assert!(key.index_type().is_none());
        assert!(audit.fields().get("mandatory").unwrap().is_nullable());
        assert!(audit.fields().get(REVISION).unwrap().should_auto_increment());
    }

    #[test]
    fn audit_field_names_are_reserved() {
        let parent = CrudModel::builder("test")
            .column(Column::string("revision"))
            .audited()
            .build();
        assert_eq!(
            parent.unwrap_err(),
            ConfigError::DuplicateField(REVISION.to_string())
        );
    }
}
