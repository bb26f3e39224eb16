use crate::audit;
use crate::column::EnumKind;
use crate::error::StoreError;
use crate::model::Model;
use mongodb::bson::Document;
use std::fmt;

/// Kind of write recorded in audit tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Insert,
    Update,
    Delete,
    Rollback,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Insert, Action::Update, Action::Delete, Action::Rollback];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Insert => "Insert",
            Action::Update => "Update",
            Action::Delete => "Delete",
            Action::Rollback => "Rollback",
        }
    }

    pub(crate) fn kind() -> EnumKind {
        EnumKind::from_names("AuditAction", &Action::ALL.map(|action| action.as_str()))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs once the store accepted a write, with the documents as stored.
pub(crate) async fn finish(
    model: &Model<'_>,
    action: Action,
    documents: &[Document],
) -> Result<(), StoreError> {
    log::debug!(
        "{action} operation completed on {}: {documents:?}",
        model.schema().collection_name()
    );
    if let Some(audit) = model.schema().audit_model() {
        audit::record(model, audit, action, documents).await?;
    }
    Ok(())
}
