use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One immutable line of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub entity_type: String,
    pub action: String,
    pub old_val: Option<serde_json::Value>,
    pub new_val: Option<serde_json::Value>,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(entity_id: Uuid, entity_type: &str, action: &str, actor: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id,
            entity_type: entity_type.to_string(),
            action: action.to_string(),
            old_val: None,
            new_val: None,
            actor: actor.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_change(
        mut self,
        old_val: Option<serde_json::Value>,
        new_val: Option<serde_json::Value>,
    ) -> Self {
        self.old_val = old_val;
        self.new_val = new_val;
        self
    }
}
