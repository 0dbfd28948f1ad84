use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{SaveId, UnitId};

/// Portable serialized form of a workspace. The payload is opaque to
/// everything except the codec that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(String);

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Size of the serialized payload in bytes.
    pub fn byte_len(&self) -> usize {
        self.0.len()
    }
}

impl From<String> for Document {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Save {
    pub id: SaveId,
    pub unit_id: UnitId,
    pub workspace: Document,
    pub updated_at: DateTime<Utc>,
}

/// Saves recorded for one unit of work. `past` is ordered newest first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SaveSet {
    #[serde(default)]
    pub current: Option<Save>,
    #[serde(default)]
    pub past: Vec<Save>,
}

impl SaveSet {
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.past.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOfWork {
    pub id: UnitId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSaveRequest {
    pub workspace: Document,
}
