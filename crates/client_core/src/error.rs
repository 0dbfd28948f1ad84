use shared::domain::{SaveId, UnitId};
use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to load workspace document: {0}")]
    LoadFailed(#[from] CodecError),
    #[error("save {} not found for unit {}", save_id.0, unit_id.0)]
    RestoreNotFound { unit_id: UnitId, save_id: SaveId },
    #[error("save store unavailable: {source:#}")]
    StoreUnavailable { source: anyhow::Error },
    #[error("a session for unit {} is still bound; tear it down before binding unit {}", active.0, requested.0)]
    AlreadyBound { active: UnitId, requested: UnitId },
    #[error("no active session")]
    NotActive,
}

impl SessionError {
    pub fn store(source: anyhow::Error) -> Self {
        Self::StoreUnavailable { source }
    }
}
