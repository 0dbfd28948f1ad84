//! Maps a version selection onto the document a session should load.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use shared::{
    domain::{EditorRole, SaveId, UnitId},
    protocol::{Document, SaveSet},
};

use crate::error::SessionError;

/// Wire value the version-history list uses for "original template".
pub const TEMPLATE_SENTINEL: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionToken {
    Template,
    Save(SaveId),
}

impl VersionToken {
    pub fn from_wire(raw: i64) -> Self {
        if raw == TEMPLATE_SENTINEL {
            Self::Template
        } else {
            Self::Save(SaveId(raw))
        }
    }
}

impl FromStr for VersionToken {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("template") {
            return Ok(Self::Template);
        }
        trimmed
            .parse::<i64>()
            .map(Self::from_wire)
            .map_err(|_| format!("expected a save id or \"template\", got {trimmed:?}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSource {
    Template,
    Current(SaveId),
    Past(SaveId),
    SandboxCache,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersion {
    pub document: Document,
    /// Timestamp "last saved" should show once this version is loaded.
    pub last_saved: Option<DateTime<Utc>>,
    pub source: VersionSource,
}

pub fn resolve(
    token: VersionToken,
    saves: &SaveSet,
    template: Option<&Document>,
    unit_id: UnitId,
) -> Result<ResolvedVersion, SessionError> {
    let save_id = match token {
        VersionToken::Template => {
            return Ok(ResolvedVersion {
                document: template.cloned().unwrap_or_default(),
                last_saved: None,
                source: VersionSource::Template,
            })
        }
        VersionToken::Save(save_id) => save_id,
    };

    if let Some(current) = saves.current.as_ref().filter(|save| save.id == save_id) {
        return Ok(ResolvedVersion {
            document: current.workspace.clone(),
            last_saved: Some(current.updated_at),
            source: VersionSource::Current(save_id),
        });
    }

    saves
        .past
        .iter()
        .find(|save| save.id == save_id)
        .map(|save| ResolvedVersion {
            document: save.workspace.clone(),
            last_saved: Some(save.updated_at),
            source: VersionSource::Past(save_id),
        })
        .ok_or(SessionError::RestoreNotFound { unit_id, save_id })
}

/// Document a freshly mounted session starts from: the current save for
/// roles with history, the cached canvas for a sandbox, then the template.
pub fn initial_version(
    role: EditorRole,
    saves: &SaveSet,
    sandbox: Option<Document>,
    template: Option<&Document>,
) -> ResolvedVersion {
    if role.has_save_history() {
        if let Some(current) = &saves.current {
            return ResolvedVersion {
                document: current.workspace.clone(),
                last_saved: Some(current.updated_at),
                source: VersionSource::Current(current.id),
            };
        }
    }
    if role.mirrors_to_sandbox() {
        if let Some(document) = sandbox.filter(|doc| !doc.is_blank()) {
            return ResolvedVersion {
                document,
                last_saved: None,
                source: VersionSource::SandboxCache,
            };
        }
    }
    match template {
        Some(document) => ResolvedVersion {
            document: document.clone(),
            last_saved: None,
            source: VersionSource::Template,
        },
        None => ResolvedVersion {
            document: Document::empty(),
            last_saved: None,
            source: VersionSource::Empty,
        },
    }
}

#[cfg(test)]
#[path = "tests/version_tests.rs"]
mod tests;
