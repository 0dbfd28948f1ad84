use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UnitId);
id_newtype!(SaveId);

/// Editing context of a mounted canvas. Decides which persistence behaviors
/// a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditorRole {
    StudentEditor,
    Sandbox,
    Viewer,
}

impl EditorRole {
    pub fn has_save_history(self) -> bool {
        matches!(self, Self::StudentEditor)
    }

    pub fn autosaves(self) -> bool {
        matches!(self, Self::StudentEditor)
    }

    pub fn mirrors_to_sandbox(self) -> bool {
        matches!(self, Self::Sandbox)
    }

    pub fn shows_undo_controls(self) -> bool {
        matches!(self, Self::StudentEditor | Self::Sandbox)
    }
}

impl std::str::FromStr for EditorRole {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "student_editor" | "student" => Ok(Self::StudentEditor),
            "sandbox" => Ok(Self::Sandbox),
            "viewer" => Ok(Self::Viewer),
            other => Err(format!("unknown editor role: {other}")),
        }
    }
}
