//! Undo and redo as always-callable operations. An empty stack is a normal
//! state, so stepping past either end is a silent no-op.

use serde::Serialize;

use crate::{error::SessionError, session::Session, workspace::WorkspaceEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UndoAffordance {
    pub can_undo: bool,
    pub can_redo: bool,
}

impl UndoAffordance {
    /// The engine does not announce stack changes, so this is re-read after
    /// every operation and change notification.
    pub fn of(engine: &dyn WorkspaceEngine) -> Self {
        Self {
            can_undo: engine.undo_len() > 0,
            can_redo: engine.redo_len() > 0,
        }
    }
}

pub fn undo(session: &Session) -> Result<UndoAffordance, SessionError> {
    step(session, false)
}

pub fn redo(session: &Session) -> Result<UndoAffordance, SessionError> {
    step(session, true)
}

fn step(session: &Session, redo: bool) -> Result<UndoAffordance, SessionError> {
    session.with_workspace(|engine| {
        let available = if redo {
            engine.redo_len()
        } else {
            engine.undo_len()
        };
        if available > 0 {
            engine.undo(redo);
        }
        UndoAffordance::of(engine)
    })
}
