//! Contract of the block editing engine a session drives, plus an in-memory
//! engine used by headless hosts and tests.

use std::{
    collections::HashSet,
    slice,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::broadcast;

use crate::codec::{collect_ids, validate_blocks, Block, WorkspaceState};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceChange {
    BlockCreated { block_id: String },
    BlockDeleted { block_id: String },
    FieldChanged { block_id: String, field: String },
}

/// Editing engine bound to one canvas. The session only sequences calls
/// into it; graph editing itself happens on the host side.
pub trait WorkspaceEngine: Send {
    fn snapshot(&self) -> WorkspaceState;
    fn clear(&mut self);
    /// Replaces the contents. Does not record an undo entry.
    fn load(&mut self, state: WorkspaceState);
    fn dispose(&mut self);
    fn is_disposed(&self) -> bool;
    /// Steps back through history, or forward when `redo` is set. Callers
    /// check the stack lengths first.
    fn undo(&mut self, redo: bool);
    fn clear_undo(&mut self);
    fn undo_len(&self) -> usize;
    fn redo_len(&self) -> usize;
    fn set_events_enabled(&mut self, enabled: bool);
    fn subscribe_changes(&self) -> broadcast::Receiver<WorkspaceChange>;
}

pub trait WorkspaceFactory: Send + Sync {
    fn create(&self) -> Box<dyn WorkspaceEngine>;
}

#[derive(Debug, Clone)]
enum Edit {
    Added { path: Vec<usize>, block: Block },
    Removed { path: Vec<usize>, block: Block },
    FieldSet {
        block_id: String,
        field: String,
        old: Option<String>,
        new: String,
    },
}

#[derive(Default)]
struct MemoryWorkspaceState {
    blocks: Vec<Block>,
    undo_stack: Vec<Edit>,
    redo_stack: Vec<Edit>,
    events_enabled: bool,
    disposed: bool,
}

/// Shared handle to an in-memory block canvas. Clones refer to the same
/// canvas, so a host can keep one handle for editing while the session owns
/// another.
#[derive(Clone)]
pub struct MemoryWorkspace {
    inner: Arc<Mutex<MemoryWorkspaceState>>,
    changes: broadcast::Sender<WorkspaceChange>,
}

impl Default for MemoryWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(MemoryWorkspaceState {
                events_enabled: true,
                ..MemoryWorkspaceState::default()
            })),
            changes,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryWorkspaceState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, enabled: bool, change: WorkspaceChange) {
        if enabled {
            let _ = self.changes.send(change);
        }
    }

    /// Appends `block` under `parent_id`, or as a new top-level stack.
    /// Returns false when the parent is unknown or the canvas is disposed.
    /// Also returns false when the subtree holds a blank id or kind, or an
    /// id that is already on the canvas or repeated within the subtree.
    pub fn add_block(&self, parent_id: Option<&str>, block: Block) -> bool {
        let (enabled, block_id) = {
            let mut state = self.state();
            if state.disposed {
                return false;
            }
            let accepted = {
                let mut ids = HashSet::new();
                collect_ids(&state.blocks, &mut ids);
                validate_blocks(slice::from_ref(&block), &mut ids).is_ok()
            };
            if !accepted {
                return false;
            }
            let parent_path = match parent_id {
                Some(parent_id) => match find_path(&state.blocks, parent_id) {
                    Some(path) => path,
                    None => return false,
                },
                None => Vec::new(),
            };
            let Some(siblings) = children_at_mut(&mut state.blocks, &parent_path) else {
                return false;
            };
            let mut path = parent_path;
            path.push(siblings.len());
            siblings.push(block.clone());

            let block_id = block.id.clone();
            record(&mut state, Edit::Added { path, block });
            (state.events_enabled, block_id)
        };
        self.emit(enabled, WorkspaceChange::BlockCreated { block_id });
        true
    }

    /// Removes a block together with everything nested under it.
    pub fn remove_block(&self, block_id: &str) -> bool {
        let enabled = {
            let mut state = self.state();
            if state.disposed {
                return false;
            }
            let Some(path) = find_path(&state.blocks, block_id) else {
                return false;
            };
            let Some(block) = remove_at(&mut state.blocks, &path) else {
                return false;
            };
            record(&mut state, Edit::Removed { path, block });
            state.events_enabled
        };
        self.emit(
            enabled,
            WorkspaceChange::BlockDeleted {
                block_id: block_id.to_string(),
            },
        );
        true
    }

    pub fn set_field(&self, block_id: &str, field: &str, value: impl Into<String>) -> bool {
        let value = value.into();
        let enabled = {
            let mut state = self.state();
            if state.disposed {
                return false;
            }
            let Some(block) = find_block_mut(&mut state.blocks, block_id) else {
                return false;
            };
            let old = block.fields.insert(field.to_string(), value.clone());
            if old.as_deref() == Some(value.as_str()) {
                return true;
            }
            record(
                &mut state,
                Edit::FieldSet {
                    block_id: block_id.to_string(),
                    field: field.to_string(),
                    old,
                    new: value,
                },
            );
            state.events_enabled
        };
        self.emit(
            enabled,
            WorkspaceChange::FieldChanged {
                block_id: block_id.to_string(),
                field: field.to_string(),
            },
        );
        true
    }
}

fn record(state: &mut MemoryWorkspaceState, edit: Edit) {
    state.undo_stack.push(edit);
    state.redo_stack.clear();
}

impl WorkspaceEngine for MemoryWorkspace {
    fn snapshot(&self) -> WorkspaceState {
        WorkspaceState {
            blocks: self.state().blocks.clone(),
        }
    }

    fn clear(&mut self) {
        self.state().blocks.clear();
    }

    fn load(&mut self, loaded: WorkspaceState) {
        let mut state = self.state();
        if !state.disposed {
            state.blocks = loaded.blocks;
        }
    }

    fn dispose(&mut self) {
        let mut state = self.state();
        state.disposed = true;
        state.blocks.clear();
        state.undo_stack.clear();
        state.redo_stack.clear();
    }

    fn is_disposed(&self) -> bool {
        self.state().disposed
    }

    fn undo(&mut self, redo: bool) {
        let (enabled, change) = {
            let mut state = self.state();
            let popped = if redo {
                state.redo_stack.pop()
            } else {
                state.undo_stack.pop()
            };
            let Some(edit) = popped else {
                return;
            };
            let change = if redo {
                apply_forward(&mut state.blocks, &edit)
            } else {
                apply_inverse(&mut state.blocks, &edit)
            };
            if redo {
                state.undo_stack.push(edit);
            } else {
                state.redo_stack.push(edit);
            }
            (state.events_enabled, change)
        };
        if let Some(change) = change {
            self.emit(enabled, change);
        }
    }

    fn clear_undo(&mut self) {
        let mut state = self.state();
        state.undo_stack.clear();
        state.redo_stack.clear();
    }

    fn undo_len(&self) -> usize {
        self.state().undo_stack.len()
    }

    fn redo_len(&self) -> usize {
        self.state().redo_stack.len()
    }

    fn set_events_enabled(&mut self, enabled: bool) {
        self.state().events_enabled = enabled;
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<WorkspaceChange> {
        self.changes.subscribe()
    }
}

fn apply_forward(blocks: &mut Vec<Block>, edit: &Edit) -> Option<WorkspaceChange> {
    match edit {
        Edit::Added { path, block } => {
            insert_at(blocks, path, block.clone())?;
            Some(WorkspaceChange::BlockCreated {
                block_id: block.id.clone(),
            })
        }
        Edit::Removed { path, block } => {
            remove_at(blocks, path)?;
            Some(WorkspaceChange::BlockDeleted {
                block_id: block.id.clone(),
            })
        }
        Edit::FieldSet {
            block_id,
            field,
            new,
            ..
        } => {
            find_block_mut(blocks, block_id)?
                .fields
                .insert(field.clone(), new.clone());
            Some(WorkspaceChange::FieldChanged {
                block_id: block_id.clone(),
                field: field.clone(),
            })
        }
    }
}

fn apply_inverse(blocks: &mut Vec<Block>, edit: &Edit) -> Option<WorkspaceChange> {
    match edit {
        Edit::Added { path, block } => {
            remove_at(blocks, path)?;
            Some(WorkspaceChange::BlockDeleted {
                block_id: block.id.clone(),
            })
        }
        Edit::Removed { path, block } => {
            insert_at(blocks, path, block.clone())?;
            Some(WorkspaceChange::BlockCreated {
                block_id: block.id.clone(),
            })
        }
        Edit::FieldSet {
            block_id,
            field,
            old,
            ..
        } => {
            let target = find_block_mut(blocks, block_id)?;
            match old {
                Some(old) => target.fields.insert(field.clone(), old.clone()),
                None => target.fields.remove(field),
            };
            Some(WorkspaceChange::FieldChanged {
                block_id: block_id.clone(),
                field: field.clone(),
            })
        }
    }
}

fn find_path(blocks: &[Block], block_id: &str) -> Option<Vec<usize>> {
    for (index, block) in blocks.iter().enumerate() {
        if block.id == block_id {
            return Some(vec![index]);
        }
        if let Some(mut rest) = find_path(&block.children, block_id) {
            rest.insert(0, index);
            return Some(rest);
        }
    }
    None
}

fn find_block_mut<'a>(blocks: &'a mut [Block], block_id: &str) -> Option<&'a mut Block> {
    for block in blocks.iter_mut() {
        if block.id == block_id {
            return Some(block);
        }
        if let Some(found) = find_block_mut(&mut block.children, block_id) {
            return Some(found);
        }
    }
    None
}

/// Sibling list addressed by `path`: the root list for an empty path,
/// otherwise the children of the block at `path`.
fn children_at_mut<'a>(blocks: &'a mut Vec<Block>, path: &[usize]) -> Option<&'a mut Vec<Block>> {
    let mut current = blocks;
    for &index in path {
        current = &mut current.get_mut(index)?.children;
    }
    Some(current)
}

fn insert_at(blocks: &mut Vec<Block>, path: &[usize], block: Block) -> Option<()> {
    let (&index, parent) = path.split_last()?;
    let siblings = children_at_mut(blocks, parent)?;
    if index > siblings.len() {
        return None;
    }
    siblings.insert(index, block);
    Some(())
}

fn remove_at(blocks: &mut Vec<Block>, path: &[usize]) -> Option<Block> {
    let (&index, parent) = path.split_last()?;
    let siblings = children_at_mut(blocks, parent)?;
    if index >= siblings.len() {
        return None;
    }
    Some(siblings.remove(index))
}

/// Creates [`MemoryWorkspace`] canvases and keeps a handle to each so the
/// host can edit the canvas a session owns.
#[derive(Default)]
pub struct MemoryWorkspaceFactory {
    created: Mutex<Vec<MemoryWorkspace>>,
}

impl MemoryWorkspaceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_created(&self) -> Option<MemoryWorkspace> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl WorkspaceFactory for MemoryWorkspaceFactory {
    fn create(&self) -> Box<dyn WorkspaceEngine> {
        let workspace = MemoryWorkspace::new();
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(workspace.clone());
        Box::new(workspace)
    }
}

#[cfg(test)]
#[path = "tests/workspace_tests.rs"]
mod tests;
