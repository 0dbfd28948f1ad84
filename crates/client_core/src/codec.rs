//! Conversion between a live block tree and its portable [`Document`] form.
//!
//! Documents are JSON trees of the shape
//! `{"version":1,"blocks":[{"id":..,"kind":..,"fields":{..},"children":[..]}]}`.
//! Decoding validates the whole tree before returning, so a caller never
//! sees a partially applied document.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use shared::protocol::Document;
use thiserror::Error;
use tracing::error;

pub const DOCUMENT_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub children: Vec<Block>,
}

impl Block {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            fields: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_child(mut self, child: Block) -> Self {
        self.children.push(child);
        self
    }
}

/// Contents of a workspace: the top-level block stacks in canvas order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkspaceState {
    pub blocks: Vec<Block>,
}

impl WorkspaceState {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of blocks in the whole tree, nested ones included.
    pub fn block_count(&self) -> usize {
        fn count(blocks: &[Block]) -> usize {
            blocks.iter().map(|b| 1 + count(&b.children)).sum()
        }
        count(&self.blocks)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed workspace document: {0}")]
    MalformedDocument(String),
}

#[derive(Deserialize)]
struct DocumentTree {
    version: u64,
    #[serde(default)]
    blocks: Vec<Block>,
}

#[derive(Serialize)]
struct DocumentTreeRef<'a> {
    version: u64,
    blocks: &'a [Block],
}

pub fn encode(state: &WorkspaceState) -> Document {
    let tree = DocumentTreeRef {
        version: DOCUMENT_VERSION,
        blocks: &state.blocks,
    };
    // String-keyed maps of strings always serialize.
    match serde_json::to_string(&tree) {
        Ok(text) => Document::new(text),
        Err(err) => {
            error!("codec: encode failed blocks={} err={err}", state.block_count());
            Document::new(String::new())
        }
    }
}

/// A blank document decodes to an empty workspace.
pub fn decode(document: &Document) -> Result<WorkspaceState, CodecError> {
    if document.is_blank() {
        return Ok(WorkspaceState::default());
    }

    let tree: DocumentTree = serde_json::from_str(document.as_str())
        .map_err(|err| CodecError::MalformedDocument(err.to_string()))?;
    if tree.version != DOCUMENT_VERSION {
        return Err(CodecError::MalformedDocument(format!(
            "unsupported document version {}",
            tree.version
        )));
    }

    let mut seen = HashSet::new();
    validate_blocks(&tree.blocks, &mut seen)?;
    Ok(WorkspaceState {
        blocks: tree.blocks,
    })
}

/// Checks `blocks` and everything nested under them: ids and kinds must be
/// non-blank, and no id may already be in `seen`. Every visited id is added
/// to `seen`.
pub(crate) fn validate_blocks<'a>(
    blocks: &'a [Block],
    seen: &mut HashSet<&'a str>,
) -> Result<(), CodecError> {
    for block in blocks {
        if block.id.trim().is_empty() {
            return Err(CodecError::MalformedDocument("block with empty id".into()));
        }
        if block.kind.trim().is_empty() {
            return Err(CodecError::MalformedDocument(format!(
                "block {} has no kind",
                block.id
            )));
        }
        if !seen.insert(block.id.as_str()) {
            return Err(CodecError::MalformedDocument(format!(
                "duplicate block id {}",
                block.id
            )));
        }
        validate_blocks(&block.children, seen)?;
    }
    Ok(())
}

pub(crate) fn collect_ids<'a>(blocks: &'a [Block], ids: &mut HashSet<&'a str>) {
    for block in blocks {
        ids.insert(block.id.as_str());
        collect_ids(&block.children, ids);
    }
}

#[cfg(test)]
#[path = "tests/codec_tests.rs"]
mod tests;
