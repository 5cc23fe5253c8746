//! The external metadata collaborator and the per-block entity sets.
//!
//! [`MetadataStore`] is the boundary to whatever creates and persists
//! annotations, definitions and rabbithole conversations. [`EntityStore`]
//! holds the entity sets this process renders from; a block's set is only
//! ever replaced wholesale, so a render holding an older `Arc` keeps seeing a
//! consistent snapshot.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::entity::{BlockId, EntityId, HighlightEntity, now_millis};
use crate::range::TextRange;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Result of a definition lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionRecord {
    pub term: String,
    pub definition_text: String,
    pub created_at: u64,
}

/// External collaborator that creates and deletes highlight entities.
#[async_trait(?Send)]
pub trait MetadataStore {
    async fn fetch_or_create_definition(
        &self,
        block_id: &BlockId,
        term: &str,
        range: TextRange,
    ) -> Result<DefinitionRecord, StoreError>;

    async fn create_annotation(
        &self,
        block_id: &BlockId,
        text: &str,
        note: &str,
        range: TextRange,
    ) -> Result<HighlightEntity, StoreError>;

    async fn delete_annotation(&self, block_id: &BlockId, range: TextRange)
    -> Result<(), StoreError>;

    /// Returns the id of the new conversation.
    async fn create_rabbithole_link(
        &self,
        block_id: &BlockId,
        range: TextRange,
        selected_text: &str,
    ) -> Result<String, StoreError>;
}

/// Copy-on-write entity sets keyed by block.
#[derive(Debug, Default, Clone)]
pub struct EntityStore {
    blocks: HashMap<BlockId, Arc<Vec<HighlightEntity>>>,
    version: u64,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped on every change to any block.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Snapshot of a block's entities (empty if the block has none).
    pub fn snapshot(&self, block_id: &BlockId) -> Arc<Vec<HighlightEntity>> {
        self.blocks.get(block_id).cloned().unwrap_or_default()
    }

    pub fn block_ids(&self) -> impl Iterator<Item = &BlockId> {
        self.blocks.keys()
    }

    pub fn find(&self, id: EntityId) -> Option<&HighlightEntity> {
        self.blocks
            .values()
            .flat_map(|v| v.iter())
            .find(|e| e.id == id)
    }

    /// Replace a block's set.
    pub fn replace(&mut self, block_id: BlockId, entities: Vec<HighlightEntity>) {
        self.blocks.insert(block_id, Arc::new(entities));
        self.version += 1;
    }

    /// Add or replace (by id) an entity.
    pub fn merge(&mut self, entity: HighlightEntity) {
        let current = self.snapshot(&entity.block_id);
        let mut next: Vec<HighlightEntity> = current
            .iter()
            .filter(|e| e.id != entity.id)
            .cloned()
            .collect();
        let block_id = entity.block_id.clone();
        next.push(entity);
        self.replace(block_id, next);
    }

    /// Remove an entity. Returns whether it was present.
    pub fn remove(&mut self, block_id: &BlockId, id: EntityId) -> bool {
        let current = self.snapshot(block_id);
        if !current.iter().any(|e| e.id == id) {
            return false;
        }
        let next = current.iter().filter(|e| e.id != id).cloned().collect();
        self.replace(block_id.clone(), next);
        true
    }

    /// Drop every entity of a deleted block.
    pub fn remove_block(&mut self, block_id: &BlockId) {
        if self.blocks.remove(block_id).is_some() {
            self.version += 1;
        }
    }
}

/// In-memory collaborator with a definition glossary. Useful for tests and
/// offline hosts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    glossary: HashMap<String, String>,
    annotations: RefCell<Vec<HighlightEntity>>,
    conversations: RefCell<u64>,
    failing: RefCell<HashSet<&'static str>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definition(mut self, term: &str, text: &str) -> Self {
        self.glossary.insert(term.to_lowercase(), text.to_string());
        self
    }

    /// Make the named operation fail until [`MemoryStore::recover`] is called.
    /// Names: `"definition"`, `"create_annotation"`, `"delete_annotation"`,
    /// `"rabbithole"`.
    pub fn fail(&self, op: &'static str) {
        self.failing.borrow_mut().insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.failing.borrow_mut().remove(op);
    }

    pub fn annotations(&self) -> Vec<HighlightEntity> {
        self.annotations.borrow().clone()
    }

    fn check(&self, op: &'static str) -> Result<(), StoreError> {
        if self.failing.borrow().contains(op) {
            return Err(StoreError::Unavailable(format!("{op} is failing")));
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl MetadataStore for MemoryStore {
    async fn fetch_or_create_definition(
        &self,
        _block_id: &BlockId,
        term: &str,
        _range: TextRange,
    ) -> Result<DefinitionRecord, StoreError> {
        self.check("definition")?;
        let text = self
            .glossary
            .get(&term.trim().to_lowercase())
            .ok_or_else(|| StoreError::NotFound(format!("no definition for '{term}'")))?;
        Ok(DefinitionRecord {
            term: term.to_string(),
            definition_text: text.clone(),
            created_at: now_millis(),
        })
    }

    async fn create_annotation(
        &self,
        block_id: &BlockId,
        text: &str,
        note: &str,
        range: TextRange,
    ) -> Result<HighlightEntity, StoreError> {
        self.check("create_annotation")?;
        let entity = HighlightEntity::annotation(block_id.clone(), range, text, note, now_millis());
        self.annotations.borrow_mut().push(entity.clone());
        Ok(entity)
    }

    async fn delete_annotation(&self, block_id: &BlockId, range: TextRange) -> Result<(), StoreError> {
        self.check("delete_annotation")?;
        let mut annotations = self.annotations.borrow_mut();
        let before = annotations.len();
        annotations.retain(|a| !(a.block_id == *block_id && a.range() == Some(range)));
        if annotations.len() == before {
            return Err(StoreError::NotFound(format!("no annotation at {range}")));
        }
        Ok(())
    }

    async fn create_rabbithole_link(
        &self,
        _block_id: &BlockId,
        _range: TextRange,
        _selected_text: &str,
    ) -> Result<String, StoreError> {
        self.check("rabbithole")?;
        let mut n = self.conversations.borrow_mut();
        *n += 1;
        Ok(format!("conversation-{n}"))
    }
}
