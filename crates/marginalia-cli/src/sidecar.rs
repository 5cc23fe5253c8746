//! JSON sidecar metadata store: `<file>.marginalia.json` next to the document.
//!
//! Holds the persisted highlight entities and a glossary the reader uses to
//! answer definition lookups offline.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use marginalia_engine::entity::now_millis;
use marginalia_engine::store::{DefinitionRecord, EntityStore};
use marginalia_engine::{BlockId, HighlightEntity, HighlightKind, MetadataStore, StoreError, TextRange};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarData {
    /// Lower-cased term to definition text
    pub glossary: BTreeMap<String, String>,
    pub entities: Vec<HighlightEntity>,
}

#[derive(Debug)]
pub struct SidecarStore {
    path: PathBuf,
    data: RefCell<SidecarData>,
}

impl SidecarStore {
    pub fn path_for(document: &Path) -> PathBuf {
        let mut name = document.as_os_str().to_owned();
        name.push(".marginalia.json");
        PathBuf::from(name)
    }

    /// Load the sidecar for `document`, or start empty if there is none.
    pub fn open(document: &Path) -> Result<Self> {
        let path = Self::path_for(document);
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            SidecarData::default()
        };
        Ok(Self {
            path,
            data: RefCell::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persisted entities grouped by block.
    pub fn entities_by_block(&self) -> BTreeMap<BlockId, Vec<HighlightEntity>> {
        let mut grouped: BTreeMap<BlockId, Vec<HighlightEntity>> = BTreeMap::new();
        for entity in &self.data.borrow().entities {
            grouped
                .entry(entity.block_id.clone())
                .or_default()
                .push(entity.clone());
        }
        grouped
    }

    /// Replace the persisted entities with the session's and write the file.
    pub fn sync(&self, entities: &EntityStore) -> Result<()> {
        let mut all: Vec<HighlightEntity> = entities
            .block_ids()
            .flat_map(|b| entities.snapshot(b).iter().cloned().collect::<Vec<_>>())
            .filter(|e| e.kind() != HighlightKind::LiveSelection)
            .collect();
        all.sort_by(|a, b| (&a.block_id, a.created_at).cmp(&(&b.block_id, b.created_at)));
        self.data.borrow_mut().entities = all;
        self.write()
    }

    fn write(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&*self.data.borrow())?;
        std::fs::write(&self.path, content).with_context(|| format!("writing {}", self.path.display()))?;
        log::debug!("wrote {}", self.path.display());
        Ok(())
    }
}

#[async_trait(?Send)]
impl MetadataStore for SidecarStore {
    async fn fetch_or_create_definition(
        &self,
        block_id: &BlockId,
        term: &str,
        range: TextRange,
    ) -> Result<DefinitionRecord, StoreError> {
        let data = self.data.borrow();
        // A definition already made for this exact span wins over the glossary
        let existing = data.entities.iter().find_map(|e| match &e.payload {
            marginalia_engine::Payload::Definition {
                term,
                definition_text,
            } if e.block_id == *block_id && e.range() == Some(range) => Some(DefinitionRecord {
                term: term.clone(),
                definition_text: definition_text.clone(),
                created_at: e.created_at,
            }),
            _ => None,
        });
        if let Some(record) = existing {
            return Ok(record);
        }
        let text = data
            .glossary
            .get(&term.trim().to_lowercase())
            .ok_or_else(|| StoreError::NotFound(format!("'{term}' is not in the glossary")))?;
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
        if note.trim().is_empty() {
            return Err(StoreError::Rejected("note is empty".to_string()));
        }
        Ok(HighlightEntity::annotation(block_id.clone(), range, text, note, now_millis()))
    }

    async fn delete_annotation(&self, block_id: &BlockId, range: TextRange) -> Result<(), StoreError> {
        let found = self.data.borrow().entities.iter().any(|e| {
            e.kind() == HighlightKind::Annotation && e.block_id == *block_id && e.range() == Some(range)
        });
        if found {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("no annotation at {range}")))
        }
    }

    async fn create_rabbithole_link(
        &self,
        _block_id: &BlockId,
        _range: TextRange,
        _selected_text: &str,
    ) -> Result<String, StoreError> {
        Ok(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn block() -> BlockId {
        BlockId::new("block-0")
    }

    #[test]
    fn sidecar_sits_next_to_document() {
        let path = SidecarStore::path_for(Path::new("/notes/reading.md"));
        assert_eq!(path, PathBuf::from("/notes/reading.md.marginalia.json"));
    }

    #[test]
    fn sync_then_reopen_restores_entities() {
        let temp_dir = TempDir::new().unwrap();
        let doc = temp_dir.path().join("doc.md");
        let store = SidecarStore::open(&doc).unwrap();

        let mut entities = EntityStore::new();
        let a = HighlightEntity::annotation(block(), TextRange::new(0, 3), "The", "note", 1);
        let n = HighlightEntity::generated_note(block(), "Summary", "Body", 2);
        entities.merge(a.clone());
        entities.merge(n.clone());
        store.sync(&entities).unwrap();

        let reopened = SidecarStore::open(&doc).unwrap();
        assert_eq!(reopened.entities_by_block().get(&block()), Some(&vec![a, n]));
    }

    #[tokio::test]
    async fn unknown_term_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let doc = temp_dir.path().join("doc.md");
        std::fs::write(
            SidecarStore::path_for(&doc),
            r#"{ "glossary": { "quick": "Moving fast." } }"#,
        )
        .unwrap();
        let store = SidecarStore::open(&doc).unwrap();

        let found = store
            .fetch_or_create_definition(&block(), "Quick", TextRange::new(4, 9))
            .await
            .unwrap();
        assert_eq!(found.definition_text, "Moving fast.");

        let missing = store
            .fetch_or_create_definition(&block(), "lazy", TextRange::new(0, 4))
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }
}
