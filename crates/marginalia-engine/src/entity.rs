//! Highlight entities: the records that anchor annotations, definitions,
//! rabbithole links, generated notes and the live selection to a block.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::range::TextRange;

/// Stable identifier of a highlight entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell entities apart in logs
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Identifier of a rendered block, assigned by the content pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub String);

impl BlockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The closed set of highlight kinds.
///
/// Declaration order is the base stacking order, lowest first. The live
/// selection must always paint above committed highlights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HighlightKind {
    Annotation,
    Definition,
    RabbitholeLink,
    GeneratedNote,
    LiveSelection,
}

impl HighlightKind {
    /// Kinds that take part in offset geometry, in stacking order.
    pub const ANCHORED: [HighlightKind; 4] = [
        HighlightKind::Annotation,
        HighlightKind::Definition,
        HighlightKind::RabbitholeLink,
        HighlightKind::LiveSelection,
    ];

    /// Base z-order. `None` for kinds that never render geometry.
    pub fn base_z(self) -> Option<i32> {
        match self {
            HighlightKind::Annotation => Some(100),
            HighlightKind::Definition => Some(200),
            HighlightKind::RabbitholeLink => Some(300),
            HighlightKind::LiveSelection => Some(400),
            HighlightKind::GeneratedNote => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            HighlightKind::Annotation => "annotation",
            HighlightKind::Definition => "definition",
            HighlightKind::RabbitholeLink => "rabbithole",
            HighlightKind::GeneratedNote => "note",
            HighlightKind::LiveSelection => "selection",
        }
    }
}

/// Where an entity is anchored within its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Anchor {
    /// A character range in the block's text.
    Text(TextRange),
    /// The whole block. Serialized as the sentinel range `-1..-1`.
    Block,
}

/// Kind-specific payload of a highlight entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Payload {
    Annotation {
        /// The highlighted text at the time the annotation was made
        text: String,
        note: String,
    },
    Definition {
        term: String,
        #[serde(rename = "definitionText")]
        definition_text: String,
    },
    RabbitholeLink {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        #[serde(rename = "selectedText")]
        selected_text: String,
    },
    GeneratedNote {
        title: String,
        body: String,
    },
    /// Ephemeral; refuses to serialize.
    #[serde(skip)]
    LiveSelection { text: String },
}

impl Payload {
    pub fn kind(&self) -> HighlightKind {
        match self {
            Payload::Annotation { .. } => HighlightKind::Annotation,
            Payload::Definition { .. } => HighlightKind::Definition,
            Payload::RabbitholeLink { .. } => HighlightKind::RabbitholeLink,
            Payload::GeneratedNote { .. } => HighlightKind::GeneratedNote,
            Payload::LiveSelection { .. } => HighlightKind::LiveSelection,
        }
    }
}

/// A persisted or ephemeral record anchoring a user or AI artifact to a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EntityRecord", into = "EntityRecord")]
pub struct HighlightEntity {
    pub id: EntityId,
    pub block_id: BlockId,
    pub anchor: Anchor,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    pub payload: Payload,
}

impl HighlightEntity {
    pub fn new(block_id: BlockId, anchor: Anchor, payload: Payload, created_at: u64) -> Self {
        Self {
            id: EntityId::new(),
            block_id,
            anchor,
            created_at,
            payload,
        }
    }

    pub fn annotation(
        block_id: BlockId,
        range: TextRange,
        text: impl Into<String>,
        note: impl Into<String>,
        created_at: u64,
    ) -> Self {
        let payload = Payload::Annotation {
            text: text.into(),
            note: note.into(),
        };
        Self::new(block_id, Anchor::Text(range), payload, created_at)
    }

    pub fn definition(
        block_id: BlockId,
        range: TextRange,
        term: impl Into<String>,
        definition_text: impl Into<String>,
        created_at: u64,
    ) -> Self {
        let payload = Payload::Definition {
            term: term.into(),
            definition_text: definition_text.into(),
        };
        Self::new(block_id, Anchor::Text(range), payload, created_at)
    }

    pub fn rabbithole(
        block_id: BlockId,
        range: TextRange,
        conversation_id: impl Into<String>,
        selected_text: impl Into<String>,
        created_at: u64,
    ) -> Self {
        let payload = Payload::RabbitholeLink {
            conversation_id: conversation_id.into(),
            selected_text: selected_text.into(),
        };
        Self::new(block_id, Anchor::Text(range), payload, created_at)
    }

    pub fn generated_note(
        block_id: BlockId,
        title: impl Into<String>,
        body: impl Into<String>,
        created_at: u64,
    ) -> Self {
        let payload = Payload::GeneratedNote {
            title: title.into(),
            body: body.into(),
        };
        Self::new(block_id, Anchor::Block, payload, created_at)
    }

    pub fn live_selection(block_id: BlockId, range: TextRange, text: impl Into<String>) -> Self {
        let payload = Payload::LiveSelection { text: text.into() };
        Self::new(block_id, Anchor::Text(range), payload, now_millis())
    }

    pub fn kind(&self) -> HighlightKind {
        self.payload.kind()
    }

    /// The text range, or `None` for block-anchored entities.
    pub fn range(&self) -> Option<TextRange> {
        match self.anchor {
            Anchor::Text(range) => Some(range),
            Anchor::Block => None,
        }
    }

    /// Whether this entity takes part in offset geometry and arbitration.
    pub fn is_anchored(&self) -> bool {
        matches!(self.anchor, Anchor::Text(_)) && self.kind() != HighlightKind::GeneratedNote
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Wire shape of an entity: flat record with signed offsets so that the
/// block-anchored sentinel survives transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityRecord {
    id: EntityId,
    block_id: BlockId,
    start_offset: i64,
    end_offset: i64,
    created_at: u64,
    #[serde(flatten)]
    payload: Payload,
}

impl From<HighlightEntity> for EntityRecord {
    fn from(e: HighlightEntity) -> Self {
        let (start_offset, end_offset) = match e.anchor {
            Anchor::Text(r) => (r.start as i64, r.end as i64),
            Anchor::Block => (-1, -1),
        };
        Self {
            id: e.id,
            block_id: e.block_id,
            start_offset,
            end_offset,
            created_at: e.created_at,
            payload: e.payload,
        }
    }
}

impl TryFrom<EntityRecord> for HighlightEntity {
    type Error = String;

    fn try_from(r: EntityRecord) -> Result<Self, Self::Error> {
        let anchor = match (r.start_offset, r.end_offset) {
            (-1, -1) => Anchor::Block,
            (start, end) if start >= 0 && end >= 0 => {
                // Empty or reversed ranges are kept; the renderer drops them
                Anchor::Text(TextRange::new(start as usize, end as usize))
            }
            (start, end) => return Err(format!("negative offsets {start}..{end}")),
        };
        if anchor == Anchor::Block && r.payload.kind() != HighlightKind::GeneratedNote {
            return Err(format!(
                "{} entity {} cannot be anchored to the whole block",
                r.payload.kind().label(),
                r.id
            ));
        }
        Ok(Self {
            id: r.id,
            block_id: r.block_id,
            anchor,
            created_at: r.created_at,
            payload: r.payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn block() -> BlockId {
        BlockId::new("b1")
    }

    #[test]
    fn generated_note_uses_sentinel_range_on_the_wire() {
        let note = HighlightEntity::generated_note(block(), "Summary", "Body", 7);
        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["startOffset"], -1);
        assert_eq!(json["endOffset"], -1);
        assert_eq!(json["kind"], "generatedNote");

        let back: HighlightEntity = serde_json::from_value(json).unwrap();
        assert_eq!(back.anchor, Anchor::Block);
        assert!(!back.is_anchored());
    }

    #[test]
    fn annotation_record_shape() {
        let a = HighlightEntity::annotation(block(), TextRange::new(10, 19), "brown fox", "hm", 42);
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["startOffset"], 10);
        assert_eq!(json["endOffset"], 19);
        assert_eq!(json["blockId"], "b1");
        assert_eq!(json["note"], "hm");
        assert_eq!(json["createdAt"], 42);
    }

    #[test]
    fn live_selection_is_never_serialized() {
        let s = HighlightEntity::live_selection(block(), TextRange::new(0, 3), "The");
        assert!(serde_json::to_string(&s).is_err());
    }

    #[test]
    fn sentinel_rejected_for_text_kinds() {
        let json = serde_json::json!({
            "id": Uuid::nil(),
            "blockId": "b1",
            "startOffset": -1,
            "endOffset": -1,
            "createdAt": 0,
            "kind": "definition",
            "term": "x",
            "definitionText": "y",
        });
        assert!(serde_json::from_value::<HighlightEntity>(json).is_err());
    }

    #[test]
    fn kinds_stack_in_declaration_order() {
        let zs: Vec<i32> = HighlightKind::ANCHORED
            .iter()
            .filter_map(|k| k.base_z())
            .collect();
        assert!(zs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(HighlightKind::GeneratedNote.base_z(), None);
    }
}
