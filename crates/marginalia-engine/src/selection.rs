//! Selection Tracker: turns native selection changes inside a block's
//! container into debounced character ranges.
//!
//! The native selection is owned by the platform; the tracker only reads it.
//! Points are converted with the same [`LeafIndex`] walk the Offset Resolver
//! uses, so a range produced here resolves back to the text that was
//! selected.

use std::time::{Duration, Instant};

use crate::content::{ContentTree, NodeId, NodeKind};
use crate::entity::BlockId;
use crate::geometry::Rect;
use crate::layout::{LeafPoint, TextSurface};
use crate::offsets::{LeafIndex, resolve_range_local};
use crate::range::TextRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionConfig {
    /// How long the selection must stay unchanged before it is reported.
    pub debounce: Duration,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(150),
        }
    }
}

/// One end of a native selection.
///
/// `offset` follows DOM conventions: characters into a text node, or a child
/// index into an element. `block_index` is the block's position in the
/// document and tells the tracker which side of its container an outside point
/// lies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionPoint {
    pub block_id: BlockId,
    pub block_index: usize,
    pub node: NodeId,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSelection {
    /// Where the drag started
    pub anchor: SelectionPoint,
    /// Where the drag currently is
    pub focus: SelectionPoint,
}

impl NativeSelection {
    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }
}

/// A selection converted into the block's offset space.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionSnapshot {
    pub block_id: BlockId,
    pub text: String,
    pub range: TextRange,
    /// Bounding box of the selection, container-relative; where the tooltip
    /// anchors.
    pub anchor_rect: Rect,
}

/// What the tracker reports once a selection has settled.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionSignal {
    Settled(SelectionSnapshot),
    Cleared { block_id: BlockId },
}

#[derive(Debug, Clone)]
struct PendingChange {
    deadline: Instant,
    selection: Option<NativeSelection>,
}

#[derive(Debug, Clone)]
pub struct SelectionTracker {
    block_id: BlockId,
    block_index: usize,
    config: SelectionConfig,
    pending: Option<PendingChange>,
    last_emitted: Option<TextRange>,
    /// The drag moved off `last_emitted` since it was reported
    moved_off: bool,
}

impl SelectionTracker {
    pub fn new(block_id: BlockId, block_index: usize, config: SelectionConfig) -> Self {
        Self {
            block_id,
            block_index,
            config,
            pending: None,
            last_emitted: None,
            moved_off: false,
        }
    }

    pub fn block_id(&self) -> &BlockId {
        &self.block_id
    }

    /// When the pending change will settle, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// Record a native selection change. Restarts the debounce window and
    /// returns the undebounced selection for live display.
    pub fn observe(
        &mut self,
        now: Instant,
        native: Option<&NativeSelection>,
        surface: &dyn TextSurface,
    ) -> Option<SelectionSnapshot> {
        self.pending = Some(PendingChange {
            deadline: now + self.config.debounce,
            selection: native.cloned(),
        });
        let live = native.and_then(|n| self.snapshot(n, surface));
        // Settling back on the reported range after leaving it is reported again
        if live.as_ref().map(|s| s.range) != self.last_emitted {
            self.moved_off = true;
        }
        live
    }

    /// Report the selection once it has been stable for the debounce window.
    /// Repeats of the last report are suppressed.
    pub fn poll(&mut self, now: Instant, surface: &dyn TextSurface) -> Option<SelectionSignal> {
        if self.pending.as_ref().is_none_or(|p| now < p.deadline) {
            return None;
        }
        let pending = self.pending.take()?;
        if !surface.is_mounted() {
            log::debug!("block {}: dropping selection for unmounted container", self.block_id);
            return None;
        }

        let snapshot = pending
            .selection
            .as_ref()
            .and_then(|n| self.snapshot(n, surface));
        match snapshot {
            Some(s) if self.last_emitted == Some(s.range) && !self.moved_off => None,
            Some(s) => {
                self.last_emitted = Some(s.range);
                self.moved_off = false;
                Some(SelectionSignal::Settled(s))
            }
            None if self.last_emitted.is_some() => {
                self.last_emitted = None;
                self.moved_off = false;
                Some(SelectionSignal::Cleared {
                    block_id: self.block_id.clone(),
                })
            }
            None => None,
        }
    }

    /// Forget any pending change and the last report.
    pub fn reset(&mut self) {
        self.pending = None;
        self.last_emitted = None;
        self.moved_off = false;
    }

    /// Convert a native selection to a range in this block. `None` when the
    /// anchor lies outside the container, a point no longer exists, or the
    /// selection is empty after truncation.
    pub fn to_range(&self, native: &NativeSelection, content: &ContentTree) -> Option<TextRange> {
        if native.anchor.block_id != self.block_id {
            return None;
        }
        let index = LeafIndex::build(content);
        let a = self.point_offset(&native.anchor, &index, content)?;
        let f = self.point_offset(&native.focus, &index, content)?;
        let range = TextRange::new(a.min(f), a.max(f));
        (!range.is_empty()).then_some(range)
    }

    fn snapshot(&self, native: &NativeSelection, surface: &dyn TextSurface) -> Option<SelectionSnapshot> {
        let content = surface.content();
        let range = self.to_range(native, content)?;
        let anchor_rect = resolve_range_local(surface, range)
            .and_then(|rects| rects.into_iter().reduce(|a, b| a.union(&b)))
            .unwrap_or(Rect::ZERO);
        Some(SelectionSnapshot {
            block_id: self.block_id.clone(),
            text: range.slice(&content.text()),
            range,
            anchor_rect,
        })
    }

    fn point_offset(
        &self,
        point: &SelectionPoint,
        index: &LeafIndex,
        content: &ContentTree,
    ) -> Option<usize> {
        if point.block_id != self.block_id {
            // Only the part inside this container counts
            return Some(if point.block_index > self.block_index {
                index.total_len()
            } else {
                0
            });
        }
        let node = content.node(point.node)?;
        match &node.kind {
            NodeKind::Text(_) => index.offset_of(LeafPoint::new(point.node, point.offset)),
            NodeKind::Element(_) => match node.children.get(point.offset) {
                Some(child) => index.offset_before(content, *child),
                None => index
                    .offset_before(content, point.node)
                    .map(|o| o + content.text_len_of(point.node)),
            },
            // Atoms carry no text: snap to the boundary before them
            NodeKind::Atom(_) => index.offset_before(content, point.node),
        }
    }
}
