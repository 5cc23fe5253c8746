//! Offset Resolver: maps character ranges to screen rectangles.
//!
//! Offsets are measured against the concatenation of a block's text leaves in
//! document order. [`LeafIndex`] is the single implementation of that walk and
//! is shared with the selection tracker so both agree on offset semantics.

use crate::content::{ContentTree, NodeId, NodeKind};
use crate::geometry::Rect;
use crate::layout::{LeafPoint, TextSurface};
use crate::range::TextRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LeafSpan {
    node: NodeId,
    start: usize,
    len: usize,
}

impl LeafSpan {
    fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Cumulative character offsets of every text leaf in a content tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafIndex {
    spans: Vec<LeafSpan>,
    total: usize,
}

impl LeafIndex {
    pub fn build(content: &ContentTree) -> Self {
        let mut spans = Vec::new();
        let mut running = 0;
        for (node, text) in content.text_leaves() {
            let len = text.chars().count();
            spans.push(LeafSpan {
                node,
                start: running,
                len,
            });
            running += len;
        }
        Self {
            spans,
            total: running,
        }
    }

    /// Total characters across all text leaves.
    pub fn total_len(&self) -> usize {
        self.total
    }

    /// Leaf position of a range start: the first leaf whose cumulative end
    /// exceeds `offset`.
    pub fn locate_start(&self, offset: usize) -> Option<LeafPoint> {
        self.spans
            .iter()
            .find(|s| s.end() > offset)
            .map(|s| LeafPoint::new(s.node, offset - s.start))
    }

    /// Leaf position of a range end. An end that falls exactly on a leaf
    /// boundary stays at the end of the earlier leaf.
    pub fn locate_end(&self, offset: usize) -> Option<LeafPoint> {
        if offset == 0 {
            return None;
        }
        self.spans
            .iter()
            .find(|s| s.len > 0 && s.end() >= offset)
            .map(|s| LeafPoint::new(s.node, offset - s.start))
    }

    /// Character offset of a position inside a text leaf. `None` when the
    /// node is not one of this index's leaves; offsets past the leaf's end
    /// are clamped.
    pub fn offset_of(&self, point: LeafPoint) -> Option<usize> {
        self.spans
            .iter()
            .find(|s| s.node == point.node)
            .map(|s| s.start + point.offset.min(s.len))
    }

    /// Character offset of the text boundary immediately before `node`, which
    /// may be an element or atom. Elements contribute the boundary before their
    /// first text descendant.
    pub fn offset_before(&self, content: &ContentTree, node: NodeId) -> Option<usize> {
        let leaves = content.leaves();
        let first_leaf = first_leaf_of(content, node)?;
        let position = leaves.iter().position(|l| *l == first_leaf)?;
        // Sum of text leaves strictly before the node's first leaf
        let before = leaves[..position]
            .iter()
            .filter_map(|l| self.spans.iter().find(|s| s.node == *l))
            .map(|s| s.len)
            .sum();
        Some(before)
    }
}

fn first_leaf_of(content: &ContentTree, node: NodeId) -> Option<NodeId> {
    let n = content.node(node)?;
    match n.kind {
        NodeKind::Element(_) => match n.children.first() {
            Some(child) => first_leaf_of(content, *child),
            // Empty element: use the next leaf after it, if any
            None => next_leaf_after(content, node),
        },
        NodeKind::Text(_) | NodeKind::Atom(_) => Some(node),
    }
}

fn next_leaf_after(content: &ContentTree, node: NodeId) -> Option<NodeId> {
    let parent = content.node(node)?.parent?;
    let siblings = &content.node(parent)?.children;
    let index = siblings.iter().position(|s| *s == node)?;
    match siblings.get(index + 1) {
        Some(next) => first_leaf_of(content, *next),
        None => next_leaf_after(content, parent),
    }
}

/// Resolve a character range to client rectangles in viewport coordinates.
///
/// Returns `None` for empty ranges and for ranges that extend past the text
/// currently rendered (content not loaded yet). Never mutates the surface.
pub fn resolve_range(surface: &dyn TextSurface, range: TextRange) -> Option<Vec<Rect>> {
    if range.is_empty() {
        return None;
    }
    let index = LeafIndex::build(surface.content());
    if range.end > index.total_len() {
        return None;
    }
    let start = index.locate_start(range.start)?;
    let end = index.locate_end(range.end)?;
    let rects: Vec<Rect> = surface
        .client_rects(start, end)
        .into_iter()
        .filter(|r| !r.is_empty())
        .collect();
    if rects.is_empty() { None } else { Some(rects) }
}

/// [`resolve_range`] translated into container-relative coordinates.
pub fn resolve_range_local(surface: &dyn TextSurface, range: TextRange) -> Option<Vec<Rect>> {
    let origin = surface.origin();
    resolve_range(surface, range).map(|rects| {
        rects
            .into_iter()
            .map(|r| r.translate(crate::geometry::Point::new(-origin.x, -origin.y)))
            .collect()
    })
}
