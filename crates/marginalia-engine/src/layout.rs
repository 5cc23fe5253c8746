//! The text-layout primitive the overlay engine consumes, plus a
//! monospace cell-grid implementation of it.
//!
//! A [`TextSurface`] is the rendered container of one block. It owns the
//! content tree, knows where it sits in the viewport, and can report the
//! client rectangles covered by a logical range between two leaf positions,
//! one per visual line the range touches.

use std::collections::HashMap;

use unicode_width::UnicodeWidthChar;

use crate::content::{AtomKind, ContentTree, NodeId, NodeKind};
use crate::geometry::{Point, Rect, Size};

/// A position inside a text leaf: `offset` characters from its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeafPoint {
    pub node: NodeId,
    pub offset: usize,
}

impl LeafPoint {
    pub const fn new(node: NodeId, offset: usize) -> Self {
        Self { node, offset }
    }
}

/// A rendered block container.
pub trait TextSurface {
    /// The content currently rendered in the container.
    fn content(&self) -> &ContentTree;

    /// Client rectangles, in viewport coordinates, covered by the logical
    /// range `[start, end)`. Must not mutate anything.
    fn client_rects(&self, start: LeafPoint, end: LeafPoint) -> Vec<Rect>;

    /// The container's top-left corner in viewport coordinates.
    fn origin(&self) -> Point;

    /// Bumped whenever content or layout changes in a way that can move text.
    /// Scrolling does not bump it.
    fn layout_generation(&self) -> u64;

    /// False once the container has been torn down.
    fn is_mounted(&self) -> bool {
        true
    }
}

/// Size of a single character cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellMetrics {
    pub cell_width: f32,
    pub line_height: f32,
}

impl Default for CellMetrics {
    fn default() -> Self {
        Self {
            cell_width: 8.0,
            line_height: 16.0,
        }
    }
}

/// A laid-out character, container-relative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Glyph {
    pub ch: char,
    /// Character offset within the block
    pub offset: usize,
    pub rect: Rect,
}

/// Tabs advance to the next multiple of this many columns.
pub const TAB_STOP: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Placement {
    line: usize,
    col: usize,
    cells: usize,
}

enum FlowItem {
    Char {
        node: NodeId,
        index: usize,
        cells: usize,
        space: bool,
    },
    Tab {
        node: NodeId,
        index: usize,
    },
    Inline {
        cells: usize,
    },
    Block {
        rows: usize,
    },
    /// A newline inside a text leaf (code blocks)
    Newline,
    Break,
}

impl FlowItem {
    fn cells(&self) -> usize {
        match self {
            FlowItem::Char { cells, .. } | FlowItem::Inline { cells } => *cells,
            _ => 0,
        }
    }

    fn is_word_part(&self) -> bool {
        matches!(
            self,
            FlowItem::Char { space: false, .. } | FlowItem::Inline { .. }
        )
    }
}

/// A block laid out on a grid of fixed-size cells with greedy word wrapping.
///
/// Every mutation that can move text (resize, content replacement, math
/// typesetting, image loading) re-runs layout and bumps the generation.
#[derive(Debug, Clone)]
pub struct MonospaceSurface {
    content: ContentTree,
    metrics: CellMetrics,
    width: f32,
    origin: Point,
    mounted: bool,
    generation: u64,
    placements: HashMap<NodeId, Vec<Placement>>,
    line_tops: Vec<f32>,
    line_heights: Vec<f32>,
}

impl MonospaceSurface {
    pub fn new(content: ContentTree, metrics: CellMetrics, width: f32) -> Self {
        let mut surface = Self {
            content,
            metrics,
            width,
            origin: Point::ORIGIN,
            mounted: true,
            generation: 0,
            placements: HashMap::new(),
            line_tops: Vec::new(),
            line_heights: Vec::new(),
        };
        surface.relayout();
        surface
    }

    pub fn columns(&self) -> usize {
        ((self.width / self.metrics.cell_width).floor() as usize).max(1)
    }

    pub fn metrics(&self) -> CellMetrics {
        self.metrics
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn size(&self) -> Size {
        let height = self.line_heights.iter().sum();
        Size::new(self.width, height)
    }

    pub fn line_count(&self) -> usize {
        self.line_heights.len()
    }

    /// Resize the container. Text re-wraps.
    pub fn set_width(&mut self, width: f32) {
        if (width - self.width).abs() > f32::EPSILON {
            self.width = width;
            self.relayout();
        }
    }

    /// Move the container within the viewport (scrolling). Layout is kept.
    pub fn set_origin(&mut self, origin: Point) {
        self.origin = origin;
    }

    /// Swap in freshly rendered content.
    pub fn replace_content(&mut self, content: ContentTree) {
        self.content = content;
        self.relayout();
    }

    /// Math typesetting finished for `node`.
    pub fn typeset_math(&mut self, node: NodeId, cells: usize) -> bool {
        let changed = self.content.set_math_typeset(node, cells);
        if changed {
            self.relayout();
        }
        changed
    }

    /// A lazy image finished loading.
    pub fn load_image(&mut self, node: NodeId, rows: usize) -> bool {
        let changed = self.content.set_image_loaded(node, rows);
        if changed {
            self.relayout();
        }
        changed
    }

    pub fn unmount(&mut self) {
        self.mounted = false;
    }

    /// The leaf position closest to a viewport point, snapping to character
    /// edges. `None` when the point is not on a line holding text.
    pub fn caret_at(&self, point: Point) -> Option<LeafPoint> {
        let local = point - self.origin;
        let line = self
            .line_tops
            .iter()
            .zip(&self.line_heights)
            .position(|(top, h)| local.y >= *top && local.y < top + h)?;

        let mut last_on_line = None;
        for (node, _) in self.content.text_leaves() {
            let Some(glyphs) = self.placements.get(&node) else {
                continue;
            };
            for (index, p) in glyphs.iter().enumerate().filter(|(_, p)| p.line == line) {
                let left = p.col as f32 * self.metrics.cell_width;
                let right = (p.col + p.cells) as f32 * self.metrics.cell_width;
                if local.x < left {
                    return Some(LeafPoint::new(node, index));
                }
                if local.x < right {
                    let offset = if local.x - left < (right - left) / 2.0 {
                        index
                    } else {
                        index + 1
                    };
                    return Some(LeafPoint::new(node, offset));
                }
                last_on_line = Some(LeafPoint::new(node, index + 1));
            }
        }
        last_on_line
    }

    /// Every placed character in document order.
    pub fn glyphs(&self) -> Vec<Glyph> {
        let cw = self.metrics.cell_width;
        let mut out = Vec::new();
        let mut offset = 0;
        for (node, text) in self.content.text_leaves() {
            let placed = self.placements.get(&node);
            for (index, ch) in text.chars().enumerate() {
                if let Some(p) = placed.and_then(|g| g.get(index)) {
                    out.push(Glyph {
                        ch,
                        offset: offset + index,
                        rect: Rect::new(
                            p.col as f32 * cw,
                            self.line_tops[p.line],
                            p.cells as f32 * cw,
                            self.line_heights[p.line],
                        ),
                    });
                }
            }
            offset += text.chars().count();
        }
        out
    }

    fn flow_items(&self) -> Vec<FlowItem> {
        let mut items = Vec::new();
        for id in self.content.leaves() {
            let Some(node) = self.content.node(id) else {
                continue;
            };
            match &node.kind {
                NodeKind::Text(text) => {
                    for (index, ch) in text.chars().enumerate() {
                        match ch {
                            '\t' => items.push(FlowItem::Tab { node: id, index }),
                            '\n' => {
                                items.push(FlowItem::Char {
                                    node: id,
                                    index,
                                    cells: 0,
                                    space: true,
                                });
                                items.push(FlowItem::Newline);
                            }
                            _ => items.push(FlowItem::Char {
                                node: id,
                                index,
                                cells: UnicodeWidthChar::width(ch).unwrap_or(0),
                                space: ch.is_whitespace(),
                            }),
                        }
                    }
                }
                NodeKind::Atom(AtomKind::Math {
                    source,
                    typeset_cells,
                }) => {
                    let cells = typeset_cells.unwrap_or_else(|| source.chars().count());
                    items.push(FlowItem::Inline { cells });
                }
                NodeKind::Atom(AtomKind::Image { rows, .. }) => {
                    items.push(FlowItem::Block {
                        rows: rows.unwrap_or(0),
                    });
                }
                NodeKind::Atom(AtomKind::LineBreak) => items.push(FlowItem::Break),
                NodeKind::Element(_) => {}
            }
        }
        items
    }

    fn relayout(&mut self) {
        let columns = self.columns();
        let line_height = self.metrics.line_height;
        let items = self.flow_items();

        let mut placements: HashMap<NodeId, Vec<Placement>> = HashMap::new();
        for (node, text) in self.content.text_leaves() {
            placements.insert(node, Vec::with_capacity(text.chars().count()));
        }
        let mut heights = vec![line_height];
        let mut line = 0usize;
        let mut col = 0usize;

        let new_line = |line: &mut usize, col: &mut usize, heights: &mut Vec<f32>| {
            *line += 1;
            *col = 0;
            heights.push(line_height);
        };

        let mut place = |item: &FlowItem, line: usize, col: usize| {
            let (node, index, cells) = match item {
                FlowItem::Char {
                    node, index, cells, ..
                } => (node, *index, *cells),
                FlowItem::Tab { node, index } => (node, *index, TAB_STOP - col % TAB_STOP),
                _ => return,
            };
            if let Some(glyphs) = placements.get_mut(node) {
                debug_assert_eq!(glyphs.len(), index);
                glyphs.push(Placement { line, col, cells });
            }
        };

        let mut i = 0;
        while i < items.len() {
            let item = &items[i];
            match item {
                FlowItem::Break => {
                    new_line(&mut line, &mut col, &mut heights);
                    i += 1;
                }
                FlowItem::Newline => {
                    // A trailing newline does not open an empty line
                    if items
                        .get(i + 1)
                        .is_some_and(|next| !matches!(next, FlowItem::Break))
                    {
                        new_line(&mut line, &mut col, &mut heights);
                    }
                    i += 1;
                }
                FlowItem::Tab { .. } => {
                    place(item, line, col);
                    col += TAB_STOP - col % TAB_STOP;
                    i += 1;
                }
                FlowItem::Block { rows } => {
                    if col > 0 {
                        new_line(&mut line, &mut col, &mut heights);
                    }
                    if *rows > 0 {
                        heights[line] = *rows as f32 * line_height;
                        new_line(&mut line, &mut col, &mut heights);
                    }
                    i += 1;
                }
                FlowItem::Char { space: true, .. } => {
                    // Trailing spaces hang past the right edge instead of wrapping
                    place(item, line, col);
                    col += item.cells();
                    i += 1;
                }
                _ => {
                    let word_end = items[i..]
                        .iter()
                        .position(|it| !it.is_word_part())
                        .map_or(items.len(), |p| i + p);
                    let word_cells: usize = items[i..word_end].iter().map(FlowItem::cells).sum();
                    if col > 0 && col + word_cells > columns {
                        new_line(&mut line, &mut col, &mut heights);
                    }
                    for part in &items[i..word_end] {
                        if col > 0 && col + part.cells() > columns {
                            new_line(&mut line, &mut col, &mut heights);
                        }
                        place(part, line, col);
                        col += part.cells();
                    }
                    i = word_end;
                }
            }
        }

        let mut tops = Vec::with_capacity(heights.len());
        let mut y = 0.0;
        for h in &heights {
            tops.push(y);
            y += h;
        }

        self.placements = placements;
        self.line_heights = heights;
        self.line_tops = tops;
        self.generation += 1;
        log::debug!(
            "relayout: {} lines at {} columns (generation {})",
            self.line_heights.len(),
            columns,
            self.generation
        );
    }
}

impl TextSurface for MonospaceSurface {
    fn content(&self) -> &ContentTree {
        &self.content
    }

    fn client_rects(&self, start: LeafPoint, end: LeafPoint) -> Vec<Rect> {
        let order: Vec<NodeId> = self
            .content
            .text_leaves()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let (Some(si), Some(ei)) = (
            order.iter().position(|id| *id == start.node),
            order.iter().position(|id| *id == end.node),
        ) else {
            return Vec::new();
        };
        if si > ei {
            return Vec::new();
        }

        // (line, first col, end col). A run of only zero-width glyphs
        // (newlines, combining marks) still covers one cell.
        let mut runs: Vec<(usize, usize, usize)> = Vec::new();
        for (i, node) in order.iter().enumerate().take(ei + 1).skip(si) {
            let Some(glyphs) = self.placements.get(node) else {
                continue;
            };
            let from = if i == si { start.offset } else { 0 };
            let to = if i == ei { end.offset } else { glyphs.len() };
            for p in glyphs.iter().take(to).skip(from) {
                let end = p.col + p.cells;
                match runs.last_mut() {
                    Some((line, _, run_end)) if *line == p.line => {
                        *run_end = (*run_end).max(end);
                    }
                    _ => runs.push((p.line, p.col, end)),
                }
            }
        }

        let cw = self.metrics.cell_width;
        runs.into_iter()
            .map(|(line, from, to)| {
                Rect::new(
                    from as f32 * cw,
                    self.line_tops[line],
                    (to - from).max(1) as f32 * cw,
                    self.line_heights[line],
                )
                .translate(self.origin)
            })
            .collect()
    }

    fn origin(&self) -> Point {
        self.origin
    }

    fn layout_generation(&self) -> u64 {
        self.generation
    }

    fn is_mounted(&self) -> bool {
        self.mounted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn surface(text: &str, width: f32) -> MonospaceSurface {
        MonospaceSurface::new(ContentTree::from_text(text), CellMetrics::default(), width)
    }

    fn leaf(s: &MonospaceSurface) -> NodeId {
        s.content().text_leaves()[0].0
    }

    #[test]
    fn single_line_range_is_one_rect() {
        let s = surface("The quick brown fox", 400.0);
        let node = leaf(&s);
        let rects = s.client_rects(LeafPoint::new(node, 4), LeafPoint::new(node, 9));
        assert_eq!(rects, vec![Rect::new(32.0, 0.0, 40.0, 16.0)]);
    }

    #[test]
    fn words_wrap_at_column_limit() {
        // 10 columns: "The quick " / "brown fox"
        let s = surface("The quick brown fox", 80.0);
        assert_eq!(s.line_count(), 2);
        let node = leaf(&s);
        let rects = s.client_rects(LeafPoint::new(node, 4), LeafPoint::new(node, 15));
        assert_eq!(
            rects,
            vec![
                Rect::new(32.0, 0.0, 48.0, 16.0),
                Rect::new(0.0, 16.0, 40.0, 16.0),
            ]
        );
    }

    #[test]
    fn overlong_words_break_mid_word() {
        let s = surface("abcdefghijkl", 40.0);
        assert_eq!(s.line_count(), 3);
    }

    #[test]
    fn origin_translates_rects() {
        let mut s = surface("hello", 400.0);
        s.set_origin(Point::new(100.0, 50.0));
        let node = leaf(&s);
        let rects = s.client_rects(LeafPoint::new(node, 0), LeafPoint::new(node, 5));
        assert_eq!(rects, vec![Rect::new(100.0, 50.0, 40.0, 16.0)]);
    }

    #[test]
    fn scrolling_keeps_generation_but_resize_bumps_it() {
        let mut s = surface("hello world", 400.0);
        let g = s.layout_generation();
        s.set_origin(Point::new(0.0, -30.0));
        assert_eq!(s.layout_generation(), g);
        s.set_width(40.0);
        assert!(s.layout_generation() > g);
    }

    #[test]
    fn typeset_math_moves_following_text() {
        let mut s = MonospaceSurface::new(
            ContentTree::from_markdown("a $\\alpha+\\beta$ b"),
            CellMetrics::default(),
            800.0,
        );
        let leaves = s.content().text_leaves();
        let (b_node, b_text) = leaves[1];
        assert_eq!(b_text, " b");
        let before = s.client_rects(LeafPoint::new(b_node, 1), LeafPoint::new(b_node, 2));

        let math = s.content().math_atoms()[0];
        assert!(s.typeset_math(math, 3));
        let after = s.client_rects(LeafPoint::new(b_node, 1), LeafPoint::new(b_node, 2));
        assert!(after[0].x < before[0].x);
    }

    #[test]
    fn loaded_image_pushes_text_down() {
        let mut s = MonospaceSurface::new(
            ContentTree::from_markdown("top ![pic](p.png) bottom"),
            CellMetrics::default(),
            800.0,
        );
        let (node, text) = s.content().text_leaves()[1];
        assert_eq!(text, " bottom");
        let before = s.client_rects(LeafPoint::new(node, 1), LeafPoint::new(node, 7));
        let image = s.content().image_atoms()[0];
        s.load_image(image, 5);
        let after = s.client_rects(LeafPoint::new(node, 1), LeafPoint::new(node, 7));
        assert_eq!(after[0].y - before[0].y, 5.0 * 16.0);
    }

    #[test]
    fn glyphs_follow_wrapping() {
        let s = surface("The quick brown fox", 80.0);
        let glyphs = s.glyphs();
        assert_eq!(glyphs.len(), 19);
        let b = glyphs.iter().find(|g| g.offset == 10).unwrap();
        assert_eq!(b.ch, 'b');
        assert_eq!(b.rect, Rect::new(0.0, 16.0, 8.0, 16.0));
    }

    #[test]
    fn caret_snaps_to_nearest_character_edge() {
        let s = surface("hello", 400.0);
        let node = leaf(&s);
        assert_eq!(s.caret_at(Point::new(1.0, 4.0)), Some(LeafPoint::new(node, 0)));
        assert_eq!(s.caret_at(Point::new(7.0, 4.0)), Some(LeafPoint::new(node, 1)));
        assert_eq!(s.caret_at(Point::new(300.0, 4.0)), Some(LeafPoint::new(node, 5)));
        assert_eq!(s.caret_at(Point::new(3.0, 40.0)), None);
    }

    #[test]
    fn tabs_advance_to_the_next_stop() {
        let s = surface("a\tb", 400.0);
        let node = leaf(&s);
        let tab = s.client_rects(LeafPoint::new(node, 1), LeafPoint::new(node, 2));
        assert_eq!(tab, vec![Rect::new(8.0, 0.0, 24.0, 16.0)]);
        let b = s.client_rects(LeafPoint::new(node, 2), LeafPoint::new(node, 3));
        assert_eq!(b, vec![Rect::new(32.0, 0.0, 8.0, 16.0)]);
    }

    #[test]
    fn newlines_in_code_blocks_break_lines() {
        let s = MonospaceSurface::new(
            ContentTree::from_markdown("```\nfn a()\nfn b()\n```"),
            CellMetrics::default(),
            400.0,
        );
        assert_eq!(s.line_count(), 2);
        let second = s.glyphs().into_iter().find(|g| g.offset == 7).unwrap();
        assert_eq!(second.ch, 'f');
        assert_eq!(second.rect, Rect::new(0.0, 16.0, 8.0, 16.0));
        assert_eq!(
            crate::offsets::resolve_range(&s, crate::range::TextRange::new(6, 7)),
            Some(vec![Rect::new(48.0, 0.0, 8.0, 16.0)])
        );
    }

    #[test]
    fn zero_width_glyphs_still_cover_a_cell() {
        let s = surface("e\u{301}x", 400.0);
        let node = leaf(&s);
        let mark = s.client_rects(LeafPoint::new(node, 1), LeafPoint::new(node, 2));
        assert_eq!(mark, vec![Rect::new(8.0, 0.0, 8.0, 16.0)]);
        let accented = s.client_rects(LeafPoint::new(node, 0), LeafPoint::new(node, 2));
        assert_eq!(accented, vec![Rect::new(0.0, 0.0, 8.0, 16.0)]);
    }
}
