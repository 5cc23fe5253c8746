//! Highlight Overlay Renderers.
//!
//! One [`HighlightOverlay`] per anchored kind turns resolved, arbitrated
//! rectangles into non-interactive decorations plus thin interactive
//! hit-strips. [`BlockOverlay`] owns the four renderers for a block, caches
//! the last frame, and throws it away whenever the surface's layout
//! generation moves or a recompute trigger fires.

use std::collections::HashMap;
use std::sync::Arc;

use crate::arbiter::{self, Layering, OverlapArbiter, OverlayConfig, PlacedRect, ResolvedEntity};
use crate::entity::{BlockId, EntityId, HighlightEntity, HighlightKind};
use crate::error::OverlayError;
use crate::geometry::{Point, Rect};
use crate::layout::TextSurface;
use crate::offsets::{LeafIndex, resolve_range_local};
use crate::range::TextRange;

/// How a kind paints its decoration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecorationStyle {
    /// Thin line under the text
    Underline,
    /// Dotted line under the text
    DottedUnderline,
    /// Tinted background behind the text
    Background,
}

/// Purely visual overlay element. Never intercepts pointer events.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decoration {
    pub entity: EntityId,
    pub kind: HighlightKind,
    pub rect: Rect,
    pub z_index: i32,
    pub style: DecorationStyle,
}

/// Interactive strip along the bottom edge of a highlighted rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitStrip {
    pub entity: EntityId,
    pub kind: HighlightKind,
    pub range: TextRange,
    pub rect: Rect,
    pub z_index: i32,
}

/// What a click on a hit-strip reports to the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HighlightClick {
    pub entity: EntityId,
    pub kind: HighlightKind,
    pub range: TextRange,
    pub pointer: Point,
}

/// Receives clicks on highlight hit-strips.
pub trait HighlightClickHandler {
    fn on_highlight_click(&mut self, click: HighlightClick);
}

impl<F: FnMut(HighlightClick)> HighlightClickHandler for F {
    fn on_highlight_click(&mut self, click: HighlightClick) {
        self(click)
    }
}

/// Output of one renderer for one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlayPass {
    pub decorations: Vec<Decoration>,
    pub hit_strips: Vec<HitStrip>,
}

/// Renderer for a single highlight kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighlightOverlay {
    kind: HighlightKind,
    style: DecorationStyle,
}

impl HighlightOverlay {
    pub fn new(kind: HighlightKind) -> Self {
        let style = match kind {
            HighlightKind::Annotation => DecorationStyle::Underline,
            HighlightKind::Definition => DecorationStyle::DottedUnderline,
            HighlightKind::RabbitholeLink => DecorationStyle::Underline,
            HighlightKind::LiveSelection | HighlightKind::GeneratedNote => {
                DecorationStyle::Background
            }
        };
        Self { kind, style }
    }

    pub fn kind(&self) -> HighlightKind {
        self.kind
    }

    /// Build decorations and hit-strips for this kind's placed rectangles.
    pub fn render(&self, placed: &[PlacedRect]) -> OverlayPass {
        let mut pass = OverlayPass::default();
        for p in placed.iter().filter(|p| p.kind == self.kind) {
            pass.decorations.push(Decoration {
                entity: p.entity,
                kind: p.kind,
                rect: p.rect,
                z_index: p.z_index,
                style: self.style,
            });
            // The live selection is painted but never clickable
            if self.kind != HighlightKind::LiveSelection {
                pass.hit_strips.push(HitStrip {
                    entity: p.entity,
                    kind: p.kind,
                    range: p.range,
                    rect: p.hit_strip,
                    z_index: p.z_index,
                });
            }
        }
        pass
    }
}

/// Why a block's overlay must be recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeTrigger {
    Resize,
    ContentReplaced,
    EntitiesChanged,
    /// Inline content re-rendered (math typeset, image loaded)
    InlineRerender,
}

/// A complete overlay for one block at one layout generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlayFrame {
    pub layout_generation: u64,
    pub entities_version: u64,
    pub passes: Vec<(HighlightKind, OverlayPass)>,
    pub layering: HashMap<EntityId, Layering>,
    /// Rectangles in arbitration order, used for hit testing.
    pub placed: Vec<PlacedRect>,
    /// Entities that rendered nothing this pass, and why.
    pub skipped: Vec<OverlayError>,
}

impl OverlayFrame {
    pub fn pass(&self, kind: HighlightKind) -> Option<&OverlayPass> {
        self.passes.iter().find(|(k, _)| *k == kind).map(|(_, p)| p)
    }

    pub fn decorations(&self) -> impl Iterator<Item = &Decoration> {
        self.passes.iter().flat_map(|(_, p)| p.decorations.iter())
    }

    pub fn hit_strips(&self) -> impl Iterator<Item = &HitStrip> {
        self.passes.iter().flat_map(|(_, p)| p.hit_strips.iter())
    }

    pub fn rects_for(&self, entity: EntityId) -> Vec<Rect> {
        self.decorations()
            .filter(|d| d.entity == entity)
            .map(|d| d.rect)
            .collect()
    }
}

/// All highlight rendering for one block.
#[derive(Debug)]
pub struct BlockOverlay {
    block_id: BlockId,
    arbiter: OverlapArbiter,
    renderers: [HighlightOverlay; 4],
    entities: Arc<Vec<HighlightEntity>>,
    live_selection: Option<HighlightEntity>,
    entities_version: u64,
    dirty: bool,
    frame: Option<OverlayFrame>,
}

impl BlockOverlay {
    pub fn new(block_id: BlockId, config: OverlayConfig) -> Self {
        Self {
            block_id,
            arbiter: OverlapArbiter::new(config),
            renderers: HighlightKind::ANCHORED.map(HighlightOverlay::new),
            entities: Arc::new(Vec::new()),
            live_selection: None,
            entities_version: 0,
            dirty: true,
            frame: None,
        }
    }

    pub fn block_id(&self) -> &BlockId {
        &self.block_id
    }

    pub fn entities(&self) -> &Arc<Vec<HighlightEntity>> {
        &self.entities
    }

    /// Replace the entity snapshot. A pointer-equal snapshot is a no-op.
    pub fn set_entities(&mut self, entities: Arc<Vec<HighlightEntity>>) {
        if Arc::ptr_eq(&self.entities, &entities) {
            return;
        }
        self.entities = entities;
        self.invalidate(RecomputeTrigger::EntitiesChanged);
    }

    /// Show or clear the in-progress selection.
    pub fn set_live_selection(&mut self, selection: Option<(TextRange, String)>) {
        let same = match (&self.live_selection, &selection) {
            (None, None) => true,
            (Some(current), Some((range, _))) => current.range() == Some(*range),
            _ => false,
        };
        if same {
            return;
        }
        self.live_selection = selection.map(|(range, text)| {
            HighlightEntity::live_selection(self.block_id.clone(), range, text)
        });
        self.invalidate(RecomputeTrigger::EntitiesChanged);
    }

    /// Recompute hook: the host calls this after any mutation it performs on
    /// the block's content or container.
    pub fn invalidate(&mut self, trigger: RecomputeTrigger) {
        log::debug!("block {}: overlay invalidated ({trigger:?})", self.block_id);
        if trigger == RecomputeTrigger::EntitiesChanged {
            self.entities_version += 1;
        }
        self.dirty = true;
    }

    /// The cached frame if it is still valid for `surface`.
    pub fn current_frame(&self, surface: &dyn TextSurface) -> Option<&OverlayFrame> {
        self.frame
            .as_ref()
            .filter(|f| !self.dirty && f.layout_generation == surface.layout_generation())
    }

    /// Render the block, reusing the cached frame only when nothing that
    /// could move text has happened since it was built.
    pub fn render(&mut self, surface: &dyn TextSurface) -> &OverlayFrame {
        if self.current_frame(surface).is_none() {
            self.frame = Some(self.compute(surface));
            self.dirty = false;
        }
        self.frame.get_or_insert_with(OverlayFrame::default)
    }

    /// Topmost hit-strip under a container-relative point. Stale frames are
    /// never consulted.
    pub fn hit_test(&self, surface: &dyn TextSurface, point: Point) -> Option<HighlightClick> {
        let frame = self.current_frame(surface)?;
        arbiter::hit_test(&frame.placed, point).map(|p| HighlightClick {
            entity: p.entity,
            kind: p.kind,
            range: p.range,
            pointer: point,
        })
    }

    /// Hit test and, on a hit, notify `handler`. Returns whether a strip was hit.
    pub fn dispatch_click(
        &self,
        surface: &dyn TextSurface,
        point: Point,
        handler: &mut dyn HighlightClickHandler,
    ) -> bool {
        match self.hit_test(surface, point) {
            Some(click) => {
                handler.on_highlight_click(click);
                true
            }
            None => false,
        }
    }

    fn compute(&self, surface: &dyn TextSurface) -> OverlayFrame {
        let text_len = LeafIndex::build(surface.content()).total_len();
        let all: Vec<HighlightEntity> = self
            .entities
            .iter()
            .chain(self.live_selection.iter())
            .filter(|e| e.block_id == self.block_id && e.is_anchored())
            .cloned()
            .collect();

        let mut skipped = Vec::new();
        let mut renderable = Vec::with_capacity(all.len());
        let mut resolved = Vec::with_capacity(all.len());
        for entity in &all {
            let Some(range) = entity.range() else {
                continue;
            };
            if range.start >= range.end {
                log::warn!(
                    "block {}: dropping {} {} with invalid range {}",
                    self.block_id,
                    entity.kind().label(),
                    entity.id,
                    range
                );
                skipped.push(OverlayError::RangeInvalid {
                    start: range.start as i64,
                    end: range.end as i64,
                    len: Some(text_len),
                });
                continue;
            }
            match resolve_range_local(surface, range) {
                Some(rects) => {
                    renderable.push(entity.clone());
                    resolved.push(ResolvedEntity {
                        id: entity.id,
                        kind: entity.kind(),
                        range,
                        rects,
                    });
                }
                None => {
                    log::debug!(
                        "block {}: {} {} not renderable yet at {}",
                        self.block_id,
                        entity.kind().label(),
                        entity.id,
                        range
                    );
                    skipped.push(OverlayError::GeometryUnresolved {
                        entity: entity.id,
                        range,
                    });
                }
            }
        }

        let layering = self.arbiter.resolve_layering(&renderable);
        let placed = self.arbiter.place(&layering, &resolved);
        let passes = self
            .renderers
            .iter()
            .map(|r| (r.kind(), r.render(&placed)))
            .collect();

        log::debug!(
            "block {}: rendered {} rects for {} entities (generation {}, {} skipped)",
            self.block_id,
            placed.len(),
            resolved.len(),
            surface.layout_generation(),
            skipped.len()
        );

        OverlayFrame {
            layout_generation: surface.layout_generation(),
            entities_version: self.entities_version,
            passes,
            layering,
            placed,
            skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentTree;
    use crate::layout::{CellMetrics, MonospaceSurface};
    use pretty_assertions::assert_eq;

    fn block() -> BlockId {
        BlockId::new("p1")
    }

    fn surface() -> MonospaceSurface {
        MonospaceSurface::new(
            ContentTree::from_text("The quick brown fox"),
            CellMetrics::default(),
            400.0,
        )
    }

    fn report(frame: &OverlayFrame) -> String {
        let mut lines = Vec::new();
        for (kind, pass) in &frame.passes {
            for d in &pass.decorations {
                lines.push(format!(
                    "{} {:?} x={} y={} w={} z={}",
                    kind.label(),
                    d.style,
                    d.rect.x,
                    d.rect.y,
                    d.rect.width,
                    d.z_index
                ));
            }
            for h in &pass.hit_strips {
                lines.push(format!(
                    "{} strip y={}..{} range={}",
                    kind.label(),
                    h.rect.y,
                    h.rect.bottom(),
                    h.range
                ));
            }
        }
        lines.join("\n")
    }

    #[test]
    fn renders_each_kind_with_its_style() {
        let s = surface();
        let mut overlay = BlockOverlay::new(block(), OverlayConfig::default());
        overlay.set_entities(Arc::new(vec![
            HighlightEntity::annotation(block(), TextRange::new(10, 19), "brown fox", "", 1),
            HighlightEntity::rabbithole(block(), TextRange::new(4, 9), "c1", "quick", 2),
        ]));
        let frame = overlay.render(&s);
        insta::assert_snapshot!(report(frame), @r"
        annotation Underline x=80 y=0 w=72 z=100
        annotation strip y=13..16 range=10..19
        rabbithole Underline x=32 y=0 w=40 z=300
        rabbithole strip y=13..16 range=4..9
        ");
    }

    #[test]
    fn live_selection_is_painted_but_not_clickable() {
        let s = surface();
        let mut overlay = BlockOverlay::new(block(), OverlayConfig::default());
        overlay.set_live_selection(Some((TextRange::new(0, 3), "The".into())));
        let frame = overlay.render(&s);
        let pass = frame.pass(HighlightKind::LiveSelection).unwrap();
        assert_eq!(pass.decorations.len(), 1);
        assert!(pass.hit_strips.is_empty());
    }

    #[test]
    fn out_of_range_entities_are_skipped_not_fatal() {
        let s = surface();
        let mut overlay = BlockOverlay::new(block(), OverlayConfig::default());
        let late = HighlightEntity::definition(block(), TextRange::new(15, 40), "x", "y", 1);
        let bad = HighlightEntity::annotation(block(), TextRange::new(8, 3), "", "", 1);
        let good = HighlightEntity::annotation(block(), TextRange::new(0, 3), "The", "", 1);
        overlay.set_entities(Arc::new(vec![late.clone(), bad, good.clone()]));
        let frame = overlay.render(&s);

        assert_eq!(frame.rects_for(good.id).len(), 1);
        assert!(frame.rects_for(late.id).is_empty());
        assert_eq!(frame.skipped.len(), 2);
        assert!(frame.skipped.iter().any(|e| e.is_transient()));
    }

    #[test]
    fn resize_discards_stale_frame() {
        let mut s = surface();
        let mut overlay = BlockOverlay::new(block(), OverlayConfig::default());
        let ann = HighlightEntity::annotation(block(), TextRange::new(10, 19), "brown fox", "", 1);
        overlay.set_entities(Arc::new(vec![ann.clone()]));
        let before = overlay.render(&s).rects_for(ann.id);
        assert_eq!(before.len(), 1);

        s.set_width(96.0);
        assert!(overlay.current_frame(&s).is_none());
        let after = overlay.render(&s).rects_for(ann.id);
        assert_ne!(before, after);
        assert_eq!(overlay.current_frame(&s).map(|f| f.rects_for(ann.id)), Some(after));
    }

    #[test]
    fn replaced_content_discards_stale_frame() {
        let mut s = surface();
        let mut overlay = BlockOverlay::new(block(), OverlayConfig::default());
        let ann = HighlightEntity::annotation(block(), TextRange::new(10, 19), "brown fox", "", 1);
        overlay.set_entities(Arc::new(vec![ann.clone()]));
        let generation = overlay.render(&s).layout_generation;
        let before = overlay.render(&s).rects_for(ann.id);
        assert_eq!(before, vec![Rect::new(80.0, 0.0, 72.0, 16.0)]);

        // Ten double-width characters push the same offsets twenty cells right
        s.replace_content(ContentTree::from_text("日本語のテキストです brown fox"));
        overlay.invalidate(RecomputeTrigger::ContentReplaced);
        assert!(overlay.current_frame(&s).is_none());

        let frame = overlay.render(&s);
        assert_ne!(frame.layout_generation, generation);
        assert_eq!(frame.rects_for(ann.id), vec![Rect::new(160.0, 0.0, 72.0, 16.0)]);

        s.replace_content(ContentTree::from_text("The quick"));
        overlay.invalidate(RecomputeTrigger::ContentReplaced);
        let frame = overlay.render(&s);
        assert!(frame.rects_for(ann.id).is_empty());
        assert_eq!(frame.skipped.len(), 1);
    }

    #[test]
    fn unchanged_snapshot_keeps_cached_frame() {
        let s = surface();
        let mut overlay = BlockOverlay::new(block(), OverlayConfig::default());
        let snapshot = Arc::new(vec![HighlightEntity::annotation(
            block(),
            TextRange::new(0, 3),
            "The",
            "",
            1,
        )]);
        overlay.set_entities(snapshot.clone());
        let version = overlay.render(&s).entities_version;
        overlay.set_entities(snapshot);
        assert!(overlay.current_frame(&s).is_some());
        assert_eq!(overlay.render(&s).entities_version, version);
    }

    #[test]
    fn entities_for_other_blocks_are_ignored() {
        let s = surface();
        let mut overlay = BlockOverlay::new(block(), OverlayConfig::default());
        overlay.set_entities(Arc::new(vec![HighlightEntity::annotation(
            BlockId::new("elsewhere"),
            TextRange::new(0, 3),
            "The",
            "",
            1,
        )]));
        assert_eq!(overlay.render(&s).placed.len(), 0);
    }

    #[test]
    fn click_dispatch_reports_kind_and_range() {
        let s = surface();
        let mut overlay = BlockOverlay::new(block(), OverlayConfig::default());
        let rab = HighlightEntity::rabbithole(block(), TextRange::new(4, 9), "c1", "quick", 2);
        overlay.set_entities(Arc::new(vec![rab.clone()]));
        overlay.render(&s);

        let mut clicks = Vec::new();
        let mut handler = |c: HighlightClick| clicks.push(c);
        assert!(overlay.dispatch_click(&s, Point::new(40.0, 14.5), &mut handler));
        assert!(!overlay.dispatch_click(&s, Point::new(40.0, 4.0), &mut handler));
        assert_eq!(clicks.len(), 1);
        assert_eq!(clicks[0].entity, rab.id);
        assert_eq!(clicks[0].kind, HighlightKind::RabbitholeLink);
        assert_eq!(clicks[0].range, TextRange::new(4, 9));
    }
}
