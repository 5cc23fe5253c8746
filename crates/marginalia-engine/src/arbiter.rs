//! Overlap Arbiter: stacking order and vertical separation for highlights of
//! different kinds that cover intersecting ranges.
//!
//! Entities are placed in priority order (live selection, rabbithole links,
//! definitions, annotations; earlier `created_at` first within a kind). Each
//! takes the lowest *lane* not already taken by an intersecting entity. Lane
//! `n` is drawn `n * nudge_px` below the line, so intersecting highlights get
//! distinct underline heights and their thin hit-strips never collide.

use std::cmp::Reverse;
use std::collections::HashMap;

use crate::entity::{EntityId, HighlightEntity, HighlightKind};
use crate::geometry::{Point, Rect};
use crate::range::TextRange;

/// Tunable pixel constants for highlight separation and click targets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayConfig {
    /// Vertical offset applied per lane.
    pub nudge_px: i32,
    /// Height of the clickable strip at the bottom of each rectangle.
    pub hit_strip_px: f32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            nudge_px: 3,
            hit_strip_px: 3.0,
        }
    }
}

/// Stacking decision for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layering {
    pub z_index: i32,
    pub lane: u32,
    /// Nudge applied where this entity collides with a lower lane.
    pub vertical_nudge_px: i32,
}

/// An entity's resolved geometry, container-relative.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEntity {
    pub id: EntityId,
    pub kind: HighlightKind,
    pub range: TextRange,
    pub rects: Vec<Rect>,
}

/// A rectangle after arbitration: where its decoration and hit-strip go.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacedRect {
    pub entity: EntityId,
    pub kind: HighlightKind,
    pub range: TextRange,
    /// Decoration area, already nudged.
    pub rect: Rect,
    /// Clickable strip, already nudged.
    pub hit_strip: Rect,
    pub z_index: i32,
    pub nudge_px: i32,
}

#[derive(Debug, Clone, Default)]
pub struct OverlapArbiter {
    config: OverlayConfig,
}

impl OverlapArbiter {
    pub fn new(config: OverlayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> OverlayConfig {
        self.config
    }

    /// Assign a z-index and lane to every anchored entity with a non-empty
    /// range. Block-anchored entities and empty ranges are ignored.
    pub fn resolve_layering(&self, entities: &[HighlightEntity]) -> HashMap<EntityId, Layering> {
        let mut ordered: Vec<(&HighlightEntity, TextRange)> = entities
            .iter()
            .filter(|e| e.is_anchored())
            .filter_map(|e| e.range().filter(|r| !r.is_empty()).map(|r| (e, r)))
            .collect();
        ordered.sort_by_key(|(e, _)| (Reverse(e.kind()), e.created_at, e.id));

        let mut rank_in_kind: HashMap<HighlightKind, i32> = HashMap::new();
        let mut placed: Vec<(TextRange, u32)> = Vec::with_capacity(ordered.len());
        let mut layering = HashMap::with_capacity(ordered.len());

        for (entity, range) in ordered {
            let mut taken: Vec<u32> = placed
                .iter()
                .filter(|(r, _)| r.intersects(range))
                .map(|(_, lane)| *lane)
                .collect();
            taken.sort_unstable();
            let mut lane = 0;
            for t in taken {
                if t == lane {
                    lane += 1;
                } else if t > lane {
                    break;
                }
            }
            placed.push((range, lane));

            let rank = rank_in_kind.entry(entity.kind()).or_insert(0);
            let base = entity.kind().base_z().unwrap_or_default();
            let z_index = base + (*rank).min(99);
            *rank += 1;

            layering.insert(
                entity.id,
                Layering {
                    z_index,
                    lane,
                    vertical_nudge_px: lane as i32 * self.config.nudge_px,
                },
            );
        }
        layering
    }

    /// Place every rectangle. A rectangle is nudged by its entity's lane only
    /// where it actually collides with a rectangle of an intersecting entity
    /// in a lower lane; elsewhere it sits on the baseline.
    pub fn place(
        &self,
        layering: &HashMap<EntityId, Layering>,
        resolved: &[ResolvedEntity],
    ) -> Vec<PlacedRect> {
        let mut out = Vec::new();
        for entity in resolved {
            let Some(layer) = layering.get(&entity.id) else {
                continue;
            };
            for rect in &entity.rects {
                let collides = layer.lane > 0
                    && resolved.iter().any(|other| {
                        other.id != entity.id
                            && other.range.intersects(entity.range)
                            && layering
                                .get(&other.id)
                                .is_some_and(|l| l.lane < layer.lane)
                            && other.rects.iter().any(|o| o.intersects(rect))
                    });
                let nudge = if collides {
                    layer.vertical_nudge_px
                } else {
                    0
                };
                let offset = Point::new(0.0, nudge as f32);
                out.push(PlacedRect {
                    entity: entity.id,
                    kind: entity.kind,
                    range: entity.range,
                    rect: rect.translate(offset),
                    hit_strip: rect.bottom_strip(self.config.hit_strip_px).translate(offset),
                    z_index: layer.z_index,
                    nudge_px: nudge,
                });
            }
        }
        out
    }
}

/// Topmost hit-strip under `point`. Decoration areas never hit.
pub fn hit_test(placed: &[PlacedRect], point: Point) -> Option<&PlacedRect> {
    placed
        .iter()
        .filter(|p| p.hit_strip.contains(point))
        .max_by_key(|p| p.z_index)
}
