use std::sync::Arc;

use marginalia_engine::interaction::OpToken;
use marginalia_engine::store::DefinitionRecord;
use marginalia_engine::{
    BlockId, BlockOverlay, CellMetrics, ContentTree, Effect, Event, HighlightEntity,
    InteractionMachine, InteractionState, MonospaceSurface, OverlayConfig, Rect,
    SelectionSnapshot, StoreError, Surface, TextRange, TextSurface, TooltipAction, resolve_range,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const TEXT: &str = "The quick brown fox jumps over the lazy dog";

fn block() -> BlockId {
    BlockId::new("p")
}

fn random_range(rng: &mut StdRng, len: usize) -> TextRange {
    let start = rng.gen_range(0..len);
    let end = rng.gen_range(start + 1..=len);
    TextRange::new(start, end)
}

fn random_selection(rng: &mut StdRng) -> SelectionSnapshot {
    let range = random_range(rng, TEXT.len());
    SelectionSnapshot {
        block_id: block(),
        text: range.slice(TEXT),
        range,
        anchor_rect: Rect::ZERO,
    }
}

fn random_event(rng: &mut StdRng, tokens: &[OpToken]) -> Event {
    let token = if tokens.is_empty() {
        0
    } else {
        tokens[rng.gen_range(0..tokens.len())]
    };
    let fail = rng.gen_bool(0.3);
    match rng.gen_range(0..22) {
        0 => Event::SelectionChanged(Some(random_selection(rng))),
        1 => Event::SelectionChanged(None),
        2 | 3 => Event::SelectionSettled(random_selection(rng)),
        4 => Event::SelectionCleared { block_id: block() },
        5 => Event::Action(TooltipAction::Define),
        6 => Event::Action(TooltipAction::Annotate),
        7 => Event::Action(TooltipAction::Rabbithole),
        8 => {
            let range = random_range(rng, TEXT.len());
            let entity = match rng.gen_range(0..3) {
                0 => HighlightEntity::annotation(block(), range, "t", "n", 1),
                1 => HighlightEntity::definition(block(), range, "t", "d", 1),
                _ => HighlightEntity::rabbithole(block(), range, "c", "t", 1),
            };
            Event::HighlightClicked {
                entity,
                anchor_rect: Rect::ZERO,
            }
        }
        9 => Event::EditDraft("draft".into()),
        10 => Event::SaveAnnotation,
        11 => Event::DeleteAnnotation,
        12 => Event::Retry,
        13 => Event::Close,
        14 => Event::Escape,
        15 => Event::ClickOutside,
        16 => Event::DefinitionFetched {
            token,
            result: if fail {
                Err(StoreError::Unavailable("x".into()))
            } else {
                Ok(DefinitionRecord {
                    term: "t".into(),
                    definition_text: "d".into(),
                    created_at: 1,
                })
            },
        },
        17 => Event::AnnotationSaved {
            token,
            result: if fail {
                Err(StoreError::Rejected("x".into()))
            } else {
                Ok(HighlightEntity::annotation(block(), TextRange::new(0, 3), "The", "n", 1))
            },
        },
        18 => Event::AnnotationDeleted {
            token,
            result: if fail { Err(StoreError::Rejected("x".into())) } else { Ok(()) },
        },
        19 => Event::RabbitholeCreated {
            token,
            result: if fail { Err(StoreError::Unavailable("x".into())) } else { Ok("c".into()) },
        },
        20 => Event::AnnotationReplaceFailed {
            token,
            error: StoreError::Unavailable("x".into()),
        },
        _ => Event::BlockUnmounted(block()),
    }
}

fn tokens_in(effects: &[Effect]) -> impl Iterator<Item = OpToken> + '_ {
    effects.iter().filter_map(|e| match e {
        Effect::FetchDefinition { token, .. }
        | Effect::CreateAnnotation { token, .. }
        | Effect::UpdateAnnotation { token, .. }
        | Effect::DeleteAnnotation { token, .. }
        | Effect::CreateRabbithole { token, .. } => Some(*token),
        _ => None,
    })
}

#[test]
fn at_most_one_surface_is_ever_open() {
    for seed in 0..64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut machine = InteractionMachine::new();
        let mut tokens = Vec::new();

        for step in 0..200 {
            let event = random_event(&mut rng, &tokens);
            let was_busy = machine.state().is_busy();
            let closing = matches!(event, Event::Close | Event::Escape);
            let outside = matches!(event, Event::ClickOutside);
            let effects = machine.apply(event);
            tokens.extend(tokens_in(&effects));

            let state = machine.state();
            let open = [Surface::Tooltip, Surface::Definition, Surface::Annotation]
                .into_iter()
                .filter(|s| state.surface() == Some(*s))
                .count();
            assert!(open <= 1, "seed {seed} step {step}: {open} surfaces open");

            // Only the tooltip and a raw drag paint the live selection
            if state.live_selection().is_some() {
                assert!(matches!(
                    state,
                    InteractionState::Selecting(_) | InteractionState::Tooltip(_)
                ));
            }
            if state.is_busy() {
                assert!(state.surface().is_some(), "seed {seed} step {step}: busy with nothing open");
            }
            if closing {
                assert_eq!(state.surface(), None, "seed {seed} step {step}");
            }
            if outside && !was_busy {
                assert_eq!(state.surface(), None, "seed {seed} step {step}");
            }
        }
    }
}

#[test]
fn intersecting_kinds_never_share_hit_strip_area() {
    let kinds = 4;
    for seed in 0..128 {
        let mut rng = StdRng::seed_from_u64(seed);
        let width = rng.gen_range(10..45) as f32 * 8.0;
        let surface = MonospaceSurface::new(ContentTree::from_text(TEXT), CellMetrics::default(), width);

        let mut entities = Vec::new();
        for i in 0..rng.gen_range(1..=kinds) {
            let range = random_range(&mut rng, TEXT.len());
            let created = rng.gen_range(0..5);
            entities.push(match i % kinds {
                0 => HighlightEntity::annotation(block(), range, "", "", created),
                1 => HighlightEntity::definition(block(), range, "", "", created),
                2 => HighlightEntity::rabbithole(block(), range, "c", "", created),
                _ => HighlightEntity::annotation(block(), range, "", "", created),
            });
        }

        let mut overlay = BlockOverlay::new(block(), OverlayConfig::default());
        overlay.set_entities(Arc::new(entities));
        let frame = overlay.render(&surface);

        for a in frame.hit_strips() {
            for b in frame.hit_strips() {
                if a.entity == b.entity || a.kind == b.kind || !a.range.intersects(b.range) {
                    continue;
                }
                assert!(
                    !a.rect.intersects(&b.rect),
                    "seed {seed}: {:?} {} and {:?} {} collide at {:?} / {:?}",
                    a.kind,
                    a.range,
                    b.kind,
                    b.range,
                    a.rect,
                    b.rect
                );
            }
        }
    }
}

#[test]
fn every_range_resolves_at_every_width() {
    let contents = [
        ContentTree::from_text(TEXT),
        ContentTree::from_text("tab\tseparated\tcolumns"),
        ContentTree::from_text("cafe\u{301} au lait"),
        ContentTree::from_markdown("```\nfn a() {\n\tb();\n}\n```"),
    ];
    for content in contents {
        for columns in [5, 9, 14, 60] {
            let surface = MonospaceSurface::new(
                content.clone(),
                CellMetrics::default(),
                columns as f32 * 8.0,
            );
            let len = surface.content().text_len();
            for start in 0..len {
                for end in start + 1..=len {
                    let range = TextRange::new(start, end);
                    let first = resolve_range(&surface, range);
                    assert!(
                        first.as_ref().is_some_and(|r| !r.is_empty()),
                        "{range} at {columns} cols"
                    );
                    assert_eq!(first, resolve_range(&surface, range));
                }
            }
            assert_eq!(resolve_range(&surface, TextRange::new(len, len + 1)), None);
        }
    }
}
