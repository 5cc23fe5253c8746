//! Reader session: wires the state machine, the selection trackers, the block
//! overlays and the entity sets together, and runs collaborator calls.
//!
//! Everything here runs on one thread. Collaborator calls are awaited by
//! [`execute`]; a host that wants to stay responsive while one is in flight
//! calls [`ReaderSession::dispatch`], runs the returned effects itself, and
//! feeds the completion back in later. [`ReaderSession::dispatch_and_settle`]
//! does the whole round trip in one go.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;

use crate::arbiter::OverlayConfig;
use crate::entity::{BlockId, EntityId, HighlightEntity, HighlightKind};
use crate::geometry::{Point, Rect};
use crate::interaction::{Effect, Event, InteractionMachine, InteractionState};
use crate::layout::TextSurface;
use crate::overlay::{BlockOverlay, HighlightClick, OverlayFrame, RecomputeTrigger};
use crate::selection::{NativeSelection, SelectionConfig, SelectionSignal, SelectionTracker};
use crate::store::{EntityStore, MetadataStore};

#[derive(Debug)]
struct MountedBlock {
    overlay: BlockOverlay,
    tracker: SelectionTracker,
}

pub struct ReaderSession<S> {
    store: Rc<S>,
    entities: EntityStore,
    machine: InteractionMachine,
    blocks: HashMap<BlockId, MountedBlock>,
    overlay_config: OverlayConfig,
    selection_config: SelectionConfig,
}

impl<S: MetadataStore> ReaderSession<S> {
    pub fn new(store: Rc<S>, overlay_config: OverlayConfig, selection_config: SelectionConfig) -> Self {
        Self {
            store,
            entities: EntityStore::new(),
            machine: InteractionMachine::new(),
            blocks: HashMap::new(),
            overlay_config,
            selection_config,
        }
    }

    pub fn store(&self) -> Rc<S> {
        Rc::clone(&self.store)
    }

    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    pub fn state(&self) -> &InteractionState {
        self.machine.state()
    }

    pub fn is_mounted(&self, block_id: &BlockId) -> bool {
        self.blocks.contains_key(block_id)
    }

    /// Seed a block's entities, e.g. from persisted metadata.
    pub fn load_entities(&mut self, block_id: BlockId, entities: Vec<HighlightEntity>) {
        self.entities.replace(block_id, entities);
    }

    /// Start tracking a rendered block. `index` is its position in the
    /// document.
    pub fn mount_block(&mut self, block_id: BlockId, index: usize) {
        log::debug!("mounting block {block_id} at {index}");
        self.blocks.insert(
            block_id.clone(),
            MountedBlock {
                overlay: BlockOverlay::new(block_id.clone(), self.overlay_config),
                tracker: SelectionTracker::new(block_id, index, self.selection_config),
            },
        );
    }

    /// Stop tracking a block. Pending collaborator calls for it are dropped.
    pub fn unmount_block(&mut self, block_id: &BlockId) {
        if self.blocks.remove(block_id).is_some() {
            log::debug!("unmounted block {block_id}");
            self.machine.apply(Event::BlockUnmounted(block_id.clone()));
        }
    }

    /// Unmount a block and destroy its entities.
    pub fn delete_block(&mut self, block_id: &BlockId) {
        self.unmount_block(block_id);
        self.entities.remove_block(block_id);
    }

    /// Remove an entity that was deleted outside this session.
    pub fn remove_entity(&mut self, block_id: &BlockId, entity: EntityId) {
        if self.entities.remove(block_id, entity) {
            self.machine.apply(Event::EntityRemoved(entity));
        }
    }

    /// Block-anchored notes for a block, oldest first.
    pub fn generated_notes(&self, block_id: &BlockId) -> Vec<HighlightEntity> {
        let mut notes: Vec<HighlightEntity> = self
            .entities
            .snapshot(block_id)
            .iter()
            .filter(|e| e.kind() == HighlightKind::GeneratedNote)
            .cloned()
            .collect();
        notes.sort_by_key(|n| n.created_at);
        notes
    }

    /// Recompute hook for the host: call after any mutation of the block's
    /// content or container.
    pub fn invalidate(&mut self, block_id: &BlockId, trigger: RecomputeTrigger) {
        if let Some(block) = self.blocks.get_mut(block_id) {
            block.overlay.invalidate(trigger);
        }
    }

    /// Invalidate every mounted block, e.g. after a window resize.
    pub fn invalidate_all(&mut self, trigger: RecomputeTrigger) {
        for block in self.blocks.values_mut() {
            block.overlay.invalidate(trigger);
        }
    }

    /// Apply an event and the effects that only touch local state. Returns
    /// the effects the host still has to carry out: collaborator calls,
    /// opening a conversation, clearing the native selection.
    pub fn dispatch(&mut self, event: Event) -> Vec<Effect> {
        let effects = self.machine.apply(event);
        let mut remaining = Vec::with_capacity(effects.len());
        for effect in effects {
            match effect {
                Effect::MergeEntity(entity) => {
                    // The block may have been deleted while the call was pending
                    if self.blocks.contains_key(&entity.block_id) {
                        log::info!("{} {} added to block {}", entity.kind().label(), entity.id, entity.block_id);
                        self.entities.merge(entity);
                    }
                }
                Effect::RemoveEntity { block_id, entity } => {
                    self.entities.remove(&block_id, entity);
                }
                Effect::ClearNativeSelection => {
                    for block in self.blocks.values_mut() {
                        block.tracker.reset();
                    }
                    remaining.push(Effect::ClearNativeSelection);
                }
                other => remaining.push(other),
            }
        }
        remaining
    }

    /// Dispatch an event and run every collaborator call it causes, feeding
    /// completions back in until nothing is left. Returns the host effects.
    pub async fn dispatch_and_settle(&mut self, event: Event) -> Vec<Effect> {
        let mut queue = VecDeque::from([event]);
        let mut host = Vec::new();
        while let Some(event) = queue.pop_front() {
            for effect in self.dispatch(event) {
                if effect.is_async() {
                    if let Some(completion) = execute(&*self.store, &effect).await {
                        queue.push_back(completion);
                    }
                } else {
                    host.push(effect);
                }
            }
        }
        host
    }

    /// Render a mounted block's highlights against its current layout.
    pub fn render_block(&mut self, block_id: &BlockId, surface: &dyn TextSurface) -> Option<&OverlayFrame> {
        let snapshot = self.entities.snapshot(block_id);
        let live = self
            .machine
            .state()
            .live_selection()
            .filter(|s| &s.block_id == block_id)
            .map(|s| (s.range, s.text.clone()));
        let block = self.blocks.get_mut(block_id)?;
        block.overlay.set_entities(snapshot);
        block.overlay.set_live_selection(live);
        Some(block.overlay.render(surface))
    }

    /// The highlight strip under a container-relative point, without acting
    /// on it.
    pub fn highlight_at(&mut self, block_id: &BlockId, surface: &dyn TextSurface, point: Point) -> Option<HighlightClick> {
        self.render_block(block_id, surface)?;
        self.blocks.get(block_id)?.overlay.hit_test(surface, point)
    }

    /// A click at a container-relative point. Hitting a highlight strip opens
    /// its surface; anything else counts as a click outside.
    pub fn click(&mut self, block_id: &BlockId, surface: &dyn TextSurface, point: Point) -> Vec<Effect> {
        let hit = self.render_block(block_id, surface).and_then(|frame| {
            let click = crate::arbiter::hit_test(&frame.placed, point)?;
            let anchor = frame
                .rects_for(click.entity)
                .into_iter()
                .reduce(|a, b| a.union(&b))
                .unwrap_or(Rect::ZERO);
            Some((click.entity, anchor))
        });
        let entity = hit.and_then(|(id, anchor)| {
            self.entities
                .snapshot(block_id)
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .map(|e| (e, anchor))
        });
        match entity {
            Some((entity, anchor_rect)) => {
                log::debug!("clicked {} {}", entity.kind().label(), entity.id);
                self.dispatch(Event::HighlightClicked {
                    entity,
                    anchor_rect,
                })
            }
            None => self.dispatch(Event::ClickOutside),
        }
    }

    /// Feed a native selection change for a block.
    pub fn observe_selection(
        &mut self,
        block_id: &BlockId,
        now: Instant,
        native: Option<&NativeSelection>,
        surface: &dyn TextSurface,
    ) -> Vec<Effect> {
        let Some(block) = self.blocks.get_mut(block_id) else {
            return Vec::new();
        };
        let live = block.tracker.observe(now, native, surface);
        self.dispatch(Event::SelectionChanged(live))
    }

    /// Let a block's tracker report a settled selection.
    pub fn poll_selection(&mut self, block_id: &BlockId, now: Instant, surface: &dyn TextSurface) -> Vec<Effect> {
        let Some(block) = self.blocks.get_mut(block_id) else {
            return Vec::new();
        };
        match block.tracker.poll(now, surface) {
            Some(SelectionSignal::Settled(snapshot)) => self.dispatch(Event::SelectionSettled(snapshot)),
            Some(SelectionSignal::Cleared { block_id }) => self.dispatch(Event::SelectionCleared { block_id }),
            None => Vec::new(),
        }
    }

    /// Earliest pending selection deadline across all blocks.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.blocks.values().filter_map(|b| b.tracker.deadline()).min()
    }
}

/// Run one collaborator effect and turn its outcome into the completion event.
/// Effects that need no collaborator return `None`.
pub async fn execute<S: MetadataStore + ?Sized>(store: &S, effect: &Effect) -> Option<Event> {
    let event = match effect {
        Effect::FetchDefinition {
            token,
            block_id,
            term,
            range,
        } => Event::DefinitionFetched {
            token: *token,
            result: store.fetch_or_create_definition(block_id, term, *range).await,
        },
        Effect::CreateAnnotation {
            token,
            block_id,
            text,
            note,
            range,
        } => Event::AnnotationSaved {
            token: *token,
            result: store.create_annotation(block_id, text, note, *range).await,
        },
        Effect::UpdateAnnotation {
            token,
            block_id,
            text,
            note,
            range,
        } => match store.delete_annotation(block_id, *range).await {
            Ok(()) => match store.create_annotation(block_id, text, note, *range).await {
                Ok(entity) => Event::AnnotationSaved {
                    token: *token,
                    result: Ok(entity),
                },
                // The original is already gone at this point
                Err(error) => Event::AnnotationReplaceFailed { token: *token, error },
            },
            Err(err) => Event::AnnotationSaved {
                token: *token,
                result: Err(err),
            },
        },
        Effect::DeleteAnnotation {
            token,
            block_id,
            range,
        } => Event::AnnotationDeleted {
            token: *token,
            result: store.delete_annotation(block_id, *range).await,
        },
        Effect::CreateRabbithole {
            token,
            block_id,
            range,
            selected_text,
        } => Event::RabbitholeCreated {
            token: *token,
            result: store.create_rabbithole_link(block_id, *range, selected_text).await,
        },
        Effect::OpenConversation { .. }
        | Effect::ClearNativeSelection
        | Effect::MergeEntity(_)
        | Effect::RemoveEntity { .. } => return None,
    };
    Some(event)
}
