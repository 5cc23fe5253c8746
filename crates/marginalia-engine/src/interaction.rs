//! Interaction State Machine.
//!
//! Tracks the single interactive surface open over the text: the selection
//! tooltip, the definition popup, or the annotation editor. The state is one
//! enum, so opening a surface always replaces whatever was open before.
//!
//! The machine does no IO. [`InteractionMachine::apply`] takes an [`Event`]
//! and returns the [`Effect`]s the host must carry out. Async work is
//! identified by an [`OpToken`]; its completion comes back as another event
//! carrying the same token. Tokens whose block unmounted or whose entity was
//! deleted in the meantime are forgotten, so late completions are no-ops.

use std::collections::HashMap;

use crate::entity::{BlockId, EntityId, HighlightEntity, Payload};
use crate::error::OverlayError;
use crate::geometry::Rect;
use crate::range::TextRange;
use crate::selection::SelectionSnapshot;
use crate::store::{DefinitionRecord, StoreError};

/// Identifies one in-flight collaborator call.
pub type OpToken = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionStatus {
    Loading,
    Ready {
        definition_text: String,
        entity: EntityId,
    },
    Failed(OverlayError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionSurface {
    pub block_id: BlockId,
    pub range: TextRange,
    pub term: String,
    pub anchor_rect: Rect,
    pub status: DefinitionStatus,
    pending: Option<OpToken>,
}

impl DefinitionSurface {
    pub fn is_loading(&self) -> bool {
        self.status == DefinitionStatus::Loading
    }
}

/// What the editor last tried to do, for retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorOp {
    Save,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationEditor {
    pub block_id: BlockId,
    pub range: TextRange,
    /// The highlighted text
    pub text: String,
    /// The note being edited. Survives failed saves.
    pub draft: String,
    /// Set when editing an annotation that already exists.
    pub existing: Option<EntityId>,
    pub anchor_rect: Rect,
    pub error: Option<OverlayError>,
    pending: Option<(OpToken, EditorOp)>,
    failed: Option<EditorOp>,
}

impl AnnotationEditor {
    pub fn is_saving(&self) -> bool {
        self.pending.is_some_and(|(_, op)| op == EditorOp::Save)
    }

    pub fn is_deleting(&self) -> bool {
        self.pending.is_some_and(|(_, op)| op == EditorOp::Delete)
    }
}

/// The action menu over a settled selection.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionTooltip {
    pub selection: SelectionSnapshot,
    /// Set when creating a rabbithole from this selection failed.
    pub error: Option<OverlayError>,
    pending: Option<OpToken>,
}

impl SelectionTooltip {
    fn new(selection: SelectionSnapshot) -> Self {
        Self {
            selection,
            error: None,
            pending: None,
        }
    }

    pub fn is_creating(&self) -> bool {
        self.pending.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum InteractionState {
    #[default]
    Idle,
    /// A live selection is being dragged; nothing is open yet.
    Selecting(SelectionSnapshot),
    /// The selection settled and the action menu is showing.
    Tooltip(SelectionTooltip),
    Definition(DefinitionSurface),
    Annotation(AnnotationEditor),
}

/// The three mutually exclusive surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    Tooltip,
    Definition,
    Annotation,
}

impl InteractionState {
    pub fn surface(&self) -> Option<Surface> {
        match self {
            InteractionState::Idle | InteractionState::Selecting(_) => None,
            InteractionState::Tooltip(_) => Some(Surface::Tooltip),
            InteractionState::Definition(_) => Some(Surface::Definition),
            InteractionState::Annotation(_) => Some(Surface::Annotation),
        }
    }

    pub fn block_id(&self) -> Option<&BlockId> {
        match self {
            InteractionState::Idle => None,
            InteractionState::Selecting(s) => Some(&s.block_id),
            InteractionState::Tooltip(t) => Some(&t.selection.block_id),
            InteractionState::Definition(d) => Some(&d.block_id),
            InteractionState::Annotation(a) => Some(&a.block_id),
        }
    }

    /// The selection to paint as a live highlight, if any.
    pub fn live_selection(&self) -> Option<&SelectionSnapshot> {
        match self {
            InteractionState::Selecting(s) => Some(s),
            InteractionState::Tooltip(t) => Some(&t.selection),
            _ => None,
        }
    }

    /// Whether a save or fetch issued by the open surface is in flight.
    pub fn is_busy(&self) -> bool {
        match self {
            InteractionState::Tooltip(t) => t.is_creating(),
            InteractionState::Definition(d) => d.is_loading(),
            InteractionState::Annotation(a) => a.pending.is_some(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TooltipAction {
    Define,
    Annotate,
    Rabbithole,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Undebounced selection change; `None` when collapsed or gone.
    SelectionChanged(Option<SelectionSnapshot>),
    SelectionSettled(SelectionSnapshot),
    SelectionCleared {
        block_id: BlockId,
    },
    Action(TooltipAction),
    HighlightClicked {
        entity: HighlightEntity,
        anchor_rect: Rect,
    },
    EditDraft(String),
    SaveAnnotation,
    DeleteAnnotation,
    Retry,
    Close,
    Escape,
    ClickOutside,
    DefinitionFetched {
        token: OpToken,
        result: Result<DefinitionRecord, StoreError>,
    },
    AnnotationSaved {
        token: OpToken,
        result: Result<HighlightEntity, StoreError>,
    },
    /// An update removed the old annotation but could not create its
    /// replacement.
    AnnotationReplaceFailed {
        token: OpToken,
        error: StoreError,
    },
    AnnotationDeleted {
        token: OpToken,
        result: Result<(), StoreError>,
    },
    RabbitholeCreated {
        token: OpToken,
        result: Result<String, StoreError>,
    },
    BlockUnmounted(BlockId),
    EntityRemoved(EntityId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    FetchDefinition {
        token: OpToken,
        block_id: BlockId,
        term: String,
        range: TextRange,
    },
    CreateAnnotation {
        token: OpToken,
        block_id: BlockId,
        text: String,
        note: String,
        range: TextRange,
    },
    /// Replace an annotation's note: delete at `range`, then create again.
    UpdateAnnotation {
        token: OpToken,
        block_id: BlockId,
        text: String,
        note: String,
        range: TextRange,
    },
    DeleteAnnotation {
        token: OpToken,
        block_id: BlockId,
        range: TextRange,
    },
    CreateRabbithole {
        token: OpToken,
        block_id: BlockId,
        range: TextRange,
        selected_text: String,
    },
    OpenConversation {
        conversation_id: String,
    },
    ClearNativeSelection,
    MergeEntity(HighlightEntity),
    RemoveEntity {
        block_id: BlockId,
        entity: EntityId,
    },
}

impl Effect {
    /// Whether the effect needs the external collaborator.
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            Effect::FetchDefinition { .. }
                | Effect::CreateAnnotation { .. }
                | Effect::UpdateAnnotation { .. }
                | Effect::DeleteAnnotation { .. }
                | Effect::CreateRabbithole { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PendingOp {
    Definition {
        range: TextRange,
    },
    Save {
        replaces: Option<EntityId>,
    },
    Delete {
        entity: EntityId,
    },
    Rabbithole {
        range: TextRange,
        selected_text: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Pending {
    block_id: BlockId,
    op: PendingOp,
}

impl Pending {
    fn targets(&self, entity: EntityId) -> bool {
        match self.op {
            PendingOp::Save { replaces } => replaces == Some(entity),
            PendingOp::Delete { entity: e } => e == entity,
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct InteractionMachine {
    state: InteractionState,
    pending: HashMap<OpToken, Pending>,
    next_token: OpToken,
}

impl InteractionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &InteractionState {
        &self.state
    }

    pub fn surface(&self) -> Option<Surface> {
        self.state.surface()
    }

    /// Number of collaborator calls whose completion will still be applied.
    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }

    /// Feed one event through the machine.
    pub fn apply(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::SelectionChanged(snapshot) => self.selection_changed(snapshot),
            Event::SelectionSettled(snapshot) => self.selection_settled(snapshot),
            Event::SelectionCleared { block_id } => {
                if self.state.live_selection().is_some_and(|s| s.block_id == block_id) {
                    self.state = InteractionState::Idle;
                }
                Vec::new()
            }
            Event::Action(action) => self.tooltip_action(action),
            Event::HighlightClicked {
                entity,
                anchor_rect,
            } => self.highlight_clicked(entity, anchor_rect),
            Event::EditDraft(draft) => {
                if let InteractionState::Annotation(editor) = &mut self.state {
                    if editor.pending.is_none() {
                        editor.draft = draft;
                    }
                }
                Vec::new()
            }
            Event::SaveAnnotation => self.editor_op(EditorOp::Save),
            Event::DeleteAnnotation => self.editor_op(EditorOp::Delete),
            Event::Retry => self.retry(),
            Event::Close | Event::Escape => self.close(),
            Event::ClickOutside => {
                if self.state.is_busy() {
                    log::debug!("ignoring outside click while a save is in flight");
                    Vec::new()
                } else {
                    self.close()
                }
            }
            Event::DefinitionFetched { token, result } => self.definition_fetched(token, result),
            Event::AnnotationSaved { token, result } => self.annotation_saved(token, result),
            Event::AnnotationReplaceFailed { token, error } => self.annotation_replace_failed(token, error),
            Event::AnnotationDeleted { token, result } => self.annotation_deleted(token, result),
            Event::RabbitholeCreated { token, result } => self.rabbithole_created(token, result),
            Event::BlockUnmounted(block_id) => {
                self.pending.retain(|_, p| p.block_id != block_id);
                if self.state.block_id() == Some(&block_id) {
                    self.state = InteractionState::Idle;
                }
                Vec::new()
            }
            Event::EntityRemoved(entity) => {
                self.pending.retain(|_, p| !p.targets(entity));
                let showing = match &self.state {
                    InteractionState::Annotation(a) => a.existing == Some(entity),
                    InteractionState::Definition(d) => {
                        matches!(d.status, DefinitionStatus::Ready { entity: e, .. } if e == entity)
                    }
                    _ => false,
                };
                if showing {
                    self.state = InteractionState::Idle;
                }
                Vec::new()
            }
        }
    }

    fn issue(&mut self, block_id: BlockId, op: PendingOp) -> OpToken {
        self.next_token += 1;
        self.pending.insert(self.next_token, Pending { block_id, op });
        self.next_token
    }

    fn selection_changed(&mut self, snapshot: Option<SelectionSnapshot>) -> Vec<Effect> {
        match (&self.state, snapshot) {
            // Open popups close through ClickOutside, not through the drag
            (InteractionState::Definition(_) | InteractionState::Annotation(_), _) => {}
            (InteractionState::Tooltip(t), _) if t.is_creating() => {}
            // Dragging back onto the reported range keeps the menu up
            (InteractionState::Tooltip(t), Some(s))
                if t.selection.block_id == s.block_id && t.selection.range == s.range => {}
            (_, Some(s)) => self.state = InteractionState::Selecting(s),
            (_, None) => self.state = InteractionState::Idle,
        }
        Vec::new()
    }

    fn selection_settled(&mut self, snapshot: SelectionSnapshot) -> Vec<Effect> {
        let replace = match &self.state {
            InteractionState::Idle | InteractionState::Selecting(_) => true,
            InteractionState::Tooltip(t) => !t.is_creating(),
            InteractionState::Definition(_) | InteractionState::Annotation(_) => false,
        };
        if replace {
            self.state = InteractionState::Tooltip(SelectionTooltip::new(snapshot));
        }
        Vec::new()
    }

    fn tooltip_action(&mut self, action: TooltipAction) -> Vec<Effect> {
        let InteractionState::Tooltip(tooltip) = &self.state else {
            return Vec::new();
        };
        if tooltip.is_creating() {
            return Vec::new();
        }
        let selection = tooltip.selection.clone();
        let block_id = selection.block_id.clone();
        match action {
            TooltipAction::Define => {
                let term = selection.text.trim().to_string();
                let token = self.issue(
                    block_id.clone(),
                    PendingOp::Definition {
                        range: selection.range,
                    },
                );
                self.state = InteractionState::Definition(DefinitionSurface {
                    block_id: block_id.clone(),
                    range: selection.range,
                    term: term.clone(),
                    anchor_rect: selection.anchor_rect,
                    status: DefinitionStatus::Loading,
                    pending: Some(token),
                });
                vec![
                    Effect::ClearNativeSelection,
                    Effect::FetchDefinition {
                        token,
                        block_id,
                        term,
                        range: selection.range,
                    },
                ]
            }
            TooltipAction::Annotate => {
                self.state = InteractionState::Annotation(AnnotationEditor {
                    block_id,
                    range: selection.range,
                    text: selection.text,
                    draft: String::new(),
                    existing: None,
                    anchor_rect: selection.anchor_rect,
                    error: None,
                    pending: None,
                    failed: None,
                });
                vec![Effect::ClearNativeSelection]
            }
            TooltipAction::Rabbithole => self.create_rabbithole(selection),
        }
    }

    /// The tooltip stays up until the link exists, so a failure can be shown
    /// and retried from it.
    fn create_rabbithole(&mut self, selection: SelectionSnapshot) -> Vec<Effect> {
        let token = self.issue(
            selection.block_id.clone(),
            PendingOp::Rabbithole {
                range: selection.range,
                selected_text: selection.text.clone(),
            },
        );
        if let InteractionState::Tooltip(tooltip) = &mut self.state {
            tooltip.pending = Some(token);
            tooltip.error = None;
        }
        vec![Effect::CreateRabbithole {
            token,
            block_id: selection.block_id,
            range: selection.range,
            selected_text: selection.text,
        }]
    }

    fn highlight_clicked(&mut self, entity: HighlightEntity, anchor_rect: Rect) -> Vec<Effect> {
        if self.state.is_busy() {
            return Vec::new();
        }
        let Some(range) = entity.range() else {
            return Vec::new();
        };
        match entity.payload {
            Payload::Definition {
                term,
                definition_text,
            } => {
                self.state = InteractionState::Definition(DefinitionSurface {
                    block_id: entity.block_id,
                    range,
                    term,
                    anchor_rect,
                    status: DefinitionStatus::Ready {
                        definition_text,
                        entity: entity.id,
                    },
                    pending: None,
                });
                Vec::new()
            }
            Payload::Annotation { text, note } => {
                self.state = InteractionState::Annotation(AnnotationEditor {
                    block_id: entity.block_id,
                    range,
                    text,
                    draft: note,
                    existing: Some(entity.id),
                    anchor_rect,
                    error: None,
                    pending: None,
                    failed: None,
                });
                Vec::new()
            }
            Payload::RabbitholeLink {
                conversation_id, ..
            } => {
                self.state = InteractionState::Idle;
                vec![Effect::OpenConversation { conversation_id }]
            }
            Payload::GeneratedNote { .. } | Payload::LiveSelection { .. } => Vec::new(),
        }
    }

    fn editor_op(&mut self, op: EditorOp) -> Vec<Effect> {
        let InteractionState::Annotation(editor) = &self.state else {
            return Vec::new();
        };
        if editor.pending.is_some() {
            return Vec::new();
        }
        let (block_id, range, existing) = (editor.block_id.clone(), editor.range, editor.existing);
        let (text, note) = (editor.text.clone(), editor.draft.clone());

        let (token, effect) = match (op, existing) {
            (EditorOp::Save, replaces) => {
                let token = self.issue(block_id.clone(), PendingOp::Save { replaces });
                let effect = if replaces.is_some() {
                    Effect::UpdateAnnotation {
                        token,
                        block_id,
                        text,
                        note,
                        range,
                    }
                } else {
                    Effect::CreateAnnotation {
                        token,
                        block_id,
                        text,
                        note,
                        range,
                    }
                };
                (token, effect)
            }
            (EditorOp::Delete, Some(entity)) => {
                let token = self.issue(block_id.clone(), PendingOp::Delete { entity });
                (
                    token,
                    Effect::DeleteAnnotation {
                        token,
                        block_id,
                        range,
                    },
                )
            }
            // Nothing to delete for an annotation that was never saved
            (EditorOp::Delete, None) => return self.close(),
        };

        if let InteractionState::Annotation(editor) = &mut self.state {
            editor.pending = Some((token, op));
            editor.error = None;
            editor.failed = None;
        }
        vec![effect]
    }

    fn retry(&mut self) -> Vec<Effect> {
        let refetch = match &self.state {
            InteractionState::Definition(surface)
                if matches!(surface.status, DefinitionStatus::Failed(_)) =>
            {
                Some((surface.block_id.clone(), surface.range, surface.term.clone()))
            }
            InteractionState::Annotation(editor) => {
                return match editor.failed {
                    Some(op) => self.editor_op(op),
                    None => Vec::new(),
                };
            }
            InteractionState::Tooltip(tooltip) if tooltip.error.is_some() && !tooltip.is_creating() => {
                let selection = tooltip.selection.clone();
                return self.create_rabbithole(selection);
            }
            _ => None,
        };
        let Some((block_id, range, term)) = refetch else {
            return Vec::new();
        };
        let token = self.issue(block_id.clone(), PendingOp::Definition { range });
        if let InteractionState::Definition(surface) = &mut self.state {
            surface.status = DefinitionStatus::Loading;
            surface.pending = Some(token);
        }
        vec![Effect::FetchDefinition {
            token,
            block_id,
            term,
            range,
        }]
    }

    fn close(&mut self) -> Vec<Effect> {
        let had_selection = self.state.live_selection().is_some();
        self.state = InteractionState::Idle;
        if had_selection {
            vec![Effect::ClearNativeSelection]
        } else {
            Vec::new()
        }
    }

    fn definition_fetched(
        &mut self,
        token: OpToken,
        result: Result<DefinitionRecord, StoreError>,
    ) -> Vec<Effect> {
        let Some(Pending {
            block_id,
            op: PendingOp::Definition { range },
        }) = self.pending.remove(&token)
        else {
            return Vec::new();
        };
        let surface = match &mut self.state {
            InteractionState::Definition(d) if d.pending == Some(token) => Some(d),
            _ => None,
        };
        match result {
            Ok(record) => {
                let entity = HighlightEntity::definition(
                    block_id,
                    range,
                    record.term,
                    record.definition_text.clone(),
                    record.created_at,
                );
                if let Some(surface) = surface {
                    surface.pending = None;
                    surface.status = DefinitionStatus::Ready {
                        definition_text: record.definition_text,
                        entity: entity.id,
                    };
                }
                vec![Effect::MergeEntity(entity)]
            }
            Err(err) => {
                log::warn!("definition fetch failed for block {block_id}: {err}");
                if let Some(surface) = surface {
                    surface.pending = None;
                    surface.status = DefinitionStatus::Failed(OverlayError::SaveFailed {
                        op: "define",
                        message: err.to_string(),
                    });
                }
                Vec::new()
            }
        }
    }

    fn annotation_saved(
        &mut self,
        token: OpToken,
        result: Result<HighlightEntity, StoreError>,
    ) -> Vec<Effect> {
        let Some(Pending {
            block_id,
            op: PendingOp::Save { replaces },
        }) = self.pending.remove(&token)
        else {
            return Vec::new();
        };
        let open = matches!(&self.state, InteractionState::Annotation(a) if a.pending.is_some_and(|(t, _)| t == token));
        match result {
            Ok(entity) => {
                if open {
                    self.state = InteractionState::Idle;
                }
                let mut effects = Vec::new();
                if let Some(old) = replaces {
                    effects.push(Effect::RemoveEntity {
                        block_id,
                        entity: old,
                    });
                }
                effects.push(Effect::MergeEntity(entity));
                effects
            }
            Err(err) => {
                log::warn!("annotation save failed for block {block_id}: {err}");
                self.fail_editor(token, EditorOp::Save, "save annotation", err);
                Vec::new()
            }
        }
    }

    fn annotation_replace_failed(&mut self, token: OpToken, error: StoreError) -> Vec<Effect> {
        let Some(Pending {
            block_id,
            op: PendingOp::Save { replaces },
        }) = self.pending.remove(&token)
        else {
            return Vec::new();
        };
        log::warn!("annotation update lost its original in block {block_id}: {error}");
        if let InteractionState::Annotation(editor) = &mut self.state {
            // The old annotation is gone, so saving again has to create one
            if editor.pending.is_some_and(|(t, _)| t == token) {
                editor.existing = None;
            }
        }
        self.fail_editor(token, EditorOp::Save, "save annotation", error);
        replaces
            .map(|entity| Effect::RemoveEntity { block_id, entity })
            .into_iter()
            .collect()
    }

    fn annotation_deleted(&mut self, token: OpToken, result: Result<(), StoreError>) -> Vec<Effect> {
        let Some(Pending {
            block_id,
            op: PendingOp::Delete { entity },
        }) = self.pending.remove(&token)
        else {
            return Vec::new();
        };
        match result {
            Ok(()) => {
                if matches!(&self.state, InteractionState::Annotation(a) if a.existing == Some(entity))
                {
                    self.state = InteractionState::Idle;
                }
                vec![Effect::RemoveEntity { block_id, entity }]
            }
            Err(err) => {
                log::warn!("annotation delete failed for block {block_id}: {err}");
                self.fail_editor(token, EditorOp::Delete, "delete annotation", err);
                Vec::new()
            }
        }
    }

    fn rabbithole_created(&mut self, token: OpToken, result: Result<String, StoreError>) -> Vec<Effect> {
        let Some(Pending {
            block_id,
            op: PendingOp::Rabbithole {
                range,
                selected_text,
            },
        }) = self.pending.remove(&token)
        else {
            return Vec::new();
        };
        let open = matches!(&self.state, InteractionState::Tooltip(t) if t.pending == Some(token));
        match result {
            Ok(conversation_id) => {
                let entity = HighlightEntity::rabbithole(
                    block_id,
                    range,
                    conversation_id.clone(),
                    selected_text,
                    crate::entity::now_millis(),
                );
                let mut effects = Vec::new();
                if open {
                    self.state = InteractionState::Idle;
                    effects.push(Effect::ClearNativeSelection);
                }
                effects.push(Effect::MergeEntity(entity));
                effects.push(Effect::OpenConversation { conversation_id });
                effects
            }
            Err(err) => {
                log::warn!("rabbithole creation failed for block {block_id}: {err}");
                if let InteractionState::Tooltip(tooltip) = &mut self.state {
                    if open {
                        tooltip.pending = None;
                        tooltip.error = Some(OverlayError::SaveFailed {
                            op: "create rabbithole",
                            message: err.to_string(),
                        });
                    }
                }
                Vec::new()
            }
        }
    }

    fn fail_editor(&mut self, token: OpToken, op: EditorOp, label: &'static str, err: StoreError) {
        let InteractionState::Annotation(editor) = &mut self.state else {
            return;
        };
        if editor.pending.is_some_and(|(t, _)| t == token) {
            editor.pending = None;
            editor.failed = Some(op);
            editor.error = Some(OverlayError::SaveFailed {
                op: label,
                message: err.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn block() -> BlockId {
        BlockId::new("p1")
    }

    fn quick() -> SelectionSnapshot {
        SelectionSnapshot {
            block_id: block(),
            text: "quick".into(),
            range: TextRange::new(4, 9),
            anchor_rect: Rect::new(32.0, 0.0, 40.0, 16.0),
        }
    }

    fn tooltip() -> InteractionMachine {
        let mut m = InteractionMachine::new();
        m.apply(Event::SelectionChanged(Some(quick())));
        m.apply(Event::SelectionSettled(quick()));
        m
    }

    fn token_of(effects: &[Effect]) -> OpToken {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::FetchDefinition { token, .. }
                | Effect::CreateAnnotation { token, .. }
                | Effect::UpdateAnnotation { token, .. }
                | Effect::DeleteAnnotation { token, .. }
                | Effect::CreateRabbithole { token, .. } => Some(*token),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn selection_flows_to_tooltip() {
        let mut m = InteractionMachine::new();
        m.apply(Event::SelectionChanged(Some(quick())));
        assert!(matches!(m.state(), InteractionState::Selecting(_)));
        assert_eq!(m.surface(), None);
        m.apply(Event::SelectionSettled(quick()));
        assert_eq!(m.surface(), Some(Surface::Tooltip));
        assert_eq!(m.state().live_selection().map(|s| s.range), Some(TextRange::new(4, 9)));
    }

    #[test]
    fn define_opens_loading_then_ready() {
        let mut m = tooltip();
        let effects = m.apply(Event::Action(TooltipAction::Define));
        assert!(effects.contains(&Effect::ClearNativeSelection));
        let token = token_of(&effects);
        let InteractionState::Definition(d) = m.state() else {
            panic!("expected definition surface");
        };
        assert!(d.is_loading());
        assert_eq!(d.term, "quick");

        let effects = m.apply(Event::DefinitionFetched {
            token,
            result: Ok(DefinitionRecord {
                term: "quick".into(),
                definition_text: "moving fast".into(),
                created_at: 5,
            }),
        });
        let [Effect::MergeEntity(entity)] = effects.as_slice() else {
            panic!("expected a merge, got {effects:?}");
        };
        assert_eq!(entity.range(), Some(TextRange::new(4, 9)));
        let InteractionState::Definition(d) = m.state() else {
            panic!("definition surface closed");
        };
        assert_eq!(
            d.status,
            DefinitionStatus::Ready {
                definition_text: "moving fast".into(),
                entity: entity.id
            }
        );
    }

    #[test]
    fn outside_click_ignored_while_loading() {
        let mut m = tooltip();
        m.apply(Event::Action(TooltipAction::Define));
        assert!(m.apply(Event::ClickOutside).is_empty());
        assert_eq!(m.surface(), Some(Surface::Definition));
        m.apply(Event::Escape);
        assert_eq!(m.surface(), None);
    }

    #[test]
    fn failed_fetch_stays_open_and_retries() {
        let mut m = tooltip();
        let token = token_of(&m.apply(Event::Action(TooltipAction::Define)));
        m.apply(Event::DefinitionFetched {
            token,
            result: Err(StoreError::Unavailable("offline".into())),
        });
        let InteractionState::Definition(d) = m.state() else {
            panic!("surface dropped on failure");
        };
        assert!(matches!(d.status, DefinitionStatus::Failed(OverlayError::SaveFailed { .. })));

        let retry = m.apply(Event::Retry);
        assert_ne!(token_of(&retry), token);
        assert!(m.state().is_busy());
    }

    #[test]
    fn failed_save_keeps_draft() {
        let mut m = tooltip();
        m.apply(Event::Action(TooltipAction::Annotate));
        m.apply(Event::EditDraft("my note".into()));
        let token = token_of(&m.apply(Event::SaveAnnotation));
        assert!(m.state().is_busy());
        m.apply(Event::AnnotationSaved {
            token,
            result: Err(StoreError::Rejected("nope".into())),
        });
        let InteractionState::Annotation(editor) = m.state() else {
            panic!("editor closed on failure");
        };
        assert_eq!(editor.draft, "my note");
        assert!(editor.error.is_some());
        assert!(!m.state().is_busy());

        let retry = m.apply(Event::Retry);
        assert!(matches!(retry.as_slice(), [Effect::CreateAnnotation { note, .. }] if note == "my note"));
    }

    #[test]
    fn editing_existing_annotation_updates_and_replaces() {
        let mut m = InteractionMachine::new();
        let existing = HighlightEntity::annotation(block(), TextRange::new(10, 19), "brown fox", "old", 1);
        m.apply(Event::HighlightClicked {
            entity: existing.clone(),
            anchor_rect: Rect::ZERO,
        });
        let InteractionState::Annotation(editor) = m.state() else {
            panic!("expected editor");
        };
        assert_eq!(editor.draft, "old");

        m.apply(Event::EditDraft("new".into()));
        let effects = m.apply(Event::SaveAnnotation);
        assert!(matches!(effects.as_slice(), [Effect::UpdateAnnotation { note, .. }] if note == "new"));
        let saved = HighlightEntity::annotation(block(), TextRange::new(10, 19), "brown fox", "new", 2);
        let effects = m.apply(Event::AnnotationSaved {
            token: token_of(&effects),
            result: Ok(saved.clone()),
        });
        assert_eq!(
            effects,
            vec![
                Effect::RemoveEntity {
                    block_id: block(),
                    entity: existing.id
                },
                Effect::MergeEntity(saved)
            ]
        );
        assert_eq!(m.surface(), None);
    }

    #[test]
    fn rabbithole_click_opens_conversation() {
        let mut m = tooltip();
        let link = HighlightEntity::rabbithole(block(), TextRange::new(4, 9), "conv-7", "quick", 1);
        let effects = m.apply(Event::HighlightClicked {
            entity: link,
            anchor_rect: Rect::ZERO,
        });
        assert_eq!(
            effects,
            vec![Effect::OpenConversation {
                conversation_id: "conv-7".into()
            }]
        );
        assert_eq!(m.surface(), None);
    }

    #[test]
    fn rabbithole_action_creates_then_opens() {
        let mut m = tooltip();
        let token = token_of(&m.apply(Event::Action(TooltipAction::Rabbithole)));
        assert_eq!(m.surface(), Some(Surface::Tooltip));
        assert!(m.state().is_busy());
        let effects = m.apply(Event::RabbitholeCreated {
            token,
            result: Ok("conv-1".into()),
        });
        assert_eq!(effects[0], Effect::ClearNativeSelection);
        assert!(matches!(&effects[1], Effect::MergeEntity(e) if e.range() == Some(TextRange::new(4, 9))));
        assert_eq!(
            effects[2],
            Effect::OpenConversation {
                conversation_id: "conv-1".into()
            }
        );
        assert_eq!(m.surface(), None);
    }

    #[test]
    fn failed_rabbithole_keeps_tooltip_and_retries() {
        let mut m = tooltip();
        let token = token_of(&m.apply(Event::Action(TooltipAction::Rabbithole)));
        let effects = m.apply(Event::RabbitholeCreated {
            token,
            result: Err(StoreError::Unavailable("offline".into())),
        });
        assert!(effects.is_empty());
        let InteractionState::Tooltip(t) = m.state() else {
            panic!("tooltip closed on failure");
        };
        assert!(matches!(
            t.error,
            Some(OverlayError::SaveFailed {
                op: "create rabbithole",
                ..
            })
        ));
        assert!(!m.state().is_busy());

        let retry = m.apply(Event::Retry);
        assert!(matches!(
            retry.as_slice(),
            [Effect::CreateRabbithole { range, .. }] if *range == TextRange::new(4, 9)
        ));
        assert_ne!(token_of(&retry), token);
    }

    #[test]
    fn drag_back_onto_reported_range_keeps_tooltip() {
        let mut m = tooltip();
        let mut wider = quick();
        wider.range = TextRange::new(4, 10);
        m.apply(Event::SelectionChanged(Some(quick())));
        assert_eq!(m.surface(), Some(Surface::Tooltip));

        m.apply(Event::SelectionChanged(Some(wider)));
        assert!(matches!(m.state(), InteractionState::Selecting(_)));
        m.apply(Event::SelectionSettled(quick()));
        assert_eq!(m.surface(), Some(Surface::Tooltip));
    }

    #[test]
    fn update_that_loses_the_original_falls_back_to_create() {
        let mut m = InteractionMachine::new();
        let existing = HighlightEntity::annotation(block(), TextRange::new(10, 19), "brown fox", "old", 1);
        m.apply(Event::HighlightClicked {
            entity: existing.clone(),
            anchor_rect: Rect::ZERO,
        });
        m.apply(Event::EditDraft("new".into()));
        let token = token_of(&m.apply(Event::SaveAnnotation));

        let effects = m.apply(Event::AnnotationReplaceFailed {
            token,
            error: StoreError::Unavailable("offline".into()),
        });
        assert_eq!(
            effects,
            vec![Effect::RemoveEntity {
                block_id: block(),
                entity: existing.id
            }]
        );
        let InteractionState::Annotation(editor) = m.state() else {
            panic!("editor closed on failure");
        };
        assert_eq!(editor.existing, None);
        assert_eq!(editor.draft, "new");
        assert!(editor.error.is_some());

        let retry = m.apply(Event::Retry);
        assert!(matches!(retry.as_slice(), [Effect::CreateAnnotation { note, .. }] if note == "new"));
    }

    #[test]
    fn completion_after_unmount_is_a_no_op() {
        let mut m = tooltip();
        let token = token_of(&m.apply(Event::Action(TooltipAction::Define)));
        m.apply(Event::BlockUnmounted(block()));
        assert_eq!(m.surface(), None);
        assert_eq!(m.pending_ops(), 0);
        let effects = m.apply(Event::DefinitionFetched {
            token,
            result: Ok(DefinitionRecord {
                term: "quick".into(),
                definition_text: "fast".into(),
                created_at: 1,
            }),
        });
        assert!(effects.is_empty());
    }

    #[test]
    fn closed_surface_still_merges_successful_result() {
        let mut m = tooltip();
        let token = token_of(&m.apply(Event::Action(TooltipAction::Define)));
        m.apply(Event::Close);
        let effects = m.apply(Event::DefinitionFetched {
            token,
            result: Ok(DefinitionRecord {
                term: "quick".into(),
                definition_text: "fast".into(),
                created_at: 1,
            }),
        });
        assert_eq!(effects.len(), 1);
        assert_eq!(m.surface(), None);
    }

    #[test]
    fn removing_the_edited_entity_closes_editor_and_drops_its_save() {
        let mut m = InteractionMachine::new();
        let existing = HighlightEntity::annotation(block(), TextRange::new(10, 19), "brown fox", "old", 1);
        m.apply(Event::HighlightClicked {
            entity: existing.clone(),
            anchor_rect: Rect::ZERO,
        });
        let token = token_of(&m.apply(Event::SaveAnnotation));
        m.apply(Event::EntityRemoved(existing.id));
        assert_eq!(m.surface(), None);
        let late = m.apply(Event::AnnotationSaved {
            token,
            result: Ok(existing),
        });
        assert!(late.is_empty());
    }

    #[test]
    fn opening_a_surface_replaces_the_previous_one() {
        let mut m = InteractionMachine::new();
        let def = HighlightEntity::definition(block(), TextRange::new(4, 9), "quick", "fast", 1);
        let ann = HighlightEntity::annotation(block(), TextRange::new(10, 19), "brown fox", "n", 1);
        m.apply(Event::HighlightClicked {
            entity: def,
            anchor_rect: Rect::ZERO,
        });
        assert_eq!(m.surface(), Some(Surface::Definition));
        m.apply(Event::HighlightClicked {
            entity: ann,
            anchor_rect: Rect::ZERO,
        });
        assert_eq!(m.surface(), Some(Surface::Annotation));
    }
}
