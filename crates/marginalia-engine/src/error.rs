use crate::entity::EntityId;
use crate::range::TextRange;

/// Failures the overlay engine can report.
///
/// None of these are fatal to a block: geometry problems degrade to "render
/// nothing for this entity this pass", and save failures are shown inline in
/// the surface that issued them.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OverlayError {
    /// The range is not renderable yet (content still loading, or shorter
    /// than the range). Retried on the next recompute.
    #[error("range {range} of entity {entity} cannot be resolved yet")]
    GeometryUnresolved { entity: EntityId, range: TextRange },

    /// Malformed offsets. The entity is dropped from rendering. `len` is the
    /// block's text length when the range was checked against one.
    #[error(
        "invalid range {start}..{end}{}",
        .len.map(|len| format!(" for text of length {len}")).unwrap_or_default()
    )]
    RangeInvalid {
        start: i64,
        end: i64,
        len: Option<usize>,
    },

    /// The external collaborator rejected a create/update/delete/fetch.
    #[error("{op} failed: {message}")]
    SaveFailed { op: &'static str, message: String },
}

impl OverlayError {
    /// Whether this failure should be retried silently on the next pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, OverlayError::GeometryUnresolved { .. })
    }
}
