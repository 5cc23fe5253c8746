//! Offset-based highlight overlay engine.
//!
//! A block of rendered text carries highlights of several kinds (annotations,
//! definitions, rabbithole links, the live selection) anchored to character
//! ranges. This crate maps those ranges to rectangles on whatever text layout
//! the host provides, keeps overlapping kinds visually and clickably apart,
//! and arbitrates the single popup that may be open over the text.
//!
//! Layering, leaf-first: [`offsets`] → [`arbiter`] → [`overlay`], with
//! [`selection`] feeding [`interaction`], and [`session`] tying it all to a
//! [`store::MetadataStore`].

pub mod arbiter;
pub mod content;
pub mod entity;
pub mod error;
pub mod geometry;
pub mod interaction;
pub mod layout;
pub mod offsets;
pub mod overlay;
pub mod range;
pub mod selection;
pub mod session;
pub mod store;

// Re-export key types for easier usage
pub use arbiter::{OverlapArbiter, OverlayConfig};
pub use content::ContentTree;
pub use entity::{Anchor, BlockId, EntityId, HighlightEntity, HighlightKind, Payload};
pub use error::OverlayError;
pub use geometry::{Point, Rect, Size};
pub use interaction::{Effect, Event, InteractionMachine, InteractionState, Surface, TooltipAction};
pub use layout::{CellMetrics, Glyph, MonospaceSurface, TextSurface};
pub use offsets::{resolve_range, resolve_range_local};
pub use overlay::{BlockOverlay, OverlayFrame, RecomputeTrigger};
pub use range::TextRange;
pub use selection::{NativeSelection, SelectionConfig, SelectionPoint, SelectionSnapshot, SelectionTracker};
pub use session::ReaderSession;
pub use store::{MemoryStore, MetadataStore, StoreError};
