//! Point-in-time recovery for a source.
//!
//! A [`CheckpointingSource`] keeps a bounded [`Window`] of its most
//! recent state and, every `checkpoint_freq` ticks, freezes a copy of
//! it in its [`CheckpointStore`] keyed by the newest sequence number
//! in the window.
//!
//! Rollback
//! --------
//!
//! On [`crate::model::ControlCommand::Rollback`] the source either:
//!
//! - Restores checkpoint `R`: the window becomes the snapshot, the
//!   next tick emits `R + 1`, every checkpoint after `R` is thrown
//!   away since that history no longer happened, and downstream
//!   progress past `R` is reset.
//!
//! - Starts over when no checkpoint is named: empty window, no
//!   checkpoints, counter back to [`INITIAL_SEQ`], progress reset to
//!   zero. This is only correct if nothing downstream has processed
//!   any data yet.
//!
//! Checkpoints live in memory only.

pub(crate) mod source;
pub(crate) mod store;
pub(crate) mod window;

pub use source::CheckpointingSource;
pub use source::Emission;
pub use source::Rollback;
pub use source::SourceState;
pub use source::SourceStatus;
pub use source::INITIAL_SEQ;
pub use store::Checkpoint;
pub use store::CheckpointStore;
pub use window::Window;
