//! # vireo: an HTML5-style media playback engine
//!
//! The playback half of the engine: a [`MediaElement`] facade over a media
//! clock, two watermarked decode queues, and the render/mixer output path.
//! Buffering (MSE: media source, source buffers, track buffers) lives in
//! [`vireo_mse`] and is re-exported here.
//!
//! The element is driven cooperatively: the embedder constructs it with its
//! platform collaborators (decoders, audio mixer, video presenter; see
//! [`platform`]) and calls [`MediaElement::tick`] at animation cadence.
//! Playback rates may be negative; video then decodes each group forwards
//! and renders it in reverse, while audio is re-stamped, decoded, and
//! sample-reversed.
mod clock;
mod element;
mod scheduler;

/// Collaborator interfaces: decoders, the audio mixer, and the presenter.
pub mod platform;

pub use element::*;
pub use platform::*;
pub use scheduler::SchedulerConfig;

pub use vireo_mse;
pub use vireo_mse::{Error, MediaSource, Result, SourceBuffer, TimeRanges, Timestamp};

pub(crate) use clock::MediaClock;
pub(crate) use scheduler::Scheduler;
