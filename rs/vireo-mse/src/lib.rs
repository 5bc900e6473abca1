//! # vireo-mse: Media Source Extensions buffering
//!
//! The buffering half of the vireo playback engine: byte ranges of
//! fragmented MP4 go in, time-indexed coded frames come out.
//!
//! - [`MediaSource`] owns the duration and the `Closed → Open → Ended`
//!   lifecycle, multiplexing one [`SourceBuffer`] per media type.
//! - [`SourceBuffer`] demuxes appended bytes and runs the coded-frame
//!   processing rules into per-track [`TrackBuffer`]s.
//! - [`TrackBuffer`] stores frames per track, grouped by sync frame for
//!   video, with time-range bookkeeping for `buffered`.
//!
//! Playback (clock, decode scheduling, rendering) lives in the `vireo`
//! crate on top of this one.
mod codec;
mod demux;
mod error;
mod event;
mod frame;
mod media_source;
mod ranges;
mod source_buffer;
mod time;
mod track;

pub use codec::*;
pub use demux::*;
pub use error::*;
pub use event::*;
pub use frame::*;
pub use media_source::*;
pub use ranges::*;
pub use source_buffer::*;
pub use time::*;
pub use track::*;
