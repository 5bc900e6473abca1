use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};
use derive_more::Debug;
use mp4_atom::{Any, Atom, DecodeMaybe, Mdat, Moof, Moov, Trak};

use crate::{Aac, AudioConfig, Error, H264, MediaKind, Result, Timestamp, TrackConfig, VideoConfig};

/// One coded sample extracted from a `trun` entry, in track-timescale ticks.
///
/// Samples are immutable once emitted by the demuxer; the source buffer
/// converts ticks to microseconds during coded-frame processing.
#[derive(Clone, Debug)]
pub struct Sample {
	pub track_id: u32,

	/// The track's timescale in Hz.
	pub timescale: u32,

	/// Decode timestamp in timescale ticks.
	pub dts: u64,

	/// Presentation timestamp in timescale ticks (dts plus the composition
	/// offset).
	pub cts: u64,

	/// Sample duration in timescale ticks; always positive.
	pub duration: u32,

	/// Whether this sample is a random access point.
	pub keyframe: bool,

	/// The encoded payload, sliced out of the mdat.
	#[debug("{} bytes", payload.len())]
	pub payload: Bytes,
}

impl Sample {
	/// The presentation timestamp in microseconds.
	pub fn pts(&self) -> Result<Timestamp> {
		Ok(Timestamp::from_scale(self.cts, self.timescale as u64)?)
	}

	/// The decode timestamp in microseconds.
	pub fn decode_time(&self) -> Result<Timestamp> {
		Ok(Timestamp::from_scale(self.dts, self.timescale as u64)?)
	}

	/// The duration in microseconds.
	pub fn duration_us(&self) -> Result<Timestamp> {
		Ok(Timestamp::from_scale(self.duration as u64, self.timescale as u64)?)
	}
}

/// One track described by an initialization segment.
#[derive(Clone, Debug)]
pub struct TrackInfo {
	pub id: u32,
	pub timescale: u32,
	pub config: TrackConfig,
}

impl TrackInfo {
	pub fn kind(&self) -> MediaKind {
		self.config.kind()
	}
}

/// The parsed contents of an `ftyp + moov` initialization segment.
#[derive(Clone, Debug)]
pub struct InitSegment {
	/// The presentation duration, when the container knows it.
	pub duration: Option<Timestamp>,

	/// Tracks in declaration order.
	pub tracks: Vec<TrackInfo>,
}

/// A segment produced by the demuxer.
#[derive(Clone, Debug)]
pub enum DemuxEvent {
	/// An initialization segment was parsed.
	Init(InitSegment),

	/// A `moof + mdat` pair was parsed into samples, in byte-stream order.
	Media(Vec<Sample>),
}

// Per-track state needed to resolve fragment defaults, captured from the
// moov's trak/trex boxes.
struct TrackMeta {
	timescale: u32,
	video: bool,
	default_sample_duration: u32,
	default_sample_size: u32,
	default_sample_flags: u32,
}

/// An incremental fragmented-MP4 demuxer.
///
/// Bytes go in via [`push`](Self::push); segments come out via
/// [`poll`](Self::poll). The input is split into `ftyp + moov`
/// (initialization) and `moof + mdat` (media) segments; everything else is
/// skipped. Not all MP4 features are supported: one `avc1` video codec and
/// one `mp4a` AAC audio codec per track, no edit lists, no negative
/// composition offsets.
pub struct Demuxer {
	input: BytesMut,

	// Per-track fragment defaults, keyed by track id. Set by the moov.
	tracks: HashMap<u32, TrackMeta>,
	initialized: bool,

	// The latest moof header, waiting for its mdat.
	moof: Option<Moof>,
	moof_size: usize,
}

impl Demuxer {
	pub fn new() -> Self {
		Self {
			input: BytesMut::new(),
			tracks: HashMap::new(),
			initialized: false,
			moof: None,
			moof_size: 0,
		}
	}

	/// Stage more input bytes.
	pub fn push(&mut self, data: &[u8]) {
		self.input.extend_from_slice(data);
	}

	/// Whether an initialization segment has been parsed.
	pub fn is_initialized(&self) -> bool {
		self.initialized
	}

	/// Discard staged input and any pending fragment header.
	///
	/// Initialization state survives a reset; only unprocessed bytes are
	/// dropped.
	pub fn reset(&mut self) {
		self.input.clear();
		self.moof = None;
		self.moof_size = 0;
	}

	/// Decode the next segment out of the staged input.
	///
	/// Returns `Ok(None)` when more input is needed; unconsumed bytes stay
	/// staged. On failure the offending bytes may be partially consumed;
	/// callers recover with [`reset`](Self::reset).
	pub fn poll(&mut self) -> Result<Option<DemuxEvent>> {
		loop {
			let mut cursor = std::io::Cursor::new(self.input.as_ref());

			let atom = match Any::decode_maybe(&mut cursor)? {
				Some(atom) => atom,
				None => return Ok(None),
			};
			let size = cursor.position() as usize;

			match atom {
				Any::Ftyp(_) | Any::Styp(_) => {
					self.input.advance(size);
				}
				Any::Moov(moov) => {
					self.input.advance(size);
					let init = self.init(&moov)?;
					return Ok(Some(DemuxEvent::Init(init)));
				}
				Any::Moof(moof) => {
					if self.moof.is_some() {
						return Err(Error::ByteStream("duplicate moof box"));
					}
					self.moof = Some(moof);
					self.moof_size = size;
					self.input.advance(size);
				}
				Any::Mdat(mdat) => {
					let header_size = size - mdat.data.len();
					self.input.advance(size);
					let samples = self.extract(&mdat, header_size)?;
					return Ok(Some(DemuxEvent::Media(samples)));
				}
				atom => {
					// Skip unknown atoms (e.g. sidx, which is optional and
					// used for segment indexing).
					tracing::debug!(?atom, "skipping atom");
					self.input.advance(size);
				}
			}
		}
	}

	fn init(&mut self, moov: &Moov) -> Result<InitSegment> {
		let duration = match moov.mvhd.duration {
			0 => None,
			ticks => Some(Timestamp::from_scale(ticks, moov.mvhd.timescale as u64)?),
		};

		let mut tracks = Vec::new();
		let mut meta = HashMap::new();

		for trak in &moov.trak {
			let track_id = trak.tkhd.track_id;
			let timescale = trak.mdia.mdhd.timescale;
			if timescale == 0 {
				return Err(Error::ByteStream("zero track timescale"));
			}

			let config = match trak.mdia.hdlr.handler.as_ref() {
				b"vide" => TrackConfig::Video(Self::init_video(trak)?),
				b"soun" => TrackConfig::Audio(Self::init_audio(trak)?),
				handler => {
					tracing::debug!(?handler, track_id, "skipping unsupported track");
					continue;
				}
			};

			// The moov contains some defaults for fragment runs.
			let trex = moov
				.mvex
				.as_ref()
				.and_then(|mvex| mvex.trex.iter().find(|trex| trex.track_id == track_id));

			meta.insert(
				track_id,
				TrackMeta {
					timescale,
					video: config.kind() == MediaKind::Video,
					default_sample_duration: trex.map(|t| t.default_sample_duration).unwrap_or_default(),
					default_sample_size: trex.map(|t| t.default_sample_size).unwrap_or_default(),
					default_sample_flags: trex.map(|t| t.default_sample_flags).unwrap_or_default(),
				},
			);

			tracks.push(TrackInfo {
				id: track_id,
				timescale,
				config,
			});
		}

		self.tracks = meta;
		self.initialized = true;

		Ok(InitSegment { duration, tracks })
	}

	fn init_video(trak: &Trak) -> Result<VideoConfig> {
		let stsd = &trak.mdia.minf.stbl.stsd;

		let codec = match stsd.codecs.len() {
			0 => return Err(Error::InvalidCodec),
			1 => &stsd.codecs[0],
			_ => return Err(Error::ByteStream("multiple codec entries")),
		};

		match codec {
			mp4_atom::Codec::Avc1(avc1) => {
				let avcc = &avc1.avcc;

				let mut description = BytesMut::new();
				avcc.encode_body(&mut description)?;

				Ok(VideoConfig {
					codec: H264 {
						profile: avcc.avc_profile_indication,
						constraints: avcc.profile_compatibility,
						level: avcc.avc_level_indication,
					}
					.into(),
					description: Some(description.freeze()),
					coded_width: Some(avc1.visual.width as _),
					coded_height: Some(avc1.visual.height as _),
				})
			}
			mp4_atom::Codec::Unknown(_) => Err(Error::InvalidCodec),
			unsupported => Err(Error::UnsupportedCodec(codec_name(unsupported).to_string())),
		}
	}

	fn init_audio(trak: &Trak) -> Result<AudioConfig> {
		let stsd = &trak.mdia.minf.stbl.stsd;

		let codec = match stsd.codecs.len() {
			0 => return Err(Error::InvalidCodec),
			1 => &stsd.codecs[0],
			_ => return Err(Error::ByteStream("multiple codec entries")),
		};

		match codec {
			mp4_atom::Codec::Mp4a(mp4a) => {
				let desc = &mp4a.esds.es_desc.dec_config;

				// 0x40 is MPEG-4 audio; anything else (e.g. MPEG-2) is out.
				if desc.object_type_indication != 0x40 {
					return Err(Error::UnsupportedCodec("mpeg2 audio".to_string()));
				}

				Ok(AudioConfig {
					codec: Aac {
						profile: desc.dec_specific.profile,
					}
					.into(),
					sample_rate: mp4a.audio.sample_rate.integer() as _,
					channel_count: mp4a.audio.channel_count as _,
					description: None,
				})
			}
			mp4_atom::Codec::Unknown(_) => Err(Error::InvalidCodec),
			unsupported => Err(Error::UnsupportedCodec(codec_name(unsupported).to_string())),
		}
	}

	// Extract all samples out of an mdat atom, using the pending moof.
	fn extract(&mut self, mdat: &Mdat, header_size: usize) -> Result<Vec<Sample>> {
		if !self.initialized {
			return Err(Error::ByteStream("media segment before initialization"));
		}

		let moof = self.moof.take().ok_or(Error::ByteStream("mdat without moof"))?;
		let moof_size = self.moof_size;
		self.moof_size = 0;

		let mut samples = Vec::new();

		// Loop over all of the traf boxes in the moof.
		for traf in &moof.traf {
			let track_id = traf.tfhd.track_id;
			let track = self.tracks.get(&track_id).ok_or(Error::ByteStream("unknown track"))?;

			let tfdt = traf.tfdt.as_ref().ok_or(Error::ByteStream("missing tfdt box"))?;
			let mut dts = tfdt.base_media_decode_time;

			let mut offset = traf.tfhd.base_data_offset.unwrap_or_default() as usize;

			if traf.trun.is_empty() {
				return Err(Error::ByteStream("missing trun box"));
			}

			for trun in &traf.trun {
				let tfhd = &traf.tfhd;

				if let Some(data_offset) = trun.data_offset {
					let base_offset = tfhd.base_data_offset.unwrap_or_default() as usize;
					// This is relative to the start of the moof, not the mdat.
					let data_offset: usize = data_offset.try_into().map_err(|_| Error::InvalidDataOffset)?;

					let relative_offset = data_offset
						.checked_sub(moof_size)
						.and_then(|v| v.checked_sub(header_size))
						.ok_or(Error::InvalidDataOffset)?;

					// Reset the offset if the trun has a data offset.
					offset = base_offset.checked_add(relative_offset).ok_or(Error::InvalidDataOffset)?;
				}

				for entry in &trun.entries {
					// Use the moof defaults if the sample doesn't have its own values.
					let flags = entry
						.flags
						.unwrap_or(tfhd.default_sample_flags.unwrap_or(track.default_sample_flags));
					let duration = entry
						.duration
						.unwrap_or(tfhd.default_sample_duration.unwrap_or(track.default_sample_duration));
					let size = entry
						.size
						.unwrap_or(tfhd.default_sample_size.unwrap_or(track.default_sample_size)) as usize;

					if duration == 0 {
						return Err(Error::ByteStream("sample with zero duration"));
					}

					if offset + size > mdat.data.len() {
						return Err(Error::InvalidDataOffset);
					}

					let cts = (dts as i64 + entry.cts.unwrap_or_default() as i64) as u64;

					let keyframe = if track.video {
						// https://chromium.googlesource.com/chromium/src/media/+/master/formats/mp4/track_run_iterator.cc#177
						let depends = (flags >> 24) & 0x3 == 0x2; // kSampleDependsOnNoOther
						let non_sync = (flags >> 16) & 0x1 == 0x1; // kSampleIsNonSyncSample

						depends && !non_sync
					} else {
						// Audio samples are always sync samples.
						true
					};

					samples.push(Sample {
						track_id,
						timescale: track.timescale,
						dts,
						cts,
						duration,
						keyframe,
						payload: Bytes::copy_from_slice(&mdat.data[offset..offset + size]),
					});

					dts += duration as u64;
					offset += size;
				}
			}
		}

		Ok(samples)
	}
}

impl Default for Demuxer {
	fn default() -> Self {
		Self::new()
	}
}

fn codec_name(codec: &mp4_atom::Codec) -> &'static str {
	match codec {
		mp4_atom::Codec::Avc1(_) => "h264",
		mp4_atom::Codec::Hev1(_) | mp4_atom::Codec::Hvc1(_) => "h265",
		mp4_atom::Codec::Vp08(_) => "vp8",
		mp4_atom::Codec::Vp09(_) => "vp9",
		mp4_atom::Codec::Av01(_) => "av1",
		mp4_atom::Codec::Mp4a(_) => "aac",
		mp4_atom::Codec::Opus(_) => "opus",
		_ => "unknown",
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use mp4_atom::{Encode, Mfhd, Tfdt, Tfhd, Traf, Trun, TrunEntry};

	const KEYFRAME: u32 = 0x0200_0000;
	const DELTA: u32 = 0x0101_0000;

	fn video_demuxer(track_id: u32, timescale: u32) -> Demuxer {
		let mut demuxer = Demuxer::new();
		demuxer.tracks.insert(
			track_id,
			TrackMeta {
				timescale,
				video: true,
				default_sample_duration: 0,
				default_sample_size: 0,
				default_sample_flags: 0,
			},
		);
		demuxer.initialized = true;
		demuxer
	}

	fn encode_moof(moof: &Moof) -> BytesMut {
		let mut bytes = BytesMut::new();
		moof.encode(&mut bytes).expect("moof encodes");
		bytes
	}

	fn encode_mdat(payload: &[u8]) -> BytesMut {
		let mut bytes = BytesMut::new();
		bytes.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
		bytes.extend_from_slice(b"mdat");
		bytes.extend_from_slice(payload);
		bytes
	}

	fn fragment(track_id: u32, base_decode_time: u64, entries: Vec<TrunEntry>, payload: &[u8]) -> Vec<u8> {
		// The trun data offset is relative to the moof start, so encode the
		// moof once to learn its size, then patch the offset in.
		let mut moof = Moof {
			mfhd: Mfhd { sequence_number: 1 },
			traf: vec![Traf {
				tfhd: Tfhd {
					track_id,
					base_data_offset: None,
					sample_description_index: Some(1),
					default_sample_duration: None,
					default_sample_size: None,
					default_sample_flags: None,
				},
				tfdt: Some(Tfdt {
					base_media_decode_time: base_decode_time,
				}),
				trun: vec![Trun {
					data_offset: Some(0),
					entries,
				}],
				..Default::default()
			}],
		};

		let moof_size = encode_moof(&moof).len();
		moof.traf[0].trun[0].data_offset = Some(moof_size as i32 + 8);

		let mut bytes = encode_moof(&moof);
		bytes.extend_from_slice(&encode_mdat(payload));
		bytes.to_vec()
	}

	fn entry(duration: u32, size: u32, flags: u32) -> TrunEntry {
		TrunEntry {
			duration: Some(duration),
			size: Some(size),
			flags: Some(flags),
			cts: Some(0),
		}
	}

	#[test]
	fn needs_more_data_on_partial_box() {
		let mut demuxer = Demuxer::new();
		demuxer.push(&[0, 0, 0, 16, b'f', b'r', b'e', b'e']);
		assert!(matches!(demuxer.poll(), Ok(None)));

		// Completing the box lets the demuxer skip it and ask for more.
		demuxer.push(&[0u8; 8]);
		assert!(matches!(demuxer.poll(), Ok(None)));
		assert!(demuxer.input.is_empty());
	}

	#[test]
	fn extracts_samples_with_per_entry_values() {
		let mut demuxer = video_demuxer(1, 1_000);

		let payload = b"aaabbc";
		let bytes = fragment(
			1,
			2_000,
			vec![entry(100, 3, KEYFRAME), entry(100, 2, DELTA), entry(100, 1, DELTA)],
			payload,
		);

		demuxer.push(&bytes);
		let samples = match demuxer.poll() {
			Ok(Some(DemuxEvent::Media(samples))) => samples,
			other => panic!("expected media event, got {:?}", other),
		};

		assert_eq!(samples.len(), 3);
		assert_eq!(samples[0].dts, 2_000);
		assert_eq!(samples[0].cts, 2_000);
		assert!(samples[0].keyframe);
		assert_eq!(samples[0].payload.as_ref(), b"aaa");

		assert_eq!(samples[1].dts, 2_100);
		assert!(!samples[1].keyframe);
		assert_eq!(samples[1].payload.as_ref(), b"bb");

		assert_eq!(samples[2].dts, 2_200);
		assert_eq!(samples[2].payload.as_ref(), b"c");

		// 2.0s at a 1kHz timescale.
		assert_eq!(samples[0].pts().unwrap(), Timestamp::from_micros(2_000_000));
		assert_eq!(samples[0].duration_us().unwrap(), Timestamp::from_micros(100_000));
	}

	#[test]
	fn resolves_tfhd_defaults() {
		let mut demuxer = video_demuxer(7, 90_000);

		let mut moof = Moof {
			mfhd: Mfhd { sequence_number: 1 },
			traf: vec![Traf {
				tfhd: Tfhd {
					track_id: 7,
					base_data_offset: None,
					sample_description_index: Some(1),
					default_sample_duration: Some(3_000),
					default_sample_size: Some(2),
					default_sample_flags: Some(DELTA),
				},
				tfdt: Some(Tfdt {
					base_media_decode_time: 0,
				}),
				trun: vec![Trun {
					data_offset: Some(0),
					entries: vec![
						TrunEntry {
							duration: None,
							size: None,
							flags: Some(KEYFRAME),
							cts: None,
						},
						TrunEntry {
							duration: None,
							size: None,
							flags: None,
							cts: None,
						},
					],
				}],
				..Default::default()
			}],
		};

		let moof_size = encode_moof(&moof).len();
		moof.traf[0].trun[0].data_offset = Some(moof_size as i32 + 8);

		demuxer.push(&encode_moof(&moof));
		demuxer.push(&encode_mdat(b"xxyy"));

		let samples = match demuxer.poll() {
			Ok(Some(DemuxEvent::Media(samples))) => samples,
			other => panic!("expected media event, got {:?}", other),
		};

		assert_eq!(samples.len(), 2);
		assert_eq!(samples[0].duration, 3_000);
		assert_eq!(samples[0].payload.as_ref(), b"xx");
		assert!(samples[0].keyframe);
		assert_eq!(samples[1].dts, 3_000);
		assert!(!samples[1].keyframe);
		assert_eq!(samples[1].payload.as_ref(), b"yy");
	}

	#[test]
	fn applies_composition_offsets() {
		let mut demuxer = video_demuxer(1, 1_000);

		let entries = vec![
			TrunEntry {
				duration: Some(100),
				size: Some(1),
				flags: Some(KEYFRAME),
				cts: Some(200),
			},
			TrunEntry {
				duration: Some(100),
				size: Some(1),
				flags: Some(DELTA),
				cts: Some(0),
			},
		];

		demuxer.push(&fragment(1, 1_000, entries, b"ab"));
		let samples = match demuxer.poll() {
			Ok(Some(DemuxEvent::Media(samples))) => samples,
			other => panic!("expected media event, got {:?}", other),
		};

		assert_eq!(samples[0].dts, 1_000);
		assert_eq!(samples[0].cts, 1_200);
		assert_eq!(samples[1].dts, 1_100);
		assert_eq!(samples[1].cts, 1_100);
	}

	#[test]
	fn rejects_out_of_bounds_data() {
		let mut demuxer = video_demuxer(1, 1_000);

		// One sample claiming 10 bytes over a 2 byte mdat.
		demuxer.push(&fragment(1, 0, vec![entry(100, 10, KEYFRAME)], b"ab"));
		assert!(matches!(demuxer.poll(), Err(Error::InvalidDataOffset)));
	}

	#[test]
	fn rejects_zero_duration_samples() {
		let mut demuxer = video_demuxer(1, 1_000);
		demuxer.push(&fragment(1, 0, vec![entry(0, 2, KEYFRAME)], b"ab"));
		assert!(matches!(demuxer.poll(), Err(Error::ByteStream(_))));
	}

	#[test]
	fn rejects_media_before_init() {
		let mut demuxer = Demuxer::new();
		demuxer.push(&fragment(1, 0, vec![entry(100, 2, KEYFRAME)], b"ab"));
		assert!(matches!(demuxer.poll(), Err(Error::ByteStream(_))));
	}

	#[test]
	fn rejects_mdat_without_moof() {
		let mut demuxer = video_demuxer(1, 1_000);
		demuxer.push(&encode_mdat(b"ab"));
		assert!(matches!(demuxer.poll(), Err(Error::ByteStream(_))));
	}

	#[test]
	fn rejects_duplicate_moof() {
		let mut demuxer = video_demuxer(1, 1_000);

		let bytes = fragment(1, 0, vec![entry(100, 2, KEYFRAME)], b"ab");
		let moof_len = bytes.len() - 10; // strip the 8 byte mdat header + 2 payload bytes

		demuxer.push(&bytes[..moof_len]);
		demuxer.push(&bytes[..moof_len]);
		assert!(matches!(demuxer.poll(), Err(Error::ByteStream("duplicate moof box"))));
	}

	#[test]
	fn reset_discards_staged_input_but_keeps_init() {
		let mut demuxer = video_demuxer(1, 1_000);

		let bytes = fragment(1, 0, vec![entry(100, 2, KEYFRAME)], b"ab");
		demuxer.push(&bytes[..bytes.len() - 4]);
		assert!(matches!(demuxer.poll(), Ok(None)));

		demuxer.reset();
		assert!(demuxer.is_initialized());

		// A fresh, complete fragment parses after the reset.
		demuxer.push(&bytes);
		assert!(matches!(demuxer.poll(), Ok(Some(DemuxEvent::Media(_)))));
	}
}
