use std::fs::File;
use std::io::{Cursor, ErrorKind};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::DecodeError;

/// Decoded PCM, one `f32` array per channel (at most two).
///
/// Channel data is immutable and reference counted so the worker thread and
/// the spectral extractor can both read it without either taking the only copy.
#[derive(Clone, Debug)]
pub struct RawAudioBuffer {
    sample_rate: u32,
    channels: Vec<Arc<[f32]>>,
}

impl RawAudioBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Result<Self, DecodeError> {
        if sample_rate == 0 {
            return Err(DecodeError::Unsupported("sample rate is zero".into()));
        }
        if channels.is_empty() || channels.len() > 2 {
            return Err(DecodeError::Unsupported(format!(
                "expected 1 or 2 channels, got {}",
                channels.len()
            )));
        }
        let frames = channels[0].len();
        if frames == 0 {
            return Err(DecodeError::Unsupported("no audio frames decoded".into()));
        }
        if channels.iter().any(|c| c.len() != frames) {
            return Err(DecodeError::Unsupported("channel lengths differ".into()));
        }

        Ok(Self {
            sample_rate,
            channels: channels.into_iter().map(Arc::from).collect(),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.channels[0].len()
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn left(&self) -> &[f32] {
        &self.channels[0]
    }

    pub fn right(&self) -> Option<&[f32]> {
        self.channels.get(1).map(|c| &c[..])
    }

    /// Shared handles to the channel data, for handing to another thread.
    pub fn shared_channels(&self) -> (Arc<[f32]>, Option<Arc<[f32]>>) {
        (Arc::clone(&self.channels[0]), self.channels.get(1).cloned())
    }

    /// Average of all channels over `range`, as a new vector.
    pub fn mixdown(&self, range: Range<usize>) -> Vec<f32> {
        let range = range.start.min(self.frames())..range.end.min(self.frames());
        match self.right() {
            None => self.left()[range].to_vec(),
            Some(right) => self.left()[range.clone()]
                .iter()
                .zip(&right[range])
                .map(|(l, r)| (l + r) * 0.5)
                .collect(),
        }
    }
}

/// Decode an audio file from disk.
pub fn decode_file(path: &Path) -> Result<RawAudioBuffer, DecodeError> {
    let file = File::open(path)?;

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    log::debug!("Decoding {}", path.display());
    DecodeSession::open(Box::new(file), &hint)?.run()
}

/// Decode an in-memory audio file. `extension` is a format hint such as "mp3".
pub fn decode_bytes(bytes: Vec<u8>, extension: Option<&str>) -> Result<RawAudioBuffer, DecodeError> {
    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    DecodeSession::open(Box::new(Cursor::new(bytes)), &hint)?.run()
}

/// Format reader and codec for one decode. Consumed by `run`, so both are
/// dropped before the decoded buffer is handed back, whatever the outcome.
struct DecodeSession {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: Option<usize>,
}

impl DecodeSession {
    fn open(source: Box<dyn MediaSource>, hint: &Hint) -> Result<Self, DecodeError> {
        let mss = MediaSourceStream::new(source, Default::default());

        let probed = symphonia::default::get_probe()
            .format(hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(probe_error)?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| DecodeError::Unsupported("no audio tracks found".into()))?;

        let track_id = track.id;
        let channels = track.codec_params.channels.map(|c| c.count().min(2));
        let sample_rate = track
            .codec_params
            .sample_rate
            .filter(|&sr| sr > 0)
            .ok_or_else(|| DecodeError::Unsupported("unknown sample rate".into()))?;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::Unsupported(format!("no decoder for track: {}", e)))?;

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
        })
    }

    fn run(mut self) -> Result<RawAudioBuffer, DecodeError> {
        let mut left: Vec<f32> = Vec::new();
        let mut right: Vec<f32> = Vec::new();
        let mut skipped = 0usize;

        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(SymphoniaError::IoError(e)) => return Err(DecodeError::Unreadable(e)),
                Err(e) => return Err(DecodeError::Unsupported(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(_)) => {
                    skipped += 1;
                    continue;
                }
                Err(e) => return Err(DecodeError::Unsupported(e.to_string())),
            };

            let spec = *decoded.spec();
            let packet_channels = spec.channels.count();
            if packet_channels == 0 {
                continue;
            }
            let kept = *self.channels.get_or_insert(packet_channels.min(2));

            let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);

            for frame in sample_buf.samples().chunks(packet_channels) {
                left.push(frame[0]);
                if kept == 2 {
                    right.push(*frame.get(1).unwrap_or(&frame[0]));
                }
            }
        }

        if skipped > 0 {
            log::warn!("Skipped {} undecodable packets", skipped);
        }

        let channels = if right.is_empty() { vec![left] } else { vec![left, right] };
        let buffer = RawAudioBuffer::new(self.sample_rate, channels)?;

        log::info!(
            "Decoded audio: {} frames, {} ch, {}Hz, {:.1}s",
            buffer.frames(),
            buffer.channel_count(),
            buffer.sample_rate(),
            buffer.duration_secs()
        );

        Ok(buffer)
    }
}

fn probe_error(err: SymphoniaError) -> DecodeError {
    match err {
        SymphoniaError::IoError(e) if e.kind() != ErrorKind::UnexpectedEof => DecodeError::Unreadable(e),
        other => DecodeError::Unsupported(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_channels() {
        let err = RawAudioBuffer::new(44100, vec![vec![0.0; 10], vec![0.0; 9]]).unwrap_err();
        assert!(matches!(err, DecodeError::Unsupported(_)));
    }

    #[test]
    fn rejects_empty_and_zero_rate() {
        assert!(RawAudioBuffer::new(44100, vec![vec![]]).is_err());
        assert!(RawAudioBuffer::new(0, vec![vec![0.0; 4]]).is_err());
        assert!(RawAudioBuffer::new(44100, vec![]).is_err());
    }

    #[test]
    fn duration_from_frames() {
        let buffer = RawAudioBuffer::new(8000, vec![vec![0.0; 12000]]).unwrap();
        assert_eq!(buffer.frames(), 12000);
        assert!((buffer.duration_secs() - 1.5).abs() < 1e-9);
        assert!(buffer.right().is_none());
    }

    #[test]
    fn mixdown_averages_channels() {
        let buffer = RawAudioBuffer::new(8000, vec![vec![1.0, 0.5, 0.0], vec![0.0, 0.5, 1.0]]).unwrap();
        assert_eq!(buffer.mixdown(0..3), vec![0.5, 0.5, 0.5]);
        assert_eq!(buffer.mixdown(1..10), vec![0.5, 0.5]);
    }

    #[test]
    fn shared_channels_leave_original_intact() {
        let buffer = RawAudioBuffer::new(8000, vec![vec![0.25; 100], vec![-0.25; 100]]).unwrap();
        let (left, right) = buffer.shared_channels();
        drop(left);
        drop(right);
        assert_eq!(buffer.left().len(), 100);
        assert_eq!(buffer.right().map(|r| r[0]), Some(-0.25));
    }

    #[test]
    fn text_bytes_are_unsupported() {
        let err = decode_bytes(b"this is not audio at all".repeat(64), Some("wav")).unwrap_err();
        assert!(matches!(err, DecodeError::Unsupported(_)), "got {:?}", err);
    }

    #[test]
    fn missing_file_is_unreadable() {
        let err = decode_file(Path::new("/definitely/not/here.mp3")).unwrap_err();
        assert!(err.is_unreadable());
    }
}
