// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Ownership of decoded samples.
//!
//! Samples are decoded entirely into memory and never evicted, so playback never
//! touches the disk or the store lock.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::error::FormatError;
use super::wav::{self, DecodedWave};

/// Identifier for a loaded sample. Issued sequentially starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleId(u32);

impl SampleId {
    /// Returns the raw integer value of the id.
    pub fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> Option<usize> {
        (self.0 as usize).checked_sub(1)
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable, fully decoded sample.
pub struct Sample {
    id: SampleId,
    channel_count: u16,
    sample_rate: u32,
    /// Interleaved frames. Length is always frame_count * channel_count.
    frames: Vec<f32>,
}

impl Sample {
    pub fn id(&self) -> SampleId {
        self.id
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len() / self.channel_count as usize
    }

    /// The interleaved frame data.
    pub fn frames(&self) -> &[f32] {
        &self.frames
    }

    /// Value of `frame` for an output channel. Output channels beyond the sample's
    /// own channel count wrap around, so mono samples feed every output.
    /// `frame` must be below `frame_count()`.
    #[inline]
    pub fn value(&self, frame: usize, channel: usize) -> f32 {
        let channels = self.channel_count as usize;
        self.frames[frame * channels + channel % channels]
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_count() as f64 / f64::from(self.sample_rate))
    }

    /// Memory used by the frame data in bytes.
    pub fn memory_size(&self) -> usize {
        self.frames.len() * std::mem::size_of::<f32>()
    }
}

impl fmt::Debug for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sample")
            .field("id", &self.id)
            .field("channels", &self.channel_count)
            .field("frames", &self.frame_count())
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// Owns every loaded sample for the lifetime of the engine.
#[derive(Default)]
pub struct SampleStore {
    samples: RwLock<Vec<Arc<Sample>>>,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a WAV stream and stores it. The id is only consumed on success.
    pub fn load<R: Read + Seek>(&self, reader: R) -> Result<SampleId, FormatError> {
        let decoded = wav::decode(reader)?;
        self.insert(decoded)
    }

    /// Loads a WAV file from disk.
    pub fn load_file(&self, path: &Path) -> Result<SampleId, FormatError> {
        let file = File::open(path)?;
        let id = self.load(BufReader::new(file))?;
        info!(path = ?path, id = id.raw(), "Sample loaded");
        Ok(id)
    }

    /// Stores already-decoded audio, e.g. procedurally generated effects.
    /// Values are clamped to [-1.0, 1.0] and a trailing partial frame is dropped.
    /// A zero sample rate is rejected since such a sample could never advance.
    pub fn insert(&self, decoded: DecodedWave) -> Result<SampleId, FormatError> {
        let DecodedWave {
            channel_count,
            sample_rate,
            mut frames,
        } = decoded;
        if sample_rate == 0 {
            return Err(FormatError::UnsupportedSampleRate(0, wav::SAMPLE_RATE));
        }
        let channel_count = channel_count.max(1);
        let whole = frames.len() / channel_count as usize * channel_count as usize;
        frames.truncate(whole);
        frames.iter_mut().for_each(|v| *v = v.clamp(-1.0, 1.0));

        let mut samples = self.samples.write();
        let id = SampleId(samples.len() as u32 + 1);
        let sample = Sample {
            id,
            channel_count,
            sample_rate,
            frames,
        };
        debug!(
            id = id.raw(),
            channels = sample.channel_count,
            frames = sample.frame_count(),
            memory_kb = sample.memory_size() / 1024,
            "Sample stored"
        );
        samples.push(Arc::new(sample));
        Ok(id)
    }

    /// Looks up a sample by id.
    pub fn get(&self, id: SampleId) -> Option<Arc<Sample>> {
        let index = id.index()?;
        self.samples.read().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes of decoded frame data.
    pub fn memory_usage(&self) -> usize {
        self.samples.read().iter().map(|s| s.memory_size()).sum()
    }
}

impl fmt::Debug for SampleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleStore")
            .field("samples", &self.len())
            .field("memory_kb", &(self.memory_usage() / 1024))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::testutil::wav_bytes;

    #[test]
    fn test_ids_are_sequential_from_one() {
        let store = SampleStore::new();
        let first = store
            .load(Cursor::new(wav_bytes(1, wav::SAMPLE_RATE, &[1, 2, 3])))
            .unwrap();
        let second = store
            .load(Cursor::new(wav_bytes(2, wav::SAMPLE_RATE, &[1, 2, 3, 4])))
            .unwrap();

        assert_eq!(first.raw(), 1);
        assert_eq!(second.raw(), 2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(second).unwrap().frame_count(), 2);
    }

    #[test]
    fn test_failed_load_leaves_store_unchanged() {
        let store = SampleStore::new();
        store
            .load(Cursor::new(wav_bytes(1, wav::SAMPLE_RATE, &[1])))
            .unwrap();

        assert!(store.load(Cursor::new(Vec::new())).is_err());
        assert!(store.load(Cursor::new(b"not a wave file".to_vec())).is_err());
        assert_eq!(store.len(), 1);

        // The failed loads did not consume an id.
        let next = store
            .load(Cursor::new(wav_bytes(1, wav::SAMPLE_RATE, &[1])))
            .unwrap();
        assert_eq!(next.raw(), 2);
    }

    #[test]
    fn test_get_unknown_id() {
        let store = SampleStore::new();
        assert!(store.get(SampleId(0)).is_none());
        assert!(store.get(SampleId(1)).is_none());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("click.wav");
        std::fs::write(&path, wav_bytes(1, wav::SAMPLE_RATE, &[0; 441])).unwrap();

        let store = SampleStore::new();
        let id = store.load_file(&path).unwrap();
        let sample = store.get(id).unwrap();
        assert_eq!(sample.duration(), Duration::from_millis(10));
        assert_eq!(store.memory_usage(), 441 * 4);

        assert!(matches!(
            store.load_file(&dir.path().join("missing.wav")),
            Err(FormatError::Io(_))
        ));
    }

    #[test]
    fn test_insert_normalizes() {
        let store = SampleStore::new();
        let id = store
            .insert(DecodedWave {
                channel_count: 2,
                sample_rate: wav::SAMPLE_RATE,
                frames: vec![2.0, -3.0, 0.5],
            })
            .unwrap();

        let sample = store.get(id).unwrap();
        assert_eq!(sample.frames(), &[1.0, -1.0]);
        assert_eq!(sample.frame_count(), 1);
    }

    #[test]
    fn test_mono_value_wraps_channels() {
        let store = SampleStore::new();
        let id = store
            .insert(DecodedWave {
                channel_count: 1,
                sample_rate: wav::SAMPLE_RATE,
                frames: vec![0.25, 0.5],
            })
            .unwrap();

        let sample = store.get(id).unwrap();
        assert_eq!(sample.value(1, 0), 0.5);
        assert_eq!(sample.value(1, 1), 0.5);
    }

    #[test]
    fn test_insert_rejects_zero_sample_rate() {
        let store = SampleStore::new();
        let result = store.insert(DecodedWave {
            channel_count: 1,
            sample_rate: 0,
            frames: vec![0.5; 4],
        });

        assert!(matches!(
            result,
            Err(FormatError::UnsupportedSampleRate(0, _))
        ));
        assert!(store.is_empty());
    }
}
