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

//! Registry of in-flight sample playbacks.
//!
//! Control threads append instances and raise stop flags. Only the mixer moves
//! cursors, marks instances finished and removes them, always under the same
//! short critical section.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::samples::{Sample, SampleId};

/// Global instance id counter.
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one playback started by `play`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceHandle(u64);

impl InstanceHandle {
    fn next() -> Self {
        InstanceHandle(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single playback of a loaded sample.
pub struct PlaybackInstance {
    pub(crate) handle: InstanceHandle,
    pub(crate) sample: Arc<Sample>,
    /// The next frame to emit.
    pub(crate) position: usize,
    pub(crate) looping: bool,
    pub(crate) stop_requested: bool,
    pub(crate) finished: bool,
}

impl PlaybackInstance {
    fn new(sample: Arc<Sample>, looping: bool) -> Self {
        Self {
            handle: InstanceHandle::next(),
            sample,
            position: 0,
            looping,
            stop_requested: false,
            finished: false,
        }
    }

    /// Value this instance adds to `channel` in the current frame.
    #[inline]
    pub(crate) fn contribution(&self, channel: usize) -> f32 {
        if self.stop_requested || self.position >= self.sample.frame_count() {
            0.0
        } else {
            self.sample.value(self.position, channel)
        }
    }

    /// Closes the current frame for this instance: consumes a pending stop, or moves
    /// the cursor and resolves the end of the sample.
    pub(crate) fn end_frame(&mut self, time_step: f64) {
        if self.stop_requested {
            self.looping = false;
            self.finished = true;
            return;
        }

        let advance = (f64::from(self.sample.sample_rate()) * time_step).round() as usize;
        self.position += advance;
        if self.position >= self.sample.frame_count() {
            if self.looping {
                self.position = 0;
            } else {
                self.finished = true;
            }
        }
    }

    fn state(&self) -> InstanceState {
        InstanceState {
            handle: self.handle,
            sample_id: self.sample.id(),
            position: self.position,
            looping: self.looping,
            stop_requested: self.stop_requested,
        }
    }
}

/// A point-in-time view of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceState {
    pub handle: InstanceHandle,
    pub sample_id: SampleId,
    pub position: usize,
    pub looping: bool,
    pub stop_requested: bool,
}

/// Holds every active instance in insertion order.
#[derive(Default)]
pub struct PlaybackRegistry {
    instances: Mutex<Vec<PlaybackInstance>>,
}

impl PlaybackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new playback of the sample at frame zero.
    pub fn play(&self, sample: Arc<Sample>, looping: bool) -> InstanceHandle {
        let instance = PlaybackInstance::new(sample, looping);
        let handle = instance.handle;
        debug!(
            sample = instance.sample.id().raw(),
            instance = handle.raw(),
            looping,
            "Playback started"
        );
        self.instances.lock().push(instance);
        handle
    }

    /// Requests a stop for the first instance of the sample, in insertion order.
    /// Other instances of the same sample keep playing. Until the mixer removes the
    /// flagged instance, repeated calls flag the same one again.
    pub fn stop(&self, sample_id: SampleId) -> bool {
        let mut instances = self.instances.lock();
        match instances.iter_mut().find(|i| i.sample.id() == sample_id) {
            Some(instance) => {
                instance.stop_requested = true;
                true
            }
            None => false,
        }
    }

    /// Requests a stop for a specific instance.
    pub fn stop_instance(&self, handle: InstanceHandle) -> bool {
        let mut instances = self.instances.lock();
        match instances.iter_mut().find(|i| i.handle == handle) {
            Some(instance) => {
                instance.stop_requested = true;
                true
            }
            None => false,
        }
    }

    /// Requests a stop for every instance. Returns how many were flagged.
    pub fn stop_all(&self) -> usize {
        let mut instances = self.instances.lock();
        instances.iter_mut().for_each(|i| i.stop_requested = true);
        instances.len()
    }

    /// Returns true while the instance is still in the registry.
    pub fn is_active(&self, handle: InstanceHandle) -> bool {
        self.instances.lock().iter().any(|i| i.handle == handle)
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<InstanceState> {
        self.instances
            .lock()
            .iter()
            .map(PlaybackInstance::state)
            .collect()
    }

    /// Drops every instance without going through the mixer.
    pub fn clear(&self) {
        self.instances.lock().clear();
    }

    /// Locks the instance list for a mix pass.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<PlaybackInstance>> {
        self.instances.lock()
    }
}

impl fmt::Debug for PlaybackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackRegistry")
            .field("active", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::{wav, DecodedWave, SampleStore};

    fn sample(store: &SampleStore, frames: usize) -> Arc<Sample> {
        let id = store
            .insert(DecodedWave {
                channel_count: 1,
                sample_rate: wav::SAMPLE_RATE,
                frames: vec![0.5; frames],
            })
            .unwrap();
        store.get(id).unwrap()
    }

    #[test]
    fn test_play_appends_at_position_zero() {
        let store = SampleStore::new();
        let registry = PlaybackRegistry::new();
        let kick = sample(&store, 10);

        let a = registry.play(kick.clone(), false);
        let b = registry.play(kick, true);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].handle, a);
        assert_eq!(snapshot[1].handle, b);
        assert!(snapshot.iter().all(|s| s.position == 0));
        assert!(snapshot[1].looping);
        assert_ne!(a, b);
    }

    #[test]
    fn test_stop_flags_first_match_only() {
        let store = SampleStore::new();
        let registry = PlaybackRegistry::new();
        let kick = sample(&store, 10);
        let snare = sample(&store, 10);

        registry.play(snare.clone(), false);
        registry.play(kick.clone(), false);
        registry.play(kick.clone(), false);

        assert!(registry.stop(kick.id()));
        let snapshot = registry.snapshot();
        assert!(!snapshot[0].stop_requested);
        assert!(snapshot[1].stop_requested);
        assert!(!snapshot[2].stop_requested);

        // Before a mix pass, a second call lands on the same instance.
        assert!(registry.stop(kick.id()));
        let snapshot = registry.snapshot();
        assert!(snapshot[1].stop_requested);
        assert!(!snapshot[2].stop_requested);
    }

    #[test]
    fn test_stop_unknown_sample() {
        let store = SampleStore::new();
        let registry = PlaybackRegistry::new();
        let kick = sample(&store, 10);
        let other = sample(&store, 10);

        registry.play(kick, false);
        assert!(!registry.stop(other.id()));
        assert!(!registry.snapshot()[0].stop_requested);
    }

    #[test]
    fn test_stop_all_and_instance() {
        let store = SampleStore::new();
        let registry = PlaybackRegistry::new();
        let kick = sample(&store, 10);

        let first = registry.play(kick.clone(), true);
        registry.play(kick.clone(), false);

        assert!(registry.stop_instance(first));
        assert!(registry.snapshot()[0].stop_requested);
        assert!(!registry.snapshot()[1].stop_requested);

        assert_eq!(registry.stop_all(), 2);
        assert!(registry.snapshot().iter().all(|s| s.stop_requested));
        assert!(registry.is_active(first));

        registry.clear();
        assert!(registry.is_empty());
        assert!(!registry.is_active(first));
        assert!(!registry.stop_instance(first));
    }

    #[test]
    fn test_concurrent_play() {
        let store = SampleStore::new();
        let registry = Arc::new(PlaybackRegistry::new());
        let kick = sample(&store, 10);

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let kick = kick.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        registry.play(kick.clone(), false);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(registry.len(), 100);
    }
}
