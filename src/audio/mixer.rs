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
// Core mixing logic, independent of any device sink.
use std::sync::Arc;

use parking_lot::RwLock;

use crate::playback::{PlaybackInstance, PlaybackRegistry};

/// User synthesis hook: `(channel, clock, time_step) -> value` added to the mix.
pub type SynthHook = Arc<dyn Fn(usize, f64, f64) -> f32 + Send + Sync>;

/// User filter hook: `(channel, clock, mixed) -> value` replacing the mix.
pub type FilterHook = Arc<dyn Fn(usize, f64, f32) -> f32 + Send + Sync>;

/// Combines every active instance and the user hooks into one value per channel.
#[derive(Clone)]
pub struct Mixer {
    registry: Arc<PlaybackRegistry>,
    synth: Arc<RwLock<Option<SynthHook>>>,
    filter: Arc<RwLock<Option<FilterHook>>>,
}

impl Mixer {
    /// Creates a mixer reading from the given registry.
    pub fn new(registry: Arc<PlaybackRegistry>) -> Self {
        Self {
            registry,
            synth: Arc::new(RwLock::new(None)),
            filter: Arc::new(RwLock::new(None)),
        }
    }

    /// Installs or clears the synthesis hook.
    pub fn set_synth_hook(&self, hook: Option<SynthHook>) {
        *self.synth.write() = hook;
    }

    /// Installs or clears the filter hook.
    pub fn set_filter_hook(&self, hook: Option<FilterHook>) {
        *self.filter.write() = hook;
    }

    /// Mixes one value for `channel` in the current frame. The value is not clipped.
    ///
    /// Cursors only move in `end_frame`, so every channel of a frame reads the same
    /// frame of each instance.
    pub fn step(&self, channel: usize, clock: f64, time_step: f64) -> f32 {
        let raw = {
            let instances = self.registry.lock();
            Self::accumulate(&instances, channel)
        };
        let synth = self.synth.read().clone();
        let filter = self.filter.read().clone();
        Self::apply_hooks(
            raw,
            channel,
            clock,
            time_step,
            synth.as_ref(),
            filter.as_ref(),
        )
    }

    /// Closes the current frame: consumes stop requests, advances cursors and
    /// removes every finished instance.
    pub fn end_frame(&self, time_step: f64) {
        let mut instances = self.registry.lock();
        Self::retire(&mut instances, time_step);
    }

    /// Mixes a whole frame into `out` (one slot per channel) and closes it.
    /// The registry is locked once for the frame. Hooks run outside the lock.
    pub fn mix_frame(&self, clock: f64, time_step: f64, out: &mut [f32]) {
        {
            let mut instances = self.registry.lock();
            for (channel, slot) in out.iter_mut().enumerate() {
                *slot = Self::accumulate(&instances, channel);
            }
            Self::retire(&mut instances, time_step);
        }

        let synth = self.synth.read().clone();
        let filter = self.filter.read().clone();
        if synth.is_none() && filter.is_none() {
            return;
        }
        for (channel, slot) in out.iter_mut().enumerate() {
            *slot = Self::apply_hooks(
                *slot,
                channel,
                clock,
                time_step,
                synth.as_ref(),
                filter.as_ref(),
            );
        }
    }

    /// The registry this mixer reads.
    pub fn registry(&self) -> &Arc<PlaybackRegistry> {
        &self.registry
    }

    #[inline]
    fn accumulate(instances: &[PlaybackInstance], channel: usize) -> f32 {
        instances.iter().map(|i| i.contribution(channel)).sum()
    }

    fn retire(instances: &mut Vec<PlaybackInstance>, time_step: f64) {
        for instance in instances.iter_mut() {
            instance.end_frame(time_step);
        }
        instances.retain(|i| !i.finished);
    }

    #[inline]
    fn apply_hooks(
        raw: f32,
        channel: usize,
        clock: f64,
        time_step: f64,
        synth: Option<&SynthHook>,
        filter: Option<&FilterHook>,
    ) -> f32 {
        let mixed = match synth {
            Some(synth) => raw + synth(channel, clock, time_step),
            None => raw,
        };
        match filter {
            Some(filter) => filter(channel, clock, mixed),
            None => mixed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::{wav, DecodedWave, Sample, SampleStore};

    const TIME_STEP: f64 = 1.0 / wav::SAMPLE_RATE as f64;

    fn setup() -> (SampleStore, Mixer) {
        (
            SampleStore::new(),
            Mixer::new(Arc::new(PlaybackRegistry::new())),
        )
    }

    fn mono(store: &SampleStore, frames: Vec<f32>) -> Arc<Sample> {
        let id = store
            .insert(DecodedWave {
                channel_count: 1,
                sample_rate: wav::SAMPLE_RATE,
                frames,
            })
            .unwrap();
        store.get(id).unwrap()
    }

    /// Steps a mono mixer once: one channel, then the frame is closed.
    fn step_mono(mixer: &Mixer) -> f32 {
        let value = mixer.step(0, 0.0, TIME_STEP);
        mixer.end_frame(TIME_STEP);
        value
    }

    #[test]
    fn test_impulse_arrives_at_its_frame() {
        let (store, mixer) = setup();
        let mut frames = vec![0.0; wav::SAMPLE_RATE as usize];
        frames[100] = 0.75;
        let impulse = mono(&store, frames);

        mixer.registry().play(impulse, false);

        let output: Vec<f32> = (0..101).map(|_| step_mono(&mixer)).collect();
        assert!(output[..100].iter().all(|v| *v == 0.0));
        assert_eq!(output[100], 0.75);
    }

    #[test]
    fn test_stop_observed_on_next_step() {
        let (store, mixer) = setup();
        let tone = mono(&store, vec![0.5; 100]);
        mixer.registry().play(tone.clone(), true);

        assert_eq!(step_mono(&mixer), 0.5);
        mixer.registry().stop(tone.id());

        // Still registered until one more step visits it.
        assert_eq!(mixer.registry().len(), 1);
        assert_eq!(step_mono(&mixer), 0.0);
        assert!(mixer.registry().is_empty());
        assert_eq!(step_mono(&mixer), 0.0);
    }

    #[test]
    fn test_repeated_stop_before_step_stops_one_instance() {
        let (store, mixer) = setup();
        let tone = mono(&store, vec![0.5; 100]);
        let first = mixer.registry().play(tone.clone(), true);
        let second = mixer.registry().play(tone.clone(), true);

        assert!(mixer.registry().stop(tone.id()));
        assert!(mixer.registry().stop(tone.id()));
        assert_eq!(step_mono(&mixer), 0.5);

        assert!(!mixer.registry().is_active(first));
        assert!(mixer.registry().is_active(second));
        assert_eq!(mixer.registry().len(), 1);
    }

    #[test]
    fn test_looping_is_periodic() {
        let (store, mixer) = setup();
        let ramp = mono(&store, vec![0.1, 0.2, 0.3, 0.4]);
        mixer.registry().play(ramp, true);

        let output: Vec<f32> = (0..12).map(|_| step_mono(&mixer)).collect();
        for (i, value) in output.iter().enumerate() {
            assert_eq!(*value, output[i % 4], "frame {}", i);
        }
        assert_eq!(output[0], 0.1);
        assert_eq!(output[4], 0.1);
        assert_eq!(mixer.registry().snapshot()[0].position, 0);
    }

    #[test]
    fn test_one_shot_removed_at_end() {
        let (store, mixer) = setup();
        let blip = mono(&store, vec![0.25; 3]);
        let handle = mixer.registry().play(blip, false);

        let output: Vec<f32> = (0..6).map(|_| step_mono(&mixer)).collect();
        assert_eq!(output, vec![0.25, 0.25, 0.25, 0.0, 0.0, 0.0]);
        assert!(!mixer.registry().is_active(handle));
    }

    #[test]
    fn test_stop_all_catches_same_batch() {
        let (store, mixer) = setup();
        let tone = mono(&store, vec![0.5; 10]);
        let other = mono(&store, vec![0.25; 10]);

        mixer.registry().play(tone.clone(), true);
        mixer.registry().play(other, false);
        mixer.registry().play(tone, false);
        mixer.registry().stop_all();

        assert_eq!(step_mono(&mixer), 0.0);
        assert!(mixer.registry().is_empty());
    }

    #[test]
    fn test_independent_instances_of_one_sample() {
        let (store, mixer) = setup();
        let pad = mono(&store, vec![0.1; 1000]);

        let first = mixer.registry().play(pad.clone(), true);
        for _ in 0..37 {
            step_mono(&mixer);
        }
        let second = mixer.registry().play(pad, true);
        for _ in 0..5 {
            step_mono(&mixer);
        }

        let snapshot = mixer.registry().snapshot();
        let position = |h| snapshot.iter().find(|s| s.handle == h).unwrap().position;
        assert_eq!(position(first) - position(second), 37);
    }

    #[test]
    fn test_mixes_and_does_not_clip() {
        let (store, mixer) = setup();
        let loud = mono(&store, vec![0.8; 4]);
        mixer.registry().play(loud.clone(), false);
        mixer.registry().play(loud, false);

        let value = step_mono(&mixer);
        assert!((value - 1.6).abs() < 1e-6);
    }

    #[test]
    fn test_stereo_frame_advances_once() {
        let (store, mixer) = setup();
        let id = store
            .insert(DecodedWave {
                channel_count: 2,
                sample_rate: wav::SAMPLE_RATE,
                frames: vec![0.1, -0.1, 0.2, -0.2],
            })
            .unwrap();
        mixer.registry().play(store.get(id).unwrap(), false);

        let mut frame = [0.0; 2];
        mixer.mix_frame(0.0, TIME_STEP, &mut frame);
        assert_eq!(frame, [0.1, -0.1]);
        mixer.mix_frame(TIME_STEP, TIME_STEP, &mut frame);
        assert_eq!(frame, [0.2, -0.2]);
        mixer.mix_frame(2.0 * TIME_STEP, TIME_STEP, &mut frame);
        assert_eq!(frame, [0.0, 0.0]);
    }

    #[test]
    fn test_mono_sample_feeds_all_channels() {
        let (store, mixer) = setup();
        let click = mono(&store, vec![0.3]);
        mixer.registry().play(click, false);

        let mut frame = [0.0; 4];
        mixer.mix_frame(0.0, TIME_STEP, &mut frame);
        assert_eq!(frame, [0.3; 4]);
    }

    #[test]
    fn test_synth_hook_added() {
        let (store, mixer) = setup();
        let tone = mono(&store, vec![0.25; 4]);
        mixer.registry().play(tone, false);
        mixer.set_synth_hook(Some(Arc::new(|channel: usize, clock: f64, time_step: f64| {
            assert_eq!(time_step, TIME_STEP);
            channel as f32 * 0.5 + clock as f32
        })));

        assert_eq!(mixer.step(0, 0.0, TIME_STEP), 0.25);
        assert_eq!(mixer.step(1, 0.0, TIME_STEP), 0.75);
        assert_eq!(mixer.step(0, 0.125, TIME_STEP), 0.375);

        mixer.set_synth_hook(None);
        assert_eq!(mixer.step(1, 0.0, TIME_STEP), 0.25);
    }

    #[test]
    fn test_filter_hook_sees_raw_mix() {
        let (store, mixer) = setup();
        let loud = mono(&store, vec![0.9; 4]);
        mixer.registry().play(loud.clone(), false);
        mixer.registry().play(loud, false);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorder = seen.clone();
        mixer.set_synth_hook(Some(Arc::new(|_: usize, _: f64, _: f64| 0.1)));
        mixer.set_filter_hook(Some(Arc::new(move |channel: usize, clock: f64, mixed: f32| {
            recorder.lock().push((channel, clock, mixed));
            mixed * 0.5
        })));

        let mut frame = [0.0; 2];
        mixer.mix_frame(2.0, TIME_STEP, &mut frame);

        assert!((frame[0] - 0.95).abs() < 1e-6);
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].0, 1);
        assert_eq!(seen[1].1, 2.0);
        assert!((seen[0].2 - 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_hooks_may_use_registry() {
        let (store, mixer) = setup();
        let tone = mono(&store, vec![0.5; 4]);
        let registry = mixer.registry().clone();
        mixer.registry().play(tone, false);

        // Runs outside the registry lock, so this must not deadlock.
        mixer.set_filter_hook(Some(Arc::new(move |_: usize, _: f64, mixed: f32| {
            mixed + registry.len() as f32
        })));

        let mut frame = [0.0; 1];
        mixer.mix_frame(0.0, TIME_STEP, &mut frame);
        assert_eq!(frame[0], 1.5);
    }
}
