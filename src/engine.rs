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

//! The control plane. An `AudioEngine` owns the sample store, the playback
//! registry, the mixer and the stream, and is what applications talk to.

use std::io::{Read, Seek};
use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::audio::{
    self, DeviceError, DeviceSink, GlobalClock, Mixer, StreamConfig, StreamEngine,
    StreamOptions, StreamState, StreamStatsSnapshot,
};
use crate::config;
use crate::playback::{InstanceHandle, InstanceState, PlaybackRegistry};
use crate::samples::{FormatError, Sample, SampleId, SampleStore};

pub struct AudioEngine {
    samples: SampleStore,
    registry: Arc<PlaybackRegistry>,
    mixer: Mixer,
    clock: Arc<GlobalClock>,
    stream: StreamEngine,
}

impl Default for AudioEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEngine {
    pub fn new() -> AudioEngine {
        let registry = Arc::new(PlaybackRegistry::new());
        AudioEngine {
            samples: SampleStore::new(),
            mixer: Mixer::new(registry.clone()),
            registry,
            clock: Arc::new(GlobalClock::new()),
            stream: StreamEngine::new(),
        }
    }

    /// Starts streaming to the sink. Returns false, after logging why, if the engine
    /// is already running or the stream could not be started.
    pub fn initialize(&mut self, config: StreamConfig, sink: Box<dyn DeviceSink>) -> bool {
        match self.initialize_with(config, sink, StreamOptions::default()) {
            Ok(()) => true,
            Err(e) => {
                error!(err = %e, "Unable to initialize audio");
                false
            }
        }
    }

    /// Starts streaming with explicit thread options.
    pub fn initialize_with(
        &mut self,
        config: StreamConfig,
        sink: Box<dyn DeviceSink>,
        options: StreamOptions,
    ) -> Result<(), DeviceError> {
        if self.stream.state() != StreamState::Uninitialized {
            warn!("Audio engine is already initialized");
            return Err(DeviceError::AlreadyRunning);
        }

        // A fresh session starts with nothing playing.
        self.registry.clear();
        self.stream.initialize(
            config,
            sink,
            self.mixer.clone(),
            self.clock.clone(),
            options,
        )
    }

    /// Starts streaming to the device named in the configuration.
    pub fn initialize_from_config(&mut self, audio: &config::Audio) -> Result<(), DeviceError> {
        let sink = audio::get_sink(audio.device())?;
        self.initialize_with(audio.stream_config(), sink, audio.stream_options())
    }

    /// Stops streaming and releases the device. Playing instances are dropped.
    /// Returns false if the engine was not running.
    pub fn destroy(&mut self) -> bool {
        let stopped = self.stream.shutdown();
        self.registry.clear();
        stopped
    }

    /// Decodes and stores a WAV sample.
    pub fn load_sample<R: Read + Seek>(&self, reader: R) -> Result<SampleId, FormatError> {
        self.samples.load(reader).inspect_err(|e| {
            warn!(err = %e, "Unable to load sample");
        })
    }

    /// Decodes and stores a WAV file.
    pub fn load_sample_file(&self, path: &Path) -> Result<SampleId, FormatError> {
        self.samples.load_file(path).inspect_err(|e| {
            warn!(path = ?path, err = %e, "Unable to load sample");
        })
    }

    /// Starts a playback of the sample from its first frame. Unknown ids are
    /// ignored.
    pub fn play_sample(&self, id: SampleId, looping: bool) -> Option<InstanceHandle> {
        match self.samples.get(id) {
            Some(sample) => Some(self.registry.play(sample, looping)),
            None => {
                warn!(sample = id.raw(), "Ignoring play for unknown sample");
                None
            }
        }
    }

    /// Stops the oldest playing instance of the sample.
    pub fn stop_sample(&self, id: SampleId) -> bool {
        self.registry.stop(id)
    }

    pub fn stop_instance(&self, handle: InstanceHandle) -> bool {
        self.registry.stop_instance(handle)
    }

    /// Stops every instance. They fall silent on the next mixed frame.
    pub fn stop_all(&self) -> usize {
        let stopped = self.registry.stop_all();
        if stopped > 0 {
            info!(stopped, "Stopping all playback");
        }
        stopped
    }

    /// Registers a generator summed into every output value.
    pub fn set_synth_hook<F>(&self, hook: F)
    where
        F: Fn(usize, f64, f64) -> f32 + Send + Sync + 'static,
    {
        self.mixer.set_synth_hook(Some(Arc::new(hook)));
    }

    /// Registers a post-processor applied to every mixed value before clipping.
    pub fn set_filter_hook<F>(&self, hook: F)
    where
        F: Fn(usize, f64, f32) -> f32 + Send + Sync + 'static,
    {
        self.mixer.set_filter_hook(Some(Arc::new(hook)));
    }

    pub fn clear_synth_hook(&self) {
        self.mixer.set_synth_hook(None);
    }

    pub fn clear_filter_hook(&self) {
        self.mixer.set_filter_hook(None);
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_running()
    }

    /// Seconds of audio streamed since initialization.
    pub fn clock(&self) -> f64 {
        self.clock.now()
    }

    pub fn active_instances(&self) -> usize {
        self.registry.len()
    }

    pub fn is_playing(&self, handle: InstanceHandle) -> bool {
        self.registry.is_active(handle)
    }

    pub fn instances(&self) -> Vec<InstanceState> {
        self.registry.snapshot()
    }

    pub fn sample(&self, id: SampleId) -> Option<Arc<Sample>> {
        self.samples.get(id)
    }

    pub fn samples(&self) -> &SampleStore {
        &self.samples
    }

    pub fn stats(&self) -> Option<StreamStatsSnapshot> {
        self.stream.stats()
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}
