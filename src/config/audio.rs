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
use std::{path::Path, time::Duration};

use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File, FileFormat};
use duration_string::DurationString;
use serde::Deserialize;

use super::error::ConfigError;
use crate::audio::{thread_priority::StreamPriority, StreamConfig, StreamOptions};

const DEFAULT_AUDIO_PLAYBACK_DELAY: Duration = Duration::ZERO;

/// Environment variables with this prefix override file values, e.g.
/// SAMPLEDECK_DEVICE or SAMPLEDECK_THREAD_PRIORITY.
const ENV_PREFIX: &str = "SAMPLEDECK";

/// A YAML representation of the audio configuration.
#[derive(Deserialize, Clone, Debug)]
pub struct Audio {
    /// The audio device.
    device: String,

    /// Controls how long to wait before playback of the first sample starts.
    playback_delay: Option<String>,

    /// Output sample rate in Hz (default: 44100)
    sample_rate: Option<u32>,

    /// Output channels (default: 1)
    channels: Option<u16>,

    /// Number of blocks cycling between the mixer and the device (default: 8)
    block_count: Option<usize>,

    /// Frames per block (default: 512)
    block_frames: Option<usize>,

    /// Crossplatform priority for the streaming thread, 0-99. Unset leaves the
    /// thread at normal priority.
    thread_priority: Option<u8>,

    /// Also request SCHED_FIFO when a thread priority is set (default: true)
    realtime: Option<bool>,
}

impl Audio {
    /// New will create a new Audio configuration.
    pub fn new(device: &str) -> Audio {
        Audio {
            device: device.to_string(),
            playback_delay: None,
            sample_rate: None,
            channels: None,
            block_count: None,
            block_frames: None,
            thread_priority: None,
            realtime: None,
        }
    }

    /// Parse the audio configuration from a YAML file.
    pub fn deserialize(path: &Path) -> Result<Audio, ConfigError> {
        Self::build(Config::builder().add_source(File::from(path)))
    }

    /// Parse the audio configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Audio, ConfigError> {
        Self::build(Config::builder().add_source(File::from_str(yaml, FileFormat::Yaml)))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Audio, ConfigError> {
        Ok(builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize::<Audio>()?)
    }

    /// Returns the device from the configuration.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Returns the playback delay from the configuration.
    pub fn playback_delay(&self) -> Result<Duration, ConfigError> {
        match &self.playback_delay {
            Some(playback_delay) => Ok(DurationString::from_string(playback_delay.clone())
                .map_err(|e| ConfigError::Duration {
                    value: playback_delay.clone(),
                    reason: e.to_string(),
                })?
                .into()),
            None => Ok(DEFAULT_AUDIO_PLAYBACK_DELAY),
        }
    }

    /// Returns the stream shape, falling back to the defaults for unset values.
    pub fn stream_config(&self) -> StreamConfig {
        let defaults = StreamConfig::default();
        StreamConfig {
            sample_rate: self.sample_rate.unwrap_or(defaults.sample_rate),
            channels: self.channels.unwrap_or(defaults.channels),
            block_count: self.block_count.unwrap_or(defaults.block_count),
            block_frames: self.block_frames.unwrap_or(defaults.block_frames),
        }
    }

    /// Returns the streaming thread options.
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            priority: self
                .thread_priority
                .map(|priority| StreamPriority::new(Some(priority), self.realtime.unwrap_or(true))),
        }
    }
}
