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
use std::fmt;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use super::block::{Block, BlockPool, BlockRecycler};
use crate::playsync::CancelHandle;
use crate::samples::wav;

/// How long to back off after the device reports it is busy.
const BUSY_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("invalid stream configuration: {0}")]
    InvalidConfig(String),

    #[error("unable to allocate {0} bytes for an audio block")]
    Allocation(usize),

    #[error("audio host error: {0}")]
    Host(String),

    #[error("no device found with name {0}")]
    NotFound(String),

    #[error("unable to open device {device}: {reason}")]
    Open { device: String, reason: String },

    #[error("device stream error: {0}")]
    Stream(String),

    #[error("audio stream is already running")]
    AlreadyRunning,

    #[error("unable to start streaming thread: {0}")]
    Thread(std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shape of the PCM stream a sink is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub block_count: usize,
    pub block_frames: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            sample_rate: wav::SAMPLE_RATE,
            channels: 1,
            block_count: 8,
            block_frames: 512,
        }
    }
}

impl StreamConfig {
    pub fn new(sample_rate: u32, channels: u16, block_count: usize, block_frames: usize) -> Self {
        StreamConfig {
            sample_rate,
            channels,
            block_count,
            block_frames,
        }
    }

    /// Rejects configurations the stream cannot run with.
    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.sample_rate == 0 {
            return Err(DeviceError::InvalidConfig(
                "sample rate must be positive".into(),
            ));
        }
        if self.channels == 0 {
            return Err(DeviceError::InvalidConfig(
                "at least one output channel is required".into(),
            ));
        }
        if self.block_frames == 0 {
            return Err(DeviceError::InvalidConfig(
                "block frames must be positive".into(),
            ));
        }
        // One block plays while the next is filled.
        if self.block_count < 2 {
            return Err(DeviceError::InvalidConfig(format!(
                "at least two blocks are required, got {}",
                self.block_count
            )));
        }
        Ok(())
    }

    /// Samples in one block, across all channels.
    pub fn block_len(&self) -> usize {
        self.block_frames * usize::from(self.channels)
    }

    /// Seconds per output frame.
    pub fn time_step(&self) -> f64 {
        1.0 / f64::from(self.sample_rate)
    }

    /// Playback time of one block.
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_frames as f64 / f64::from(self.sample_rate))
    }
}

/// Result of handing a block to the device.
#[derive(Debug)]
pub enum PushOutcome {
    /// The device took ownership of the block.
    Accepted,
    /// Transiently unable to accept. The same block must be retried.
    Busy(Block),
    /// The device ran dry. It must be recovered and the same block retried.
    Underrun(Block),
}

/// How the streaming thread waits for free blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Sleep until the device returns a block to the pool.
    Blocking,
    /// Repeatedly ask the device to reclaim processed blocks.
    Polling,
}

/// A platform output the streaming engine can drive.
pub trait DeviceSink: fmt::Display + Send {
    /// Opens the device. Spent blocks go back through the recycler.
    fn open(&mut self, config: &StreamConfig, recycler: BlockRecycler) -> Result<(), DeviceError>;

    /// Stops the device and releases it. Safe to call when not open.
    fn close(&mut self);

    /// Submits a filled block.
    fn push_block(&mut self, block: Block) -> PushOutcome;

    /// Re-primes the device after an underrun.
    fn recover(&mut self) -> Result<(), DeviceError>;

    fn strategy(&self) -> WaitStrategy {
        WaitStrategy::Blocking
    }

    /// Returns blocks the device has finished playing to the pool. Only polled
    /// sinks need this.
    fn reclaim(&mut self) {}

    /// Waits for a free block. Returns None once cancelled.
    fn wait_free_block(&mut self, pool: &BlockPool, cancel: &CancelHandle) -> Option<Block> {
        match self.strategy() {
            WaitStrategy::Blocking => pool.acquire(cancel),
            WaitStrategy::Polling => loop {
                self.reclaim();
                if let Some(block) = pool.try_acquire() {
                    return Some(block);
                }
                if cancel.is_cancelled() {
                    return None;
                }
                thread::yield_now();
            },
        }
    }

    /// Waits for a busy device to make room.
    fn wait_ready(&mut self, cancel: &CancelHandle) {
        match self.strategy() {
            WaitStrategy::Blocking => {
                cancel.wait_timeout(BUSY_BACKOFF);
            }
            WaitStrategy::Polling => {
                self.reclaim();
                thread::yield_now();
            }
        }
    }
}
