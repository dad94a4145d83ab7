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

//! The streaming engine owns the device sink and a dedicated thread that keeps it
//! fed. Each block is filled frame by frame from the mixer, clipped, quantized to
//! 16 bits and pushed; the global clock moves once per frame.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, span, warn, Level};

use super::block::{Block, BlockPool};
use super::mixer::Mixer;
use super::sink::{DeviceError, DeviceSink, PushOutcome, StreamConfig};
use super::thread_priority::{configure_stream_thread_priority, StreamPriority};
use crate::playsync::CancelHandle;
use crate::samples::wav::PCM_MAX;

/// Wait after the first failed recovery. Doubles on each further failure.
const RECOVER_BACKOFF_MIN: Duration = Duration::from_millis(1);
const RECOVER_BACKOFF_MAX: Duration = Duration::from_millis(250);

/// Seconds of audio produced since the stream started.
///
/// Written only by the streaming thread; read anywhere.
#[derive(Default)]
pub struct GlobalClock {
    bits: AtomicU64,
}

impl GlobalClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    fn advance(&self, time_step: f64) {
        let next = self.now() + time_step;
        self.bits.store(next.to_bits(), Ordering::Release);
    }

    fn reset(&self) {
        self.bits.store(0f64.to_bits(), Ordering::Release);
    }
}

impl fmt::Debug for GlobalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalClock({:.6}s)", self.now())
    }
}

/// Counters kept by the streaming thread.
#[derive(Debug, Default)]
pub struct StreamStats {
    blocks_delivered: AtomicU64,
    busy_retries: AtomicU64,
    underruns: AtomicU64,
    frames_mixed: AtomicU64,
}

/// A copy of the stream counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStatsSnapshot {
    pub blocks_delivered: u64,
    pub busy_retries: u64,
    pub underruns: u64,
    pub frames_mixed: u64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            blocks_delivered: self.blocks_delivered.load(Ordering::Relaxed),
            busy_retries: self.busy_retries.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            frames_mixed: self.frames_mixed.load(Ordering::Relaxed),
        }
    }
}

/// Lifecycle of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Uninitialized,
    Initializing,
    Running,
    ShuttingDown,
}

/// Extra settings for the streaming thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOptions {
    /// Raise the streaming thread's priority. Left at normal priority when unset.
    pub priority: Option<StreamPriority>,
}

type SinkSlot = Arc<Mutex<Option<Box<dyn DeviceSink>>>>;

/// The resources held while streaming.
struct Running {
    config: StreamConfig,
    cancel: CancelHandle,
    sink: SinkSlot,
    pool: Arc<BlockPool>,
    stats: Arc<StreamStats>,
    join: JoinHandle<()>,
}

/// Drives a device sink from a dedicated thread.
pub struct StreamEngine {
    state: StreamState,
    running: Option<Running>,
}

impl Default for StreamEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamEngine {
    pub fn new() -> Self {
        StreamEngine {
            state: StreamState::Uninitialized,
            running: None,
        }
    }

    /// A stream whose thread died without being asked to stop reports
    /// `ShuttingDown` until `shutdown` reaps it.
    pub fn state(&self) -> StreamState {
        match &self.running {
            Some(running) if running.join.is_finished() && !running.cancel.is_cancelled() => {
                StreamState::ShuttingDown
            }
            _ => self.state,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == StreamState::Running
    }

    pub fn config(&self) -> Option<StreamConfig> {
        self.running.as_ref().map(|r| r.config)
    }

    pub fn stats(&self) -> Option<StreamStatsSnapshot> {
        self.running.as_ref().map(|r| r.stats.snapshot())
    }

    /// Allocates the block pool, opens the sink, resets the clock and starts the
    /// streaming thread. Anything done before a failure is undone.
    pub fn initialize(
        &mut self,
        config: StreamConfig,
        mut sink: Box<dyn DeviceSink>,
        mixer: Mixer,
        clock: Arc<GlobalClock>,
        options: StreamOptions,
    ) -> Result<(), DeviceError> {
        if self.state != StreamState::Uninitialized {
            return Err(DeviceError::AlreadyRunning);
        }
        self.state = StreamState::Initializing;

        let pool = match open_sink(&config, sink.as_mut()) {
            Ok(pool) => pool,
            Err(e) => {
                self.state = StreamState::Uninitialized;
                return Err(e);
            }
        };

        clock.reset();
        let device = sink.to_string();
        let sink: SinkSlot = Arc::new(Mutex::new(Some(sink)));
        let cancel = CancelHandle::new();
        let stats = Arc::new(StreamStats::default());

        let spawned = {
            let worker = StreamWorker {
                config,
                sink: sink.clone(),
                mixer,
                clock,
                pool: pool.clone(),
                stats: stats.clone(),
                cancel: cancel.clone(),
                priority: options.priority,
            };
            thread::Builder::new()
                .name("sampledeck-stream".into())
                .spawn(move || worker.run())
        };
        let join = match spawned {
            Ok(join) => join,
            Err(e) => {
                if let Some(mut sink) = sink.lock().take() {
                    sink.close();
                }
                self.state = StreamState::Uninitialized;
                return Err(DeviceError::Thread(e));
            }
        };

        info!(
            device,
            sample_rate = config.sample_rate,
            channels = config.channels,
            block_count = config.block_count,
            block_frames = config.block_frames,
            "Audio stream started"
        );
        self.running = Some(Running {
            config,
            cancel,
            sink,
            pool,
            stats,
            join,
        });
        self.state = StreamState::Running;
        Ok(())
    }

    /// Stops the streaming thread, closes the sink and frees the blocks. Returns
    /// false if nothing was running.
    pub fn shutdown(&mut self) -> bool {
        let Some(running) = self.running.take() else {
            return false;
        };
        self.state = StreamState::ShuttingDown;

        running.cancel.cancel();
        if running.join.join().is_err() {
            error!("Streaming thread panicked");
        }
        if let Some(mut sink) = running.sink.lock().take() {
            sink.close();
        }
        let stats = running.stats.snapshot();
        drop(running.pool);

        info!(
            blocks = stats.blocks_delivered,
            underruns = stats.underruns,
            busy_retries = stats.busy_retries,
            "Audio stream stopped"
        );
        self.state = StreamState::Uninitialized;
        true
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Validates the configuration, allocates the pool and opens the sink.
fn open_sink(
    config: &StreamConfig,
    sink: &mut dyn DeviceSink,
) -> Result<Arc<BlockPool>, DeviceError> {
    config.validate()?;
    let pool = Arc::new(BlockPool::new(config.block_count, config.block_len())?);
    sink.open(config, pool.recycler())?;
    Ok(pool)
}

/// Wait before the next recovery attempt after `failures` consecutive failures.
fn recover_backoff(failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(16);
    RECOVER_BACKOFF_MIN
        .saturating_mul(factor)
        .min(RECOVER_BACKOFF_MAX)
}

/// The sink slot as held by the streaming thread. Closes the sink if the thread
/// unwinds; a clean exit leaves it in the slot for `shutdown`.
struct HeldSink<'a>(MutexGuard<'a, Option<Box<dyn DeviceSink>>>);

impl Drop for HeldSink<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        if let Some(mut sink) = self.0.take() {
            error!(device = %sink, "Streaming thread panicked, closing device");
            sink.close();
        }
    }
}

/// Converts a mixed value to a 16-bit sample, clipping to [-1, 1] first.
#[inline]
pub fn quantize(value: f32) -> i16 {
    (value.clamp(-1.0, 1.0) * PCM_MAX).round() as i16
}

/// Everything the streaming thread owns.
struct StreamWorker {
    config: StreamConfig,
    sink: SinkSlot,
    mixer: Mixer,
    clock: Arc<GlobalClock>,
    pool: Arc<BlockPool>,
    stats: Arc<StreamStats>,
    cancel: CancelHandle,
    priority: Option<StreamPriority>,
}

impl StreamWorker {
    fn run(self) {
        let span = span!(Level::INFO, "audio stream");
        let _enter = span.enter();

        if let Some(priority) = self.priority {
            configure_stream_thread_priority(priority);
        }

        // Held until this thread exits; shutdown only looks at it after joining.
        let mut held = HeldSink(self.sink.lock());
        let Some(sink) = held.0.as_mut() else {
            return;
        };

        let time_step = self.config.time_step();
        let mut frame = vec![0.0f32; usize::from(self.config.channels)];

        while !self.cancel.is_cancelled() {
            let Some(mut block) = sink.wait_free_block(&self.pool, &self.cancel) else {
                break;
            };
            self.fill(&mut block, &mut frame, time_step);
            if !self.deliver(sink.as_mut(), block) {
                break;
            }
        }

        debug!("Streaming thread exiting");
    }

    fn fill(&self, block: &mut Block, frame: &mut [f32], time_step: f64) {
        let channels = frame.len();
        let mut frames = 0u64;
        for out in block.samples_mut().chunks_exact_mut(channels) {
            self.mixer.mix_frame(self.clock.now(), time_step, frame);
            for (dst, value) in out.iter_mut().zip(frame.iter()) {
                *dst = quantize(*value);
            }
            self.clock.advance(time_step);
            frames += 1;
        }
        self.stats.frames_mixed.fetch_add(frames, Ordering::Relaxed);
    }

    /// Pushes until the sink accepts the block. Returns false if cancelled first.
    fn deliver(&self, sink: &mut dyn DeviceSink, mut block: Block) -> bool {
        let mut failed_recoveries = 0u32;
        loop {
            match sink.push_block(block) {
                PushOutcome::Accepted => {
                    self.stats.blocks_delivered.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                PushOutcome::Busy(returned) => {
                    self.stats.busy_retries.fetch_add(1, Ordering::Relaxed);
                    block = returned;
                    if self.cancel.is_cancelled() {
                        self.pool.release(block);
                        return false;
                    }
                    sink.wait_ready(&self.cancel);
                }
                PushOutcome::Underrun(returned) => {
                    self.stats.underruns.fetch_add(1, Ordering::Relaxed);
                    block = returned;
                    if failed_recoveries == 0 {
                        warn!(device = %sink, "Device underrun, recovering");
                    }
                    match sink.recover() {
                        Ok(()) => {
                            if failed_recoveries > 0 {
                                info!(device = %sink, failed_recoveries, "Device recovered");
                            }
                            failed_recoveries = 0;
                        }
                        Err(e) => {
                            failed_recoveries += 1;
                            if failed_recoveries == 1 {
                                error!(device = %sink, err = %e, "Unable to recover device");
                            } else {
                                debug!(
                                    device = %sink,
                                    err = %e,
                                    failed_recoveries,
                                    "Device still failing"
                                );
                            }
                            self.cancel.wait_timeout(recover_backoff(failed_recoveries));
                        }
                    }
                    if self.cancel.is_cancelled() {
                        self.pool.release(block);
                        return false;
                    }
                }
            }
        }
    }
}
