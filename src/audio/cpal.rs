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
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{error, info};

use super::block::{Block, BlockRecycler};
use super::sink::{DeviceError, DeviceSink, PushOutcome, StreamConfig};

/// Flags shared between the sink and the device callback.
#[derive(Default)]
struct CallbackState {
    /// A block has been played since the last recovery.
    primed: AtomicBool,
    /// The callback ran out of queued blocks after being primed.
    starved: AtomicBool,
    /// The stream reported an error.
    failed: AtomicBool,
}

/// A cpal output device. The device pulls queued blocks from its callback and
/// hands them back to the pool once played.
pub struct CpalSink {
    name: String,
    max_channels: u16,
    host_id: cpal::HostId,
    device: cpal::Device,
    output: Option<Output>,
}

/// A running cpal stream. cpal streams are not Send, so the stream lives on its
/// own thread until it's told to close.
struct Output {
    queue_tx: Sender<Block>,
    close_tx: Sender<()>,
    state: Arc<CallbackState>,
    thread: Option<thread::JoinHandle<()>>,
}

impl fmt::Display for CpalSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Channels={}) ({})",
            self.name,
            self.max_channels,
            self.host_id.name()
        )
    }
}

/// Copies queued blocks into the device's buffers.
struct BlockReader {
    queue_rx: Receiver<Block>,
    recycler: BlockRecycler,
    current: Option<Block>,
    offset: usize,
    state: Arc<CallbackState>,
}

impl BlockReader {
    fn fill<T>(&mut self, data: &mut [T])
    where
        T: Sample + FromSample<i16>,
    {
        let mut written = 0;
        while written < data.len() {
            if self.current.is_none() {
                match self.queue_rx.try_recv() {
                    Ok(block) => {
                        self.current = Some(block);
                        self.offset = 0;
                        self.state.primed.store(true, Ordering::Release);
                    }
                    Err(_) => break,
                }
            }
            let Some(block) = &self.current else {
                break;
            };

            let src = &block.samples()[self.offset..];
            let count = src.len().min(data.len() - written);
            for (dst, sample) in data[written..written + count].iter_mut().zip(src) {
                *dst = T::from_sample(*sample);
            }
            written += count;
            self.offset += count;

            if self.offset >= block.len() {
                if let Some(block) = self.current.take() {
                    self.recycler.recycle(block);
                }
            }
        }

        if written < data.len() {
            data[written..].fill(T::EQUILIBRIUM);
            if self.state.primed.swap(false, Ordering::AcqRel) {
                self.state.starved.store(true, Ordering::Release);
            }
        }
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut reader: BlockReader,
) -> Result<cpal::Stream, String>
where
    T: SizedSample + FromSample<i16>,
{
    let state = reader.state.clone();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| reader.fill(data),
            move |err| {
                error!("CPAL output stream error: {}", err);
                state.failed.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| e.to_string())
}

impl CpalSink {
    /// Lists every output device across the available hosts.
    pub fn list() -> Result<Vec<CpalSink>, DeviceError> {
        // cpal backends can be noisy on the terminal while probing.
        let _shh_stdout = shh::stdout()?;
        let _shh_stderr = shh::stderr()?;

        let mut devices: Vec<CpalSink> = Vec::new();
        for host_id in cpal::available_hosts() {
            let host = cpal::host_from_id(host_id).map_err(|e| DeviceError::Host(e.to_string()))?;
            let host_devices = match host.devices() {
                Ok(host_devices) => host_devices,
                Err(e) => {
                    error!(
                        err = e.to_string(),
                        host = host_id.name(),
                        "Unable to list devices for host"
                    );
                    continue;
                }
            };

            for device in host_devices {
                let Ok(output_configs) = device.supported_output_configs() else {
                    continue;
                };
                let max_channels = output_configs
                    .map(|config| config.channels())
                    .max()
                    .unwrap_or(0);

                if max_channels > 0 {
                    let Ok(name) = device.name() else {
                        continue;
                    };
                    devices.push(CpalSink {
                        name,
                        max_channels,
                        host_id,
                        device,
                        output: None,
                    })
                }
            }
        }

        devices.sort_by_key(|device| device.name.to_string());
        Ok(devices)
    }

    /// Gets the named output device. "default" selects the default host's default
    /// output.
    pub fn get(name: &str) -> Result<CpalSink, DeviceError> {
        if name == "default" {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| DeviceError::NotFound(name.to_string()))?;
            let max_channels = device
                .supported_output_configs()
                .map_err(|e| DeviceError::Host(e.to_string()))?
                .map(|config| config.channels())
                .max()
                .unwrap_or(0);
            return Ok(CpalSink {
                name: device.name().unwrap_or_else(|_| name.to_string()),
                max_channels,
                host_id: host.id(),
                device,
                output: None,
            });
        }

        CpalSink::list()?
            .into_iter()
            .find(|device| device.name.trim() == name)
            .ok_or_else(|| DeviceError::NotFound(name.to_string()))
    }

    fn open_error(&self, reason: impl Into<String>) -> DeviceError {
        DeviceError::Open {
            device: self.name.clone(),
            reason: reason.into(),
        }
    }
}

impl DeviceSink for CpalSink {
    fn open(&mut self, config: &StreamConfig, recycler: BlockRecycler) -> Result<(), DeviceError> {
        if config.channels > self.max_channels {
            return Err(self.open_error(format!(
                "{} channels requested, device only has {}",
                config.channels, self.max_channels
            )));
        }
        let sample_format = self
            .device
            .default_output_config()
            .map_err(|e| self.open_error(e.to_string()))?
            .sample_format();

        let (queue_tx, queue_rx) = crossbeam_channel::bounded(config.block_count);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);
        let (close_tx, close_rx) = crossbeam_channel::bounded::<()>(1);
        let state = Arc::new(CallbackState::default());

        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let reader = BlockReader {
            queue_rx,
            recycler,
            current: None,
            offset: 0,
            state: state.clone(),
        };
        let device = self.device.clone();

        let output_thread = thread::Builder::new()
            .name("sampledeck-cpal".into())
            .spawn(move || {
                let stream = match sample_format {
                    cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, reader),
                    cpal::SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, reader),
                    cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, reader),
                    cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, reader),
                    cpal::SampleFormat::F64 => build_stream::<f64>(&device, &stream_config, reader),
                    other => Err(format!("unsupported sample format {}", other)),
                };
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Hold the stream until closed or the sink goes away.
                let _ = close_rx.recv();
                drop(stream);
            })
            .map_err(DeviceError::Thread)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                let _ = output_thread.join();
                return Err(self.open_error(reason));
            }
            Err(_) => {
                let _ = output_thread.join();
                return Err(self.open_error("output thread exited"));
            }
        }

        info!(
            device = self.name,
            format = %sample_format,
            "CPAL output stream started"
        );
        self.output = Some(Output {
            queue_tx,
            close_tx,
            state,
            thread: Some(output_thread),
        });
        Ok(())
    }

    fn close(&mut self) {
        let Some(mut output) = self.output.take() else {
            return;
        };
        let _ = output.close_tx.send(());
        if let Some(thread) = output.thread.take() {
            if thread.join().is_err() {
                error!(device = self.name, "CPAL output thread panicked");
            }
        }
        info!(device = self.name, "CPAL output stream stopped");
    }

    fn push_block(&mut self, block: Block) -> PushOutcome {
        match &self.output {
            Some(output) => output.push(&self.name, block),
            None => PushOutcome::Underrun(block),
        }
    }

    fn recover(&mut self) -> Result<(), DeviceError> {
        let Some(output) = &self.output else {
            return Err(DeviceError::Stream(format!("{} is not open", self.name)));
        };
        if !output.recover() {
            return Err(DeviceError::Stream(format!(
                "{} reported a stream error",
                self.name
            )));
        }
        Ok(())
    }
}

impl Output {
    /// Queues a block for the callback. A starved or failed stream reports an
    /// underrun; a closed queue means the stream is gone and marks it failed.
    fn push(&self, device: &str, block: Block) -> PushOutcome {
        if self.state.failed.load(Ordering::Acquire) || self.state.starved.load(Ordering::Acquire) {
            return PushOutcome::Underrun(block);
        }
        match self.queue_tx.try_send(block) {
            Ok(()) => PushOutcome::Accepted,
            Err(TrySendError::Full(block)) => PushOutcome::Busy(block),
            Err(TrySendError::Disconnected(block)) => {
                error!(device, "CPAL callback queue closed");
                self.state.failed.store(true, Ordering::Release);
                PushOutcome::Underrun(block)
            }
        }
    }

    /// Clears starvation so the callback resumes from the next queued block.
    /// Returns false if the stream has failed.
    fn recover(&self) -> bool {
        if self.state.failed.load(Ordering::Acquire) {
            return false;
        }
        self.state.starved.store(false, Ordering::Release);
        true
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::block::BlockPool;

    fn reader(pool: &BlockPool) -> (BlockReader, Sender<Block>) {
        let (queue_tx, queue_rx) = crossbeam_channel::bounded(pool.capacity());
        (
            BlockReader {
                queue_rx,
                recycler: pool.recycler(),
                current: None,
                offset: 0,
                state: Arc::new(CallbackState::default()),
            },
            queue_tx,
        )
    }

    #[test]
    fn test_reader_spans_blocks_and_recycles() {
        let pool = BlockPool::new(2, 4).unwrap();
        let (mut reader, queue_tx) = reader(&pool);

        for base in [0i16, 4] {
            let mut block = pool.try_acquire().unwrap();
            for (i, sample) in block.samples_mut().iter_mut().enumerate() {
                *sample = base + i as i16;
            }
            queue_tx.send(block).unwrap();
        }

        let mut data = [0i16; 6];
        reader.fill(&mut data);
        assert_eq!(data, [0, 1, 2, 3, 4, 5]);
        assert_eq!(pool.available(), 1);
        assert!(!reader.state.starved.load(Ordering::Acquire));

        let mut data = [9i16; 4];
        reader.fill(&mut data);
        assert_eq!(data, [6, 7, 0, 0]);
        assert_eq!(pool.available(), 2);
        assert!(reader.state.starved.load(Ordering::Acquire));
    }

    #[test]
    fn test_reader_silent_before_first_block() {
        let pool = BlockPool::new(1, 4).unwrap();
        let (mut reader, _queue_tx) = reader(&pool);

        let mut data = [1.0f32; 8];
        reader.fill(&mut data);
        assert!(data.iter().all(|s| *s == 0.0));
        assert!(!reader.state.starved.load(Ordering::Acquire));
    }

    #[test]
    fn test_reader_converts_to_float() {
        let pool = BlockPool::new(1, 2).unwrap();
        let (mut reader, queue_tx) = reader(&pool);
        let mut block = pool.try_acquire().unwrap();
        block.samples_mut().copy_from_slice(&[i16::MAX, 0]);
        queue_tx.send(block).unwrap();

        let mut data = [0.5f32; 2];
        reader.fill(&mut data);
        assert!((data[0] - 1.0).abs() < 1e-3);
        assert_eq!(data[1], 0.0);
    }

    fn output(capacity: usize) -> (Output, Receiver<Block>) {
        let (queue_tx, queue_rx) = crossbeam_channel::bounded(capacity);
        let (close_tx, _) = crossbeam_channel::bounded(1);
        (
            Output {
                queue_tx,
                close_tx,
                state: Arc::new(CallbackState::default()),
                thread: None,
            },
            queue_rx,
        )
    }

    #[test]
    fn test_push_busy_and_starved() {
        let pool = BlockPool::new(2, 4).unwrap();
        let (output, _queue_rx) = output(1);

        let first = pool.try_acquire().unwrap();
        assert!(matches!(output.push("test", first), PushOutcome::Accepted));
        let second = pool.try_acquire().unwrap();
        let second = match output.push("test", second) {
            PushOutcome::Busy(block) => block,
            other => panic!("expected busy, got {:?}", other),
        };

        output.state.starved.store(true, Ordering::Release);
        let second = match output.push("test", second) {
            PushOutcome::Underrun(block) => block,
            other => panic!("expected underrun, got {:?}", other),
        };
        assert!(output.recover());
        assert!(!output.state.starved.load(Ordering::Acquire));
        assert!(matches!(output.push("test", second), PushOutcome::Busy(_)));
    }

    #[test]
    fn test_closed_queue_fails_stream() {
        let pool = BlockPool::new(1, 4).unwrap();
        let (output, queue_rx) = output(1);
        drop(queue_rx);

        let block = pool.try_acquire().unwrap();
        assert!(matches!(
            output.push("test", block),
            PushOutcome::Underrun(_)
        ));
        assert!(output.state.failed.load(Ordering::Acquire));
        assert!(!output.recover());
    }
}
