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

//! Writes raw signed 16-bit little-endian PCM to stdout or a file, paced to real
//! time as a hardware device would consume it. Useful for piping into `aplay` or
//! `ffplay`, or capturing a stream for inspection.

use std::{
    fmt,
    fs::File,
    io::{self, BufWriter, ErrorKind, Write},
    path::PathBuf,
    time::{Duration, Instant},
};

use tracing::{error, info, warn};

use super::block::{Block, BlockRecycler};
use super::sink::{DeviceError, DeviceSink, PushOutcome, StreamConfig};

/// Back off when the reader of the pipe is not keeping up.
const WOULD_BLOCK_BACKOFF: Duration = Duration::from_micros(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeTarget {
    Stdout,
    File(PathBuf),
}

impl PipeTarget {
    /// Parses the part after `pipe:`. `-` is stdout.
    pub fn parse(target: &str) -> PipeTarget {
        match target {
            "" | "-" => PipeTarget::Stdout,
            path => PipeTarget::File(PathBuf::from(path)),
        }
    }
}

struct PipeOutput {
    writer: Box<dyn Write + Send>,
    recycler: BlockRecycler,
    block_bytes: usize,
    block_period: Duration,
    /// How far ahead of real time writes may run.
    lead: Duration,
    /// When the device would run out of already-written audio.
    drained_at: Instant,
    scratch: Vec<u8>,
    /// Set after a fatal write error; output is discarded from then on.
    broken: bool,
}

/// A sink that writes PCM bytes to a pipe or file.
pub struct PipeSink {
    target: PipeTarget,
    output: Option<PipeOutput>,
}

impl PipeSink {
    pub fn new(target: PipeTarget) -> PipeSink {
        PipeSink {
            target,
            output: None,
        }
    }

    fn create_writer(&self) -> Result<Box<dyn Write + Send>, DeviceError> {
        Ok(match &self.target {
            PipeTarget::Stdout => Box::new(io::stdout()),
            PipeTarget::File(path) => Box::new(BufWriter::new(File::create(path)?)),
        })
    }
}

impl PipeOutput {
    /// Writes all bytes, retrying interrupted and would-block writes.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < bytes.len() {
            match self.writer.write(&bytes[written..]) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    spin_sleep::sleep(WOULD_BLOCK_BACKOFF)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Writes silence for a full buffer's worth of blocks and restarts pacing.
    fn prime(&mut self, block_count: usize) -> io::Result<()> {
        let silence = vec![0u8; self.block_bytes];
        for _ in 0..block_count {
            self.write_all(&silence)?;
        }
        self.writer.flush()?;
        self.drained_at = Instant::now() + self.lead + self.block_period;
        Ok(())
    }

    fn block_count(&self) -> usize {
        let period = self.block_period.as_nanos().max(1);
        (self.lead.as_nanos() / period) as usize + 1
    }
}

impl DeviceSink for PipeSink {
    fn open(&mut self, config: &StreamConfig, recycler: BlockRecycler) -> Result<(), DeviceError> {
        let writer = self.create_writer()?;
        let block_period = config.block_duration();
        let mut output = PipeOutput {
            writer,
            recycler,
            block_bytes: config.block_len() * 2,
            block_period,
            lead: block_period * (config.block_count as u32).saturating_sub(1),
            drained_at: Instant::now(),
            scratch: Vec::with_capacity(config.block_len() * 2),
            broken: false,
        };
        output.prime(config.block_count)?;

        info!(pipe = %self, "Opened PCM pipe");
        self.output = Some(output);
        Ok(())
    }

    fn close(&mut self) {
        let Some(mut output) = self.output.take() else {
            return;
        };
        if !output.broken {
            if let Err(e) = output.writer.flush() {
                warn!(pipe = %self, err = %e, "Unable to flush PCM pipe");
            }
        }
        info!(pipe = %self, "Closed PCM pipe");
    }

    fn push_block(&mut self, block: Block) -> PushOutcome {
        let Some(output) = self.output.as_mut() else {
            return PushOutcome::Underrun(block);
        };
        if output.broken {
            output.recycler.recycle(block);
            return PushOutcome::Accepted;
        }

        if Instant::now() > output.drained_at {
            return PushOutcome::Underrun(block);
        }

        let mut scratch = std::mem::take(&mut output.scratch);
        scratch.clear();
        block.write_le_bytes(&mut scratch);
        let result = output.write_all(&scratch);
        output.scratch = scratch;
        output.recycler.recycle(block);

        if let Err(e) = result {
            error!(err = %e, "PCM pipe closed, discarding output");
            output.broken = true;
            return PushOutcome::Accepted;
        }

        // Stay at most `lead` ahead of the point the reader would drain.
        output.drained_at += output.block_period;
        let wake_at = output.drained_at - output.lead - output.block_period;
        let now = Instant::now();
        if wake_at > now {
            spin_sleep::sleep(wake_at - now);
        }
        PushOutcome::Accepted
    }

    fn recover(&mut self) -> Result<(), DeviceError> {
        let Some(output) = self.output.as_mut() else {
            return Err(DeviceError::Stream("PCM pipe is not open".into()));
        };
        let block_count = output.block_count();
        output.prime(block_count)?;
        Ok(())
    }
}

impl fmt::Display for PipeSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            PipeTarget::Stdout => write!(f, "stdout (Pipe)"),
            PipeTarget::File(path) => write!(f, "{} (Pipe)", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::audio::block::BlockPool;

    #[test]
    fn test_parse_target() {
        assert_eq!(PipeTarget::parse("-"), PipeTarget::Stdout);
        assert_eq!(PipeTarget::parse(""), PipeTarget::Stdout);
        assert_eq!(
            PipeTarget::parse("/tmp/out.pcm"),
            PipeTarget::File(PathBuf::from("/tmp/out.pcm"))
        );
    }

    #[test]
    fn test_writes_primed_pcm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pcm");
        // 100ms blocks leave plenty of slack before the first push.
        let config = StreamConfig::new(44100, 2, 2, 4410);
        let pool = BlockPool::new(config.block_count, config.block_len()).unwrap();

        let mut sink = PipeSink::new(PipeTarget::File(path.clone()));
        sink.open(&config, pool.recycler()).unwrap();

        let mut block = pool.try_acquire().unwrap();
        block.samples_mut()[0] = 0x1234;
        block.samples_mut()[1] = -1;
        assert!(matches!(sink.push_block(block), PushOutcome::Accepted));
        assert_eq!(pool.available(), 2);
        sink.close();

        let bytes = std::fs::read(&path).unwrap();
        let block_bytes = config.block_len() * 2;
        assert_eq!(bytes.len(), 3 * block_bytes);
        assert!(bytes[..2 * block_bytes].iter().all(|b| *b == 0));
        assert_eq!(
            &bytes[2 * block_bytes..2 * block_bytes + 4],
            &[0x34, 0x12, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_late_push_underruns_until_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.pcm");
        // 10ms blocks, so the primed buffer drains in about 20ms.
        let config = StreamConfig::new(44100, 1, 2, 441);
        let pool = BlockPool::new(config.block_count, config.block_len()).unwrap();

        let mut sink = PipeSink::new(PipeTarget::File(path));
        sink.open(&config, pool.recycler()).unwrap();
        thread::sleep(Duration::from_millis(60));

        let block = pool.try_acquire().unwrap();
        let block = match sink.push_block(block) {
            PushOutcome::Underrun(block) => block,
            other => panic!("expected underrun, got {:?}", other),
        };

        sink.recover().unwrap();
        assert!(matches!(sink.push_block(block), PushOutcome::Accepted));
        sink.close();
    }

    #[test]
    fn test_push_before_open() {
        let pool = BlockPool::new(1, 4).unwrap();
        let mut sink = PipeSink::new(PipeTarget::Stdout);
        let block = pool.try_acquire().unwrap();
        assert!(matches!(sink.push_block(block), PushOutcome::Underrun(_)));
        assert!(sink.recover().is_err());
    }
}
