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

//! Fixed-size PCM blocks and the pool they cycle through.
//!
//! A block is owned by exactly one party at a time: the pool, the streaming
//! thread while it is being filled, or the sink while the device plays it. Sinks
//! hand spent blocks back through a `BlockRecycler`.

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::sink::DeviceError;
use crate::playsync::CancelHandle;

/// How long a blocked acquire sleeps before re-checking for cancellation.
const ACQUIRE_TICK: Duration = Duration::from_millis(5);

/// Interleaved 16-bit frames exchanged between the mixer loop and a sink.
pub struct Block {
    samples: Vec<i16>,
}

impl Block {
    fn allocate(len: usize) -> Result<Block, DeviceError> {
        let mut samples = Vec::new();
        samples
            .try_reserve_exact(len)
            .map_err(|_| DeviceError::Allocation(len * std::mem::size_of::<i16>()))?;
        samples.resize(len, 0);
        Ok(Block { samples })
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [i16] {
        &mut self.samples
    }

    /// Number of samples (frames * channels).
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Fills the block with silence.
    pub fn silence(&mut self) {
        self.samples.fill(0);
    }

    /// Appends the block as little-endian bytes.
    pub fn write_le_bytes(&self, out: &mut Vec<u8>) {
        out.reserve(self.samples.len() * 2);
        for sample in &self.samples {
            out.extend_from_slice(&sample.to_le_bytes());
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("len", &self.samples.len())
            .finish()
    }
}

/// Returns spent blocks to the pool. Held by sinks.
#[derive(Clone)]
pub struct BlockRecycler {
    free_tx: Sender<Block>,
}

impl BlockRecycler {
    /// Hands a block back to the pool. Blocks that no longer fit are dropped.
    pub fn recycle(&self, block: Block) {
        let _ = self.free_tx.try_send(block);
    }
}

/// The free list of preallocated blocks.
pub struct BlockPool {
    free_tx: Sender<Block>,
    free_rx: Receiver<Block>,
    capacity: usize,
    block_len: usize,
}

impl BlockPool {
    /// Preallocates `count` blocks of `block_len` samples each.
    pub fn new(count: usize, block_len: usize) -> Result<BlockPool, DeviceError> {
        let (free_tx, free_rx) = crossbeam_channel::bounded(count);
        for _ in 0..count {
            // Cannot fail: the channel was sized for exactly these blocks.
            let _ = free_tx.try_send(Block::allocate(block_len)?);
        }
        Ok(BlockPool {
            free_tx,
            free_rx,
            capacity: count,
            block_len,
        })
    }

    /// A handle sinks use to return blocks.
    pub fn recycler(&self) -> BlockRecycler {
        BlockRecycler {
            free_tx: self.free_tx.clone(),
        }
    }

    /// Takes a free block if one is available.
    pub fn try_acquire(&self) -> Option<Block> {
        self.free_rx.try_recv().ok()
    }

    /// Blocks until a free block is available or the handle is cancelled.
    pub fn acquire(&self, cancel: &CancelHandle) -> Option<Block> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match self.free_rx.recv_timeout(ACQUIRE_TICK) {
                Ok(block) => return Some(block),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Returns a block that was never delivered.
    pub fn release(&self, block: Block) {
        let _ = self.free_tx.try_send(block);
    }

    /// Number of blocks currently free.
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples per block.
    pub fn block_len(&self) -> usize {
        self.block_len
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_pool_preallocates() {
        let pool = BlockPool::new(4, 128).unwrap();
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.capacity(), 4);

        let block = pool.try_acquire().unwrap();
        assert_eq!(block.len(), 128);
        assert!(block.samples().iter().all(|s| *s == 0));
        assert_eq!(pool.available(), 3);

        pool.recycler().recycle(block);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_acquire_waits_for_recycled_block() {
        let pool = BlockPool::new(1, 8).unwrap();
        let block = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());

        let recycler = pool.recycler();
        let returner = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            recycler.recycle(block);
        });

        assert!(pool.acquire(&CancelHandle::new()).is_some());
        returner.join().unwrap();
    }

    #[test]
    fn test_acquire_wakes_on_cancel() {
        let pool = BlockPool::new(1, 8).unwrap();
        let _held = pool.try_acquire().unwrap();

        let cancel = CancelHandle::new();
        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                cancel.cancel();
            })
        };

        let start = Instant::now();
        assert!(pool.acquire(&cancel).is_none());
        assert!(start.elapsed() < Duration::from_secs(2));
        canceller.join().unwrap();
    }

    #[test]
    fn test_block_bytes_are_little_endian() {
        let pool = BlockPool::new(1, 2).unwrap();
        let mut block = pool.try_acquire().unwrap();
        block.samples_mut().copy_from_slice(&[1, -2]);

        let mut bytes = Vec::new();
        block.write_le_bytes(&mut bytes);
        assert_eq!(bytes, vec![0x01, 0x00, 0xFE, 0xFF]);

        block.silence();
        assert_eq!(block.samples(), &[0, 0]);
    }
}
