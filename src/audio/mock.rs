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
use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::block::{Block, BlockRecycler};
use super::sink::{DeviceError, DeviceSink, PushOutcome, StreamConfig, WaitStrategy};

/// Number of delivered blocks a mock keeps for inspection.
const DEFAULT_RETAINED_BLOCKS: usize = 256;

/// A scripted reaction to the next pushed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    Accept,
    Busy,
    Underrun,
}

#[derive(Default)]
struct MockState {
    open: bool,
    config: Option<StreamConfig>,
    recycler: Option<BlockRecycler>,
    script: VecDeque<MockOutcome>,
    /// Blocks accepted but not yet reclaimed, for polled mocks.
    queued: VecDeque<Block>,
    delivered: Vec<Vec<i16>>,
    delivered_count: usize,
    recoveries: usize,
    /// Recoveries still to fail before one succeeds.
    failed_recoveries: usize,
    opens: usize,
}

/// A mock device. Records what it is given instead of playing it.
#[derive(Clone)]
pub struct MockSink {
    name: String,
    strategy: WaitStrategy,
    /// Sleep for a block's duration on every accepted block.
    paced: bool,
    /// Never hand blocks back, as a device that stopped consuming would.
    withhold: bool,
    fail_open: bool,
    retained: usize,
    state: Arc<Mutex<MockState>>,
}

impl MockSink {
    /// Gets the given mock device. Accepts blocks as fast as they arrive.
    pub fn new(name: &str) -> MockSink {
        MockSink {
            name: name.to_string(),
            strategy: WaitStrategy::Blocking,
            paced: false,
            withhold: false,
            fail_open: false,
            retained: DEFAULT_RETAINED_BLOCKS,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// A mock that consumes blocks in real time.
    pub fn paced(name: &str) -> MockSink {
        MockSink {
            paced: true,
            ..MockSink::new(name)
        }
    }

    /// A mock that must be polled to return its blocks.
    pub fn polling(name: &str) -> MockSink {
        MockSink {
            strategy: WaitStrategy::Polling,
            ..MockSink::new(name)
        }
    }

    /// A mock that refuses to open.
    pub fn failing(name: &str) -> MockSink {
        MockSink {
            fail_open: true,
            ..MockSink::new(name)
        }
    }

    /// A mock that keeps every block it accepts, starving the pool.
    pub fn withholding(self) -> MockSink {
        MockSink {
            withhold: true,
            ..self
        }
    }

    /// Queues outcomes for the next pushes. Pushes past the script are accepted.
    pub fn script(&self, outcomes: impl IntoIterator<Item = MockOutcome>) {
        self.state.lock().script.extend(outcomes);
    }

    /// Makes the next `count` recoveries fail.
    pub fn fail_recoveries(&self, count: usize) {
        self.state.lock().failed_recoveries = count;
    }

    /// The first retained delivered blocks, in delivery order.
    pub fn delivered(&self) -> Vec<Vec<i16>> {
        self.state.lock().delivered.clone()
    }

    /// Total blocks accepted, retained or not.
    pub fn delivered_count(&self) -> usize {
        self.state.lock().delivered_count
    }

    pub fn recoveries(&self) -> usize {
        self.state.lock().recoveries
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

impl DeviceSink for MockSink {
    fn open(&mut self, config: &StreamConfig, recycler: BlockRecycler) -> Result<(), DeviceError> {
        if self.fail_open {
            return Err(DeviceError::Open {
                device: self.name.clone(),
                reason: "mock device configured to fail".into(),
            });
        }

        let mut state = self.state.lock();
        state.open = true;
        state.opens += 1;
        state.config = Some(*config);
        state.recycler = Some(recycler);
        info!(device = self.name, "Opened mock device");
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        if !state.open {
            return;
        }
        state.open = false;
        state.queued.clear();
        state.recycler = None;
        info!(device = self.name, "Closed mock device");
    }

    fn push_block(&mut self, block: Block) -> PushOutcome {
        let block_duration = {
            let mut state = self.state.lock();
            match state.script.pop_front().unwrap_or(MockOutcome::Accept) {
                MockOutcome::Busy => return PushOutcome::Busy(block),
                MockOutcome::Underrun => return PushOutcome::Underrun(block),
                MockOutcome::Accept => {}
            }

            if state.delivered.len() < self.retained {
                state.delivered.push(block.samples().to_vec());
            }
            state.delivered_count += 1;

            if self.withhold || self.strategy == WaitStrategy::Polling {
                state.queued.push_back(block);
            } else if let Some(recycler) = &state.recycler {
                recycler.recycle(block);
            }
            state.config.map(|c| c.block_duration())
        };

        if self.paced {
            spin_sleep::sleep(block_duration.unwrap_or(Duration::ZERO));
        }
        PushOutcome::Accepted
    }

    fn recover(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.recoveries += 1;
        if state.failed_recoveries > 0 {
            state.failed_recoveries -= 1;
            return Err(DeviceError::Stream("mock device failed to recover".into()));
        }
        debug!(device = self.name, "Recovered mock device");
        Ok(())
    }

    fn strategy(&self) -> WaitStrategy {
        self.strategy
    }

    fn reclaim(&mut self) {
        if self.withhold {
            return;
        }
        let mut state = self.state.lock();
        let MockState {
            queued, recycler, ..
        } = &mut *state;
        if let Some(recycler) = recycler {
            queued.drain(..).for_each(|block| recycler.recycle(block));
        }
    }
}

impl fmt::Display for MockSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}
