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
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A cancel handle is shared between the control thread and the streaming thread.
/// It's the streaming thread's responsibility to check it between blocks and while
/// waiting on the device.
#[derive(Clone, Default)]
pub struct CancelHandle {
    /// Set once the operation should stop. Readable without taking the lock.
    cancelled: Arc<AtomicBool>,
    /// Guards the condvar so notifications are not lost between check and wait.
    lock: Arc<Mutex<()>>,
    /// The condvar will handle notification of cancelling.
    condvar: Arc<Condvar>,
}

impl CancelHandle {
    /// Creates a new cancel handle.
    pub fn new() -> CancelHandle {
        CancelHandle::default()
    }

    /// Returns true if the operation has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Waits until cancelled or until the timeout passes. Returns true if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.lock.lock();
        if !self.is_cancelled() {
            // A spurious or timed-out wakeup is fine: the caller re-checks its own
            // condition after this returns.
            let _ = self.condvar.wait_for(&mut guard, timeout);
        }
        self.is_cancelled()
    }

    /// Wakes every waiter without cancelling, so they re-check their conditions.
    pub fn notify(&self) {
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }

    /// Cancel the operation.
    pub fn cancel(&self) {
        let _guard = self.lock.lock();
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.condvar.notify_all();
        }
    }
}
