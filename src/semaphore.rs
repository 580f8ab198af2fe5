// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of ddsnap.

// ddsnap is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// ddsnap is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with ddsnap.  If not, see <http://www.gnu.org/licenses/>.

//! Counting semaphore used to throttle the worker loop and to serialize
//! egress on the server socket.

use parking_lot::{Condvar, Mutex};

/// A counting semaphore.
///
/// `up` never blocks; `down` blocks until a permit is available. Spurious
/// condvar wakeups are absorbed by re-checking the count.
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Creates a semaphore holding `count` permits.
    pub fn new(count: usize) -> Self {
        Semaphore {
            count: Mutex::new(count),
            available: Condvar::new(),
        }
    }

    /// Releases one permit and wakes one waiter.
    pub fn up(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.available.notify_one();
    }

    /// Acquires one permit, blocking until one is available.
    pub fn down(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// Acquires one permit without blocking. Returns false if none is
    /// available.
    #[cfg(test)]
    pub fn try_down(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::Semaphore;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn counts_permits() {
        let sem = Semaphore::new(2);
        assert!(sem.try_down());
        assert!(sem.try_down());
        assert!(!sem.try_down());
        sem.up();
        assert!(sem.try_down());
    }

    #[test]
    fn wakes_blocked_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.down())
        };
        thread::sleep(Duration::from_millis(50));
        sem.up();
        waiter.join().expect("waiter exits after up");
    }

    #[test]
    fn one_up_wakes_one_of_many() {
        let sem = Arc::new(Semaphore::new(0));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let sem = sem.clone();
                thread::spawn(move || sem.down())
            })
            .collect();
        for _ in 0..4 {
            sem.up();
        }
        for waiter in waiters {
            waiter.join().expect("every waiter got a permit");
        }
        assert!(!sem.try_down());
    }
}
