use parking_lot::{Condvar, Mutex};
use tracing::warn;

/// Counting admission gate for background replicate/restore work.
pub struct Ticket {
    name: &'static str,
    capacity: u32,
    outstanding: Mutex<u32>,
    freed: Condvar,
}

impl Ticket {
    pub fn new(name: &'static str, capacity: u32) -> Self {
        Self {
            name,
            capacity,
            outstanding: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn outstanding(&self) -> u32 {
        *self.outstanding.lock()
    }

    /// Reserve `n` units. A non-blocking take fails immediately when the pool
    /// is short; a blocking take waits for a `release`. A request larger than
    /// the whole pool can never be satisfied and always fails.
    pub fn take(&self, n: u32, block: bool) -> bool {
        if n > self.capacity {
            warn!("{}: take({}) exceeds capacity {}", self.name, n, self.capacity);
            return false;
        }
        let mut outstanding = self.outstanding.lock();
        while *outstanding + n > self.capacity {
            if !block {
                return false;
            }
            self.freed.wait(&mut outstanding);
        }
        *outstanding += n;
        true
    }

    pub fn release(&self, n: u32) {
        let mut outstanding = self.outstanding.lock();
        if n > *outstanding {
            warn!("{}: release({}) with only {} outstanding", self.name, n, *outstanding);
            *outstanding = 0;
        } else {
            *outstanding -= n;
        }
        drop(outstanding);
        // Waiters may need different amounts, so let each re-check.
        self.freed.notify_all();
    }

    /// Take `n` units and hand back a guard that releases them on drop.
    pub fn acquire(&self, n: u32, block: bool) -> Option<TicketGuard<'_>> {
        self.take(n, block).then_some(TicketGuard { ticket: self, n })
    }
}

pub struct TicketGuard<'a> {
    ticket: &'a Ticket,
    n: u32,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        self.ticket.release(self.n);
    }
}
