use parking_lot::Mutex;

/// Recycles write buffers between file handles.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_idle: usize,
    /// Buffers larger than this are dropped instead of pooled.
    max_retained: usize,
}

impl BufferPool {
    pub fn new(max_idle: usize, max_retained: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_idle,
            max_retained,
        }
    }

    /// An empty buffer, reused when one is available.
    pub fn acquire(&self) -> Vec<u8> {
        self.free.lock().pop().unwrap_or_default()
    }

    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.max_retained {
            return;
        }
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64, 16 * 1024 * 1024)
    }
}
