//! A free-list of session buffers. Each dialog borrows one buffer for its
//! whole life and returns it on the way out; buffers are only ever owned
//! by one session at a time.

use std::sync::Mutex;

pub(crate) struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        BufferPool {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> Vec<u8> {
        let buffer = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();

        buffer.unwrap_or_else(|| vec![0u8; self.size])
    }

    pub fn put(&self, buffer: Vec<u8>) {
        self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(buffer);
    }
}
