//! In-memory transport for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Transport, TransportError};

#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    port: String,
    written: Mutex<Vec<Vec<u8>>>,
    incoming: Mutex<VecDeque<Vec<u8>>>,
    resets: Mutex<Vec<bool>>,
    bauds: Mutex<Vec<u32>>,
    fail_writes: AtomicBool,
}

impl MockTransport {
    pub(crate) fn new(port: &str) -> Self {
        Self {
            port: port.to_string(),
            ..Default::default()
        }
    }

    /// Queues bytes for a later read; each call is delivered by one read.
    pub(crate) fn push_incoming(&self, bytes: &[u8]) {
        self.incoming.lock().push_back(bytes.to_vec());
    }

    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    pub(crate) fn resets(&self) -> Vec<bool> {
        self.resets.lock().clone()
    }

    pub(crate) fn bauds(&self) -> Vec<u32> {
        self.bauds.lock().clone()
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    fn port_id(&self) -> &str {
        &self.port
    }

    fn write(&self, bytes: &[u8]) -> Result<usize, TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        self.written.lock().push(bytes.to_vec());
        Ok(bytes.len())
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let next = self.incoming.lock().pop_front();
        match next {
            Some(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            None => {
                thread::sleep(timeout.min(Duration::from_millis(2)));
                Ok(0)
            }
        }
    }

    fn set_reset(&self, asserted: bool) -> Result<(), TransportError> {
        self.resets.lock().push(asserted);
        Ok(())
    }

    fn purge(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_baud_rate(&self, baud: u32) -> Result<(), TransportError> {
        self.bauds.lock().push(baud);
        Ok(())
    }
}
