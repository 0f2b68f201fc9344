use std::io::{self, Read, Write};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_serial::{ClearBuffer, SerialPort};

use super::{INIT_BAUD, Transport, TransportError};
use crate::tracing::prelude::*;

/// USB serial adapter. The chain reset line is wired to RTS.
pub struct SerialTransport {
    path: String,
    reader: Mutex<Box<dyn SerialPort>>,
    writer: Mutex<Box<dyn SerialPort>>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SerialTransport {
    pub fn open(path: &str) -> Result<Self, TransportError> {
        let port = tokio_serial::new(path, INIT_BAUD)
            .timeout(Duration::from_millis(20))
            .open()?;
        let writer = port.try_clone()?;
        debug!(port = path, baud = INIT_BAUD, "Opened serial port");
        Ok(Self {
            path: path.to_string(),
            reader: Mutex::new(port),
            writer: Mutex::new(writer),
        })
    }
}

impl Transport for SerialTransport {
    fn port_id(&self) -> &str {
        &self.path
    }

    fn write(&self, bytes: &[u8]) -> Result<usize, TransportError> {
        let mut port = self.writer.lock();
        let sent = port.write(bytes)?;
        port.flush()?;
        Ok(sent)
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut port = self.reader.lock();
        port.set_timeout(timeout)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(TransportError::Disconnected),
            Err(e) => Err(e.into()),
        }
    }

    fn set_reset(&self, asserted: bool) -> Result<(), TransportError> {
        self.writer.lock().write_request_to_send(asserted)?;
        Ok(())
    }

    fn purge(&self) -> Result<(), TransportError> {
        self.writer.lock().clear(ClearBuffer::All)?;
        Ok(())
    }

    fn set_baud_rate(&self, baud: u32) -> Result<(), TransportError> {
        self.writer.lock().set_baud_rate(baud)?;
        self.reader.lock().set_baud_rate(baud)?;
        Ok(())
    }
}
