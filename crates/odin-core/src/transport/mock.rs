//! Mock USB transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{TransportError, UsbTransport};
use crate::protocol::frame::Reply;

/// Writes above this size are logged by length and prefix only, so a
/// multi-hundred-megabyte flash test does not hold every block it sent.
const FULL_LOG_LIMIT: usize = 2048;
const PREFIX_LEN: usize = 64;

/// One captured bulk-out transfer. A zero-length entry is a ZLP.
#[derive(Debug, Clone)]
pub struct LoggedWrite {
    pub len: usize,
    pub data: Vec<u8>,
}

impl LoggedWrite {
    /// `(cmd, sub)` header if this looks like a command frame.
    pub fn header(&self) -> Option<(u32, u32)> {
        if self.data.len() < 8 {
            return None;
        }
        Some((
            u32::from_le_bytes(self.data[0..4].try_into().unwrap()),
            u32::from_le_bytes(self.data[4..8].try_into().unwrap()),
        ))
    }

    /// u32 at `offset` of the captured prefix.
    pub fn u32_at(&self, offset: usize) -> Option<u32> {
        self.data
            .get(offset..offset + 4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }
}

/// Mock transport for unit testing session and pipeline logic.
pub struct MockTransport {
    /// Queued raw responses returned on read, in order. `None` scripts
    /// a timeout.
    reply_queue: Arc<Mutex<VecDeque<Option<Vec<u8>>>>>,
    /// Captured writes (ZLPs included as zero-length entries).
    write_log: Arc<Mutex<Vec<LoggedWrite>>>,
    vid: u16,
    pid: u16,
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            reply_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            vid: 0x04E8,
            pid: 0x685D,
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue raw bytes to be returned on the next read.
    pub fn queue_response(&self, bytes: &[u8]) {
        self.reply_queue
            .lock()
            .unwrap()
            .push_back(Some(bytes.to_vec()));
    }

    /// Script a timeout for the next read.
    pub fn queue_timeout(&self) {
        self.reply_queue.lock().unwrap().push_back(None);
    }

    /// Queue an 8-byte `(cmd_echo, data)` reply frame.
    pub fn queue_reply(&self, cmd_echo: u32, data: u32) {
        self.queue_response(&Reply { cmd_echo, data }.to_bytes());
    }

    /// Queue `n` identical reply frames.
    pub fn queue_replies(&self, cmd_echo: u32, data: u32, n: usize) {
        for _ in 0..n {
            self.queue_reply(cmd_echo, data);
        }
    }

    /// Get all captured writes.
    pub fn writes(&self) -> Vec<LoggedWrite> {
        self.write_log.lock().unwrap().clone()
    }

    /// Captured command frames matching `(cmd, sub)`.
    pub fn frames(&self, cmd: u32, sub: u32) -> Vec<LoggedWrite> {
        self.writes()
            .into_iter()
            .filter(|w| w.header() == Some((cmd, sub)))
            .collect()
    }

    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Number of queued responses not yet consumed.
    pub fn pending_replies(&self) -> usize {
        self.reply_queue.lock().unwrap().len()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    pub fn set_ids(&mut self, vid: u16, pid: u16) {
        self.vid = vid;
        self.pid = pid;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        let logged = if data.len() <= FULL_LOG_LIMIT {
            data.to_vec()
        } else {
            data[..PREFIX_LEN].to_vec()
        };
        self.write_log.lock().unwrap().push(LoggedWrite {
            len: data.len(),
            data: logged,
        });
        Ok(data.len())
    }

    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        match self.reply_queue.lock().unwrap().pop_front() {
            Some(Some(mut resp)) => {
                resp.truncate(max_len);
                Ok(resp)
            }
            // scripted timeout or exhausted queue
            _ => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn write_zlp(&self) -> Result<(), TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.write_log.lock().unwrap().push(LoggedWrite {
            len: 0,
            data: Vec::new(),
        });
        Ok(())
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;

    #[test]
    fn test_mock_reply_queue() {
        let mock = MockTransport::new();
        mock.queue_reply(CMD_SESSION, 0);
        mock.queue_reply(CMD_XMIT, 1);

        let r1 = Reply::parse(&mock.read(8, COMMAND_TIMEOUT).unwrap()).unwrap();
        assert_eq!(r1.cmd_echo, CMD_SESSION);

        let r2 = Reply::parse(&mock.read(8, COMMAND_TIMEOUT).unwrap()).unwrap();
        assert_eq!(r2.cmd_echo, CMD_XMIT);
        assert_eq!(r2.data, 1);

        // Queue is empty now
        assert!(matches!(
            mock.read(8, COMMAND_TIMEOUT),
            Err(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        mock.write(b"Hello").unwrap();
        mock.write_zlp().unwrap();
        mock.write(&vec![0xAB; 128 * 1024]).unwrap();

        let writes = mock.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0].data, b"Hello");
        assert_eq!(writes[1].len, 0);
        assert_eq!(writes[2].len, 128 * 1024);
        assert_eq!(writes[2].data.len(), PREFIX_LEN);
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        mock.disconnect();
        assert!(mock.write(b"test").is_err());
        assert!(mock.write_zlp().is_err());
    }
}
