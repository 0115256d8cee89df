//! Scripted transport for tests
//!
//! Bytes queued with [`MockTransport::queue`] are handed out by `receive` in
//! order, regardless of how they were chunked. An empty queue behaves like a
//! silent reader: `receive` waits out the timeout.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;

use crate::{Transport, error::*};

/// Mock transport, cheap to clone; clones share the same script
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    open: bool,
    rx: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    disconnected: bool,
    unavailable: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Queue bytes to be returned by `receive`
    pub fn queue(&self, bytes: &[u8]) {
        self.state.lock().rx.extend(bytes);
    }

    /// Bytes queued but not yet received
    pub fn pending(&self) -> usize {
        self.state.lock().rx.len()
    }

    /// All captured sends
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Simulate the device being unplugged
    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }

    pub fn reconnect(&self) {
        self.state.lock().disconnected = false;
    }

    /// Make `open` fail as if the device were absent
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Take exactly `expected_len` bytes off `rx`
///
/// `None` when nothing is queued. A partial queue is drained and reported as
/// a short read.
pub(crate) fn take_exact(rx: &mut VecDeque<u8>, expected_len: usize) -> Option<Result<BytesMut>> {
    if rx.is_empty() {
        return None;
    }
    if rx.len() < expected_len {
        let actual = rx.len();
        rx.clear();
        return Some(Err(Error::ShortRead {
            expected: expected_len,
            actual,
        }));
    }
    Some(Ok(rx.drain(..expected_len).collect()))
}

/// Complete a receive, waiting out the timeout when the bytes never arrive
pub(crate) async fn deliver(outcome: Option<Result<BytesMut>>, timeout: Duration) -> Result<BytesMut> {
    match outcome {
        Some(Ok(buf)) => Ok(buf),
        Some(Err(e)) => {
            tokio::time::sleep(timeout).await;
            Err(e)
        }
        None => {
            tokio::time::sleep(timeout).await;
            Err(Error::timeout(timeout))
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(Error::DeviceUnavailable("mock device absent".into()));
        }
        if state.open {
            return Err(Error::AlreadyOpen);
        }
        state.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Error::NotOpen);
        }
        if state.disconnected {
            return Err(Error::LinkDisconnected);
        }
        state.writes.push(data.to_vec());
        Ok(())
    }

    async fn receive(&mut self, expected_len: usize, timeout: Duration) -> Result<BytesMut> {
        let outcome = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(Error::NotOpen);
            }
            if state.disconnected {
                return Err(Error::LinkDisconnected);
            }
            take_exact(&mut state.rx, expected_len)
        };
        deliver(outcome, timeout).await
    }

    fn descriptor(&self) -> String {
        "mock".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn opened() -> MockTransport {
        let mut mock = MockTransport::new();
        mock.open().await.unwrap();
        mock
    }

    #[tokio::test]
    async fn test_mock_ignores_chunking() {
        let mut mock = opened().await;
        mock.queue(&[1, 2]);
        mock.queue(&[3, 4, 5]);

        let first = mock.receive(3, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&first[..], &[1, 2, 3]);
        assert_eq!(mock.pending(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_short_read() {
        let mut mock = opened().await;
        mock.queue(&[1, 2]);

        let result = mock.receive(4, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(Error::ShortRead { expected: 4, actual: 2 })));
        assert_eq!(mock.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_silence_times_out() {
        let mut mock = opened().await;
        let start = tokio::time::Instant::now();

        let result = mock.receive(4, Duration::from_millis(250)).await;
        assert!(matches!(result, Err(Error::LinkTimeout { timeout_ms: 250 })));
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_mock_write_capture() {
        let mut mock = opened().await;
        mock.send(b"Hello").await.unwrap();
        mock.send(b"World").await.unwrap();

        let writes = mock.writes();
        assert_eq!(writes, vec![b"Hello".to_vec(), b"World".to_vec()]);
    }

    #[tokio::test]
    async fn test_mock_disconnect() {
        let mut mock = opened().await;
        let handle = mock.clone();
        handle.disconnect();

        assert!(matches!(mock.send(b"test").await, Err(Error::LinkDisconnected)));
        assert!(matches!(
            mock.receive(1, Duration::from_millis(10)).await,
            Err(Error::LinkDisconnected)
        ));
    }

    #[tokio::test]
    async fn test_mock_unavailable() {
        let mut mock = MockTransport::new();
        mock.set_unavailable(true);
        assert!(matches!(mock.open().await, Err(Error::DeviceUnavailable(_))));
    }
}
