//! Timeout-bounded, retrying link over a transport

use std::time::Duration;

use bytes::BytesMut;
use spoolrfid_core::constants::{DEFAULT_READ_TIMEOUT, DEFAULT_RETRIES};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{Transport, error::*};

/// Slack given to a transport past its own receive deadline
///
/// The transport is expected to give up at the timeout it is handed; this
/// bound only catches one that hangs.
pub const RECEIVE_GRACE: Duration = Duration::from_millis(250);

/// Link timing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// Bound on every send and every receive attempt
    pub timeout: Duration,

    /// Receive attempts before a timeout surfaces (at least one is made)
    pub retries: u32,
}

impl LinkConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    fn attempts(&self) -> u32 {
        self.retries.max(1)
    }

    /// Longest a receive can take before failing with `LinkTimeout`
    ///
    /// Holds for transports that give up at the timeout they are handed. A
    /// transport that hangs is cut off [`RECEIVE_GRACE`] later per attempt.
    pub fn max_receive_time(&self) -> Duration {
        self.timeout * self.attempts()
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_READ_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }
}

/// A transport with bounded waits
///
/// Receives that time out are retried without backoff; a disconnect or a
/// short read surfaces immediately. Sends are never retried.
pub struct Link<T: Transport> {
    transport: T,
    config: LinkConfig,
}

impl<T: Transport> Link<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, LinkConfig::default())
    }

    pub fn with_config(transport: T, config: LinkConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> LinkConfig {
        self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    pub fn descriptor(&self) -> String {
        self.transport.descriptor()
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Open the transport unless it already is
    pub async fn open(&mut self) -> Result<()> {
        if self.transport.is_open() {
            return Ok(());
        }
        self.transport.open().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        timeout(self.config.timeout, self.transport.send(data))
            .await
            .map_err(|_| Error::timeout(self.config.timeout))?
    }

    /// Receive exactly `expected_len` bytes
    ///
    /// Takes at most [`LinkConfig::max_receive_time`].
    pub async fn receive(&mut self, expected_len: usize) -> Result<BytesMut> {
        let attempts = self.config.attempts();

        for attempt in 1..=attempts {
            let result = timeout(
                self.config.timeout + RECEIVE_GRACE,
                self.transport.receive(expected_len, self.config.timeout),
            )
            .await
            .unwrap_or_else(|_| Err(Error::timeout(self.config.timeout)));

            match result {
                Err(e) if e.is_retryable() => {
                    debug!(
                        attempt,
                        attempts,
                        device = %self.transport.descriptor(),
                        "Receive timed out"
                    );
                }
                other => return other,
            }
        }

        warn!(
            attempts,
            device = %self.transport.descriptor(),
            "Reader did not respond"
        );
        Err(Error::timeout(self.config.max_receive_time()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockTransport;
    use async_trait::async_trait;
    use mockall::{Sequence, mock};
    use pretty_assertions::assert_eq;

    mock! {
        Port {}

        #[async_trait]
        impl Transport for Port {
            async fn open(&mut self) -> Result<()>;
            async fn close(&mut self) -> Result<()>;
            fn is_open(&self) -> bool;
            async fn send(&mut self, data: &[u8]) -> Result<()>;
            async fn receive(&mut self, expected_len: usize, timeout: Duration) -> Result<BytesMut>;
            fn descriptor(&self) -> String;
        }
    }

    /// Answers after a fixed delay, ignoring the deadline it is handed
    struct SlowPort {
        delay: Duration,
    }

    #[async_trait]
    impl Transport for SlowPort {
        async fn open(&mut self) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }

        async fn send(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn receive(&mut self, expected_len: usize, _timeout: Duration) -> Result<BytesMut> {
            tokio::time::sleep(self.delay).await;
            Ok(BytesMut::zeroed(expected_len))
        }

        fn descriptor(&self) -> String {
            "slow".into()
        }
    }

    fn port() -> MockPort {
        let mut port = MockPort::new();
        port.expect_descriptor().returning(|| "mock".into());
        port
    }

    #[test]
    fn test_config_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(1));
        assert_eq!(config.retries, 3);
        assert_eq!(config.max_receive_time(), Duration::from_secs(3));
        assert_eq!(config.with_retries(0).max_receive_time(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_receive_retries_timeouts() {
        let mut port = port();
        let mut seq = Sequence::new();
        port.expect_receive()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, t| Err(Error::timeout(t)));
        port.expect_receive()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|n, _| Ok(BytesMut::zeroed(n)));

        let mut link = Link::new(port);
        let buf = link.receive(4).await.unwrap();
        assert_eq!(buf.len(), 4);
    }

    #[tokio::test]
    async fn test_receive_gives_up_after_retries() {
        let mut port = port();
        port.expect_receive()
            .times(3)
            .returning(|_, t| Err(Error::timeout(t)));

        let mut link = Link::new(port);
        assert!(matches!(
            link.receive(4).await,
            Err(Error::LinkTimeout { timeout_ms: 3000 })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_not_retried() {
        let mut port = port();
        port.expect_receive()
            .times(1)
            .returning(|_, _| Err(Error::LinkDisconnected));

        let mut link = Link::new(port);
        assert!(matches!(link.receive(4).await, Err(Error::LinkDisconnected)));
    }

    #[tokio::test]
    async fn test_short_read_not_retried() {
        let mut port = port();
        port.expect_receive()
            .times(1)
            .returning(|n, _| Err(Error::ShortRead { expected: n, actual: 1 }));

        let mut link = Link::new(port);
        assert!(matches!(
            link.receive(5).await,
            Err(Error::ShortRead { expected: 5, actual: 1 })
        ));
    }

    #[tokio::test]
    async fn test_open_skips_open_transport() {
        let mut port = port();
        port.expect_is_open().returning(|| true);
        port.expect_open().never();

        let mut link = Link::new(port);
        link.open().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_reader_bounded_by_retries() {
        let mut mock = MockTransport::new();
        mock.open().await.unwrap();

        let config = LinkConfig::default()
            .with_timeout(Duration::from_millis(200))
            .with_retries(4);
        let mut link = Link::with_config(mock, config);

        let start = tokio::time::Instant::now();
        let result = link.receive(5).await;

        assert!(matches!(result, Err(Error::LinkTimeout { .. })));
        assert_eq!(start.elapsed(), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_not_cut_at_transport_deadline() {
        // Bytes the transport is still handing over at its deadline are
        // delivered, not dropped with a cancelled read
        let config = LinkConfig::default()
            .with_timeout(Duration::from_millis(100))
            .with_retries(1);
        let mut link = Link::with_config(
            SlowPort {
                delay: Duration::from_millis(120),
            },
            config,
        );

        let buf = link.receive(4).await.unwrap();
        assert_eq!(buf.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_transport_bounded() {
        let config = LinkConfig::default()
            .with_timeout(Duration::from_millis(100))
            .with_retries(2);
        let mut link = Link::with_config(
            SlowPort {
                delay: Duration::from_secs(60),
            },
            config,
        );

        let start = tokio::time::Instant::now();
        assert!(matches!(link.receive(4).await, Err(Error::LinkTimeout { .. })));
        assert_eq!(start.elapsed(), (Duration::from_millis(100) + RECEIVE_GRACE) * 2);
    }
}
