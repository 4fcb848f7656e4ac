//! Link layer: raw text in, raw text out.
//!
//! A [`Transport`] moves single lines to and from the instrument. A [`Session`] owns
//! one transport exclusively together with the address and timeout it was opened
//! with, applies the timeout to every send and receive, and releases the link when
//! closed or dropped. There are no retries at this layer.
//!
//! A query that timed out still gets its answer eventually. The session counts such
//! abandoned replies and discards that many lines before the next receive returns,
//! so later queries stay paired with their own answers.

use crate::error::{DaqError, DaqResult, TransportFault};
use crate::hardware::address::ResourceAddress;
use crate::hardware::tcp::TcpTransport;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Raw line-oriented link to an instrument.
#[async_trait]
pub trait Transport: Send {
    /// Send one command; the implementation appends the line terminator.
    async fn send(&mut self, text: &str) -> Result<(), TransportFault>;

    /// Receive one response line, terminator included if the link delivers one.
    async fn receive(&mut self) -> Result<String, TransportFault>;

    /// Release the link.
    async fn close(&mut self) -> Result<(), TransportFault>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Opens transports for parsed addresses.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link to `resource`, giving up after `timeout`.
    async fn open(
        &self,
        resource: &ResourceAddress,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportFault>;
}

/// Connector for real instruments.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConnector;

#[async_trait]
impl Connector for SystemConnector {
    async fn open(
        &self,
        resource: &ResourceAddress,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportFault> {
        match resource {
            ResourceAddress::Tcp { host, port } => {
                let transport = TcpTransport::connect(host, *port, timeout).await?;
                Ok(Box::new(transport))
            }
        }
    }
}

/// One open, exclusively owned connection to an instrument.
pub struct Session {
    address: String,
    timeout: Duration,
    link: Option<Box<dyn Transport>>,
    /// Replies still due for receives that timed out.
    owed: usize,
}

impl Session {
    /// Parse `address` and open it through `connector`.
    ///
    /// Every failure is reported as [`DaqError::Connection`].
    pub async fn open(connector: &dyn Connector, address: &str, timeout: Duration) -> DaqResult<Self> {
        let connection_error = |reason: String| DaqError::Connection {
            address: address.to_string(),
            reason,
        };

        let resource = ResourceAddress::parse(address).map_err(|e| connection_error(e.to_string()))?;

        let link = match tokio::time::timeout(timeout, connector.open(&resource, timeout)).await {
            Ok(Ok(link)) => link,
            Ok(Err(fault)) => return Err(connection_error(fault.to_string())),
            Err(_) => return Err(connection_error(TransportFault::Timeout(timeout).to_string())),
        };

        debug!(address, link = %link.describe(), "Session opened");
        Ok(Self::with_transport(address, timeout, link))
    }

    /// Wrap an already-open transport.
    pub fn with_transport(address: impl Into<String>, timeout: Duration, link: Box<dyn Transport>) -> Self {
        Self {
            address: address.into(),
            timeout,
            link: Some(link),
            owed: 0,
        }
    }

    /// Timeout applied to each send and receive.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `false` once closed.
    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Number of late replies the next receive will discard first.
    pub fn owed_replies(&self) -> usize {
        self.owed
    }

    /// Send one command line.
    pub async fn send(&mut self, text: &str) -> Result<(), TransportFault> {
        let timeout = self.timeout;
        let link = self.link.as_mut().ok_or(TransportFault::SessionClosed)?;
        trace!(text, "-> instrument");
        tokio::time::timeout(timeout, link.send(text))
            .await
            .map_err(|_| TransportFault::Timeout(timeout))?
    }

    /// Receive the reply to the last query sent.
    ///
    /// Late replies to earlier, timed-out queries are read and dropped first. On a
    /// timeout the awaited reply joins them.
    pub async fn receive(&mut self) -> Result<String, TransportFault> {
        let timeout = self.timeout;
        let link = self.link.as_mut().ok_or(TransportFault::SessionClosed)?;
        loop {
            let line = match tokio::time::timeout(timeout, link.receive()).await {
                Ok(result) => result?,
                Err(_) => {
                    self.owed += 1;
                    return Err(TransportFault::Timeout(timeout));
                }
            };
            if self.owed > 0 {
                self.owed -= 1;
                debug!(line = line.trim_end(), "Discarding late reply to an abandoned query");
                continue;
            }
            trace!(line = line.trim_end(), "<- instrument");
            return Ok(line);
        }
    }

    /// Send then receive one line.
    pub async fn exchange(&mut self, text: &str) -> Result<String, TransportFault> {
        self.send(text).await?;
        self.receive().await
    }

    /// Release the link. Idempotent; a failing shutdown is logged and the link is
    /// dropped anyway.
    pub async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(fault) = link.close().await {
                warn!(address = %self.address, %fault, "Link did not shut down cleanly");
            }
            debug!(address = %self.address, "Session closed");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.link.is_some() {
            debug!(address = %self.address, "Session dropped while open; releasing link");
        }
    }
}
