//! Raw SCPI socket link (LAN instruments, port 5025 by default).
//!
//! Commands are terminated with LF and responses are read up to LF, the same framing
//! the serial drivers use over RS-232.
//!
//! The partial line lives in the transport, not in the receive future: a receive
//! dropped by a timeout leaves the bytes it already read for the next one.

use crate::error::TransportFault;
use crate::hardware::transport::Transport;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Line terminator appended to every command.
pub const LINE_TERMINATOR: &str = "\n";

/// TCP link to a raw SCPI socket.
pub struct TcpTransport {
    stream: BufReader<TcpStream>,
    peer: String,
    line: Vec<u8>,
}

impl TcpTransport {
    /// Connect to `host:port`, giving up after `timeout`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, TransportFault> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportFault::Timeout(timeout))??;
        // Short command/response exchanges; do not let Nagle hold them back.
        stream.set_nodelay(true)?;
        debug!(host, port, "TCP link established");

        Ok(Self {
            stream: BufReader::new(stream),
            peer: format!("{host}:{port}"),
            line: Vec::new(),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, text: &str) -> Result<(), TransportFault> {
        let line = format!("{text}{LINE_TERMINATOR}");
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, TransportFault> {
        let n = self.stream.read_until(b'\n', &mut self.line).await?;
        if n == 0 {
            self.line.clear();
            return Err(TransportFault::Closed);
        }
        String::from_utf8(std::mem::take(&mut self.line)).map_err(|_| TransportFault::Encoding)
    }

    async fn close(&mut self) -> Result<(), TransportFault> {
        self.stream.get_mut().shutdown().await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("TcpTransport({})", self.peer)
    }
}
