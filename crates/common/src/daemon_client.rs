// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - Daemon Client Module
// Sends one control-protocol line to the daemon and returns its answer

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::network::loopback;
use crate::protocol::DaemonCommand;

const DAEMON_RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);

/// Client for the daemon control protocol
#[derive(Debug, Clone)]
pub struct DaemonClient {
    addr: SocketAddr,
}

impl DaemonClient {
    /// Client for a daemon on the loopback interface
    pub fn new(port: u16) -> Self {
        Self {
            addr: SocketAddr::new(loopback(), port),
        }
    }

    pub fn with_addr(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Send a command and read the response until the daemon closes the connection
    ///
    /// Starting a tunnel waits for registration and the gateway connect
    /// (including retries), so the read timeout is generous.
    pub async fn send(&self, command: &DaemonCommand) -> Result<String> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .with_context(|| format!("Failed to connect to daemon at {}. Is it running?", self.addr))?;

        let line = command.to_line();
        debug!("Sending daemon command: {}", line.trim_end());
        stream
            .write_all(line.as_bytes())
            .await
            .context("Failed to send command to daemon")?;

        let mut response = String::new();
        tokio::time::timeout(DAEMON_RESPONSE_TIMEOUT, stream.read_to_string(&mut response))
            .await
            .context("Timed out waiting for daemon response")?
            .context("Failed to read daemon response")?;

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_send_reads_until_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let mut stream = reader.into_inner();
            stream.write_all(b"There are no running tunnels\n").await.unwrap();
            line
        });

        let client = DaemonClient::with_addr(addr);
        let response = client.send(&DaemonCommand::Ps).await.unwrap();
        assert_eq!(response, "There are no running tunnels\n");
        assert_eq!(server.await.unwrap(), "PS\n");
    }

    #[tokio::test]
    async fn test_send_fails_without_daemon() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = DaemonClient::with_addr(addr);
        assert!(client.send(&DaemonCommand::Ps).await.is_err());
    }
}
