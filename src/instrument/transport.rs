//! Byte transports for SCPI-style instruments.
//!
//! Drivers talk to hardware through the [`Transport`] trait so they can be
//! exercised against [`MockTransport`] without a device on the network.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::retry::{retry_async, RetryPolicy};

/// Raw SCPI socket port used by LXI instruments.
pub const SCPI_SOCKET_PORT: u16 = 5025;

/// Line-oriented command channel to an instrument.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a command verbatim (the caller supplies any terminator).
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Send a command and read one line of response.
    async fn query(&mut self, command: &str) -> Result<String>;
}

/// Convert a VISA socket resource into a `host:port` pair.
///
/// Accepts `TCPIP0::<host>::<port>::SOCKET`, `TCPIP0::<host>` (the SCPI
/// socket port is implied) and plain `host:port`.
pub fn parse_socket_address(resource: &str) -> Result<String> {
    let parts: Vec<&str> = resource.split("::").collect();
    match parts.as_slice() {
        [iface, host] if iface.starts_with("TCPIP") => Ok(format!("{}:{}", host, SCPI_SOCKET_PORT)),
        [iface, host, port, kind]
            if iface.starts_with("TCPIP") && kind.eq_ignore_ascii_case("SOCKET") =>
        {
            let port: u16 = port
                .parse()
                .with_context(|| format!("Invalid port in resource '{}'", resource))?;
            Ok(format!("{}:{}", host, port))
        }
        [plain] if plain.contains(':') => Ok(plain.to_string()),
        _ => Err(anyhow!("Unsupported socket resource '{}'", resource)),
    }
}

/// TCP socket transport (raw SCPI over port 5025).
pub struct TcpTransport {
    address: String,
    stream: BufReader<TcpStream>,
    timeout: Duration,
}

impl TcpTransport {
    /// Connect to `resource`, retrying according to `policy`.
    pub async fn connect(resource: &str, io_timeout: Duration, policy: &RetryPolicy) -> Result<Self> {
        let address = parse_socket_address(resource)?;
        tracing::info!(%address, "connecting to instrument socket");

        let stream = retry_async(policy, || {
            let address = address.clone();
            async move {
                let stream = timeout(io_timeout, TcpStream::connect(&address))
                    .await
                    .with_context(|| format!("Timed out connecting to {}", address))?
                    .with_context(|| format!("Failed to connect to {}", address))?;
                Ok::<_, anyhow::Error>(stream)
            }
        })
        .await?;

        Ok(Self {
            address,
            stream: BufReader::new(stream),
            timeout: io_timeout,
        })
    }

    /// Resolved `host:port`.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write(&mut self, command: &str) -> Result<()> {
        timeout(self.timeout, self.stream.get_mut().write_all(command.as_bytes()))
            .await
            .with_context(|| format!("Write to {} timed out", self.address))?
            .with_context(|| format!("Write to {} failed", self.address))?;
        tracing::debug!(address = %self.address, command = command.trim_end(), "sent");
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;
        let mut line = String::new();
        let n = timeout(self.timeout, self.stream.read_line(&mut line))
            .await
            .with_context(|| format!("Read from {} timed out", self.address))??;
        if n == 0 {
            return Err(anyhow!("Connection to {} closed", self.address));
        }
        Ok(line.trim_end().to_string())
    }
}

/// In-memory transport that records commands and replays canned responses.
#[derive(Clone, Default)]
pub struct MockTransport {
    sent: Arc<Mutex<Vec<String>>>,
    responses: Arc<Mutex<VecDeque<String>>>,
}

impl MockTransport {
    /// Transport with nothing sent and no responses queued.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next `query`.
    pub async fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().await.push_back(response.into());
    }

    /// Every command written so far.
    pub async fn sent(&self) -> Vec<String> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, command: &str) -> Result<()> {
        self.sent.lock().await.push(command.to_string());
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;
        self.responses
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| anyhow!("No mock response queued for '{}'", command.trim_end()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_socket_address() {
        assert_eq!(
            parse_socket_address("TCPIP0::192.168.0.100").unwrap(),
            "192.168.0.100:5025"
        );
        assert_eq!(
            parse_socket_address("TCPIP0::192.168.0.100::5025::SOCKET").unwrap(),
            "192.168.0.100:5025"
        );
        assert_eq!(parse_socket_address("localhost:7000").unwrap(), "localhost:7000");
        assert!(parse_socket_address("GPIB0::1::INSTR").is_err());
        assert!(parse_socket_address("TCPIP0::host::port::SOCKET").is_err());
    }

    #[tokio::test]
    async fn test_mock_transport_records_and_replies() {
        let mock = MockTransport::new();
        let mut transport = mock.clone();
        mock.push_response("QuTech,Duplexer,0,1").await;

        transport.write("ch:in1:out1:sw ON \n").await.unwrap();
        let idn = transport.query("*IDN?\n").await.unwrap();

        assert_eq!(idn, "QuTech,Duplexer,0,1");
        assert_eq!(mock.sent().await, vec!["ch:in1:out1:sw ON \n", "*IDN?\n"]);
        assert!(transport.query("*IDN?\n").await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_transport_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "*IDN?\n");
            reader.get_mut().write_all(b"DUPLEXER\n").await.unwrap();
        });

        let mut transport = TcpTransport::connect(
            &addr.to_string(),
            Duration::from_secs(2),
            &RetryPolicy::no_retry(),
        )
        .await
        .unwrap();
        assert_eq!(transport.query("*IDN?\n").await.unwrap(), "DUPLEXER");
        server.await.unwrap();
    }
}
