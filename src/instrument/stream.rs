//! Line-oriented SCPI link over an async byte stream.
//!
//! Works with anything that implements `AsyncRead + AsyncWrite`: a raw TCP
//! socket to a GPIB-Ethernet bridge, a serial GPIB adapter (`serial`
//! feature), or a `tokio::io::duplex` pipe in tests.

use super::{InstrumentLink, LinkError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Async byte stream usable as an instrument port.
pub trait LinkIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LinkIo for T {}

/// Type-erased boxed port.
pub type DynPort = Box<dyn LinkIo>;

/// Port plus whether a timed-out response may still arrive.
struct Port {
    io: BufReader<DynPort>,
    reply_pending: bool,
}

/// SCPI link: one command per line, one response line per query.
///
/// A query that times out leaves the link expecting a late reply; the next
/// query discards one line first so responses stay paired with their queries.
pub struct StreamLink {
    port: Mutex<Port>,
    resource: String,
    terminator: String,
    timeout: Duration,
}

impl StreamLink {
    pub fn new(port: DynPort, resource: impl Into<String>) -> Self {
        Self {
            port: Mutex::new(Port {
                io: BufReader::new(port),
                reply_pending: false,
            }),
            resource: resource.into(),
            terminator: "\n".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connect to a raw SCPI socket (`host:port`).
    pub async fn connect_tcp(
        address: &str,
        resource: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LinkError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| LinkError::Timeout(format!("connect {address}")))??;
        stream.set_nodelay(true)?;
        debug!(address, "Connected instrument socket");
        Ok(Self::new(Box::new(stream), resource).with_timeout(timeout))
    }

    /// Open a serial GPIB adapter.
    #[cfg(feature = "serial")]
    pub async fn open_serial(
        path: &str,
        baud_rate: u32,
        resource: impl Into<String>,
    ) -> Result<Self, LinkError> {
        use tokio_serial::SerialPortBuilderExt;

        let path_owned = path.to_string();
        let port = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&path_owned, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(std::io::Error::from)
        })
        .await
        .map_err(|e| LinkError::Io(std::io::Error::other(e)))??;
        debug!(path, baud_rate, "Opened instrument serial port");
        Ok(Self::new(Box::new(port), resource))
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    async fn send_line(port: &mut Port, line: &str) -> Result<(), LinkError> {
        let writer = port.io.get_mut();
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Swallow the tail of a response whose query already timed out.
    async fn discard_late_reply(&self, port: &mut Port) {
        let mut late = String::new();
        let read = tokio::time::timeout(self.timeout, port.io.read_line(&mut late)).await;
        match read {
            Ok(Ok(n)) if n > 0 => debug!(discarded = late.trim_end(), "Discarded late response"),
            _ => debug!("No late response arrived"),
        }
        port.reply_pending = false;
    }
}

#[async_trait]
impl InstrumentLink for StreamLink {
    async fn write(&self, command: &str) -> Result<(), LinkError> {
        let mut port = self.port.lock().await;
        trace!(command, "write");
        Self::send_line(&mut port, &format!("{command}{}", self.terminator)).await
    }

    async fn query(&self, command: &str) -> Result<String, LinkError> {
        let mut port = self.port.lock().await;
        if port.reply_pending {
            self.discard_late_reply(&mut port).await;
        }
        trace!(command, "query");
        Self::send_line(&mut port, &format!("{command}{}", self.terminator)).await?;

        let mut response = String::new();
        let read = tokio::time::timeout(self.timeout, port.io.read_line(&mut response)).await;
        match read {
            Ok(Ok(0)) => Err(LinkError::NotConnected),
            Ok(Ok(_)) => {
                let trimmed = response.trim_end_matches(['\r', '\n']).to_string();
                trace!(command, bytes = trimmed.len(), "response");
                Ok(trimmed)
            }
            Ok(Err(e)) => Err(LinkError::Io(e)),
            Err(_) => {
                port.reply_pending = true;
                Err(LinkError::Timeout(command.to_string()))
            }
        }
    }

    async fn list_resources(&self) -> Vec<String> {
        vec![self.resource.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn write_appends_terminator() -> Result<(), LinkError> {
        let (mut host, device) = tokio::io::duplex(64);
        let link = StreamLink::new(Box::new(device), "GPIB0::12::INSTR");

        link.write("TRAC:CLE").await?;

        let mut buf = vec![0u8; 16];
        let n = host.read(&mut buf).await?;
        assert_eq!(&buf[..n], b"TRAC:CLE\n");
        Ok(())
    }

    #[tokio::test]
    async fn query_returns_line_without_terminator() -> Result<(), LinkError> {
        let (mut host, device) = tokio::io::duplex(64);
        let link = StreamLink::new(Box::new(device), "GPIB0::12::INSTR");

        host.write_all(b"42\r\n").await?;
        let response = link.query("TRAC:POIN:ACT?").await?;
        assert_eq!(response, "42");

        let mut buf = vec![0u8; 32];
        let n = host.read(&mut buf).await?;
        assert_eq!(&buf[..n], b"TRAC:POIN:ACT?\n");
        Ok(())
    }

    #[tokio::test]
    async fn query_times_out_without_response() {
        let (_host, device) = tokio::io::duplex(64);
        let link = StreamLink::new(Box::new(device), "GPIB0::12::INSTR")
            .with_timeout(Duration::from_millis(20));

        let err = link.query("*IDN?").await.unwrap_err();
        assert!(matches!(err, LinkError::Timeout(cmd) if cmd == "*IDN?"));
    }

    #[tokio::test]
    async fn late_reply_after_timeout_is_discarded() -> Result<(), LinkError> {
        let (mut host, device) = tokio::io::duplex(64);
        let link = StreamLink::new(Box::new(device), "GPIB0::12::INSTR")
            .with_timeout(Duration::from_millis(20));

        host.write_all(b"KEITH").await?;
        assert!(matches!(
            link.query("*IDN?").await,
            Err(LinkError::Timeout(_))
        ));

        host.write_all(b"LEY,6221\n42\n").await?;
        assert_eq!(link.query("TRAC:POIN:ACT?").await?, "42");
        Ok(())
    }

    #[tokio::test]
    async fn closed_peer_is_not_connected() {
        let (host, device) = tokio::io::duplex(64);
        let link = StreamLink::new(Box::new(device), "GPIB0::12::INSTR");
        drop(host);

        assert!(link.query("*IDN?").await.is_err());
    }

    #[tokio::test]
    async fn lists_configured_resource() {
        let (_host, device) = tokio::io::duplex(8);
        let link = StreamLink::new(Box::new(device), "GPIB0::12::INSTR").with_terminator("\r\n");
        assert_eq!(link.resource(), "GPIB0::12::INSTR");
        assert_eq!(link.list_resources().await, vec!["GPIB0::12::INSTR".to_string()]);
    }
}
