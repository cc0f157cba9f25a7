//! Raw TCP adapter.
//!
//! Used for SCP/ASCII streams over the indicator's USB-Ethernet or Wi-Fi
//! link.  Connection establishment is bounded by the configured timeout.

use std::time::Duration;

use async_trait::async_trait;
use scalelink_types::{
    ConnectionConfig, DEFAULT_ADI_HOST, DEFAULT_ADI_PORT, TransportEndpoint, TransportError,
    TransportKind,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::transport::{Endpoint, Inbound, InboundSender, Transport, inbound_channel};

const READ_BUFFER: usize = 2048;

pub struct TcpTransport {
    connect_timeout: Duration,
    writer: Option<OwnedWriteHalf>,
    reader: Option<JoinHandle<()>>,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            writer: None,
            reader: None,
        }
    }
}

async fn read_loop(mut half: tokio::net::tcp::OwnedReadHalf, tx: InboundSender) {
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        match half.read(&mut buffer).await {
            Ok(0) => {
                debug!("tcp peer closed the connection");
                break;
            }
            Ok(n) => {
                if tx.send(Ok(buffer[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(TransportError::from_io(&e))).await;
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    /// Hosts cannot be discovered on a raw socket, so this is the list of
    /// addresses indicators ship with.
    async fn list_available(&self) -> Result<Vec<Endpoint>, TransportError> {
        let usb = format!("{DEFAULT_ADI_HOST}:{DEFAULT_ADI_PORT}");
        Ok(vec![Endpoint::new(
            TransportKind::Tcp,
            usb.clone(),
            format!("{usb} (USB-Ethernet default)"),
        )])
    }

    async fn open(&mut self, config: &ConnectionConfig) -> Result<Inbound, TransportError> {
        self.close().await?;

        let TransportEndpoint::Tcp { host, port } = &config.endpoint else {
            return Err(TransportError::Unavailable(format!(
                "tcp adapter cannot open {}",
                config.endpoint
            )));
        };

        info!(host = %host, port, "connecting tcp");
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((host.as_str(), *port)),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::from_io(&e))?;
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = inbound_channel();
        self.reader = Some(tokio::spawn(read_loop(read_half, tx)));
        self.writer = Some(write_half);
        info!(host = %host, port, "tcp connected");
        Ok(rx)
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| TransportError::Unavailable("tcp socket not open".to_string()))?;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::from_io(&e))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
            info!("tcp connection closed");
        }
        Ok(())
    }
}
