//! Sink workers: one per active slot, shipping assembled DIF records to
//! the downstream consumer.
//!
//! Transport framing is a fixed 8-byte header (`"HDR\0"` + little-endian
//! payload size), the payload, and a 4-byte `"ACK\0"` acknowledgement
//! back from the peer. Anything else on the wire is a fatal sink error:
//! the run aborts rather than ship records the consumer may have missed.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, ErrorKind, Result};
use crate::DIF_PORT_BASE;

/// Frame tag ahead of every payload.
pub const HDR_TAG: [u8; 4] = *b"HDR\0";
/// Expected acknowledgement from the peer.
pub const ACK_TAG: [u8; 4] = *b"ACK\0";

/// Downstream address of the consumer for chamber `dif_id`.
pub fn dif_addr(host: IpAddr, dif_id: u8) -> SocketAddr {
    SocketAddr::new(host, DIF_PORT_BASE + dif_id as u16)
}

/// Destination for the DIF records of one slot.
#[async_trait]
pub trait DifSink: Send + Sync {
    /// Ship one record; returns once the peer acknowledged it.
    async fn send(&mut self, payload: &[u8]) -> Result<()>;
}

/// TCP sink with the `HDR\0`/`ACK\0` handshake.
pub struct TcpSink {
    peer: SocketAddr,
    stream: TcpStream,
}

impl TcpSink {
    pub async fn connect(peer: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(peer).await?;
        stream.set_nodelay(true)?;
        info!("sink connected to {}", peer);
        Ok(Self { peer, stream })
    }
}

/// A closed or misbehaving peer shows up as one of these; everything else
/// is an ordinary socket failure.
fn sink_error(peer: SocketAddr, what: &str, e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::WriteZero
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset => {
            ErrorKind::Protocol(format!("{} {}: {}", peer, what, e)).into()
        }
        _ => e.into(),
    }
}

#[async_trait]
impl DifSink for TcpSink {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let mut hdr = [0u8; 8];
        hdr[..4].copy_from_slice(&HDR_TAG);
        hdr[4..].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        self.stream
            .write_all(&hdr)
            .await
            .map_err(|e| sink_error(self.peer, "header write", e))?;
        if !payload.is_empty() {
            self.stream
                .write_all(payload)
                .await
                .map_err(|e| sink_error(self.peer, "payload write", e))?;
        }
        let mut ack = [0u8; 4];
        self.stream
            .read_exact(&mut ack)
            .await
            .map_err(|e| sink_error(self.peer, "ack read", e))?;
        if ack != ACK_TAG {
            Err(ErrorKind::Protocol(format!(
                "{}: bad acknowledgement {:02x?}",
                self.peer, ack
            )))?
        }
        debug!("{}: shipped {} bytes", self.peer, payload.len());
        Ok(())
    }
}

/// File sink for standalone runs: raw concatenated records, no transport
/// framing.
pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    pub async fn create(dir: &Path, run: u32, dif_id: u8) -> Result<Self> {
        let path = dir.join(format!("eda_{:03}_{:03}.raw", run, dif_id));
        let file = File::create(&path).await?;
        info!("sink writing to {}", path.display());
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DifSink for FileSink {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.file.write_all(payload).await?;
        self.file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;

    /// Accept one connection and serve `n` handshakes, checking the
    /// framing; returns the received payloads.
    async fn ack_peer(listener: TcpListener, n: usize) -> Vec<Vec<u8>> {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut out = Vec::new();
        for _ in 0..n {
            let mut hdr = [0u8; 8];
            sock.read_exact(&mut hdr).await.unwrap();
            assert_eq!(hdr[..4], HDR_TAG);
            let size = u32::from_le_bytes(hdr[4..].try_into().unwrap()) as usize;
            let mut payload = vec![0u8; size];
            sock.read_exact(&mut payload).await.unwrap();
            sock.write_all(&ACK_TAG).await.unwrap();
            out.push(payload);
        }
        out
    }

    #[tokio::test]
    async fn test_send_framing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(ack_peer(listener, 2));

        let mut sink = TcpSink::connect(addr).await.unwrap();
        sink.send(&[1, 2, 3, 4, 5]).await.unwrap();
        sink.send(&[]).await.unwrap();
        drop(sink);

        let payloads = peer.await.unwrap();
        assert_eq!(payloads, vec![vec![1, 2, 3, 4, 5], vec![]]);
    }

    #[tokio::test]
    async fn test_non_ack_reply_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut hdr = [0u8; 8];
            sock.read_exact(&mut hdr).await.unwrap();
            sock.write_all(b"NAK\0").await.unwrap();
        });

        let mut sink = TcpSink::connect(addr).await.unwrap();
        let err = sink.send(&[]).await.unwrap_err();
        match err.kind() {
            ErrorKind::Protocol(msg) => assert!(msg.contains("acknowledgement")),
            kind => panic!("unexpected error {:?}", kind),
        }
    }

    #[tokio::test]
    async fn test_closed_peer_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock);
        });

        let mut sink = TcpSink::connect(addr).await.unwrap();
        let err = sink.send(&[0u8; 16]).await.unwrap_err();
        match err.kind() {
            ErrorKind::Protocol(_) | ErrorKind::Io(_) => {}
            kind => panic!("unexpected error {:?}", kind),
        }
    }

    #[tokio::test]
    async fn test_file_sink_concatenates_records() {
        let dir = std::env::temp_dir().join(format!("edaq-sink-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let mut sink = FileSink::create(&dir, 7, 0x42).await.unwrap();
        sink.send(&[0xB0, 1, 2]).await.unwrap();
        sink.send(&[0xB0, 3]).await.unwrap();
        let path = sink.path().to_path_buf();
        drop(sink);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, vec![0xB0, 1, 2, 0xB0, 3]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_dif_addr() {
        let addr = dif_addr("10.0.0.5".parse().unwrap(), 3);
        assert_eq!(addr.to_string(), "10.0.0.5:10003");
    }
}
