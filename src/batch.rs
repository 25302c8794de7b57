use crate::chunk::{parse_chunks, seal_datagram, Chunk};
use crate::clock::Clock;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Abstraction for writing one datagram to the transport, introduced to mock the I/O away for
///  testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramWriter: Send + Sync + 'static {
    async fn write_datagram(&self, buf: &[u8]) -> std::io::Result<usize>;
}

#[async_trait]
impl DatagramWriter for Arc<UdpSocket> {
    async fn write_datagram(&self, buf: &[u8]) -> std::io::Result<usize> {
        self.send(buf).await
    }
}

/// Abstraction for reading one datagram and the address it came from.
#[async_trait]
pub trait DatagramReader: Send + Sync + 'static {
    async fn read_datagram(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl DatagramReader for Arc<UdpSocket> {
    async fn read_datagram(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }
}

/// Reads chunks and writes them to the transport in CRC-sealed batches. A batch goes out when
///  the next chunk would push it to `cutoff_bytes` (with at least one chunk already queued), or
///  `cutoff_ms` after its first chunk arrived, whichever comes first. Zero for either cutoff
///  disables that form of batching, i.e. every chunk is sent on its own. Write errors are
///  logged and the data dropped - retransmission is the reliability protocol's job, not the
///  transport's.
pub async fn batch_and_send(
    mut chunks: mpsc::Receiver<Chunk>,
    conn: Arc<dyn DatagramWriter>,
    clock: Arc<dyn Clock>,
    cutoff_bytes: usize,
    cutoff_ms: Duration,
) {
    let mut buf = BytesMut::new();
    buf.put_u32_le(0); // room for the CRC
    let mut num_chunks = 0usize;
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            chunk = chunks.recv() => {
                let Some(chunk) = chunk else {
                    // send anything still queued before quitting
                    if num_chunks > 0 {
                        flush(conn.as_ref(), &mut buf, &mut num_chunks).await;
                    }
                    return;
                };
                if buf.len() + chunk.serialized_len() >= cutoff_bytes && num_chunks > 0 {
                    flush(conn.as_ref(), &mut buf, &mut num_chunks).await;
                    deadline = None;
                }
                chunk.ser(&mut buf);
                num_chunks += 1;
                if deadline.is_none() {
                    deadline = Some(clock.now() + cutoff_ms);
                }
            }

            _ = sleep_until_opt(clock.as_ref(), deadline), if deadline.is_some() => {
                flush(conn.as_ref(), &mut buf, &mut num_chunks).await;
                deadline = None;
            }
        }
    }
}

async fn flush(conn: &dyn DatagramWriter, buf: &mut BytesMut, num_chunks: &mut usize) {
    seal_datagram(buf.as_mut());
    if let Err(e) = conn.write_datagram(buf.as_ref()).await {
        error!("failed to write {} bytes of batched chunks: {}", buf.len(), e);
    }
    buf.clear();
    buf.put_u32_le(0);
    *num_chunks = 0;
}

async fn sleep_until_opt(clock: &dyn Clock, deadline: Option<Instant>) {
    match deadline {
        Some(at) => clock.sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Reads datagrams from the transport, parses them back into chunks, stamps each with the
///  sender's address and fans them out. A datagram that fails the CRC or parses badly is
///  dropped whole; the connection stays up. A read error closes the output channel and ends
///  the task.
pub async fn receive_and_split(
    conn: Arc<dyn DatagramReader>,
    chunks: mpsc::Sender<Chunk>,
    max_chunk_size: usize,
) {
    let mut buf = vec![0u8; max_chunk_size];
    loop {
        let (n, addr) = match conn.read_datagram(&mut buf).await {
            Ok(read) => read,
            Err(e) => {
                // dropping `chunks` is what closes the channel
                debug!("transport read failed, shutting down the splitter: {}", e);
                return;
            }
        };
        let parsed = match parse_chunks(&buf[..n]) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("dropping {}-byte datagram from {}: {:#}", n, addr, e);
                continue;
            }
        };
        for mut chunk in parsed {
            chunk.sender_addr = Some(addr);
            if chunks.send(chunk).await.is_err() {
                return;
            }
        }
    }
}
