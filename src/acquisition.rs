//! Acquisition streaming.
//!
//! This module drains the receive FIFO and relays the samples to the client.
//! A burst is formed by [`CHUNKS_PER_BURST`] chunks of [`SAMPLES_PER_CHUNK`]
//! samples. Before reading each chunk, the receive counter is polled until the
//! FIFO holds at least [`FIFO_THRESHOLD`] samples.

use crate::port::HardwarePort;
use anyhow::Result;
use relax_protocol::{CHUNKS_PER_BURST, CHUNK_BYTES, SAMPLES_PER_CHUNK};
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::TcpStream;

/// Minimum number of samples in the receive FIFO before a chunk is read.
pub const FIFO_THRESHOLD: u16 = 10_000;

/// Interval at which the receive counter is polled.
pub const POLL_INTERVAL: Duration = Duration::from_micros(500);

/// Destination of acquisition chunks.
///
/// The `more` flag tells that another chunk of the same burst follows, which
/// lets the transport coalesce segments. It never changes the byte stream.
#[allow(async_fn_in_trait)]
pub trait ChunkSink {
    /// Sends a whole chunk.
    async fn send_chunk(&mut self, chunk: &[u8], more: bool) -> Result<()>;
}

impl ChunkSink for TcpStream {
    async fn send_chunk(&mut self, chunk: &[u8], more: bool) -> Result<()> {
        let flags = if more {
            libc::MSG_NOSIGNAL | libc::MSG_MORE
        } else {
            libc::MSG_NOSIGNAL
        };
        let fd = self.as_raw_fd();
        let mut sent = 0;
        while sent < chunk.len() {
            self.writable().await?;
            let remaining = &chunk[sent..];
            match self.try_io(Interest::WRITABLE, || {
                let ret = unsafe {
                    libc::send(
                        fd,
                        remaining.as_ptr() as *const libc::c_void,
                        remaining.len(),
                        flags,
                    )
                };
                if ret < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }) {
                Ok(0) => anyhow::bail!("socket closed while sending chunk"),
                Ok(n) => sent += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl ChunkSink for Vec<u8> {
    async fn send_chunk(&mut self, chunk: &[u8], _more: bool) -> Result<()> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}

/// Waits until the receive FIFO holds at least [`FIFO_THRESHOLD`] samples.
///
/// Returns the last value read from the receive counter.
pub async fn wait_fifo_ready(port: &mut dyn HardwarePort) -> u16 {
    loop {
        let count = port.rx_counter();
        if count >= FIFO_THRESHOLD {
            return count;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Streams one acquisition burst from the receive FIFO to `sink`.
///
/// Once started, the burst runs to completion unless the sink fails. Samples
/// are sent in the byte order of the console CPU, which is little-endian.
pub async fn stream_burst<S: ChunkSink>(
    port: &mut dyn HardwarePort,
    sink: &mut S,
) -> Result<()> {
    let mut chunk = Vec::with_capacity(CHUNK_BYTES);
    for num_chunk in 0..CHUNKS_PER_BURST {
        let count = wait_fifo_ready(port).await;
        tracing::trace!(num_chunk, count, "reading chunk");
        chunk.clear();
        for _ in 0..SAMPLES_PER_CHUNK {
            chunk.extend_from_slice(&port.read_rx_fifo().to_le_bytes());
        }
        sink.send_chunk(&chunk, num_chunk + 1 < CHUNKS_PER_BURST)
            .await?;
    }
    Ok(())
}
