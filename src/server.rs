//! Console TCP server.
//!
//! The server listens on a single TCP socket and serves one client at a time.
//! The next client is accepted once the current one disconnects or its
//! connection fails. The listening socket stays bound for the whole life of
//! the server.

use crate::port::HardwarePort;
use crate::session::Session;
use anyhow::{Context, Result};
use relax_protocol::WireOrder;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::Instrument;

/// Console TCP server.
pub struct Server {
    listener: TcpListener,
    port: Box<dyn HardwarePort>,
    order: WireOrder,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listener", &self.listener)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a server listening on `address`.
    ///
    /// Command words and uploaded programs are decoded with the byte order
    /// `order`.
    #[tracing::instrument(name = "Server::bind", level = "debug", skip(port))]
    pub async fn bind(
        address: SocketAddr,
        port: Box<dyn HardwarePort>,
        order: WireOrder,
    ) -> Result<Server> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("failed to bind {address}"))?;
        Ok(Server {
            listener,
            port,
            order,
        })
    }

    /// Returns the address the server listens on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts one client and serves it until it disconnects.
    ///
    /// Errors of the client connection are logged and do not make this
    /// function fail. An error is only returned if a client cannot be
    /// accepted.
    pub async fn serve_one(&mut self) -> Result<()> {
        tracing::info!(address = %self.local_addr()?, "listening");
        let (mut stream, peer) = self
            .listener
            .accept()
            .await
            .context("failed to accept client")?;
        let span = tracing::info_span!("client", %peer);
        let mut session = Session::new(&mut *self.port, self.order);
        async {
            tracing::info!("accepted client");
            match session.run(&mut stream).await {
                Ok(()) => tracing::info!("client disconnected"),
                Err(error) => tracing::error!("connection lost: {error:#}"),
            }
        }
        .instrument(span)
        .await;
        Ok(())
    }

    /// Runs the server.
    ///
    /// This function only returns if there is an error.
    #[tracing::instrument(name = "Server::run", level = "debug", skip_all)]
    pub async fn run(mut self) -> Result<()> {
        loop {
            self.serve_one().await?;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimulatedBoard;
    use relax_protocol::{Command, BURST_BYTES};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn server() -> Server {
        Server::bind(
            "127.0.0.1:0".parse().unwrap(),
            Box::new(SimulatedBoard::new()),
            WireOrder::BigEndian,
        )
        .await
        .unwrap()
    }

    async fn acquire(address: SocketAddr) -> Vec<u8> {
        let mut client = TcpStream::connect(address).await.unwrap();
        client
            .write_all(&Command::Acquire.encode().to_be_bytes())
            .await
            .unwrap();
        let mut data = vec![0; BURST_BYTES];
        client.read_exact(&mut data).await.unwrap();
        data
    }

    fn first_sample(data: &[u8]) -> u64 {
        u64::from_le_bytes(data[..8].try_into().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_clients() {
        let mut server = server().await;
        let address = server.local_addr().unwrap();
        let (first, served) = tokio::join!(acquire(address), server.serve_one());
        served.unwrap();
        assert_eq!(first.len(), BURST_BYTES);
        assert_eq!(first_sample(&first), 0);

        // the board keeps its state between clients
        let (second, served) = tokio::join!(acquire(address), server.serve_one());
        served.unwrap();
        assert_eq!(first_sample(&second), (BURST_BYTES / 8) as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn client_failure_is_not_fatal() {
        let mut server = server().await;
        let address = server.local_addr().unwrap();
        let upload_then_close = async {
            let mut client = TcpStream::connect(address).await.unwrap();
            client
                .write_all(&Command::UploadSequence.encode().to_be_bytes())
                .await
                .unwrap();
        };
        let ((), served) = tokio::join!(upload_then_close, server.serve_one());
        served.unwrap();

        let (data, served) = tokio::join!(acquire(address), server.serve_one());
        served.unwrap();
        assert_eq!(data.len(), BURST_BYTES);
    }
}
