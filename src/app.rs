//! relax-server application.
//!
//! This module contains a top-level structure [`App`] that represents the whole
//! relax-server application.

use crate::{
    args::Args,
    board::{self, BoardConfig},
    fpga::Fpga,
    port::HardwarePort,
    server::Server,
    sim::SimulatedBoard,
};
use anyhow::Result;

/// relax-server application.
///
/// This struct represents the relax-server application. It owns the console
/// hardware, through the server that gives clients access to it.
#[derive(Debug)]
pub struct App {
    server: Server,
}

impl App {
    /// Creates a new application.
    ///
    /// The hardware is mapped and initialized, and the server socket is bound.
    #[tracing::instrument(name = "App::new", level = "debug")]
    pub async fn new(args: &Args) -> Result<App> {
        tracing::info!(
            "relax-server {} (git {})",
            env!("CARGO_PKG_VERSION"),
            git_version::git_version!(fallback = "unknown")
        );
        let config = BoardConfig {
            rf_duration_us: args.rf_duration,
            rf_amplitude: args.rf_amplitude,
            attenuation_db: args.attenuation,
            frequency_hz: args.frequency,
        };
        let mut port: Box<dyn HardwarePort> = if args.simulate {
            tracing::warn!("serving a simulated board");
            Box::new(SimulatedBoard::new())
        } else {
            Box::new(Fpga::take(&args.devmem).await?)
        };
        board::initialize(port.as_mut(), &config)?;
        let server = Server::bind(args.listen, port, args.wire_order.into()).await?;
        Ok(App { server })
    }

    /// Runs the application.
    ///
    /// This only returns if the server fails.
    #[tracing::instrument(name = "App::run", level = "debug", skip_all)]
    pub async fn run(self) -> Result<()> {
        self.server.run().await
    }
}
