//! relax-server is the real-time control server of a low-field MRI console
//! built on a Zynq board. It maps the console FPGA registers, and serves a
//! single TCP client at a time, which sends compact command words to set the
//! receive frequency and transmit attenuation, upload sequencer programs, set
//! gradient offsets and run acquisitions. Acquired samples are streamed back to
//! the client as raw bytes.

#![warn(missing_docs)]

pub mod acquisition;
pub mod app;
pub mod args;
pub mod board;
pub mod devmem;
pub mod fpga;
pub mod gradient;
pub mod port;
pub mod sequencer;
pub mod server;
pub mod session;
pub mod sim;
pub mod txpulse;
