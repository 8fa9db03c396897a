//! relax-server CLI arguments.
//!
//! This module contains the definition of the CLI arguments for the
//! relax-server application.

use crate::board::DEFAULT_FREQUENCY_HZ;
use crate::txpulse::MAX_DURATION_US;
use clap::{Parser, ValueEnum};
use relax_protocol::WireOrder;
use std::net::SocketAddr;
use std::path::PathBuf;

/// relax-server CLI arguments.
#[derive(Parser, Debug, Clone, PartialEq)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Duration of the hard 90 degree RF pulse in us
    #[clap(value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_DURATION_US)))]
    pub rf_duration: u32,
    /// Amplitude of the hard RF pulses in DAC units
    #[clap(allow_negative_numbers = true)]
    pub rf_amplitude: i16,
    /// Transmit attenuation in dB (0 to 31.75)
    pub attenuation: f32,
    /// Listen address for the console server
    #[clap(long, default_value = "0.0.0.0:1001")]
    pub listen: SocketAddr,
    /// Receive frequency at startup in Hz
    #[clap(long, default_value_t = DEFAULT_FREQUENCY_HZ)]
    pub frequency: u32,
    /// Byte order of command words and uploaded programs
    #[clap(long, value_enum, default_value_t = ByteOrder::Big)]
    pub wire_order: ByteOrder,
    /// Physical memory device used to map the FPGA registers
    #[clap(long, default_value = "/dev/mem")]
    pub devmem: PathBuf,
    /// Serve a simulated board instead of the FPGA
    #[clap(long)]
    pub simulate: bool,
}

/// Byte order CLI values.
#[derive(ValueEnum, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ByteOrder {
    /// Big-endian (network order)
    Big,
    /// Little-endian, as sent by the legacy GUI client
    Little,
}

impl From<ByteOrder> for WireOrder {
    fn from(order: ByteOrder) -> WireOrder {
        match order {
            ByteOrder::Big => WireOrder::BigEndian,
            ByteOrder::Little => WireOrder::LittleEndian,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["relax-server", "50", "8000", "10"]).unwrap();
        assert_eq!(args.rf_duration, 50);
        assert_eq!(args.rf_amplitude, 8000);
        assert_eq!(args.attenuation, 10.0);
        assert_eq!(args.listen.port(), relax_protocol::DEFAULT_PORT);
        assert!(args.listen.ip().is_unspecified());
        assert_eq!(args.frequency, DEFAULT_FREQUENCY_HZ);
        assert_eq!(WireOrder::from(args.wire_order), WireOrder::BigEndian);
        assert_eq!(args.devmem, PathBuf::from("/dev/mem"));
        assert!(!args.simulate);
    }

    #[test]
    fn options() {
        let args = Args::try_parse_from([
            "relax-server",
            "--wire-order",
            "little",
            "--simulate",
            "--listen",
            "127.0.0.1:5000",
            "20",
            "-1000",
            "0.25",
        ])
        .unwrap();
        assert_eq!(WireOrder::from(args.wire_order), WireOrder::LittleEndian);
        assert!(args.simulate);
        assert_eq!(args.rf_amplitude, -1000);
        assert_eq!(args.listen.port(), 5000);
    }

    #[test]
    fn pulse_duration_range() {
        assert!(Args::try_parse_from(["relax-server", "0", "8000", "10"]).is_err());
        assert!(Args::try_parse_from(["relax-server", "500", "8000", "10"]).is_err());
    }
}
