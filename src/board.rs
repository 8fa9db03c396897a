//! Board initialization.
//!
//! Before the server accepts clients, the console is put in a known state:
//! transmit attenuation, erased and halted sequencer, receive NCO and rate,
//! and the RF pulse table in transmit memory.

use crate::port::{HardwarePort, SequencerState};
use crate::txpulse::{PulseTable, TX_DIVIDER};
use anyhow::Result;
use relax_protocol::MAX_FREQUENCY_HZ;

/// Default receive frequency in Hz.
pub const DEFAULT_FREQUENCY_HZ: u32 = 11_298_000;

/// Receive rate (decimation) register value.
pub const RX_RATE: u32 = 250;

/// Largest transmit attenuation in dB.
pub const MAX_ATTENUATION_DB: f32 = 31.75;

/// Number of sequencer program words zeroed at startup.
const ERASED_PROGRAM_WORDS: usize = 32;

/// ADC sample clock in Hz, which clocks the receive NCO.
const ADC_CLOCK_HZ: f64 = 125.0e6;

/// Startup configuration of the board.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BoardConfig {
    /// Duration of the hard 90° RF pulse in µs.
    pub rf_duration_us: u32,
    /// Amplitude of the hard RF pulses in DAC units.
    pub rf_amplitude: i16,
    /// Transmit attenuation in dB.
    pub attenuation_db: f32,
    /// Receive frequency in Hz.
    pub frequency_hz: u32,
}

/// Computes the receive NCO tuning word for a frequency in Hz.
///
/// The NCO has 30 bits of phase and is clocked at 125 MHz.
pub fn frequency_word(hz: u32) -> u32 {
    (f64::from(hz) / ADC_CLOCK_HZ * f64::from(1u32 << 30) + 0.5).floor() as u32
}

/// Converts an attenuation in dB to the attenuation register value.
pub fn attenuation_register(db: f32) -> Result<u32> {
    if !(0.0..=MAX_ATTENUATION_DB).contains(&db) {
        anyhow::bail!(
            "transmit attenuation of {db} dB out of range (0 to {MAX_ATTENUATION_DB} dB)"
        );
    }
    Ok((f64::from(db) / 0.25) as u32)
}

/// Initializes the board.
///
/// The configuration is validated before any register is written.
#[tracing::instrument(level = "debug", skip(port))]
pub fn initialize(port: &mut dyn HardwarePort, config: &BoardConfig) -> Result<()> {
    let attenuation = attenuation_register(config.attenuation_db)?;
    if config.frequency_hz > MAX_FREQUENCY_HZ {
        anyhow::bail!(
            "frequency of {} Hz out of range (0 to {MAX_FREQUENCY_HZ} Hz)",
            config.frequency_hz
        );
    }
    let pulses = PulseTable::design(config.rf_duration_us, config.rf_amplitude)?;

    port.set_attenuation(attenuation);
    tracing::info!(
        "attenuation set to {} dB (register value {attenuation})",
        config.attenuation_db
    );

    port.write_program(&[0; ERASED_PROGRAM_WORDS]);
    port.set_sequencer(SequencerState::Halt);
    tracing::info!("sequencer memory erased and sequencer halted");

    port.set_rx_frequency(frequency_word(config.frequency_hz));
    port.set_rx_rate(RX_RATE);
    tracing::info!(
        "receive frequency set to {:.4} MHz",
        f64::from(config.frequency_hz) / 1e6
    );

    port.set_tx_divider(TX_DIVIDER);
    pulses.write(port);
    tracing::info!("RF pulse table loaded");
    Ok(())
}
