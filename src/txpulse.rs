//! RF transmit pulse table.
//!
//! The transmit memory holds a table of RF pulses as interleaved I/Q samples.
//! The sequencer program selects a pulse by its slot, which starts every
//! [`SLOT_GAP`] samples. The table is designed once at startup from the pulse
//! duration and amplitude given on the command line.

use crate::port::{HardwarePort, TX_SAMPLES};
use anyhow::Result;
use std::f32::consts::PI;

/// Number of transmit memory samples between the start of two pulse slots.
pub const SLOT_GAP: usize = 2000;

/// Value of the transmit size register.
pub const TX_SIZE: u16 = (TX_SAMPLES - 1) as u16;

/// Transmit clock divider, which gives a sample duration of 1 µs.
pub const TX_DIVIDER: u32 = 125;

/// Longest hard pulse duration in µs for which the double-length pulses fit in
/// their slot.
pub const MAX_DURATION_US: u32 = 499;

// Samples spanned by the sinc and sine pulses.
const SHAPED_SPAN: usize = 512;
// Offset of the sinc main lobe from the start of its slot.
const SINC_CENTER: usize = 64 + 256;

/// Transmit sample duration in µs for a transmit clock divider.
pub fn sample_duration_us(divider: u32) -> f32 {
    1.0 / 125.0 * divider as f32
}

/// Pulse slots of the table.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PulseSlot {
    /// Hard 90° pulse along +x.
    Hard90X,
    /// Hard 180° pulse along +x, twice as long as the 90° pulse.
    Hard180X,
    /// Hard 180° pulse along +y.
    Hard180Y,
    /// Hard 180° pulse along -y.
    Hard180MinusY,
    /// Hard 180° pulse along +x, with twice the amplitude of the 90° pulse.
    Hard180XDoubleAmplitude,
    /// Hamming-windowed sinc pulse.
    Sinc,
    /// Sine wave with a period of 256 samples.
    Sine,
}

impl PulseSlot {
    /// All the slots, in table order.
    pub const ALL: [PulseSlot; 7] = [
        PulseSlot::Hard90X,
        PulseSlot::Hard180X,
        PulseSlot::Hard180Y,
        PulseSlot::Hard180MinusY,
        PulseSlot::Hard180XDoubleAmplitude,
        PulseSlot::Sinc,
        PulseSlot::Sine,
    ];

    /// Index of the first sample of the slot in transmit memory.
    pub fn offset(self) -> usize {
        self as usize * SLOT_GAP
    }
}

/// Contents of transmit memory.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PulseTable(Box<[i16; TX_SAMPLES]>);

impl PulseTable {
    /// Designs the pulse table.
    ///
    /// `duration_us` is the duration of the hard 90° pulse and `amplitude` the
    /// amplitude of the hard pulses, in DAC units.
    pub fn design(duration_us: u32, amplitude: i16) -> Result<PulseTable> {
        if !(1..=MAX_DURATION_US).contains(&duration_us) {
            anyhow::bail!(
                "RF pulse duration of {duration_us} us out of range (1 to {MAX_DURATION_US} us)"
            );
        }
        let samples = (duration_us as f32 / sample_duration_us(TX_DIVIDER)) as usize;
        tracing::info!(
            duration_us,
            samples,
            amplitude,
            "designing RF pulse table"
        );
        let mut table = PulseTable(Box::new([0; TX_SAMPLES]));
        let double = amplitude.saturating_mul(2);
        let negated = amplitude.saturating_neg();

        // I samples are even indices, Q samples odd indices
        table.fill(PulseSlot::Hard90X.offset(), 2 * samples, amplitude);
        table.fill(PulseSlot::Hard180X.offset(), 4 * samples, amplitude);
        table.fill(PulseSlot::Hard180Y.offset() + 1, 4 * samples, amplitude);
        table.fill(PulseSlot::Hard180MinusY.offset() + 1, 4 * samples, negated);
        table.fill(
            PulseSlot::Hard180XDoubleAmplitude.offset(),
            2 * samples,
            double,
        );

        let sinc = PulseSlot::Sinc.offset();
        for i in (sinc..=sinc + SHAPED_SPAN).step_by(2) {
            let j = (i as i32 - (sinc + 64) as i32) / 2 - 128;
            table.0[i] = if j == 0 {
                amplitude
            } else {
                let x = PI * j as f32;
                let window = 0.54 + 0.46 * f64::from(x / 96.0).cos();
                (f64::from(48 * i32::from(amplitude)) * window * f64::from(x / 48.0).sin()
                    / f64::from(x))
                .floor() as i16
            };
        }

        let sine = PulseSlot::Sine.offset();
        for i in (sine..=sine + SHAPED_SPAN).step_by(2) {
            let phase = PI * i as f32 / 128.0;
            table.0[i] = (f64::from(amplitude) * f64::from(phase).sin()).floor() as i16;
        }

        Ok(table)
    }

    // Writes `value` on every other sample of [start, start + span].
    fn fill(&mut self, start: usize, span: usize, value: i16) {
        for sample in self.0[start..=start + span].iter_mut().step_by(2) {
            *sample = value;
        }
    }

    /// Returns the samples of the table.
    pub fn samples(&self) -> &[i16; TX_SAMPLES] {
        &self.0
    }

    /// Writes the table to transmit memory and sets the transmit size.
    pub fn write(&self, port: &mut dyn HardwarePort) {
        port.write_tx_samples(&self.0[..]);
        port.set_tx_size(TX_SIZE);
    }
}
