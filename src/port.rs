//! Hardware register access.
//!
//! This module defines [`HardwarePort`], the capability through which the
//! console logic reaches the FPGA registers and memories. The real
//! implementation is [`Fpga`](crate::fpga::Fpga), which works on memory-mapped
//! registers. [`SimulatedBoard`](crate::sim::SimulatedBoard) implements it in
//! RAM.
//!
//! All the writes are effect-on-write with no acknowledgment, so none of the
//! methods can fail. A missing or unusable register mapping is detected when
//! the port is created.

use crate::gradient::GradientWaveform;
use relax_protocol::GradientAxis;

/// Number of 16-bit samples in transmit memory.
pub const TX_SAMPLES: usize = 32768;

/// Number of words in sequencer program memory.
pub const PROGRAM_MEMORY_WORDS: usize = 16384;

/// Run state of the hardware microsequencer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SequencerState {
    /// The sequencer is stopped.
    Halt,
    /// The sequencer runs the program stored in program memory.
    Run,
}

impl SequencerState {
    /// Returns the value of the sequencer control register for this state.
    pub fn register_value(self) -> u32 {
        match self {
            SequencerState::Halt => 0x0,
            SequencerState::Run => 0x7,
        }
    }
}

/// Access to the console register banks.
pub trait HardwarePort {
    /// Writes the transmit attenuation register, in units of 0.25 dB.
    fn set_attenuation(&mut self, value: u32);

    /// Writes the receive NCO tuning word.
    fn set_rx_frequency(&mut self, tuning_word: u32);

    /// Writes the receive rate (decimation) register.
    fn set_rx_rate(&mut self, rate: u32);

    /// Writes the transmit clock divider register.
    fn set_tx_divider(&mut self, divider: u32);

    /// Writes the transmit size register.
    fn set_tx_size(&mut self, size: u16);

    /// Copies samples into transmit memory, starting at the first sample.
    ///
    /// Samples that do not fit in transmit memory are ignored.
    fn write_tx_samples(&mut self, samples: &[i16]);

    /// Reads the number of samples waiting in the receive FIFO.
    fn rx_counter(&mut self) -> u16;

    /// Pops one sample from the receive FIFO.
    fn read_rx_fifo(&mut self) -> u64;

    /// Writes a full waveform into the gradient memory of an axis.
    fn write_gradient(&mut self, axis: GradientAxis, waveform: &GradientWaveform);

    /// Writes the sequencer control register.
    fn set_sequencer(&mut self, state: SequencerState);

    /// Copies words into sequencer program memory, starting at index 0.
    ///
    /// Words that do not fit in program memory are ignored.
    fn write_program(&mut self, words: &[u32]);
}
