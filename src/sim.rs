//! Simulated console board.
//!
//! [`SimulatedBoard`] keeps every register and memory of the console in RAM.
//! While the sequencer runs, each read of the receive counter makes more
//! samples available in the receive FIFO, so acquisitions complete without
//! hardware. A board created with [`SimulatedBoard::recording`] also records
//! the writes it receives, for use as a test double. The board created with
//! [`SimulatedBoard::new`] records nothing and serves as a stand-in board for
//! client development.

use crate::gradient::{GradientWaveform, GradientWaveforms};
use crate::port::{HardwarePort, SequencerState, PROGRAM_MEMORY_WORDS, TX_SAMPLES};
use relax_protocol::GradientAxis;

/// Samples that enter the simulated FIFO on each read of the receive counter
/// while the sequencer runs.
const FILL_PER_POLL: u16 = 2500;

/// Register write recorded by [`SimulatedBoard`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Event {
    /// Attenuation register write.
    Attenuation(u32),
    /// Receive NCO write.
    RxFrequency(u32),
    /// Receive rate write.
    RxRate(u32),
    /// Transmit divider write.
    TxDivider(u32),
    /// Transmit size write.
    TxSize(u16),
    /// Transmit memory write with the number of samples.
    TxSamples(usize),
    /// Gradient memory write.
    Gradient(GradientAxis),
    /// Sequencer control write.
    Sequencer(SequencerState),
    /// Program memory write with the number of words.
    Program(usize),
}

/// In-memory console board.
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    attenuation: u32,
    rx_frequency: u32,
    rx_rate: u32,
    tx_divider: u32,
    tx_size: u16,
    tx_samples: Vec<i16>,
    gradients: GradientWaveforms,
    program: Vec<u32>,
    sequencer: SequencerState,
    fifo_fill: u16,
    next_sample: u64,
    recording: bool,
    events: Vec<Event>,
    snapshots: Vec<GradientWaveforms>,
}

impl Default for SimulatedBoard {
    fn default() -> SimulatedBoard {
        SimulatedBoard::new()
    }
}

impl SimulatedBoard {
    /// Creates a board with all registers and memories zeroed and the
    /// sequencer halted.
    ///
    /// The board does not record events or snapshots.
    pub fn new() -> SimulatedBoard {
        SimulatedBoard {
            attenuation: 0,
            rx_frequency: 0,
            rx_rate: 0,
            tx_divider: 0,
            tx_size: 0,
            tx_samples: vec![0; TX_SAMPLES],
            gradients: GradientWaveforms::cleared(),
            program: vec![0; PROGRAM_MEMORY_WORDS],
            sequencer: SequencerState::Halt,
            fifo_fill: 0,
            next_sample: 0,
            recording: false,
            events: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    /// Creates a board like [`SimulatedBoard::new`] that records the register
    /// writes it receives and the gradient memories each time the sequencer
    /// is started.
    pub fn recording() -> SimulatedBoard {
        SimulatedBoard {
            recording: true,
            ..SimulatedBoard::new()
        }
    }

    fn record(&mut self, event: Event) {
        if self.recording {
            self.events.push(event);
        }
    }

    /// Returns the attenuation register.
    pub fn attenuation(&self) -> u32 {
        self.attenuation
    }

    /// Returns the receive NCO register.
    pub fn rx_frequency(&self) -> u32 {
        self.rx_frequency
    }

    /// Returns the receive rate register.
    pub fn rx_rate(&self) -> u32 {
        self.rx_rate
    }

    /// Returns the transmit divider register.
    pub fn tx_divider(&self) -> u32 {
        self.tx_divider
    }

    /// Returns the transmit size register.
    pub fn tx_size(&self) -> u16 {
        self.tx_size
    }

    /// Returns the contents of transmit memory.
    pub fn tx_samples(&self) -> &[i16] {
        &self.tx_samples
    }

    /// Returns the contents of the gradient memories.
    pub fn gradients(&self) -> &GradientWaveforms {
        &self.gradients
    }

    /// Returns the contents of sequencer program memory.
    pub fn program(&self) -> &[u32] {
        &self.program
    }

    /// Returns the sequencer state.
    pub fn sequencer(&self) -> SequencerState {
        self.sequencer
    }

    /// Returns the register writes received so far, in order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Returns the gradient memories as they were each time the sequencer was
    /// started.
    pub fn snapshots(&self) -> &[GradientWaveforms] {
        &self.snapshots
    }

    /// Forgets the recorded events and snapshots.
    pub fn clear_events(&mut self) {
        self.events.clear();
        self.snapshots.clear();
    }
}

impl HardwarePort for SimulatedBoard {
    fn set_attenuation(&mut self, value: u32) {
        self.attenuation = value;
        self.record(Event::Attenuation(value));
    }

    fn set_rx_frequency(&mut self, tuning_word: u32) {
        self.rx_frequency = tuning_word;
        self.record(Event::RxFrequency(tuning_word));
    }

    fn set_rx_rate(&mut self, rate: u32) {
        self.rx_rate = rate;
        self.record(Event::RxRate(rate));
    }

    fn set_tx_divider(&mut self, divider: u32) {
        self.tx_divider = divider;
        self.record(Event::TxDivider(divider));
    }

    fn set_tx_size(&mut self, size: u16) {
        self.tx_size = size;
        self.record(Event::TxSize(size));
    }

    fn write_tx_samples(&mut self, samples: &[i16]) {
        let len = samples.len().min(self.tx_samples.len());
        self.tx_samples[..len].copy_from_slice(&samples[..len]);
        self.record(Event::TxSamples(len));
    }

    fn rx_counter(&mut self) -> u16 {
        if self.sequencer == SequencerState::Run {
            self.fifo_fill = self.fifo_fill.saturating_add(FILL_PER_POLL);
        }
        self.fifo_fill
    }

    fn read_rx_fifo(&mut self) -> u64 {
        self.fifo_fill = self.fifo_fill.saturating_sub(1);
        let sample = self.next_sample;
        self.next_sample = self.next_sample.wrapping_add(1);
        sample
    }

    fn write_gradient(&mut self, axis: GradientAxis, waveform: &GradientWaveform) {
        self.gradients.set_axis(axis, waveform.clone());
        self.record(Event::Gradient(axis));
    }

    fn set_sequencer(&mut self, state: SequencerState) {
        if state == SequencerState::Run {
            if self.recording {
                self.snapshots.push(self.gradients.clone());
            }
        } else {
            self.fifo_fill = 0;
        }
        self.sequencer = state;
        self.record(Event::Sequencer(state));
    }

    fn write_program(&mut self, words: &[u32]) {
        let len = words.len().min(self.program.len());
        self.program[..len].copy_from_slice(&words[..len]);
        self.record(Event::Program(len));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fifo_fills_only_while_running() {
        let mut board = SimulatedBoard::new();
        assert_eq!(board.rx_counter(), 0);
        assert_eq!(board.rx_counter(), 0);
        board.set_sequencer(SequencerState::Run);
        assert_eq!(board.rx_counter(), FILL_PER_POLL);
        assert_eq!(board.rx_counter(), 2 * FILL_PER_POLL);
        assert_eq!(board.read_rx_fifo(), 0);
        assert_eq!(board.read_rx_fifo(), 1);
        assert_eq!(board.rx_counter(), 3 * FILL_PER_POLL - 2);
        board.set_sequencer(SequencerState::Halt);
        assert_eq!(board.rx_counter(), 0);
    }

    #[test]
    fn program_writes_are_bounded() {
        let mut board = SimulatedBoard::recording();
        board.write_program(&vec![7; PROGRAM_MEMORY_WORDS + 10]);
        assert_eq!(board.events(), &[Event::Program(PROGRAM_MEMORY_WORDS)]);
        assert!(board.program().iter().all(|&w| w == 7));
    }

    #[test]
    fn served_board_keeps_no_history() {
        let mut board = SimulatedBoard::new();
        for _ in 0..64 {
            board.set_attenuation(40);
            board.write_gradient(GradientAxis::X, &GradientWaveform::default());
            board.set_sequencer(SequencerState::Run);
            board.set_sequencer(SequencerState::Halt);
        }
        assert!(board.events().is_empty());
        assert!(board.snapshots().is_empty());
        assert_eq!(board.attenuation(), 40);
        assert_eq!(board.sequencer(), SequencerState::Halt);
    }
}
