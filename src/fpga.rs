//! Console FPGA registers.
//!
//! This module contains the userspace driver for the console programmable
//! logic. The register banks and memories are mapped from `/dev/mem` at the
//! fixed addresses of the FPGA address map and accessed through volatile
//! cells.

use crate::devmem::{DevMem, Mapping};
use crate::gradient::{GradientWaveform, WAVEFORM_LEN};
use crate::port::{HardwarePort, SequencerState, PROGRAM_MEMORY_WORDS, TX_SAMPLES};
use anyhow::{Context, Result};
use relax_protocol::GradientAxis;
use std::marker::PhantomData;
use std::path::Path;
use vcell::VolatileCell;

const SLCR_ADDR: usize = 0xf800_0000;
const CONFIG_ADDR: usize = 0x4000_0000;
const STATUS_ADDR: usize = 0x4000_1000;
const GRADIENT_ADDR: [usize; 4] = [0x4000_2000, 0x4000_4000, 0x4000_6000, 0x4000_8000];
const RX_FIFO_ADDR: usize = 0x4001_0000;
const TX_MEMORY_ADDR: usize = 0x4002_0000;
const PROGRAM_ADDR: usize = 0x4003_0000;
const SEQUENCER_ADDR: usize = 0x4004_0000;
const ATTENUATOR_ADDR: usize = 0x4005_0000;

// SLCR words used to set the FPGA clock to 143 MHz
const SLCR_UNLOCK: usize = 2;
const SLCR_UNLOCK_KEY: u32 = 0xdf0d;
const SLCR_FPGA0_CLK_CTRL: usize = 92;
const FPGA0_CLK_MASK: u32 = 0x03f0_3f30;
const FPGA0_CLK_143MHZ: u32 = 0x0010_0700;

const GRADIENT_MEMORY_WORDS: usize = 2048;

#[repr(C)]
struct Config {
    tx_divider: VolatileCell<u32>,
    rx_frequency: VolatileCell<u32>,
    rx_rate: VolatileCell<u32>,
    tx_size: VolatileCell<u16>,
}

#[repr(C)]
struct Status {
    rx_counter: VolatileCell<u16>,
}

#[repr(C)]
struct RxFifo {
    data: VolatileCell<u64>,
}

#[repr(C)]
struct TxMemory {
    samples: [VolatileCell<i16>; TX_SAMPLES],
}

#[repr(C)]
struct GradientMemory {
    words: [VolatileCell<u32>; GRADIENT_MEMORY_WORDS],
}

#[repr(C)]
struct ProgramMemory {
    words: [VolatileCell<u32>; PROGRAM_MEMORY_WORDS],
}

#[repr(C)]
struct SequencerControl {
    control: VolatileCell<u32>,
}

#[repr(C)]
struct Attenuator {
    value: VolatileCell<u32>,
}

#[repr(C)]
struct Slcr {
    words: [VolatileCell<u32>; 128],
}

/// Register block of type `T` backed by a physical memory mapping.
struct Block<T> {
    mapping: Mapping,
    _block: PhantomData<T>,
}

impl<T> Block<T> {
    fn map(devmem: &DevMem, phys_addr: usize, pages: usize) -> Result<Block<T>> {
        let mapping = devmem
            .map(phys_addr, pages * page_size::get())
            .with_context(|| format!("failed to map registers at {phys_addr:#x}"))?;
        if mapping.len() < std::mem::size_of::<T>() {
            anyhow::bail!(
                "mapping at {phys_addr:#x} has {} bytes but the register block needs {}",
                mapping.len(),
                std::mem::size_of::<T>()
            );
        }
        Ok(Block {
            mapping,
            _block: PhantomData,
        })
    }
}

impl<T> std::fmt::Debug for Block<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("addr", &self.mapping.addr())
            .field("len", &self.mapping.len())
            .finish()
    }
}

impl<T> std::ops::Deref for Block<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*(self.mapping.addr() as *const T) }
    }
}

unsafe impl<T> Send for Block<T> {}

/// Console FPGA.
///
/// This struct owns the mappings of all the register banks and memories used
/// by the server, and implements [`HardwarePort`] on them.
#[derive(Debug)]
pub struct Fpga {
    config: Block<Config>,
    status: Block<Status>,
    rx_fifo: Block<RxFifo>,
    tx_memory: Block<TxMemory>,
    gradients: [Block<GradientMemory>; 4],
    program: Block<ProgramMemory>,
    sequencer: Block<SequencerControl>,
    attenuator: Block<Attenuator>,
}

impl Fpga {
    /// Maps the FPGA registers and sets the FPGA clock.
    ///
    /// `devmem` is the physical memory device, usually `/dev/mem`.
    #[tracing::instrument(name = "Fpga::take", level = "debug")]
    pub async fn take(devmem: &Path) -> Result<Fpga> {
        let devmem = DevMem::open(devmem).await?;
        let gradient = |axis: usize| -> Result<Block<GradientMemory>> {
            Block::map(&devmem, GRADIENT_ADDR[axis], 2)
        };
        let fpga = Fpga {
            config: Block::map(&devmem, CONFIG_ADDR, 1)?,
            status: Block::map(&devmem, STATUS_ADDR, 1)?,
            rx_fifo: Block::map(&devmem, RX_FIFO_ADDR, 16)?,
            tx_memory: Block::map(&devmem, TX_MEMORY_ADDR, 16)?,
            gradients: [gradient(0)?, gradient(1)?, gradient(2)?, gradient(3)?],
            program: Block::map(&devmem, PROGRAM_ADDR, 16)?,
            sequencer: Block::map(&devmem, SEQUENCER_ADDR, 1)?,
            attenuator: Block::map(&devmem, ATTENUATOR_ADDR, 1)?,
        };
        tracing::info!("mapped FPGA registers");

        let slcr = Block::<Slcr>::map(&devmem, SLCR_ADDR, 1).context("failed to map SLCR")?;
        slcr.words[SLCR_UNLOCK].set(SLCR_UNLOCK_KEY);
        let clk_ctrl = &slcr.words[SLCR_FPGA0_CLK_CTRL];
        clk_ctrl.set((clk_ctrl.get() & !FPGA0_CLK_MASK) | FPGA0_CLK_143MHZ);
        tracing::info!("FPGA clock set to 143 MHz");

        Ok(fpga)
    }
}

impl HardwarePort for Fpga {
    fn set_attenuation(&mut self, value: u32) {
        self.attenuator.value.set(value);
    }

    fn set_rx_frequency(&mut self, tuning_word: u32) {
        self.config.rx_frequency.set(tuning_word);
    }

    fn set_rx_rate(&mut self, rate: u32) {
        self.config.rx_rate.set(rate);
    }

    fn set_tx_divider(&mut self, divider: u32) {
        self.config.tx_divider.set(divider);
    }

    fn set_tx_size(&mut self, size: u16) {
        self.config.tx_size.set(size);
    }

    fn write_tx_samples(&mut self, samples: &[i16]) {
        for (cell, &sample) in self.tx_memory.samples.iter().zip(samples) {
            cell.set(sample);
        }
    }

    fn rx_counter(&mut self) -> u16 {
        self.status.rx_counter.get()
    }

    fn read_rx_fifo(&mut self) -> u64 {
        self.rx_fifo.data.get()
    }

    fn write_gradient(&mut self, axis: GradientAxis, waveform: &GradientWaveform) {
        // block RAM only supports 32-bit transactions
        let memory = &self.gradients[axis.index()];
        for (cell, &word) in memory.words[..WAVEFORM_LEN]
            .iter()
            .zip(waveform.frames())
        {
            cell.set(word);
        }
    }

    fn set_sequencer(&mut self, state: SequencerState) {
        self.sequencer.control.set(state.register_value());
    }

    fn write_program(&mut self, words: &[u32]) {
        for (cell, &word) in self.program.words.iter().zip(words) {
            cell.set(word);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_layout() {
        assert_eq!(std::mem::size_of::<Config>(), 16);
        assert_eq!(std::mem::size_of::<TxMemory>(), 65536);
        assert_eq!(std::mem::size_of::<GradientMemory>(), 8192);
        assert_eq!(std::mem::size_of::<ProgramMemory>(), 65536);
        assert!(WAVEFORM_LEN <= GRADIENT_MEMORY_WORDS);
    }
}
