//! Microsequencer programs.
//!
//! This module rebuilds sequencer programs uploaded by the client and contains
//! the built-in program used for 1D projections.

use crate::port::HardwarePort;
use relax_protocol::WireOrder;

/// Number of program words kept from an upload.
pub const PROGRAM_WORDS: usize = 200;

/// Maximum number of bytes taken from the socket for one upload.
pub const UPLOAD_CAPACITY: usize = 8192 * std::mem::size_of::<u64>();

/// Built-in spin echo program with a single repetition, used for projections.
///
/// Gradients are enabled by the program.
pub const PROJECTION_PROGRAM: [u32; 84] = [
    0x10, 0x5c00_0000, // 0
    0x1, 0x0, //
    0x0, 0x0, //
    0x0, 0x0, //
    0x2, 0x0, //
    0x0, 0x0, // 10
    0x13, 0x0, //
    0x11, 0x0, //
    0x6, 0x0, //
    0x4, 0x0, //
    0x24, 0x0, // 20
    0x20, 0x0, //
    0x0, 0x0, //
    0x0, 0x0, //
    0x0, 0x0, //
    0x0, 0x0, // 30
    0x1, 0x1000_0002, //
    0x4, 0x1000_0003, //
    0x5, 0x1000_0004, //
    0x6, 0x1000_0005, //
    0x7, 0x1000_0006, // 40
    0x8, 0x1000_0007, //
    0x9, 0x1000_0008, //
    0xa, 0x1000_0009, //
    0xb, 0x1000_0010, //
    0x0, 0x0, // 50
    0x0, 0x0, //
    0x0, 0x0, //
    0x0, 0x0, //
    0x0, 0x2000_0000, //
    0x0, 0x2400_0000, // 60
    0x42f6, 0x7400_0500, //
    0xa9543, 0x7400_0300, //
    0x3e8, 0x2000_0000, //
    0x6472, 0x7400_0500, //
    0x4d6d6, 0x7400_0300, // 70
    0x29da4, 0x7400_0700, //
    0x1b3f724, 0x7400_0900, //
    0x0, 0x7400_0400, //
    0x0, 0x0400_0002, //
    0x1d, 0x4000_0002, // 80
    0x0, 0x6400_0000, //
];

/// Sequencer program with a fixed capacity of [`PROGRAM_WORDS`] words.
///
/// Unused words are zero.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SequencerProgram {
    words: [u32; PROGRAM_WORDS],
    len: usize,
}

impl Default for SequencerProgram {
    fn default() -> SequencerProgram {
        SequencerProgram {
            words: [0; PROGRAM_WORDS],
            len: 0,
        }
    }
}

impl SequencerProgram {
    /// Rebuilds a program from the bytes of an upload.
    ///
    /// The bytes are taken in groups of 4, aligned to the end of the buffer,
    /// walking from the last group to the first. Each group is read as a word
    /// in `order` and stored at a decreasing word index that starts at
    /// `bytes.len() / 4 - 1`, so the words end up in transmission order.
    /// Leading bytes that do not form a full group are ignored, as are words
    /// beyond [`PROGRAM_WORDS`].
    pub fn decode_upload(bytes: &[u8], order: WireOrder) -> SequencerProgram {
        let groups = bytes.len() / 4;
        if bytes.len() % 4 != 0 {
            tracing::warn!(
                len = bytes.len(),
                "upload length is not a multiple of 4; ignoring {} leading bytes",
                bytes.len() % 4
            );
        }
        if groups > PROGRAM_WORDS {
            tracing::warn!(
                words = groups,
                "upload longer than {PROGRAM_WORDS} words; truncating"
            );
        }
        let mut program = SequencerProgram::default();
        for (index, group) in (0..groups).rev().zip(bytes.rchunks_exact(4)) {
            if let Some(word) = program.words.get_mut(index) {
                // rchunks_exact only yields 4-byte chunks
                *word = order.word([group[0], group[1], group[2], group[3]]);
            }
        }
        program.len = groups.min(PROGRAM_WORDS);
        program
    }

    /// Returns the words received in the upload.
    pub fn words(&self) -> &[u32] {
        &self.words[..self.len]
    }

    /// Returns the number of words received in the upload.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the program has no words.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writes the program to sequencer memory.
    ///
    /// All [`PROGRAM_WORDS`] slots are written, so the tail of a longer
    /// previous program is zeroed.
    pub fn write(&self, port: &mut dyn HardwarePort) {
        port.write_program(&self.words);
    }
}

/// Writes the built-in projection program to sequencer memory.
pub fn load_projection_program(port: &mut dyn HardwarePort) {
    port.write_program(&PROJECTION_PROGRAM);
}
