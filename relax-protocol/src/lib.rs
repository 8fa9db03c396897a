//! relax-protocol contains the wire definitions shared by relax-server and its
//! clients.
//!
//! A client talks to the console over a single TCP connection. Every command is
//! one 32-bit word whose top 4 bits select a trigger and whose low 28 bits carry
//! a trigger-specific payload. Acquisitions are answered with raw sample bytes
//! in bursts of [`BURST_BYTES`], without any framing.

#![warn(missing_docs)]

/// TCP port on which the console listens by default.
pub const DEFAULT_PORT: u16 = 1001;

/// Number of 64-bit receive samples sent in one chunk of a burst.
pub const SAMPLES_PER_CHUNK: usize = 5000;

/// Number of chunks that form an acquisition burst.
pub const CHUNKS_PER_BURST: usize = 10;

/// Size in bytes of one chunk of an acquisition burst.
pub const CHUNK_BYTES: usize = SAMPLES_PER_CHUNK * std::mem::size_of::<u64>();

/// Size in bytes of the response to a single acquisition.
///
/// An image acquisition with `n` phase encodes is answered with `n` bursts.
pub const BURST_BYTES: usize = CHUNKS_PER_BURST * CHUNK_BYTES;

/// Maximum receive frequency accepted by the set frequency trigger, in Hz.
pub const MAX_FREQUENCY_HZ: u32 = 60_000_000;

/// Maximum attenuation value, in units of 0.25 dB (31.75 dB).
pub const MAX_ATTENUATION: u32 = 127;

const TRIGGER_SHIFT: u32 = 28;
const PAYLOAD_MASK: u32 = 0x0fff_ffff;

/// Byte order used for command words and for uploaded sequencer programs.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum WireOrder {
    /// Most significant byte first (network order).
    #[default]
    BigEndian,
    /// Least significant byte first, as written by the legacy GUI client.
    LittleEndian,
}

impl WireOrder {
    /// Interprets 4 bytes as a word in this byte order.
    pub fn word(self, bytes: [u8; 4]) -> u32 {
        match self {
            WireOrder::BigEndian => u32::from_be_bytes(bytes),
            WireOrder::LittleEndian => u32::from_le_bytes(bytes),
        }
    }

    /// Serializes a word in this byte order.
    pub fn bytes(self, word: u32) -> [u8; 4] {
        match self {
            WireOrder::BigEndian => word.to_be_bytes(),
            WireOrder::LittleEndian => word.to_le_bytes(),
        }
    }
}

/// Gradient axis.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum GradientAxis {
    /// X axis (readout).
    X,
    /// Y axis (phase encode).
    Y,
    /// Z axis.
    Z,
    /// Z2 shim channel.
    Z2,
}

impl GradientAxis {
    /// All the gradient axes, in channel order.
    pub const ALL: [GradientAxis; 4] = [
        GradientAxis::X,
        GradientAxis::Y,
        GradientAxis::Z,
        GradientAxis::Z2,
    ];

    /// Returns the channel index of the axis.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Returns the axis with a given channel number, if there is one.
    pub fn from_index(index: u32) -> Option<GradientAxis> {
        GradientAxis::ALL.get(usize::try_from(index).ok()?).copied()
    }
}

impl std::fmt::Display for GradientAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let name = match self {
            GradientAxis::X => "X",
            GradientAxis::Y => "Y",
            GradientAxis::Z => "Z",
            GradientAxis::Z2 => "Z2",
        };
        f.write_str(name)
    }
}

/// Console command.
///
/// This is the decoded form of a command word. Decoding never fails: payload
/// fields are extracted as-is and range checks are left to the server.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Command {
    /// Trigger 0. Does nothing.
    Noop,
    /// Trigger 1. Runs the sequencer and returns one burst.
    Acquire,
    /// Trigger 2. Sets the receive frequency.
    SetFrequency {
        /// Frequency in Hz (28 bits).
        hz: u32,
    },
    /// Trigger 3. Sets the transmit attenuation.
    SetAttenuation {
        /// Attenuation in units of 0.25 dB.
        quarter_db: u32,
    },
    /// Trigger 4. The program bytes follow the command on the socket.
    UploadSequence,
    /// Trigger 5. Sets the offset current of one gradient axis.
    SetGradientOffset {
        /// Axis channel number (0 = X, 1 = Y, 2 = Z, 3 = Z2).
        axis: u8,
        /// Whether the offset is negative.
        negative: bool,
        /// Offset magnitude in thousandths (20 bits).
        magnitude: u32,
    },
    /// Trigger 6. Acquires a 2D image, returning one burst per phase encode.
    Image {
        /// Number of phase encodes (12 bits).
        phase_encodes: u16,
        /// Repetition time in ms.
        repetition_ms: u16,
    },
    /// Trigger 7. Acquires a 1D projection along an axis.
    Projection {
        /// Axis channel number (0 = X, 1 = Y, 2 = Z).
        axis: u16,
    },
    /// Triggers 8 to 15, which have no meaning.
    Unknown {
        /// Trigger value.
        trigger: u8,
        /// Raw 28-bit payload.
        payload: u32,
    },
}

impl Command {
    /// Decodes a command word.
    pub fn decode(word: u32) -> Command {
        let trigger = (word >> TRIGGER_SHIFT) as u8;
        let payload = word & PAYLOAD_MASK;
        match trigger {
            0 => Command::Noop,
            1 => Command::Acquire,
            2 => Command::SetFrequency { hz: payload },
            3 => Command::SetAttenuation {
                quarter_db: payload,
            },
            4 => Command::UploadSequence,
            5 => Command::SetGradientOffset {
                axis: (payload >> 24) as u8,
                negative: (payload >> 20) & 0xf != 0,
                magnitude: payload & 0x000f_ffff,
            },
            6 => Command::Image {
                phase_encodes: (payload >> 16) as u16,
                repetition_ms: payload as u16,
            },
            7 => Command::Projection {
                axis: payload as u16,
            },
            trigger => Command::Unknown { trigger, payload },
        }
    }

    /// Encodes the command as a command word.
    ///
    /// Fields wider than their slot in the word are truncated.
    pub fn encode(&self) -> u32 {
        let payload = match *self {
            Command::Noop | Command::Acquire | Command::UploadSequence => 0,
            Command::SetFrequency { hz } => hz,
            Command::SetAttenuation { quarter_db } => quarter_db,
            Command::SetGradientOffset {
                axis,
                negative,
                magnitude,
            } => {
                (u32::from(axis & 0xf) << 24)
                    | (u32::from(negative) << 20)
                    | (magnitude & 0x000f_ffff)
            }
            Command::Image {
                phase_encodes,
                repetition_ms,
            } => (u32::from(phase_encodes & 0xfff) << 16) | u32::from(repetition_ms),
            Command::Projection { axis } => u32::from(axis),
            Command::Unknown { payload, .. } => payload,
        };
        (u32::from(self.trigger()) << TRIGGER_SHIFT) | (payload & PAYLOAD_MASK)
    }

    /// Returns the trigger value of the command.
    pub fn trigger(&self) -> u8 {
        match self {
            Command::Noop => 0,
            Command::Acquire => 1,
            Command::SetFrequency { .. } => 2,
            Command::SetAttenuation { .. } => 3,
            Command::UploadSequence => 4,
            Command::SetGradientOffset { .. } => 5,
            Command::Image { .. } => 6,
            Command::Projection { .. } => 7,
            Command::Unknown { trigger, .. } => trigger & 0xf,
        }
    }

    /// Returns the number of bytes the console sends back for this command.
    pub fn response_len(&self) -> usize {
        match self {
            Command::Acquire | Command::Projection { .. } => BURST_BYTES,
            Command::Image { phase_encodes, .. } => usize::from(*phase_encodes) * BURST_BYTES,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_triggers() {
        assert_eq!(Command::decode(0), Command::Noop);
        assert_eq!(Command::decode(0x1000_0000), Command::Acquire);
        assert_eq!(
            Command::decode(0x2000_0000 | 20_000_000),
            Command::SetFrequency { hz: 20_000_000 }
        );
        assert_eq!(
            Command::decode(0x3000_0000 | 130),
            Command::SetAttenuation { quarter_db: 130 }
        );
        assert_eq!(Command::decode(0x4000_0000), Command::UploadSequence);
        assert_eq!(
            Command::decode(0x9abc_def0),
            Command::Unknown {
                trigger: 9,
                payload: 0x0abc_def0
            }
        );
    }

    #[test]
    fn decode_gradient_offset() {
        // as built by the GUI: 5 << 28 | axis << 24 | sign << 20 | value
        let word = (5 << 28) | (1 << 24) | (1 << 20) | 250;
        assert_eq!(
            Command::decode(word),
            Command::SetGradientOffset {
                axis: 1,
                negative: true,
                magnitude: 250
            }
        );
        let word = (5 << 28) | (3 << 24) | 0xfffff;
        assert_eq!(
            Command::decode(word),
            Command::SetGradientOffset {
                axis: 3,
                negative: false,
                magnitude: 0xfffff
            }
        );
    }

    #[test]
    fn decode_image() {
        let word = (6 << 28) | (64 << 16) | 4000;
        assert_eq!(
            Command::decode(word),
            Command::Image {
                phase_encodes: 64,
                repetition_ms: 4000
            }
        );
        assert_eq!(
            Command::decode(word).response_len(),
            64 * BURST_BYTES
        );
    }

    #[test]
    fn encode_projection() {
        assert_eq!(Command::Projection { axis: 2 }.encode(), 0x7000_0002);
        assert_eq!(Command::decode(0x7000_0002), Command::Projection { axis: 2 });
    }

    #[test]
    fn encode_truncates_payload() {
        let command = Command::SetFrequency { hz: 0xffff_ffff };
        assert_eq!(command.encode(), 0x2fff_ffff);
    }

    #[test]
    fn wire_order() {
        let bytes = [0x10, 0x00, 0x00, 0x02];
        assert_eq!(WireOrder::BigEndian.word(bytes), 0x1000_0002);
        assert_eq!(WireOrder::LittleEndian.word(bytes), 0x0200_0010);
        assert_eq!(WireOrder::LittleEndian.bytes(0x7000_0001), [1, 0, 0, 0x70]);
    }

    #[test]
    fn burst_size() {
        assert_eq!(CHUNK_BYTES, 40_000);
        assert_eq!(BURST_BYTES, 400_000);
    }

    #[test]
    fn axes() {
        assert_eq!(GradientAxis::from_index(2), Some(GradientAxis::Z));
        assert_eq!(GradientAxis::from_index(4), None);
        assert_eq!(GradientAxis::Z2.index(), 3);
        assert_eq!(GradientAxis::Z2.to_string(), "Z2");
    }
}
