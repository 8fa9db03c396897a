//! Gradient waveform synthesis.
//!
//! Each gradient axis is driven by an AD5781 DAC that plays a buffer of
//! [`WAVEFORM_LEN`] register frames. Frame 0 sets the DAC value, frame 1 sets
//! the output control register, and every following frame is one DAC write per
//! device tick of [`TICK`].
//!
//! The DAC is configured with the RBUF bit always set, so the enabled and
//! disabled control words both carry it.

use crate::port::HardwarePort;
use relax_protocol::GradientAxis;
use std::time::Duration;

/// Number of frames in the gradient memory of one axis.
pub const WAVEFORM_LEN: usize = 2000;

/// Index of the first time-step frame.
pub const FIRST_STEP: usize = 2;

/// Duration of one time-step frame.
pub const TICK: Duration = Duration::from_micros(10);

/// Voltage of one DAC code.
pub const DAC_LSB: f32 = (10.0 / ((1 << 15) - 1) as f64) as f32;

/// Flag that addresses the DAC value register.
pub const DAC_WRITE: u32 = 0x0010_0000;

/// Mask of the bits that are shifted into the DAC.
pub const DAC_MASK: u32 = 0x001f_ffff;

/// Control register frame: output enabled, two's complement coding.
pub const OUTPUT_ENABLED: u32 = 0x0020_0002;

/// Control register frame: output disabled (tristate), two's complement coding.
pub const OUTPUT_DISABLED: u32 = 0x0020_000e;

/// Number of ticks of each ramp of a trapezoid.
const RAMP_TICKS: usize = 20;

/// Encodes a voltage as a DAC value frame.
pub fn encode(volts: f32) -> u32 {
    let code = (volts / DAC_LSB).floor() as i32;
    (code.wrapping_mul(16) as u32 | DAC_WRITE) & DAC_MASK
}

/// Offset currents of the gradient axes.
///
/// Offsets are given in volts of DAC output, which the gradient amplifiers
/// turn into amperes one to one.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct GradientOffsets([f32; 4]);

impl GradientOffsets {
    /// Returns the offset of an axis.
    pub fn get(&self, axis: GradientAxis) -> f32 {
        self.0[axis.index()]
    }

    /// Sets the offset of an axis.
    pub fn set(&mut self, axis: GradientAxis, volts: f32) {
        self.0[axis.index()] = volts;
    }

    /// Sets the offset of an axis from a value in thousandths of a volt.
    pub fn set_milli(&mut self, axis: GradientAxis, negative: bool, magnitude: u32) {
        let milli = if negative {
            -f64::from(magnitude)
        } else {
            f64::from(magnitude)
        };
        self.set(axis, (milli / 1000.0) as f32);
    }
}

impl std::fmt::Display for GradientOffsets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let [x, y, z, z2] = self.0.map(|volts| (volts * 1000.0) as i32);
        write!(f, "X {x} mA, Y {y} mA, Z {z} mA, Z2 {z2} mA")
    }
}

/// Output state of the gradient channels when no waveform shape is played.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum OutputState {
    /// DAC at zero with the outputs disabled.
    ZeroDisabled,
    /// DAC at zero with the outputs enabled.
    ZeroEnabled,
    /// DAC at the offset current with the outputs enabled.
    OffsetEnabled,
}

/// Waveform of one gradient axis.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GradientWaveform([u32; WAVEFORM_LEN]);

impl Default for GradientWaveform {
    fn default() -> GradientWaveform {
        GradientWaveform([0; WAVEFORM_LEN])
    }
}

impl GradientWaveform {
    fn constant(value: u32, control: u32, step: u32) -> GradientWaveform {
        let mut frames = [step; WAVEFORM_LEN];
        frames[0] = value;
        frames[1] = control;
        GradientWaveform(frames)
    }

    /// Returns the frames of the waveform.
    pub fn frames(&self) -> &[u32; WAVEFORM_LEN] {
        &self.0
    }

    /// Plays `segments` starting at `start`, beginning from the level `level`.
    ///
    /// Each tick first adds the segment increment to the level and then writes
    /// the encoded level. Returns the level at the end of the last segment.
    fn trace(&mut self, start: usize, mut level: f32, segments: &[Segment]) -> f32 {
        let mut index = start;
        for segment in segments {
            for frame in &mut self.0[index..index + segment.ticks] {
                level += segment.increment;
                *frame = encode(level);
            }
            index += segment.ticks;
        }
        level
    }
}

impl std::ops::Index<usize> for GradientWaveform {
    type Output = u32;
    fn index(&self, index: usize) -> &u32 {
        &self.0[index]
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
struct Segment {
    ticks: usize,
    increment: f32,
}

impl Segment {
    fn ramp(amplitude: f32) -> Segment {
        Segment {
            ticks: RAMP_TICKS,
            increment: (f64::from(amplitude) / RAMP_TICKS as f64) as f32,
        }
    }

    fn hold(ticks: usize) -> Segment {
        Segment {
            ticks,
            increment: 0.0,
        }
    }

    fn negated(self) -> Segment {
        Segment {
            ticks: self.ticks,
            increment: -self.increment,
        }
    }
}

/// Prephaser lobe followed by the readout lobe.
///
/// The prephaser has twice the readout amplitude and the opposite sign of the
/// readout area it cancels: ramp up, 60 ticks flat, ramp down; then the
/// readout ramps to `-amplitude`, stays flat for 300 ticks and ramps back.
/// The level returns to where it started.
fn readout_segments(amplitude: f32) -> [Segment; 6] {
    let prephaser = Segment::ramp(amplitude * 2.0);
    let readout = Segment::ramp(amplitude);
    [
        prephaser,
        Segment::hold(60),
        prephaser.negated(),
        readout.negated(),
        Segment::hold(300),
        readout,
    ]
}

/// Phase encode lobe, played during the prephaser.
fn phase_encode_segments(amplitude: f32) -> [Segment; 3] {
    let ramp = Segment::ramp(amplitude);
    [ramp, Segment::hold(60), ramp.negated()]
}

/// Waveforms of the four gradient axes.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct GradientWaveforms([GradientWaveform; 4]);

impl GradientWaveforms {
    /// All-zero waveforms, which leave the DACs untouched.
    pub fn cleared() -> GradientWaveforms {
        GradientWaveforms::default()
    }

    /// Waveforms that only set a constant channel state.
    ///
    /// The time-step frames are zero, so the DACs keep the value written by
    /// frame 0. Such an event needs a 30 µs gate in the pulse sequence.
    pub fn state(state: OutputState, offsets: &GradientOffsets) -> GradientWaveforms {
        GradientWaveforms(GradientAxis::ALL.map(|axis| {
            let (value, control) = match state {
                OutputState::ZeroDisabled => (encode(0.0), OUTPUT_DISABLED),
                OutputState::ZeroEnabled => (encode(0.0), OUTPUT_ENABLED),
                OutputState::OffsetEnabled => (encode(offsets.get(axis)), OUTPUT_ENABLED),
            };
            GradientWaveform::constant(value, control, 0)
        }))
    }

    /// Enabled outputs holding the offset current of each axis for the whole
    /// buffer.
    pub fn baseline(offsets: &GradientOffsets) -> GradientWaveforms {
        GradientWaveforms(GradientAxis::ALL.map(|axis| {
            let value = encode(offsets.get(axis));
            GradientWaveform::constant(value, OUTPUT_ENABLED, value)
        }))
    }

    /// Projection readout along a single axis.
    ///
    /// All axes hold their offset; `axis` additionally plays the prephaser and
    /// readout lobes of `amplitude` volts starting at the first time step.
    pub fn projection(
        amplitude: f32,
        axis: GradientAxis,
        offsets: &GradientOffsets,
    ) -> GradientWaveforms {
        let mut waveforms = GradientWaveforms::baseline(offsets);
        waveforms.0[axis.index()].trace(
            FIRST_STEP,
            offsets.get(axis),
            &readout_segments(amplitude),
        );
        waveforms
    }

    /// Spin echo / gradient echo readout with phase encoding.
    ///
    /// X plays the prephaser and readout lobes of `readout` volts, and Y plays
    /// a phase encode lobe of `phase_encode` volts during the prephaser. Z and
    /// Z2 hold their offsets.
    pub fn echo(readout: f32, phase_encode: f32, offsets: &GradientOffsets) -> GradientWaveforms {
        let mut waveforms = GradientWaveforms::baseline(offsets);
        waveforms.0[GradientAxis::X.index()].trace(
            FIRST_STEP,
            offsets.get(GradientAxis::X),
            &readout_segments(readout),
        );
        waveforms.0[GradientAxis::Y.index()].trace(
            FIRST_STEP,
            offsets.get(GradientAxis::Y),
            &phase_encode_segments(phase_encode),
        );
        waveforms
    }

    /// Returns the waveform of an axis.
    pub fn axis(&self, axis: GradientAxis) -> &GradientWaveform {
        &self.0[axis.index()]
    }

    pub(crate) fn set_axis(&mut self, axis: GradientAxis, waveform: GradientWaveform) {
        self.0[axis.index()] = waveform;
    }

    /// Writes the waveforms of all axes to the gradient memories.
    pub fn write(&self, port: &mut dyn HardwarePort) {
        for axis in GradientAxis::ALL {
            port.write_gradient(axis, self.axis(axis));
        }
    }
}

/// Zeroes the gradient memories of all axes.
pub fn clear_gradient_waveforms(port: &mut dyn HardwarePort) {
    tracing::debug!("clearing gradient waveforms");
    GradientWaveforms::cleared().write(port);
}
