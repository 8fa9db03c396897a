//! Client sessions.
//!
//! A [`Session`] serves the commands of one client connection. It keeps the
//! gradient offsets and the uploaded sequencer program, which last until the
//! client disconnects, and it runs each command to completion before reading
//! the next one.
//!
//! Commands with an invalid payload are logged and ignored. Failures of the
//! connection end the session with an error.

use crate::acquisition::{stream_burst, ChunkSink};
use crate::board::frequency_word;
use crate::gradient::{clear_gradient_waveforms, GradientOffsets, GradientWaveforms, OutputState};
use crate::port::{HardwarePort, SequencerState};
use crate::sequencer::{load_projection_program, SequencerProgram, UPLOAD_CAPACITY};
use anyhow::{Context, Result};
use relax_protocol::{Command, GradientAxis, WireOrder, MAX_ATTENUATION, MAX_FREQUENCY_HZ};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Time the sequencer runs before the receive FIFO is drained.
pub const SETTLE_TIME: Duration = Duration::from_secs(1);

/// Pause after single acquisitions and projections.
pub const POST_ACQUISITION_DELAY: Duration = Duration::from_millis(500);

/// Phase encode amplitude increment between repetitions, in volts.
pub const PHASE_ENCODE_STEP: f32 = 0.033;

/// Readout amplitude of 2D images, in volts.
pub const READOUT_AMPLITUDE: f32 = 1.0;

/// Readout amplitude of 1D projections, in volts.
pub const PROJECTION_AMPLITUDE: f32 = 1.0;

/// Activity of a session.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SessionState {
    /// Waiting for a command.
    Idle,
    /// Running the sequencer and streaming samples.
    Acquiring,
    /// Writing registers or memories.
    Reconfiguring,
}

/// Session of one client.
pub struct Session<'a> {
    port: &'a mut dyn HardwarePort,
    order: WireOrder,
    offsets: GradientOffsets,
    program: SequencerProgram,
    state: SessionState,
}

impl std::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("order", &self.order)
            .field("offsets", &self.offsets)
            .field("program_len", &self.program.len())
            .field("state", &self.state)
            .finish()
    }
}

/// Initial phase encode amplitude of an image with `phase_encodes` encodes.
pub fn phase_encode_start(phase_encodes: u16) -> f32 {
    -(f32::from(phase_encodes) / 2.0 + 1.0) * PHASE_ENCODE_STEP
}

// Reads a command word. Returns `None` if the stream ends before the first
// byte of the word.
async fn read_word<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<[u8; 4]>> {
    let mut word = [0; 4];
    let mut filled = 0;
    while filled < word.len() {
        let len = stream
            .read(&mut word[filled..])
            .await
            .context("failed to read command")?;
        if len == 0 {
            if filled == 0 {
                return Ok(None);
            }
            anyhow::bail!("connection closed after {filled} bytes of a command word");
        }
        filled += len;
    }
    Ok(Some(word))
}

impl<'a> Session<'a> {
    /// Creates a session with zero gradient offsets and an empty program.
    pub fn new(port: &'a mut dyn HardwarePort, order: WireOrder) -> Session<'a> {
        Session {
            port,
            order,
            offsets: GradientOffsets::default(),
            program: SequencerProgram::default(),
            state: SessionState::Idle,
        }
    }

    /// Returns the gradient offsets of the session.
    pub fn offsets(&self) -> &GradientOffsets {
        &self.offsets
    }

    /// Returns the last program uploaded in the session.
    pub fn program(&self) -> &SequencerProgram {
        &self.program
    }

    /// Returns the activity of the session.
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        if state != self.state {
            tracing::debug!("session state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Serves commands from `stream` until the client disconnects.
    ///
    /// Returns `Ok` when the client closes the connection between commands,
    /// and an error if the connection fails or is closed in the middle of a
    /// command word.
    pub async fn run<S>(&mut self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + ChunkSink + Unpin,
    {
        while let Some(word) = read_word(stream).await? {
            let command = Command::decode(self.order.word(word));
            tracing::debug!(trigger = command.trigger(), ?command, "received command");
            self.handle(command, stream).await?;
            self.set_state(SessionState::Idle);
        }
        tracing::info!("client closed the connection");
        Ok(())
    }

    /// Runs one command.
    pub async fn handle<S>(&mut self, command: Command, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + ChunkSink + Unpin,
    {
        match command {
            Command::Noop => Ok(()),
            Command::Acquire => self.acquire(stream).await,
            Command::SetFrequency { hz } => {
                self.set_frequency(hz);
                Ok(())
            }
            Command::SetAttenuation { quarter_db } => {
                self.set_attenuation(quarter_db);
                Ok(())
            }
            Command::UploadSequence => self.upload_sequence(stream).await,
            Command::SetGradientOffset {
                axis,
                negative,
                magnitude,
            } => {
                self.set_gradient_offset(axis, negative, magnitude);
                Ok(())
            }
            Command::Image {
                phase_encodes,
                repetition_ms,
            } => self.image(phase_encodes, repetition_ms, stream).await,
            Command::Projection { axis } => self.projection(axis, stream).await,
            Command::Unknown { trigger, payload } => {
                tracing::warn!(trigger, payload, "ignoring unknown trigger");
                Ok(())
            }
        }
    }

    /// Sets the receive frequency.
    ///
    /// Frequencies above [`MAX_FREQUENCY_HZ`] are ignored.
    pub fn set_frequency(&mut self, hz: u32) {
        if hz > MAX_FREQUENCY_HZ {
            tracing::warn!(hz, "frequency out of range; ignoring");
            return;
        }
        self.set_state(SessionState::Reconfiguring);
        self.port.set_rx_frequency(frequency_word(hz));
        tracing::info!("receive frequency set to {:.4} MHz", f64::from(hz) / 1e6);
    }

    /// Sets the transmit attenuation, in units of 0.25 dB.
    ///
    /// Values above [`MAX_ATTENUATION`] are clamped.
    pub fn set_attenuation(&mut self, quarter_db: u32) {
        let value = if quarter_db > MAX_ATTENUATION {
            tracing::warn!(
                quarter_db,
                "attenuation out of range; clamping to {} dB",
                MAX_ATTENUATION as f32 * 0.25
            );
            MAX_ATTENUATION
        } else {
            quarter_db
        };
        self.set_state(SessionState::Reconfiguring);
        self.port.set_attenuation(value);
        tracing::info!("attenuation set to {:.2} dB", value as f32 * 0.25);
    }

    /// Sets the offset of a gradient axis and applies the offsets of all the
    /// axes.
    ///
    /// An unknown axis leaves the offsets unchanged, but they are still
    /// applied.
    pub fn set_gradient_offset(&mut self, axis: u8, negative: bool, magnitude: u32) {
        match GradientAxis::from_index(axis.into()) {
            Some(axis) => {
                self.offsets.set_milli(axis, negative, magnitude);
                tracing::info!(%axis, negative, magnitude, "gradient offset set");
            }
            None => tracing::warn!(axis, "unknown gradient axis; offsets unchanged"),
        }
        self.set_state(SessionState::Reconfiguring);
        GradientWaveforms::state(OutputState::OffsetEnabled, &self.offsets).write(self.port);
        tracing::info!("gradient offsets: {}", self.offsets);
    }

    async fn upload_sequence<S>(&mut self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        // the program is taken from a single read
        let mut buffer = vec![0; UPLOAD_CAPACITY];
        let len = stream
            .read(&mut buffer)
            .await
            .context("failed to receive sequencer program")?;
        if len == 0 {
            anyhow::bail!("connection closed before the sequencer program was received");
        }
        self.set_state(SessionState::Reconfiguring);
        self.program = SequencerProgram::decode_upload(&buffer[..len], self.order);
        for (n, word) in self.program.words().iter().enumerate() {
            tracing::trace!("program[{n}] = {word:#010x}");
        }
        self.program.write(self.port);
        tracing::info!(
            bytes = len,
            words = self.program.len(),
            "sequencer program loaded"
        );
        Ok(())
    }

    // Runs the sequencer, streams one burst and halts the sequencer.
    async fn burst<S: ChunkSink>(&mut self, sink: &mut S) -> Result<()> {
        self.set_state(SessionState::Acquiring);
        self.port.set_sequencer(SequencerState::Run);
        tokio::time::sleep(SETTLE_TIME).await;
        let count = self.port.rx_counter();
        tracing::debug!(count, "samples in receive FIFO");
        let result = stream_burst(self.port, sink).await;
        self.port.set_sequencer(SequencerState::Halt);
        result
    }

    async fn acquire<S: ChunkSink>(&mut self, sink: &mut S) -> Result<()> {
        tracing::info!("acquiring");
        self.burst(sink).await?;
        tokio::time::sleep(POST_ACQUISITION_DELAY).await;
        Ok(())
    }

    async fn image<S: ChunkSink>(
        &mut self,
        phase_encodes: u16,
        repetition_ms: u16,
        sink: &mut S,
    ) -> Result<()> {
        tracing::info!(phase_encodes, repetition_ms, "acquiring 2D spin echo image");
        self.set_state(SessionState::Reconfiguring);
        // a projection may have replaced the uploaded program
        self.program.write(self.port);
        let mut phase_encode = phase_encode_start(phase_encodes);
        clear_gradient_waveforms(self.port);
        GradientWaveforms::echo(READOUT_AMPLITUDE, phase_encode, &self.offsets).write(self.port);
        tracing::info!("gradient offsets: {}", self.offsets);
        let repetition = Duration::from_millis(repetition_ms.into());
        for rep in 0..phase_encodes {
            tracing::debug!(rep, phase_encode, "repetition");
            self.burst(sink).await?;
            phase_encode += PHASE_ENCODE_STEP;
            GradientWaveforms::echo(READOUT_AMPLITUDE, phase_encode, &self.offsets)
                .write(self.port);
            tokio::time::sleep(repetition).await;
        }
        tracing::info!("image done");
        Ok(())
    }

    async fn projection<S: ChunkSink>(&mut self, axis: u16, sink: &mut S) -> Result<()> {
        tracing::info!(axis, "acquiring 1D projection");
        self.set_state(SessionState::Reconfiguring);
        clear_gradient_waveforms(self.port);
        load_projection_program(self.port);
        match GradientAxis::from_index(axis.into()).filter(|&a| a != GradientAxis::Z2) {
            Some(axis) => GradientWaveforms::projection(PROJECTION_AMPLITUDE, axis, &self.offsets)
                .write(self.port),
            None => tracing::warn!(axis, "unknown projection axis; gradients stay cleared"),
        }
        self.burst(sink).await?;
        tokio::time::sleep(POST_ACQUISITION_DELAY).await;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sequencer::{PROGRAM_WORDS, PROJECTION_PROGRAM};
    use crate::sim::{Event, SimulatedBoard};
    use relax_protocol::BURST_BYTES;
    use std::pin::Pin;
    use std::task::{self, Poll};
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadBuf};

    impl ChunkSink for DuplexStream {
        async fn send_chunk(&mut self, chunk: &[u8], _more: bool) -> Result<()> {
            self.write_all(chunk).await?;
            Ok(())
        }
    }

    // Sends `request`, reads `response_len` bytes and closes the connection.
    async fn client(mut io: DuplexStream, request: Vec<u8>, response_len: usize) -> Vec<u8> {
        io.write_all(&request).await.unwrap();
        let mut response = vec![0; response_len];
        io.read_exact(&mut response).await.unwrap();
        response
    }

    fn words(commands: &[Command]) -> Vec<u8> {
        commands
            .iter()
            .flat_map(|c| c.encode().to_be_bytes())
            .collect()
    }

    async fn exchange(
        board: &mut SimulatedBoard,
        order: WireOrder,
        request: Vec<u8>,
        response_len: usize,
    ) -> (Vec<u8>, Result<()>) {
        let (io, mut server) = tokio::io::duplex(1 << 16);
        let mut session = Session::new(board, order);
        tokio::join!(
            client(io, request, response_len),
            session.run(&mut server)
        )
    }

    #[tokio::test(start_paused = true)]
    async fn image_acquisition() {
        let mut board = SimulatedBoard::recording();
        let command = Command::Image {
            phase_encodes: 4,
            repetition_ms: 50,
        };
        let start = tokio::time::Instant::now();
        let (data, result) = exchange(
            &mut board,
            WireOrder::BigEndian,
            words(&[command]),
            command.response_len(),
        )
        .await;
        result.unwrap();
        assert_eq!(data.len(), 4 * BURST_BYTES);
        for (n, sample) in data.chunks_exact(8).enumerate() {
            assert_eq!(u64::from_le_bytes(sample.try_into().unwrap()), n as u64);
        }
        assert!(start.elapsed() >= 4 * (SETTLE_TIME + Duration::from_millis(50)));

        // one echo waveform per repetition, stepping the phase encode
        let offsets = GradientOffsets::default();
        let mut phase_encode = -3.0 * PHASE_ENCODE_STEP;
        assert_eq!(board.snapshots().len(), 4);
        for snapshot in board.snapshots() {
            assert_eq!(
                snapshot,
                &GradientWaveforms::echo(READOUT_AMPLITUDE, phase_encode, &offsets)
            );
            phase_encode += PHASE_ENCODE_STEP;
        }
        assert_eq!(
            board.gradients(),
            &GradientWaveforms::echo(READOUT_AMPLITUDE, phase_encode, &offsets)
        );

        let runs = board
            .events()
            .iter()
            .filter(|&&e| e == Event::Sequencer(SequencerState::Run))
            .count();
        assert_eq!(runs, 4);
        assert_eq!(board.events()[0], Event::Program(PROGRAM_WORDS));
        assert_eq!(board.sequencer(), SequencerState::Halt);
    }

    #[test]
    fn phase_encode_start_values() {
        assert_eq!(phase_encode_start(4), -3.0 * PHASE_ENCODE_STEP);
        assert_eq!(phase_encode_start(0), -PHASE_ENCODE_STEP);
        assert_eq!(phase_encode_start(5), -3.5 * PHASE_ENCODE_STEP);
    }

    #[tokio::test(start_paused = true)]
    async fn frequency() {
        let mut board = SimulatedBoard::recording();
        let request = words(&[
            Command::SetFrequency { hz: 20_000_000 },
            Command::SetFrequency { hz: 70_000_000 },
        ]);
        let (_, result) = exchange(&mut board, WireOrder::BigEndian, request, 0).await;
        result.unwrap();
        assert_eq!(board.events(), &[Event::RxFrequency(171_798_692)]);
    }

    #[tokio::test(start_paused = true)]
    async fn attenuation() {
        let mut board = SimulatedBoard::recording();
        let request = words(&[
            Command::SetAttenuation { quarter_db: 130 },
            Command::SetAttenuation { quarter_db: 40 },
        ]);
        let (_, result) = exchange(&mut board, WireOrder::BigEndian, request, 0).await;
        result.unwrap();
        assert_eq!(
            board.events(),
            &[Event::Attenuation(127), Event::Attenuation(40)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn little_endian_commands() {
        let mut board = SimulatedBoard::recording();
        let request = Command::SetAttenuation { quarter_db: 40 }
            .encode()
            .to_le_bytes()
            .to_vec();
        let (_, result) = exchange(&mut board, WireOrder::LittleEndian, request, 0).await;
        result.unwrap();
        assert_eq!(board.attenuation(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn upload() {
        let mut board = SimulatedBoard::recording();
        board.write_program(&[0xffff_ffff; PROGRAM_WORDS]);
        board.clear_events();
        let mut request = words(&[Command::UploadSequence]);
        request.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 2]);
        let (_, result) = exchange(&mut board, WireOrder::BigEndian, request, 0).await;
        result.unwrap();
        assert_eq!(&board.program()[..2], &[1, 2]);
        assert!(board.program()[2..PROGRAM_WORDS].iter().all(|&w| w == 0));
        assert_eq!(board.events(), &[Event::Program(PROGRAM_WORDS)]);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_without_payload() {
        let mut board = SimulatedBoard::recording();
        let request = words(&[Command::UploadSequence]);
        let (_, result) = exchange(&mut board, WireOrder::BigEndian, request, 0).await;
        assert!(result.is_err());
        assert!(board.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn gradient_offsets() {
        let mut board = SimulatedBoard::recording();
        let request = words(&[
            Command::SetGradientOffset {
                axis: 1,
                negative: true,
                magnitude: 250,
            },
            Command::SetGradientOffset {
                axis: 9,
                negative: false,
                magnitude: 100,
            },
        ]);
        let (_, result) = exchange(&mut board, WireOrder::BigEndian, request, 0).await;
        result.unwrap();
        let mut offsets = GradientOffsets::default();
        offsets.set(GradientAxis::Y, -0.25);
        assert_eq!(
            board.gradients(),
            &GradientWaveforms::state(OutputState::OffsetEnabled, &offsets)
        );
        // the unknown axis still rewrites all four axes
        assert_eq!(board.events().len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn projection() {
        let mut board = SimulatedBoard::recording();
        let command = Command::Projection { axis: 0 };
        let (data, result) = exchange(
            &mut board,
            WireOrder::BigEndian,
            words(&[command]),
            BURST_BYTES,
        )
        .await;
        result.unwrap();
        assert_eq!(data.len(), BURST_BYTES);
        assert_eq!(&board.program()[..PROJECTION_PROGRAM.len()], &PROJECTION_PROGRAM);
        assert_eq!(
            board.snapshots(),
            &[GradientWaveforms::projection(
                PROJECTION_AMPLITUDE,
                GradientAxis::X,
                &GradientOffsets::default()
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn projection_unknown_axis() {
        let mut board = SimulatedBoard::recording();
        let command = Command::Projection { axis: 3 };
        let (data, result) = exchange(
            &mut board,
            WireOrder::BigEndian,
            words(&[command]),
            BURST_BYTES,
        )
        .await;
        result.unwrap();
        assert_eq!(data.len(), BURST_BYTES);
        assert_eq!(board.snapshots(), &[GradientWaveforms::cleared()]);
    }

    #[tokio::test(start_paused = true)]
    async fn ignored_commands() {
        let mut board = SimulatedBoard::recording();
        let mut request = words(&[Command::Noop]);
        request.extend_from_slice(&0x9000_0123u32.to_be_bytes());
        let (_, result) = exchange(&mut board, WireOrder::BigEndian, request, 0).await;
        result.unwrap();
        assert!(board.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn truncated_command() {
        let mut board = SimulatedBoard::recording();
        let mut request = words(&[Command::SetAttenuation { quarter_db: 40 }]);
        request.extend_from_slice(&[0x10, 0x00]);
        let (_, result) = exchange(&mut board, WireOrder::BigEndian, request, 0).await;
        assert!(result.is_err());
        assert_eq!(board.events(), &[Event::Attenuation(40)]);
    }

    // Reads from a buffer and fails every write.
    struct BrokenPipe(std::io::Cursor<Vec<u8>>);

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut task::Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl ChunkSink for BrokenPipe {
        async fn send_chunk(&mut self, _chunk: &[u8], _more: bool) -> Result<()> {
            Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_ends_session_with_sequencer_halted() {
        let mut board = SimulatedBoard::recording();
        let request = words(&[Command::Acquire, Command::SetAttenuation { quarter_db: 40 }]);
        let mut stream = BrokenPipe(std::io::Cursor::new(request));
        let result = Session::new(&mut board, WireOrder::BigEndian)
            .run(&mut stream)
            .await;
        assert!(result.is_err());
        assert_eq!(board.sequencer(), SequencerState::Halt);
        assert_eq!(
            board.events(),
            &[
                Event::Sequencer(SequencerState::Run),
                Event::Sequencer(SequencerState::Halt),
            ]
        );
    }
}
