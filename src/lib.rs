//! CAN Boot Loader host.
//!
//! Talks to a resident boot loader over CAN using 29-bit identifiers of the
//! form `0x1B007100 + (board << 4) + command`. Every command is answered with
//! a single 8 byte REPORT, and the host never has more than one command in
//! flight.

use core::fmt;
use core::marker::PhantomData;

#[macro_use]
extern crate log;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;

pub mod crc;
pub mod image;
pub mod protocol;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(test)]
mod sim;

use crc::Crc16;
use image::{Firmware, HexImage, ImageError, Padding};
use protocol::{
    arbitration_id, command_code, Board, Command, Report, ReportKind, Version, CHUNK_LEN,
    EXTENDED_ID_MAX, HEALTH_OK, LOAD_OK, REPORT_LEN,
};

/// A CAN interface able to exchange frames with the boot loader.
///
/// Both operations are non-blocking, waiting for a reply is handled by the
/// [`Loader`].
pub trait CanChannel<E> {
    /// Queue a frame for transmission
    fn transmit(&mut self, frame: &Frame) -> nb::Result<(), E>;

    /// Fetch the next received frame, `WouldBlock` if none is waiting
    fn receive(&mut self) -> nb::Result<Frame, E>;
}

/// A CAN2.0 data frame
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Frame {
    id: u32,
    extended: bool,
    len: u8,
    data: [u8; 8],
}

impl Frame {
    /// Create an extended (29-bit) frame, `None` if the identifier or data
    /// length are out of range
    pub fn new(id: u32, data: &[u8]) -> Option<Self> {
        Self::build(id, true, data, EXTENDED_ID_MAX)
    }

    /// Create a standard (11-bit) frame
    pub fn new_standard(id: u32, data: &[u8]) -> Option<Self> {
        Self::build(id, false, data, 0x7FF)
    }

    fn build(id: u32, extended: bool, data: &[u8], max: u32) -> Option<Self> {
        if id > max || data.len() > 8 {
            return None;
        }

        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            extended,
            len: data.len() as u8,
            data: buf,
        })
    }

    /// Command frame for a board.
    ///
    /// Panics if `payload` is longer than 8 bytes.
    fn command(board: Board, command: Command, payload: &[u8]) -> Self {
        assert!(payload.len() <= 8);

        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(payload);
        Self {
            id: arbitration_id(board, command),
            extended: true,
            len: payload.len() as u8,
            data,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn dlc(&self) -> usize {
        self.len as usize
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Boot loader report carried by this frame, if it is one
    pub fn report(&self) -> Option<Report> {
        if self.extended && command_code(self.id) == Command::Report.code() {
            Report::parse(self.data())
        } else {
            None
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "Frame(0x{:08X} [{}])", self.id, hex::encode(self.data()))
        } else {
            write!(f, "Frame(0x{:03X} [{}])", self.id, hex::encode(self.data()))
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Idle,
    Starting,
    Transferring,
    Finishing,
    Succeeded,
    Failed,
}

/// Protocol step awaiting a report, used in error reporting
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Step {
    Ping,
    Start,
    Data { offset: usize },
    Stop,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Ping => write!(f, "PING"),
            Step::Start => write!(f, "START"),
            Step::Data { offset } => write!(f, "DATA at 0x{:04X}", offset),
            Step::Stop => write!(f, "STOP"),
        }
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<CanError: fmt::Debug> {
    #[error("CAN channel error: {0:?}")]
    Can(CanError),

    #[error(transparent)]
    Image(ImageError),

    #[error("no {expected} report after {step}")]
    Timeout { step: Step, expected: ReportKind },

    #[error("expected {expected} report after {step}, received {actual:?}")]
    Mismatch {
        step: Step,
        expected: ReportKind,
        actual: Report,
    },

    #[error("{step} answered by 0x{id:08X}, expected 0x{expected:08X}")]
    Sender { step: Step, expected: u32, id: u32 },

    #[error("target indicates load error (status {status})")]
    TargetFailure { status: u8 },

    #[error("unexpected message 0x{id:08X} was not a REPORT ({code})")]
    UnexpectedFrame { id: u32, code: u8 },

    #[error("REPORT with {len} bytes, expected {}", REPORT_LEN)]
    ShortReport { len: usize },
}

impl<CanError: fmt::Debug> Error<CanError> {
    /// Process exit code for this kind of failure
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Can(_) => 2,
            Error::Image(_) => 3,
            Error::Timeout { .. } => 4,
            Error::Mismatch { .. } | Error::Sender { .. } | Error::ShortReport { .. } => 5,
            Error::TargetFailure { .. } => 6,
            Error::UnexpectedFrame { .. } => 7,
        }
    }
}

impl<CanError: fmt::Debug> From<ImageError> for Error<CanError> {
    fn from(e: ImageError) -> Self {
        Error::Image(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for each boot loader report
    #[cfg_attr(
        feature = "structopt",
        structopt(long, global = true, default_value = "100")
    )]
    pub response_timeout_ms: u32,

    /// Period to poll for boot loader reports
    #[cfg_attr(
        feature = "structopt",
        structopt(long, global = true, default_value = "1")
    )]
    pub poll_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 100,
            poll_delay_ms: 1,
        }
    }
}

/// Reply to a PING
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct PingInfo {
    pub board: Board,
    pub version: Version,
    pub health: u8,
    pub report: Report,
}

impl PingInfo {
    pub fn is_healthy(&self) -> bool {
        self.health == HEALTH_OK
    }
}

impl fmt::Display for PingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Board ID: {}", self.board.id())?;
        writeln!(f, "Version:  {}", self.version)?;
        writeln!(
            f,
            "Status:   {}",
            if self.is_healthy() { "OK" } else { "Err" }
        )?;
        write!(
            f,
            "payload 5/6: {:02X} {:02X}",
            self.report.status(),
            self.report.spare()
        )
    }
}

/// Outcome of probing one board address
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ScanStatus {
    /// Correct PONG from the expected address
    Ok(Report),
    /// Something answered, but not with a valid PONG
    Invalid(Frame),
    NoResponse,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct ScanEntry {
    pub board: Board,
    pub status: ScanStatus,
}

impl fmt::Display for ScanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            ScanStatus::Ok(r) => write!(f, "{} ... OK (version {})", self.board, r.version()),
            ScanStatus::Invalid(frame) => write!(f, "{} ... err {:?}", self.board, frame),
            ScanStatus::NoResponse => write!(f, "{} ... no response", self.board),
        }
    }
}

/// Result of a verified load
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct LoadSummary {
    /// Padded length announced by START
    pub length: usize,
    pub crc: u16,
}

impl fmt::Display for LoadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "len={:04X} crc={:04X}", self.length, self.crc)
    }
}

/// Progress of one load, discarded when the load ends
struct Session<'a> {
    board: Board,
    firmware: &'a Firmware,
    crc: Crc16,
    offset: usize,
}

pub struct Loader<C, D, E> {
    state: State,
    options: Options,
    can: C,
    delay: D,
    discarded: usize,
    _err: PhantomData<E>,
}

impl<C, D, E> Loader<C, D, E>
where
    C: CanChannel<E>,
    D: DelayMs<u32>,
    E: fmt::Debug,
{
    /// Create a new loader instance
    pub fn new(can: C, delay: D, options: Options) -> Self {
        Self {
            state: State::Idle,
            options,
            can,
            delay,
            discarded: 0,
            _err: PhantomData,
        }
    }

    /// Fetch the state of the most recent load
    pub fn state(&self) -> State {
        self.state
    }

    /// Number of received frames dropped while waiting for reports
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    pub fn channel(&self) -> &C {
        &self.can
    }

    /// Release the underlying channel
    pub fn into_inner(self) -> C {
        self.can
    }

    /// Query a single boot loader for its version and health
    pub fn ping(&mut self, board: Board) -> Result<PingInfo, Error<E>> {
        self.send(board, Command::Ping, &[])?;

        let frame = self.receive()?.ok_or(Error::Timeout {
            step: Step::Ping,
            expected: ReportKind::Pong,
        })?;

        let code = command_code(frame.id());
        if !frame.is_extended() || code != Command::Report.code() {
            return Err(Error::UnexpectedFrame {
                id: frame.id(),
                code,
            });
        }

        let report = Report::parse(frame.data()).ok_or(Error::ShortReport { len: frame.dlc() })?;

        Ok(PingInfo {
            board,
            version: report.version(),
            health: report.health(),
            report,
        })
    }

    /// Probe every board address, collecting the results
    pub fn scan(&mut self) -> Result<Vec<ScanEntry>, Error<E>> {
        let mut entries = Vec::new();
        self.scan_with(|e| entries.push(*e))?;
        Ok(entries)
    }

    /// Probe every board address, handing each result over as it arrives
    pub fn scan_with<F: FnMut(&ScanEntry)>(&mut self, mut f: F) -> Result<(), Error<E>> {
        for board in Board::all() {
            let entry = self.probe(board)?;
            f(&entry);
        }
        Ok(())
    }

    fn probe(&mut self, board: Board) -> Result<ScanEntry, Error<E>> {
        self.send(board, Command::Ping, &[])?;

        let status = match self.receive()? {
            None => ScanStatus::NoResponse,
            Some(frame) => match frame.report() {
                Some(r)
                    if frame.id() == arbitration_id(board, Command::Report)
                        && r.kind() == ReportKind::Pong =>
                {
                    ScanStatus::Ok(r)
                }
                _ => ScanStatus::Invalid(frame),
            },
        };

        debug!("Board {}: {:?}", board, status);
        Ok(ScanEntry { board, status })
    }

    /// Check and pad a hex image, then load it
    pub fn load_image(
        &mut self,
        board: Board,
        image: HexImage,
        padding: Padding,
    ) -> Result<LoadSummary, Error<E>> {
        match Firmware::from_hex(image, padding) {
            Ok(firmware) => self.load(board, &firmware),
            Err(e) => {
                error!("Image rejected: {}", e);
                self.state = State::Failed;
                Err(e.into())
            }
        }
    }

    /// Load a firmware image onto a board
    pub fn load(&mut self, board: Board, firmware: &Firmware) -> Result<LoadSummary, Error<E>> {
        self.load_with_progress(board, firmware, |_, _| ())
    }

    /// Load a firmware image, calling `progress(offset, length)` after every
    /// acknowledged chunk
    pub fn load_with_progress<F>(
        &mut self,
        board: Board,
        firmware: &Firmware,
        mut progress: F,
    ) -> Result<LoadSummary, Error<E>>
    where
        F: FnMut(usize, usize),
    {
        let mut session = Session {
            board,
            firmware,
            crc: Crc16::new(),
            offset: 0,
        };

        let result = self.run_session(&mut session, &mut progress);
        match &result {
            Ok(summary) => {
                info!("Load complete: {}", summary);
                self.state = State::Succeeded;
            }
            Err(e) => {
                error!("Load aborted at offset 0x{:04X}: {}", session.offset, e);
                self.state = State::Failed;
            }
        }
        result
    }

    fn run_session(
        &mut self,
        session: &mut Session<'_>,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<LoadSummary, Error<E>> {
        let board = session.board;
        let len = session.firmware.len();

        // Firmware guarantees a non-empty image of whole chunks within u16
        debug_assert!(len > 0 && len % CHUNK_LEN == 0 && len <= u16::MAX as usize);

        self.state = State::Starting;
        info!("Starting load of {} bytes to board {}", len, board);

        self.send(board, Command::Start, &(len as u16).to_le_bytes())?;
        self.expect_report(board, Step::Start, ReportKind::Ready)?;

        self.state = State::Transferring;
        for chunk in session.firmware.chunks() {
            let step = Step::Data {
                offset: session.offset,
            };

            session.crc.update_slice(chunk);
            self.send(board, Command::Data, chunk)?;

            let expected = if session.offset + CHUNK_LEN == len {
                ReportKind::End
            } else {
                ReportKind::Ready
            };
            self.expect_report(board, step, expected)?;

            session.offset += CHUNK_LEN;
            progress(session.offset, len);
        }

        self.state = State::Finishing;
        let crc = session.crc.value();
        debug!("Sending STOP with CRC 0x{:04X}", crc);

        self.send(board, Command::Stop, &crc.to_le_bytes())?;
        let report = self.expect_report(board, Step::Stop, ReportKind::Done)?;

        if report.status() != LOAD_OK {
            return Err(Error::TargetFailure {
                status: report.status(),
            });
        }

        Ok(LoadSummary { length: len, crc })
    }

    fn send(&mut self, board: Board, command: Command, payload: &[u8]) -> Result<(), Error<E>> {
        let frame = Frame::command(board, command, payload);
        debug!("TX {:?} {:?}", command, frame);

        nb::block!(self.can.transmit(&frame)).map_err(Error::Can)
    }

    /// Wait up to the response timeout for the next frame
    fn receive(&mut self) -> Result<Option<Frame>, Error<E>> {
        let poll = self.options.poll_delay_ms.max(1);
        let mut t = 0;

        loop {
            match self.can.receive() {
                Ok(frame) => {
                    debug!("RX {:?}", frame);
                    return Ok(Some(frame));
                }
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(Error::Can(e)),
            }

            if t >= self.options.response_timeout_ms {
                debug!("Receive timeout");
                return Ok(None);
            }

            self.delay.delay_ms(poll);
            t += poll;
        }
    }

    /// Wait for a report. Any other frame is dropped and treated as no reply.
    fn read_report(&mut self) -> Result<Option<(u32, Report)>, Error<E>> {
        let frame = match self.receive()? {
            Some(f) => f,
            None => return Ok(None),
        };

        match frame.report() {
            Some(r) => Ok(Some((frame.id(), r))),
            None => {
                warn!("Discarding non-report frame {:?}", frame);
                self.discarded += 1;
                Ok(None)
            }
        }
    }

    fn expect_report(
        &mut self,
        board: Board,
        step: Step,
        expected: ReportKind,
    ) -> Result<Report, Error<E>> {
        let (id, r) = match self.read_report()? {
            Some(v) => v,
            None => return Err(Error::Timeout { step, expected }),
        };

        let reply_id = arbitration_id(board, Command::Report);
        if id != reply_id {
            return Err(Error::Sender {
                step,
                expected: reply_id,
                id,
            });
        }

        if r.kind() != expected {
            if r.kind() == ReportKind::Err {
                warn!("Target rejected command {} after {}", r.status(), step);
            }
            return Err(Error::Mismatch {
                step,
                expected,
                actual: r,
            });
        }

        Ok(r)
    }
}
