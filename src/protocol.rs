//! Boot loader wire protocol: identifiers, command codes and report layout.

use core::convert::TryFrom;
use core::fmt;

/// Base of every boot loader identifier, board and command fields cleared
pub const BASE_ID: u32 = 0x1B00_7100;

/// Mask of the fields the target matches on (everything but the command)
pub const ID_MASK: u32 = 0x1FFF_FFF0;

/// Largest valid 29-bit extended identifier
pub const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;

/// Number of addressable boards on one bus
pub const BOARD_COUNT: u8 = 16;

/// Payload bytes carried by a single DATA command
pub const CHUNK_LEN: usize = 8;

/// Every report from the target carries exactly this many bytes
pub const REPORT_LEN: usize = 8;

/// Board identifier, set on the target by its ID encoder.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Board(u8);

impl Board {
    /// Create a board address, `None` if it does not fit in 4 bits
    pub fn new(id: u8) -> Option<Self> {
        if id < BOARD_COUNT {
            Some(Self(id))
        } else {
            None
        }
    }

    pub fn id(&self) -> u8 {
        self.0
    }

    /// Iterate over every address on the bus, lowest first
    pub fn all() -> impl Iterator<Item = Board> {
        (0..BOARD_COUNT).map(Board)
    }
}

impl TryFrom<u8> for Board {
    type Error = u8;

    fn try_from(id: u8) -> Result<Self, u8> {
        Board::new(id).ok_or(id)
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// Command codes, carried in the low 4 bits of the identifier.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Command {
    /// Check for boot loader presence
    Ping = 0,

    /// Reset the target. Defined by the boot loader but not implemented there.
    Reboot = 1,

    /// Begin a load, payload is the image length (u16, little endian)
    Start = 2,

    /// Eight bytes of image data
    Data = 3,

    /// Finish a load, payload is the image CRC (u16, little endian)
    Stop = 4,

    /// Reply from the boot loader to every command
    Report = 5,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Command::Ping),
            1 => Some(Command::Reboot),
            2 => Some(Command::Start),
            3 => Some(Command::Data),
            4 => Some(Command::Stop),
            5 => Some(Command::Report),
            _ => None,
        }
    }
}

/// Compute the extended identifier for a board / command pair
pub fn arbitration_id(board: Board, command: Command) -> u32 {
    BASE_ID + ((board.0 as u32) << 4) + command.code() as u32
}

/// Extract the command code from an identifier
pub fn command_code(id: u32) -> u8 {
    (id & 0x0F) as u8
}

/// Extract the board address from an identifier, `None` if it is not a boot
/// loader identifier at all
pub fn board_of(id: u32) -> Option<Board> {
    if id & 0x1FFF_FF00 == BASE_ID {
        Board::new(((id >> 4) & 0x0F) as u8)
    } else {
        None
    }
}

/// Report type, byte 4 of every report.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ReportKind {
    /// Reply to PING
    Pong,
    /// Ready for the next DATA block
    Ready,
    /// All blocks announced by START have been received
    End,
    /// Load finished, byte 5 holds the status
    Done,
    /// Imminent reboot (unused by the boot loader)
    Boot,
    /// Bad command or invalid load state, byte 5 holds the command code
    Err,
    /// Anything the boot loader is not known to send
    Other(u8),
}

impl From<u8> for ReportKind {
    fn from(v: u8) -> Self {
        match v {
            0 => ReportKind::Pong,
            1 => ReportKind::Ready,
            2 => ReportKind::End,
            3 => ReportKind::Done,
            4 => ReportKind::Boot,
            5 => ReportKind::Err,
            v => ReportKind::Other(v),
        }
    }
}

impl From<ReportKind> for u8 {
    fn from(k: ReportKind) -> u8 {
        match k {
            ReportKind::Pong => 0,
            ReportKind::Ready => 1,
            ReportKind::End => 2,
            ReportKind::Done => 3,
            ReportKind::Boot => 4,
            ReportKind::Err => 5,
            ReportKind::Other(v) => v,
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportKind::Pong => write!(f, "PONG(0)"),
            ReportKind::Ready => write!(f, "READY(1)"),
            ReportKind::End => write!(f, "END(2)"),
            ReportKind::Done => write!(f, "DONE(3)"),
            ReportKind::Boot => write!(f, "BOOT(4)"),
            ReportKind::Err => write!(f, "ERR(5)"),
            ReportKind::Other(v) => write!(f, "UNKNOWN({})", v),
        }
    }
}

/// Status value in byte 5 of a DONE report for a verified load
pub const LOAD_OK: u8 = 1;

/// Health value in byte 3 of a report for a healthy boot loader
pub const HEALTH_OK: u8 = 1;

/// An 8 byte report from the boot loader.
///
/// | Byte | Content                                  |
/// |------|------------------------------------------|
/// | 0..3 | boot loader version (major, minor, patch) |
/// | 3    | health status, 1 = OK                    |
/// | 4    | report type, see [`ReportKind`]          |
/// | 5    | load status on DONE, command code on ERR |
/// | 6    | spare                                    |
/// | 7    | rolling count of received commands       |
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Report([u8; REPORT_LEN]);

impl Report {
    /// Parse a report payload, `None` unless exactly 8 bytes long
    pub fn parse(data: &[u8]) -> Option<Self> {
        <[u8; REPORT_LEN]>::try_from(data).ok().map(Report)
    }

    pub fn bytes(&self) -> &[u8; REPORT_LEN] {
        &self.0
    }

    pub fn version(&self) -> Version {
        Version {
            major: self.0[0],
            minor: self.0[1],
            patch: self.0[2],
        }
    }

    pub fn health(&self) -> u8 {
        self.0[3]
    }

    pub fn kind(&self) -> ReportKind {
        ReportKind::from(self.0[4])
    }

    /// Byte 5, only meaningful on DONE and ERR reports
    pub fn status(&self) -> u8 {
        self.0[5]
    }

    pub fn spare(&self) -> u8 {
        self.0[6]
    }

    pub fn counter(&self) -> u8 {
        self.0[7]
    }
}

impl fmt::Debug for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Report({} [{}])", self.kind(), hex::encode(self.0))
    }
}

/// Boot loader firmware version
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
