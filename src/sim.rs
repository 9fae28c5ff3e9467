//! Simulated boot loader targets sharing one bus, for tests.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;

use crate::crc::Crc16;
use crate::protocol::{arbitration_id, command_code, Board, Command, ReportKind, ID_MASK};
use crate::{CanChannel, Frame};

/// Flash page size of the target, a page is burned whenever one fills
const PAGE_SIZE: u16 = 128;

/// Virtual time source, advanced only by the loader's delays
#[derive(Clone, Default)]
pub struct Clock(Rc<Cell<u64>>);

impl Clock {
    pub fn elapsed(&self) -> u64 {
        self.0.get()
    }
}

impl DelayMs<u32> for Clock {
    fn delay_ms(&mut self, ms: u32) {
        self.0.set(self.0.get() + ms as u64);
    }
}

/// One boot loader, modelled on the target firmware's message handling
pub struct SimTarget {
    board: Board,
    report: [u8; 8],
    rx_count: u8,

    load_addr: u16,
    load_len: u16,
    crc: Crc16,
    flash: Vec<u8>,
    stored: Option<(u16, u16)>,

    commands: usize,
    drop_reply: Option<usize>,
    replace_reply: Option<(usize, Frame)>,
    override_length: Option<u16>,
    corrupt_crc: bool,
}

impl SimTarget {
    pub fn new(board: Board) -> Self {
        Self {
            board,
            // development version placeholder, healthy
            report: [0x63, 0x63, 0x63, 1, 0, 0, 0, 0],
            rx_count: 0,
            load_addr: 0,
            load_len: 0,
            crc: Crc16::new(),
            flash: Vec::new(),
            stored: None,
            commands: 0,
            drop_reply: None,
            replace_reply: None,
            override_length: None,
            corrupt_crc: false,
        }
    }

    pub fn version(mut self, major: u8, minor: u8, patch: u8) -> Self {
        self.report[..3].copy_from_slice(&[major, minor, patch]);
        self
    }

    /// Process the n-th command (from 0) but stay silent
    pub fn drop_reply(mut self, n: usize) -> Self {
        self.drop_reply = Some(n);
        self
    }

    /// Answer the n-th command with `frame` instead of a report
    pub fn replace_reply(mut self, n: usize, frame: Frame) -> Self {
        self.replace_reply = Some((n, frame));
        self
    }

    /// Ignore the length in START and use this one
    pub fn override_length(mut self, len: u16) -> Self {
        self.override_length = Some(len);
        self
    }

    /// Accumulate a wrong CRC so the final check fails
    pub fn corrupt_crc(mut self) -> Self {
        self.corrupt_crc = true;
        self
    }

    /// Bytes written by the most recent load
    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    /// Length and CRC saved after a verified load
    pub fn stored(&self) -> Option<(u16, u16)> {
        self.stored
    }

    fn accepts(&self, id: u32) -> bool {
        id & ID_MASK == arbitration_id(self.board, Command::Ping) & ID_MASK
    }

    fn handle(&mut self, frame: &Frame) -> Option<Frame> {
        let n = self.commands;
        self.commands += 1;

        self.process(command_code(frame.id()), frame.data());

        if self.drop_reply == Some(n) {
            return None;
        }
        if let Some((m, f)) = self.replace_reply {
            if m == n {
                return Some(f);
            }
        }
        Frame::new(arbitration_id(self.board, Command::Report), &self.report)
    }

    fn process(&mut self, code: u8, msg: &[u8]) {
        self.report[5] = 0;
        self.report[6] = 0;
        self.rx_count = self.rx_count.wrapping_add(1);
        self.report[7] = self.rx_count;

        match Command::from_code(code) {
            Some(Command::Ping) => self.report[4] = ReportKind::Pong.into(),
            Some(Command::Start) => {
                self.crc = Crc16::new();
                self.load_addr = 0;
                self.load_len = self
                    .override_length
                    .unwrap_or_else(|| u16::from_le_bytes([msg[0], msg[1]]));
                self.flash.clear();
                self.report[4] = ReportKind::Ready.into();
            }
            Some(Command::Data) => {
                if self.load_addr < self.load_len {
                    self.flash.extend_from_slice(&msg[..8]);
                    self.crc.update_slice(&msg[..8]);
                    if self.corrupt_crc {
                        self.crc = Crc16::from_value(self.crc.value() ^ 1);
                    }
                    self.load_addr += 8;

                    if self.load_addr >= self.load_len || self.load_addr % PAGE_SIZE == 0 {
                        self.report[4] = if self.load_addr < self.load_len {
                            ReportKind::Ready.into()
                        } else {
                            ReportKind::End.into()
                        };
                    }
                } else {
                    self.report[4] = ReportKind::Err.into();
                }
            }
            Some(Command::Stop) => {
                let verify = u16::from_le_bytes([msg[0], msg[1]]);
                if verify == self.crc.value() {
                    self.report[5] = 1;
                    self.stored = Some((self.load_len, verify));
                }
                self.report[4] = ReportKind::Done.into();
            }
            _ => {
                self.report[4] = ReportKind::Err.into();
                self.report[5] = code;
            }
        }
    }
}

/// A bus of simulated targets. Replies are queued as soon as a command is
/// transmitted.
pub struct SimBus {
    targets: Vec<SimTarget>,
    inbox: VecDeque<Frame>,
    sent: Vec<Frame>,
    fail_transmit: bool,
}

impl SimBus {
    pub fn new(targets: Vec<SimTarget>) -> Self {
        Self {
            targets,
            inbox: VecDeque::new(),
            sent: Vec::new(),
            fail_transmit: false,
        }
    }

    /// Make every transmission fail
    pub fn fail_transmit(&mut self) {
        self.fail_transmit = true;
    }

    pub fn targets(&self) -> &[SimTarget] {
        &self.targets
    }

    /// Frames transmitted by the host, in order
    pub fn sent(&self) -> &[Frame] {
        &self.sent
    }
}

impl CanChannel<()> for SimBus {
    fn transmit(&mut self, frame: &Frame) -> nb::Result<(), ()> {
        if self.fail_transmit {
            return Err(nb::Error::Other(()));
        }

        self.sent.push(*frame);
        for t in self.targets.iter_mut().filter(|t| t.accepts(frame.id())) {
            if let Some(reply) = t.handle(frame) {
                self.inbox.push_back(reply);
            }
        }
        Ok(())
    }

    fn receive(&mut self) -> nb::Result<Frame, ()> {
        self.inbox.pop_front().ok_or(nb::Error::WouldBlock)
    }
}
