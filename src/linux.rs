use std::fmt::Debug;
use std::io::{Error as IoError, ErrorKind as IoErrorKind};

use linux_embedded_hal::Delay;
use socketcan::{CanFrame, CanInterface, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket};

use crate::{CanChannel, Frame, Loader, Options};

/// Loader on a SocketCAN interface
pub type LinuxLoader = Loader<CanSocket, Delay, IoError>;

/// Default CAN bus bit rate used by the boot loader
pub const DEFAULT_BITRATE: u32 = 250_000;

/// SocketCAN bus configuration
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct CanConfig {
    /// SocketCAN interface to use
    #[cfg_attr(
        feature = "structopt",
        structopt(long, global = true, default_value = "can0")
    )]
    pub interface: String,

    /// CAN bus bit rate
    #[cfg_attr(
        feature = "structopt",
        structopt(short, long, global = true, default_value = "250000")
    )]
    pub rate: u32,

    /// Apply the bit rate to the interface before use (needs CAP_NET_ADMIN)
    #[cfg_attr(feature = "structopt", structopt(long, global = true))]
    pub configure_link: bool,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            interface: "can0".to_string(),
            rate: DEFAULT_BITRATE,
            configure_link: false,
        }
    }
}

impl CanChannel<IoError> for CanSocket {
    fn transmit(&mut self, frame: &Frame) -> nb::Result<(), IoError> {
        let invalid = || nb::Error::Other(IoError::new(IoErrorKind::InvalidInput, "invalid frame"));

        let id = ExtendedId::new(frame.id()).ok_or_else(invalid)?;
        let out = <CanFrame as EmbeddedFrame>::new(id, frame.data()).ok_or_else(invalid)?;

        match self.write_frame(&out) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::WouldBlock => Err(nb::Error::WouldBlock),
            Err(e) => Err(nb::Error::Other(e)),
        }
    }

    fn receive(&mut self) -> nb::Result<Frame, IoError> {
        match self.read_frame() {
            Ok(CanFrame::Data(f)) => {
                let frame = match EmbeddedFrame::id(&f) {
                    Id::Extended(id) => Frame::new(id.as_raw(), EmbeddedFrame::data(&f)),
                    Id::Standard(id) => {
                        Frame::new_standard(id.as_raw() as u32, EmbeddedFrame::data(&f))
                    }
                };
                frame.ok_or(nb::Error::WouldBlock)
            }
            // Remote and error frames never carry reports
            Ok(_) => Err(nb::Error::WouldBlock),
            Err(e) if e.kind() == IoErrorKind::WouldBlock => Err(nb::Error::WouldBlock),
            Err(e) => Err(nb::Error::Other(e)),
        }
    }
}

fn link_error<E: Debug>(e: E) -> IoError {
    IoError::new(IoErrorKind::Other, format!("netlink: {:?}", e))
}

/// Set the interface bit rate, cycling the link so it takes effect
fn configure_link(config: &CanConfig) -> Result<(), IoError> {
    info!(
        "Setting {} bit rate to {} bit/s",
        config.interface, config.rate
    );

    let iface = CanInterface::open(&config.interface).map_err(link_error)?;
    iface.bring_down().map_err(link_error)?;
    iface
        .set_bitrate(config.rate, None::<u32>)
        .map_err(link_error)?;
    iface.bring_up().map_err(link_error)?;

    Ok(())
}

impl LinuxLoader {
    /// Create a new SocketCAN loader instance
    pub fn linux(config: &CanConfig, options: Options) -> Result<Self, IoError> {
        if config.configure_link {
            configure_link(config)?;
        } else {
            debug!(
                "Using {} as configured, expecting {} bit/s",
                config.interface, config.rate
            );
        }

        // Open socket
        let socket = CanSocket::open(&config.interface)?;
        socket.set_nonblocking(true)?;

        // Return instance
        Ok(Self::new(socket, Delay {}, options))
    }
}
