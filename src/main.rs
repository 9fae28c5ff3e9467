use std::io::Error as IoError;
use std::path::PathBuf;

#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use indicatif::{ProgressBar, ProgressStyle};

use can_boot_loader::image::{Firmware, HexImage, Padding};
use can_boot_loader::linux::{CanConfig, LinuxLoader};
use can_boot_loader::protocol::Board;
use can_boot_loader::{Error, Options};

type LoaderError = Error<IoError>;

#[derive(Clone, Debug, StructOpt)]
#[structopt(about = "CAN Firmware Loader")]
pub struct Args {
    #[structopt(subcommand)]
    command: Operation,

    #[structopt(flatten)]
    can: CanConfig,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    /// Turn on debug output
    #[structopt(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Scan for boot loaders on every board address
    Scan,

    /// Query the boot loader on one board
    Ping {
        /// Board ID of target (0-15)
        #[structopt(short, long, parse(try_from_str = parse_board))]
        board: Board,
    },

    /// Upload an Intel hex image to one board
    Load {
        /// Board ID of target (0-15)
        #[structopt(short, long, parse(try_from_str = parse_board))]
        board: Board,

        /// File to upload
        #[structopt(short, long)]
        file: PathBuf,

        /// Padding policy for images not a multiple of 8 bytes (align, full-block)
        #[structopt(long, default_value = "align")]
        padding: Padding,
    },
}

fn parse_board(s: &str) -> Result<Board, String> {
    let id: u8 = s.parse().map_err(|e| format!("{}", e))?;
    Board::new(id).ok_or_else(|| format!("board ID {} out of range (0-15)", id))
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let level = if o.verbose {
        LevelFilter::Debug
    } else {
        o.log_level
    };
    let _ = SimpleLogger::init(level, Config::default());

    if let Err(e) = run(o) {
        println!("ERR: {}", e);

        let code = e.downcast_ref::<LoaderError>().map_or(1, |e| e.exit_code());
        std::process::exit(code);
    }
}

fn run(o: Args) -> anyhow::Result<()> {
    let Args {
        command,
        can,
        options,
        ..
    } = o;

    match command {
        Operation::Scan => {
            let mut l = connect(&can, options)?;

            println!("Scanning for CAN boot loaders");
            l.scan_with(|entry| println!("{}", entry))?;
        }
        Operation::Ping { board } => {
            let mut l = connect(&can, options)?;

            let info = l.ping(board)?;
            println!("{}", info);
        }
        Operation::Load {
            board,
            file,
            padding,
        } => {
            // Check the image before touching the bus
            let image = HexImage::load(&file).map_err(LoaderError::from)?;
            let firmware = Firmware::from_hex(image, padding).map_err(LoaderError::from)?;

            println!(
                "original image length: {} ({})",
                firmware.original_len(),
                bytefmt::format(firmware.original_len() as u64)
            );
            println!("new image len: {}", firmware.len());

            let mut l = connect(&can, options)?;

            let pb = ProgressBar::new(firmware.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{bar:40.cyan/blue} {bytes}/{total_bytes} {elapsed}"),
            );

            let result = l.load_with_progress(board, &firmware, |offset, _| {
                pb.set_position(offset as u64)
            });

            match result {
                Ok(summary) => {
                    pb.finish();
                    println!("Load complete with success indication from target");
                    println!("{}", summary);
                }
                Err(e) => {
                    pb.abandon();
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}

fn connect(can: &CanConfig, options: Options) -> anyhow::Result<LinuxLoader> {
    info!("Opening CAN interface {}", can.interface);

    match LinuxLoader::linux(can, options) {
        Ok(l) => Ok(l),
        Err(e) => {
            error!("Error opening CAN interface {}: {:?}", can.interface, e);
            Err(e.into())
        }
    }
}
