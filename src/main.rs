#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::fmt::Debug;
use std::path::PathBuf;

use anyhow::Context;
use embedded_hal::blocking::delay::DelayMs;
use indicatif::{ProgressBar, ProgressStyle};

use can_flasher::transport::parse_host;
use can_flasher::{failed_nodes, Destinations, Options, Programmer, State, Transport};

#[derive(Clone, Debug, StructOpt)]
#[structopt(about = "Update firmware on CAN bus nodes through a serial or TCP bridge")]
pub struct Args {
    /// Path to the binary file to upload
    #[structopt(short = "b", long = "binary")]
    binary: PathBuf,

    /// Base address of the firmware, in hex
    #[structopt(short = "a", long, parse(try_from_str = parse_hex))]
    base_address: u32,

    /// Device class to flash
    #[structopt(short = "c", long)]
    device_class: String,

    /// Serial port the CAN bridge is connected to
    #[structopt(short = "p", long, conflicts_with = "tcp", required_unless = "tcp")]
    port: Option<String>,

    /// Use a TCP bridge instead of a serial port (host[:port])
    #[structopt(long)]
    tcp: Option<String>,

    /// Run the application after flashing
    #[structopt(short = "r", long)]
    run: bool,

    /// Device IDs to flash
    #[structopt(name = "DEVICEID", required = true)]
    ids: Vec<u8>,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn parse_hex(s: &str) -> Result<u32, std::num::ParseIntError> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(s, 16)
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    let dests = Destinations::new(o.ids.iter().copied())?;

    let image = std::fs::read(&o.binary)
        .with_context(|| format!("Error reading binary {}", o.binary.display()))?;

    let failed = match (&o.port, &o.tcp) {
        (Some(port), _) => {
            info!("Connecting to serial port {}", port);
            let p = Programmer::linux(port, o.options.clone())
                .map_err(|e| anyhow::anyhow!("Error connecting to serial port: {:?}", e))?;
            session(p, &o, &image, &dests)?
        }
        (None, Some(host)) => {
            let (host, port) = parse_host(host).map_err(anyhow::Error::msg)?;
            info!("Connecting to {}:{}", host, port);
            let p = Programmer::tcp(&host, port, o.options.clone())
                .with_context(|| format!("Error connecting to {}:{}", host, port))?;
            session(p, &o, &image, &dests)?
        }
        (None, None) => anyhow::bail!("One of --port or --tcp is required"),
    };

    if !failed.is_empty() {
        let ids: Vec<String> = failed.iter().map(|id| id.to_string()).collect();
        println!("Verification failed for nodes {}", ids.join(", "));
        std::process::exit(1);
    }

    Ok(())
}

/// Flash, verify and optionally start the nodes, returning the failed ones
fn session<P, D, E>(
    mut p: Programmer<P, D, E>,
    o: &Args,
    image: &[u8],
    dests: &Destinations,
) -> anyhow::Result<Vec<u8>>
where
    P: Transport<E>,
    D: DelayMs<u32>,
    E: Debug + Send + Sync + 'static,
{
    println!(
        "Flashing firmware (size: {})",
        bytefmt::format(image.len() as u64)
    );

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg:>10} [{bar:40}] {pos}/{len}")
            .progress_chars("=> "),
    );

    p.flash_with_progress(image, o.base_address, &o.device_class, dests, |s, done, total| {
        let phase = match s {
            State::Erasing => "erase",
            State::Writing => "write",
            _ => "config",
        };
        pb.set_message(phase);
        pb.set_length(total as u64);
        pb.set_position(done as u64);
    })?;
    pb.finish_and_clear();

    println!("Verifying firmware...");
    let valid = p.check_image(image, o.base_address, dests)?;
    let failed = failed_nodes(dests, &valid);

    if failed.is_empty() {
        println!("OK");

        if o.run {
            p.run_application(dests)?;
        }
    }

    Ok(failed)
}
