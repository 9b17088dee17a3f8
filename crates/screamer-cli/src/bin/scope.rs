//! TLP monitor: forwards every reconstructed TLP to a UDP sink and,
//! optionally, a PCAPNG capture file.

use std::fs::File;
use std::io;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::Parser;
use screamer_cli::hexdump::hex_dump;
use screamer_cli::netdump::NetDump;
use screamer_cli::pcapng::Capture;
use screamer_cli::wire_bytes;
use screamer_fpga::{Ft60xDevice, Session};
use screamer_frame::{EmptyReadPolicy, TlpEvent};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scope", about = "Dump captured PCIe TLPs to UDP or a PCAPNG file")]
struct Args {
    /// Index of the FT60x device to open.
    #[arg(short = 'n', long = "device", default_value_t = 0)]
    device: usize,
    /// Hex-dump every TLP to stdout as well.
    #[arg(short, long)]
    verbose: bool,
    /// UDP sink for raw TLP bytes.
    #[arg(long, default_value = "127.0.0.1:9999")]
    remote: String,
    /// Write a PCAPNG capture file (link type USER0).
    #[arg(long)]
    pcap: Option<PathBuf>,
    /// Give up after this many consecutive empty reads mid-TLP.
    #[arg(long)]
    stall_limit: Option<NonZeroU32>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    info!(remote = %args.remote, "UDP sink");
    let dump = NetDump::connect(args.remote.as_str())
        .with_context(|| format!("connecting UDP sink {}", args.remote))?;
    let mut capture = match &args.pcap {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating capture file {}", path.display()))?;
            Some(Capture::create(file).context("writing capture header")?)
        }
        None => None,
    };

    let device = Ft60xDevice::open(args.device).context("opening FT60x device")?;
    let mut session = Session::new(device);
    if let Some(limit) = args.stall_limit {
        session = session.with_empty_read_policy(EmptyReadPolicy::FailAfter(limit));
    }
    session.init().context("FPGA init failed")?;

    loop {
        match session.receive_tlp().context("receiving TLP stream")? {
            TlpEvent::NoData => {}
            TlpEvent::OutOfSync => warn!("missing header"),
            TlpEvent::Corrupt { words, expected } => {
                warn!(expected, actual = words.len(), "bad PCIe TLP received");
                dump.dump(&wire_bytes(&words));
            }
            TlpEvent::Complete(words) => {
                let bytes = wire_bytes(&words);
                if args.verbose {
                    println!("TLP of {:#x} bytes", bytes.len());
                    hex_dump(&mut io::stdout(), &bytes, 16)?;
                }
                dump.dump(&bytes);
                if let Some(capture) = &mut capture {
                    capture
                        .record(timestamp_us(), &bytes)
                        .context("writing capture")?;
                }
            }
        }
    }
}

fn timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}
