//! Serial-over-PCIe console relay.
//!
//! Monitors config accesses to register 0x200, relays console bytes between
//! the firmware and the local terminal, and injects the completions the
//! firmware is waiting on.

use std::num::NonZeroU32;

use anyhow::Context;
use clap::Parser;
use screamer_cli::console::completion_for;
use screamer_cli::netdump::NetDump;
use screamer_cli::term::{RawModeGuard, TerminalConsole};
use screamer_cli::wire_bytes;
use screamer_fpga::{Ft60xDevice, Session};
use screamer_frame::{EmptyReadPolicy, TlpEvent};
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sac", about = "Firmware console relay over a PCIe capture device")]
struct Args {
    /// Index of the FT60x device to open.
    #[arg(short = 'n', long = "device", default_value_t = 0)]
    device: usize,
    /// Verbose diagnostics on stderr.
    #[arg(short, long)]
    verbose: bool,
    /// Forward corrupt TLP dumps to this UDP sink (addr:port).
    #[arg(long)]
    dump: Option<String>,
    /// Give up after this many consecutive empty reads mid-TLP.
    #[arg(long)]
    stall_limit: Option<NonZeroU32>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let dump = match &args.dump {
        Some(addr) => Some(
            NetDump::connect(addr.as_str())
                .with_context(|| format!("connecting UDP sink {addr}"))?,
        ),
        None => None,
    };

    let device = Ft60xDevice::open(args.device).context("opening FT60x device")?;
    let mut session = Session::new(device);
    if let Some(limit) = args.stall_limit {
        session = session.with_empty_read_policy(EmptyReadPolicy::FailAfter(limit));
    }
    session.init().context("FPGA init failed")?;

    let _raw = RawModeGuard::enable().context("entering raw terminal mode")?;
    let mut console = TerminalConsole::default();

    loop {
        match session.receive_tlp().context("receiving TLP stream")? {
            TlpEvent::NoData => {}
            TlpEvent::OutOfSync => debug!("FPGA out of sync"),
            TlpEvent::Corrupt { words, expected } => {
                warn!(expected, actual = words.len(), "corrupt TLP received");
                if let Some(dump) = &dump {
                    dump.dump(&wire_bytes(&words));
                }
            }
            TlpEvent::Complete(words) => {
                if let Some(cpl) = completion_for(&words, &mut console) {
                    if let Err(err) = session.send_tlp(&cpl) {
                        error!(%err, "failed to send completion");
                    }
                }
            }
        }
    }
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
