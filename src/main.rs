use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use btsixad::adapter::FixedPnp;
use btsixad::addr::BdAddr;
use btsixad::chardev::NullChardev;
use btsixad::host::{Config, Daemon};

/// btsixad — bridge Bluetooth Sixaxis gamepads to HID character devices.
#[derive(Parser)]
#[command(name = "btsixad", version, about)]
struct Cli {
    /// Local adapter address to bind (default: any adapter).
    #[arg(short = 'a', value_name = "BDADDR")]
    address: Option<BdAddr>,

    /// Increase diagnostic verbosity; repeat for per-transaction hex
    /// dumps of interrupt traffic.
    #[arg(short = 'd', action = clap::ArgAction::Count)]
    debug: u8,

    /// Disconnect controllers left unopened for this many seconds
    /// (0 disables the timeout).
    #[arg(short = 't', value_name = "SECONDS", default_value_t = 0)]
    timeout: u64,
}

fn setup_logging(debug: u8) {
    let filter = match debug {
        0 => EnvFilter::new("info"),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    fmt().with_env_filter(filter).with_target(false).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.debug);

    /* A peer can vanish between our poll and our write; the write must
     * come back as EPIPE, not end the process. SAFETY: SIG_IGN for
     * SIGPIPE is always a valid disposition. */
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let config = Config {
        bdaddr: cli.address.unwrap_or(BdAddr::ANY),
        debug: cli.debug,
        idle_timeout: (cli.timeout > 0).then(|| Duration::from_secs(cli.timeout)),
    };

    let daemon = Daemon::new(
        config,
        Box::new(FixedPnp::sixaxis()),
        Arc::new(NullChardev),
    );
    daemon.run()
}
