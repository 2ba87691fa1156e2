//! sshtrail - SSH session activity monitor
//!
//! Polls the capture library and prints one JSON event per line.

use clap::Parser;
use sshtrail_capture_ebpf::{SessionCapture, SessionCaptureConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const POLL_TIMEOUT: Duration = Duration::from_millis(15);

#[derive(Parser)]
#[command(name = "sshtrail")]
#[command(version)]
#[command(about = "SSH session activity monitor", long_about = None)]
struct Cli {
    /// Enable debug output
    #[arg(long)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let capture = SessionCapture::new(SessionCaptureConfig::default());
    if !capture.is_ok() {
        anyhow::bail!("session capture failed to start; check privileges and log output");
    }

    while running.load(Ordering::SeqCst) && capture.is_ok() {
        if let Some(json) = capture.poll(POLL_TIMEOUT) {
            println!("{json}");
        }
    }

    Ok(())
}
