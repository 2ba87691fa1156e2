//! Linux eBPF capture and session correlation for sshtrail
//!
//! Loads the tracepoint programs, seeds them with sessions that predate the
//! agent, enriches kernel-observed sessions from /proc, watches the
//! failed-login log, and hands finished JSON lines to the consumer through
//! a blocking poll interface.

use std::path::PathBuf;
use thiserror::Error;

mod btf;
mod capture;
mod failed_login;
mod loader;
pub mod proc;

pub use capture::{SessionCapture, SessionCaptureConfig};

/// Errors that keep the capture from starting. Everything after a
/// successful start degrades in place (logged and suppressed) instead of
/// surfacing here.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("bpf bytecode not found; searched {0:?}")]
    BytecodeNotFound(Vec<PathBuf>),

    #[error("failed to read bpf bytecode from {path}: {source}")]
    BytecodeRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("BTF discovery failed: {0}")]
    Btf(String),

    #[error("program {0} missing from the loaded object")]
    MissingProgram(&'static str),

    #[error("map {0} missing from the loaded object")]
    MissingMap(&'static str),

    #[error(transparent)]
    Load(#[from] aya::EbpfError),

    #[error(transparent)]
    Program(#[from] aya::programs::ProgramError),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
