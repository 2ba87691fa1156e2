//! eBPF program loading and tracepoint attachment

use aya::programs::TracePoint;
use aya::{Ebpf, EbpfLoader};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::capture::SessionCaptureConfig;
use crate::{btf, CaptureError};

/// Program names equal tracepoint names; all live under syscalls/
pub static SYSCALL_TRACEPOINTS: &[&str] = &[
    "sys_enter_accept",
    "sys_exit_accept",
    "sys_exit_clone",
    "sys_enter_execve",
    "sys_enter_execveat",
    "sys_enter_exit_group",
    "sys_enter_write",
    "sys_enter_read",
    "sys_exit_read",
    "sys_enter_openat",
];

/// Where the compiled trace object is looked for when the config does not
/// pin a path. The last entries cover running from a source checkout.
static BYTECODE_CANDIDATES: &[&str] = &[
    "/usr/lib/sshtrail/sshtrail-trace",
    "/usr/local/lib/sshtrail/sshtrail-trace",
    "ebpf/target/bpfel-unknown-none/release/sshtrail-trace",
    "ebpf/target/bpfel-unknown-none/debug/sshtrail-trace",
];

/// Load the trace object, parameterize it with the task_struct offsets,
/// and attach every tracepoint. Any failure here is fatal for the capture.
pub fn load_probes(config: &SessionCaptureConfig) -> Result<Ebpf, CaptureError> {
    bump_memlock_rlimit();

    let path = resolve_bytecode(config)?;
    info!("loading bpf object from {}", path.display());
    let bytes = fs::read(&path).map_err(|source| CaptureError::BytecodeRead {
        path: path.clone(),
        source,
    })?;

    let task_offsets = btf::task_field_offsets()?;

    let mut ebpf = EbpfLoader::new()
        .set_global("TASK_OFFSETS", &task_offsets, true)
        .load(&bytes)?;

    for &name in SYSCALL_TRACEPOINTS {
        let program: &mut TracePoint = ebpf
            .program_mut(name)
            .ok_or(CaptureError::MissingProgram(name))?
            .try_into()?;
        program.load()?;
        program.attach("syscalls", name)?;
        debug!("attached tracepoint syscalls/{name}");
    }

    Ok(ebpf)
}

fn resolve_bytecode(config: &SessionCaptureConfig) -> Result<PathBuf, CaptureError> {
    if let Some(path) = &config.bytecode_path {
        return Ok(path.clone());
    }

    for candidate in BYTECODE_CANDIDATES {
        if Path::new(candidate).exists() {
            return Ok(PathBuf::from(candidate));
        }
    }

    Err(CaptureError::BytecodeNotFound(
        BYTECODE_CANDIDATES.iter().map(PathBuf::from).collect(),
    ))
}

/// Pre-5.11 kernels charge map memory against RLIMIT_MEMLOCK
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }
}
