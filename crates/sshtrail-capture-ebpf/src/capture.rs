//! Session capture orchestration
//!
//! Construction order matters: pre-existing sessions are scanned and seeded
//! into the kernel map before the probes start observing, so the kernel
//! recognizes their terminal reads from the first event on. After that a
//! single ingest thread owns the ring buffer and the kernel maps, and the
//! failed-login watcher feeds the same queue from the side.

use aya::maps::{HashMap as KernelHashMap, MapData, RingBuf};
use aya::Ebpf;
use crossbeam_channel::{Receiver, Sender};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use sshtrail_core::events::{
    terminal_payload, CommandPhase, CommandSnapshot, ConnectionPhase, ConnectionSnapshot,
    SessionEvent,
};
use sshtrail_core::{EventSerializer, TerminalAggregator};
use sshtrail_trace_common as wire;
use sshtrail_trace_common::{event_type, PID_NONE};
use std::mem::size_of;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::failed_login::FailedLoginWatcher;
use crate::proc::existing::{ExistingSession, ExistingSessionScanner};
use crate::proc::pts::PtsInspector;
use crate::{loader, CaptureError};

/// Ring-buffer poll deadline for the ingest thread
const CHANNEL_POLL_MS: u8 = 50;

const CONNECTIONS_MAP: &str = "CONNECTIONS";
const EVENTS_MAP: &str = "EVENTS";

#[derive(Debug, Clone)]
pub struct SessionCaptureConfig {
    /// Explicit path to the compiled trace object; auto-detected if unset
    pub bytecode_path: Option<PathBuf>,

    /// Failed-login record file
    pub btmp_path: PathBuf,

    /// Root of the proc filesystem (overridable for tests)
    pub proc_root: PathBuf,

    /// Terminal aggregation window in milliseconds
    pub terminal_flush_ms: u64,
}

impl Default for SessionCaptureConfig {
    fn default() -> Self {
        Self {
            bytecode_path: None,
            btmp_path: PathBuf::from("/var/log/btmp"),
            proc_root: PathBuf::from("/proc"),
            terminal_flush_ms: TerminalAggregator::DEFAULT_WINDOW.as_millis() as u64,
        }
    }
}

/// The capture library surface: construct, poll JSON lines, drop.
///
/// A failed start (no privileges, no bytecode, verifier rejection) is
/// latched rather than raised; `is_ok()` reports it and `poll` stays empty.
pub struct SessionCapture {
    rx: Receiver<String>,
    exited: Arc<AtomicBool>,
    ingest: Option<JoinHandle<()>>,
    failed_login: Option<FailedLoginWatcher>,
    ok: bool,
}

impl SessionCapture {
    pub fn new(config: SessionCaptureConfig) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let exited = Arc::new(AtomicBool::new(false));
        let serializer = Arc::new(EventSerializer::new());

        match start(config, tx, serializer, exited.clone()) {
            Ok((ingest, failed_login)) => Self {
                rx,
                exited,
                ingest: Some(ingest),
                failed_login: Some(failed_login),
                ok: true,
            },
            Err(e) => {
                error!("session capture failed to start: {e}");
                Self {
                    rx,
                    exited,
                    ingest: None,
                    failed_login: None,
                    ok: false,
                }
            }
        }
    }

    /// False after a fatal startup error; no events will ever be served
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Block up to `timeout` for the next serialized event. A zero timeout
    /// is a valid non-blocking probe.
    pub fn poll(&self, timeout: Duration) -> Option<String> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Drop for SessionCapture {
    fn drop(&mut self) {
        self.exited.store(true, Ordering::SeqCst);
        if let Some(handle) = self.ingest.take() {
            let _ = handle.join();
        }
        if let Some(mut watcher) = self.failed_login.take() {
            watcher.join();
        }
    }
}

fn start(
    config: SessionCaptureConfig,
    tx: Sender<String>,
    serializer: Arc<EventSerializer>,
    exited: Arc<AtomicBool>,
) -> Result<(JoinHandle<()>, FailedLoginWatcher), CaptureError> {
    // Identify sessions that predate the agent; the probes only observe
    // new ones
    let existing = ExistingSessionScanner::new(&config.proc_root).scan();

    let mut ebpf = loader::load_probes(&config)?;

    let pts = PtsInspector::new(&config.proc_root);
    let seeds: Vec<wire::Connection> = existing
        .iter()
        .filter(|s| s.ptm_pid > 0)
        .map(|s| seed_connection(s, &pts))
        .collect();

    // Seed the kernel map first so terminal reads on pre-existing sessions
    // are recognized as soon as events flow
    {
        let map = ebpf
            .map_mut(CONNECTIONS_MAP)
            .ok_or(CaptureError::MissingMap(CONNECTIONS_MAP))?;
        let mut connections: KernelHashMap<&mut MapData, u32, wire::Connection> =
            KernelHashMap::try_from(map)?;
        for conn in &seeds {
            if let Err(e) = connections.insert(conn.ptm_tgid as u32, conn, 0) {
                warn!("failed to seed connection {}: {e}", conn.ptm_tgid);
            }
        }
    }

    // Each seed is announced as a new connection and then confirmed as
    // established with the same payload, matching how live sessions arrive
    for conn in &seeds {
        let snapshot = ConnectionSnapshot::from_wire(conn.ptm_tgid as u32, conn);
        enqueue(
            &serializer,
            &tx,
            &SessionEvent::Connection {
                phase: ConnectionPhase::New,
                snapshot: snapshot.clone(),
            },
        );
        enqueue(
            &serializer,
            &tx,
            &SessionEvent::Connection {
                phase: ConnectionPhase::Established,
                snapshot,
            },
        );
    }

    let ring = RingBuf::try_from(
        ebpf.take_map(EVENTS_MAP)
            .ok_or(CaptureError::MissingMap(EVENTS_MAP))?,
    )?;

    let aggregator = TerminalAggregator::new(Duration::from_millis(config.terminal_flush_ms));

    let ingest = {
        let serializer = serializer.clone();
        let tx = tx.clone();
        let exited = exited.clone();
        thread::Builder::new()
            .name("sshtrail-ingest".into())
            .spawn(move || ingest_loop(ebpf, ring, aggregator, pts, serializer, tx, exited))?
    };

    let failed_login = FailedLoginWatcher::spawn(config.btmp_path, serializer, tx, exited);

    Ok((ingest, failed_login))
}

fn seed_connection(session: &ExistingSession, pts: &PtsInspector) -> wire::Connection {
    let mut conn = wire::Connection::zeroed();
    conn.ptm_tgid = session.ptm_pid;
    conn.pts_tgid = session.pts_pid;
    conn.shell_tgid = session.shell_pid;
    conn.tty_id = PID_NONE;
    conn.user_id = session.user_id;
    conn.start_time = session.start_time_ns;
    conn.tcp_info.server_ip = session.server_ip;
    conn.tcp_info.server_port = session.server_port;
    conn.tcp_info.client_ip = session.client_ip;
    conn.tcp_info.client_port = session.client_port;

    // Same enrichment a live session gets after its shell clone
    pts.inspect(session.pts_pid).apply_to(&mut conn);

    conn
}

fn ingest_loop(
    mut ebpf: Ebpf,
    mut ring: RingBuf<MapData>,
    aggregator: TerminalAggregator,
    pts: PtsInspector,
    serializer: Arc<EventSerializer>,
    tx: Sender<String>,
    exited: Arc<AtomicBool>,
) {
    let ring_fd = ring.as_raw_fd();

    while !exited.load(Ordering::SeqCst) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(ring_fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(CHANNEL_POLL_MS)) {
            // Ctrl+C during shutdown lands here; not an error
            Err(Errno::EINTR) => break,
            Err(e) => {
                warn!("error polling event channel: {e}");
                break;
            }
            Ok(_) => {}
        }

        while let Some(item) = ring.next() {
            handle_record(&item, &mut ebpf, &aggregator, &pts, &serializer, &tx);
        }

        for (ptm_pid, data) in aggregator.drain_expired() {
            enqueue(&serializer, &tx, &SessionEvent::Terminal { ptm_pid, data });
        }
    }

    debug!("exiting event channel polling");
}

/// Decode one ring-buffer record by its leading event type and route it
fn handle_record(
    data: &[u8],
    ebpf: &mut Ebpf,
    aggregator: &TerminalAggregator,
    pts: &PtsInspector,
    serializer: &EventSerializer,
    tx: &Sender<String>,
) {
    let Some(head) = data.get(..4).and_then(|b| b.try_into().ok()) else {
        return;
    };
    let raw_type = i32::from_ne_bytes(head);

    match raw_type {
        event_type::NEW_CONNECTION | event_type::CLOSE_CONNECTION => {
            let Some(event) = cast_record::<wire::ConnectionEvent>(data) else {
                return;
            };
            let phase = if raw_type == event_type::NEW_CONNECTION {
                ConnectionPhase::New
            } else {
                ConnectionPhase::Close
            };
            let snapshot = ConnectionSnapshot::from_wire(event.ptm_pid, &event.conn);
            debug!(
                "connection {}: pid {} user {}",
                phase.event_name(),
                event.ptm_pid,
                snapshot.username
            );
            enqueue(serializer, tx, &SessionEvent::Connection { phase, snapshot });
        }

        event_type::COMMAND_START | event_type::COMMAND_END => {
            let Some(event) = cast_record::<wire::CommandEvent>(data) else {
                return;
            };
            let phase = if raw_type == event_type::COMMAND_START {
                CommandPhase::Start
            } else {
                CommandPhase::Finish
            };
            let snapshot = CommandSnapshot::from_wire(event.ptm_pid, &event.cmd);
            debug!("{}: {}", phase.event_name(), snapshot.args);
            enqueue(serializer, tx, &SessionEvent::Command { phase, snapshot });
        }

        event_type::TERMINAL_UPDATE => {
            let Some(event) = cast_record::<wire::TerminalUpdateEvent>(data) else {
                return;
            };
            aggregator.add(event.ptm_pid, terminal_payload(event));
        }

        event_type::FILE_UPLOAD => {
            let Some(event) = cast_record::<wire::FileUploadEvent>(data) else {
                return;
            };
            enqueue(
                serializer,
                tx,
                &SessionEvent::FileUpload {
                    ptm_pid: event.ptm_pid,
                    target_path: sshtrail_core::events::cstr_lossy(&event.target_path),
                    file_mode: event.file_mode,
                },
            );
        }

        event_type::SHELL_CLONED => {
            let Some(event) = cast_record::<wire::ShellCloneEvent>(data) else {
                return;
            };
            complete_connection(event, ebpf, pts, serializer, tx);
        }

        other => debug!("unknown event type {other} on the channel"),
    }
}

/// The kernel-side "ready" signal: the shell exists, so /proc now has the
/// pts descriptors and the owning user. Overlay them into the kernel row
/// (the read probes match on the fds) and confirm the session downstream.
fn complete_connection(
    event: &wire::ShellCloneEvent,
    ebpf: &mut Ebpf,
    pts: &PtsInspector,
    serializer: &EventSerializer,
    tx: &Sender<String>,
) {
    debug!(
        "shell clone: shell pid {} pts pid {} ptm pid {}",
        event.shell_pid, event.pts_pid, event.ptm_pid
    );

    let info = pts.inspect(event.pts_pid as i32);
    if info.pts_fds[0] == PID_NONE {
        // Still worth completing: could be an ssh command without a tty
        debug!(
            "cannot parse fd/tty data for ptm pid {}; could be ssh command w/o tty",
            event.ptm_pid
        );
    }

    let Some(map) = ebpf.map_mut(CONNECTIONS_MAP) else {
        warn!("connections map disappeared");
        return;
    };
    let mut connections: KernelHashMap<&mut MapData, u32, wire::Connection> =
        match KernelHashMap::try_from(map) {
            Ok(map) => map,
            Err(e) => {
                warn!("connections map unusable: {e}");
                return;
            }
        };

    match connections.get(&event.ptm_pid, 0) {
        Ok(mut conn) => {
            info.apply_to(&mut conn);
            conn.shell_tgid = event.shell_pid as i32;

            if let Err(e) = connections.insert(event.ptm_pid, conn, 0) {
                warn!("failed to write back connection {}: {e}", event.ptm_pid);
            }

            let snapshot = ConnectionSnapshot::from_wire(event.ptm_pid, &conn);
            enqueue(
                serializer,
                tx,
                &SessionEvent::Connection {
                    phase: ConnectionPhase::Established,
                    snapshot,
                },
            );
        }
        Err(_) => {
            // The session may already have closed, or LRU evicted it
            warn!("cannot find connection info for ptm pid {}", event.ptm_pid);
        }
    }
}

/// The channel hands back raw bytes; records are whole structs by
/// construction, so a short record means a layout mismatch and is dropped.
fn cast_record<T>(data: &[u8]) -> Option<&T> {
    if data.len() < size_of::<T>() {
        warn!(
            "undersized record on the event channel: {} < {}",
            data.len(),
            size_of::<T>()
        );
        return None;
    }
    Some(unsafe { &*(data.as_ptr() as *const T) })
}

fn enqueue(serializer: &EventSerializer, tx: &Sender<String>, event: &SessionEvent) {
    match serializer.serialize(event) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => warn!("dropping event that failed to serialize: {e}"),
    }
}
