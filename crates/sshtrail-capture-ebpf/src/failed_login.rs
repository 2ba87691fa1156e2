//! Failed-login watcher
//!
//! btmp is a binary log of failed login attempts in fixed-size utmp
//! records. A background thread watches the file for modification, rescans
//! it from the top, and synthesizes auth-failed connection events for every
//! record newer than the last one seen.

use crossbeam_channel::Sender;
use notify::{RecursiveMode, Watcher};
use sshtrail_core::events::{
    cstr_lossy, ConnectionPhase, ConnectionSnapshot, SessionEvent, TcpEndpoints,
};
use sshtrail_core::EventSerializer;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// ut_type for a failed login attempt
const LOGIN_PROCESS: i16 = 6;

/// Fallback poll interval when no notification arrives
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// glibc utmp record layout; btmp is an array of these. Unused fields are
/// kept so the record size and offsets line up with the file format.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct UtmpRecord {
    ut_type: i16,
    _pad0: [u8; 2],
    ut_pid: i32,
    ut_line: [u8; 32],
    ut_id: [u8; 4],
    ut_user: [u8; 32],
    ut_host: [u8; 256],
    ut_exit_termination: i16,
    ut_exit_exit: i16,
    ut_session: i32,
    tv_sec: i32,
    tv_usec: i32,
    /// IPv4 address lives in the first word
    ut_addr_v6: [i32; 4],
    _reserved: [u8; 20],
}

const UTMP_RECORD_SIZE: usize = std::mem::size_of::<UtmpRecord>();

pub struct FailedLoginWatcher {
    handle: Option<JoinHandle<()>>,
}

impl FailedLoginWatcher {
    pub fn spawn(
        btmp_path: PathBuf,
        serializer: Arc<EventSerializer>,
        tx: Sender<String>,
        exited: Arc<AtomicBool>,
    ) -> Self {
        let handle = thread::Builder::new()
            .name("sshtrail-btmp".into())
            .spawn(move || run(btmp_path, serializer, tx, exited));

        match handle {
            Ok(handle) => Self {
                handle: Some(handle),
            },
            Err(e) => {
                warn!("failed to spawn failed-login watcher: {e}");
                Self { handle: None }
            }
        }
    }

    /// Blocks until the thread observes the shared exit flag
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    btmp_path: PathBuf,
    serializer: Arc<EventSerializer>,
    tx: Sender<String>,
    exited: Arc<AtomicBool>,
) {
    let mut file = match File::open(&btmp_path) {
        Ok(file) => file,
        Err(e) => {
            warn!(
                "unable to read {}: {e}; disabling failed auth tracking",
                btmp_path.display()
            );
            return;
        }
    };

    // The notification is an optimization over the fallback poll, so a
    // watcher that fails to register only costs latency
    let (notify_tx, notify_rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = notify_tx.send(res);
    })
    .ok();
    if let Some(w) = watcher.as_mut() {
        if let Err(e) = w.watch(&btmp_path, RecursiveMode::NonRecursive) {
            debug!("btmp watch registration failed: {e}");
        }
    }

    // Only records after agent startup count as new
    let mut last_seen_sec = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let mut buf = [0u8; UTMP_RECORD_SIZE];
    while !exited.load(Ordering::SeqCst) {
        // Change notification, or the short fallback sleep
        let _ = notify_rx.recv_timeout(POLL_INTERVAL);

        if file.seek(SeekFrom::Start(0)).is_err() {
            continue;
        }

        while !exited.load(Ordering::SeqCst) && file.read_exact(&mut buf).is_ok() {
            let record = parse_record(&buf);
            if record.ut_type != LOGIN_PROCESS {
                continue;
            }
            if (record.tv_sec as i64) <= last_seen_sec {
                continue;
            }
            last_seen_sec = record.tv_sec as i64;

            let event = auth_failed_event(&record);
            match serializer.serialize(&event) {
                Ok(json) => {
                    let _ = tx.send(json);
                }
                Err(e) => warn!("dropping auth-failed event that failed to serialize: {e}"),
            }
        }
    }
}

fn parse_record(bytes: &[u8; UTMP_RECORD_SIZE]) -> UtmpRecord {
    // The record is plain old data; the file gives no alignment guarantee
    unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const UtmpRecord) }
}

fn auth_failed_event(record: &UtmpRecord) -> SessionEvent {
    let username = cstr_lossy(&record.ut_user);
    // Unknown usernames (the common case for failed logins) resolve to -1
    let user_id = nix::unistd::User::from_name(&username)
        .ok()
        .flatten()
        .map(|u| u.uid.as_raw() as i32)
        .unwrap_or(-1);

    let millis = (record.tv_sec as i64) * 1000 + (record.tv_usec as i64) / 1000;

    SessionEvent::Connection {
        phase: ConnectionPhase::AuthFailed,
        snapshot: ConnectionSnapshot {
            ptm_pid: record.ut_pid as u32,
            user_id,
            username,
            pts_pid: -1,
            shell_pid: -1,
            tty_id: -1,
            start_time: millis as u64,
            end_time: millis as u64,
            tcp: TcpEndpoints {
                server_ip: 0,
                client_ip: record.ut_addr_v6[0] as u32,
                server_port: 0,
                client_port: 0,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_matches_utmp() {
        assert_eq!(UTMP_RECORD_SIZE, 384);
    }

    fn fabricate_record(ut_type: i16, user: &str, pid: i32, sec: i32, addr: u32) -> Vec<u8> {
        let mut record: UtmpRecord = unsafe { std::mem::zeroed() };
        record.ut_type = ut_type;
        record.ut_pid = pid;
        record.ut_user[..user.len()].copy_from_slice(user.as_bytes());
        record.tv_sec = sec;
        record.tv_usec = 250_000;
        record.ut_addr_v6[0] = addr as i32;

        let ptr = &record as *const UtmpRecord as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, UTMP_RECORD_SIZE) }.to_vec()
    }

    #[test]
    fn record_round_trips_through_bytes() {
        let bytes = fabricate_record(LOGIN_PROCESS, "baduser", 4321, 1_700_000_000, 0x0100_007f);
        let buf: [u8; UTMP_RECORD_SIZE] = bytes.try_into().unwrap();

        let record = parse_record(&buf);
        assert_eq!(record.ut_type, LOGIN_PROCESS);
        assert_eq!(record.ut_pid, 4321);
        assert_eq!(cstr_lossy(&record.ut_user), "baduser");
        assert_eq!(record.tv_sec, 1_700_000_000);
    }

    #[test]
    fn auth_failed_event_carries_millis_and_client_ip() {
        let bytes = fabricate_record(LOGIN_PROCESS, "baduser", 4321, 1_700_000_000, 0x0100_007f);
        let buf: [u8; UTMP_RECORD_SIZE] = bytes.try_into().unwrap();
        let record = parse_record(&buf);

        let SessionEvent::Connection { phase, snapshot } = auth_failed_event(&record) else {
            panic!("expected a connection event");
        };
        assert_eq!(phase, ConnectionPhase::AuthFailed);
        assert_eq!(snapshot.ptm_pid, 4321);
        assert_eq!(snapshot.username, "baduser");
        // tv_sec * 1000 + tv_usec / 1000
        assert_eq!(snapshot.start_time, 1_700_000_000_250);
        assert_eq!(snapshot.end_time, snapshot.start_time);
        assert_eq!(snapshot.tcp.client_ip, 0x0100_007f);
        assert_eq!(snapshot.pts_pid, -1);
    }

    #[test]
    fn nonexistent_user_resolves_to_minus_one() {
        let bytes = fabricate_record(
            LOGIN_PROCESS,
            "no-such-user-sshtrail",
            1,
            1_700_000_000,
            0,
        );
        let buf: [u8; UTMP_RECORD_SIZE] = bytes.try_into().unwrap();
        let SessionEvent::Connection { snapshot, .. } = auth_failed_event(&parse_record(&buf))
        else {
            panic!("expected a connection event");
        };
        assert_eq!(snapshot.user_id, -1);
    }
}
