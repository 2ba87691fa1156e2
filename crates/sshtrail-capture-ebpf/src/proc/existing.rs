//! Startup enumeration of SSH sessions that predate the agent
//!
//! The probes only see sessions created after attach; anything already
//! running has to be reconstructed from /proc. An established session shows
//! up as three generations of sshd (listener -> ptm -> pts) with the user
//! shell under the pts.

use sshtrail_core::clock::boottime_minus_monotonic_ms;
use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{debug, info};

use super::{
    ipv4_to_net_u32, read_comm, read_stat, read_tcp_table, read_uid, socket_inodes,
    TcpTableEntry, TCP_STATE_LISTEN,
};

const SSHD_DEFAULT_PORT: u16 = 22;
const SSHD_PROCESS_NAME: &str = "sshd";
const NANOS_IN_A_SEC: u64 = 1_000_000_000;
const NANOS_IN_A_MILLI: i64 = 1_000_000;

/// A pre-existing session reconstructed from /proc. IPs are raw
/// network-byte-order values matching what the kernel stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingSession {
    pub ptm_pid: i32,
    pub pts_pid: i32,
    pub shell_pid: i32,
    pub user_id: i32,
    /// Boot-time nanoseconds, comparable with bpf_ktime_get_ns
    pub start_time_ns: u64,
    pub server_ip: u32,
    pub server_port: u16,
    pub client_ip: u32,
    pub client_port: u16,
}

#[derive(Debug, Clone)]
struct TaskEntry {
    pid: i32,
    ppid: i32,
    comm: String,
    starttime_jiffies: u64,
}

pub struct ExistingSessionScanner {
    proc_root: PathBuf,
}

impl ExistingSessionScanner {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// One-shot scan. Tasks that vanish mid-scan are skipped, never fatal.
    pub fn scan(&self) -> Vec<ExistingSession> {
        let tasks = self.index_tasks();

        let listener = tasks
            .values()
            .find(|t| t.comm == SSHD_PROCESS_NAME && t.ppid == 1);
        let sshd_port = listener
            .and_then(|l| self.discover_listen_port(l.pid))
            .unwrap_or(SSHD_DEFAULT_PORT);

        let tcp_table = read_tcp_table(&self.proc_root);

        let mut sessions = Vec::new();
        for task in tasks.values() {
            if !is_pts_side(task, &tasks) {
                continue;
            }

            let shell_pid = tasks
                .values()
                .find(|c| c.ppid == task.pid)
                .map(|c| c.pid)
                .unwrap_or(-1);

            let user_id = read_uid(&self.proc_root, task.pid)
                .map(|u| u as i32)
                .unwrap_or(-1);

            let mut session = ExistingSession {
                ptm_pid: task.ppid,
                pts_pid: task.pid,
                shell_pid,
                user_id,
                start_time_ns: jiffies_to_boot_ns(task.starttime_jiffies),
                server_ip: 0,
                server_port: 0,
                client_ip: 0,
                client_port: 0,
            };

            self.associate_sockets(task.pid, sshd_port, &tcp_table, &mut session);
            sessions.push(session);
        }

        for session in &sessions {
            info!(
                "found existing session: {} / {} / {} - {}:{} - {}:{}",
                session.ptm_pid,
                session.pts_pid,
                session.shell_pid,
                format_raw_ip(session.server_ip),
                session.server_port,
                format_raw_ip(session.client_ip),
                session.client_port,
            );
        }

        sessions
    }

    fn index_tasks(&self) -> HashMap<i32, TaskEntry> {
        let mut tasks = HashMap::new();

        let Ok(entries) = fs::read_dir(&self.proc_root) else {
            debug!("cannot list {}", self.proc_root.display());
            return tasks;
        };

        for entry in entries.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
                continue;
            };
            // Either read can fail if the task exited after the listing
            let Some(comm) = read_comm(&self.proc_root, pid) else {
                debug!("task {pid} vanished during scan");
                continue;
            };
            let Some(stat) = read_stat(&self.proc_root, pid) else {
                debug!("task {pid} vanished during scan");
                continue;
            };

            tasks.insert(
                pid,
                TaskEntry {
                    pid,
                    ppid: stat.ppid,
                    comm,
                    starttime_jiffies: stat.starttime_jiffies,
                },
            );
        }

        tasks
    }

    /// The listener's port is whichever of its sockets sits in LISTEN state
    fn discover_listen_port(&self, listener_pid: i32) -> Option<u16> {
        let inodes = socket_inodes(&self.proc_root, listener_pid);
        read_tcp_table(&self.proc_root)
            .into_iter()
            .find(|row| row.state == TCP_STATE_LISTEN && inodes.contains(&row.inode))
            .map(|row| row.local_port)
    }

    /// Match the pts task's socket fds against the TCP table; the row on
    /// the sshd port carries both endpoints of the session.
    fn associate_sockets(
        &self,
        pts_pid: i32,
        sshd_port: u16,
        tcp_table: &[TcpTableEntry],
        session: &mut ExistingSession,
    ) {
        let inodes = socket_inodes(&self.proc_root, pts_pid);

        for row in tcp_table {
            if row.local_port == sshd_port && inodes.contains(&row.inode) {
                session.server_ip = ipv4_to_net_u32(row.local_ip);
                session.server_port = row.local_port;
                session.client_ip = ipv4_to_net_u32(row.remote_ip);
                session.client_port = row.remote_port;
            }
        }
    }
}

/// The three-generation test: listener (ppid 1) -> ptm -> pts. Only the
/// pts-side task of each lineage becomes a session.
fn is_pts_side(task: &TaskEntry, tasks: &HashMap<i32, TaskEntry>) -> bool {
    if task.comm != SSHD_PROCESS_NAME || task.ppid == 1 {
        return false;
    }

    let Some(parent) = tasks.get(&task.ppid) else {
        return false;
    };
    if parent.comm != SSHD_PROCESS_NAME || parent.ppid == 1 {
        return false;
    }

    let Some(grandparent) = tasks.get(&parent.ppid) else {
        return false;
    };
    grandparent.comm == SSHD_PROCESS_NAME && grandparent.ppid == 1
}

/// starttime is jiffies since boot; kernel event timestamps are monotonic
/// ns excluding suspend. Convert and subtract the boottime/monotonic delta
/// so both compare.
fn jiffies_to_boot_ns(jiffies: u64) -> u64 {
    let hz = nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .unwrap_or(100) as u64;

    let secs_after_boot = jiffies / hz.max(1);
    let nanos_after_boot = secs_after_boot * NANOS_IN_A_SEC;

    let delta_ns = boottime_minus_monotonic_ms() * NANOS_IN_A_MILLI;
    nanos_after_boot.saturating_sub(delta_ns.max(0) as u64)
}

fn format_raw_ip(raw: u32) -> Ipv4Addr {
    Ipv4Addr::from(raw.to_ne_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use std::path::Path;

    fn write_task(root: &Path, pid: i32, comm: &str, ppid: i32, starttime: u64) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(dir.join("fd")).unwrap();
        fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        fs::write(
            dir.join("stat"),
            format!(
                "{pid} ({comm}) S {ppid} {pid} {pid} 0 -1 4194560 0 0 0 0 0 0 0 0 20 0 1 0 {starttime} 0 0 0"
            ),
        )
        .unwrap();
        fs::write(
            dir.join("status"),
            format!("Name:\t{comm}\nUid:\t1000\t1000\t1000\t1000\n"),
        )
        .unwrap();
    }

    fn give_socket(root: &Path, pid: i32, fd: i32, inode: u64) {
        symlink(
            format!("socket:[{inode}]"),
            root.join(pid.to_string()).join("fd").join(fd.to_string()),
        )
        .unwrap();
    }

    fn write_tcp_table(root: &Path, rows: &[String]) {
        fs::create_dir_all(root.join("net")).unwrap();
        let mut content = String::from(
            "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n",
        );
        for row in rows {
            content.push_str(row);
            content.push('\n');
        }
        fs::write(root.join("net/tcp"), content).unwrap();
    }

    fn tcp_row(local: (Ipv4Addr, u16), remote: (Ipv4Addr, u16), state: u8, inode: u64) -> String {
        format!(
            "   0: {:08X}:{:04X} {:08X}:{:04X} {:02X} 00000000:00000000 00:00000000 00000000  1000        0 {} 1",
            ipv4_to_net_u32(local.0),
            local.1,
            ipv4_to_net_u32(remote.0),
            remote.1,
            state,
            inode
        )
    }

    /// listener(50, ppid 1) -> ptm(60) -> pts(70) -> shell(80)
    fn fabricate_session_tree(root: &Path) {
        write_task(root, 1, "systemd", 0, 1);
        write_task(root, 50, "sshd", 1, 100);
        write_task(root, 60, "sshd", 50, 200);
        write_task(root, 70, "sshd", 60, 300);
        write_task(root, 80, "bash", 70, 400);

        give_socket(root, 50, 3, 111);
        give_socket(root, 70, 4, 222);

        let server = (Ipv4Addr::new(10, 0, 0, 5), 22);
        let client = (Ipv4Addr::new(192, 168, 1, 9), 51000);
        write_tcp_table(
            root,
            &[
                tcp_row(server, (Ipv4Addr::new(0, 0, 0, 0), 0), TCP_STATE_LISTEN, 111),
                tcp_row(server, client, 0x01, 222),
            ],
        );
    }

    #[test]
    fn finds_three_generation_sessions() {
        let dir = tempfile::tempdir().unwrap();
        fabricate_session_tree(dir.path());

        let sessions = ExistingSessionScanner::new(dir.path()).scan();
        assert_eq!(sessions.len(), 1);

        let s = &sessions[0];
        assert_eq!(s.ptm_pid, 60);
        assert_eq!(s.pts_pid, 70);
        assert_eq!(s.shell_pid, 80);
        assert_eq!(s.user_id, 1000);
        assert_eq!(s.server_port, 22);
        assert_eq!(s.client_port, 51000);
        assert_eq!(format_raw_ip(s.client_ip), Ipv4Addr::new(192, 168, 1, 9));
        assert_eq!(format_raw_ip(s.server_ip), Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn listener_and_ptm_are_not_sessions() {
        let dir = tempfile::tempdir().unwrap();
        fabricate_session_tree(dir.path());

        let sessions = ExistingSessionScanner::new(dir.path()).scan();
        assert!(sessions.iter().all(|s| s.pts_pid == 70));
    }

    #[test]
    fn vanished_task_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fabricate_session_tree(dir.path());
        // a pid directory with no readable files, as if it exited mid-scan
        fs::create_dir_all(dir.path().join("90")).unwrap();

        let sessions = ExistingSessionScanner::new(dir.path()).scan();
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn nonstandard_listen_port_is_discovered() {
        let dir = tempfile::tempdir().unwrap();
        write_task(dir.path(), 1, "systemd", 0, 1);
        write_task(dir.path(), 50, "sshd", 1, 100);
        write_task(dir.path(), 60, "sshd", 50, 200);
        write_task(dir.path(), 70, "sshd", 60, 300);

        give_socket(dir.path(), 50, 3, 111);
        give_socket(dir.path(), 70, 4, 222);

        let server = (Ipv4Addr::new(10, 0, 0, 5), 2222);
        let client = (Ipv4Addr::new(172, 16, 0, 2), 40000);
        write_tcp_table(
            dir.path(),
            &[
                tcp_row(server, (Ipv4Addr::new(0, 0, 0, 0), 0), TCP_STATE_LISTEN, 111),
                tcp_row(server, client, 0x01, 222),
            ],
        );

        let sessions = ExistingSessionScanner::new(dir.path()).scan();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].server_port, 2222);
        assert_eq!(sessions[0].client_port, 40000);
    }

    #[test]
    fn lineage_without_a_root_listener_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_task(dir.path(), 1, "systemd", 0, 1);
        // lineage without a ppid==1 listener: grandparent check fails
        write_task(dir.path(), 60, "sshd", 2, 200);
        write_task(dir.path(), 70, "sshd", 60, 300);

        let sessions = ExistingSessionScanner::new(dir.path()).scan();
        assert!(sessions.is_empty());
    }
}
