//! Owned user-space views of the kernel wire structs
//!
//! The raw `#[repr(C)]` records carry fixed-size NUL-terminated buffers;
//! everything here converts them into owned strings and byte vectors so the
//! rest of the pipeline never touches raw layout again.

use sshtrail_trace_common as wire;
use sshtrail_trace_common::{READ_BUFFER_CAP, STDOUT_CAP};

/// C-string view of a fixed-size buffer: everything before the first NUL
pub fn cstr_slice(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

/// Lossy UTF-8 of the C-string view
pub fn cstr_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(cstr_slice(bytes)).into_owned()
}

/// Which lifecycle edge a connection event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    New,
    Established,
    AuthFailed,
    Close,
}

impl ConnectionPhase {
    pub fn from_wire(event_type: i32) -> Option<Self> {
        match event_type {
            wire::event_type::NEW_CONNECTION => Some(Self::New),
            wire::event_type::ESTABLISHED_CONNECTION => Some(Self::Established),
            wire::event_type::AUTH_FAILED_CONNECTION => Some(Self::AuthFailed),
            wire::event_type::CLOSE_CONNECTION => Some(Self::Close),
            _ => None,
        }
    }

    /// The `event_type` string emitted in JSON
    pub fn event_name(self) -> &'static str {
        match self {
            Self::New => "connection_new",
            Self::Established => "connection_established",
            Self::AuthFailed => "connection_auth_failed",
            Self::Close => "connection_close",
        }
    }

    /// Auth failures are synthesized in user space with wall-clock
    /// millisecond timestamps; everything else carries boot-time ns.
    pub fn timestamps_are_wall_ms(self) -> bool {
        matches!(self, Self::AuthFailed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPhase {
    Start,
    Finish,
}

impl CommandPhase {
    pub fn event_name(self) -> &'static str {
        match self {
            Self::Start => "command_start",
            Self::Finish => "command_finish",
        }
    }
}

/// TCP endpoints as raw wire values: IPv4 in network byte order, ports in
/// host order. Formatting happens at serialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpEndpoints {
    pub server_ip: u32,
    pub client_ip: u32,
    pub server_port: u16,
    pub client_port: u16,
}

/// Owned copy of a connection row at the moment an event fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub ptm_pid: u32,
    pub user_id: i32,
    pub username: String,
    pub pts_pid: i32,
    pub shell_pid: i32,
    pub tty_id: i32,
    /// Boot-time ns, except wall-clock ms for auth failures
    pub start_time: u64,
    pub end_time: u64,
    pub tcp: TcpEndpoints,
}

impl ConnectionSnapshot {
    pub fn from_wire(ptm_pid: u32, conn: &wire::Connection) -> Self {
        Self {
            ptm_pid,
            user_id: conn.user_id,
            username: cstr_lossy(&conn.username),
            pts_pid: conn.pts_tgid,
            shell_pid: conn.shell_tgid,
            tty_id: conn.tty_id,
            start_time: conn.start_time,
            end_time: conn.end_time,
            tcp: TcpEndpoints {
                server_ip: conn.tcp_info.server_ip,
                client_ip: conn.tcp_info.client_ip,
                server_port: conn.tcp_info.server_port,
                client_port: conn.tcp_info.client_port,
            },
        }
    }
}

/// Owned copy of a command row at start or finish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSnapshot {
    pub ptm_pid: u32,
    pub filename: String,
    pub args: String,
    pub stdout: String,
    /// Bytes captured in the kernel, independent of the string view above
    pub stdout_size: u32,
    pub start_time: u64,
    pub end_time: u64,
    pub exit_code: i32,
    pub parent_pid: u32,
    pub pid: u32,
}

impl CommandSnapshot {
    pub fn from_wire(ptm_pid: u32, cmd: &wire::Command) -> Self {
        let captured = (cmd.stdout_offset as usize).min(STDOUT_CAP);
        Self {
            ptm_pid,
            filename: cstr_lossy(&cmd.filename),
            args: cstr_lossy(&cmd.args),
            stdout: cstr_lossy(&cmd.stdout[..captured]),
            stdout_size: cmd.stdout_offset,
            start_time: cmd.start_time,
            end_time: cmd.end_time,
            exit_code: cmd.exit_code,
            parent_pid: cmd.parent_tgid,
            pid: cmd.current_tgid,
        }
    }
}

/// Everything the pipeline serializes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connection {
        phase: ConnectionPhase,
        snapshot: ConnectionSnapshot,
    },
    Command {
        phase: CommandPhase,
        snapshot: CommandSnapshot,
    },
    Terminal {
        ptm_pid: u32,
        data: Vec<u8>,
    },
    FileUpload {
        ptm_pid: u32,
        target_path: String,
        file_mode: u32,
    },
}

/// Bytes actually captured for a terminal update. `data_len` counts the
/// whole read; the copy is capped at the buffer size, and the synthetic
/// rate-limit notice carries its NUL inside `data_len`, so trailing NULs
/// are stripped here.
pub fn terminal_payload(ev: &wire::TerminalUpdateEvent) -> &[u8] {
    let len = (ev.data_len.max(0) as usize).min(READ_BUFFER_CAP);
    let data = &ev.terminal_data[..len];
    let end = data
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    &data[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_struct_layouts_are_stable() {
        // Explicit padding keeps these deterministic; the kernel side and
        // this crate must agree byte-for-byte
        assert_eq!(std::mem::size_of::<wire::Connection>(), 128);
        assert_eq!(std::mem::size_of::<wire::Command>(), 12_584);
        assert_eq!(
            std::mem::size_of::<wire::TerminalUpdateEvent>(),
            16 + READ_BUFFER_CAP
        );
        assert_eq!(sshtrail_trace_common::RATE_LIMIT_NOTICE.len(), 34);
    }

    #[test]
    fn cstr_stops_at_first_nul() {
        assert_eq!(cstr_lossy(b"ls\0garbage"), "ls");
        assert_eq!(cstr_lossy(b"no-terminator"), "no-terminator");
        assert_eq!(cstr_lossy(b"\0"), "");
    }

    #[test]
    fn connection_snapshot_copies_wire_fields() {
        let mut conn = wire::Connection::zeroed();
        conn.ptm_tgid = 4242;
        conn.pts_tgid = 4243;
        conn.shell_tgid = 4244;
        conn.tty_id = 3;
        conn.user_id = 1000;
        conn.username[..5].copy_from_slice(b"alice");
        conn.start_time = 17;
        conn.tcp_info.client_port = 51122;

        let snap = ConnectionSnapshot::from_wire(4242, &conn);
        assert_eq!(snap.username, "alice");
        assert_eq!(snap.pts_pid, 4243);
        assert_eq!(snap.shell_pid, 4244);
        assert_eq!(snap.tcp.client_port, 51122);
        assert_eq!(snap.start_time, 17);
    }

    #[test]
    fn command_snapshot_caps_stdout_at_capture_limit() {
        let mut cmd = wire::Command::zeroed();
        cmd.filename[..2].copy_from_slice(b"ls");
        cmd.stdout.fill(b'x');
        // offset can only ever reach the cap in the kernel, but the view
        // must not trust it further than the cap either
        cmd.stdout_offset = STDOUT_CAP as u32;

        let snap = CommandSnapshot::from_wire(1, &cmd);
        assert_eq!(snap.stdout.len(), STDOUT_CAP);
        assert_eq!(snap.stdout_size, STDOUT_CAP as u32);
    }

    #[test]
    fn terminal_payload_strips_trailing_nul_of_notice() {
        let notice = sshtrail_trace_common::RATE_LIMIT_NOTICE;
        let mut ev: wire::TerminalUpdateEvent = unsafe { std::mem::zeroed() };
        ev.terminal_data[..notice.len()].copy_from_slice(notice);
        ev.data_len = notice.len() as i32;

        let payload = terminal_payload(&ev);
        assert_eq!(payload, b"[[SSHBouncer Rate/sec Reached]]\r\n");
        assert_eq!(payload.len(), 33);
    }

    #[test]
    fn terminal_payload_caps_oversized_data_len() {
        let mut ev: wire::TerminalUpdateEvent = unsafe { std::mem::zeroed() };
        ev.terminal_data.fill(b'a');
        ev.data_len = (READ_BUFFER_CAP as i32) + 500;
        assert_eq!(terminal_payload(&ev).len(), READ_BUFFER_CAP);

        ev.data_len = -3;
        assert_eq!(terminal_payload(&ev).len(), 0);
    }
}
