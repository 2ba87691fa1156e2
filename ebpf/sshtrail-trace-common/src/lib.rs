#![no_std]

//! Wire contract between the sshtrail kernel programs and user space.
//!
//! Everything here is `#[repr(C)]`, fixed-size, and shared byte-for-byte
//! across the BPF boundary. Buffer capacities that back masked copies must
//! be powers of two.

/// Command name length (matches TASK_COMM_LEN in the kernel)
pub const COMM_LEN: usize = 16;

/// Maximum bytes of argv\[0\] kept per command
pub const FILENAME_CAP: usize = 255;

/// Maximum username bytes (NUL terminator stored separately)
pub const USERNAME_CAP: usize = 32;

/// Stdout capture cap per command. Must be a power of two.
pub const STDOUT_CAP: usize = 4096;

/// The stdout buffer is twice the cap so a masked offset plus a masked
/// length always lands inside the allocation as far as the verifier can
/// prove.
pub const STDOUT_BUF_LEN: usize = STDOUT_CAP * 2;

/// Concatenated-args cap per command. Must be a power of two.
pub const ARGS_CAP: usize = 2048;

/// Doubled for the same masked-copy bound as the stdout buffer.
pub const ARGS_BUF_LEN: usize = ARGS_CAP * 2;

/// Per-read terminal copy cap. Must be a power of two.
pub const READ_BUFFER_CAP: usize = 16384;

/// Upload path cap for scp detection
pub const TARGET_PATH_CAP: usize = 2048;

/// Tracked-connections map size (LRU)
pub const MAX_CONNECTIONS: u32 = 10_000;

/// Tracked-commands map size (LRU)
pub const MAX_TRACKED_COMMANDS: u32 = 2_000;

/// Pending accept()s awaiting their clone()
pub const MAX_PENDING_ACCEPTS: u32 = 100;

/// How many argv slots beyond argv\[0\] are concatenated into `args`
pub const ARGV_SLOTS: usize = 8;

/// Parent-pointer hops allowed when searching for an owning connection
pub const ANCESTOR_WALK_LIMIT: usize = 20;

/// Terminal-read byte budget per connection per second
pub const RATE_LIMIT_MAX_BYTES_PER_SECOND: i64 = 1_024_000;

/// The budget is split across quarter-second buckets
pub const RATE_LIMIT_BUCKETS_PER_SECOND: i64 = 4;

/// Synthetic terminal payload emitted once per rate-limited bucket
/// (33 ASCII bytes plus NUL)
pub const RATE_LIMIT_NOTICE: &[u8; 34] = b"[[SSHBouncer Rate/sec Reached]]\r\n\0";

/// Sentinel for not-yet-observed pids, fds, uids and tty ids
pub const PID_NONE: i32 = -1;

/// Raw event discriminants. The first four bytes of every ring-buffer
/// record hold one of these.
pub mod event_type {
    /// ptm clone observed; connection row created
    pub const NEW_CONNECTION: i32 = 101;
    /// synthesized by user space after fd/username enrichment
    pub const ESTABLISHED_CONNECTION: i32 = 102;
    /// exit_group of the ptm
    pub const CLOSE_CONNECTION: i32 = 103;
    /// synthesized by the failed-login watcher
    pub const AUTH_FAILED_CONNECTION: i32 = 104;

    pub const COMMAND_START: i32 = 201;
    pub const COMMAND_END: i32 = 202;

    pub const TERMINAL_UPDATE: i32 = 301;

    pub const FILE_UPLOAD: i32 = 401;

    /// Internal signal asking user space to populate PTS fds; never emitted
    pub const SHELL_CLONED: i32 = 1;
}

/// Byte offsets of the `task_struct` fields the kernel programs need.
/// Discovered from BTF by user space and written into the programs' global
/// data before load; zero offsets mean discovery did not run.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskFieldOffsets {
    /// Offset of `task_struct.real_parent`
    pub real_parent: u32,
    /// Offset of `task_struct.tgid`
    pub tgid: u32,
}

impl TaskFieldOffsets {
    pub const fn zeroed() -> Self {
        Self {
            real_parent: 0,
            tgid: 0,
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for TaskFieldOffsets {}

/// TCP endpoints of a session. IPs are IPv4 in network byte order exactly
/// as read from `sockaddr_in`; ports are host byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpInfo {
    pub server_ip: u32,
    pub client_ip: u32,
    pub server_port: u16,
    pub client_port: u16,
}

/// One sshd session lineage (ptm process -> pts process -> shell), keyed in
/// the connections map by `ptm_tgid`.
///
/// The kernel creates and deletes rows; user space only overlays the
/// pts fds, tty id, uid, username and shell pid after the shell clone.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Connection {
    pub ptm_tgid: i32,
    pub pts_tgid: i32,
    pub shell_tgid: i32,
    pub tty_id: i32,

    pub tcp_info: TcpInfo,

    pub user_id: i32,
    /// NUL-terminated login name
    pub username: [u8; USERNAME_CAP + 1],
    _pad0: [u8; 7],

    /// Boot-time nanoseconds from bpf_ktime_get_ns
    pub start_time: u64,
    /// Zero until exit_group of the ptm
    pub end_time: u64,

    /// Descriptors on the pts process that address the PTY slave end.
    /// Populated by user space after the shell clone; -1 until then.
    pub pts_fd: i32,
    pub pts_fd2: i32,
    pub pts_fd3: i32,
    _pad1: [u8; 4],

    /// Quarter-second bucket id the rate counters belong to
    pub rate_limit_bucket: i64,
    /// Bytes accepted within the current bucket
    pub rate_limit_bytes: i64,
    /// Set once the bucket notice has been emitted
    pub rate_limit_hit: u8,
    _pad2: [u8; 7],
}

impl Connection {
    pub const fn zeroed() -> Self {
        Self {
            ptm_tgid: 0,
            pts_tgid: 0,
            shell_tgid: 0,
            tty_id: 0,
            tcp_info: TcpInfo {
                server_ip: 0,
                client_ip: 0,
                server_port: 0,
                client_port: 0,
            },
            user_id: 0,
            username: [0u8; USERNAME_CAP + 1],
            _pad0: [0u8; 7],
            start_time: 0,
            end_time: 0,
            pts_fd: 0,
            pts_fd2: 0,
            pts_fd3: 0,
            _pad1: [0u8; 4],
            rate_limit_bucket: 0,
            rate_limit_bytes: 0,
            rate_limit_hit: 0,
            _pad2: [0u8; 7],
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for Connection {}

/// One execve within a tracked lineage, keyed in the commands map by the
/// executing tgid.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Command {
    pub start_time: u64,
    pub end_time: u64,

    /// argv\[0\], NUL-terminated
    pub filename: [u8; FILENAME_CAP],
    _pad0: u8,

    /// Bytes captured into `stdout` so far; monotonic, caps at STDOUT_CAP
    pub stdout_offset: u32,
    /// Raw exit_group status; -1 until exit observed
    pub exit_code: i32,

    pub parent_tgid: u32,
    pub current_tgid: u32,
    /// ptm tgid of the owning connection
    pub conn_tgid: u32,
    _pad1: [u8; 4],

    /// fd 1/2 capture; only the first STDOUT_CAP bytes are ever valid
    pub stdout: [u8; STDOUT_BUF_LEN],
    /// Full path plus argv\[1..\] joined by single spaces, NUL-terminated
    pub args: [u8; ARGS_BUF_LEN],
}

impl Command {
    pub const fn zeroed() -> Self {
        Self {
            start_time: 0,
            end_time: 0,
            filename: [0u8; FILENAME_CAP],
            _pad0: 0,
            stdout_offset: 0,
            exit_code: 0,
            parent_tgid: 0,
            current_tgid: 0,
            conn_tgid: 0,
            _pad1: [0u8; 4],
            stdout: [0u8; STDOUT_BUF_LEN],
            args: [0u8; ARGS_BUF_LEN],
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for Command {}

/// Connection lifecycle record (new / established / auth-failed / close)
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ConnectionEvent {
    pub event_type: i32,
    pub ptm_pid: u32,
    pub conn: Connection,
}

/// Command start/end record carrying the full command state
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CommandEvent {
    pub event_type: i32,
    pub ptm_pid: u32,
    pub cmd: Command,
}

/// One captured terminal read (or the synthetic rate-limit notice).
/// `data_len` is the full read size and may exceed what was copied.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TerminalUpdateEvent {
    pub event_type: i32,
    pub ptm_pid: u32,
    pub data_len: i32,
    _pad0: [u8; 4],
    pub terminal_data: [u8; READ_BUFFER_CAP],
}

/// scp write-open observed inside a tracked session
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FileUploadEvent {
    pub event_type: i32,
    pub ptm_pid: u32,
    pub file_mode: u32,
    _pad0: [u8; 4],
    pub target_path: [u8; TARGET_PATH_CAP],
}

/// Internal: the pts process forked the user shell; user space should go
/// read /proc and complete the connection row.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ShellCloneEvent {
    pub event_type: i32,
    pub ptm_pid: u32,
    pub pts_pid: u32,
    pub shell_pid: u32,
}
