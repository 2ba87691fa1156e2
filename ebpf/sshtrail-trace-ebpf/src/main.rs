#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_current_task, bpf_ktime_get_ns,
        bpf_probe_read_kernel, bpf_probe_read_kernel_buf, bpf_probe_read_user,
        bpf_probe_read_user_buf, bpf_probe_read_user_str_bytes,
    },
    macros::{map, tracepoint},
    maps::{LruHashMap, PerCpuArray, RingBuf},
    programs::TracePointContext,
};
use sshtrail_trace_common::{
    event_type, Command, CommandEvent, Connection, ConnectionEvent, FileUploadEvent,
    ShellCloneEvent, TaskFieldOffsets, TcpInfo, TerminalUpdateEvent, ANCESTOR_WALK_LIMIT,
    ARGS_CAP, ARGV_SLOTS, MAX_CONNECTIONS, MAX_PENDING_ACCEPTS, MAX_TRACKED_COMMANDS, PID_NONE,
    RATE_LIMIT_BUCKETS_PER_SECOND, RATE_LIMIT_MAX_BYTES_PER_SECOND, RATE_LIMIT_NOTICE,
    READ_BUFFER_CAP, STDOUT_BUF_LEN, STDOUT_CAP, TARGET_PATH_CAP,
};

// Process hierarchy per session (100 is the listener):
//   100    1      sshd (listener)
//   101    100    sshd (pt master)
//   102    101    sshd (pt slave)
//   103    102    sh/bash or whatever

const AF_INET: u16 = 2;
const O_WRONLY: i64 = 0o1;
const NANOS_PER_SEC: u64 = 1_000_000_000;

// =============================================================================
// Maps
// =============================================================================

/// Ring buffer for all session events.
/// Size: 4MB - terminal updates are 16KB each, command events ~12KB
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(4096 * 1024, 0);

/// accept() in flight, keyed by the listener's pid_tgid. The sockaddr
/// pointer is captured at enter and dereferenced at exit; the clone() that
/// follows consumes the record.
#[map]
static PENDING_ACCEPTS: LruHashMap<u64, PendingAccept> =
    LruHashMap::with_max_entries(MAX_PENDING_ACCEPTS, 0);

/// Live sessions keyed by ptm tgid. Shared with user space, which overlays
/// pts fds / tty / username after the shell clone.
#[map]
static CONNECTIONS: LruHashMap<u32, Connection> =
    LruHashMap::with_max_entries(MAX_CONNECTIONS, 0);

/// Live commands keyed by the executing tgid
#[map]
static COMMANDS: LruHashMap<u32, Command> =
    LruHashMap::with_max_entries(MAX_TRACKED_COMMANDS, 0);

/// Terminal read() in flight, keyed by the connection (ptm) tgid
#[map]
static PENDING_READS: LruHashMap<u32, PendingRead> =
    LruHashMap::with_max_entries(MAX_CONNECTIONS, 0);

/// Command structs exceed the BPF stack budget; compose them here.
/// One entry per CPU, valid only within a single probe invocation.
#[map]
static COMMAND_SCRATCH: PerCpuArray<Command> = PerCpuArray::with_max_entries(1, 0);

/// task_struct field offsets, written by the loader from BTF before attach
#[unsafe(no_mangle)]
static TASK_OFFSETS: TaskFieldOffsets = TaskFieldOffsets::zeroed();

/// Stored between sys_enter_accept and sys_exit_accept
#[repr(C)]
#[derive(Clone, Copy)]
struct PendingAccept {
    /// Userspace sockaddr pointer from the accept() arguments
    sockaddr_ptr: u64,
    tcp_info: TcpInfo,
}

/// Stored between sys_enter_read and sys_exit_read
#[repr(C)]
#[derive(Clone, Copy)]
struct PendingRead {
    fd: i32,
    _pad: u32,
    buf_ptr: u64,
}

/// sockaddr_in as handed to accept() (matches the kernel definition)
#[repr(C)]
#[derive(Clone, Copy)]
struct SockaddrIn {
    sin_family: u16,
    /// Port in network byte order
    sin_port: u16,
    /// IPv4 address in network byte order
    sin_addr: u32,
    _pad: [u8; 8],
}

// =============================================================================
// Helper functions
// =============================================================================

/// Fixed-length comm comparison; "sshd" plus the terminator
#[inline(always)]
fn comm_is_sshd() -> bool {
    match bpf_get_current_comm() {
        Ok(comm) => {
            comm[0] == b's' && comm[1] == b's' && comm[2] == b'h' && comm[3] == b'd' && comm[4] == 0
        }
        Err(_) => false,
    }
}

#[inline(always)]
fn comm_is_scp() -> bool {
    match bpf_get_current_comm() {
        Ok(comm) => comm[0] == b's' && comm[1] == b'c' && comm[2] == b'p' && comm[3] == 0,
        Err(_) => false,
    }
}

#[inline(always)]
fn task_offsets() -> TaskFieldOffsets {
    unsafe { core::ptr::read_volatile(&TASK_OFFSETS) }
}

/// Read task->tgid at the BTF-discovered offset
#[inline(always)]
fn task_tgid(task: *const u8, offsets: &TaskFieldOffsets) -> Option<u32> {
    if task.is_null() || offsets.tgid == 0 {
        return None;
    }
    let tgid: i32 =
        unsafe { bpf_probe_read_kernel(task.add(offsets.tgid as usize) as *const i32) }.ok()?;
    if tgid >= 0 {
        Some(tgid as u32)
    } else {
        None
    }
}

/// Read task->real_parent at the BTF-discovered offset
#[inline(always)]
fn task_parent(task: *const u8, offsets: &TaskFieldOffsets) -> Option<*const u8> {
    if task.is_null() || offsets.real_parent == 0 {
        return None;
    }
    let addr: u64 =
        unsafe { bpf_probe_read_kernel(task.add(offsets.real_parent as usize) as *const u64) }
            .ok()?;
    if addr == 0 {
        None
    } else {
        Some(addr as *const u8)
    }
}

#[inline(always)]
fn current_parent_tgid(offsets: &TaskFieldOffsets) -> Option<u32> {
    let task = unsafe { bpf_get_current_task() } as *const u8;
    task_tgid(task_parent(task, offsets)?, offsets)
}

#[inline(always)]
fn current_grandparent_tgid(offsets: &TaskFieldOffsets) -> Option<u32> {
    let task = unsafe { bpf_get_current_task() } as *const u8;
    let parent = task_parent(task, offsets)?;
    task_tgid(task_parent(parent, offsets)?, offsets)
}

/// Walk the parent chain probing the connections map at each tgid.
/// Bounded by ANCESTOR_WALK_LIMIT hops.
#[inline(always)]
fn find_ancestor_connection(offsets: &TaskFieldOffsets) -> Option<*mut Connection> {
    let mut task = unsafe { bpf_get_current_task() } as *const u8;

    for _ in 0..ANCESTOR_WALK_LIMIT {
        let tgid = task_tgid(task, offsets)?;
        if tgid <= 1 {
            break;
        }
        if let Some(conn) = CONNECTIONS.get_ptr_mut(&tgid) {
            return Some(conn);
        }
        task = task_parent(task, offsets)?;
    }

    None
}

/// Quarter-second terminal byte budget per connection. Crossing the bucket
/// cap drops the read; the first drop in a bucket emits the notice payload.
/// Bucket state lives in the connection row under per-key map atomicity.
fn is_rate_limited(conn: &mut Connection, new_bytes: i64, ptm_tgid: u32) -> bool {
    let bucket_ns = NANOS_PER_SEC / RATE_LIMIT_BUCKETS_PER_SECOND as u64;
    let bucket = (unsafe { bpf_ktime_get_ns() } / bucket_ns) as i64;

    if bucket != conn.rate_limit_bucket {
        conn.rate_limit_bucket = bucket;
        conn.rate_limit_hit = 0;
        conn.rate_limit_bytes = 0;
    }

    conn.rate_limit_bytes += new_bytes;
    if conn.rate_limit_bytes > RATE_LIMIT_MAX_BYTES_PER_SECOND / RATE_LIMIT_BUCKETS_PER_SECOND {
        if conn.rate_limit_hit == 0 {
            conn.rate_limit_hit = 1;

            if let Some(mut entry) = EVENTS.reserve::<TerminalUpdateEvent>(0) {
                let event = unsafe { entry.as_mut_ptr().as_mut().unwrap() };
                event.event_type = event_type::TERMINAL_UPDATE;
                event.ptm_pid = ptm_tgid;
                event.data_len = RATE_LIMIT_NOTICE.len() as i32;
                for i in 0..RATE_LIMIT_NOTICE.len() {
                    event.terminal_data[i] = RATE_LIMIT_NOTICE[i];
                }
                entry.submit(0);
            }
        }
        return true;
    }

    false
}

// =============================================================================
// accept: stash the peer sockaddr for the clone that follows
// =============================================================================

/// Tracepoint arguments for sys_enter_accept
/// See: /sys/kernel/debug/tracing/events/syscalls/sys_enter_accept/format
#[repr(C)]
struct SysEnterAcceptArgs {
    _common_type: u16,
    _common_flags: u8,
    _common_preempt_count: u8,
    _common_pid: i32,
    _syscall_nr: i32,
    _pad: i32,
    fd: i64,
    /// struct sockaddr * of the peer
    sockaddr_ptr: u64,
    addrlen_ptr: u64,
}

/// Shared by the sys_exit_* tracepoints: only the return value matters
#[repr(C)]
struct SysExitArgs {
    _common_type: u16,
    _common_flags: u8,
    _common_preempt_count: u8,
    _common_pid: i32,
    _syscall_nr: i32,
    _pad: i32,
    ret: i64,
}

#[tracepoint]
pub fn sys_enter_accept(ctx: TracePointContext) -> u32 {
    match try_sys_enter_accept(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_sys_enter_accept(ctx: &TracePointContext) -> Result<(), i64> {
    if !comm_is_sshd() {
        return Ok(());
    }

    let args: SysEnterAcceptArgs = unsafe { ctx.read_at(0).map_err(|_| 1i64)? };
    let pid_tgid = bpf_get_current_pid_tgid();

    let pending = PendingAccept {
        sockaddr_ptr: args.sockaddr_ptr,
        tcp_info: TcpInfo {
            server_ip: 0,
            client_ip: 0,
            server_port: 0,
            client_port: 0,
        },
    };
    PENDING_ACCEPTS
        .insert(&pid_tgid, &pending, 0)
        .map_err(|_| 1i64)?;

    Ok(())
}

#[tracepoint]
pub fn sys_exit_accept(ctx: TracePointContext) -> u32 {
    match try_sys_exit_accept(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_sys_exit_accept(ctx: &TracePointContext) -> Result<(), i64> {
    if !comm_is_sshd() {
        return Ok(());
    }

    let _args: SysExitArgs = unsafe { ctx.read_at(0).map_err(|_| 1i64)? };
    let pid_tgid = bpf_get_current_pid_tgid();

    let pending = PENDING_ACCEPTS.get_ptr_mut(&pid_tgid).ok_or(1i64)?;
    let sockaddr_ptr = unsafe { (*pending).sockaddr_ptr };
    if sockaddr_ptr == 0 {
        return Err(1);
    }

    let family: u16 =
        unsafe { bpf_probe_read_user(sockaddr_ptr as *const u16) }.map_err(|_| 1i64)?;

    if family == AF_INET {
        let sa: SockaddrIn =
            unsafe { bpf_probe_read_user(sockaddr_ptr as *const SockaddrIn) }.map_err(|_| 1i64)?;

        unsafe {
            // Server side is unknown until the /proc scan or never; the
            // client side is what the peer sockaddr carries.
            (*pending).tcp_info.client_ip = sa.sin_addr;
            (*pending).tcp_info.client_port = u16::from_be(sa.sin_port);
            (*pending).tcp_info.server_ip = 0;
            (*pending).tcp_info.server_port = 0;
        }
    }
    // TODO: AF_INET6 peers are currently dropped; needs a widened TcpInfo

    Ok(())
}

// =============================================================================
// clone: classify which stage of the session lineage just forked
// =============================================================================

#[tracepoint]
pub fn sys_exit_clone(ctx: TracePointContext) -> u32 {
    match try_sys_exit_clone(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_sys_exit_clone(ctx: &TracePointContext) -> Result<(), i64> {
    if !comm_is_sshd() {
        return Ok(());
    }

    let args: SysExitArgs = unsafe { ctx.read_at(0).map_err(|_| 1i64)? };
    let child_tgid = args.ret as i32;

    let pid_tgid = bpf_get_current_pid_tgid();
    let tgid = (pid_tgid >> 32) as u32;

    // ptm forking the pts: the caller already owns a connection row
    if let Some(conn) = CONNECTIONS.get_ptr_mut(&tgid) {
        unsafe {
            (*conn).pts_tgid = child_tgid;
        }
        return Ok(());
    }

    // listener forking the ptm: a pending accept identifies it
    if unsafe { PENDING_ACCEPTS.get(&pid_tgid) }.is_some() {
        return handle_new_connection(pid_tgid, child_tgid as u32);
    }

    // pts forking the user shell: the caller's parent owns the row.
    // The fd mapping for the PTY slave is too version-dependent to chase
    // through ioctl/dup in here; signal user space to resolve the fds from
    // /proc/[pid]/fd and write them back into the connection row.
    if child_tgid != 0 {
        let offsets = task_offsets();
        if let Some(parent_tgid) = current_parent_tgid(&offsets) {
            if unsafe { CONNECTIONS.get(&parent_tgid) }.is_some() {
                if let Some(mut entry) = EVENTS.reserve::<ShellCloneEvent>(0) {
                    let event = unsafe { entry.as_mut_ptr().as_mut().unwrap() };
                    event.event_type = event_type::SHELL_CLONED;
                    event.ptm_pid = parent_tgid;
                    event.pts_pid = tgid;
                    event.shell_pid = child_tgid as u32;
                    entry.submit(0);
                }
            }
        }
    }

    Ok(())
}

fn handle_new_connection(listener_pid_tgid: u64, ptm_tgid: u32) -> Result<(), i64> {
    let pending = unsafe { PENDING_ACCEPTS.get(&listener_pid_tgid) }.ok_or(1i64)?;

    let mut conn = Connection::zeroed();
    conn.ptm_tgid = ptm_tgid as i32;
    conn.pts_tgid = PID_NONE;
    conn.shell_tgid = PID_NONE;
    conn.tty_id = PID_NONE;
    conn.user_id = PID_NONE;
    conn.pts_fd = PID_NONE;
    conn.pts_fd2 = PID_NONE;
    conn.pts_fd3 = PID_NONE;
    conn.tcp_info = pending.tcp_info;
    conn.start_time = unsafe { bpf_ktime_get_ns() };

    let _ = PENDING_ACCEPTS.remove(&listener_pid_tgid);

    CONNECTIONS
        .insert(&ptm_tgid, &conn, 0)
        .map_err(|_| 1i64)?;

    if let Some(mut entry) = EVENTS.reserve::<ConnectionEvent>(0) {
        let event = unsafe { entry.as_mut_ptr().as_mut().unwrap() };
        event.event_type = event_type::NEW_CONNECTION;
        event.ptm_pid = ptm_tgid;
        event.conn = conn;
        entry.submit(0);
    }

    Ok(())
}

// =============================================================================
// execve / execveat: command tracking
// =============================================================================

/// Tracepoint arguments for sys_enter_execve / sys_enter_execveat
/// See: /sys/kernel/debug/tracing/events/syscalls/sys_enter_execve/format
#[repr(C)]
struct SysEnterExecArgs {
    _common_type: u16,
    _common_flags: u8,
    _common_preempt_count: u8,
    _common_pid: i32,
    _syscall_nr: i32,
    _pad: i32,
    filename_ptr: u64,
    argv_ptr: u64,
    envp_ptr: u64,
}

#[tracepoint]
pub fn sys_enter_execve(ctx: TracePointContext) -> u32 {
    match try_exec_common(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn sys_enter_execveat(ctx: TracePointContext) -> u32 {
    match try_exec_common(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_exec_common(ctx: &TracePointContext) -> Result<(), i64> {
    let args: SysEnterExecArgs = unsafe { ctx.read_at(0).map_err(|_| 1i64)? };

    let offsets = task_offsets();
    let conn = find_ancestor_connection(&offsets).ok_or(1i64)?;
    let conn_tgid = unsafe { (*conn).ptm_tgid } as u32;

    let parent_tgid = current_parent_tgid(&offsets).unwrap_or(0);
    let current_tgid = (bpf_get_current_pid_tgid() >> 32) as u32;

    let cmd = COMMAND_SCRATCH.get_ptr_mut(0).ok_or(1i64)?;
    let cmd = unsafe { &mut *cmd };

    cmd.start_time = unsafe { bpf_ktime_get_ns() };
    cmd.end_time = 0;
    cmd.exit_code = -1;
    cmd.stdout_offset = 0;
    cmd.parent_tgid = parent_tgid;
    cmd.current_tgid = current_tgid;
    cmd.conn_tgid = conn_tgid;
    cmd.filename[0] = 0;
    cmd.stdout[0] = 0;
    cmd.args[0] = 0;

    // The command name comes from argv[0]; the syscall's path argument is
    // kept for the args field where it is not bounded to a bare name.
    if let Ok(argv0_ptr) = unsafe { bpf_probe_read_user(args.argv_ptr as *const u64) } {
        if argv0_ptr != 0 {
            let _ = unsafe {
                bpf_probe_read_user_str_bytes(argv0_ptr as *const u8, &mut cmd.filename)
            };
        }
    }

    // args = full path, then argv[1..ARGV_SLOTS], single spaces between.
    // Offsets are masked by ARGS_CAP - 1; truncation past the cap is silent.
    let mut argoffset: usize = 0;
    if let Ok(s) = unsafe {
        bpf_probe_read_user_str_bytes(args.filename_ptr as *const u8, &mut cmd.args[..ARGS_CAP])
    } {
        argoffset = s.len() + 1;
        cmd.args[(argoffset - 1) & (ARGS_CAP - 1)] = b' ';
        if argoffset != ARGS_CAP {
            argoffset &= ARGS_CAP - 1;
        }
    }

    for i in 1..ARGV_SLOTS {
        let argv_p: u64 =
            unsafe { bpf_probe_read_user((args.argv_ptr as *const u64).add(i)) }.unwrap_or(0);
        if argv_p == 0 {
            break;
        }

        if argoffset >= ARGS_CAP {
            // capacity exhausted; keep draining argv so the loop bound holds
            continue;
        }

        let read = unsafe {
            bpf_probe_read_user_str_bytes(argv_p as *const u8, &mut cmd.args[argoffset..ARGS_CAP])
        };
        let Ok(s) = read else { break };

        let bytes_read = s.len() + 1;
        argoffset += bytes_read;
        cmd.args[(argoffset - 1) & (ARGS_CAP - 1)] = b' ';

        // Keep the exact-cap value out of the mask so it is not zeroed
        if argoffset != ARGS_CAP {
            argoffset &= ARGS_CAP - 1;
        }
    }
    cmd.args[argoffset.wrapping_sub(1) & (ARGS_CAP - 1)] = 0;

    COMMANDS
        .insert(&current_tgid, cmd, 0)
        .map_err(|_| 1i64)?;

    if let Some(mut entry) = EVENTS.reserve::<CommandEvent>(0) {
        let event = unsafe { entry.as_mut_ptr().as_mut().unwrap() };
        event.event_type = event_type::COMMAND_START;
        event.ptm_pid = conn_tgid;
        copy_command(cmd, &mut event.cmd);
        entry.submit(0);
    }

    Ok(())
}

/// Command is too large for an inline copy; route it through the probe-read
/// helper instead.
#[inline(always)]
fn copy_command(src: &Command, dst: &mut Command) {
    let src_ptr = src as *const Command as *const u8;
    let dst_bytes = unsafe {
        core::slice::from_raw_parts_mut(
            dst as *mut Command as *mut u8,
            core::mem::size_of::<Command>(),
        )
    };
    let _ = unsafe { bpf_probe_read_kernel_buf(src_ptr, dst_bytes) };
}

// =============================================================================
// exit_group: session teardown and command completion
// =============================================================================

/// Tracepoint arguments for sys_enter_exit_group
#[repr(C)]
struct SysEnterExitGroupArgs {
    _common_type: u16,
    _common_flags: u8,
    _common_preempt_count: u8,
    _common_pid: i32,
    _syscall_nr: i32,
    _pad: i32,
    error_code: i64,
}

#[tracepoint]
pub fn sys_enter_exit_group(ctx: TracePointContext) -> u32 {
    match try_sys_enter_exit_group(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_sys_enter_exit_group(ctx: &TracePointContext) -> Result<(), i64> {
    let args: SysEnterExitGroupArgs = unsafe { ctx.read_at(0).map_err(|_| 1i64)? };
    let current_tgid = (bpf_get_current_pid_tgid() >> 32) as u32;

    if let Some(conn) = CONNECTIONS.get_ptr_mut(&current_tgid) {
        unsafe {
            (*conn).end_time = bpf_ktime_get_ns();
        }

        if let Some(mut entry) = EVENTS.reserve::<ConnectionEvent>(0) {
            let event = unsafe { entry.as_mut_ptr().as_mut().unwrap() };
            event.event_type = event_type::CLOSE_CONNECTION;
            event.ptm_pid = current_tgid;
            event.conn = unsafe { *conn };
            entry.submit(0);
        }

        let _ = CONNECTIONS.remove(&current_tgid);
        return Ok(());
    }

    if let Some(cmd) = COMMANDS.get_ptr_mut(&current_tgid) {
        unsafe {
            (*cmd).end_time = bpf_ktime_get_ns();
            (*cmd).exit_code = args.error_code as i32;
        }

        if let Some(mut entry) = EVENTS.reserve::<CommandEvent>(0) {
            let event = unsafe { entry.as_mut_ptr().as_mut().unwrap() };
            event.event_type = event_type::COMMAND_END;
            event.ptm_pid = unsafe { (*cmd).conn_tgid };
            copy_command(unsafe { &*cmd }, &mut event.cmd);
            entry.submit(0);
        }

        let _ = COMMANDS.remove(&current_tgid);
        return Ok(());
    }

    Err(1)
}

// =============================================================================
// write: stdout/stderr capture for tracked commands
// =============================================================================

/// Tracepoint arguments for sys_enter_write
#[repr(C)]
struct SysEnterWriteArgs {
    _common_type: u16,
    _common_flags: u8,
    _common_preempt_count: u8,
    _common_pid: i32,
    _syscall_nr: i32,
    _pad: i32,
    fd: u64,
    buf_ptr: u64,
    count: u64,
}

#[tracepoint]
pub fn sys_enter_write(ctx: TracePointContext) -> u32 {
    match try_sys_enter_write(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_sys_enter_write(ctx: &TracePointContext) -> Result<(), i64> {
    let args: SysEnterWriteArgs = unsafe { ctx.read_at(0).map_err(|_| 1i64)? };

    let fd = args.fd as u32;
    if fd != 1 && fd != 2 {
        return Ok(());
    }

    let current_tgid = (bpf_get_current_pid_tgid() >> 32) as u32;
    let cmd = COMMANDS.get_ptr_mut(&current_tgid).ok_or(1i64)?;
    let cmd = unsafe { &mut *cmd };

    if cmd.stdout_offset >= STDOUT_CAP as u32 {
        // already collected the cap for this process
        return Ok(());
    }

    let offset = (cmd.stdout_offset as usize) & (STDOUT_CAP - 1);
    let remaining = STDOUT_CAP - offset;
    let count = args.count as usize;
    let amount = if count < remaining { count } else { remaining };
    if amount == 0 {
        return Ok(());
    }

    // The mask keeps the verifier happy without clipping a whole-cap write;
    // STDOUT_BUF_LEN is double the cap so offset + amount stays in range.
    let amount = amount & (STDOUT_BUF_LEN - 1);
    let end = offset + amount;
    if end >= STDOUT_BUF_LEN {
        return Ok(());
    }

    let _ = unsafe {
        bpf_probe_read_user_buf(args.buf_ptr as *const u8, &mut cmd.stdout[offset..end])
    };
    // Terminate for the C-string view; an appending write overwrites this
    cmd.stdout[end] = 0;
    cmd.stdout_offset += amount as u32;

    Ok(())
}

// =============================================================================
// read: terminal capture off the PTY slave descriptors
// =============================================================================

/// Tracepoint arguments for sys_enter_read
#[repr(C)]
struct SysEnterReadArgs {
    _common_type: u16,
    _common_flags: u8,
    _common_preempt_count: u8,
    _common_pid: i32,
    _syscall_nr: i32,
    _pad: i32,
    fd: u64,
    buf_ptr: u64,
    count: u64,
}

#[tracepoint]
pub fn sys_enter_read(ctx: TracePointContext) -> u32 {
    match try_sys_enter_read(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_sys_enter_read(ctx: &TracePointContext) -> Result<(), i64> {
    let args: SysEnterReadArgs = unsafe { ctx.read_at(0).map_err(|_| 1i64)? };

    // Cheap bounce before any map lookups: terminal reads are never on the
    // standard descriptors and never outside sshd
    let fd = args.fd as i32;
    if fd == 0 || fd == 1 || fd == 2 || !comm_is_sshd() {
        return Ok(());
    }

    let offsets = task_offsets();
    let parent_tgid = current_parent_tgid(&offsets).ok_or(1i64)?;

    let conn = CONNECTIONS.get_ptr_mut(&parent_tgid).ok_or(1i64)?;
    let conn = unsafe { &mut *conn };

    if conn.pts_fd == fd || conn.pts_fd2 == fd || conn.pts_fd3 == fd {
        if is_rate_limited(conn, 0, parent_tgid) {
            return Ok(());
        }

        let pending = PendingRead {
            fd,
            _pad: 0,
            buf_ptr: args.buf_ptr,
        };
        let _ = PENDING_READS.insert(&parent_tgid, &pending, 0);
    }

    Ok(())
}

#[tracepoint]
pub fn sys_exit_read(ctx: TracePointContext) -> u32 {
    match try_sys_exit_read(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_sys_exit_read(ctx: &TracePointContext) -> Result<(), i64> {
    if !comm_is_sshd() {
        return Ok(());
    }

    let args: SysExitArgs = unsafe { ctx.read_at(0).map_err(|_| 1i64)? };
    let ret = args.ret as i32;

    let offsets = task_offsets();
    let parent_tgid = current_parent_tgid(&offsets).ok_or(1i64)?;

    let pending = unsafe { PENDING_READS.get(&parent_tgid) }.ok_or(1i64)?;
    let buf_ptr = pending.buf_ptr;
    if buf_ptr == 0 || ret <= 0 {
        return Ok(());
    }

    let conn = CONNECTIONS.get_ptr_mut(&parent_tgid).ok_or(1i64)?;
    if is_rate_limited(unsafe { &mut *conn }, ret as i64, parent_tgid) {
        return Ok(());
    }

    if let Some(mut entry) = EVENTS.reserve::<TerminalUpdateEvent>(0) {
        let event = unsafe { entry.as_mut_ptr().as_mut().unwrap() };
        event.event_type = event_type::TERMINAL_UPDATE;
        event.ptm_pid = parent_tgid;
        event.data_len = ret;

        let amount = ret as usize;
        let amount = if amount > READ_BUFFER_CAP {
            READ_BUFFER_CAP
        } else {
            amount
        };
        let _ = unsafe {
            bpf_probe_read_user_buf(buf_ptr as *const u8, &mut event.terminal_data[..amount])
        };
        if amount < READ_BUFFER_CAP {
            event.terminal_data[amount] = 0;
        }

        let _ = PENDING_READS.remove(&parent_tgid);
        entry.submit(0);
    }

    Ok(())
}

// =============================================================================
// openat: scp upload detection
// =============================================================================

/// Tracepoint arguments for sys_enter_openat
/// See: /sys/kernel/debug/tracing/events/syscalls/sys_enter_openat/format
#[repr(C)]
struct SysEnterOpenatArgs {
    _common_type: u16,
    _common_flags: u8,
    _common_preempt_count: u8,
    _common_pid: i32,
    _syscall_nr: i32,
    _pad: i32,
    dfd: i64,
    filename_ptr: u64,
    flags: i64,
    mode: i64,
}

#[tracepoint]
pub fn sys_enter_openat(ctx: TracePointContext) -> u32 {
    match try_sys_enter_openat(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_sys_enter_openat(ctx: &TracePointContext) -> Result<(), i64> {
    if !comm_is_scp() {
        return Ok(());
    }

    // scp must be a direct descendant of the pts (no shell in between),
    // otherwise this open is not an upload
    let offsets = task_offsets();
    let gparent_tgid = current_grandparent_tgid(&offsets).ok_or(1i64)?;
    let conn = unsafe { CONNECTIONS.get(&gparent_tgid) }.ok_or(1i64)?;

    let args: SysEnterOpenatArgs = unsafe { ctx.read_at(0).map_err(|_| 1i64)? };
    if args.flags & O_WRONLY == 0 {
        return Ok(());
    }
    if args.filename_ptr == 0 {
        return Ok(());
    }

    if let Some(mut entry) = EVENTS.reserve::<FileUploadEvent>(0) {
        let event = unsafe { entry.as_mut_ptr().as_mut().unwrap() };
        event.event_type = event_type::FILE_UPLOAD;
        event.ptm_pid = conn.ptm_tgid as u32;
        event.file_mode = args.mode as u32;
        event.target_path = [0u8; TARGET_PATH_CAP];
        let _ = unsafe {
            bpf_probe_read_user_str_bytes(args.filename_ptr as *const u8, &mut event.target_path)
        };
        entry.submit(0);
    }

    Ok(())
}

// =============================================================================
// Required for eBPF programs
// =============================================================================

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
