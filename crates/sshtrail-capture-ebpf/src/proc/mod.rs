//! /proc parsing shared by the introspector and the startup scanner
//!
//! Every reader here is race-tolerant: tasks can vanish between listing and
//! inspection, so failures map to `None`/empty and the caller skips.

pub mod existing;
pub mod pts;

use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// TCP_LISTEN in /proc/net/tcp's `st` column
pub(crate) const TCP_STATE_LISTEN: u8 = 0x0a;

pub(crate) fn read_comm(proc_root: &Path, pid: i32) -> Option<String> {
    fs::read_to_string(proc_root.join(pid.to_string()).join("comm"))
        .ok()
        .map(|s| s.trim().to_string())
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StatFields {
    pub ppid: i32,
    /// Process start, jiffies since boot
    pub starttime_jiffies: u64,
}

pub(crate) fn read_stat(proc_root: &Path, pid: i32) -> Option<StatFields> {
    let stat = fs::read_to_string(proc_root.join(pid.to_string()).join("stat")).ok()?;
    parse_stat_fields(&stat)
}

/// Format: pid (comm) state ppid ... starttime ...
/// comm can contain spaces and parens, so parse from the last `)`.
pub(crate) fn parse_stat_fields(stat: &str) -> Option<StatFields> {
    let close_paren = stat.rfind(')')?;
    let after_comm = &stat[close_paren + 1..];

    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // after comm: state(0) ppid(1) ... starttime(19)
    let ppid = fields.get(1)?.parse().ok()?;
    let starttime_jiffies = fields.get(19)?.parse().ok()?;

    Some(StatFields {
        ppid,
        starttime_jiffies,
    })
}

/// Real UID from /proc/<pid>/status
pub(crate) fn read_uid(proc_root: &Path, pid: i32) -> Option<u32> {
    let status = fs::read_to_string(proc_root.join(pid.to_string()).join("status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            // Uid: real effective saved fs
            return rest.split_whitespace().next()?.parse().ok();
        }
    }
    None
}

/// Socket inodes held by a process, from its fd symlinks
pub(crate) fn socket_inodes(proc_root: &Path, pid: i32) -> HashSet<u64> {
    let mut inodes = HashSet::new();

    let fd_dir = proc_root.join(pid.to_string()).join("fd");
    let Ok(entries) = fs::read_dir(&fd_dir) else {
        // permission denied or process exited
        return inodes;
    };

    for entry in entries.flatten() {
        let Ok(target) = fs::read_link(entry.path()) else {
            continue;
        };
        let target = target.to_string_lossy();
        if let Some(inode) = target
            .strip_prefix("socket:[")
            .and_then(|t| t.strip_suffix(']'))
        {
            if let Ok(inode) = inode.parse() {
                inodes.insert(inode);
            }
        }
    }

    inodes
}

/// One row of /proc/net/tcp
#[derive(Debug, Clone)]
pub(crate) struct TcpTableEntry {
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub state: u8,
    pub inode: u64,
}

pub(crate) fn read_tcp_table(proc_root: &Path) -> Vec<TcpTableEntry> {
    let Ok(content) = fs::read_to_string(proc_root.join("net/tcp")) else {
        return Vec::new();
    };
    content.lines().skip(1).filter_map(parse_tcp_line).collect()
}

/// Format: sl local_address rem_address st tx_queue rx_queue tr tm->when
/// retrnsmt uid timeout inode ...
fn parse_tcp_line(line: &str) -> Option<TcpTableEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return None;
    }

    let (local_ip, local_port) = parse_hex_addr(parts[1])?;
    let (remote_ip, remote_port) = parse_hex_addr(parts[2])?;
    let state = u8::from_str_radix(parts[3], 16).ok()?;
    let inode = parts[9].parse().ok()?;

    Some(TcpTableEntry {
        local_ip,
        local_port,
        remote_ip,
        remote_port,
        state,
        inode,
    })
}

/// Hex address format AABBCCDD:PORT; the IP half is a native-endian dump of
/// the network-byte-order address
pub(crate) fn parse_hex_addr(hex: &str) -> Option<(Ipv4Addr, u16)> {
    let (ip_hex, port_hex) = hex.split_once(':')?;
    let ip_raw = u32::from_str_radix(ip_hex, 16).ok()?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    Some((Ipv4Addr::from(ip_raw.to_ne_bytes()), port))
}

/// Back to the raw form the kernel sees in sockaddr_in
pub(crate) fn ipv4_to_net_u32(ip: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(ip.octets())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_parsing_handles_awkward_comms() {
        let stat = "1234 (sshd) S 1000 1234 1234 0 -1 4194560 100 0 0 0 1 2 0 0 20 0 1 0 5555 1000000 100 18446744073709551615";
        let fields = parse_stat_fields(stat).unwrap();
        assert_eq!(fields.ppid, 1000);
        assert_eq!(fields.starttime_jiffies, 5555);

        let stat = "5678 (Web Content) S 1234 5678 5678 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 777 0 0 0";
        assert_eq!(parse_stat_fields(stat).unwrap().ppid, 1234);

        let stat = "9999 (my (cool) app) S 100 9999 9999 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 88 0 0 0";
        let fields = parse_stat_fields(stat).unwrap();
        assert_eq!(fields.ppid, 100);
        assert_eq!(fields.starttime_jiffies, 88);
    }

    #[test]
    fn stat_parsing_rejects_short_lines() {
        assert!(parse_stat_fields("1 (init) S 0").is_none());
        assert!(parse_stat_fields("garbage").is_none());
    }

    #[test]
    fn hex_addr_round_trips() {
        // 127.0.0.1:8080 appears as 0100007F:1F90 on little-endian hosts;
        // build the expected string from the raw value to stay portable
        let raw = ipv4_to_net_u32(Ipv4Addr::new(127, 0, 0, 1));
        let line = format!("{raw:08X}:1F90");
        let (ip, port) = parse_hex_addr(&line).unwrap();
        assert_eq!(ip, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(port, 8080);
    }

    #[test]
    fn tcp_line_parses_state_and_inode() {
        let raw = ipv4_to_net_u32(Ipv4Addr::new(10, 0, 0, 5));
        let line = format!(
            "   1: {raw:08X}:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000   0        0 12345 1 0000000000000000 100 0 0 10 0"
        );
        let entry = parse_tcp_line(&line).unwrap();
        assert_eq!(entry.local_ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(entry.local_port, 22);
        assert_eq!(entry.state, TCP_STATE_LISTEN);
        assert_eq!(entry.inode, 12345);
    }

    #[test]
    fn uid_parse_reads_real_uid() {
        let dir = tempfile::tempdir().unwrap();
        let pid_dir = dir.path().join("42");
        std::fs::create_dir_all(&pid_dir).unwrap();
        std::fs::write(
            pid_dir.join("status"),
            "Name:\tsshd\nUid:\t1000\t1000\t1000\t1000\nGid:\t1000\t1000\t1000\t1000\n",
        )
        .unwrap();

        assert_eq!(read_uid(dir.path(), 42), Some(1000));
        assert_eq!(read_uid(dir.path(), 43), None);
    }
}
