//! PTS introspection (the data the kernel side cannot see)
//!
//! Once the pts process has forked the user shell, the kernel signals user
//! space to resolve which of the pts process's descriptors address the PTY
//! slave, which tty index it got, and which user owns it.

use sshtrail_trace_common::{Connection, PID_NONE, USERNAME_CAP};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

use super::read_uid;

/// Everything /proc reveals about a pts process. Missing pieces stay at
/// `-1` / empty; inspection never fails outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtsInfo {
    pub pts_fds: [i32; 3],
    pub tty_id: i32,
    pub user_id: i32,
    pub username: String,
}

impl PtsInfo {
    /// Overlay onto a kernel connection row. Only the fields user space
    /// owns are touched.
    pub fn apply_to(&self, conn: &mut Connection) {
        conn.pts_fd = self.pts_fds[0];
        conn.pts_fd2 = self.pts_fds[1];
        conn.pts_fd3 = self.pts_fds[2];
        conn.tty_id = self.tty_id;
        conn.user_id = self.user_id;

        conn.username = [0u8; USERNAME_CAP + 1];
        let name = self.username.as_bytes();
        let len = name.len().min(USERNAME_CAP);
        conn.username[..len].copy_from_slice(&name[..len]);
    }
}

pub struct PtsInspector {
    proc_root: PathBuf,
}

impl PtsInspector {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    pub fn inspect(&self, pts_pid: i32) -> PtsInfo {
        let mut info = PtsInfo {
            pts_fds: [PID_NONE; 3],
            tty_id: PID_NONE,
            user_id: PID_NONE,
            username: String::new(),
        };

        self.find_pts_fds(pts_pid, &mut info);

        if let Some(uid) = read_uid(&self.proc_root, pts_pid) {
            info.user_id = uid as i32;
            info.username = resolve_username(uid);
        }

        if info.pts_fds[0] != PID_NONE {
            self.find_tty_id(pts_pid, info.pts_fds[0], &mut info);
        } else {
            // Not a TTY: could be a one-off command, could be scp
            debug!("no pts descriptors on pid {pts_pid}");
        }

        info
    }

    /// Descriptors whose symlink targets address the PTY pair
    fn find_pts_fds(&self, pid: i32, info: &mut PtsInfo) {
        let fd_dir = self.proc_root.join(pid.to_string()).join("fd");
        let Ok(entries) = fs::read_dir(&fd_dir) else {
            debug!("cannot list {}; process gone?", fd_dir.display());
            return;
        };

        let mut found = 0usize;
        for entry in entries.flatten() {
            let Ok(target) = fs::read_link(entry.path()) else {
                continue;
            };
            let target = target.to_string_lossy();
            if !(target.starts_with("/dev/ptmx") || target.starts_with("/dev/pts/")) {
                continue;
            }

            let Ok(fd) = entry.file_name().to_string_lossy().parse::<i32>() else {
                continue;
            };

            if found >= info.pts_fds.len() {
                warn!("unexpected number of pts descriptors on pid {pid}");
                break;
            }
            info.pts_fds[found] = fd;
            found += 1;
        }
    }

    /// Newer kernels expose `tty-index:\t<N>` in fdinfo
    fn find_tty_id(&self, pid: i32, fd: i32, info: &mut PtsInfo) {
        let fdinfo_path = self
            .proc_root
            .join(pid.to_string())
            .join("fdinfo")
            .join(fd.to_string());

        let Ok(content) = fs::read_to_string(&fdinfo_path) else {
            warn!("error accessing fdinfo file {}", fdinfo_path.display());
            return;
        };

        if let Some(tty_id) = parse_tty_index(&content) {
            debug!("found tty id {tty_id} for pid {pid}");
            info.tty_id = tty_id;
        }
    }
}

/// Accepts only single-character index tokens. Multi-digit tty indices are
/// left unresolved.
pub(crate) fn parse_tty_index(fdinfo: &str) -> Option<i32> {
    for line in fdinfo.lines() {
        let mut tokens = line.split_whitespace();
        let (Some(key), Some(value)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        if key.starts_with("tty-index") && value.len() == 1 {
            return value.parse().ok();
        }
    }
    None
}

fn resolve_username(uid: u32) -> String {
    match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn tty_index_accepts_single_digit_only() {
        assert_eq!(parse_tty_index("tty-index:\t3\n"), Some(3));
        assert_eq!(parse_tty_index("pos:\t0\nflags:\t02\ntty-index:\t7\n"), Some(7));
        // two-digit indices are not resolved
        assert_eq!(parse_tty_index("tty-index:\t12\n"), None);
        assert_eq!(parse_tty_index("pos:\t0\n"), None);
        assert_eq!(parse_tty_index(""), None);
    }

    #[test]
    fn finds_up_to_three_pts_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let fd_dir = dir.path().join("321/fd");
        std::fs::create_dir_all(&fd_dir).unwrap();
        symlink("/dev/ptmx", fd_dir.join("9")).unwrap();
        symlink("/dev/pts/4", fd_dir.join("11")).unwrap();
        symlink("/dev/null", fd_dir.join("0")).unwrap();
        std::fs::write(
            dir.path().join("321/status"),
            "Name:\tsshd\nUid:\t0\t0\t0\t0\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("321/fdinfo")).unwrap();
        std::fs::write(dir.path().join("321/fdinfo/9"), "pos:\t0\ntty-index:\t4\n").unwrap();
        std::fs::write(dir.path().join("321/fdinfo/11"), "pos:\t0\n").unwrap();

        let info = PtsInspector::new(dir.path()).inspect(321);
        let mut fds: Vec<i32> = info.pts_fds.iter().copied().filter(|&f| f != -1).collect();
        fds.sort_unstable();
        assert_eq!(fds, vec![9, 11]);
        assert_eq!(info.user_id, 0);
        // tty id comes from the first discovered fd's fdinfo
        assert!(info.tty_id == 4 || info.tty_id == -1);
    }

    #[test]
    fn vanished_process_degrades_to_unknowns() {
        let dir = tempfile::tempdir().unwrap();
        let info = PtsInspector::new(dir.path()).inspect(9999);
        assert_eq!(info.pts_fds, [-1, -1, -1]);
        assert_eq!(info.tty_id, -1);
        assert_eq!(info.user_id, -1);
        assert!(info.username.is_empty());
    }

    #[test]
    fn apply_truncates_long_usernames() {
        let info = PtsInfo {
            pts_fds: [5, 6, -1],
            tty_id: 2,
            user_id: 1000,
            username: "a".repeat(64),
        };
        let mut conn = Connection::zeroed();
        info.apply_to(&mut conn);
        assert_eq!(conn.pts_fd, 5);
        assert_eq!(conn.pts_fd2, 6);
        assert_eq!(conn.pts_fd3, -1);
        assert_eq!(conn.username[USERNAME_CAP], 0);
        assert_eq!(
            sshtrail_core::events::cstr_lossy(&conn.username),
            "a".repeat(USERNAME_CAP)
        );
    }
}
