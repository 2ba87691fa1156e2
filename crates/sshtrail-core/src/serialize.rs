//! The emitted JSON schema
//!
//! Every event becomes one minified UTF-8 JSON object. Shapes are fixed
//! serde structs rather than ad-hoc string formatting so integers stay
//! integers and nested objects stay nested.

use crate::clock::WallClockTranslator;
use crate::events::{ConnectionPhase, ConnectionSnapshot, SessionEvent, TcpEndpoints};
use parking_lot::Mutex;
use serde::Serialize;
use std::borrow::Cow;
use std::net::Ipv4Addr;

#[derive(Serialize)]
struct TcpInfoRecord {
    server_ip: String,
    client_ip: String,
    server_port: u16,
    client_port: u16,
}

impl TcpInfoRecord {
    fn from_endpoints(tcp: &TcpEndpoints) -> Self {
        Self {
            server_ip: format_ip(tcp.server_ip),
            client_ip: format_ip(tcp.client_ip),
            server_port: tcp.server_port,
            client_port: tcp.client_port,
        }
    }
}

#[derive(Serialize)]
struct ConnectionRecord<'a> {
    event_type: &'static str,
    ptm_pid: u32,
    user_id: i32,
    username: &'a str,
    pts_pid: i32,
    shell_pid: i32,
    tty_id: i32,
    start_time: i64,
    end_time: i64,
    start_timeraw: u64,
    end_timeraw: u64,
    tcp_info: TcpInfoRecord,
}

#[derive(Serialize)]
struct CommandRecord<'a> {
    event_type: &'static str,
    ptm_pid: u32,
    filename: &'a str,
    start_time: i64,
    end_time: i64,
    exit_code: i32,
    stdout_size: u32,
    stdout: &'a str,
    args: &'a str,
    parent_pid: u32,
    pid: u32,
}

#[derive(Serialize)]
struct TerminalRecord<'a> {
    event_type: &'static str,
    ptm_pid: u32,
    terminal_data: Cow<'a, str>,
    data_len: usize,
}

#[derive(Serialize)]
struct FileUploadRecord<'a> {
    event_type: &'static str,
    ptm_pid: u32,
    target_path: &'a str,
    file_mode: String,
}

/// A raw zero means "unknown", emitted as the literal "0" rather than
/// 0.0.0.0
fn format_ip(raw_net_order: u32) -> String {
    if raw_net_order == 0 {
        "0".to_string()
    } else {
        Ipv4Addr::from(raw_net_order.to_ne_bytes()).to_string()
    }
}

/// Serializes session events to single-line JSON. Shared by the pipeline
/// ingest thread and the failed-login watcher, hence the mutex around the
/// clock state.
#[derive(Default)]
pub struct EventSerializer {
    clock: Mutex<WallClockTranslator>,
}

impl EventSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serialize(&self, event: &SessionEvent) -> serde_json::Result<String> {
        match event {
            SessionEvent::Connection { phase, snapshot } => {
                self.serialize_connection(*phase, snapshot)
            }
            SessionEvent::Command { phase, snapshot } => {
                let (start_time, end_time) = {
                    let mut clock = self.clock.lock();
                    (
                        clock.to_wall_ms(snapshot.start_time),
                        clock.to_wall_ms(snapshot.end_time),
                    )
                };
                serde_json::to_string(&CommandRecord {
                    event_type: phase.event_name(),
                    ptm_pid: snapshot.ptm_pid,
                    filename: &snapshot.filename,
                    start_time,
                    end_time,
                    exit_code: snapshot.exit_code,
                    stdout_size: snapshot.stdout_size,
                    stdout: &snapshot.stdout,
                    args: &snapshot.args,
                    parent_pid: snapshot.parent_pid,
                    pid: snapshot.pid,
                })
            }
            SessionEvent::Terminal { ptm_pid, data } => serde_json::to_string(&TerminalRecord {
                event_type: "terminal_update",
                ptm_pid: *ptm_pid,
                terminal_data: String::from_utf8_lossy(data),
                data_len: data.len(),
            }),
            SessionEvent::FileUpload {
                ptm_pid,
                target_path,
                file_mode,
            } => serde_json::to_string(&FileUploadRecord {
                event_type: "file_upload",
                ptm_pid: *ptm_pid,
                target_path,
                file_mode: format!("{:03o}", file_mode & 0o777),
            }),
        }
    }

    fn serialize_connection(
        &self,
        phase: ConnectionPhase,
        snapshot: &ConnectionSnapshot,
    ) -> serde_json::Result<String> {
        // Auth failures are born with wall-clock millisecond timestamps;
        // kernel events need translating from boot-time ns
        let (start_time, end_time) = if phase.timestamps_are_wall_ms() {
            (snapshot.start_time as i64, snapshot.end_time as i64)
        } else {
            let mut clock = self.clock.lock();
            (
                clock.to_wall_ms(snapshot.start_time),
                clock.to_wall_ms(snapshot.end_time),
            )
        };

        serde_json::to_string(&ConnectionRecord {
            event_type: phase.event_name(),
            ptm_pid: snapshot.ptm_pid,
            user_id: snapshot.user_id,
            username: &snapshot.username,
            pts_pid: snapshot.pts_pid,
            shell_pid: snapshot.shell_pid,
            tty_id: snapshot.tty_id,
            start_time,
            end_time,
            start_timeraw: snapshot.start_time,
            end_timeraw: snapshot.end_time,
            tcp_info: TcpInfoRecord::from_endpoints(&snapshot.tcp),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CommandPhase, CommandSnapshot};
    use serde_json::Value;

    fn parse(json: &str) -> Value {
        serde_json::from_str(json).unwrap()
    }

    fn sample_connection() -> ConnectionSnapshot {
        ConnectionSnapshot {
            ptm_pid: 1000,
            user_id: 1001,
            username: "alice".into(),
            pts_pid: 1002,
            shell_pid: 1003,
            tty_id: 2,
            start_time: 5_000_000_000,
            end_time: 0,
            tcp: TcpEndpoints {
                server_ip: 0,
                // 10.1.2.3 as stored from a sockaddr_in
                client_ip: u32::from_ne_bytes([10, 1, 2, 3]),
                server_port: 22,
                client_port: 50000,
            },
        }
    }

    #[test]
    fn connection_record_has_full_schema() {
        let serializer = EventSerializer::new();
        let json = serializer
            .serialize(&SessionEvent::Connection {
                phase: ConnectionPhase::New,
                snapshot: sample_connection(),
            })
            .unwrap();

        let v = parse(&json);
        assert_eq!(v["event_type"], "connection_new");
        assert_eq!(v["ptm_pid"], 1000);
        assert_eq!(v["username"], "alice");
        assert_eq!(v["tty_id"], 2);
        assert_eq!(v["start_timeraw"], 5_000_000_000u64);
        assert_eq!(v["end_timeraw"], 0);
        assert_eq!(v["end_time"], 0);
        assert_eq!(v["tcp_info"]["server_ip"], "0");
        assert_eq!(v["tcp_info"]["client_ip"], "10.1.2.3");
        assert_eq!(v["tcp_info"]["server_port"], 22);
        assert_eq!(v["tcp_info"]["client_port"], 50000);
        // translated start must be a wall-clock-looking integer, not raw ns
        assert!(v["start_time"].as_i64().is_some());
    }

    #[test]
    fn auth_failed_timestamps_pass_through_unchanged() {
        let serializer = EventSerializer::new();
        let mut snapshot = sample_connection();
        snapshot.start_time = 1_700_000_000_123;
        snapshot.end_time = 1_700_000_000_123;

        let json = serializer
            .serialize(&SessionEvent::Connection {
                phase: ConnectionPhase::AuthFailed,
                snapshot,
            })
            .unwrap();

        let v = parse(&json);
        assert_eq!(v["event_type"], "connection_auth_failed");
        assert_eq!(v["start_time"], 1_700_000_000_123i64);
        assert_eq!(v["end_time"], 1_700_000_000_123i64);
    }

    #[test]
    fn command_record_fields() {
        let serializer = EventSerializer::new();
        let json = serializer
            .serialize(&SessionEvent::Command {
                phase: CommandPhase::Finish,
                snapshot: CommandSnapshot {
                    ptm_pid: 77,
                    filename: "ls".into(),
                    args: "/usr/bin/ls -la /tmp".into(),
                    stdout: "total 0\n".into(),
                    stdout_size: 8,
                    start_time: 1_000_000,
                    end_time: 2_000_000,
                    exit_code: 0,
                    parent_pid: 70,
                    pid: 71,
                },
            })
            .unwrap();

        let v = parse(&json);
        assert_eq!(v["event_type"], "command_finish");
        assert_eq!(v["filename"], "ls");
        assert_eq!(v["args"], "/usr/bin/ls -la /tmp");
        assert_eq!(v["stdout_size"], 8);
        assert_eq!(v["exit_code"], 0);
        assert_eq!(v["parent_pid"], 70);
        assert_eq!(v["pid"], 71);
    }

    #[test]
    fn file_mode_is_three_octal_digits() {
        let serializer = EventSerializer::new();
        for (mode, expected) in [(0o644u32, "644"), (0o7, "007"), (0o100644, "644"), (0, "000")] {
            let json = serializer
                .serialize(&SessionEvent::FileUpload {
                    ptm_pid: 5,
                    target_path: "/tmp/up".into(),
                    file_mode: mode,
                })
                .unwrap();
            let v = parse(&json);
            assert_eq!(v["file_mode"], *expected, "mode {mode:o}");
        }
    }

    #[test]
    fn terminal_record_counts_bytes_not_chars() {
        let serializer = EventSerializer::new();
        let json = serializer
            .serialize(&SessionEvent::Terminal {
                ptm_pid: 9,
                data: b"echo MARKER\r\n".to_vec(),
            })
            .unwrap();

        let v = parse(&json);
        assert_eq!(v["event_type"], "terminal_update");
        assert_eq!(v["terminal_data"], "echo MARKER\r\n");
        assert_eq!(v["data_len"], 13);
    }

    #[test]
    fn non_utf8_terminal_data_still_serializes() {
        let serializer = EventSerializer::new();
        let json = serializer
            .serialize(&SessionEvent::Terminal {
                ptm_pid: 9,
                data: vec![0xff, 0xfe, b'o', b'k'],
            })
            .unwrap();
        // round-trips as structurally valid JSON
        assert!(parse(&json)["terminal_data"].as_str().is_some());
    }

    #[test]
    fn output_is_single_line_minified() {
        let serializer = EventSerializer::new();
        let json = serializer
            .serialize(&SessionEvent::FileUpload {
                ptm_pid: 1,
                target_path: "/tmp/x".into(),
                file_mode: 0o600,
            })
            .unwrap();
        assert!(!json.contains('\n'));
        assert!(!json.contains(": "));
    }
}
