//! Guest-agent transport.
//!
//! Talks the QEMU guest-agent JSON protocol over a Unix socket. Only three
//! commands are used (`guest-ping`, `guest-exec`, `guest-exec-status`);
//! everything else is built from shell commands run inside the guest.

mod messages;
mod parse;
mod worker;

pub use parse::{parse_process_list, GuestProcess, ProcessCategory};
pub use worker::{AgentHandle, AgentWorker, DEFAULT_REPLY_TIMEOUT};

use crate::error::{HaywireError, Result};
use crate::maps::{parse_maps, MapsEntry};
use crate::pagemap::{decode_pagemap, PagemapEntry};
use crate::protocol::{PAGE_OFFSET_MASK, PAGE_SIZE_U64};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use messages::{Command, Empty, ExecArgs, ExecReturn, ExecStatus, ExecStatusArgs, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_AGENT_SOCKET: &str = "/tmp/qga.sock";

/// Largest pagemap read issued as a single `dd`
pub const PAGEMAP_CHUNK_PAGES: u64 = 1024;

/// Poll budget for short commands
const POLL_SHORT: Poll = Poll {
    attempts: 10,
    interval: Duration::from_millis(50),
};

/// Poll budget for streamed output (maps, pagemap)
const POLL_STREAM: Poll = Poll {
    attempts: 10,
    interval: Duration::from_millis(30),
};

const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct Poll {
    pub attempts: u32,
    pub interval: Duration,
}

/// Captured result of a guest command
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exitcode: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exitcode == Some(0)
    }
}

/// Shell access inside the guest, as needed by the companion launcher
pub trait GuestShell {
    /// Run `command` under `/bin/sh -c` and return its stdout
    fn shell(&self, command: &str) -> Result<String>;
}

struct Connection {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Connection {
    fn open(path: &Path, timeout: Duration) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|e| {
            HaywireError::AgentUnavailable(format!("{}: {e}", path.display()))
        })?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }
}

/// Blocking guest-agent client. One command in flight at a time; a timeout
/// drops the connection so a late reply cannot be mistaken for the next
/// command's answer. The next call reconnects.
pub struct GuestAgent {
    socket_path: PathBuf,
    timeout: Duration,
    conn: Option<Connection>,
}

impl GuestAgent {
    /// Create a client; the socket is opened on first use
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: SOCKET_TIMEOUT,
            conn: None,
        }
    }

    /// Create a client and connect immediately
    pub fn connect(socket_path: impl Into<PathBuf>) -> Result<Self> {
        let mut agent = Self::new(socket_path);
        agent.ensure_connected()?;
        Ok(agent)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn disconnect(&mut self) {
        self.conn = None;
    }

    fn ensure_connected(&mut self) -> Result<&mut Connection> {
        if self.conn.is_none() {
            debug!("Connecting to guest agent at {}", self.socket_path.display());
            self.conn = Some(Connection::open(&self.socket_path, self.timeout)?);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| HaywireError::AgentUnavailable("not connected".into()))
    }

    fn transact<A: Serialize, T: DeserializeOwned>(
        &mut self,
        execute: &str,
        arguments: Option<A>,
    ) -> Result<T> {
        let mut request = serde_json::to_vec(&Command { execute, arguments })?;
        request.push(b'\n');

        let conn = self.ensure_connected()?;
        let mut line = String::new();
        let io = conn
            .writer
            .write_all(&request)
            .and_then(|_| conn.writer.flush())
            .and_then(|_| conn.reader.read_line(&mut line));

        match io {
            Ok(0) => {
                self.conn = None;
                Err(HaywireError::AgentUnavailable("agent closed the connection".into()))
            }
            Ok(_) => {
                let response: Response<T> = serde_json::from_str(line.trim())?;
                if let Some(err) = response.error {
                    return Err(HaywireError::AgentUnavailable(format!(
                        "{execute}: {} {}",
                        err.class, err.desc
                    )));
                }
                response
                    .ret
                    .ok_or_else(|| HaywireError::AgentUnavailable(format!("{execute}: empty reply")))
            }
            Err(e) => {
                warn!("Guest agent {execute} failed: {e}");
                self.conn = None;
                Err(HaywireError::AgentUnavailable(format!("{execute}: {e}")))
            }
        }
    }

    pub fn ping(&mut self) -> Result<()> {
        self.transact::<ExecStatusArgs, Empty>("guest-ping", None)
            .map(|_| ())
    }

    /// Start `path argv...` in the guest; returns the guest-side exec id
    pub fn exec(&mut self, path: &str, args: &[String], capture_output: bool) -> Result<i64> {
        let ret: ExecReturn = self.transact(
            "guest-exec",
            Some(ExecArgs {
                path,
                arg: args,
                capture_output,
            }),
        )?;
        Ok(ret.pid)
    }

    pub fn exec_status(&mut self, pid: i64) -> Result<ExecOutput> {
        let status: ExecStatus = self.transact("guest-exec-status", Some(ExecStatusArgs { pid }))?;
        if !status.exited {
            return Err(HaywireError::AgentUnavailable(format!("exec {pid} still running")));
        }
        decode_status(status)
    }

    /// Exec and poll for completion within `poll`
    pub fn run(&mut self, path: &str, args: &[String], poll: Poll) -> Result<ExecOutput> {
        let pid = self.exec(path, args, true)?;
        for _ in 0..poll.attempts {
            thread::sleep(poll.interval);
            let status: ExecStatus =
                self.transact("guest-exec-status", Some(ExecStatusArgs { pid }))?;
            if status.exited {
                return decode_status(status);
            }
        }
        Err(HaywireError::AgentUnavailable(format!(
            "{path} did not finish within {} polls",
            poll.attempts
        )))
    }

    /// Run a command line under `/bin/sh -c`
    pub fn execute_command(&mut self, command: &str) -> Result<String> {
        let args = vec!["-c".to_string(), command.to_string()];
        Ok(self.run("/bin/sh", &args, POLL_SHORT)?.stdout_text())
    }

    pub fn get_process_list(&mut self) -> Result<Vec<GuestProcess>> {
        let args = vec!["aux".to_string(), "--sort=-rss".to_string()];
        let output = self.run("/bin/ps", &args, POLL_SHORT)?;
        Ok(parse_process_list(&output.stdout_text()))
    }

    pub fn get_memory_map(&mut self, pid: u32) -> Result<Vec<MapsEntry>> {
        let args = vec![format!("/proc/{pid}/maps")];
        let output = self.run("/bin/cat", &args, POLL_STREAM)?;
        Ok(parse_maps(&output.stdout_text()))
    }

    /// Pagemap entries for every page overlapping `[start_va, start_va+length)`
    pub fn translate_range(&mut self, pid: u32, start_va: u64, length: u64) -> Result<Vec<PagemapEntry>> {
        let first_page = start_va / PAGE_SIZE_U64;
        let last_page = start_va.saturating_add(length.max(1) - 1) / PAGE_SIZE_U64;
        let total = last_page - first_page + 1;

        let mut entries = Vec::with_capacity(total as usize);
        let mut page = first_page;
        while page <= last_page {
            let count = (last_page - page + 1).min(PAGEMAP_CHUNK_PAGES);
            let args = vec![
                format!("if=/proc/{pid}/pagemap"),
                "bs=8".to_string(),
                format!("skip={page}"),
                format!("count={count}"),
            ];
            let output = self.run("/bin/dd", &args, POLL_STREAM)?;
            if output.stdout.len() < (count * 8) as usize {
                return Err(HaywireError::AgentUnavailable(format!(
                    "short pagemap read for PID {pid} at page {page:#x}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            entries.extend(decode_pagemap(&output.stdout, page * PAGE_SIZE_U64));
            page += count;
        }
        debug!("Translated {} pages for PID {pid}", entries.len());
        Ok(entries)
    }

    /// Physical address for one VA, `None` when not present
    pub fn translate(&mut self, pid: u32, va: u64) -> Result<Option<u64>> {
        let entries = self.translate_range(pid, va & !PAGE_OFFSET_MASK, PAGE_SIZE_U64)?;
        Ok(entries
            .first()
            .filter(|e| e.is_mapped())
            .and_then(PagemapEntry::frame_address)
            .map(|frame| frame + (va & PAGE_OFFSET_MASK)))
    }
}

fn decode_status(status: ExecStatus) -> Result<ExecOutput> {
    let decode = |data: Option<String>| -> Result<Vec<u8>> {
        match data {
            Some(text) => Ok(BASE64.decode(text.trim())?),
            None => Ok(Vec::new()),
        }
    };
    Ok(ExecOutput {
        exitcode: status.exitcode,
        stdout: decode(status.out_data)?,
        stderr: decode(status.err_data)?,
    })
}
