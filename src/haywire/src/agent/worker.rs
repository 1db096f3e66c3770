//! Agent worker thread.
//!
//! The worker owns the [`GuestAgent`] socket. Callers hold cheap
//! [`AgentHandle`] clones and wait for replies with a bounded timeout, so a
//! wedged guest never blocks the caller past that bound.

use super::{GuestAgent, GuestProcess, GuestShell};
use crate::error::{HaywireError, Result};
use crate::maps::MapsEntry;
use crate::pagemap::PagemapEntry;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

enum Request {
    Ping,
    ProcessList,
    MemoryMap(u32),
    TranslateRange { pid: u32, start_va: u64, length: u64 },
    Shell(String),
}

enum Reply {
    Pong,
    ProcessList(Vec<GuestProcess>),
    MemoryMap(Vec<MapsEntry>),
    Pagemap(Vec<PagemapEntry>),
    Output(String),
}

enum Message {
    Job(Request, Sender<Result<Reply>>),
    Shutdown,
}

pub struct AgentWorker {
    tx: Sender<Message>,
    thread: Option<JoinHandle<()>>,
    reply_timeout: Duration,
}

impl AgentWorker {
    pub fn spawn(agent: GuestAgent) -> Result<Self> {
        Self::spawn_with_timeout(agent, DEFAULT_REPLY_TIMEOUT)
    }

    pub fn spawn_with_timeout(mut agent: GuestAgent, reply_timeout: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Message>();
        let thread = thread::Builder::new()
            .name("haywire-agent".into())
            .spawn(move || {
                debug!("Agent worker started for {}", agent.socket_path().display());
                while let Ok(Message::Job(request, reply)) = rx.recv() {
                    let result = handle(&mut agent, request);
                    // Caller may have timed out and gone away
                    let _ = reply.send(result);
                }
                debug!("Agent worker stopped");
            })?;
        Ok(Self {
            tx,
            thread: Some(thread),
            reply_timeout,
        })
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            tx: self.tx.clone(),
            reply_timeout: self.reply_timeout,
        }
    }
}

impl Drop for AgentWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Agent worker panicked");
            }
        }
    }
}

fn handle(agent: &mut GuestAgent, request: Request) -> Result<Reply> {
    match request {
        Request::Ping => agent.ping().map(|_| Reply::Pong),
        Request::ProcessList => agent.get_process_list().map(Reply::ProcessList),
        Request::MemoryMap(pid) => agent.get_memory_map(pid).map(Reply::MemoryMap),
        Request::TranslateRange {
            pid,
            start_va,
            length,
        } => agent
            .translate_range(pid, start_va, length)
            .map(Reply::Pagemap),
        Request::Shell(command) => agent.execute_command(&command).map(Reply::Output),
    }
}

/// Cloneable request side of an [`AgentWorker`]
#[derive(Clone)]
pub struct AgentHandle {
    tx: Sender<Message>,
    reply_timeout: Duration,
}

impl AgentHandle {
    fn call(&self, request: Request) -> Result<Reply> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Message::Job(request, reply_tx))
            .map_err(|_| HaywireError::AgentUnavailable("agent worker stopped".into()))?;
        match reply_rx.recv_timeout(self.reply_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(HaywireError::AgentUnavailable(format!(
                "no reply within {:?}",
                self.reply_timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(HaywireError::AgentUnavailable("agent worker stopped".into()))
            }
        }
    }

    fn mismatch() -> HaywireError {
        HaywireError::AgentUnavailable("unexpected reply from agent worker".into())
    }

    pub fn ping(&self) -> Result<()> {
        match self.call(Request::Ping)? {
            Reply::Pong => Ok(()),
            _ => Err(Self::mismatch()),
        }
    }

    /// True when the agent answers a ping
    pub fn is_available(&self) -> bool {
        self.ping().is_ok()
    }

    pub fn get_process_list(&self) -> Result<Vec<GuestProcess>> {
        match self.call(Request::ProcessList)? {
            Reply::ProcessList(procs) => Ok(procs),
            _ => Err(Self::mismatch()),
        }
    }

    pub fn get_memory_map(&self, pid: u32) -> Result<Vec<MapsEntry>> {
        match self.call(Request::MemoryMap(pid))? {
            Reply::MemoryMap(maps) => Ok(maps),
            _ => Err(Self::mismatch()),
        }
    }

    pub fn translate_range(&self, pid: u32, start_va: u64, length: u64) -> Result<Vec<PagemapEntry>> {
        match self.call(Request::TranslateRange {
            pid,
            start_va,
            length,
        })? {
            Reply::Pagemap(entries) => Ok(entries),
            _ => Err(Self::mismatch()),
        }
    }

    pub fn execute_command(&self, command: &str) -> Result<String> {
        match self.call(Request::Shell(command.to_string()))? {
            Reply::Output(out) => Ok(out),
            _ => Err(Self::mismatch()),
        }
    }
}

impl GuestShell for AgentHandle {
    fn shell(&self, command: &str) -> Result<String> {
        self.execute_command(command)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fake::FakeAgent;
    use super::*;

    #[test]
    fn test_worker_round_trip() {
        let fake = FakeAgent::spawn(Box::new(|path, args| match path {
            "/bin/sh" => Some(format!("echo:{}", args[1]).into_bytes()),
            "/bin/cat" => Some(b"00001000-00002000 rw-p 00000000 00:00 0 [heap]\n".to_vec()),
            _ => None,
        }));
        let worker = AgentWorker::spawn(GuestAgent::new(&fake.path)).unwrap();
        let handle = worker.handle();

        assert!(handle.is_available());
        assert_eq!(handle.shell("uname").unwrap(), "echo:uname");
        let maps = handle.clone().get_memory_map(7).unwrap();
        assert_eq!(maps[0].pathname, "[heap]");
    }

    #[test]
    fn test_worker_reply_timeout() {
        let fake = FakeAgent::spawn_with(Box::new(|_, _| None), true);
        let agent = GuestAgent::new(&fake.path).with_timeout(Duration::from_millis(500));
        let worker = AgentWorker::spawn_with_timeout(agent, Duration::from_millis(50)).unwrap();
        let err = worker.handle().ping().err().unwrap();
        assert!(matches!(err, HaywireError::AgentUnavailable(_)));
    }

    #[test]
    fn test_handle_after_worker_dropped() {
        let fake = FakeAgent::spawn(Box::new(|_, _| None));
        let worker = AgentWorker::spawn(GuestAgent::new(&fake.path)).unwrap();
        let handle = worker.handle();
        drop(worker);
        assert!(!handle.is_available());
    }
}
