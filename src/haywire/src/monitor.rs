//! Hypervisor monitor transport.
//!
//! QMP (JSON, one object per line) and HMP (human monitor, text delimited by
//! the `(qemu) ` prompt) over TCP. Used for `pmemsave` dumps and for reading
//! the guest RAM layout out of `info mtree -f`.

use crate::error::{HaywireError, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_QMP_ADDR: &str = "localhost:4445";
pub const DEFAULT_HMP_ADDR: &str = "localhost:4444";

const HMP_PROMPT: &str = "(qemu) ";
const MONITOR_TIMEOUT: Duration = Duration::from_secs(10);

fn monitor_error(message: impl Into<String>) -> HaywireError {
    HaywireError::ProtocolViolation(format!("monitor: {}", message.into()))
}

fn open_stream(addr: impl ToSocketAddrs) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(MONITOR_TIMEOUT))?;
    stream.set_write_timeout(Some(MONITOR_TIMEOUT))?;
    Ok(stream)
}

/// QMP session in command mode
pub struct QmpClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    /// QEMU version reported in the greeting
    pub version: Option<String>,
}

impl QmpClient {
    /// Connect, read the greeting and enter command mode
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = open_stream(addr)?;
        let writer = stream.try_clone()?;
        let mut client = Self {
            reader: BufReader::new(stream),
            writer,
            version: None,
        };

        let greeting = client.read_message()?;
        let qmp = greeting
            .get("QMP")
            .ok_or_else(|| monitor_error("missing QMP greeting"))?;
        client.version = qmp["version"]["qemu"].as_object().map(|v| {
            format!(
                "{}.{}.{}",
                v.get("major").and_then(Value::as_u64).unwrap_or(0),
                v.get("minor").and_then(Value::as_u64).unwrap_or(0),
                v.get("micro").and_then(Value::as_u64).unwrap_or(0)
            )
        });
        client.execute("qmp_capabilities", None)?;
        info!("QMP connected (QEMU {})", client.version.as_deref().unwrap_or("unknown"));
        Ok(client)
    }

    fn read_message(&mut self) -> Result<Value> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(monitor_error("connection closed"));
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Run a command and return its `return` value; async events are skipped
    pub fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let mut request = match arguments {
            Some(args) => json!({"execute": command, "arguments": args}),
            None => json!({"execute": command}),
        }
        .to_string();
        request.push('\n');
        self.writer.write_all(request.as_bytes())?;

        loop {
            let message = self.read_message()?;
            if let Some(ret) = message.get("return") {
                return Ok(ret.clone());
            }
            if let Some(err) = message.get("error") {
                return Err(monitor_error(format!(
                    "{command}: {}",
                    err["desc"].as_str().unwrap_or("unknown error")
                )));
            }
            if let Some(event) = message.get("event") {
                debug!("QMP event {}", event);
            }
        }
    }

    pub fn human_monitor_command(&mut self, command_line: &str) -> Result<String> {
        let ret = self.execute(
            "human-monitor-command",
            Some(json!({ "command-line": command_line })),
        )?;
        Ok(ret.as_str().unwrap_or_default().to_string())
    }

    /// Dump `size` bytes of guest physical memory at `gpa` to a host file
    pub fn pmemsave(&mut self, gpa: u64, size: u64, filename: &str) -> Result<()> {
        self.execute(
            "pmemsave",
            Some(json!({ "val": gpa, "size": size, "filename": filename })),
        )?;
        info!("pmemsave {size:#x} bytes at {gpa:#x} -> {filename}");
        Ok(())
    }

    pub fn mtree(&mut self) -> Result<String> {
        self.human_monitor_command("info mtree -f")
    }
}

/// Text monitor session
pub struct HmpClient {
    stream: TcpStream,
}

impl HmpClient {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let mut client = Self {
            stream: open_stream(addr)?,
        };
        // Banner up to the first prompt
        client.read_until_prompt()?;
        Ok(client)
    }

    fn read_until_prompt(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        while !buf.ends_with(HMP_PROMPT.as_bytes()) {
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(monitor_error("connection closed"));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        buf.truncate(buf.len() - HMP_PROMPT.len());
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Run a command; the echoed command line is stripped from the output
    pub fn command(&mut self, command: &str) -> Result<String> {
        self.stream.write_all(format!("{command}\n").as_bytes())?;
        let output = self.read_until_prompt()?;
        let body = match output.split_once('\n') {
            Some((first, rest)) if first.trim_end().ends_with(command) => rest,
            _ => output.as_str(),
        };
        Ok(body.replace("\r\n", "\n"))
    }

    pub fn mtree(&mut self) -> Result<String> {
        self.command("info mtree -f")
    }
}

/// One guest RAM range and where it lands in a linear dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RamRange {
    pub start: u64,
    /// Exclusive
    pub end: u64,
    pub name: String,
    pub file_offset: u64,
}

impl RamRange {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// `start-end (prio N, kind): name` or `start-end: name (prio N, kind)`
fn parse_mtree_line(line: &str) -> Option<(u64, u64, String, String)> {
    let line = line.trim();
    let (range, rest) = line.split_once(|c: char| c == ' ' || c == ':')?;
    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;

    let open = rest.find('(')?;
    let close = rest[open..].find(')')? + open;
    let attrs = &rest[open + 1..close];
    let kind = attrs.rsplit(',').next()?.trim().to_string();

    let outside = format!("{} {}", &rest[..open], &rest[close + 1..]);
    let name = outside
        .split(|c: char| c == ':' || c.is_whitespace())
        .find(|s| !s.is_empty())?
        .to_string();
    Some((start, end, kind, name))
}

/// RAM ranges from `info mtree -f`, sorted and de-duplicated across
/// flat views, with cumulative offsets for a linear RAM dump
pub fn parse_mtree_ram(output: &str) -> Vec<RamRange> {
    let mut found: Vec<(u64, u64, String)> = output
        .lines()
        .filter_map(parse_mtree_line)
        .filter(|(_, _, kind, name)| kind == "ram" && !name.contains("rom"))
        .map(|(start, end, _, name)| (start, end.saturating_add(1), name))
        .collect();
    found.sort_by_key(|(start, end, _)| (*start, *end));
    found.dedup_by_key(|(start, end, _)| (*start, *end));

    let mut offset = 0u64;
    found
        .into_iter()
        .map(|(start, end, name)| {
            let range = RamRange {
                start,
                end,
                name,
                file_offset: offset,
            };
            offset += range.size();
            range
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    const MTREE: &str = "\
FlatView #0
 AS \"memory\", root: system
 AS \"cpu-memory-0\", root: system
 Root memory region: system
  0000000000000000-0000000003ffffff (prio 0, romd): virt.flash0
  0000000004000000-0000000007ffffff (prio 0, romd): virt.flash1
  0000000009000000-0000000009000fff (prio 0, i/o): pl011
  0000000040000000-000000013fffffff (prio 0, ram): mach-virt.ram

FlatView #1
 AS \"cpu-secure-memory-0\", root: system
  0000000040000000-000000013fffffff (prio 0, ram): mach-virt.ram
";

    #[test]
    fn test_parse_mtree_ram() {
        let ranges = parse_mtree_ram(MTREE);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, 0x4000_0000);
        assert_eq!(ranges[0].size(), 0x1_0000_0000);
        assert_eq!(ranges[0].name, "mach-virt.ram");
    }

    #[test]
    fn test_parse_mtree_x86_split() {
        let text = "\
  0000000000000000-000000000009ffff (prio 0, ram): pc.ram
  00000000000a0000-00000000000bffff (prio 1, i/o): vga-lowmem
  00000000000c0000-00000000000dffff (prio 1, rom): pc.rom
  0000000000100000-000000007fffffff (prio 0, ram): pc.ram @0000000000100000
  0000000100000000-000000017fffffff (prio 0, ram): pc.ram @0000000080000000
";
        let ranges = parse_mtree_ram(text);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[1].start, 0x10_0000);
        assert_eq!(ranges[1].file_offset, 0xa_0000);
        assert_eq!(ranges[2].file_offset, 0xa_0000 + 0x7ff0_0000);
    }

    #[test]
    fn test_parse_name_first_format() {
        let ranges = parse_mtree_ram("0000000040000000-00000000bfffffff: mem (prio 0, ram)\n");
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].name, "mem");
        assert_eq!(ranges[0].end, 0xc000_0000);
    }

    fn fake_qmp() -> (u16, thread::JoinHandle<Vec<Value>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            writeln!(
                writer,
                r#"{{"QMP": {{"version": {{"qemu": {{"major": 8, "minor": 2, "micro": 1}}}}, "capabilities": []}}}}"#
            )
            .unwrap();
            let mut seen = Vec::new();
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                let req: Value = serde_json::from_str(line.trim()).unwrap();
                line.clear();
                let reply = match req["execute"].as_str().unwrap() {
                    "human-monitor-command" => {
                        writeln!(writer, r#"{{"event": "RESUME", "data": {{}}}}"#).unwrap();
                        json!({"return": MTREE})
                    }
                    "pmemsave" if req["arguments"]["size"] == 0 => {
                        json!({"error": {"class": "GenericError", "desc": "bad size"}})
                    }
                    _ => json!({"return": {}}),
                };
                seen.push(req);
                writeln!(writer, "{reply}").unwrap();
            }
            seen
        });
        (port, handle)
    }

    #[test]
    fn test_qmp_session() {
        let (port, server) = fake_qmp();
        let mut qmp = QmpClient::connect(("127.0.0.1", port)).unwrap();
        assert_eq!(qmp.version.as_deref(), Some("8.2.1"));

        let mtree = qmp.mtree().unwrap();
        assert_eq!(parse_mtree_ram(&mtree)[0].start, 0x4000_0000);

        qmp.pmemsave(0x4000_0000, 0x1000, "/tmp/dump.raw").unwrap();
        assert!(qmp.pmemsave(0, 0, "/tmp/x").is_err());
        drop(qmp);

        let seen = server.join().unwrap();
        assert_eq!(seen[0]["execute"], "qmp_capabilities");
        assert_eq!(seen[2]["arguments"]["val"], 0x4000_0000u64);
        assert_eq!(seen[2]["arguments"]["filename"], "/tmp/dump.raw");
    }

    #[test]
    fn test_hmp_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .write_all(b"QEMU 8.2.1 monitor - type 'help' for more information\r\n(qemu) ")
                .unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let reply = format!("{}\r\n{}(qemu) ", line.trim(), MTREE.replace('\n', "\r\n"));
            stream.write_all(reply.as_bytes()).unwrap();
        });

        let mut hmp = HmpClient::connect(("127.0.0.1", port)).unwrap();
        let out = hmp.mtree().unwrap();
        assert!(out.starts_with("FlatView #0"));
        assert_eq!(parse_mtree_ram(&out).len(), 1);
        server.join().unwrap();
    }
}
