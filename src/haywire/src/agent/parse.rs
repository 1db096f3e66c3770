//! Parsers for command output fetched through the guest agent

use serde::Serialize;

/// Coarse grouping used to order process pickers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessCategory {
    UserApp,
    Service,
    SystemUtil,
    KernelThread,
}

const KNOWN_APPS: &[&str] = &["vlc", "firefox", "chrome", "gnome", "kde", "wayland"];

impl ProcessCategory {
    pub fn classify(name: &str, user: &str, mem: f32) -> Self {
        if name.starts_with('[') {
            ProcessCategory::KernelThread
        } else if mem > 1.0
            || KNOWN_APPS.iter().any(|app| name.contains(app))
            || name.starts_with('X')
        {
            ProcessCategory::UserApp
        } else if name.contains("systemd")
            || name.contains("daemon")
            || name.ends_with('d')
            || user == "root"
        {
            ProcessCategory::Service
        } else {
            ProcessCategory::SystemUtil
        }
    }
}

/// One row of `ps aux`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuestProcess {
    pub pid: u32,
    pub user: String,
    pub cpu: f32,
    pub mem: f32,
    pub command: String,
    /// Command without its directory; kernel threads keep their brackets
    pub name: String,
    pub category: ProcessCategory,
}

fn process_name(command: &str) -> String {
    if command.starts_with('[') {
        return command.to_string();
    }
    let program = command.split_whitespace().next().unwrap_or("");
    program.rsplit('/').next().unwrap_or(program).to_string()
}

/// Parse `ps aux` output:
/// `USER PID %CPU %MEM VSZ RSS TTY STAT START TIME COMMAND...`
pub fn parse_process_list(output: &str) -> Vec<GuestProcess> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let user = fields.next()?.to_string();
            let pid = fields.next()?.parse().ok()?;
            let cpu = fields.next()?.parse().unwrap_or(0.0);
            let mem = fields.next()?.parse().unwrap_or(0.0);
            // VSZ RSS TTY STAT START TIME
            let command = fields.skip(6).collect::<Vec<_>>().join(" ");
            if command.is_empty() {
                return None;
            }
            let name = process_name(&command);
            let category = ProcessCategory::classify(&name, &user, mem);
            Some(GuestProcess {
                pid,
                user,
                cpu,
                mem,
                command,
                name,
                category,
            })
        })
        .collect()
}
