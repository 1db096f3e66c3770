//! Opening the backend, reader, guest agent and monitor from global flags

use anyhow::{bail, Context as _, Result};
use haywire::flatten::Flattener;
use haywire::monitor::QmpClient;
use haywire::translate::{AgentTranslator, BeaconTranslator, Translator};
use haywire::{AgentHandle, AgentWorker, BeaconReader, GuestAgent, MemoryBackend};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cli::{Cli, Via};

pub struct Context {
    memory: Option<PathBuf>,
    agent_socket: PathBuf,
    ram_base: u64,
    qmp: Option<String>,
}

/// An agent worker together with a handle to it; the worker must outlive
/// every use of the handle
pub struct Agent {
    _worker: AgentWorker,
    pub handle: AgentHandle,
}

impl Context {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            memory: cli.memory.clone(),
            agent_socket: cli.agent.clone(),
            ram_base: cli.ram_base,
            qmp: cli.qmp.clone(),
        }
    }

    pub fn backend(&self) -> Result<Arc<MemoryBackend>> {
        let backend = match &self.memory {
            Some(path) => MemoryBackend::open_with_ram_base(path, self.ram_base)
                .with_context(|| format!("Failed to open guest memory {:?}", path))?,
            None => MemoryBackend::open_auto(self.ram_base)
                .context("No guest memory file found; pass --memory")?,
        };
        debug!(
            "Backend {:?}: {} MiB, RAM base {:#x}",
            backend.path(),
            backend.size() >> 20,
            backend.ram_base()
        );
        Ok(Arc::new(backend))
    }

    /// A reader over the backend, without requiring a companion
    pub fn reader_unchecked(&self) -> Result<Arc<BeaconReader>> {
        Ok(Arc::new(BeaconReader::new(self.backend()?)))
    }

    /// A reader with a successful first refresh
    pub fn reader(&self) -> Result<Arc<BeaconReader>> {
        let reader = self.reader_unchecked()?;
        if !reader.refresh() {
            bail!(
                "No usable beacon: {}",
                reader
                    .last_diagnostic()
                    .unwrap_or_else(|| "unknown error".into())
            );
        }
        Ok(reader)
    }

    pub fn agent(&self) -> Result<Agent> {
        let agent = GuestAgent::connect(&self.agent_socket).with_context(|| {
            format!("Failed to connect to guest agent at {:?}", self.agent_socket)
        })?;
        let worker = AgentWorker::spawn(agent).context("Failed to start agent worker")?;
        let handle = worker.handle();
        Ok(Agent {
            _worker: worker,
            handle,
        })
    }

    pub fn qmp(&self) -> Result<QmpClient> {
        let Some(addr) = self.qmp.as_deref() else {
            bail!("No QMP address; pass --qmp host:port");
        };
        QmpClient::connect(addr).with_context(|| format!("Failed to connect to QMP at {}", addr))
    }
}

/// A process view: the flattener plus the translator that backs it
pub struct ProcessView {
    pub flattener: Arc<Flattener>,
    pub translator: Arc<Translator>,
    /// Keeps the agent worker alive for agent translation
    _agent: Option<Agent>,
}

impl ProcessView {
    /// Camera-backed view; focuses camera 1 on `pid` when needed
    pub fn beacon(reader: Arc<BeaconReader>, pid: u32) -> Result<Self> {
        let focused = reader
            .snapshot()
            .is_some_and(|s| s.camera_for(1, pid).is_some());
        if !focused {
            info!("Focusing camera 1 on PID {}", pid);
            if !reader.set_camera_focus(1, pid) || !reader.wait_for_focus(1, pid) {
                bail!(
                    "Camera did not capture PID {}: {}",
                    pid,
                    reader
                        .last_diagnostic()
                        .unwrap_or_else(|| "no diagnostic".into())
                );
            }
        }

        let sections = reader.get_camera_sections(1, pid);
        if sections.is_empty() {
            bail!("Camera capture of PID {} has no sections", pid);
        }
        Ok(Self {
            flattener: Arc::new(Flattener::from_sections(&sections)),
            translator: Arc::new(Translator::Beacon(BeaconTranslator::new(reader))),
            _agent: None,
        })
    }

    pub fn agent(agent: Agent, pid: u32) -> Result<Self> {
        let maps = agent
            .handle
            .get_memory_map(pid)
            .with_context(|| format!("Failed to read maps of PID {}", pid))?;
        if maps.is_empty() {
            bail!("PID {} has no mappings", pid);
        }
        let translator = Translator::Agent(AgentTranslator::new(agent.handle.clone()));
        Ok(Self {
            flattener: Arc::new(Flattener::from_maps(&maps)),
            translator: Arc::new(translator),
            _agent: Some(agent),
        })
    }

    pub fn open(ctx: &Context, via: Via, pid: u32) -> Result<Self> {
        match via {
            Via::Beacon => Self::beacon(ctx.reader()?, pid),
            Via::Agent => Self::agent(ctx.agent()?, pid),
        }
    }
}
