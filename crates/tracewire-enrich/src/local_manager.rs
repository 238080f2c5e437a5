//! Local manager - process metadata shared by every pipeline
//!
//! The [`LocalManager`] is a registry-owned cache of per-process metadata
//! read from procfs. Each pipeline that wants it gets its own
//! [`LocalManagerOperator`] holding the same `Arc<LocalManager>`.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracewire_core::operator::{
    priority, AttachContext, ErrorPolicy, EventAction, EventHandler, Operator, OperatorInfo,
    OperatorResult,
};
use tracewire_core::{operator_key, EventSchema, Field, FieldKind, Record, SharedResource};
use tracing::{debug, info, warn};

/// Keep host (non-container) events; `true` unless set otherwise
pub const HOST_KEY: &str = "host";

const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessMeta {
    pub exe: Option<String>,
    pub container_id: Option<String>,
}

/// Shared process metadata cache
pub struct LocalManager {
    proc_root: PathBuf,
    capacity: usize,
    cache: RwLock<HashMap<u32, ProcessMeta>>,
}

impl LocalManager {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            capacity: DEFAULT_CAPACITY,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Metadata of `pid`, read from procfs on first sight
    pub fn lookup(&self, pid: u32) -> ProcessMeta {
        if let Some(meta) = self.cache.read().get(&pid) {
            return meta.clone();
        }

        let meta = self.read_meta(pid);
        // Gone or not yet visible; try again next time
        if meta == ProcessMeta::default() {
            return meta;
        }
        let mut cache = self.cache.write();
        if cache.len() >= self.capacity {
            debug!("Process cache full ({} entries), resetting", cache.len());
            cache.clear();
        }
        cache.insert(pid, meta.clone());
        meta
    }

    pub fn cached(&self) -> usize {
        self.cache.read().len()
    }

    fn read_meta(&self, pid: u32) -> ProcessMeta {
        let dir = self.proc_root.join(pid.to_string());

        let exe = fs::read_link(dir.join("exe"))
            .ok()
            .map(|p| p.to_string_lossy().to_string());

        let container_id = fs::read_to_string(dir.join("cgroup"))
            .ok()
            .and_then(|cgroup| container_id_from_cgroup(&cgroup));

        ProcessMeta { exe, container_id }
    }
}

#[async_trait]
impl SharedResource for LocalManager {
    fn name(&self) -> &str {
        "local_manager"
    }

    async fn init(&self) -> anyhow::Result<()> {
        if !self.proc_root.is_dir() {
            warn!(
                "{} is not available, process metadata will be empty",
                self.proc_root.display()
            );
        }
        info!("Local manager reading from {}", self.proc_root.display());
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let mut cache = self.cache.write();
        debug!("Local manager dropping {} cached processes", cache.len());
        cache.clear();
        Ok(())
    }
}

/// Extract a 64-hex-digit container id from `/proc/<pid>/cgroup`
pub fn container_id_from_cgroup(cgroup: &str) -> Option<String> {
    cgroup
        .lines()
        .filter_map(|line| line.rsplit(':').next())
        .flat_map(|path| path.split('/'))
        .map(|segment| {
            let segment = segment.strip_suffix(".scope").unwrap_or(segment);
            ["docker-", "cri-containerd-", "crio-", "libpod-"]
                .iter()
                .find_map(|prefix| segment.strip_prefix(prefix))
                .unwrap_or(segment)
        })
        .find(|id| id.len() == 64 && id.bytes().all(|b| b.is_ascii_hexdigit()))
        .map(str::to_string)
}

/// Adds `proc.exe` and `proc.container_id` to streams carrying a `pid`
pub struct LocalManagerOperator {
    manager: Arc<LocalManager>,
}

impl LocalManagerOperator {
    pub fn new(manager: Arc<LocalManager>) -> Self {
        Self { manager }
    }
}

impl OperatorInfo for LocalManagerOperator {
    fn name(&self) -> &str {
        "local_manager"
    }

    fn description(&self) -> &str {
        "Adds executable and container metadata from procfs"
    }
}

impl Operator for LocalManagerOperator {
    fn priority(&self) -> i32 {
        priority::ENRICH
    }

    fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::BestEffort
    }

    fn attach(
        &self,
        ctx: &AttachContext<'_>,
        schema: &mut EventSchema,
    ) -> OperatorResult<Option<Box<dyn EventHandler>>> {
        if schema.get_field("pid").is_none() {
            return Ok(None);
        }
        let keep_host = ctx
            .params
            .get_bool(&operator_key("LocalManager", HOST_KEY), true)?;

        Ok(Some(Box::new(LocalManagerHandler {
            manager: self.manager.clone(),
            keep_host,
            pid: schema.require_field("pid", FieldKind::Uint32)?,
            exe: schema.add_field("proc.exe", FieldKind::String)?,
            container_id: schema.add_field("proc.container_id", FieldKind::String)?,
        })))
    }
}

struct LocalManagerHandler {
    manager: Arc<LocalManager>,
    keep_host: bool,
    pid: Field,
    exe: Field,
    container_id: Field,
}

#[async_trait]
impl EventHandler for LocalManagerHandler {
    async fn handle(
        &mut self,
        _schema: &EventSchema,
        record: &mut Record,
    ) -> OperatorResult<EventAction> {
        let meta = self.manager.lookup(self.pid.get_u32(record)?);
        if !self.keep_host && meta.container_id.is_none() {
            return Ok(EventAction::Drop);
        }

        if let Some(exe) = &meta.exe {
            self.exe.put_string(record, exe)?;
        }
        if let Some(id) = &meta.container_id {
            self.container_id.put_string(record, id)?;
        }
        Ok(EventAction::Pass)
    }
}
