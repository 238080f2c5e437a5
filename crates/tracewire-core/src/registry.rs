//! Pipeline registry - runs every configured pipeline concurrently
//!
//! Each pipeline gets its own child cancellation token, so one pipeline
//! failing never stops its siblings, while cancelling the parent token
//! stops all of them. The first non-cancellation error is returned once
//! every pipeline has finished.

use crate::metrics::{PipelineStats, StatsSnapshot};
use crate::pipeline::{EventFailure, Pipeline, PipelineConfig, PipelineError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Registry error type
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Pipeline {0} is already registered")]
    DuplicateName(String),

    #[error("Shared resource {name} failed to initialize: {source}")]
    SharedInit {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Pipeline {pipeline} failed: {source}")]
    Pipeline {
        pipeline: String,
        #[source]
        source: PipelineError,
    },
}

/// A collaborator shared by several pipelines (e.g. a metadata cache)
/// whose lifecycle is owned by the registry
#[async_trait]
pub trait SharedResource: Send + Sync {
    fn name(&self) -> &str;

    /// Called once before any pipeline starts
    async fn init(&self) -> anyhow::Result<()>;

    /// Called once after every pipeline stopped
    async fn close(&self) -> anyhow::Result<()>;
}

/// Final counters of every pipeline that stopped cleanly
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub pipelines: BTreeMap<String, StatsSnapshot>,
}

/// Named pipeline configurations
pub struct Registry {
    pipelines: Vec<(String, PipelineConfig)>,
    stats: HashMap<String, Arc<PipelineStats>>,
    shared: Vec<Arc<dyn SharedResource>>,
    failures: broadcast::Sender<EventFailure>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (failures, _) = broadcast::channel(1024);
        Self {
            pipelines: Vec::new(),
            stats: HashMap::new(),
            shared: Vec::new(),
            failures,
        }
    }

    /// Add a pipeline. Names are unique.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        config: PipelineConfig,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.stats.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        self.stats
            .insert(name.clone(), Arc::new(PipelineStats::new()));
        self.pipelines.push((name, config));
        Ok(())
    }

    /// Add a collaborator initialized before and closed after the run
    pub fn add_shared(&mut self, resource: Arc<dyn SharedResource>) {
        self.shared.push(resource);
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stats.contains_key(name)
    }

    /// Pipeline names in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.iter().map(|(name, _)| name.as_str())
    }

    pub fn config(&self, name: &str) -> Option<&PipelineConfig> {
        self.pipelines
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, config)| config)
    }

    /// Live counters of a pipeline, usable while `run_all` is in progress
    pub fn stats(&self, name: &str) -> Option<Arc<PipelineStats>> {
        self.stats.get(name).cloned()
    }

    /// Per-record failures of every pipeline
    pub fn subscribe_failures(&self) -> broadcast::Receiver<EventFailure> {
        self.failures.subscribe()
    }

    /// Run every pipeline concurrently until all completed or were
    /// cancelled through `ctx`.
    pub async fn run_all(self, ctx: CancellationToken) -> Result<RunReport, RegistryError> {
        let Registry {
            pipelines,
            mut stats,
            shared,
            failures,
        } = self;

        if pipelines.is_empty() {
            warn!("No pipelines registered");
        }

        for (i, resource) in shared.iter().enumerate() {
            if let Err(source) = resource.init().await {
                close_all(&shared[..i]).await;
                return Err(RegistryError::SharedInit {
                    name: resource.name().to_string(),
                    source,
                });
            }
            info!("Initialized shared resource {}", resource.name());
        }

        let mut tasks = JoinSet::new();
        for (name, config) in pipelines {
            let pipeline = Pipeline::new(name.clone(), config)
                .with_failures(failures.clone())
                .with_stats(stats.remove(&name).unwrap_or_default());
            let token = ctx.child_token();
            tasks.spawn(async move {
                // Inner task so that a panicking pipeline keeps its name
                let outcome = match tokio::spawn(pipeline.run(token)).await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(PipelineError::Aborted(e.to_string())),
                };
                (name, outcome)
            });
        }

        let mut report = RunReport::default();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let (name, outcome) = match joined {
                Ok(finished) => finished,
                Err(e) => {
                    error!("Pipeline supervisor task failed: {}", e);
                    continue;
                }
            };
            match outcome {
                Ok(snapshot) => {
                    report.pipelines.insert(name, snapshot);
                }
                Err(e) if e.is_cancellation() => {
                    info!("Pipeline {} cancelled", name);
                }
                Err(e) => {
                    error!("Pipeline {} failed: {}", name, e);
                    if first_error.is_none() {
                        first_error = Some(RegistryError::Pipeline {
                            pipeline: name,
                            source: e,
                        });
                    }
                }
            }
        }

        close_all(&shared).await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

async fn close_all(resources: &[Arc<dyn SharedResource>]) {
    for resource in resources.iter().rev() {
        if let Err(e) = resource.close().await {
            warn!("Error closing shared resource {}: {}", resource.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, CountingRuntime, FailingRuntime, Recorder, Seen};
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn counting(count: u32, seen: &Arc<Seen>) -> PipelineConfig {
        PipelineConfig::new(
            testing::image("counting"),
            Arc::new(CountingRuntime::finite(count)),
        )
        .with_operator(Arc::new(Recorder { seen: seen.clone() }))
    }

    /// Logs lifecycle calls into a shared journal
    struct Journal {
        name: String,
        fail_init: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SharedResource for Journal {
        fn name(&self) -> &str {
            &self.name
        }

        async fn init(&self) -> anyhow::Result<()> {
            self.log.lock().push(format!("init {}", self.name));
            if self.fail_init {
                anyhow::bail!("{} unavailable", self.name);
            }
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.log.lock().push(format!("close {}", self.name));
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let seen = Arc::new(Seen::default());
        let mut registry = Registry::new();
        registry.register("exec", counting(1, &seen)).unwrap();

        let err = registry
            .register("exec", counting(2, &seen).with_param("k", "v"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(ref n) if n == "exec"));
        assert_eq!(registry.len(), 1);
        assert!(registry.config("exec").unwrap().params.is_empty());
    }

    #[tokio::test]
    async fn test_failing_pipeline_does_not_stop_siblings() {
        let seen = Arc::new(Seen::default());
        let mut registry = Registry::new();
        registry.register("good", counting(20, &seen)).unwrap();
        registry
            .register(
                "bad",
                PipelineConfig::new(testing::image("bad"), Arc::new(FailingRuntime)),
            )
            .unwrap();
        let good_stats = registry.stats("good").unwrap();

        let err = registry.run_all(CancellationToken::new()).await.unwrap_err();
        match err {
            RegistryError::Pipeline { pipeline, source } => {
                assert_eq!(pipeline, "bad");
                assert!(matches!(source, PipelineError::Runtime(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(good_stats.snapshot().events_delivered, 20);
        assert_eq!(seen.delivered.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_all_pipelines_complete() {
        let a = Arc::new(Seen::default());
        let b = Arc::new(Seen::default());
        let mut registry = Registry::new();
        registry.register("a", counting(3, &a)).unwrap();
        registry.register("b", counting(7, &b)).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["a", "b"]);

        let report = registry.run_all(CancellationToken::new()).await.unwrap();
        assert_eq!(report.pipelines["a"].events_delivered, 3);
        assert_eq!(report.pipelines["b"].events_delivered, 7);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_reports_nothing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Seen::default());
        let mut registry = Registry::new();
        registry.register("a", counting(3, &seen)).unwrap();
        registry.register("b", counting(3, &seen)).unwrap();
        registry.add_shared(Arc::new(Journal {
            name: "cache".to_string(),
            fail_init: false,
            log: log.clone(),
        }));

        let ctx = CancellationToken::new();
        ctx.cancel();
        let report = registry.run_all(ctx).await.unwrap();

        assert!(report.pipelines.is_empty());
        assert_eq!(seen.delivered.load(Ordering::SeqCst), 0);
        assert_eq!(*log.lock(), vec!["init cache", "close cache"]);
    }

    #[tokio::test]
    async fn test_cancellation_reaches_every_pipeline() {
        let seen = Arc::new(Seen::default());
        let mut registry = Registry::new();
        for name in ["one", "two"] {
            registry
                .register(
                    name,
                    PipelineConfig::new(
                        testing::image(name),
                        Arc::new(CountingRuntime::endless(Duration::from_millis(1))),
                    )
                    .with_operator(Arc::new(Recorder { seen: seen.clone() })),
                )
                .unwrap();
        }

        let ctx = CancellationToken::new();
        let run = tokio::spawn(registry.run_all(ctx.clone()));
        while seen.delivered.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        ctx.cancel();

        let report = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("pipelines did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(report.pipelines.len(), 2);
        assert!(seen.flushed.load(Ordering::SeqCst));

        // Nothing is delivered once the run returned
        let settled = seen.delivered.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.delivered.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn test_shared_resources_wrap_the_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Seen::default());
        let mut registry = Registry::new();
        registry.register("exec", counting(1, &seen)).unwrap();
        for name in ["cache", "sink"] {
            registry.add_shared(Arc::new(Journal {
                name: name.to_string(),
                fail_init: false,
                log: log.clone(),
            }));
        }

        registry.run_all(CancellationToken::new()).await.unwrap();
        assert_eq!(
            *log.lock(),
            vec!["init cache", "init sink", "close sink", "close cache"]
        );
    }

    #[tokio::test]
    async fn test_shared_init_failure_skips_pipelines() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Seen::default());
        let mut registry = Registry::new();
        registry.register("exec", counting(5, &seen)).unwrap();
        registry.add_shared(Arc::new(Journal {
            name: "cache".to_string(),
            fail_init: false,
            log: log.clone(),
        }));
        registry.add_shared(Arc::new(Journal {
            name: "broken".to_string(),
            fail_init: true,
            log: log.clone(),
        }));

        let err = registry.run_all(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RegistryError::SharedInit { ref name, .. } if name == "broken"));
        assert_eq!(*log.lock(), vec!["init cache", "init broken", "close cache"]);
        assert_eq!(seen.delivered.load(Ordering::SeqCst), 0);
    }
}
