//! Pipelines - one gadget instance plus its operator chain
//!
//! A pipeline starts its gadget through the runtime, attaches every
//! operator to every stream, then drives each stream on its own task until
//! the gadget completes or the pipeline is cancelled.

use crate::image::GadgetImage;
use crate::metrics::{PipelineStats, StatsSnapshot};
use crate::operator::{AttachContext, Operator, OperatorError};
use crate::params::Params;
use crate::runtime::{GadgetRuntime, RuntimeError};
use crate::stream::{Delivery, DeliveryError, EventStream};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pipeline error type
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Failed to attach operators to stream {stream}: {source}")]
    Attach {
        stream: String,
        #[source]
        source: OperatorError,
    },

    #[error("Fatal delivery error: {0}")]
    Fatal(#[from] DeliveryError),

    #[error("Pipeline cancelled before start")]
    Cancelled,

    #[error("Pipeline task aborted: {0}")]
    Aborted(String),
}

impl PipelineError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

/// A per-record failure that did not stop its stream
#[derive(Debug, Clone)]
pub struct EventFailure {
    pub pipeline: String,
    pub stream: String,
    pub operator: String,
    pub error: String,
}

/// Everything needed to run one gadget
#[derive(Clone)]
pub struct PipelineConfig {
    /// Bytecode image, passed through to the runtime
    pub image: GadgetImage,

    /// Runtime that executes the image
    pub runtime: Arc<dyn GadgetRuntime>,

    /// Operators owned by this pipeline
    pub operators: Vec<Arc<dyn Operator>>,

    /// Invocation parameters
    pub params: Params,

    /// Capacity of the per-record failure channel when run standalone
    pub failure_buffer: usize,
}

impl PipelineConfig {
    pub fn new(image: GadgetImage, runtime: Arc<dyn GadgetRuntime>) -> Self {
        Self {
            image,
            runtime,
            operators: Vec::new(),
            params: Params::new(),
            failure_buffer: 1024,
        }
    }

    pub fn with_operator(mut self, operator: Arc<dyn Operator>) -> Self {
        self.operators.push(operator);
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.set(key, value);
        self
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operators: Vec<&str> = self.operators.iter().map(|op| op.name()).collect();
        f.debug_struct("PipelineConfig")
            .field("image", &self.image)
            .field("runtime", &self.runtime.name())
            .field("operators", &operators)
            .field("params", &self.params)
            .finish()
    }
}

/// A runnable pipeline
pub struct Pipeline {
    name: String,
    config: PipelineConfig,
    stats: Arc<PipelineStats>,
    failures: broadcast::Sender<EventFailure>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, config: PipelineConfig) -> Self {
        let (failures, _) = broadcast::channel(config.failure_buffer.max(1));
        Self {
            name: name.into(),
            config,
            stats: Arc::new(PipelineStats::new()),
            failures,
        }
    }

    /// Share counters with the caller
    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Publish per-record failures on an existing channel
    pub fn with_failures(mut self, failures: broadcast::Sender<EventFailure>) -> Self {
        self.failures = failures;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Subscribe to per-record failures
    pub fn subscribe_failures(&self) -> broadcast::Receiver<EventFailure> {
        self.failures.subscribe()
    }

    /// Run until the gadget completes or `cancel` fires.
    ///
    /// Cancellation is an orderly stop and returns `Ok`; in-flight records
    /// finish delivery and every handler is flushed first.
    pub async fn run(self, cancel: CancellationToken) -> Result<StatsSnapshot, PipelineError> {
        let Pipeline {
            name,
            config,
            stats,
            failures,
        } = self;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        info!(
            "Starting pipeline {} (gadget {}, {})",
            name,
            config.image.reference(),
            config.image.digest()
        );
        let instance = config
            .runtime
            .start(&config.image, &config.params, cancel.clone())
            .await?;

        let mut streams = Vec::with_capacity(instance.streams.len());
        for source in instance.streams {
            let mut stream = EventStream::new(source.schema);
            let ctx = AttachContext {
                pipeline: &name,
                params: &config.params,
                cancel: &cancel,
            };
            if let Err(source) = stream.attach_all(&ctx, &config.operators) {
                cancel.cancel();
                if let Err(e) = instance.completion.await {
                    debug!("Gadget task of pipeline {} ended abnormally: {}", name, e);
                }
                return Err(PipelineError::Attach {
                    stream: stream.name().to_string(),
                    source,
                });
            }
            streams.push((stream, source.events));
        }

        let mut tasks = JoinSet::new();
        for (stream, events) in streams {
            tasks.spawn(drive_stream(
                name.clone(),
                stream,
                events,
                cancel.clone(),
                stats.clone(),
                failures.clone(),
            ));
        }

        let mut outcome: Result<(), PipelineError> = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(PipelineError::Aborted(e.to_string())),
            };
            if let Err(e) = result {
                error!("Stream of pipeline {} stopped: {}", name, e);
                cancel.cancel();
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        let gadget_result = match instance.completion.await {
            Ok(result) => result.map_err(PipelineError::from),
            Err(e) => Err(PipelineError::Aborted(e.to_string())),
        };
        outcome?;
        gadget_result?;

        let snapshot = stats.snapshot();
        info!(
            "Pipeline {} stopped: {} received, {} delivered, {} dropped, {} failed",
            name,
            snapshot.events_received,
            snapshot.events_delivered,
            snapshot.events_dropped,
            snapshot.events_failed
        );
        Ok(snapshot)
    }
}

/// Deliver every record of one stream, strictly one after the other
async fn drive_stream(
    pipeline: String,
    mut stream: EventStream,
    mut events: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    stats: Arc<PipelineStats>,
    failures: broadcast::Sender<EventFailure>,
) -> Result<(), PipelineError> {
    debug!("Stream {} of pipeline {} running", stream.name(), pipeline);

    let result = loop {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Stream {} of pipeline {} cancelled", stream.name(), pipeline);
                break Ok(());
            }
            next = events.recv() => match next {
                Some(payload) => payload,
                None => break Ok(()),
            },
        };

        stats.events_received.fetch_add(1, Ordering::Relaxed);
        let mut record = stream.new_record(payload);
        match stream.deliver(&mut record).await {
            Ok(Delivery::Delivered) => {
                stats.events_delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Delivery::Dropped { by }) => {
                debug!("Record on stream {} dropped by {}", stream.name(), by);
                stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_fatal() => {
                stats.events_failed.fetch_add(1, Ordering::Relaxed);
                break Err(PipelineError::Fatal(e));
            }
            Err(e) => {
                stats.events_failed.fetch_add(1, Ordering::Relaxed);
                warn!("Pipeline {}: {}", pipeline, e);
                let _ = failures.send(EventFailure {
                    pipeline: pipeline.clone(),
                    stream: e.stream.clone(),
                    operator: e.operator.clone(),
                    error: e.source.to_string(),
                });
            }
        }
    };

    // No new events past this point
    events.close();
    stream.flush().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldKind;
    use crate::operator::{
        priority, ErrorPolicy, EventAction, EventHandler, OperatorInfo, OperatorResult,
    };
    use crate::record::Record;
    use crate::schema::EventSchema;
    use crate::testing::{self, CountingRuntime};
    use async_trait::async_trait;

    /// Fails on odd sequence numbers
    struct OddFailer;

    struct OddFailerHandler {
        seq: crate::field::Field,
    }

    impl OperatorInfo for OddFailer {
        fn name(&self) -> &str {
            "odd-failer"
        }
    }

    impl Operator for OddFailer {
        fn priority(&self) -> i32 {
            priority::DECODE
        }

        fn error_policy(&self) -> ErrorPolicy {
            ErrorPolicy::FailFast
        }

        fn attach(
            &self,
            _ctx: &AttachContext<'_>,
            schema: &mut EventSchema,
        ) -> OperatorResult<Option<Box<dyn EventHandler>>> {
            let seq = schema.require_field("seq", FieldKind::Uint32)?;
            Ok(Some(Box::new(OddFailerHandler { seq })))
        }
    }

    #[async_trait]
    impl EventHandler for OddFailerHandler {
        async fn handle(
            &mut self,
            _schema: &EventSchema,
            record: &mut Record,
        ) -> OperatorResult<EventAction> {
            let seq = self.seq.get_u32(record)?;
            if seq % 2 == 1 {
                return Err(OperatorError::Other(anyhow::anyhow!("odd {}", seq)));
            }
            Ok(EventAction::Pass)
        }
    }

    /// Requires a field the gadget never declares
    struct NeedsMissingField;

    impl OperatorInfo for NeedsMissingField {
        fn name(&self) -> &str {
            "needs-missing"
        }
    }

    impl Operator for NeedsMissingField {
        fn priority(&self) -> i32 {
            priority::DECODE
        }

        fn error_policy(&self) -> ErrorPolicy {
            ErrorPolicy::FailFast
        }

        fn attach(
            &self,
            _ctx: &AttachContext<'_>,
            schema: &mut EventSchema,
        ) -> OperatorResult<Option<Box<dyn EventHandler>>> {
            schema.require_field("args", FieldKind::Bytes)?;
            Ok(None)
        }
    }

    fn config(count: u32) -> PipelineConfig {
        PipelineConfig::new(
            testing::image("counting"),
            Arc::new(CountingRuntime::finite(count)),
        )
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let pipeline = Pipeline::new("seq", config(10).with_operator(Arc::new(OddFailer)));
        let mut failures = pipeline.subscribe_failures();

        let snapshot = pipeline.run(CancellationToken::new()).await.unwrap();
        assert_eq!(snapshot.events_received, 10);
        assert_eq!(snapshot.events_delivered, 5);
        assert_eq!(snapshot.events_failed, 5);

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.pipeline, "seq");
        assert_eq!(failure.stream, "seq");
        assert_eq!(failure.operator, "odd-failer");
        assert!(failure.error.contains("odd 1"));
    }

    #[tokio::test]
    async fn test_missing_field_is_setup_error() {
        let pipeline = Pipeline::new(
            "seq",
            config(10).with_operator(Arc::new(NeedsMissingField)),
        );

        let err = pipeline.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Attach {
                source: OperatorError::Schema(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let pipeline = Pipeline::new("seq", config(10));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline.run(cancel).await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_cancel_is_orderly_stop() {
        let seen = Arc::new(testing::Seen::default());
        let config = PipelineConfig::new(
            testing::image("endless"),
            Arc::new(CountingRuntime::endless(std::time::Duration::from_millis(1))),
        )
        .with_operator(Arc::new(testing::Recorder { seen: seen.clone() }));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(Pipeline::new("endless", config).run(cancel.clone()));
        while seen.delivered.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        cancel.cancel();

        let snapshot = handle.await.unwrap().unwrap();
        assert!(snapshot.events_delivered >= 3);
        assert_eq!(
            snapshot.events_delivered,
            seen.delivered.load(Ordering::SeqCst)
        );
        assert!(seen.flushed.load(Ordering::SeqCst));
    }
}
