//! Event streams - per-stream operator chains and record delivery

use crate::operator::{
    AttachContext, ErrorPolicy, EventAction, EventHandler, Operator, OperatorError,
    OperatorResult,
};
use crate::record::Record;
use crate::schema::EventSchema;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// A record failed in one operator; later operators did not see it
#[derive(Error, Debug)]
#[error("operator {operator} failed on stream {stream}: {source}")]
pub struct DeliveryError {
    pub stream: String,
    pub operator: String,
    #[source]
    pub source: OperatorError,
}

impl DeliveryError {
    pub fn is_fatal(&self) -> bool {
        self.source.is_fatal()
    }
}

/// Result of delivering one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Every subscribed operator handled the record
    Delivered,
    /// An operator dropped the record
    Dropped { by: String },
}

struct Subscriber {
    operator: String,
    priority: i32,
    policy: ErrorPolicy,
    handler: Box<dyn EventHandler>,
}

/// A schema plus the handlers attached to it, ordered by priority
pub struct EventStream {
    schema: EventSchema,
    subscribers: Vec<Subscriber>,
}

impl EventStream {
    pub fn new(schema: EventSchema) -> Self {
        Self {
            schema,
            subscribers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.schema.stream()
    }

    pub fn schema(&self) -> &EventSchema {
        &self.schema
    }

    pub fn schema_mut(&mut self) -> &mut EventSchema {
        &mut self.schema
    }

    /// Attach one operator. Returns whether it subscribed.
    pub fn attach(
        &mut self,
        ctx: &AttachContext<'_>,
        operator: &dyn Operator,
    ) -> OperatorResult<bool> {
        if self.schema.is_frozen() {
            return Err(OperatorError::InitializationFailed(format!(
                "cannot attach {}: stream {} already started",
                operator.name(),
                self.schema.stream()
            )));
        }

        let Some(handler) = operator.attach(ctx, &mut self.schema)? else {
            debug!(
                "Operator {} skipped stream {}",
                operator.name(),
                self.schema.stream()
            );
            return Ok(false);
        };

        let priority = operator.priority();
        // Stable: equal priorities keep attach order
        let position = self
            .subscribers
            .iter()
            .position(|s| s.priority > priority)
            .unwrap_or(self.subscribers.len());
        self.subscribers.insert(
            position,
            Subscriber {
                operator: operator.name().to_string(),
                priority,
                policy: operator.error_policy(),
                handler,
            },
        );
        debug!(
            "Operator {} attached to stream {} (priority {})",
            operator.name(),
            self.schema.stream(),
            priority
        );
        Ok(true)
    }

    /// Attach operators in ascending priority so that late stages see the
    /// fields added by earlier ones
    pub fn attach_all(
        &mut self,
        ctx: &AttachContext<'_>,
        operators: &[Arc<dyn Operator>],
    ) -> OperatorResult<()> {
        let mut ordered: Vec<&Arc<dyn Operator>> = operators.iter().collect();
        ordered.sort_by_key(|op| op.priority());
        for operator in ordered {
            self.attach(ctx, operator.as_ref())?;
        }
        Ok(())
    }

    /// Subscribed operators in delivery order
    pub fn subscribers(&self) -> impl Iterator<Item = (&str, i32)> {
        self.subscribers
            .iter()
            .map(|s| (s.operator.as_str(), s.priority))
    }

    pub fn new_record(&self, static_payload: Vec<u8>) -> Record {
        self.schema.new_record(static_payload)
    }

    /// Deliver one record to every handler in priority order.
    ///
    /// The first delivery freezes the schema.
    pub async fn deliver(&mut self, record: &mut Record) -> Result<Delivery, DeliveryError> {
        self.schema.freeze();
        let Self {
            schema,
            subscribers,
        } = self;

        for sub in subscribers.iter_mut() {
            match sub.handler.handle(schema, record).await {
                Ok(EventAction::Pass) => {}
                Ok(EventAction::Drop) => {
                    return Ok(Delivery::Dropped {
                        by: sub.operator.clone(),
                    });
                }
                Err(e) if sub.policy == ErrorPolicy::BestEffort && !e.is_fatal() => {
                    warn!(
                        "Operator {} failed on stream {}, continuing: {}",
                        sub.operator,
                        schema.stream(),
                        e
                    );
                }
                Err(e) => {
                    return Err(DeliveryError {
                        stream: schema.stream().to_string(),
                        operator: sub.operator.clone(),
                        source: e,
                    });
                }
            }
        }
        Ok(Delivery::Delivered)
    }

    /// Flush every handler once the stream drains
    pub async fn flush(&mut self) {
        for sub in &mut self.subscribers {
            if let Err(e) = sub.handler.flush().await {
                warn!(
                    "Error flushing operator {} on stream {}: {}",
                    sub.operator,
                    self.schema.stream(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldKind;
    use crate::operator::{priority, OperatorInfo};
    use crate::params::Params;
    use crate::schema::SchemaError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Records its name into a shared log for every event
    struct Tracer {
        name: String,
        priority: i32,
        policy: ErrorPolicy,
        fail: bool,
        drop: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Tracer {
        fn new(name: &str, priority: i32, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                priority,
                policy: ErrorPolicy::FailFast,
                fail: false,
                drop: false,
                log: log.clone(),
            }
        }
    }

    struct TraceHandler {
        name: String,
        fail: bool,
        drop: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl OperatorInfo for Tracer {
        fn name(&self) -> &str {
            &self.name
        }
    }

    impl Operator for Tracer {
        fn priority(&self) -> i32 {
            self.priority
        }

        fn error_policy(&self) -> ErrorPolicy {
            self.policy
        }

        fn attach(
            &self,
            _ctx: &AttachContext<'_>,
            _schema: &mut EventSchema,
        ) -> OperatorResult<Option<Box<dyn EventHandler>>> {
            Ok(Some(Box::new(TraceHandler {
                name: self.name.clone(),
                fail: self.fail,
                drop: self.drop,
                log: self.log.clone(),
            })))
        }
    }

    #[async_trait]
    impl EventHandler for TraceHandler {
        async fn handle(
            &mut self,
            _schema: &EventSchema,
            _record: &mut Record,
        ) -> OperatorResult<EventAction> {
            self.log.lock().push(self.name.clone());
            if self.fail {
                return Err(OperatorError::Other(anyhow::anyhow!("{} failed", self.name)));
            }
            if self.drop {
                return Ok(EventAction::Drop);
            }
            Ok(EventAction::Pass)
        }
    }

    fn with_ctx<R>(f: impl FnOnce(&AttachContext<'_>) -> R) -> R {
        let params = Params::new();
        let cancel = CancellationToken::new();
        f(&AttachContext {
            pipeline: "test",
            params: &params,
            cancel: &cancel,
        })
    }

    fn stream() -> EventStream {
        let mut schema = EventSchema::new("exec");
        schema
            .declare_static("pid", FieldKind::Uint32, 0, 4)
            .unwrap();
        EventStream::new(schema)
    }

    #[tokio::test]
    async fn test_ascending_priority_delivery() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let operators: Vec<Arc<dyn Operator>> = vec![
            Arc::new(Tracer::new("export", 50000, &log)),
            Arc::new(Tracer::new("first", 10, &log)),
            Arc::new(Tracer::new("decode", 100, &log)),
        ];
        let mut stream = stream();
        with_ctx(|ctx| stream.attach_all(ctx, &operators)).unwrap();

        for _ in 0..5 {
            let mut record = stream.new_record(vec![0; 4]);
            assert_eq!(
                stream.deliver(&mut record).await.unwrap(),
                Delivery::Delivered
            );
            let seen: Vec<String> = log.lock().drain(..).collect();
            assert_eq!(seen, vec!["first", "decode", "export"]);
        }
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_attach_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stream = stream();
        with_ctx(|ctx| {
            stream.attach(ctx, &Tracer::new("a", priority::DECODE, &log))?;
            stream.attach(ctx, &Tracer::new("b", priority::DECODE, &log))?;
            stream.attach(ctx, &Tracer::new("c", priority::ENRICH, &log))
        })
        .unwrap();

        let order: Vec<&str> = stream.subscribers().map(|(name, _)| name).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_later_operators() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut failing = Tracer::new("decode", 100, &log);
        failing.fail = true;
        let operators: Vec<Arc<dyn Operator>> = vec![
            Arc::new(failing),
            Arc::new(Tracer::new("export", priority::EXPORT, &log)),
        ];
        let mut stream = stream();
        with_ctx(|ctx| stream.attach_all(ctx, &operators)).unwrap();

        let mut record = stream.new_record(vec![0; 4]);
        let err = stream.deliver(&mut record).await.unwrap_err();
        assert_eq!(err.operator, "decode");
        assert_eq!(err.stream, "exec");
        assert!(!err.is_fatal());
        assert_eq!(*log.lock(), vec!["decode"]);

        // The stream keeps working for the next record
        let mut record = stream.new_record(vec![0; 4]);
        assert!(stream.deliver(&mut record).await.is_err());
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_best_effort_continues() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut lenient = Tracer::new("decode", 100, &log);
        lenient.fail = true;
        lenient.policy = ErrorPolicy::BestEffort;
        let operators: Vec<Arc<dyn Operator>> = vec![
            Arc::new(lenient),
            Arc::new(Tracer::new("export", priority::EXPORT, &log)),
        ];
        let mut stream = stream();
        with_ctx(|ctx| stream.attach_all(ctx, &operators)).unwrap();

        let mut record = stream.new_record(vec![0; 4]);
        assert_eq!(
            stream.deliver(&mut record).await.unwrap(),
            Delivery::Delivered
        );
        assert_eq!(*log.lock(), vec!["decode", "export"]);
    }

    #[tokio::test]
    async fn test_drop_skips_later_operators() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut filter = Tracer::new("filter", priority::ENRICH, &log);
        filter.drop = true;
        let operators: Vec<Arc<dyn Operator>> = vec![
            Arc::new(filter),
            Arc::new(Tracer::new("export", priority::EXPORT, &log)),
        ];
        let mut stream = stream();
        with_ctx(|ctx| stream.attach_all(ctx, &operators)).unwrap();

        let mut record = stream.new_record(vec![0; 4]);
        assert_eq!(
            stream.deliver(&mut record).await.unwrap(),
            Delivery::Dropped {
                by: "filter".into()
            }
        );
        assert_eq!(*log.lock(), vec!["filter"]);
    }

    #[tokio::test]
    async fn test_schema_frozen_after_first_delivery() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stream = stream();
        stream
            .schema_mut()
            .add_field("before", FieldKind::String)
            .unwrap();

        let mut record = stream.new_record(vec![0; 4]);
        stream.deliver(&mut record).await.unwrap();

        assert!(matches!(
            stream.schema_mut().add_field("after", FieldKind::String),
            Err(SchemaError::SchemaFrozen { .. })
        ));
        let late = with_ctx(|ctx| stream.attach(ctx, &Tracer::new("late", 1, &log)));
        assert!(matches!(late, Err(OperatorError::InitializationFailed(_))));
    }
}
