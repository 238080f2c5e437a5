//! Terminal operator: render and export every record

use crate::format::render;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracewire_core::operator::{
    priority, AttachContext, ErrorPolicy, EventAction, EventHandler, Operator, OperatorError,
    OperatorInfo, OperatorResult,
};
use tracewire_core::{EventSchema, ExportSink, Record, SinkError};
use tracing::debug;

/// Renders records as JSON and hands them to a sink.
///
/// Runs last so it sees every field added by earlier operators. Sink
/// failures are logged and the record still counts as delivered; with
/// `fatal_sink_errors` they stop the pipeline.
pub struct ExportOperator {
    sink: Arc<dyn ExportSink>,
    fatal_sink_errors: bool,
}

impl ExportOperator {
    pub fn new(sink: Arc<dyn ExportSink>) -> Self {
        Self {
            sink,
            fatal_sink_errors: false,
        }
    }

    pub fn with_fatal_sink_errors(mut self, fatal: bool) -> Self {
        self.fatal_sink_errors = fatal;
        self
    }
}

impl OperatorInfo for ExportOperator {
    fn name(&self) -> &str {
        "export"
    }

    fn description(&self) -> &str {
        "Renders records as JSON documents for an export sink"
    }
}

impl Operator for ExportOperator {
    fn priority(&self) -> i32 {
        priority::EXPORT
    }

    fn error_policy(&self) -> ErrorPolicy {
        if self.fatal_sink_errors {
            ErrorPolicy::FailFast
        } else {
            ErrorPolicy::BestEffort
        }
    }

    fn attach(
        &self,
        ctx: &AttachContext<'_>,
        schema: &mut EventSchema,
    ) -> OperatorResult<Option<Box<dyn EventHandler>>> {
        debug!(
            "Exporting stream {} of pipeline {} to {}",
            schema.stream(),
            ctx.pipeline,
            self.sink.name()
        );
        Ok(Some(Box::new(ExportHandler {
            sink: self.sink.clone(),
            fatal: self.fatal_sink_errors,
            cancel: ctx.cancel.clone(),
        })))
    }
}

struct ExportHandler {
    sink: Arc<dyn ExportSink>,
    fatal: bool,
    cancel: CancellationToken,
}

impl ExportHandler {
    fn sink_error(&self, source: SinkError) -> OperatorError {
        OperatorError::Sink {
            sink: self.sink.name().to_string(),
            fatal: self.fatal,
            source,
        }
    }
}

#[async_trait]
impl EventHandler for ExportHandler {
    async fn handle(
        &mut self,
        schema: &EventSchema,
        record: &mut Record,
    ) -> OperatorResult<EventAction> {
        let document = render(schema, record)?;
        match self.sink.export(&document, &self.cancel).await {
            Ok(()) => Ok(EventAction::Pass),
            Err(SinkError::Cancelled) => {
                debug!("Export to {} cancelled", self.sink.name());
                Ok(EventAction::Drop)
            }
            Err(e) => Err(self.sink_error(e)),
        }
    }

    async fn flush(&mut self) -> OperatorResult<()> {
        self.sink.flush().await.map_err(|e| self.sink_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tracewire_core::{Delivery, EventStream, FieldKind, Params};

    /// Keeps documents in memory; fails when asked to
    #[derive(Default)]
    struct MemorySink {
        docs: Mutex<Vec<serde_json::Value>>,
        fail: bool,
    }

    #[async_trait]
    impl ExportSink for MemorySink {
        fn name(&self) -> &str {
            "memory"
        }

        async fn export(
            &self,
            document: &serde_json::Value,
            _cancel: &CancellationToken,
        ) -> tracewire_core::SinkResult<()> {
            if self.fail {
                return Err(SinkError::Other(anyhow::anyhow!("disk full")));
            }
            self.docs.lock().push(document.clone());
            Ok(())
        }
    }

    fn attach(op: &ExportOperator, schema: &mut EventSchema) -> Box<dyn EventHandler> {
        let params = Params::new();
        let cancel = CancellationToken::new();
        let ctx = AttachContext {
            pipeline: "test",
            params: &params,
            cancel: &cancel,
        };
        op.attach(&ctx, schema).unwrap().unwrap()
    }

    fn schema() -> EventSchema {
        let mut schema = EventSchema::new("exec");
        schema
            .declare_static("pid", FieldKind::Uint32, 0, 4)
            .unwrap();
        schema
    }

    #[tokio::test]
    async fn test_exports_rendered_record() {
        let sink = Arc::new(MemorySink::default());
        let op = ExportOperator::new(sink.clone());
        let mut schema = schema();
        let mut handler = attach(&op, &mut schema);

        let mut record = schema.new_record(7u32.to_le_bytes().to_vec());
        let action = handler.handle(&schema, &mut record).await.unwrap();
        assert_eq!(action, EventAction::Pass);
        assert_eq!(*sink.docs.lock(), vec![serde_json::json!({"pid": 7})]);
    }

    #[tokio::test]
    async fn test_sink_failure_fatality() {
        for fatal in [false, true] {
            let sink = Arc::new(MemorySink {
                fail: true,
                ..Default::default()
            });
            let op = ExportOperator::new(sink).with_fatal_sink_errors(fatal);
            let mut schema = schema();
            let mut handler = attach(&op, &mut schema);

            let mut record = schema.new_record(vec![0; 4]);
            let err = handler.handle(&schema, &mut record).await.unwrap_err();
            assert!(matches!(err, OperatorError::Sink { ref sink, .. } if sink == "memory"));
            assert_eq!(err.is_fatal(), fatal);

            let expected = if fatal {
                ErrorPolicy::FailFast
            } else {
                ErrorPolicy::BestEffort
            };
            assert_eq!(op.error_policy(), expected);
        }
    }

    #[tokio::test]
    async fn test_non_fatal_sink_error_keeps_record_delivered() {
        let failing = || {
            Arc::new(MemorySink {
                fail: true,
                ..Default::default()
            })
        };
        let params = Params::new();
        let cancel = CancellationToken::new();
        let ctx = AttachContext {
            pipeline: "test",
            params: &params,
            cancel: &cancel,
        };

        let mut stream = EventStream::new(schema());
        let ops: Vec<Arc<dyn Operator>> = vec![Arc::new(ExportOperator::new(failing()))];
        stream.attach_all(&ctx, &ops).unwrap();
        let mut record = stream.new_record(vec![0; 4]);
        assert_eq!(
            stream.deliver(&mut record).await.unwrap(),
            Delivery::Delivered
        );

        let mut stream = EventStream::new(schema());
        let ops: Vec<Arc<dyn Operator>> =
            vec![Arc::new(ExportOperator::new(failing()).with_fatal_sink_errors(true))];
        stream.attach_all(&ctx, &ops).unwrap();
        let mut record = stream.new_record(vec![0; 4]);
        assert!(stream.deliver(&mut record).await.unwrap_err().is_fatal());
    }
}
