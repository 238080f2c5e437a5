//! Test doubles for runtimes and operators

use crate::field::{Field, FieldKind};
use crate::image::GadgetImage;
use crate::operator::{
    priority, AttachContext, ErrorPolicy, EventAction, EventHandler, Operator, OperatorInfo,
    OperatorResult,
};
use crate::params::Params;
use crate::record::Record;
use crate::runtime::{GadgetInstance, GadgetRuntime, RuntimeError, RuntimeResult, StreamSource};
use crate::schema::EventSchema;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub fn image(reference: &str) -> GadgetImage {
    GadgetImage::from_bytes(reference, reference.as_bytes().to_vec()).unwrap()
}

/// Emits records carrying a `seq` number; `None` count means forever
pub struct CountingRuntime {
    pub count: Option<u32>,
    pub interval: Option<Duration>,
}

impl CountingRuntime {
    pub fn finite(count: u32) -> Self {
        Self {
            count: Some(count),
            interval: None,
        }
    }

    pub fn endless(interval: Duration) -> Self {
        Self {
            count: None,
            interval: Some(interval),
        }
    }
}

#[async_trait]
impl GadgetRuntime for CountingRuntime {
    fn name(&self) -> &str {
        "counting"
    }

    async fn start(
        &self,
        _image: &GadgetImage,
        _params: &Params,
        cancel: CancellationToken,
    ) -> RuntimeResult<GadgetInstance> {
        let mut schema = EventSchema::new("seq");
        schema.declare_static("seq", FieldKind::Uint32, 0, 4)?;
        let (tx, rx) = mpsc::channel(4);
        let count = self.count;
        let interval = self.interval;

        let completion = tokio::spawn(async move {
            let mut seq: u32 = 0;
            while count.map_or(true, |c| seq < c) {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(seq.to_le_bytes().to_vec()) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
                seq = seq.wrapping_add(1);
                if let Some(interval) = interval {
                    tokio::time::sleep(interval).await;
                }
            }
            Ok(())
        });

        Ok(GadgetInstance {
            streams: vec![StreamSource { schema, events: rx }],
            completion,
        })
    }
}

/// Refuses to start
pub struct FailingRuntime;

#[async_trait]
impl GadgetRuntime for FailingRuntime {
    fn name(&self) -> &str {
        "failing"
    }

    async fn start(
        &self,
        image: &GadgetImage,
        _params: &Params,
        _cancel: CancellationToken,
    ) -> RuntimeResult<GadgetInstance> {
        Err(RuntimeError::GadgetFailed {
            gadget: image.reference().to_string(),
            reason: "program failed to load".to_string(),
        })
    }
}

/// Shared view of what a [`Recorder`] saw
#[derive(Default)]
pub struct Seen {
    pub delivered: AtomicU64,
    pub flushed: AtomicBool,
}

/// Counts deliveries on the `seq` stream
pub struct Recorder {
    pub seen: Arc<Seen>,
}

struct RecorderHandler {
    seq: Field,
    seen: Arc<Seen>,
}

impl OperatorInfo for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }
}

impl Operator for Recorder {
    fn priority(&self) -> i32 {
        priority::EXPORT
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
        Ok(Some(Box::new(RecorderHandler {
            seq,
            seen: self.seen.clone(),
        })))
    }
}

#[async_trait]
impl EventHandler for RecorderHandler {
    async fn handle(
        &mut self,
        _schema: &EventSchema,
        record: &mut Record,
    ) -> OperatorResult<EventAction> {
        self.seq.get_u32(record)?;
        self.seen.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(EventAction::Pass)
    }

    async fn flush(&mut self) -> OperatorResult<()> {
        self.seen.flushed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
