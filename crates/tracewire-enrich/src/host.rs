//! Host information enrichment

use async_trait::async_trait;
use std::sync::OnceLock;
use tracewire_core::operator::{
    priority, AttachContext, ErrorPolicy, EventAction, EventHandler, Operator, OperatorInfo,
    OperatorResult,
};
use tracewire_core::{EventSchema, Field, FieldKind, Record};

static HOST_NAME: OnceLock<String> = OnceLock::new();

fn host_name() -> &'static str {
    HOST_NAME.get_or_init(|| {
        hostname::get()
            .map(|h: std::ffi::OsString| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    })
}

/// Adds `host.name` to every stream
pub struct HostOperator;

impl HostOperator {
    pub fn new() -> Self {
        host_name();
        Self
    }
}

impl Default for HostOperator {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorInfo for HostOperator {
    fn name(&self) -> &str {
        "host"
    }

    fn description(&self) -> &str {
        "Adds the host name to every record"
    }
}

impl Operator for HostOperator {
    fn priority(&self) -> i32 {
        priority::ENRICH
    }

    fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::BestEffort
    }

    fn attach(
        &self,
        _ctx: &AttachContext<'_>,
        schema: &mut EventSchema,
    ) -> OperatorResult<Option<Box<dyn EventHandler>>> {
        let field = schema.add_field("host.name", FieldKind::String)?;
        Ok(Some(Box::new(HostHandler { field })))
    }
}

struct HostHandler {
    field: Field,
}

#[async_trait]
impl EventHandler for HostHandler {
    async fn handle(
        &mut self,
        _schema: &EventSchema,
        record: &mut Record,
    ) -> OperatorResult<EventAction> {
        self.field.put_string(record, host_name())?;
        Ok(EventAction::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use tracewire_core::Params;

    #[tokio::test]
    async fn test_adds_host_name() {
        let mut schema = EventSchema::new("dns");
        let params = Params::new();
        let cancel = CancellationToken::new();
        let ctx = AttachContext {
            pipeline: "test",
            params: &params,
            cancel: &cancel,
        };
        let mut handler = HostOperator::new()
            .attach(&ctx, &mut schema)
            .unwrap()
            .unwrap();

        let mut record = schema.new_record(Vec::new());
        handler.handle(&schema, &mut record).await.unwrap();

        let name = schema
            .get_field("host.name")
            .unwrap()
            .get_string(&record)
            .unwrap();
        assert!(!name.is_empty());
        assert_eq!(name, host_name());
    }
}
