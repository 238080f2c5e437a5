//! Argument-vector reconstruction
//!
//! Exec events carry `argv` as one buffer of NUL-terminated strings. This
//! operator rewrites the buffer in place as a single space-separated
//! command line.

use async_trait::async_trait;
use tracewire_core::operator::{
    priority, AttachContext, ErrorPolicy, EventAction, EventHandler, Operator, OperatorInfo,
    OperatorResult,
};
use tracewire_core::{EventSchema, Field, FieldKind, Record};
use tracing::debug;

/// Join the NUL-delimited tokens within the first `size` bytes of `raw`.
///
/// Bytes after the last NUL are an unterminated token and are discarded.
/// Empty tokens count as arguments unless nothing but empty tokens follows
/// them.
pub fn join_args(raw: &[u8], size: usize) -> String {
    let bounded = &raw[..size.min(raw.len())];
    let mut tokens: Vec<&[u8]> = bounded.split(|&b| b == 0).collect();
    // The last piece was never terminated
    tokens.pop();
    while tokens.last().is_some_and(|t| t.is_empty()) {
        tokens.pop();
    }

    let mut line = Vec::with_capacity(bounded.len());
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            line.push(b' ');
        }
        line.extend_from_slice(token);
    }
    String::from_utf8_lossy(&line).into_owned()
}

/// Rewrites `args` as a command line, bounded by `args_size`
pub struct ArgsOperator {
    policy: ErrorPolicy,
}

impl ArgsOperator {
    pub fn new(policy: ErrorPolicy) -> Self {
        Self { policy }
    }
}

impl Default for ArgsOperator {
    fn default() -> Self {
        Self::new(ErrorPolicy::FailFast)
    }
}

impl OperatorInfo for ArgsOperator {
    fn name(&self) -> &str {
        "args"
    }

    fn description(&self) -> &str {
        "Joins NUL-delimited argv buffers into command lines"
    }
}

impl Operator for ArgsOperator {
    fn priority(&self) -> i32 {
        priority::DECODE
    }

    fn error_policy(&self) -> ErrorPolicy {
        self.policy
    }

    fn attach(
        &self,
        _ctx: &AttachContext<'_>,
        schema: &mut EventSchema,
    ) -> OperatorResult<Option<Box<dyn EventHandler>>> {
        if schema.get_field("args").is_none() {
            debug!("Stream {} carries no argv", schema.stream());
            return Ok(None);
        }

        Ok(Some(Box::new(ArgsHandler {
            args: schema.require_field("args", FieldKind::Bytes)?,
            args_size: schema.require_field("args_size", FieldKind::Uint32)?,
        })))
    }
}

struct ArgsHandler {
    args: Field,
    args_size: Field,
}

#[async_trait]
impl EventHandler for ArgsHandler {
    async fn handle(
        &mut self,
        _schema: &EventSchema,
        record: &mut Record,
    ) -> OperatorResult<EventAction> {
        let size = self.args_size.get_u32(record)? as usize;
        let line = join_args(self.args.bytes_ref(record)?, size);
        self.args.put_bytes(record, line.as_bytes())?;
        Ok(EventAction::Pass)
    }
}
