//! Console sink

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracewire_core::{ExportSink, SinkError, SinkResult};

/// Prints one JSON document per line to any async writer, stdout by default
pub struct StdoutSink<W = Stdout> {
    out: Mutex<W>,
    pretty: bool,
}

impl StdoutSink<Stdout> {
    pub fn new(pretty: bool) -> Self {
        Self::with_writer(tokio::io::stdout(), pretty)
    }
}

impl<W> StdoutSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn with_writer(out: W, pretty: bool) -> Self {
        Self {
            out: Mutex::new(out),
            pretty,
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W> ExportSink for StdoutSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn name(&self) -> &str {
        "stdout"
    }

    async fn export(
        &self,
        document: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> SinkResult<()> {
        let mut line = if self.pretty {
            serde_json::to_vec_pretty(document)?
        } else {
            serde_json::to_vec(document)?
        };
        line.push(b'\n');

        // Cancellation only applies while waiting for the writer. A line
        // that started is always finished, the writer is shared.
        let mut out = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SinkError::Cancelled),
            out = self.out.lock() => out,
        };
        out.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&self) -> SinkResult<()> {
        self.out.lock().await.flush().await?;
        Ok(())
    }
}
