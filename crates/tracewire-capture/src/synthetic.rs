//! Synthetic gadget runtime
//!
//! Emits trace_exec and trace_dns records at a fixed interval without any
//! kernel instrumentation. Used by `tracewire demo`, in CI, and on hosts
//! where eBPF is unavailable.

use crate::layouts::{self, DnsEvent, ExecEvent, TRACE_DNS, TRACE_EXEC};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracewire_core::runtime::{
    GadgetInstance, GadgetRuntime, RuntimeError, RuntimeResult, StreamSource,
};
use tracewire_core::{GadgetImage, Params};
use tracing::{debug, info};

/// Overrides `SyntheticConfig::interval` for one pipeline
pub const INTERVAL_PARAM: &str = "runtime.interval_ms";
/// Overrides `SyntheticConfig::count` for one pipeline
pub const COUNT_PARAM: &str = "runtime.count";

/// Configuration for synthetic record generation
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Delay between records
    pub interval: Duration,

    /// Records to emit before completing; endless when unset
    pub count: Option<u64>,

    /// Fail the gadget after this many records
    pub fail_after: Option<u64>,

    /// Simulated process id
    pub pid: u32,

    /// Simulated process name
    pub process_name: String,

    /// Capacity of each stream's channel
    pub buffer: usize,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            count: None,
            fail_after: None,
            pid: std::process::id(),
            process_name: "tracewire".to_string(),
            buffer: 64,
        }
    }
}

/// Runtime that fabricates records in the built-in gadget layouts
pub struct SyntheticRuntime {
    config: SyntheticConfig,
}

impl SyntheticRuntime {
    pub fn new() -> Self {
        Self::with_config(SyntheticConfig::default())
    }

    pub fn with_config(config: SyntheticConfig) -> Self {
        Self { config }
    }
}

impl Default for SyntheticRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GadgetRuntime for SyntheticRuntime {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn start(
        &self,
        image: &GadgetImage,
        params: &Params,
        cancel: CancellationToken,
    ) -> RuntimeResult<GadgetInstance> {
        let gadget = image.reference().to_string();
        let schema = layouts::schema_for(&gadget)
            .ok_or_else(|| RuntimeError::UnsupportedImage(gadget.clone()))??;
        check_descriptor(image, schema.static_size())?;

        let mut config = self.config.clone();
        if let Some(ms) = params.get_parsed::<u64>(INTERVAL_PARAM)? {
            config.interval = Duration::from_millis(ms);
        }
        if let Some(count) = params.get_parsed::<u64>(COUNT_PARAM)? {
            config.count = Some(count);
        }

        let (tx, rx) = mpsc::channel(config.buffer.max(1));
        info!(
            "Synthetic gadget {} starting ({} digest {})",
            gadget,
            image.reference(),
            image.digest()
        );

        let completion = tokio::spawn(generate(gadget, config, tx, cancel));
        Ok(GadgetInstance {
            streams: vec![StreamSource { schema, events: rx }],
            completion,
        })
    }
}

/// An image carrying a descriptor must describe the layout we emit.
/// Other archives are not inspected.
fn check_descriptor(image: &GadgetImage, record_size: usize) -> RuntimeResult<()> {
    let Ok(text) = std::str::from_utf8(image.bytes()) else {
        return Ok(());
    };
    if !text.starts_with(layouts::DESCRIPTOR_PREFIX) {
        return Ok(());
    }
    let expected = layouts::descriptor(image.reference(), record_size);
    if text != expected {
        return Err(RuntimeError::InitializationFailed(format!(
            "image descriptor {} does not match {}",
            text, expected
        )));
    }
    Ok(())
}

async fn generate(
    gadget: String,
    config: SyntheticConfig,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) -> RuntimeResult<()> {
    let mut seq = 0u64;

    while config.count.map_or(true, |count| seq < count) {
        if config.fail_after.is_some_and(|limit| seq >= limit) {
            return Err(RuntimeError::GadgetFailed {
                gadget,
                reason: format!("injected failure after {} records", seq),
            });
        }

        let payload = match gadget.as_str() {
            TRACE_EXEC => exec_record(&config, seq),
            TRACE_DNS => dns_record(&config, seq),
            other => return Err(RuntimeError::UnsupportedImage(other.to_string())),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tx.send(payload) => {
                if sent.is_err() {
                    debug!("Stream of {} closed", gadget);
                    break;
                }
            }
        }
        seq += 1;

        if !config.interval.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(config.interval) => {}
            }
        }
    }

    info!("Synthetic gadget {} stopped after {} records", gadget, seq);
    Ok(())
}

const COMMANDS: &[&[&str]] = &[
    &["ls", "-la"],
    &["cat", "/etc/hostname"],
    &["curl", "-s", "https://example.com"],
    &["git", "status"],
];

const LOOKUPS: &[(&str, Ipv4Addr)] = &[
    ("example.com", Ipv4Addr::new(93, 184, 216, 34)),
    ("localhost.localdomain", Ipv4Addr::new(127, 0, 0, 1)),
];

fn exec_record(config: &SyntheticConfig, seq: u64) -> Vec<u8> {
    let args: &[&str] = COMMANDS[seq as usize % COMMANDS.len()];
    ExecEvent {
        pid: config.pid,
        tid: config.pid,
        uid: 1000,
        gid: 1000,
        comm: args[0].to_string(),
        pcomm: config.process_name.clone(),
        ppid: 1,
        error: 0,
        cwd: "/".to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
    }
    .encode()
}

/// Alternates a query and its response
fn dns_record(config: &SyntheticConfig, seq: u64) -> Vec<u8> {
    let (name, addr) = LOOKUPS[(seq / 2) as usize % LOOKUPS.len()];
    let id = (seq / 2) as u16;
    let message = if seq % 2 == 0 {
        dns_query(id, name)
    } else {
        dns_response(id, name, addr)
    };
    DnsEvent {
        pid: config.pid,
        comm: config.process_name.clone(),
        // Ethernet + IPv4 + UDP
        headers_len: 42,
        message,
    }
    .encode()
}

fn encode_name(name: &str, out: &mut Vec<u8>) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
}

/// Recursive A query for `name`
pub fn dns_query(id: u16, name: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(32 + name.len());
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&[0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
    encode_name(name, &mut msg);
    msg.extend_from_slice(&[0, 1, 0, 1]);
    msg
}

/// Successful response with a single A answer
pub fn dns_response(id: u16, name: &str, addr: Ipv4Addr) -> Vec<u8> {
    let mut msg = Vec::with_capacity(48 + name.len());
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&[0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0]);
    encode_name(name, &mut msg);
    msg.extend_from_slice(&[0, 1, 0, 1]);
    // Answer name points back at the question
    msg.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1]);
    msg.extend_from_slice(&300u32.to_be_bytes());
    msg.extend_from_slice(&4u16.to_be_bytes());
    msg.extend_from_slice(&addr.octets());
    msg
}
