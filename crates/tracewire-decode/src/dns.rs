//! DNS decoder
//!
//! Parses the DNS message embedded in a captured packet with
//! `hickory-proto` and exposes the header, first question and A/AAAA
//! answers as record fields.

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::{Name, RData};
use thiserror::Error;
use tracewire_core::operator::{
    priority, AttachContext, ErrorPolicy, EventAction, EventHandler, Operator, OperatorError,
    OperatorInfo, OperatorResult,
};
use tracewire_core::{EventSchema, Field, FieldKind, Record};
use tracing::debug;

/// Errors raised while decoding a DNS message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("DNS offset {offset} is beyond payload length {len}")]
    OffsetBeyondPayload { offset: u16, len: u32 },

    #[error("Malformed DNS message: {0}")]
    Malformed(String),
}

impl From<DecodeError> for OperatorError {
    fn from(e: DecodeError) -> Self {
        OperatorError::Decode(Box::new(e))
    }
}

/// The parts of a message that become record fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub id: u16,
    /// Set on responses
    pub qr: bool,
    pub rcode: u16,
    /// Name, type of the first question
    pub question: Option<(String, u16)>,
    pub num_answers: usize,
    /// A and AAAA answers in message order
    pub addresses: Vec<String>,
}

impl Summary {
    pub fn parse(msg: &[u8]) -> Result<Self, DecodeError> {
        let message =
            Message::from_vec(msg).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let question = message
            .queries()
            .first()
            .map(|q| (presentation(q.name()), u16::from(q.query_type())));
        let addresses = message
            .answers()
            .iter()
            .filter_map(|answer| match answer.data()? {
                RData::A(a) => Some(a.0.to_string()),
                RData::AAAA(aaaa) => Some(aaaa.0.to_string()),
                _ => None,
            })
            .collect();

        Ok(Summary {
            id: message.id(),
            qr: message.message_type() == MessageType::Response,
            rcode: u16::from(message.response_code()),
            question,
            num_answers: message.answers().len(),
            addresses,
        })
    }
}

/// No trailing dot; the root stays `.`
fn presentation(name: &Name) -> String {
    if name.is_root() {
        return ".".to_string();
    }
    name.to_utf8().trim_end_matches('.').to_string()
}

/// Name of a record type, or its decimal value when unknown
pub fn type_name(qtype: u16) -> String {
    let name = match qtype {
        1 => "A",
        2 => "NS",
        5 => "CNAME",
        6 => "SOA",
        11 => "WKS",
        12 => "PTR",
        13 => "HINFO",
        14 => "MINFO",
        15 => "MX",
        16 => "TXT",
        28 => "AAAA",
        33 => "SRV",
        41 => "OPT",
        252 => "AXFR",
        255 => "ALL",
        other => return other.to_string(),
    };
    name.to_string()
}

/// Name of a response code, or its decimal value when unknown
pub fn rcode_name(rcode: u16) -> String {
    let name = match rcode {
        0 => "Success",
        1 => "FormatError",
        2 => "ServerFailure",
        3 => "NameError",
        4 => "NotImplemented",
        5 => "Refused",
        other => return other.to_string(),
    };
    name.to_string()
}

/// Decodes DNS messages out of the `data` buffer of packet streams
pub struct DnsOperator {
    policy: ErrorPolicy,
}

impl DnsOperator {
    pub fn new(policy: ErrorPolicy) -> Self {
        Self { policy }
    }
}

impl OperatorInfo for DnsOperator {
    fn name(&self) -> &str {
        "dns"
    }

    fn description(&self) -> &str {
        "Decodes DNS queries and responses from captured packets"
    }
}

impl Operator for DnsOperator {
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
        if schema.get_field("data").is_none() {
            debug!("Stream {} carries no packet data", schema.stream());
            return Ok(None);
        }

        let inputs = Inputs {
            data: schema.require_field("data", FieldKind::Bytes)?,
            dns_off: schema.require_field("dns_off", FieldKind::Uint16)?,
            data_len: schema.require_field("data_len", FieldKind::Uint32)?,
        };
        let outputs = Outputs {
            id: schema.add_field("id", FieldKind::String)?,
            qr_raw: schema.add_field("qr_raw", FieldKind::Bool)?,
            qr: schema.add_field("qr", FieldKind::String)?,
            qtype_raw: schema.add_field("qtype_raw", FieldKind::Uint16)?,
            qtype: schema.add_field("qtype", FieldKind::String)?,
            name: schema.add_field("name", FieldKind::String)?,
            rcode_raw: schema.add_field("rcode_raw", FieldKind::Uint16)?,
            rcode: schema.add_field("rcode", FieldKind::String)?,
            num_answers: schema.add_field("num_answers", FieldKind::Int32)?,
            addresses: schema.add_field("addresses", FieldKind::String)?,
        };

        Ok(Some(Box::new(DnsHandler { inputs, outputs })))
    }
}

struct Inputs {
    data: Field,
    dns_off: Field,
    data_len: Field,
}

struct Outputs {
    id: Field,
    qr_raw: Field,
    qr: Field,
    qtype_raw: Field,
    qtype: Field,
    name: Field,
    rcode_raw: Field,
    rcode: Field,
    num_answers: Field,
    addresses: Field,
}

struct DnsHandler {
    inputs: Inputs,
    outputs: Outputs,
}

impl DnsHandler {
    fn summarize(&self, record: &Record) -> OperatorResult<Summary> {
        let data_len = self.inputs.data_len.get_u32(record)?;
        let dns_off = self.inputs.dns_off.get_u16(record)?;
        if u32::from(dns_off) > data_len {
            return Err(DecodeError::OffsetBeyondPayload {
                offset: dns_off,
                len: data_len,
            }
            .into());
        }

        let data = self.inputs.data.bytes_ref(record)?;
        let end = (data_len as usize).min(data.len());
        let payload = data.get(dns_off as usize..end).unwrap_or_default();
        Ok(Summary::parse(payload)?)
    }
}

#[async_trait]
impl EventHandler for DnsHandler {
    async fn handle(
        &mut self,
        _schema: &EventSchema,
        record: &mut Record,
    ) -> OperatorResult<EventAction> {
        let summary = self.summarize(record)?;
        let out = &self.outputs;

        out.id.put_string(record, &format!("{:04x}", summary.id))?;
        out.qr_raw.put_bool(record, summary.qr)?;
        if summary.qr {
            out.qr.put_string(record, "R")?;
            out.rcode_raw.put_u16(record, summary.rcode)?;
            out.rcode.put_string(record, &rcode_name(summary.rcode))?;
        } else {
            out.qr.put_string(record, "Q")?;
        }

        if let Some((name, qtype)) = &summary.question {
            out.qtype_raw.put_u16(record, *qtype)?;
            out.qtype.put_string(record, &type_name(*qtype))?;
            out.name.put_string(record, name)?;
        }

        let num_answers = i32::try_from(summary.num_answers).unwrap_or(i32::MAX);
        out.num_answers.put_i32(record, num_answers)?;
        out.addresses
            .put_string(record, &summary.addresses.join(","))?;

        Ok(EventAction::Pass)
    }
}
