//! Static record layouts of the built-in gadgets
//!
//! Offsets follow the C structs emitted by the instrumentation programs
//! (natural alignment, little-endian). The leading 8-byte kernel timestamp
//! of each struct is carried in the payload but not exposed as a field.

use tracewire_core::schema::SchemaResult;
use tracewire_core::{EventSchema, FieldKind, GadgetImage};

pub const TRACE_EXEC: &str = "trace_exec";
pub const TRACE_DNS: &str = "trace_dns";

pub const TASK_COMM_LEN: usize = 16;
pub const MAX_CWD_LEN: usize = 256;
pub const ARGS_BUF_LEN: usize = 7680;
pub const DNS_DATA_LEN: usize = 512;

/// `struct event` of trace_exec
pub mod exec {
    use super::*;

    pub const COMM: usize = 8;
    pub const PID: usize = 24;
    pub const TID: usize = 28;
    pub const UID: usize = 32;
    pub const GID: usize = 36;
    pub const PCOMM: usize = 40;
    pub const PPID: usize = 56;
    pub const ERROR_RAW: usize = 60;
    pub const ARGS_COUNT: usize = 64;
    pub const ARGS_SIZE: usize = 68;
    pub const CWD: usize = 72;
    pub const ARGS: usize = CWD + MAX_CWD_LEN;
    pub const SIZE: usize = ARGS + ARGS_BUF_LEN;
}

/// `struct event_t` of trace_dns
pub mod dns {
    use super::*;

    pub const PID: usize = 8;
    pub const COMM: usize = 12;
    pub const DATA_LEN: usize = 28;
    pub const DNS_OFF: usize = 32;
    pub const DATA: usize = 36;
    pub const SIZE: usize = DATA + DNS_DATA_LEN;
}

pub fn exec_schema() -> SchemaResult<EventSchema> {
    let mut schema = EventSchema::new("exec");
    schema.declare_static("comm", FieldKind::String, exec::COMM, TASK_COMM_LEN)?;
    schema.declare_static("pid", FieldKind::Uint32, exec::PID, 4)?;
    schema.declare_static("tid", FieldKind::Uint32, exec::TID, 4)?;
    schema.declare_static("uid", FieldKind::Uint32, exec::UID, 4)?;
    schema.declare_static("gid", FieldKind::Uint32, exec::GID, 4)?;
    schema.declare_static("pcomm", FieldKind::String, exec::PCOMM, TASK_COMM_LEN)?;
    schema.declare_static("ppid", FieldKind::Uint32, exec::PPID, 4)?;
    schema.declare_static("error_raw", FieldKind::Int32, exec::ERROR_RAW, 4)?;
    schema.declare_static("args_count", FieldKind::Int32, exec::ARGS_COUNT, 4)?;
    schema.declare_static("args_size", FieldKind::Uint32, exec::ARGS_SIZE, 4)?;
    schema.declare_static("cwd", FieldKind::String, exec::CWD, MAX_CWD_LEN)?;
    schema.declare_static("args", FieldKind::Bytes, exec::ARGS, ARGS_BUF_LEN)?;
    Ok(schema)
}

pub fn dns_schema() -> SchemaResult<EventSchema> {
    let mut schema = EventSchema::new("dns");
    schema.declare_static("pid", FieldKind::Uint32, dns::PID, 4)?;
    schema.declare_static("comm", FieldKind::String, dns::COMM, TASK_COMM_LEN)?;
    schema.declare_static("data_len", FieldKind::Uint32, dns::DATA_LEN, 4)?;
    schema.declare_static("dns_off", FieldKind::Uint16, dns::DNS_OFF, 2)?;
    schema.declare_static("data", FieldKind::Bytes, dns::DATA, DNS_DATA_LEN)?;
    Ok(schema)
}

/// Schema of a built-in gadget
pub fn schema_for(gadget: &str) -> Option<SchemaResult<EventSchema>> {
    match gadget {
        TRACE_EXEC => Some(exec_schema()),
        TRACE_DNS => Some(dns_schema()),
        _ => None,
    }
}

/// Leading bytes of the descriptor a built-in image carries
pub const DESCRIPTOR_PREFIX: &str = "tracewire-gadget:";

/// `tracewire-gadget:<gadget>:<record size>`
pub fn descriptor(gadget: &str, record_size: usize) -> String {
    format!("{}{}:{}", DESCRIPTOR_PREFIX, gadget, record_size)
}

/// Image handle of a built-in gadget
pub fn builtin_image(gadget: &str) -> Option<GadgetImage> {
    let descriptor = match gadget {
        TRACE_EXEC => descriptor(TRACE_EXEC, exec::SIZE),
        TRACE_DNS => descriptor(TRACE_DNS, dns::SIZE),
        _ => return None,
    };
    GadgetImage::from_bytes(gadget, descriptor.into_bytes()).ok()
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Copy a C string, truncated to leave room for the terminating NUL
fn put_cstr(buf: &mut [u8], offset: usize, size: usize, value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(size - 1);
    buf[offset..offset + n].copy_from_slice(&bytes[..n]);
}

/// One process execution
#[derive(Debug, Clone, Default)]
pub struct ExecEvent {
    pub pid: u32,
    pub tid: u32,
    pub uid: u32,
    pub gid: u32,
    pub comm: String,
    pub pcomm: String,
    pub ppid: u32,
    pub error: i32,
    pub cwd: String,
    pub args: Vec<String>,
}

impl ExecEvent {
    /// Encode as a trace_exec record. Arguments that do not fit the
    /// buffer are left out.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; exec::SIZE];
        put_cstr(&mut buf, exec::COMM, TASK_COMM_LEN, &self.comm);
        put_u32(&mut buf, exec::PID, self.pid);
        put_u32(&mut buf, exec::TID, self.tid);
        put_u32(&mut buf, exec::UID, self.uid);
        put_u32(&mut buf, exec::GID, self.gid);
        put_cstr(&mut buf, exec::PCOMM, TASK_COMM_LEN, &self.pcomm);
        put_u32(&mut buf, exec::PPID, self.ppid);
        buf[exec::ERROR_RAW..exec::ERROR_RAW + 4].copy_from_slice(&self.error.to_le_bytes());
        put_cstr(&mut buf, exec::CWD, MAX_CWD_LEN, &self.cwd);

        let mut size = 0usize;
        let mut count = 0u32;
        for arg in &self.args {
            let len = arg.len() + 1;
            if size + len > ARGS_BUF_LEN {
                break;
            }
            let at = exec::ARGS + size;
            buf[at..at + arg.len()].copy_from_slice(arg.as_bytes());
            size += len;
            count += 1;
        }
        put_u32(&mut buf, exec::ARGS_COUNT, count);
        put_u32(&mut buf, exec::ARGS_SIZE, size as u32);
        buf
    }
}

/// One captured DNS packet
#[derive(Debug, Clone, Default)]
pub struct DnsEvent {
    pub pid: u32,
    pub comm: String,
    /// Link, network and transport headers ahead of the DNS message
    pub headers_len: u16,
    pub message: Vec<u8>,
}

impl DnsEvent {
    /// Encode as a trace_dns record; the packet is cut at the data buffer
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; dns::SIZE];
        put_u32(&mut buf, dns::PID, self.pid);
        put_cstr(&mut buf, dns::COMM, TASK_COMM_LEN, &self.comm);

        let headers = self.headers_len as usize;
        let total = headers + self.message.len();
        put_u32(&mut buf, dns::DATA_LEN, total as u32);
        buf[dns::DNS_OFF..dns::DNS_OFF + 2].copy_from_slice(&self.headers_len.to_le_bytes());

        let start = (dns::DATA + headers).min(dns::SIZE);
        let n = self.message.len().min(dns::SIZE - start);
        buf[start..start + n].copy_from_slice(&self.message[..n]);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(exec::SIZE, 8008);
        assert_eq!(dns::SIZE, 548);
        assert_eq!(exec_schema().unwrap().static_size(), exec::SIZE);
        assert_eq!(dns_schema().unwrap().static_size(), dns::SIZE);
    }

    #[test]
    fn test_exec_encoding_reads_back() {
        let schema = exec_schema().unwrap();
        let event = ExecEvent {
            pid: 4242,
            ppid: 1,
            comm: "ls".into(),
            pcomm: "a-very-long-parent-name".into(),
            error: -2,
            cwd: "/home/user".into(),
            args: vec!["ls".into(), "-la".into()],
            ..Default::default()
        };
        let record = schema.new_record(event.encode());

        let field = |name: &str| schema.get_field(name).unwrap();
        assert_eq!(field("pid").get_u32(&record).unwrap(), 4242);
        assert_eq!(field("comm").get_string(&record).unwrap(), "ls");
        assert_eq!(field("pcomm").get_string(&record).unwrap(), "a-very-long-par");
        assert_eq!(field("error_raw").get_i32(&record).unwrap(), -2);
        assert_eq!(field("cwd").get_string(&record).unwrap(), "/home/user");
        assert_eq!(field("args_count").get_i32(&record).unwrap(), 2);
        assert_eq!(field("args_size").get_u32(&record).unwrap(), 7);
        assert_eq!(&field("args").bytes_ref(&record).unwrap()[..7], b"ls\0-la\0");
    }

    #[test]
    fn test_dns_encoding_reads_back() {
        let schema = dns_schema().unwrap();
        let event = DnsEvent {
            pid: 9,
            comm: "curl".into(),
            headers_len: 42,
            message: vec![0x12, 0x34],
        };
        let record = schema.new_record(event.encode());

        let field = |name: &str| schema.get_field(name).unwrap();
        assert_eq!(field("data_len").get_u32(&record).unwrap(), 44);
        assert_eq!(field("dns_off").get_u16(&record).unwrap(), 42);
        assert_eq!(&field("data").bytes_ref(&record).unwrap()[42..44], &[0x12, 0x34]);
    }

    #[test]
    fn test_builtin_images() {
        let image = builtin_image(TRACE_DNS).unwrap();
        assert_eq!(image.reference(), "trace_dns");
        assert!(image.digest().starts_with("sha256:"));
        assert!(builtin_image("trace_open").is_none());
        assert!(schema_for("trace_open").is_none());
    }
}
