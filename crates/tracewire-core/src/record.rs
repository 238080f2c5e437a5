//! Event records

/// One event occurrence: the static buffer emitted by the instrumentation
/// program followed by one payload per dynamically added field.
///
/// Records are only lent to operators for the duration of a delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    payloads: Vec<Vec<u8>>,
}

impl Record {
    pub(crate) fn from_payloads(payloads: Vec<Vec<u8>>) -> Self {
        Self { payloads }
    }

    /// Raw buffer as emitted by the instrumentation program
    pub fn static_payload(&self) -> &[u8] {
        self.payloads.first().map(Vec::as_slice).unwrap_or_default()
    }

    pub(crate) fn static_payload_mut(&mut self) -> &mut [u8] {
        match self.payloads.first_mut() {
            Some(payload) => payload.as_mut_slice(),
            None => &mut [],
        }
    }

    pub(crate) fn payload(&self, index: usize) -> Option<&Vec<u8>> {
        self.payloads.get(index)
    }

    pub(crate) fn payload_mut(&mut self, index: usize) -> Option<&mut Vec<u8>> {
        self.payloads.get_mut(index)
    }
}
