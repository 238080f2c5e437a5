//! Bytecode image handles
//!
//! The pipeline never looks inside an image. It only carries the
//! reference, the content digest and the bytes through to the runtime.

use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image {0} is empty")]
    Empty(String),

    #[error("failed to read image {reference}: {source}")]
    Read {
        reference: String,
        #[source]
        source: std::io::Error,
    },
}

/// Opaque, content-addressed instrumentation program
#[derive(Clone)]
pub struct GadgetImage {
    reference: String,
    digest: String,
    bytes: Arc<[u8]>,
}

impl GadgetImage {
    /// Build an image from an in-memory archive
    pub fn from_bytes(
        reference: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Result<Self, ImageError> {
        let reference = reference.into();
        let bytes: Arc<[u8]> = bytes.into();
        if bytes.is_empty() {
            return Err(ImageError::Empty(reference));
        }

        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));
        Ok(Self {
            reference,
            digest,
            bytes,
        })
    }

    /// Read an archive from disk
    pub fn load(reference: impl Into<String>, path: &Path) -> Result<Self, ImageError> {
        let reference = reference.into();
        let bytes = std::fs::read(path).map_err(|source| ImageError::Read {
            reference: reference.clone(),
            source,
        })?;
        Self::from_bytes(reference, bytes)
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for GadgetImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GadgetImage")
            .field("reference", &self.reference)
            .field("digest", &self.digest)
            .field("len", &self.bytes.len())
            .finish()
    }
}
