//! The on-disk representation of a completed promise.
//!
//! A promise blob is a variable-length byte sequence:
//!
//! ```text
//! ┌────────────┬────────────┬──────────────────┐
//! │ length u32 │ schema u32 │ payload bytes …  │
//! │ (LE)       │ (LE)       │                  │
//! └────────────┴────────────┴──────────────────┘
//! ```
//!
//! The length field covers everything after itself (schema tag + body).
//! Whole values are capped at [`MAX_BLOB_LEN`]; oversize promises are never
//! persisted and remain memory-resident.
//!
//! Failures are persisted too: a [`JobError`] outcome is stored under the
//! reserved [`SchemaCode::JOB_ERROR`] tag so a rehydrated promise keeps its
//! failure record.

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;

use crate::error::{JobError, SluiceError};
use crate::promise::{PromiseOutcome, PromisePayload, SchemaCode};

/// Maximum length of a persisted blob value, including the length header.
pub const MAX_BLOB_LEN: usize = 1 << 24;

const HEADER_LEN: usize = 8;

/// Serialize an outcome into its blob form.
///
/// Returns [`SluiceError::OversizePromise`] when the encoded value would
/// exceed [`MAX_BLOB_LEN`].
pub fn encode_outcome(outcome: &PromiseOutcome) -> Result<Bytes, SluiceError> {
    let (schema, body) = match outcome {
        PromiseOutcome::Completed(payload) => (payload.schema, payload.body.clone()),
        PromiseOutcome::Failed(error) => {
            let body = serde_json::to_vec(error)
                .map_err(|e| SluiceError::Persistence(format!("failed to encode job error: {e}")))?;
            (SchemaCode::JOB_ERROR, Bytes::from(body))
        }
    };

    let value_len = HEADER_LEN + body.len();
    if value_len > MAX_BLOB_LEN {
        return Err(SluiceError::OversizePromise {
            len: value_len,
            max: MAX_BLOB_LEN,
        });
    }

    let mut buf = BytesMut::with_capacity(value_len);
    buf.put_u32_le((4 + body.len()) as u32);
    buf.put_u32_le(schema.0);
    buf.put(body);
    Ok(buf.freeze())
}

/// Deserialize a blob previously produced by [`encode_outcome`].
///
/// A payload whose schema tag is not registered decodes as an error; the
/// promise store treats that as a miss.
pub fn decode_outcome(
    value: &[u8],
    schemas: &SchemaRegistry,
) -> Result<PromiseOutcome, SluiceError> {
    if value.len() < HEADER_LEN {
        return Err(SluiceError::Persistence(format!(
            "blob of {} bytes is shorter than the {HEADER_LEN}-byte header",
            value.len()
        )));
    }
    let declared = u32::from_le_bytes([value[0], value[1], value[2], value[3]]) as usize;
    if declared != value.len() - 4 {
        return Err(SluiceError::Persistence(format!(
            "blob length field says {declared} bytes but {} follow the header",
            value.len() - 4
        )));
    }
    let schema = SchemaCode(u32::from_le_bytes([value[4], value[5], value[6], value[7]]));
    let body = Bytes::copy_from_slice(&value[HEADER_LEN..]);

    if schema == SchemaCode::JOB_ERROR {
        let error: JobError = serde_json::from_slice(&body)
            .map_err(|e| SluiceError::Persistence(format!("failed to decode job error: {e}")))?;
        return Ok(PromiseOutcome::Failed(error));
    }
    if !schemas.is_registered(schema) {
        return Err(SluiceError::Persistence(format!(
            "blob carries unregistered {schema}"
        )));
    }
    Ok(PromiseOutcome::Completed(PromisePayload { schema, body }))
}

// =============================================================================
// Schema Registry
// =============================================================================

/// Registry of known payload schemas.
///
/// Rehydration consults it: a blob tagged with an unregistered schema cannot
/// be interpreted and yields a miss. The reserved schemas are pre-registered.
///
/// # Panics
///
/// [`SchemaRegistry::register`] panics on duplicate or reserved codes; schema
/// registration is wiring code that runs once at startup, and a collision
/// there is a programmer error.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    names: DashMap<SchemaCode, &'static str>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, code: SchemaCode, name: &'static str) {
        if code.is_reserved() {
            panic!("{code} is reserved");
        }
        if self.names.insert(code, name).is_some() {
            panic!("{code} is already registered");
        }
    }

    pub fn is_registered(&self, code: SchemaCode) -> bool {
        code.is_reserved() || self.names.contains_key(&code)
    }

    pub fn name_of(&self, code: SchemaCode) -> Option<&'static str> {
        match code {
            SchemaCode::JOB_ERROR => Some("job-error"),
            SchemaCode::PROMISE_LIST => Some("promise-list"),
            other => self.names.get(&other).map(|entry| *entry),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
