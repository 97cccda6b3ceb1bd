//! Decoder registry: turns stored logs into tagged, decoded values.
//!
//! Consumers register one decoder per event signature and look logs up by
//! their `event_sig` instead of switching over concrete event types.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::error::PollerError;
use crate::types::{normalize_hex, Log};

/// A log tagged with its event and the decoder's output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedLog {
    pub event_sig: String,
    /// Human-readable event name (e.g. `"Transfer"`).
    pub name: String,
    pub log: Log,
    pub fields: serde_json::Value,
}

/// Decodes the logs of one event signature.
pub trait LogDecoder: Send + Sync {
    fn event_sig(&self) -> &str;

    fn name(&self) -> &str;

    fn decode(&self, log: &Log) -> Result<serde_json::Value, PollerError>;
}

/// A [`LogDecoder`] backed by a plain function.
pub struct FnDecoder<F> {
    event_sig: String,
    name: String,
    f: F,
}

impl<F> FnDecoder<F>
where
    F: Fn(&Log) -> Result<serde_json::Value, PollerError> + Send + Sync,
{
    pub fn new(event_sig: &str, name: impl Into<String>, f: F) -> Self {
        Self {
            event_sig: normalize_hex(event_sig),
            name: name.into(),
            f,
        }
    }
}

impl<F> LogDecoder for FnDecoder<F>
where
    F: Fn(&Log) -> Result<serde_json::Value, PollerError> + Send + Sync,
{
    fn event_sig(&self) -> &str {
        &self.event_sig
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn decode(&self, log: &Log) -> Result<serde_json::Value, PollerError> {
        (self.f)(log)
    }
}

/// Event signature → decoder.
#[derive(Default, Clone)]
pub struct DecoderRegistry {
    decoders: HashMap<String, Arc<dyn LogDecoder>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder, replacing any previous one for its signature.
    pub fn register(&mut self, decoder: Arc<dyn LogDecoder>) {
        self.decoders.insert(normalize_hex(decoder.event_sig()), decoder);
    }

    pub fn contains(&self, event_sig: &str) -> bool {
        self.decoders.contains_key(&normalize_hex(event_sig))
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decode one log; `NotFound` if no decoder handles its signature.
    pub fn decode(&self, log: &Log) -> Result<DecodedLog, PollerError> {
        let decoder = self
            .decoders
            .get(&log.event_sig)
            .ok_or_else(|| PollerError::NotFound(format!("decoder for event {}", log.event_sig)))?;
        Ok(DecodedLog {
            event_sig: log.event_sig.clone(),
            name: decoder.name().to_string(),
            log: log.clone(),
            fields: decoder.decode(log)?,
        })
    }

    /// Decode every log with a registered decoder, preserving order.
    /// Logs without a decoder are skipped; decode failures are returned.
    pub fn decode_all(&self, logs: &[Log]) -> Result<Vec<DecodedLog>, PollerError> {
        logs.iter()
            .filter(|l| self.decoders.contains_key(&l.event_sig))
            .map(|l| self.decode(l))
            .collect()
    }
}
