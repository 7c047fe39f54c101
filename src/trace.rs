//! Trace context propagation through message properties.
//!
//! The collector and the pushers never talk to each other directly, so the
//! publish span's identity travels with the message, out of band from the
//! event body:
//!
//! ```text
//! traceparent = 00-<32 hex trace id>-<16 hex span id>-<2 hex flags>
//! tracestate  = <vendor list>            (only when non-empty)
//! ```
//!
//! Older producers wrote a bare `trace_id` (32 hex, no span id). Decoding
//! accepts that form only after `traceparent` fails, synthesizing a span id
//! locally. A message with neither yields `None` and the consumer starts a
//! new root span.

use crate::broker::{MessageProperties, PropertyValue};
use std::fmt;
use tracing::debug;

pub const TRACEPARENT: &str = "traceparent";
pub const TRACESTATE: &str = "tracestate";
pub const LEGACY_TRACE_ID: &str = "trace_id";
pub const LEGACY_PARENT_SPAN_ID: &str = "parent_span_id";

const VERSION: &str = "00";

/// 128-bit trace identifier. Never all zeroes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 16]);

impl TraceId {
    pub fn from_bytes(bytes: [u8; 16]) -> Option<Self> {
        (bytes != [0; 16]).then_some(Self(bytes))
    }

    pub fn random() -> Self {
        loop {
            if let Some(id) = Self::from_bytes(rand::random()) {
                return id;
            }
        }
    }

    /// Parse exactly 32 hex characters.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Self::from_bytes(bytes)
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self)
    }
}

/// 64-bit span identifier. Never all zeroes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId([u8; 8]);

impl SpanId {
    pub fn from_bytes(bytes: [u8; 8]) -> Option<Self> {
        (bytes != [0; 8]).then_some(Self(bytes))
    }

    pub fn random() -> Self {
        loop {
            if let Some(id) = Self::from_bytes(rand::random()) {
                return id;
            }
        }
    }

    /// Parse exactly 16 hex characters.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 {
            return None;
        }
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Self::from_bytes(bytes)
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self)
    }
}

/// Trace flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceFlags(pub u8);

impl TraceFlags {
    pub const SAMPLED: TraceFlags = TraceFlags(0x01);

    pub fn is_sampled(&self) -> bool {
        self.0 & 0x01 == 0x01
    }
}

/// Identity of a span as seen by other processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub flags: TraceFlags,
    pub trace_state: Option<String>,
}

impl TraceContext {
    pub fn new(trace_id: TraceId, span_id: SpanId, flags: TraceFlags) -> Self {
        Self {
            trace_id,
            span_id,
            flags,
            trace_state: None,
        }
    }

    pub fn with_trace_state(mut self, state: impl Into<String>) -> Self {
        let state = state.into();
        self.trace_state = (!state.is_empty()).then_some(state);
        self
    }

    /// A fresh sampled trace.
    pub fn new_root() -> Self {
        Self::new(TraceId::random(), SpanId::random(), TraceFlags::SAMPLED)
    }

    /// A new span in the same trace, inheriting flags and trace state.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: SpanId::random(),
            flags: self.flags,
            trace_state: self.trace_state.clone(),
        }
    }

    /// Canonical `traceparent` text.
    pub fn traceparent(&self) -> String {
        format!(
            "{}-{}-{}-{:02x}",
            VERSION, self.trace_id, self.span_id, self.flags.0
        )
    }

    /// Parse a canonical `traceparent` value. Anything malformed is `None`.
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.trim().split('-').collect();
        let [version, trace_id, span_id, flags] = parts.as_slice() else {
            return None;
        };
        if *version != VERSION || flags.len() != 2 {
            return None;
        }
        let flags = u8::from_str_radix(flags, 16).ok()?;
        Some(Self::new(
            TraceId::from_hex(trace_id)?,
            SpanId::from_hex(span_id)?,
            TraceFlags(flags),
        ))
    }
}

/// Metadata fields carrying a trace context.
///
/// `tracestate` is present only when the context has a non-empty state.
pub fn encode(context: &TraceContext) -> Vec<(&'static str, String)> {
    let mut fields = vec![(TRACEPARENT, context.traceparent())];
    if let Some(state) = context.trace_state.as_deref().filter(|s| !s.is_empty()) {
        fields.push((TRACESTATE, state.to_string()));
    }
    fields
}

/// Write the encoded trace context into message properties.
pub fn inject(context: &TraceContext, properties: &mut MessageProperties) {
    for (key, value) in encode(context) {
        properties.insert(key.to_string(), PropertyValue::Text(value));
    }
}

/// Recover a trace context from message properties.
///
/// Tries `traceparent` (+ `tracestate`) first and the legacy `trace_id`
/// second. Returns `None` when neither is usable; never fails.
pub fn decode(properties: &MessageProperties) -> Option<TraceContext> {
    let text = |key: &str| properties.get(key).and_then(PropertyValue::as_text);

    if let Some(traceparent) = text(TRACEPARENT) {
        match TraceContext::from_traceparent(traceparent) {
            Some(context) => {
                let state = text(TRACESTATE).unwrap_or_default();
                return Some(context.with_trace_state(state));
            }
            None => debug!(traceparent = %traceparent, "Malformed traceparent, trying legacy fields"),
        }
    }

    let trace_id = TraceId::from_hex(text(LEGACY_TRACE_ID)?)?;
    let span_id = text(LEGACY_PARENT_SPAN_ID)
        .and_then(SpanId::from_hex)
        .unwrap_or_else(SpanId::random);
    debug!(trace_id = %trace_id, "Using legacy trace_id");
    Some(TraceContext::new(trace_id, span_id, TraceFlags::SAMPLED))
}

/// The ids of one local span and the remote span it continues, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanLineage {
    pub context: TraceContext,
    pub parent_span_id: Option<SpanId>,
}

impl SpanLineage {
    /// Child of `parent` when present, otherwise a new root.
    pub fn continue_from(parent: Option<&TraceContext>) -> Self {
        match parent {
            Some(parent) => Self {
                context: parent.child(),
                parent_span_id: Some(parent.span_id),
            },
            None => Self {
                context: TraceContext::new_root(),
                parent_span_id: None,
            },
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    /// Parent span id as text, empty for roots (for span fields).
    pub fn parent_display(&self) -> String {
        self.parent_span_id.map(|id| id.to_string()).unwrap_or_default()
    }
}
