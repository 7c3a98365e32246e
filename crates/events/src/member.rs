use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use docreduce_core::{CorrelationId, DomainError, DomainResult, MemberEventId, MemberRef};

/// Inbound member event, as delivered (at least once) by upstream stages.
///
/// This is the unit the arrival handler registers into a group.
///
/// Notes:
/// - `correlation_id` is the stable id of one pipeline execution; the engine
///   never generates it.
/// - `event_id` is the de-duplication key; redeliveries carry the same value.
/// - Only a pointer to the document travels here, never the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberEvent {
    event_id: MemberEventId,
    correlation_id: CorrelationId,
    document_pointer: String,

    #[serde(default)]
    source_metadata: JsonValue,

    /// Stage names the event went through, most recent first.
    #[serde(default)]
    call_stack: Vec<String>,

    #[serde(default)]
    occurred_at: Option<DateTime<Utc>>,
}

impl MemberEvent {
    pub fn new(
        event_id: MemberEventId,
        correlation_id: CorrelationId,
        document_pointer: impl Into<String>,
        source_metadata: JsonValue,
    ) -> Self {
        Self {
            event_id,
            correlation_id,
            document_pointer: document_pointer.into(),
            source_metadata,
            call_stack: Vec::new(),
            occurred_at: None,
        }
    }

    pub fn with_call_stack(mut self, call_stack: Vec<String>) -> Self {
        self.call_stack = call_stack;
        self
    }

    pub fn with_occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }

    /// Parse and validate a raw message body.
    pub fn from_json(body: &str) -> DomainResult<Self> {
        let event: Self = serde_json::from_str(body)
            .map_err(|e| DomainError::validation(format!("malformed member event: {e}")))?;
        event.validate()?;
        Ok(event)
    }

    /// Identifiers are validated on construction; the pointer is checked here.
    pub fn validate(&self) -> DomainResult<()> {
        if self.document_pointer.trim().is_empty() {
            return Err(DomainError::validation(format!(
                "member event '{}' has an empty document pointer",
                self.event_id
            )));
        }
        Ok(())
    }

    pub fn event_id(&self) -> &MemberEventId {
        &self.event_id
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn document_pointer(&self) -> &str {
        &self.document_pointer
    }

    pub fn source_metadata(&self) -> &JsonValue {
        &self.source_metadata
    }

    pub fn call_stack(&self) -> &[String] {
        &self.call_stack
    }

    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.occurred_at
    }

    /// Reduce the event to the reference stored in a group.
    ///
    /// A non-empty call stack is kept under `call_stack` in the metadata when
    /// the metadata is an object (or absent).
    pub fn to_member_ref(&self, arrived_at: DateTime<Utc>) -> MemberRef {
        let metadata = match (&self.source_metadata, self.call_stack.is_empty()) {
            (_, true) => self.source_metadata.clone(),
            (JsonValue::Object(map), false) => {
                let mut map = map.clone();
                map.insert("call_stack".to_string(), JsonValue::from(self.call_stack.clone()));
                JsonValue::Object(map)
            }
            (JsonValue::Null, false) => {
                let mut map = Map::new();
                map.insert("call_stack".to_string(), JsonValue::from(self.call_stack.clone()));
                JsonValue::Object(map)
            }
            (other, false) => other.clone(),
        };

        MemberRef::new(
            self.event_id.clone(),
            arrived_at,
            metadata,
            self.document_pointer.clone(),
        )
    }
}
