use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::types::{RunId, StepId};

/// Closed set of framework-originated event types, plus user events.
///
/// Every lifecycle event the runners emit carries one of the framework
/// variants; anything a node body emits through `log_event` becomes a
/// [`EventType::User`] value. The string forms are stable wire tags, so
/// sinks can dispatch on `as_str()` without knowing this enum.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    DagStart,
    DagFinish,
    DagError,
    DagNodeStart,
    DagNodeFinish,
    DagNodeError,
    DagNodeState,
    MachineStart,
    MachineFinish,
    MachineError,
    MachineStatus,
    MachineTransition,
    MachineNodeStart,
    MachineNodeFinish,
    MachineNodeError,
    StepStart,
    StepEnd,
    StepError,
    /// Any event type emitted by user code from within a node body.
    User(String),
}

impl EventType {
    /// The stable wire tag for this event type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            EventType::DagStart => "dag:start",
            EventType::DagFinish => "dag:finish",
            EventType::DagError => "dag:error",
            EventType::DagNodeStart => "dag:node_start",
            EventType::DagNodeFinish => "dag:node_finish",
            EventType::DagNodeError => "dag:node_error",
            EventType::DagNodeState => "dag:node_state",
            EventType::MachineStart => "state_machine:start",
            EventType::MachineFinish => "state_machine:finish",
            EventType::MachineError => "state_machine:error",
            EventType::MachineStatus => "state_machine:status",
            EventType::MachineTransition => "state_machine:transition",
            EventType::MachineNodeStart => "state_machine:node_start",
            EventType::MachineNodeFinish => "state_machine:node_finish",
            EventType::MachineNodeError => "state_machine:node_error",
            EventType::StepStart => "step:start",
            EventType::StepEnd => "step:end",
            EventType::StepError => "step:error",
            EventType::User(tag) => tag,
        }
    }

    /// Parse a wire tag back into an `EventType`.
    ///
    /// Unknown tags become [`EventType::User`]; this is the classification
    /// predicate for framework-emitted vs user-emitted events.
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "dag:start" => EventType::DagStart,
            "dag:finish" => EventType::DagFinish,
            "dag:error" => EventType::DagError,
            "dag:node_start" => EventType::DagNodeStart,
            "dag:node_finish" => EventType::DagNodeFinish,
            "dag:node_error" => EventType::DagNodeError,
            "dag:node_state" => EventType::DagNodeState,
            "state_machine:start" => EventType::MachineStart,
            "state_machine:finish" => EventType::MachineFinish,
            "state_machine:error" => EventType::MachineError,
            "state_machine:status" => EventType::MachineStatus,
            "state_machine:transition" => EventType::MachineTransition,
            "state_machine:node_start" => EventType::MachineNodeStart,
            "state_machine:node_finish" => EventType::MachineNodeFinish,
            "state_machine:node_error" => EventType::MachineNodeError,
            "step:start" => EventType::StepStart,
            "step:end" => EventType::StepEnd,
            "step:error" => EventType::StepError,
            other => EventType::User(other.to_string()),
        }
    }

    /// `true` for every type the framework itself emits.
    #[must_use]
    pub fn is_framework(&self) -> bool {
        !matches!(self, EventType::User(_))
    }

    /// `true` for the `*_start`-shaped members of each lifecycle triple.
    #[must_use]
    pub fn is_start(&self) -> bool {
        matches!(
            self,
            EventType::DagStart
                | EventType::DagNodeStart
                | EventType::MachineStart
                | EventType::MachineNodeStart
                | EventType::StepStart
        )
    }

    /// `true` for the terminal members (`*_finish` / `*_end` / `*:error`)
    /// of each lifecycle triple.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::DagFinish
                | EventType::DagError
                | EventType::DagNodeFinish
                | EventType::DagNodeError
                | EventType::MachineFinish
                | EventType::MachineError
                | EventType::MachineNodeFinish
                | EventType::MachineNodeError
                | EventType::StepEnd
                | EventType::StepError
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(EventType::from_tag(&tag))
    }
}

/// Payload of every `*_start` event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StepStartData {
    /// Step id of the enclosing step, if any.
    pub parent_step: Option<StepId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    /// The step's input: the call arguments for plain steps, the parent
    /// output bag for DAG nodes, the carried value for machine states.
    pub input: Value,
}

/// Payload of every `*_finish` / `step:end` event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StepEndData {
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

/// Payload of `state_machine:transition`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TransitionData {
    pub from: String,
    pub to: String,
    pub input: Value,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// Variant payload carried in [`StepEvent::data`], one shape per event
/// family.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EventData {
    Start(StepStartData),
    End(StepEndData),
    Error { error: String },
    NodeState { state: String },
    Status { status: String },
    Transition(TransitionData),
    User(Value),
}

/// The on-the-wire unit of observability.
///
/// Every lifecycle boundary in a run produces one `StepEvent`. The
/// invariant sinks can rely on: each `*_start` event with step `S` is
/// followed by exactly one terminal event (`*_end` / `*_finish` /
/// `*:error`) carrying the same `run_id` and `step`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StepEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub run_id: RunId,
    pub step: StepId,
    /// Human name of the enclosing workflow (DAG or machine name).
    pub source: String,
    /// Node name within the workflow; empty for workflow-level events.
    #[serde(rename = "sourceNode")]
    pub source_node: String,
    pub start_time: DateTime<Utc>,
    /// Set only on terminal events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub data: EventData,
    /// Per-run metadata bag forwarded verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl fmt::Display for StepEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.source_node.is_empty() {
            write!(f, "[{}] {}", self.source, self.event_type)
        } else {
            write!(f, "[{}/{}] {}", self.source, self.source_node, self.event_type)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_round_trip() {
        for tag in [
            "dag:start",
            "dag:finish",
            "dag:error",
            "dag:node_start",
            "dag:node_finish",
            "dag:node_error",
            "dag:node_state",
            "state_machine:start",
            "state_machine:status",
            "state_machine:transition",
            "state_machine:node_start",
            "state_machine:node_finish",
            "step:start",
            "step:end",
            "step:error",
        ] {
            let ty = EventType::from_tag(tag);
            assert!(ty.is_framework(), "{tag} should be framework-originated");
            assert_eq!(ty.as_str(), tag);
        }
        let user = EventType::from_tag("progress:halfway");
        assert!(!user.is_framework());
        assert_eq!(user.as_str(), "progress:halfway");
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = StepEvent {
            event_type: EventType::DagNodeStart,
            run_id: RunId::new(),
            step: StepId::new(),
            source: "pipeline".into(),
            source_node: "fetch".into(),
            start_time: Utc::now(),
            end_time: None,
            data: EventData::Start(StepStartData {
                parent_step: Some(StepId::new()),
                span_id: None,
                tags: None,
                info: None,
                input: json!({"root": 1}),
            }),
            meta: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "dag:node_start");
        assert_eq!(value["sourceNode"], "fetch");
        assert_eq!(value["data"]["input"]["root"], 1);
        assert!(value.get("end_time").is_none());
    }
}
