pub mod bubble;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Every envelope id starts with this prefix, so it doubles as the delivery
/// marker prefix the stuck-input sweep searches for.
pub const ENVELOPE_ID_PREFIX: &str = "msg_";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Participant {
    Implementer,
    Reviewer,
    Human,
    Orchestrator,
}

impl Participant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Participant::Implementer => "implementer",
            Participant::Reviewer => "reviewer",
            Participant::Human => "human",
            Participant::Orchestrator => "orchestrator",
        }
    }

    /// Pane index inside the bubble's tmux window. The status pane (0) is
    /// shared by the human operator and the orchestrator.
    pub fn pane_index(&self) -> u8 {
        match self {
            Participant::Implementer => 1,
            Participant::Reviewer => 2,
            Participant::Human | Participant::Orchestrator => 0,
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, Participant::Implementer | Participant::Reviewer)
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Participant {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "implementer" => Ok(Participant::Implementer),
            "reviewer" => Ok(Participant::Reviewer),
            "human" => Ok(Participant::Human),
            "orchestrator" => Ok(Participant::Orchestrator),
            other => Err(format!("Unknown participant: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolEnvelope {
    pub id: String,
    pub ts: String,
    pub bubble_id: String,
    pub sender: String,
    pub recipient: String,
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub round: u32,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("envelope decode failed: {0}")]
    Decode(String),
    #[error("envelope is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("envelope timestamp is not RFC 3339: {0}")]
    InvalidTimestamp(String),
}

impl ProtocolEnvelope {
    pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
        let envelope: ProtocolEnvelope =
            serde_json::from_str(raw).map_err(|err| EnvelopeError::Decode(err.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn validate(&self) -> Result<(), EnvelopeError> {
        let required = [
            ("id", &self.id),
            ("ts", &self.ts),
            ("bubble_id", &self.bubble_id),
            ("sender", &self.sender),
            ("recipient", &self.recipient),
            ("type", &self.r#type),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(EnvelopeError::MissingField(name));
            }
        }
        if chrono::DateTime::parse_from_rfc3339(&self.ts).is_err() {
            return Err(EnvelopeError::InvalidTimestamp(self.ts.clone()));
        }
        Ok(())
    }

    pub fn sender_participant(&self) -> Result<Participant, String> {
        self.sender.parse()
    }

    pub fn recipient_participant(&self) -> Result<Participant, String> {
        self.recipient.parse()
    }
}

pub fn new_envelope_id() -> String {
    format!("{ENVELOPE_ID_PREFIX}{}", Uuid::new_v4().simple())
}
