//! Inbound skill events delivered by the voice platform.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::dialog::ConversationState;
use crate::{Error, Result};

/// Slot carrying the free-form query text.
pub const QUERY_SLOT: &str = "q";

/// Session attribute holding the base64 continuation token.
pub const CONVERSATION_STATE_ATTRIBUTE: &str = "conversationState";

/// Top-level skill event.
#[derive(Debug, Deserialize)]
pub struct SkillEvent {
    pub request: SkillRequest,
    #[serde(default)]
    pub session: Option<Session>,
}

/// The request, discriminated by its `type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum SkillRequest {
    #[serde(rename_all = "camelCase")]
    IntentRequest {
        #[serde(default)]
        request_id: Option<String>,
        intent: Intent,
    },
    #[serde(rename_all = "camelCase")]
    LaunchRequest {
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SessionEndedRequest {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
pub struct Intent {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub slots: HashMap<String, Slot>,
}

#[derive(Debug, Deserialize)]
pub struct Slot {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub attributes: Option<Map<String, Value>>,
}

impl SkillEvent {
    /// The query text from the `q` slot of an intent request.
    pub fn query_text(&self) -> Result<&str> {
        let SkillRequest::IntentRequest { intent, .. } = &self.request else {
            return Err(Error::Validation("Not an intent request".to_string()));
        };

        intent
            .slots
            .get(QUERY_SLOT)
            .and_then(|slot| slot.value.as_deref())
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| Error::Validation(format!("Missing value for slot '{}'", QUERY_SLOT)))
    }

    /// Continuation token carried over from the previous turn, if any.
    pub fn conversation_state(&self) -> ConversationState {
        self.session
            .as_ref()
            .and_then(|s| s.attributes.as_ref())
            .and_then(|attrs| attrs.get(CONVERSATION_STATE_ATTRIBUTE))
            .and_then(Value::as_str)
            .and_then(ConversationState::from_base64)
            .unwrap_or_default()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.session_id.as_deref())
    }
}
