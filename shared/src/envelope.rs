//! Skill response envelopes returned to the voice platform.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::dialog::ConversationState;
use crate::event::CONVERSATION_STATE_ATTRIBUTE;

/// Top-level skill response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillResponse {
    pub version: String,
    pub session_attributes: Map<String, Value>,
    pub response: ResponseBody,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_speech: Option<OutputSpeech>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card: Option<Card>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reprompt: Option<Reprompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub should_end_session: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutputSpeech {
    PlainText { text: String },
    #[serde(rename = "SSML")]
    Ssml { ssml: String },
}

impl OutputSpeech {
    pub fn plain(text: impl Into<String>) -> Self {
        OutputSpeech::PlainText { text: text.into() }
    }

    /// SSML that plays hosted audio.
    pub fn audio(url: &str) -> Self {
        OutputSpeech::Ssml {
            ssml: format!("<speak><audio src='{}' /></speak>", url),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Card {
    Simple { title: String, content: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reprompt {
    pub output_speech: OutputSpeech,
}

/// Builds [`SkillResponse`] values.
#[derive(Debug, Default)]
pub struct ResponseEnvelopeBuilder {
    session_attributes: Map<String, Value>,
    body: ResponseBody,
}

impl ResponseEnvelopeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard speechlet: speech, simple card, plain-text reprompt.
    pub fn speechlet(
        title: impl Into<String>,
        speech: OutputSpeech,
        card_content: impl Into<String>,
        reprompt_text: impl Into<String>,
        should_end_session: bool,
    ) -> Self {
        Self::new()
            .output_speech(speech)
            .card(title, card_content)
            .reprompt(reprompt_text)
            .should_end_session(should_end_session)
    }

    pub fn output_speech(mut self, speech: OutputSpeech) -> Self {
        self.body.output_speech = Some(speech);
        self
    }

    pub fn card(mut self, title: impl Into<String>, content: impl Into<String>) -> Self {
        self.body.card = Some(Card::Simple {
            title: title.into(),
            content: content.into(),
        });
        self
    }

    pub fn reprompt(mut self, text: impl Into<String>) -> Self {
        self.body.reprompt = Some(Reprompt {
            output_speech: OutputSpeech::plain(text),
        });
        self
    }

    pub fn should_end_session(mut self, end: bool) -> Self {
        self.body.should_end_session = Some(end);
        self
    }

    /// Carry the continuation token into the next invocation.
    pub fn conversation_state(mut self, state: &ConversationState) -> Self {
        if !state.is_empty() {
            self.session_attributes.insert(
                CONVERSATION_STATE_ATTRIBUTE.to_string(),
                Value::String(state.to_base64()),
            );
        }
        self
    }

    pub fn build(self) -> SkillResponse {
        SkillResponse {
            version: "1.0".to_string(),
            session_attributes: self.session_attributes,
            response: self.body,
        }
    }
}

impl SkillResponse {
    /// Envelope with no speech, used to acknowledge session end.
    pub fn empty() -> Self {
        ResponseEnvelopeBuilder::new().build()
    }
}
