//! Skill request handling: event in, dialog turn, envelope out.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::audio::AudioPersistence;
use crate::credentials::ChannelProvider;
use crate::dialog::{
    AudioOutputFormat, ConversationState, DialogTurnExecutor, RetryPolicy, TurnRequest, TurnResult,
};
use crate::envelope::{OutputSpeech, ResponseEnvelopeBuilder, SkillResponse};
use crate::event::{SkillEvent, SkillRequest};
use crate::{Config, Error, Result};

/// How a completed turn is presented back to the user.
#[derive(Clone)]
pub enum ReplyStyle {
    /// Speak the display text; the session ends.
    PlainText,
    /// Play the engine's own audio from a hosted URL; the session stays open.
    HostedAudio(Arc<dyn AudioPersistence>),
    /// Keep a local WAV copy of the audio and speak the display text.
    WaveOut(Arc<dyn AudioPersistence>),
}

impl ReplyStyle {
    fn audio_output_format(&self) -> AudioOutputFormat {
        match self {
            ReplyStyle::PlainText | ReplyStyle::WaveOut(_) => AudioOutputFormat::Linear16,
            ReplyStyle::HostedAudio(_) => AudioOutputFormat::Mp3,
        }
    }

    fn ends_session(&self) -> bool {
        !matches!(self, ReplyStyle::HostedAudio(_))
    }
}

/// Handles one skill event per invocation.
pub struct SkillHandler<P> {
    config: Config,
    channels: P,
    executor: DialogTurnExecutor,
    retry: RetryPolicy,
    style: ReplyStyle,
}

impl<P: ChannelProvider> SkillHandler<P> {
    pub fn new(config: Config, channels: P, style: ReplyStyle) -> Self {
        let executor = DialogTurnExecutor::new(config.grpc_deadline);
        let retry = RetryPolicy::new(config.max_attempts, Duration::from_millis(250));
        Self {
            config,
            channels,
            executor,
            retry,
            style,
        }
    }

    pub async fn handle(&self, event: SkillEvent) -> Result<SkillResponse> {
        match &event.request {
            SkillRequest::IntentRequest { .. } => self.on_intent(&event).await,
            SkillRequest::LaunchRequest { .. } => {
                info!(session_id = ?event.session_id(), "Launch request");
                Ok(ResponseEnvelopeBuilder::new()
                    .output_speech(OutputSpeech::plain(&self.config.reprompt_message))
                    .reprompt(&self.config.reprompt_message)
                    .should_end_session(false)
                    .build())
            }
            SkillRequest::SessionEndedRequest {
                request_id, reason, ..
            } => {
                info!(
                    request_id = ?request_id,
                    session_id = ?event.session_id(),
                    reason = ?reason,
                    "Session ended"
                );
                Ok(SkillResponse::empty())
            }
            SkillRequest::Unsupported => {
                warn!(session_id = ?event.session_id(), "Ignoring unsupported request type");
                Ok(SkillResponse::empty())
            }
        }
    }

    async fn on_intent(&self, event: &SkillEvent) -> Result<SkillResponse> {
        let query = match event.query_text() {
            Ok(query) => query.to_string(),
            Err(e) => {
                warn!(error = %e, "Intent without a usable query");
                return Ok(self.fallback(""));
            }
        };
        info!(query = %query, "Query text");

        let turn = match self.run_turn(&query, event.conversation_state()).await {
            Ok(turn) => turn,
            Err(Error::Transport(e)) => {
                error!(error = %e, "Assist turn failed");
                return Ok(self.fallback(&query));
            }
            Err(e) => return Err(e),
        };

        let reply = match &turn.display_text {
            Some(text) => text.clone(),
            None => {
                info!("Response text is None");
                self.config.error_message.clone()
            }
        };
        info!(reply = %reply, audio_bytes = turn.audio.len(), "Response text");

        self.render(&query, &reply, &turn).await
    }

    async fn run_turn(&self, query: &str, state: ConversationState) -> Result<TurnResult> {
        let channel = self.channels.refresh().await?;
        let request = TurnRequest {
            text: query.to_string(),
            language_code: self.config.language_code.clone(),
            device_model_id: self.config.device_model_id.clone(),
            device_id: self.config.device_id.clone(),
            conversation_state: state,
            audio_output_format: self.style.audio_output_format(),
        };

        let turn = self
            .retry
            .run(|| self.executor.execute_turn(&request, &channel))
            .await?;
        Ok(turn)
    }

    async fn render(&self, query: &str, reply: &str, turn: &TurnResult) -> Result<SkillResponse> {
        let builder = match &self.style {
            ReplyStyle::PlainText => ResponseEnvelopeBuilder::speechlet(
                format!("SessionSpeechlet - {} -> {}", query, reply),
                OutputSpeech::plain(reply),
                format!("SessionSpeechlet - {}", reply),
                reply,
                true,
            ),
            ReplyStyle::HostedAudio(store) => {
                let speech = if turn.audio.is_empty() {
                    warn!("Turn returned no audio, speaking display text instead");
                    OutputSpeech::plain(reply)
                } else {
                    OutputSpeech::audio(&store.persist(&turn.audio).await?)
                };
                ResponseEnvelopeBuilder::speechlet(
                    query,
                    speech,
                    reply,
                    &self.config.reprompt_message,
                    false,
                )
            }
            ReplyStyle::WaveOut(store) => {
                store.persist(&turn.audio).await?;
                ResponseEnvelopeBuilder::speechlet(
                    format!("{} -> {}", query, reply),
                    OutputSpeech::plain(reply),
                    reply,
                    reply,
                    true,
                )
            }
        };

        Ok(builder
            .conversation_state(&turn.next_conversation_state)
            .build())
    }

    /// Normal-shaped envelope speaking the configured error message.
    fn fallback(&self, query: &str) -> SkillResponse {
        let message = &self.config.error_message;
        let end = self.style.ends_session();
        let reprompt = if end {
            message
        } else {
            &self.config.reprompt_message
        };

        ResponseEnvelopeBuilder::speechlet(query, OutputSpeech::plain(message), message, reprompt, end)
            .build()
    }
}
