//! Streaming dialog turns against the conversational engine.
//!
//! A turn sends exactly one `AssistRequest` carrying the text query and folds
//! every `AssistResponse` fragment the engine streams back into a single
//! [`TurnResult`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_DEADLINE_SECS;
use crate::error::TransportError;
use crate::proto::{
    assist_config, assist_request, audio_out_config, AssistConfig, AssistRequest, AssistResponse,
    AudioOutConfig, DeviceConfig, DialogStateIn,
};

/// Stream of response fragments for one Assist call.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<AssistResponse, tonic::Status>> + Send>>;

/// Opaque continuation token issued by the engine.
///
/// Empty on the first turn of a conversation; otherwise exactly the token
/// received at the end of the previous turn.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConversationState(Vec<u8>);

impl ConversationState {
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        Self(token.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode for storage in skill session attributes.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.0)
    }

    /// Decode a token previously produced by [`ConversationState::to_base64`].
    pub fn from_base64(encoded: &str) -> Option<Self> {
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()
            .map(Self)
    }
}

impl fmt::Debug for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConversationState({} bytes)", self.0.len())
    }
}

/// Audio encoding requested from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioOutputFormat {
    /// No audio-out configuration is sent
    None,
    /// 16-bit little-endian PCM
    Linear16,
    Mp3,
}

/// Everything needed to run one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub text: String,
    pub language_code: String,
    pub device_model_id: String,
    pub device_id: String,
    pub conversation_state: ConversationState,
    pub audio_output_format: AudioOutputFormat,
}

impl TurnRequest {
    /// Build the single outbound message for this turn.
    pub fn to_assist_request(&self) -> AssistRequest {
        let audio_out_config = match self.audio_output_format {
            AudioOutputFormat::None => None,
            AudioOutputFormat::Linear16 => Some(audio_out(audio_out_config::Encoding::Linear16)),
            AudioOutputFormat::Mp3 => Some(audio_out(audio_out_config::Encoding::Mp3)),
        };

        AssistRequest {
            r#type: Some(assist_request::Type::Config(AssistConfig {
                r#type: Some(assist_config::Type::TextQuery(self.text.clone())),
                audio_out_config,
                dialog_state_in: Some(DialogStateIn {
                    conversation_state: self.conversation_state.as_bytes().to_vec(),
                    language_code: self.language_code.clone(),
                    is_new_conversation: false,
                }),
                device_config: Some(DeviceConfig {
                    device_id: self.device_id.clone(),
                    device_model_id: self.device_model_id.clone(),
                }),
            })),
        }
    }
}

fn audio_out(encoding: audio_out_config::Encoding) -> AudioOutConfig {
    AudioOutConfig {
        encoding: encoding as i32,
        sample_rate_hertz: 16000,
        volume_percentage: 100,
    }
}

/// Aggregated outcome of one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnResult {
    /// Last non-empty display text seen, if any
    pub display_text: Option<String>,
    /// All audio fragments, concatenated in arrival order
    pub audio: Vec<u8>,
    /// Token to thread into the next turn
    pub next_conversation_state: ConversationState,
}

/// Folds response fragments into a [`TurnResult`].
///
/// Display text and continuation token are last-non-empty-wins; audio is
/// appended in arrival order.
#[derive(Debug)]
pub struct TurnAccumulator {
    display_text: Option<String>,
    audio: Vec<u8>,
    conversation_state: ConversationState,
    fragments: usize,
}

impl TurnAccumulator {
    pub fn new(initial_state: ConversationState) -> Self {
        Self {
            display_text: None,
            audio: Vec::new(),
            conversation_state: initial_state,
            fragments: 0,
        }
    }

    pub fn absorb(&mut self, fragment: AssistResponse) {
        self.fragments += 1;

        if let Some(dialog) = fragment.dialog_state_out {
            if !dialog.conversation_state.is_empty() {
                self.conversation_state = ConversationState(dialog.conversation_state);
            }
            if !dialog.supplemental_display_text.is_empty() {
                self.display_text = Some(dialog.supplemental_display_text);
            }
        }

        if let Some(audio_out) = fragment.audio_out {
            self.audio.extend_from_slice(&audio_out.audio_data);
        }
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    pub fn finish(self) -> TurnResult {
        TurnResult {
            display_text: self.display_text,
            audio: self.audio,
            next_conversation_state: self.conversation_state,
        }
    }
}

/// A channel that can carry one Assist call.
#[async_trait]
pub trait AssistTransport: Send + Sync {
    /// Open the call with `request` as the only client message.
    async fn assist(
        &self,
        request: AssistRequest,
        deadline: Duration,
    ) -> Result<FragmentStream, tonic::Status>;
}

/// Drives single request/response exchanges with the engine.
#[derive(Debug, Clone)]
pub struct DialogTurnExecutor {
    deadline: Duration,
}

impl Default for DialogTurnExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_DEADLINE_SECS))
    }
}

impl DialogTurnExecutor {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Execute one turn and return the aggregated result.
    ///
    /// The deadline covers opening the call and draining the stream. On any
    /// exit path the response stream is dropped before this returns.
    pub async fn execute_turn<T>(
        &self,
        request: &TurnRequest,
        channel: &T,
    ) -> Result<TurnResult, TransportError>
    where
        T: AssistTransport + ?Sized,
    {
        let outbound = request.to_assist_request();
        debug!(
            text = %request.text,
            language = %request.language_code,
            conversation_state_len = request.conversation_state.as_bytes().len(),
            "Sending assist request"
        );

        let exchange = async {
            let mut stream = channel
                .assist(outbound, self.deadline)
                .await
                .map_err(|status| TransportError::from_status(&status, self.deadline))?;

            let mut accumulator = TurnAccumulator::new(request.conversation_state.clone());
            while let Some(item) = stream.next().await {
                let fragment =
                    item.map_err(|status| TransportError::from_status(&status, self.deadline))?;
                log_fragment(&fragment);
                accumulator.absorb(fragment);
            }

            Ok::<_, TransportError>(accumulator)
        };

        match tokio::time::timeout(self.deadline, exchange).await {
            Ok(Ok(accumulator)) => {
                info!(fragments = accumulator.fragments(), "Assist stream completed");
                Ok(accumulator.finish())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Assist call failed");
                Err(e)
            }
            Err(_) => {
                warn!(deadline = ?self.deadline, "Assist call timed out");
                Err(TransportError::Timeout(self.deadline))
            }
        }
    }
}

fn log_fragment(fragment: &AssistResponse) {
    let audio_len = fragment
        .audio_out
        .as_ref()
        .map(|a| a.audio_data.len())
        .unwrap_or(0);
    let display_text = fragment
        .dialog_state_out
        .as_ref()
        .map(|d| d.supplemental_display_text.as_str())
        .unwrap_or("");

    debug!(
        event_type = fragment.event_type,
        audio_len,
        display_text,
        "Received assist response"
    );
}

/// Caller-side retry policy for whole turns.
///
/// Only [`TransportError::Unavailable`] is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// A single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub async fn run<F, Fut, T>(&self, mut attempt: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt().await {
                Err(e) if e.is_retriable() && tries < self.max_attempts => {
                    warn!(attempt = tries, error = %e, "Retrying assist turn");
                    tokio::time::sleep(self.backoff * tries).await;
                }
                other => return other,
            }
        }
    }
}
