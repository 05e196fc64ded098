//! Shared library for the assistant bridge Lambda functions.
//!
//! This crate provides the dialog turn executor, credentials, skill event and
//! envelope types, and audio persistence used by every skill variant.

pub mod audio;
pub mod config;
pub mod credentials;
pub mod dialog;
pub mod envelope;
pub mod error;
pub mod event;
pub mod proto;
pub mod secrets;
pub mod skill;

pub use audio::{AudioPersistence, S3AudioPublisher, Transcoder, WavFileWriter};
pub use config::Config;
pub use credentials::{AuthenticatedChannel, ChannelProvider, CredentialProvider, OAuthCredentials};
pub use dialog::{
    AssistTransport, AudioOutputFormat, ConversationState, DialogTurnExecutor, RetryPolicy,
    TurnRequest, TurnResult,
};
pub use envelope::{OutputSpeech, ResponseEnvelopeBuilder, SkillResponse};
pub use error::{Error, PersistenceError, Result, TransportError};
pub use event::SkillEvent;
pub use skill::{ReplyStyle, SkillHandler};
