//! Configuration management for Lambda functions.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Default gRPC deadline for one Assist call (three minutes plus slack).
pub const DEFAULT_DEADLINE_SECS: u64 = 60 * 3 + 5;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Inline credentials JSON, or a path to a credentials file
    pub credentials: String,
    /// ARN of a Secrets Manager secret holding the credentials JSON
    pub credentials_secret_arn: Option<String>,
    /// Host of the conversational engine
    pub api_endpoint: String,
    /// Conversation language, e.g. en-US or ja-JP
    pub language_code: String,
    pub device_model_id: String,
    pub device_id: String,
    /// Spoken when the engine has nothing to say or the turn fails
    pub error_message: String,
    /// Reprompt used while the session stays open
    pub reprompt_message: String,
    /// Deadline applied to each Assist call
    pub grpc_deadline: Duration,
    /// Attempts per turn; 1 disables retries
    pub max_attempts: u32,
    /// Region used to build public object URLs
    pub s3_region: String,
    pub s3_bucket: String,
    /// Transcoder binary
    pub ffmpeg_path: PathBuf,
    /// Directory for intermediate audio files
    pub scratch_dir: PathBuf,
    /// Destination of the local WAV output
    pub wave_output_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let deadline_secs: u64 = parse_var(&lookup, "GA_GRPC_DEADLINE_SECS", DEFAULT_DEADLINE_SECS)?;
        let max_attempts: u32 = parse_var(&lookup, "GA_MAX_ATTEMPTS", 1)?;
        if max_attempts == 0 {
            return Err(Error::Config("GA_MAX_ATTEMPTS must be at least 1".to_string()));
        }

        Ok(Self {
            credentials: get("GA_CREDENTIALS", "credentials.json"),
            credentials_secret_arn: lookup("GA_CREDENTIALS_SECRET_ARN").filter(|s| !s.is_empty()),
            api_endpoint: get("GA_API_ENDPOINT", "embeddedassistant.googleapis.com"),
            language_code: get("GA_LANG", "en-US"),
            device_model_id: get("GA_DEVICE_MODEL_ID", "XXXXX"),
            device_id: get("GA_DEVICE_ID", "XXXXX"),
            error_message: get("GA_ERROR_MSG", "No Response"),
            reprompt_message: get("GA_REPROMPT_MSG", "Continue"),
            grpc_deadline: Duration::from_secs(deadline_secs),
            max_attempts,
            s3_region: get("AWS_S3_REGION", "ap-northeast-1"),
            s3_bucket: get("AWS_S3_BUCKET", "XXXXX"),
            ffmpeg_path: PathBuf::from(get("FFMPEG_PATH", "./ffmpeg")),
            scratch_dir: PathBuf::from(get("SCRATCH_DIR", "/tmp")),
            wave_output_path: PathBuf::from(get("WAVE_OUTPUT_PATH", "output.wav")),
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{} is invalid ({}): {}", key, raw, e))),
        None => Ok(default),
    }
}
