//! Assistant Text Lambda - Answers skill intents with the assistant's display text.
//!
//! The reply is spoken as plain text and the session ends after each turn.

use std::sync::Arc;

use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use shared::{Config, CredentialProvider, ReplyStyle, SkillEvent, SkillHandler, SkillResponse};
use tracing::info;
use tracing_subscriber::EnvFilter;

async fn handler(
    state: Arc<SkillHandler<CredentialProvider>>,
    event: LambdaEvent<SkillEvent>,
) -> Result<SkillResponse, Error> {
    Ok(state.handle(event.payload).await?)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let config = Config::from_env()?;
    let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let provider = CredentialProvider::from_sdk_config(&sdk_config, &config);

    info!(language = %config.language_code, "Starting assistant text skill");
    let state = Arc::new(SkillHandler::new(config, provider, ReplyStyle::PlainText));

    run(service_fn(move |event| {
        let state = Arc::clone(&state);
        async move { handler(state, event).await }
    }))
    .await
}
