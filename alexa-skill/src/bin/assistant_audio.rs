//! Assistant Audio Lambda - Plays the assistant's own voice back through the skill.
//!
//! This Lambda:
//! 1. Runs the query as a dialog turn, requesting MP3 audio
//! 2. Transcodes the returned audio and uploads it to S3
//! 3. Answers with SSML that plays the uploaded file, keeping the session open

use std::sync::Arc;

use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use shared::{
    Config, CredentialProvider, ReplyStyle, S3AudioPublisher, SkillEvent, SkillHandler,
    SkillResponse,
};
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
    let publisher = S3AudioPublisher::from_sdk_config(&sdk_config, &config);

    info!(
        bucket = %config.s3_bucket,
        region = %config.s3_region,
        "Starting assistant audio skill"
    );
    let state = Arc::new(SkillHandler::new(
        config,
        provider,
        ReplyStyle::HostedAudio(Arc::new(publisher)),
    ));

    run(service_fn(move |event| {
        let state = Arc::clone(&state);
        async move { handler(state, event).await }
    }))
    .await
}
