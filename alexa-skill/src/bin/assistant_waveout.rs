//! Assistant Waveout Lambda - Speaks the display text and keeps a WAV copy of the audio.

use std::sync::Arc;

use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use shared::{
    Config, CredentialProvider, ReplyStyle, SkillEvent, SkillHandler, SkillResponse,
    WavFileWriter,
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
    let writer = WavFileWriter::new(&config.wave_output_path);

    info!(path = %config.wave_output_path.display(), "Starting assistant waveout skill");
    let state = Arc::new(SkillHandler::new(
        config,
        provider,
        ReplyStyle::WaveOut(Arc::new(writer)),
    ));

    run(service_fn(move |event| {
        let state = Arc::clone(&state);
        async move { handler(state, event).await }
    }))
    .await
}
