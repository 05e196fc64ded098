//! OAuth credentials and authenticated gRPC channels for the engine.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_secretsmanager::Client as SecretsClient;
use serde::Deserialize;
use tonic::codegen::http::uri::{Authority, PathAndQuery};
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info};

use crate::dialog::{AssistTransport, FragmentStream};
use crate::error::TransportError;
use crate::proto::{AssistRequest, AssistResponse, ASSIST_PATH};
use crate::{secrets, Config, Error, Result};

/// Stored OAuth client credentials with a long-lived refresh token.
#[derive(Clone, Deserialize)]
pub struct OAuthCredentials {
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthCredentials {
    /// Parse the credentials JSON blob.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse assistant credentials: {}", e)))
    }
}

/// Token endpoint response for the refresh grant.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Where the credentials JSON comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    SecretsManager(String),
    Inline(String),
    File(PathBuf),
}

impl CredentialSource {
    pub fn from_config(config: &Config) -> Self {
        if let Some(arn) = &config.credentials_secret_arn {
            return Self::SecretsManager(arn.clone());
        }
        if config.credentials.trim_start().starts_with('{') {
            Self::Inline(config.credentials.clone())
        } else {
            Self::File(PathBuf::from(&config.credentials))
        }
    }
}

/// Hands out authenticated channels to the engine.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    type Channel: AssistTransport;

    /// Refresh the access token and open a channel that carries it.
    async fn refresh(&self) -> Result<Self::Channel>;
}

/// Refreshes OAuth credentials and opens TLS channels to the engine.
pub struct CredentialProvider {
    source: CredentialSource,
    endpoint: String,
    http_client: reqwest::Client,
    secrets_client: Option<SecretsClient>,
}

impl CredentialProvider {
    pub fn new(config: &Config, secrets_client: Option<SecretsClient>) -> Self {
        Self {
            source: CredentialSource::from_config(config),
            endpoint: config.api_endpoint.clone(),
            http_client: reqwest::Client::new(),
            secrets_client,
        }
    }

    /// Provider whose Secrets Manager client, when needed, shares `sdk_config`.
    pub fn from_sdk_config(sdk_config: &aws_config::SdkConfig, config: &Config) -> Self {
        let secrets_client = config
            .credentials_secret_arn
            .as_ref()
            .map(|_| SecretsClient::new(sdk_config));
        Self::new(config, secrets_client)
    }

    /// Load the stored credentials from their configured source.
    pub async fn load_credentials(&self) -> Result<OAuthCredentials> {
        match &self.source {
            CredentialSource::SecretsManager(arn) => {
                let client = self.secrets_client.as_ref().ok_or_else(|| {
                    Error::Config("Secrets Manager client not configured".to_string())
                })?;
                secrets::get_assistant_credentials(client, arn).await
            }
            CredentialSource::Inline(json) => OAuthCredentials::from_json(json),
            CredentialSource::File(path) => {
                let json = tokio::fs::read_to_string(path).await.map_err(|e| {
                    Error::Config(format!(
                        "Failed to read credentials file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                OAuthCredentials::from_json(&json)
            }
        }
    }

    /// Exchange the refresh token for a fresh access token.
    pub async fn fetch_access_token(&self, credentials: &OAuthCredentials) -> Result<String> {
        let scope = credentials.scopes.join(" ");
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("refresh_token", credentials.refresh_token.as_str()),
        ];
        if !scope.is_empty() {
            params.push(("scope", scope.as_str()));
        }

        let response = self
            .http_client
            .post(&credentials.token_uri)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                TransportError::Unavailable(format!("Token refresh request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = format!("Token refresh failed ({}): {}", status, error_text);
            return Err(if status.is_server_error() {
                TransportError::Unavailable(message).into()
            } else {
                TransportError::Unauthenticated(message).into()
            });
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            TransportError::Unauthenticated(format!("Failed to parse token response: {}", e))
        })?;

        debug!(expires_in = ?token.expires_in, "Access token refreshed");
        Ok(token.access_token)
    }
}

#[async_trait]
impl ChannelProvider for CredentialProvider {
    type Channel = AuthenticatedChannel;

    async fn refresh(&self) -> Result<AuthenticatedChannel> {
        let credentials = self.load_credentials().await?;
        let access_token = self.fetch_access_token(&credentials).await?;
        let channel = connect_channel(&self.endpoint).await?;

        Ok(AuthenticatedChannel::new(channel, access_token))
    }
}

/// Open a channel to the engine host.
///
/// A bare host name gets `https://` and TLS; an explicit `http://` URI is
/// used as-is.
pub async fn connect_channel(endpoint: &str) -> Result<Channel> {
    let (uri, tls_domain) = match endpoint.split_once("://") {
        Some(("http", _)) => (endpoint.to_string(), None),
        Some((_, rest)) => (endpoint.to_string(), Some(host_of(rest))),
        None => (format!("https://{}", endpoint), Some(host_of(endpoint))),
    };

    let mut builder = Endpoint::from_shared(uri.clone())
        .map_err(|e| Error::Config(format!("Invalid assistant endpoint {}: {}", uri, e)))?;

    if let Some(domain) = tls_domain {
        builder = builder
            .tls_config(ClientTlsConfig::new().domain_name(domain))
            .map_err(|e| Error::Config(format!("TLS config error: {}", e)))?;
    }

    let channel = builder.connect().await.map_err(|e| {
        TransportError::Unavailable(format!("gRPC connection to {} failed: {}", uri, e))
    })?;

    info!(endpoint = %uri, "Connected to assistant endpoint");
    Ok(channel)
}

/// Host part of `authority`, without port or IPv6 brackets.
fn host_of(authority: &str) -> String {
    let authority = authority.split('/').next().unwrap_or(authority);
    match authority.parse::<Authority>() {
        Ok(parsed) => parsed
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string(),
        Err(_) => authority.to_string(),
    }
}

/// A connected channel plus the bearer token attached to every call.
#[derive(Clone)]
pub struct AuthenticatedChannel {
    channel: Channel,
    access_token: String,
}

impl AuthenticatedChannel {
    pub fn new(channel: Channel, access_token: String) -> Self {
        Self {
            channel,
            access_token,
        }
    }

    fn bearer(&self) -> std::result::Result<MetadataValue<Ascii>, tonic::Status> {
        format!("Bearer {}", self.access_token)
            .parse()
            .map_err(|_| tonic::Status::unauthenticated("Access token is not valid header text"))
    }
}

#[async_trait]
impl AssistTransport for AuthenticatedChannel {
    async fn assist(
        &self,
        request: AssistRequest,
        deadline: Duration,
    ) -> std::result::Result<FragmentStream, tonic::Status> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("Service not ready: {}", e)))?;

        let mut call = tonic::Request::new(futures::stream::iter(vec![request]));
        call.set_timeout(deadline);
        call.metadata_mut().insert("authorization", self.bearer()?);

        let codec = tonic::codec::ProstCodec::<AssistRequest, AssistResponse>::default();
        let response = grpc
            .streaming(call, PathAndQuery::from_static(ASSIST_PATH), codec)
            .await?;

        let stream: FragmentStream = Box::pin(response.into_inner());
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::{AudioOutputFormat, ConversationState, DialogTurnExecutor, TurnRequest};
    use crate::proto::{assist_config, AudioOut, DialogStateOut};
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    use tonic::codegen::{http, Body, BoxFuture, Service, StdError};
    use tonic::server::{NamedService, StreamingService};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_with(credentials: &str) -> Config {
        let credentials = credentials.to_string();
        Config::from_lookup(move |key| {
            (key == "GA_CREDENTIALS").then(|| credentials.clone())
        })
        .unwrap()
    }

    fn credentials_json(token_uri: &str) -> String {
        serde_json::json!({
            "token_uri": token_uri,
            "client_id": "client-id",
            "client_secret": "client-secret",
            "refresh_token": "refresh-token",
            "scopes": ["https://www.googleapis.com/auth/assistant-sdk-prototype"],
        })
        .to_string()
    }

    #[test]
    fn test_source_selection() {
        assert!(matches!(
            CredentialSource::from_config(&config_with(r#" {"client_id":"x"}"#)),
            CredentialSource::Inline(_)
        ));
        assert_eq!(
            CredentialSource::from_config(&config_with("creds/credentials.json")),
            CredentialSource::File(PathBuf::from("creds/credentials.json"))
        );
    }

    #[test]
    fn test_missing_field_is_config_error() {
        let err = OAuthCredentials::from_json(r#"{"client_id":"x"}"#).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(credentials_json("https://oauth2.example.com/token").as_bytes())
            .unwrap();

        let provider = CredentialProvider::new(&config_with(file.path().to_str().unwrap()), None);
        let creds = provider.load_credentials().await.unwrap();
        assert_eq!(creds.client_id, "client-id");
        assert_eq!(creds.scopes.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_config_error() {
        let provider = CredentialProvider::new(&config_with("/nonexistent/credentials.json"), None);
        let err = provider.load_credentials().await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_refresh_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.fresh",
                "expires_in": 3599,
                "token_type": "Bearer",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let json = credentials_json(&format!("{}/token", server.uri()));
        let provider = CredentialProvider::new(&config_with(&json), None);
        let creds = provider.load_credentials().await.unwrap();

        let token = provider.fetch_access_token(&creds).await.unwrap();
        assert_eq!(token, "ya29.fresh");
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_unauthenticated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let json = credentials_json(&format!("{}/token", server.uri()));
        let provider = CredentialProvider::new(&config_with(&json), None);
        let creds = provider.load_credentials().await.unwrap();

        let err = provider.fetch_access_token(&creds).await.err().unwrap();
        assert!(matches!(
            err,
            Error::Transport(TransportError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("embeddedassistant.googleapis.com"), "embeddedassistant.googleapis.com");
        assert_eq!(host_of("localhost:50051/path"), "localhost");
        assert_eq!(host_of("[::1]"), "::1");
        assert_eq!(host_of("[2001:db8::7]:443"), "2001:db8::7");
    }

    /// What the in-process engine saw on one Assist call.
    #[derive(Debug, Default)]
    struct SeenCall {
        path: String,
        authorization: Option<String>,
        grpc_timeout: Option<String>,
        queries: Vec<String>,
    }

    /// Minimal `EmbeddedAssistant` server that replies with two fragments.
    #[derive(Clone, Default)]
    struct LocalEngine {
        seen: Arc<Mutex<Vec<SeenCall>>>,
    }

    impl NamedService for LocalEngine {
        const NAME: &'static str = "google.assistant.embedded.v1alpha2.EmbeddedAssistant";
    }

    struct AssistCall {
        engine: LocalEngine,
        path: String,
    }

    fn header(metadata: &tonic::metadata::MetadataMap, name: &str) -> Option<String> {
        metadata
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    type FragmentIter =
        futures::stream::Iter<std::vec::IntoIter<std::result::Result<AssistResponse, tonic::Status>>>;

    impl StreamingService<AssistRequest> for AssistCall {
        type Response = AssistResponse;
        type ResponseStream = FragmentIter;
        type Future = BoxFuture<tonic::Response<FragmentIter>, tonic::Status>;

        fn call(&mut self, request: tonic::Request<tonic::Streaming<AssistRequest>>) -> Self::Future {
            let engine = self.engine.clone();
            let path = self.path.clone();
            Box::pin(async move {
                let authorization = header(request.metadata(), "authorization");
                let grpc_timeout = header(request.metadata(), "grpc-timeout");

                let mut inbound = request.into_inner();
                let mut queries = Vec::new();
                while let Some(message) = inbound.message().await? {
                    if let Some(assist_config::Type::TextQuery(text)) =
                        message.config().and_then(|c| c.r#type.clone())
                    {
                        queries.push(text);
                    }
                }

                engine.seen.lock().unwrap().push(SeenCall {
                    path,
                    authorization,
                    grpc_timeout,
                    queries,
                });

                let fragments = vec![
                    Ok(AssistResponse {
                        audio_out: Some(AudioOut {
                            audio_data: vec![0xAB],
                        }),
                        ..Default::default()
                    }),
                    Ok(AssistResponse {
                        audio_out: Some(AudioOut {
                            audio_data: vec![0xCD],
                        }),
                        dialog_state_out: Some(DialogStateOut {
                            supplemental_display_text: "It is noon".to_string(),
                            conversation_state: b"tok1".to_vec(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                ];
                Ok::<_, tonic::Status>(tonic::Response::new(futures::stream::iter(fragments)))
            })
        }
    }

    impl<B> Service<http::Request<B>> for LocalEngine
    where
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: http::Request<B>) -> Self::Future {
            let call = AssistCall {
                engine: self.clone(),
                path: request.uri().path().to_string(),
            };
            Box::pin(async move {
                let codec = tonic::codec::ProstCodec::<AssistResponse, AssistRequest>::default();
                let mut grpc = tonic::server::Grpc::new(codec);
                Ok(grpc.streaming(call, request).await)
            })
        }
    }

    async fn serve_local_engine(engine: LocalEngine) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let incoming = Box::pin(futures::stream::unfold(listener, |listener| async move {
            let accepted = listener.accept().await.map(|(stream, _)| stream);
            Some((accepted, listener))
        }));

        tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(engine)
                .serve_with_incoming(incoming),
        );
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_assist_call_carries_bearer_token() {
        let engine = LocalEngine::default();
        let endpoint = serve_local_engine(engine.clone()).await;

        let channel = connect_channel(&endpoint).await.unwrap();
        let channel = AuthenticatedChannel::new(channel, "ya29.fresh".to_string());
        let request = TurnRequest {
            text: "what time is it".to_string(),
            language_code: "en-US".to_string(),
            device_model_id: "model".to_string(),
            device_id: "device".to_string(),
            conversation_state: ConversationState::default(),
            audio_output_format: AudioOutputFormat::Linear16,
        };

        let result = DialogTurnExecutor::new(Duration::from_secs(5))
            .execute_turn(&request, &channel)
            .await
            .unwrap();

        assert_eq!(result.display_text.as_deref(), Some("It is noon"));
        assert_eq!(result.audio, vec![0xAB, 0xCD]);
        assert_eq!(result.next_conversation_state, ConversationState::new(b"tok1".to_vec()));

        let seen = engine.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let call = &seen[0];
        assert_eq!(call.path, ASSIST_PATH);
        assert_eq!(call.authorization.as_deref(), Some("Bearer ya29.fresh"));
        assert!(call.grpc_timeout.is_some());
        assert_eq!(call.queries, vec!["what time is it".to_string()]);
    }
}
