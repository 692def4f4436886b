//! # Upstream Connector
//!
//! Opens the WebSocket to the hosted voice API for one session.
//!
//! ## Connection Steps:
//! 1. **Credential**: refuse to dial at all if no API key is configured
//! 2. **Dial**: connect with a bounded timeout; HTTP 401/403 during the
//!    handshake means the key was refused
//! 3. **Setup** (optional): send the `setup` message and wait for
//!    `setupComplete`, so a rejected key or model fails the session before any
//!    browser audio is forwarded
//! 4. **Greeting** (optional): ask the model to speak first
//!
//! Messages received during setup, including the `setupComplete` reply itself,
//! are handed back to the caller to be relayed to the browser like any other
//! upstream message.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::config::{SetupConfig, UpstreamConfig};
use crate::error::RelayError;
use crate::relay::frame::Frame;

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A ready upstream connection plus whatever it said during setup.
pub struct Connected {
    pub socket: UpstreamSocket,
    pub early_frames: Vec<Frame>,
}

/// Build the authenticated endpoint URL. The result contains the secret and must not be logged.
pub fn endpoint_url(config: &UpstreamConfig) -> Result<Url, RelayError> {
    let key = config
        .api_key
        .as_ref()
        .filter(|key| !key.is_blank())
        .ok_or(RelayError::MissingCredential)?;

    let mut url = Url::parse(&config.url).map_err(|e| RelayError::InvalidUrl(e.to_string()))?;
    url.query_pairs_mut().append_pair("key", key.expose());
    Ok(url)
}

/// Host part of the configured endpoint, safe to log.
pub fn endpoint_host(config: &UpstreamConfig) -> String {
    Url::parse(&config.url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| "<invalid>".to_string())
}

/// Dial upstream and run the setup handshake.
pub async fn connect(config: &UpstreamConfig) -> Result<Connected, RelayError> {
    let url = endpoint_url(config)?;
    let host = endpoint_host(config);
    debug!(host = %host, "Connecting to upstream");

    let (mut socket, response) = match timeout(config.connect_timeout(), connect_async(url.as_str())).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(tungstenite::Error::Http(response)))
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            return Err(RelayError::Unauthorized(response.status().as_u16()));
        }
        Ok(Err(e)) => return Err(RelayError::Connect(e.to_string())),
        Err(_) => return Err(RelayError::ConnectTimeout(config.connect_timeout())),
    };
    info!(host = %host, status = %response.status(), "Connected to upstream");

    let early_frames = if config.setup.enabled {
        handshake(&mut socket, &config.setup, config.setup_timeout()).await?
    } else {
        Vec::new()
    };

    Ok(Connected { socket, early_frames })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupMessage<'a> {
    setup: Setup<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: &'a str,
    generation_config: GenerationConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_audio_transcription: Option<Empty>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: &'a [String],
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Empty {}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeTextMessage<'a> {
    realtime_input: RealtimeText<'a>,
}

#[derive(Serialize)]
struct RealtimeText<'a> {
    text: &'a str,
}

/// Serialized `setup` message for the configured session.
pub fn setup_message(setup: &SetupConfig) -> serde_json::Result<String> {
    let instruction = setup.system_instruction.trim();
    let message = SetupMessage {
        setup: Setup {
            model: &setup.model,
            generation_config: GenerationConfig {
                response_modalities: &setup.response_modalities,
            },
            system_instruction: (!instruction.is_empty()).then(|| Content {
                parts: [Part { text: instruction }],
            }),
            input_audio_transcription: setup.input_audio_transcription.then_some(Empty {}),
            output_audio_transcription: setup.output_audio_transcription.then_some(Empty {}),
        },
    };
    serde_json::to_string(&message)
}

/// Serialized greeting turn, if one is configured.
pub fn greeting_message(setup: &SetupConfig) -> serde_json::Result<Option<String>> {
    let greeting = setup.greeting.trim();
    if greeting.is_empty() {
        return Ok(None);
    }
    let message = RealtimeTextMessage {
        realtime_input: RealtimeText { text: greeting },
    };
    serde_json::to_string(&message).map(Some)
}

fn is_setup_complete(frame: &Frame) -> bool {
    frame
        .as_text()
        .and_then(|text| serde_json::from_str::<serde_json::Value>(text).ok())
        .is_some_and(|value| value.get("setupComplete").is_some())
}

/// Send `setup`, wait for `setupComplete`, then send the greeting.
///
/// Returns every data frame upstream sent before and including the acknowledgement.
pub async fn handshake<S>(
    socket: &mut S,
    setup: &SetupConfig,
    setup_timeout: std::time::Duration,
) -> Result<Vec<Frame>, RelayError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let setup_json = setup_message(setup).map_err(|e| RelayError::Upstream(e.to_string()))?;
    socket
        .send(Message::Text(setup_json))
        .await
        .map_err(|e| RelayError::Upstream(e.to_string()))?;

    let deadline = Instant::now() + setup_timeout;
    let mut early_frames = Vec::new();

    loop {
        let next = timeout_at(deadline, socket.next())
            .await
            .map_err(|_| RelayError::SetupTimeout(setup_timeout))?;

        match next {
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| format!("{} ({})", f.reason, u16::from(f.code)))
                    .unwrap_or_else(|| "closed without reason".to_string());
                return Err(RelayError::SetupRejected(reason));
            }
            Some(Ok(msg)) => {
                if let Some(frame) = Frame::from_upstream(msg) {
                    let done = is_setup_complete(&frame);
                    early_frames.push(frame);
                    if done {
                        break;
                    }
                }
            }
            Some(Err(e)) => return Err(RelayError::Upstream(e.to_string())),
            None => return Err(RelayError::SetupRejected("connection ended during setup".to_string())),
        }
    }

    let greeting = greeting_message(setup).map_err(|e| RelayError::Upstream(e.to_string()))?;
    if let Some(greeting) = greeting {
        socket
            .send(Message::Text(greeting))
            .await
            .map_err(|e| RelayError::Upstream(e.to_string()))?;
    }

    Ok(early_frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKey, AppConfig};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::http::StatusCode;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};

    async fn socket_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let relay_side = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let api_side = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (relay_side, api_side)
    }

    /// Accept one connection on a local port. `refuse` turns the upgrade into that HTTP status.
    async fn local_api(refuse: Option<u16>) -> (String, tokio::task::JoinHandle<Option<WebSocketStream<TcpStream>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/live", listener.local_addr().unwrap());

        let api = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = move |_req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                match refuse {
                    Some(status) => {
                        let mut refusal = ErrorResponse::new(Some("API key not valid".to_string()));
                        *refusal.status_mut() = StatusCode::from_u16(status).unwrap();
                        Err(refusal)
                    }
                    None => Ok(resp),
                }
            };
            accept_hdr_async(tcp, callback).await.ok()
        });
        (url, api)
    }

    fn upstream_config(url: String) -> UpstreamConfig {
        let mut config = AppConfig::default().upstream;
        config.url = url;
        config.api_key = Some(ApiKey::new("test-key"));
        config
    }

    fn text_of(msg: Message) -> String {
        match msg {
            Message::Text(text) => text,
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_credential_never_dials() {
        let config = AppConfig::default();
        assert!(matches!(endpoint_url(&config.upstream), Err(RelayError::MissingCredential)));
    }

    #[test]
    fn test_credential_is_appended_as_key_param() {
        let mut config = AppConfig::default();
        config.upstream.url = "ws://127.0.0.1:9000/live?alt=json".to_string();
        config.upstream.api_key = Some(ApiKey::new("k&y"));

        let url = endpoint_url(&config.upstream).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("alt".to_string(), "json".to_string())));
        assert!(pairs.contains(&("key".to_string(), "k&y".to_string())));
        assert_eq!(endpoint_host(&config.upstream), "127.0.0.1");
    }

    #[test]
    fn test_setup_message_shape() {
        let setup = AppConfig::default().upstream.setup;
        let value: serde_json::Value = serde_json::from_str(&setup_message(&setup).unwrap()).unwrap();

        assert_eq!(value["setup"]["model"], setup.model.as_str());
        assert_eq!(value["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert!(value["setup"]["systemInstruction"]["parts"][0]["text"].is_string());
        assert!(value["setup"]["inputAudioTranscription"].is_object());
        assert!(value["setup"]["outputAudioTranscription"].is_object());
    }

    #[test]
    fn test_optional_setup_fields_are_omitted() {
        let mut setup = AppConfig::default().upstream.setup;
        setup.system_instruction = "  ".to_string();
        setup.input_audio_transcription = false;
        setup.output_audio_transcription = false;
        setup.greeting = String::new();

        let value: serde_json::Value = serde_json::from_str(&setup_message(&setup).unwrap()).unwrap();
        assert!(value["setup"].get("systemInstruction").is_none());
        assert!(value["setup"].get("inputAudioTranscription").is_none());
        assert!(greeting_message(&setup).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handshake_waits_for_setup_complete_then_greets() {
        let setup = AppConfig::default().upstream.setup;
        let (mut relay_side, mut api_side) = socket_pair().await;

        let api = tokio::spawn(async move {
            let setup_msg = text_of(api_side.next().await.unwrap().unwrap());
            assert!(setup_msg.contains("\"setup\""));
            api_side
                .send(Message::Binary(b"{\"setupComplete\":{}}".to_vec()))
                .await
                .unwrap();
            let greeting = text_of(api_side.next().await.unwrap().unwrap());
            assert!(greeting.contains("realtimeInput"));
            api_side
        });

        let early = handshake(&mut relay_side, &setup, Duration::from_secs(5)).await.unwrap();
        assert_eq!(early.len(), 1);
        assert_eq!(early[0].as_text(), Some("{\"setupComplete\":{}}"));
        api.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_reports_rejection() {
        let setup = AppConfig::default().upstream.setup;
        let (mut relay_side, mut api_side) = socket_pair().await;

        let api = tokio::spawn(async move {
            let _setup = api_side.next().await;
            api_side
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "API key not valid".into(),
                }))
                .await
                .unwrap();
        });

        let err = handshake(&mut relay_side, &setup, Duration::from_secs(5)).await.unwrap_err();
        match &err {
            RelayError::SetupRejected(reason) => assert!(reason.contains("API key not valid")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(err.close_notice().code, 1008);
        api.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_times_out_without_ack() {
        let setup = AppConfig::default().upstream.setup;
        let (mut relay_side, _api_side) = socket_pair().await;

        let err = handshake(&mut relay_side, &setup, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, RelayError::SetupTimeout(_)));
    }

    #[tokio::test]
    async fn test_refused_upgrade_maps_to_unauthorized() {
        for status in [401, 403] {
            let (url, api) = local_api(Some(status)).await;
            let err = match connect(&upstream_config(url)).await {
                Err(err) => err,
                Ok(_) => panic!("HTTP {} should fail the connect", status),
            };
            assert!(matches!(err, RelayError::Unauthorized(code) if code == status));
            assert_eq!(err.close_notice().code, 1008);
            assert!(api.await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_other_upgrade_failures_are_connect_errors() {
        let (url, _api) = local_api(Some(500)).await;
        let err = match connect(&upstream_config(url)).await {
            Err(err) => err,
            Ok(_) => panic!("HTTP 500 should fail the connect"),
        };
        assert!(matches!(err, RelayError::Connect(_)));
        assert_eq!(err.close_notice().code, 1011);
    }

    #[tokio::test]
    async fn test_connect_without_setup_sends_nothing() {
        let (url, api) = local_api(None).await;
        let mut config = upstream_config(url);
        config.setup.enabled = false;

        let connected = match connect(&config).await {
            Ok(connected) => connected,
            Err(err) => panic!("connect failed: {:?}", err),
        };
        assert!(connected.early_frames.is_empty());

        let mut relay_side = connected.socket;
        let mut api_side = api.await.unwrap().unwrap();
        relay_side.send(Message::Text("from the browser".into())).await.unwrap();
        assert_eq!(text_of(api_side.next().await.unwrap().unwrap()), "from the browser");
    }
}
