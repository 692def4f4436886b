use crate::relay::upstream::{greeting_message, setup_message};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Effective configuration. The credential is reported only as present or absent.
///
/// When the relay does not send `setup` itself, the messages the browser has to
/// send instead are included ready to go.
pub async fn get_config(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    let upstream = &config.upstream;
    let relay = &config.relay;

    let (browser_setup, browser_greeting) = if upstream.setup.enabled {
        (None, None)
    } else {
        (
            setup_message(&upstream.setup).ok(),
            greeting_message(&upstream.setup).ok().flatten(),
        )
    };

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "upstream": {
                "host": crate::relay::upstream::endpoint_host(upstream),
                "api_key_configured": config.has_credential(),
                "connect_timeout_secs": upstream.connect_timeout_secs,
                "setup_timeout_secs": upstream.setup_timeout_secs,
                "setup": {
                    "enabled": upstream.setup.enabled,
                    "model": upstream.setup.model,
                    "response_modalities": upstream.setup.response_modalities,
                    "system_instruction": upstream.setup.system_instruction,
                    "input_audio_transcription": upstream.setup.input_audio_transcription,
                    "output_audio_transcription": upstream.setup.output_audio_transcription,
                    "greeting_enabled": !upstream.setup.greeting.trim().is_empty(),
                    "browser_setup_message": browser_setup,
                    "browser_greeting_message": browser_greeting
                }
            },
            "relay": {
                "max_concurrent_sessions": relay.max_concurrent_sessions,
                "downlink_buffer_frames": relay.downlink_buffer_frames,
                "max_frame_bytes": relay.max_frame_bytes,
                "heartbeat_interval_secs": relay.heartbeat_interval_secs,
                "client_timeout_secs": relay.client_timeout_secs
            }
        }
    }))
}
