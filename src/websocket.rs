//! # Browser WebSocket Endpoint
//!
//! Browsers connect to `/ws`; each connection becomes one relay session paired
//! with its own upstream connection to the live voice API.
//!
//! ## Session Flow:
//! 1. **Upgrade**: the HTTP request is upgraded and a [`RelaySocket`] actor starts
//! 2. **Register**: the actor claims a slot in the session registry (or closes with 1013)
//! 3. **Relay**: a tokio task dials upstream and runs the bridge; the actor only
//!    moves frames between the socket and the bridge channels
//! 4. **Close**: whichever side ends first, the other is closed with a mapped code
//!
//! ## Message Format:
//! Frames are not interpreted here. The browser speaks the live API's JSON
//! protocol (`realtimeInput`, `serverContent`, ...) and the relay passes it through.
//! Fragmented messages are put back together first, so upstream always sees
//! whole messages, capped at `relay.max_frame_bytes`.
//!
//! ## Actor Model:
//! The actor's handlers are synchronous, so browser frames go into an unbounded
//! channel that the bridge drains. Frames from upstream come back as a second
//! stream attached to the actor's context, which keeps them in order with the
//! final close notice.

use crate::error::AppError;
use crate::relay::bridge::{run_session, Outbound};
use crate::relay::frame::Frame;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::web::BytesMut;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WebSocket actor for one browser connection.
pub struct RelaySocket {
    /// Shared application state (config and session registry)
    state: AppState,

    /// Browser address, for logs and the session record
    peer: Option<String>,

    /// Registry id, set once the session is admitted
    session_id: Option<Uuid>,

    /// Browser → upstream frames; dropping it tells the bridge the browser is gone
    uplink: Option<mpsc::UnboundedSender<Frame>>,

    /// Last time the browser showed signs of life
    last_heartbeat: Instant,

    /// Fragmented message being reassembled
    partial: Option<PartialMessage>,
}

struct PartialMessage {
    text: bool,
    data: BytesMut,
}

impl RelaySocket {
    pub fn new(state: AppState, peer: Option<String>) -> Self {
        Self {
            state,
            peer,
            session_id: None,
            uplink: None,
            last_heartbeat: Instant::now(),
            partial: None,
        }
    }

    fn close_with(&mut self, ctx: &mut ws::WebsocketContext<Self>, code: ws::CloseCode, description: &str) {
        warn!(session_id = ?self.session_id, code = ?code, "{}", description);
        self.partial = None;
        ctx.close(Some(ws::CloseReason {
            code,
            description: Some(description.to_string()),
        }));
        ctx.stop();
    }

    /// Collect one fragment; the whole message goes upstream on the last one.
    fn handle_fragment(&mut self, item: actix_http::ws::Item, ctx: &mut ws::WebsocketContext<Self>) {
        let (chunk, last) = match item {
            actix_http::ws::Item::FirstText(chunk) => (self.begin_message(true, chunk), false),
            actix_http::ws::Item::FirstBinary(chunk) => (self.begin_message(false, chunk), false),
            actix_http::ws::Item::Continue(chunk) => (Some(chunk), false),
            actix_http::ws::Item::Last(chunk) => (Some(chunk), true),
        };
        let Some(chunk) = chunk else {
            self.close_with(ctx, ws::CloseCode::Protocol, "New message started inside a fragmented one");
            return;
        };

        let max_frame_bytes = self.state.config.relay.max_frame_bytes;
        let Some(partial) = self.partial.as_mut() else {
            self.close_with(ctx, ws::CloseCode::Protocol, "Continuation without a first fragment");
            return;
        };
        if partial.data.len() + chunk.len() > max_frame_bytes {
            self.close_with(ctx, ws::CloseCode::Size, "Fragmented message too large");
            return;
        }
        partial.data.extend_from_slice(&chunk);
        if !last {
            return;
        }

        let Some(PartialMessage { text, data }) = self.partial.take() else {
            return;
        };
        let frame = if text {
            match String::from_utf8(data.to_vec()) {
                Ok(text) => Frame::Text(text),
                Err(_) => {
                    self.close_with(ctx, ws::CloseCode::Invalid, "Fragmented text message is not valid UTF-8");
                    return;
                }
            }
        } else {
            Frame::Binary(data.freeze())
        };
        self.forward_to_upstream(frame);
    }

    /// Start buffering a new message. `None` if one is already in progress.
    fn begin_message(&mut self, text: bool, chunk: web::Bytes) -> Option<web::Bytes> {
        if self.partial.is_some() {
            return None;
        }
        self.partial = Some(PartialMessage {
            text,
            data: BytesMut::with_capacity(chunk.len()),
        });
        Some(chunk)
    }

    /// Ping the browser on an interval and drop it once it has been silent too long.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let relay = &self.state.config.relay;
        let client_timeout = relay.client_timeout();

        ctx.run_interval(relay.heartbeat_interval(), move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > client_timeout {
                warn!(session_id = ?act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn forward_to_upstream(&mut self, frame: Frame) {
        let Some(uplink) = &self.uplink else {
            return;
        };
        if uplink.send(frame).is_err() {
            // The bridge is finishing; its close notice is already queued
            debug!(session_id = ?self.session_id, "Dropping browser frame after session end");
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        let guard = match self.state.sessions.open(self.peer.clone()) {
            Ok(guard) => guard,
            Err(err) => {
                warn!(peer = ?self.peer, error = %err, "Rejecting WebSocket connection");
                ctx.close(Some(err.close_notice().into_browser_reason()));
                ctx.stop();
                return;
            }
        };

        let session_id = guard.id();
        self.session_id = Some(session_id);
        info!(session_id = %session_id, peer = ?self.peer, "WebSocket connection started");

        let (uplink_tx, uplink_rx) = mpsc::unbounded_channel();
        let (downlink_tx, downlink_rx) = mpsc::channel(self.state.config.relay.downlink_buffer_frames);
        self.uplink = Some(uplink_tx);

        ctx.add_stream(ReceiverStream::new(downlink_rx));
        self.start_heartbeat(ctx);

        tokio::spawn(run_session(self.state.config.clone(), guard, uplink_rx, downlink_tx));
    }

    /// Called when the WebSocket connection stops.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Closing the uplink is what ends the session on the upstream side
        self.uplink.take();
        info!(session_id = ?self.session_id, "WebSocket connection stopped");
    }
}

/// Handle incoming browser messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                error!(session_id = ?self.session_id, "WebSocket protocol error: {}", err);
                let code = match err {
                    ws::ProtocolError::Overflow => ws::CloseCode::Size,
                    _ => ws::CloseCode::Protocol,
                };
                self.close_with(ctx, code, &err.to_string());
                return;
            }
        };

        self.last_heartbeat = Instant::now();

        match msg {
            ws::Message::Text(_) | ws::Message::Binary(_) => {
                if self.partial.is_some() {
                    self.close_with(ctx, ws::CloseCode::Protocol, "Data frame inside a fragmented message");
                    return;
                }
                if let Some(frame) = Frame::from_browser(msg) {
                    self.forward_to_upstream(frame);
                }
            }
            ws::Message::Ping(data) => {
                ctx.pong(&data);
            }
            ws::Message::Pong(_) => {}
            ws::Message::Close(reason) => {
                info!(session_id = ?self.session_id, "WebSocket closed by browser: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(item) => self.handle_fragment(item, ctx),
            ws::Message::Nop => {}
        }
    }
}

/// Handle frames and the final close notice coming back from the bridge.
impl StreamHandler<Outbound> for RelaySocket {
    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg {
            Outbound::Frame(Frame::Text(text)) => ctx.text(text),
            Outbound::Frame(Frame::Binary(data)) => ctx.binary(data),
            Outbound::Close(notice) => {
                info!(
                    session_id = ?self.session_id,
                    code = notice.code,
                    reason = %notice.reason,
                    "Closing browser connection"
                );
                ctx.close(Some(notice.into_browser_reason()));
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// This function handles the initial HTTP request and upgrades it to a WebSocket connection.
/// The actual relaying is handled by the [`RelaySocket`] actor and the session bridge.
pub async fn relay_socket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let peer = req.peer_addr().map(|addr| addr.to_string());
    info!("New WebSocket connection request from: {:?}", peer);

    let max_frame_bytes = app_state.config.relay.max_frame_bytes;
    let socket = RelaySocket::new(app_state.get_ref().clone(), peer);

    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(max_frame_bytes)
        .start()
        .map_err(|e| AppError::BadRequest(format!("WebSocket upgrade failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKey, AppConfig};
    use actix_web::{App, HttpServer};
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::http::StatusCode;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::{CloseCode, Data, OpCode};
    use tokio_tungstenite::tungstenite::protocol::frame::Frame as WireFrame;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};

    type Browser = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(5);

    /// How the stand-in API treats a new connection.
    #[derive(Clone, Copy)]
    enum MockMode {
        /// Acknowledge `setup` with `setupComplete`
        Accept,
        /// Refuse the WebSocket upgrade with this HTTP status
        RejectHttp(u16),
        /// Close with 1008 on `setup`, as the live API does for a bad key
        CloseOnSetup,
    }

    /// Stand-in for the live API: reports every data message and close it receives.
    struct MockUpstream {
        addr: SocketAddr,
        connections: Arc<AtomicUsize>,
        queries: mpsc::UnboundedReceiver<Option<String>>,
        received: mpsc::UnboundedReceiver<Message>,
        commands: mpsc::UnboundedSender<Message>,
    }

    impl MockUpstream {
        async fn start() -> Self {
            Self::start_with(MockMode::Accept).await
        }

        async fn start_with(mode: MockMode) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let connections = Arc::new(AtomicUsize::new(0));
            let (query_tx, queries) = mpsc::unbounded_channel();
            let (received_tx, received) = mpsc::unbounded_channel();
            let (commands, commands_rx) = mpsc::unbounded_channel();

            let counter = connections.clone();
            tokio::spawn(async move {
                let mut first = Some((received_tx, commands_rx));
                while let Ok((tcp, _)) = listener.accept().await {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let query_tx = query_tx.clone();
                    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        let _ = query_tx.send(req.uri().query().map(str::to_string));
                        match mode {
                            MockMode::RejectHttp(status) => {
                                let mut refusal = ErrorResponse::new(Some("API key not valid".to_string()));
                                *refusal.status_mut() = StatusCode::from_u16(status).unwrap();
                                Err(refusal)
                            }
                            _ => Ok(resp),
                        }
                    };
                    let Ok(socket) = accept_hdr_async(tcp, callback).await else {
                        continue;
                    };
                    if let Some((received_tx, commands_rx)) = first.take() {
                        tokio::spawn(serve(socket, mode, received_tx, commands_rx));
                    }
                }
            });

            Self { addr, connections, queries, received, commands }
        }

        fn url(&self) -> String {
            format!("ws://{}/live", self.addr)
        }

        async fn next_received(&mut self) -> Message {
            timeout(WAIT, self.received.recv())
                .await
                .expect("mock upstream read timed out")
                .expect("mock upstream closed")
        }

        /// Consume the relay's own `setup` and greeting.
        async fn expect_setup_and_greeting(&mut self) {
            match self.next_received().await {
                Message::Text(text) => assert!(text.starts_with("{\"setup\""), "expected setup, got {}", text),
                other => panic!("expected setup, got {:?}", other),
            }
            match self.next_received().await {
                Message::Text(text) => assert_eq!(text, "{\"realtimeInput\":{\"text\":\"Hello there\"}}"),
                other => panic!("expected greeting, got {:?}", other),
            }
        }
    }

    async fn serve(
        socket: WebSocketStream<TcpStream>,
        mode: MockMode,
        received: mpsc::UnboundedSender<Message>,
        mut commands: mpsc::UnboundedReceiver<Message>,
    ) {
        let (mut sink, mut stream) = socket.split();
        loop {
            tokio::select! {
                msg = stream.next() => {
                    let Some(Ok(msg)) = msg else { break };
                    if matches!(msg, Message::Ping(_) | Message::Pong(_)) {
                        continue;
                    }
                    let is_setup = matches!(&msg, Message::Text(text) if text.starts_with("{\"setup\""));
                    let _ = received.send(msg);
                    if is_setup {
                        let reply = match mode {
                            MockMode::CloseOnSetup => Message::Close(Some(CloseFrame {
                                code: CloseCode::Policy,
                                reason: "API key not valid".into(),
                            })),
                            _ => Message::Binary(b"{\"setupComplete\":{}}".to_vec()),
                        };
                        let _ = sink.send(reply).await;
                    }
                }
                Some(cmd) = commands.recv() => {
                    let _ = sink.send(cmd).await;
                }
            }
        }
    }

    async fn start_relay(config: AppConfig) -> (SocketAddr, AppState) {
        let state = AppState::new(config);
        let data = web::Data::new(state.clone());

        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route("/ws", web::get().to(relay_socket))
        })
        .workers(1)
        .disable_signals()
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());

        (addr, state)
    }

    fn relay_config(upstream: &MockUpstream, api_key: Option<&str>) -> AppConfig {
        let mut config = AppConfig::default();
        config.upstream.url = upstream.url();
        config.upstream.api_key = api_key.map(ApiKey::new);
        config.upstream.setup.greeting = "Hello there".to_string();
        config
    }

    async fn connect_browser(addr: SocketAddr) -> Browser {
        let (browser, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        browser
    }

    async fn next_browser_message(browser: &mut Browser) -> Message {
        loop {
            let msg = timeout(WAIT, browser.next())
                .await
                .expect("browser read timed out")
                .expect("browser stream ended")
                .expect("browser read failed");
            if !matches!(msg, Message::Ping(_) | Message::Pong(_)) {
                return msg;
            }
        }
    }

    async fn expect_close(browser: &mut Browser) -> CloseFrame<'static> {
        match next_browser_message(browser).await {
            Message::Close(Some(frame)) => frame.into_owned(),
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    async fn wait_for_no_sessions(state: &AppState) {
        for _ in 0..100 {
            if state.sessions.active_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("sessions still registered: {}", state.sessions.active_count());
    }

    #[actix_web::test]
    async fn test_frames_relay_both_ways_and_browser_close_reaches_upstream() {
        let mut upstream = MockUpstream::start().await;
        let (addr, state) = start_relay(relay_config(&upstream, Some("test-key"))).await;
        let mut browser = connect_browser(addr).await;

        // setup acknowledgement is passed on, then the greeting goes up
        assert_eq!(
            next_browser_message(&mut browser).await,
            Message::Binary(b"{\"setupComplete\":{}}".to_vec())
        );
        assert_eq!(
            upstream.queries.recv().await.flatten().as_deref(),
            Some("key=test-key")
        );
        upstream.expect_setup_and_greeting().await;

        let up = vec![
            Message::Binary(vec![1, 2, 3, 4]),
            Message::Text("{\"realtimeInput\":{\"audio\":{\"data\":\"AAAA\",\"mimeType\":\"audio/pcm;rate=16000\"}}}".into()),
            Message::Binary(vec![9; 640]),
        ];
        for msg in &up {
            browser.send(msg.clone()).await.unwrap();
        }
        for expected in up {
            assert_eq!(upstream.next_received().await, expected);
        }

        let down = vec![
            Message::Binary(vec![0x10, 0x20, 0x30]),
            Message::Text("{\"serverContent\":{\"turnComplete\":true}}".into()),
        ];
        for msg in &down {
            upstream.commands.send(msg.clone()).unwrap();
        }
        for expected in down {
            assert_eq!(next_browser_message(&mut browser).await, expected);
        }

        browser.close(None).await.unwrap();
        match upstream.next_received().await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected upstream close, got {:?}", other),
        }

        wait_for_no_sessions(&state).await;
        let summary = state.sessions.summary();
        assert_eq!(summary.sessions_completed, 1);
        assert_eq!(summary.traffic.frames_up, 3);
        assert_eq!(summary.traffic.frames_down, 3);
    }

    #[actix_web::test]
    async fn test_plain_http_request_is_rejected() {
        let app = actix_web::test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(AppConfig::default())))
                .route("/ws", web::get().to(relay_socket)),
        )
        .await;

        let req = actix_web::test::TestRequest::get().uri("/ws").to_request();
        let resp = actix_web::test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let value: serde_json::Value = actix_web::test::read_body_json(resp).await;
        assert_eq!(value["error"]["type"], "bad_request");
    }

    #[actix_web::test]
    async fn test_missing_credential_closes_with_policy_violation() {
        let upstream = MockUpstream::start().await;
        let (addr, state) = start_relay(relay_config(&upstream, None)).await;
        let mut browser = connect_browser(addr).await;

        let frame = expect_close(&mut browser).await;
        assert_eq!(frame.code, CloseCode::Policy);
        assert!(frame.reason.contains("credential"));

        assert_eq!(upstream.connections.load(Ordering::SeqCst), 0);
        wait_for_no_sessions(&state).await;
        assert_eq!(state.sessions.summary().sessions_failed, 1);
    }

    #[actix_web::test]
    async fn test_upstream_close_is_mirrored_to_browser() {
        let mut upstream = MockUpstream::start().await;
        let (addr, state) = start_relay(relay_config(&upstream, Some("test-key"))).await;
        let mut browser = connect_browser(addr).await;

        next_browser_message(&mut browser).await;
        upstream.expect_setup_and_greeting().await;

        upstream
            .commands
            .send(Message::Close(Some(CloseFrame { code: CloseCode::Normal, reason: "bye".into() })))
            .unwrap();

        let frame = expect_close(&mut browser).await;
        assert_eq!(frame.code, CloseCode::Normal);
        assert_eq!(frame.reason, "bye");
        wait_for_no_sessions(&state).await;
    }

    #[actix_web::test]
    async fn test_connections_over_the_limit_are_told_to_retry_later() {
        let mut upstream = MockUpstream::start().await;
        let mut config = relay_config(&upstream, Some("test-key"));
        config.relay.max_concurrent_sessions = 1;
        let (addr, state) = start_relay(config).await;

        let mut first = connect_browser(addr).await;
        next_browser_message(&mut first).await;
        upstream.expect_setup_and_greeting().await;

        let mut second = connect_browser(addr).await;
        let frame = expect_close(&mut second).await;
        assert_eq!(frame.code, CloseCode::Again);

        // the admitted session is unaffected
        first.send(Message::Text("still here".into())).await.unwrap();
        assert_eq!(upstream.next_received().await, Message::Text("still here".into()));
        assert_eq!(upstream.connections.load(Ordering::SeqCst), 1);
        assert_eq!(state.sessions.summary().sessions_rejected, 1);
    }

    fn fragment(data: &[u8], opcode: OpCode, is_final: bool) -> Message {
        Message::Frame(WireFrame::message(data.to_vec(), opcode, is_final))
    }

    #[actix_web::test]
    async fn test_fragmented_browser_messages_are_reassembled_in_order() {
        let mut upstream = MockUpstream::start().await;
        let (addr, _state) = start_relay(relay_config(&upstream, Some("test-key"))).await;
        let mut browser = connect_browser(addr).await;
        next_browser_message(&mut browser).await;
        upstream.expect_setup_and_greeting().await;

        browser.send(fragment(b"hello ", OpCode::Data(Data::Text), false)).await.unwrap();
        browser.send(fragment(b"world", OpCode::Data(Data::Continue), true)).await.unwrap();
        browser.send(fragment(&[1, 2], OpCode::Data(Data::Binary), false)).await.unwrap();
        browser.send(fragment(&[3], OpCode::Data(Data::Continue), false)).await.unwrap();
        browser.send(fragment(&[4], OpCode::Data(Data::Continue), true)).await.unwrap();
        browser.send(Message::Text("after".into())).await.unwrap();

        assert_eq!(upstream.next_received().await, Message::Text("hello world".into()));
        assert_eq!(upstream.next_received().await, Message::Binary(vec![1, 2, 3, 4]));
        assert_eq!(upstream.next_received().await, Message::Text("after".into()));
    }

    #[actix_web::test]
    async fn test_oversize_fragmented_message_closes_with_message_too_big() {
        let mut upstream = MockUpstream::start().await;
        let mut config = relay_config(&upstream, Some("test-key"));
        config.relay.max_frame_bytes = 16;
        let (addr, state) = start_relay(config).await;
        let mut browser = connect_browser(addr).await;
        next_browser_message(&mut browser).await;
        upstream.expect_setup_and_greeting().await;

        // each fragment fits, the message does not
        browser.send(fragment(&[0; 10], OpCode::Data(Data::Binary), false)).await.unwrap();
        browser.send(fragment(&[0; 10], OpCode::Data(Data::Continue), true)).await.unwrap();

        let frame = expect_close(&mut browser).await;
        assert_eq!(frame.code, CloseCode::Size);
        match upstream.next_received().await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("oversize message leaked upstream: {:?}", other),
        }
        wait_for_no_sessions(&state).await;
    }

    #[actix_web::test]
    async fn test_oversize_frame_closes_with_message_too_big() {
        let mut upstream = MockUpstream::start().await;
        let mut config = relay_config(&upstream, Some("test-key"));
        config.relay.max_frame_bytes = 16;
        let (addr, state) = start_relay(config).await;
        let mut browser = connect_browser(addr).await;
        next_browser_message(&mut browser).await;
        upstream.expect_setup_and_greeting().await;

        browser.send(Message::Binary(vec![7; 15])).await.unwrap();
        assert_eq!(upstream.next_received().await, Message::Binary(vec![7; 15]));

        browser.send(Message::Binary(vec![7; 64])).await.unwrap();
        let frame = expect_close(&mut browser).await;
        assert_eq!(frame.code, CloseCode::Size);
        match upstream.next_received().await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("oversize frame leaked upstream: {:?}", other),
        }
        wait_for_no_sessions(&state).await;
        assert_eq!(state.sessions.summary().traffic.frames_up, 1);
    }

    #[actix_web::test]
    async fn test_fragmented_text_must_be_utf8() {
        let mut upstream = MockUpstream::start().await;
        let (addr, _state) = start_relay(relay_config(&upstream, Some("test-key"))).await;
        let mut browser = connect_browser(addr).await;
        next_browser_message(&mut browser).await;
        upstream.expect_setup_and_greeting().await;

        browser.send(fragment(&[0xe2, 0x82], OpCode::Data(Data::Text), false)).await.unwrap();
        browser.send(fragment(&[0xff], OpCode::Data(Data::Continue), true)).await.unwrap();

        let frame = expect_close(&mut browser).await;
        assert_eq!(frame.code, CloseCode::Invalid);
        assert!(matches!(upstream.next_received().await, Message::Close(_)));
    }

    #[actix_web::test]
    async fn test_silent_browser_is_dropped_after_client_timeout() {
        let mut upstream = MockUpstream::start().await;
        let mut config = relay_config(&upstream, Some("test-key"));
        config.relay.heartbeat_interval_secs = 1;
        config.relay.client_timeout_secs = 2;
        let (addr, state) = start_relay(config).await;

        // never read, so pings go unanswered
        let _browser = connect_browser(addr).await;
        upstream.expect_setup_and_greeting().await;

        match upstream.next_received().await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected upstream close, got {:?}", other),
        }
        wait_for_no_sessions(&state).await;
        assert_eq!(state.sessions.summary().sessions_completed, 1);
    }

    #[actix_web::test]
    async fn test_refused_upgrade_closes_browser_with_policy_violation() {
        for status in [401, 403] {
            let upstream = MockUpstream::start_with(MockMode::RejectHttp(status)).await;
            let (addr, state) = start_relay(relay_config(&upstream, Some("bad-key"))).await;
            let mut browser = connect_browser(addr).await;

            let frame = expect_close(&mut browser).await;
            assert_eq!(frame.code, CloseCode::Policy, "HTTP {}", status);
            assert!(frame.reason.contains(&status.to_string()));

            assert_eq!(upstream.connections.load(Ordering::SeqCst), 1);
            wait_for_no_sessions(&state).await;
            assert_eq!(state.sessions.summary().sessions_failed, 1);
        }
    }

    #[actix_web::test]
    async fn test_rejected_setup_closes_browser_and_holds_back_its_frames() {
        let mut upstream = MockUpstream::start_with(MockMode::CloseOnSetup).await;
        let (addr, state) = start_relay(relay_config(&upstream, Some("bad-key"))).await;
        let mut browser = connect_browser(addr).await;

        // sent while setup is still pending
        browser.send(Message::Binary(vec![1; 320])).await.unwrap();
        browser.send(Message::Text("{\"realtimeInput\":{\"text\":\"hi\"}}".into())).await.unwrap();

        let frame = expect_close(&mut browser).await;
        assert_eq!(frame.code, CloseCode::Policy);
        assert!(frame.reason.contains("API key not valid"));

        match upstream.next_received().await {
            Message::Text(text) => assert!(text.starts_with("{\"setup\"")),
            other => panic!("expected setup, got {:?}", other),
        }
        while let Ok(Some(msg)) = timeout(Duration::from_millis(500), upstream.received.recv()).await {
            assert!(matches!(msg, Message::Close(_)), "browser frame reached upstream: {:?}", msg);
        }

        wait_for_no_sessions(&state).await;
        let summary = state.sessions.summary();
        assert_eq!(summary.sessions_failed, 1);
        assert_eq!(summary.traffic.frames_up, 0);
    }

    #[actix_web::test]
    async fn test_browser_sends_its_own_setup_when_relay_skips_it() {
        let mut upstream = MockUpstream::start().await;
        let mut config = relay_config(&upstream, Some("test-key"));
        config.upstream.setup.enabled = false;
        let (addr, state) = start_relay(config).await;
        let mut browser = connect_browser(addr).await;

        let own_setup = "{\"setup\":{\"model\":\"models/browser-choice\"}}";
        browser.send(Message::Text(own_setup.into())).await.unwrap();

        // first thing upstream sees is the browser's frame, untouched
        assert_eq!(upstream.next_received().await, Message::Text(own_setup.into()));
        assert_eq!(
            next_browser_message(&mut browser).await,
            Message::Binary(b"{\"setupComplete\":{}}".to_vec())
        );

        browser.send(Message::Binary(vec![5; 64])).await.unwrap();
        assert_eq!(upstream.next_received().await, Message::Binary(vec![5; 64]));
        assert_eq!(state.sessions.summary().traffic.frames_up, 2);
    }
}
