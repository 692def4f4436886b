//! # Session Bridge
//!
//! Pumps frames between one browser connection and one upstream connection.
//!
//! ```text
//!   browser actor ──uplink (unbounded)──▶ [uplink task] ──▶ upstream sink
//!   browser actor ◀──downlink (bounded)── [downlink task] ◀── upstream stream
//! ```
//!
//! The two directions run as separate tokio tasks so a slow browser never
//! blocks audio going up, and a quiet upstream never blocks audio going down.
//! Whichever task finishes first ends the session. When upstream ends it, the
//! uplink task is told to stop and gets a short grace period to complete the
//! close handshake; otherwise the other task is aborted and awaited. The browser
//! then gets a close notice.
//!
//! Frames are forwarded as-is. Nothing here parses, buffers or reorders them.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::relay::frame::{browser_gone_frame, CloseNotice, Frame};
use crate::relay::session::{SessionGuard, SessionStats};
use crate::relay::upstream::{self, Connected};

/// How long the uplink task gets to flush the upstream close handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// What the bridge asks the browser side to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Frame),
    Close(CloseNotice),
}

/// Why a bridged session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    BrowserClosed,
    UpstreamClosed(CloseNotice),
    UpstreamError(String),
}

impl SessionEnd {
    pub fn close_notice(&self) -> CloseNotice {
        match self {
            SessionEnd::BrowserClosed => CloseNotice::normal("browser disconnected"),
            SessionEnd::UpstreamClosed(notice) => notice.clone(),
            SessionEnd::UpstreamError(err) => CloseNotice::new(CloseNotice::INTERNAL_ERROR, err.as_str()),
        }
    }

    fn from_join(result: Result<SessionEnd, JoinError>) -> SessionEnd {
        result.unwrap_or_else(|e| SessionEnd::UpstreamError(format!("relay task failed: {}", e)))
    }
}

/// Relay frames in both directions until either side goes away.
pub async fn run_bridge<S>(
    upstream: S,
    uplink: mpsc::UnboundedReceiver<Frame>,
    downlink: mpsc::Sender<Outbound>,
    stats: Arc<SessionStats>,
) -> SessionEnd
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Send
        + 'static,
{
    let (sink, stream) = upstream.split();

    let (stop_tx, stop_rx) = oneshot::channel();

    let mut uplink_task = tokio::spawn(pump_uplink(uplink, sink, stop_rx, stats.clone()));
    let mut downlink_task = tokio::spawn(pump_downlink(stream, downlink, stats));

    tokio::select! {
        result = &mut uplink_task => finish(result, downlink_task).await,
        result = &mut downlink_task => {
            // The uplink owns the sink, so it has to be the one to answer the close
            let _ = stop_tx.send(());
            match timeout(CLOSE_GRACE, &mut uplink_task).await {
                Ok(_) => SessionEnd::from_join(result),
                Err(_) => {
                    debug!("Upstream close handshake did not finish in time");
                    finish(result, uplink_task).await
                }
            }
        }
    }
}

async fn finish(result: Result<SessionEnd, JoinError>, other: JoinHandle<SessionEnd>) -> SessionEnd {
    other.abort();
    // Wait for the abort so both socket halves are gone when we return
    let _ = other.await;
    SessionEnd::from_join(result)
}

async fn pump_uplink<K>(
    mut uplink: mpsc::UnboundedReceiver<Frame>,
    mut sink: K,
    mut stop: oneshot::Receiver<()>,
    stats: Arc<SessionStats>,
) -> SessionEnd
where
    K: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut stop => None,
            frame = uplink.recv() => frame,
        };
        // Browser side dropped its sender, or the downlink already ended
        let Some(frame) = frame else { break };

        let len = frame.len();
        if let Err(e) = sink.send(frame.into()).await {
            let _ = sink.close().await;
            return SessionEnd::UpstreamError(e.to_string());
        }
        stats.record_uplink(len);
    }

    close_upstream(&mut sink).await;
    SessionEnd::BrowserClosed
}

/// Send our close frame and flush. If upstream closed first, this flushes the
/// queued reply instead.
async fn close_upstream<K>(sink: &mut K)
where
    K: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    if let Err(e) = sink.send(Message::Close(Some(browser_gone_frame()))).await {
        debug!("Upstream close frame not delivered: {}", e);
    }
    let _ = sink.close().await;
}

/// Pass the frames received during setup to the browser.
///
/// Returns false, after closing upstream, when the browser is already gone.
async fn forward_early_frames<K>(
    socket: &mut K,
    early_frames: Vec<Frame>,
    downlink: &mpsc::Sender<Outbound>,
    stats: &SessionStats,
) -> bool
where
    K: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    for frame in early_frames {
        let len = frame.len();
        if downlink.send(Outbound::Frame(frame)).await.is_err() {
            close_upstream(socket).await;
            return false;
        }
        stats.record_downlink(len);
    }
    true
}

async fn pump_downlink<T>(
    mut stream: T,
    downlink: mpsc::Sender<Outbound>,
    stats: Arc<SessionStats>,
) -> SessionEnd
where
    T: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Close(frame)) => return SessionEnd::UpstreamClosed(CloseNotice::from_upstream(frame)),
            Ok(msg) => {
                let Some(frame) = Frame::from_upstream(msg) else {
                    continue;
                };
                let len = frame.len();
                if downlink.send(Outbound::Frame(frame)).await.is_err() {
                    return SessionEnd::BrowserClosed;
                }
                stats.record_downlink(len);
            }
            Err(e) => return SessionEnd::UpstreamError(e.to_string()),
        }
    }
    SessionEnd::UpstreamClosed(CloseNotice::new(CloseNotice::GOING_AWAY, "upstream connection ended"))
}

/// Full lifetime of one session: connect upstream, bridge, tell the browser how it ended.
///
/// The guard keeps the session registered until this returns.
pub async fn run_session(
    config: Arc<AppConfig>,
    mut guard: SessionGuard,
    uplink: mpsc::UnboundedReceiver<Frame>,
    downlink: mpsc::Sender<Outbound>,
) {
    let session_id = guard.id();

    let connected = tokio::select! {
        result = upstream::connect(&config.upstream) => result,
        _ = downlink.closed() => {
            info!(session_id = %session_id, "Browser left before upstream was ready");
            return;
        }
    };

    let Connected { mut socket, early_frames } = match connected {
        Ok(connected) => connected,
        Err(err) => {
            warn!(session_id = %session_id, error = %err, "Session failed to open");
            guard.mark_failed();
            let _ = downlink.send(Outbound::Close(err.close_notice())).await;
            return;
        }
    };

    guard.mark_open();
    info!(session_id = %session_id, "Session open");

    let stats = guard.session().stats();
    if !forward_early_frames(&mut socket, early_frames, &downlink, &stats).await {
        info!(session_id = %session_id, "Browser left during setup");
        return;
    }

    let end = run_bridge(socket, uplink, downlink.clone(), stats.clone()).await;
    if matches!(end, SessionEnd::UpstreamError(_)) {
        guard.mark_failed();
    }

    let traffic = stats.snapshot();
    info!(
        session_id = %session_id,
        end = ?end,
        frames_up = traffic.frames_up,
        frames_down = traffic.frames_down,
        "Session closed"
    );

    let _ = downlink.send(Outbound::Close(end.close_notice())).await;
}
