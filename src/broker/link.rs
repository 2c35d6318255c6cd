//! # Worker Links
//!
//! One WebSocket connection to one worker, driven by two tasks:
//! - **sender**: pulls from the upstream queue and writes binary records, pinging when idle
//! - **receiver**: reads records, decodes them and pushes them downstream
//!
//! Both tasks run while the broker's [`Liveness`] flag is set. Either one clears the
//! flag when it stops, so a single broken link takes the whole session down.
//! Receive timeouts are not failures: the receiver re-checks liveness and reads again.

use super::liveness::Liveness;
use super::WorkerKind;
use crate::error::{PipelineError, PipelineResult};
use crate::models::ChatMessage;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;
pub type WsSource = SplitStream<WsStream>;

/// How long one bounded downstream send waits before re-checking liveness.
const DELIVERY_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub connect_timeout: Duration,
    pub receive_timeout: Duration,
    pub idle_poll: Duration,
    pub ping_interval: Duration,
}

/// Produces the records a link sends.
pub trait OutboundStage: Send + 'static {
    /// Record sent once, right after the connection opens.
    fn handshake(&mut self) -> PipelineResult<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Next record to send, waiting at most `wait`. `Ok(None)` means idle.
    fn next_message(
        &mut self,
        wait: Duration,
    ) -> impl Future<Output = PipelineResult<Option<Vec<u8>>>> + Send;
}

/// Turns received records into downstream items.
pub trait InboundStage: Send + 'static {
    type Item: Send + 'static;

    fn decode(&mut self, pack: &[u8]) -> PipelineResult<Vec<Self::Item>>;
}

/// Where a receiver puts what it decoded.
pub enum Downstream<T> {
    /// Backpressure: the receiver waits for room, re-checking liveness every second
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Downstream<T> {
    async fn deliver(&self, item: T, liveness: &Liveness) -> PipelineResult<()> {
        match self {
            Downstream::Bounded(tx) => {
                let mut item = item;
                loop {
                    match tx.send_timeout(item, DELIVERY_RETRY).await {
                        Ok(()) => return Ok(()),
                        Err(SendTimeoutError::Timeout(back)) => {
                            if !liveness.is_live() {
                                return Err(PipelineError::NotLive);
                            }
                            item = back;
                        }
                        Err(SendTimeoutError::Closed(_)) => {
                            return Err(PipelineError::ConnectionFailure("downstream queue closed".into()))
                        }
                    }
                }
            }
            Downstream::Unbounded(tx) => tx
                .send(item)
                .map_err(|_| PipelineError::ConnectionFailure("downstream queue closed".into())),
        }
    }
}

/// A running link: the two task handles of one worker connection.
pub struct WorkerLink {
    kind: WorkerKind,
    sender: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
}

impl WorkerLink {
    /// Connect to `url` and start the sender and receiver tasks.
    pub async fn open<O, I>(
        kind: WorkerKind,
        url: &str,
        outbound: O,
        inbound: I,
        downstream: Downstream<I::Item>,
        liveness: Liveness,
        errors: mpsc::UnboundedSender<ChatMessage>,
        settings: &LinkSettings,
    ) -> PipelineResult<Self>
    where
        O: OutboundStage,
        I: InboundStage,
    {
        let (sink, source) = connect(kind, url, settings.connect_timeout).await?;
        info!(worker = %kind, url, "Worker connected");

        let sender = tokio::spawn(
            run_sender(outbound, sink, liveness.clone(), FailureReport::new(kind, errors.clone()), settings.clone())
                .instrument(info_span!("sender", worker = %kind)),
        );
        let receiver = tokio::spawn(
            run_receiver(
                inbound,
                source,
                downstream,
                liveness,
                FailureReport::new(kind, errors),
                settings.receive_timeout,
            )
            .instrument(info_span!("receiver", worker = %kind)),
        );

        Ok(Self {
            kind,
            sender: Some(sender),
            receiver: Some(receiver),
        })
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Wait for both tasks to stop, aborting whatever is still running at `deadline`.
    ///
    /// Call only after liveness is cleared. Joining twice is a no-op.
    pub async fn join(&mut self, deadline: Instant) {
        for (role, handle) in [("sender", self.sender.take()), ("receiver", self.receiver.take())] {
            let Some(mut handle) = handle else { continue };
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(worker = %self.kind, role, error = %e, "Link task ended abnormally"),
                Err(_) => {
                    warn!(worker = %self.kind, role, "Link task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for WorkerLink {
    fn drop(&mut self) {
        for handle in [self.sender.take(), self.receiver.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

/// Tells the user why the session is going down.
struct FailureReport {
    kind: WorkerKind,
    captions: mpsc::UnboundedSender<ChatMessage>,
}

impl FailureReport {
    fn new(kind: WorkerKind, captions: mpsc::UnboundedSender<ChatMessage>) -> Self {
        Self { kind, captions }
    }

    fn send(&self, error: &PipelineError) {
        let message = format!("{} link failed: {}", self.kind, error);
        let _ = self.captions.send(ChatMessage::system_error(message));
    }
}

async fn connect(kind: WorkerKind, url: &str, connect_timeout: Duration) -> PipelineResult<(WsSink, WsSource)> {
    let (ws, _response) = timeout(connect_timeout, connect_async(url))
        .await
        .map_err(|_| PipelineError::Timeout(format!("connecting to {} at {}", kind, url)))?
        .map_err(|e| PipelineError::ConnectionFailure(format!("{} at {}: {}", kind, url, e)))?;
    Ok(ws.split())
}

async fn run_sender<O: OutboundStage>(
    mut stage: O,
    mut sink: WsSink,
    liveness: Liveness,
    report: FailureReport,
    settings: LinkSettings,
) {
    info!("Sender start");
    match sender_loop(&mut stage, &mut sink, &liveness, &settings).await {
        Ok(()) => info!("Sender cancelled by another task"),
        Err(PipelineError::NotLive) => info!("Upstream closed"),
        Err(e) if !liveness.is_live() => info!(error = %e, "Sender stopped during shutdown"),
        Err(e) => {
            error!(error = %e, "Sender failed");
            report.send(&e);
        }
    }
    // The worker may already be gone
    let _ = sink.close().await;
    liveness.clear("worker sender stopped");
    info!("Sender terminated");
}

async fn sender_loop<O: OutboundStage>(
    stage: &mut O,
    sink: &mut WsSink,
    liveness: &Liveness,
    settings: &LinkSettings,
) -> PipelineResult<()> {
    if let Some(first) = stage.handshake()? {
        sink.send(Message::Binary(first)).await?;
    }

    let mut last_activity = Instant::now();
    while liveness.is_live() {
        match stage.next_message(settings.idle_poll).await? {
            Some(pack) => {
                sink.send(Message::Binary(pack)).await?;
                last_activity = Instant::now();
            }
            None => {
                if last_activity.elapsed() >= settings.ping_interval {
                    debug!("Idle, sending ping");
                    sink.send(Message::Ping(Vec::new())).await?;
                    last_activity = Instant::now();
                }
            }
        }
    }
    Ok(())
}

async fn run_receiver<I: InboundStage>(
    mut stage: I,
    mut source: WsSource,
    downstream: Downstream<I::Item>,
    liveness: Liveness,
    report: FailureReport,
    receive_timeout: Duration,
) {
    info!("Receiver start");
    match receiver_loop(&mut stage, &mut source, &downstream, &liveness, receive_timeout).await {
        Ok(()) => info!("Receiver cancelled by another task"),
        Err(e) if !liveness.is_live() => info!(error = %e, "Receiver stopped during shutdown"),
        Err(e) => {
            error!(error = %e, "Receiver failed");
            report.send(&e);
        }
    }
    liveness.clear("worker receiver stopped");
    info!("Receiver terminated");
}

async fn receiver_loop<I: InboundStage>(
    stage: &mut I,
    source: &mut WsSource,
    downstream: &Downstream<I::Item>,
    liveness: &Liveness,
    receive_timeout: Duration,
) -> PipelineResult<()> {
    while liveness.is_live() {
        let message = match timeout(receive_timeout, source.next()).await {
            Err(_) => continue,
            Ok(None) => return Err(PipelineError::ConnectionFailure("connection closed".into())),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Binary(pack) => {
                for item in stage.decode(&pack)? {
                    downstream.deliver(item, liveness).await?;
                }
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(frame) => {
                return Err(PipelineError::ConnectionFailure(format!("closed by worker: {:?}", frame)))
            }
            other => {
                return Err(PipelineError::ProtocolViolation(format!(
                    "expected a binary record, got {:?}",
                    other
                )))
            }
        }
    }
    Ok(())
}
