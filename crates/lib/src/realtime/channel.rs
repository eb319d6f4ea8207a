//! The single duplex WebSocket connection per authenticated session.
//!
//! One supervisor task per open channel: connect with `?token=`, pump frames
//! both ways, and on an unexpected drop back off and reconnect while the
//! session stays authenticated. Logout or a 401 (seen through the session
//! watch) ends the task; a token change closes and reopens.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::protocol::{decode_server_event, ClientEvent, DeadLetter, ServerEvent};
use super::EventSink;
use crate::config::RealtimeConfig;
use crate::error::ClientError;
use crate::session::{Session, SessionContext};
use crate::token::Token;

/// Most recent undecodable frames kept for diagnostics.
const DEAD_LETTER_CAPACITY: usize = 64;
const TRANSITION_BUFFER: usize = 32;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    /// Waiting out backoff (or connecting) after a drop; `attempt` counts from 1.
    Reconnecting { attempt: u32 },
}

/// Why a connected pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Shutdown,
    SessionEnded,
    TokenChanged,
    Dropped,
}

struct Worker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Realtime channel. Create once, share as `Arc`.
///
/// `state` is written only by this type.
pub struct RealtimeChannel {
    ws_url: String,
    ctx: SessionContext,
    config: RealtimeConfig,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    events: broadcast::Sender<ServerEvent>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    worker: Mutex<Option<Worker>>,
    /// Counts sockets that reached Open.
    connection: AtomicU64,
}

impl RealtimeChannel {
    pub fn new(ws_url: impl Into<String>, ctx: SessionContext, config: RealtimeConfig) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Arc::new(Self {
            ws_url: ws_url.into(),
            ctx,
            config,
            state,
            transitions,
            outbound: Mutex::new(None),
            events,
            dead_letters: Mutex::new(VecDeque::new()),
            worker: Mutex::new(None),
            connection: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Latest state; intermediate states may be coalesced.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Every state transition in order.
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// Inbound events in transport order. Events before subscription are not replayed.
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.dead_letters).iter().cloned().collect()
    }

    /// Start the connection for the current session.
    ///
    /// Fails with `Unauthorized` when the session is not authenticated and
    /// `AlreadyConnected` when a supervisor is already running.
    pub fn open(self: &Arc<Self>) -> Result<(), ClientError> {
        if !self.ctx.is_authenticated() {
            return Err(ClientError::Unauthorized);
        }
        reqwest::Url::parse(&self.ws_url)
            .map_err(|e| ClientError::Config(format!("invalid ws url {}: {}", self.ws_url, e)))?;
        let mut slot = lock(&self.worker);
        if let Some(w) = slot.as_ref() {
            if !w.handle.is_finished() {
                return Err(ClientError::AlreadyConnected);
            }
        }
        let (shutdown, shutdown_rx) = oneshot::channel();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(shutdown_rx).await });
        *slot = Some(Worker { shutdown, handle });
        Ok(())
    }

    /// Stop the supervisor and wait for it. Idempotent.
    pub async fn close(&self) {
        let worker = lock(&self.worker).take();
        if let Some(Worker { shutdown, handle }) = worker {
            let _ = shutdown.send(());
            if let Err(e) = handle.await {
                log::warn!("realtime worker ended abnormally: {}", e);
            }
        }
        self.set_state(ConnectionState::Closed);
    }

    /// Queue a frame if open; otherwise drop it. Returns whether it was queued.
    pub fn send(&self, event: ClientEvent) -> bool {
        if self.state() != ConnectionState::Open {
            log::debug!("realtime not open; dropping outbound {:?}", event);
            return false;
        }
        let text = match event.to_json() {
            Ok(t) => t,
            Err(e) => {
                log::warn!("failed to encode outbound event: {}", e);
                return false;
            }
        };
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|s| {
            if *s == next {
                false
            } else {
                *s = next;
                true
            }
        });
        if changed {
            log::debug!("realtime state -> {:?}", next);
            let _ = self.transitions.send(next);
        }
    }

    fn target(&self, token: &Token) -> Result<String, ClientError> {
        let mut url = reqwest::Url::parse(&self.ws_url)
            .map_err(|e| ClientError::Config(format!("invalid ws url {}: {}", self.ws_url, e)))?;
        url.query_pairs_mut().append_pair("token", token.as_str());
        Ok(url.to_string())
    }

    fn dead_letter(&self, letter: DeadLetter) {
        log::warn!("dropping realtime frame: {}", letter.reason);
        let mut ring = lock(&self.dead_letters);
        if ring.len() == DEAD_LETTER_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(letter);
    }

    async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let mut session_rx = self.ctx.subscribe();
        let backoff = self.config.backoff();
        let mut established = false;
        // 0 = fresh connect, n = n-th reconnect attempt after a drop
        let mut retry: u32 = 0;

        loop {
            let version = {
                let s = session_rx.borrow_and_update();
                if !s.is_authenticated() {
                    break;
                }
                s.token_version
            };
            let Some(token) = self.ctx.token() else { break };

            if retry > 0 {
                if let Some(max) = self.config.max_reconnect_attempts {
                    if retry > max {
                        log::warn!("realtime: giving up after {} reconnect attempts", max);
                        break;
                    }
                }
                self.set_state(ConnectionState::Reconnecting { attempt: retry });
                let delay = backoff.delay(retry);
                if !wait_backoff(delay, &mut session_rx, &mut shutdown).await {
                    break;
                }
            } else {
                self.set_state(ConnectionState::Connecting);
            }

            let url = match self.target(&token) {
                Ok(u) => u,
                Err(e) => {
                    log::warn!("realtime: {}", e);
                    break;
                }
            };
            let connected = tokio::select! {
                _ = &mut shutdown => break,
                res = tokio_tungstenite::connect_async(url) => res,
            };
            let ws = match connected {
                Ok((ws, _)) => ws,
                Err(e) => {
                    if !established {
                        log::warn!("realtime connect failed: {}", e);
                        break;
                    }
                    log::debug!("realtime reconnect attempt {} failed: {}", retry, e);
                    retry += 1;
                    continue;
                }
            };
            established = true;
            retry = 0;
            log::info!("realtime connected");

            match self.pump(ws, version, &mut session_rx, &mut shutdown).await {
                Exit::Shutdown | Exit::SessionEnded => break,
                Exit::TokenChanged => {
                    log::info!("realtime: token changed, reopening");
                    self.set_state(ConnectionState::Closed);
                }
                Exit::Dropped => {
                    log::warn!("realtime connection dropped");
                    self.set_state(ConnectionState::Closed);
                    retry = 1;
                }
            }
        }
        *lock(&self.outbound) = None;
        self.set_state(ConnectionState::Closed);
    }

    async fn pump(
        &self,
        ws: WsStream,
        version: u64,
        session_rx: &mut watch::Receiver<Session>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Exit {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *lock(&self.outbound) = Some(tx);

        // the session may have moved while we were connecting
        let mut exit = session_verdict(&session_rx.borrow_and_update(), version);
        if exit.is_none() {
            self.connection.fetch_add(1, Ordering::SeqCst);
            self.set_state(ConnectionState::Open);
        }

        while exit.is_none() {
            tokio::select! {
                _ = &mut *shutdown => exit = Some(Exit::Shutdown),
                changed = session_rx.changed() => {
                    exit = match changed {
                        Ok(()) => session_verdict(&session_rx.borrow_and_update(), version),
                        Err(_) => Some(Exit::SessionEnded),
                    };
                }
                Some(text) = rx.recv() => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        log::debug!("realtime send failed: {}", e);
                        exit = Some(Exit::Dropped);
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => match decode_server_event(&text) {
                        Ok(ev) => {
                            log::debug!("realtime <- {}", ev.kind());
                            let _ = self.events.send(ev);
                        }
                        Err(letter) => self.dead_letter(letter),
                    },
                    Some(Ok(Message::Binary(bytes))) => {
                        self.dead_letter(DeadLetter::new(
                            String::from_utf8_lossy(&bytes),
                            "binary frame",
                        ));
                    }
                    Some(Ok(Message::Close(_))) | None => exit = Some(Exit::Dropped),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("realtime read error: {}", e);
                        exit = Some(Exit::Dropped);
                    }
                },
            }
        }

        *lock(&self.outbound) = None;
        let exit = exit.unwrap_or(Exit::Dropped);
        if exit != Exit::Dropped {
            let _ = sink.send(Message::Close(None)).await;
        }
        exit
    }
}

impl EventSink for RealtimeChannel {
    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn send(&self, event: ClientEvent) -> bool {
        RealtimeChannel::send(self, event)
    }

    fn connection(&self) -> u64 {
        self.connection.load(Ordering::SeqCst)
    }
}

fn session_verdict(session: &Session, version: u64) -> Option<Exit> {
    if !session.is_authenticated() {
        Some(Exit::SessionEnded)
    } else if session.token_version != version {
        Some(Exit::TokenChanged)
    } else {
        None
    }
}

/// Sleep `delay` unless shut down or logged out first. Returns false to stop.
async fn wait_backoff(
    delay: Duration,
    session_rx: &mut watch::Receiver<Session>,
    shutdown: &mut oneshot::Receiver<()>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            _ = &mut *shutdown => return false,
            changed = session_rx.changed() => {
                if changed.is_err() || !session_rx.borrow_and_update().is_authenticated() {
                    return false;
                }
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}
