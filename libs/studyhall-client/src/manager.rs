//! Gateway connection lifecycle: connect/reconnect state machine, the
//! online-user mirror, and scoped conversation subscriptions.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use studyhall_common::protocol::{close_code, DirectMessage, ServerEvent};

use crate::config::ClientConfig;
use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of the managed connection.
///
/// `Connecting` covers the initial attempt sequence; `Reconnecting` covers
/// automatic recovery after an unexpected drop. Both resolve to `Connected`
/// or, when the retry budget runs out, back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
}

/// One live session: the driver task plus the flag that stops it.
struct Session {
    user_id: String,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The currently open conversation's delivery hook.
struct ActiveConversation {
    id: u64,
    peer_id: String,
    seen: HashSet<String>,
    tx: mpsc::UnboundedSender<DirectMessage>,
}

struct Inner {
    config: ClientConfig,
    state_tx: watch::Sender<ConnectionState>,
    online_tx: watch::Sender<Vec<String>>,
    session: Mutex<Option<Session>>,
    conversation: Mutex<Option<ActiveConversation>>,
    conversation_seq: AtomicU64,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send_replace(state);
    }

    fn clear_online(&self) {
        let _ = self.online_tx.send_replace(Vec::new());
    }

    /// Apply one server event. The online mirror is written here and nowhere
    /// else (disconnect resets aside); each presence delivery replaces the
    /// whole set.
    fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::PresenceUpdate(users) => {
                let _ = self.online_tx.send_replace(users);
            }
            ServerEvent::NewMessage(message) => {
                let mut conversation = self.conversation.lock();
                if let Some(active) = conversation.as_mut() {
                    if active.peer_id != message.sender_id {
                        return;
                    }
                    if !active.seen.insert(message.id.clone()) {
                        return;
                    }
                    if active.tx.send(message).is_err() {
                        *conversation = None;
                    }
                }
            }
        }
    }
}

/// Manages a single gateway connection for an authenticated user.
///
/// Cheap to share (`Clone` clones the handle, not the connection). All
/// methods are safe to call in any state; see each for its idempotency
/// rules.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl GatewayClient {
    pub fn new(config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (online_tx, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Inner {
                config,
                state_tx,
                online_tx,
                session: Mutex::new(None),
                conversation: Mutex::new(None),
                conversation_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Observe the connection state machine.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Observe the online-user mirror. Populated solely from
    /// `presence.update` broadcasts; empty whenever disconnected.
    pub fn online_users(&self) -> watch::Receiver<Vec<String>> {
        self.inner.online_tx.subscribe()
    }

    /// Open (or keep) the gateway connection for `user_id`.
    ///
    /// Calling this again for the same user while the session is alive is a
    /// no-op; it never creates a second socket. Connecting as a different
    /// user tears the existing session down first (account switch). Resolves
    /// once the initial attempt sequence succeeds or exhausts its retry
    /// budget.
    pub async fn connect(&self, user_id: &str) -> Result<(), ClientError> {
        let previous = {
            let mut session = self.inner.session.lock();
            let same_user_alive = matches!(
                session.as_ref(),
                Some(s) if s.user_id == user_id && !s.task.is_finished()
            );
            if same_user_alive {
                return Ok(());
            }
            session.take()
        };
        if let Some(previous) = previous {
            shutdown_session(previous).await;
            self.inner.conversation.lock().take();
            self.inner.clear_online();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(drive(
            self.inner.clone(),
            user_id.to_string(),
            shutdown_rx,
            ready_tx,
        ));
        *self.inner.session.lock() = Some(Session {
            user_id: user_id.to_string(),
            shutdown_tx,
            task,
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.inner.session.lock().take();
                Err(err)
            }
            Err(_) => {
                self.inner.session.lock().take();
                Err(ClientError::ConnectFailed { attempts: 0 })
            }
        }
    }

    /// Close the connection, drop all feature listeners, and clear local
    /// presence state. A no-op when already disconnected.
    pub async fn disconnect(&self) {
        let Some(session) = self.inner.session.lock().take() else {
            return;
        };
        shutdown_session(session).await;
        self.inner.conversation.lock().take();
        self.inner.clear_online();
        self.inner.set_state(ConnectionState::Idle);
    }

    /// Start receiving direct messages from `peer_id`.
    ///
    /// Installing a subscription replaces any existing one, so switching
    /// conversations always nets to exactly one active listener. The
    /// returned guard deregisters on drop, but only if it is still the
    /// current subscription, so dropping a stale guard cannot clear its
    /// successor.
    pub fn subscribe_conversation(&self, peer_id: &str) -> Subscription {
        let id = self.inner.conversation_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.conversation.lock() = Some(ActiveConversation {
            id,
            peer_id: peer_id.to_string(),
            seen: HashSet::new(),
            tx,
        });
        Subscription {
            id,
            peer_id: peer_id.to_string(),
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Messages from one conversation peer, delivered while this guard lives.
pub struct Subscription {
    id: u64,
    peer_id: String,
    rx: mpsc::UnboundedReceiver<DirectMessage>,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn recv(&mut self) -> Option<DirectMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DirectMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut conversation = inner.conversation.lock();
            if conversation.as_ref().map(|a| a.id) == Some(self.id) {
                *conversation = None;
            }
        }
    }
}

async fn shutdown_session(session: Session) {
    let _ = session.shutdown_tx.send(true);
    let _ = session.task.await;
}

/// Why the socket read loop returned.
enum SocketExit {
    /// `disconnect()` asked us to stop.
    Shutdown,
    /// The server closed us with the superseded code: a newer connection
    /// for this user took over. Reconnecting would start an eviction loop.
    Superseded,
    /// Any other close, read error, or stream end: eligible for reconnect.
    Dropped,
}

/// The driver task: owns the socket for the session's lifetime, applying the
/// bounded retry policy between attempts. `ready` resolves the caller's
/// `connect()` once the initial sequence succeeds or gives up.
async fn drive(
    inner: Arc<Inner>,
    user_id: String,
    mut shutdown: watch::Receiver<bool>,
    ready: oneshot::Sender<Result<(), ClientError>>,
) {
    let mut ready = Some(ready);
    let mut attempt: u32 = 0;
    let url = format!("{}?user_id={}", inner.config.gateway_url, user_id);

    loop {
        inner.set_state(if ready.is_some() {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });

        let attempt_result = tokio::select! {
            _ = shutdown.changed() => break,
            result = time::timeout(inner.config.connect_timeout, connect_async(&url)) => result,
        };

        match attempt_result {
            Ok(Ok((stream, _response))) => {
                attempt = 0;
                inner.set_state(ConnectionState::Connected);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
                tracing::debug!(%user_id, "gateway connected");

                match read_socket(&inner, stream, &mut shutdown).await {
                    SocketExit::Shutdown => break,
                    SocketExit::Superseded => {
                        tracing::info!(%user_id, "session superseded by a newer connection");
                        break;
                    }
                    SocketExit::Dropped => {
                        tracing::debug!(%user_id, "gateway connection dropped");
                        inner.clear_online();
                        continue;
                    }
                }
            }
            Ok(Err(err)) => {
                tracing::debug!(?err, "gateway connect failed");
            }
            Err(_elapsed) => {
                tracing::debug!("gateway connect timed out");
            }
        }

        attempt += 1;
        if attempt >= inner.config.reconnect.max_attempts {
            tracing::warn!(%user_id, attempts = attempt, "gateway retry budget exhausted");
            if let Some(tx) = ready.take() {
                let _ = tx.send(Err(ClientError::ConnectFailed { attempts: attempt }));
            }
            break;
        }
        let delay = inner.config.reconnect.delay_for(attempt);
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = time::sleep(delay) => {}
        }
    }

    inner.clear_online();
    inner.set_state(ConnectionState::Idle);
}

async fn read_socket(
    inner: &Inner,
    mut stream: WsStream,
    shutdown: &mut watch::Receiver<bool>,
) -> SocketExit {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = stream.close(None).await;
                return SocketExit::Shutdown;
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => inner.handle_event(event),
                            Err(err) => {
                                tracing::debug!(?err, "ignoring unparseable gateway frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if stream.send(Message::Pong(payload)).await.is_err() {
                            return SocketExit::Dropped;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(frame) = &frame {
                            if frame.code == CloseCode::from(close_code::SUPERSEDED) {
                                return SocketExit::Superseded;
                            }
                        }
                        return SocketExit::Dropped;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(?err, "gateway read error");
                        return SocketExit::Dropped;
                    }
                    None => return SocketExit::Dropped,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn client() -> GatewayClient {
        GatewayClient::new(ClientConfig::new("ws://localhost:0/gateway"))
    }

    fn message(id: &str, sender: &str) -> DirectMessage {
        DirectMessage {
            id: id.to_string(),
            sender_id: sender.to_string(),
            recipient_id: "me".to_string(),
            content: "hello".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn presence_update_replaces_mirror_wholesale() {
        let client = client();
        let online = client.online_users();

        client.inner.handle_event(ServerEvent::PresenceUpdate(vec![
            "alice".to_string(),
            "bob".to_string(),
        ]));
        assert_eq!(*online.borrow(), vec!["alice".to_string(), "bob".to_string()]);

        // A later, smaller set is a full replacement, not a merge.
        client
            .inner
            .handle_event(ServerEvent::PresenceUpdate(vec!["bob".to_string()]));
        assert_eq!(*online.borrow(), vec!["bob".to_string()]);
    }

    #[test]
    fn delivers_only_messages_from_the_subscribed_peer() {
        let client = client();
        let mut sub = client.subscribe_conversation("bob");

        client
            .inner
            .handle_event(ServerEvent::NewMessage(message("msg_1", "bob")));
        client
            .inner
            .handle_event(ServerEvent::NewMessage(message("msg_2", "carol")));

        assert_eq!(sub.try_recv().unwrap().id, "msg_1");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn duplicate_message_ids_are_suppressed() {
        let client = client();
        let mut sub = client.subscribe_conversation("bob");

        client
            .inner
            .handle_event(ServerEvent::NewMessage(message("msg_1", "bob")));
        client
            .inner
            .handle_event(ServerEvent::NewMessage(message("msg_1", "bob")));

        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn switching_conversations_nets_exactly_one_listener() {
        let client = client();
        let mut sub_a = client.subscribe_conversation("bob");
        let mut sub_b = client.subscribe_conversation("carol");

        // Only the latest subscription is live.
        client
            .inner
            .handle_event(ServerEvent::NewMessage(message("msg_1", "bob")));
        client
            .inner
            .handle_event(ServerEvent::NewMessage(message("msg_2", "carol")));
        assert!(sub_a.try_recv().is_none());
        assert_eq!(sub_b.try_recv().unwrap().id, "msg_2");

        // Switching back: one listener again, one delivery.
        let mut sub_c = client.subscribe_conversation("bob");
        client
            .inner
            .handle_event(ServerEvent::NewMessage(message("msg_3", "bob")));
        assert_eq!(sub_c.try_recv().unwrap().id, "msg_3");
        assert!(sub_b.try_recv().is_none());
    }

    #[test]
    fn dropping_a_stale_guard_keeps_the_current_listener() {
        let client = client();
        let sub_a = client.subscribe_conversation("bob");
        let mut sub_b = client.subscribe_conversation("carol");

        drop(sub_a);

        client
            .inner
            .handle_event(ServerEvent::NewMessage(message("msg_1", "carol")));
        assert_eq!(sub_b.try_recv().unwrap().id, "msg_1");
    }

    #[test]
    fn dropping_the_current_guard_deregisters_it() {
        let client = client();
        let sub = client.subscribe_conversation("bob");
        drop(sub);

        assert!(client.inner.conversation.lock().is_none());
        // Delivery with no listener is a quiet drop.
        client
            .inner
            .handle_event(ServerEvent::NewMessage(message("msg_1", "bob")));
    }
}
