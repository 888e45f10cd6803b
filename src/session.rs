//! Session manager: the central event loop.
//!
//! One task owns all session state: the outbound request queue, the table of
//! requests awaiting acknowledgement, the active subscription handlers, and
//! the heartbeat. The logical session (identified by a server-assigned
//! connection id) outlives individual transport connections; on reconnect the
//! queue is rebuilt so that resubscriptions and unacknowledged requests are
//! replayed before newer work.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::Cache;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::network::{self, Connector, NetworkEvent, NetworkHandle};
use crate::protocol::{ClientRequest, ServerMessage, HEARTBEAT_INTERVAL_SECS};
use crate::protocol::DEFAULT_TIMEOUT_SECS;
use crate::query::Query;
use crate::subscription::{Listener, SubscriptionHandler, SubscriptionState, SubscriptionUpdate};

/// Queue insertion priority. Connection requests are high, auth is medium,
/// everything else is low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Priority {
    Low,
    Medium,
    High,
}

/// What to do when a request completes (ack, error, or timeout).
enum Completion {
    None,
    Done(oneshot::Sender<Result<()>>),
    /// `token` of `None` is a deauthorization. Overlapping authorize calls
    /// for one token coalesce onto a single request, so several waiters may
    /// resolve on one ack.
    Auth {
        token: Option<String>,
        waiters: Vec<oneshot::Sender<Result<()>>>,
    },
    Fetch {
        fetch_id: String,
    },
    Subscribe {
        subscription_id: String,
    },
    Unsubscribe {
        subscription_id: String,
    },
}

struct QueuedRequest {
    entry_id: u64,
    request: ClientRequest,
    priority: Priority,
    completion: Completion,
    timer: Option<JoinHandle<()>>,
    enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Reply to a subscribe command: the listener's receiving end plus the ids
/// needed to detach it later.
pub(crate) struct SubscribeReply {
    pub subscription_id: String,
    pub listener_id: u64,
    pub rx: mpsc::UnboundedReceiver<Result<SubscriptionUpdate>>,
}

pub(crate) enum SessionCommand {
    /// Mutations, merges, deletes: fire a request, resolve on ack/error.
    Write {
        request: ClientRequest,
        done: oneshot::Sender<Result<()>>,
    },
    Fetch {
        collection_id: String,
        query: Query,
        done: oneshot::Sender<Result<Vec<Document>>>,
    },
    Subscribe {
        collection_id: String,
        query: Query,
        done: oneshot::Sender<SubscribeReply>,
    },
    RemoveListener {
        subscription_id: String,
        listener_id: u64,
    },
    Authorize {
        token: String,
        done: oneshot::Sender<Result<()>>,
    },
    Deauthorize {
        done: oneshot::Sender<Result<()>>,
    },
    GoOnline,
    GoOffline,
    Destroy,
    /// Internal: a request timer elapsed.
    TimedOut { entry_id: u64 },
    /// Internal: cache lookup finished for a fresh subscription.
    CacheLoaded {
        subscription_id: String,
        documents: Vec<Document>,
    },
}

/// Everything needed to spawn a session.
pub(crate) struct SessionConfig {
    pub url: String,
    pub connector: Arc<dyn Connector>,
    pub cache: Option<Cache>,
    pub auth_token: Option<String>,
    pub request_timeout: Option<Duration>,
    pub heartbeat_interval: Duration,
}

impl SessionConfig {
    pub fn default_heartbeat() -> Duration {
        Duration::from_secs(HEARTBEAT_INTERVAL_SECS)
    }
}

/// Cloneable handle to the session task.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn spawn(config: SessionConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let network = network::spawn(config.url.clone(), config.connector.clone(), net_tx);
        let session = Session::new(config, network, tx.clone());
        tokio::spawn(run(session, rx, net_rx));
        Self { tx }
    }

    fn send(&self, command: SessionCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| Error::ChannelClosed)
    }

    pub async fn write(&self, request: ClientRequest) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(SessionCommand::Write { request, done })?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    pub async fn fetch(&self, collection_id: String, query: Query) -> Result<Vec<Document>> {
        let (done, rx) = oneshot::channel();
        self.send(SessionCommand::Fetch { collection_id, query, done })?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    pub async fn subscribe(&self, collection_id: String, query: Query) -> Result<SubscribeReply> {
        let (done, rx) = oneshot::channel();
        self.send(SessionCommand::Subscribe { collection_id, query, done })?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    pub fn remove_listener(&self, subscription_id: String, listener_id: u64) {
        let _ = self.send(SessionCommand::RemoveListener { subscription_id, listener_id });
    }

    pub async fn authorize(&self, token: String) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(SessionCommand::Authorize { token, done })?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    pub async fn deauthorize(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(SessionCommand::Deauthorize { done })?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    pub fn go_online(&self) {
        let _ = self.send(SessionCommand::GoOnline);
    }

    pub fn go_offline(&self) {
        let _ = self.send(SessionCommand::GoOffline);
    }

    pub fn destroy(&self) {
        let _ = self.send(SessionCommand::Destroy);
    }
}

struct Session {
    state: ConnectionState,
    connection_id: Option<String>,
    auth_token: Option<String>,
    queue: VecDeque<QueuedRequest>,
    /// event id -> request awaiting ack/error.
    pending: HashMap<String, QueuedRequest>,
    /// subscription id -> handler.
    subscriptions: HashMap<String, SubscriptionHandler>,
    /// subscription hash -> subscription id; injective by construction.
    hash_index: HashMap<String, String>,
    /// fetch id -> response channel.
    pending_fetches: HashMap<String, oneshot::Sender<Result<Vec<Document>>>>,
    cache: Option<Cache>,
    request_timeout: Option<Duration>,
    heartbeat_interval: Duration,
    heartbeat_deadline: Instant,
    network: NetworkHandle,
    self_tx: mpsc::UnboundedSender<SessionCommand>,
    next_entry_id: u64,
    next_listener_id: u64,
    next_registration_seq: u64,
}

enum Flow {
    Continue,
    Quit,
}

async fn run(
    mut session: Session,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    mut net_events: mpsc::UnboundedReceiver<NetworkEvent>,
) {
    session.state = ConnectionState::Connecting;
    session.network.go_online();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => {
                    if let Flow::Quit = session.handle_command(command) {
                        break;
                    }
                }
                None => {
                    session.teardown();
                    break;
                }
            },
            event = net_events.recv() => match event {
                Some(event) => session.handle_network(event),
                None => break,
            },
            _ = tokio::time::sleep_until(session.heartbeat_deadline),
                if session.state == ConnectionState::Connected =>
            {
                session.heartbeat_fired();
            }
        }
    }
}

impl Session {
    fn new(
        config: SessionConfig,
        network: NetworkHandle,
        self_tx: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connection_id: None,
            auth_token: config.auth_token,
            queue: VecDeque::new(),
            pending: HashMap::new(),
            subscriptions: HashMap::new(),
            hash_index: HashMap::new(),
            pending_fetches: HashMap::new(),
            cache: config.cache,
            request_timeout: config.request_timeout,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_deadline: Instant::now() + config.heartbeat_interval,
            network,
            self_tx,
            next_entry_id: 0,
            next_listener_id: 0,
            next_registration_seq: 0,
        }
    }

    // ------------------------------------------------------------------
    // Command handling
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: SessionCommand) -> Flow {
        match command {
            SessionCommand::Write { request, done } => {
                self.post(request, Priority::Low, false, Completion::Done(done));
            }
            SessionCommand::Fetch { collection_id, query, done } => {
                let fetch_id = generate_id();
                self.pending_fetches.insert(fetch_id.clone(), done);
                self.post(
                    ClientRequest::Fetch { fetch_id: fetch_id.clone(), collection_id, query },
                    Priority::Low,
                    false,
                    Completion::Fetch { fetch_id },
                );
            }
            SessionCommand::Subscribe { collection_id, query, done } => {
                let reply = self.subscribe(collection_id, query);
                if let Err(reply) = done.send(reply) {
                    // Caller vanished before the reply landed.
                    self.remove_listener(&reply.subscription_id, reply.listener_id);
                }
            }
            SessionCommand::RemoveListener { subscription_id, listener_id } => {
                self.remove_listener(&subscription_id, listener_id);
            }
            SessionCommand::Authorize { token, done } => {
                // An identical authorize already queued or in flight absorbs
                // this caller; the token itself commits only on ack.
                let mut done = Some(done);
                for entry in self.queue.iter_mut().chain(self.pending.values_mut()) {
                    if let (
                        ClientRequest::Authorize { token: queued },
                        Completion::Auth { waiters, .. },
                    ) = (&entry.request, &mut entry.completion)
                    {
                        if *queued == token {
                            if let Some(done) = done.take() {
                                waiters.push(done);
                            }
                            break;
                        }
                    }
                }
                if let Some(done) = done {
                    self.post(
                        ClientRequest::Authorize { token: token.clone() },
                        Priority::Medium,
                        false,
                        Completion::Auth { token: Some(token), waiters: vec![done] },
                    );
                }
            }
            SessionCommand::Deauthorize { done } => {
                self.post(
                    ClientRequest::Deauthorize,
                    Priority::Medium,
                    false,
                    Completion::Auth { token: None, waiters: vec![done] },
                );
            }
            SessionCommand::GoOnline => {
                if self.state == ConnectionState::Disconnected {
                    self.state = ConnectionState::Connecting;
                    self.network.go_online();
                }
            }
            SessionCommand::GoOffline => {
                self.go_offline();
            }
            SessionCommand::Destroy => {
                self.teardown();
                return Flow::Quit;
            }
            SessionCommand::TimedOut { entry_id } => {
                self.request_timed_out(entry_id);
            }
            SessionCommand::CacheLoaded { subscription_id, documents } => {
                if let Some(handler) = self.subscriptions.get_mut(&subscription_id) {
                    handler.ingest_cached(documents);
                }
            }
        }
        Flow::Continue
    }

    fn subscribe(&mut self, collection_id: String, query: Query) -> SubscribeReply {
        let hash = query.subscription_hash(&collection_id);
        let listener_id = self.next_listener_id;
        self.next_listener_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(subscription_id) = self.hash_index.get(&hash).cloned() {
            if let Some(handler) = self.subscriptions.get_mut(&subscription_id) {
                handler.add_listener(Listener { id: listener_id, tx });
                return SubscribeReply { subscription_id, listener_id, rx };
            }
        }

        let subscription_id = generate_id();
        let seq = self.next_registration_seq;
        self.next_registration_seq += 1;
        let mut handler = SubscriptionHandler::new(
            subscription_id.clone(),
            collection_id.clone(),
            query.clone(),
            hash.clone(),
            seq,
        );
        handler.add_listener(Listener { id: listener_id, tx });
        self.subscriptions.insert(subscription_id.clone(), handler);
        self.hash_index.insert(hash.clone(), subscription_id.clone());

        if let Some(cache) = &self.cache {
            let cache = cache.clone();
            let secret = self.auth_token.clone();
            let self_tx = self.self_tx.clone();
            let sub_id = subscription_id.clone();
            tokio::spawn(async move {
                match cache.load_dataset(&hash, secret).await {
                    Ok(Some(documents)) => {
                        let _ = self_tx.send(SessionCommand::CacheLoaded {
                            subscription_id: sub_id,
                            documents,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("cache read failed for subscription: {}", e),
                }
            });
        }

        self.post(
            ClientRequest::Subscribe {
                subscription_id: subscription_id.clone(),
                collection_id,
                query,
            },
            Priority::Low,
            false,
            Completion::Subscribe { subscription_id: subscription_id.clone() },
        );

        SubscribeReply { subscription_id, listener_id, rx }
    }

    fn remove_listener(&mut self, subscription_id: &str, listener_id: u64) {
        let hash = {
            let Some(handler) = self.subscriptions.get_mut(subscription_id) else {
                return;
            };
            if !handler.remove_listener(listener_id) {
                return;
            }
            handler.hash.clone()
        };

        // Last listener gone: release the hash so an equivalent subscribe
        // creates a fresh registration, then tear this one down.
        self.hash_index.remove(&hash);

        let queued = self.queue.iter().position(|entry| {
            matches!(&entry.completion, Completion::Subscribe { subscription_id: sid } if sid.as_str() == subscription_id)
        });
        if let Some(index) = queued {
            // Never sent: cancel locally with no wire traffic.
            if let Some(entry) = self.queue.remove(index) {
                abort_timer(entry.timer);
            }
            self.subscriptions.remove(subscription_id);
            return;
        }

        if let Some(handler) = self.subscriptions.get_mut(subscription_id) {
            handler.state = SubscriptionState::Unsubscribing;
        }
        self.post(
            ClientRequest::Unsubscribe { subscription_id: subscription_id.to_string() },
            Priority::Low,
            false,
            Completion::Unsubscribe { subscription_id: subscription_id.to_string() },
        );
    }

    fn go_offline(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        log::info!("session going offline");
        self.state = ConnectionState::Disconnected;
        self.network.go_offline();
        self.rebuild_queue_for_reconnect(None);
    }

    fn teardown(&mut self) {
        log::info!("session destroyed");
        if self.state == ConnectionState::Connected {
            if let Ok(frame) = ClientRequest::Disconnect.serialize(&generate_id()) {
                self.network.write(frame, "dis".to_string());
            }
        }
        self.network.destroy();

        for entry in std::mem::take(&mut self.queue) {
            complete_detached(entry, Err(Error::ConnectionTerminated));
        }
        for (_, entry) in std::mem::take(&mut self.pending) {
            complete_detached(entry, Err(Error::ConnectionTerminated));
        }
        for (_, done) in std::mem::take(&mut self.pending_fetches) {
            let _ = done.send(Err(Error::ConnectionTerminated));
        }
        for (_, mut handler) in std::mem::take(&mut self.subscriptions) {
            handler.fail(Error::ConnectionTerminated);
        }
        self.hash_index.clear();
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    /// Enqueues a request. `prioritize` inserts it in front of every queued
    /// request of lower or equal priority, which keeps the connect → auth →
    /// everything-else order during connection establishment.
    fn post(
        &mut self,
        request: ClientRequest,
        priority: Priority,
        prioritize: bool,
        completion: Completion,
    ) {
        let entry_id = self.next_entry_id;
        self.next_entry_id += 1;

        let timeout = if request.expects_ack() {
            self.request_timeout.or_else(|| {
                request
                    .is_connection_request()
                    .then(|| Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            })
        } else {
            None
        };
        let timer = timeout.map(|timeout| {
            let tx = self.self_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(SessionCommand::TimedOut { entry_id });
            })
        });

        let entry = QueuedRequest {
            entry_id,
            request,
            priority,
            completion,
            timer,
            enqueued_at: Instant::now(),
        };

        if prioritize {
            let index = self
                .queue
                .iter()
                .position(|queued| queued.priority <= priority)
                .unwrap_or(self.queue.len());
            self.queue.insert(index, entry);
        } else {
            self.queue.push_back(entry);
        }

        self.flush_queue();
    }

    /// Drains the queue while connected, assigning event ids and moving
    /// acknowledged-later requests into the pending table.
    fn flush_queue(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        while let Some(entry) = self.queue.pop_front() {
            let event_id = generate_id();
            match entry.request.serialize(&event_id) {
                Ok(frame) => {
                    self.network.write(frame, event_id.clone());
                    if entry.request.expects_ack() {
                        self.pending.insert(event_id, entry);
                    } else {
                        abort_timer(entry.timer);
                    }
                }
                Err(e) => {
                    log::debug!("request failed validation: {}", e);
                    self.complete(entry, Err(e));
                }
            }
        }
        self.reset_heartbeat();
    }

    fn reset_heartbeat(&mut self) {
        self.heartbeat_deadline = Instant::now() + self.heartbeat_interval;
    }

    fn heartbeat_fired(&mut self) {
        log::debug!("heartbeat: posting no-op");
        self.post(ClientRequest::NoOp, Priority::Low, false, Completion::None);
        self.reset_heartbeat();
    }

    fn request_timed_out(&mut self, entry_id: u64) {
        // The request may still be queued or already in flight.
        if let Some(index) = self.queue.iter().position(|e| e.entry_id == entry_id) {
            if let Some(entry) = self.queue.remove(index) {
                self.fail_timed_out(entry);
            }
            return;
        }
        let event_id = self
            .pending
            .iter()
            .find(|(_, e)| e.entry_id == entry_id)
            .map(|(id, _)| id.clone());
        if let Some(event_id) = event_id {
            if let Some(entry) = self.pending.remove(&event_id) {
                self.fail_timed_out(entry);
            }
        }
    }

    fn fail_timed_out(&mut self, entry: QueuedRequest) {
        let restart = entry.request.is_connection_request();
        self.complete(entry, Err(Error::Timeout));
        if restart {
            // A dead connect attempt means a dead socket.
            self.network.restart(Some(Error::Timeout));
        }
    }

    // ------------------------------------------------------------------
    // Network events
    // ------------------------------------------------------------------

    fn handle_network(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::SocketConnected => self.socket_connected(),
            NetworkEvent::SocketDisconnected { error } => self.socket_disconnected(error),
            NetworkEvent::MessageReceived(text) => self.message_received(&text),
        }
    }

    /// Establishes the logical session on a fresh physical connection.
    fn socket_connected(&mut self) {
        let request = match &self.connection_id {
            Some(id) => ClientRequest::Reconnect { connection_id: id.clone() },
            None => {
                let id = generate_id();
                self.connection_id = Some(id.clone());
                ClientRequest::Connect { connection_id: id }
            }
        };
        self.post(request, Priority::High, true, Completion::None);

        if let Some(token) = self.auth_token.clone() {
            let already_queued = self.queue.iter().any(|entry| {
                matches!(&entry.request, ClientRequest::Authorize { token: t } if *t == token)
            });
            if !already_queued {
                self.post(
                    ClientRequest::Authorize { token: token.clone() },
                    Priority::Medium,
                    true,
                    Completion::Auth { token: Some(token), waiters: Vec::new() },
                );
            }
        }

        self.state = ConnectionState::Connected;
        self.flush_queue();
    }

    fn socket_disconnected(&mut self, error: Option<Error>) {
        log::info!("socket disconnected (error: {:?})", error);
        self.state = ConnectionState::Disconnected;
        self.rebuild_queue_for_reconnect(error);
        self.state = ConnectionState::Connecting;
        self.network.go_online();
    }

    /// Rebuilds the queue after losing the transport: connection-bound
    /// requests are dropped, the logical session is reset if the error
    /// demands it, and in-flight requests are replayed before queued work.
    fn rebuild_queue_for_reconnect(&mut self, error: Option<Error>) {
        // Timers bind to the old connection attempt; every surviving request
        // gets its chance again once the new connection flushes.
        let mut tail: Vec<QueuedRequest> = Vec::new();
        for mut entry in std::mem::take(&mut self.queue) {
            abort_timer(entry.timer.take());
            if entry.request.is_connection_bound() {
                continue;
            }
            tail.push(entry);
        }

        let mut replayed: Vec<QueuedRequest> = Vec::new();
        for (_, mut entry) in self.pending.drain() {
            abort_timer(entry.timer.take());
            if entry.request.is_connection_bound() {
                continue;
            }
            replayed.push(entry);
        }
        replayed.sort_by_key(|e| e.enqueued_at);

        let session_lost = error.as_ref().map(Error::terminates_session).unwrap_or(false);
        let mut resubscribed: Vec<QueuedRequest> = Vec::new();
        if session_lost {
            self.connection_id = None;

            let mut handlers: Vec<&mut SubscriptionHandler> = self
                .subscriptions
                .values_mut()
                .filter(|h| h.state != SubscriptionState::Unsubscribing)
                .collect();
            handlers.sort_by_key(|h| h.registration_seq);

            for handler in handlers {
                let already = replayed
                    .iter()
                    .chain(tail.iter())
                    .any(|entry| matches!(
                        &entry.completion,
                        Completion::Subscribe { subscription_id } if *subscription_id == handler.subscription_id
                    ));
                if already {
                    continue;
                }
                handler.state = SubscriptionState::Registering;
                resubscribed.push(QueuedRequest {
                    entry_id: self.next_entry_id,
                    request: ClientRequest::Subscribe {
                        subscription_id: handler.subscription_id.clone(),
                        collection_id: handler.collection_id.clone(),
                        query: handler.query.clone(),
                    },
                    priority: Priority::Low,
                    completion: Completion::Subscribe {
                        subscription_id: handler.subscription_id.clone(),
                    },
                    timer: None,
                    enqueued_at: Instant::now(),
                });
                self.next_entry_id += 1;
            }
        }

        // Resubscriptions, then in-flight replays, then the preserved tail.
        self.queue = resubscribed
            .into_iter()
            .chain(replayed)
            .chain(tail)
            .collect();
    }

    // ------------------------------------------------------------------
    // Frame dispatch
    // ------------------------------------------------------------------

    fn message_received(&mut self, text: &str) {
        self.reset_heartbeat();
        let messages = match crate::protocol::parse_server_messages(text) {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("dropping unparseable frame: {}", e);
                return;
            }
        };
        for message in messages {
            self.dispatch(message);
        }
    }

    fn dispatch(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Ack { event_id } => {
                if let Some(entry) = self.pending.remove(&event_id) {
                    self.complete(entry, Ok(()));
                }
            }
            ServerMessage::Error { event_id, error } => {
                let terminated = error == Error::ConnectionTerminated;
                if let Some(entry) = self.pending.remove(&event_id) {
                    self.complete(entry, Err(error));
                }
                if terminated {
                    // The logical session is gone; tear the socket down and
                    // let the reconnect path build a fresh one.
                    self.network.restart(Some(Error::ConnectionTerminated));
                }
            }
            ServerMessage::Subscription { subscription_id, batch, .. } => {
                let ingested = match self.subscriptions.get_mut(&subscription_id) {
                    Some(handler) => handler.ingest(&batch),
                    None => {
                        log::debug!("subscription event for unknown id {}", subscription_id);
                        None
                    }
                };
                if let Some(documents) = ingested {
                    self.store_dataset(&subscription_id, documents);
                }
                // Server events must be acknowledged whether or not a
                // handler is still interested.
                for event_id in batch.event_ids {
                    self.acknowledge(event_id);
                }
            }
            ServerMessage::SubscriptionCancel { subscription_id, .. } => {
                if let Some(mut handler) = self.subscriptions.remove(&subscription_id) {
                    log::info!("subscription {} cancelled by server", subscription_id);
                    self.hash_index.remove(&handler.hash);
                    handler.fail(Error::PermissionDenied);
                }
            }
            ServerMessage::FetchResponse { fetch_id, documents, .. } => {
                if let Some(done) = self.pending_fetches.remove(&fetch_id) {
                    let _ = done.send(Ok(documents));
                }
            }
        }
    }

    fn acknowledge(&mut self, event_id: String) {
        match (ClientRequest::Ack { event_id: event_id.clone() }).serialize("") {
            Ok(frame) => self.network.write(frame, event_id),
            Err(e) => log::warn!("failed to serialize ack: {}", e),
        }
    }

    fn store_dataset(&self, subscription_id: &str, documents: Vec<Document>) {
        let Some(cache) = &self.cache else { return };
        let Some(handler) = self.subscriptions.get(subscription_id) else { return };
        let cache = cache.clone();
        let hash = handler.hash.clone();
        let secret = self.auth_token.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.save_dataset(&hash, documents, secret).await {
                log::warn!("cache write failed: {}", e);
            }
        });
    }

    // ------------------------------------------------------------------
    // Completion routing
    // ------------------------------------------------------------------

    fn complete(&mut self, mut entry: QueuedRequest, result: Result<()>) {
        abort_timer(entry.timer.take());
        match entry.completion {
            Completion::None => {}
            Completion::Done(done) => {
                let _ = done.send(result);
            }
            Completion::Auth { token, waiters } => {
                match &result {
                    Ok(()) => {
                        // Ack commits the token (or the deauthorization); the
                        // cache obfuscation secret follows this committed
                        // value, never an in-flight one.
                        self.auth_token = token;
                    }
                    Err(_) => {
                        if token.is_some() && token == self.auth_token {
                            self.auth_token = None;
                        }
                    }
                }
                for done in waiters {
                    let _ = done.send(result.clone());
                }
            }
            Completion::Fetch { fetch_id } => {
                // Success of the request itself: the dataset arrives in a
                // `res` frame. Only failures resolve the fetch here.
                if let Err(e) = result {
                    if let Some(done) = self.pending_fetches.remove(&fetch_id) {
                        let _ = done.send(Err(e));
                    }
                }
            }
            Completion::Subscribe { subscription_id } => match result {
                Ok(()) => {
                    if let Some(handler) = self.subscriptions.get_mut(&subscription_id) {
                        handler.state = SubscriptionState::Subscribed;
                    }
                }
                Err(e) => {
                    if let Some(mut handler) = self.subscriptions.remove(&subscription_id) {
                        self.hash_index.remove(&handler.hash);
                        handler.fail(e);
                    }
                }
            },
            Completion::Unsubscribe { subscription_id } => {
                self.subscriptions.remove(&subscription_id);
            }
        }
    }
}

/// Completion for entries dropped outside the session loop borrow.
fn complete_detached(mut entry: QueuedRequest, result: Result<()>) {
    abort_timer(entry.timer.take());
    match entry.completion {
        Completion::Done(done) => {
            let _ = done.send(result);
        }
        Completion::Auth { waiters, .. } => {
            for done in waiters {
                let _ = done.send(result.clone());
            }
        }
        _ => {}
    }
}

fn abort_timer(timer: Option<JoinHandle<()>>) {
    if let Some(timer) = timer {
        timer.abort();
    }
}

fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
