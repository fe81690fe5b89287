//! In-process pub/sub server
//!
//! Embedded implementation of the socket server interface: an exchange
//! with per-channel subscriber fanout, sockets with procedure streams, and
//! middleware wiring. Client handles drive the same inbound/outbound
//! middleware path a network transport would, which makes this the backend
//! for stand-alone use and for exercising the engine end to end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{
    ChannelSubscription, Exchange, InboundAction, InboundActionKind, InboundDecision,
    InboundMiddleware, OutboundAction, OutboundDecision, OutboundMiddleware, ProcedureRequest,
    ServerSocket, SocketInfo, SocketServer, SubscriptionHandle,
};
use crate::error::{CrudError, Result};

#[derive(Clone)]
enum Subscriber {
    /// The server's own subscription; bypasses outbound middleware.
    Local(mpsc::UnboundedSender<Option<Value>>),
    /// A client socket subscription; deliveries pass outbound middleware.
    Socket {
        socket: SocketInfo,
        sender: mpsc::UnboundedSender<Option<Value>>,
    },
}

struct ExchangeInner {
    channels: DashMap<String, HashMap<u64, Subscriber>>,
    next_subscription: AtomicU64,
    outbound: RwLock<Option<Arc<dyn OutboundMiddleware>>>,
}

/// In-process channel exchange.
#[derive(Clone)]
pub struct MemoryExchange {
    inner: Arc<ExchangeInner>,
}

impl Default for MemoryExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryExchange {
    /// An exchange with no channels and no middleware.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ExchangeInner {
                channels: DashMap::new(),
                next_subscription: AtomicU64::new(1),
                outbound: RwLock::new(None),
            }),
        }
    }

    fn set_outbound_middleware(&self, middleware: Arc<dyn OutboundMiddleware>) {
        *self.inner.outbound.write() = Some(middleware);
    }

    fn add_subscriber(&self, channel: &str, subscriber: Subscriber) -> u64 {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(id, subscriber);
        id
    }

    fn subscription_handle(&self, channel: &str, id: u64) -> SubscriptionHandle {
        let inner = self.inner.clone();
        let channel = channel.to_string();
        SubscriptionHandle::new(Box::new(move || {
            if let Some(mut subscribers) = inner.channels.get_mut(&channel) {
                subscribers.remove(&id);
            }
        }))
    }

    fn socket_subscribe(
        &self,
        channel: &str,
        socket: SocketInfo,
    ) -> (u64, mpsc::UnboundedReceiver<Option<Value>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add_subscriber(channel, Subscriber::Socket { socket, sender: tx });
        (id, rx)
    }

    /// Subscribers currently registered on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .get(channel)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Exchange for MemoryExchange {
    async fn transmit_publish(&self, channel: &str, payload: Option<Value>) -> Result<()> {
        let subscribers: Vec<Subscriber> = self
            .inner
            .channels
            .get(channel)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default();
        if subscribers.is_empty() {
            return Ok(());
        }
        let outbound = self.inner.outbound.read().clone();

        for subscriber in subscribers {
            match subscriber {
                Subscriber::Local(sender) => {
                    let _ = sender.send(payload.clone());
                }
                Subscriber::Socket { socket, sender } => match &outbound {
                    Some(middleware) => {
                        let action = OutboundAction {
                            socket: socket.clone(),
                            channel: channel.to_string(),
                            data: payload.clone(),
                        };
                        match middleware.process(action).await {
                            OutboundDecision::Deliver(data) => {
                                let _ = sender.send(data);
                            }
                            OutboundDecision::Drop => {}
                        }
                    }
                    None => {
                        let _ = sender.send(payload.clone());
                    }
                },
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<ChannelSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add_subscriber(channel, Subscriber::Local(tx));
        Ok(ChannelSubscription {
            channel: channel.to_string(),
            receiver: rx,
            handle: self.subscription_handle(channel, id),
        })
    }

    fn is_subscribed(&self, channel: &str, _include_pending: bool) -> bool {
        self.inner
            .channels
            .get(channel)
            .map(|subscribers| {
                subscribers
                    .values()
                    .any(|s| matches!(s, Subscriber::Local(_)))
            })
            .unwrap_or(false)
    }
}

struct ProcedureEndpoints {
    sender: mpsc::UnboundedSender<ProcedureRequest>,
    receiver: Option<mpsc::UnboundedReceiver<ProcedureRequest>>,
}

/// A connected in-process socket.
pub struct MemorySocket {
    id: String,
    auth_token: Option<Value>,
    procedures: Mutex<HashMap<String, ProcedureEndpoints>>,
}

impl MemorySocket {
    fn new(id: String, auth_token: Option<Value>) -> Self {
        Self {
            id,
            auth_token,
            procedures: Mutex::new(HashMap::new()),
        }
    }

    fn procedure_sender(&self, name: &str) -> mpsc::UnboundedSender<ProcedureRequest> {
        let mut procedures = self.procedures.lock();
        procedures
            .entry(name.to_string())
            .or_insert_with(|| {
                let (sender, receiver) = mpsc::unbounded_channel();
                ProcedureEndpoints {
                    sender,
                    receiver: Some(receiver),
                }
            })
            .sender
            .clone()
    }
}

impl ServerSocket for MemorySocket {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn auth_token(&self) -> Option<Value> {
        self.auth_token.clone()
    }

    fn procedure(&self, name: &str) -> mpsc::UnboundedReceiver<ProcedureRequest> {
        let mut procedures = self.procedures.lock();
        let endpoints = procedures.entry(name.to_string()).or_insert_with(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            ProcedureEndpoints {
                sender,
                receiver: Some(receiver),
            }
        });
        endpoints.receiver.take().unwrap_or_else(|| {
            // The stream was already taken; hand back a closed one.
            let (_, receiver) = mpsc::unbounded_channel();
            receiver
        })
    }
}

struct ServerInner {
    exchange: MemoryExchange,
    inbound: RwLock<Option<Arc<dyn InboundMiddleware>>>,
    handshake_tx: mpsc::UnboundedSender<Arc<dyn ServerSocket>>,
    handshake_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn ServerSocket>>>>,
    next_socket: AtomicU64,
}

/// In-process socket server.
#[derive(Clone)]
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    /// A server with a fresh exchange and no connected sockets.
    pub fn new() -> Self {
        let (handshake_tx, handshake_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ServerInner {
                exchange: MemoryExchange::new(),
                inbound: RwLock::new(None),
                handshake_tx,
                handshake_rx: Mutex::new(Some(handshake_rx)),
                next_socket: AtomicU64::new(1),
            }),
        }
    }

    /// The concrete exchange, for tests that inspect subscriber state.
    pub fn memory_exchange(&self) -> MemoryExchange {
        self.inner.exchange.clone()
    }

    /// Connect a client with no auth token.
    pub fn connect(&self) -> ClientHandle {
        self.connect_with_token(None)
    }

    /// Connect a client carrying an auth token.
    pub fn connect_with_token(&self, auth_token: Option<Value>) -> ClientHandle {
        let id = format!(
            "socket-{}",
            self.inner.next_socket.fetch_add(1, Ordering::Relaxed)
        );
        let socket = Arc::new(MemorySocket::new(id, auth_token));
        let _ = self.inner.handshake_tx.send(socket.clone());
        ClientHandle {
            inner: self.inner.clone(),
            socket,
        }
    }
}

impl SocketServer for MemoryServer {
    fn exchange(&self) -> Arc<dyn Exchange> {
        Arc::new(self.inner.exchange.clone())
    }

    fn handshakes(&self) -> mpsc::UnboundedReceiver<Arc<dyn ServerSocket>> {
        self.inner.handshake_rx.lock().take().unwrap_or_else(|| {
            let (_, receiver) = mpsc::unbounded_channel();
            receiver
        })
    }

    fn set_inbound_middleware(&self, middleware: Arc<dyn InboundMiddleware>) {
        *self.inner.inbound.write() = Some(middleware);
    }

    fn set_outbound_middleware(&self, middleware: Arc<dyn OutboundMiddleware>) {
        self.inner.exchange.set_outbound_middleware(middleware);
    }
}

/// A client-side subscription: the payload the server attached on allow,
/// plus the stream of deliveries.
#[derive(Debug)]
pub struct ClientSubscription {
    /// Subscription payload returned by the inbound middleware.
    pub payload: Option<Value>,
    /// Delivered publications, post outbound middleware.
    pub receiver: mpsc::UnboundedReceiver<Option<Value>>,
    handle: SubscriptionHandle,
}

impl ClientSubscription {
    /// Await the next delivery; `None` when the subscription is gone.
    pub async fn recv(&mut self) -> Option<Option<Value>> {
        self.receiver.recv().await
    }

    /// Drain everything delivered so far without waiting.
    pub fn drain(&mut self) -> Vec<Option<Value>> {
        let mut drained = Vec::new();
        while let Ok(payload) = self.receiver.try_recv() {
            drained.push(payload);
        }
        drained
    }

    /// Unsubscribe.
    pub fn kill(self) {
        self.handle.kill();
    }
}

/// Client-side handle to a connected socket.
pub struct ClientHandle {
    inner: Arc<ServerInner>,
    socket: Arc<MemorySocket>,
}

impl ClientHandle {
    /// The socket id the server assigned.
    pub fn id(&self) -> String {
        self.socket.id()
    }

    fn info(&self) -> SocketInfo {
        self.socket.info()
    }

    /// Invoke an RPC procedure and await its reply.
    pub async fn invoke(&self, procedure: &str, data: Value) -> Result<Value> {
        let middleware = self.inner.inbound.read().clone();
        let data = match middleware {
            Some(middleware) => {
                let action = InboundAction {
                    kind: InboundActionKind::Invoke {
                        procedure: procedure.to_string(),
                    },
                    socket: self.info(),
                    data: Some(data.clone()),
                };
                match middleware.process(action).await {
                    InboundDecision::Allow(Some(replaced)) => replaced,
                    InboundDecision::Allow(None) => data,
                    InboundDecision::Block(err) => return Err(err),
                }
            }
            None => data,
        };

        let (request, reply) = ProcedureRequest::new(data);
        let sender = self.socket.procedure_sender(procedure);
        sender.send(request).map_err(|_| {
            CrudError::InvalidOperation(format!("Procedure {procedure} is not handled"))
        })?;
        match reply.await {
            Ok(result) => result,
            Err(_) => Err(CrudError::Database(
                "The procedure handler went away before replying".to_string(),
            )),
        }
    }

    /// Subscribe to a channel, passing inbound middleware.
    pub async fn subscribe(&self, channel: &str) -> Result<ClientSubscription> {
        self.subscribe_with_data(channel, None).await
    }

    /// Subscribe with extra data attached to the middleware action.
    pub async fn subscribe_with_data(
        &self,
        channel: &str,
        data: Option<Value>,
    ) -> Result<ClientSubscription> {
        let middleware = self.inner.inbound.read().clone();
        let payload = match middleware {
            Some(middleware) => {
                let action = InboundAction {
                    kind: InboundActionKind::Subscribe {
                        channel: channel.to_string(),
                    },
                    socket: self.info(),
                    data,
                };
                match middleware.process(action).await {
                    InboundDecision::Allow(payload) => payload,
                    InboundDecision::Block(err) => return Err(err),
                }
            }
            None => None,
        };

        let (id, receiver) = self
            .inner
            .exchange
            .socket_subscribe(channel, self.info());
        Ok(ClientSubscription {
            payload,
            receiver,
            handle: self.inner.exchange.subscription_handle(channel, id),
        })
    }

    /// Publish into a channel, passing inbound middleware.
    pub async fn publish(&self, channel: &str, data: Value) -> Result<()> {
        let middleware = self.inner.inbound.read().clone();
        let payload = match middleware {
            Some(middleware) => {
                let action = InboundAction {
                    kind: InboundActionKind::PublishIn {
                        channel: channel.to_string(),
                    },
                    socket: self.info(),
                    data: Some(data.clone()),
                };
                match middleware.process(action).await {
                    InboundDecision::Allow(Some(replaced)) => Some(replaced),
                    InboundDecision::Allow(None) => Some(data),
                    InboundDecision::Block(err) => return Err(err),
                }
            }
            None => Some(data),
        };
        self.inner.exchange.transmit_publish(channel, payload).await
    }
}
