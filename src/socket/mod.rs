//! Socket server interface
//!
//! The engine drives a pub/sub socket server through these traits: an
//! [`Exchange`] for channel publish/subscribe, a handshake stream yielding
//! new sockets, per-socket RPC procedure streams, and inbound/outbound
//! middleware hooks where the access filter interposes itself.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{CrudError, Result};

pub use memory::{ClientHandle, ClientSubscription, MemoryExchange, MemoryServer};

/// Identity of a connected socket as middleware and hooks see it.
#[derive(Debug, Clone)]
pub struct SocketInfo {
    /// Server-assigned socket id.
    pub id: String,
    /// Opaque auth token carried by the connection.
    pub auth_token: Option<Value>,
}

/// One inbound RPC request on a socket procedure.
#[derive(Debug)]
pub struct ProcedureRequest {
    /// Request payload.
    pub data: Value,
    responder: oneshot::Sender<std::result::Result<Value, CrudError>>,
}

impl ProcedureRequest {
    /// Create a request and the receiver its reply arrives on.
    pub fn new(
        data: Value,
    ) -> (
        Self,
        oneshot::Receiver<std::result::Result<Value, CrudError>>,
    ) {
        let (responder, rx) = oneshot::channel();
        (Self { data, responder }, rx)
    }

    /// Reply successfully.
    pub fn end(self, result: Value) {
        let _ = self.responder.send(Ok(result));
    }

    /// Reply with an error.
    pub fn error(self, err: CrudError) {
        let _ = self.responder.send(Err(err));
    }
}

/// What an inbound middleware action is about.
#[derive(Debug, Clone)]
pub enum InboundActionKind {
    /// An RPC invocation of a named procedure.
    Invoke {
        /// Procedure name.
        procedure: String,
    },
    /// A client subscribing to a channel.
    Subscribe {
        /// Channel name.
        channel: String,
    },
    /// A client publishing into a channel.
    PublishIn {
        /// Channel name.
        channel: String,
    },
}

/// One inbound action awaiting a middleware decision.
#[derive(Debug, Clone)]
pub struct InboundAction {
    /// Action kind and target.
    pub kind: InboundActionKind,
    /// The socket performing the action.
    pub socket: SocketInfo,
    /// Request or publish payload.
    pub data: Option<Value>,
}

/// Middleware verdict on an inbound action.
#[derive(Debug)]
pub enum InboundDecision {
    /// Let the action through, optionally replacing its payload.
    Allow(Option<Value>),
    /// Refuse the action with an error delivered to the client.
    Block(CrudError),
}

/// One outbound publication awaiting a middleware decision.
#[derive(Debug, Clone)]
pub struct OutboundAction {
    /// The socket the payload would be delivered to.
    pub socket: SocketInfo,
    /// Channel the payload was published on.
    pub channel: String,
    /// The published payload.
    pub data: Option<Value>,
}

/// Middleware verdict on an outbound delivery.
#[derive(Debug)]
pub enum OutboundDecision {
    /// Deliver, optionally with a rewritten payload.
    Deliver(Option<Value>),
    /// Silently skip this socket.
    Drop,
}

/// Consumer of inbound middleware actions.
#[async_trait]
pub trait InboundMiddleware: Send + Sync {
    /// Decide one inbound action.
    async fn process(&self, action: InboundAction) -> InboundDecision;
}

/// Consumer of outbound middleware actions.
#[async_trait]
pub trait OutboundMiddleware: Send + Sync {
    /// Decide one outbound delivery.
    async fn process(&self, action: OutboundAction) -> OutboundDecision;
}

/// Cancels a channel subscription when invoked or dropped.
pub struct SubscriptionHandle {
    canceller: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    /// Wrap a cancel closure.
    pub fn new(canceller: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            canceller: Some(canceller),
        }
    }

    /// Tear the subscription down now.
    pub fn kill(mut self) {
        if let Some(canceller) = self.canceller.take() {
            canceller();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(canceller) = self.canceller.take() {
            canceller();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle").finish()
    }
}

/// A live server-side channel subscription.
#[derive(Debug)]
pub struct ChannelSubscription {
    /// The subscribed channel.
    pub channel: String,
    /// Stream of payloads published to the channel.
    pub receiver: mpsc::UnboundedReceiver<Option<Value>>,
    /// Handle that unsubscribes when killed or dropped.
    pub handle: SubscriptionHandle,
}

/// Channel publish/subscribe primitives.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Publish a payload to every subscriber of `channel`.
    async fn transmit_publish(&self, channel: &str, payload: Option<Value>) -> Result<()>;

    /// Subscribe the server itself to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<ChannelSubscription>;

    /// Whether the server holds a subscription to `channel`.
    fn is_subscribed(&self, channel: &str, include_pending: bool) -> bool;
}

/// A connected client socket, server-side.
pub trait ServerSocket: Send + Sync {
    /// Server-assigned socket id.
    fn id(&self) -> String;

    /// The connection's opaque auth token.
    fn auth_token(&self) -> Option<Value>;

    /// Identity bundle for middleware and hooks.
    fn info(&self) -> SocketInfo {
        SocketInfo {
            id: self.id(),
            auth_token: self.auth_token(),
        }
    }

    /// Stream of RPC requests addressed to `name`. The stream may only be
    /// taken once per procedure.
    fn procedure(&self, name: &str) -> mpsc::UnboundedReceiver<ProcedureRequest>;
}

/// The pub/sub socket server the engine attaches to.
pub trait SocketServer: Send + Sync {
    /// The server's channel exchange.
    fn exchange(&self) -> Arc<dyn Exchange>;

    /// Stream of newly connected sockets. May only be taken once.
    fn handshakes(&self) -> mpsc::UnboundedReceiver<Arc<dyn ServerSocket>>;

    /// Install the inbound middleware consumer.
    fn set_inbound_middleware(&self, middleware: Arc<dyn InboundMiddleware>);

    /// Install the outbound middleware consumer.
    fn set_outbound_middleware(&self, middleware: Arc<dyn OutboundMiddleware>);
}
