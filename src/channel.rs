//! Request/response plumbing on top of a raw transport.
//!
//! The transport only moves lines of text; everything above that lives here.
//! A [`ServerChannel`] stamps ids onto outgoing requests, parks a oneshot
//! waiter per id and routes inbound frames either back to their waiter (when
//! `refs` matches) or to the notification handlers subscribed to the frame
//! type. The channel outlives individual connections: it is bound to the
//! outbound queue of the current transport and unbound when that transport
//! goes away, failing all parked waiters so callers never hang.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::debug;

use crate::error::{GroundlinkError, Result};
use crate::model::{BeaconInfo, ClockInfo, ConnectionInfo, DockInfo};
use crate::protocol::{self, encode_request, nak_reason, InboundFrame};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// An outgoing message body, before an id is stamped onto it.
#[derive(Debug, Clone)]
pub struct Outbound(Value);

impl Outbound {
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for Outbound {
    fn from(value: Value) -> Self {
        Outbound(value)
    }
}

impl From<&str> for Outbound {
    fn from(kind: &str) -> Self {
        Outbound(protocol::request(kind))
    }
}

impl From<String> for Outbound {
    fn from(kind: String) -> Self {
        Outbound(protocol::request(&kind))
    }
}

/// Cooperative cancellation for a request in flight.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback invoked for every notification of a subscribed type.
pub type NotificationHandler = Arc<dyn Fn(InboundFrame) + Send + Sync>;

/// Handle returned by [`MessageChannel::subscribe`], used to detach again.
pub struct Subscription {
    message_type: String,
    id: u64,
    handlers: Arc<DashMap<String, Vec<(u64, NotificationHandler)>>>,
}

impl Subscription {
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn unsubscribe(self) {
        if let Some(mut entry) = self.handlers.get_mut(&self.message_type) {
            entry.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Typed view of the server protocol.
///
/// The four required methods form the raw surface; the typed queries are
/// default implementations on top of them, so alternative channels (tests,
/// recordings) only need to provide the raw surface.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Send a request and wait for the response body.
    async fn send_message(&self, message: Outbound) -> Result<Value>;

    /// Like [`send_message`](Self::send_message), abandoning the wait when
    /// the token fires.
    async fn send_message_with_cancel(&self, message: Outbound, cancel: CancelToken)
        -> Result<Value>;

    /// Send a request without waiting for any response.
    async fn send_forget(&self, message: Outbound) -> Result<()>;

    /// Attach a handler for notifications of the given type.
    fn subscribe(&self, message_type: &str, handler: NotificationHandler) -> Subscription;

    fn cancel_token(&self) -> CancelToken {
        CancelToken::new()
    }

    async fn system_version(&self) -> Result<String> {
        let body = self.send_message(protocol::SYS_VER.into()).await?;
        protocol::parse_version(&body)
    }

    async fn connection_ids(&self) -> Result<Vec<String>> {
        let body = self.send_message(protocol::CONN_LIST.into()).await?;
        protocol::parse_ids(&body)
    }

    async fn connection_info(&self, ids: &[String]) -> Result<HashMap<String, ConnectionInfo>> {
        let body = self
            .send_message(serde_json::json!({"type": protocol::CONN_INF, "ids": ids}).into())
            .await?;
        protocol::parse_status_map(&body)
    }

    async fn clock_ids(&self) -> Result<Vec<String>> {
        let body = self.send_message(protocol::CLK_LIST.into()).await?;
        protocol::parse_ids(&body)
    }

    async fn clock_info(&self, ids: &[String]) -> Result<HashMap<String, ClockInfo>> {
        let body = self
            .send_message(serde_json::json!({"type": protocol::CLK_INF, "ids": ids}).into())
            .await?;
        protocol::parse_status_map(&body)
    }

    /// Ids of registered objects of one kind, e.g. `"dock"` or `"beacon"`.
    async fn object_ids(&self, filter: &str) -> Result<Vec<String>> {
        let body = self
            .send_message(serde_json::json!({"type": protocol::OBJ_LIST, "filter": [filter]}).into())
            .await?;
        protocol::parse_ids(&body)
    }

    async fn dock_info(&self, ids: &[String]) -> Result<HashMap<String, DockInfo>> {
        let body = self
            .send_message(serde_json::json!({"type": protocol::DOCK_INF, "ids": ids}).into())
            .await?;
        protocol::parse_status_map(&body)
    }

    async fn beacon_info(&self, ids: &[String]) -> Result<HashMap<String, BeaconInfo>> {
        let body = self
            .send_message(serde_json::json!({"type": protocol::BCN_INF, "ids": ids}).into())
            .await?;
        protocol::parse_status_map(&body)
    }

    async fn beacon_properties(&self, ids: &[String]) -> Result<HashMap<String, Value>> {
        let body = self
            .send_message(serde_json::json!({"type": protocol::BCN_PROPS, "ids": ids}).into())
            .await?;
        protocol::parse_status_map(&body)
    }

    async fn is_extension_loaded(&self, name: &str) -> Result<bool> {
        let body = self
            .send_message(serde_json::json!({"type": protocol::EXT_INF, "names": [name]}).into())
            .await?;
        Ok(body
            .get("status")
            .and_then(Value::as_object)
            .map(|status| status.contains_key(name))
            .unwrap_or(false))
    }

    async fn license_info(&self) -> Result<Value> {
        let body = self.send_message(protocol::LCN_INF.into()).await?;
        let license = body.get("license").cloned();
        Ok(match license {
            Some(license) => license,
            None => body,
        })
    }

    /// Current server time in Unix milliseconds.
    async fn server_time(&self) -> Result<i64> {
        let body = self.send_message(protocol::SYS_TIME.into()).await?;
        protocol::parse_timestamp(&body)
    }

    async fn ping(&self) -> Result<()> {
        self.send_message(protocol::SYS_PING.into()).await?;
        Ok(())
    }
}

/// The production [`MessageChannel`], multiplexing over one transport.
pub struct ServerChannel {
    timeout: Duration,
    outbound: RwLock<Option<mpsc::Sender<String>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>,
    handlers: Arc<DashMap<String, Vec<(u64, NotificationHandler)>>>,
    next_subscription_id: AtomicU64,
}

impl ServerChannel {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            outbound: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            handlers: Arc::new(DashMap::new()),
            next_subscription_id: AtomicU64::new(0),
        }
    }

    /// Attach the channel to the outbound queue of a freshly opened transport.
    pub async fn bind(&self, sender: mpsc::Sender<String>) {
        *self.outbound.write().await = Some(sender);
    }

    /// Detach from the current transport.
    ///
    /// Parked waiters fail immediately and notification subscriptions are
    /// dropped; both are scoped to the session that just ended.
    pub async fn unbind(&self) {
        *self.outbound.write().await = None;
        self.fail_pending("connection closed").await;
        self.handlers.clear();
    }

    pub async fn is_bound(&self) -> bool {
        self.outbound.read().await.is_some()
    }

    /// Fail every request still waiting for a response.
    pub async fn fail_pending(&self, reason: &str) {
        let waiters: Vec<_> = self.pending.lock().await.drain().collect();
        for (_, tx) in waiters {
            let _ = tx.send(Err(GroundlinkError::Transport(reason.to_string())));
        }
    }

    /// Route one inbound frame to its waiter or to notification handlers.
    pub async fn dispatch(&self, frame: InboundFrame) {
        if let Some(refs) = frame.refs.clone() {
            let waiter = self.pending.lock().await.remove(&refs);
            match waiter {
                Some(tx) => {
                    let result = if frame.kind == protocol::ACK_NAK {
                        Err(GroundlinkError::Rejected(nak_reason(&frame.body)))
                    } else {
                        Ok(frame.body)
                    };
                    let _ = tx.send(result);
                }
                None => {
                    debug!(refs = %refs, kind = %frame.kind, "Dropping response nobody waits for")
                }
            }
        } else {
            let handlers: Vec<NotificationHandler> = self
                .handlers
                .get(&frame.kind)
                .map(|entry| entry.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default();
            for handler in handlers {
                handler(frame.clone());
            }
        }
    }

    async fn forget(&self, id: &str) {
        self.pending.lock().await.remove(id);
    }

    async fn queue(&self, text: String, id: Option<&str>) -> Result<()> {
        let sender = match self.outbound.read().await.clone() {
            Some(sender) => sender,
            None => {
                if let Some(id) = id {
                    self.forget(id).await;
                }
                return Err(GroundlinkError::NotConnected);
            }
        };
        if let Err(e) = sender.send(text).await {
            if let Some(id) = id {
                self.forget(id).await;
            }
            return Err(GroundlinkError::Transport(format!(
                "Failed to queue request: {e}"
            )));
        }
        Ok(())
    }

    async fn request(&self, message: Value, cancel: Option<CancelToken>) -> Result<Value> {
        let kind = message
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        let encoded = encode_request(message)?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(encoded.id.clone(), tx);
        self.queue(encoded.text, Some(&encoded.id)).await?;
        let cancel = cancel.unwrap_or_default();
        tokio::select! {
            response = rx => match response {
                Ok(result) => result,
                Err(_) => Err(GroundlinkError::Transport(
                    "Response channel closed".to_string(),
                )),
            },
            _ = tokio::time::sleep(self.timeout) => {
                self.forget(&encoded.id).await;
                Err(GroundlinkError::Timeout(kind))
            }
            _ = cancel.cancelled() => {
                self.forget(&encoded.id).await;
                Err(GroundlinkError::Cancelled)
            }
        }
    }
}

#[async_trait]
impl MessageChannel for ServerChannel {
    async fn send_message(&self, message: Outbound) -> Result<Value> {
        self.request(message.into_value(), None).await
    }

    async fn send_message_with_cancel(
        &self,
        message: Outbound,
        cancel: CancelToken,
    ) -> Result<Value> {
        self.request(message.into_value(), Some(cancel)).await
    }

    async fn send_forget(&self, message: Outbound) -> Result<()> {
        let encoded = encode_request(message.into_value())?;
        self.queue(encoded.text, None).await
    }

    fn subscribe(&self, message_type: &str, handler: NotificationHandler) -> Subscription {
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .entry(message_type.to_string())
            .or_default()
            .push((id, handler));
        Subscription {
            message_type: message_type.to_string(),
            id,
            handlers: Arc::clone(&self.handlers),
        }
    }
}
