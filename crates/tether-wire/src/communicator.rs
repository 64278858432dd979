//! Request/response messaging over one channel.
//!
//! A [`Communicator`] correlates outgoing requests with their responses by
//! message id and dispatches incoming requests to the first route whose
//! pattern matches. Each incoming request is handled on its own task, so a
//! slow handler never blocks the channel.

use crate::channel::{ChannelHandler, ChannelProxy, WireError};
use crate::message::Message;
use crate::pattern::{PathInfo, RoutePattern};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tether_types::config::CommunicatorOptions;
use tether_types::{RemoteError, TetherError, TetherResult};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handles requests arriving on a route.
///
/// Implemented for any `Fn(Communicator, PathInfo, Value) -> impl Future`.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the response body, or an error that is sent back to the caller.
    async fn handle(
        &self,
        communicator: Communicator,
        path_info: PathInfo,
        body: Value,
    ) -> TetherResult<Value>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Communicator, PathInfo, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TetherResult<Value>> + Send + 'static,
{
    async fn handle(
        &self,
        communicator: Communicator,
        path_info: PathInfo,
        body: Value,
    ) -> TetherResult<Value> {
        (self)(communicator, path_info, body).await
    }
}

#[derive(Clone)]
struct Route {
    pattern: Arc<dyn RoutePattern>,
    handler: Arc<dyn RequestHandler>,
}

type PendingSender = oneshot::Sender<TetherResult<Value>>;

struct CommunicatorState {
    id: String,
    timeout: Option<Duration>,
    channel: RwLock<Option<Arc<dyn ChannelProxy>>>,
    routes: RwLock<Vec<Route>>,
    pending: DashMap<String, PendingSender>,
    closed: watch::Sender<bool>,
    disposed: AtomicBool,
}

/// One endpoint of a request/response conversation.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct Communicator {
    state: Arc<CommunicatorState>,
}

/// Channel handler feeding a communicator.
struct Dispatcher {
    state: Weak<CommunicatorState>,
}

impl Dispatcher {
    fn communicator(&self) -> Option<Communicator> {
        self.state.upgrade().map(|state| Communicator { state })
    }
}

impl ChannelHandler for Dispatcher {
    fn on_data(&self, message: Message) {
        if let Some(communicator) = self.communicator() {
            communicator.on_message(message);
        }
    }

    fn on_close(&self) {
        if let Some(communicator) = self.communicator() {
            communicator.on_channel_closed();
        }
    }

    fn on_error(&self, error: &WireError) {
        if let Some(communicator) = self.communicator() {
            warn!(communicator = %communicator.id(), error = %error, "Channel error");
        }
    }
}

impl Communicator {
    /// Create a communicator and attach it to `channel`.
    ///
    /// Must be called within a Tokio runtime: the channel starts delivering
    /// messages as soon as the communicator is attached.
    pub fn new(channel: Arc<dyn ChannelProxy>, options: CommunicatorOptions) -> TetherResult<Self> {
        let communicator = Self::detached(channel, options);
        communicator.attach()?;
        Ok(communicator)
    }

    /// Create a communicator that does not receive anything until
    /// [`Communicator::attach`], so routes can be installed first.
    pub(crate) fn detached(channel: Arc<dyn ChannelProxy>, options: CommunicatorOptions) -> Self {
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (closed, _) = watch::channel(false);
        let state = Arc::new(CommunicatorState {
            id,
            timeout: options.timeout_duration(),
            channel: RwLock::new(Some(channel)),
            routes: RwLock::new(Vec::new()),
            pending: DashMap::new(),
            closed,
            disposed: AtomicBool::new(false),
        });
        Self { state }
    }

    /// Install the dispatcher on the channel.
    pub(crate) fn attach(&self) -> TetherResult<()> {
        let channel = self.channel()?;
        channel.set_handler(Some(Arc::new(Dispatcher {
            state: Arc::downgrade(&self.state),
        })))?;
        debug!(communicator = %self.state.id, "Communicator attached");
        Ok(())
    }

    /// Communicator id.
    pub fn id(&self) -> &str {
        &self.state.id
    }

    /// Configured request timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.state.timeout
    }

    /// Whether [`Communicator::dispose`] was called.
    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }

    /// Whether the channel closed or the communicator was disposed.
    pub fn is_closed(&self) -> bool {
        *self.state.closed.borrow()
    }

    /// Resolves once the channel closes or the communicator is disposed.
    pub async fn closed(&self) {
        let mut rx = self.state.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.state.pending.len()
    }

    /// Whether two handles share the same communicator.
    pub fn ptr_eq(&self, other: &Communicator) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    fn describe(&self) -> String {
        format!("Communicator ({})", self.state.id)
    }

    fn validate_disposal(&self) -> TetherResult<()> {
        if self.is_disposed() {
            return Err(TetherError::Disposed(self.describe()));
        }
        Ok(())
    }

    fn channel(&self) -> TetherResult<Arc<dyn ChannelProxy>> {
        self.state
            .channel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| TetherError::Disposed(self.describe()))
    }

    /// Append a route. Earlier routes take precedence.
    pub fn map(
        &self,
        pattern: Arc<dyn RoutePattern>,
        handler: Arc<dyn RequestHandler>,
    ) -> TetherResult<()> {
        self.validate_disposal()?;
        debug!(communicator = %self.state.id, pattern = pattern.raw(), "Route mapped");
        self.state
            .routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Route { pattern, handler });
        Ok(())
    }

    /// Remove the first route whose pattern equals `pattern`.
    pub fn unmap(&self, pattern: &dyn RoutePattern) -> TetherResult<Option<Arc<dyn RequestHandler>>> {
        self.validate_disposal()?;
        let mut routes = self.state.routes.write().unwrap_or_else(|e| e.into_inner());
        let removed = routes
            .iter()
            .position(|route| route.pattern.equals(pattern))
            .map(|index| routes.remove(index).handler);
        Ok(removed)
    }

    /// Send a request and wait for its response body.
    pub async fn send(&self, path: &str, body: Value) -> TetherResult<Value> {
        self.validate_disposal()?;
        if path.trim().is_empty() {
            return Err(TetherError::InvalidArgument(
                "path must be a non-empty string".to_string(),
            ));
        }
        let channel = self.channel()?;

        let id = Uuid::new_v4().to_string();
        let (tx, mut rx) = oneshot::channel();
        // Registered before the write so a fast response always finds it.
        self.state.pending.insert(id.clone(), tx);

        let message = Message::request(id.clone(), path, body).with_sender(self.state.id.clone());
        debug!(communicator = %self.state.id, message_id = %id, path, "SEND");
        if !channel.send_data(&message) {
            self.state.pending.remove(&id);
            debug!(communicator = %self.state.id, message_id = %id, path, "FAILED");
            return Err(TetherError::ChannelClosed);
        }
        debug!(communicator = %self.state.id, message_id = %id, path, "SENT");

        let outcome = match self.state.timeout {
            None => rx.await,
            Some(timeout) => match tokio::time::timeout(timeout, &mut rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    if self.state.pending.remove(&id).is_some() {
                        warn!(
                            communicator = %self.state.id,
                            message_id = %id,
                            path,
                            "Request timed out"
                        );
                        return Err(TetherError::Timeout {
                            communicator: self.state.id.clone(),
                            message_id: id,
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                    // The response was matched while the timer fired; it wins.
                    rx.await
                }
            },
        };
        outcome.unwrap_or_else(|_| Err(TetherError::Disposed(self.describe())))
    }

    fn on_message(&self, message: Message) {
        match message.succeeded {
            Some(succeeded) => self.on_response(message, succeeded),
            None => self.on_request(message),
        }
    }

    fn on_response(&self, message: Message, succeeded: bool) {
        let Some((_, tx)) = self.state.pending.remove(&message.id) else {
            warn!(
                communicator = %self.state.id,
                message_id = %message.id,
                "Dropping response without a pending request"
            );
            return;
        };
        debug!(
            communicator = %self.state.id,
            message_id = %message.id,
            succeeded,
            latency_ms = ?message.age_ms(),
            "RECEIVE"
        );
        let result = if succeeded {
            Ok(message.body)
        } else {
            Err(TetherError::Remote(RemoteError::from_body(&message.body)))
        };
        let _ = tx.send(result);
    }

    fn find_route(&self, path: &str) -> Option<(Arc<dyn RequestHandler>, PathInfo)> {
        let routes = self.state.routes.read().unwrap_or_else(|e| e.into_inner());
        routes.iter().find_map(|route| {
            route
                .pattern
                .match_path(path)
                .map(|info| (Arc::clone(&route.handler), info))
        })
    }

    fn on_request(&self, message: Message) {
        let Some(path) = message.path.clone() else {
            warn!(communicator = %self.state.id, message_id = %message.id, "Request without a path");
            self.respond(
                &message.id,
                Err(TetherError::Protocol("request without a path".to_string())),
            );
            return;
        };
        let route = self.find_route(&path);
        let communicator = self.clone();
        tokio::spawn(async move {
            let result = match route {
                Some((handler, path_info)) => {
                    handler
                        .handle(communicator.clone(), path_info, message.body)
                        .await
                }
                None => {
                    warn!(communicator = %communicator.state.id, path = %path, "No route matches request");
                    Err(TetherError::NoRoute(path))
                }
            };
            communicator.respond(&message.id, result);
        });
    }

    fn respond(&self, id: &str, result: TetherResult<Value>) {
        let message = match result {
            Ok(body) => Message::response(id, true, body),
            Err(e) => {
                debug!(communicator = %self.state.id, message_id = %id, error = %e, "Request failed");
                Message::response(id, false, e.to_remote().to_body())
            }
        }
        .with_sender(self.state.id.clone());

        let channel = self
            .state
            .channel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match channel {
            Some(channel) if channel.send_data(&message) => {
                debug!(communicator = %self.state.id, message_id = %id, "RESPOND");
            }
            Some(_) => {
                warn!(communicator = %self.state.id, message_id = %id, "Failed to send response");
            }
            None => {
                debug!(communicator = %self.state.id, message_id = %id, "Disposed before responding");
            }
        }
    }

    fn reject_pending(&self, make_error: impl Fn() -> TetherError) {
        let ids: Vec<String> = self
            .state
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((_, tx)) = self.state.pending.remove(&id) {
                let _ = tx.send(Err(make_error()));
            }
        }
    }

    fn on_channel_closed(&self) {
        info!(communicator = %self.state.id, "Channel closed");
        self.reject_pending(|| TetherError::ChannelClosed);
        self.state.closed.send_replace(true);
    }

    /// Close the channel, reject pending requests and drop all routes.
    /// Idempotent.
    pub async fn dispose(&self) {
        if self.state.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channel = self
            .state
            .channel
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(channel) = channel {
            let _ = channel.set_handler(None);
            channel.dispose().await;
        }
        let description = self.describe();
        self.reject_pending(|| TetherError::Disposed(description.clone()));
        self.state
            .routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.state.closed.send_replace(true);
        info!(communicator = %self.state.id, "Communicator disposed");
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("id", &self.state.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryChannel;
    use crate::pattern::{RegexPattern, StringPattern};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn pair_with(options: CommunicatorOptions) -> (Communicator, Communicator) {
        let (a, b) = MemoryChannel::pair();
        (
            Communicator::new(a, options).unwrap(),
            Communicator::new(b, CommunicatorOptions::default()).unwrap(),
        )
    }

    fn pair() -> (Communicator, Communicator) {
        pair_with(CommunicatorOptions::default())
    }

    fn echo() -> Arc<dyn RequestHandler> {
        Arc::new(|_c: Communicator, _p: PathInfo, body: Value| async move {
            Ok::<_, TetherError>(body)
        })
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let (client, server) = pair();
        server
            .map(StringPattern::shared("/echo").unwrap(), echo())
            .unwrap();

        let reply = client.send("/echo", json!({"hello": "world"})).await.unwrap();
        assert_eq!(reply, json!({"hello": "world"}));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_regex_route_sees_captures() {
        let (client, server) = pair();
        let handler: Arc<dyn RequestHandler> =
            Arc::new(|_c: Communicator, info: PathInfo, _b: Value| async move {
                Ok::<_, TetherError>(json!(info.param("1").unwrap_or_default()))
            });
        server
            .map(RegexPattern::shared(r"^/users/(\w+)$").unwrap(), handler)
            .unwrap();

        let reply = client.send("/users/ada", Value::Null).await.unwrap();
        assert_eq!(reply, json!("ada"));
    }

    #[tokio::test]
    async fn test_first_matching_route_wins() {
        let (client, server) = pair();
        let first: Arc<dyn RequestHandler> = Arc::new(|_c: Communicator, _p: PathInfo, _b: Value| async move {
            Ok::<_, TetherError>(json!("first"))
        });
        let second: Arc<dyn RequestHandler> = Arc::new(|_c: Communicator, _p: PathInfo, _b: Value| async move {
            Ok::<_, TetherError>(json!("second"))
        });
        server.map(RegexPattern::shared("^/a").unwrap(), first).unwrap();
        server.map(StringPattern::shared("/a").unwrap(), second).unwrap();

        assert_eq!(client.send("/a", Value::Null).await.unwrap(), json!("first"));

        let removed = server.unmap(&RegexPattern::new("^/a").unwrap()).unwrap();
        assert!(removed.is_some());
        assert_eq!(client.send("/a", Value::Null).await.unwrap(), json!("second"));
        assert!(server
            .unmap(&StringPattern::new("/missing").unwrap())
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_handler_error_reaches_caller() {
        let (client, server) = pair();
        let failing: Arc<dyn RequestHandler> = Arc::new(|_c: Communicator, _p: PathInfo, _b: Value| async move {
            Err::<Value, _>(TetherError::TargetNotFound("r-9".to_string()))
        });
        server.map(StringPattern::shared("/fail").unwrap(), failing).unwrap();

        let err = client.send("/fail", Value::Null).await.unwrap_err();
        assert!(err.is_remote("TargetNotFound"));
        assert!(err.to_string().contains("Target (r-9) doesn't exist."));
    }

    #[tokio::test]
    async fn test_unmatched_path_fails_fast() {
        let (client, _server) = pair();
        let err = client.send("/nowhere", Value::Null).await.unwrap_err();
        assert!(err.is_remote("NoRoute"));
    }

    #[tokio::test]
    async fn test_invalid_path_rejected() {
        let (client, _server) = pair();
        assert!(matches!(
            client.send("  ", Value::Null).await,
            Err(TetherError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_ignored() {
        let (client, server) = pair_with(CommunicatorOptions {
            id: Some("client".to_string()),
            timeout: Some(50),
        });
        let slow: Arc<dyn RequestHandler> = Arc::new(|_c: Communicator, _p: PathInfo, body: Value| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, TetherError>(body)
        });
        server.map(StringPattern::shared("/slow").unwrap(), slow).unwrap();
        server.map(StringPattern::shared("/echo").unwrap(), echo()).unwrap();

        let err = client.send("/slow", json!(1)).await.unwrap_err();
        match err {
            TetherError::Timeout {
                communicator,
                timeout_ms,
                ..
            } => {
                assert_eq!(communicator, "client");
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("Expected Timeout, got {other:?}"),
        }
        assert_eq!(client.pending_count(), 0);

        // Let the late response arrive; it must be dropped without disturbing
        // later requests.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(client.send("/echo", json!(2)).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_duplicate_response_settles_once() {
        struct Capture {
            tx: mpsc::UnboundedSender<Message>,
        }
        impl ChannelHandler for Capture {
            fn on_data(&self, message: Message) {
                let _ = self.tx.send(message);
            }
        }

        let (a, raw) = MemoryChannel::pair();
        let client = Communicator::new(a, CommunicatorOptions::default()).unwrap();
        let (tx, mut requests) = mpsc::unbounded_channel();
        raw.set_handler(Some(Arc::new(Capture { tx }))).unwrap();

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.send("/dup", Value::Null).await }
        });
        let request = requests.recv().await.unwrap();
        assert_eq!(request.path.as_deref(), Some("/dup"));
        assert!(raw.send_data(&Message::response(request.id.clone(), true, json!("one"))));
        assert!(raw.send_data(&Message::response(request.id.clone(), true, json!("two"))));

        assert_eq!(call.await.unwrap().unwrap(), json!("one"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_correlate() {
        let (client, server) = pair();
        let delayed: Arc<dyn RequestHandler> = Arc::new(|_c: Communicator, _p: PathInfo, body: Value| async move {
            let n = body.as_u64().unwrap_or_default();
            tokio::time::sleep(Duration::from_millis(30 - n * 3)).await;
            Ok::<_, TetherError>(json!(n * 10))
        });
        server.map(StringPattern::shared("/n").unwrap(), delayed).unwrap();

        let calls: Vec<_> = (0..8u64)
            .map(|n| {
                let client = client.clone();
                tokio::spawn(async move { (n, client.send("/n", json!(n)).await) })
            })
            .collect();
        for call in calls {
            let (n, reply) = call.await.unwrap();
            assert_eq!(reply.unwrap(), json!(n * 10));
        }
    }

    #[tokio::test]
    async fn test_dispose_rejects_pending_and_is_idempotent() {
        let (client, server) = pair();
        let never: Arc<dyn RequestHandler> = Arc::new(|_c: Communicator, _p: PathInfo, _b: Value| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, TetherError>(Value::Null)
        });
        server.map(StringPattern::shared("/never").unwrap(), never).unwrap();

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.send("/never", Value::Null).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.dispose().await;
        client.dispose().await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, TetherError::Disposed(_)));
        assert!(client.is_disposed());
        assert!(client.is_closed());
        client.closed().await;

        assert!(matches!(
            client.send("/never", Value::Null).await,
            Err(TetherError::Disposed(_))
        ));
        assert!(client
            .map(StringPattern::shared("/x").unwrap(), echo())
            .is_err());
    }

    #[tokio::test]
    async fn test_peer_close_rejects_pending() {
        let (client, server) = pair();
        let never: Arc<dyn RequestHandler> = Arc::new(|_c: Communicator, _p: PathInfo, _b: Value| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, TetherError>(Value::Null)
        });
        server.map(StringPattern::shared("/never").unwrap(), never).unwrap();

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.send("/never", Value::Null).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.dispose().await;

        let err = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TetherError::ChannelClosed));
        tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .unwrap();
        assert!(!client.is_disposed());
    }

    #[tokio::test]
    async fn test_handler_can_call_back_into_peer() {
        let (client, server) = pair();
        client
            .map(StringPattern::shared("/whoami").unwrap(), Arc::new(
                |c: Communicator, _p: PathInfo, _b: Value| async move {
                    Ok::<_, TetherError>(json!(c.id().to_string()))
                },
            ))
            .unwrap();
        let relay: Arc<dyn RequestHandler> = Arc::new(|c: Communicator, _p: PathInfo, _b: Value| async move {
            c.send("/whoami", Value::Null).await
        });
        server.map(StringPattern::shared("/relay").unwrap(), relay).unwrap();

        let reply = client.send("/relay", Value::Null).await.unwrap();
        assert_eq!(reply, json!(client.id()));
    }
}
