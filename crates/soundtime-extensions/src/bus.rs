//! Request/response correlation over the shared channel.
//!
//! Every outbound request gets a fresh channel token and a one-shot slot in
//! the pending map. The reader hands every incoming envelope to
//! [`RequestBus::resolve`] first; a matching slot is completed and removed,
//! anything else is returned to the caller for dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::ExtensionError;

type Pending = Mutex<HashMap<String, oneshot::Sender<Envelope>>>;

/// Receiving half of the outbound queue, drained by the channel writer.
pub type OutboundReceiver = mpsc::UnboundedReceiver<Envelope>;

struct BusInner {
    pending: Pending,
    outbound: mpsc::UnboundedSender<Envelope>,
    timeout: Option<Duration>,
}

/// Cloneable handle to the correlation bus.
#[derive(Clone)]
pub struct RequestBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for RequestBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBus")
            .field("pending", &self.pending_count())
            .field("timeout", &self.inner.timeout)
            .finish_non_exhaustive()
    }
}

/// Removes a pending slot when the awaiting future completes or is dropped.
struct PendingGuard<'a> {
    pending: &'a Pending,
    channel: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.channel);
    }
}

impl RequestBus {
    /// Create a bus and the receiver for its outbound envelopes.
    ///
    /// `timeout` of `None` waits forever for a reply.
    pub fn new(timeout: Option<Duration>) -> (Self, OutboundReceiver) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let bus = Self {
            inner: Arc::new(BusInner {
                pending: Mutex::new(HashMap::new()),
                outbound,
                timeout,
            }),
        };
        (bus, rx)
    }

    /// Send a request and wait for the reply carrying the same channel.
    ///
    /// Resolves with the reply's `data`, or `None` when the reply has none.
    pub async fn send_async(
        &self,
        kind: &str,
        data: Option<Value>,
        extension_name: Option<&str>,
    ) -> Result<Option<Value>, ExtensionError> {
        let channel = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        self.lock_pending().insert(channel.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            channel: &channel,
        };

        let envelope = Envelope {
            kind: kind.to_string(),
            channel: channel.clone(),
            data,
            extension_name: extension_name.map(str::to_string),
        };
        self.inner
            .outbound
            .send(envelope)
            .map_err(|_| ExtensionError::ChannelClosed)?;

        tracing::trace!(%kind, %channel, "request sent");

        let reply = match self.inner.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    tracing::warn!(%kind, %channel, "request timed out waiting for reply");
                    return Err(ExtensionError::RequestTimeout {
                        kind: kind.to_string(),
                        channel: channel.clone(),
                    });
                }
            },
            None => rx.await,
        };

        let reply = reply.map_err(|_| ExtensionError::ChannelClosed)?;
        Ok(reply.data.filter(|v| !v.is_null()))
    }

    /// Complete the pending request for `envelope.channel`.
    ///
    /// Returns the envelope back when nothing is waiting on its channel.
    pub fn resolve(&self, envelope: Envelope) -> Result<(), Envelope> {
        if envelope.channel.is_empty() {
            return Err(envelope);
        }
        let Some(tx) = self.lock_pending().remove(&envelope.channel) else {
            return Err(envelope);
        };
        tracing::trace!(channel = %envelope.channel, "reply matched pending request");
        // The receiver may already be gone if the caller was cancelled.
        let _ = tx.send(envelope);
        Ok(())
    }

    /// Queue an envelope for the writer without expecting a reply.
    pub fn reply(&self, envelope: Envelope) -> Result<(), ExtensionError> {
        self.inner
            .outbound
            .send(envelope)
            .map_err(|_| ExtensionError::ChannelClosed)
    }

    /// Whether a request is waiting on `channel`.
    pub fn is_pending(&self, channel: &str) -> bool {
        self.lock_pending().contains_key(channel)
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Envelope>>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn next_request(rx: &mut OutboundReceiver) -> Envelope {
        rx.recv().await.expect("outbound queue closed")
    }

    #[tokio::test]
    async fn test_send_async_resolves_with_reply_data() {
        let (bus, mut rx) = RequestBus::new(None);
        let caller = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.send_async("get-volume", None, Some("foo")).await })
        };

        let req = next_request(&mut rx).await;
        assert_eq!(req.kind, "get-volume");
        assert_eq!(req.extension_name.as_deref(), Some("foo"));
        assert!(bus.is_pending(&req.channel));

        bus.resolve(req.reply(Some(json!(42)))).unwrap();

        let result = caller.await.unwrap().unwrap();
        assert_eq!(result, Some(json!(42)));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolved_in_reverse_order() {
        let (bus, mut rx) = RequestBus::new(None);
        let n = 8;

        let mut callers = Vec::new();
        for i in 0..n {
            let bus = bus.clone();
            callers.push(tokio::spawn(async move {
                bus.send_async("get-entity", Some(json!({ "index": i })), None)
                    .await
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..n {
            requests.push(next_request(&mut rx).await);
        }

        let mut channels: Vec<&str> = requests.iter().map(|r| r.channel.as_str()).collect();
        channels.sort_unstable();
        channels.dedup();
        assert_eq!(channels.len(), n, "channels must be unique");

        for req in requests.iter().rev() {
            let index = req.data.as_ref().unwrap()["index"].clone();
            bus.resolve(req.reply(Some(json!({ "echo": index })))).unwrap();
        }

        for (i, caller) in callers.into_iter().enumerate() {
            let value = caller.await.unwrap().unwrap().unwrap();
            assert_eq!(value["echo"], json!(i));
        }
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_unknown_channel_returns_envelope() {
        let (bus, _rx) = RequestBus::new(None);
        let env = Envelope::new("getInstalledExtensions", "not-ours");
        let back = bus.resolve(env.clone()).unwrap_err();
        assert_eq!(back, env);
    }

    #[tokio::test]
    async fn test_resolve_empty_channel_is_never_a_reply() {
        let (bus, _rx) = RequestBus::new(None);
        assert!(bus.resolve(Envelope::new("onStarted", "")).is_err());
    }

    #[tokio::test]
    async fn test_second_reply_on_same_channel_is_not_matched() {
        let (bus, mut rx) = RequestBus::new(None);
        let caller = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.send_async("get-time", None, None).await })
        };
        let req = next_request(&mut rx).await;
        bus.resolve(req.reply(Some(json!(1)))).unwrap();
        assert!(bus.resolve(req.reply(Some(json!(2)))).is_err());
        assert_eq!(caller.await.unwrap().unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_null_reply_data_is_none() {
        let (bus, mut rx) = RequestBus::new(None);
        let caller = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.send_async("play", None, None).await })
        };
        let req = next_request(&mut rx).await;
        bus.resolve(req.reply(Some(Value::Null))).unwrap();
        assert_eq!(caller.await.unwrap().unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_pending_listener() {
        let (bus, mut rx) = RequestBus::new(Some(Duration::from_secs(5)));
        let caller = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.send_async("get-queue", None, None).await })
        };
        let req = next_request(&mut rx).await;
        assert!(bus.is_pending(&req.channel));

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, ExtensionError::RequestTimeout { .. }));
        assert!(!bus.is_pending(&req.channel));
        assert!(bus.resolve(req.reply(None)).is_err());
    }

    #[tokio::test]
    async fn test_cancelled_request_cleans_up() {
        let (bus, mut rx) = RequestBus::new(None);
        let caller = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.send_async("get-queue", None, None).await })
        };
        let req = next_request(&mut rx).await;
        caller.abort();
        let _ = caller.await;
        assert!(!bus.is_pending(&req.channel));
    }

    #[tokio::test]
    async fn test_closed_outbound_queue_fails_fast() {
        let (bus, rx) = RequestBus::new(None);
        drop(rx);
        let err = bus.send_async("get-songs", None, None).await.unwrap_err();
        assert!(matches!(err, ExtensionError::ChannelClosed));
        assert_eq!(bus.pending_count(), 0);
    }
}
