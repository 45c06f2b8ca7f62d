//! The event broker.
//!
//! Single authority for SSE delivery ordering and for the only cross-process
//! synchronization point in the system: the load-acknowledgement handshake.
//!
//! Viewers and the worker each hold one outbound channel; frames are queued
//! through unbounded senders, so no lock is ever held across network I/O.
//! A connection whose receiver is gone is evicted on the first failed send
//! and never retried.

use std::fmt;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use liveview_core::EventType;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long `load` waits for a viewer to confirm an asset.
pub const LOAD_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// One SSE frame payload, already in `<TYPE>:<base64(data)>` form.
pub type Frame = String;

fn encode_frame(kind: &str, data: &str) -> Frame {
    format!("{kind}:{}", STANDARD.encode(data.as_bytes()))
}

pub struct EventBroker {
    /// Active viewer connections mapped by connection id.
    viewers: DashMap<Uuid, mpsc::UnboundedSender<Frame>>,
    /// At most one live worker channel.
    worker: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    /// Resource paths confirmed loaded by at least one viewer, in
    /// confirmation order. Append-only.
    loads: Mutex<Vec<String>>,
    /// Parked acknowledgement for the load in flight, if any.
    pending_ack: Mutex<Option<oneshot::Sender<()>>>,
    /// Serializes load handshakes so only one ack can be pending.
    load_serial: tokio::sync::Mutex<()>,
    ack_timeout: Duration,
    port: u16,
}

impl fmt::Debug for EventBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBroker")
            .field("viewer_count", &self.viewers.len())
            .field("worker_connected", &self.worker.lock().is_some())
            .field("load_count", &self.loads.lock().len())
            .field("port", &self.port)
            .finish()
    }
}

impl EventBroker {
    pub fn new(port: u16) -> Self {
        Self {
            viewers: DashMap::new(),
            worker: Mutex::new(None),
            loads: Mutex::new(Vec::new()),
            pending_ack: Mutex::new(None),
            load_serial: tokio::sync::Mutex::new(()),
            ack_timeout: LOAD_ACK_TIMEOUT,
            port,
        }
    }

    /// Override the acknowledgement deadline (used by tests).
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Register a viewer connection and replay the load registry to it.
    ///
    /// The replay frames are queued before the connection joins the broadcast
    /// set, so a late viewer sees every confirmed LOAD, in registry order,
    /// before any other event.
    pub fn subscribe_viewer(&self) -> (Uuid, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::now_v7();

        {
            let loads = self.loads.lock();
            if !loads.is_empty() {
                info!(%id, count = loads.len(), "replaying load registry to new viewer");
            }
            for path in loads.iter() {
                let _ = tx.send(encode_frame(EventType::Load.as_str(), path));
            }
        }

        self.viewers.insert(id, tx);
        debug!(%id, viewers = self.viewers.len(), "viewer subscribed");
        (id, rx)
    }

    /// Claim the single worker channel, replacing any previous one (which
    /// closes the stale worker's stream).
    pub fn claim_worker_channel(&self) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.worker.lock().replace(tx).is_some() {
            debug!("replaced existing worker channel");
        }
        rx
    }

    /// Drop the worker channel so a stale worker can no longer relay.
    pub fn evict_worker_channel(&self) {
        if self.worker.lock().take().is_some() {
            debug!("worker channel evicted");
        }
    }

    /// Broadcast one event frame to every registered viewer. Connections
    /// whose write fails are dropped immediately; failures are not reported
    /// back to the source process.
    pub fn dispatch_to_viewers(&self, event: EventType, data: &str) {
        if self.viewers.is_empty() {
            info!("no viewers connected - open http://localhost:{}/ in your browser", self.port);
            return;
        }

        debug!(%event, "broadcasting event");
        let frame = encode_frame(event.as_str(), data);
        self.viewers.retain(|id, sender| {
            if sender.send(frame.clone()).is_ok() {
                true
            } else {
                warn!(%id, "viewer connection closed; evicting");
                false
            }
        });
    }

    /// Ask viewers to load `resource` and wait for the first confirmation.
    ///
    /// No-op when the resource is already confirmed. Otherwise one LOAD frame
    /// is broadcast and the calling task blocks up to the acknowledgement
    /// deadline; only a confirmed ack records the resource, so a timed-out
    /// load can be retried later with the same path. Rendering that depends
    /// on an asset must not continue until the asset is confirmed in at
    /// least one browser context, so this deliberately blocks the
    /// output-draining task.
    pub async fn load(&self, resource: &str) {
        if self.is_loaded(resource) {
            return;
        }

        let _serial = self.load_serial.lock().await;
        if self.is_loaded(resource) {
            return;
        }

        let (tx, rx) = oneshot::channel();
        *self.pending_ack.lock() = Some(tx);
        self.dispatch_to_viewers(EventType::Load, resource);

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(())) => {
                debug!(resource, "load confirmed");
                self.loads.lock().push(resource.to_string());
            }
            _ => warn!(resource, "LOAD timeout"),
        }
        *self.pending_ack.lock() = None;
    }

    /// Resolve the pending load handshake, if one is waiting. Safe to call
    /// at any time; a stray acknowledgement is ignored.
    pub fn acknowledge_load(&self) {
        if let Some(ack) = self.pending_ack.lock().take() {
            let _ = ack.send(());
        } else {
            debug!("load acknowledgement with no pending load");
        }
    }

    /// Write one frame to the worker channel, tagged with the correlation id
    /// so the worker can dispatch it to the right callback. Dropped with a
    /// log line when no worker channel is open.
    pub fn relay_to_worker(&self, correlation_id: &str, path: &str, data: &str) {
        let mut slot = self.worker.lock();
        let Some(sender) = slot.as_ref() else {
            warn!(%path, "no worker channel open; dropping response");
            return;
        };

        info!(%path, "relaying response to worker");
        if sender.send(encode_frame(correlation_id, data)).is_err() {
            warn!("worker channel closed; evicting");
            *slot = None;
        }
    }

    fn is_loaded(&self, resource: &str) -> bool {
        self.loads.lock().iter().any(|known| known == resource)
    }

    /// Confirmed-loaded resources, in confirmation order.
    pub fn loaded_resources(&self) -> Vec<String> {
        self.loads.lock().clone()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }
}
