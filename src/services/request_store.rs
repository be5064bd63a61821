use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::{oneshot, watch};

use crate::{
    constants::DUPLICATE_REQUEST_MESSAGE,
    error::{AppError, Result, RpcError},
    models::{NewRequest, PendingRequest, RequestKind},
};

type Settlement = std::result::Result<serde_json::Value, AppError>;

struct Slot {
    request: PendingRequest,
    responder: oneshot::Sender<Settlement>,
}

struct StoreInner {
    // Insertion order is queue order.
    slots: Mutex<Vec<Slot>>,
    next_seq: AtomicU64,
    snapshots: watch::Sender<Arc<Vec<PendingRequest>>>,
}

/// Queue of dapp requests waiting for a human decision.
///
/// At most one request per dedup key is pending at a time, and every request
/// is settled exactly once: approved, rejected, or cancelled when its port
/// goes away. Reads and writes happen under one lock, so snapshots published
/// to subscribers always match the latest mutation.
#[derive(Clone)]
pub struct RequestStore {
    inner: Arc<StoreInner>,
}

/// Caller side of a pending request.
#[derive(Debug)]
pub struct RequestTicket {
    id: String,
    receiver: oneshot::Receiver<Settlement>,
}

impl RequestTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the user's decision. There is no timeout here.
    pub async fn wait(self) -> Result<serde_json::Value> {
        match self.receiver.await {
            Ok(settlement) => settlement,
            Err(_) => Err(AppError::Cancelled(format!(
                "request {} dropped before settlement",
                self.id
            ))),
        }
    }
}

impl Default for RequestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestStore {
    pub fn new() -> Self {
        let (snapshots, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            inner: Arc::new(StoreInner {
                slots: Mutex::new(Vec::new()),
                next_seq: AtomicU64::new(0),
                snapshots,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, slots: &[Slot]) {
        let snapshot: Vec<PendingRequest> = slots.iter().map(|s| s.request.clone()).collect();
        self.inner.snapshots.send_replace(Arc::new(snapshot));
    }

    /// Enqueues a request and returns the ticket its caller waits on.
    ///
    /// Fails immediately with `DuplicateRequest` while another request with
    /// the same dedup key is pending; the caller has to retry after that one
    /// settles.
    pub fn create_request(&self, new: NewRequest) -> Result<RequestTicket> {
        let kind = new.payload.kind();
        let dedup_key = new.payload.dedup_key(&new.origin_url)?;
        let (responder, receiver) = oneshot::channel();

        let mut slots = self.lock();
        if slots.iter().any(|slot| slot.request.dedup_key == dedup_key) {
            tracing::warn!(
                "Duplicate {} request from {} rejected (key {})",
                kind,
                new.origin_url,
                dedup_key
            );
            return Err(AppError::DuplicateRequest(
                DUPLICATE_REQUEST_MESSAGE.to_string(),
            ));
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}.{}", kind.id_prefix(), seq);
        slots.push(Slot {
            request: PendingRequest {
                id: id.clone(),
                kind,
                origin_url: new.origin_url,
                dedup_key,
                payload: new.payload,
                created_at: Utc::now(),
                port_id: new.port_id,
            },
            responder,
        });
        self.publish(&slots);
        drop(slots);

        tracing::info!("Pending request {} created", id);
        Ok(RequestTicket { id, receiver })
    }

    /// Creates the request and waits for its settlement.
    pub async fn request(&self, new: NewRequest) -> Result<serde_json::Value> {
        self.create_request(new)?.wait().await
    }

    pub fn resolve(&self, id: &str, value: serde_json::Value) -> Result<()> {
        self.settle(id, Ok(value))?;
        tracing::info!("Pending request {} approved", id);
        Ok(())
    }

    pub fn reject(&self, id: &str, error: RpcError) -> Result<()> {
        self.settle(id, Err(error.into()))?;
        tracing::info!("Pending request {} rejected", id);
        Ok(())
    }

    // The slot leaves the queue before its responder fires, so a second
    // settle for the same id can only ever see `RequestNotFound`.
    fn settle(&self, id: &str, settlement: Settlement) -> Result<()> {
        let slot = {
            let mut slots = self.lock();
            let position = slots
                .iter()
                .position(|slot| slot.request.id == id)
                .ok_or_else(|| AppError::RequestNotFound(id.to_string()))?;
            let slot = slots.remove(position);
            self.publish(&slots);
            slot
        };

        if slot.responder.send(settlement).is_err() {
            tracing::debug!("Requester for {} went away before settlement", id);
        }
        Ok(())
    }

    /// Cancels every request that arrived over `port_id`. Returns how many.
    pub fn cancel_port(&self, port_id: &str) -> usize {
        let cancelled = self.take_where(|request| request.port_id.as_deref() == Some(port_id));
        let count = cancelled.len();
        for slot in cancelled {
            let _ = slot.responder.send(Err(AppError::Cancelled(format!(
                "port {} disconnected",
                port_id
            ))));
        }
        if count > 0 {
            tracing::info!("Cancelled {} pending request(s) for port {}", count, port_id);
        }
        count
    }

    /// Cancels everything, e.g. when the wallet locks or the service stops.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let cancelled = self.take_where(|_| true);
        let count = cancelled.len();
        for slot in cancelled {
            let _ = slot
                .responder
                .send(Err(AppError::Cancelled(reason.to_string())));
        }
        count
    }

    fn take_where(&self, predicate: impl Fn(&PendingRequest) -> bool) -> Vec<Slot> {
        let mut slots = self.lock();
        let (taken, kept): (Vec<Slot>, Vec<Slot>) =
            std::mem::take(&mut *slots)
                .into_iter()
                .partition(|slot| predicate(&slot.request));
        *slots = kept;
        if !taken.is_empty() {
            self.publish(&slots);
        }
        taken
    }

    /// Current queue, oldest first. `type_filter` matches either the id
    /// prefix (`auth`) or the kind name (`site-authorization`).
    pub fn get_all_requests(&self, type_filter: Option<&str>) -> Vec<PendingRequest> {
        self.lock()
            .iter()
            .map(|slot| &slot.request)
            .filter(|request| match type_filter {
                Some(filter) => {
                    request.kind.id_prefix() == filter || request.kind.to_string() == filter
                }
                None => true,
            })
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<PendingRequest> {
        self.lock()
            .iter()
            .find(|slot| slot.request.id == id)
            .map(|slot| slot.request.clone())
    }

    /// Pending count per kind, zeroes included.
    pub fn counts(&self) -> BTreeMap<RequestKind, usize> {
        let mut counts: BTreeMap<RequestKind, usize> =
            RequestKind::all().into_iter().map(|kind| (kind, 0)).collect();
        for slot in self.lock().iter() {
            *counts.entry(slot.request.kind).or_default() += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot stream for the UI. Dropping the receiver has no effect on
    /// pending requests.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<PendingRequest>>> {
        self.inner.snapshots.subscribe()
    }
}
