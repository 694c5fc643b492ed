//! Outstanding get, put and subscription requests, keyed by request id.

use std::{collections::HashMap, sync::Arc};

use crate::{
    client::{
        ClientError,
        callbacks::{
            CallbackSlot, GetCallback, Notification, PutCallback, Retire, UpdateCallback,
        },
    },
    dbr::{Dbr, DbrBasicType, DbrCategory, DbrType},
    messages::MonitorMask,
    utils::wrapping_inplace_add,
};

/// What to ask the server for in a get or subscription.
///
/// Unset fields take the channel's native type and element count, which are
/// only known once it has connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestType {
    pub basic_type: Option<DbrBasicType>,
    pub category: DbrCategory,
    pub count: Option<u32>,
}

impl Default for RequestType {
    fn default() -> Self {
        RequestType {
            basic_type: None,
            category: DbrCategory::Time,
            count: None,
        }
    }
}

impl RequestType {
    pub fn new(category: DbrCategory) -> Self {
        RequestType {
            category,
            ..Default::default()
        }
    }
    pub fn with_type(mut self, basic_type: DbrBasicType) -> Self {
        self.basic_type = Some(basic_type);
        self
    }
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    /// The wire type and count to request from a channel with this native layout
    pub(crate) fn resolve(&self, native_type: DbrBasicType, native_count: u32) -> (DbrType, u32) {
        let basic_type = self.basic_type.unwrap_or(native_type);
        let count = match self.count {
            Some(count) if native_count > 0 => count.min(native_count),
            Some(count) => count,
            None => native_count,
        };
        (DbrType::new(basic_type, self.category), count.max(1))
    }
}

impl From<DbrType> for RequestType {
    fn from(value: DbrType) -> Self {
        RequestType::new(value.category).with_type(value.basic_type)
    }
}

pub(crate) enum RequestKind {
    Get {
        slot: Arc<CallbackSlot<GetCallback>>,
    },
    Put {
        slot: Arc<CallbackSlot<PutCallback>>,
    },
    Subscribe {
        slot: Arc<CallbackSlot<UpdateCallback>>,
        request: RequestType,
        mask: MonitorMask,
    },
    /// Cancelled, waiting for the server to confirm. Updates are discarded.
    SubscribeCancel,
}

pub(crate) struct PendingRequest {
    pub id: u32,
    pub cid: u32,
    /// Circuit the request was sent on. Subscriptions awaiting reinstatement have none.
    pub circuit: Option<u64>,
    /// Wire type and count last sent to the server
    pub sent: Option<(DbrType, u32)>,
    pub kind: RequestKind,
}

/// What the caller needs to finish cancelling a subscription
pub(crate) struct Cancelled {
    pub cid: u32,
    /// Set when the server holds the subscription and must be told
    pub on_server: Option<(u64, DbrType, u32)>,
}

#[derive(Default)]
pub(crate) struct RequestTable {
    requests: HashMap<u32, PendingRequest>,
    next_id: u32,
}

impl RequestTable {
    /// Add a request under a fresh id. Ids wrap but skip any still in use.
    pub fn register(
        &mut self,
        cid: u32,
        circuit: Option<u64>,
        sent: Option<(DbrType, u32)>,
        kind: RequestKind,
    ) -> Result<u32, ClientError> {
        if self.requests.len() >= u32::MAX as usize {
            return Err(ClientError::ResourceExhausted);
        }
        let id = loop {
            let id = wrapping_inplace_add(&mut self.next_id);
            if !self.requests.contains_key(&id) {
                break id;
            }
        };
        self.requests.insert(
            id,
            PendingRequest {
                id,
                cid,
                circuit,
                sent,
                kind,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Option<&PendingRequest> {
        self.requests.get(&id)
    }

    /// Withdraw a request that never made it onto the wire
    pub fn discard(&mut self, id: u32) -> Option<PendingRequest> {
        self.requests.remove(&id)
    }

    pub fn complete_get(
        &mut self,
        id: u32,
        result: Result<Dbr, ClientError>,
    ) -> Option<Notification> {
        if !matches!(self.requests.get(&id)?.kind, RequestKind::Get { .. }) {
            return None;
        }
        match self.requests.remove(&id)?.kind {
            RequestKind::Get { slot } => Some(Notification::Get(slot, result)),
            _ => None,
        }
    }

    pub fn complete_put(
        &mut self,
        id: u32,
        result: Result<(), ClientError>,
    ) -> Option<Notification> {
        if !matches!(self.requests.get(&id)?.kind, RequestKind::Put { .. }) {
            return None;
        }
        match self.requests.remove(&id)?.kind {
            RequestKind::Put { slot } => Some(Notification::Put(slot, result)),
            _ => None,
        }
    }

    /// A subscription update. Updates for cancelled or unknown ids are dropped.
    pub fn deliver_update(
        &self,
        id: u32,
        result: Result<Dbr, ClientError>,
    ) -> Option<Notification> {
        match &self.requests.get(&id)?.kind {
            RequestKind::Subscribe { slot, .. } => Some(Notification::Update(slot.clone(), result)),
            _ => None,
        }
    }

    /// Is this id a subscription the server should still be sending updates for
    pub fn is_live_subscription(&self, id: u32) -> bool {
        matches!(
            self.requests.get(&id).map(|r| &r.kind),
            Some(RequestKind::Subscribe { .. })
        )
    }

    /// The server acknowledged a cancel; release the id
    pub fn confirm_cancel(&mut self, id: u32) -> bool {
        if matches!(
            self.requests.get(&id).map(|r| &r.kind),
            Some(RequestKind::SubscribeCancel)
        ) {
            self.requests.remove(&id);
            true
        } else {
            false
        }
    }

    /// The server rejected a single request.
    ///
    /// One-shot requests are removed. Subscriptions are told but kept.
    pub fn fail_request(&mut self, id: u32, error: ClientError) -> Option<Notification> {
        if let Some(RequestKind::Subscribe { slot, .. }) = self.requests.get(&id).map(|r| &r.kind) {
            return Some(Notification::Update(slot.clone(), Err(error)));
        }
        match self.requests.remove(&id)?.kind {
            RequestKind::Get { slot } => Some(Notification::Get(slot, Err(error))),
            RequestKind::Put { slot } => Some(Notification::Put(slot, Err(error))),
            _ => None,
        }
    }

    /// Cancel a subscription. Cancelling twice, or cancelling an id that is
    /// not a subscription, returns `None`.
    pub fn cancel(&mut self, id: u32) -> Option<Cancelled> {
        let entry = self.requests.get_mut(&id)?;
        if !matches!(entry.kind, RequestKind::Subscribe { .. }) {
            return None;
        }
        let on_server = match (entry.circuit, entry.sent) {
            (Some(circuit), Some((data_type, count))) => Some((circuit, data_type, count)),
            _ => None,
        };
        let cid = entry.cid;
        if on_server.is_some() {
            entry.kind = RequestKind::SubscribeCancel;
        } else {
            self.requests.remove(&id);
        }
        Some(Cancelled { cid, on_server })
    }

    /// Fail every request matching a filter, usually those on a lost circuit.
    ///
    /// One-shots are removed, subscriptions are told and left waiting for
    /// reinstatement, and cancels still awaiting confirmation are forgotten.
    pub fn fail_where<P>(&mut self, filter: P, error: ClientError) -> Vec<Notification>
    where
        P: Fn(&PendingRequest) -> bool,
    {
        let mut ids: Vec<u32> = self
            .requests
            .values()
            .filter(|r| filter(r))
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();

        let mut notifications = Vec::new();
        for id in ids {
            let Some(entry) = self.requests.get_mut(&id) else {
                continue;
            };
            if let RequestKind::Subscribe { slot, .. } = &entry.kind {
                notifications.push(Notification::Update(slot.clone(), Err(error.clone())));
                entry.circuit = None;
                entry.sent = None;
                continue;
            }
            let Some(entry) = self.requests.remove(&id) else {
                continue;
            };
            match entry.kind {
                RequestKind::Get { slot } => {
                    notifications.push(Notification::Get(slot, Err(error.clone())))
                }
                RequestKind::Put { slot } => {
                    notifications.push(Notification::Put(slot, Err(error.clone())))
                }
                _ => {}
            }
        }
        notifications
    }

    /// Subscriptions on a channel that need sending to its (new) circuit
    pub fn awaiting_reconnection(&self, cid: u32) -> Vec<(u32, RequestType, MonitorMask)> {
        let mut pending: Vec<_> = self
            .requests
            .values()
            .filter(|r| r.cid == cid && r.circuit.is_none())
            .filter_map(|r| match &r.kind {
                RequestKind::Subscribe { request, mask, .. } => Some((r.id, *request, *mask)),
                _ => None,
            })
            .collect();
        pending.sort_unstable_by_key(|(id, _, _)| *id);
        pending
    }

    /// Record that a subscription has been (re)installed on a circuit
    pub fn mark_sent(&mut self, id: u32, circuit: u64, data_type: DbrType, count: u32) {
        if let Some(entry) = self.requests.get_mut(&id) {
            entry.circuit = Some(circuit);
            entry.sent = Some((data_type, count));
        }
    }

    /// Forget everything belonging to a destroyed channel.
    ///
    /// Returns the callback slots so they can be retired outside the lock.
    pub fn remove_channel(&mut self, cid: u32) -> Vec<Arc<dyn Retire>> {
        let ids: Vec<u32> = self
            .requests
            .values()
            .filter(|r| r.cid == cid)
            .map(|r| r.id)
            .collect();
        let mut slots: Vec<Arc<dyn Retire>> = Vec::new();
        for id in ids {
            let Some(entry) = self.requests.remove(&id) else {
                continue;
            };
            match entry.kind {
                RequestKind::Get { slot } => slots.push(slot),
                RequestKind::Put { slot } => slots.push(slot),
                RequestKind::Subscribe { slot, .. } => slots.push(slot),
                RequestKind::SubscribeCancel => {}
            }
        }
        slots
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbr::DbrValue;
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    fn update_slot(counter: Arc<AtomicUsize>) -> Arc<CallbackSlot<UpdateCallback>> {
        CallbackSlot::new(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn subscribe(table: &mut RequestTable, cid: u32, circuit: Option<u64>) -> u32 {
        let sent = circuit.map(|_| (DbrType::new(DbrBasicType::Double, DbrCategory::Time), 1));
        table
            .register(
                cid,
                circuit,
                sent,
                RequestKind::Subscribe {
                    slot: update_slot(Arc::new(AtomicUsize::new(0))),
                    request: RequestType::default(),
                    mask: MonitorMask::default(),
                },
            )
            .unwrap()
    }

    #[test]
    fn get_completes_once() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let mut table = RequestTable::default();
        let id = table
            .register(
                0,
                Some(1),
                None,
                RequestKind::Get {
                    slot: CallbackSlot::new(Box::new(move |r: Result<Dbr, ClientError>| {
                        sink.lock().unwrap().push(r.unwrap().take_value());
                    })),
                },
            )
            .unwrap();
        table
            .complete_get(id, Ok(Dbr::Basic(DbrValue::Double(vec![3.5]))))
            .unwrap()
            .deliver();
        assert!(table.complete_get(id, Ok(Dbr::Basic(0.0f64.into()))).is_none());
        assert_eq!(table.len(), 0);
        assert_eq!(*received.lock().unwrap(), vec![DbrValue::Double(vec![3.5])]);
    }

    #[test]
    fn ids_skip_live_entries() {
        let mut table = RequestTable {
            next_id: u32::MAX,
            ..Default::default()
        };
        let first = subscribe(&mut table, 0, None);
        assert_eq!(first, u32::MAX);
        let second = subscribe(&mut table, 0, None);
        assert_eq!(second, 0);
        table.next_id = u32::MAX;
        let third = subscribe(&mut table, 0, None);
        assert_eq!(third, 1);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut table = RequestTable::default();
        let id = subscribe(&mut table, 3, Some(1));
        let cancelled = table.cancel(id).unwrap();
        assert_eq!(cancelled.cid, 3);
        assert!(cancelled.on_server.is_some());
        assert!(table.cancel(id).is_none());
        // Held until the server confirms
        assert_eq!(table.len(), 1);
        assert!(
            table
                .deliver_update(id, Ok(Dbr::Basic(1i32.into())))
                .is_none()
        );
        assert!(table.confirm_cancel(id));
        assert!(!table.confirm_cancel(id));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn cancel_before_connect_releases_immediately() {
        let mut table = RequestTable::default();
        let id = subscribe(&mut table, 3, None);
        assert!(table.cancel(id).unwrap().on_server.is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn circuit_failure() {
        let mut table = RequestTable::default();
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        table
            .register(
                1,
                Some(7),
                None,
                RequestKind::Put {
                    slot: CallbackSlot::new(Box::new(move |r: Result<(), ClientError>| {
                        assert!(matches!(r, Err(ClientError::Disconnected)));
                        counter.fetch_add(1, Ordering::SeqCst);
                    })),
                },
            )
            .unwrap();
        let live = subscribe(&mut table, 1, Some(7));
        let zombie = subscribe(&mut table, 1, Some(7));
        table.cancel(zombie);
        let elsewhere = subscribe(&mut table, 2, Some(8));

        let notifications = table.fail_where(|r| r.circuit == Some(7), ClientError::Disconnected);
        assert_eq!(notifications.len(), 2);
        for n in notifications {
            n.deliver();
        }
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 2);
        assert!(table.get(zombie).is_none());
        assert_eq!(table.get(live).unwrap().circuit, None);
        assert_eq!(table.get(elsewhere).unwrap().circuit, Some(8));

        let waiting = table.awaiting_reconnection(1);
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].0, live);
        table.mark_sent(live, 9, DbrType::new(DbrBasicType::Long, DbrCategory::Time), 1);
        assert!(table.awaiting_reconnection(1).is_empty());
    }

    #[test]
    fn server_error_keeps_subscription() {
        let mut table = RequestTable::default();
        let id = subscribe(&mut table, 1, Some(2));
        assert!(table.fail_request(id, ClientError::ServerSentInvalidMessage).is_some());
        assert!(table.is_live_subscription(id));
    }

    #[test]
    fn request_type_resolution() {
        let native = RequestType::default();
        assert_eq!(
            native.resolve(DbrBasicType::Double, 4),
            (DbrType::new(DbrBasicType::Double, DbrCategory::Time), 4)
        );
        let explicit = RequestType::new(DbrCategory::Basic)
            .with_type(DbrBasicType::String)
            .with_count(10);
        assert_eq!(
            explicit.resolve(DbrBasicType::Double, 4),
            (DbrType::new(DbrBasicType::String, DbrCategory::Basic), 4)
        );
    }
}
