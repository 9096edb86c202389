//! Outstanding requests keyed by id.
//!
//! Ids come from a per-connection counter starting at 1 and are never
//! reused. The first request on a connection is the bootstrap `initialize`.

use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::outbox::{ExpiredCallback, OutgoingRequest, ResultCallback};

/// Id of the bootstrap `initialize` request on every connection.
pub(crate) const BOOTSTRAP_ID: u64 = 1;

/// What to do with the reply to a request.
pub(crate) enum ResponseHandler {
    /// Completes the `initialize` handshake inside the client, then hands
    /// the reply to the caller's callback if one was attached.
    Bootstrap(Option<ResultCallback>),
    Callback(ResultCallback),
    Discard,
}

pub(crate) struct PendingRequest {
    pub id: u64,
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub handler: ResponseHandler,
    pub on_expired: Option<ExpiredCallback>,
    pub on_overwritten: Option<ResultCallback>,
    /// Earliest time the next send attempt may happen.
    pub timestamp: Instant,
    pub times_sent: u32,
    /// Superseded by a newer request of the same method after being sent.
    pub overwritten: bool,
}

impl PendingRequest {
    pub fn is_bootstrap(&self) -> bool {
        matches!(self.handler, ResponseHandler::Bootstrap(_))
    }
}

pub(crate) struct RequestLedger {
    next_id: u64,
    entries: BTreeMap<u64, PendingRequest>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self {
            next_id: BOOTSTRAP_ID,
            entries: BTreeMap::new(),
        }
    }

    /// Take the next id without creating an entry.
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert_bootstrap(&mut self, params: serde_json::Value, now: Instant) -> u64 {
        self.insert_bootstrap_entry(Some(params), None, now)
    }

    fn insert_bootstrap_entry(
        &mut self,
        params: Option<serde_json::Value>,
        on_result: Option<ResultCallback>,
        now: Instant,
    ) -> u64 {
        let id = self.allocate_id();
        self.entries.insert(
            id,
            PendingRequest {
                id,
                method: "initialize".to_string(),
                params,
                handler: ResponseHandler::Bootstrap(on_result),
                on_expired: None,
                on_overwritten: None,
                timestamp: now,
                times_sent: 0,
                overwritten: false,
            },
        );
        id
    }

    pub fn bootstrap_mut(&mut self) -> Option<&mut PendingRequest> {
        self.entries.values_mut().find(|e| e.is_bootstrap())
    }

    /// Fold a caller's `initialize` into the bootstrap entry so a
    /// connection never sends the handshake twice. Unsent params are
    /// replaced and a result callback is attached; the bootstrap is created
    /// when it does not exist yet.
    pub fn adopt_bootstrap(&mut self, request: OutgoingRequest, now: Instant) -> u64 {
        let OutgoingRequest {
            params, on_result, ..
        } = request;
        let Some(existing) = self.bootstrap_mut() else {
            return self.insert_bootstrap_entry(params, on_result, now);
        };

        if existing.times_sent == 0 && params.is_some() {
            existing.params = params;
        }
        if on_result.is_some() {
            existing.handler = ResponseHandler::Bootstrap(on_result);
        }
        tracing::trace!(id = existing.id, "Merged initialize into bootstrap request");
        existing.id
    }

    /// Queue `request`, honouring its overwrite flag.
    ///
    /// With overwrite, an unsent request of the same method is updated in
    /// place and keeps its id. A same-method request that was already sent
    /// is flagged overwritten and a new entry is queued beside it.
    pub fn insert(&mut self, request: OutgoingRequest, now: Instant) -> u64 {
        let OutgoingRequest {
            method,
            params,
            overwrite,
            on_result,
            on_expired,
            on_overwritten,
        } = request;
        let handler = on_result.map_or(ResponseHandler::Discard, ResponseHandler::Callback);

        if overwrite
            && let Some(existing) = self
                .entries
                .values_mut()
                .rev()
                .find(|e| e.method == method && !e.overwritten && !e.is_bootstrap())
        {
            if existing.times_sent == 0 {
                tracing::trace!(id = existing.id, method = %method, "Overwriting unsent request");
                existing.params = params;
                existing.handler = handler;
                existing.on_expired = on_expired;
                existing.on_overwritten = on_overwritten;
                return existing.id;
            }
            tracing::trace!(id = existing.id, method = %method, "Superseding sent request");
            existing.overwritten = true;
        }

        let id = self.allocate_id();
        self.entries.insert(
            id,
            PendingRequest {
                id,
                method,
                params,
                handler,
                on_expired,
                on_overwritten,
                timestamp: now,
                times_sent: 0,
                overwritten: false,
            },
        );
        id
    }

    pub fn pop(&mut self, id: u64) -> Option<PendingRequest> {
        self.entries.remove(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut PendingRequest> {
        self.entries.get_mut(&id)
    }

    /// Oldest live request whose next attempt is due.
    pub fn next_due(&self, now: Instant) -> Option<u64> {
        self.entries
            .values()
            .find(|e| !e.overwritten && e.timestamp <= now)
            .map(|e| e.id)
    }

    /// Remove superseded requests whose reply window has passed.
    pub fn take_stale_overwritten(&mut self, now: Instant) -> Vec<PendingRequest> {
        let stale: Vec<u64> = self
            .entries
            .values()
            .filter(|e| e.overwritten && e.timestamp <= now)
            .map(|e| e.id)
            .collect();
        stale.into_iter().filter_map(|id| self.pop(id)).collect()
    }

    /// Whether any request is still queued or awaiting its reply.
    /// Superseded entries only linger for a late reply and do not count.
    pub fn has_live(&self) -> bool {
        self.entries.values().any(|e| !e.overwritten)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every entry and restart the id counter for a new connection.
    /// Returns how many entries were discarded.
    pub fn reset(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        self.next_id = BOOTSTRAP_ID;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn request(method: &str) -> OutgoingRequest {
        OutgoingRequest::new(method)
    }

    #[test]
    fn test_ids_are_monotonic_from_one() {
        let mut ledger = RequestLedger::new();
        let now = Instant::now();
        assert_eq!(ledger.insert_bootstrap(serde_json::json!({}), now), 1);
        assert_eq!(ledger.insert(request("a"), now), 2);
        assert_eq!(ledger.insert(request("b"), now), 3);
        ledger.pop(3);
        assert_eq!(ledger.insert(request("c"), now), 4);
        assert_eq!(ledger.allocate_id(), 5);
    }

    #[test]
    fn test_overwrite_unsent_updates_in_place() {
        let mut ledger = RequestLedger::new();
        let now = Instant::now();
        let first = ledger.insert(
            request("textDocument/completion").params(serde_json::json!({"n": 1})),
            now,
        );
        let second = ledger.insert(
            request("textDocument/completion")
                .params(serde_json::json!({"n": 2}))
                .overwrite(),
            now,
        );
        assert_eq!(first, second);
        assert_eq!(ledger.len(), 1);
        assert_eq!(
            ledger.get_mut(first).unwrap().params,
            Some(serde_json::json!({"n": 2}))
        );
    }

    #[test]
    fn test_overwrite_sent_flags_and_queues_new() {
        let mut ledger = RequestLedger::new();
        let now = Instant::now();
        let first = ledger.insert(request("textDocument/hover"), now);
        ledger.get_mut(first).unwrap().times_sent = 1;

        let second = ledger.insert(request("textDocument/hover").overwrite(), now);
        assert_ne!(first, second);
        assert!(ledger.get_mut(first).unwrap().overwritten);
        assert!(!ledger.get_mut(second).unwrap().overwritten);
        assert_eq!(ledger.next_due(now), Some(second));
    }

    #[test]
    fn test_without_overwrite_duplicates_are_queued() {
        let mut ledger = RequestLedger::new();
        let now = Instant::now();
        let a = ledger.insert(request("x"), now);
        let b = ledger.insert(request("x"), now);
        assert_ne!(a, b);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_overwrite_never_touches_bootstrap() {
        let mut ledger = RequestLedger::new();
        let now = Instant::now();
        ledger.insert_bootstrap(serde_json::json!({}), now);
        let id = ledger.insert(request("initialize").overwrite(), now);
        assert_eq!(id, 2);
        assert!(ledger.get_mut(1).unwrap().is_bootstrap());
    }

    #[test]
    fn test_next_due_respects_timestamp_and_order() {
        let mut ledger = RequestLedger::new();
        let now = Instant::now();
        let a = ledger.insert(request("a"), now);
        let b = ledger.insert(request("b"), now);
        ledger.get_mut(a).unwrap().timestamp = now + Duration::from_secs(1);
        assert_eq!(ledger.next_due(now), Some(b));
        assert_eq!(ledger.next_due(now + Duration::from_secs(1)), Some(a));
    }

    #[test]
    fn test_take_stale_overwritten() {
        let mut ledger = RequestLedger::new();
        let now = Instant::now();
        let a = ledger.insert(request("a"), now);
        {
            let entry = ledger.get_mut(a).unwrap();
            entry.times_sent = 1;
            entry.timestamp = now + Duration::from_secs(5);
        }
        ledger.insert(request("a").overwrite(), now);

        assert!(ledger.take_stale_overwritten(now).is_empty());
        let stale = ledger.take_stale_overwritten(now + Duration::from_secs(5));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, a);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_has_live_ignores_superseded_entries() {
        let mut ledger = RequestLedger::new();
        let now = Instant::now();
        assert!(!ledger.has_live());
        let a = ledger.insert(request("a").overwrite(), now);
        assert!(ledger.has_live());
        ledger.get_mut(a).unwrap().times_sent = 1;
        assert!(ledger.has_live());

        let b = ledger.insert(request("a").overwrite(), now);
        assert!(ledger.get_mut(a).unwrap().overwritten);
        ledger.pop(b);
        assert!(!ledger.has_live());
    }

    #[test]
    fn test_reset_restarts_ids() {
        let mut ledger = RequestLedger::new();
        let now = Instant::now();
        ledger.insert(request("a"), now);
        ledger.insert(request("b"), now);
        assert_eq!(ledger.reset(), 2);
        assert_eq!(ledger.len(), 0);
        assert_eq!(ledger.insert(request("c"), now), 1);
    }

    #[test]
    fn test_adopt_bootstrap_creates_then_merges() {
        let mut ledger = RequestLedger::new();
        let now = Instant::now();
        let first = ledger.adopt_bootstrap(request("initialize"), now);
        assert_eq!(first, BOOTSTRAP_ID);
        assert!(ledger.get_mut(first).unwrap().params.is_none());

        let custom = request("initialize").params(serde_json::json!({"processId": null}));
        assert_eq!(ledger.adopt_bootstrap(custom, now), first);
        assert_eq!(ledger.len(), 1);
        assert_eq!(
            ledger.get_mut(first).unwrap().params,
            Some(serde_json::json!({"processId": null}))
        );

        ledger.get_mut(first).unwrap().times_sent = 1;
        let late = request("initialize").params(serde_json::json!({"late": true}));
        assert_eq!(ledger.adopt_bootstrap(late, now), first);
        assert_eq!(
            ledger.get_mut(first).unwrap().params,
            Some(serde_json::json!({"processId": null}))
        );
    }
}
