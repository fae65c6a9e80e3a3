//! Pairing Coordinator
//!
//! Owns the waiting pool and the pairing table. Every operation runs its
//! state change and pairing decision inside one critical section, queues
//! the resulting events in commit order, and hands them to the
//! [`EventSink`] only after the state lock has been released.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::connection::ConnectionId;

/// Events the coordinator emits towards a single connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Paired { partner: ConnectionId },
    PartnerLeft,
    Message { payload: serde_json::Value },
}

/// Outbound side of the coordinator.
///
/// `deliver` must not block and must not call back into the coordinator.
/// Delivering to an unknown connection is a no-op.
pub trait EventSink: Send + Sync {
    fn deliver(&self, to: ConnectionId, event: PeerEvent);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn deliver(&self, to: ConnectionId, event: PeerEvent) {
        (**self).deliver(to, event)
    }
}

/// What happens to a connection whose partner goes away
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartnerLeftPolicy {
    /// The partner is cleared and must ask for a new pairing itself
    #[default]
    Idle,
    /// The partner goes straight back to the tail of the waiting pool
    Requeue,
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub waiting: usize,
    pub pairs: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct Delivery {
    to: ConnectionId,
    event: PeerEvent,
}

/// Outcome of removing a connection from pairing state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    WasWaiting,
    WasPaired { partner: ConnectionId },
    Unknown,
}

/// Waiting pool plus pairing table
#[derive(Debug, Default)]
pub struct PairingState {
    waiting: VecDeque<ConnectionId>,
    partners: HashMap<ConnectionId, ConnectionId>,
}

impl PairingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_waiting(&self, id: &ConnectionId) -> bool {
        self.waiting.contains(id)
    }

    pub fn partner_of(&self, id: &ConnectionId) -> Option<ConnectionId> {
        self.partners.get(id).copied()
    }

    pub fn is_known(&self, id: &ConnectionId) -> bool {
        self.partners.contains_key(id) || self.is_waiting(id)
    }

    /// Waiting ids, oldest first
    pub fn waiting_ids(&self) -> Vec<ConnectionId> {
        self.waiting.iter().copied().collect()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            waiting: self.waiting.len(),
            pairs: self.partners.len() / 2,
        }
    }

    /// Append to the pool tail. Returns false if the id is already tracked.
    fn enqueue(&mut self, id: ConnectionId) -> bool {
        if self.is_known(&id) {
            return false;
        }
        self.waiting.push_back(id);
        true
    }

    /// Pair the two oldest waiting entries until fewer than two remain
    fn pair_waiting(&mut self, out: &mut Vec<Delivery>) {
        while self.waiting.len() >= 2 {
            let (Some(a), Some(b)) = (self.waiting.pop_front(), self.waiting.pop_front()) else {
                break;
            };

            self.partners.insert(a, b);
            self.partners.insert(b, a);
            log::info!("Paired {} with {}", a, b);

            out.push(Delivery {
                to: a,
                event: PeerEvent::Paired { partner: b },
            });
            out.push(Delivery {
                to: b,
                event: PeerEvent::Paired { partner: a },
            });
        }
    }

    /// Remove the id from whichever structure holds it. Both sides of a
    /// pair are removed together.
    fn remove(&mut self, id: &ConnectionId) -> Release {
        if let Some(pos) = self.waiting.iter().position(|waiting| waiting == id) {
            self.waiting.remove(pos);
            return Release::WasWaiting;
        }
        match self.partners.remove(id) {
            Some(partner) => {
                self.partners.remove(&partner);
                Release::WasPaired { partner }
            }
            None => Release::Unknown,
        }
    }

    /// Check the exclusivity and reciprocity invariants
    pub fn is_consistent(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        for id in &self.waiting {
            if !seen.insert(*id) || self.partners.contains_key(id) {
                return false;
            }
        }
        self.waiting.len() < 2
            && self
                .partners
                .iter()
                .all(|(a, b)| a != b && self.partners.get(b) == Some(a))
    }
}

/// Serializes all pairing decisions and fans out the resulting events
pub struct PairingCoordinator<S: EventSink> {
    state: Mutex<PairingState>,
    /// Events committed but not yet handed to the sink, in commit order
    outbox: Mutex<VecDeque<Delivery>>,
    dispatch: Mutex<()>,
    sink: S,
    policy: PartnerLeftPolicy,
}

impl<S: EventSink> PairingCoordinator<S> {
    pub fn new(sink: S, policy: PartnerLeftPolicy) -> Self {
        Self {
            state: Mutex::new(PairingState::new()),
            outbox: Mutex::new(VecDeque::new()),
            dispatch: Mutex::new(()),
            sink,
            policy,
        }
    }

    pub fn policy(&self) -> PartnerLeftPolicy {
        self.policy
    }

    /// Put a connection at the tail of the waiting pool and pair the two
    /// oldest entries if anyone else is already waiting.
    ///
    /// Returns false if the id is already waiting or paired.
    pub fn admit(&self, id: ConnectionId) -> bool {
        self.commit(|state, out| {
            if !state.enqueue(id) {
                log::debug!("Ignoring admit for {}: already tracked", id);
                return false;
            }
            log::debug!("{} is waiting for a partner", id);
            state.pair_waiting(out);
            true
        })
    }

    /// Remove a connection from all pairing state.
    ///
    /// A paired connection's partner is told with `PartnerLeft` and is then
    /// handled according to the configured [`PartnerLeftPolicy`]. Releasing
    /// an unknown id does nothing.
    pub fn release(&self, id: ConnectionId) -> Release {
        let policy = self.policy;
        self.commit(|state, out| {
            let outcome = state.remove(&id);
            match outcome {
                Release::WasWaiting => log::debug!("{} left the waiting pool", id),
                Release::WasPaired { partner } => {
                    log::info!("{} left; notifying partner {}", id, partner);
                    Self::abandon(state, out, partner, policy);
                    state.pair_waiting(out);
                }
                Release::Unknown => log::debug!("Ignoring release for unknown {}", id),
            }
            outcome
        })
    }

    /// Drop the current partner, if any, and go back to looking.
    ///
    /// A waiting connection keeps its place. An idle connection is admitted.
    /// A paired connection is separated from its partner and re-enters the
    /// pool tail.
    pub fn next(&self, id: ConnectionId) {
        let policy = self.policy;
        self.commit(|state, out| {
            if state.is_waiting(&id) {
                log::debug!("{} asked for next while already waiting", id);
                return;
            }
            if let Release::WasPaired { partner } = state.remove(&id) {
                log::info!("{} skipped partner {}", id, partner);
                Self::abandon(state, out, partner, policy);
            }
            state.enqueue(id);
            state.pair_waiting(out);
        })
    }

    /// Forward a payload to the sender's partner. Dropped if the sender is
    /// not paired.
    pub fn relay(&self, from: ConnectionId, payload: serde_json::Value) -> bool {
        self.commit(|state, out| match state.partner_of(&from) {
            Some(partner) => {
                out.push(Delivery {
                    to: partner,
                    event: PeerEvent::Message { payload },
                });
                true
            }
            None => {
                log::debug!("Dropping relay from unpaired {}", from);
                false
            }
        })
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats()
    }

    pub fn partner_of(&self, id: &ConnectionId) -> Option<ConnectionId> {
        self.state.lock().partner_of(id)
    }

    pub fn is_waiting(&self, id: &ConnectionId) -> bool {
        self.state.lock().is_waiting(id)
    }

    /// Run a read-only closure against the current state
    pub fn inspect<R>(&self, f: impl FnOnce(&PairingState) -> R) -> R {
        f(&self.state.lock())
    }

    fn abandon(
        state: &mut PairingState,
        out: &mut Vec<Delivery>,
        partner: ConnectionId,
        policy: PartnerLeftPolicy,
    ) {
        out.push(Delivery {
            to: partner,
            event: PeerEvent::PartnerLeft,
        });
        if policy == PartnerLeftPolicy::Requeue {
            state.enqueue(partner);
        }
    }

    fn commit<T>(&self, op: impl FnOnce(&mut PairingState, &mut Vec<Delivery>) -> T) -> T {
        let result = {
            let mut state = self.state.lock();
            let mut deliveries = Vec::new();
            let result = op(&mut state, &mut deliveries);
            if !deliveries.is_empty() {
                self.outbox.lock().extend(deliveries);
            }
            result
        };
        self.flush();
        result
    }

    /// Hand queued events to the sink in commit order, outside the state lock
    fn flush(&self) {
        let _dispatch = self.dispatch.lock();
        loop {
            let next = self.outbox.lock().pop_front();
            match next {
                Some(delivery) => self.sink.deliver(delivery.to, delivery.event),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(ConnectionId, PeerEvent)>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<(ConnectionId, PeerEvent)> {
            std::mem::take(&mut *self.events.lock())
        }

        fn events_for(&self, id: ConnectionId) -> Vec<PeerEvent> {
            self.events
                .lock()
                .iter()
                .filter(|(to, _)| *to == id)
                .map(|(_, event)| event.clone())
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn deliver(&self, to: ConnectionId, event: PeerEvent) {
            self.events.lock().push((to, event));
        }
    }

    fn coordinator(policy: PartnerLeftPolicy) -> (PairingCoordinator<Arc<RecordingSink>>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (PairingCoordinator::new(sink.clone(), policy), sink)
    }

    fn ids(n: usize) -> Vec<ConnectionId> {
        (0..n).map(|_| ConnectionId::new()).collect()
    }

    fn paired(partner: ConnectionId) -> PeerEvent {
        PeerEvent::Paired { partner }
    }

    #[test]
    fn test_single_admit_waits() {
        let (coord, sink) = coordinator(PartnerLeftPolicy::Idle);
        let a = ConnectionId::new();

        assert!(coord.admit(a));
        assert!(coord.is_waiting(&a));
        assert_eq!(coord.stats(), PoolStats { waiting: 1, pairs: 0 });
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_reciprocal_pairing() {
        let (coord, sink) = coordinator(PartnerLeftPolicy::Idle);
        let (a, b) = (ConnectionId::new(), ConnectionId::new());

        coord.admit(a);
        coord.admit(b);

        assert_eq!(coord.partner_of(&a), Some(b));
        assert_eq!(coord.partner_of(&b), Some(a));
        assert_eq!(sink.take(), vec![(a, paired(b)), (b, paired(a))]);
        assert_eq!(coord.stats(), PoolStats { waiting: 0, pairs: 1 });
    }

    #[test]
    fn test_fifo_fairness() {
        let (coord, sink) = coordinator(PartnerLeftPolicy::Idle);
        let c = ids(4);
        for id in &c {
            coord.admit(*id);
        }

        assert_eq!(coord.partner_of(&c[0]), Some(c[1]));
        assert_eq!(coord.partner_of(&c[2]), Some(c[3]));
        let order: Vec<ConnectionId> = sink.take().into_iter().map(|(to, _)| to).collect();
        assert_eq!(order, vec![c[0], c[1], c[2], c[3]]);
    }

    #[test]
    fn test_duplicate_admit_ignored() {
        let (coord, _sink) = coordinator(PartnerLeftPolicy::Idle);
        let a = ConnectionId::new();

        assert!(coord.admit(a));
        assert!(!coord.admit(a));
        assert_eq!(coord.stats().waiting, 1);
        assert!(coord.inspect(|s| s.is_consistent()));
    }

    #[test]
    fn test_disconnect_while_waiting() {
        let (coord, sink) = coordinator(PartnerLeftPolicy::Idle);
        let a = ConnectionId::new();

        coord.admit(a);
        assert_eq!(coord.release(a), Release::WasWaiting);

        assert_eq!(coord.stats(), PoolStats::default());
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_disconnect_while_paired() {
        let (coord, sink) = coordinator(PartnerLeftPolicy::Idle);
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        coord.admit(a);
        coord.admit(b);
        sink.take();

        assert_eq!(coord.release(a), Release::WasPaired { partner: b });

        assert_eq!(sink.take(), vec![(b, PeerEvent::PartnerLeft)]);
        assert!(coord.inspect(|s| !s.is_known(&a) && !s.is_known(&b)));
    }

    #[test]
    fn test_idempotent_release() {
        let (coord, sink) = coordinator(PartnerLeftPolicy::Idle);
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        coord.admit(a);
        coord.admit(b);
        sink.take();

        coord.release(a);
        assert_eq!(coord.release(a), Release::Unknown);

        assert_eq!(sink.events_for(b), vec![PeerEvent::PartnerLeft]);
        assert_eq!(sink.take().len(), 1);
    }

    #[test]
    fn test_relay_between_partners() {
        let (coord, sink) = coordinator(PartnerLeftPolicy::Idle);
        let (a, b, c) = (ConnectionId::new(), ConnectionId::new(), ConnectionId::new());
        coord.admit(a);
        coord.admit(b);
        coord.admit(c);
        sink.take();

        assert!(coord.relay(a, json!({"candidate": "abc"})));
        assert!(!coord.relay(c, json!("hello?")));

        assert_eq!(
            sink.take(),
            vec![(
                b,
                PeerEvent::Message {
                    payload: json!({"candidate": "abc"})
                }
            )]
        );
    }

    #[test]
    fn test_relay_after_release_dropped() {
        let (coord, sink) = coordinator(PartnerLeftPolicy::Idle);
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        coord.admit(a);
        coord.admit(b);
        coord.release(b);
        sink.take();

        assert!(!coord.relay(a, json!(1)));
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_idle_partner_readmitted_explicitly() {
        let (coord, sink) = coordinator(PartnerLeftPolicy::Idle);
        let (a, b, c) = (ConnectionId::new(), ConnectionId::new(), ConnectionId::new());
        coord.admit(a);
        coord.admit(b);
        coord.release(a);
        coord.admit(c);

        assert!(coord.is_waiting(&c));
        assert!(!coord.is_waiting(&b));

        coord.admit(b);
        assert_eq!(coord.partner_of(&b), Some(c));
        assert_eq!(
            sink.events_for(b),
            vec![paired(a), PeerEvent::PartnerLeft, paired(c)]
        );
    }

    #[test]
    fn test_requeue_policy_pairs_partner_again() {
        let (coord, sink) = coordinator(PartnerLeftPolicy::Requeue);
        let c = ids(4);
        coord.admit(c[0]);
        coord.admit(c[1]);
        coord.admit(c[2]);
        sink.take();

        coord.release(c[0]);

        assert_eq!(coord.partner_of(&c[1]), Some(c[2]));
        assert_eq!(
            sink.take(),
            vec![
                (c[1], PeerEvent::PartnerLeft),
                (c[2], paired(c[1])),
                (c[1], paired(c[2])),
            ]
        );

        coord.release(c[1]);
        assert!(coord.is_waiting(&c[2]));
        assert!(coord.inspect(|s| s.is_consistent()));
    }

    #[test]
    fn test_next_from_pairing_finds_someone_else() {
        let (coord, sink) = coordinator(PartnerLeftPolicy::Idle);
        let c = ids(3);
        coord.admit(c[0]);
        coord.admit(c[1]);
        coord.admit(c[2]);
        sink.take();

        coord.next(c[0]);

        assert_eq!(coord.partner_of(&c[0]), Some(c[2]));
        assert_eq!(coord.partner_of(&c[1]), None);
        assert!(!coord.is_waiting(&c[1]));
        assert_eq!(sink.events_for(c[1]), vec![PeerEvent::PartnerLeft]);
    }

    #[test]
    fn test_next_from_both_sides_pairs_again() {
        let (coord, sink) = coordinator(PartnerLeftPolicy::Idle);
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        coord.admit(a);
        coord.admit(b);
        sink.take();

        coord.next(a);
        assert_eq!(coord.inspect(|s| s.waiting_ids()), vec![a]);
        assert_eq!(sink.take(), vec![(b, PeerEvent::PartnerLeft)]);

        coord.next(b);
        assert_eq!(coord.stats(), PoolStats { waiting: 0, pairs: 1 });
        assert_eq!(sink.take(), vec![(a, paired(b)), (b, paired(a))]);
    }

    #[test]
    fn test_requeued_partner_takes_the_head() {
        let (coord, sink) = coordinator(PartnerLeftPolicy::Requeue);
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        coord.admit(a);
        coord.admit(b);
        sink.take();

        // The partner is re-queued before the caller, and two waiting
        // entries always pair
        coord.next(a);
        assert_eq!(coord.stats(), PoolStats { waiting: 0, pairs: 1 });
        assert_eq!(
            sink.take(),
            vec![(b, PeerEvent::PartnerLeft), (b, paired(a)), (a, paired(b))]
        );

        let c = ConnectionId::new();
        coord.admit(c);
        assert!(coord.is_waiting(&c));
    }

    #[test]
    fn test_pool_never_holds_two_after_any_operation() {
        for policy in [PartnerLeftPolicy::Idle, PartnerLeftPolicy::Requeue] {
            let (coord, _sink) = coordinator(policy);
            let c = ids(5);
            let check = |coord: &PairingCoordinator<Arc<RecordingSink>>| {
                assert!(coord.stats().waiting < 2);
                assert!(coord.inspect(|s| s.is_consistent()));
            };

            for id in &c {
                coord.admit(*id);
                check(&coord);
            }
            for id in &c {
                coord.next(*id);
                check(&coord);
            }
            for id in c.iter().rev() {
                coord.next(*id);
                check(&coord);
            }
            coord.release(c[0]);
            check(&coord);
            coord.release(c[3]);
            check(&coord);
            coord.next(c[0]);
            check(&coord);
        }
    }

    #[test]
    fn test_next_while_waiting_keeps_position() {
        let (coord, sink) = coordinator(PartnerLeftPolicy::Idle);
        let a = ConnectionId::new();
        coord.admit(a);
        coord.next(a);

        assert_eq!(coord.inspect(|s| s.waiting_ids()), vec![a]);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_next_when_idle_admits() {
        let (coord, _sink) = coordinator(PartnerLeftPolicy::Idle);
        let a = ConnectionId::new();
        coord.next(a);
        assert!(coord.is_waiting(&a));
    }

    #[test]
    fn test_concurrent_admission_forms_disjoint_pairs() {
        const N: usize = 64;
        let (coord, sink) = coordinator(PartnerLeftPolicy::Idle);
        let coord = Arc::new(coord);
        let all = ids(N);

        let handles: Vec<_> = all
            .chunks(8)
            .map(|chunk| {
                let coord = coord.clone();
                let chunk = chunk.to_vec();
                std::thread::spawn(move || {
                    for id in chunk {
                        coord.admit(id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(coord.stats(), PoolStats { waiting: 0, pairs: N / 2 });
        assert!(coord.inspect(|s| s.is_consistent()));

        let events = sink.take();
        assert_eq!(events.len(), N);
        let mut notified = HashSet::new();
        for (to, event) in &events {
            assert!(notified.insert(*to), "{} notified twice", to);
            let PeerEvent::Paired { partner } = event else {
                panic!("unexpected event {:?}", event);
            };
            assert!(events.contains(&(*partner, paired(*to))));
        }
    }

    #[test]
    fn test_concurrent_churn_keeps_invariants() {
        let (coord, sink) = coordinator(PartnerLeftPolicy::Requeue);
        let coord = Arc::new(coord);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coord = coord.clone();
                std::thread::spawn(move || {
                    for round in 0..50 {
                        let id = ConnectionId::new();
                        coord.admit(id);
                        coord.relay(id, json!(round));
                        if round % 3 == 0 {
                            coord.next(id);
                        }
                        coord.release(id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(coord.inspect(|s| s.is_consistent()));
        assert_eq!(coord.stats(), PoolStats::default());

        // A PartnerLeft only ever follows a Paired for the same connection
        let mut open: HashMap<ConnectionId, usize> = HashMap::new();
        for (to, event) in sink.take() {
            match event {
                PeerEvent::Paired { .. } => *open.entry(to).or_default() += 1,
                PeerEvent::PartnerLeft => {
                    let count = open.entry(to).or_default();
                    assert!(*count > 0, "PartnerLeft before Paired for {}", to);
                    *count -= 1;
                }
                PeerEvent::Message { .. } => assert!(open.get(&to).copied().unwrap_or(0) > 0),
            }
        }
    }
}
