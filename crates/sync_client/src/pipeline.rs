//! Sequential consumer of transport events.
//!
//! ```text
//! TransportEvent ──▶ ListenerRegistry::admit ──▶ SequenceTracker::observe
//!                                                     │
//!                        request_missing ◀── RecoveryCoordinator
//!                                                     │
//!                                EntityCache::apply ──▶ listeners
//! ```
//!
//! The pipeline owns the tracker and the recovery guard; it runs on a single
//! task so neither needs a lock.

use crate::config::SyncConfig;
use crate::reconciler::{ApplyOutcome, EntityCache, OrderingKey};
use crate::recovery::RecoveryCoordinator;
use crate::registry::ListenerRegistry;
use crate::sequence::SequenceTracker;
use crate::transport::{FrameSink, TransportEvent};
use common::{DomainEvent, Event, RecoveryResponse};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Session-level notification for the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    Connected { session: u64 },
    Reconnected { session: u64 },
    Disconnected,
    AuthenticationFailed { reason: String, expired: bool },
    /// The credential expired; the host must sign the user out.
    SignOutRequired,
    Closed,
}

/// Latest stream position, readable outside the pipeline task.
#[derive(Debug, Default)]
pub struct SessionCursor {
    position: Mutex<Option<OrderingKey>>,
}

impl SessionCursor {
    /// Position of the last accepted event, or `None` without a session.
    pub fn position(&self) -> Option<OrderingKey> {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, position: Option<OrderingKey>) {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner) = position;
    }
}

/// Where an event entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Live,
    /// Part of a recovery response. Gaps inside a replay are settled by
    /// `complete_recovery` once the batch is done, never re-requested.
    Replay,
}

pub struct SyncPipeline {
    registry: Arc<ListenerRegistry>,
    cache: Arc<EntityCache>,
    sink: Arc<dyn FrameSink>,
    tracker: SequenceTracker,
    recovery: RecoveryCoordinator,
    session: Option<u64>,
    notices: broadcast::Sender<SessionNotice>,
    cursor: Arc<SessionCursor>,
}

impl SyncPipeline {
    pub fn new(
        config: &SyncConfig,
        registry: Arc<ListenerRegistry>,
        cache: Arc<EntityCache>,
        sink: Arc<dyn FrameSink>,
        notices: broadcast::Sender<SessionNotice>,
        cursor: Arc<SessionCursor>,
    ) -> Self {
        Self {
            registry,
            cache,
            sink,
            tracker: SequenceTracker::new(&config.tracker),
            recovery: RecoveryCoordinator::new(config.recovery.timeout),
            session: None,
            notices,
            cursor,
        }
    }

    pub fn handle(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Authenticated(handle) => {
                self.start_session(handle.session, now);
                self.notify(SessionNotice::Connected {
                    session: handle.session,
                });
            }
            TransportEvent::Reconnected(handle) => {
                self.start_session(handle.session, now);
                self.notify(SessionNotice::Reconnected {
                    session: handle.session,
                });
                self.request_recovery(0, now);
            }
            TransportEvent::Frame(event) => {
                if let Some(event) = self.registry.admit(event) {
                    self.process(event, Origin::Live, now);
                }
            }
            TransportEvent::Recovery(response) => self.handle_recovery(response, now),
            TransportEvent::Disconnected => {
                if self.end_session() {
                    self.notify(SessionNotice::Disconnected);
                }
            }
            TransportEvent::AuthenticationFailed { reason, expired } => {
                self.notify(SessionNotice::AuthenticationFailed { reason, expired });
                if expired {
                    self.notify(SessionNotice::SignOutRequired);
                }
            }
            TransportEvent::Closed => {
                self.end_session();
                self.notify(SessionNotice::Closed);
            }
        }
    }

    /// Periodic check for missing sequences.
    pub fn sweep(&mut self, now: Instant) {
        if self.session.is_none() {
            return;
        }
        self.recovery.expire(now);
        if let Some(since) = self.tracker.sweep() {
            debug!(since, missing = self.tracker.missing().len(), "Sweep found missing sequences");
            self.request_recovery(since, now);
        }
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    pub fn recovery(&self) -> &RecoveryCoordinator {
        &self.recovery
    }

    pub fn session(&self) -> Option<u64> {
        self.session
    }

    fn start_session(&mut self, session: u64, now: Instant) {
        self.tracker.reset();
        self.recovery.abandon();
        self.session = Some(session);
        self.cursor.set(Some(OrderingKey::new(session, 0)));

        let released = self.registry.activate();
        if !released.is_empty() {
            debug!(count = released.len(), "Replaying events buffered before authentication");
        }
        for event in released {
            self.process(event, Origin::Live, now);
        }
    }

    fn end_session(&mut self) -> bool {
        self.registry.deactivate();
        self.recovery.abandon();
        self.cursor.set(None);
        self.session.take().is_some()
    }

    fn process(&mut self, event: Event, origin: Origin, now: Instant) {
        let Some(session) = self.session else {
            debug!(sequence = event.sequence, "Dropping event outside a session");
            return;
        };

        let observation = self.tracker.observe(event.sequence);
        if !observation.accept {
            return;
        }
        match (observation.recover_since, origin) {
            (Some(since), Origin::Live) => self.request_recovery(since, now),
            (Some(since), Origin::Replay) => {
                debug!(since, sequence = event.sequence, "Gap inside recovery replay");
            }
            (None, _) => {}
        }

        self.apply(&event, OrderingKey::new(session, event.sequence));
        self.cursor
            .set(Some(OrderingKey::new(session, self.tracker.last_sequence())));
        self.registry.dispatch(&event);
    }

    fn apply(&self, event: &Event, ordering: OrderingKey) {
        let decoded = match DomainEvent::decode(event) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                debug!(event_type = %event.event_type, "No reconciler for event type");
                return;
            }
            Err(e) => {
                warn!(sequence = event.sequence, "Discarding undecodable event: {}", e);
                return;
            }
        };

        let patch = match decoded.patch() {
            Ok(patch) => patch,
            Err(e) => {
                warn!(sequence = event.sequence, "Failed to build patch: {}", e);
                return;
            }
        };

        let target = decoded.target();
        match self.cache.apply(&target, &patch, ordering) {
            ApplyOutcome::Applied { fields } => {
                debug!(entity = %target, sequence = event.sequence, fields, "Applied patch");
            }
            ApplyOutcome::Stale | ApplyOutcome::Missing => {}
        }
    }

    fn handle_recovery(&mut self, response: RecoveryResponse, now: Instant) {
        if self.session.is_none() {
            debug!("Ignoring recovery response outside a session");
            return;
        }

        let recovered = self.recovery.complete(response);
        let highest = recovered.highest();
        info!(
            count = recovered.events.len(),
            since = ?recovered.since,
            "Replaying recovered events"
        );

        for event in recovered.events {
            self.process(event, Origin::Replay, now);
        }
        if let Some(since) = recovered.since {
            self.tracker.complete_recovery(since, highest);
        }
    }

    fn request_recovery(&mut self, since: u64, now: Instant) {
        let Some(frame) = self.recovery.begin(since, now) else {
            return;
        };
        if let Err(e) = self.sink.send_frame(&frame) {
            warn!(since, "Failed to send recovery request: {}", e);
            self.recovery.abandon();
        }
    }

    fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::Result;
    use crate::registry::Listener;
    use crate::transport::ConnectionHandle;
    use common::{ClientFrame, Member, MemberStatus};
    use rust_decimal::Decimal;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<ClientFrame>>,
    }

    impl RecordingSink {
        fn requests(&self) -> Vec<(u64, Uuid)> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter_map(|frame| match frame {
                    ClientFrame::RequestMissing {
                        since_sequence,
                        request_id,
                    } => Some((*since_sequence, *request_id)),
                    _ => None,
                })
                .collect()
        }
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }
    }

    struct Harness {
        pipeline: SyncPipeline,
        sink: Arc<RecordingSink>,
        cache: Arc<EntityCache>,
        registry: Arc<ListenerRegistry>,
        notices: broadcast::Receiver<SessionNotice>,
    }

    fn harness() -> Harness {
        let config = SyncConfig::default();
        let registry = Arc::new(ListenerRegistry::new(&config.registry));
        let cache = Arc::new(EntityCache::new(Arc::new(ManualClock::new(0))));
        let sink = Arc::new(RecordingSink::default());
        let (notices_tx, notices) = broadcast::channel(16);
        let pipeline = SyncPipeline::new(
            &config,
            registry.clone(),
            cache.clone(),
            sink.clone(),
            notices_tx,
            Arc::new(SessionCursor::default()),
        );
        cache
            .hydrate(
                &Member {
                    id: "m1".to_string(),
                    username: "alice".to_string(),
                    agent_id: None,
                    balance: Decimal::from(100),
                    available_balance: Decimal::from(100),
                    rolling_percent: Decimal::ZERO,
                    rolling_amount: Decimal::ZERO,
                    status: MemberStatus::Active,
                },
                None,
            )
            .unwrap();
        Harness {
            pipeline,
            sink,
            cache,
            registry,
            notices,
        }
    }

    fn handle(session: u64) -> ConnectionHandle {
        ConnectionHandle {
            session,
            server_session_id: None,
            connected_at_ms: 0,
        }
    }

    /// Event at `sequence`; even numbers move the balance, odd numbers the
    /// rolling amount.
    fn event(sequence: u64) -> Event {
        let data: Value = if sequence % 2 == 0 {
            json!({"member_id": "m1", "balance": format!("{}", 100 + sequence)})
        } else {
            json!({"member_id": "m1", "rolling_amount": format!("{}.5", sequence)})
        };
        let event_type = if sequence % 2 == 0 {
            "balance-changed"
        } else {
            "rolling-updated"
        };
        Event::new(event_type, sequence, data, 0)
    }

    fn feed(h: &mut Harness, sequences: impl IntoIterator<Item = u64>) {
        let now = Instant::now();
        for sequence in sequences {
            h.pipeline.handle(TransportEvent::Frame(event(sequence)), now);
        }
    }

    fn respond(h: &mut Harness, request_id: Uuid, sequences: impl IntoIterator<Item = u64>) {
        let events: Vec<Event> = sequences.into_iter().map(event).collect();
        let count = events.len();
        h.pipeline.handle(
            TransportEvent::Recovery(RecoveryResponse {
                request_id: Some(request_id),
                events,
                count,
            }),
            Instant::now(),
        );
    }

    fn member(h: &Harness) -> Member {
        h.cache.get_typed("m1").unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_backfill_matches_in_order_state() {
        let mut expected = harness();
        expected
            .pipeline
            .handle(TransportEvent::Authenticated(handle(1)), Instant::now());
        feed(&mut expected, 1..=6);

        let mut h = harness();
        h.pipeline
            .handle(TransportEvent::Authenticated(handle(1)), Instant::now());
        feed(&mut h, [1, 2, 5, 6]);
        assert!(h.sink.requests().is_empty());

        h.pipeline.sweep(Instant::now());
        let requests = h.sink.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, 2);

        respond(&mut h, requests[0].1, [3, 4]);

        assert_eq!(member(&h), member(&expected));
        assert!(h.pipeline.tracker().missing().is_empty());
        assert_eq!(h.pipeline.tracker().last_sequence(), 6);
        assert!(!h.pipeline.recovery().is_in_flight());
    }

    #[tokio::test]
    async fn test_large_gap_recovers_immediately() {
        let mut h = harness();
        h.pipeline
            .handle(TransportEvent::Authenticated(handle(1)), Instant::now());
        feed(&mut h, 1..=40);
        feed(&mut h, [47]);

        let requests = h.sink.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, 40);

        respond(&mut h, requests[0].1, 41..=47);
        assert_eq!(h.pipeline.tracker().last_sequence(), 47);
        assert!(h.pipeline.tracker().missing().is_empty());
        assert_eq!(member(&h).balance, Decimal::from(146));
    }

    #[tokio::test]
    async fn test_compacted_replay_does_not_request_again() {
        let mut h = harness();
        h.pipeline
            .handle(TransportEvent::Authenticated(handle(1)), Instant::now());
        feed(&mut h, [1, 2]);
        h.pipeline.handle(TransportEvent::Disconnected, Instant::now());
        h.pipeline
            .handle(TransportEvent::Reconnected(handle(2)), Instant::now());

        let requests = h.sink.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, 0);

        // The server compacted 1..=12 down to two events.
        respond(&mut h, requests[0].1, [3, 12]);

        assert_eq!(h.sink.requests().len(), 1);
        assert!(h.pipeline.tracker().missing().is_empty());
        assert_eq!(h.pipeline.tracker().last_sequence(), 12);
        assert!(!h.pipeline.recovery().is_in_flight());
        assert_eq!(member(&h).balance, Decimal::from(112));

        // A live gap afterwards is requested straight away.
        feed(&mut h, [20]);
        let requests = h.sink.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].0, 12);
    }

    #[tokio::test]
    async fn test_requests_coalesce_while_in_flight() {
        let mut h = harness();
        h.pipeline
            .handle(TransportEvent::Authenticated(handle(1)), Instant::now());
        feed(&mut h, 1..=10);
        feed(&mut h, [17]);
        feed(&mut h, [24]);
        h.pipeline.sweep(Instant::now());

        let requests = h.sink.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, 10);
    }

    #[tokio::test]
    async fn test_reconnect_resets_sequence_state() {
        let mut h = harness();
        h.pipeline
            .handle(TransportEvent::Authenticated(handle(1)), Instant::now());
        feed(&mut h, [1, 2, 5]);
        assert!(!h.pipeline.tracker().missing().is_empty());

        h.pipeline.handle(TransportEvent::Disconnected, Instant::now());
        h.pipeline
            .handle(TransportEvent::Reconnected(handle(2)), Instant::now());

        assert_eq!(h.pipeline.tracker().last_sequence(), 0);
        assert!(h.pipeline.tracker().missing().is_empty());
        let requests = h.sink.requests();
        assert_eq!(requests.last().map(|r| r.0), Some(0));

        // Numbering restarts, and the new epoch orders after the old one.
        feed(&mut h, [1, 2]);
        assert_eq!(member(&h).balance, Decimal::from(102));

        assert_eq!(
            h.notices.try_recv().unwrap(),
            SessionNotice::Connected { session: 1 }
        );
        assert_eq!(h.notices.try_recv().unwrap(), SessionNotice::Disconnected);
        assert_eq!(
            h.notices.try_recv().unwrap(),
            SessionNotice::Reconnected { session: 2 }
        );
    }

    #[tokio::test]
    async fn test_events_before_auth_reach_listeners_after_activation() {
        let mut h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        h.registry.subscribe(
            "balance-changed",
            Listener::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        feed(&mut h, [1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(member(&h).balance, Decimal::from(100));

        h.pipeline
            .handle(TransportEvent::Authenticated(handle(1)), Instant::now());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(member(&h).balance, Decimal::from(102));
    }

    #[tokio::test]
    async fn test_expired_credential_requires_sign_out() {
        let mut h = harness();
        h.pipeline.handle(
            TransportEvent::AuthenticationFailed {
                reason: "expired".to_string(),
                expired: true,
            },
            Instant::now(),
        );
        h.pipeline.handle(TransportEvent::Closed, Instant::now());

        assert!(matches!(
            h.notices.try_recv().unwrap(),
            SessionNotice::AuthenticationFailed { expired: true, .. }
        ));
        assert_eq!(h.notices.try_recv().unwrap(), SessionNotice::SignOutRequired);
        assert_eq!(h.notices.try_recv().unwrap(), SessionNotice::Closed);
    }
}
