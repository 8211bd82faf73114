//! Missing-event recovery requests.

use common::{ClientFrame, Event, RecoveryResponse};
use metrics::counter;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct InFlight {
    request_id: Uuid,
    since: u64,
    issued_at: Instant,
}

/// Replay material extracted from a recovery response.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovered {
    /// Low-water mark the response answers, when it could be determined.
    pub since: Option<u64>,
    /// Events sorted ascending by sequence, one per sequence number.
    pub events: Vec<Event>,
}

impl Recovered {
    pub fn highest(&self) -> Option<u64> {
        self.events.last().map(|e| e.sequence)
    }
}

/// Guards the single outstanding recovery request.
#[derive(Debug)]
pub struct RecoveryCoordinator {
    in_flight: Option<InFlight>,
    timeout: Duration,
}

impl RecoveryCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            in_flight: None,
            timeout,
        }
    }

    /// Issue a request for everything after `since`, unless one is already
    /// outstanding. Returns the frame to send.
    pub fn begin(&mut self, since: u64, now: Instant) -> Option<ClientFrame> {
        self.expire(now);

        if let Some(current) = &self.in_flight {
            counter!("sync_recovery_coalesced_total").increment(1);
            debug!(
                since,
                outstanding_since = current.since,
                request_id = %current.request_id,
                "Recovery already in flight, coalescing request"
            );
            return None;
        }

        let request_id = Uuid::new_v4();
        self.in_flight = Some(InFlight {
            request_id,
            since,
            issued_at: now,
        });
        counter!("sync_recovery_requests_total").increment(1);
        info!(since, %request_id, "Requesting missed events");

        Some(ClientFrame::RequestMissing {
            since_sequence: since,
            request_id,
        })
    }

    /// Drop an outstanding request older than the timeout. The next sweep
    /// issues a fresh one.
    pub fn expire(&mut self, now: Instant) -> bool {
        match &self.in_flight {
            Some(current) if now.duration_since(current.issued_at) >= self.timeout => {
                debug!(
                    since = current.since,
                    request_id = %current.request_id,
                    "Recovery request timed out"
                );
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    /// Forget the outstanding request; its connection is gone.
    pub fn abandon(&mut self) {
        if let Some(current) = self.in_flight.take() {
            debug!(request_id = %current.request_id, "Abandoning recovery request");
        }
    }

    /// Accept a recovery response.
    ///
    /// Responses are always replayed, even late ones: the tracker and the
    /// reconciler reject anything already applied.
    pub fn complete(&mut self, response: RecoveryResponse) -> Recovered {
        let RecoveryResponse {
            request_id,
            mut events,
            count,
        } = response;

        events.sort_by_key(|e| e.sequence);
        events.dedup_by_key(|e| e.sequence);

        if count != events.len() {
            debug!(
                reported = count,
                received = events.len(),
                "Recovery response count differs from events received"
            );
        }

        let matches_current = match (&self.in_flight, request_id) {
            (Some(current), Some(id)) => current.request_id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };

        let since = if matches_current {
            self.in_flight.take().map(|current| current.since)
        } else {
            if request_id.is_some() {
                warn!(
                    request_id = ?request_id,
                    "Recovery response does not match the outstanding request"
                );
            }
            events.first().map(|e| e.sequence.saturating_sub(1))
        };

        Recovered { since, events }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn outstanding_since(&self) -> Option<u64> {
        self.in_flight.as_ref().map(|current| current.since)
    }
}
