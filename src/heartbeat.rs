//! Heartbeat liveness deadlines.
//!
//! Pure deadline arithmetic over the configured interval `H`:
//! heartbeat-due at `H` since the last outbound write, test-request at
//! `1.5 x H` since the last inbound, timeout at `2.0 x H` since the last
//! inbound when a TestRequest is already pending. The timer wheel drives
//! this at a coarse tick; firing late by up to one tick is acceptable.

use std::time::{Duration, Instant};

/// What the session should do at a given tick, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessCheck {
    /// Nothing due.
    Idle,
    /// No outbound traffic for a full interval; emit a Heartbeat.
    HeartbeatDue,
    /// Inbound silence past 1.5 x H with no TestRequest outstanding.
    TestRequestDue,
    /// TestRequest unanswered; total inbound silence past 2.0 x H.
    TimedOut,
}

pub fn check(
    interval: Duration,
    now: Instant,
    last_inbound: Instant,
    last_outbound: Instant,
    test_request_pending: bool,
) -> LivenessCheck {
    let inbound_silence = now.saturating_duration_since(last_inbound);
    if test_request_pending && inbound_silence >= interval * 2 {
        return LivenessCheck::TimedOut;
    }
    if !test_request_pending && inbound_silence >= interval * 3 / 2 {
        return LivenessCheck::TestRequestDue;
    }
    if now.saturating_duration_since(last_outbound) >= interval {
        return LivenessCheck::HeartbeatDue;
    }
    LivenessCheck::Idle
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Duration = Duration::from_secs(30);

    #[test]
    fn quiet_session_is_idle() {
        let t0 = Instant::now();
        assert_eq!(
            check(H, t0 + Duration::from_secs(29), t0, t0, false),
            LivenessCheck::Idle
        );
    }

    #[test]
    fn heartbeat_fires_at_interval_since_outbound() {
        let t0 = Instant::now();
        // Inbound arrived recently, outbound stale.
        assert_eq!(
            check(H, t0 + Duration::from_secs(30), t0 + Duration::from_secs(20), t0, false),
            LivenessCheck::HeartbeatDue
        );
    }

    #[test]
    fn test_request_escalates_at_one_and_a_half_intervals() {
        let t0 = Instant::now();
        let now = t0 + Duration::from_secs(45);
        assert_eq!(check(H, now, t0, now, false), LivenessCheck::TestRequestDue);
        // Already pending: not re-issued, and not yet timed out.
        assert_eq!(check(H, now, t0, now, true), LivenessCheck::Idle);
    }

    #[test]
    fn timeout_at_twice_interval_with_pending_test_request() {
        let t0 = Instant::now();
        let now = t0 + Duration::from_secs(60);
        assert_eq!(check(H, now, t0, now, true), LivenessCheck::TimedOut);
        // Without a pending TestRequest the ladder issues one first.
        assert_eq!(check(H, now, t0, now, false), LivenessCheck::TestRequestDue);
    }

    #[test]
    fn test_request_outranks_heartbeat() {
        let t0 = Instant::now();
        let now = t0 + Duration::from_secs(50);
        assert_eq!(check(H, now, t0, t0, false), LivenessCheck::TestRequestDue);
    }
}
