//! The per-session state machine.
//!
//! Owns one session's status, sequence counters, gap list, and out-of-order
//! buffer. Pure with respect to I/O: every entry point takes the current
//! time and returns the list of [`Action`]s for the driver task to execute
//! in order. All mutation happens on the single task that owns the state,
//! so counters are plain integers.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{DecodeError, Rejection, SessionRejectReason};
use crate::gap::GapTracker;
use crate::heartbeat::{self, LivenessCheck};
use crate::protocol::{self, tags, FixMessage, MsgType};
use crate::session::{DisconnectReason, SessionId, SessionStatus};
use crate::validator::{self, ValidationContext};

/// Effects the driver executes, strictly in order.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Assign the next outbound sequence number, stamp, store, write.
    Send(FixMessage),
    /// Persist an accepted inbound frame under its sequence number.
    Journal { seq: u64, frame: Bytes },
    /// Serve a peer ResendRequest from the outbound journal.
    ResendStored { begin: u64, end: u64 },
    /// Hand an in-order application message to the handler.
    App(FixMessage),
    /// Close the connection immediately, no reply.
    Disconnect(DisconnectReason),
    /// Flush queued outbound frames (bounded), then close.
    DisconnectAfterDrain(DisconnectReason),
}

/// Out-of-order inbound messages held until their gap closes. `Done` marks
/// a sequence number that was already processed out of band (the Logon that
/// opened the session ahead of a gap).
#[derive(Debug)]
enum Buffered {
    Pending(FixMessage, Bytes),
    Done,
}

#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub default_heartbeat_secs: u64,
    pub max_clock_skew_secs: u64,
}

#[derive(Debug)]
pub struct SessionState {
    id: SessionId,
    status: SessionStatus,
    heartbeat_interval: Duration,
    max_clock_skew: chrono::Duration,
    next_inbound: u64,
    next_outbound: u64,
    last_inbound: Instant,
    last_outbound: Instant,
    started_at: DateTime<Utc>,
    pending_test_req: Option<Vec<u8>>,
    test_req_counter: u64,
    gaps: GapTracker,
    buffered: BTreeMap<u64, Buffered>,
}

impl SessionState {
    pub fn new(
        id: SessionId,
        setup: &SessionSetup,
        next_inbound: u64,
        next_outbound: u64,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            status: SessionStatus::Connecting,
            heartbeat_interval: Duration::from_secs(setup.default_heartbeat_secs.max(1)),
            max_clock_skew: chrono::Duration::seconds(setup.max_clock_skew_secs as i64),
            next_inbound: next_inbound.max(1),
            next_outbound: next_outbound.max(1),
            last_inbound: now,
            last_outbound: now,
            started_at: wall,
            pending_test_req: None,
            test_req_counter: 0,
            gaps: GapTracker::new(),
            buffered: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn next_inbound(&self) -> u64 {
        self.next_inbound
    }

    pub fn next_outbound(&self) -> u64 {
        self.next_outbound
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Sequence assignment for the very next outbound write. Called by the
    /// driver immediately before encoding, on the owning task, so numbering
    /// and the journal append can never transpose.
    pub fn alloc_outbound_seq(&mut self) -> u64 {
        let seq = self.next_outbound;
        self.next_outbound += 1;
        seq
    }

    pub fn note_outbound(&mut self, now: Instant) {
        self.last_outbound = now;
    }

    pub fn mark_disconnecting(&mut self) {
        self.status = SessionStatus::Disconnecting;
    }

    pub fn on_frame(&mut self, frame: Bytes, now: Instant, wall: DateTime<Utc>) -> Vec<Action> {
        let msg = match protocol::decode(&frame) {
            Ok(m) => m,
            Err(e) => return self.on_decode_error(e),
        };

        // Any inbound traffic proves liveness and answers an outstanding
        // TestRequest.
        self.last_inbound = now;
        self.pending_test_req = None;

        match self.status {
            SessionStatus::Connecting => self.on_frame_connecting(msg, frame, now, wall),
            SessionStatus::LoggedOn | SessionStatus::LogoutSent => {
                self.on_frame_established(msg, frame, now, wall)
            }
            _ => {
                debug!(session = %self.id, status = %self.status, "dropping frame");
                Vec::new()
            }
        }
    }

    fn on_decode_error(&mut self, err: DecodeError) -> Vec<Action> {
        warn!(session = %self.id, %err, "undecodable frame");
        let offending_tag = match &err {
            DecodeError::MissingValue { tag } => Some(*tag),
            _ => None,
        };
        match offending_tag {
            Some(tag) if self.status == SessionStatus::LoggedOn => {
                // The offending tag is known even though the frame as a
                // whole did not decode, so the peer gets a Reject instead
                // of a dropped connection. RefSeqNum stays 0: the garbled
                // frame's own sequence number is not trustworthy.
                let rej = Rejection::new(
                    SessionRejectReason::TagSpecifiedWithoutValue,
                    format!("tag {} specified without a value", tag),
                )
                .with_tag(tag);
                vec![Action::Send(protocol::build_reject(0, &rej))]
            }
            _ => {
                self.status = SessionStatus::Disconnecting;
                vec![Action::Disconnect(DisconnectReason::ProtocolError)]
            }
        }
    }

    /// First inbound after accept must be a valid Logon; anything else
    /// closes the connection without a reply.
    fn on_frame_connecting(
        &mut self,
        msg: FixMessage,
        frame: Bytes,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Vec<Action> {
        if msg.msg_type() != MsgType::Logon {
            warn!(session = %self.id, "first frame was not a Logon");
            self.status = SessionStatus::Disconnecting;
            return vec![Action::Disconnect(DisconnectReason::ProtocolError)];
        }
        if let Err(rej) = self.validate(&msg, wall) {
            warn!(session = %self.id, reason = ?rej.reason, "logon failed validation");
            self.status = SessionStatus::Disconnecting;
            return vec![Action::Disconnect(DisconnectReason::ProtocolError)];
        }

        let Some(seq) = msg.get_u64(tags::MSG_SEQ_NUM) else {
            self.status = SessionStatus::Disconnecting;
            return vec![Action::Disconnect(DisconnectReason::ProtocolError)];
        };

        let reset = msg.get_flag(tags::RESET_SEQ_NUM_FLAG);
        if reset {
            self.next_inbound = 1;
            self.next_outbound = 1;
        }
        if let Some(hb) = msg.get_u64(tags::HEART_BT_INT).filter(|hb| *hb >= 1) {
            self.heartbeat_interval = Duration::from_secs(hb);
        }

        if seq < self.next_inbound {
            self.status = SessionStatus::Disconnecting;
            return vec![
                Action::Send(protocol::build_logout(Some("MsgSeqNum too low"))),
                Action::DisconnectAfterDrain(DisconnectReason::SequenceTooLow),
            ];
        }

        self.status = SessionStatus::LoggedOn;
        let heartbeat_secs = self.heartbeat_interval.as_secs();
        let mut actions = vec![
            Action::Journal { seq, frame },
            Action::Send(protocol::build_logon(heartbeat_secs, reset)),
        ];
        if seq == self.next_inbound {
            self.next_inbound = seq + 1;
        } else {
            // Counterparty is ahead of our recovered counter: recover the
            // missing run, but the session is live as of this Logon.
            let begin = self.next_inbound;
            let end = seq - 1;
            self.gaps.open(begin, end, now);
            self.buffered.insert(seq, Buffered::Done);
            actions.push(Action::Send(protocol::build_resend_request(begin, end)));
        }
        actions
    }

    fn on_frame_established(
        &mut self,
        msg: FixMessage,
        frame: Bytes,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Vec<Action> {
        if let Err(rej) = self.validate(&msg, wall) {
            let ref_seq = msg.get_u64(tags::MSG_SEQ_NUM).unwrap_or(0);
            let mut actions = vec![Action::Send(protocol::build_reject(ref_seq, &rej))];
            if rej.disconnect {
                self.status = SessionStatus::Disconnecting;
                actions.push(Action::DisconnectAfterDrain(DisconnectReason::ProtocolError));
            }
            return actions;
        }
        let Some(seq) = msg.get_u64(tags::MSG_SEQ_NUM) else {
            self.status = SessionStatus::Disconnecting;
            return vec![Action::Disconnect(DisconnectReason::ProtocolError)];
        };

        // SequenceReset repairs the counter itself and is exempt from the
        // sequence discipline below.
        if msg.msg_type() == MsgType::SequenceReset {
            return self.on_sequence_reset(&msg, frame, seq);
        }

        if seq < self.next_inbound {
            if msg.get_flag(tags::POSS_DUP_FLAG) {
                debug!(session = %self.id, seq, "dropping PossDup duplicate");
                return Vec::new();
            }
            warn!(session = %self.id, seq, expected = self.next_inbound, "MsgSeqNum too low");
            self.status = SessionStatus::Disconnecting;
            return vec![
                Action::Send(protocol::build_logout(Some("MsgSeqNum too low"))),
                Action::DisconnectAfterDrain(DisconnectReason::SequenceTooLow),
            ];
        }
        if seq > self.next_inbound {
            return self.buffer_out_of_order(seq, msg, frame, now);
        }

        let mut actions = vec![Action::Journal { seq, frame }];
        self.gaps.fill(seq);
        self.next_inbound = seq + 1;
        self.dispatch(msg, &mut actions);
        self.drain_buffered(&mut actions);
        actions
    }

    fn buffer_out_of_order(
        &mut self,
        seq: u64,
        msg: FixMessage,
        frame: Bytes,
        now: Instant,
    ) -> Vec<Action> {
        if self.buffered.contains_key(&seq) {
            debug!(session = %self.id, seq, "duplicate of buffered message");
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.gaps.is_missing(seq) {
            self.gaps.fill(seq);
        } else {
            let highest = self.highest_seen();
            let begin = highest + 1;
            if begin < seq {
                debug!(session = %self.id, begin, end = seq - 1, "inbound gap opened");
                self.gaps.open(begin, seq - 1, now);
                actions.push(Action::Send(protocol::build_resend_request(begin, seq - 1)));
            }
        }
        self.buffered.insert(seq, Buffered::Pending(msg, frame));
        actions
    }

    /// Highest inbound sequence number known to exist, received or missing.
    fn highest_seen(&self) -> u64 {
        let mut highest = self.next_inbound - 1;
        if let Some(end) = self.gaps.last_end() {
            highest = highest.max(end);
        }
        if let Some((&s, _)) = self.buffered.last_key_value() {
            highest = highest.max(s);
        }
        highest
    }

    fn on_sequence_reset(&mut self, msg: &FixMessage, frame: Bytes, seq: u64) -> Vec<Action> {
        let Some(new_seq) = msg.get_u64(tags::NEW_SEQ_NO) else {
            let rej = Rejection::new(
                SessionRejectReason::IncorrectDataFormat,
                "NewSeqNo not numeric",
            )
            .with_tag(tags::NEW_SEQ_NO)
            .with_msg_type(MsgType::SequenceReset.as_str());
            return vec![Action::Send(protocol::build_reject(seq, &rej))];
        };

        let mut actions = Vec::new();
        if msg.get_flag(tags::GAP_FILL_FLAG) {
            match new_seq.cmp(&self.next_inbound) {
                std::cmp::Ordering::Greater => {
                    // The reset frame occupies the slot where the skipped
                    // run began; journal it there when that slot was open.
                    if seq == self.next_inbound || self.gaps.is_missing(seq) {
                        actions.push(Action::Journal { seq, frame });
                    }
                    self.gaps.remove_below(new_seq);
                    self.buffered.retain(|s, _| *s >= new_seq);
                    self.next_inbound = new_seq;
                    debug!(session = %self.id, new_seq, "gap fill advanced inbound counter");
                    self.drain_buffered(&mut actions);
                }
                std::cmp::Ordering::Equal => {
                    // Gap fill to the current expectation is a no-op.
                }
                std::cmp::Ordering::Less => {
                    let rej = Rejection::new(
                        SessionRejectReason::ValueIsIncorrect,
                        "NewSeqNo lower than expected",
                    )
                    .with_tag(tags::NEW_SEQ_NO)
                    .with_msg_type(MsgType::SequenceReset.as_str());
                    actions.push(Action::Send(protocol::build_reject(seq, &rej)));
                }
            }
        } else {
            // Hard reset: recovery path, applied unconditionally.
            warn!(session = %self.id, new_seq, "hard sequence reset");
            self.gaps.clear();
            self.buffered.clear();
            self.next_inbound = new_seq;
        }
        actions
    }

    fn dispatch(&mut self, msg: FixMessage, actions: &mut Vec<Action>) {
        match msg.msg_type() {
            MsgType::Heartbeat => {
                // Liveness bookkeeping already done on receipt.
            }
            MsgType::TestRequest => {
                let reply = protocol::build_heartbeat(msg.get(tags::TEST_REQ_ID));
                actions.push(Action::Send(reply));
            }
            MsgType::ResendRequest => {
                let begin = msg.get_u64(tags::BEGIN_SEQ_NO).unwrap_or(1).max(1);
                let last_sent = self.next_outbound - 1;
                let end = match msg.get_u64(tags::END_SEQ_NO) {
                    Some(0) | None => last_sent,
                    Some(e) => e.min(last_sent),
                };
                actions.push(Action::ResendStored { begin, end });
            }
            MsgType::Reject => {
                warn!(
                    session = %self.id,
                    ref_seq = msg.get_u64(tags::REF_SEQ_NUM).unwrap_or(0),
                    reason = msg.get_u64(tags::SESSION_REJECT_REASON).unwrap_or(0),
                    "counterparty rejected a message"
                );
            }
            MsgType::Logout => match self.status {
                SessionStatus::LoggedOn => {
                    self.status = SessionStatus::LogoutSent;
                    actions.push(Action::Send(protocol::build_logout(None)));
                    actions.push(Action::DisconnectAfterDrain(DisconnectReason::PeerClosed));
                }
                SessionStatus::LogoutSent => {
                    self.status = SessionStatus::Disconnecting;
                    actions.push(Action::Disconnect(DisconnectReason::ApplicationRequested));
                }
                _ => {}
            },
            MsgType::Logon => {
                warn!(session = %self.id, "unexpected Logon on established session");
            }
            MsgType::SequenceReset => {
                // Handled before the sequence discipline.
            }
            _ => {
                if self.status == SessionStatus::LoggedOn {
                    actions.push(Action::App(msg));
                }
            }
        }
    }

    fn drain_buffered(&mut self, actions: &mut Vec<Action>) {
        loop {
            let Some((&seq, _)) = self.buffered.first_key_value() else {
                break;
            };
            if seq < self.next_inbound {
                self.buffered.pop_first();
                continue;
            }
            if seq != self.next_inbound {
                break;
            }
            let Some((seq, entry)) = self.buffered.pop_first() else {
                break;
            };
            self.next_inbound = seq + 1;
            if let Buffered::Pending(msg, frame) = entry {
                actions.push(Action::Journal { seq, frame });
                self.dispatch(msg, actions);
            }
        }
    }

    pub fn on_tick(&mut self, now: Instant) -> Vec<Action> {
        if self.status != SessionStatus::LoggedOn {
            return Vec::new();
        }
        match heartbeat::check(
            self.heartbeat_interval,
            now,
            self.last_inbound,
            self.last_outbound,
            self.pending_test_req.is_some(),
        ) {
            LivenessCheck::TimedOut => {
                warn!(session = %self.id, "heartbeat timeout, disconnecting");
                self.status = SessionStatus::Disconnecting;
                vec![Action::Disconnect(DisconnectReason::Timeout)]
            }
            LivenessCheck::TestRequestDue => {
                self.test_req_counter += 1;
                let id = format!("TEST_{}", self.test_req_counter);
                self.pending_test_req = Some(id.clone().into_bytes());
                vec![Action::Send(protocol::build_test_request(&id))]
            }
            LivenessCheck::HeartbeatDue => vec![Action::Send(protocol::build_heartbeat(None))],
            LivenessCheck::Idle => Vec::new(),
        }
    }

    pub fn on_shutdown(&mut self) -> Vec<Action> {
        match self.status {
            SessionStatus::LoggedOn => {
                self.status = SessionStatus::LogoutSent;
                vec![Action::Send(protocol::build_logout(None))]
            }
            SessionStatus::LogoutSent | SessionStatus::Disconnecting => Vec::new(),
            _ => {
                self.status = SessionStatus::Disconnecting;
                vec![Action::Disconnect(DisconnectReason::ShuttingDown)]
            }
        }
    }

    pub fn on_transport_closed(&mut self) -> Vec<Action> {
        self.status = SessionStatus::Disconnecting;
        vec![Action::Disconnect(DisconnectReason::PeerClosed)]
    }

    fn validate(&self, msg: &FixMessage, wall: DateTime<Utc>) -> Result<(), Rejection> {
        let ctx = ValidationContext {
            local_comp_id: &self.id.local_comp_id,
            remote_comp_id: &self.id.remote_comp_id,
            now: wall,
            max_clock_skew: self.max_clock_skew,
        };
        validator::validate(msg, &ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const T0_SECS: u64 = 0;

    struct Harness {
        state: SessionState,
        base: Instant,
        wall: DateTime<Utc>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_counters(1, 1)
        }

        fn with_counters(next_in: u64, next_out: u64) -> Self {
            let base = Instant::now();
            let wall = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
            let setup = SessionSetup {
                default_heartbeat_secs: 30,
                max_clock_skew_secs: 120,
            };
            let state = SessionState::new(
                SessionId::new("SRV", "CLI"),
                &setup,
                next_in,
                next_out,
                base,
                wall,
            );
            Self { state, base, wall }
        }

        fn at(&self, secs: u64) -> (Instant, DateTime<Utc>) {
            (
                self.base + Duration::from_secs(secs),
                self.wall + chrono::Duration::seconds(secs as i64),
            )
        }

        /// Encode a peer message and run it through the state machine,
        /// emulating the driver's sequence assignment for Send actions.
        fn inbound(&mut self, mut msg: FixMessage, seq: u64, secs: u64) -> Vec<Action> {
            let (now, wall) = self.at(secs);
            msg.stamp_header(seq, "CLI", "SRV", wall);
            let frame = protocol::encode(&msg).unwrap();
            let actions = self.state.on_frame(frame, now, wall);
            self.note_sends(&actions, now);
            actions
        }

        fn tick(&mut self, secs: u64) -> Vec<Action> {
            let (now, _) = self.at(secs);
            let actions = self.state.on_tick(now);
            self.note_sends(&actions, now);
            actions
        }

        fn note_sends(&mut self, actions: &[Action], now: Instant) {
            for a in actions {
                if matches!(a, Action::Send(_)) {
                    self.state.alloc_outbound_seq();
                    self.state.note_outbound(now);
                }
            }
        }

        fn logon(&mut self) {
            let actions = self.inbound(protocol::build_logon(30, false), 1, T0_SECS);
            assert!(matches!(actions[0], Action::Journal { seq: 1, .. }));
            assert!(matches!(actions[1], Action::Send(_)));
            assert_eq!(self.state.status(), SessionStatus::LoggedOn);
        }
    }

    fn sent(actions: &[Action]) -> Vec<&FixMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn order_msg(id: &str) -> FixMessage {
        let mut msg = FixMessage::new(MsgType::NewOrderSingle);
        msg.set(tags::CL_ORD_ID, id.as_bytes());
        msg.set(tags::SYMBOL, &b"MSFT"[..]);
        msg.set(tags::SIDE, &b"1"[..]);
        msg.set(tags::ORDER_QTY, &b"100"[..]);
        msg.set(tags::ORD_TYPE, &b"2"[..]);
        msg
    }

    #[test]
    fn clean_logon_heartbeat_and_test_request_ladder() {
        // Scenario: logon, 30 s silence -> Heartbeat, 45 s -> TestRequest.
        let mut h = Harness::new();
        let actions = h.inbound(protocol::build_logon(30, false), 1, 0);
        let replies = sent(&actions);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].msg_type(), MsgType::Logon);
        assert_eq!(replies[0].get_u64(tags::HEART_BT_INT), Some(30));
        assert_eq!(h.state.next_outbound(), 2);

        assert_eq!(h.tick(29), Vec::new());

        let actions = h.tick(30);
        assert_eq!(sent(&actions)[0].msg_type(), MsgType::Heartbeat);

        let actions = h.tick(45);
        let replies = sent(&actions);
        assert_eq!(replies[0].msg_type(), MsgType::TestRequest);
        assert_eq!(replies[0].get_str(tags::TEST_REQ_ID), Some("TEST_1"));
        assert_eq!(h.state.next_outbound(), 4);
    }

    #[test]
    fn unanswered_test_request_times_out() {
        let mut h = Harness::new();
        h.logon();
        h.tick(30);
        h.tick(45);
        assert_eq!(h.tick(59), Vec::new());
        let actions = h.tick(60);
        assert_eq!(actions, vec![Action::Disconnect(DisconnectReason::Timeout)]);
        assert_eq!(h.state.status(), SessionStatus::Disconnecting);
    }

    #[test]
    fn heartbeat_answers_test_request_and_resets_deadlines() {
        let mut h = Harness::new();
        h.logon();
        h.tick(45);
        let actions = h.inbound(protocol::build_heartbeat(Some(b"TEST_1")), 2, 50);
        assert!(matches!(actions[0], Action::Journal { seq: 2, .. }));
        // Pending TestReqID cleared: the next escalation starts over.
        assert_eq!(h.tick(60), Vec::new());
        let actions = h.tick(95);
        assert_eq!(sent(&actions)[0].get_str(tags::TEST_REQ_ID), Some("TEST_2"));
    }

    #[test]
    fn test_request_is_echoed_in_heartbeat() {
        let mut h = Harness::new();
        h.logon();
        let actions = h.inbound(protocol::build_test_request("ping-7"), 2, 5);
        let replies = sent(&actions);
        assert_eq!(replies[0].msg_type(), MsgType::Heartbeat);
        assert_eq!(replies[0].get_str(tags::TEST_REQ_ID), Some("ping-7"));
    }

    #[test]
    fn gap_opens_resend_request_and_buffers_trigger() {
        // Scenario: seqs 1,2 seen; 5 arrives -> ResendRequest 7=3 16=4.
        let mut h = Harness::new();
        h.logon();
        h.inbound(protocol::build_heartbeat(None), 2, 1);

        let actions = h.inbound(order_msg("late"), 5, 2);
        let replies = sent(&actions);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].msg_type(), MsgType::ResendRequest);
        assert_eq!(replies[0].get_u64(tags::BEGIN_SEQ_NO), Some(3));
        assert_eq!(replies[0].get_u64(tags::END_SEQ_NO), Some(4));
        // Not processed, not journaled: buffered until the gap closes.
        assert!(!actions.iter().any(|a| matches!(a, Action::App(_))));
        assert_eq!(h.state.next_inbound(), 3);

        // Duplicate of the buffered message is dropped silently.
        assert_eq!(h.inbound(order_msg("late"), 5, 3), Vec::new());

        // Peer resends 3 (application, PossDup) ...
        let mut dup = order_msg("resent-3");
        dup.set(tags::POSS_DUP_FLAG, &b"Y"[..]);
        let actions = h.inbound(dup, 3, 4);
        assert!(matches!(actions[0], Action::Journal { seq: 3, .. }));
        assert!(matches!(actions[1], Action::App(_)));
        assert_eq!(h.state.next_inbound(), 4);

        // ... and gap-fills 4 (was administrative): NewSeqNo=5.
        let actions = h.inbound(protocol::build_sequence_reset(5, true), 4, 5);
        // Counter advances through the fill and the buffered 5 drains.
        assert_eq!(h.state.next_inbound(), 6);
        assert!(matches!(actions[0], Action::Journal { seq: 4, .. }));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Journal { seq: 5, .. })));
        assert!(actions.iter().any(|a| matches!(a, Action::App(_))));
    }

    #[test]
    fn interior_fill_splits_gap_without_new_resend_request() {
        let mut h = Harness::new();
        h.logon();
        // 8 arrives: gap [2,7].
        let actions = h.inbound(order_msg("a"), 8, 1);
        assert_eq!(sent(&actions).len(), 1);
        // 4 arrives: interior point, no second ResendRequest.
        let actions = h.inbound(order_msg("b"), 4, 2);
        assert_eq!(sent(&actions).len(), 0);
        assert_eq!(h.state.next_inbound(), 2);
    }

    #[test]
    fn too_low_without_poss_dup_sends_logout_and_disconnects() {
        let mut h = Harness::with_counters(5, 1);
        // Establish with a recovered counter: peer logs on at its seq 5.
        let actions = h.inbound(protocol::build_logon(30, false), 5, 0);
        assert!(matches!(actions[1], Action::Send(_)));

        let actions = h.inbound(order_msg("stale"), 2, 1);
        let replies = sent(&actions);
        assert_eq!(replies[0].msg_type(), MsgType::Logout);
        assert_eq!(replies[0].get_str(tags::TEXT), Some("MsgSeqNum too low"));
        assert!(matches!(
            actions.last(),
            Some(Action::DisconnectAfterDrain(DisconnectReason::SequenceTooLow))
        ));
        assert_eq!(h.state.status(), SessionStatus::Disconnecting);
    }

    #[test]
    fn too_low_with_poss_dup_is_dropped_silently() {
        let mut h = Harness::with_counters(5, 1);
        h.inbound(protocol::build_logon(30, false), 5, 0);
        let mut dup = order_msg("old");
        dup.set(tags::POSS_DUP_FLAG, &b"Y"[..]);
        assert_eq!(h.inbound(dup, 2, 1), Vec::new());
        assert_eq!(h.state.status(), SessionStatus::LoggedOn);
    }

    #[test]
    fn peer_logout_is_acked_then_drained() {
        let mut h = Harness::new();
        h.logon();
        let actions = h.inbound(protocol::build_logout(None), 2, 1);
        let replies = sent(&actions);
        assert_eq!(replies[0].msg_type(), MsgType::Logout);
        assert!(matches!(
            actions.last(),
            Some(Action::DisconnectAfterDrain(DisconnectReason::PeerClosed))
        ));
        assert_eq!(h.state.status(), SessionStatus::LogoutSent);
    }

    #[test]
    fn shutdown_sends_logout_and_peer_ack_completes() {
        let mut h = Harness::new();
        h.logon();
        let actions = h.state.on_shutdown();
        assert!(matches!(actions[0], Action::Send(_)));
        h.note_sends(&actions, h.base);
        assert_eq!(h.state.status(), SessionStatus::LogoutSent);

        let actions = h.inbound(protocol::build_logout(None), 2, 1);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Disconnect(DisconnectReason::ApplicationRequested))));
    }

    #[test]
    fn reset_seq_num_flag_resets_both_counters() {
        let mut h = Harness::with_counters(40, 70);
        let mut logon = protocol::build_logon(30, false);
        logon.set(tags::RESET_SEQ_NUM_FLAG, &b"Y"[..]);
        let actions = h.inbound(logon, 1, 0);
        let replies = sent(&actions);
        assert!(replies[0].get_flag(tags::RESET_SEQ_NUM_FLAG));
        assert_eq!(h.state.next_inbound(), 2);
        // Reply consumed outbound seq 1.
        assert_eq!(h.state.next_outbound(), 2);
    }

    #[test]
    fn logon_ahead_of_recovered_counter_requests_resend() {
        let mut h = Harness::with_counters(3, 1);
        let actions = h.inbound(protocol::build_logon(30, false), 7, 0);
        let replies = sent(&actions);
        assert_eq!(replies[0].msg_type(), MsgType::Logon);
        assert_eq!(replies[1].msg_type(), MsgType::ResendRequest);
        assert_eq!(replies[1].get_u64(tags::BEGIN_SEQ_NO), Some(3));
        assert_eq!(replies[1].get_u64(tags::END_SEQ_NO), Some(6));
        assert_eq!(h.state.status(), SessionStatus::LoggedOn);

        // Peer gap-fills the whole run; the logon slot itself is done.
        let actions = h.inbound(protocol::build_sequence_reset(7, true), 3, 1);
        assert!(matches!(actions[0], Action::Journal { seq: 3, .. }));
        assert_eq!(h.state.next_inbound(), 8);
    }

    #[test]
    fn gap_fill_to_current_expectation_is_noop() {
        let mut h = Harness::new();
        h.logon();
        let before = h.state.next_inbound();
        let actions = h.inbound(protocol::build_sequence_reset(before, true), before, 1);
        assert_eq!(actions, Vec::new());
        assert_eq!(h.state.next_inbound(), before);
    }

    #[test]
    fn gap_fill_backwards_is_rejected() {
        let mut h = Harness::with_counters(10, 1);
        h.inbound(protocol::build_logon(30, false), 10, 0);
        let actions = h.inbound(protocol::build_sequence_reset(4, true), 11, 1);
        let replies = sent(&actions);
        assert_eq!(replies[0].msg_type(), MsgType::Reject);
        assert_eq!(replies[0].get_u64(tags::SESSION_REJECT_REASON), Some(5));
    }

    #[test]
    fn hard_reset_applies_unconditionally() {
        let mut h = Harness::with_counters(10, 1);
        h.inbound(protocol::build_logon(30, false), 10, 0);
        h.inbound(protocol::build_sequence_reset(4, false), 11, 1);
        assert_eq!(h.state.next_inbound(), 4);
    }

    #[test]
    fn empty_value_field_draws_reject_when_logged_on() {
        let mut h = Harness::new();
        h.logon();
        let (now, wall) = h.at(1);
        // Heartbeat whose TestReqID (112) carries no value: the tag is
        // identifiable, so the session answers with a Reject and stays up.
        let frame = Bytes::from_static(
            b"8=FIX.4.4\x019=50\x0135=0\x0134=2\x0149=CLI\x0156=SRV\x0152=20240315-12:00:01\x01112=\x0110=158\x01",
        );
        let actions = h.state.on_frame(frame, now, wall);
        assert_eq!(actions.len(), 1);
        if let Action::Send(reject) = &actions[0] {
            assert_eq!(reject.msg_type(), MsgType::Reject);
            assert_eq!(reject.get_u64(tags::SESSION_REJECT_REASON), Some(4));
            assert_eq!(reject.get_u64(tags::REF_TAG_ID), Some(112));
            assert_eq!(reject.get_u64(tags::REF_SEQ_NUM), Some(0));
        } else {
            panic!("expected a Reject send, got {actions:?}");
        }
        assert_eq!(h.state.status(), SessionStatus::LoggedOn);
        // The garbled frame does not advance the inbound counter.
        assert_eq!(h.state.next_inbound(), 2);
    }

    #[test]
    fn garble_without_identifiable_tag_disconnects() {
        let mut h = Harness::new();
        h.logon();
        let (now, wall) = h.at(1);
        let frame =
            Bytes::from_static(b"8=FIX.4.4\x019=18\x0135=0\x0134=2\x01garbage\x0110=000\x01");
        let actions = h.state.on_frame(frame, now, wall);
        assert_eq!(
            actions,
            vec![Action::Disconnect(DisconnectReason::ProtocolError)]
        );
        assert_eq!(h.state.status(), SessionStatus::Disconnecting);
    }

    #[test]
    fn comp_id_mismatch_rejects_and_disconnects() {
        let mut h = Harness::new();
        h.logon();
        let (now, wall) = h.at(1);
        let mut msg = protocol::build_heartbeat(None);
        msg.stamp_header(2, "IMPOSTOR", "SRV", wall);
        let frame = protocol::encode(&msg).unwrap();
        let actions = h.state.on_frame(frame, now, wall);
        assert!(matches!(actions[0], Action::Send(_)));
        assert!(matches!(
            actions[1],
            Action::DisconnectAfterDrain(DisconnectReason::ProtocolError)
        ));
    }

    #[test]
    fn stale_sending_time_rejects_but_stays_connected() {
        let mut h = Harness::new();
        h.logon();
        let (now, wall) = h.at(300);
        let mut msg = protocol::build_heartbeat(None);
        // Stamped five minutes behind the session clock.
        msg.stamp_header(2, "CLI", "SRV", h.wall);
        let frame = protocol::encode(&msg).unwrap();
        let actions = h.state.on_frame(frame, now, wall);
        assert_eq!(actions.len(), 1);
        if let Action::Send(reject) = &actions[0] {
            assert_eq!(reject.msg_type(), MsgType::Reject);
            assert_eq!(reject.get_u64(tags::SESSION_REJECT_REASON), Some(10));
            assert_eq!(reject.get_u64(tags::REF_SEQ_NUM), Some(2));
        } else {
            panic!("expected a Reject send");
        }
        assert_eq!(h.state.status(), SessionStatus::LoggedOn);
    }

    #[test]
    fn resend_request_resolves_end_seq_zero_to_last_sent() {
        let mut h = Harness::new();
        h.logon();
        // Outbound so far: logon reply (seq 1); pretend more were sent.
        h.state.alloc_outbound_seq(); // 2
        h.state.alloc_outbound_seq(); // 3
        let actions = h.inbound(protocol::build_resend_request(1, 0), 2, 1);
        assert!(actions.contains(&Action::ResendStored { begin: 1, end: 3 }));
    }

    #[test]
    fn first_frame_not_logon_closes_without_reply() {
        let mut h = Harness::new();
        let actions = h.inbound(protocol::build_heartbeat(None), 1, 0);
        assert_eq!(
            actions,
            vec![Action::Disconnect(DisconnectReason::ProtocolError)]
        );
        assert_eq!(sent(&actions).len(), 0);
    }

    #[test]
    fn application_message_forwarded_in_order() {
        let mut h = Harness::new();
        h.logon();
        let actions = h.inbound(order_msg("x-1"), 2, 1);
        assert!(matches!(actions[0], Action::Journal { seq: 2, .. }));
        match &actions[1] {
            Action::App(m) => assert_eq!(m.get_str(tags::CL_ORD_ID), Some("x-1")),
            other => panic!("expected App action, got {other:?}"),
        }
        assert_eq!(h.state.next_inbound(), 3);
    }
}
