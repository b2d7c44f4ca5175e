//! Outbound replay planning for incoming ResendRequests.
//!
//! Administrative messages are never replayed: contiguous runs of them
//! collapse into a single SequenceReset-GapFill whose NewSeqNo jumps past
//! the run. Application messages are re-sent with PossDupFlag=Y and
//! OrigSendingTime carrying the original stamp.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::DecodeError;
use crate::protocol::{self, tags, FixMessage};

/// One step of a planned replay, in sequence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayStep {
    /// SequenceReset-GapFill occupying `seq`, advancing the peer to
    /// `new_seq` (exclusive end of the elided run).
    GapFill { seq: u64, new_seq: u64 },
    /// Re-send of the stored application frame at `seq`.
    Resend { seq: u64, frame: Bytes },
}

/// Plan the reply to a ResendRequest for outbound range [begin, end].
///
/// `stored` holds the persisted outbound frames within the range, sorted by
/// sequence number. Sequence numbers absent from the store are skipped via
/// gap-fill as well, so a partially lost journal degrades to elision rather
/// than a stalled session.
pub fn plan_replay(stored: &[(u64, Bytes)], begin: u64, end: u64) -> Vec<ReplayStep> {
    let mut steps = Vec::new();
    if begin > end {
        return steps;
    }

    let mut fill_start: Option<u64> = None;
    let mut by_seq = stored.iter().peekable();
    for seq in begin..=end {
        let frame = loop {
            match by_seq.peek() {
                Some((s, _)) if *s < seq => {
                    by_seq.next();
                }
                Some((s, frame)) if *s == seq => break Some(frame.clone()),
                _ => break None,
            }
        };

        let is_admin = frame
            .as_ref()
            .and_then(|f| protocol::decode(f).ok())
            .map_or(true, |m| m.msg_type().is_admin());

        if is_admin {
            fill_start.get_or_insert(seq);
            continue;
        }

        if let Some(start) = fill_start.take() {
            steps.push(ReplayStep::GapFill {
                seq: start,
                new_seq: seq,
            });
        }
        if let Some(frame) = frame {
            steps.push(ReplayStep::Resend { seq, frame });
        }
    }
    if let Some(start) = fill_start.take() {
        steps.push(ReplayStep::GapFill {
            seq: start,
            new_seq: end + 1,
        });
    }
    steps
}

/// Rewrite a stored frame for PossDup retransmission: PossDupFlag=Y,
/// OrigSendingTime from the original SendingTime, SendingTime re-stamped.
/// The original MsgSeqNum is preserved.
pub fn transform_for_resend(
    frame: &[u8],
    now: DateTime<Utc>,
) -> Result<FixMessage, DecodeError> {
    let mut msg = protocol::decode(frame)?;
    if let Some(orig) = msg.get(tags::SENDING_TIME).map(<[u8]>::to_vec) {
        msg.set(tags::ORIG_SENDING_TIME, orig);
    }
    msg.set(tags::POSS_DUP_FLAG, &b"Y"[..]);
    msg.set(
        tags::SENDING_TIME,
        protocol::format_timestamp(now).into_bytes(),
    );
    Ok(msg)
}
