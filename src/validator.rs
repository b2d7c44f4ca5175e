//! Structural and semantic message validation.
//!
//! Pure: the validator inspects a decoded message against the session's
//! identity and clock and produces `Ok` or a typed [`Rejection`]. The state
//! machine decides whether to reply, disconnect, or both.

use chrono::{DateTime, Duration, Utc};

use crate::error::{Rejection, SessionRejectReason};
use crate::protocol::{parse_timestamp, tags, FixMessage, MsgType};

pub struct ValidationContext<'a> {
    /// Our CompID; the peer must address messages to it (tag 56).
    pub local_comp_id: &'a str,
    /// The peer's CompID; messages must carry it as sender (tag 49).
    pub remote_comp_id: &'a str,
    pub now: DateTime<Utc>,
    pub max_clock_skew: Duration,
}

/// Required body tags per session-level message type. Application types
/// beyond the recognized set pass with header checks only.
fn required_tags(msg_type: &MsgType) -> &'static [u32] {
    match msg_type {
        MsgType::Logon => &[tags::ENCRYPT_METHOD, tags::HEART_BT_INT],
        MsgType::TestRequest => &[tags::TEST_REQ_ID],
        MsgType::ResendRequest => &[tags::BEGIN_SEQ_NO, tags::END_SEQ_NO],
        MsgType::SequenceReset => &[tags::NEW_SEQ_NO],
        MsgType::Reject => &[tags::REF_SEQ_NUM],
        MsgType::NewOrderSingle => &[
            tags::CL_ORD_ID,
            tags::SYMBOL,
            tags::SIDE,
            tags::ORDER_QTY,
            tags::ORD_TYPE,
        ],
        MsgType::ExecutionReport => &[tags::EXEC_TYPE],
        MsgType::Heartbeat | MsgType::Logout | MsgType::Other(_) => &[],
    }
}

pub fn validate(msg: &FixMessage, ctx: &ValidationContext<'_>) -> Result<(), Rejection> {
    let msg_type = msg.msg_type();

    let seq_value = msg
        .get(tags::MSG_SEQ_NUM)
        .ok_or_else(|| missing_tag(tags::MSG_SEQ_NUM, &msg_type))?;
    if msg.get_u64(tags::MSG_SEQ_NUM).is_none() {
        return Err(Rejection::new(
            SessionRejectReason::IncorrectDataFormat,
            format!(
                "MsgSeqNum not numeric: {}",
                String::from_utf8_lossy(seq_value)
            ),
        )
        .with_tag(tags::MSG_SEQ_NUM)
        .with_msg_type(msg_type.as_str()));
    }

    let sender = msg
        .get_str(tags::SENDER_COMP_ID)
        .ok_or_else(|| missing_tag(tags::SENDER_COMP_ID, &msg_type))?;
    let target = msg
        .get_str(tags::TARGET_COMP_ID)
        .ok_or_else(|| missing_tag(tags::TARGET_COMP_ID, &msg_type))?;
    if sender != ctx.remote_comp_id || target != ctx.local_comp_id {
        return Err(Rejection::new(
            SessionRejectReason::CompIdProblem,
            format!("CompID mismatch: {}->{}", sender, target),
        )
        .with_msg_type(msg_type.as_str())
        .disconnecting());
    }

    let sending_time = msg
        .get(tags::SENDING_TIME)
        .ok_or_else(|| missing_tag(tags::SENDING_TIME, &msg_type))?;
    match parse_timestamp(sending_time) {
        None => {
            return Err(Rejection::new(
                SessionRejectReason::IncorrectDataFormat,
                "SendingTime malformed",
            )
            .with_tag(tags::SENDING_TIME)
            .with_msg_type(msg_type.as_str()));
        }
        Some(t) => {
            let skew = ctx.now.signed_duration_since(t).abs();
            if skew > ctx.max_clock_skew {
                return Err(Rejection::new(
                    SessionRejectReason::SendingTimeAccuracyProblem,
                    "SendingTime outside accepted window",
                )
                .with_tag(tags::SENDING_TIME)
                .with_msg_type(msg_type.as_str()));
            }
        }
    }

    for &tag in required_tags(&msg_type) {
        if msg.get(tag).is_none() {
            return Err(missing_tag(tag, &msg_type));
        }
    }

    Ok(())
}

fn missing_tag(tag: u32, msg_type: &MsgType) -> Rejection {
    Rejection::new(
        SessionRejectReason::RequiredTagMissing,
        format!("required tag {} missing", tag),
    )
    .with_tag(tag)
    .with_msg_type(msg_type.as_str())
}
