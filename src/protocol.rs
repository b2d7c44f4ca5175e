//! FIX 4.4 wire codec: field-level decode/encode, tag constants, message
//! type dispatch, and builders for the administrative messages the session
//! layer emits.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{DecodeError, EncodeError};

/// Field separator octet ("SOH", ASCII control-A).
pub const SOH: u8 = 0x01;

/// The only protocol version this engine speaks.
pub const BEGIN_STRING: &str = "FIX.4.4";

/// Wire timestamp format: second-precision UTC.
pub const UTC_TIMESTAMP_FMT: &str = "%Y%m%d-%H:%M:%S";

/// Tag numbers recognized by the engine.
pub mod tags {
    pub const BEGIN_SEQ_NO: u32 = 7;
    pub const BEGIN_STRING: u32 = 8;
    pub const BODY_LENGTH: u32 = 9;
    pub const CHECK_SUM: u32 = 10;
    pub const CL_ORD_ID: u32 = 11;
    pub const END_SEQ_NO: u32 = 16;
    pub const MSG_SEQ_NUM: u32 = 34;
    pub const MSG_TYPE: u32 = 35;
    pub const NEW_SEQ_NO: u32 = 36;
    pub const ORDER_QTY: u32 = 38;
    pub const ORD_TYPE: u32 = 40;
    pub const POSS_DUP_FLAG: u32 = 43;
    pub const PRICE: u32 = 44;
    pub const REF_SEQ_NUM: u32 = 45;
    pub const SENDER_COMP_ID: u32 = 49;
    pub const SENDING_TIME: u32 = 52;
    pub const SIDE: u32 = 54;
    pub const SYMBOL: u32 = 55;
    pub const TARGET_COMP_ID: u32 = 56;
    pub const TEXT: u32 = 58;
    pub const ENCRYPT_METHOD: u32 = 98;
    pub const HEART_BT_INT: u32 = 108;
    pub const TEST_REQ_ID: u32 = 112;
    pub const ORIG_SENDING_TIME: u32 = 122;
    pub const GAP_FILL_FLAG: u32 = 123;
    pub const RESET_SEQ_NUM_FLAG: u32 = 141;
    pub const EXEC_TYPE: u32 = 150;
    pub const REF_TAG_ID: u32 = 371;
    pub const REF_MSG_TYPE: u32 = 372;
    pub const SESSION_REJECT_REASON: u32 = 373;
}

/// FIX message types, keyed by the MsgType (tag 35) field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgType {
    /// Logon (35=A)
    Logon,
    /// Heartbeat (35=0)
    Heartbeat,
    /// Test Request (35=1)
    TestRequest,
    /// Resend Request (35=2)
    ResendRequest,
    /// Reject (35=3)
    Reject,
    /// Sequence Reset / Gap Fill (35=4)
    SequenceReset,
    /// Logout (35=5)
    Logout,
    /// New Order - Single (35=D)
    NewOrderSingle,
    /// Execution Report (35=8)
    ExecutionReport,
    /// Anything else; forwarded to the application handler.
    Other(String),
}

impl MsgType {
    pub fn from_bytes(value: &[u8]) -> Self {
        match value {
            b"A" => MsgType::Logon,
            b"0" => MsgType::Heartbeat,
            b"1" => MsgType::TestRequest,
            b"2" => MsgType::ResendRequest,
            b"3" => MsgType::Reject,
            b"4" => MsgType::SequenceReset,
            b"5" => MsgType::Logout,
            b"D" => MsgType::NewOrderSingle,
            b"8" => MsgType::ExecutionReport,
            other => MsgType::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MsgType::Logon => "A",
            MsgType::Heartbeat => "0",
            MsgType::TestRequest => "1",
            MsgType::ResendRequest => "2",
            MsgType::Reject => "3",
            MsgType::SequenceReset => "4",
            MsgType::Logout => "5",
            MsgType::NewOrderSingle => "D",
            MsgType::ExecutionReport => "8",
            MsgType::Other(s) => s.as_str(),
        }
    }

    /// Session-level administrative types. These are handled by the state
    /// machine and are never replayed on resend.
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            MsgType::Logon
                | MsgType::Heartbeat
                | MsgType::TestRequest
                | MsgType::ResendRequest
                | MsgType::Reject
                | MsgType::SequenceReset
                | MsgType::Logout
        )
    }
}

/// A parsed FIX message: an ordered multimap of (tag, value) pairs.
///
/// Holds every field between BodyLength and CheckSum in wire order, MsgType
/// first. BeginString, BodyLength and CheckSum are derived at encode time,
/// so `decode(encode(m)) == m` and, for a well-formed frame `b`,
/// `encode(decode(b)) == b` byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixMessage {
    fields: Vec<(u32, Vec<u8>)>,
}

impl FixMessage {
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            fields: vec![(tags::MSG_TYPE, msg_type.as_str().as_bytes().to_vec())],
        }
    }

    pub fn msg_type(&self) -> MsgType {
        self.get(tags::MSG_TYPE)
            .map(MsgType::from_bytes)
            .unwrap_or(MsgType::Other(String::new()))
    }

    /// Last occurrence of `tag`, if any. Duplicate tags are permitted on
    /// the wire; the last one wins for lookups.
    pub fn get(&self, tag: u32) -> Option<&[u8]> {
        self.fields
            .iter()
            .rev()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_slice())
    }

    pub fn get_str(&self, tag: u32) -> Option<&str> {
        self.get(tag).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn get_u64(&self, tag: u32) -> Option<u64> {
        self.get_str(tag).and_then(|s| s.parse().ok())
    }

    /// Boolean fields use "Y"/"N" on the wire; absent means false.
    pub fn get_flag(&self, tag: u32) -> bool {
        self.get(tag) == Some(&b"Y"[..])
    }

    /// Replace the last occurrence of `tag`, or append the field.
    pub fn set(&mut self, tag: u32, value: impl Into<Vec<u8>>) {
        let value = value.into();
        if let Some(slot) = self.fields.iter_mut().rev().find(|(t, _)| *t == tag) {
            slot.1 = value;
        } else {
            self.fields.push((tag, value));
        }
    }

    pub fn set_u64(&mut self, tag: u32, value: u64) {
        self.set(tag, value.to_string().into_bytes());
    }

    /// Append without replacing; used by the decoder to preserve duplicates.
    pub(crate) fn push_field(&mut self, tag: u32, value: Vec<u8>) {
        self.fields.push((tag, value));
    }

    pub fn fields(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.fields.iter().map(|(t, v)| (*t, v.as_slice()))
    }

    /// Stamp the standard header fields right after MsgType, in the
    /// conventional 34, 49, 56, 52 order. Replaces existing occurrences so
    /// the operation is idempotent.
    pub fn stamp_header(
        &mut self,
        seq: u64,
        sender_comp_id: &str,
        target_comp_id: &str,
        sending_time: DateTime<Utc>,
    ) {
        for tag in [
            tags::MSG_SEQ_NUM,
            tags::SENDER_COMP_ID,
            tags::TARGET_COMP_ID,
            tags::SENDING_TIME,
        ] {
            self.fields.retain(|(t, _)| *t != tag);
        }
        let at = usize::from(!self.fields.is_empty());
        self.fields.splice(
            at..at,
            [
                (tags::MSG_SEQ_NUM, seq.to_string().into_bytes()),
                (tags::SENDER_COMP_ID, sender_comp_id.as_bytes().to_vec()),
                (tags::TARGET_COMP_ID, target_comp_id.as_bytes().to_vec()),
                (
                    tags::SENDING_TIME,
                    format_timestamp(sending_time).into_bytes(),
                ),
            ],
        );
    }
}

/// Sum of `bytes` modulo 256, as the CheckSum field defines it.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format(UTC_TIMESTAMP_FMT).to_string()
}

pub fn parse_timestamp(value: &[u8]) -> Option<DateTime<Utc>> {
    let s = std::str::from_utf8(value).ok()?;
    NaiveDateTime::parse_from_str(s, UTC_TIMESTAMP_FMT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Encode a message to a complete wire frame: BeginString, computed
/// BodyLength, body fields in insertion order, computed CheckSum.
pub fn encode(msg: &FixMessage) -> std::result::Result<Bytes, EncodeError> {
    let mut body_len = 0usize;
    for (tag, value) in msg.fields() {
        if value.contains(&SOH) {
            return Err(EncodeError::SeparatorInValue { tag });
        }
        body_len += decimal_width(tag as u64) + 1 + value.len() + 1;
    }

    let mut buf = BytesMut::with_capacity(body_len + 32);
    buf.put_slice(b"8=");
    buf.put_slice(BEGIN_STRING.as_bytes());
    buf.put_u8(SOH);
    buf.put_slice(b"9=");
    buf.put_slice(body_len.to_string().as_bytes());
    buf.put_u8(SOH);
    for (tag, value) in msg.fields() {
        buf.put_slice(tag.to_string().as_bytes());
        buf.put_u8(b'=');
        buf.put_slice(value);
        buf.put_u8(SOH);
    }
    let ck = checksum(&buf);
    buf.put_slice(b"10=");
    buf.put_slice(format!("{:03}", ck).as_bytes());
    buf.put_u8(SOH);
    Ok(buf.freeze())
}

fn decimal_width(mut n: u64) -> usize {
    let mut width = 1;
    while n >= 10 {
        n /= 10;
        width += 1;
    }
    width
}

/// Decode a framed message into its fields.
///
/// The frame is expected to have passed the framer (boundaries and checksum
/// verified); decode re-checks only what it needs to walk the fields.
pub fn decode(frame: &[u8]) -> std::result::Result<FixMessage, DecodeError> {
    let mut rest = frame
        .strip_prefix(b"8=FIX.4.4\x01")
        .ok_or(DecodeError::BadBeginString)?;

    // Skip the BodyLength field; encode recomputes it.
    if !rest.starts_with(b"9=") {
        return Err(DecodeError::MissingBodyLength);
    }
    let soh = memchr::memchr(SOH, rest).ok_or(DecodeError::Truncated)?;
    rest = &rest[soh + 1..];

    let mut msg = FixMessage { fields: Vec::new() };
    loop {
        let soh = memchr::memchr(SOH, rest).ok_or(DecodeError::Truncated)?;
        let field = &rest[..soh];
        rest = &rest[soh + 1..];

        let eq = memchr::memchr(b'=', field).ok_or_else(|| {
            DecodeError::BadTag(String::from_utf8_lossy(field).into_owned())
        })?;
        let tag: u32 = std::str::from_utf8(&field[..eq])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| DecodeError::BadTag(String::from_utf8_lossy(&field[..eq]).into_owned()))?;

        if tag == tags::CHECK_SUM {
            break;
        }
        let value = &field[eq + 1..];
        if value.is_empty() {
            return Err(DecodeError::MissingValue { tag });
        }
        msg.push_field(tag, value.to_vec());
        if rest.is_empty() {
            return Err(DecodeError::Truncated);
        }
    }

    let leads_with_msg_type =
        matches!(msg.fields.first(), Some((tag, _)) if *tag == tags::MSG_TYPE);
    if leads_with_msg_type {
        Ok(msg)
    } else {
        Err(DecodeError::MissingMsgType)
    }
}

// Builders for the administrative messages the session layer sends. Header
// fields (34, 49, 56, 52) are stamped by the send path, never here, so that
// sequence assignment stays atomic with the write.

pub fn build_logon(heart_bt_int_secs: u64, reset_seq_num: bool) -> FixMessage {
    let mut msg = FixMessage::new(MsgType::Logon);
    msg.set(tags::ENCRYPT_METHOD, &b"0"[..]);
    msg.set_u64(tags::HEART_BT_INT, heart_bt_int_secs);
    if reset_seq_num {
        msg.set(tags::RESET_SEQ_NUM_FLAG, &b"Y"[..]);
    }
    msg
}

pub fn build_heartbeat(test_req_id: Option<&[u8]>) -> FixMessage {
    let mut msg = FixMessage::new(MsgType::Heartbeat);
    if let Some(id) = test_req_id {
        msg.set(tags::TEST_REQ_ID, id);
    }
    msg
}

pub fn build_test_request(id: &str) -> FixMessage {
    let mut msg = FixMessage::new(MsgType::TestRequest);
    msg.set(tags::TEST_REQ_ID, id.as_bytes());
    msg
}

pub fn build_logout(text: Option<&str>) -> FixMessage {
    let mut msg = FixMessage::new(MsgType::Logout);
    if let Some(t) = text {
        msg.set(tags::TEXT, t.as_bytes());
    }
    msg
}

pub fn build_resend_request(begin_seq_no: u64, end_seq_no: u64) -> FixMessage {
    let mut msg = FixMessage::new(MsgType::ResendRequest);
    msg.set_u64(tags::BEGIN_SEQ_NO, begin_seq_no);
    msg.set_u64(tags::END_SEQ_NO, end_seq_no);
    msg
}

pub fn build_sequence_reset(new_seq_no: u64, gap_fill: bool) -> FixMessage {
    let mut msg = FixMessage::new(MsgType::SequenceReset);
    if gap_fill {
        msg.set(tags::GAP_FILL_FLAG, &b"Y"[..]);
        msg.set(tags::POSS_DUP_FLAG, &b"Y"[..]);
    }
    msg.set_u64(tags::NEW_SEQ_NO, new_seq_no);
    msg
}

pub fn build_reject(ref_seq_num: u64, rejection: &crate::error::Rejection) -> FixMessage {
    let mut msg = FixMessage::new(MsgType::Reject);
    msg.set_u64(tags::REF_SEQ_NUM, ref_seq_num);
    if let Some(tag) = rejection.ref_tag_id {
        msg.set_u64(tags::REF_TAG_ID, u64::from(tag));
    }
    if let Some(ref mt) = rejection.ref_msg_type {
        msg.set(tags::REF_MSG_TYPE, mt.as_bytes());
    }
    msg.set_u64(
        tags::SESSION_REJECT_REASON,
        u64::from(rejection.reason.code()),
    );
    if !rejection.text.is_empty() {
        msg.set(tags::TEXT, rejection.text.as_bytes());
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 0).unwrap()
    }

    #[test]
    fn encode_stamps_length_and_checksum() {
        let mut msg = build_heartbeat(None);
        msg.stamp_header(2, "SELF", "PEER", ts());
        let frame = encode(&msg).unwrap();

        let text = String::from_utf8_lossy(&frame);
        assert!(text.starts_with("8=FIX.4.4\x019="));
        assert!(text.contains("35=0\x0134=2\x0149=SELF\x0156=PEER\x0152=20240315-10:30:00\x01"));

        // BodyLength covers first byte after 9=..SOH through the SOH before 10=.
        let nine = frame.windows(2).position(|w| w == b"9=").unwrap();
        let len_end = nine + 2 + frame[nine + 2..].iter().position(|b| *b == SOH).unwrap();
        let declared: usize = std::str::from_utf8(&frame[nine + 2..len_end])
            .unwrap()
            .parse()
            .unwrap();
        let ten = frame.len() - 7;
        assert_eq!(declared, ten - (len_end + 1));

        // Independently recomputed checksum matches the embedded field.
        let declared_ck: u8 = std::str::from_utf8(&frame[ten + 3..ten + 6])
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(declared_ck, checksum(&frame[..ten]));
    }

    #[test]
    fn decode_encode_round_trips_bytes() {
        let mut msg = build_logon(30, false);
        msg.stamp_header(1, "SRV", "CLI", ts());
        let frame = encode(&msg).unwrap();
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(encode(&decoded).unwrap(), frame);
    }

    #[test]
    fn decode_keeps_duplicate_tags_last_wins() {
        let frame =
            b"8=FIX.4.4\x019=24\x0135=0\x0134=1\x0158=one\x0158=two\x0110=156\x01";
        let msg = decode(&frame[..]).unwrap();
        assert_eq!(msg.get_str(tags::TEXT), Some("two"));
        assert_eq!(msg.fields().filter(|(t, _)| *t == tags::TEXT).count(), 2);
    }

    #[test]
    fn decode_rejects_missing_msg_type() {
        let frame = b"8=FIX.4.4\x019=5\x0134=1\x0110=163\x01";
        assert_eq!(decode(&frame[..]), Err(DecodeError::MissingMsgType));
    }

    #[test]
    fn decode_rejects_empty_value_citing_tag() {
        let frame = b"8=FIX.4.4\x019=14\x0135=0\x0134=1\x0158=\x0110=084\x01";
        assert_eq!(
            decode(&frame[..]),
            Err(DecodeError::MissingValue { tag: 58 })
        );
    }

    #[test]
    fn encode_refuses_soh_in_value() {
        let mut msg = build_heartbeat(None);
        msg.set(tags::TEXT, &b"bad\x01value"[..]);
        assert_eq!(
            encode(&msg),
            Err(EncodeError::SeparatorInValue { tag: tags::TEXT })
        );
    }

    #[test]
    fn stamp_header_is_idempotent_and_ordered() {
        let mut msg = build_test_request("TEST_1");
        msg.stamp_header(5, "A", "B", ts());
        msg.stamp_header(6, "A", "B", ts());
        let order: Vec<u32> = msg.fields().map(|(t, _)| t).collect();
        assert_eq!(
            &order[..5],
            &[
                tags::MSG_TYPE,
                tags::MSG_SEQ_NUM,
                tags::SENDER_COMP_ID,
                tags::TARGET_COMP_ID,
                tags::SENDING_TIME
            ]
        );
        assert_eq!(msg.get_u64(tags::MSG_SEQ_NUM), Some(6));
        assert_eq!(msg.get_str(tags::TEST_REQ_ID), Some("TEST_1"));
    }

    #[test]
    fn timestamp_round_trip() {
        let t = ts();
        let s = format_timestamp(t);
        assert_eq!(s, "20240315-10:30:00");
        assert_eq!(parse_timestamp(s.as_bytes()), Some(t));
        assert_eq!(parse_timestamp(b"2024-03-15 10:30"), None);
    }
}
