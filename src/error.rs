use thiserror::Error;

/// Top-level error type for fixa operations.
#[derive(Debug, Error)]
pub enum FixaError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, FixaError>;

/// Framing errors. All of these are unrecoverable for the connection:
/// the peer gets no reply and the socket is closed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad begin string: frame does not start with 8=FIX.4.4")]
    BadBeginString,

    #[error("bad body length field")]
    BadBodyLength,

    #[error("body length {0} exceeds maximum")]
    BodyLengthTooLarge(u64),

    #[error("checksum mismatch: declared {declared}, computed {computed}")]
    BadChecksum { declared: u8, computed: u8 },

    #[error("body length disagrees with frame contents")]
    LengthMismatch,
}

/// Errors from decoding a verified frame into fields. Where the offending
/// tag is identifiable the session replies with a Reject; otherwise the
/// connection is closed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame does not start with 8=FIX.4.4")]
    BadBeginString,

    #[error("missing body length field (tag 9)")]
    MissingBodyLength,

    #[error("missing msg type field (tag 35)")]
    MissingMsgType,

    #[error("malformed tag: {0}")]
    BadTag(String),

    #[error("tag {tag} specified without a value")]
    MissingValue { tag: u32 },

    #[error("truncated frame")]
    Truncated,
}

/// Errors from encoding a message to wire bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("value for tag {tag} contains the field separator")]
    SeparatorInValue { tag: u32 },
}

/// SessionRejectReason (tag 373) values the server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRejectReason {
    InvalidTagNumber,
    RequiredTagMissing,
    TagNotDefinedForMessageType,
    UndefinedTag,
    TagSpecifiedWithoutValue,
    ValueIsIncorrect,
    IncorrectDataFormat,
    CompIdProblem,
    SendingTimeAccuracyProblem,
    InvalidMsgType,
}

impl SessionRejectReason {
    pub fn code(&self) -> u32 {
        match self {
            SessionRejectReason::InvalidTagNumber => 0,
            SessionRejectReason::RequiredTagMissing => 1,
            SessionRejectReason::TagNotDefinedForMessageType => 2,
            SessionRejectReason::UndefinedTag => 3,
            SessionRejectReason::TagSpecifiedWithoutValue => 4,
            SessionRejectReason::ValueIsIncorrect => 5,
            SessionRejectReason::IncorrectDataFormat => 6,
            SessionRejectReason::CompIdProblem => 9,
            SessionRejectReason::SendingTimeAccuracyProblem => 10,
            SessionRejectReason::InvalidMsgType => 11,
        }
    }
}

/// A typed rejection produced by the validator or the state machine.
///
/// Carries everything needed to build a session-level Reject(3) and the
/// decision whether the connection must also be closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: SessionRejectReason,
    pub ref_tag_id: Option<u32>,
    pub ref_msg_type: Option<String>,
    pub text: String,
    pub disconnect: bool,
}

impl Rejection {
    pub fn new(reason: SessionRejectReason, text: impl Into<String>) -> Self {
        Self {
            reason,
            ref_tag_id: None,
            ref_msg_type: None,
            text: text.into(),
            disconnect: false,
        }
    }

    pub fn with_tag(mut self, tag: u32) -> Self {
        self.ref_tag_id = Some(tag);
        self
    }

    pub fn with_msg_type(mut self, msg_type: impl Into<String>) -> Self {
        self.ref_msg_type = Some(msg_type.into());
        self
    }

    pub fn disconnecting(mut self) -> Self {
        self.disconnect = true;
        self
    }
}
