//! Stream framer: extracts complete FIX frames from a growing byte buffer
//! by walking the BeginString / BodyLength / CheckSum boundaries.

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::{checksum, SOH};

const PREFIX: &[u8] = b"8=FIX.4.4\x01";
/// "10=" + three digits + SOH.
const TRAILER_LEN: usize = 7;
/// Longest BodyLength digit run worth scanning: MAX_BODY_LENGTH has five
/// digits; a sixth digit is already over the limit.
const MAX_LEN_DIGITS: usize = 6;

/// Largest BodyLength the framer accepts.
pub const MAX_BODY_LENGTH: u64 = 65_535;

/// Incremental FIX 4.4 framer.
///
/// Feed bytes into a [`BytesMut`] and call [`Framer::extract`] until it
/// returns `Ok(None)` (incomplete; wait for more bytes). On success the
/// frame is split off the front of the buffer; on `Err` the buffer is left
/// untouched and the caller must close the connection without replying.
#[derive(Debug, Default)]
pub struct Framer;

impl Framer {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        let data: &[u8] = buf.as_ref();
        if data.is_empty() {
            return Ok(None);
        }

        // The frame must begin exactly at the cursor; any preceding
        // non-matching byte is a framing violation, not garbage to skip.
        let probe = data.len().min(PREFIX.len());
        if data[..probe] != PREFIX[..probe] {
            return Err(ProtocolError::BadBeginString);
        }
        if data.len() < PREFIX.len() + 2 {
            return Ok(None);
        }
        if &data[PREFIX.len()..PREFIX.len() + 2] != b"9=" {
            return Err(ProtocolError::BadBodyLength);
        }

        let len_start = PREFIX.len() + 2;
        let scan_end = data.len().min(len_start + MAX_LEN_DIGITS + 1);
        let soh = match memchr::memchr(SOH, &data[len_start..scan_end]) {
            Some(i) => len_start + i,
            None if data.len() < len_start + MAX_LEN_DIGITS + 1 => return Ok(None),
            None => {
                // More digits than MAX_BODY_LENGTH could ever have.
                let run = &data[len_start..scan_end];
                return Err(if run.iter().all(u8::is_ascii_digit) {
                    let val = std::str::from_utf8(run)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(u64::MAX);
                    ProtocolError::BodyLengthTooLarge(val)
                } else {
                    ProtocolError::BadBodyLength
                });
            }
        };
        let digits = &data[len_start..soh];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(ProtocolError::BadBodyLength);
        }
        let body_len: u64 = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(ProtocolError::BadBodyLength)?;
        if body_len > MAX_BODY_LENGTH {
            return Err(ProtocolError::BodyLengthTooLarge(body_len));
        }

        let body_start = soh + 1;
        let trailer_start = body_start + body_len as usize;
        let frame_end = trailer_start + TRAILER_LEN;
        if data.len() < frame_end {
            return Ok(None);
        }

        // BodyLength is trusted: the trailer must sit exactly where it says.
        let trailer = &data[trailer_start..frame_end];
        if &trailer[..3] != b"10=" || trailer[6] != SOH {
            return Err(ProtocolError::LengthMismatch);
        }
        let computed = checksum(&data[..trailer_start]);
        let declared: u8 = std::str::from_utf8(&trailer[3..6])
            .ok()
            .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse().ok())
            .ok_or(ProtocolError::BadChecksum {
                declared: 0,
                computed,
            })?;
        if declared != computed {
            return Err(ProtocolError::BadChecksum { declared, computed });
        }

        Ok(Some(buf.split_to(frame_end).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{self, build_heartbeat};
    use chrono::{TimeZone, Utc};

    fn frame() -> Bytes {
        let mut msg = build_heartbeat(None);
        msg.stamp_header(7, "SELF", "PEER", Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap());
        protocol::encode(&msg).unwrap()
    }

    #[test]
    fn extracts_whole_frame_and_advances() {
        let wire = frame();
        let mut buf = BytesMut::from(&wire[..]);
        let framer = Framer::new();
        let got = framer.extract(&mut buf).unwrap().unwrap();
        assert_eq!(got, wire);
        assert!(buf.is_empty());
        assert_eq!(framer.extract(&mut buf).unwrap(), None);
    }

    #[test]
    fn split_delivery_is_incomplete_until_whole() {
        let wire = frame();
        let framer = Framer::new();
        let mut buf = BytesMut::new();
        for chunk in wire.chunks(5) {
            let before = buf.len();
            let extracted = framer.extract(&mut buf).unwrap();
            if buf.len() + chunk.len() < wire.len() {
                assert_eq!(extracted, None);
                // Incomplete extraction consumes nothing.
                assert_eq!(buf.len(), before);
            }
            buf.extend_from_slice(chunk);
        }
        assert_eq!(framer.extract(&mut buf).unwrap().unwrap(), wire);
    }

    #[test]
    fn two_frames_back_to_back() {
        let wire = frame();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire);
        buf.extend_from_slice(&wire);
        let framer = Framer::new();
        assert_eq!(framer.extract(&mut buf).unwrap().unwrap(), wire);
        assert_eq!(framer.extract(&mut buf).unwrap().unwrap(), wire);
        assert!(buf.is_empty());
    }

    #[test]
    fn junk_prefix_is_bad_begin_string() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        assert_eq!(
            Framer::new().extract(&mut buf),
            Err(ProtocolError::BadBeginString)
        );
    }

    #[test]
    fn wrong_version_is_bad_begin_string() {
        let mut buf = BytesMut::from(&b"8=FIX.4.2\x019=5\x0135=0\x0110=000\x01"[..]);
        assert_eq!(
            Framer::new().extract(&mut buf),
            Err(ProtocolError::BadBeginString)
        );
    }

    #[test]
    fn oversized_body_length_rejected_at_boundary() {
        let mut buf = BytesMut::from(&b"8=FIX.4.4\x019=65536\x01"[..]);
        assert_eq!(
            Framer::new().extract(&mut buf),
            Err(ProtocolError::BodyLengthTooLarge(65_536))
        );

        // Exactly at the maximum the framer keeps waiting for the body.
        let mut buf = BytesMut::from(&b"8=FIX.4.4\x019=65535\x01"[..]);
        assert_eq!(Framer::new().extract(&mut buf).unwrap(), None);
    }

    #[test]
    fn non_numeric_body_length_rejected() {
        let mut buf = BytesMut::from(&b"8=FIX.4.4\x019=12a4\x0135=0\x01"[..]);
        assert_eq!(
            Framer::new().extract(&mut buf),
            Err(ProtocolError::BadBodyLength)
        );
    }

    #[test]
    fn checksum_mismatch_detected() {
        let wire = frame();
        let mut tampered = BytesMut::from(&wire[..]);
        let last_digit = wire.len() - 2;
        tampered[last_digit] = if tampered[last_digit] == b'9' {
            b'0'
        } else {
            tampered[last_digit] + 1
        };
        assert!(matches!(
            Framer::new().extract(&mut tampered),
            Err(ProtocolError::BadChecksum { .. })
        ));
    }

    #[test]
    fn early_terminator_is_length_mismatch() {
        // The checksum field appears inside the declared body; the framer
        // trusts BodyLength and finds no trailer where one must be.
        let mut raw = Vec::new();
        raw.extend_from_slice(b"8=FIX.4.4\x019=50\x01");
        raw.extend_from_slice(b"35=0\x0134=1\x0110=111\x01");
        raw.extend_from_slice(&[b'X'; 32]);
        raw.extend_from_slice(b"XXXXXXX");
        let mut buf = BytesMut::from(&raw[..]);
        assert_eq!(
            Framer::new().extract(&mut buf),
            Err(ProtocolError::LengthMismatch)
        );
    }

    #[test]
    fn missing_trailing_separator_is_incomplete() {
        let wire = frame();
        let mut buf = BytesMut::from(&wire[..wire.len() - 1]);
        assert_eq!(Framer::new().extract(&mut buf).unwrap(), None);
    }
}
