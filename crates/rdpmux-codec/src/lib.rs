//! Binary self-describing wire records for the display update protocol.
//!
//! Each record is framed as an array header (`u32` element count, including
//! the tag) followed by that many big-endian `u32` fields, the first of
//! which is the message-type tag. This is the same "array header + tag +
//! typed fields" shape the original msgpack encoding used, minus the
//! variable-length framing msgpack provides for things we never need here
//! (every field in this protocol is a fixed-width integer or boolean).

use std::fmt;

/// A single typed record carried over the transport in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateRecord {
    /// A dirty-rectangle notification. Inclusive-exclusive `(x1,y1)-(x2,y2)`
    /// on the wire is expressed as `(x, y, w, h)`.
    DisplayUpdate { x: i32, y: i32, w: i32, h: i32 },
    /// A resolution/format change. The shared-memory handle itself travels
    /// out-of-band via its well-known name; only geometry and pixel format
    /// are carried on the wire.
    DisplaySwitch { format: u32, w: i32, h: i32 },
    /// A keyboard event forwarded from the RDP server.
    KeyboardEvent { keycode: u32, flags: u32 },
    /// A mouse event forwarded from the RDP server.
    MouseEvent { x: i32, y: i32, flags: u32 },
    /// Consumer-side acknowledgement that it has finished reading the
    /// shared memory region for the most recent `DisplayUpdate`.
    UpdateAck { success: bool },
    /// Request to tear down the session.
    Shutdown,
}

/// Wire tag values. Numbering follows the original protocol's message-type
/// enumeration so captured traffic from either implementation decodes the
/// same way.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    DisplayUpdate = 0,
    DisplaySwitch = 1,
    Mouse = 2,
    Keyboard = 3,
    UpdateAck = 4,
    Shutdown = 5,
}

impl Tag {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::DisplayUpdate),
            1 => Some(Self::DisplaySwitch),
            2 => Some(Self::Mouse),
            3 => Some(Self::Keyboard),
            4 => Some(Self::UpdateAck),
            5 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// Errors returned by [`decode`]. The caller is expected to log these and
/// discard the offending frame, per the protocol's "corrupt framing is
/// dropped, not fatal" contract.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame too short: need at least 4 bytes for the array header")]
    TruncatedHeader,

    #[error("array header claims {claimed} elements but only {available} bytes remain")]
    TruncatedBody { claimed: u32, available: usize },

    #[error("array header declares zero elements, no tag present")]
    EmptyArray,

    #[error("unknown message tag {0}")]
    UnknownTag(u32),

    #[error("message tag {tag:?} expects {expected} array elements, got {got}")]
    WrongArity { tag: &'static str, expected: u32, got: u32 },
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DisplayUpdate => "DisplayUpdate",
            Self::DisplaySwitch => "DisplaySwitch",
            Self::Mouse => "MouseEvent",
            Self::Keyboard => "KeyboardEvent",
            Self::UpdateAck => "UpdateAck",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

const FIELD_LEN: usize = 4;

struct FieldReader<'a> {
    fields: &'a [u32],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn next(&mut self) -> u32 {
        let v = self.fields[self.pos];
        self.pos += 1;
        v
    }

    fn next_i32(&mut self) -> i32 {
        self.next() as i32
    }
}

/// Encode `record` as a length-prefixed array of big-endian `u32` fields.
#[must_use]
pub fn encode(record: &UpdateRecord) -> Vec<u8> {
    let fields: Vec<u32> = match *record {
        UpdateRecord::DisplayUpdate { x, y, w, h } => vec![
            Tag::DisplayUpdate as u32,
            x as u32,
            y as u32,
            w as u32,
            h as u32,
        ],
        UpdateRecord::DisplaySwitch { format, w, h } => {
            vec![Tag::DisplaySwitch as u32, format, w as u32, h as u32]
        }
        UpdateRecord::KeyboardEvent { keycode, flags } => {
            vec![Tag::Keyboard as u32, keycode, flags]
        }
        UpdateRecord::MouseEvent { x, y, flags } => {
            vec![Tag::Mouse as u32, x as u32, y as u32, flags]
        }
        UpdateRecord::UpdateAck { success } => {
            vec![Tag::UpdateAck as u32, u32::from(success)]
        }
        UpdateRecord::Shutdown => vec![Tag::Shutdown as u32],
    };

    let mut buf = Vec::with_capacity(FIELD_LEN + fields.len() * FIELD_LEN);
    buf.extend_from_slice(&(fields.len() as u32).to_be_bytes());
    for field in fields {
        buf.extend_from_slice(&field.to_be_bytes());
    }
    buf
}

/// Decode a single [`UpdateRecord`] from `buf`.
///
/// # Errors
///
/// Returns [`DecodeError`] on truncated framing, an unknown tag, or a tag
/// whose declared arity doesn't match the record kind it names. The main
/// I/O loop logs this and moves on to the next frame; it is never fatal.
pub fn decode(buf: &[u8]) -> Result<UpdateRecord, DecodeError> {
    if buf.len() < FIELD_LEN {
        return Err(DecodeError::TruncatedHeader);
    }

    let mut header = [0u8; FIELD_LEN];
    header.copy_from_slice(&buf[0..FIELD_LEN]);
    let claimed = u32::from_be_bytes(header);

    let body = &buf[FIELD_LEN..];
    let needed = claimed as usize * FIELD_LEN;
    if body.len() < needed {
        return Err(DecodeError::TruncatedBody {
            claimed,
            available: body.len(),
        });
    }

    if claimed == 0 {
        return Err(DecodeError::EmptyArray);
    }

    let fields: Vec<u32> = body[..needed]
        .chunks_exact(FIELD_LEN)
        .map(|chunk| {
            let mut b = [0u8; FIELD_LEN];
            b.copy_from_slice(chunk);
            u32::from_be_bytes(b)
        })
        .collect();

    let mut r = FieldReader { fields: &fields, pos: 0 };
    let tag_raw = r.next();
    let tag = Tag::from_u32(tag_raw).ok_or(DecodeError::UnknownTag(tag_raw))?;

    let expect_arity = |tag: Tag, expected: u32| -> Result<(), DecodeError> {
        if claimed != expected {
            return Err(DecodeError::WrongArity {
                tag: tag_name(tag),
                expected,
                got: claimed,
            });
        }
        Ok(())
    };

    let record = match tag {
        Tag::DisplayUpdate => {
            expect_arity(tag, 5)?;
            UpdateRecord::DisplayUpdate {
                x: r.next_i32(),
                y: r.next_i32(),
                w: r.next_i32(),
                h: r.next_i32(),
            }
        }
        Tag::DisplaySwitch => {
            expect_arity(tag, 4)?;
            UpdateRecord::DisplaySwitch {
                format: r.next(),
                w: r.next_i32(),
                h: r.next_i32(),
            }
        }
        Tag::Mouse => {
            expect_arity(tag, 4)?;
            UpdateRecord::MouseEvent {
                x: r.next_i32(),
                y: r.next_i32(),
                flags: r.next(),
            }
        }
        Tag::Keyboard => {
            expect_arity(tag, 3)?;
            UpdateRecord::KeyboardEvent {
                keycode: r.next(),
                flags: r.next(),
            }
        }
        Tag::UpdateAck => {
            expect_arity(tag, 2)?;
            UpdateRecord::UpdateAck {
                success: r.next() != 0,
            }
        }
        Tag::Shutdown => {
            expect_arity(tag, 1)?;
            UpdateRecord::Shutdown
        }
    };

    Ok(record)
}

fn tag_name(tag: Tag) -> &'static str {
    match tag {
        Tag::DisplayUpdate => "DisplayUpdate",
        Tag::DisplaySwitch => "DisplaySwitch",
        Tag::Mouse => "MouseEvent",
        Tag::Keyboard => "KeyboardEvent",
        Tag::UpdateAck => "UpdateAck",
        Tag::Shutdown => "Shutdown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(record: UpdateRecord) {
        let bytes = encode(&record);
        let decoded = decode(&bytes).expect("decode should succeed");
        assert_eq!(decoded, record);
    }

    #[test]
    fn round_trip_display_update() {
        round_trip(UpdateRecord::DisplayUpdate { x: 10, y: 20, w: 30, h: 40 });
    }

    #[test]
    fn round_trip_display_switch() {
        round_trip(UpdateRecord::DisplaySwitch { format: 7, w: 1920, h: 1080 });
    }

    #[test]
    fn round_trip_keyboard() {
        round_trip(UpdateRecord::KeyboardEvent { keycode: 30, flags: 1 });
    }

    #[test]
    fn round_trip_mouse() {
        round_trip(UpdateRecord::MouseEvent { x: 50, y: 60, flags: 1 });
    }

    #[test]
    fn round_trip_ack() {
        round_trip(UpdateRecord::UpdateAck { success: true });
        round_trip(UpdateRecord::UpdateAck { success: false });
    }

    #[test]
    fn round_trip_shutdown() {
        round_trip(UpdateRecord::Shutdown);
    }

    #[test]
    fn negative_coordinates_survive() {
        round_trip(UpdateRecord::DisplayUpdate { x: -5, y: -5, w: 10, h: 10 });
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert_eq!(decode(&[0, 0]), Err(DecodeError::TruncatedHeader));
    }

    #[test]
    fn truncated_body_is_rejected() {
        // Claims 5 elements but only supplies the tag.
        let mut buf = 5u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&(Tag::DisplayUpdate as u32).to_be_bytes());
        assert!(matches!(decode(&buf), Err(DecodeError::TruncatedBody { .. })));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = 1u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&99u32.to_be_bytes());
        assert_eq!(decode(&buf), Err(DecodeError::UnknownTag(99)));
    }

    #[test]
    fn wrong_arity_is_rejected() {
        // Shutdown tag but claims 3 elements.
        let mut buf = 3u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&(Tag::Shutdown as u32).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        assert!(matches!(decode(&buf), Err(DecodeError::WrongArity { .. })));
    }
}
