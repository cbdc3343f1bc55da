//! Wire framing for UPC messages.
//!
//! ## Wire format
//!
//! Fixed header, host byte order (peers are assumed same-architecture):
//!
//! | Field    | Layout                          |
//! |----------|---------------------------------|
//! | `type`   | `i32`                           |
//! | `length` | `u32`                           |
//! | payload  | `length` raw bytes              |
//!
//! Wire types below [`USER_DATA_BASE`] are protocol control codes; the only
//! one today is `Accepted` (1, zero-length). User message kinds are offset
//! by `USER_DATA_BASE` on the wire and de-offset on receipt.
//!
//! Header and payload reads are blocking exact-count reads retrying on
//! `EINTR`; the length bound is enforced *before* a payload read is
//! attempted, so a hostile header cannot force an allocation.

use std::io;

use rustix::net::SendFlags;
use serde::{de::DeserializeOwned, Serialize};

use crate::reactor::Source;
use crate::transport::TransportError;

/// First wire type reserved for user messages.
pub const USER_DATA_BASE: i32 = 100;

/// Control code: the service accepted the connection.
pub(crate) const CONTROL_ACCEPTED: i32 = 1;

/// Largest payload the transport will send or accept.
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

pub(crate) const HEADER_LEN: usize = 8;

/// A user message: kind plus an opaque payload.
///
/// The transport never inspects the payload beyond its length; the typed
/// helpers are a postcard convenience layer over the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// User message kind (de-offset; what the sender passed to `send_*`).
    pub kind: i32,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    /// Wraps raw payload bytes.
    #[must_use]
    pub fn new(kind: i32, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Serializes `value` into a message payload.
    ///
    /// # Errors
    ///
    /// Codec failure, or a payload over [`MAX_PAYLOAD`].
    pub fn encode<T: Serialize>(kind: i32, value: &T) -> Result<Self, TransportError> {
        let payload = postcard::to_allocvec(value)?;
        if payload.len() > MAX_PAYLOAD {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(Self { kind, payload })
    }

    /// Deserializes the payload.
    ///
    /// # Errors
    ///
    /// Codec failure when the payload does not describe a `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        Ok(postcard::from_bytes(&self.payload)?)
    }
}

/// One decoded frame off the wire.
pub(crate) enum Frame {
    /// A reserved-range control frame (payload already drained).
    Control(i32),
    /// A user message, kind de-offset.
    User(Message),
}

pub(crate) fn encode_header(wire_type: i32, length: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&wire_type.to_ne_bytes());
    header[4..].copy_from_slice(&length.to_ne_bytes());
    header
}

pub(crate) fn decode_header(header: &[u8; HEADER_LEN]) -> (i32, u32) {
    let wire_type = i32::from_ne_bytes(header[..4].try_into().expect("header is 8 bytes"));
    let length = u32::from_ne_bytes(header[4..].try_into().expect("header is 8 bytes"));
    (wire_type, length)
}

/// Reads one complete frame, blocking until it is fully available.
pub(crate) fn read_frame(src: &Source) -> Result<Frame, TransportError> {
    let mut header = [0u8; HEADER_LEN];
    read_exact(src, &mut header)?;
    let (wire_type, length) = decode_header(&header);
    let length = length as usize;
    if length > MAX_PAYLOAD {
        return Err(TransportError::PayloadTooLarge {
            len: length,
            max: MAX_PAYLOAD,
        });
    }
    let mut payload = vec![0u8; length];
    read_exact(src, &mut payload)?;
    if wire_type < USER_DATA_BASE {
        Ok(Frame::Control(wire_type))
    } else {
        Ok(Frame::User(Message {
            kind: wire_type - USER_DATA_BASE,
            payload,
        }))
    }
}

/// Writes a user frame (kind offset onto the wire).
pub(crate) fn write_user(src: &Source, kind: i32, payload: &[u8]) -> Result<(), TransportError> {
    debug_assert!(kind >= 0, "user message kinds are non-negative");
    if payload.len() > MAX_PAYLOAD {
        return Err(TransportError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&encode_header(
        kind + USER_DATA_BASE,
        payload.len() as u32,
    ));
    buf.extend_from_slice(payload);
    write_all(src, &buf)
}

/// Writes a zero-length control frame.
pub(crate) fn write_control(src: &Source, code: i32) -> Result<(), TransportError> {
    debug_assert!(code < USER_DATA_BASE);
    write_all(src, &encode_header(code, 0))
}

/// Exact-count blocking read; zero bytes means the peer closed.
fn read_exact(src: &Source, mut buf: &mut [u8]) -> Result<(), TransportError> {
    while !buf.is_empty() {
        match src.read(buf) {
            Ok(0) => return Err(TransportError::ClosedByPeer),
            Ok(n) => buf = &mut buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Exact-count blocking send with `MSG_NOSIGNAL`.
fn write_all(src: &Source, mut buf: &[u8]) -> Result<(), TransportError> {
    while !buf.is_empty() {
        match src.send(buf, SendFlags::NOSIGNAL) {
            Ok(0) => return Err(TransportError::ClosedByPeer),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::net::{AddressFamily, SocketFlags, SocketType};
    use serde::Deserialize;

    fn stream_pair() -> (Source, Source) {
        let (a, b) = rustix::net::socketpair(
            AddressFamily::UNIX,
            SocketType::STREAM,
            SocketFlags::empty(),
            None,
        )
        .unwrap();
        let a = Source::from_fd(a);
        let b = Source::from_fd(b);
        a.set_close_on_destruct(true);
        b.set_close_on_destruct(true);
        (a, b)
    }

    #[test]
    fn header_roundtrip() {
        let header = encode_header(142, 9000);
        assert_eq!(decode_header(&header), (142, 9000));
        let header = encode_header(CONTROL_ACCEPTED, 0);
        assert_eq!(decode_header(&header), (1, 0));
    }

    #[test]
    fn user_frame_roundtrip() {
        let (a, b) = stream_pair();
        write_user(&a, 7, b"ping").unwrap();
        match read_frame(&b).unwrap() {
            Frame::User(msg) => {
                assert_eq!(msg.kind, 7);
                assert_eq!(msg.payload, b"ping");
            }
            Frame::Control(code) => panic!("unexpected control frame {code}"),
        }
    }

    #[test]
    fn empty_payload_roundtrip() {
        let (a, b) = stream_pair();
        write_user(&a, 0, b"").unwrap();
        match read_frame(&b).unwrap() {
            Frame::User(msg) => {
                assert_eq!(msg.kind, 0);
                assert!(msg.payload.is_empty());
            }
            Frame::Control(code) => panic!("unexpected control frame {code}"),
        }
    }

    #[test]
    fn control_frame_roundtrip() {
        let (a, b) = stream_pair();
        write_control(&a, CONTROL_ACCEPTED).unwrap();
        match read_frame(&b).unwrap() {
            Frame::Control(code) => assert_eq!(code, CONTROL_ACCEPTED),
            Frame::User(msg) => panic!("unexpected user frame kind {}", msg.kind),
        }
    }

    #[test]
    fn oversized_header_rejected_without_payload_read() {
        let (a, b) = stream_pair();
        // Hand-craft a header advertising more than the bound; no payload
        // follows, so a read attempt would block forever.
        let header = encode_header(USER_DATA_BASE + 1, (MAX_PAYLOAD + 1) as u32);
        let mut sent = &header[..];
        while !sent.is_empty() {
            let n = a.write(sent).unwrap();
            sent = &sent[n..];
        }
        match read_frame(&b) {
            Err(TransportError::PayloadTooLarge { len, max }) => {
                assert_eq!(len, MAX_PAYLOAD + 1);
                assert_eq!(max, MAX_PAYLOAD);
            }
            Err(other) => panic!("expected PayloadTooLarge, got {other}"),
            Ok(_) => panic!("expected PayloadTooLarge, got a frame"),
        }
    }

    #[test]
    fn closed_peer_detected() {
        let (a, b) = stream_pair();
        drop(a);
        assert!(matches!(
            read_frame(&b),
            Err(TransportError::ClosedByPeer)
        ));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        greeting: String,
        count: u32,
    }

    #[test]
    fn typed_payload_roundtrip() {
        let value = Sample {
            greeting: "hello".into(),
            count: 3,
        };
        let msg = Message::encode(4, &value).unwrap();
        assert_eq!(msg.kind, 4);
        assert_eq!(msg.decode::<Sample>().unwrap(), value);
    }
}
