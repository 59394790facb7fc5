//! Wire framing helpers.
//!
//! Logical, transport-agnostic conventions:
//! - request frames carry a control tag (`PUBSUB`, `READY`); replies carry
//!   `ACK`,
//! - back-end subscription control is a leading `0x01` (subscribe) or `0x00`
//!   (unsubscribe) byte followed by the channel name.

use bytes::{BufMut, Bytes, BytesMut};

use super::TransportError;

/// Subscribe control byte.
pub const SUBSCRIBE_BYTE: u8 = 0x01;
/// Unsubscribe control byte.
pub const UNSUBSCRIBE_BYTE: u8 = 0x00;

/// Control tag carried in request/reply frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlTag {
    /// Ordinary publish/subscribe traffic.
    Pubsub,
    /// Client readiness probe.
    Ready,
    /// Broker acknowledgement.
    Ack,
}

impl ControlTag {
    /// Wire bytes for this tag.
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Pubsub => b"PUBSUB",
            Self::Ready => b"READY",
            Self::Ack => b"ACK",
        }
    }

    /// Parse a tag from wire bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, TransportError> {
        match raw {
            b"PUBSUB" => Ok(Self::Pubsub),
            b"READY" => Ok(Self::Ready),
            b"ACK" => Ok(Self::Ack),
            other => Err(TransportError::Frame(format!(
                "unknown control tag {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// A decoded back-end frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendFrame {
    /// A consumer subscribed to a channel.
    Subscribe(String),
    /// A consumer dropped a channel.
    Unsubscribe(String),
    /// A packed event frame (reply or control announcement).
    Frame(Bytes),
}

/// Encode a subscribe control frame for a channel.
pub fn encode_subscribe(channel: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + channel.len());
    buf.put_u8(SUBSCRIBE_BYTE);
    buf.put_slice(channel.as_bytes());
    buf.freeze()
}

/// Encode an unsubscribe control frame for a channel.
pub fn encode_unsubscribe(channel: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + channel.len());
    buf.put_u8(UNSUBSCRIBE_BYTE);
    buf.put_slice(channel.as_bytes());
    buf.freeze()
}

/// Decode a raw back-end frame.
///
/// A leading control byte produces `Subscribe`/`Unsubscribe`; anything else
/// is treated as a packed event frame.
pub fn decode_backend(raw: Bytes) -> Result<BackendFrame, TransportError> {
    match raw.first() {
        Some(&SUBSCRIBE_BYTE) => {
            let name = channel_name(&raw[1..])?;
            Ok(BackendFrame::Subscribe(name))
        }
        Some(&UNSUBSCRIBE_BYTE) => {
            let name = channel_name(&raw[1..])?;
            Ok(BackendFrame::Unsubscribe(name))
        }
        Some(_) => Ok(BackendFrame::Frame(raw)),
        None => Err(TransportError::Frame("empty frame".to_string())),
    }
}

fn channel_name(raw: &[u8]) -> Result<String, TransportError> {
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| TransportError::Frame("channel name is not utf-8".to_string()))
}

/// Encode a published event as a multipart frame:
/// `[channel_bytes, control_tag_bytes, packed_event_bytes]`,
/// each part length-prefixed.
pub fn encode_published(channel: &str, payload: &[u8]) -> Bytes {
    let tag = ControlTag::Pubsub.as_bytes();
    let mut buf =
        BytesMut::with_capacity(12 + channel.len() + tag.len() + payload.len());
    for part in [channel.as_bytes(), tag, payload] {
        buf.put_u32(part.len() as u32);
        buf.put_slice(part);
    }
    buf.freeze()
}

/// Decode a published multipart frame back into `(channel, tag, payload)`.
pub fn decode_published(raw: &[u8]) -> Result<(String, ControlTag, Bytes), TransportError> {
    let mut parts = Vec::with_capacity(3);
    let mut rest = raw;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(TransportError::Frame("truncated part header".to_string()));
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if rest.len() < len {
            return Err(TransportError::Frame("truncated part body".to_string()));
        }
        parts.push(&rest[..len]);
        rest = &rest[len..];
    }
    let [channel, tag, payload]: [&[u8]; 3] = parts
        .try_into()
        .map_err(|_| TransportError::Frame("expected three parts".to_string()))?;

    Ok((
        channel_name(channel)?,
        ControlTag::parse(tag)?,
        Bytes::copy_from_slice(payload),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_tag_round_trip() {
        for tag in [ControlTag::Pubsub, ControlTag::Ready, ControlTag::Ack] {
            assert_eq!(ControlTag::parse(tag.as_bytes()).unwrap(), tag);
        }
    }

    #[test]
    fn test_control_tag_rejects_unknown() {
        assert!(ControlTag::parse(b"NOPE").is_err());
    }

    #[test]
    fn test_subscribe_frame_round_trip() {
        let frame = decode_backend(encode_subscribe("orders")).unwrap();
        assert_eq!(frame, BackendFrame::Subscribe("orders".to_string()));

        let frame = decode_backend(encode_unsubscribe("orders")).unwrap();
        assert_eq!(frame, BackendFrame::Unsubscribe("orders".to_string()));
    }

    #[test]
    fn test_event_bytes_pass_through() {
        let payload = Bytes::from_static(b"{\"type\":\"ping\"}");
        let frame = decode_backend(payload.clone()).unwrap();
        assert_eq!(frame, BackendFrame::Frame(payload));
    }

    #[test]
    fn test_empty_frame_rejected() {
        assert!(decode_backend(Bytes::new()).is_err());
    }

    #[test]
    fn test_published_frame_round_trip() {
        let payload = b"{\"type\":\"order.created\"}";
        let framed = encode_published("orders", payload);

        let (channel, tag, decoded) = decode_published(&framed).unwrap();
        assert_eq!(channel, "orders");
        assert_eq!(tag, ControlTag::Pubsub);
        assert_eq!(decoded.as_ref(), payload);
    }

    #[test]
    fn test_published_frame_rejects_truncation() {
        let framed = encode_published("orders", b"payload");
        assert!(decode_published(&framed[..framed.len() - 3]).is_err());
        assert!(decode_published(&framed[..2]).is_err());
    }
}
