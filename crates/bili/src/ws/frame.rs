//! Binary framing of the chat channel.
//!
//! Every packet starts with a 16-byte big-endian header:
//! `packet_length:u32 | header_length:u16 | version:u16 | operation:u32 |
//! sequence:u32`. Bodies of MESSAGE packets may be zlib- or
//! brotli-compressed; the decompressed payload is a concatenation of inner
//! packets with the same header layout, each carrying one UTF-8 JSON
//! document.

use std::io::Read;

use byteorder::{BigEndian, ByteOrder};

use crate::errors::WsError;

pub const HEADER_LENGTH: usize = 16;

/// Operations used by the protocol.
pub mod op {
    pub const HEARTBEAT: u32 = 2;
    pub const HEARTBEAT_REPLY: u32 = 3;
    pub const MESSAGE: u32 = 5;
    pub const AUTH: u32 = 7;
    pub const AUTH_REPLY: u32 = 8;
}

/// Body compression variants.
pub mod ver {
    pub const RAW_JSON: u16 = 0;
    /// Heartbeat replies carry a bare u32, flagged with this version.
    pub const POPULARITY: u16 = 1;
    pub const ZLIB: u16 = 2;
    pub const BROTLI: u16 = 3;
}

/// Auth reply code meaning the token expired.
pub const AUTH_TOKEN_ERROR: i64 = -101;

/// A decoded packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// AUTH_REPLY: one JSON string with `{"code": …}`.
    AuthReply(String),
    /// HEARTBEAT_REPLY: the room's online count.
    HeartbeatReply(u32),
    /// MESSAGE: one JSON string per inner packet.
    Messages(Vec<String>),
}

/// Encode a packet with the given operation and string body.
pub fn encode(operation: u32, body: &str) -> Vec<u8> {
    let body = body.as_bytes();
    let packet_length = HEADER_LENGTH + body.len();
    let mut packet = Vec::with_capacity(packet_length);

    packet.extend_from_slice(&(packet_length as u32).to_be_bytes());
    packet.extend_from_slice(&(HEADER_LENGTH as u16).to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // header version
    packet.extend_from_slice(&operation.to_be_bytes());
    packet.extend_from_slice(&1u32.to_be_bytes()); // sequence
    packet.extend_from_slice(body);

    packet
}

struct Header {
    packet_length: usize,
    header_length: usize,
    version: u16,
    operation: u32,
}

fn read_header(data: &[u8], offset: usize) -> Result<Header, WsError> {
    if data.len() < offset + HEADER_LENGTH {
        return Err(WsError::Decode(format!(
            "packet too short: {} bytes at offset {offset}",
            data.len()
        )));
    }
    Ok(Header {
        packet_length: BigEndian::read_u32(&data[offset..offset + 4]) as usize,
        header_length: BigEndian::read_u16(&data[offset + 4..offset + 6]) as usize,
        version: BigEndian::read_u16(&data[offset + 6..offset + 8]),
        operation: BigEndian::read_u32(&data[offset + 8..offset + 12]),
    })
}

/// Decode one outer packet.
pub fn decode(data: &[u8]) -> Result<Frame, WsError> {
    let header = read_header(data, 0)?;
    if data.len() < header.packet_length {
        return Err(WsError::Decode(format!(
            "truncated packet: header says {} bytes, got {}",
            header.packet_length,
            data.len()
        )));
    }
    let body = &data[header.header_length..header.packet_length];

    match header.operation {
        op::MESSAGE => {
            let inflated;
            let payload: &[u8] = match header.version {
                ver::BROTLI => {
                    let mut out = Vec::new();
                    brotli::BrotliDecompress(&mut std::io::Cursor::new(body), &mut out)
                        .map_err(|e| WsError::Decode(format!("brotli: {e}")))?;
                    inflated = out;
                    &inflated
                }
                ver::ZLIB => {
                    let mut out = Vec::new();
                    flate2::read::ZlibDecoder::new(body)
                        .read_to_end(&mut out)
                        .map_err(|e| WsError::Decode(format!("zlib: {e}")))?;
                    inflated = out;
                    &inflated
                }
                ver::RAW_JSON | ver::POPULARITY => body,
                other => {
                    return Err(WsError::Decode(format!(
                        "unsupported body version: {other}"
                    )));
                }
            };

            // The payload is a chain of inner packets.
            let mut messages = Vec::new();
            let mut offset = 0;
            while offset < payload.len() {
                let inner = read_header(payload, offset)?;
                let start = offset + inner.header_length;
                let end = offset + inner.packet_length;
                if inner.packet_length < inner.header_length || end > payload.len() {
                    return Err(WsError::Decode("inner packet overruns body".to_string()));
                }
                let msg = std::str::from_utf8(&payload[start..end])
                    .map_err(|e| WsError::Decode(format!("utf8: {e}")))?;
                messages.push(msg.to_string());
                offset = end;
            }

            Ok(Frame::Messages(messages))
        }
        op::HEARTBEAT_REPLY => {
            if body.len() < 4 {
                return Err(WsError::Decode("heartbeat reply body too short".to_string()));
            }
            Ok(Frame::HeartbeatReply(BigEndian::read_u32(&body[0..4])))
        }
        op::AUTH_REPLY => {
            let msg = std::str::from_utf8(body)
                .map_err(|e| WsError::Decode(format!("utf8: {e}")))?;
            Ok(Frame::AuthReply(msg.to_string()))
        }
        other => Err(WsError::UnexpectedFrame(format!("operation {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_message_frame_round_trip() {
        let encoded = encode(op::MESSAGE, r#"{"cmd":"LIVE"}"#);

        assert_eq!(BigEndian::read_u32(&encoded[0..4]) as usize, encoded.len());
        assert_eq!(BigEndian::read_u16(&encoded[4..6]), 16);
        assert_eq!(BigEndian::read_u32(&encoded[8..12]), op::MESSAGE);

        let frame = decode(&encoded).unwrap();
        assert_eq!(
            frame,
            Frame::Messages(vec![r#"{"cmd":"LIVE"}"#.to_string()])
        );
    }

    #[test]
    fn test_brotli_message_decode() {
        // Two concatenated inner frames, compressed together.
        let inner = [
            encode(op::MESSAGE, r#"{"cmd":"DANMU_MSG"}"#),
            encode(op::MESSAGE, r#"{"cmd":"DANMU_MSG"}"#),
        ]
        .concat();

        let mut compressed = Vec::new();
        {
            let mut writer =
                brotli::CompressorWriter::new(&mut compressed, 4096, 5, 22);
            writer.write_all(&inner).unwrap();
        }

        let mut outer = Vec::new();
        let packet_length = HEADER_LENGTH + compressed.len();
        outer.extend_from_slice(&(packet_length as u32).to_be_bytes());
        outer.extend_from_slice(&16u16.to_be_bytes());
        outer.extend_from_slice(&ver::BROTLI.to_be_bytes());
        outer.extend_from_slice(&op::MESSAGE.to_be_bytes());
        outer.extend_from_slice(&1u32.to_be_bytes());
        outer.extend_from_slice(&compressed);

        let frame = decode(&outer).unwrap();
        assert_eq!(
            frame,
            Frame::Messages(vec![
                r#"{"cmd":"DANMU_MSG"}"#.to_string(),
                r#"{"cmd":"DANMU_MSG"}"#.to_string(),
            ])
        );
    }

    #[test]
    fn test_zlib_message_decode() {
        let inner = encode(op::MESSAGE, r#"{"cmd":"PREPARING"}"#);

        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&inner).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut outer = Vec::new();
        let packet_length = HEADER_LENGTH + compressed.len();
        outer.extend_from_slice(&(packet_length as u32).to_be_bytes());
        outer.extend_from_slice(&16u16.to_be_bytes());
        outer.extend_from_slice(&ver::ZLIB.to_be_bytes());
        outer.extend_from_slice(&op::MESSAGE.to_be_bytes());
        outer.extend_from_slice(&1u32.to_be_bytes());
        outer.extend_from_slice(&compressed);

        let frame = decode(&outer).unwrap();
        assert_eq!(
            frame,
            Frame::Messages(vec![r#"{"cmd":"PREPARING"}"#.to_string()])
        );
    }

    #[test]
    fn test_heartbeat_reply_decodes_online_count() {
        let mut packet = Vec::new();
        packet.extend_from_slice(&20u32.to_be_bytes());
        packet.extend_from_slice(&16u16.to_be_bytes());
        packet.extend_from_slice(&ver::POPULARITY.to_be_bytes());
        packet.extend_from_slice(&op::HEARTBEAT_REPLY.to_be_bytes());
        packet.extend_from_slice(&1u32.to_be_bytes());
        packet.extend_from_slice(&123456u32.to_be_bytes());

        assert_eq!(decode(&packet).unwrap(), Frame::HeartbeatReply(123456));
    }

    #[test]
    fn test_auth_reply_body_passes_through() {
        let encoded = encode(op::AUTH_REPLY, r#"{"code":0}"#);
        assert_eq!(
            decode(&encoded).unwrap(),
            Frame::AuthReply(r#"{"code":0}"#.to_string())
        );
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let encoded = encode(op::MESSAGE, r#"{"cmd":"LIVE"}"#);
        assert!(matches!(
            decode(&encoded[..10]),
            Err(WsError::Decode(_))
        ));
        assert!(matches!(
            decode(&encoded[..encoded.len() - 1]),
            Err(WsError::Decode(_))
        ));
    }
}
