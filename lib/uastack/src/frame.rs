//! Binary encoding of the secure-conversation wire headers and the
//! connection-protocol message bodies (HEL/ACK/ERR).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;
use uabase::status::StatusCode;
use uabase::types::{ByteString, UaString};

/// Fixed message header: 3 ASCII type bytes + 1 chunk byte + u32 size.
pub const MESSAGE_HEADER_LENGTH: usize = 8;
/// Message header plus the secure channel id.
pub const SECURE_CONVERSATION_HEADER_LENGTH: usize = 12;
pub const SYMMETRIC_SECURITY_HEADER_LENGTH: usize = 4;
pub const SEQUENCE_HEADER_LENGTH: usize = 8;
/// Complete prefix of a symmetric MSG/CLO chunk.
pub const SYMMETRIC_CHUNK_PREFIX_LENGTH: usize = SECURE_CONVERSATION_HEADER_LENGTH
    + SYMMETRIC_SECURITY_HEADER_LENGTH
    + SEQUENCE_HEADER_LENGTH;
/// AsymmetricSecurityHeader length before the three variable fields.
pub const ASYMMETRIC_SECURITY_HEADER_FIXED_LENGTH: usize = 12;
/// Smallest chunk the protocol permits on the wire.
pub const MIN_CHUNK_SIZE: usize = 16;

const MESSAGE_TYPE_MASK: u32 = 0x00FF_FFFF;
const CHUNK_TYPE_MASK: u32 = 0xFF00_0000;

fn enc(_err: std::io::Error) -> StatusCode {
    StatusCode::BAD_ENCODING_ERROR
}

fn dec(_err: std::io::Error) -> StatusCode {
    StatusCode::BAD_DECODING_ERROR
}

/// The three ASCII bytes at the start of every chunk.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageType {
    Hel,
    Ack,
    Err,
    Opn,
    Msg,
    Clo,
}

impl MessageType {
    pub fn as_u32(self) -> u32 {
        match self {
            MessageType::Hel => 0x004C_4548, // "HEL"
            MessageType::Ack => 0x004B_4341, // "ACK"
            MessageType::Err => 0x0052_5245, // "ERR"
            MessageType::Opn => 0x004E_504F, // "OPN"
            MessageType::Msg => 0x0047_534D, // "MSG"
            MessageType::Clo => 0x004F_4C43, // "CLO"
        }
    }

    pub fn from_u32(raw: u32) -> Option<MessageType> {
        match raw & MESSAGE_TYPE_MASK {
            0x004C_4548 => Some(MessageType::Hel),
            0x004B_4341 => Some(MessageType::Ack),
            0x0052_5245 => Some(MessageType::Err),
            0x004E_504F => Some(MessageType::Opn),
            0x0047_534D => Some(MessageType::Msg),
            0x004F_4C43 => Some(MessageType::Clo),
            _ => None,
        }
    }
}

/// Fourth ASCII byte of the chunk header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChunkType {
    Intermediate,
    Final,
    Abort,
}

impl ChunkType {
    pub fn as_u32(self) -> u32 {
        match self {
            ChunkType::Intermediate => 0x4300_0000, // 'C'
            ChunkType::Final => 0x4600_0000,        // 'F'
            ChunkType::Abort => 0x4100_0000,        // 'A'
        }
    }

    pub fn from_u32(raw: u32) -> Option<ChunkType> {
        match raw & CHUNK_TYPE_MASK {
            0x4300_0000 => Some(ChunkType::Intermediate),
            0x4600_0000 => Some(ChunkType::Final),
            0x4100_0000 => Some(ChunkType::Abort),
            _ => None,
        }
    }
}

/// The 8-byte header every chunk starts with.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TcpMessageHeader {
    pub message_type: MessageType,
    pub chunk_type: ChunkType,
    pub message_size: u32,
}

impl TcpMessageHeader {
    pub fn encode<W: Write>(&self, stream: &mut W) -> Result<(), StatusCode> {
        stream
            .write_u32::<LittleEndian>(self.message_type.as_u32() + self.chunk_type.as_u32())
            .map_err(enc)?;
        stream.write_u32::<LittleEndian>(self.message_size).map_err(enc)
    }

    pub fn decode(stream: &mut &[u8]) -> Result<TcpMessageHeader, StatusCode> {
        let combined = stream.read_u32::<LittleEndian>().map_err(dec)?;
        let message_size = stream.read_u32::<LittleEndian>().map_err(dec)?;
        let message_type = MessageType::from_u32(combined)
            .ok_or(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID)?;
        let chunk_type =
            ChunkType::from_u32(combined).ok_or(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID)?;
        Ok(TcpMessageHeader {
            message_type,
            chunk_type,
            message_size,
        })
    }
}

/// Chunk header plus the channel id: the start of every OPN/MSG/CLO chunk.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SecureConversationHeader {
    pub header: TcpMessageHeader,
    pub secure_channel_id: u32,
}

impl SecureConversationHeader {
    pub fn encode<W: Write>(&self, stream: &mut W) -> Result<(), StatusCode> {
        self.header.encode(stream)?;
        stream
            .write_u32::<LittleEndian>(self.secure_channel_id)
            .map_err(enc)
    }

    pub fn decode(stream: &mut &[u8]) -> Result<SecureConversationHeader, StatusCode> {
        Ok(SecureConversationHeader {
            header: TcpMessageHeader::decode(stream)?,
            secure_channel_id: stream.read_u32::<LittleEndian>().map_err(dec)?,
        })
    }
}

/// Security header of OPN chunks.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct AsymmetricSecurityHeader {
    pub security_policy_uri: ByteString,
    pub sender_certificate: ByteString,
    pub receiver_certificate_thumbprint: ByteString,
}

impl AsymmetricSecurityHeader {
    pub fn encode<W: Write>(&self, stream: &mut W) -> Result<(), StatusCode> {
        self.security_policy_uri.encode(stream)?;
        self.sender_certificate.encode(stream)?;
        self.receiver_certificate_thumbprint.encode(stream)
    }

    pub fn decode(stream: &mut &[u8]) -> Result<AsymmetricSecurityHeader, StatusCode> {
        Ok(AsymmetricSecurityHeader {
            security_policy_uri: ByteString::decode(stream)?,
            sender_certificate: ByteString::decode(stream)?,
            receiver_certificate_thumbprint: ByteString::decode(stream)?,
        })
    }

    pub fn encoded_len(&self) -> usize {
        self.security_policy_uri.encoded_len()
            + self.sender_certificate.encoded_len()
            + self.receiver_certificate_thumbprint.encoded_len()
    }
}

/// Security header of MSG/CLO chunks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SymmetricSecurityHeader {
    pub token_id: u32,
}

impl SymmetricSecurityHeader {
    pub fn encode<W: Write>(&self, stream: &mut W) -> Result<(), StatusCode> {
        stream.write_u32::<LittleEndian>(self.token_id).map_err(enc)
    }

    pub fn decode(stream: &mut &[u8]) -> Result<SymmetricSecurityHeader, StatusCode> {
        Ok(SymmetricSecurityHeader {
            token_id: stream.read_u32::<LittleEndian>().map_err(dec)?,
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SequenceHeader {
    pub sequence_number: u32,
    pub request_id: u32,
}

impl SequenceHeader {
    pub fn encode<W: Write>(&self, stream: &mut W) -> Result<(), StatusCode> {
        stream
            .write_u32::<LittleEndian>(self.sequence_number)
            .map_err(enc)?;
        stream.write_u32::<LittleEndian>(self.request_id).map_err(enc)
    }

    pub fn decode(stream: &mut &[u8]) -> Result<SequenceHeader, StatusCode> {
        Ok(SequenceHeader {
            sequence_number: stream.read_u32::<LittleEndian>().map_err(dec)?,
            request_id: stream.read_u32::<LittleEndian>().map_err(dec)?,
        })
    }
}

/// HEL body. The ACK reuses the first five fields.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HelloMessage {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
    pub endpoint_url: UaString,
}

impl HelloMessage {
    pub fn encode<W: Write>(&self, stream: &mut W) -> Result<(), StatusCode> {
        stream
            .write_u32::<LittleEndian>(self.protocol_version)
            .map_err(enc)?;
        stream
            .write_u32::<LittleEndian>(self.receive_buffer_size)
            .map_err(enc)?;
        stream
            .write_u32::<LittleEndian>(self.send_buffer_size)
            .map_err(enc)?;
        stream
            .write_u32::<LittleEndian>(self.max_message_size)
            .map_err(enc)?;
        stream
            .write_u32::<LittleEndian>(self.max_chunk_count)
            .map_err(enc)?;
        self.endpoint_url.encode(stream)
    }

    pub fn decode(stream: &mut &[u8]) -> Result<HelloMessage, StatusCode> {
        Ok(HelloMessage {
            protocol_version: stream.read_u32::<LittleEndian>().map_err(dec)?,
            receive_buffer_size: stream.read_u32::<LittleEndian>().map_err(dec)?,
            send_buffer_size: stream.read_u32::<LittleEndian>().map_err(dec)?,
            max_message_size: stream.read_u32::<LittleEndian>().map_err(dec)?,
            max_chunk_count: stream.read_u32::<LittleEndian>().map_err(dec)?,
            endpoint_url: UaString::decode(stream)?,
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AcknowledgeMessage {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
}

impl AcknowledgeMessage {
    pub fn encode<W: Write>(&self, stream: &mut W) -> Result<(), StatusCode> {
        stream
            .write_u32::<LittleEndian>(self.protocol_version)
            .map_err(enc)?;
        stream
            .write_u32::<LittleEndian>(self.receive_buffer_size)
            .map_err(enc)?;
        stream
            .write_u32::<LittleEndian>(self.send_buffer_size)
            .map_err(enc)?;
        stream
            .write_u32::<LittleEndian>(self.max_message_size)
            .map_err(enc)?;
        stream
            .write_u32::<LittleEndian>(self.max_chunk_count)
            .map_err(enc)
    }

    pub fn decode(stream: &mut &[u8]) -> Result<AcknowledgeMessage, StatusCode> {
        Ok(AcknowledgeMessage {
            protocol_version: stream.read_u32::<LittleEndian>().map_err(dec)?,
            receive_buffer_size: stream.read_u32::<LittleEndian>().map_err(dec)?,
            send_buffer_size: stream.read_u32::<LittleEndian>().map_err(dec)?,
            max_message_size: stream.read_u32::<LittleEndian>().map_err(dec)?,
            max_chunk_count: stream.read_u32::<LittleEndian>().map_err(dec)?,
        })
    }
}

/// ERR body. The status code is sanitized before this ever leaves the
/// process, see `StatusCode::sanitized`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorMessage {
    pub error: StatusCode,
    pub reason: UaString,
}

impl ErrorMessage {
    pub fn encode<W: Write>(&self, stream: &mut W) -> Result<(), StatusCode> {
        stream.write_u32::<LittleEndian>(self.error.0).map_err(enc)?;
        self.reason.encode(stream)
    }

    pub fn decode(stream: &mut &[u8]) -> Result<ErrorMessage, StatusCode> {
        Ok(ErrorMessage {
            error: StatusCode(stream.read_u32::<LittleEndian>().map_err(dec)?),
            reason: UaString::decode(stream)?,
        })
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.reason.encoded_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_tags_are_ascii() {
        assert_eq!(&MessageType::Hel.as_u32().to_le_bytes()[..3], b"HEL");
        assert_eq!(&MessageType::Ack.as_u32().to_le_bytes()[..3], b"ACK");
        assert_eq!(&MessageType::Err.as_u32().to_le_bytes()[..3], b"ERR");
        assert_eq!(&MessageType::Opn.as_u32().to_le_bytes()[..3], b"OPN");
        assert_eq!(&MessageType::Msg.as_u32().to_le_bytes()[..3], b"MSG");
        assert_eq!(&MessageType::Clo.as_u32().to_le_bytes()[..3], b"CLO");
    }

    #[test]
    fn test_chunk_type_tags_are_ascii() {
        assert_eq!(ChunkType::Final.as_u32().to_le_bytes()[3], b'F');
        assert_eq!(ChunkType::Intermediate.as_u32().to_le_bytes()[3], b'C');
        assert_eq!(ChunkType::Abort.as_u32().to_le_bytes()[3], b'A');
    }

    #[test]
    fn test_message_header_roundtrip() {
        let header = TcpMessageHeader {
            message_type: MessageType::Msg,
            chunk_type: ChunkType::Final,
            message_size: 56,
        };
        let mut buffer = Vec::new();
        header.encode(&mut buffer).unwrap();
        assert_eq!(buffer.len(), MESSAGE_HEADER_LENGTH);
        assert_eq!(&buffer[..4], b"MSGF");

        let mut stream = &buffer[..];
        assert_eq!(TcpMessageHeader::decode(&mut stream).unwrap(), header);
    }

    #[test]
    fn test_message_header_rejects_unknown_type() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(b"XXXF");
        buffer.extend_from_slice(&16u32.to_le_bytes());
        let mut stream = &buffer[..];
        assert_eq!(
            TcpMessageHeader::decode(&mut stream).unwrap_err(),
            StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID
        );
    }

    #[test]
    fn test_message_header_rejects_unknown_chunk_type() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(b"MSGX");
        buffer.extend_from_slice(&16u32.to_le_bytes());
        let mut stream = &buffer[..];
        assert_eq!(
            TcpMessageHeader::decode(&mut stream).unwrap_err(),
            StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID
        );
    }

    #[test]
    fn test_secure_conversation_header_roundtrip() {
        let header = SecureConversationHeader {
            header: TcpMessageHeader {
                message_type: MessageType::Opn,
                chunk_type: ChunkType::Final,
                message_size: 120,
            },
            secure_channel_id: 77,
        };
        let mut buffer = Vec::new();
        header.encode(&mut buffer).unwrap();
        assert_eq!(buffer.len(), SECURE_CONVERSATION_HEADER_LENGTH);

        let mut stream = &buffer[..];
        assert_eq!(SecureConversationHeader::decode(&mut stream).unwrap(), header);
    }

    #[test]
    fn test_asymmetric_header_roundtrip() {
        let header = AsymmetricSecurityHeader {
            security_policy_uri: ByteString::from(&b"http://policy"[..]),
            sender_certificate: ByteString::from(&[1u8, 2, 3][..]),
            receiver_certificate_thumbprint: ByteString::from(&[9u8; 20][..]),
        };
        let mut buffer = Vec::new();
        header.encode(&mut buffer).unwrap();
        assert_eq!(buffer.len(), header.encoded_len());

        let mut stream = &buffer[..];
        assert_eq!(AsymmetricSecurityHeader::decode(&mut stream).unwrap(), header);
    }

    #[test]
    fn test_asymmetric_header_null_fields() {
        let header = AsymmetricSecurityHeader {
            security_policy_uri: ByteString::from(&b"uri"[..]),
            sender_certificate: ByteString::null(),
            receiver_certificate_thumbprint: ByteString::null(),
        };
        let mut buffer = Vec::new();
        header.encode(&mut buffer).unwrap();
        // fixed part + uri bytes
        assert_eq!(buffer.len(), ASYMMETRIC_SECURITY_HEADER_FIXED_LENGTH + 3);

        let mut stream = &buffer[..];
        let decoded = AsymmetricSecurityHeader::decode(&mut stream).unwrap();
        assert!(decoded.sender_certificate.is_null());
    }

    #[test]
    fn test_sequence_header_roundtrip() {
        let header = SequenceHeader {
            sequence_number: 42,
            request_id: 7,
        };
        let mut buffer = Vec::new();
        header.encode(&mut buffer).unwrap();
        assert_eq!(buffer.len(), SEQUENCE_HEADER_LENGTH);

        let mut stream = &buffer[..];
        assert_eq!(SequenceHeader::decode(&mut stream).unwrap(), header);
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = HelloMessage {
            protocol_version: 0,
            receive_buffer_size: 65536,
            send_buffer_size: 65536,
            max_message_size: 0,
            max_chunk_count: 0,
            endpoint_url: UaString::new("opc.tcp://x"),
        };
        let mut buffer = Vec::new();
        hello.encode(&mut buffer).unwrap();

        let mut stream = &buffer[..];
        assert_eq!(HelloMessage::decode(&mut stream).unwrap(), hello);
        assert!(stream.is_empty());
    }

    #[test]
    fn test_acknowledge_roundtrip() {
        let ack = AcknowledgeMessage {
            protocol_version: 0,
            receive_buffer_size: 8192,
            send_buffer_size: 65536,
            max_message_size: 2_000_000,
            max_chunk_count: 0,
        };
        let mut buffer = Vec::new();
        ack.encode(&mut buffer).unwrap();
        assert_eq!(buffer.len(), 20);

        let mut stream = &buffer[..];
        assert_eq!(AcknowledgeMessage::decode(&mut stream).unwrap(), ack);
    }

    #[test]
    fn test_error_message_roundtrip() {
        let error = ErrorMessage {
            error: StatusCode::BAD_COMMUNICATION_ERROR,
            reason: UaString::new("chunk too small"),
        };
        let mut buffer = Vec::new();
        error.encode(&mut buffer).unwrap();
        assert_eq!(buffer.len(), error.encoded_len());

        let mut stream = &buffer[..];
        assert_eq!(ErrorMessage::decode(&mut stream).unwrap(), error);
    }

    #[test]
    fn test_truncated_header_fails_decode() {
        let mut stream = &b"MSG"[..];
        assert_eq!(
            TcpMessageHeader::decode(&mut stream).unwrap_err(),
            StatusCode::BAD_DECODING_ERROR
        );
    }
}
