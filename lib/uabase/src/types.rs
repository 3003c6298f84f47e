use crate::status::StatusCode;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Read, Write};

/// All wire primitives are length-prefixed by a signed 32-bit little-endian
/// length where -1 encodes null and 0 encodes empty.
const NULL_LENGTH: i32 = -1;

fn decode_failed<T>() -> Result<T, StatusCode> {
    Err(StatusCode::BAD_DECODING_ERROR)
}

/// Owned byte buffer with explicit length. Nullable; a null ByteString is
/// distinct from an empty one on the wire.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct ByteString {
    data: Option<Vec<u8>>,
}

impl ByteString {
    pub fn null() -> ByteString {
        ByteString { data: None }
    }

    pub fn new(data: Vec<u8>) -> ByteString {
        ByteString { data: Some(data) }
    }

    pub fn is_null(&self) -> bool {
        self.data.is_none()
    }

    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, Vec::len)
    }

    /// The contained bytes; empty slice for null.
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn encode<W: Write>(&self, stream: &mut W) -> Result<(), StatusCode> {
        match &self.data {
            None => stream.write_i32::<LittleEndian>(NULL_LENGTH),
            Some(data) => stream
                .write_i32::<LittleEndian>(data.len() as i32)
                .and_then(|_| stream.write_all(data)),
        }
        .map_err(|_| StatusCode::BAD_ENCODING_ERROR)
    }

    pub fn decode(stream: &mut &[u8]) -> Result<ByteString, StatusCode> {
        let length = match stream.read_i32::<LittleEndian>() {
            Ok(length) => length,
            Err(_) => return decode_failed(),
        };
        if length < 0 {
            return Ok(ByteString::null());
        }
        let length = length as usize;
        if length > stream.len() {
            return decode_failed();
        }
        let mut data = vec![0u8; length];
        if stream.read_exact(&mut data).is_err() {
            return decode_failed();
        }
        Ok(ByteString::new(data))
    }

    /// The encoded size in bytes (length prefix included).
    pub fn encoded_len(&self) -> usize {
        4 + self.len()
    }
}

impl From<&[u8]> for ByteString {
    fn from(data: &[u8]) -> ByteString {
        ByteString::new(data.to_vec())
    }
}

/// Nullable UTF-8 string with the shared length-prefix encoding.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct UaString {
    data: Option<String>,
}

impl UaString {
    pub fn null() -> UaString {
        UaString { data: None }
    }

    pub fn new<S: Into<String>>(data: S) -> UaString {
        UaString { data: Some(data.into()) }
    }

    pub fn is_null(&self) -> bool {
        self.data.is_none()
    }

    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, String::len)
    }

    pub fn as_str(&self) -> &str {
        self.data.as_deref().unwrap_or("")
    }

    pub fn encode<W: Write>(&self, stream: &mut W) -> Result<(), StatusCode> {
        match &self.data {
            None => stream.write_i32::<LittleEndian>(NULL_LENGTH),
            Some(data) => stream
                .write_i32::<LittleEndian>(data.len() as i32)
                .and_then(|_| stream.write_all(data.as_bytes())),
        }
        .map_err(|_| StatusCode::BAD_ENCODING_ERROR)
    }

    pub fn decode(stream: &mut &[u8]) -> Result<UaString, StatusCode> {
        match ByteString::decode(stream)? {
            bytes if bytes.is_null() => Ok(UaString::null()),
            bytes => match String::from_utf8(bytes.as_slice().to_vec()) {
                Ok(text) => Ok(UaString::new(text)),
                Err(_) => decode_failed(),
            },
        }
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.len()
    }
}

impl From<&str> for UaString {
    fn from(data: &str) -> UaString {
        UaString::new(data)
    }
}

impl fmt::Display for UaString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 16-byte globally unique identifier.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub fn encode<W: Write>(&self, stream: &mut W) -> Result<(), StatusCode> {
        stream
            .write_u32::<LittleEndian>(self.data1)
            .and_then(|_| stream.write_u16::<LittleEndian>(self.data2))
            .and_then(|_| stream.write_u16::<LittleEndian>(self.data3))
            .and_then(|_| stream.write_all(&self.data4))
            .map_err(|_| StatusCode::BAD_ENCODING_ERROR)
    }

    pub fn decode(stream: &mut &[u8]) -> Result<Guid, StatusCode> {
        let mut guid = Guid {
            data1: stream.read_u32::<LittleEndian>().or_else(|_| decode_failed())?,
            data2: stream.read_u16::<LittleEndian>().or_else(|_| decode_failed())?,
            data3: stream.read_u16::<LittleEndian>().or_else(|_| decode_failed())?,
            data4: [0u8; 8],
        };
        if stream.read_exact(&mut guid.data4).is_err() {
            return decode_failed();
        }
        Ok(guid)
    }
}

/// NodeId identifier variants.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Identifier {
    Numeric(u32),
    String(UaString),
    Guid(Guid),
    ByteString(ByteString),
}

/// Identifies message body types and security artifacts.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NodeId {
    pub namespace: u16,
    pub identifier: Identifier,
}

// NodeId binary encoding bytes
const NODEID_TWOBYTE: u8 = 0x00;
const NODEID_FOURBYTE: u8 = 0x01;
const NODEID_NUMERIC: u8 = 0x02;
const NODEID_STRING: u8 = 0x03;
const NODEID_GUID: u8 = 0x04;
const NODEID_BYTESTRING: u8 = 0x05;

impl NodeId {
    pub fn numeric(namespace: u16, value: u32) -> NodeId {
        NodeId {
            namespace,
            identifier: Identifier::Numeric(value),
        }
    }

    pub fn encode<W: Write>(&self, stream: &mut W) -> Result<(), StatusCode> {
        fn enc(_err: std::io::Error) -> StatusCode {
            StatusCode::BAD_ENCODING_ERROR
        }

        match &self.identifier {
            Identifier::Numeric(value) => {
                // The compressed forms save bytes for the common ids
                if self.namespace == 0 && *value <= u8::MAX as u32 {
                    stream.write_u8(NODEID_TWOBYTE).map_err(enc)?;
                    stream.write_u8(*value as u8).map_err(enc)?;
                } else if self.namespace <= u8::MAX as u16 && *value <= u16::MAX as u32 {
                    stream.write_u8(NODEID_FOURBYTE).map_err(enc)?;
                    stream.write_u8(self.namespace as u8).map_err(enc)?;
                    stream.write_u16::<LittleEndian>(*value as u16).map_err(enc)?;
                } else {
                    stream.write_u8(NODEID_NUMERIC).map_err(enc)?;
                    stream.write_u16::<LittleEndian>(self.namespace).map_err(enc)?;
                    stream.write_u32::<LittleEndian>(*value).map_err(enc)?;
                }
            }
            Identifier::String(value) => {
                stream.write_u8(NODEID_STRING).map_err(enc)?;
                stream.write_u16::<LittleEndian>(self.namespace).map_err(enc)?;
                value.encode(stream)?;
            }
            Identifier::Guid(value) => {
                stream.write_u8(NODEID_GUID).map_err(enc)?;
                stream.write_u16::<LittleEndian>(self.namespace).map_err(enc)?;
                value.encode(stream)?;
            }
            Identifier::ByteString(value) => {
                stream.write_u8(NODEID_BYTESTRING).map_err(enc)?;
                stream.write_u16::<LittleEndian>(self.namespace).map_err(enc)?;
                value.encode(stream)?;
            }
        }
        Ok(())
    }

    pub fn decode(stream: &mut &[u8]) -> Result<NodeId, StatusCode> {
        let encoding = stream.read_u8().or_else(|_| decode_failed())?;
        match encoding {
            NODEID_TWOBYTE => {
                let value = stream.read_u8().or_else(|_| decode_failed())?;
                Ok(NodeId::numeric(0, value as u32))
            }
            NODEID_FOURBYTE => {
                let namespace = stream.read_u8().or_else(|_| decode_failed())?;
                let value = stream
                    .read_u16::<LittleEndian>()
                    .or_else(|_| decode_failed())?;
                Ok(NodeId::numeric(namespace as u16, value as u32))
            }
            NODEID_NUMERIC => {
                let namespace = stream
                    .read_u16::<LittleEndian>()
                    .or_else(|_| decode_failed())?;
                let value = stream
                    .read_u32::<LittleEndian>()
                    .or_else(|_| decode_failed())?;
                Ok(NodeId::numeric(namespace, value))
            }
            NODEID_STRING => {
                let namespace = stream
                    .read_u16::<LittleEndian>()
                    .or_else(|_| decode_failed())?;
                Ok(NodeId {
                    namespace,
                    identifier: Identifier::String(UaString::decode(stream)?),
                })
            }
            NODEID_GUID => {
                let namespace = stream
                    .read_u16::<LittleEndian>()
                    .or_else(|_| decode_failed())?;
                Ok(NodeId {
                    namespace,
                    identifier: Identifier::Guid(Guid::decode(stream)?),
                })
            }
            NODEID_BYTESTRING => {
                let namespace = stream
                    .read_u16::<LittleEndian>()
                    .or_else(|_| decode_failed())?;
                Ok(NodeId {
                    namespace,
                    identifier: Identifier::ByteString(ByteString::decode(stream)?),
                })
            }
            _ => decode_failed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_nodeid(id: NodeId) -> NodeId {
        let mut buffer = Vec::new();
        id.encode(&mut buffer).unwrap();
        let mut stream = &buffer[..];
        let decoded = NodeId::decode(&mut stream).unwrap();
        assert!(stream.is_empty());
        decoded
    }

    #[test]
    fn test_bytestring_null_vs_empty() {
        let mut buffer = Vec::new();
        ByteString::null().encode(&mut buffer).unwrap();
        assert_eq!(buffer, (-1i32).to_le_bytes());

        buffer.clear();
        ByteString::new(Vec::new()).encode(&mut buffer).unwrap();
        assert_eq!(buffer, 0i32.to_le_bytes());

        let mut stream = &(-1i32).to_le_bytes()[..];
        assert!(ByteString::decode(&mut stream).unwrap().is_null());
    }

    #[test]
    fn test_bytestring_roundtrip() {
        let original = ByteString::new(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        let mut buffer = Vec::new();
        original.encode(&mut buffer).unwrap();
        let mut stream = &buffer[..];
        assert_eq!(ByteString::decode(&mut stream).unwrap(), original);
    }

    #[test]
    fn test_bytestring_truncated() {
        let mut buffer = Vec::new();
        ByteString::new(vec![1, 2, 3, 4]).encode(&mut buffer).unwrap();
        let mut stream = &buffer[..6];
        assert_eq!(
            ByteString::decode(&mut stream).unwrap_err(),
            StatusCode::BAD_DECODING_ERROR
        );
    }

    #[test]
    fn test_string_roundtrip() {
        let original = UaString::new("opc.tcp://localhost:4840");
        let mut buffer = Vec::new();
        original.encode(&mut buffer).unwrap();
        let mut stream = &buffer[..];
        assert_eq!(UaString::decode(&mut stream).unwrap(), original);
    }

    #[test]
    fn test_string_invalid_utf8() {
        let mut buffer = Vec::new();
        ByteString::new(vec![0xFF, 0xFE]).encode(&mut buffer).unwrap();
        let mut stream = &buffer[..];
        assert_eq!(
            UaString::decode(&mut stream).unwrap_err(),
            StatusCode::BAD_DECODING_ERROR
        );
    }

    #[test]
    fn test_nodeid_twobyte_form() {
        let id = NodeId::numeric(0, 42);
        let mut buffer = Vec::new();
        id.encode(&mut buffer).unwrap();
        assert_eq!(buffer, vec![0x00, 42]);
        assert_eq!(roundtrip_nodeid(id.clone()), id);
    }

    #[test]
    fn test_nodeid_fourbyte_form() {
        let id = NodeId::numeric(5, 1025);
        let mut buffer = Vec::new();
        id.encode(&mut buffer).unwrap();
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer[0], 0x01);
        assert_eq!(roundtrip_nodeid(id.clone()), id);
    }

    #[test]
    fn test_nodeid_numeric_form() {
        let id = NodeId::numeric(300, 70_000);
        assert_eq!(roundtrip_nodeid(id.clone()), id);
    }

    #[test]
    fn test_nodeid_string_form() {
        let id = NodeId {
            namespace: 1,
            identifier: Identifier::String(UaString::new("the.answer")),
        };
        assert_eq!(roundtrip_nodeid(id.clone()), id);
    }

    #[test]
    fn test_nodeid_bytestring_form() {
        let id = NodeId {
            namespace: 7,
            identifier: Identifier::ByteString(ByteString::new(vec![1, 2, 3])),
        };
        assert_eq!(roundtrip_nodeid(id.clone()), id);
    }

    #[test]
    fn test_nodeid_unknown_encoding() {
        let mut stream = &[0x40u8, 0, 0][..];
        assert_eq!(
            NodeId::decode(&mut stream).unwrap_err(),
            StatusCode::BAD_DECODING_ERROR
        );
    }
}
