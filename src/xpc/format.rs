//! XPC wire format
//!
//! A message is a 24 byte wrapper `{magic, flags, body_len, message_id}`
//! around an optional object payload. Payloads start with their own magic
//! and version, followed by one tagged object. Variable length fields are
//! padded to 4 bytes.

use std::{
    ops::{BitOr, BitOrAssign},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::DeviceError;

const MESSAGE_MAGIC: u32 = 0x29b00b92;
const OBJECT_MAGIC: u32 = 0x42133742;
const OBJECT_VERSION: u32 = 0x00000005;
const MESSAGE_HEADER_LEN: usize = 24;

/// Flag bits of an XPC message
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct XpcFlags(pub u32);

impl XpcFlags {
    pub const ALWAYS_SET: Self = Self(0x00000001);
    pub const DATA: Self = Self(0x00000100);
    pub const WANTING_REPLY: Self = Self(0x00010000);
    pub const INIT_HANDSHAKE: Self = Self(0x00400000);

    const NAMED: [(Self, &'static str); 4] = [
        (Self::ALWAYS_SET, "AlwaysSet"),
        (Self::DATA, "Data"),
        (Self::WANTING_REPLY, "WantingReply"),
        (Self::INIT_HANDSHAKE, "InitHandshake"),
    ];

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for XpcFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for XpcFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for XpcFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut rest = self.0;
        let mut parts = Vec::new();
        for (flag, name) in Self::NAMED {
            if self.contains(flag) {
                parts.push(name.to_string());
                rest &= !flag.0;
            }
        }
        if rest != 0 {
            parts.push(format!("0x{rest:08X}"));
        }
        write!(f, "[{}]", parts.join(" | "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum XpcType {
    Bool = 0x00002000,
    Int64 = 0x00003000,
    UInt64 = 0x00004000,
    Double = 0x00005000,
    Date = 0x00007000,
    Data = 0x00008000,
    String = 0x00009000,
    Uuid = 0x0000a000,
    Array = 0x0000e000,
    Dictionary = 0x0000f000,
}

impl TryFrom<u32> for XpcType {
    type Error = DeviceError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00002000 => Self::Bool,
            0x00003000 => Self::Int64,
            0x00004000 => Self::UInt64,
            0x00005000 => Self::Double,
            0x00007000 => Self::Date,
            0x00008000 => Self::Data,
            0x00009000 => Self::String,
            0x0000a000 => Self::Uuid,
            0x0000e000 => Self::Array,
            0x0000f000 => Self::Dictionary,
            _ => return Err(DeviceError::UnknownXpcType(value)),
        })
    }
}

pub type Dictionary = IndexMap<String, XpcObject>;

/// A decoded XPC value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum XpcObject {
    Bool(bool),
    Dictionary(Dictionary),
    Array(Vec<XpcObject>),
    Double(f64),
    Int64(i64),
    UInt64(u64),
    Date(SystemTime),
    String(String),
    Data(Vec<u8>),
    Uuid(uuid::Uuid),
}

/// Bytes needed to bring `len` up to a multiple of 4
fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Bounds checked little endian reader over a payload
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DeviceError> {
        let end = self.pos.checked_add(len).ok_or(DeviceError::MalformedXpc)?;
        match self.buf.get(self.pos..end) {
            Some(s) => {
                self.pos = end;
                Ok(s)
            }
            None => Err(DeviceError::NotEnoughBytes(self.buf.len() - self.pos, len)),
        }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DeviceError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, DeviceError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DeviceError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// Skips alignment after a field of `len` bytes; trailing padding may be absent
    fn align(&mut self, len: usize) {
        self.pos = (self.pos + padding(len)).min(self.buf.len());
    }

    /// Reads a NUL terminated string and its padding
    fn c_string(&mut self) -> Result<String, DeviceError> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(DeviceError::InvalidCString)?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| DeviceError::InvalidCString)?;
        self.pos += nul + 1;
        self.align(nul + 1);
        Ok(s.to_string())
    }
}

impl XpcObject {
    /// Encodes the object as a standalone payload
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&OBJECT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&OBJECT_VERSION.to_le_bytes());
        self.encode_object(&mut buf);
        buf
    }

    fn encode_object(&self, buf: &mut Vec<u8>) {
        let tag = |buf: &mut Vec<u8>, t: XpcType| buf.extend_from_slice(&(t as u32).to_le_bytes());
        match self {
            XpcObject::Bool(val) => {
                tag(buf, XpcType::Bool);
                buf.extend_from_slice(&[*val as u8, 0, 0, 0]);
            }
            XpcObject::Dictionary(dict) => {
                tag(buf, XpcType::Dictionary);
                let mut content = Vec::new();
                content.extend_from_slice(&(dict.len() as u32).to_le_bytes());
                for (k, v) in dict {
                    content.extend_from_slice(k.as_bytes());
                    content.push(0);
                    content.resize(content.len() + padding(k.len() + 1), 0);
                    v.encode_object(&mut content);
                }
                buf.extend_from_slice(&(content.len() as u32).to_le_bytes());
                buf.extend_from_slice(&content);
            }
            XpcObject::Array(items) => {
                tag(buf, XpcType::Array);
                let mut content = Vec::new();
                content.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    item.encode_object(&mut content);
                }
                buf.extend_from_slice(&(content.len() as u32).to_le_bytes());
                buf.extend_from_slice(&content);
            }
            XpcObject::Double(f) => {
                tag(buf, XpcType::Double);
                buf.extend_from_slice(&f.to_le_bytes());
            }
            XpcObject::Int64(num) => {
                tag(buf, XpcType::Int64);
                buf.extend_from_slice(&num.to_le_bytes());
            }
            XpcObject::UInt64(num) => {
                tag(buf, XpcType::UInt64);
                buf.extend_from_slice(&num.to_le_bytes());
            }
            XpcObject::Date(date) => {
                tag(buf, XpcType::Date);
                let nanos = date
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos() as u64;
                buf.extend_from_slice(&nanos.to_le_bytes());
            }
            XpcObject::String(s) => {
                tag(buf, XpcType::String);
                let l = s.len() + 1;
                buf.extend_from_slice(&(l as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
                buf.push(0);
                buf.resize(buf.len() + padding(l), 0);
            }
            XpcObject::Data(data) => {
                tag(buf, XpcType::Data);
                buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
                buf.extend_from_slice(data);
                buf.resize(buf.len() + padding(data.len()), 0);
            }
            XpcObject::Uuid(uuid) => {
                tag(buf, XpcType::Uuid);
                buf.extend_from_slice(uuid.as_bytes());
            }
        }
    }

    /// Decodes a standalone payload
    pub fn decode(buf: &[u8]) -> Result<Self, DeviceError> {
        let mut reader = Reader::new(buf);
        if reader.u32()? != OBJECT_MAGIC {
            warn!("Invalid magic for XPC object");
            return Err(DeviceError::InvalidXpcMagic);
        }
        if reader.u32()? != OBJECT_VERSION {
            warn!("Unexpected version for XPC object");
            return Err(DeviceError::UnexpectedXpcVersion);
        }
        Self::decode_object(&mut reader)
    }

    fn decode_object(reader: &mut Reader<'_>) -> Result<Self, DeviceError> {
        let xpc_type = XpcType::try_from(reader.u32()?)?;
        Ok(match xpc_type {
            XpcType::Bool => {
                let b: [u8; 4] = reader.array()?;
                XpcObject::Bool(b[0] != 0)
            }
            XpcType::Int64 => XpcObject::Int64(reader.u64()? as i64),
            XpcType::UInt64 => XpcObject::UInt64(reader.u64()?),
            XpcType::Double => XpcObject::Double(f64::from_le_bytes(reader.array()?)),
            XpcType::Date => XpcObject::Date(UNIX_EPOCH + Duration::from_nanos(reader.u64()?)),
            XpcType::Data => {
                let l = reader.u32()? as usize;
                let data = reader.take(l)?.to_vec();
                reader.align(l);
                XpcObject::Data(data)
            }
            XpcType::String => {
                // the length includes the terminator
                let l = reader.u32()? as usize;
                let raw = reader.take(l)?;
                reader.align(l);
                let s = match raw.split_last() {
                    Some((0, s)) => s,
                    _ => return Err(DeviceError::InvalidCString),
                };
                XpcObject::String(
                    String::from_utf8(s.to_vec()).map_err(|_| DeviceError::InvalidCString)?,
                )
            }
            XpcType::Uuid => XpcObject::Uuid(uuid::Uuid::from_bytes(reader.array()?)),
            XpcType::Array => {
                let _len = reader.u32()?;
                let count = reader.u32()?;
                let mut items = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    items.push(Self::decode_object(reader)?);
                }
                XpcObject::Array(items)
            }
            XpcType::Dictionary => {
                let _len = reader.u32()?;
                let count = reader.u32()?;
                let mut dict = IndexMap::new();
                for _ in 0..count {
                    let key = reader.c_string()?;
                    dict.insert(key, Self::decode_object(reader)?);
                }
                XpcObject::Dictionary(dict)
            }
        })
    }

    /// Converts to the equivalent plist value. UUIDs become strings.
    pub fn to_plist(&self) -> plist::Value {
        match self {
            Self::Bool(v) => plist::Value::Boolean(*v),
            Self::Uuid(uuid) => plist::Value::String(uuid.to_string()),
            Self::Double(f) => plist::Value::Real(*f),
            Self::UInt64(v) => plist::Value::Integer((*v).into()),
            Self::Int64(v) => plist::Value::Integer((*v).into()),
            Self::Date(d) => plist::Value::Date(plist::Date::from(*d)),
            Self::String(v) => plist::Value::String(v.clone()),
            Self::Data(v) => plist::Value::Data(v.clone()),
            Self::Array(v) => plist::Value::Array(v.iter().map(|item| item.to_plist()).collect()),
            Self::Dictionary(v) => plist::Value::Dictionary(
                v.iter().map(|(k, v)| (k.clone(), v.to_plist())).collect(),
            ),
        }
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            XpcObject::Dictionary(dict) => Some(dict),
            _ => None,
        }
    }

    pub fn into_dictionary(self) -> Option<Dictionary> {
        match self {
            XpcObject::Dictionary(dict) => Some(dict),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            XpcObject::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            XpcObject::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            XpcObject::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Reads an integer, also accepting the decimal strings devices like to send
    pub fn as_signed_integer(&self) -> Option<i64> {
        match self {
            XpcObject::String(s) => s.parse().ok(),
            XpcObject::Int64(v) => Some(*v),
            XpcObject::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_unsigned_integer(&self) -> Option<u64> {
        match self {
            XpcObject::String(s) => s.parse().ok(),
            XpcObject::UInt64(v) => Some(*v),
            XpcObject::Int64(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl TryFrom<plist::Value> for XpcObject {
    type Error = DeviceError;

    fn try_from(value: plist::Value) -> Result<Self, Self::Error> {
        Ok(match value {
            plist::Value::Array(v) => XpcObject::Array(
                v.into_iter()
                    .map(XpcObject::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            plist::Value::Dictionary(v) => {
                let mut dict = Dictionary::new();
                for (k, v) in v {
                    dict.insert(k, XpcObject::try_from(v)?);
                }
                XpcObject::Dictionary(dict)
            }
            plist::Value::Boolean(v) => XpcObject::Bool(v),
            plist::Value::Data(v) => XpcObject::Data(v),
            plist::Value::Date(d) => XpcObject::Date(d.into()),
            plist::Value::Real(f) => XpcObject::Double(f),
            plist::Value::Integer(v) => match v.as_signed() {
                Some(i) => XpcObject::Int64(i),
                None => XpcObject::UInt64(v.as_unsigned().ok_or(DeviceError::InvalidArgument)?),
            },
            plist::Value::String(v) => XpcObject::String(v),
            plist::Value::Uid(u) => XpcObject::UInt64(u.get()),
            other => {
                warn!("No XPC equivalent for {other:?}");
                return Err(DeviceError::InvalidArgument);
            }
        })
    }
}

impl From<Dictionary> for XpcObject {
    fn from(value: Dictionary) -> Self {
        XpcObject::Dictionary(value)
    }
}

/// One XPC message as carried in HTTP/2 DATA frames
#[derive(Debug, Clone, PartialEq)]
pub struct XpcMessage {
    pub flags: XpcFlags,
    pub message: Option<XpcObject>,
    pub message_id: u64,
}

impl XpcMessage {
    pub fn new(flags: XpcFlags, message: Option<XpcObject>, message_id: u64) -> Self {
        Self {
            flags,
            message,
            message_id,
        }
    }

    /// Length of the complete message starting at `data`, once the header is available
    pub fn frame_len(data: &[u8]) -> Option<usize> {
        let body_len: [u8; 8] = data.get(8..16)?.try_into().ok()?;
        Some(MESSAGE_HEADER_LEN + u64::from_le_bytes(body_len) as usize)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DeviceError> {
        let mut reader = Reader::new(data);
        if data.len() < MESSAGE_HEADER_LEN {
            return Err(DeviceError::NotEnoughBytes(data.len(), MESSAGE_HEADER_LEN));
        }
        if reader.u32()? != MESSAGE_MAGIC {
            warn!("XPC message magic is invalid");
            return Err(DeviceError::MalformedXpc);
        }

        let flags = XpcFlags(reader.u32()?);
        let body_len = reader.u64()? as usize;
        let message_id = reader.u64()?;
        let body = match reader.take(body_len) {
            Ok(b) => b,
            Err(_) => {
                warn!(
                    "Body length is {body_len}, but only {} bytes follow the header",
                    data.len() - MESSAGE_HEADER_LEN
                );
                return Err(DeviceError::PacketSizeMismatch);
            }
        };

        let res = Self {
            flags,
            message: if body_len > 0 {
                Some(XpcObject::decode(body)?)
            } else {
                None
            },
            message_id,
        };
        debug!("Decoded {res:?}");
        Ok(res)
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.message.as_ref().map(|m| m.encode()).unwrap_or_default();
        let mut out = Vec::with_capacity(MESSAGE_HEADER_LEN + body.len());
        out.extend_from_slice(&MESSAGE_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.flags.0.to_le_bytes());
        out.extend_from_slice(&(body.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.message_id.to_le_bytes());
        out.extend_from_slice(&body);
        out
    }
}
