//! Data bridge: the abstract, thread-safe getter/setter surface GATT handlers read and write
//! through, keyed by hierarchical string names disjoint from D-Bus object paths.

use std::fmt;

/// Tagged union over the value types carried across the data bridge.
///
/// All D-Bus marshalling of application-visible values flows through this type rather than
/// through `dbus::arg::RefArg` directly, so handlers never need to know about D-Bus typing.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum PropValue {
    /// A boolean value.
    Bool(bool),
    /// An unsigned 8-bit value.
    U8(u8),
    /// A signed 16-bit value.
    I16(i16),
    /// An unsigned 16-bit value.
    U16(u16),
    /// An unsigned 32-bit value.
    U32(u32),
    /// A UTF-8 string value.
    Str(String),
    /// An opaque byte array.
    Bytes(Vec<u8>),
}

impl PropValue {
    /// Renders this value as the bytes that would populate a characteristic's `Value` property.
    ///
    /// Integers are encoded little-endian; strings are encoded as their UTF-8 bytes with no
    /// terminator.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            PropValue::Bool(b) => vec![*b as u8],
            PropValue::U8(v) => vec![*v],
            PropValue::I16(v) => v.to_le_bytes().to_vec(),
            PropValue::U16(v) => v.to_le_bytes().to_vec(),
            PropValue::U32(v) => v.to_le_bytes().to_vec(),
            PropValue::Str(s) => s.as_bytes().to_vec(),
            PropValue::Bytes(b) => b.clone(),
        }
    }

    /// Parses `bytes` into a `PropValue` shaped like `like`, i.e. using `like`'s variant to
    /// choose the decoding, so a write handler can turn the raw bytes BlueZ delivered back into
    /// the same shape the data bridge already holds for that key.
    pub fn from_bytes_like(bytes: &[u8], like: &PropValue) -> Option<PropValue> {
        Some(match like {
            PropValue::Bool(_) => PropValue::Bool(*bytes.first()? != 0),
            PropValue::U8(_) => PropValue::U8(*bytes.first()?),
            PropValue::I16(_) => PropValue::I16(i16::from_le_bytes(bytes.get(0..2)?.try_into().ok()?)),
            PropValue::U16(_) => PropValue::U16(u16::from_le_bytes(bytes.get(0..2)?.try_into().ok()?)),
            PropValue::U32(_) => PropValue::U32(u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?)),
            PropValue::Str(_) => PropValue::Str(String::from_utf8(bytes.to_vec()).ok()?),
            PropValue::Bytes(_) => PropValue::Bytes(bytes.to_vec()),
        })
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PropValue::Bool(v) => write!(f, "{v}"),
            PropValue::U8(v) => write!(f, "{v}"),
            PropValue::I16(v) => write!(f, "{v}"),
            PropValue::U16(v) => write!(f, "{v}"),
            PropValue::U32(v) => write!(f, "{v}"),
            PropValue::Str(v) => write!(f, "{v}"),
            PropValue::Bytes(v) => write!(f, "{v:x?}"),
        }
    }
}

/// Application-supplied storage shared between the GATT tree and the rest of the application.
///
/// `get`/`set` may be called from any task at any time; implementations are responsible for
/// their own internal synchronization. Keys are hierarchical strings like `"battery/level"`,
/// disjoint from D-Bus object paths.
pub trait DataBridge: Send + Sync {
    /// Returns the current value stored under `name`, or `None` if `name` is unknown.
    fn get(&self, name: &str) -> Option<PropValue>;

    /// Writes `value` under `name`. Returns `true` if the write was accepted.
    fn set(&self, name: &str, value: PropValue) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u16_round_trips_little_endian() {
        let v = PropValue::U16(0x0102);
        assert_eq!(v.to_bytes(), vec![0x02, 0x01]);
        assert_eq!(PropValue::from_bytes_like(&[0x02, 0x01], &PropValue::U16(0)), Some(PropValue::U16(0x0102)));
    }

    #[test]
    fn str_to_bytes_is_utf8_no_terminator() {
        let v = PropValue::Str("Acme Inc.".to_string());
        assert_eq!(v.to_bytes(), b"Acme Inc.".to_vec());
    }

    #[test]
    fn from_bytes_like_returns_none_on_short_input() {
        assert_eq!(PropValue::from_bytes_like(&[], &PropValue::U32(0)), None);
    }
}
