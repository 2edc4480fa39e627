// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Compact key and value objects stored in the prime table.
//!
//! Keys at or below [`INLINE_KEY_LIMIT`] bytes are stored in place; longer
//! keys spill to the heap. Values carry their object type, encoding, the
//! expire/flag presence bits, and a payload that is either resident bytes, a
//! handle into tiered storage, or an in-flight I/O marker.

use dash::TableKey;

/// Longest key stored without a heap allocation. Sized so the inline variant
/// is no wider than the spilled one.
pub const INLINE_KEY_LIMIT: usize = 22;

#[derive(Clone, Debug)]
enum KeyBytes {
    Inline { len: u8, data: [u8; INLINE_KEY_LIMIT] },
    Heap(Box<[u8]>),
}

/// A key: a byte string with a sticky bit protecting it from eviction.
#[derive(Clone, Debug)]
pub struct Key {
    bytes: KeyBytes,
    sticky: bool,
}

impl Key {
    pub fn new(key: &[u8]) -> Self {
        let bytes = if key.len() <= INLINE_KEY_LIMIT {
            let mut data = [0u8; INLINE_KEY_LIMIT];
            data[..key.len()].copy_from_slice(key);
            KeyBytes::Inline {
                len: key.len() as u8,
                data,
            }
        } else {
            KeyBytes::Heap(key.into())
        };
        Self {
            bytes,
            sticky: false,
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match &self.bytes {
            KeyBytes::Inline { len, data } => &data[..*len as usize],
            KeyBytes::Heap(bytes) => bytes,
        }
    }

    #[inline]
    pub fn is_inline(&self) -> bool {
        matches!(self.bytes, KeyBytes::Inline { .. })
    }

    #[inline]
    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    pub fn set_sticky(&mut self, sticky: bool) {
        self.sticky = sticky;
    }

    /// Heap bytes owned by this key; zero for inline keys.
    pub fn mem_used(&self) -> usize {
        match &self.bytes {
            KeyBytes::Inline { .. } => 0,
            KeyBytes::Heap(bytes) => bytes.len(),
        }
    }
}

impl TableKey for Key {
    fn key_bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Key {}

/// Object type tag, used for WRONGTYPE checks and per-type memory accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjType {
    String = 0,
    List = 1,
    Set = 2,
    ZSet = 3,
    Hash = 4,
    Json = 5,
}

/// Value encoding tag. Small collections use the packed encoding; they switch
/// to the pointer-based one as they grow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Raw,
    Int,
    ListPack,
    HashTable,
    SkipList,
}

/// Where the value's bytes live.
#[derive(Clone, Debug)]
pub enum Payload {
    /// Resident in memory.
    Inline(Box<[u8]>),
    /// Paged out to tiered storage; the handle identifies the extent.
    External { offset: u64, len: u32 },
    /// A tiered write is in flight; the id cancels it.
    IoPending { request: u64 },
}

/// A value owned by its key entry.
#[derive(Clone, Debug)]
pub struct Value {
    payload: Payload,
    obj_type: ObjType,
    encoding: Encoding,
    has_expire: bool,
    has_flag: bool,
}

impl Default for Value {
    fn default() -> Self {
        Self::new(ObjType::String, Encoding::Raw, &[])
    }
}

impl Value {
    pub fn new(obj_type: ObjType, encoding: Encoding, bytes: &[u8]) -> Self {
        Self {
            payload: Payload::Inline(bytes.into()),
            obj_type,
            encoding,
            has_expire: false,
            has_flag: false,
        }
    }

    /// A raw string value.
    pub fn string(bytes: &[u8]) -> Self {
        Self::new(ObjType::String, Encoding::Raw, bytes)
    }

    #[inline]
    pub fn obj_type(&self) -> ObjType {
        self.obj_type
    }

    #[inline]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    #[inline]
    pub fn has_expire(&self) -> bool {
        self.has_expire
    }

    pub fn set_expire(&mut self, present: bool) {
        self.has_expire = present;
    }

    #[inline]
    pub fn has_flag(&self) -> bool {
        self.has_flag
    }

    pub fn set_flag(&mut self, present: bool) {
        self.has_flag = present;
    }

    #[inline]
    pub fn is_external(&self) -> bool {
        matches!(self.payload, Payload::External { .. })
    }

    #[inline]
    pub fn has_io_pending(&self) -> bool {
        matches!(self.payload, Payload::IoPending { .. })
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Resident bytes, if the value is in memory.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Inline(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn external_handle(&self) -> Option<(u64, u32)> {
        match self.payload {
            Payload::External { offset, len } => Some((offset, len)),
            _ => None,
        }
    }

    pub fn io_request(&self) -> Option<u64> {
        match self.payload {
            Payload::IoPending { request } => Some(request),
            _ => None,
        }
    }

    /// Replace the payload with resident bytes, e.g. after a tiered load.
    pub fn set_resident(&mut self, bytes: &[u8]) {
        self.payload = Payload::Inline(bytes.into());
    }

    pub fn set_external(&mut self, offset: u64, len: u32) {
        self.payload = Payload::External { offset, len };
    }

    pub fn set_io_pending(&mut self, request: u64) {
        self.payload = Payload::IoPending { request };
    }

    /// Heap bytes owned by the value. External and in-flight payloads own
    /// nothing resident.
    pub fn mem_used(&self) -> usize {
        match &self.payload {
            Payload::Inline(bytes) => bytes.len(),
            Payload::External { .. } | Payload::IoPending { .. } => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_keys_are_inline() {
        let key = Key::new(b"espresso");
        assert!(key.is_inline());
        assert_eq!(key.as_bytes(), b"espresso");
        assert_eq!(key.mem_used(), 0);

        let long = Key::new(b"a-rather-long-key-that-cannot-be-stored-in-place");
        assert!(!long.is_inline());
        assert_eq!(long.mem_used(), long.as_bytes().len());
    }

    #[test]
    fn inline_boundary() {
        let at_limit = Key::new(&[b'x'; INLINE_KEY_LIMIT]);
        assert!(at_limit.is_inline());
        let over = Key::new(&[b'x'; INLINE_KEY_LIMIT + 1]);
        assert!(!over.is_inline());
    }

    #[test]
    fn value_flags_and_payload() {
        let mut v = Value::string(b"strong");
        assert_eq!(v.obj_type(), ObjType::String);
        assert_eq!(v.as_bytes(), Some(&b"strong"[..]));
        assert!(!v.has_expire());
        assert_eq!(v.mem_used(), 6);

        v.set_external(4096, 6);
        assert!(v.is_external());
        assert_eq!(v.external_handle(), Some((4096, 6)));
        assert_eq!(v.mem_used(), 0);

        v.set_resident(b"strong");
        assert!(!v.is_external());
        assert_eq!(v.as_bytes(), Some(&b"strong"[..]));
    }
}
