// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Typed value codec over a [`ByteArray`].
//!
//! Wire conventions: integers wider than a byte are varints (signed ones
//! zig-zag mapped), floats are fixed-width big-endian, booleans one byte,
//! strings varint-length-prefixed UTF-8, tuples plain concatenation, and
//! sequences/maps/sets count-prefixed. Method arguments travel as one
//! encoded tuple, so a handler's parameter list round-trips through a
//! single [`Decode`] bound.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::buffer::{ByteArray, ByteArrayError};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Buffer(#[from] ByteArrayError),

    #[error("value out of range for its type")]
    InvalidValue,
}

/// Streaming writer/reader over a [`ByteArray`]. Build with writes, call
/// [`Serializer::reset`], then read (or ship the bytes).
#[derive(Debug, Default)]
pub struct Serializer {
    buffer: ByteArray,
}

impl Serializer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            buffer: ByteArray::from_bytes(bytes),
        }
    }

    /// Rewind the cursor to the start.
    pub fn reset(&mut self) {
        self.buffer.set_position(0).expect("position 0 is always valid");
    }

    pub fn write<T: Encode + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.encode(self);
        self
    }

    pub fn read<T: Decode>(&mut self) -> Result<T, DecodeError> {
        T::decode(self)
    }

    /// Bytes from the cursor to the end.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.buffer.to_bytes()
    }

    /// Remaining readable byte count.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buffer.read_size()
    }

    pub fn buffer_mut(&mut self) -> &mut ByteArray {
        &mut self.buffer
    }
}

pub trait Encode {
    fn encode(&self, s: &mut Serializer);
}

pub trait Decode: Sized {
    fn decode(s: &mut Serializer) -> Result<Self, DecodeError>;
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, s: &mut Serializer) {
        (*self).encode(s);
    }
}

impl Encode for () {
    fn encode(&self, _: &mut Serializer) {}
}

impl Decode for () {
    fn decode(_: &mut Serializer) -> Result<Self, DecodeError> {
        Ok(())
    }
}

impl Encode for bool {
    fn encode(&self, s: &mut Serializer) {
        s.buffer.write_u8(u8::from(*self));
    }
}

impl Decode for bool {
    fn decode(s: &mut Serializer) -> Result<Self, DecodeError> {
        match s.buffer.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::InvalidValue),
        }
    }
}

impl Encode for u8 {
    fn encode(&self, s: &mut Serializer) {
        s.buffer.write_u8(*self);
    }
}

impl Decode for u8 {
    fn decode(s: &mut Serializer) -> Result<Self, DecodeError> {
        Ok(s.buffer.read_u8()?)
    }
}

impl Encode for i8 {
    fn encode(&self, s: &mut Serializer) {
        s.buffer.write_i8(*self);
    }
}

impl Decode for i8 {
    fn decode(s: &mut Serializer) -> Result<Self, DecodeError> {
        Ok(s.buffer.read_i8()?)
    }
}

macro_rules! impl_varint_unsigned {
    ($($ty:ty),+) => {$(
        impl Encode for $ty {
            fn encode(&self, s: &mut Serializer) {
                s.buffer.write_var_u64(u64::from(*self));
            }
        }

        impl Decode for $ty {
            fn decode(s: &mut Serializer) -> Result<Self, DecodeError> {
                let raw = s.buffer.read_var_u64()?;
                <$ty>::try_from(raw).map_err(|_| DecodeError::InvalidValue)
            }
        }
    )+};
}

impl_varint_unsigned!(u16, u32, u64);

macro_rules! impl_varint_signed {
    ($($ty:ty),+) => {$(
        impl Encode for $ty {
            fn encode(&self, s: &mut Serializer) {
                s.buffer.write_var_i64(i64::from(*self));
            }
        }

        impl Decode for $ty {
            fn decode(s: &mut Serializer) -> Result<Self, DecodeError> {
                let raw = s.buffer.read_var_i64()?;
                <$ty>::try_from(raw).map_err(|_| DecodeError::InvalidValue)
            }
        }
    )+};
}

impl_varint_signed!(i16, i32, i64);

impl Encode for f32 {
    fn encode(&self, s: &mut Serializer) {
        s.buffer.write_f32(*self);
    }
}

impl Decode for f32 {
    fn decode(s: &mut Serializer) -> Result<Self, DecodeError> {
        Ok(s.buffer.read_f32()?)
    }
}

impl Encode for f64 {
    fn encode(&self, s: &mut Serializer) {
        s.buffer.write_f64(*self);
    }
}

impl Decode for f64 {
    fn decode(s: &mut Serializer) -> Result<Self, DecodeError> {
        Ok(s.buffer.read_f64()?)
    }
}

impl Encode for str {
    fn encode(&self, s: &mut Serializer) {
        s.buffer.write_str(self);
    }
}

impl Encode for String {
    fn encode(&self, s: &mut Serializer) {
        s.buffer.write_str(self);
    }
}

impl Decode for String {
    fn decode(s: &mut Serializer) -> Result<Self, DecodeError> {
        Ok(s.buffer.read_str()?)
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, s: &mut Serializer) {
        s.buffer.write_var_u64(self.len() as u64);
        for item in self {
            item.encode(s);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(s: &mut Serializer) -> Result<Self, DecodeError> {
        let count = s.buffer.read_var_u64()? as usize;
        let mut out = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            out.push(T::decode(s)?);
        }
        Ok(out)
    }
}

impl<T: Encode + Eq + std::hash::Hash> Encode for HashSet<T> {
    fn encode(&self, s: &mut Serializer) {
        s.buffer.write_var_u64(self.len() as u64);
        for item in self {
            item.encode(s);
        }
    }
}

impl<T: Decode + Eq + std::hash::Hash> Decode for HashSet<T> {
    fn decode(s: &mut Serializer) -> Result<Self, DecodeError> {
        let count = s.buffer.read_var_u64()? as usize;
        let mut out = HashSet::with_capacity(count.min(4096));
        for _ in 0..count {
            out.insert(T::decode(s)?);
        }
        Ok(out)
    }
}

impl<K: Encode, V: Encode> Encode for HashMap<K, V> {
    fn encode(&self, s: &mut Serializer) {
        s.buffer.write_var_u64(self.len() as u64);
        for (k, v) in self {
            k.encode(s);
            v.encode(s);
        }
    }
}

impl<K: Decode + Eq + std::hash::Hash, V: Decode> Decode for HashMap<K, V> {
    fn decode(s: &mut Serializer) -> Result<Self, DecodeError> {
        let count = s.buffer.read_var_u64()? as usize;
        let mut out = HashMap::with_capacity(count.min(4096));
        for _ in 0..count {
            let k = K::decode(s)?;
            let v = V::decode(s)?;
            out.insert(k, v);
        }
        Ok(out)
    }
}

impl<K: Encode, V: Encode> Encode for BTreeMap<K, V> {
    fn encode(&self, s: &mut Serializer) {
        s.buffer.write_var_u64(self.len() as u64);
        for (k, v) in self {
            k.encode(s);
            v.encode(s);
        }
    }
}

impl<K: Decode + Ord, V: Decode> Decode for BTreeMap<K, V> {
    fn decode(s: &mut Serializer) -> Result<Self, DecodeError> {
        let count = s.buffer.read_var_u64()? as usize;
        let mut out = BTreeMap::new();
        for _ in 0..count {
            let k = K::decode(s)?;
            let v = V::decode(s)?;
            out.insert(k, v);
        }
        Ok(out)
    }
}

macro_rules! impl_tuple {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Encode),+> Encode for ($($name,)+) {
            fn encode(&self, s: &mut Serializer) {
                $( self.$idx.encode(s); )+
            }
        }

        impl<$($name: Decode),+> Decode for ($($name,)+) {
            fn decode(s: &mut Serializer) -> Result<Self, DecodeError> {
                Ok(( $( $name::decode(s)?, )+ ))
            }
        }
    };
}

impl_tuple!(A: 0);
impl_tuple!(A: 0, B: 1);
impl_tuple!(A: 0, B: 1, C: 2);
impl_tuple!(A: 0, B: 1, C: 2, D: 3);
impl_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn round_trip<T: Encode + Decode + PartialEq + std::fmt::Debug>(value: T) {
        let mut s = Serializer::new();
        s.write(&value);
        s.reset();
        assert_eq!(s.read::<T>().unwrap(), value);
        assert_eq!(s.remaining(), 0, "trailing bytes after decode");
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(true);
        round_trip(false);
        round_trip(0xA5u8);
        round_trip(-7i8);
        round_trip(54321u16);
        round_trip(0xDEAD_BEEFu32);
        round_trip(u64::MAX);
        round_trip(-123_456i32);
        round_trip(i64::MIN);
        round_trip(2.5f32);
        round_trip(std::f64::consts::E);
        round_trip(String::from("over the wire"));
        round_trip(String::new());
    }

    #[test]
    fn containers_round_trip() {
        round_trip(vec![1u32, 2, 3, 4, 5]);
        round_trip(Vec::<String>::new());
        round_trip(HashMap::from([
            (String::from("a"), 1i32),
            (String::from("b"), -2),
        ]));
        round_trip(BTreeMap::from([(1u32, String::from("one"))]));
        round_trip(HashSet::from([7u64, 8, 9]));
    }

    #[test]
    fn tuples_concatenate() {
        round_trip((123i32, 321i32));
        round_trip((String::from("echo"), true, 9u64));
        // A tuple is the concatenation of its fields: decode piecewise.
        let mut s = Serializer::new();
        s.write(&(String::from("add"), (1i32, 2i32)));
        s.reset();
        let name: String = s.read().unwrap();
        let args: (i32, i32) = s.read().unwrap();
        assert_eq!(name, "add");
        assert_eq!(args, (1, 2));
    }

    #[test]
    fn bad_bool_is_rejected() {
        let mut s = Serializer::from_bytes(&[7]);
        assert!(matches!(s.read::<bool>(), Err(DecodeError::InvalidValue)));
    }

    #[test]
    fn truncated_input_is_an_underflow() {
        let mut s = Serializer::new();
        s.write(&String::from("hello"));
        let bytes = {
            s.reset();
            s.to_bytes()
        };
        let mut short = Serializer::from_bytes(&bytes[..bytes.len() - 2]);
        assert!(matches!(
            short.read::<String>(),
            Err(DecodeError::Buffer(ByteArrayError::Underflow { .. }))
        ));
    }
}
