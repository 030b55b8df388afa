// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Segmented byte buffer with a position cursor, typed codecs and
//! scatter/gather views. See [`ByteArray`].

mod byte_array;

pub use byte_array::*;
