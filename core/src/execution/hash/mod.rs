// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Seeded, order-independent hashing of a tuple's join keys.
//!
//! The root level (seed 0) hashes short fixed-width values with a cheap
//! complement of their raw bytes. Every deeper recursion level uses MurmurHash3
//! seeded with its level so that skew which defeated one level does not repeat
//! in the next.

pub mod murmur3;

use arrow::datatypes::DataType;
use datafusion::common::ScalarValue;

use crate::errors::{JoinError, JoinResult};
use crate::execution::tuple::Tuple;

/// Canonical little-endian bytes of a non-null key value.
enum KeyBytes<'a> {
    Inline([u8; 8], usize),
    Slice(&'a [u8]),
}

impl KeyBytes<'_> {
    fn fixed<const N: usize>(bytes: [u8; N]) -> Self {
        let mut buf = [0u8; 8];
        buf[..N].copy_from_slice(&bytes);
        KeyBytes::Inline(buf, N)
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            KeyBytes::Inline(buf, len) => &buf[..*len],
            KeyBytes::Slice(bytes) => bytes,
        }
    }
}

fn key_bytes(value: &ScalarValue) -> JoinResult<KeyBytes<'_>> {
    let bytes = match value {
        ScalarValue::Boolean(Some(v)) => KeyBytes::fixed([*v as u8]),
        ScalarValue::Int8(Some(v)) => KeyBytes::fixed(v.to_le_bytes()),
        ScalarValue::Int16(Some(v)) => KeyBytes::fixed(v.to_le_bytes()),
        ScalarValue::Int32(Some(v)) | ScalarValue::Date32(Some(v)) => {
            KeyBytes::fixed(v.to_le_bytes())
        }
        ScalarValue::Int64(Some(v))
        | ScalarValue::Date64(Some(v))
        | ScalarValue::TimestampSecond(Some(v), _)
        | ScalarValue::TimestampMillisecond(Some(v), _)
        | ScalarValue::TimestampMicrosecond(Some(v), _)
        | ScalarValue::TimestampNanosecond(Some(v), _) => KeyBytes::fixed(v.to_le_bytes()),
        ScalarValue::UInt8(Some(v)) => KeyBytes::fixed(v.to_le_bytes()),
        ScalarValue::UInt16(Some(v)) => KeyBytes::fixed(v.to_le_bytes()),
        ScalarValue::UInt32(Some(v)) => KeyBytes::fixed(v.to_le_bytes()),
        ScalarValue::UInt64(Some(v)) => KeyBytes::fixed(v.to_le_bytes()),
        // -0.0 and 0.0 hash alike
        ScalarValue::Float32(Some(v)) => KeyBytes::fixed((v + 0.0).to_bits().to_le_bytes()),
        ScalarValue::Float64(Some(v)) => KeyBytes::fixed((v + 0.0).to_bits().to_le_bytes()),
        ScalarValue::Utf8(Some(v))
        | ScalarValue::LargeUtf8(Some(v))
        | ScalarValue::Utf8View(Some(v)) => KeyBytes::Slice(v.as_bytes()),
        ScalarValue::Binary(Some(v))
        | ScalarValue::LargeBinary(Some(v))
        | ScalarValue::BinaryView(Some(v))
        | ScalarValue::FixedSizeBinary(_, Some(v)) => KeyBytes::Slice(v),
        other => {
            return Err(JoinError::Execution(format!(
                "Unsupported join key type: {}",
                other.data_type()
            )))
        }
    };
    Ok(bytes)
}

/// Whether values of `data_type` can serve as join keys.
pub fn is_supported_key_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Boolean
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
            | DataType::Date32
            | DataType::Date64
            | DataType::Timestamp(_, _)
            | DataType::Utf8
            | DataType::LargeUtf8
            | DataType::Utf8View
            | DataType::Binary
            | DataType::LargeBinary
            | DataType::BinaryView
            | DataType::FixedSizeBinary(_)
    )
}

/// Hashes one canonical key value.
///
/// With seed 0 values of 1, 2, 4 and 8 bytes take the legacy fast path.
/// Everything else goes through MurmurHash3 with the given seed.
pub fn hash_bytes(bytes: &[u8], seed: u16) -> u32 {
    if seed == 0 {
        match *bytes {
            [b0] => return !(b0 as i8 as i32 as u32),
            [b0, b1] => return !(u16::from_le_bytes([b0, b1]) as u32),
            [b0, b1, b2, b3] => return !u32::from_le_bytes([b0, b1, b2, b3]),
            [b0, b1, b2, b3, b4, b5, b6, b7] => {
                let value = i64::from_le_bytes([b0, b1, b2, b3, b4, b5, b6, b7]);
                let lo = value as u32;
                let hi = (value >> 32) as u32;
                let folded = if value >= 0 { lo ^ hi } else { lo ^ !hi };
                return !folded;
            }
            _ => {}
        }
    }
    murmur3::murmur3_32(bytes, seed as u32)
}

pub fn hash_value(value: &ScalarValue, seed: u16) -> JoinResult<u32> {
    Ok(hash_bytes(key_bytes(value)?.as_slice(), seed))
}

/// Combines the hashes of a fixed list of key columns.
///
/// One sub-join binds the computer with [`HashComputer::begin`] for as long
/// as it hashes with its seed and releases it with [`HashComputer::end`].
#[derive(Debug)]
pub struct HashComputer {
    key_columns: Vec<usize>,
    owner: Option<usize>,
    seed: u16,
}

impl HashComputer {
    pub fn new(key_columns: Vec<usize>) -> Self {
        Self {
            key_columns,
            owner: None,
            seed: 0,
        }
    }

    pub fn begin(&mut self, owner: usize, seed: u16) -> JoinResult<()> {
        match self.owner {
            Some(current) if current != owner => Err(JoinError::ContractViolation(format!(
                "Cannot initialize hash computer for sub-join {owner}: owned by sub-join {current}"
            ))),
            _ => {
                self.owner = Some(owner);
                self.seed = seed;
                Ok(())
            }
        }
    }

    pub fn end(&mut self, owner: usize) -> JoinResult<()> {
        if self.owner != Some(owner) {
            return Err(JoinError::ContractViolation(format!(
                "Cannot cleanup hash computer for sub-join {owner}: owner is {:?}",
                self.owner
            )));
        }
        self.owner = None;
        self.seed = 0;
        Ok(())
    }

    /// Drops any binding, used when the whole join is torn down.
    pub(crate) fn reset(&mut self) {
        self.owner = None;
        self.seed = 0;
    }

    pub fn seed(&self) -> u16 {
        self.seed
    }

    /// Returns the combined hash and whether every key was null.
    pub fn compute(&self, tuple: &Tuple) -> JoinResult<(u32, bool)> {
        if self.owner.is_none() {
            return Err(JoinError::ContractViolation(
                "hash computer used without an owning sub-join".to_string(),
            ));
        }
        let mut combined = 0u32;
        let mut all_null = true;
        for &column in &self.key_columns {
            let value = tuple.get(column).ok_or_else(|| {
                JoinError::Execution(format!(
                    "Join key column {column} is out of range for a row of {} columns",
                    tuple.len()
                ))
            })?;
            if value.is_null() {
                continue;
            }
            all_null = false;
            combined ^= hash_value(value, self.seed)?;
        }
        Ok((combined, all_null))
    }
}
