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

//! Byte layout of spilled tuples.
//!
//! A spill file is a sequence of records, each a little-endian `u32` payload
//! length followed by the payload. A payload holds a `u16` column count and
//! then one value per column: a type tag, type parameters (the time zone of
//! timestamps), a validity byte and, for valid values, the value itself. The
//! layout is private to the process that writes it.
//!
//! Types without a hand-written encoding are written as a one-row Arrow IPC
//! stream.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use datafusion::common::ScalarValue;

use crate::errors::{JoinError, JoinResult};
use crate::execution::tuple::Tuple;

/// Bytes of the length prefix in front of every record.
pub const RECORD_HEADER_LEN: usize = 4;

#[derive(Clone, Copy)]
enum ValueTypeId {
    Null = 0,
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Utf8,
    LargeUtf8,
    Binary,
    LargeBinary,
    Date32,
    Date64,
    TimestampSecond,
    TimestampMillisecond,
    TimestampMicrosecond,
    TimestampNanosecond,
    Utf8View,
    BinaryView,
    FixedSizeBinary,
    Decimal128,
    Ipc,
}

impl ValueTypeId {
    const ALL: [ValueTypeId; 27] = [
        ValueTypeId::Null,
        ValueTypeId::Boolean,
        ValueTypeId::Int8,
        ValueTypeId::Int16,
        ValueTypeId::Int32,
        ValueTypeId::Int64,
        ValueTypeId::UInt8,
        ValueTypeId::UInt16,
        ValueTypeId::UInt32,
        ValueTypeId::UInt64,
        ValueTypeId::Float32,
        ValueTypeId::Float64,
        ValueTypeId::Utf8,
        ValueTypeId::LargeUtf8,
        ValueTypeId::Binary,
        ValueTypeId::LargeBinary,
        ValueTypeId::Date32,
        ValueTypeId::Date64,
        ValueTypeId::TimestampSecond,
        ValueTypeId::TimestampMillisecond,
        ValueTypeId::TimestampMicrosecond,
        ValueTypeId::TimestampNanosecond,
        ValueTypeId::Utf8View,
        ValueTypeId::BinaryView,
        ValueTypeId::FixedSizeBinary,
        ValueTypeId::Decimal128,
        ValueTypeId::Ipc,
    ];

    fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }
}

/// Whether values of `data_type` have a hand-written encoding.
pub fn fast_codec_supports_type(data_type: &DataType) -> bool {
    match data_type {
        DataType::Null
        | DataType::Boolean
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
        | DataType::Utf8
        | DataType::LargeUtf8
        | DataType::Utf8View
        | DataType::Binary
        | DataType::LargeBinary
        | DataType::BinaryView
        | DataType::FixedSizeBinary(_)
        | DataType::Date32
        | DataType::Date64
        | DataType::Decimal128(_, _) => true,
        DataType::Timestamp(unit, _) => matches!(
            unit,
            TimeUnit::Second | TimeUnit::Millisecond | TimeUnit::Microsecond | TimeUnit::Nanosecond
        ),
        _ => false,
    }
}

/// Checks that values of `data_type` survive a trip through a spill file.
pub fn check_spillable(data_type: &DataType) -> JoinResult<()> {
    let null = ScalarValue::try_from(data_type).map_err(|e| {
        JoinError::Config(format!("Cannot spill values of type {data_type}: {e}"))
    })?;
    let mut out = Vec::new();
    encode_value(&null, &mut out)
        .and_then(|_| PayloadReader::new(&out).read_value())
        .map_err(|e| JoinError::Config(format!("Cannot spill values of type {data_type}: {e}")))?;
    Ok(())
}

/// Size of the payload [`TupleWriter`] produces for `tuple`, without encoding
/// it. Exact for the hand-written encodings and an estimate for IPC values.
pub fn encoded_len(tuple: &Tuple) -> usize {
    2 + tuple.iter().map(encoded_value_len).sum::<usize>()
}

fn encoded_value_len(value: &ScalarValue) -> usize {
    let params = match value {
        ScalarValue::Null => return 1,
        ScalarValue::TimestampSecond(_, tz)
        | ScalarValue::TimestampMillisecond(_, tz)
        | ScalarValue::TimestampMicrosecond(_, tz)
        | ScalarValue::TimestampNanosecond(_, tz) => 1 + tz.as_ref().map_or(0, |tz| 4 + tz.len()),
        ScalarValue::FixedSizeBinary(..) => 4,
        ScalarValue::Decimal128(..) => 2,
        _ => 0,
    };
    let payload = match value {
        v if v.is_null() => 0,
        ScalarValue::Boolean(_) | ScalarValue::Int8(_) | ScalarValue::UInt8(_) => 1,
        ScalarValue::Int16(_) | ScalarValue::UInt16(_) => 2,
        ScalarValue::Int32(_)
        | ScalarValue::UInt32(_)
        | ScalarValue::Float32(_)
        | ScalarValue::Date32(_) => 4,
        ScalarValue::Int64(_)
        | ScalarValue::UInt64(_)
        | ScalarValue::Float64(_)
        | ScalarValue::Date64(_)
        | ScalarValue::TimestampSecond(..)
        | ScalarValue::TimestampMillisecond(..)
        | ScalarValue::TimestampMicrosecond(..)
        | ScalarValue::TimestampNanosecond(..) => 8,
        ScalarValue::Utf8(Some(s))
        | ScalarValue::LargeUtf8(Some(s))
        | ScalarValue::Utf8View(Some(s)) => 4 + s.len(),
        ScalarValue::Binary(Some(b))
        | ScalarValue::LargeBinary(Some(b))
        | ScalarValue::BinaryView(Some(b)) => 4 + b.len(),
        ScalarValue::FixedSizeBinary(_, Some(b)) => 4 + b.len(),
        ScalarValue::Decimal128(..) => 16,
        other => 4 + other.size(),
    };
    2 + params + payload
}

/// Appends length-prefixed tuple records to `W`.
pub struct TupleWriter<W: Write> {
    inner: W,
    scratch: Vec<u8>,
}

impl<W: Write> TupleWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            scratch: Vec::new(),
        }
    }

    /// Writes one record and returns the number of bytes it occupies,
    /// length prefix included.
    pub fn write_tuple(&mut self, tuple: &Tuple) -> JoinResult<usize> {
        self.scratch.clear();
        encode_tuple(tuple, &mut self.scratch)?;
        let len = u32::try_from(self.scratch.len()).map_err(|_| {
            JoinError::Execution(format!(
                "Tuple of {} bytes is too large to spill",
                self.scratch.len()
            ))
        })?;
        self.inner.write_all(&len.to_le_bytes())?;
        self.inner.write_all(&self.scratch)?;
        Ok(RECORD_HEADER_LEN + self.scratch.len())
    }

    pub fn flush(&mut self) -> JoinResult<()> {
        self.inner.flush()?;
        Ok(())
    }
}

/// Reads length-prefixed tuple records back from `R`.
pub struct TupleReader<R: Read> {
    inner: R,
    payload: Vec<u8>,
}

impl<R: Read> TupleReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            payload: Vec::new(),
        }
    }

    /// Returns `None` at a clean end of input. A partial header or payload
    /// is a corrupted record.
    pub fn read_tuple(&mut self) -> JoinResult<Option<Tuple>> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        let read = read_fully(&mut self.inner, &mut header)?;
        if read == 0 {
            return Ok(None);
        }
        if read < RECORD_HEADER_LEN {
            return Err(JoinError::CorruptedSpill(format!(
                "record header truncated after {read} bytes"
            )));
        }
        let len = u32::from_le_bytes(header) as usize;
        self.payload.clear();
        (&mut self.inner)
            .take(len as u64)
            .read_to_end(&mut self.payload)?;
        if self.payload.len() != len {
            return Err(JoinError::CorruptedSpill(format!(
                "expected a {len} byte record but only {} bytes remain",
                self.payload.len()
            )));
        }
        PayloadReader::new(&self.payload).read_tuple().map(Some)
    }
}

fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> JoinResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

pub fn encode_tuple(tuple: &Tuple, out: &mut Vec<u8>) -> JoinResult<()> {
    let columns = u16::try_from(tuple.len()).map_err(|_| {
        JoinError::Execution(format!("Cannot spill a row of {} columns", tuple.len()))
    })?;
    out.extend_from_slice(&columns.to_le_bytes());
    for value in tuple.iter() {
        encode_value(value, out)?;
    }
    Ok(())
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> JoinResult<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| JoinError::Execution("Value is too large to spill".to_string()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_time_zone(out: &mut Vec<u8>, tz: &Option<Arc<str>>) -> JoinResult<()> {
    match tz {
        Some(tz) => {
            out.push(1);
            put_bytes(out, tz.as_bytes())
        }
        None => {
            out.push(0);
            Ok(())
        }
    }
}

fn put_fixed<const N: usize>(out: &mut Vec<u8>, tag: ValueTypeId, value: Option<[u8; N]>) {
    out.push(tag as u8);
    put_validity_and_value(out, value.as_ref().map(|v| v.as_slice()));
}

fn put_validity_and_value(out: &mut Vec<u8>, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            out.push(1);
            out.extend_from_slice(bytes);
        }
        None => out.push(0),
    }
}

fn put_variable(out: &mut Vec<u8>, tag: ValueTypeId, value: Option<&[u8]>) -> JoinResult<()> {
    out.push(tag as u8);
    match value {
        Some(bytes) => {
            out.push(1);
            put_bytes(out, bytes)
        }
        None => {
            out.push(0);
            Ok(())
        }
    }
}

fn put_timestamp(
    out: &mut Vec<u8>,
    tag: ValueTypeId,
    value: &Option<i64>,
    tz: &Option<Arc<str>>,
) -> JoinResult<()> {
    out.push(tag as u8);
    put_time_zone(out, tz)?;
    put_validity_and_value(out, value.map(|v| v.to_le_bytes()).as_ref().map(|v| v.as_slice()));
    Ok(())
}

fn encode_value(value: &ScalarValue, out: &mut Vec<u8>) -> JoinResult<()> {
    use ValueTypeId as Id;
    match value {
        ScalarValue::Null => out.push(Id::Null as u8),
        ScalarValue::Boolean(v) => put_fixed(out, Id::Boolean, v.map(|v| [v as u8])),
        ScalarValue::Int8(v) => put_fixed(out, Id::Int8, v.map(i8::to_le_bytes)),
        ScalarValue::Int16(v) => put_fixed(out, Id::Int16, v.map(i16::to_le_bytes)),
        ScalarValue::Int32(v) => put_fixed(out, Id::Int32, v.map(i32::to_le_bytes)),
        ScalarValue::Int64(v) => put_fixed(out, Id::Int64, v.map(i64::to_le_bytes)),
        ScalarValue::UInt8(v) => put_fixed(out, Id::UInt8, v.map(u8::to_le_bytes)),
        ScalarValue::UInt16(v) => put_fixed(out, Id::UInt16, v.map(u16::to_le_bytes)),
        ScalarValue::UInt32(v) => put_fixed(out, Id::UInt32, v.map(u32::to_le_bytes)),
        ScalarValue::UInt64(v) => put_fixed(out, Id::UInt64, v.map(u64::to_le_bytes)),
        ScalarValue::Float32(v) => put_fixed(out, Id::Float32, v.map(f32::to_le_bytes)),
        ScalarValue::Float64(v) => put_fixed(out, Id::Float64, v.map(f64::to_le_bytes)),
        ScalarValue::Date32(v) => put_fixed(out, Id::Date32, v.map(i32::to_le_bytes)),
        ScalarValue::Date64(v) => put_fixed(out, Id::Date64, v.map(i64::to_le_bytes)),
        ScalarValue::Utf8(v) => put_variable(out, Id::Utf8, v.as_ref().map(|s| s.as_bytes()))?,
        ScalarValue::LargeUtf8(v) => {
            put_variable(out, Id::LargeUtf8, v.as_ref().map(|s| s.as_bytes()))?
        }
        ScalarValue::Binary(v) => put_variable(out, Id::Binary, v.as_deref())?,
        ScalarValue::LargeBinary(v) => put_variable(out, Id::LargeBinary, v.as_deref())?,
        ScalarValue::TimestampSecond(v, tz) => put_timestamp(out, Id::TimestampSecond, v, tz)?,
        ScalarValue::TimestampMillisecond(v, tz) => {
            put_timestamp(out, Id::TimestampMillisecond, v, tz)?
        }
        ScalarValue::TimestampMicrosecond(v, tz) => {
            put_timestamp(out, Id::TimestampMicrosecond, v, tz)?
        }
        ScalarValue::TimestampNanosecond(v, tz) => {
            put_timestamp(out, Id::TimestampNanosecond, v, tz)?
        }
        ScalarValue::Utf8View(v) => {
            put_variable(out, Id::Utf8View, v.as_ref().map(|s| s.as_bytes()))?
        }
        ScalarValue::BinaryView(v) => put_variable(out, Id::BinaryView, v.as_deref())?,
        ScalarValue::FixedSizeBinary(width, v) => {
            out.push(Id::FixedSizeBinary as u8);
            out.extend_from_slice(&width.to_le_bytes());
            match v {
                Some(bytes) => {
                    out.push(1);
                    put_bytes(out, bytes)?;
                }
                None => out.push(0),
            }
        }
        ScalarValue::Decimal128(v, precision, scale) => {
            out.push(Id::Decimal128 as u8);
            out.push(*precision);
            out.push(*scale as u8);
            put_validity_and_value(
                out,
                v.map(i128::to_le_bytes).as_ref().map(|v| v.as_slice()),
            );
        }
        other => {
            out.push(Id::Ipc as u8);
            let ipc = encode_ipc(other)?;
            put_bytes(out, &ipc)?;
        }
    }
    Ok(())
}

/// Writes `value` as a one-row IPC stream.
fn encode_ipc(value: &ScalarValue) -> JoinResult<Vec<u8>> {
    let array = value.to_array()?;
    let schema = Arc::new(Schema::new(vec![Field::new(
        "v",
        array.data_type().clone(),
        true,
    )]));
    let batch = RecordBatch::try_new(Arc::clone(&schema), vec![array])?;
    let mut buf = Vec::new();
    let mut writer = StreamWriter::try_new(&mut buf, &schema)?;
    writer.write(&batch)?;
    writer.finish()?;
    drop(writer);
    Ok(buf)
}

fn decode_ipc(bytes: &[u8]) -> JoinResult<ScalarValue> {
    let mut reader = StreamReader::try_new(bytes, None)?;
    let batch = reader
        .next()
        .transpose()?
        .ok_or_else(|| JoinError::CorruptedSpill("empty IPC value".to_string()))?;
    let column: &ArrayRef = batch
        .columns()
        .first()
        .filter(|column| column.len() == 1)
        .ok_or_else(|| JoinError::CorruptedSpill("IPC value is not a single row".to_string()))?;
    Ok(ScalarValue::try_from_array(column, 0)?)
}

/// Decodes one record payload.
pub struct PayloadReader<'a> {
    input: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, offset: 0 }
    }

    pub fn read_tuple(&mut self) -> JoinResult<Tuple> {
        let columns = u16::from_le_bytes(self.read_array()?) as usize;
        let mut values = Vec::with_capacity(columns);
        for _ in 0..columns {
            values.push(self.read_value()?);
        }
        if self.offset != self.input.len() {
            return Err(JoinError::CorruptedSpill(format!(
                "{} trailing bytes after the last column",
                self.input.len() - self.offset
            )));
        }
        Ok(Tuple::new(values))
    }

    fn take(&mut self, len: usize) -> JoinResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.input.len())
            .ok_or_else(|| {
                JoinError::CorruptedSpill(format!(
                    "value of {len} bytes at offset {} overruns the record",
                    self.offset
                ))
            })?;
        let bytes = &self.input[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> JoinResult<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn read_u8(&mut self) -> JoinResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_bytes(&mut self) -> JoinResult<&'a [u8]> {
        let len = u32::from_le_bytes(self.read_array()?) as usize;
        self.take(len)
    }

    fn read_string(&mut self) -> JoinResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| JoinError::CorruptedSpill(format!("invalid UTF-8 in string value: {e}")))
    }

    fn read_fixed<const N: usize>(&mut self) -> JoinResult<Option<[u8; N]>> {
        if self.read_u8()? == 0 {
            Ok(None)
        } else {
            self.read_array().map(Some)
        }
    }

    fn read_time_zone(&mut self) -> JoinResult<Option<Arc<str>>> {
        if self.read_u8()? == 0 {
            Ok(None)
        } else {
            Ok(Some(Arc::from(self.read_string()?)))
        }
    }

    fn read_value(&mut self) -> JoinResult<ScalarValue> {
        use ValueTypeId as Id;
        let tag = self.read_u8()?;
        let id = ValueTypeId::from_tag(tag)
            .ok_or_else(|| JoinError::CorruptedSpill(format!("unknown value tag {tag}")))?;
        let value = match id {
            Id::Null => ScalarValue::Null,
            Id::Boolean => ScalarValue::Boolean(self.read_fixed::<1>()?.map(|b| b[0] != 0)),
            Id::Int8 => ScalarValue::Int8(self.read_fixed()?.map(i8::from_le_bytes)),
            Id::Int16 => ScalarValue::Int16(self.read_fixed()?.map(i16::from_le_bytes)),
            Id::Int32 => ScalarValue::Int32(self.read_fixed()?.map(i32::from_le_bytes)),
            Id::Int64 => ScalarValue::Int64(self.read_fixed()?.map(i64::from_le_bytes)),
            Id::UInt8 => ScalarValue::UInt8(self.read_fixed()?.map(u8::from_le_bytes)),
            Id::UInt16 => ScalarValue::UInt16(self.read_fixed()?.map(u16::from_le_bytes)),
            Id::UInt32 => ScalarValue::UInt32(self.read_fixed()?.map(u32::from_le_bytes)),
            Id::UInt64 => ScalarValue::UInt64(self.read_fixed()?.map(u64::from_le_bytes)),
            Id::Float32 => ScalarValue::Float32(self.read_fixed()?.map(f32::from_le_bytes)),
            Id::Float64 => ScalarValue::Float64(self.read_fixed()?.map(f64::from_le_bytes)),
            Id::Date32 => ScalarValue::Date32(self.read_fixed()?.map(i32::from_le_bytes)),
            Id::Date64 => ScalarValue::Date64(self.read_fixed()?.map(i64::from_le_bytes)),
            Id::Utf8 => ScalarValue::Utf8(self.read_optional_string()?),
            Id::LargeUtf8 => ScalarValue::LargeUtf8(self.read_optional_string()?),
            Id::Binary => ScalarValue::Binary(self.read_optional_bytes()?),
            Id::LargeBinary => ScalarValue::LargeBinary(self.read_optional_bytes()?),
            Id::TimestampSecond => {
                let tz = self.read_time_zone()?;
                ScalarValue::TimestampSecond(self.read_fixed()?.map(i64::from_le_bytes), tz)
            }
            Id::TimestampMillisecond => {
                let tz = self.read_time_zone()?;
                ScalarValue::TimestampMillisecond(self.read_fixed()?.map(i64::from_le_bytes), tz)
            }
            Id::TimestampMicrosecond => {
                let tz = self.read_time_zone()?;
                ScalarValue::TimestampMicrosecond(self.read_fixed()?.map(i64::from_le_bytes), tz)
            }
            Id::TimestampNanosecond => {
                let tz = self.read_time_zone()?;
                ScalarValue::TimestampNanosecond(self.read_fixed()?.map(i64::from_le_bytes), tz)
            }
            Id::Utf8View => ScalarValue::Utf8View(self.read_optional_string()?),
            Id::BinaryView => ScalarValue::BinaryView(self.read_optional_bytes()?),
            Id::FixedSizeBinary => {
                let width = i32::from_le_bytes(self.read_array()?);
                ScalarValue::FixedSizeBinary(width, self.read_optional_bytes()?)
            }
            Id::Decimal128 => {
                let precision = self.read_u8()?;
                let scale = self.read_u8()? as i8;
                ScalarValue::Decimal128(
                    self.read_fixed()?.map(i128::from_le_bytes),
                    precision,
                    scale,
                )
            }
            Id::Ipc => decode_ipc(self.read_bytes()?)?,
        };
        Ok(value)
    }

    fn read_optional_string(&mut self) -> JoinResult<Option<String>> {
        if self.read_u8()? == 0 {
            Ok(None)
        } else {
            self.read_string().map(Some)
        }
    }

    fn read_optional_bytes(&mut self) -> JoinResult<Option<Vec<u8>>> {
        if self.read_u8()? == 0 {
            Ok(None)
        } else {
            Ok(Some(self.read_bytes()?.to_vec()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rows() -> Vec<Tuple> {
        vec![
            Tuple::new(vec![
                ScalarValue::Int64(Some(-5)),
                ScalarValue::Utf8(Some("spill".to_string())),
                ScalarValue::Float64(None),
            ]),
            Tuple::new(vec![
                ScalarValue::Boolean(Some(true)),
                ScalarValue::Binary(Some(vec![0, 1, 2])),
                ScalarValue::TimestampMicrosecond(Some(1_700_000_000), Some(Arc::from("UTC"))),
                ScalarValue::Date32(None),
                ScalarValue::Null,
            ]),
            Tuple::new(vec![]),
        ]
    }

    #[test]
    fn records_read_back_in_order() -> JoinResult<()> {
        let rows = sample_rows();
        let mut buf = Vec::new();
        let mut writer = TupleWriter::new(&mut buf);
        let mut written = 0;
        for row in &rows {
            let n = writer.write_tuple(row)?;
            assert_eq!(n, RECORD_HEADER_LEN + encoded_len(row));
            written += n;
        }
        writer.flush()?;
        assert_eq!(written, buf.len());

        let mut reader = TupleReader::new(buf.as_slice());
        for row in &rows {
            assert_eq!(reader.read_tuple()?.as_ref(), Some(row));
        }
        assert!(reader.read_tuple()?.is_none());
        Ok(())
    }

    #[test]
    fn truncated_records_are_corrupt() -> JoinResult<()> {
        let mut buf = Vec::new();
        TupleWriter::new(&mut buf).write_tuple(&sample_rows()[0])?;

        let short_payload = &buf[..buf.len() - 1];
        let err = TupleReader::new(short_payload).read_tuple().unwrap_err();
        assert!(matches!(err, JoinError::CorruptedSpill(_)), "{err}");

        let short_header = &buf[..2];
        let err = TupleReader::new(short_header).read_tuple().unwrap_err();
        assert!(matches!(err, JoinError::CorruptedSpill(_)), "{err}");
        Ok(())
    }

    #[test]
    fn view_decimal_and_fixed_width_values_read_back() -> JoinResult<()> {
        let row = Tuple::new(vec![
            ScalarValue::Utf8View(Some("a view string".to_string())),
            ScalarValue::BinaryView(Some(vec![9, 8, 7])),
            ScalarValue::FixedSizeBinary(3, Some(vec![1, 2, 3])),
            ScalarValue::FixedSizeBinary(3, None),
            ScalarValue::Decimal128(Some(-12_345), 10, 2),
            ScalarValue::Decimal128(None, 38, 0),
            ScalarValue::Utf8View(None),
        ]);
        let mut buf = Vec::new();
        let n = TupleWriter::new(&mut buf).write_tuple(&row)?;
        assert_eq!(n, RECORD_HEADER_LEN + encoded_len(&row));

        let mut reader = TupleReader::new(buf.as_slice());
        assert_eq!(reader.read_tuple()?, Some(row));
        Ok(())
    }

    #[test]
    fn other_values_travel_as_ipc() -> JoinResult<()> {
        let list = ScalarValue::List(ScalarValue::new_list_nullable(
            &[ScalarValue::Int32(Some(1)), ScalarValue::Int32(None)],
            &DataType::Int32,
        ));
        let row = Tuple::new(vec![
            ScalarValue::Int64(Some(7)),
            ScalarValue::Decimal256(None, 40, 4),
            list,
            ScalarValue::IntervalMonthDayNano(None),
        ]);
        let mut buf = Vec::new();
        TupleWriter::new(&mut buf).write_tuple(&row)?;

        let mut reader = TupleReader::new(buf.as_slice());
        assert_eq!(reader.read_tuple()?, Some(row));
        assert!(reader.read_tuple()?.is_none());
        Ok(())
    }

    #[test]
    fn spillable_types() {
        for data_type in [
            DataType::Utf8View,
            DataType::BinaryView,
            DataType::FixedSizeBinary(16),
            DataType::Decimal128(10, 2),
            DataType::Decimal256(40, 4),
            DataType::Interval(arrow::datatypes::IntervalUnit::MonthDayNano),
            DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))),
        ] {
            assert!(check_spillable(&data_type).is_ok(), "{data_type}");
        }
        assert!(fast_codec_supports_type(&DataType::Utf8View));
        assert!(!fast_codec_supports_type(&DataType::Decimal256(40, 4)));
    }
}
