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

//! Temporary files backing spilled build and probe tuples.

pub mod codec;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use datafusion::execution::disk_manager::{DiskManager, RefCountedTempFile};
use log::debug;

use crate::errors::{JoinError, JoinResult};
use crate::execution::spill::codec::{TupleReader, TupleWriter, RECORD_HEADER_LEN};
use crate::execution::tuple::{Tuple, ENTRY_MEMORY_OVERHEAD};

/// I/O buffer size for spill file reads and writes.
const SPILL_IO_BUFFER_SIZE: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// SpillFile: append, rewind, read back
// ---------------------------------------------------------------------------

enum SpillFileState {
    Writing(TupleWriter<BufWriter<File>>),
    Reading(TupleReader<BufReader<File>>),
}

/// An append-only file of tuple records. It is written first, then rewound
/// and read sequentially, possibly several times. The file is deleted when
/// the last handle to its [`RefCountedTempFile`] drops.
pub struct SpillFile {
    temp_file: RefCountedTempFile,
    state: SpillFileState,
}

impl SpillFile {
    pub fn try_new(temp_file: RefCountedTempFile) -> JoinResult<Self> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp_file.path())
            .map_err(|e| JoinError::Execution(format!("Failed to open spill file: {e}")))?;
        let writer = TupleWriter::new(BufWriter::with_capacity(SPILL_IO_BUFFER_SIZE, file));
        Ok(Self {
            temp_file,
            state: SpillFileState::Writing(writer),
        })
    }

    /// Appends one tuple and returns the bytes its record occupies on disk.
    pub fn append(&mut self, tuple: &Tuple) -> JoinResult<usize> {
        match &mut self.state {
            SpillFileState::Writing(writer) => {
                writer.write_tuple(tuple)
            }
            SpillFileState::Reading(_) => Err(JoinError::ContractViolation(
                "cannot append to a spill file that has been rewound".to_string(),
            )),
        }
    }

    /// Positions the file at its first record, flushing pending writes.
    pub fn rewind(&mut self) -> JoinResult<()> {
        if let SpillFileState::Writing(writer) = &mut self.state {
            writer.flush()?;
        }
        let file = File::open(self.temp_file.path())
            .map_err(|e| JoinError::Execution(format!("Failed to reopen spill file: {e}")))?;
        self.state = SpillFileState::Reading(TupleReader::new(BufReader::with_capacity(
            SPILL_IO_BUFFER_SIZE,
            file,
        )));
        Ok(())
    }

    pub fn read_next(&mut self) -> JoinResult<Option<Tuple>> {
        match &mut self.state {
            SpillFileState::Reading(reader) => reader.read_tuple(),
            SpillFileState::Writing(_) => Err(JoinError::ContractViolation(
                "spill file must be rewound before it is read".to_string(),
            )),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_file.path()
    }
}

// ---------------------------------------------------------------------------
// SpillWorkSet: the files of one sub-join
// ---------------------------------------------------------------------------

/// Creates the spill files of one sub-join through the runtime's
/// [`DiskManager`] and keeps track of what was created. Each file is owned
/// by the partition it backs, so dropping a sub-join's partitions deletes
/// its files together.
pub struct SpillWorkSet {
    disk_manager: Arc<DiskManager>,
    description: String,
    files_created: usize,
}

impl SpillWorkSet {
    pub fn new(disk_manager: Arc<DiskManager>, description: impl Into<String>) -> Self {
        Self {
            disk_manager,
            description: description.into(),
            files_created: 0,
        }
    }

    pub fn create_file(&mut self) -> JoinResult<SpillFile> {
        let temp_file = self.disk_manager.create_tmp_file(&self.description)?;
        self.files_created += 1;
        debug!(
            "{}: created spill file {} ({} so far)",
            self.description,
            temp_file.path().display(),
            self.files_created
        );
        SpillFile::try_new(temp_file)
    }

    pub fn files_created(&self) -> usize {
        self.files_created
    }
}

// ---------------------------------------------------------------------------
// SpillPartition: one side of one spill index
// ---------------------------------------------------------------------------

/// Tuples of one join side that landed in one spill index, with the
/// footprint they would have back in a hash table.
pub struct SpillPartition {
    file: SpillFile,
    tuple_count: usize,
    memory_size: usize,
}

impl SpillPartition {
    pub fn new(file: SpillFile) -> Self {
        Self {
            file,
            tuple_count: 0,
            memory_size: 0,
        }
    }

    /// Returns the bytes written to disk.
    pub fn append(&mut self, tuple: &Tuple) -> JoinResult<usize> {
        let written = self.file.append(tuple)?;
        self.tuple_count += 1;
        self.memory_size += written - RECORD_HEADER_LEN + ENTRY_MEMORY_OVERHEAD;
        Ok(written)
    }

    pub fn tuple_count(&self) -> usize {
        self.tuple_count
    }

    /// Estimated bytes these tuples take as hash table entries.
    pub fn memory_size(&self) -> usize {
        self.memory_size
    }

    pub fn rewind(&mut self) -> JoinResult<()> {
        self.file.rewind()
    }

    pub fn read_next(&mut self) -> JoinResult<Option<Tuple>> {
        self.file.read_next()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillSide {
    Inner,
    Outer,
}

/// The inner and outer partitions sharing one spill index.
#[derive(Default)]
pub struct SpillPartitionPair {
    pub inner: Option<SpillPartition>,
    pub outer: Option<SpillPartition>,
}

impl SpillPartitionPair {
    pub fn side(&self, side: SpillSide) -> Option<&SpillPartition> {
        match side {
            SpillSide::Inner => self.inner.as_ref(),
            SpillSide::Outer => self.outer.as_ref(),
        }
    }

    pub fn take(&mut self, side: SpillSide) -> Option<SpillPartition> {
        match side {
            SpillSide::Inner => self.inner.take(),
            SpillSide::Outer => self.outer.take(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_none() && self.outer.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::common::ScalarValue;
    use datafusion::execution::runtime_env::RuntimeEnvBuilder;

    fn work_set() -> SpillWorkSet {
        let runtime = RuntimeEnvBuilder::new().build_arc().unwrap();
        SpillWorkSet::new(Arc::clone(&runtime.disk_manager), "resilient join test")
    }

    fn row(k: i64, v: &str) -> Tuple {
        Tuple::new(vec![
            ScalarValue::Int64(Some(k)),
            ScalarValue::Utf8(Some(v.to_string())),
        ])
    }

    #[test]
    fn partition_round_trip_preserves_order() -> JoinResult<()> {
        let mut work_set = work_set();
        let mut partition = SpillPartition::new(work_set.create_file()?);
        let rows: Vec<Tuple> = (0..100).map(|i| row(i, &format!("value-{i}"))).collect();
        for r in &rows {
            partition.append(r)?;
        }
        assert_eq!(partition.tuple_count(), 100);
        assert_eq!(work_set.files_created(), 1);

        partition.rewind()?;
        let mut read = Vec::new();
        while let Some(t) = partition.read_next()? {
            read.push(t);
        }
        assert_eq!(read, rows);
        Ok(())
    }

    #[test]
    fn memory_size_counts_entry_overhead() -> JoinResult<()> {
        let mut partition = SpillPartition::new(work_set().create_file()?);
        let t = row(1, "a");
        let written = partition.append(&t)?;
        assert_eq!(
            partition.memory_size(),
            codec::encoded_len(&t) + ENTRY_MEMORY_OVERHEAD
        );
        assert_eq!(written, codec::encoded_len(&t) + RECORD_HEADER_LEN);
        Ok(())
    }

    #[test]
    fn file_can_be_rewound_repeatedly() -> JoinResult<()> {
        let mut file = work_set().create_file()?;
        file.append(&row(1, "a"))?;
        file.append(&row(2, "b"))?;
        assert!(matches!(
            file.read_next(),
            Err(JoinError::ContractViolation(_))
        ));
        for _ in 0..2 {
            file.rewind()?;
            assert_eq!(file.read_next()?, Some(row(1, "a")));
            assert_eq!(file.read_next()?, Some(row(2, "b")));
            assert_eq!(file.read_next()?, None);
        }
        assert!(matches!(
            file.append(&row(3, "c")),
            Err(JoinError::ContractViolation(_))
        ));
        Ok(())
    }

    #[test]
    fn dropping_a_partition_deletes_its_file() -> JoinResult<()> {
        let partition = SpillPartition::new(work_set().create_file()?);
        let path = partition.file.path().to_path_buf();
        assert!(path.exists());
        drop(partition);
        assert!(!path.exists());
        Ok(())
    }
}
