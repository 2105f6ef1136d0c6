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

//! Errors raised by the resilient join engine.

use std::result;

use arrow::error::ArrowError;
use datafusion::common::DataFusionError;

#[derive(thiserror::Error, Debug)]
pub enum JoinError {
    #[error("Configuration Error: {0}")]
    Config(String),

    /// Eviction was requested but nothing could be spilled.
    #[error("Resources exhausted: {0}")]
    ResourcesExhausted(String),

    /// A spill record whose length prefix does not match the bytes on disk.
    #[error("Could not read from temporary file: {0}")]
    CorruptedSpill(String),

    /// Misuse of an engine component, such as rescanning a one-shot source or
    /// acquiring the join evaluator while another sub-join owns it.
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error(transparent)]
    Arrow {
        #[from]
        source: ArrowError,
    },

    #[error(transparent)]
    IO {
        #[from]
        source: std::io::Error,
    },

    #[error("{msg}")]
    DataFusion {
        msg: String,
        #[source]
        source: DataFusionError,
    },
}

impl From<DataFusionError> for JoinError {
    fn from(value: DataFusionError) -> Self {
        JoinError::DataFusion {
            msg: value.message().to_string(),
            source: value,
        }
    }
}

impl From<JoinError> for DataFusionError {
    fn from(value: JoinError) -> Self {
        match value {
            JoinError::DataFusion { source, .. } => source,
            JoinError::IO { source } => DataFusionError::IoError(source),
            JoinError::ResourcesExhausted(msg) => DataFusionError::ResourcesExhausted(msg),
            JoinError::Config(msg) => DataFusionError::Configuration(msg),
            JoinError::ContractViolation(_) => DataFusionError::Internal(value.to_string()),
            _ => DataFusionError::Execution(value.to_string()),
        }
    }
}

pub type JoinResult<T> = result::Result<T, JoinError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datafusion_errors_round_trip() {
        let err: JoinError = DataFusionError::ResourcesExhausted("pool is full".to_string()).into();
        assert!(err.to_string().contains("pool is full"));
        let back: DataFusionError = err.into();
        assert!(matches!(back, DataFusionError::ResourcesExhausted(_)));
    }

    #[test]
    fn engine_errors_map_to_datafusion_categories() {
        let err: DataFusionError =
            JoinError::ContractViolation("rescan of a spilled source".to_string()).into();
        assert!(matches!(err, DataFusionError::Internal(_)));

        let err: DataFusionError = JoinError::CorruptedSpill("short record".to_string()).into();
        match err {
            DataFusionError::Execution(msg) => {
                assert!(msg.contains("Could not read from temporary file"), "{msg}")
            }
            other => panic!("unexpected error {other:?}"),
        }

        let io = std::io::Error::other("disk full");
        let err: DataFusionError = JoinError::from(io).into();
        assert!(matches!(err, DataFusionError::IoError(_)));
    }
}
