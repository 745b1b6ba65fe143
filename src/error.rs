// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for runtime operations.

use std::fmt;
use thiserror::Error;

/// Coarse status class of an operation, shared by every entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalStatus {
    Success,
    InvalidParam,
    NotFound,
    OutOfMemory,
    OutOfRange,
    TimedOut,
    Failure,
    NotImplemented,
}

impl ScalStatus {
    /// Numeric status code, stable across releases.
    pub const fn code(self) -> i32 {
        match self {
            ScalStatus::Success => 0,
            ScalStatus::InvalidParam => 1,
            ScalStatus::NotFound => 2,
            ScalStatus::OutOfMemory => 3,
            ScalStatus::OutOfRange => 4,
            ScalStatus::TimedOut => 5,
            ScalStatus::Failure => 6,
            ScalStatus::NotImplemented => 7,
        }
    }
}

impl fmt::Display for ScalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalStatus::Success => "SUCCESS",
            ScalStatus::InvalidParam => "INVALID_PARAM",
            ScalStatus::NotFound => "NOT_FOUND",
            ScalStatus::OutOfMemory => "OUT_OF_MEMORY",
            ScalStatus::OutOfRange => "OUT_OF_RANGE",
            ScalStatus::TimedOut => "TIMED_OUT",
            ScalStatus::Failure => "FAILURE",
            ScalStatus::NotImplemented => "NOT_IMPLEMENTED",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during runtime operations.
#[derive(Debug, Error)]
pub enum ScalError {
    /// Invalid argument provided.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// The loaded topology is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Named resource does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Memory pool could not satisfy an allocation.
    #[error(
        "pool '{pool}' out of memory: requested {size} bytes aligned to {alignment}, \
         {free} of {total} bytes free"
    )]
    OutOfMemory {
        pool: String,
        size: u64,
        alignment: u64,
        total: u64,
        free: u64,
    },

    /// Sync object or monitor pool has fewer entries left than requested.
    #[error("{kind} pool '{pool}' exhausted: requested {requested}, {available} left")]
    PoolExhausted {
        kind: &'static str,
        pool: String,
        requested: u32,
        available: u32,
    },

    /// Sync resource pool range collides with pools of the same sync manager.
    #[error("{kind} pool '{pool}' range [{base}, {end}) overlaps {others}")]
    PoolOverlap {
        kind: &'static str,
        pool: String,
        base: u32,
        end: u32,
        others: String,
    },

    /// Sync manager hardware capacity exceeded.
    #[error("sync manager {sm} out of {resource}: capacity {capacity}")]
    CapacityExceeded {
        sm: u32,
        resource: &'static str,
        capacity: u32,
    },

    /// Wait deadline expired.
    #[error("timed out: {0}")]
    TimedOut(String),

    /// Driver or hardware failure.
    #[error("failure: {0}")]
    Failure(String),

    /// Operation has no implementation on this runtime.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScalError {
    /// Status class of this error.
    pub fn status(&self) -> ScalStatus {
        match self {
            ScalError::InvalidParam(_) | ScalError::InvalidConfig(_) => ScalStatus::InvalidParam,
            ScalError::NotFound { .. } => ScalStatus::NotFound,
            ScalError::OutOfMemory { .. } => ScalStatus::OutOfMemory,
            ScalError::PoolExhausted { .. }
            | ScalError::PoolOverlap { .. }
            | ScalError::CapacityExceeded { .. } => ScalStatus::OutOfRange,
            ScalError::TimedOut(_) => ScalStatus::TimedOut,
            ScalError::Failure(_) | ScalError::Io(_) => ScalStatus::Failure,
            ScalError::NotImplemented(_) => ScalStatus::NotImplemented,
        }
    }

    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        ScalError::NotFound {
            kind,
            name: name.into(),
        }
    }
}

/// Result type alias for runtime operations.
pub type ScalResult<T> = Result<T, ScalError>;

/// Status of a result, `Success` for `Ok`.
pub fn status_of<T>(result: &ScalResult<T>) -> ScalStatus {
    match result {
        Ok(_) => ScalStatus::Success,
        Err(e) => e.status(),
    }
}
