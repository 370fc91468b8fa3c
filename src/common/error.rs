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
use std::fmt;

/// Failure classes surfaced by a merge. Exactly one of these reaches the
/// caller; the merge never retries internally and never returns partial rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeErrorKind {
    /// Orchestration bug (missing or undersized reservation, use after
    /// release). Not a user or data error.
    Defensive,
    /// Buffer acquisition timed out against the pool, or a grouper could not
    /// make progress within its memory/disk limits.
    ResourceExhausted,
    /// The shared wall-clock deadline elapsed.
    Timeout,
    /// The query was cancelled from outside.
    Interrupted,
    /// Unexpected failure from a leaf runner or a worker (including panics).
    Runtime,
}

impl MergeErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            MergeErrorKind::Defensive => "defensive",
            MergeErrorKind::ResourceExhausted => "resource exhausted",
            MergeErrorKind::Timeout => "timeout",
            MergeErrorKind::Interrupted => "interrupted",
            MergeErrorKind::Runtime => "runtime",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeError {
    pub kind: MergeErrorKind,
    pub message: String,
}

impl MergeError {
    pub fn defensive(message: impl Into<String>) -> Self {
        Self {
            kind: MergeErrorKind::Defensive,
            message: message.into(),
        }
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self {
            kind: MergeErrorKind::ResourceExhausted,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: MergeErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self {
            kind: MergeErrorKind::Interrupted,
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: MergeErrorKind::Runtime,
            message: message.into(),
        }
    }
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for MergeError {}
