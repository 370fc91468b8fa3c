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
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::common::error::MergeError;
use crate::common::logging::warn;
use crate::runtime::resource::ResourceClose;

/// Scratch-file storage for one merge stage, capped at a byte quota.
///
/// The backing directory is created lazily on the first file and removed
/// wholesale on close. The quota counts every byte ever written; deleting a
/// run file does not give quota back.
#[derive(Debug)]
pub struct LimitedTemporaryStorage {
    dir: PathBuf,
    max_bytes: u64,
    bytes_used: AtomicU64,
    next_file: AtomicU64,
    dir_created: AtomicBool,
    closed: AtomicBool,
}

impl LimitedTemporaryStorage {
    pub fn new(dir: PathBuf, max_bytes: u64) -> Self {
        Self {
            dir,
            max_bytes,
            bytes_used: AtomicU64::new(0),
            next_file: AtomicU64::new(0),
            dir_created: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Opens the next sequentially numbered scratch file for writing.
    pub fn create_file(self: &Arc<Self>) -> Result<LimitedWriter, MergeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MergeError::defensive(
                "create file on closed temporary storage",
            ));
        }
        if self.bytes_used.load(Ordering::Acquire) >= self.max_bytes {
            return Err(MergeError::resource_exhausted(format!(
                "temporary storage quota of {} bytes exhausted",
                self.max_bytes
            )));
        }
        self.ensure_dir()?;
        let mut attempts = 0;
        loop {
            let id = self.next_file.fetch_add(1, Ordering::AcqRel);
            let path = self.dir.join(format!("{id:08}.tmp"));
            let file = OpenOptions::new().create_new(true).write(true).open(&path);
            match file {
                Ok(file) => {
                    return Ok(LimitedWriter {
                        out: BufWriter::new(file),
                        path,
                        written: 0,
                        storage: Arc::clone(self),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && attempts < 3 => {
                    attempts += 1;
                    continue;
                }
                Err(err) => {
                    return Err(MergeError::runtime(format!(
                        "create temporary file {} failed: {err}",
                        path.display()
                    )));
                }
            }
        }
    }

    fn ensure_dir(&self) -> Result<(), MergeError> {
        if !self.dir_created.load(Ordering::Acquire) {
            fs::create_dir_all(&self.dir).map_err(|e| {
                MergeError::runtime(format!(
                    "create temporary directory {} failed: {e}",
                    self.dir.display()
                ))
            })?;
            self.dir_created.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn charge(&self, len: u64) -> Result<(), MergeError> {
        let used = self.bytes_used.fetch_add(len, Ordering::AcqRel) + len;
        if used > self.max_bytes {
            return Err(MergeError::resource_exhausted(format!(
                "temporary storage quota of {} bytes exceeded",
                self.max_bytes
            )));
        }
        Ok(())
    }

    /// Removes a single scratch file once its contents have been drained.
    pub fn delete(&self, path: &Path) {
        if let Err(err) = fs::remove_file(path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!("delete temporary file {} failed: {err}", path.display());
        }
    }

    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Acquire)
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Deletes the backing directory and everything in it. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.dir_created.load(Ordering::Acquire)
            && let Err(err) = fs::remove_dir_all(&self.dir)
        {
            warn!(
                "remove temporary directory {} failed: {err}",
                self.dir.display()
            );
        }
    }
}

impl ResourceClose for LimitedTemporaryStorage {
    fn close_resource(&self) {
        self.close();
    }
}

/// Quota-counting writer over one scratch file.
#[derive(Debug)]
pub struct LimitedWriter {
    out: BufWriter<std::fs::File>,
    path: PathBuf,
    written: u64,
    storage: Arc<LimitedTemporaryStorage>,
}

impl LimitedWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Charges the quota for `buf` before writing it through.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<(), MergeError> {
        self.storage.charge(buf.len() as u64)?;
        self.out.write_all(buf).map_err(|e| {
            MergeError::runtime(format!("write temporary file {} failed: {e}", self.path.display()))
        })?;
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Flushes and returns the file path with the byte count written to it.
    pub fn finish(mut self) -> Result<(PathBuf, u64), MergeError> {
        self.out.flush().map_err(|e| {
            MergeError::runtime(format!("flush temporary file {} failed: {e}", self.path.display()))
        })?;
        Ok((self.path, self.written))
    }
}
