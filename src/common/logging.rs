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
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::Local;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

static INIT: OnceLock<()> = OnceLock::new();

/// Glog-layout event formatter: `Lyyyymmdd hh:mm:ss.uuuuuu tid file:line] msg`.
struct GlogFormatter;

fn level_letter(level: tracing::Level) -> char {
    match level {
        tracing::Level::ERROR => 'E',
        tracing::Level::WARN => 'W',
        tracing::Level::INFO => 'I',
        tracing::Level::DEBUG => 'D',
        tracing::Level::TRACE => 'T',
    }
}

/// Small process-local thread number, assigned on a thread's first log line.
fn thread_ordinal() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ORDINAL: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ORDINAL.with(|n| *n)
}

impl<S, N> FormatEvent<S, N> for GlogFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            writer,
            "{}{} {} {}:{}] ",
            level_letter(*metadata.level()),
            Local::now().format("%Y%m%d %H:%M:%S%.6f"),
            thread_ordinal(),
            metadata.file().unwrap_or("unknown"),
            metadata.line().unwrap_or(0)
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Append-only log file shared by all subscriber workers.
#[derive(Clone)]
struct FileSink {
    file: Arc<Mutex<File>>,
}

impl FileSink {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<'a> MakeWriter<'a> for FileSink {
    type Writer = FileSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl io::Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.locked().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.locked().flush()
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}

/// `ROWFOLD_LOG_FILE` names the file outright; `ROWFOLD_LOG_DIR` picks the
/// directory with a fixed file name. Unset means stderr.
fn configured_log_path() -> Option<PathBuf> {
    env_path("ROWFOLD_LOG_FILE").or_else(|| env_path("ROWFOLD_LOG_DIR").map(|d| d.join("rowfold.log")))
}

fn open_file_sink() -> Option<FileSink> {
    let path = configured_log_path()?;
    if let Some(dir) = path.parent()
        && let Err(err) = fs::create_dir_all(dir)
    {
        eprintln!("cannot create log directory {}: {err}; logging to stderr", dir.display());
        return None;
    }
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Some(FileSink::new(file)),
        Err(err) => {
            eprintln!("cannot open log file {}: {err}; logging to stderr", path.display());
            None
        }
    }
}

fn install<W>(filter: EnvFilter, writer: W, ansi: bool)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let _ = tracing_fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .event_format(GlogFormatter)
        .try_init();
}

/// Install the global subscriber once. `level` is a full `EnvFilter`
/// expression, so per-target overrides pass straight through.
pub fn init_with_level(level: &str) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::new(level);
        match open_file_sink() {
            Some(sink) => install(filter, sink, false),
            // ANSI colors only when stderr is an actual terminal.
            None => install(filter, io::stderr, atty::is(atty::Stream::Stderr)),
        }
    });
}

/// Initialize logging from the loaded config.
/// Prefers `log_filter` (full EnvFilter expression) if present. Otherwise
/// `log_level` applies to this crate while dependencies stay at `info`.
pub fn init_from_config() {
    let filter = match crate::common::config::config() {
        Ok(cfg) => {
            if let Some(ref f) = cfg.log_filter {
                f.clone()
            } else {
                match cfg.log_level.as_str() {
                    "debug" => "info,rowfold=debug".to_string(),
                    "trace" => "info,rowfold=trace".to_string(),
                    other => other.to_string(),
                }
            }
        }
        Err(_) => "info".to_string(),
    };
    init_with_level(&filter);
}

pub fn init() {
    init_with_level("info");
}

pub use tracing::{debug, error, info, trace, warn};
