// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Output sink
//!
//! Job output is written through a [`Sink`] so the engine never touches
//! stdout directly. Writes are serialized; interleaved jobs can never
//! tear a line. The mock variant collects lines for tests.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use colored::Colorize;

use crate::errors::{CilocalError, CilocalResult};

/// ANSI prefix emitted by the init script for echoed commands
const SCRIPT_ECHO_PREFIX: &str = "\u{1b}[32m$";

/// Destination for user-visible lines
pub trait Sink: Send + Sync {
    fn stdout_line(&self, line: &str);
    fn stderr_line(&self, line: &str);
}

/// The real terminal sink
#[derive(Default)]
pub struct TerminalSink {
    guard: Mutex<()>,
}

impl TerminalSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sink for TerminalSink {
    fn stdout_line(&self, line: &str) {
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        println!("{line}");
    }

    fn stderr_line(&self, line: &str) {
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        eprintln!("{line}");
    }
}

/// Collecting sink for tests
#[derive(Default)]
pub struct MockSink {
    pub stdout: Mutex<Vec<String>>,
    pub stderr: Mutex<Vec<String>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout_lines(&self) -> Vec<String> {
        self.stdout.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stderr_lines(&self) -> Vec<String> {
        self.stderr.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Sink for MockSink {
    fn stdout_line(&self, line: &str) {
        self.stdout
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line.to_string());
    }

    fn stderr_line(&self, line: &str) {
        self.stderr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line.to_string());
    }
}

/// Per-job view over a sink: prefixes lines with the padded job name and
/// mirrors everything into the on-disk log.
pub struct JobLogger {
    sink: std::sync::Arc<dyn Sink>,
    name: String,
    pad: usize,
    log: Mutex<File>,
}

impl JobLogger {
    /// Open (and truncate) the job's log file.
    pub fn create(
        sink: std::sync::Arc<dyn Sink>,
        name: &str,
        pad: usize,
        log_path: &Path,
    ) -> CilocalResult<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(log_path)
            .map_err(|e| CilocalError::FileWriteError {
                path: log_path.to_path_buf(),
                error: e.to_string(),
            })?;

        Ok(Self {
            sink,
            name: name.to_string(),
            pad,
            log: Mutex::new(log),
        })
    }

    /// A stdout line from the job.
    pub fn stdout(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        self.append_log(line);
        self.sink.stdout_line(&self.prefixed(line, ">".green()));
    }

    /// A stderr line from the job.
    pub fn stderr(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        self.append_log(line);
        self.sink.stderr_line(&self.prefixed(line, ">".red()));
    }

    /// A warning about the job itself (after-script failure, cleanup).
    pub fn warn(&self, line: &str) {
        self.append_log(line);
        let name = format!("{:width$}", self.name, width = self.pad).blue();
        self.sink
            .stderr_line(&format!("{name} {} {line}", "WARN".yellow().bold()));
    }

    fn prefixed(&self, line: &str, mark: colored::ColoredString) -> String {
        let name = format!("{:width$}", self.name, width = self.pad).blue();
        if line.starts_with(SCRIPT_ECHO_PREFIX) {
            // Echoed commands carry their own green `$` mark.
            format!("{name} {line}")
        } else {
            format!("{name} {mark} {line}")
        }
    }

    fn append_log(&self, line: &str) {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(log, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn logger(sink: Arc<MockSink>, dir: &Path) -> JobLogger {
        JobLogger::create(sink, "build", 8, &dir.join("build.log")).unwrap()
    }

    #[test]
    fn test_lines_reach_sink_and_log() {
        let tmp = TempDir::new().unwrap();
        let sink = Arc::new(MockSink::new());
        let log = logger(sink.clone(), tmp.path());

        log.stdout("hello");
        log.stderr("oops");

        assert_eq!(sink.stdout_lines().len(), 1);
        assert!(sink.stdout_lines()[0].contains("hello"));
        assert!(sink.stderr_lines()[0].contains("oops"));

        let on_disk = std::fs::read_to_string(tmp.path().join("build.log")).unwrap();
        assert_eq!(on_disk, "hello\noops\n");
    }

    #[test]
    fn test_empty_lines_are_dropped() {
        let tmp = TempDir::new().unwrap();
        let sink = Arc::new(MockSink::new());
        let log = logger(sink.clone(), tmp.path());

        log.stdout("");
        assert!(sink.stdout_lines().is_empty());
    }

    #[test]
    fn test_echoed_commands_suppress_the_mark() {
        let tmp = TempDir::new().unwrap();
        let sink = Arc::new(MockSink::new());
        let log = logger(sink.clone(), tmp.path());

        log.stdout(&format!("{SCRIPT_ECHO_PREFIX} npm ci\u{1b}[0m"));
        log.stdout("plain output");

        let lines = sink.stdout_lines();
        assert!(!lines[0].contains('>'));
        assert!(lines[1].contains('>'));
    }

    #[test]
    fn test_log_is_truncated_on_create() {
        let tmp = TempDir::new().unwrap();
        let sink = Arc::new(MockSink::new());
        {
            let log = logger(sink.clone(), tmp.path());
            log.stdout("first run");
        }
        {
            let _log = logger(sink, tmp.path());
        }
        let on_disk = std::fs::read_to_string(tmp.path().join("build.log")).unwrap();
        assert!(on_disk.is_empty());
    }
}
