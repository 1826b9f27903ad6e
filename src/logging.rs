//! Diagnostic log file for the compartment hook
//!
//! The hook runs inside foreign processes, so it never writes to stdout or
//! stderr. When `COMPARTMENT_HOOK_LOGFILE` names a file, `tracing` events are
//! appended to it as UTF-16LE lines without a byte-order mark:
//!
//! ```text
//! [14:02:11.337] SetTargetCompartmentId called with compartmentId=2
//! ```
//!
//! The file is opened at most once per process. Write failures are dropped
//! so logging can never feed back into itself.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use chrono::Timelike;
use parking_lot::Mutex;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::registry::LookupSpan;

use crate::config::HookConfig;

/// Append-only UTF-16 log file shared by every thread of the process
#[derive(Clone)]
pub struct DiagnosticLog {
    file: Arc<Mutex<Option<File>>>,
}

impl DiagnosticLog {
    /// Open the configured log file, `None` when logging is disabled or the open fails
    pub fn open(config: &HookConfig) -> Option<Self> {
        let path = config.log_file.as_deref()?;
        Self::open_path(path).ok()
    }

    pub fn open_path(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    /// Append one already formatted line, transcoded to UTF-16LE
    pub fn write_line(&self, line: &str) {
        let mut guard = self.file.lock();
        if let Some(file) = guard.as_mut() {
            let _ = file.write_all(&encode_utf16le(line));
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.lock().is_some()
    }

    /// Close the file, later writes are silently discarded
    pub fn close(&self) {
        self.file.lock().take();
    }

    /// Subscriber that renders events as `[HH:MM:SS.mmm] message\r\n` into this log
    pub fn subscriber(&self) -> impl Subscriber + Send + Sync + 'static {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .event_format(LineFormat)
            .with_writer(self.clone())
            .finish()
    }
}

/// Per-event writer handed out to the fmt layer
pub struct LineWriter {
    log: DiagnosticLog,
}

impl Write for LineWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.log.write_line(&String::from_utf8_lossy(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for DiagnosticLog {
    type Writer = LineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter { log: self.clone() }
    }
}

/// Event format: local timestamp prefix, message and fields, CRLF
pub struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        writer.write_str(&timestamp_prefix(&chrono::Local::now()))?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writer.write_str("\r\n")
    }
}

/// `[HH:MM:SS.mmm] `
pub fn timestamp_prefix<T: Timelike>(time: &T) -> String {
    // chrono reports leap seconds as nanosecond >= 1e9
    let millis = (time.nanosecond() / 1_000_000).min(999);
    format!(
        "[{:02}:{:02}:{:02}.{:03}] ",
        time.hour(),
        time.minute(),
        time.second(),
        millis
    )
}

pub fn encode_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Process-wide log, opened at most once
pub struct ProcessLog {
    log: Option<DiagnosticLog>,
}

static PROCESS_LOG: OnceLock<ProcessLog> = OnceLock::new();

impl ProcessLog {
    /// First call opens the file and installs the global subscriber; later
    /// calls return the same instance without retrying.
    pub fn init(config: &HookConfig) -> &'static ProcessLog {
        PROCESS_LOG.get_or_init(|| {
            let log = DiagnosticLog::open(config).and_then(|log| {
                tracing::subscriber::set_global_default(log.subscriber())
                    .ok()
                    .map(|_| log)
            });
            ProcessLog { log }
        })
    }

    pub fn get() -> Option<&'static ProcessLog> {
        PROCESS_LOG.get()
    }

    pub fn is_enabled(&self) -> bool {
        self.log.as_ref().is_some_and(DiagnosticLog::is_open)
    }

    pub fn close(&self) {
        if let Some(log) = &self.log {
            log.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn test_timestamp_prefix() {
        let t = NaiveTime::from_hms_milli_opt(9, 5, 7, 42).unwrap();
        assert_eq!(timestamp_prefix(&t), "[09:05:07.042] ");
    }

    #[test]
    fn test_timestamp_prefix_leap_second() {
        let t = NaiveTime::from_hms_nano_opt(23, 59, 59, 1_500_000_000).unwrap();
        assert_eq!(timestamp_prefix(&t), "[23:59:59.999] ");
    }

    #[test]
    fn test_encode_utf16le_has_no_bom() {
        assert_eq!(encode_utf16le("A\r\n"), vec![b'A', 0, b'\r', 0, b'\n', 0]);
        assert_eq!(encode_utf16le("é"), vec![0xE9, 0x00]);
    }

    #[test]
    fn test_disabled_without_path() {
        assert!(DiagnosticLog::open(&HookConfig::default()).is_none());
    }

    #[test]
    fn test_close_discards_later_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hook.log");
        let log = DiagnosticLog::open_path(&path).unwrap();

        log.write_line("one\r\n");
        log.close();
        log.write_line("two\r\n");

        assert!(!log.is_open());
        assert_eq!(std::fs::read(&path).unwrap(), encode_utf16le("one\r\n"));
    }

    #[test]
    fn test_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hook.log");
        std::fs::write(&path, encode_utf16le("old\r\n")).unwrap();

        let log = DiagnosticLog::open_path(&path).unwrap();
        log.write_line("new\r\n");
        drop(log);

        assert_eq!(std::fs::read(&path).unwrap(), encode_utf16le("old\r\nnew\r\n"));
    }
}
