//! Hook configuration resolved from the process environment

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use crate::compartment::CompartmentId;

/// Path of the optional diagnostic log file
pub const LOG_FILE_VAR: &str = "COMPARTMENT_HOOK_LOGFILE";
/// Compartment to switch every thread to when the hook is loaded
pub const ATTACH_COMPARTMENT_VAR: &str = "COMPARTMENT_ID_ATTACH";

/// Capacity (UTF-16 units, terminator included) of the log path buffer
pub const MAX_LOG_PATH_UNITS: usize = 1024;
/// Capacity (UTF-16 units, terminator included) of the compartment id buffer
pub const MAX_ATTACH_ID_UNITS: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookConfig {
    /// `None` disables diagnostic logging for the process lifetime
    pub log_file: Option<PathBuf>,
    /// `None` means no attach-time switch
    pub attach_compartment: Option<CompartmentId>,
}

impl HookConfig {
    pub fn builder() -> HookConfigBuilder {
        HookConfigBuilder::default()
    }

    /// Read both settings from the real environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var_os(name))
    }

    /// Resolve settings through `lookup`, which stands in for `GetEnvironmentVariableW`
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        Self {
            log_file: lookup(LOG_FILE_VAR).and_then(|v| resolve_log_path(&v)),
            attach_compartment: lookup(ATTACH_COMPARTMENT_VAR)
                .and_then(|v| resolve_attach_compartment(&v)),
        }
    }
}

/// Empty or over-long values disable logging instead of being truncated.
pub fn resolve_log_path(value: &OsStr) -> Option<PathBuf> {
    let units = utf16_len(value);
    if units == 0 || units >= MAX_LOG_PATH_UNITS {
        return None;
    }
    Some(PathBuf::from(value))
}

pub fn resolve_attach_compartment(value: &OsStr) -> Option<CompartmentId> {
    if utf16_len(value) >= MAX_ATTACH_ID_UNITS {
        return None;
    }
    let id = parse_wtoi(&value.to_string_lossy());
    (id != 0).then_some(CompartmentId(id))
}

/// Integer parse with C `_wtoi` rules, reinterpreted as an unsigned DWORD.
///
/// Leading whitespace and one sign are accepted, digits are consumed up to
/// the first non-digit, and out-of-range values saturate to `i32`.
pub fn parse_wtoi(s: &str) -> u32 {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let mut value: i64 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        value = value * 10 + i64::from(b - b'0');
        if value > i64::from(i32::MAX) + 1 {
            break;
        }
    }
    let value = if negative { -value } else { value };
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32 as u32
}

#[cfg(windows)]
fn utf16_len(value: &OsStr) -> usize {
    use std::os::windows::ffi::OsStrExt;
    value.encode_wide().count()
}

#[cfg(not(windows))]
fn utf16_len(value: &OsStr) -> usize {
    value.to_string_lossy().encode_utf16().count()
}

#[derive(Default)]
pub struct HookConfigBuilder {
    config: HookConfig,
}

impl HookConfigBuilder {
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.log_file = Some(path.into());
        self
    }

    pub fn attach_compartment(mut self, id: u32) -> Self {
        self.config.attach_compartment = (id != 0).then_some(CompartmentId(id));
        self
    }

    pub fn build(self) -> HookConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let map: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_empty_environment() {
        let config = HookConfig::from_lookup(lookup(&[]));
        assert_eq!(config, HookConfig::default());
    }

    #[test]
    fn test_full_environment() {
        let config = HookConfig::from_lookup(lookup(&[
            (LOG_FILE_VAR, r"C:\var\log\cphook.log"),
            (ATTACH_COMPARTMENT_VAR, "3"),
        ]));
        assert_eq!(config.log_file, Some(PathBuf::from(r"C:\var\log\cphook.log")));
        assert_eq!(config.attach_compartment, Some(CompartmentId(3)));
    }

    #[test]
    fn test_log_path_limits() {
        assert_eq!(resolve_log_path(OsStr::new("")), None);

        let longest = "a".repeat(MAX_LOG_PATH_UNITS - 1);
        assert!(resolve_log_path(OsStr::new(&longest)).is_some());

        let too_long = "a".repeat(MAX_LOG_PATH_UNITS);
        assert_eq!(resolve_log_path(OsStr::new(&too_long)), None);
    }

    #[test]
    fn test_zero_or_garbage_means_no_switch() {
        assert_eq!(resolve_attach_compartment(OsStr::new("0")), None);
        assert_eq!(resolve_attach_compartment(OsStr::new("abc")), None);
        assert_eq!(resolve_attach_compartment(OsStr::new("")), None);

        let too_long = "1".repeat(MAX_ATTACH_ID_UNITS);
        assert_eq!(resolve_attach_compartment(OsStr::new(&too_long)), None);
    }

    #[test]
    fn test_parse_wtoi() {
        assert_eq!(parse_wtoi("42"), 42);
        assert_eq!(parse_wtoi("  7"), 7);
        assert_eq!(parse_wtoi("+5"), 5);
        assert_eq!(parse_wtoi("12abc"), 12);
        assert_eq!(parse_wtoi("-1"), u32::MAX);
        assert_eq!(parse_wtoi("99999999999"), i32::MAX as u32);
        assert_eq!(parse_wtoi("-99999999999"), i32::MIN as u32);
        assert_eq!(parse_wtoi("x1"), 0);
    }

    #[test]
    fn test_builder() {
        let config = HookConfig::builder().log_file("hook.log").attach_compartment(0).build();
        assert!(config.log_file.is_some());
        assert_eq!(config.attach_compartment, None);
    }
}
