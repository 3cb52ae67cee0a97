//! Operator-defined log patterns.
//!
//! A raw pattern is a regular expression carrying exactly one `%i`
//! placeholder (the source address) and at most one `%p` (a port number).
//! Compilation swaps the placeholders for capture groups, anchors the
//! expression as a full-line match and makes it case-insensitive.

use hostblock_shared::errors::{HostblockError, HostblockResult};
use regex::Regex;

/// Address-shaped token: IPv4 dotted-quad or an IPv6-shaped hex-and-colon
/// run. Also used by the reconciler to pull addresses out of listed rules.
pub const IP_TOKEN: &str = r"(?:\d{1,3}\.){3}\d{1,3}|[0-9A-Fa-f]{0,4}(?::[0-9A-Fa-f]{0,4}){2,7}";

/// Capture group substituted for `%p`.
const PORT_CAPTURE: &str = r"(?P<port>\d{1,5})";

/// Per-pattern reporting override. `Inherit` falls through to the log
/// group, which falls through to the global default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportPolicy {
    #[default]
    Inherit,
    On,
    Off,
}

impl ReportPolicy {
    pub fn from_bool(enabled: bool) -> Self {
        if enabled { ReportPolicy::On } else { ReportPolicy::Off }
    }

    /// Resolve this level against the next one down the stack.
    pub fn resolve(self, fallback: bool) -> bool {
        match self {
            ReportPolicy::Inherit => fallback,
            ReportPolicy::On => true,
            ReportPolicy::Off => false,
        }
    }
}

/// A compiled pattern together with its score and reporting controls.
#[derive(Debug, Clone)]
pub struct Pattern {
    /// Source regex as written in the configuration, placeholders intact.
    pub raw: String,
    regex: Regex,
    /// Score added to the address on a match.
    pub score: u32,
    pub report: ReportPolicy,
    /// Report categories; `None` inherits from the group/global level.
    pub categories: Option<Vec<u32>>,
    /// Comment template; `None` inherits, `Some("")` disables.
    pub comment: Option<String>,
}

/// Captures pulled out of a matched line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineMatch<'a> {
    pub ip: &'a str,
    pub port: Option<&'a str>,
}

impl Pattern {
    /// Compile a raw pattern. Fails when `%i` is missing or duplicated,
    /// when more than one `%p` is present, or when the resulting regex
    /// does not compile.
    pub fn compile(raw: &str) -> HostblockResult<Self> {
        match raw.matches("%i").count() {
            1 => {}
            0 => {
                return Err(HostblockError::Config(format!(
                    "pattern is missing the %i address placeholder: {raw}"
                )));
            }
            n => {
                return Err(HostblockError::Config(format!(
                    "pattern contains {n} %i placeholders, exactly one expected: {raw}"
                )));
            }
        }
        if raw.matches("%p").count() > 1 {
            return Err(HostblockError::Config(format!(
                "pattern contains more than one %p placeholder: {raw}"
            )));
        }

        let body = raw
            .replacen("%i", &format!("(?P<ip>{IP_TOKEN})"), 1)
            .replacen("%p", PORT_CAPTURE, 1);
        let regex = Regex::new(&format!("(?i)^{body}$"))
            .map_err(|e| HostblockError::Regex(format!("{raw}: {e}")))?;

        Ok(Pattern {
            raw: raw.to_string(),
            regex,
            score: 1,
            report: ReportPolicy::Inherit,
            categories: None,
            comment: None,
        })
    }

    /// Match a full line, returning the captured address and port.
    pub fn matches<'a>(&self, line: &'a str) -> Option<LineMatch<'a>> {
        let caps = self.regex.captures(line)?;
        let ip = caps.name("ip")?;
        let port = caps.name("port").map(|m| m.as_str());
        Some(LineMatch {
            ip: ip.as_str(),
            port,
        })
    }
}
