//! Small shared helpers: clock access, timestamp formatting, process and
//! host identity.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::format::{Item, StrftimeItems};
use chrono::{Local, LocalResult, TimeZone};
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Current wall-clock time as unix seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Check that a strftime-style format string only contains specifiers the
/// formatter understands. Invalid formats are rejected at config load so
/// rendering can never fail later.
pub fn is_valid_datetime_format(format: &str) -> bool {
    !StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
}

/// Render a unix timestamp with the configured strftime-style format,
/// in local time. The format must have passed [`is_valid_datetime_format`].
pub fn format_datetime(timestamp: u64, format: &str) -> String {
    match Local.timestamp_opt(timestamp as i64, 0) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.format(format).to_string(),
        LocalResult::None => timestamp.to_string(),
    }
}

/// Probe a PID with the null signal. Used for stale PID file detection.
pub fn is_process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Hostname plus every local interface address, used to mask the machine's
/// own identity out of reported log lines.
pub fn host_identity_tokens() -> Vec<String> {
    let mut tokens = Vec::new();

    if let Ok(name) = nix::unistd::gethostname()
        && let Ok(name) = name.into_string()
        && !name.is_empty()
    {
        tokens.push(name);
    }

    if let Ok(ifaddrs) = nix::ifaddrs::getifaddrs() {
        for ifaddr in ifaddrs {
            let Some(address) = ifaddr.address else {
                continue;
            };
            if let Some(sin) = address.as_sockaddr_in() {
                tokens.push(std::net::Ipv4Addr::from(sin.ip()).to_string());
            } else if let Some(sin6) = address.as_sockaddr_in6() {
                tokens.push(sin6.ip().to_string());
            }
        }
    }

    tokens.sort();
    tokens.dedup();
    tokens
}
