/// Utility functions and helpers
use std::time::Duration;

/// Split `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.trim().is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

/// Format a latency sample for human-readable output
pub fn format_latency(latency: Option<Duration>) -> String {
    match latency {
        Some(latency) if latency < Duration::from_millis(1) => {
            format!("{}µs", latency.as_micros())
        }
        Some(latency) => format!("{:.2}ms", latency.as_secs_f64() * 1000.0),
        None => "-".to_string(),
    }
}

/// Format byte size for human-readable output
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
