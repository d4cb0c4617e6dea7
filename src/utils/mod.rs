/// Utility functions and helpers
use rand::Rng;
use std::time::Duration;

/// Split a `host:port` address, accepting bracketed IPv6 hosts
pub fn split_address(address: &str) -> Result<(String, u16), String> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| "expected host:port".to_string())?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err("empty host".to_string());
    }

    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid port '{}'", port))?;
    if port == 0 {
        return Err("port must be greater than 0".to_string());
    }

    Ok((host.to_string(), port))
}

/// Spread periodic work so nodes configured alike do not tick in lockstep
pub fn jitter(base: Duration, fraction: f64) -> Duration {
    if base.is_zero() || fraction <= 0.0 {
        return base;
    }
    let spread = base.as_secs_f64() * fraction;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        return format!("{}ms", millis);
    }
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
