use chrono::{DateTime, Utc};

/// Parse `--at`: an RFC 3339 instant, or a span ago such as `30m`, `2h`, `1d`, `1w`.
pub(crate) fn parse_point_in_time(s: &str) -> Result<DateTime<Utc>, Box<dyn std::error::Error>> {
    parse_point_in_time_at(s, Utc::now())
}

fn parse_point_in_time_at(
    s: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty point in time".into());
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }

    let (num_str, unit) = match s.as_bytes().last() {
        Some(b'm' | b'M') => (&s[..s.len() - 1], 60i64),
        Some(b'h' | b'H') => (&s[..s.len() - 1], 3600),
        Some(b'd' | b'D') => (&s[..s.len() - 1], 86400),
        Some(b'w' | b'W') => (&s[..s.len() - 1], 604800),
        _ => {
            return Err(format!(
                "invalid point in time '{s}': use RFC 3339 (2024-05-01T12:00:00Z) or a span ago (30m, 2h, 1d, 1w)"
            )
            .into());
        }
    };
    let n: i64 = num_str
        .parse()
        .map_err(|_| format!("invalid duration number: '{num_str}'"))?;
    if n <= 0 {
        return Err(format!("--at span must be positive (got '{s}')").into());
    }
    Ok(now - chrono::Duration::seconds(n * unit))
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

pub(crate) fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}
