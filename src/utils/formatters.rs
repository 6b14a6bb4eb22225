use std::time::Duration;

/// Converts bytes to human-readable file size format
pub fn format_file_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Formats a throughput in bytes per second, e.g. `1.50 MB/s`
pub fn format_speed(bytes_per_sec: f64) -> String {
    if !bytes_per_sec.is_finite() || bytes_per_sec <= 0.0 {
        return "0 B/s".to_string();
    }
    format!("{}/s", format_file_size(bytes_per_sec as u64))
}

/// Formats an ETA as `1h 02m`, `3m 07s` or `42s`; `--` when unknown
pub fn format_eta(eta: Option<Duration>) -> String {
    let Some(eta) = eta else {
        return "--".to_string();
    };
    let secs = eta.as_secs();
    if secs >= 3600 {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Shortens a transfer ID to its first 8 characters
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Truncates filename to max length with ellipsis
pub fn truncate_filename(name: &str, max_len: usize) -> String {
    if name.chars().count() <= max_len {
        name.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let head: String = name.chars().take(max_len - 3).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1024), "1.00 KB");
        assert_eq!(format_file_size(1536), "1.50 KB");
        assert_eq!(format_file_size(1048576), "1.00 MB");
        assert_eq!(format_file_size(1073741824), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(0.0), "0 B/s");
        assert_eq!(format_speed(f64::NAN), "0 B/s");
        assert_eq!(format_speed(2048.0), "2.00 KB/s");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(None), "--");
        assert_eq!(format_eta(Some(Duration::from_secs(42))), "42s");
        assert_eq!(format_eta(Some(Duration::from_secs(187))), "3m 07s");
        assert_eq!(format_eta(Some(Duration::from_secs(3720))), "1h 02m");
    }

    #[test]
    fn test_short_id_and_truncate() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(truncate_filename("short.txt", 20), "short.txt");
        assert_eq!(truncate_filename("verylongfilename.txt", 10), "verylon...");
        assert_eq!(truncate_filename("test", 2), "...");
    }
}
