//! Small shared helpers.

/// Format a byte count as a human-readable string, e.g. `1.5MiB`.
pub fn format_size(size: u64) -> String {
    let mut size = size as f64;

    for unit in ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"] {
        if size.abs() < 1024.0 {
            return format!("{:.1}{}B", size, unit);
        }

        size /= 1024.0;
    }

    format!("{:.1}YiB", size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_small_sizes() {
        assert_eq!(format_size(0), "0.0B");
        assert_eq!(format_size(512), "512.0B");
    }

    #[test]
    fn formats_binary_multiples() {
        assert_eq!(format_size(1024), "1.0KiB");
        assert_eq!(format_size(1536), "1.5KiB");
        assert_eq!(format_size(10 * 1024 * 1024), "10.0MiB");
    }
}
