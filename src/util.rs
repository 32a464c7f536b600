use std::time::Instant;

pub const PTR_SIZE: usize = std::mem::size_of::<usize>();

pub const fn round_down(x: usize, n: usize) -> usize {
    x & !(n - 1)
}

pub const fn round_up(x: usize, n: usize) -> usize {
    round_down(x + n - 1, n)
}

pub struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

/// Nanoseconds elapsed since `epoch`.
pub(crate) fn nanos_since(epoch: Instant) -> i64 {
    epoch.elapsed().as_nanos() as i64
}

/// Formats nanoseconds as milliseconds with at most three fractional digits, dropping
/// fractional digits for large values like gctrace does.
pub(crate) fn fmt_ns_as_ms(ns: i64) -> String {
    let ns = ns.max(0);
    if ns >= 10_000_000 {
        return format!("{}", ns / 1_000_000);
    }
    let ms = ns as f64 / 1e6;
    let s = format!("{:.3}", ms);
    let s = s.trim_end_matches('0');
    s.trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(8, 8), 8);
        assert_eq!(round_up(9, 8192), 8192);
        assert_eq!(round_down(8199, 8192), 8192);
    }

    #[test]
    fn sizes_format() {
        assert_eq!(formatted_size(512).to_string(), "512B");
        assert_eq!(formatted_size(2048).to_string(), "2.0K");
        assert_eq!(formatted_size(3 * 1024 * 1024).to_string(), "3.0M");
    }

    #[test]
    fn ms_format() {
        assert_eq!(fmt_ns_as_ms(0), "0");
        assert_eq!(fmt_ns_as_ms(1_500_000), "1.5");
        assert_eq!(fmt_ns_as_ms(25_000_000), "25");
        assert_eq!(fmt_ns_as_ms(123_456), "0.123");
    }
}
