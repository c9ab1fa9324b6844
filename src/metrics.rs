use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter shared between the ingress worker and the metrics
/// surface.
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Counter {
        Counter(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Total ERSPAN inner frames delivered by the ingress.
pub static TOTAL_PACKETS: Counter = Counter::new();
/// Total ERSPAN inner-frame bytes delivered by the ingress.
pub static TOTAL_BYTES: Counter = Counter::new();
/// Datagrams dropped because they did not decode as ERSPAN type II.
pub static DECODE_ERRORS: Counter = Counter::new();

/// Prometheus text exposition of the ingress counters.
pub fn render_prometheus() -> String {
    let mut out = String::with_capacity(512);
    for (name, help, counter) in [
        (
            "total_packets",
            "Total ERSPAN packets captured",
            &TOTAL_PACKETS,
        ),
        ("total_bytes", "Total ERSPAN bytes captured", &TOTAL_BYTES),
        (
            "decode_errors",
            "Datagrams dropped as malformed or non-ERSPAN",
            &DECODE_ERRORS,
        ),
    ] {
        let _ = writeln!(out, "# HELP {} {}", name, help);
        let _ = writeln!(out, "# TYPE {} counter", name);
        let _ = writeln!(out, "{} {}", name, counter.get());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::new();
        assert_eq!(c.get(), 0);
        c.inc();
        c.add(41);
        assert_eq!(c.get(), 42);
    }

    #[test]
    fn test_render_prometheus() {
        let text = render_prometheus();
        assert!(text.contains("# TYPE total_packets counter"));
        assert!(text.contains("# TYPE total_bytes counter"));
        assert!(text.contains("# HELP total_packets Total ERSPAN packets captured"));
    }
}
