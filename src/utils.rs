/// Utility functions and helpers for the Modbus link
///
/// This module contains formatting helpers for diagnostics and a small timer
/// used to measure request round trips.

use std::time::{Duration, Instant};
use tracing::debug;

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    /// Start a new timer
    pub fn start(operation_name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            operation_name: operation_name.into(),
        }
    }

    /// Time elapsed since the timer started
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return duration
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        debug!(operation = %self.operation_name, ?duration, "operation completed");
        duration
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }
}

/// Saturating conversion of a duration to milliseconds for error reporting
pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatting() {
        assert_eq!(format::bytes_to_hex(&[0x01, 0x03, 0x10, 0xFF]), "01 03 10 FF");
        assert_eq!(format::bytes_to_hex(&[]), "");

        assert_eq!(format::format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format::format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format::format_duration(Duration::from_secs(90)), "1m 30.0s");
    }

    #[test]
    fn test_operation_timer() {
        let timer = OperationTimer::start("noop");
        let duration = timer.stop();
        assert!(duration < Duration::from_secs(1));
        assert_eq!(duration_ms(Duration::from_secs(3)), 3000);
    }
}
