use std::fmt;
use std::sync::Arc;

use crate::protocol::{self, ModbusFunction, MBAP_HEADER_SIZE};
use crate::utils::format::bytes_to_hex;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

/// Logging mode for frame display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw frame bytes only
    Raw,
    /// Show decoded MBAP header fields
    Interpreted,
    /// Show both raw and interpreted data
    Both,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Diagnostic log sink handed to the packager and the transporter
///
/// Cloning is cheap; clones share the same callback.
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode: LoggingMode::Raw,
        }
    }

    /// Create a new callback logger with specific mode
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Create a logger with default console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error => eprintln!("[{}] ERROR: {}", timestamp, message),
                LogLevel::Warn => eprintln!("[{}] WARN: {}", timestamp, message),
                LogLevel::Info => println!("[{}] INFO: {}", timestamp, message),
                LogLevel::Debug => println!("[{}] DEBUG: {}", timestamp, message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger that forwards to the `log` facade
    ///
    /// Filtering is left to the installed `log` implementation.
    pub fn log_facade() -> Self {
        let callback: LogCallback = Box::new(|level, message| match level {
            LogLevel::Error => log::error!(target: "voltage_modbus_link", "{}", message),
            LogLevel::Warn => log::warn!(target: "voltage_modbus_link", "{}", message),
            LogLevel::Info => log::info!(target: "voltage_modbus_link", "{}", message),
            LogLevel::Debug => log::debug!(target: "voltage_modbus_link", "{}", message),
        });
        Self::new(Some(callback), LogLevel::Debug)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Set logging mode
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Get current logging mode
    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    /// Check if the logger has a sink attached
    pub fn is_enabled(&self) -> bool {
        self.callback.is_some()
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    /// Log an error message
    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// Log a warning message
    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    /// Log an info message
    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    /// Log a debug message
    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    /// Check if a message at the given level should be logged
    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log packet data with hex dump
    pub fn log_packet(&self, level: LogLevel, direction: &str, data: &[u8]) {
        if !self.should_log(level) {
            return;
        }

        let message = format!("{} packet ({} bytes): {}", direction, data.len(), bytes_to_hex(data));
        self.log(level, &message);
    }

    /// Log an MBAP frame according to the logging mode
    pub fn log_frame(&self, direction: &str, frame: &[u8]) {
        if !self.should_log(LogLevel::Debug) {
            return;
        }

        match self.mode {
            LoggingMode::Raw => self.log_packet(LogLevel::Debug, direction, frame),
            LoggingMode::Interpreted => self.debug(&Self::interpret_frame(direction, frame)),
            LoggingMode::Both => {
                self.debug(&Self::interpret_frame(direction, frame));
                self.log_packet(LogLevel::Debug, direction, frame);
            }
        }
    }

    /// Describe the MBAP header fields of a frame
    fn interpret_frame(direction: &str, frame: &[u8]) -> String {
        if frame.len() <= MBAP_HEADER_SIZE {
            return format!("{} frame truncated: {}", direction, bytes_to_hex(frame));
        }

        let function_code = frame[MBAP_HEADER_SIZE];
        let function_name = ModbusFunction::from_u8(function_code)
            .map(ModbusFunction::name)
            .unwrap_or("Unknown Function");
        let exception = if function_code & protocol::EXCEPTION_FLAG != 0 {
            " [exception]"
        } else {
            ""
        };

        format!(
            "{} Transaction: {}, Unit: {}, Function: {} (0x{:02X}){}, Data: {}",
            direction,
            protocol::transaction_id(frame).unwrap_or_default(),
            protocol::unit_id(frame).unwrap_or_default(),
            function_name,
            function_code,
            exception,
            bytes_to_hex(&frame[MBAP_HEADER_SIZE + 1..])
        )
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

impl fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("enabled", &self.callback.is_some())
            .field("min_level", &self.min_level)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Convenience macro for creating a custom logger
#[macro_export]
macro_rules! custom_logger {
    ($callback:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $crate::logging::LogLevel::Info)
    };
    ($callback:expr, $level:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $level)
    };
    ($callback:expr, $level:expr, $mode:expr) => {
        $crate::logging::CallbackLogger::with_mode(Some($callback), $level, $mode)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn capture(level: LogLevel, mode: LoggingMode) -> (CallbackLogger, Arc<Mutex<Vec<(LogLevel, String)>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |level, message| {
            sink.lock().unwrap().push((level, message.to_string()));
        });
        (CallbackLogger::with_mode(Some(callback), level, mode), lines)
    }

    #[test]
    fn test_level_filtering() {
        let (logger, lines) = capture(LogLevel::Warn, LoggingMode::Raw);
        logger.error("boom");
        logger.warn("careful");
        logger.info("hidden");
        logger.debug("hidden");

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], (LogLevel::Error, "boom".to_string()));
    }

    #[test]
    fn test_disabled_logger() {
        let logger = CallbackLogger::disabled();
        assert!(!logger.is_enabled());
        logger.error("nobody listens");
    }

    #[test]
    fn test_raw_frame_logging() {
        let (logger, lines) = capture(LogLevel::Debug, LoggingMode::Raw);
        logger.log_frame("send", &[0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01, 0x03]);

        let lines = lines.lock().unwrap();
        assert_eq!(lines[0].1, "send packet (8 bytes): 00 01 00 00 00 02 01 03");
    }

    #[test]
    fn test_interpreted_frame_logging() {
        let (logger, lines) = capture(LogLevel::Debug, LoggingMode::Both);
        logger.log_frame("recv", &[0x00, 0x2A, 0x00, 0x00, 0x00, 0x03, 0x05, 0x83, 0x02]);

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].1.contains("Transaction: 42"));
        assert!(lines[0].1.contains("Read Holding Registers"));
        assert!(lines[0].1.contains("[exception]"));
    }

    #[test]
    fn test_custom_logger_macro() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |_, message| sink.lock().unwrap().push(message.to_string()));

        let mut logger = crate::custom_logger!(callback, LogLevel::Debug);
        assert_eq!(logger.get_mode(), LoggingMode::Raw);
        logger.set_mode(LoggingMode::Interpreted);
        logger.log_frame("send", &[0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x6B, 0x00, 0x03]);

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("send Transaction: 7, Unit: 1"));
        assert!(CallbackLogger::console().is_enabled());
    }
}
