//! # Modbus Link Error Handling
//!
//! This module provides the error type shared by every layer of the link:
//! frame encoding and decoding, header verification, connection management
//! and request/response correlation.
//!
//! ## Error Categories
//!
//! ### Framing Errors
//! - **Encoding**: payload would not fit into a single MBAP frame
//! - **Frame length mismatch / frame too short**: malformed or truncated frames
//! - **Verification mismatch**: response header does not belong to the request
//!
//! ### Connection Errors
//! - **Connection**: connect failures, sending without a connection, connection
//!   torn down while a request was waiting
//! - **I/O**: write failures and read-loop header failures
//! - **Timeout**: connect timeout and write deadline
//!
//! ### Request Errors
//! - **Transaction timeout**: no response arrived for a transaction id
//! - **Transaction in use**: the transaction id is still outstanding
//! - **Exception**: the device answered with a Modbus exception
//!
//! ## Error Recovery
//!
//! ```rust
//! use voltage_modbus_link::{ModbusError, ModbusResult};
//!
//! fn handle(result: ModbusResult<Vec<u8>>) {
//!     match result {
//!         Ok(frame) => println!("response: {:02X?}", frame),
//!         Err(error) if error.is_recoverable() => println!("retry later: {}", error),
//!         Err(error) => println!("giving up: {}", error),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for Modbus link operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Errors produced by the Modbus TCP link
///
/// Each variant carries enough context to log a useful message without
/// access to the originating frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// I/O related errors
    ///
    /// Covers write failures during `send` and header read failures inside
    /// the read loop. A header read failure terminates the connection.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection errors
    ///
    /// # Examples
    /// - Connection refused by remote host
    /// - `send` called while no connection is established
    /// - Connection closed while a request was waiting for its response
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout of a connection-level operation
    ///
    /// # Examples
    /// - Connect did not complete within the configured timeout
    /// - Write did not complete before its deadline
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// No response was correlated to a transaction within the wait window
    #[error("Wait timeout for transaction {transaction_id} after {timeout_ms}ms")]
    TransactionTimeout { transaction_id: u16, timeout_ms: u64 },

    /// A request with the same transaction id is still outstanding
    #[error("Transaction {transaction_id} is already outstanding")]
    TransactionInUse { transaction_id: u16 },

    /// The payload cannot be carried by a single frame
    #[error("Encoding error: {message}")]
    Encoding { message: String },

    /// Declared MBAP length disagrees with the received PDU length
    #[error("Frame length mismatch: header declares {declared} PDU bytes, frame carries {actual}")]
    FrameLengthMismatch { declared: usize, actual: usize },

    /// Frame is shorter than the minimum needed for the operation
    #[error("Frame too short: {length} bytes (minimum {minimum})")]
    FrameTooShort { length: usize, minimum: usize },

    /// Response header does not match the request header
    #[error("Response {field} '{response}' does not match request '{request}'")]
    VerificationMismatch {
        field: &'static str,
        request: u16,
        response: u16,
    },

    /// Modbus exception response
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x05: Acknowledge
    /// - 0x06: Slave Device Busy
    /// - 0x08: Memory Parity Error
    /// - 0x0A: Gateway Path Unavailable
    /// - 0x0B: Gateway Target Device Failed to Respond
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Response function code does not echo the request
    #[error("Unexpected function code in response: expected {expected:02X}, got {actual:02X}")]
    UnexpectedFunction { expected: u8, actual: u8 },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a transaction wait timeout error
    pub fn transaction_timeout(transaction_id: u16, timeout_ms: u64) -> Self {
        Self::TransactionTimeout {
            transaction_id,
            timeout_ms,
        }
    }

    /// Create a transaction-in-use error
    pub fn transaction_in_use(transaction_id: u16) -> Self {
        Self::TransactionInUse { transaction_id }
    }

    /// Create a new encoding error
    pub fn encoding<S: Into<String>>(message: S) -> Self {
        Self::Encoding { message: message.into() }
    }

    /// Create a frame length mismatch error
    pub fn frame_length_mismatch(declared: usize, actual: usize) -> Self {
        Self::FrameLengthMismatch { declared, actual }
    }

    /// Create a frame too short error
    pub fn frame_too_short(length: usize, minimum: usize) -> Self {
        Self::FrameTooShort { length, minimum }
    }

    /// Create a verification mismatch error
    ///
    /// # Arguments
    ///
    /// * `field` - Name of the header field that differs
    /// * `request` - Value found in the request frame
    /// * `response` - Value found in the response frame
    pub fn verification_mismatch(field: &'static str, request: u16, response: u16) -> Self {
        Self::VerificationMismatch {
            field,
            request,
            response,
        }
    }

    /// Create a Modbus exception error
    ///
    /// Automatically maps standard exception codes to human-readable messages.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception {
            function,
            code,
            message,
        }
    }

    /// Create an unexpected function code error
    pub fn unexpected_function(expected: u8, actual: u8) -> Self {
        Self::UnexpectedFunction { expected, actual }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use voltage_modbus_link::ModbusError;
    ///
    /// let timeout_error = ModbusError::transaction_timeout(7, 3000);
    /// assert!(timeout_error.is_recoverable());
    ///
    /// let encoding_error = ModbusError::encoding("payload too large");
    /// assert!(!encoding_error.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::TransactionTimeout { .. } => true,
            Self::TransactionInUse { .. } => true,
            Self::VerificationMismatch { .. } => true,
            Self::Exception { code, .. } => {
                // Acknowledge, Busy
                matches!(code, 0x05 | 0x06)
            }
            _ => false,
        }
    }

    /// Check if the error is a network/transport issue
    ///
    /// ```rust
    /// use voltage_modbus_link::ModbusError;
    ///
    /// assert!(ModbusError::connection("Connection refused").is_transport_error());
    /// assert!(!ModbusError::exception(0x03, 0x02).is_transport_error());
    /// ```
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::TransactionTimeout { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Encoding { .. }
                | Self::FrameLengthMismatch { .. }
                | Self::FrameTooShort { .. }
                | Self::VerificationMismatch { .. }
                | Self::Exception { .. }
                | Self::UnexpectedFunction { .. }
        )
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from serde JSON errors (configuration loading)
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}
