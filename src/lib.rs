//! # Voltage Modbus Link - Modbus TCP Client Transport
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **Version:** 0.1.0
//! **License:** MIT
//!
//! Client-side Modbus TCP transport for long-lived device connections. It
//! frames requests with the MBAP header, correlates asynchronous responses to
//! their requests by transaction id, forwards unsolicited device messages to a
//! push handler and closes connections that stay idle.
//!
//! ## Features
//!
//! - **Async I/O**: Tokio based connection with a background read loop
//! - **Request pipelining**: responses are matched by transaction id, not by order
//! - **Push messages**: frames with transaction id 0 go to a user callback
//! - **Idle management**: connections without traffic are closed automatically
//! - **Explicit diagnostics**: log sink handle, no global logger
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use voltage_modbus_link::{ProtocolDataUnit, TcpClientHandler, TcpTransportConfig, TcpTransporter};
//!
//! #[tokio::main]
//! async fn main() -> voltage_modbus_link::ModbusResult<()> {
//!     let config = TcpTransportConfig::new("127.0.0.1:502")
//!         .with_timeout(Duration::from_secs(5))
//!         .with_unit_id(1);
//!
//!     let handler = TcpClientHandler::from_builder(
//!         TcpTransporter::builder(config)
//!             .push_handler(|frame| println!("device push: {:02X?}", frame)),
//!     );
//!     let session = handler.transporter().open().await?;
//!
//!     // read holding registers 107..110
//!     let response = handler
//!         .execute(&ProtocolDataUnit::new(0x03, vec![0x00, 0x6B, 0x00, 0x03]))
//!         .await?;
//!     println!("registers: {:02X?}", response.data);
//!
//!     handler.transporter().close().await?;
//!     session.await.ok();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │ Function-code API   │   (caller)
//! └─────────────────────┘
//!      │ encode / verify / decode      │ send
//! ┌─────────────────────┐    ┌─────────────────────┐
//! │ TcpPackager         │    │ TcpTransporter      │
//! │ (MBAP frame codec)  │    │ connection, timers  │
//! └─────────────────────┘    └─────────────────────┘
//!                                 │            ▲
//!                            write frame   read loop ──► push handler
//!                                 ▼            │
//!                            ┌─────────────────────┐
//!                            │ Modbus TCP device   │
//!                            └─────────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// MBAP constants and the protocol data unit
pub mod protocol;

/// MBAP frame encoding, decoding and verification
pub mod codec;

/// Transaction id to response slot table
pub mod correlation;

/// Serializable transport configuration
pub mod config;

/// TCP connection management and the background read loop
pub mod transport;

/// Packager and transporter bundled for function-code clients
pub mod handler;

/// Callback based diagnostic log sink
pub mod logging;

/// Formatting helpers and operation timing
pub mod utils;

// Re-export main types for convenience
pub use codec::{Packager, TcpPackager, VerifyMode};
pub use config::TcpTransportConfig;
pub use error::{ModbusError, ModbusResult};
pub use handler::TcpClientHandler;
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};
pub use protocol::{ModbusFunction, ProtocolDataUnit, TransactionId, UnitId};
pub use transport::{PushHandler, TcpTransporter, TcpTransporterBuilder, TransportStats, Transporter};

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = protocol::MAX_TCP_FRAME_SIZE;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Modbus Link v{} - Modbus TCP client transport by Evan Liu", VERSION)
}
