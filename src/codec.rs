//! # MBAP Frame Codec
//!
//! Converts protocol data units to and from Modbus TCP application data units
//! and checks that a response frame belongs to the request that produced it.
//!
//! ```text
//! ┌──────────────┬─────────────┬────────┬─────────┬───────────┬──────────┐
//! │ Transaction  │ Protocol id │ Length │ Unit id │ Function  │ Data     │
//! │ id (2)       │ (2) = 0     │ (2)    │ (1)     │ code (1)  │ (n)      │
//! └──────────────┴─────────────┴────────┴─────────┴───────────┴──────────┘
//! ```
//!
//! `Length` counts the unit id, the function code and the data. All fields
//! are big-endian.
//!
//! ## Example
//!
//! ```rust
//! use voltage_modbus_link::codec::{Packager, TcpPackager};
//! use voltage_modbus_link::ProtocolDataUnit;
//!
//! let packager = TcpPackager::new(17);
//! let pdu = ProtocolDataUnit::new(0x03, vec![0x00, 0x6B, 0x00, 0x03]);
//! let frame = packager.encode(&pdu).unwrap();
//! assert_eq!(&frame[2..], &[0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]);
//!
//! let decoded = packager.decode(&frame).unwrap();
//! assert_eq!(decoded, pdu);
//! ```

use std::sync::atomic::{AtomicU16, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::protocol::{
    self, ProtocolDataUnit, TransactionId, UnitId, MAX_PDU_DATA_SIZE, MBAP_HEADER_SIZE,
    PUSH_TRANSACTION_ID, TCP_PROTOCOL_ID,
};

/// How header mismatches between request and response are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// Log the mismatch and accept the response
    #[default]
    Lenient,
    /// Reject the response with `ModbusError::VerificationMismatch`
    Strict,
}

/// Frame encoding capability consumed by the function-code layer
pub trait Packager: Send + Sync {
    /// Wrap a PDU into a complete wire frame
    fn encode(&self, pdu: &ProtocolDataUnit) -> ModbusResult<Vec<u8>>;

    /// Extract the PDU from a complete wire frame
    fn decode(&self, frame: &[u8]) -> ModbusResult<ProtocolDataUnit>;

    /// Check that `response` answers `request`
    fn verify(&self, request: &[u8], response: &[u8]) -> ModbusResult<()>;
}

/// Modbus TCP (MBAP) packager
///
/// Owns the transaction counter, so one packager should be shared by every
/// request that travels over the same connection.
#[derive(Debug)]
pub struct TcpPackager {
    transaction_id: AtomicU16,
    unit_id: UnitId,
    verify_mode: VerifyMode,
    logger: CallbackLogger,
}

impl TcpPackager {
    /// Create a packager addressing `unit_id`
    pub fn new(unit_id: UnitId) -> Self {
        Self {
            transaction_id: AtomicU16::new(0),
            unit_id,
            verify_mode: VerifyMode::default(),
            logger: CallbackLogger::default(),
        }
    }

    /// Select how verification failures are reported
    pub fn with_verify_mode(mut self, mode: VerifyMode) -> Self {
        self.verify_mode = mode;
        self
    }

    /// Attach a diagnostic log sink
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Seed the counter; the next encoded frame uses `last + 1`
    pub fn with_transaction_id(self, last: TransactionId) -> Self {
        self.transaction_id.store(last, Ordering::SeqCst);
        self
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    pub fn verify_mode(&self) -> VerifyMode {
        self.verify_mode
    }

    /// Transaction id used by the most recent `encode`
    pub fn last_transaction_id(&self) -> TransactionId {
        self.transaction_id.load(Ordering::SeqCst)
    }

    /// Get next transaction ID
    ///
    /// Wraps at 65535 and skips 0, which peers use for unsolicited frames.
    fn next_transaction_id(&self) -> TransactionId {
        loop {
            let id = self
                .transaction_id
                .fetch_add(1, Ordering::SeqCst)
                .wrapping_add(1);
            if id != PUSH_TRANSACTION_ID {
                return id;
            }
        }
    }

    fn mismatch(&self, field: &'static str, request: u16, response: u16) -> ModbusResult<()> {
        let error = ModbusError::verification_mismatch(field, request, response);
        match self.verify_mode {
            VerifyMode::Strict => Err(error),
            VerifyMode::Lenient => {
                self.logger.warn(&format!("modbus: {}", error));
                Ok(())
            }
        }
    }
}

impl Default for TcpPackager {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Packager for TcpPackager {
    fn encode(&self, pdu: &ProtocolDataUnit) -> ModbusResult<Vec<u8>> {
        if pdu.data.len() > MAX_PDU_DATA_SIZE {
            return Err(ModbusError::encoding(format!(
                "pdu data length {} exceeds maximum {}",
                pdu.data.len(),
                MAX_PDU_DATA_SIZE
            )));
        }

        let transaction_id = self.next_transaction_id();
        // unit id + function code + data
        let length = (2 + pdu.data.len()) as u16;

        let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + pdu.encoded_len());
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&TCP_PROTOCOL_ID.to_be_bytes());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.push(self.unit_id);
        frame.push(pdu.function_code);
        frame.extend_from_slice(&pdu.data);

        Ok(frame)
    }

    fn decode(&self, frame: &[u8]) -> ModbusResult<ProtocolDataUnit> {
        let length = protocol::declared_length(frame)
            .ok_or_else(|| ModbusError::frame_too_short(frame.len(), MBAP_HEADER_SIZE + 1))?
            as usize;
        let pdu_length = frame.len().saturating_sub(MBAP_HEADER_SIZE);

        // The unit id is counted by the length field but is not part of the PDU
        if pdu_length == 0 || pdu_length + 1 != length {
            let error = ModbusError::frame_length_mismatch(length.saturating_sub(1), pdu_length);
            self.logger.warn(&format!("modbus: {}", error));
            return Err(error);
        }

        Ok(ProtocolDataUnit {
            function_code: frame[MBAP_HEADER_SIZE],
            data: frame[MBAP_HEADER_SIZE + 1..].to_vec(),
        })
    }

    fn verify(&self, request: &[u8], response: &[u8]) -> ModbusResult<()> {
        for frame in [request, response] {
            if frame.len() < MBAP_HEADER_SIZE {
                return Err(ModbusError::frame_too_short(frame.len(), MBAP_HEADER_SIZE));
            }
        }

        let (req, resp) = (
            protocol::transaction_id(request).unwrap_or_default(),
            protocol::transaction_id(response).unwrap_or_default(),
        );
        if req != resp {
            return self.mismatch("transaction id", req, resp);
        }

        let (req, resp) = (
            protocol::protocol_id(request).unwrap_or_default(),
            protocol::protocol_id(response).unwrap_or_default(),
        );
        if req != resp {
            return self.mismatch("protocol id", req, resp);
        }

        let (req, resp) = (request[6], response[6]);
        if req != resp {
            return self.mismatch("unit id", req as u16, resp as u16);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::logging::{LogCallback, LogLevel};

    fn capture_logger() -> (CallbackLogger, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |_level, message| {
            sink.lock().unwrap().push(message.to_string());
        });
        (CallbackLogger::new(Some(callback), LogLevel::Debug), lines)
    }

    #[test]
    fn test_encode_read_holding_registers() {
        let packager = TcpPackager::new(17);
        let pdu = ProtocolDataUnit::new(3, vec![0, 107, 0, 3]);

        let frame = packager.encode(&pdu).unwrap();
        assert_eq!(
            frame,
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]
        );
    }

    #[test]
    fn test_length_field_and_frame_size() {
        let packager = TcpPackager::new(1);
        for len in [0usize, 1, 4, 100, MAX_PDU_DATA_SIZE] {
            let pdu = ProtocolDataUnit::new(0x10, vec![0xAA; len]);
            let frame = packager.encode(&pdu).unwrap();
            assert_eq!(frame.len(), MBAP_HEADER_SIZE + 1 + len);
            assert_eq!(protocol::declared_length(&frame), Some((2 + len) as u16));
        }
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let packager = TcpPackager::new(1);
        let pdu = ProtocolDataUnit::new(0x10, vec![0; MAX_PDU_DATA_SIZE + 1]);

        let err = packager.encode(&pdu).unwrap_err();
        assert!(matches!(err, ModbusError::Encoding { .. }));
        // the failed request does not consume a transaction id
        assert_eq!(packager.last_transaction_id(), 0);
    }

    #[test]
    fn test_transaction_ids_increase_and_skip_zero() {
        let packager = TcpPackager::new(1).with_transaction_id(65533);
        let pdu = ProtocolDataUnit::new(0x03, vec![0, 0, 0, 1]);

        let ids: Vec<u16> = (0..4)
            .map(|_| protocol::transaction_id(&packager.encode(&pdu).unwrap()).unwrap())
            .collect();
        assert_eq!(ids, vec![65534, 65535, 1, 2]);
    }

    #[test]
    fn test_decode_response() {
        let packager = TcpPackager::new(247);
        let frame = [0x00, 0x05, 0x00, 0x00, 0x00, 0x06, 0xF7, 0x03, 0x13, 0x89, 0x00, 0x0A];

        let pdu = packager.decode(&frame).unwrap();
        assert_eq!(pdu.function_code, 3);
        assert_eq!(pdu.data, vec![0x13, 0x89, 0x00, 0x0A]);
    }

    #[test]
    fn test_decode_round_trip_boundaries() {
        let packager = TcpPackager::new(9);
        for len in [0usize, 251] {
            let pdu = ProtocolDataUnit::new(0x17, (0..len).map(|i| i as u8).collect::<Vec<_>>());
            let decoded = packager.decode(&packager.encode(&pdu).unwrap()).unwrap();
            assert_eq!(decoded, pdu);
        }
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let (logger, lines) = capture_logger();
        let packager = TcpPackager::new(1).with_logger(logger);

        // declares 4 PDU bytes, carries 5
        let frame = [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x0A, 0xFF];
        let err = packager.decode(&frame).unwrap_err();
        assert_eq!(err, ModbusError::frame_length_mismatch(4, 5));
        assert_eq!(lines.lock().unwrap().len(), 1);

        // header only
        let err = packager.decode(&frame[..7]).unwrap_err();
        assert!(matches!(err, ModbusError::FrameLengthMismatch { actual: 0, .. }));

        let err = packager.decode(&frame[..3]).unwrap_err();
        assert!(matches!(err, ModbusError::FrameTooShort { length: 3, .. }));
    }

    #[test]
    fn test_verify_accepts_own_frame() {
        let packager = TcpPackager::new(5).with_verify_mode(VerifyMode::Strict);
        let frame = packager
            .encode(&ProtocolDataUnit::new(0x04, vec![0, 1, 0, 2]))
            .unwrap();
        assert!(packager.verify(&frame, &frame).is_ok());
    }

    #[test]
    fn test_verify_strict_reports_first_mismatch() {
        let packager = TcpPackager::new(1).with_verify_mode(VerifyMode::Strict);
        let request = [0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];

        let mut response = [0x00, 0x08, 0x00, 0x01, 0x00, 0x05, 0x02, 0x03, 0x02, 0x00, 0x01];
        assert_eq!(
            packager.verify(&request, &response).unwrap_err(),
            ModbusError::verification_mismatch("transaction id", 7, 8)
        );

        response[1] = 0x07;
        assert_eq!(
            packager.verify(&request, &response).unwrap_err(),
            ModbusError::verification_mismatch("protocol id", 0, 1)
        );

        response[3] = 0x00;
        assert_eq!(
            packager.verify(&request, &response).unwrap_err(),
            ModbusError::verification_mismatch("unit id", 1, 2)
        );

        response[6] = 0x01;
        assert!(packager.verify(&request, &response).is_ok());
    }

    #[test]
    fn test_verify_lenient_logs_only() {
        let (logger, lines) = capture_logger();
        let packager = TcpPackager::new(1).with_logger(logger);
        let request = [0x00, 0x07, 0x00, 0x00, 0x00, 0x02, 0x01, 0x03];
        let response = [0x00, 0x09, 0x00, 0x00, 0x00, 0x02, 0x01, 0x03];

        assert!(packager.verify(&request, &response).is_ok());
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("transaction id"));
    }

    #[test]
    fn test_verify_short_frame() {
        let packager = TcpPackager::new(1);
        let err = packager.verify(&[0, 1, 0], &[0, 1, 0, 0, 0, 2, 1]).unwrap_err();
        assert!(matches!(err, ModbusError::FrameTooShort { length: 3, .. }));
    }
}
