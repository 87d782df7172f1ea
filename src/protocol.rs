/// Modbus protocol definitions and data structures
///
/// This module contains the MBAP framing constants and the protocol data unit
/// exchanged between the function-code layer and the TCP link.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Modbus slave/unit identifier (0 = broadcast)
pub type UnitId = u8;

/// MBAP transaction identifier
pub type TransactionId = u16;

/// Protocol identifier carried by every Modbus TCP frame
pub const TCP_PROTOCOL_ID: u16 = 0x0000;

/// MBAP header size: transaction id (2) + protocol id (2) + length (2) + unit id (1)
pub const MBAP_HEADER_SIZE: usize = 7;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Smallest complete frame: header + function code
pub const MIN_TCP_FRAME_SIZE: usize = MBAP_HEADER_SIZE + 1;

/// Largest data section a single frame can carry
pub const MAX_PDU_DATA_SIZE: usize = MAX_TCP_FRAME_SIZE - MIN_TCP_FRAME_SIZE;

/// Largest value accepted in the MBAP length field (unit id + function code + data)
pub const MAX_MBAP_LENGTH: usize = MAX_TCP_FRAME_SIZE - (MBAP_HEADER_SIZE - 1);

/// Transaction id reserved for unsolicited, device-initiated frames
pub const PUSH_TRANSACTION_ID: TransactionId = 0;

/// Bit set in the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Modbus protocol data unit: function code plus function-specific data
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolDataUnit {
    pub function_code: u8,
    pub data: Vec<u8>,
}

impl ProtocolDataUnit {
    /// Create a new PDU
    pub fn new(function_code: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            function_code,
            data: data.into(),
        }
    }

    /// Check if this PDU is an exception response
    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_FLAG != 0
    }

    /// Exception code of an exception response
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.data.first().copied()
        } else {
            None
        }
    }

    /// Encoded size of this PDU (function code + data)
    pub fn encoded_len(&self) -> usize {
        1 + self.data.len()
    }
}

/// Well-known Modbus function codes, used for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Read/Write Multiple Registers (0x17)
    ReadWriteMultipleRegisters = 0x17,
}

impl ModbusFunction {
    /// Convert from u8, ignoring the exception flag
    pub fn from_u8(value: u8) -> Option<Self> {
        match value & !EXCEPTION_FLAG {
            0x01 => Some(ModbusFunction::ReadCoils),
            0x02 => Some(ModbusFunction::ReadDiscreteInputs),
            0x03 => Some(ModbusFunction::ReadHoldingRegisters),
            0x04 => Some(ModbusFunction::ReadInputRegisters),
            0x05 => Some(ModbusFunction::WriteSingleCoil),
            0x06 => Some(ModbusFunction::WriteSingleRegister),
            0x0F => Some(ModbusFunction::WriteMultipleCoils),
            0x10 => Some(ModbusFunction::WriteMultipleRegisters),
            0x17 => Some(ModbusFunction::ReadWriteMultipleRegisters),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable name of the function
    pub fn name(self) -> &'static str {
        match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
            ModbusFunction::ReadWriteMultipleRegisters => "Read/Write Multiple Registers",
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Read the transaction id (bytes 0-1) of a frame
pub fn transaction_id(frame: &[u8]) -> Option<TransactionId> {
    frame.get(0..2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Read the protocol id (bytes 2-3) of a frame
pub fn protocol_id(frame: &[u8]) -> Option<u16> {
    frame.get(2..4).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Read the declared MBAP length (bytes 4-5) of a frame
pub fn declared_length(frame: &[u8]) -> Option<u16> {
    frame.get(4..6).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Read the unit id (byte 6) of a frame
pub fn unit_id(frame: &[u8]) -> Option<UnitId> {
    frame.get(6).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_limits() {
        assert_eq!(MAX_PDU_DATA_SIZE, 252);
        assert_eq!(MAX_MBAP_LENGTH, 254);
        assert_eq!(MIN_TCP_FRAME_SIZE, 8);
    }

    #[test]
    fn test_header_accessors() {
        let frame = [0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03];
        assert_eq!(transaction_id(&frame), Some(0x1234));
        assert_eq!(protocol_id(&frame), Some(0));
        assert_eq!(declared_length(&frame), Some(6));
        assert_eq!(unit_id(&frame), Some(0x11));
        assert_eq!(transaction_id(&frame[..1]), None);
        assert_eq!(unit_id(&frame[..6]), None);
    }

    #[test]
    fn test_exception_pdu() {
        let pdu = ProtocolDataUnit::new(0x83, vec![0x02]);
        assert!(pdu.is_exception());
        assert_eq!(pdu.exception_code(), Some(0x02));

        let pdu = ProtocolDataUnit::new(0x03, vec![0x02, 0x00, 0x01]);
        assert!(!pdu.is_exception());
        assert_eq!(pdu.exception_code(), None);
        assert_eq!(pdu.encoded_len(), 4);
    }

    #[test]
    fn test_function_names() {
        assert_eq!(ModbusFunction::from_u8(0x03), Some(ModbusFunction::ReadHoldingRegisters));
        assert_eq!(ModbusFunction::from_u8(0x83), Some(ModbusFunction::ReadHoldingRegisters));
        assert_eq!(ModbusFunction::from_u8(0x63), None);
        assert_eq!(
            ModbusFunction::WriteMultipleRegisters.to_string(),
            "Write Multiple Registers (0x10)"
        );
    }
}
