/// Modbus TCP client handler
///
/// Bundles the MBAP packager and the TCP transporter behind the two
/// capabilities a function-code client needs: frame encoding and frame
/// transport. `execute` runs the complete request pipeline for one PDU.
///
/// ```rust,no_run
/// use voltage_modbus_link::{ProtocolDataUnit, TcpClientHandler, TcpTransportConfig, Transporter};
///
/// # async fn example() -> voltage_modbus_link::ModbusResult<()> {
/// let handler = TcpClientHandler::new(TcpTransportConfig::new("127.0.0.1:502").with_unit_id(1));
/// let session = handler.transporter().open().await?;
///
/// // read 1 discrete input at address 200
/// let response = handler
///     .execute(&ProtocolDataUnit::new(0x02, vec![0x00, 0xC8, 0x00, 0x01]))
///     .await?;
/// println!("inputs: {:02X?}", response.data);
///
/// handler.close().await?;
/// session.await.ok();
/// # Ok(())
/// # }
/// ```

use async_trait::async_trait;

use crate::codec::{Packager, TcpPackager};
use crate::config::TcpTransportConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ProtocolDataUnit, EXCEPTION_FLAG};
use crate::transport::{TcpTransporter, TcpTransporterBuilder, Transporter};

/// Packager and transporter sharing one configuration
pub struct TcpClientHandler {
    packager: TcpPackager,
    transporter: TcpTransporter,
}

impl TcpClientHandler {
    /// Create a handler without push handler or log sink
    pub fn new(config: TcpTransportConfig) -> Self {
        let packager = TcpPackager::new(config.unit_id).with_verify_mode(config.verify_mode);
        Self {
            packager,
            transporter: TcpTransporter::new(config),
        }
    }

    /// Create a handler from a configured transporter builder
    ///
    /// The packager shares the transporter's log sink.
    pub fn from_builder(builder: TcpTransporterBuilder) -> Self {
        let transporter = builder.build();
        let config = transporter.config();
        let packager = TcpPackager::new(config.unit_id)
            .with_verify_mode(config.verify_mode)
            .with_logger(transporter.logger().clone());
        Self {
            packager,
            transporter,
        }
    }

    pub fn packager(&self) -> &TcpPackager {
        &self.packager
    }

    pub fn transporter(&self) -> &TcpTransporter {
        &self.transporter
    }

    /// Encode, send, verify and decode one request
    ///
    /// Exception responses are turned into `ModbusError::Exception`; a
    /// response carrying another function code is rejected.
    pub async fn execute(&self, request: &ProtocolDataUnit) -> ModbusResult<ProtocolDataUnit> {
        let request_frame = self.packager.encode(request)?;
        let response_frame = self.transporter.send(&request_frame).await?;
        self.packager.verify(&request_frame, &response_frame)?;
        let response = self.packager.decode(&response_frame)?;

        if response.function_code == request.function_code | EXCEPTION_FLAG {
            let code = response.exception_code().unwrap_or_default();
            return Err(ModbusError::exception(request.function_code, code));
        }
        if response.function_code != request.function_code {
            return Err(ModbusError::unexpected_function(
                request.function_code,
                response.function_code,
            ));
        }
        Ok(response)
    }
}

impl Packager for TcpClientHandler {
    fn encode(&self, pdu: &ProtocolDataUnit) -> ModbusResult<Vec<u8>> {
        self.packager.encode(pdu)
    }

    fn decode(&self, frame: &[u8]) -> ModbusResult<ProtocolDataUnit> {
        self.packager.decode(frame)
    }

    fn verify(&self, request: &[u8], response: &[u8]) -> ModbusResult<()> {
        self.packager.verify(request, response)
    }
}

#[async_trait]
impl Transporter for TcpClientHandler {
    async fn connect(&self) -> ModbusResult<()> {
        self.transporter.connect().await
    }

    async fn send(&self, request: &[u8]) -> ModbusResult<Vec<u8>> {
        self.transporter.send(request).await
    }

    async fn close(&self) -> ModbusResult<()> {
        self.transporter.close().await
    }

    fn is_connected(&self) -> bool {
        self.transporter.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::VerifyMode;

    #[test]
    fn test_handler_uses_config() {
        let config = TcpTransportConfig::new("127.0.0.1:502")
            .with_unit_id(17)
            .with_verify_mode(VerifyMode::Strict);
        let handler = TcpClientHandler::new(config);

        assert_eq!(handler.packager().unit_id(), 17);
        assert_eq!(handler.packager().verify_mode(), VerifyMode::Strict);
        assert_eq!(handler.transporter().config().address, "127.0.0.1:502");
    }

    #[test]
    fn test_handler_encodes_with_unit_id() {
        let handler = TcpClientHandler::new(TcpTransportConfig::new("127.0.0.1:502").with_unit_id(17));
        let frame = handler
            .encode(&ProtocolDataUnit::new(3, vec![0, 107, 0, 3]))
            .unwrap();
        assert_eq!(frame[6], 17);
        assert_eq!(handler.decode(&frame).unwrap().data, vec![0, 107, 0, 3]);
    }

    #[tokio::test]
    async fn test_execute_without_connection() {
        let handler = TcpClientHandler::new(TcpTransportConfig::new("127.0.0.1:502"));
        let err = handler
            .execute(&ProtocolDataUnit::new(0x01, vec![0, 0, 0, 8]))
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Connection { .. }));
        assert!(!Transporter::is_connected(&handler));
    }
}
