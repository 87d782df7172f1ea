use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::sleep;
use voltage_modbus_link::{
    custom_logger, LogCallback, LogLevel, LoggingMode, ModbusResult, ProtocolDataUnit,
    TcpClientHandler, TcpTransportConfig, TcpTransporter, VerifyMode,
};

/// Minimal device: answers read requests with the register address as value
/// and sends one unsolicited frame after the first response
async fn run_device(listener: TcpListener) -> std::io::Result<()> {
    let (mut stream, peer) = listener.accept().await?;
    println!("🔌 Device accepted connection from {}", peer);

    let mut pushed = false;
    loop {
        let mut header = [0u8; 7];
        if stream.read_exact(&mut header).await.is_err() {
            println!("🔌 Device connection closed");
            return Ok(());
        }
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut pdu = vec![0u8; length.saturating_sub(1)];
        stream.read_exact(&mut pdu).await?;

        let function = pdu[0];
        let response_pdu = match function {
            0x03 | 0x04 => {
                let start = u16::from_be_bytes([pdu[1], pdu[2]]);
                let count = u16::from_be_bytes([pdu[3], pdu[4]]);
                let mut data = vec![function, (count * 2) as u8];
                for register in start..start + count {
                    data.extend_from_slice(&register.to_be_bytes());
                }
                data
            }
            // illegal function
            _ => vec![function | 0x80, 0x01],
        };

        let mut frame = header[0..4].to_vec();
        frame.extend_from_slice(&((response_pdu.len() + 1) as u16).to_be_bytes());
        frame.push(header[6]);
        frame.extend_from_slice(&response_pdu);
        stream.write_all(&frame).await?;

        if !pushed {
            pushed = true;
            stream
                .write_all(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x05, header[6], 0x04, 0x02, 0x00, 0x2A])
                .await?;
        }
    }
}

#[tokio::main]
async fn main() -> ModbusResult<()> {
    println!("🚀 Voltage Modbus Link - TCP Client Demo");
    println!("========================================\n");

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?.to_string();
    tokio::spawn(async move {
        if let Err(e) = run_device(listener).await {
            eprintln!("Device error: {}", e);
        }
    });

    let callback: LogCallback = Box::new(|level, message| {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let level_emoji = match level {
            LogLevel::Error => "❌",
            LogLevel::Warn => "⚠️",
            LogLevel::Info => "📋",
            LogLevel::Debug => "🔍",
        };
        println!("[{}] {} [{}] {}", timestamp, level_emoji, level.as_str(), message);
    });
    let logger = custom_logger!(callback, LogLevel::Debug, LoggingMode::Both);

    let config = TcpTransportConfig::new(address.clone())
        .with_timeout(Duration::from_secs(1))
        .with_idle_timeout(Duration::from_secs(2))
        .with_unit_id(1)
        .with_verify_mode(VerifyMode::Strict);

    let handler = TcpClientHandler::from_builder(
        TcpTransporter::builder(config)
            .logger(logger)
            .push_handler(|frame| println!("📨 Push message: {:02X?}", frame)),
    );

    println!("🔧 Connecting to simulated device at {}...", address);
    let session = handler.transporter().open().await?;

    println!("\n📋 Test 1: Read holding registers");
    match handler
        .execute(&ProtocolDataUnit::new(0x03, vec![0x00, 0x6B, 0x00, 0x03]))
        .await
    {
        Ok(response) => println!("✅ Response data: {:02X?}\n", response.data),
        Err(e) => println!("❌ Failed: {}\n", e),
    }

    println!("📋 Test 2: Unsupported function");
    match handler
        .execute(&ProtocolDataUnit::new(0x2B, vec![0x0E, 0x01, 0x00]))
        .await
    {
        Ok(response) => println!("⚠️ Unexpected success: {:02X?}\n", response.data),
        Err(e) => println!("✅ Expected exception: {}\n", e),
    }

    println!("📋 Test 3: Pipelined reads");
    let pdus: Vec<ProtocolDataUnit> = (0..4u8)
        .map(|i| ProtocolDataUnit::new(0x04, vec![0x00, i * 10, 0x00, 0x02]))
        .collect();
    let (r0, r1, r2, r3) = tokio::join!(
        handler.execute(&pdus[0]),
        handler.execute(&pdus[1]),
        handler.execute(&pdus[2]),
        handler.execute(&pdus[3]),
    );
    for (pdu, result) in pdus.iter().zip([r0, r1, r2, r3]) {
        match result {
            Ok(response) => println!("✅ Input registers from {}: {:02X?}", pdu.data[1], response.data),
            Err(e) => println!("❌ Failed: {}", e),
        }
    }

    let stats = handler.transporter().stats();
    println!("\n📊 Transport statistics: {:?}", stats);

    println!("\n⏳ Waiting for the idle timeout to close the connection...");
    sleep(Duration::from_secs(3)).await;
    println!("🔌 Connected: {}", handler.transporter().is_connected());

    match session.await {
        Ok(Ok(())) => println!("✅ Session ended cleanly"),
        Ok(Err(e)) => println!("❌ Session ended with error: {}", e),
        Err(e) => println!("❌ Session task failed: {}", e),
    }

    println!("\n🎉 Demo completed!");
    Ok(())
}
