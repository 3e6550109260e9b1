//! Serial M-Bus transport.
//!
//! Owns the byte level framing of the request side, the decoders above only
//! ever see the raw response frame as it came off the line.

use crate::metering_mbus::MbusError;
use log::debug;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::SerialPortBuilderExt;

/// Short frame start/stop bytes per EN 13757-2.
const FRAME_START: u8 = 0x10;
const FRAME_STOP: u8 = 0x16;

/// REQ_UD control bytes the meter understands.
pub const REQ_UD1: u8 = 0x5B;
pub const REQ_UD2: u8 = 0x7B;

/// Larger than any telegram the meter answers with.
const RECV_BUFFER: usize = 512;
/// Gap that ends a response frame once bytes have started arriving.
const INTER_BYTE_TIMEOUT: Duration = Duration::from_millis(200);

pub struct MbusTransport {
    port: tokio_serial::SerialStream,
}

impl MbusTransport {
    /// Opens the serial line, M-Bus is always 8E1.
    pub async fn connect(device: &str, baudrate: u32) -> Result<Self, MbusError> {
        let port = tokio_serial::new(device, baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::Even)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .map_err(|e| MbusError::Io(e.to_string()))?;

        return Ok(MbusTransport { port });
    }

    /// Sends a short request frame: start, control, address, checksum, stop.
    pub async fn send_request(&mut self, address: u8, control: u8) -> Result<(), MbusError> {
        let checksum = control.wrapping_add(address);
        let frame = [FRAME_START, control, address, checksum, FRAME_STOP];

        debug!("Sending request frame {frame:02X?}");
        self.port
            .write_all(&frame)
            .await
            .map_err(|e| MbusError::Io(e.to_string()))?;
        self.port
            .flush()
            .await
            .map_err(|e| MbusError::Io(e.to_string()))?;
        return Ok(());
    }

    /// Collects one response frame. Waits up to `deadline` for the first
    /// byte, then keeps reading until the line goes quiet. Nothing at all
    /// within the deadline is a timeout.
    pub async fn receive_frame(&mut self, deadline: Duration) -> Result<Vec<u8>, MbusError> {
        let mut frame: Vec<u8> = Vec::new();
        let mut chunk = [0u8; RECV_BUFFER];
        let start = tokio::time::Instant::now();

        loop {
            let wait = if frame.is_empty() {
                match deadline.checked_sub(start.elapsed()) {
                    Some(left) if left > Duration::ZERO => left,
                    _ => return Err(MbusError::Timeout),
                }
            } else {
                INTER_BYTE_TIMEOUT
            };

            match timeout(wait, self.port.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => frame.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(MbusError::Io(e.to_string())),
                Err(_) if frame.is_empty() => return Err(MbusError::Timeout),
                Err(_) => break,
            }
        }

        debug!("Received {} byte frame", frame.len());
        return Ok(frame);
    }
}
