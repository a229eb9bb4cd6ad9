use crate::error::{Error, Result};
use log::{debug, info};
use serde::Deserialize;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Protocol-mandated window between command acceptance and the first data
/// packet. Callers must add it to any first-packet timeout instead of
/// treating the quiet window as a stall.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

const MAX_ACK_LEN: u32 = 64 * 1024;

#[derive(Debug, Deserialize)]
struct Ack {
    accepted: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Control connection to the server.
///
/// Established once and reused across consecutive measurements; commands are
/// never pipelined — the driver holds an exclusive borrow for the lifetime
/// of a measurement.
pub struct CommandChannel {
    stream: TcpStream,
}

impl CommandChannel {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        info!("control connection established to {host}:{port}");
        Ok(Self { stream })
    }

    /// Transmits one serialized command and waits for the server's ack.
    /// A refused command or a dead connection is always surfaced.
    pub fn send(&mut self, command: &str) -> Result<()> {
        let bytes = command.as_bytes();
        self.stream.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        debug!("command sent ({} bytes), awaiting ack", bytes.len());

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_ACK_LEN {
            return Err(Error::Protocol(format!("ack length {len} out of range")));
        }
        let mut ack_buf = vec![0u8; len as usize];
        self.stream.read_exact(&mut ack_buf)?;
        let ack: Ack = serde_json::from_slice(&ack_buf)
            .map_err(|e| Error::Protocol(format!("malformed ack: {e}")))?;
        if !ack.accepted {
            return Err(Error::Refused(
                ack.reason.unwrap_or_else(|| "no reason given".into()),
            ));
        }
        info!("command accepted by server");
        Ok(())
    }
}
