use crate::error::Result;
use crate::packet::{Packet, HEADER_LEN, SAMPLE_LEN};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{info, warn};
use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// In-band event pushed by the receive thread.
#[derive(Debug)]
pub enum SourceEvent {
    Packet(Packet),
    /// Clean end-of-stream marker from the server.
    EndOfStream,
    /// The data connection died mid-stream.
    Disconnected(String),
}

/// What a blocking `receive` call yielded.
#[derive(Debug)]
pub enum Receive {
    Packet(Packet),
    EndOfStream,
    Disconnected(String),
    TimedOut,
}

/// Ordered, bounded packet feed from the server.
///
/// A dedicated thread owns the data socket and parses packets into a bounded
/// queue, so a slow disk write never blocks network receipt. When the
/// consumer falls behind, packets are dropped at the queue boundary and
/// counted; the induced sequence gap stays observable downstream. The
/// end-of-stream and disconnect events are never dropped.
pub struct PacketSource {
    rx: Receiver<SourceEvent>,
    dropped: Arc<AtomicU64>,
}

impl PacketSource {
    /// Connects to the server's data port and starts the receive thread.
    /// The connection and the thread persist across measurements; each
    /// measurement ends with an in-band `EndOfStream`.
    pub fn connect(host: &str, port: u16, queue_depth: usize) -> Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        info!("data connection established to {host}:{port}");
        let (tx, rx) = bounded(queue_depth);
        let dropped = Arc::new(AtomicU64::new(0));
        let drop_count = Arc::clone(&dropped);
        thread::Builder::new()
            .name("packet-rx".into())
            .spawn(move || receive_loop(stream, tx, drop_count))?;
        Ok(Self { rx, dropped })
    }

    /// Builds a source from a plain receiver; used by simulators and tests
    /// to feed the pipeline without a server.
    pub fn from_channel(rx: Receiver<SourceEvent>, dropped: Arc<AtomicU64>) -> Self {
        Self { rx, dropped }
    }

    /// Blocks up to `timeout` for the next event, in exact arrival order.
    pub fn receive(&self, timeout: Duration) -> Receive {
        match self.rx.recv_timeout(timeout) {
            Ok(SourceEvent::Packet(p)) => Receive::Packet(p),
            Ok(SourceEvent::EndOfStream) => Receive::EndOfStream,
            Ok(SourceEvent::Disconnected(reason)) => Receive::Disconnected(reason),
            Err(RecvTimeoutError::Timeout) => Receive::TimedOut,
            Err(RecvTimeoutError::Disconnected) => {
                Receive::Disconnected("receive thread gone".into())
            }
        }
    }

    /// Packets dropped at the queue boundary since the last call.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }

    /// Packets currently waiting in the queue.
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }
}

fn receive_loop(mut stream: TcpStream, tx: Sender<SourceEvent>, dropped: Arc<AtomicU64>) {
    let mut header = [0u8; HEADER_LEN];
    let mut body = Vec::new();
    loop {
        if let Err(e) = stream.read_exact(&mut header) {
            let _ = tx.send(SourceEvent::Disconnected(e.to_string()));
            return;
        }
        let meta = match Packet::parse_header(&header) {
            Some(meta) => meta,
            None => {
                // end marker; the connection stays up for the next run
                if tx.send(SourceEvent::EndOfStream).is_err() {
                    return;
                }
                continue;
            }
        };
        body.resize(meta.samples as usize * meta.channels as usize * SAMPLE_LEN, 0);
        if let Err(e) = stream.read_exact(&mut body) {
            let _ = tx.send(SourceEvent::Disconnected(e.to_string()));
            return;
        }
        let packet = match Packet::parse_body(meta, &body) {
            Ok(p) => p,
            Err(e) => {
                let _ = tx.send(SourceEvent::Disconnected(e.to_string()));
                return;
            }
        };
        if forward(&tx, &dropped, packet).is_err() {
            return;
        }
    }
}

/// Pushes one packet into the bounded queue, dropping it (and counting the
/// drop) when the consumer has fallen behind. Overflow is lossy but
/// recoverable; only a closed queue ends the receive thread.
fn forward(
    tx: &Sender<SourceEvent>,
    dropped: &AtomicU64,
    packet: Packet,
) -> std::result::Result<(), ()> {
    match tx.try_send(SourceEvent::Packet(packet)) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(ev)) => {
            let n = dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n == 1 || n % 1000 == 0 {
                if let SourceEvent::Packet(p) = &ev {
                    warn!("receive queue full, dropped packet {} ({n} total)", p.meta.seq);
                }
            }
            Ok(())
        }
        Err(TrySendError::Disconnected(_)) => Err(()),
    }
}
