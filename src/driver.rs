use crate::command::{CommandChannel, SETTLE_DELAY};
use crate::error::{Error, Result};
use crate::params::ParameterSet;
use crate::source::{PacketSource, Receive};
use crate::trigger::{Trigger, TriggerControl};
use crate::utils::Counter;
use crate::writer::ContainerWriter;
use log::{debug, error, info, warn};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle of one measurement. Transitions only move forward;
/// `Done` and `Aborted` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    CommandSent,
    Streaming,
    Draining,
    Done,
    Aborted,
}

/// Per-measurement knobs; the connections and the descriptor come
/// separately so they can outlive a single run.
pub struct DriverOptions {
    /// Path of the HDF5 container to create.
    pub output: PathBuf,
    /// Stall window: longest quiet period on the data socket before the
    /// measurement is abandoned. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Cooperative stop flag, checked once per poll tick.
    pub stop: Arc<AtomicBool>,
    /// Tick used to poll the queue and the stop flag.
    pub poll_interval: Duration,
    /// Extra quiet window granted before the first packet only.
    pub settle_delay: Duration,
}

impl DriverOptions {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            timeout: None,
            stop: Arc::new(AtomicBool::new(false)),
            poll_interval: Duration::from_millis(100),
            settle_delay: SETTLE_DELAY,
        }
    }
}

/// What a completed measurement amounted to.
#[derive(Debug)]
pub struct AcquisitionReport {
    pub output: PathBuf,
    pub packets_received: u64,
    pub packets_persisted: u64,
    pub samples_persisted: u64,
    pub sequence_gaps: u64,
    pub packets_dropped: u64,
}

/// A failed measurement, carrying how much data made it to disk before the
/// abort. The container file is never deleted; partial data stays
/// inspectable.
#[derive(Debug)]
pub struct AcquisitionError {
    pub error: Error,
    pub packets_persisted: u64,
    pub samples_persisted: u64,
}

impl std::fmt::Display for AcquisitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} packets, {} samples already persisted)",
            self.error, self.packets_persisted, self.samples_persisted
        )
    }
}

impl std::error::Error for AcquisitionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Orchestrates one measurement end to end: validate the descriptor, send
/// the command, stream packets through the trigger into the container,
/// drain and flush. Borrows the two connections so consecutive
/// measurements reuse them.
pub struct AcquisitionDriver<'a> {
    command: &'a mut CommandChannel,
    source: &'a mut PacketSource,
    params: &'a ParameterSet,
    trigger: Box<dyn Trigger>,
    opts: DriverOptions,
    state: DriverState,
}

impl<'a> AcquisitionDriver<'a> {
    pub fn new(
        command: &'a mut CommandChannel,
        source: &'a mut PacketSource,
        params: &'a ParameterSet,
        trigger: Box<dyn Trigger>,
        opts: DriverOptions,
    ) -> Self {
        Self {
            command,
            source,
            params,
            trigger,
            opts,
            state: DriverState::Idle,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Runs the measurement to completion. On failure the error carries the
    /// persisted counts and the driver lands in `Aborted`.
    pub fn run(&mut self) -> std::result::Result<AcquisitionReport, AcquisitionError> {
        let mut writer = None;
        match self.measure(&mut writer) {
            Ok(report) => {
                self.state = DriverState::Done;
                Ok(report)
            }
            Err(err) => {
                self.state = DriverState::Aborted;
                let (packets, samples) = match &writer {
                    Some(w) => {
                        let _ = w.flush();
                        (w.packets_persisted(), w.samples_persisted())
                    }
                    None => (0, 0),
                };
                error!("measurement aborted: {err}");
                Err(AcquisitionError {
                    error: err,
                    packets_persisted: packets,
                    samples_persisted: samples,
                })
            }
        }
    }

    fn measure(&mut self, writer_slot: &mut Option<ContainerWriter>) -> Result<AcquisitionReport> {
        if self.state != DriverState::Idle {
            return Err(Error::Validation("driver already ran".into()));
        }
        if !self.params.self_check() {
            return Err(Error::Validation(
                "measurement descriptor failed self check".into(),
            ));
        }
        let frontend = self
            .params
            .rx_frontend()
            .ok_or_else(|| Error::Validation("no RX front-end in descriptor".into()))?;
        let wire = self.params.to_wire_form()?;

        self.command.send(&wire)?;
        self.state = DriverState::CommandSent;

        let writer = writer_slot.insert(ContainerWriter::create(
            &self.opts.output,
            self.params,
            &wire,
        )?);
        let group = writer.antenna(frontend)?.group().clone();
        self.trigger.initialize(&group)?;

        let expected = self.params.expected_samples();
        let auto = self.trigger.control() == TriggerControl::Auto;
        info!(
            "command accepted, streaming {frontend} into {}",
            self.opts.output.display()
        );

        let mut counter = Counter::new();
        let mut received = 0u64;
        let mut gaps = 0u64;
        let mut dropped = 0u64;
        let mut next_seq: Option<u64> = None;
        // the first packet gets the stall window plus the settle delay
        let mut deadline = self
            .opts
            .timeout
            .map(|t| Instant::now() + t + self.opts.settle_delay);
        let mut last_log = Instant::now();

        loop {
            if self.opts.stop.load(Ordering::Relaxed) {
                info!("stop requested, draining");
                break;
            }
            match self.source.receive(self.opts.poll_interval) {
                Receive::TimedOut => {
                    if let Some(d) = deadline {
                        if Instant::now() >= d {
                            return Err(Error::Transport(io::Error::new(
                                io::ErrorKind::TimedOut,
                                "data stream stalled",
                            )));
                        }
                    }
                }
                Receive::Disconnected(reason) => {
                    return Err(Error::Transport(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        reason,
                    )));
                }
                Receive::EndOfStream => {
                    info!("end of stream from server");
                    break;
                }
                Receive::Packet(packet) => {
                    received += 1;
                    self.state = DriverState::Streaming;
                    deadline = self.opts.timeout.map(|t| Instant::now() + t);

                    let overflow = self.source.take_dropped();
                    if overflow > 0 {
                        dropped += overflow;
                        warn!("{}", Error::Overflow { dropped: overflow });
                    }

                    let seq = packet.meta.seq;
                    if let Some(want) = next_seq {
                        if seq < want {
                            return Err(Error::Protocol(format!(
                                "sequence regressed: expected {want}, received {seq}"
                            )));
                        }
                        if seq > want {
                            gaps += seq - want;
                            warn!(
                                "{}",
                                Error::SequenceGap {
                                    expected: want,
                                    received: seq
                                }
                            );
                        }
                    }
                    next_seq = Some(seq + 1);

                    let mut meta = packet.meta;
                    counter.increment(u64::from(meta.samples) * u64::from(meta.channels));
                    let block = self.trigger.process(packet.data, &mut meta)?;
                    writer.append_packet(frontend, block.view(), &meta)?;
                    if auto && meta.length > 0 {
                        writer.note_retained(frontend, seq)?;
                    }

                    if last_log.elapsed() >= Duration::from_secs(1) {
                        info!(
                            "{:.2} Msps ({:.1} MB/s), {} samples persisted",
                            counter.rate(),
                            counter.byte_rate(),
                            writer.samples_persisted()
                        );
                        last_log = Instant::now();
                    }

                    if let Some(total) = expected {
                        if writer.samples_persisted() >= total {
                            info!("expected sample count reached");
                            break;
                        }
                    }
                }
            }
        }

        self.state = DriverState::Draining;
        // consume only the backlog already queued; on an external stop the
        // server may still be streaming and a live connection must not hold
        // up shutdown. Nothing past completion is persisted.
        for _ in 0..self.source.backlog() {
            match self.source.receive(Duration::ZERO) {
                Receive::Packet(p) => debug!("drained packet {} past completion", p.meta.seq),
                Receive::Disconnected(reason) => {
                    return Err(Error::Transport(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        reason,
                    )));
                }
                _ => break,
            }
        }
        writer.flush()?;
        info!(
            "measurement complete: {} packets, {} samples persisted",
            writer.packets_persisted(),
            writer.samples_persisted()
        );
        Ok(AcquisitionReport {
            output: self.opts.output.clone(),
            packets_received: received,
            packets_persisted: writer.packets_persisted(),
            samples_persisted: writer.samples_persisted(),
            sequence_gaps: gaps,
            packets_dropped: dropped + self.source.take_dropped(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{IqSample, Packet, PacketMeta};
    use crate::params::{AntMode, FrontEnd, Setting};
    use crate::source::SourceEvent;
    use crate::trigger::{DetectMode, EdgeTrigger, NoiseAlignment, PassThrough, PulseNoiseTrigger};
    use crossbeam_channel::bounded;
    use hdf5::File;
    use ndarray::Array2;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicU64;
    use std::thread;
    use tempfile::TempDir;

    /// Control server that acks every command on one connection.
    fn accepting_server() -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut len_buf = [0u8; 4];
            while stream.read_exact(&mut len_buf).is_ok() {
                let mut cmd = vec![0u8; u32::from_le_bytes(len_buf) as usize];
                stream.read_exact(&mut cmd).unwrap();
                let ack = br#"{"accepted":true}"#;
                stream.write_all(&(ack.len() as u32).to_le_bytes()).unwrap();
                stream.write_all(ack).unwrap();
            }
        });
        (port, handle)
    }

    fn rx_params(samples: u64, tones: usize) -> ParameterSet {
        let mut p = ParameterSet::new(0);
        p.set(FrontEnd::ARx2, Setting::Mode(AntMode::Rx))
            .set(FrontEnd::ARx2, Setting::Rate(1_000_000))
            .set(FrontEnd::ARx2, Setting::Rf(300e6))
            .set(FrontEnd::ARx2, Setting::Bw(2e6))
            .set(FrontEnd::ARx2, Setting::Samples(samples));
        if tones > 1 {
            let freqs = (1..=tones).map(|i| i as f64 * 10e3).collect();
            p.set(FrontEnd::ARx2, Setting::Freq(freqs));
        }
        p
    }

    fn flat_packet(seq: u64, samples: usize, channels: usize) -> Packet {
        let meta = PacketMeta {
            seq,
            channels: channels as u32,
            samples: samples as u32,
            length: samples as u32,
            errors: 0,
            timestamp: seq * samples as u64,
        };
        let data = Array2::from_shape_fn((samples, channels), |(i, _)| {
            IqSample::new(if i % 2 == 0 { 1.0 } else { -1.0 }, 0.0)
        });
        Packet::new(meta, data)
    }

    fn queued_source(events: Vec<SourceEvent>) -> PacketSource {
        let (tx, rx) = bounded(events.len() + 1);
        for ev in events {
            tx.send(ev).unwrap();
        }
        PacketSource::from_channel(rx, Arc::new(AtomicU64::new(0)))
    }

    fn opts(path: PathBuf) -> DriverOptions {
        let mut o = DriverOptions::new(path);
        o.timeout = Some(Duration::from_secs(5));
        o.poll_interval = Duration::from_millis(10);
        o.settle_delay = Duration::from_millis(0);
        o
    }

    #[test]
    fn pass_through_run_persists_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.h5");
        let (port, _server) = accepting_server();
        let mut command = CommandChannel::connect("127.0.0.1", port).unwrap();

        let mut events: Vec<SourceEvent> = (0..100)
            .map(|seq| SourceEvent::Packet(flat_packet(seq, 10, 2)))
            .collect();
        events.push(SourceEvent::EndOfStream);
        let mut source = queued_source(events);

        let params = rx_params(1000, 2);
        let mut driver = AcquisitionDriver::new(
            &mut command,
            &mut source,
            &params,
            Box::new(PassThrough),
            opts(path.clone()),
        );
        let report = driver.run().unwrap();

        assert_eq!(driver.state(), DriverState::Done);
        assert_eq!(report.packets_received, 100);
        assert_eq!(report.packets_persisted, 100);
        assert_eq!(report.samples_persisted, 1000);
        assert_eq!(report.sequence_gaps, 0);
        assert_eq!(report.packets_dropped, 0);

        let file = File::open(&path).unwrap();
        assert_eq!(file.dataset("A_RX2/data").unwrap().shape(), vec![1000, 2]);
        assert_eq!(file.dataset("A_RX2/errors").unwrap().shape(), vec![100]);
        // a pass-through run records no trigger events
        assert_eq!(file.dataset("A_RX2/trigger").unwrap().shape(), vec![0]);
    }

    #[test]
    fn forward_gap_is_counted_and_survived() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.h5");
        let (port, _server) = accepting_server();
        let mut command = CommandChannel::connect("127.0.0.1", port).unwrap();

        let mut source = queued_source(vec![
            SourceEvent::Packet(flat_packet(0, 10, 1)),
            SourceEvent::Packet(flat_packet(1, 10, 1)),
            SourceEvent::Packet(flat_packet(3, 10, 1)),
            SourceEvent::Packet(flat_packet(4, 10, 1)),
            SourceEvent::EndOfStream,
        ]);

        let params = rx_params(100_000, 1);
        let mut driver = AcquisitionDriver::new(
            &mut command,
            &mut source,
            &params,
            Box::new(PassThrough),
            opts(path),
        );
        let report = driver.run().unwrap();

        assert_eq!(report.sequence_gaps, 1);
        assert_eq!(report.packets_received, 4);
        assert_eq!(report.samples_persisted, 40);
    }

    #[test]
    fn sequence_regression_aborts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.h5");
        let (port, _server) = accepting_server();
        let mut command = CommandChannel::connect("127.0.0.1", port).unwrap();

        let mut source = queued_source(vec![
            SourceEvent::Packet(flat_packet(5, 10, 1)),
            SourceEvent::Packet(flat_packet(4, 10, 1)),
        ]);

        let params = rx_params(100_000, 1);
        let mut driver = AcquisitionDriver::new(
            &mut command,
            &mut source,
            &params,
            Box::new(PassThrough),
            opts(path),
        );
        let err = driver.run().unwrap_err();
        assert_eq!(driver.state(), DriverState::Aborted);
        assert!(matches!(err.error, Error::Protocol(_)));
        assert_eq!(err.packets_persisted, 1);
    }

    /// Fails every packet past a given count with a write error.
    struct FailingTrigger {
        inner: PassThrough,
        remaining: u64,
    }

    impl Trigger for FailingTrigger {
        fn control(&self) -> TriggerControl {
            self.inner.control()
        }

        fn process(
            &mut self,
            data: Array2<IqSample>,
            meta: &mut PacketMeta,
        ) -> Result<Array2<IqSample>> {
            if self.remaining == 0 {
                return Err(Error::Write(hdf5::Error::from("injected write failure")));
            }
            self.remaining -= 1;
            self.inner.process(data, meta)
        }
    }

    #[test]
    fn mid_stream_failure_keeps_partial_container() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.h5");
        let (port, _server) = accepting_server();
        let mut command = CommandChannel::connect("127.0.0.1", port).unwrap();

        let mut events: Vec<SourceEvent> = (0..100)
            .map(|seq| SourceEvent::Packet(flat_packet(seq, 10, 1)))
            .collect();
        events.push(SourceEvent::EndOfStream);
        let mut source = queued_source(events);

        let params = rx_params(100_000, 1);
        let mut driver = AcquisitionDriver::new(
            &mut command,
            &mut source,
            &params,
            Box::new(FailingTrigger {
                inner: PassThrough,
                remaining: 40,
            }),
            opts(path.clone()),
        );
        let err = driver.run().unwrap_err();

        assert_eq!(driver.state(), DriverState::Aborted);
        assert!(matches!(err.error, Error::Write(_)));
        assert_eq!(err.packets_persisted, 40);
        assert_eq!(err.samples_persisted, 400);

        // the partial container survives and stays readable
        drop(driver);
        let file = File::open(&path).unwrap();
        assert_eq!(file.dataset("A_RX2/data").unwrap().shape(), vec![400, 1]);
    }

    #[test]
    fn invalid_descriptor_fails_before_any_io() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.h5");
        let (port, _server) = accepting_server();
        let mut command = CommandChannel::connect("127.0.0.1", port).unwrap();
        let mut source = queued_source(vec![]);

        let params = ParameterSet::new(0);
        let mut driver = AcquisitionDriver::new(
            &mut command,
            &mut source,
            &params,
            Box::new(PassThrough),
            opts(path.clone()),
        );
        let err = driver.run().unwrap_err();
        assert!(matches!(err.error, Error::Validation(_)));
        assert_eq!(err.packets_persisted, 0);
        assert!(!path.exists());
    }

    #[test]
    fn auto_trigger_latches_retained_sequences() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.h5");
        let (port, _server) = accepting_server();
        let mut command = CommandChannel::connect("127.0.0.1", port).unwrap();

        let mut spiked = flat_packet(1, 100, 1);
        spiked.data[[37, 0]] = IqSample::new(50.0, 0.0);
        let mut source = queued_source(vec![
            SourceEvent::Packet(flat_packet(0, 100, 1)),
            SourceEvent::Packet(spiked),
            SourceEvent::EndOfStream,
        ]);

        let params = rx_params(100_000, 1);
        let mut driver = AcquisitionDriver::new(
            &mut command,
            &mut source,
            &params,
            Box::new(EdgeTrigger::new(1_000_000, 10.0, 5, 5, 10)),
            opts(path.clone()),
        );
        let report = driver.run().unwrap();
        assert_eq!(report.samples_persisted, 10);

        let file = File::open(&path).unwrap();
        assert_eq!(file.dataset("A_RX2/data").unwrap().shape(), vec![10, 1]);
        let retained: Vec<i64> = file.dataset("A_RX2/trigger").unwrap().read_raw().unwrap();
        assert_eq!(retained, vec![1]);
        assert_eq!(file.dataset("A_RX2/thresholds").unwrap().shape(), vec![1]);
    }

    #[test]
    fn buffered_trigger_emissions_are_latched_by_the_driver() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.h5");
        let (port, _server) = accepting_server();
        let mut command = CommandChannel::connect("127.0.0.1", port).unwrap();

        // two 50-row packets fill the classifier's 100-row buffer; the spike
        // lands at buffered index 80, emitted on the second packet
        let mut spiked = flat_packet(1, 50, 1);
        spiked.data[[30, 0]] = IqSample::new(60.0, 0.0);
        let mut source = queued_source(vec![
            SourceEvent::Packet(flat_packet(0, 50, 1)),
            SourceEvent::Packet(spiked),
            SourceEvent::EndOfStream,
        ]);

        let params = rx_params(100_000, 1);
        let mut driver = AcquisitionDriver::new(
            &mut command,
            &mut source,
            &params,
            Box::new(PulseNoiseTrigger::new(
                1000,
                5.0,
                0.01,
                0.05,
                0.1,
                DetectMode::Both,
                NoiseAlignment::Exact,
            )),
            opts(path.clone()),
        );
        let report = driver.run().unwrap();
        // one noise window at 50, one pulse window at 80
        assert_eq!(report.samples_persisted, 20);

        let file = File::open(&path).unwrap();
        let retained: Vec<i64> = file.dataset("A_RX2/trigger").unwrap().read_raw().unwrap();
        assert_eq!(retained, vec![1]);
        assert_eq!(file.dataset("A_RX2/kind").unwrap().shape(), vec![2]);
    }

    #[test]
    fn stop_mid_stream_returns_promptly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.h5");
        let (port, _server) = accepting_server();
        let mut command = CommandChannel::connect("127.0.0.1", port).unwrap();

        // a live server that keeps streaming, no end marker in sight
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let data_port = listener.local_addr().unwrap().port();
        let _feeder = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for seq in 0..10_000u64 {
                if stream.write_all(&flat_packet(seq, 10, 1).to_wire()).is_err() {
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }
        });
        let mut source = PacketSource::connect("127.0.0.1", data_port, 64).unwrap();

        let params = rx_params(100_000_000, 1);
        let o = opts(path);
        let stop = Arc::clone(&o.stop);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.store(true, Ordering::Relaxed);
        });

        let started = Instant::now();
        let mut driver = AcquisitionDriver::new(
            &mut command,
            &mut source,
            &params,
            Box::new(PassThrough),
            o,
        );
        let report = driver.run().unwrap();
        // the drain must not wait out the still-live stream
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(driver.state(), DriverState::Done);
        assert!(report.packets_received > 0);
    }

    #[test]
    fn disconnect_while_draining_aborts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.h5");
        let (port, _server) = accepting_server();
        let mut command = CommandChannel::connect("127.0.0.1", port).unwrap();

        // the expected count is reached before the queued disconnect is seen
        let mut source = queued_source(vec![
            SourceEvent::Packet(flat_packet(0, 10, 1)),
            SourceEvent::Disconnected("connection reset".into()),
        ]);

        let params = rx_params(10, 1);
        let mut driver = AcquisitionDriver::new(
            &mut command,
            &mut source,
            &params,
            Box::new(PassThrough),
            opts(path),
        );
        let err = driver.run().unwrap_err();
        assert_eq!(driver.state(), DriverState::Aborted);
        assert!(matches!(err.error, Error::Transport(_)));
        assert_eq!(err.samples_persisted, 10);
    }

    #[test]
    fn stop_flag_drains_cleanly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.h5");
        let (port, _server) = accepting_server();
        let mut command = CommandChannel::connect("127.0.0.1", port).unwrap();
        let mut source = queued_source(vec![]);

        let params = rx_params(100_000, 1);
        let mut o = opts(path);
        o.stop.store(true, Ordering::Relaxed);
        let stop = Arc::clone(&o.stop);
        let mut driver = AcquisitionDriver::new(
            &mut command,
            &mut source,
            &params,
            Box::new(PassThrough),
            o,
        );
        let report = driver.run().unwrap();
        assert!(stop.load(Ordering::Relaxed));
        assert_eq!(driver.state(), DriverState::Done);
        assert_eq!(report.packets_received, 0);
        assert_eq!(report.samples_persisted, 0);
    }
}
