use crate::error::Result;
use crate::packet::{IqSample, PacketMeta};
use crate::writer::{BookkeepingGroup, RecordKind, RecordValue};
use hdf5::Group;
use log::debug;
use ndarray::{Array2, ArrayView1};
use num_complex::Complex64;

/// Who advances the bookkeeping datasets.
///
/// `Auto`: the driver latches the packet's sequence number into the group's
/// `trigger` dataset whenever the processed `meta.length` is nonzero.
/// `Manual`: the trigger alone advances bookkeeping through `record_event`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerControl {
    Auto,
    Manual,
}

/// Real-time packet classifier deciding what subset of each packet is
/// persisted.
///
/// Implementations own their entire accumulator state; `process` may mutate
/// that state and nothing else, and must keep updating it even when it
/// suppresses the packet (`meta.length = 0` removes data from durable
/// storage, not from the trigger's view of the stream). All container access
/// goes through the datasets created in `initialize` and written in
/// `record_event`.
pub trait Trigger {
    fn control(&self) -> TriggerControl {
        TriggerControl::Auto
    }

    /// Called once, before any packet, with the measurement's antenna group.
    fn initialize(&mut self, _group: &Group) -> Result<()> {
        Ok(())
    }

    /// Called once per packet in strict sequence order. Returns the rows to
    /// persist and sets `meta.length` accordingly.
    fn process(
        &mut self,
        data: Array2<IqSample>,
        meta: &mut PacketMeta,
    ) -> Result<Array2<IqSample>>;

    /// Appends one correlated record across the trigger's auxiliary
    /// datasets. Sibling datasets never diverge in length, even on failure.
    fn record_event(&mut self, _meta: &PacketMeta) -> Result<()> {
        Ok(())
    }
}

fn empty_block(channels: usize) -> Array2<IqSample> {
    Array2::from_elem((0, channels), IqSample::default())
}

fn to_c64(s: IqSample) -> Complex64 {
    Complex64::new(s.re as f64, s.im as f64)
}

/// Population standard deviation of a complex channel.
fn channel_std(col: ArrayView1<'_, IqSample>) -> f64 {
    let n = col.len() as f64;
    if col.is_empty() {
        return 0.0;
    }
    let mean = col.iter().map(|&s| to_c64(s)).sum::<Complex64>() / n;
    let var = col.iter().map(|&s| (to_c64(s) - mean).norm_sqr()).sum::<f64>() / n;
    var.sqrt()
}

/// Population standard deviation of a real series.
fn series_std(series: &[f64]) -> f64 {
    let n = series.len() as f64;
    if series.is_empty() {
        return 0.0;
    }
    let mean = series.iter().sum::<f64>() / n;
    let var = series.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    var.sqrt()
}

/// Default trigger: persists every packet untouched and never records an
/// event, so a full pass-through run yields zero trigger records.
#[derive(Debug, Default)]
pub struct PassThrough;

impl Trigger for PassThrough {
    fn control(&self) -> TriggerControl {
        TriggerControl::Manual
    }

    fn process(
        &mut self,
        data: Array2<IqSample>,
        meta: &mut PacketMeta,
    ) -> Result<Array2<IqSample>> {
        meta.length = data.nrows() as u32;
        Ok(data)
    }
}

struct EdgeEvent {
    time: f64,
    threshold: f64,
    window: i64,
}

/// Magnitude-threshold edge trigger.
///
/// Detection is per channel: the baseline is the complex standard deviation
/// of the previous packet, and a sample index is a hit when the absolute
/// first difference of the channel magnitude exceeds
/// `baseline * multiplier`. Candidates from all channels are then pooled
/// and hits closer than `min_separation` samples are merged keeping the
/// earlier one, so one pulse visible on several channels emits a single
/// window instead of near-duplicate overlapping ones. Each surviving hit
/// extracts a `[i - before, i + after)` window across all channels when the
/// window fits inside the packet, and is discarded otherwise. The baseline
/// is recomputed from every packet after classification, so suppressed
/// packets still feed the noise estimate.
pub struct EdgeTrigger {
    rate: u64,
    multiplier: f64,
    before: usize,
    after: usize,
    min_separation: usize,
    baseline: Vec<f64>,
    primed: bool,
    samples_seen: u64,
    books: Option<BookkeepingGroup>,
    pending: Option<EdgeEvent>,
}

impl EdgeTrigger {
    pub fn new(rate: u64, multiplier: f64, before: usize, after: usize, min_separation: usize) -> Self {
        Self {
            rate,
            multiplier,
            before,
            after,
            min_separation,
            baseline: Vec::new(),
            primed: false,
            samples_seen: 0,
            books: None,
            pending: None,
        }
    }

    fn rebaseline(&mut self, data: &Array2<IqSample>) {
        self.baseline = data.columns().into_iter().map(channel_std).collect();
    }
}

impl Trigger for EdgeTrigger {
    fn control(&self) -> TriggerControl {
        TriggerControl::Auto
    }

    fn initialize(&mut self, group: &Group) -> Result<()> {
        self.books = Some(BookkeepingGroup::create(
            group,
            &[
                ("timing", RecordKind::Float),
                ("thresholds", RecordKind::Float),
                ("slices", RecordKind::Int),
            ],
        )?);
        Ok(())
    }

    fn process(
        &mut self,
        data: Array2<IqSample>,
        meta: &mut PacketMeta,
    ) -> Result<Array2<IqSample>> {
        let (n, channels) = data.dim();
        if n == 0 {
            meta.length = 0;
            return Ok(empty_block(channels));
        }
        if !self.primed || self.baseline.len() != channels {
            self.rebaseline(&data);
            self.primed = true;
            self.samples_seen += n as u64;
            meta.length = 0;
            return Ok(empty_block(channels));
        }

        let mut candidates: Vec<(usize, usize)> = Vec::new();
        for (c, col) in data.columns().into_iter().enumerate() {
            let threshold = self.baseline[c] * self.multiplier;
            let mut prev = col[0].norm();
            for i in 1..n {
                let mag = col[i].norm();
                if (mag - prev).abs() > threshold {
                    candidates.push((i, c));
                }
                prev = mag;
            }
        }
        candidates.sort_unstable();

        let mut hits: Vec<(usize, usize)> = Vec::new();
        for (i, c) in candidates {
            match hits.last() {
                Some(&(last, _)) if i - last < self.min_separation => {}
                _ => hits.push((i, c)),
            }
        }

        let window = self.before + self.after;
        let mut out = Vec::new();
        let mut kept = 0usize;
        for (i, c) in hits {
            if i < self.before || i + self.after > n {
                debug!("hit at sample {i} too close to the packet edge, discarded");
                continue;
            }
            for row in (i - self.before)..(i + self.after) {
                for col in 0..channels {
                    out.push(data[[row, col]]);
                }
            }
            kept += 1;
            self.pending = Some(EdgeEvent {
                time: (self.samples_seen + i as u64) as f64 / self.rate as f64,
                threshold: self.baseline[c],
                window: window as i64,
            });
            self.record_event(meta)?;
        }

        meta.length = (kept * window) as u32;
        self.rebaseline(&data);
        self.samples_seen += n as u64;
        let out = Array2::from_shape_vec((kept * window, channels), out)
            .unwrap_or_else(|_| empty_block(channels));
        Ok(out)
    }

    fn record_event(&mut self, _meta: &PacketMeta) -> Result<()> {
        let event = match self.pending.take() {
            Some(ev) => ev,
            None => return Ok(()),
        };
        if let Some(books) = &mut self.books {
            books.append(&[
                RecordValue::Float(event.time),
                RecordValue::Float(event.threshold),
                RecordValue::Int(event.window),
            ])?;
        }
        Ok(())
    }
}

/// What the accumulate-and-classify trigger fires on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectMode {
    Pulse,
    Noise,
    Both,
}

/// Policy for deciding whether a hit index belongs to a periodic noise
/// window. The exact-alignment arithmetic almost never matches for
/// non-integer steps, so `Nearest` (membership of the window centred on the
/// nearest step multiple) is the usual choice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoiseAlignment {
    Exact,
    Nearest,
}

struct PulseEvent {
    time: f64,
    channel: i64,
    kind: i64,
}

/// Accumulate-and-classify trigger: buffers a stretch of the stream, then
/// detects pulse edges per channel (first-difference threshold against the
/// magnitude standard deviation) plus periodic noise windows, classifies
/// each surviving hit and emits one fixed window (20 % before, 80 % after
/// the hit) across all channels per event. Pulses that land inside a noise
/// window are dropped. Auto control: an emitting flush returns nonzero
/// `length`, which makes the driver latch the packet's sequence number into
/// the group's shared `trigger` dataset; only the per-hit records here go
/// through `record_event`.
pub struct PulseNoiseTrigger {
    rate: u64,
    multiplier: f64,
    window: usize,
    before: usize,
    after: usize,
    noise_interval: f64,
    mode: DetectMode,
    alignment: NoiseAlignment,
    buffer_rows: usize,
    buffer: Vec<IqSample>,
    buffered: usize,
    consumed: u64,
    books: Option<BookkeepingGroup>,
    pending: Option<PulseEvent>,
}

impl PulseNoiseTrigger {
    /// `slice_secs` sets the extracted window length, `noise_interval` the
    /// spacing of noise windows, `buffer_secs` how much stream is
    /// accumulated before each classification pass.
    pub fn new(
        rate: u64,
        multiplier: f64,
        slice_secs: f64,
        noise_interval: f64,
        buffer_secs: f64,
        mode: DetectMode,
        alignment: NoiseAlignment,
    ) -> Self {
        let window = ((slice_secs * rate as f64) as usize).max(2);
        let before = window / 5;
        Self {
            rate,
            multiplier,
            window,
            before,
            after: window - before,
            noise_interval,
            mode,
            alignment,
            buffer_rows: ((buffer_secs * rate as f64) as usize).max(1),
            buffer: Vec::new(),
            buffered: 0,
            consumed: 0,
            books: None,
            pending: None,
        }
    }

    fn is_noise_window(&self, i: usize, step: f64) -> bool {
        if step <= 0.0 {
            return false;
        }
        match self.alignment {
            NoiseAlignment::Exact => {
                let s = (step.round() as usize).max(1);
                i % s == 0
            }
            NoiseAlignment::Nearest => {
                let nearest = (i as f64 / step).round() * step;
                (i as f64 - nearest).abs() <= self.window as f64 / 2.0
            }
        }
    }

    fn classify(
        &mut self,
        block: &Array2<IqSample>,
        meta: &PacketMeta,
    ) -> Result<Array2<IqSample>> {
        let (n, channels) = block.dim();
        let step = self.noise_interval * self.rate as f64;
        let mut out = Vec::new();
        let mut kept = 0usize;

        for (c, col) in block.columns().into_iter().enumerate() {
            let mags: Vec<f64> = col.iter().map(|s| s.norm()).collect();
            let std = series_std(&mags);

            let mut pulse_hits: Vec<usize> = Vec::new();
            if self.mode != DetectMode::Noise {
                let threshold = std * self.multiplier;
                for i in 1..n {
                    if (mags[i] - mags[i - 1]).abs() > threshold {
                        match pulse_hits.last() {
                            Some(&last) if i - last < self.window => {}
                            _ => pulse_hits.push(i),
                        }
                    }
                }
            }

            let mut noise_hits: Vec<usize> = Vec::new();
            if self.mode != DetectMode::Pulse && step >= 1.0 {
                let mut k = 1.0;
                loop {
                    let i = (k * step).round() as usize;
                    if i >= n {
                        break;
                    }
                    noise_hits.push(i);
                    k += 1.0;
                }
            }

            let mut hits: Vec<usize> = pulse_hits;
            hits.extend_from_slice(&noise_hits);
            hits.sort_unstable();
            hits.dedup();

            let mut prev: Option<usize> = None;
            for i in hits {
                if i < self.before || i + self.after > n {
                    debug!("hit at sample {i} (ch {c}) not in range, discarded");
                    continue;
                }
                let noise = self.mode != DetectMode::Pulse && self.is_noise_window(i, step);
                if noise {
                    // a pulse that dropped into this noise window wins
                    if let Some(p) = prev {
                        if i - p < self.window {
                            prev = Some(i);
                            continue;
                        }
                    }
                }
                for row in (i - self.before)..(i + self.after) {
                    for col in 0..channels {
                        out.push(block[[row, col]]);
                    }
                }
                kept += 1;
                self.pending = Some(PulseEvent {
                    time: (self.consumed + i as u64) as f64 / self.rate as f64,
                    channel: c as i64,
                    kind: i64::from(noise),
                });
                self.record_event(meta)?;
                prev = Some(i);
            }
        }

        self.consumed += n as u64;
        let rows = kept * self.window;
        Ok(Array2::from_shape_vec((rows, channels), out)
            .unwrap_or_else(|_| empty_block(channels)))
    }
}

impl Trigger for PulseNoiseTrigger {
    fn control(&self) -> TriggerControl {
        TriggerControl::Auto
    }

    fn initialize(&mut self, group: &Group) -> Result<()> {
        self.books = Some(BookkeepingGroup::create(
            group,
            &[
                ("timing", RecordKind::Float),
                ("channel", RecordKind::Int),
                ("kind", RecordKind::Int),
            ],
        )?);
        Ok(())
    }

    fn process(
        &mut self,
        data: Array2<IqSample>,
        meta: &mut PacketMeta,
    ) -> Result<Array2<IqSample>> {
        let (n, channels) = data.dim();
        self.buffer.extend(data.iter().copied());
        self.buffered += n;
        if self.buffered < self.buffer_rows {
            meta.length = 0;
            return Ok(empty_block(channels));
        }

        let rows = self.buffered;
        let flat = std::mem::take(&mut self.buffer);
        self.buffered = 0;
        let block = Array2::from_shape_vec((rows, channels), flat)
            .unwrap_or_else(|_| empty_block(channels));
        let out = self.classify(&block, meta)?;
        meta.length = out.nrows() as u32;
        Ok(out)
    }

    fn record_event(&mut self, _meta: &PacketMeta) -> Result<()> {
        let event = match self.pending.take() {
            Some(ev) => ev,
            None => return Ok(()),
        };
        if let Some(books) = &mut self.books {
            books.append(&[
                RecordValue::Float(event.time),
                RecordValue::Int(event.channel),
                RecordValue::Int(event.kind),
            ])?;
        }
        Ok(())
    }
}
