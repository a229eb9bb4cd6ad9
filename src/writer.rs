use crate::error::{Error, Result};
use crate::packet::{IqSample, PacketMeta};
use crate::params::{AntMode, FrontEnd, ParameterSet};
use hdf5::types::VarLenUnicode;
use hdf5::{Dataset, File, Group};
use log::debug;
use ndarray::ArrayView2;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Chunk rows for all resizable datasets; growth cost is amortized by the
/// HDF5 chunk cache.
pub const CHUNK_ROWS: usize = 4096;

/// One value of a bookkeeping record.
#[derive(Clone, Copy, Debug)]
pub enum RecordValue {
    Float(f64),
    Int(i64),
}

/// Element type of a bookkeeping dataset.
#[derive(Clone, Copy, Debug)]
pub enum RecordKind {
    Float,
    Int,
}

/// A set of sibling 1-D datasets that advance in lockstep, one record per
/// append. The append is two-phase: every sibling is resized (reserved)
/// first, then written; any failure rolls all lengths back so siblings can
/// never be observed at different lengths.
pub struct BookkeepingGroup {
    datasets: Vec<Dataset>,
    len: u64,
}

impl BookkeepingGroup {
    /// Creates fresh zero-length datasets inside `group`.
    pub fn create(group: &Group, specs: &[(&str, RecordKind)]) -> Result<Self> {
        let mut datasets = Vec::with_capacity(specs.len());
        for (name, kind) in specs {
            let ds = match kind {
                RecordKind::Float => group
                    .new_dataset::<f64>()
                    .shape((0..,))
                    .chunk(CHUNK_ROWS)
                    .create(*name)?,
                RecordKind::Int => group
                    .new_dataset::<i64>()
                    .shape((0..,))
                    .chunk(CHUNK_ROWS)
                    .create(*name)?,
            };
            datasets.push(ds);
        }
        Ok(Self { datasets, len: 0 })
    }

    /// Opens existing datasets as one group; they must already agree in
    /// length.
    pub fn open(group: &Group, names: &[&str]) -> Result<Self> {
        let mut datasets = Vec::with_capacity(names.len());
        let mut len: Option<u64> = None;
        for name in names {
            let ds = group.dataset(name)?;
            let l = ds.shape()[0] as u64;
            match len {
                Some(prev) if prev != l => {
                    return Err(Error::Write(hdf5::Error::from(format!(
                        "sibling dataset '{name}' is {l} records long, group is at {prev}"
                    ))));
                }
                _ => len = Some(l),
            }
            datasets.push(ds);
        }
        Ok(Self {
            datasets,
            len: len.unwrap_or(0),
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends one correlated record across all siblings.
    pub fn append(&mut self, values: &[RecordValue]) -> Result<()> {
        self.append_with(values, write_record)
    }

    /// Append with an explicit write phase; the default `append` passes the
    /// real dataset write. Failure injection in tests goes through here.
    pub fn append_with<F>(&mut self, values: &[RecordValue], write: F) -> Result<()>
    where
        F: Fn(&Dataset, u64, RecordValue) -> Result<()>,
    {
        if values.len() != self.datasets.len() {
            return Err(Error::Write(hdf5::Error::from(format!(
                "record has {} values, group has {} datasets",
                values.len(),
                self.datasets.len()
            ))));
        }
        let old = self.len;
        let new = old + 1;
        // phase 1: reserve
        for (i, ds) in self.datasets.iter().enumerate() {
            if let Err(e) = ds.resize(new as usize) {
                for prev in &self.datasets[..i] {
                    let _ = prev.resize(old as usize);
                }
                return Err(e.into());
            }
        }
        // phase 2: write, commit the length only when every sibling took it
        for (ds, value) in self.datasets.iter().zip(values) {
            if let Err(e) = write(ds, old, *value) {
                for ds in &self.datasets {
                    let _ = ds.resize(old as usize);
                }
                return Err(e);
            }
        }
        self.len = new;
        Ok(())
    }
}

fn write_record(ds: &Dataset, row: u64, value: RecordValue) -> Result<()> {
    let row = row as usize;
    match value {
        RecordValue::Float(x) => ds.write_slice(&[x], (row..row + 1,))?,
        RecordValue::Int(x) => ds.write_slice(&[x], (row..row + 1,))?,
    }
    Ok(())
}

/// Datasets for one front-end group: the primary `data` block, the
/// per-packet `errors` record and the `trigger` bookkeeping dataset of
/// retained sequence numbers.
pub struct AntennaGroup {
    group: Group,
    data: Dataset,
    errors: Dataset,
    trigger: BookkeepingGroup,
    channels: usize,
    rows: u64,
    packets: u64,
}

impl AntennaGroup {
    fn create(parent: &Group, name: &str, channels: usize) -> Result<Self> {
        let group = parent.create_group(name)?;
        let data = group
            .new_dataset::<IqSample>()
            .shape((0.., channels))
            .chunk((CHUNK_ROWS, channels))
            .create("data")?;
        let errors = group
            .new_dataset::<u32>()
            .shape((0..,))
            .chunk(CHUNK_ROWS)
            .create("errors")?;
        let trigger = BookkeepingGroup::create(&group, &[("trigger", RecordKind::Int)])?;
        Ok(Self {
            group,
            data,
            errors,
            trigger,
            channels,
            rows: 0,
            packets: 0,
        })
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn trigger_records(&self) -> u64 {
        self.trigger.len()
    }

    /// Appends a retained block and its error record. Two-phase like the
    /// bookkeeping appends: the reserved rows are rolled back when the write
    /// fails, so a partially appended block is never left behind.
    fn append(&mut self, block: ArrayView2<'_, IqSample>, meta: &PacketMeta) -> Result<()> {
        let errors = meta.errors;
        self.append_with(block, |data, errs, rows, packet| {
            data.write_slice(block, (rows, ..))?;
            errs.write_slice(&[errors], (packet..packet + 1,))?;
            Ok(())
        })
    }

    /// Append with an explicit write phase; `append` passes the real dataset
    /// writes. Failure injection in tests goes through here. Both
    /// reservations are rolled back when any resize or write fails.
    fn append_with<F>(&mut self, block: ArrayView2<'_, IqSample>, write: F) -> Result<()>
    where
        F: FnOnce(&Dataset, &Dataset, std::ops::Range<usize>, usize) -> Result<()>,
    {
        let n = block.nrows() as u64;
        if n == 0 {
            return Ok(());
        }
        if block.ncols() != self.channels {
            return Err(Error::Write(hdf5::Error::from(format!(
                "block carries {} channels, container has {}",
                block.ncols(),
                self.channels
            ))));
        }
        let (old, new) = (self.rows as usize, (self.rows + n) as usize);
        let packet = self.packets as usize;
        // phase 1: reserve both datasets
        self.data.resize((new, self.channels))?;
        if let Err(e) = self.errors.resize(packet + 1) {
            let _ = self.data.resize((old, self.channels));
            return Err(e.into());
        }
        // phase 2: write, roll both reservations back on any failure
        if let Err(e) = write(&self.data, &self.errors, old..new, packet) {
            let _ = self.errors.resize(packet);
            let _ = self.data.resize((old, self.channels));
            return Err(e);
        }
        self.rows += n;
        self.packets += 1;
        Ok(())
    }

    fn note_retained(&mut self, seq: u64) -> Result<()> {
        self.trigger.append(&[RecordValue::Int(seq as i64)])
    }
}

/// Append-only HDF5 container for one measurement: one group per active RX
/// front-end, the originating command stored as a root attribute. The file
/// is kept (never deleted) on failure so partial data stays inspectable.
pub struct ContainerWriter {
    file: File,
    path: PathBuf,
    groups: BTreeMap<FrontEnd, AntennaGroup>,
    samples: u64,
    packets: u64,
}

impl ContainerWriter {
    pub fn create(path: &Path, params: &ParameterSet, command: &str) -> Result<Self> {
        let file = File::create(path)?;
        let wire = command
            .parse::<VarLenUnicode>()
            .map_err(|e| Error::Write(hdf5::Error::from(e.to_string())))?;
        file.new_attr::<VarLenUnicode>()
            .create("command")?
            .write_scalar(&wire)?;

        let mut groups = BTreeMap::new();
        for (fe, p) in &params.frontends {
            if p.mode != AntMode::Rx {
                continue;
            }
            let channels = params.rx_channels(*fe);
            groups.insert(*fe, AntennaGroup::create(&file, fe.group_name(), channels)?);
            debug!("created group {fe} with {channels} channels");
        }
        if groups.is_empty() {
            return Err(Error::Validation(
                "no RX front-end to write a container for".into(),
            ));
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            groups,
            samples: 0,
            packets: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn antenna(&self, frontend: FrontEnd) -> Result<&AntennaGroup> {
        self.groups
            .get(&frontend)
            .ok_or_else(|| Error::Validation(format!("no group for front-end {frontend}")))
    }

    /// Persists whatever the trigger retained of one packet.
    pub fn append_packet(
        &mut self,
        frontend: FrontEnd,
        block: ArrayView2<'_, IqSample>,
        meta: &PacketMeta,
    ) -> Result<()> {
        let group = self
            .groups
            .get_mut(&frontend)
            .ok_or_else(|| Error::Validation(format!("no group for front-end {frontend}")))?;
        let n = block.nrows() as u64;
        group.append(block, meta)?;
        if n > 0 {
            self.samples += n;
            self.packets += 1;
        }
        Ok(())
    }

    /// Auto-mode trigger bookkeeping: latches a retained sequence number.
    pub fn note_retained(&mut self, frontend: FrontEnd, seq: u64) -> Result<()> {
        self.groups
            .get_mut(&frontend)
            .ok_or_else(|| Error::Validation(format!("no group for front-end {frontend}")))?
            .note_retained(seq)
    }

    pub fn samples_persisted(&self) -> u64 {
        self.samples
    }

    pub fn packets_persisted(&self) -> u64 {
        self.packets
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}
