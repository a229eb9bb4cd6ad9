use crate::error::{Error, Result};
use hdf5::H5Type;
use ndarray::Array2;
use num_complex::Complex32;

/// Header bytes preceding every sample block on the data socket.
pub const HEADER_LEN: usize = 28;

/// Bytes per IQ sample on the wire (two little-endian f32).
pub const SAMPLE_LEN: usize = 8;

/// One complex baseband sample, matching the server's `float2` layout.
#[derive(H5Type, Clone, Copy, Debug, Default, PartialEq)]
#[repr(C)]
pub struct IqSample {
    pub re: f32,
    pub im: f32,
}

impl IqSample {
    pub fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }

    pub fn norm(&self) -> f64 {
        Complex32::from(*self).norm() as f64
    }
}

impl From<IqSample> for Complex32 {
    fn from(s: IqSample) -> Self {
        Complex32::new(s.re, s.im)
    }
}

impl From<Complex32> for IqSample {
    fn from(c: Complex32) -> Self {
        Self { re: c.re, im: c.im }
    }
}

/// Stream metadata attached to every packet.
///
/// `length` starts equal to `samples` and is the only mutable field: a
/// trigger shrinks or zeroes it to control how many rows are persisted.
/// Suppression removes data from durable storage, not from the trigger's
/// internal view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketMeta {
    /// Wire sequence number, strictly increasing by one per packet.
    pub seq: u64,
    /// Channel count, constant for the lifetime of a measurement.
    pub channels: u32,
    /// Rows in the sample block as it arrived.
    pub samples: u32,
    /// Rows to persist after triggering.
    pub length: u32,
    /// Server-side error count for this block.
    pub errors: u32,
    /// Device ticks at the start of the block.
    pub timestamp: u64,
}

/// One unit of the sample stream: a `(samples, channels)` block plus its
/// metadata. Row = time instant, column = channel, so the wire interleaving
/// `ch0@t0, ch1@t0, ch0@t1, ...` is a plain row-major read.
#[derive(Clone, Debug)]
pub struct Packet {
    pub meta: PacketMeta,
    pub data: Array2<IqSample>,
}

impl Packet {
    pub fn new(meta: PacketMeta, data: Array2<IqSample>) -> Self {
        Self { meta, data }
    }

    /// Parses the fixed-size header. Returns `None` for the end-of-stream
    /// marker (`channels == 0`).
    pub fn parse_header(buf: &[u8; HEADER_LEN]) -> Option<PacketMeta> {
        let seq = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let channels = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let samples = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let errors = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let timestamp = u64::from_le_bytes(buf[20..28].try_into().unwrap());
        if channels == 0 {
            return None;
        }
        Some(PacketMeta {
            seq,
            channels,
            samples,
            length: samples,
            errors,
            timestamp,
        })
    }

    /// Decodes a sample block for `meta` from `body`, which must hold exactly
    /// `samples * channels` wire samples.
    pub fn parse_body(meta: PacketMeta, body: &[u8]) -> Result<Self> {
        let expected = meta.samples as usize * meta.channels as usize * SAMPLE_LEN;
        if body.len() != expected {
            return Err(Error::Protocol(format!(
                "packet {}: body is {} bytes, expected {}",
                meta.seq,
                body.len(),
                expected
            )));
        }
        let mut flat = Vec::with_capacity(meta.samples as usize * meta.channels as usize);
        for chunk in body.chunks_exact(SAMPLE_LEN) {
            let re = f32::from_le_bytes(chunk[0..4].try_into().unwrap());
            let im = f32::from_le_bytes(chunk[4..8].try_into().unwrap());
            flat.push(IqSample { re, im });
        }
        let data = Array2::from_shape_vec((meta.samples as usize, meta.channels as usize), flat)
            .map_err(|e| Error::Protocol(format!("packet {}: {}", meta.seq, e)))?;
        Ok(Self { meta, data })
    }

    /// Serializes header + block back to wire form. The loopback source and
    /// the simulators feed the pipeline with this.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.data.len() * SAMPLE_LEN);
        buf.extend_from_slice(&self.meta.seq.to_le_bytes());
        buf.extend_from_slice(&self.meta.channels.to_le_bytes());
        buf.extend_from_slice(&self.meta.samples.to_le_bytes());
        buf.extend_from_slice(&self.meta.errors.to_le_bytes());
        buf.extend_from_slice(&self.meta.timestamp.to_le_bytes());
        for s in self.data.iter() {
            buf.extend_from_slice(&s.re.to_le_bytes());
            buf.extend_from_slice(&s.im.to_le_bytes());
        }
        buf
    }

    /// End-of-stream marker: a bare header with `channels == 0`.
    pub fn end_of_stream_marker() -> [u8; HEADER_LEN] {
        [0u8; HEADER_LEN]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        let meta = PacketMeta {
            seq: 7,
            channels: 2,
            samples: 3,
            length: 3,
            errors: 1,
            timestamp: 123_456,
        };
        let flat: Vec<IqSample> = (0..6).map(|i| IqSample::new(i as f32, -(i as f32))).collect();
        Packet::new(meta, Array2::from_shape_vec((3, 2), flat).unwrap())
    }

    #[test]
    fn header_round_trip() {
        let pkt = sample_packet();
        let wire = pkt.to_wire();
        let header: [u8; HEADER_LEN] = wire[..HEADER_LEN].try_into().unwrap();
        let meta = Packet::parse_header(&header).unwrap();
        assert_eq!(meta, pkt.meta);
    }

    #[test]
    fn body_round_trip_keeps_interleaving() {
        let pkt = sample_packet();
        let wire = pkt.to_wire();
        let header: [u8; HEADER_LEN] = wire[..HEADER_LEN].try_into().unwrap();
        let meta = Packet::parse_header(&header).unwrap();
        let decoded = Packet::parse_body(meta, &wire[HEADER_LEN..]).unwrap();
        assert_eq!(decoded.data, pkt.data);
        // ch1 at t0 must sit right after ch0 at t0
        assert_eq!(decoded.data[[0, 1]], IqSample::new(1.0, -1.0));
    }

    #[test]
    fn zero_channels_is_end_of_stream() {
        let marker = Packet::end_of_stream_marker();
        assert!(Packet::parse_header(&marker).is_none());
    }

    #[test]
    fn truncated_body_is_a_protocol_error() {
        let pkt = sample_packet();
        let wire = pkt.to_wire();
        let header: [u8; HEADER_LEN] = wire[..HEADER_LEN].try_into().unwrap();
        let meta = Packet::parse_header(&header).unwrap();
        assert!(Packet::parse_body(meta, &wire[HEADER_LEN..wire.len() - 8]).is_err());
    }
}
