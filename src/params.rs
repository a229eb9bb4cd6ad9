use crate::error::{Error, Result};
use log::warn;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// One physical front-end path on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum FrontEnd {
    #[serde(rename = "A_TXRX")]
    ATxrx,
    #[serde(rename = "A_RX2")]
    ARx2,
    #[serde(rename = "B_TXRX")]
    BTxrx,
    #[serde(rename = "B_RX2")]
    BRx2,
}

impl FrontEnd {
    /// HDF5 group name inside the measurement container.
    pub fn group_name(&self) -> &'static str {
        match self {
            FrontEnd::ATxrx => "A_TXRX",
            FrontEnd::ARx2 => "A_RX2",
            FrontEnd::BTxrx => "B_TXRX",
            FrontEnd::BRx2 => "B_RX2",
        }
    }
}

impl fmt::Display for FrontEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.group_name())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum AntMode {
    #[serde(rename = "TX")]
    Tx,
    #[serde(rename = "RX")]
    Rx,
    #[default]
    #[serde(rename = "OFF")]
    Off,
}

/// Signal generation / demodulation mode, one per logical channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum WaveType {
    #[serde(rename = "TONES")]
    Tones,
    #[serde(rename = "CHIRP")]
    Chirp,
    #[serde(rename = "NOISE")]
    Noise,
    #[serde(rename = "RAMP")]
    Ramp,
    #[serde(rename = "NODSP")]
    NoDsp,
    #[serde(rename = "SWONLY")]
    SwOnly,
}

/// One typed option for a front-end. `ParameterSet::set` overwrites any
/// previous value for the same option; no coercion happens at set time.
#[derive(Clone, Debug)]
pub enum Setting {
    Mode(AntMode),
    /// Sample rate in sps.
    Rate(u64),
    /// RF centre frequency in Hz.
    Rf(f64),
    /// Gain in dB.
    Gain(i32),
    /// Analog bandwidth in Hz.
    Bw(f64),
    /// Expected total sample count for this front-end.
    Samples(u64),
    /// Start delay in seconds.
    Delay(f64),
    /// Burst on-time in seconds.
    BurstOn(f64),
    /// Burst off-time in seconds.
    BurstOff(f64),
    /// Transport buffer length in samples; 0 selects the server default.
    BufferLen(u64),
    /// Post-demodulation decimation factor.
    Decim(u64),
    WaveType(Vec<WaveType>),
    Ampl(Vec<f64>),
    /// Baseband tone frequencies in Hz, one per channel.
    Freq(Vec<f64>),
    /// Chirp end frequencies in Hz.
    ChirpF(Vec<f64>),
    /// Chirp durations in seconds.
    ChirpT(Vec<f64>),
    /// Frequency sweep step counts.
    SwipeS(Vec<u64>),
}

/// Everything the server needs to know about one front-end, mirroring the
/// server's per-antenna `param` record.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FrontEndParams {
    pub mode: AntMode,
    pub rate: Option<u64>,
    pub rf: Option<f64>,
    pub gain: Option<i32>,
    pub bw: Option<f64>,
    pub samples: Option<u64>,
    pub delay: Option<f64>,
    pub burst_on: Option<f64>,
    pub burst_off: Option<f64>,
    pub buffer_len: Option<u64>,
    pub decim: Option<u64>,
    pub wave_type: Vec<WaveType>,
    pub ampl: Vec<f64>,
    pub freq: Vec<f64>,
    pub chirp_f: Vec<f64>,
    pub chirp_t: Vec<f64>,
    pub swipe_s: Vec<u64>,
}

impl FrontEndParams {
    fn apply(&mut self, setting: Setting) {
        match setting {
            Setting::Mode(v) => self.mode = v,
            Setting::Rate(v) => self.rate = Some(v),
            Setting::Rf(v) => self.rf = Some(v),
            Setting::Gain(v) => self.gain = Some(v),
            Setting::Bw(v) => self.bw = Some(v),
            Setting::Samples(v) => self.samples = Some(v),
            Setting::Delay(v) => self.delay = Some(v),
            Setting::BurstOn(v) => self.burst_on = Some(v),
            Setting::BurstOff(v) => self.burst_off = Some(v),
            Setting::BufferLen(v) => self.buffer_len = Some(v),
            Setting::Decim(v) => self.decim = Some(v),
            Setting::WaveType(v) => self.wave_type = v,
            Setting::Ampl(v) => self.ampl = v,
            Setting::Freq(v) => self.freq = v,
            Setting::ChirpF(v) => self.chirp_f = v,
            Setting::ChirpT(v) => self.chirp_t = v,
            Setting::SwipeS(v) => self.swipe_s = v,
        }
    }

    fn check(&self, fe: FrontEnd) -> bool {
        let mut ok = true;
        let mut require = |present: bool, what: &str| {
            if !present {
                warn!("{fe}: missing required option '{what}'");
                ok = false;
            }
        };
        match self.mode {
            AntMode::Off => return true,
            AntMode::Rx => {
                require(self.rate.is_some(), "rate");
                require(self.rf.is_some(), "rf");
                require(self.bw.is_some(), "bw");
                require(self.samples.is_some(), "samples");
            }
            AntMode::Tx => {
                require(self.rate.is_some(), "rate");
                require(self.rf.is_some(), "rf");
                require(self.bw.is_some(), "bw");
                require(self.samples.is_some(), "samples");
                require(!self.wave_type.is_empty(), "wave_type");
            }
        }
        if self.mode == AntMode::Tx {
            let n = self.wave_type.len();
            if self.ampl.len() != n {
                warn!(
                    "{fe}: ampl has {} entries, wave_type has {}",
                    self.ampl.len(),
                    n
                );
                ok = false;
            }
            if self.freq.len() != n {
                warn!(
                    "{fe}: freq has {} entries, wave_type has {}",
                    self.freq.len(),
                    n
                );
                ok = false;
            }
            if self.wave_type.contains(&WaveType::Chirp) {
                for (name, len) in [
                    ("chirp_f", self.chirp_f.len()),
                    ("chirp_t", self.chirp_t.len()),
                    ("swipe_s", self.swipe_s.len()),
                ] {
                    if len != n {
                        warn!("{fe}: {name} has {len} entries, wave_type has {n}");
                        ok = false;
                    }
                }
            }
        }
        if self.burst_on.is_some() != self.burst_off.is_some() {
            warn!("{fe}: burst_on and burst_off must be set together");
            ok = false;
        }
        ok
    }
}

/// The full measurement descriptor: one record per front-end plus the
/// on-server device index. Built fresh for every measurement and read-only
/// once handed to the command channel.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ParameterSet {
    pub device: usize,
    pub frontends: BTreeMap<FrontEnd, FrontEndParams>,
}

impl ParameterSet {
    pub fn new(device: usize) -> Self {
        Self {
            device,
            frontends: BTreeMap::new(),
        }
    }

    /// Stores one option, overwriting any previous value for the same
    /// (front-end, option) pair.
    pub fn set(&mut self, frontend: FrontEnd, setting: Setting) -> &mut Self {
        self.frontends.entry(frontend).or_default().apply(setting);
        self
    }

    pub fn get(&self, frontend: FrontEnd) -> Option<&FrontEndParams> {
        self.frontends.get(&frontend)
    }

    /// Validates the whole set. Returns false, never panics, on an
    /// incomplete or inconsistent descriptor; each problem is logged.
    pub fn self_check(&self) -> bool {
        let mut ok = true;
        let mut active = 0usize;
        for (fe, p) in &self.frontends {
            if p.mode != AntMode::Off {
                active += 1;
            }
            ok &= p.check(*fe);
        }
        if active == 0 {
            warn!("parameter set has no active front-end");
            ok = false;
        }
        ok
    }

    /// The front-end this measurement streams from: the first RX-mode entry.
    pub fn rx_frontend(&self) -> Option<FrontEnd> {
        self.frontends
            .iter()
            .find(|(_, p)| p.mode == AntMode::Rx)
            .map(|(fe, _)| *fe)
    }

    /// Demodulation channel count for an RX front-end: one per requested
    /// tone, or a single raw channel when no tone list is given.
    pub fn rx_channels(&self, frontend: FrontEnd) -> usize {
        self.frontends
            .get(&frontend)
            .map(|p| p.freq.len().max(1))
            .unwrap_or(1)
    }

    /// Expected sample count declared for the RX front-end.
    pub fn expected_samples(&self) -> Option<u64> {
        self.rx_frontend()
            .and_then(|fe| self.frontends.get(&fe))
            .and_then(|p| p.samples)
    }

    /// Serializes the set into the command wire form: deterministic JSON
    /// with fixed field order. Only valid after a successful `self_check`.
    pub fn to_wire_form(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Validation(format!("command serialization: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rx_set() -> ParameterSet {
        let mut p = ParameterSet::new(0);
        p.set(FrontEnd::ARx2, Setting::Mode(AntMode::Rx))
            .set(FrontEnd::ARx2, Setting::Rate(1_000_000))
            .set(FrontEnd::ARx2, Setting::Rf(300e6))
            .set(FrontEnd::ARx2, Setting::Bw(2e6))
            .set(FrontEnd::ARx2, Setting::Samples(1_000_000));
        p
    }

    #[test]
    fn rx_set_passes_self_check() {
        assert!(rx_set().self_check());
    }

    #[test]
    fn empty_set_fails_self_check() {
        assert!(!ParameterSet::new(0).self_check());
    }

    #[test]
    fn missing_rx_field_fails_self_check() {
        let mut p = rx_set();
        p.frontends.get_mut(&FrontEnd::ARx2).unwrap().rate = None;
        assert!(!p.self_check());
    }

    #[test]
    fn tx_list_length_mismatch_fails_self_check() {
        let mut p = rx_set();
        p.set(FrontEnd::ATxrx, Setting::Mode(AntMode::Tx))
            .set(FrontEnd::ATxrx, Setting::Rate(1_000_000))
            .set(FrontEnd::ATxrx, Setting::Rf(300e6))
            .set(FrontEnd::ATxrx, Setting::Bw(2e6))
            .set(FrontEnd::ATxrx, Setting::Samples(1_000_000))
            .set(
                FrontEnd::ATxrx,
                Setting::WaveType(vec![WaveType::Tones, WaveType::Tones]),
            )
            .set(FrontEnd::ATxrx, Setting::Ampl(vec![1.0]))
            .set(FrontEnd::ATxrx, Setting::Freq(vec![10e3, 20e3]));
        assert!(!p.self_check());
        p.set(FrontEnd::ATxrx, Setting::Ampl(vec![1.0, 0.5]));
        assert!(p.self_check());
    }

    #[test]
    fn chirp_requires_covarying_lists() {
        let mut p = rx_set();
        p.set(FrontEnd::ATxrx, Setting::Mode(AntMode::Tx))
            .set(FrontEnd::ATxrx, Setting::Rate(1_000_000))
            .set(FrontEnd::ATxrx, Setting::Rf(300e6))
            .set(FrontEnd::ATxrx, Setting::Bw(2e6))
            .set(FrontEnd::ATxrx, Setting::Samples(1_000_000))
            .set(FrontEnd::ATxrx, Setting::WaveType(vec![WaveType::Chirp]))
            .set(FrontEnd::ATxrx, Setting::Ampl(vec![1.0]))
            .set(FrontEnd::ATxrx, Setting::Freq(vec![10e3]));
        assert!(!p.self_check());
        p.set(FrontEnd::ATxrx, Setting::ChirpF(vec![1e6]))
            .set(FrontEnd::ATxrx, Setting::ChirpT(vec![0.5]))
            .set(FrontEnd::ATxrx, Setting::SwipeS(vec![1000]));
        assert!(p.self_check());
    }

    #[test]
    fn burst_fields_come_in_pairs() {
        let mut p = rx_set();
        p.set(FrontEnd::ARx2, Setting::BurstOn(0.1));
        assert!(!p.self_check());
        p.set(FrontEnd::ARx2, Setting::BurstOff(0.9));
        assert!(p.self_check());
    }

    #[test]
    fn set_overwrites_previous_value() {
        let mut p = rx_set();
        p.set(FrontEnd::ARx2, Setting::Rate(2_000_000));
        assert_eq!(p.get(FrontEnd::ARx2).unwrap().rate, Some(2_000_000));
    }

    #[test]
    fn wire_form_is_deterministic() {
        let p = rx_set();
        assert_eq!(p.to_wire_form().unwrap(), p.to_wire_form().unwrap());
        assert!(p.to_wire_form().unwrap().contains("\"A_RX2\""));
    }

    #[test]
    fn rx_channels_follow_tone_count() {
        let mut p = rx_set();
        assert_eq!(p.rx_channels(FrontEnd::ARx2), 1);
        p.set(FrontEnd::ARx2, Setting::Freq(vec![10e3, 20e3, 30e3]));
        assert_eq!(p.rx_channels(FrontEnd::ARx2), 3);
    }
}
