//! Client for a GPU-accelerated USRP streaming server.
//!
//! A measurement is described by a [`ParameterSet`], shipped over the
//! [`CommandChannel`], streamed back as IQ packets through a
//! [`PacketSource`], filtered in real time by a [`Trigger`] and persisted by
//! the [`ContainerWriter`] into a growable HDF5 container. The
//! [`AcquisitionDriver`] ties the pieces together for one run; both
//! connections persist across runs.

pub mod command;
pub mod config;
pub mod driver;
pub mod error;
pub mod packet;
pub mod params;
pub mod source;
pub mod trigger;
pub mod utils;
pub mod writer;

pub use command::{CommandChannel, SETTLE_DELAY};
pub use config::Conf;
pub use driver::{
    AcquisitionDriver, AcquisitionError, AcquisitionReport, DriverOptions, DriverState,
};
pub use error::{Error, Result};
pub use packet::{IqSample, Packet, PacketMeta};
pub use params::{AntMode, FrontEnd, ParameterSet, Setting, WaveType};
pub use source::{PacketSource, Receive, SourceEvent};
pub use trigger::{
    DetectMode, EdgeTrigger, NoiseAlignment, PassThrough, PulseNoiseTrigger, Trigger,
    TriggerControl,
};
pub use utils::Counter;
pub use writer::{BookkeepingGroup, ContainerWriter, RecordKind, RecordValue};
