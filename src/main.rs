use anyhow::{bail, ensure, Context};
use clap::{Parser, ValueEnum};
use log::info;
use rusrp::*;
use simplelog::{
    ColorChoice, CombinedLogger, LevelFilter, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum TriggerKind {
    /// Persist every packet untouched.
    None,
    /// Magnitude edge trigger, fixed window around each hit.
    Edge,
    /// Buffered pulse/noise classifier.
    PulseNoise,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum AlignmentArg {
    Exact,
    Nearest,
}

impl From<AlignmentArg> for NoiseAlignment {
    fn from(a: AlignmentArg) -> Self {
        match a {
            AlignmentArg::Exact => NoiseAlignment::Exact,
            AlignmentArg::Nearest => NoiseAlignment::Nearest,
        }
    }
}

/// Run one capture against a USRP streaming server.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Output container; defaults to a timestamped name.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Sample rate in sps.
    #[arg(long, default_value_t = 1_000_000)]
    rate: u64,

    /// RF centre frequency in Hz.
    #[arg(long)]
    rf: f64,

    /// Front-end gain in dB.
    #[arg(long, default_value_t = 0)]
    gain: i32,

    /// Analog bandwidth in Hz; defaults to the sample rate.
    #[arg(long)]
    bw: Option<f64>,

    /// Total samples to capture per channel.
    #[arg(long)]
    samples: u64,

    /// RX demodulation tone in Hz; repeat for multiple channels.
    #[arg(long = "rx-tone", value_name = "HZ")]
    rx_tones: Vec<f64>,

    /// TX tone in Hz; any occurrence enables the TX front-end.
    #[arg(long = "tx-tone", value_name = "HZ")]
    tx_tones: Vec<f64>,

    /// TX tone amplitude, one per TX tone. Defaults to an equal split of
    /// full scale.
    #[arg(long = "tx-ampl", value_name = "AMPL")]
    tx_ampls: Vec<f64>,

    /// On-server device index.
    #[arg(long, default_value_t = 0)]
    device: usize,

    /// Stall timeout in seconds; omit to wait forever.
    #[arg(long)]
    timeout_secs: Option<u64>,

    #[arg(long, value_enum, default_value_t = TriggerKind::None)]
    trigger: TriggerKind,

    /// Trigger threshold multiplier over the noise baseline.
    #[arg(long, default_value_t = 10.0)]
    multiplier: f64,

    /// Samples kept before an edge hit.
    #[arg(long, default_value_t = 100)]
    before: usize,

    /// Samples kept after an edge hit.
    #[arg(long, default_value_t = 400)]
    after: usize,

    /// Minimum sample separation between edge hits.
    #[arg(long, default_value_t = 500)]
    min_separation: usize,

    /// Extracted window length in seconds (pulse-noise trigger).
    #[arg(long, default_value_t = 1e-3)]
    slice_secs: f64,

    /// Spacing of periodic noise windows in seconds (pulse-noise trigger).
    #[arg(long, default_value_t = 0.1)]
    noise_interval: f64,

    /// Stream accumulated per classification pass, in seconds.
    #[arg(long, default_value_t = 1.0)]
    buffer_secs: f64,

    /// Noise window membership policy (pulse-noise trigger).
    #[arg(long, value_enum, default_value_t = AlignmentArg::Nearest)]
    alignment: AlignmentArg,

    /// Debug-level logging on the terminal.
    #[arg(short, long)]
    verbose: bool,
}

fn timestamp() -> String {
    let fmt = format_description!("[year][month][day]_[hour][minute][second]");
    OffsetDateTime::now_utc()
        .format(&fmt)
        .unwrap_or_else(|_| "capture".into())
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let term_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let loggers: Vec<Box<dyn SharedLogger>> = vec![
        TermLogger::new(
            term_level,
            simplelog::Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(
            LevelFilter::Debug,
            simplelog::Config::default(),
            File::create(format!("rusrp_{}.log", timestamp()))?,
        ),
    ];
    CombinedLogger::init(loggers)?;
    Ok(())
}

fn build_params(cli: &Cli, conf: &Conf) -> anyhow::Result<ParameterSet> {
    let bw = cli.bw.unwrap_or(cli.rate as f64);
    let mut params = ParameterSet::new(cli.device);
    params
        .set(FrontEnd::ARx2, Setting::Mode(AntMode::Rx))
        .set(FrontEnd::ARx2, Setting::Rate(cli.rate))
        .set(FrontEnd::ARx2, Setting::Rf(cli.rf))
        .set(FrontEnd::ARx2, Setting::Gain(cli.gain))
        .set(FrontEnd::ARx2, Setting::Bw(bw))
        .set(FrontEnd::ARx2, Setting::Samples(cli.samples))
        .set(
            FrontEnd::ARx2,
            Setting::BufferLen(conf.stream.default_buffer_len),
        );
    if cli.rx_tones.is_empty() {
        params.set(FrontEnd::ARx2, Setting::WaveType(vec![WaveType::NoDsp]));
    } else {
        params
            .set(FrontEnd::ARx2, Setting::Freq(cli.rx_tones.clone()))
            .set(
                FrontEnd::ARx2,
                Setting::WaveType(vec![WaveType::Tones; cli.rx_tones.len()]),
            );
    }

    if !cli.tx_tones.is_empty() {
        let n = cli.tx_tones.len();
        let ampls = if cli.tx_ampls.is_empty() {
            vec![1.0 / n as f64; n]
        } else if cli.tx_ampls.len() == n {
            cli.tx_ampls.clone()
        } else {
            bail!(
                "{} TX amplitudes given for {} TX tones",
                cli.tx_ampls.len(),
                n
            );
        };
        params
            .set(FrontEnd::ATxrx, Setting::Mode(AntMode::Tx))
            .set(FrontEnd::ATxrx, Setting::Rate(cli.rate))
            .set(FrontEnd::ATxrx, Setting::Rf(cli.rf))
            .set(FrontEnd::ATxrx, Setting::Gain(cli.gain))
            .set(FrontEnd::ATxrx, Setting::Bw(bw))
            .set(FrontEnd::ATxrx, Setting::Samples(cli.samples))
            .set(
                FrontEnd::ATxrx,
                Setting::WaveType(vec![WaveType::Tones; n]),
            )
            .set(FrontEnd::ATxrx, Setting::Freq(cli.tx_tones.clone()))
            .set(FrontEnd::ATxrx, Setting::Ampl(ampls))
            .set(
                FrontEnd::ATxrx,
                Setting::BufferLen(conf.stream.default_buffer_len),
            );
    }
    Ok(params)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    let conf = Conf::load(&cli.config).context("loading configuration")?;

    let params = build_params(&cli, &conf)?;
    ensure!(
        params.self_check(),
        "measurement descriptor failed self check, see log"
    );

    let mut command = CommandChannel::connect(&conf.connection.host, conf.connection.command_port)
        .context("connecting to the command port")?;
    let mut source = PacketSource::connect(
        &conf.connection.host,
        conf.connection.data_port,
        conf.stream.queue_depth,
    )
    .context("connecting to the data port")?;

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("usrp_capture_{}.h5", timestamp())));
    let mut opts = DriverOptions::new(output);
    opts.timeout = cli.timeout_secs.map(Duration::from_secs);
    opts.poll_interval = Duration::from_millis(conf.stream.poll_interval_ms);
    opts.settle_delay = Duration::from_millis(conf.stream.settle_delay_ms);

    let trigger: Box<dyn Trigger> = match cli.trigger {
        TriggerKind::None => Box::new(PassThrough),
        TriggerKind::Edge => Box::new(EdgeTrigger::new(
            cli.rate,
            cli.multiplier,
            cli.before,
            cli.after,
            cli.min_separation,
        )),
        TriggerKind::PulseNoise => Box::new(PulseNoiseTrigger::new(
            cli.rate,
            cli.multiplier,
            cli.slice_secs,
            cli.noise_interval,
            cli.buffer_secs,
            DetectMode::Both,
            cli.alignment.into(),
        )),
    };

    let mut driver = AcquisitionDriver::new(&mut command, &mut source, &params, trigger, opts);
    match driver.run() {
        Ok(report) => {
            info!(
                "{} packets received ({} dropped, {} sequence gaps)",
                report.packets_received, report.packets_dropped, report.sequence_gaps
            );
            println!(
                "capture complete: {} samples in {} packets -> {}",
                report.samples_persisted,
                report.packets_persisted,
                report.output.display()
            );
            Ok(())
        }
        Err(err) => bail!("{err}"),
    }
}
