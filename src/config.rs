use confique::Config;

/// Client configuration, loaded from TOML with built-in defaults.
#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub connection: ConnectionSettings,
    #[config(nested)]
    pub stream: StreamSettings,
}

#[derive(Config, Debug, Clone)]
pub struct ConnectionSettings {
    /// Host running the GPU server.
    #[config(default = "127.0.0.1")]
    pub host: String,
    /// Control (command/ack) port.
    #[config(default = 22001)]
    pub command_port: u16,
    /// Data streaming port.
    #[config(default = 22000)]
    pub data_port: u16,
}

#[derive(Config, Debug, Clone)]
pub struct StreamSettings {
    /// Depth of the bounded queue between the receive thread and the
    /// trigger/writer pipeline. Packets are dropped (and counted) beyond it.
    #[config(default = 4096)]
    pub queue_depth: usize,
    /// Settle window between command acceptance and the first packet.
    #[config(default = 1000)]
    pub settle_delay_ms: u64,
    /// Tick used to poll the queue and the stop flag.
    #[config(default = 100)]
    pub poll_interval_ms: u64,
    /// Transport buffer length requested from the server; 0 for its default.
    #[config(default = 1000000)]
    pub default_buffer_len: u64,
}

impl Conf {
    /// Loads `path` when it exists, otherwise the built-in defaults.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let builder = Conf::builder().env();
        let conf = if path.exists() {
            builder.file(path).load()?
        } else {
            builder.load()?
        };
        Ok(conf)
    }
}
