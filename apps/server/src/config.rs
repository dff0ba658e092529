//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! Converts into the `router-core` types the engine actually takes:
//! [`router_core::EngineConfig`] (receivers, timeshift tunables) and
//! [`router_core::DesiredState`] (sinks, source paths) - the config file is
//! the one piece of "desired state" this binary has a fixed source for,
//! since the HTTP control surface that would normally drive `apply_state`
//! is out of scope for the core (spec 1 "Explicitly out of scope").

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use router_core::sink::SinkProtocol;
use router_core::{
    DesiredState, EngineConfig, FormatDescriptor, PathDesired, RtpReceiverConfig,
    ScreamUdpReceiverConfig, SinkConfig, SinkDesired, SourcePathConfig, TimeshiftConfig,
};

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP address to bind receivers to.
    /// Override: `ROUTER_BIND_IP`
    pub bind_ip: IpAddr,

    /// Scream-UDP receivers to bind, by port.
    pub scream_receiver_ports: Vec<u16>,

    /// RTP receivers to bind, by (port, extended_header).
    pub rtp_receivers: Vec<RtpReceiverEntry>,

    /// How many seconds of history the timeshift buffer retains per tag.
    /// Override: `ROUTER_HISTORY_SECONDS`
    pub history_seconds: u64,

    /// Declarative sinks and source paths applied once at startup.
    pub sinks: Vec<SinkEntry>,
    pub paths: Vec<PathEntry>,

    /// Directory for persistent state (none yet; reserved for a future
    /// desired-state cache so a restart doesn't need the control plane to
    /// re-push topology before audio resumes).
    /// Override: `ROUTER_DATA_DIR`
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RtpReceiverEntry {
    pub port: u16,
    #[serde(default)]
    pub extended_header: bool,
    /// Override for `rtp_session_reset_threshold_seconds` (spec 4.1).
    #[serde(default = "default_rtp_session_reset_threshold_seconds")]
    pub rtp_session_reset_threshold_seconds: f64,
}

fn default_rtp_session_reset_threshold_seconds() -> f64 {
    router_core::receivers::rtp::DEFAULT_RTP_SESSION_RESET_THRESHOLD_SECONDS
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkEntry {
    pub sink_id: String,
    pub protocol: SinkProtocolEntry,
    pub sample_rate: u32,
    pub bit_depth: u8,
    pub channels: u8,
    #[serde(default)]
    pub channel_layout: u16,
    pub destination: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SinkProtocolEntry {
    ScreamUdp,
    Rtp,
    WebRtc,
    Alsa,
}

impl From<SinkProtocolEntry> for SinkProtocol {
    fn from(value: SinkProtocolEntry) -> Self {
        match value {
            SinkProtocolEntry::ScreamUdp => SinkProtocol::ScreamUdp,
            SinkProtocolEntry::Rtp => SinkProtocol::Rtp,
            SinkProtocolEntry::WebRtc => SinkProtocol::WebRtc,
            SinkProtocolEntry::Alsa => SinkProtocol::Alsa,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathEntry {
    pub path_id: String,
    pub source_tag: String,
    pub target_sink_id: String,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default)]
    pub timeshift_offset_sec: f64,
    #[serde(default)]
    pub delay_ms: u64,
}

fn default_volume() -> f32 {
    1.0
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            scream_receiver_ports: vec![4010],
            rtp_receivers: Vec::new(),
            history_seconds: 300,
            sinks: Vec::new(),
            paths: Vec::new(),
            data_dir: None,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ROUTER_BIND_IP") {
            if let Ok(ip) = val.parse() {
                self.bind_ip = ip;
            }
        }

        if let Ok(val) = std::env::var("ROUTER_HISTORY_SECONDS") {
            if let Ok(seconds) = val.parse() {
                self.history_seconds = seconds;
            }
        }

        if let Ok(val) = std::env::var("ROUTER_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(val));
        }
    }

    /// Builds the construction-time [`EngineConfig`]: receivers to bind and
    /// timeshift tunables. Everything else (sinks, paths) arrives through
    /// [`Self::to_desired_state`] via `apply_state`.
    pub fn to_engine_config(&self) -> EngineConfig {
        let scream_receivers = self
            .scream_receiver_ports
            .iter()
            .map(|port| ScreamUdpReceiverConfig {
                bind_addr: SocketAddr::new(self.bind_ip, *port),
            })
            .collect();

        let rtp_receivers = self
            .rtp_receivers
            .iter()
            .map(|entry| RtpReceiverConfig {
                bind_addr: SocketAddr::new(self.bind_ip, entry.port),
                extended_header: entry.extended_header,
                rtp_session_reset_threshold_seconds: entry.rtp_session_reset_threshold_seconds,
            })
            .collect();

        EngineConfig {
            scream_receivers,
            rtp_receivers,
            timeshift: TimeshiftConfig {
                history_seconds: self.history_seconds,
                ..TimeshiftConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    /// Builds the startup [`DesiredState`] the binary hands to
    /// `Engine::apply_state` once, right after construction.
    pub fn to_desired_state(&self) -> DesiredState {
        let sinks = self
            .sinks
            .iter()
            .map(|entry| {
                let format = FormatDescriptor::new(
                    entry.sample_rate,
                    entry.bit_depth,
                    entry.channels,
                    entry.channel_layout,
                );
                let mut config = SinkConfig::new(&entry.sink_id, entry.protocol.into(), format);
                config.destination = entry.destination;
                SinkDesired {
                    sink_id: entry.sink_id.clone(),
                    config,
                }
            })
            .collect();

        let paths = self
            .paths
            .iter()
            .filter_map(|entry| {
                let sink = self.sinks.iter().find(|s| s.sink_id == entry.target_sink_id)?;
                let format = FormatDescriptor::new(sink.sample_rate, sink.bit_depth, sink.channels, sink.channel_layout);
                let mut config = SourcePathConfig::new(&entry.path_id, format);
                config.volume = entry.volume;
                config.timeshift_offset_sec = entry.timeshift_offset_sec;
                config.delay_ms = entry.delay_ms;
                Some(PathDesired {
                    path_id: entry.path_id.clone(),
                    source_tag: entry.source_tag.clone(),
                    target_sink_id: entry.target_sink_id.clone(),
                    config,
                })
            })
            .collect();

        DesiredState { sinks, paths }
    }
}

/// Upper bound the binary waits for graceful worker shutdown before giving
/// up and exiting anyway.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
