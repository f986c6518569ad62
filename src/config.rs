use crate::capture::engine::LiveOptions;
use crate::defrag::DEFAULT_FRAGMENT_TIMEOUT_MS;
use crate::flow::DEFAULT_MAX_FLOW_SIZE;
use crate::pipeline::queue::DEFAULT_QUEUE_CAPACITY;
use crate::pipeline::IngestSettings;
use crate::reassembly::stream::DEFAULT_MAX_PENDING_BYTES;
use crate::reassembly::udp::DEFAULT_UDP_IDLE_MS;
use crate::reassembly::{TcpConfig, UdpConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn empty_path_none<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<PathBuf>::deserialize(deserializer)?;
    Ok(opt.filter(|path| !path.as_os_str().is_empty()))
}

fn empty_string_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    Ok(opt.filter(|s| !s.trim().is_empty()))
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    /// The flag pattern does not compile.
    FlagPattern(regex::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "config io error: {}", err),
            ConfigError::Parse(err) => write!(f, "config parse error: {}", err),
            ConfigError::FlagPattern(err) => write!(f, "invalid flag regex: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub reassembly: ReassemblyConfig,
    pub tagging: TaggingConfig,
    pub storage: StorageConfig,
    pub watch: WatchConfig,
    pub live: LiveConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&raw).map_err(ConfigError::Parse)
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        let r = &self.reassembly;
        IngestSettings {
            tcp: TcpConfig {
                strict: r.strict,
                allow_missing_init: r.allow_missing_init,
                max_flow_size: r.max_flow_size,
                max_pending_bytes: r.max_pending_bytes,
            },
            tcp_idle_ms: (r.tcp_idle_secs > 0).then(|| r.tcp_idle_secs as i64 * 1000),
            sweep_interval_ms: r.sweep_interval_ms.max(1) as i64,
            fragment_timeout_ms: r.fragment_timeout_secs as i64 * 1000,
            keep_frames: self.storage.flow_pcap,
        }
    }

    pub fn udp_config(&self) -> UdpConfig {
        UdpConfig {
            idle_ms: self.reassembly.udp_idle_secs as i64 * 1000,
            max_flow_size: self.reassembly.max_flow_size,
        }
    }

    pub fn live_options(&self) -> LiveOptions {
        LiveOptions {
            promiscuous: self.capture.promiscuous,
            snaplen: self.capture.snaplen,
            timeout_ms: self.capture.timeout_ms,
            filter: self.capture.filter.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// BPF filter applied to files and interfaces.
    #[serde(deserialize_with = "empty_string_none")]
    pub filter: Option<String>,
    pub promiscuous: bool,
    pub snaplen: i32,
    pub timeout_ms: i32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            filter: None,
            promiscuous: true,
            snaplen: 65535,
            timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Drop segments that violate TCP state expectations.
    pub strict: bool,
    pub allow_missing_init: bool,
    /// Per-flow byte ceiling.
    pub max_flow_size: usize,
    pub max_pending_bytes: usize,
    /// Idle TCP connections are force-flushed after this long (0 = never).
    pub tcp_idle_secs: u64,
    pub udp_idle_secs: u64,
    pub sweep_interval_ms: u64,
    pub fragment_timeout_secs: u64,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        ReassemblyConfig {
            strict: false,
            allow_missing_init: true,
            max_flow_size: DEFAULT_MAX_FLOW_SIZE,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
            tcp_idle_secs: 300,
            udp_idle_secs: (DEFAULT_UDP_IDLE_MS / 1000) as u64,
            sweep_interval_ms: 1000,
            fragment_timeout_secs: (DEFAULT_FRAGMENT_TIMEOUT_MS / 1000) as u64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaggingConfig {
    /// Flag pattern; tagging is off when unset.
    #[serde(deserialize_with = "empty_string_none")]
    pub flag_regex: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the sharded flow files.
    pub flow_dir: PathBuf,
    /// Ledger and summary records.
    pub state_dir: PathBuf,
    /// Write each flow's frames to a pcap next to its flow file.
    pub flow_pcap: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            flow_dir: PathBuf::from("flows"),
            state_dir: PathBuf::from("state"),
            flow_pcap: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    #[serde(deserialize_with = "empty_path_none")]
    pub dir: Option<PathBuf>,
    pub settle_ms: u64,
    /// File workers (0 = half the cores, at most 8).
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            dir: None,
            settle_ms: 1000,
            workers: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl WatchConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Interface to capture on; all interfaces when unset.
    #[serde(deserialize_with = "empty_string_none")]
    pub interface: Option<String>,
    pub round_secs: u64,
    pub out_dir: PathBuf,
    /// Finished round files are moved here; left in `out_dir` when unset.
    #[serde(deserialize_with = "empty_path_none")]
    pub spool_dir: Option<PathBuf>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        LiveConfig {
            interface: None,
            round_secs: 60,
            out_dir: PathBuf::from("captures"),
            spool_dir: None,
        }
    }
}
