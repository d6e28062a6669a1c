use crate::utils::error::{MtakError, Result};
use crate::utils::time::SclkFormat;
use crate::utils::validation::{self, Validate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MtakConfig {
    pub session: SessionConfig,
    pub wait: WaitConfig,
    pub downlink: DownlinkConfig,
    pub uplink: UplinkConfig,
    pub proxy: ProxyConfig,
    pub database: Option<DatabaseConfig>,
    pub jms: Option<JmsConfig>,
    pub security: Option<SecurityConfig>,
    pub services: ServicesConfig,
    pub sclk: SclkFormat,
    pub inject: InjectConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub key: Option<String>,
    pub host: Option<String>,
    pub config_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// Seconds; a negative value waits without a time limit.
    pub default_timeout: i64,
    pub default_lookback: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            default_timeout: 60,
            default_lookback: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownlinkConfig {
    pub port: u16,
    pub channel_list_size: usize,
    pub evr_list_size: usize,
    pub product_list_size: usize,
    pub cfdp_indication_list_size: usize,
    pub polling_timeout_ms: u64,
    pub accept_timeout_secs: u64,
    pub fetch_lad: bool,
    pub ignore_eha: bool,
    pub ignore_evrs: bool,
    pub ignore_products: bool,
    pub ignore_fsw: bool,
    pub ignore_sse: bool,
    pub ignore_cfdp_indications: bool,
    pub channel_ids: Vec<String>,
    pub modules: Vec<String>,
    pub subsystems: Vec<String>,
    pub ops_categories: Vec<String>,
}

impl Default for DownlinkConfig {
    fn default() -> Self {
        Self {
            port: 60001,
            channel_list_size: 25,
            evr_list_size: 100,
            product_list_size: 100,
            cfdp_indication_list_size: 5,
            polling_timeout_ms: 500,
            accept_timeout_secs: 30,
            fetch_lad: false,
            ignore_eha: false,
            ignore_evrs: false,
            ignore_products: false,
            ignore_fsw: false,
            ignore_sse: false,
            ignore_cfdp_indications: false,
            channel_ids: Vec::new(),
            modules: Vec::new(),
            subsystems: Vec::new(),
            ops_categories: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UplinkConnectionType {
    #[default]
    CommandService,
    Socket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    #[serde(alias = "has_uplink")]
    pub enabled: bool,
    pub fsw_host: String,
    pub fsw_port: Option<u16>,
    pub sse_host: Option<String>,
    pub sse_port: Option<u16>,
    pub has_sse: bool,
    pub has_cfdp: bool,
    pub connection_type: UplinkConnectionType,
    pub ready_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub string_id: Option<String>,
    pub scid: Option<u32>,
    pub throw_on_error: bool,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fsw_host: "localhost".to_string(),
            fsw_port: None,
            sse_host: None,
            sse_port: None,
            has_sse: false,
            has_cfdp: false,
            connection_type: UplinkConnectionType::CommandService,
            ready_timeout_secs: 120,
            stop_timeout_secs: 20,
            string_id: None,
            scid: None,
            throw_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub rest_host: String,
    pub rest_port: u16,
    pub rest_insecure: bool,
    pub port_scan_range: u16,
    pub status_retries: u32,
    pub status_retry_delay_secs: u64,
    pub monitor_interval_secs: u64,
    pub log_file: Option<String>,
    pub log_to_db: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            rest_host: "localhost".to_string(),
            rest_port: 8384,
            rest_insecure: true,
            port_scan_range: 100,
            status_retries: 10,
            status_retry_delay_secs: 3,
            monitor_interval_secs: 2,
            log_file: None,
            log_to_db: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JmsConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub login_method: Option<String>,
    pub keytab_file: Option<String>,
    pub username: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub global_lad_url: Option<String>,
    pub cpd_url: Option<String>,
    pub cfdp_processor_url: String,
    /// Applies to every CPD, Global LAD and CFDP Processor request.
    pub request_timeout_secs: u64,
    /// CFDP entity mnemonic to entity id.
    pub cfdp_entities: BTreeMap<String, u64>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            global_lad_url: None,
            cpd_url: None,
            cfdp_processor_url: "http://localhost:8080/cfdp".to_string(),
            request_timeout_secs: 30,
            cfdp_entities: BTreeMap::new(),
        }
    }
}

impl ServicesConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectConfig {
    pub disabled: bool,
}

fn env_var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("static regex"))
}

impl MtakConfig {
    /// Load the configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(MtakError::IoError)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content);

        toml::from_str(&processed_content).map_err(|e| MtakError::ConfigError {
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// Replace `${VAR}` placeholders; unknown variables are left untouched.
    fn substitute_env_vars(content: &str) -> String {
        env_var_regex()
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn validate_config(&self) -> Result<()> {
        if let Some(key) = &self.session.key {
            validation::validate_numeric("session.key", key)?;
        }

        validation::validate_min_count(
            "downlink.channel_list_size",
            self.downlink.channel_list_size,
            1,
        )?;
        validation::validate_min_count("downlink.evr_list_size", self.downlink.evr_list_size, 1)?;
        validation::validate_min_count(
            "downlink.product_list_size",
            self.downlink.product_list_size,
            1,
        )?;
        validation::validate_min_count(
            "downlink.cfdp_indication_list_size",
            self.downlink.cfdp_indication_list_size,
            1,
        )?;
        validation::validate_range("sclk.fine_bits", self.sclk.fine_bits, 1, 32)?;
        validation::validate_host("proxy.rest_host", &self.proxy.rest_host)?;
        validation::validate_min_count(
            "proxy.status_retries",
            self.proxy.status_retries as usize,
            1,
        )?;

        if let Some(url) = &self.services.global_lad_url {
            validation::validate_url("services.global_lad_url", url)?;
        }
        if let Some(url) = &self.services.cpd_url {
            validation::validate_url("services.cpd_url", url)?;
        }
        validation::validate_url("services.cfdp_processor_url", &self.services.cfdp_processor_url)?;
        validation::validate_min_count(
            "services.request_timeout_secs",
            self.services.request_timeout_secs as usize,
            1,
        )?;

        Ok(())
    }

    /// Location of an AMPCS executable: `$CHILL_GDS/bin/<name>` when
    /// `CHILL_GDS` is set, otherwise the bare name resolved through `PATH`.
    pub fn chill_tool(name: &str) -> PathBuf {
        match std::env::var_os("CHILL_GDS") {
            Some(root) if !root.is_empty() => PathBuf::from(root).join("bin").join(name),
            _ => PathBuf::from(name),
        }
    }

    /// Directory for proxy log files (`TMPDIR`, falling back to the OS default).
    pub fn log_dir() -> PathBuf {
        match std::env::var_os("TMPDIR") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => std::env::temp_dir(),
        }
    }
}

impl Validate for MtakConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}
