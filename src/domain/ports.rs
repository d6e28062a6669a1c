use crate::utils::error::Result;
use async_trait::async_trait;

/// Routing options shared by every uplink request. Unset values are sent as
/// empty fields so the server applies its session defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UplinkOptions {
    pub validate: Option<bool>,
    pub string_id: Option<String>,
    pub virtual_channel: Option<u32>,
    pub scid: Option<u32>,
    pub wait_for_radiation: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileLoad {
    pub source: String,
    pub target: String,
    pub file_type: Option<u32>,
    pub overwrite: Option<bool>,
}

/// Anything that can carry commands, files and log lines toward the spacecraft.
#[async_trait]
pub trait CommandUplink: Send + Sync {
    async fn send_flight_command(&self, command: &str, options: &UplinkOptions) -> Result<()>;

    async fn send_sse_command(&self, command: &str) -> Result<()>;

    async fn send_file_load(&self, load: &FileLoad, options: &UplinkOptions) -> Result<()>;

    async fn send_scmf(
        &self,
        path: &str,
        disable_checks: Option<bool>,
        wait_for_radiation: u32,
    ) -> Result<()>;

    async fn send_raw_data(&self, path: &str, hex: Option<bool>, wait_for_radiation: u32)
        -> Result<()>;

    async fn send_command_list_file(&self, path: &str, options: &UplinkOptions) -> Result<()>;

    async fn send_log(&self, level: &str, message: &str) -> Result<()>;

    async fn set_uplink_rates(&self, rates: Option<&[f64]>) -> Result<()>;

    fn summary(&self) -> String;

    async fn stop(&self) -> Result<()>;
}
