//! Script-facing automation API.
//!
//! [`Mtak`] ties an uplink ([`CommandUplink`]) and a [`DownlinkProxy`]
//! together behind the calls a test procedure makes: send a command, wait
//! for a channel value, check the latest EVRs, read the spacecraft clock.
//! Failures that a procedure is expected to tolerate are logged and
//! reported as `false`/`None` instead of aborting the run.

use crate::config::toml_config::MtakConfig;
use crate::core::collection::{EvrQuery, ProductQuery};
use crate::core::downlink::{DownlinkProxy, TelemetryStore, WaitOptions};
use crate::core::services::{CfdpProcessorClient, CfdpPutRequest, CfdpPutResponse};
use crate::core::wait::{CfdpIndicationWait, ChanValWait, EvrWait, ProductWait, WaitCondition};
use crate::domain::model::{
    CfdpIndication, ChanVal, ChannelType, Dn, Evr, Product, ProductStatus, Telemetry,
};
use crate::domain::ports::{CommandUplink, FileLoad, UplinkOptions};
use crate::utils::error::{MtakError, Result};
use crate::utils::logger::LogLevel;
use crate::utils::time::{format_time, now_ms, parse_time_string, sleep_time_until};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Seconds between the Unix epoch and J2000.
pub const J2000_SECONDS: f64 = 946_727_935.816;

/// Indications that end a CFDP transaction: finished, fault, abandoned.
const CFDP_FINISHED: &str = "tf";
const CFDP_FAULT: &str = "ft";
const CFDP_ABANDONED: &str = "ab";
const CFDP_PUT_LOOKBACK_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Epoch {
    #[default]
    Unix,
    J2000,
}

impl Epoch {
    fn convert(&self, unix_seconds: f64) -> f64 {
        match self {
            Epoch::Unix => unix_seconds,
            Epoch::J2000 => unix_seconds - J2000_SECONDS,
        }
    }
}

impl FromStr for Epoch {
    type Err = MtakError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNIX" => Ok(Epoch::Unix),
            "J2000" => Ok(Epoch::J2000),
            _ => Err(MtakError::InvalidConfigValueError {
                field: "epoch".to_string(),
                value: s.to_string(),
                reason: "The valid values are \"UNIX\" or \"J2000\"".to_string(),
            }),
        }
    }
}

/// Per-send settings on top of the uplink routing options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub uplink: UplinkOptions,
    pub uplink_rates: Option<Vec<f64>>,
    /// Overrides `[uplink] throw_on_error` for this call.
    pub throw_on_error: Option<bool>,
}

/// Ground and spacecraft time bounds given as strings. ERT/SCET take ISO or
/// DOY times; SCLK takes `coarse-fine`, `coarse.fraction` or bare ticks.
#[derive(Debug, Clone, Default)]
pub struct TimeBounds {
    pub ert_start: Option<String>,
    pub ert_end: Option<String>,
    pub scet_start: Option<String>,
    pub scet_end: Option<String>,
    pub sclk_start: Option<String>,
    pub sclk_end: Option<String>,
}

struct ExactBounds {
    ert_start: Option<i64>,
    ert_end: Option<i64>,
    scet_start: Option<i64>,
    scet_end: Option<i64>,
    sclk_start: Option<u64>,
    sclk_end: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EhaCriteria {
    pub channel_id: Option<String>,
    pub name: Option<String>,
    pub dn: Option<String>,
    pub dn_start: Option<String>,
    pub dn_end: Option<String>,
    pub eu: Option<f64>,
    pub eu_start: Option<f64>,
    pub eu_end: Option<f64>,
    pub times: TimeBounds,
    pub realtime: bool,
    pub recorded: bool,
}

impl Default for EhaCriteria {
    fn default() -> Self {
        Self {
            channel_id: None,
            name: None,
            dn: None,
            dn_start: None,
            dn_end: None,
            eu: None,
            eu_start: None,
            eu_end: None,
            times: TimeBounds::default(),
            realtime: true,
            recorded: false,
        }
    }
}

impl EhaCriteria {
    pub fn channel(channel_id: &str) -> Self {
        Self {
            channel_id: Some(channel_id.to_string()),
            ..Self::default()
        }
    }

    fn has_value_checks(&self) -> bool {
        self.dn.is_some()
            || self.dn_start.is_some()
            || self.dn_end.is_some()
            || self.eu.is_some()
            || self.eu_start.is_some()
            || self.eu_end.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct EvrCriteria {
    pub name: Option<String>,
    pub event_id: Option<i64>,
    pub level: Option<String>,
    pub module: Option<String>,
    pub message: Option<String>,
    pub message_substr: Option<String>,
    pub times: TimeBounds,
    pub realtime: bool,
    pub recorded: bool,
    pub max_num: Option<i64>,
}

impl Default for EvrCriteria {
    fn default() -> Self {
        Self {
            name: None,
            event_id: None,
            level: None,
            module: None,
            message: None,
            message_substr: None,
            times: TimeBounds::default(),
            realtime: true,
            recorded: false,
            max_num: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProductCriteria {
    pub name: Option<String>,
    pub apid: Option<u32>,
    pub transaction_id: Option<String>,
    pub status: Option<String>,
    /// SCET bounds apply to the product's DVT SCET, SCLK bounds to its DVT SCLK.
    pub times: TimeBounds,
    pub max_num: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct CfdpCriteria {
    pub indication_types: Vec<String>,
    pub source_entity_id: Option<String>,
    pub transaction_sequence_number: Option<String>,
    pub max_num: Option<i64>,
}

/// A CFDP PUT user action for the CFDP Processor.
#[derive(Debug, Clone, Default)]
pub struct CfdpPut {
    /// Relative to the processor's uplink files directory.
    pub source_file_name: String,
    pub destination_entity: Option<u64>,
    /// Looked up in `[services.cfdp_entities]` when no entity id is given.
    pub destination_entity_mnemonic: Option<String>,
    /// Defaults to the source file name.
    pub destination_file_name: Option<String>,
    pub service_class: u8,
    pub messages_to_user: Vec<String>,
    /// Seconds to wait for the transaction to finish; zero or less returns
    /// as soon as the processor accepts the request.
    pub wait_for_completion: i64,
    pub cfdp_processor_url: Option<String>,
    pub throw_on_error: Option<bool>,
}

/// Fields for a fabricated channel value.
#[derive(Debug, Clone)]
pub struct EhaInjection {
    pub channel_id: String,
    pub name: String,
    pub channel_type: ChannelType,
    pub dn: Option<String>,
    pub eu: Option<f64>,
    pub event_time: String,
    pub sclk: String,
    pub ert: String,
    pub scet: String,
    pub dn_units: String,
    pub eu_units: String,
    pub status: Option<String>,
    pub alarms: Vec<(String, String)>,
    pub realtime: bool,
}

impl Default for EhaInjection {
    fn default() -> Self {
        Self {
            channel_id: String::new(),
            name: String::new(),
            channel_type: ChannelType::default(),
            dn: None,
            eu: None,
            event_time: String::new(),
            sclk: String::new(),
            ert: String::new(),
            scet: String::new(),
            dn_units: String::new(),
            eu_units: String::new(),
            status: None,
            alarms: Vec::new(),
            realtime: true,
        }
    }
}

/// Automation session over one uplink and one downlink.
pub struct Mtak {
    config: MtakConfig,
    uplink: Arc<dyn CommandUplink>,
    downlink: DownlinkProxy,
    running: AtomicBool,
    successful_cfdp_puts: AtomicU64,
    failed_cfdp_puts: AtomicU64,
}

impl Mtak {
    /// Start the session. The downlink is started unless it is already
    /// reading telemetry; the uplink is expected to be connected.
    pub async fn startup(
        config: MtakConfig,
        uplink: Arc<dyn CommandUplink>,
        downlink: DownlinkProxy,
    ) -> Result<Self> {
        info!(
            "startup(key=\"{}\",host=\"{}\")",
            config.session.key.as_deref().unwrap_or(""),
            config.session.host.as_deref().unwrap_or("")
        );
        if !downlink.is_running() {
            downlink.start().await?;
        }
        info!("MTAK startup complete");
        Ok(Self {
            config,
            uplink,
            downlink,
            running: AtomicBool::new(true),
            successful_cfdp_puts: AtomicU64::new(0),
            failed_cfdp_puts: AtomicU64::new(0),
        })
    }

    /// Stop both proxies and log the session summary. Later calls fail with
    /// `InvalidStateError`.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("MTAK is already shut down");
            return Ok(());
        }
        info!("shutdown()");

        if let Err(e) = self.uplink.stop().await {
            error!("Error stopping the uplink proxy: {}", e);
        }
        self.downlink.store().release_waits();
        self.downlink.stop().await?;

        info!("{}", self.summary());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &MtakConfig {
        &self.config
    }

    pub fn up_proxy(&self) -> &Arc<dyn CommandUplink> {
        &self.uplink
    }

    pub fn down_proxy(&self) -> &DownlinkProxy {
        &self.downlink
    }

    fn store(&self) -> &TelemetryStore {
        self.downlink.store()
    }

    fn check_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(MtakError::InvalidStateError {
                message: "MTAK is not running. Call startup() first.".to_string(),
            })
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{}\nSuccessful CFDP PUTs = {}\nFailed CFDP PUTs = {}\n{}",
            self.uplink.summary(),
            self.successful_cfdp_puts.load(Ordering::Relaxed),
            self.failed_cfdp_puts.load(Ordering::Relaxed),
            self.store().summary()
        )
    }

    // ---- sleeping ----

    /// Sleep for `seconds`, or until the ground time `until`. With
    /// `update_freq`, log the remaining time every that many seconds.
    pub async fn wait(
        &self,
        seconds: Option<f64>,
        until: Option<&str>,
        update_freq: Option<f64>,
    ) -> Result<()> {
        self.check_running()?;
        info!(
            "wait(seconds={:?},until={:?},update_freq={:?})",
            seconds, until, update_freq
        );

        let total = match (seconds, until) {
            (Some(_), Some(_)) | (None, None) => {
                error!("You must specify exactly one of the \"seconds\" or \"until\" parameters to the \"wait\" method.");
                return Ok(());
            }
            (Some(seconds), None) => seconds,
            (None, Some(until)) => {
                let remaining = sleep_time_until(until)?;
                if remaining <= 0.0 {
                    warn!(
                        "The time {} is in the past. No waiting will take place.",
                        until
                    );
                    return Ok(());
                }
                remaining
            }
        };
        if total <= 0.0 {
            return Ok(());
        }

        let step = match update_freq {
            Some(freq) if freq > 0.0 && freq < total => freq,
            Some(freq) => {
                warn!(
                    "The update frequency {} is not less than the wait of {} seconds. It will be ignored.",
                    freq, total
                );
                total
            }
            None => total,
        };

        let mut remaining = total;
        while remaining > 0.0 {
            let chunk = step.min(remaining);
            tokio::time::sleep(Duration::from_secs_f64(chunk)).await;
            remaining -= chunk;
            if remaining > 0.0 && step < total {
                info!("{:.0} seconds remaining to wait...", remaining);
            }
        }
        Ok(())
    }

    /// Sleep until the downlinked SCLK moves `ticks` forward, or reaches
    /// `until`.
    pub async fn wait_sclk(&self, ticks: Option<f64>, until: Option<&str>) -> Result<()> {
        self.check_running()?;
        info!("wait_sclk(ticks={:?},until={:?})", ticks, until);
        match (ticks, until) {
            (Some(ticks), None) => {
                self.store().wait_by_sclk(ticks).await;
                Ok(())
            }
            (None, Some(until)) => self.store().wait_until_sclk(until).await,
            _ => {
                error!("You must specify exactly one of the \"ticks\" or \"until\" parameters to the \"wait_sclk\" method.");
                Ok(())
            }
        }
    }

    // ---- uplink ----

    fn routed(&self, options: &UplinkOptions) -> UplinkOptions {
        let mut routed = options.clone();
        if routed.string_id.is_none() {
            routed.string_id = self.config.uplink.string_id.clone();
        }
        if routed.scid.is_none() {
            routed.scid = self.config.uplink.scid;
        }
        routed
    }

    async fn transmit<F>(&self, options: &SendOptions, send: F) -> Result<bool>
    where
        F: Future<Output = Result<()>>,
    {
        let outcome = match self
            .uplink
            .set_uplink_rates(options.uplink_rates.as_deref())
            .await
        {
            Ok(()) => send.await,
            Err(e) => Err(e),
        };
        self.report(outcome, options.throw_on_error)
    }

    fn report(&self, outcome: Result<()>, throw_on_error: Option<bool>) -> Result<bool> {
        let throw = throw_on_error.unwrap_or(self.config.uplink.throw_on_error);
        match outcome {
            Ok(()) => {
                info!("Transmission succeeded");
                Ok(true)
            }
            Err(e) if e.is_swallowed() => {
                error!("{}", e);
                Ok(false)
            }
            Err(e) if e.is_automation_error() => {
                error!("{}", e);
                if throw {
                    Err(e)
                } else {
                    Ok(false)
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn send_fsw_cmd(&self, command: &str, options: SendOptions) -> Result<bool> {
        self.check_running()?;
        info!(
            "send_fsw_cmd(command=\"{}\",validate={:?},stringId={:?},virtualChannel={:?},waitForRadiation={})",
            command,
            options.uplink.validate,
            options.uplink.string_id,
            options.uplink.virtual_channel,
            options.uplink.wait_for_radiation
        );
        let routed = self.routed(&options.uplink);
        self.transmit(&options, self.uplink.send_flight_command(command, &routed))
            .await
    }

    /// Hardware commands travel the flight command path; only the virtual
    /// channel the caller picks differs.
    pub async fn send_hw_cmd(&self, command: &str, options: SendOptions) -> Result<bool> {
        self.check_running()?;
        info!(
            "send_hw_cmd(command=\"{}\",stringId={:?},virtualChannel={:?},waitForRadiation={})",
            command,
            options.uplink.string_id,
            options.uplink.virtual_channel,
            options.uplink.wait_for_radiation
        );
        let mut routed = self.routed(&options.uplink);
        routed.validate = None;
        self.transmit(&options, self.uplink.send_flight_command(command, &routed))
            .await
    }

    pub async fn send_sse_cmd(&self, command: &str, throw_on_error: Option<bool>) -> Result<bool> {
        self.check_running()?;
        if !self.config.uplink.has_sse {
            error!("Cannot send SSE command.  The current mission does not have an SSE.");
            return Ok(false);
        }
        info!(
            "send_sse_cmd(command=\"{}\",throwOnError={:?})",
            command, throw_on_error
        );
        let outcome = self.uplink.send_sse_command(command).await;
        self.report(outcome, throw_on_error)
    }

    pub async fn send_fsw_file(&self, load: &FileLoad, options: SendOptions) -> Result<bool> {
        self.check_running()?;
        info!(
            "send_fsw_file(source=\"{}\",target=\"{}\",type={:?},overwrite={:?},waitForRadiation={})",
            load.source, load.target, load.file_type, load.overwrite, options.uplink.wait_for_radiation
        );
        let routed = self.routed(&options.uplink);
        self.transmit(&options, self.uplink.send_file_load(load, &routed))
            .await
    }

    pub async fn send_fsw_scmf(
        &self,
        filename: &str,
        disable_checks: Option<bool>,
        options: SendOptions,
    ) -> Result<bool> {
        self.check_running()?;
        info!(
            "send_fsw_scmf(filename=\"{}\",disableChecks={:?},waitForRadiation={})",
            filename, disable_checks, options.uplink.wait_for_radiation
        );
        let wait_for_radiation = options.uplink.wait_for_radiation;
        self.transmit(
            &options,
            self.uplink.send_scmf(filename, disable_checks, wait_for_radiation),
        )
        .await
    }

    pub async fn send_fsw_raw_data(
        &self,
        filename: &str,
        hex: Option<bool>,
        options: SendOptions,
    ) -> Result<bool> {
        self.check_running()?;
        info!(
            "send_fsw_raw_data(filename=\"{}\",hex={:?},waitForRadiation={})",
            filename, hex, options.uplink.wait_for_radiation
        );
        let wait_for_radiation = options.uplink.wait_for_radiation;
        self.transmit(
            &options,
            self.uplink.send_raw_data(filename, hex, wait_for_radiation),
        )
        .await
    }

    pub async fn send_cmd_list_file(&self, filename: &str, options: SendOptions) -> Result<bool> {
        self.check_running()?;
        info!(
            "send_cmd_list_file(filename=\"{}\",validate={:?},stringId={:?},virtualChannel={:?},waitForRadiation={})",
            filename,
            options.uplink.validate,
            options.uplink.string_id,
            options.uplink.virtual_channel,
            options.uplink.wait_for_radiation
        );
        if !Path::new(filename).is_file() {
            error!("The input filename \"{}\" does not exist.", filename);
            return Ok(false);
        }
        let contents = tokio::fs::read_to_string(filename).await?;
        let listed: Vec<&str> = contents.lines().map(str::trim).collect();
        info!("Command List File Contents:\n\t{}", listed.join("\n\t"));

        let routed = self.routed(&options.uplink);
        self.transmit(&options, self.uplink.send_command_list_file(filename, &routed))
            .await
    }

    // ---- logging ----

    pub fn log(&self, message: &str, level: &str) -> Result<()> {
        self.check_running()?;
        LogLevel::parse(level).emit(&format!("User Log Message: {}", message));
        Ok(())
    }

    /// Print `message` to stdout and log it.
    pub fn console(&self, message: &str, level: &str) -> Result<()> {
        self.check_running()?;
        println!("{}", message);
        LogLevel::parse(level).emit(&format!("User Console Message: {}", message));
        Ok(())
    }

    // ---- time parsing ----

    fn exact_bounds(&self, times: &TimeBounds) -> Result<ExactBounds> {
        let ground = |value: &Option<String>| value.as_deref().map(parse_time_string).transpose();
        let sclk = |value: &Option<String>| {
            value
                .as_deref()
                .map(|s| self.config.sclk.parse(s))
                .transpose()
        };
        Ok(ExactBounds {
            ert_start: ground(&times.ert_start)?,
            ert_end: ground(&times.ert_end)?,
            scet_start: ground(&times.scet_start)?,
            scet_end: ground(&times.scet_end)?,
            sclk_start: sclk(&times.sclk_start)?,
            sclk_end: sclk(&times.sclk_end)?,
        })
    }

    fn resolve_wait_options(&self, options: WaitOptions, call: &str) -> WaitOptions {
        let mut resolved = options;
        if resolved.timeout.is_some() && resolved.sclk_timeout.is_some() {
            warn!(
                "Supplied both timeout and sclkTimeout to {}. Will ignore timeout and use sclkTimeout.",
                call
            );
            resolved.timeout = None;
        }
        if resolved.lookback.is_some() && resolved.sclk_lookback.is_some() {
            warn!(
                "Supplied both lookback and sclkLookback to {}. Will ignore lookback and use sclkLookback.",
                call
            );
            resolved.lookback = None;
        }
        resolved
    }

    async fn run_wait(
        &self,
        condition: WaitCondition,
        options: WaitOptions,
    ) -> Result<Option<Telemetry>> {
        let result = self.store().register_sync_wait(condition, options).await?;
        let item = result.and_then(|r| r.into_single());
        if item.is_some() {
            info!("Wait succeeded.");
        } else {
            info!("Wait failed.");
        }
        Ok(item)
    }

    // ---- EHA ----

    pub fn flush_eha(&self) -> Result<()> {
        self.check_running()?;
        info!("flush_eha()");
        self.store().flush_eha();
        Ok(())
    }

    /// Newest value for a channel, looking in the realtime table first and
    /// then (when `recorded`) the recorded one.
    pub fn get_eha(
        &self,
        channel_id: Option<&str>,
        name: Option<&str>,
        realtime: bool,
        recorded: bool,
    ) -> Result<Option<ChanVal>> {
        self.check_running()?;
        if channel_id.is_none() && name.is_none() {
            error!("You must specify either the \"channelId\" or \"name\" parameters to the \"get_eha\" method.");
            return Ok(None);
        }
        info!(
            "get_eha(channelId={:?},name={:?},realtime={},recorded={})",
            channel_id, name, realtime, recorded
        );
        if !realtime && !recorded {
            error!("Both the \"realtime\" and \"recorded\" flags were set to false. No value can be retrieved.");
            return Ok(None);
        }

        let value = self.latest_channel_value(channel_id, name, realtime, recorded);
        match &value {
            Some(v) => info!(
                "Found a channel value (DN=\"{}\",EU=\"{}\") for channel (ID={:?},name={:?}) (realtime=\"{}\")",
                v.dn.as_ref().map(Dn::to_string).unwrap_or_default(),
                v.eu.map(|eu| eu.to_string()).unwrap_or_default(),
                channel_id,
                name,
                v.realtime
            ),
            None => warn!(
                "No value found for channel (ID={:?},name={:?})",
                channel_id, name
            ),
        }
        Ok(value)
    }

    fn latest_channel_value(
        &self,
        channel_id: Option<&str>,
        name: Option<&str>,
        realtime: bool,
        recorded: bool,
    ) -> Option<ChanVal> {
        let mut value = None;
        if realtime {
            value = self
                .store()
                .realtime_channels()
                .latest(channel_id, name)
                .cloned();
        }
        if value.is_none() && recorded {
            value = self
                .store()
                .recorded_channels()
                .latest(channel_id, name)
                .cloned();
        }
        value
    }

    pub fn get_eha_dn(
        &self,
        channel_id: Option<&str>,
        name: Option<&str>,
        realtime: bool,
        recorded: bool,
    ) -> Result<Option<Dn>> {
        Ok(self
            .get_eha(channel_id, name, realtime, recorded)?
            .and_then(|v| v.dn))
    }

    pub fn get_eha_eu(
        &self,
        channel_id: Option<&str>,
        name: Option<&str>,
        realtime: bool,
        recorded: bool,
    ) -> Result<Option<f64>> {
        Ok(self
            .get_eha(channel_id, name, realtime, recorded)?
            .and_then(|v| v.eu))
    }

    /// Check the newest value of a channel against exact DN/EU values and
    /// DN/EU bounds. With no value checks, passes when any value exists.
    pub fn verify_eha(&self, criteria: &EhaCriteria) -> Result<bool> {
        self.check_running()?;
        let id = criteria.channel_id.as_deref();
        let name = criteria.name.as_deref();
        if id.is_none() && name.is_none() {
            error!("You must specify either the \"channelId\" or \"name\" parameter to the \"verify_eha\" method.");
            return Ok(false);
        }
        info!(
            "verify_eha(channelId={:?},name={:?},dn={:?},eu={:?},dnStart={:?},dnEnd={:?},euStart={:?},euEnd={:?},realtime={},recorded={})",
            id,
            name,
            criteria.dn,
            criteria.eu,
            criteria.dn_start,
            criteria.dn_end,
            criteria.eu_start,
            criteria.eu_end,
            criteria.realtime,
            criteria.recorded
        );
        if !criteria.realtime && !criteria.recorded {
            error!("Both the \"realtime\" and \"recorded\" flags were set to false. No value can be retrieved.");
            return Ok(false);
        }

        let Some(value) = self.latest_channel_value(id, name, criteria.realtime, criteria.recorded)
        else {
            info!(
                "No values found for channel (ID={:?},name={:?}). Verification failed.",
                id, name
            );
            return Ok(false);
        };

        let format = |raw: &Option<String>| {
            raw.as_deref()
                .map(|r| Dn::format(value.channel_type, r))
                .transpose()
        };
        let dn = format(&criteria.dn)?;
        let dn_start = format(&criteria.dn_start)?;
        let dn_end = format(&criteria.dn_end)?;
        let actual_dn = value.dn.as_ref();
        let shown_dn = actual_dn.map(Dn::to_string).unwrap_or_default();

        if let Some(dn) = &dn {
            if actual_dn != Some(dn) {
                info!(
                    "DN value verification failed for channel (ID={:?},name={:?}). Actual DN value of {} does not equal desired DN value of {}.",
                    id, name, shown_dn, dn
                );
                return Ok(false);
            }
        }
        if let Some(start) = &dn_start {
            if actual_dn.map_or(true, |actual| actual < start) {
                info!(
                    "DN value verification failed for channel (ID={:?},name={:?}). Actual DN value of {} is less than lower bound DN value of {}.",
                    id, name, shown_dn, start
                );
                return Ok(false);
            }
        }
        if let Some(end) = &dn_end {
            if actual_dn.map_or(true, |actual| actual > end) {
                info!(
                    "DN value verification failed for channel (ID={:?},name={:?}). Actual DN value of {} is greater than upper bound DN value of {}.",
                    id, name, shown_dn, end
                );
                return Ok(false);
            }
        }

        if let Some(eu) = criteria.eu {
            if value.eu != Some(eu) {
                info!(
                    "EU value verification failed for channel (ID={:?},name={:?}). Actual EU value {:?} does not equal desired EU value {}.",
                    id, name, value.eu, eu
                );
                if value.eu.is_none() {
                    warn!(
                        "The channel (ID={:?},name={:?}) has no defined DN-to-EU conversion",
                        id, name
                    );
                }
                return Ok(false);
            }
        }
        if let Some(start) = criteria.eu_start {
            if value.eu.map_or(true, |eu| eu < start) {
                info!(
                    "EU value verification failed for channel (ID={:?},name={:?}). Actual EU value of {:?} is less than lower bound EU value of {}.",
                    id, name, value.eu, start
                );
                return Ok(false);
            }
        }
        if let Some(end) = criteria.eu_end {
            if value.eu.map_or(true, |eu| eu > end) {
                info!(
                    "EU value verification failed for channel (ID={:?},name={:?}). Actual EU value of {:?} is greater than upper bound EU value of {}.",
                    id, name, value.eu, end
                );
                return Ok(false);
            }
        }

        if criteria.has_value_checks() {
            info!(
                "Value verification succeeded. Channel (ID={:?},name={:?}) has DN = {} and EU = {:?}",
                id, name, shown_dn, value.eu
            );
        } else {
            info!(
                "Verification succeeded.  The channel (ID={:?},name={:?}) has a value set.",
                id, name
            );
        }
        Ok(true)
    }

    /// Block until a channel value matching `criteria` arrives (or is found
    /// in the lookback window). `Ok(None)` means the wait timed out.
    pub async fn wait_eha(
        &self,
        criteria: &EhaCriteria,
        options: WaitOptions,
    ) -> Result<Option<ChanVal>> {
        self.check_running()?;
        if criteria.channel_id.is_none() && criteria.name.is_none() {
            error!("You must specify either the \"channelId\" or \"name\" parameter to the \"wait_eha\" method.");
            return Ok(None);
        }
        let options = self.resolve_wait_options(options, "wait_eha");
        let bounds = self.exact_bounds(&criteria.times)?;
        info!(
            "wait_eha(channelId={:?},name={:?},dn={:?},eu={:?},dnStart={:?},dnEnd={:?},euStart={:?},euEnd={:?},realtime={},recorded={},{:?})",
            criteria.channel_id,
            criteria.name,
            criteria.dn,
            criteria.eu,
            criteria.dn_start,
            criteria.dn_end,
            criteria.eu_start,
            criteria.eu_end,
            criteria.realtime,
            criteria.recorded,
            options
        );

        let condition = ChanValWait {
            channel_id: criteria.channel_id.clone(),
            name: criteria.name.clone(),
            dn: criteria.dn.clone(),
            dn_start: criteria.dn_start.clone(),
            dn_end: criteria.dn_end.clone(),
            eu: criteria.eu,
            eu_start: criteria.eu_start,
            eu_end: criteria.eu_end,
            ert_exact_start: bounds.ert_start,
            ert_exact_end: bounds.ert_end,
            scet_exact_start: bounds.scet_start,
            scet_exact_end: bounds.scet_end,
            sclk_exact_start: bounds.sclk_start,
            sclk_exact_end: bounds.sclk_end,
            realtime: realtime_filter(criteria.realtime, criteria.recorded),
        };
        match self.run_wait(condition.into(), options).await? {
            Some(Telemetry::ChannelValue(value)) => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// Feed a fabricated channel value through the downlink path.
    pub fn inject_eha(&self, injection: EhaInjection) -> Result<()> {
        if self.config.inject.disabled {
            warn!("inject_XXX methods have been disabled by the user.  This call will have no affect.");
            return Ok(());
        }
        self.check_running()?;
        info!(
            "inject_eha(channelId=\"{}\",name=\"{}\",type=\"{}\",dn={:?},eu={:?},sclk=\"{}\",ert=\"{}\",scet=\"{}\",realtime={})",
            injection.channel_id,
            injection.name,
            injection.channel_type,
            injection.dn,
            injection.eu,
            injection.sclk,
            injection.ert,
            injection.scet,
            injection.realtime
        );

        let Some(raw_dn) = injection.dn.as_deref() else {
            error!(
                "Could not inject EHA value for channelId (ID={},name={}) because no DN value was specified.",
                injection.channel_id, injection.name
            );
            return Ok(());
        };
        let dn = match Dn::format(injection.channel_type, raw_dn) {
            Ok(dn) => dn,
            Err(e) => {
                error!(
                    "Could not inject EHA value for channel (ID={},name={}). {}",
                    injection.channel_id, injection.name, e
                );
                return Ok(());
            }
        };

        let sclk_exact = self.exact_sclk(&injection.sclk);
        let value = ChanVal {
            event_time_exact: exact_time(&injection.event_time),
            sclk_coarse: self.config.sclk.coarse(sclk_exact),
            sclk_fine: self.config.sclk.fine(sclk_exact),
            sclk_exact,
            sclk: injection.sclk,
            ert_exact: exact_time(&injection.ert),
            ert: injection.ert,
            scet_exact: exact_time(&injection.scet),
            scet: injection.scet,
            event_time: injection.event_time,
            realtime: injection.realtime,
            channel_id: injection.channel_id,
            channel_type: injection.channel_type,
            name: injection.name,
            dn_units: injection.dn_units,
            eu_units: injection.eu_units,
            status: injection.status,
            dn: Some(dn),
            eu: injection.eu,
            alarms: injection.alarms,
            ..ChanVal::default()
        };
        self.store().ingest(value.into());
        Ok(())
    }

    fn exact_sclk(&self, sclk: &str) -> u64 {
        if sclk.trim().is_empty() {
            return 0;
        }
        self.config.sclk.parse(sclk).unwrap_or(0)
    }

    // ---- EVR ----

    pub fn flush_evr(&self) -> Result<()> {
        self.check_running()?;
        info!("flush_evr()");
        self.store().flush_evr();
        Ok(())
    }

    /// EVRs matching `criteria`, newest first.
    pub fn get_evr(&self, criteria: &EvrCriteria) -> Result<Vec<Evr>> {
        self.check_running()?;
        info!(
            "get_evr(name={:?},eventId={:?},level={:?},module={:?},realtime={},recorded={},message={:?},messageSubstr={:?},maxNum={:?})",
            criteria.name,
            criteria.event_id,
            criteria.level,
            criteria.module,
            criteria.realtime,
            criteria.recorded,
            criteria.message,
            criteria.message_substr,
            criteria.max_num
        );
        let bounds = self.exact_bounds(&criteria.times)?;
        let query = EvrQuery {
            name: criteria.name.clone(),
            event_id: criteria.event_id,
            level: criteria.level.clone(),
            module: criteria.module.clone(),
            ert_start: bounds.ert_start,
            ert_end: bounds.ert_end,
            scet_start: bounds.scet_start,
            scet_end: bounds.scet_end,
            sclk_start: bounds.sclk_start,
            sclk_end: bounds.sclk_end,
            message: criteria.message.clone(),
            message_substr: criteria.message_substr.clone(),
        };

        let mut evrs: Vec<Evr> = Vec::new();
        if criteria.realtime {
            evrs.extend(
                self.store()
                    .realtime_evrs()
                    .by_attributes(&query)
                    .into_iter()
                    .cloned(),
            );
        }
        if criteria.recorded {
            evrs.extend(
                self.store()
                    .recorded_evrs()
                    .by_attributes(&query)
                    .into_iter()
                    .cloned(),
            );
        }

        if evrs.is_empty() {
            info!("The desired EVR(s) could not be found.");
            return Ok(evrs);
        }
        evrs.sort_by(|a, b| b.receive_time.cmp(&a.receive_time));
        let evrs = truncate_newest(evrs, criteria.max_num, "evrs");
        info!("Found {} EVR(s) that matched the input criteria", evrs.len());
        Ok(evrs)
    }

    pub async fn wait_evr(&self, criteria: &EvrCriteria, options: WaitOptions) -> Result<Option<Evr>> {
        self.check_running()?;
        if criteria.event_id.is_none() && criteria.name.is_none() {
            error!("You must specify either the \"eventId\" or \"name\" parameter to the \"wait_evr\" method.");
            return Ok(None);
        }
        let options = self.resolve_wait_options(options, "wait_evr");
        let bounds = self.exact_bounds(&criteria.times)?;
        info!(
            "wait_evr(name={:?},eventId={:?},level={:?},module={:?},message={:?},realtime={},recorded={},messageSubstr={:?},{:?})",
            criteria.name,
            criteria.event_id,
            criteria.level,
            criteria.module,
            criteria.message,
            criteria.realtime,
            criteria.recorded,
            criteria.message_substr,
            options
        );

        let condition = EvrWait {
            event_id: criteria.event_id,
            name: criteria.name.clone(),
            level: criteria.level.clone(),
            module: criteria.module.clone(),
            message: criteria.message.clone(),
            message_substr: criteria.message_substr.clone(),
            ert_exact_start: bounds.ert_start,
            ert_exact_end: bounds.ert_end,
            scet_exact_start: bounds.scet_start,
            scet_exact_end: bounds.scet_end,
            sclk_exact_start: bounds.sclk_start,
            sclk_exact_end: bounds.sclk_end,
            realtime: realtime_filter(criteria.realtime, criteria.recorded),
        };
        match self.run_wait(condition.into(), options).await? {
            Some(Telemetry::Evr(evr)) => Ok(Some(evr)),
            _ => Ok(None),
        }
    }

    /// Feed a fabricated EVR through the downlink path. Exact times left at
    /// zero are filled from the matching time strings when they parse.
    pub fn inject_evr(&self, mut evr: Evr) -> Result<()> {
        if self.config.inject.disabled {
            warn!("inject_XXX methods have been disabled by the user.  This call will have no affect.");
            return Ok(());
        }
        self.check_running()?;
        info!(
            "inject_evr(name=\"{}\",eventId=\"{}\",module=\"{}\",level=\"{}\",fromSse=\"{}\",sclk=\"{}\",realtime=\"{}\",message=\"{}\")",
            evr.name, evr.event_id, evr.module, evr.level, evr.from_sse, evr.sclk, evr.realtime, evr.message
        );

        if evr.sclk_exact == 0 {
            evr.sclk_exact = self.exact_sclk(&evr.sclk);
            evr.sclk_coarse = self.config.sclk.coarse(evr.sclk_exact);
            evr.sclk_fine = self.config.sclk.fine(evr.sclk_exact);
        }
        if evr.event_time_exact == 0 {
            evr.event_time_exact = exact_time(&evr.event_time);
        }
        if evr.ert_exact == 0 {
            evr.ert_exact = exact_time(&evr.ert);
        }
        if evr.scet_exact == 0 {
            evr.scet_exact = exact_time(&evr.scet);
        }
        self.store().ingest(evr.into());
        Ok(())
    }

    // ---- products ----

    pub fn flush_dp(&self) -> Result<()> {
        self.check_running()?;
        info!("flush_dp()");
        self.store().flush_dp();
        Ok(())
    }

    fn product_query(&self, criteria: &ProductCriteria) -> Result<ProductQuery> {
        let bounds = self.exact_bounds(&criteria.times)?;
        let status = criteria
            .status
            .as_deref()
            .map(ProductStatus::from_str)
            .transpose()?;
        Ok(ProductQuery {
            name: criteria.name.clone(),
            apid: criteria.apid,
            transaction_id: criteria.transaction_id.clone(),
            status,
            ert_start: bounds.ert_start,
            ert_end: bounds.ert_end,
            dvt_scet_start: bounds.scet_start,
            dvt_scet_end: bounds.scet_end,
            dvt_sclk_start: bounds.sclk_start,
            dvt_sclk_end: bounds.sclk_end,
        })
    }

    /// Products matching `criteria`, newest first. Requires an APID or name.
    pub fn get_dp(&self, criteria: &ProductCriteria) -> Result<Vec<Product>> {
        self.check_running()?;
        if criteria.apid.is_none() && criteria.name.is_none() {
            error!("You must specify either the \"apid\" or \"name\" parameter to the \"get_dp\" method.");
            return Ok(Vec::new());
        }
        info!(
            "get_dp(name={:?},transactionId={:?},status={:?},apid={:?},maxNum={:?})",
            criteria.name, criteria.transaction_id, criteria.status, criteria.apid, criteria.max_num
        );
        let query = self.product_query(criteria)?;
        let mut products: Vec<Product> = self
            .store()
            .products()
            .by_attributes(&query)
            .into_iter()
            .cloned()
            .collect();

        if products.is_empty() {
            info!("The desired product(s) could not be found.");
            return Ok(products);
        }
        products.sort_by(|a, b| b.receive_time.cmp(&a.receive_time));
        let products = truncate_newest(products, criteria.max_num, "products");
        info!("Found {} product(s) that matched the input criteria", products.len());
        Ok(products)
    }

    pub async fn wait_dp(
        &self,
        criteria: &ProductCriteria,
        options: WaitOptions,
    ) -> Result<Option<Product>> {
        self.check_running()?;
        let options = self.resolve_wait_options(options, "wait_dp");
        let query = self.product_query(criteria)?;
        info!(
            "wait_dp(name={:?},transactionId={:?},status={:?},apid={:?},{:?})",
            criteria.name, criteria.transaction_id, criteria.status, criteria.apid, options
        );

        let condition = ProductWait {
            apid: query.apid,
            name: query.name,
            transaction_id: query.transaction_id,
            status: query.status,
            dvt_scet_exact_start: query.dvt_scet_start,
            dvt_scet_exact_end: query.dvt_scet_end,
            dvt_sclk_exact_start: query.dvt_sclk_start,
            dvt_sclk_exact_end: query.dvt_sclk_end,
            ert_exact_start: query.ert_start,
            ert_exact_end: query.ert_end,
        };
        match self.run_wait(condition.into(), options).await? {
            Some(Telemetry::Product(product)) => Ok(Some(product)),
            _ => Ok(None),
        }
    }

    pub fn inject_dp(&self, mut product: Product) -> Result<()> {
        if self.config.inject.disabled {
            warn!("inject_XXX methods have been disabled by the user.  This call will have no affect.");
            return Ok(());
        }
        self.check_running()?;
        info!(
            "inject_dp(name=\"{}\",transactionId=\"{}\",apid={},dvtSclk=\"{}\",status=\"{}\")",
            product.name, product.transaction_id, product.apid, product.dvt_sclk, product.status
        );
        if product.dvt_sclk_exact == 0 {
            product.dvt_sclk_exact = if product.dvt_sclk.trim().is_empty() {
                (product.dvt_coarse << self.config.sclk.fine_bits) + product.dvt_fine
            } else {
                self.exact_sclk(&product.dvt_sclk)
            };
        }
        if product.dvt_scet_exact == 0 {
            product.dvt_scet_exact = exact_time(&product.dvt_scet);
        }
        if product.ert_exact == 0 {
            product.ert_exact = exact_time(&product.ert);
        }
        self.store().ingest(product.into());
        Ok(())
    }

    // ---- CFDP indications ----

    /// Indications matching `criteria`, newest first.
    pub fn get_cfdp_ind(&self, criteria: &CfdpCriteria) -> Result<Vec<CfdpIndication>> {
        self.check_running()?;
        info!(
            "get_cfdp_ind(indicationTypeList={:?},sourceEntityId={:?},transactionSequenceNumber={:?})",
            criteria.indication_types, criteria.source_entity_id, criteria.transaction_sequence_number
        );
        let mut indications: Vec<CfdpIndication> = self
            .store()
            .cfdp_indications()
            .filtered(
                criteria.source_entity_id.as_deref(),
                criteria.transaction_sequence_number.as_deref(),
                &criteria.indication_types,
            )
            .into_iter()
            .cloned()
            .collect();

        if indications.is_empty() {
            info!("The desired CFDP Indication(s) could not be found.");
            return Ok(indications);
        }
        indications.sort_by(|a, b| b.receive_time.cmp(&a.receive_time));
        let indications = truncate_newest(indications, criteria.max_num, "CFDP Indications");
        info!(
            "Found {} CFDP Indication(s) that matched the input criteria",
            indications.len()
        );
        Ok(indications)
    }

    /// SCLK-based timeouts do not apply to CFDP indications.
    pub async fn wait_cfdp_ind(
        &self,
        criteria: &CfdpCriteria,
        timeout: Option<i64>,
        lookback: Option<u64>,
    ) -> Result<Option<CfdpIndication>> {
        self.check_running()?;
        info!(
            "wait_cfdp_ind(indicationTypeList={:?},sourceEntityId={:?},transactionSequenceNumber={:?},timeout={:?},lookback={:?})",
            criteria.indication_types,
            criteria.source_entity_id,
            criteria.transaction_sequence_number,
            timeout,
            lookback
        );
        let condition = CfdpIndicationWait {
            indication_type_list: criteria.indication_types.clone(),
            source_entity_id: criteria.source_entity_id.clone(),
            transaction_sequence_number: criteria.transaction_sequence_number.clone(),
        };
        let options = WaitOptions {
            timeout,
            lookback,
            ..WaitOptions::default()
        };
        match self.run_wait(condition.into(), options).await? {
            Some(Telemetry::CfdpIndication(indication)) => Ok(Some(indication)),
            _ => Ok(None),
        }
    }

    pub fn inject_cfdp_ind(&self, indication: CfdpIndication) -> Result<()> {
        if self.config.inject.disabled {
            warn!("inject_XXX methods have been disabled by the user.  This call will have no affect.");
            return Ok(());
        }
        self.check_running()?;
        info!(
            "inject_cfdp_ind(indicationType=\"{}\",sourceEntityId=\"{}\",transactionSequenceNumber=\"{}\",eventTime=\"{}\")",
            indication.indication_type,
            indication.source_entity_id,
            indication.transaction_sequence_number,
            indication.event_time
        );
        self.store().ingest(indication.into());
        Ok(())
    }

    /// Ask the CFDP Processor to PUT a file. With `wait_for_completion`,
    /// `true` means the transaction also finished in time without a fault.
    pub async fn cfdp_put(&self, put: &CfdpPut) -> Result<bool> {
        self.check_running()?;
        info!(
            "cfdp_put(destinationEntity={:?},destinationEntityMnemonic={:?},sourceFileName=\"{}\",destinationFileName={:?},serviceClass={},messagesToUser={:?},waitForCompletion={},cfdpProcessorBaseUrl={:?},throwOnError={:?})",
            put.destination_entity,
            put.destination_entity_mnemonic,
            put.source_file_name,
            put.destination_file_name,
            put.service_class,
            put.messages_to_user,
            put.wait_for_completion,
            put.cfdp_processor_url,
            put.throw_on_error
        );
        let throw = put.throw_on_error.unwrap_or(self.config.uplink.throw_on_error);

        if put.service_class > 2 {
            return reject_argument(
                throw,
                "service_class",
                &put.service_class.to_string(),
                "CFDP service class must be either 1 or 2 (or 0 to use CFDP Processor's default)",
            );
        }
        let destination_entity = match (put.destination_entity, &put.destination_entity_mnemonic) {
            (Some(id), _) => id,
            (None, Some(mnemonic)) => match self.config.services.cfdp_entities.get(mnemonic) {
                Some(id) => {
                    debug!("mapped mnemonic ID for {} is {}", mnemonic, id);
                    *id
                }
                None => {
                    return reject_argument(
                        throw,
                        "destination_entity_mnemonic",
                        mnemonic,
                        "No destination entity is configured for this mnemonic",
                    )
                }
            },
            (None, None) => {
                return reject_argument(
                    throw,
                    "destination_entity",
                    "",
                    "CFDP destination entity must be provided as an entity ID or a configured mnemonic",
                )
            }
        };

        let request = CfdpPutRequest {
            requester_id: requester_id(&self.config),
            destination_entity,
            source_file_name: put.source_file_name.clone(),
            destination_file_name: put
                .destination_file_name
                .clone()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| put.source_file_name.clone()),
            service_class: put.service_class,
            session_key: self.config.session.key.as_deref().and_then(|key| key.parse().ok()),
            messages_to_user: put.messages_to_user.clone(),
            save_first: None,
            save_file_as: None,
        };
        let base_url = put
            .cfdp_processor_url
            .as_deref()
            .unwrap_or(&self.config.services.cfdp_processor_url);

        let response = match self.send_cfdp_put(base_url, &request).await {
            Ok(response) => response,
            Err(e) => {
                self.failed_cfdp_puts.fetch_add(1, Ordering::Relaxed);
                return self.report(Err(e), Some(throw));
            }
        };
        self.successful_cfdp_puts.fetch_add(1, Ordering::Relaxed);
        let source = response.source_entity_id();
        let sequence = response.transaction_sequence_number();
        info!(
            "CFDP PUT succeeded: requestId={} transactionId={}:{}",
            response.request_id(),
            source,
            sequence
        );

        if put.wait_for_completion <= 0 {
            return Ok(true);
        }
        info!(
            "Waiting maximum {} seconds for CFDP transaction {}:{} to finish...",
            put.wait_for_completion, source, sequence
        );
        let criteria = CfdpCriteria {
            indication_types: [CFDP_FINISHED, CFDP_FAULT, CFDP_ABANDONED]
                .iter()
                .map(|t| t.to_string())
                .collect(),
            source_entity_id: Some(source.clone()),
            transaction_sequence_number: Some(sequence.clone()),
            max_num: None,
        };
        let ending = self
            .wait_cfdp_ind(
                &criteria,
                Some(put.wait_for_completion),
                Some(CFDP_PUT_LOOKBACK_SECS),
            )
            .await?;

        let outcome = match ending {
            None => {
                warn!(
                    "CFDP transaction {}:{} did not finish before specified timeout",
                    source, sequence
                );
                return Ok(false);
            }
            Some(indication) if indication.indication_type == CFDP_ABANDONED => "was abandoned",
            Some(indication) if indication.indication_type == CFDP_FAULT => "faulted",
            Some(_) => {
                info!("CFDP transaction {}:{} completed successfully", source, sequence);
                return Ok(true);
            }
        };
        let failure = MtakError::AutoError {
            message: format!("CFDP transaction {}:{} {}", source, sequence, outcome),
        };
        self.report(Err(failure), Some(throw))
    }

    async fn send_cfdp_put(&self, base_url: &str, request: &CfdpPutRequest) -> Result<CfdpPutResponse> {
        CfdpProcessorClient::new(base_url)?
            .with_timeout(self.config.services.request_timeout())?
            .put(request)
            .await
    }

    pub fn flush_all(&self) -> Result<()> {
        self.check_running()?;
        info!("flush_all()");
        self.store().flush_all();
        Ok(())
    }

    // ---- current time ----

    /// Latest realtime SCLK, as a float or as whole seconds.
    pub fn get_current_sclk(&self, ignore_subseconds: bool) -> Result<f64> {
        self.check_running()?;
        let exact = self.store().current_sclk_exact();
        let sclk = &self.config.sclk;
        Ok(if ignore_subseconds {
            sclk.coarse(exact) as f64
        } else {
            sclk.to_float(exact)
        })
    }

    pub fn current_sclk_string(&self, ignore_subseconds: bool) -> Result<String> {
        self.check_running()?;
        let exact = self.store().current_sclk_exact();
        Ok(if ignore_subseconds {
            self.config.sclk.coarse(exact).to_string()
        } else {
            self.config.sclk.format(exact)
        })
    }

    /// Latest realtime SCET in seconds since `epoch`.
    pub fn get_current_scet(&self, epoch: Epoch) -> Result<f64> {
        self.check_running()?;
        Ok(epoch.convert(self.store().time_marks().scet_exact as f64 / 1000.0))
    }

    pub fn current_scet_string(&self) -> Result<String> {
        self.check_running()?;
        let marks = self.store().time_marks();
        let base = format_time(marks.scet_exact, true);
        Ok(if marks.scet_nano > 0 {
            format!("{}{:06}", base, marks.scet_nano)
        } else {
            base
        })
    }

    /// Latest realtime ERT in seconds since `epoch`.
    pub fn get_current_ert(&self, epoch: Epoch) -> Result<f64> {
        self.check_running()?;
        Ok(epoch.convert(self.store().time_marks().ert_exact as f64 / 1000.0))
    }

    pub fn current_ert_string(&self) -> Result<String> {
        self.check_running()?;
        Ok(format_time(self.store().time_marks().ert_exact, true))
    }

    /// Workstation time in seconds since `epoch`.
    pub fn get_current_time(&self, epoch: Epoch) -> f64 {
        epoch.convert(now_ms() as f64 / 1000.0)
    }

    pub fn current_time_string(&self) -> String {
        format_time(now_ms(), true)
    }

    /// Counters from both sides, keyed for machine consumption.
    pub fn counters(&self) -> BTreeMap<&'static str, u64> {
        let c = self.store().counters();
        BTreeMap::from([
            ("chan_val", c.chan_val),
            ("recorded_chan_val", c.recorded_chan_val),
            ("evr", c.evr),
            ("recorded_evr", c.recorded_evr),
            ("product", c.product),
            ("cfdp_indication", c.cfdp_indication),
            ("successful_cfdp_puts", self.successful_cfdp_puts.load(Ordering::Relaxed)),
            ("failed_cfdp_puts", self.failed_cfdp_puts.load(Ordering::Relaxed)),
        ])
    }
}

fn realtime_filter(realtime: bool, recorded: bool) -> Option<bool> {
    match (realtime, recorded) {
        (true, false) => Some(true),
        (false, true) => Some(false),
        _ => None,
    }
}

fn exact_time(value: &str) -> i64 {
    if value.trim().is_empty() {
        return 0;
    }
    parse_time_string(value).unwrap_or(0)
}

/// Reject a bad call argument: an error when throwing, otherwise `false`.
fn reject_argument(throw: bool, field: &str, value: &str, reason: &str) -> Result<bool> {
    error!("{} ({}={:?})", reason, field, value);
    if throw {
        Err(MtakError::InvalidConfigValueError {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        })
    } else {
        Ok(false)
    }
}

/// The configured login, or the OS user running the script.
fn requester_id(config: &MtakConfig) -> String {
    config
        .security
        .as_ref()
        .and_then(|security| security.username.clone())
        .or_else(|| std::env::var("USER").ok())
        .or_else(|| std::env::var("USERNAME").ok())
        .unwrap_or_else(|| "mtak".to_string())
}

fn truncate_newest<T>(mut items: Vec<T>, max_num: Option<i64>, what: &str) -> Vec<T> {
    match max_num {
        Some(max) if max >= 1 => {
            items.truncate(max as usize);
            items
        }
        Some(_) => {
            warn!(
                "maxNum must be greater than or equal to 1.  All found {} will be returned.",
                what
            );
            items
        }
        None => items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingUplink {
        calls: Mutex<Vec<String>>,
        fail_with: Mutex<Option<MtakError>>,
    }

    impl RecordingUplink {
        fn record(&self, call: String) -> Result<()> {
            self.calls.lock().unwrap().push(call);
            match self.fail_with.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandUplink for RecordingUplink {
        async fn send_flight_command(&self, command: &str, options: &UplinkOptions) -> Result<()> {
            self.record(format!(
                "cmd {} {:?} {:?}",
                command, options.string_id, options.scid
            ))
        }

        async fn send_sse_command(&self, command: &str) -> Result<()> {
            self.record(format!("sse {}", command))
        }

        async fn send_file_load(&self, load: &FileLoad, _options: &UplinkOptions) -> Result<()> {
            self.record(format!("file {} {}", load.source, load.target))
        }

        async fn send_scmf(&self, path: &str, _d: Option<bool>, wfr: u32) -> Result<()> {
            self.record(format!("scmf {} {}", path, wfr))
        }

        async fn send_raw_data(&self, path: &str, _hex: Option<bool>, _wfr: u32) -> Result<()> {
            self.record(format!("raw {}", path))
        }

        async fn send_command_list_file(&self, path: &str, _o: &UplinkOptions) -> Result<()> {
            self.record(format!("list {}", path))
        }

        async fn send_log(&self, level: &str, message: &str) -> Result<()> {
            self.record(format!("log {} {}", level, message))
        }

        async fn set_uplink_rates(&self, rates: Option<&[f64]>) -> Result<()> {
            self.calls.lock().unwrap().push(format!("rates {:?}", rates));
            Ok(())
        }

        fn summary(&self) -> String {
            "uplink summary".to_string()
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn session(config: MtakConfig) -> (Mtak, Arc<RecordingUplink>, tokio::io::DuplexStream) {
        let uplink = Arc::new(RecordingUplink::default());
        let downlink = DownlinkProxy::new(config.clone());
        let (feed, stream) = tokio::io::duplex(4096);
        downlink.start_with_stream(stream).unwrap();
        let mtak = Mtak::startup(config, uplink.clone(), downlink).await.unwrap();
        (mtak, uplink, feed)
    }

    fn channel(id: &str, dn: i64, realtime: bool) -> EhaInjection {
        EhaInjection {
            channel_id: id.to_string(),
            name: format!("{}_NAME", id),
            channel_type: ChannelType::SignedInt,
            dn: Some(dn.to_string()),
            eu: Some(dn as f64 * 2.0),
            sclk: "100-0".to_string(),
            realtime,
            ..EhaInjection::default()
        }
    }

    #[tokio::test]
    async fn test_send_applies_defaults_and_rates() {
        let mut config = MtakConfig::default();
        config.uplink.string_id = Some("A".to_string());
        config.uplink.scid = Some(76);
        let (mtak, uplink, _feed) = session(config).await;

        let options = SendOptions {
            uplink_rates: Some(vec![2000.0]),
            ..SendOptions::default()
        };
        assert!(mtak.send_fsw_cmd("FLIGHT_SOFTWARE_NOOP", options).await.unwrap());
        assert_eq!(
            uplink.calls(),
            vec![
                "rates Some([2000.0])".to_string(),
                "cmd FLIGHT_SOFTWARE_NOOP Some(\"A\") Some(76)".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_swallowed_errors_return_false() {
        let (mtak, uplink, _feed) = session(MtakConfig::default()).await;
        *uplink.fail_with.lock().unwrap() = Some(MtakError::CommandFormatError {
            message: "bad stem".to_string(),
        });
        let sent = mtak
            .send_fsw_cmd("BAD", SendOptions {
                throw_on_error: Some(true),
                ..SendOptions::default()
            })
            .await
            .unwrap();
        assert!(!sent);
    }

    #[tokio::test]
    async fn test_automation_errors_honor_throw_on_error() {
        let (mtak, uplink, _feed) = session(MtakConfig::default()).await;

        *uplink.fail_with.lock().unwrap() = Some(MtakError::RadiationError {
            message: "no radiation".to_string(),
        });
        assert!(!mtak.send_fsw_scmf("a.scmf", None, SendOptions::default()).await.unwrap());

        *uplink.fail_with.lock().unwrap() = Some(MtakError::RadiationError {
            message: "no radiation".to_string(),
        });
        let thrown = mtak
            .send_fsw_scmf("a.scmf", None, SendOptions {
                throw_on_error: Some(true),
                ..SendOptions::default()
            })
            .await;
        assert!(matches!(thrown, Err(MtakError::RadiationError { .. })));
    }

    #[tokio::test]
    async fn test_sse_command_requires_sse_mission() {
        let (mtak, uplink, _feed) = session(MtakConfig::default()).await;
        assert!(!mtak.send_sse_cmd("SSE_NOOP", None).await.unwrap());
        assert!(uplink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_command_list_is_reported() {
        let (mtak, uplink, _feed) = session(MtakConfig::default()).await;
        let sent = mtak
            .send_cmd_list_file("/nonexistent/list.txt", SendOptions::default())
            .await
            .unwrap();
        assert!(!sent);
        assert!(uplink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_get_and_verify_eha() {
        let (mtak, _uplink, _feed) = session(MtakConfig::default()).await;
        mtak.inject_eha(channel("A-0001", 5, true)).unwrap();
        mtak.inject_eha(channel("A-0002", 9, false)).unwrap();

        let value = mtak.get_eha(Some("A-0001"), None, true, false).unwrap().unwrap();
        assert_eq!(value.dn, Some(Dn::Int(5)));
        assert_eq!(mtak.get_eha_eu(Some("A-0001"), None, true, false).unwrap(), Some(10.0));

        assert!(mtak.get_eha(Some("A-0002"), None, true, false).unwrap().is_none());
        assert_eq!(
            mtak.get_eha_dn(Some("A-0002"), None, true, true).unwrap(),
            Some(Dn::Int(9))
        );
        assert!(mtak.get_eha(None, None, true, false).unwrap().is_none());

        let mut criteria = EhaCriteria::channel("A-0001");
        criteria.dn_start = Some("1".to_string());
        criteria.dn_end = Some("5".to_string());
        assert!(mtak.verify_eha(&criteria).unwrap());

        criteria.eu = Some(11.0);
        assert!(!mtak.verify_eha(&criteria).unwrap());

        assert!(!mtak.verify_eha(&EhaCriteria::channel("A-9999")).unwrap());
    }

    #[tokio::test]
    async fn test_injected_realtime_value_moves_sclk() {
        let (mtak, _uplink, _feed) = session(MtakConfig::default()).await;
        mtak.inject_eha(channel("A-0001", 1, true)).unwrap();
        assert_eq!(mtak.get_current_sclk(true).unwrap(), 100.0);
        assert_eq!(mtak.current_sclk_string(false).unwrap(), "0000000100-00000");
    }

    #[tokio::test]
    async fn test_wait_eha_finds_value_in_lookback() {
        let (mtak, _uplink, _feed) = session(MtakConfig::default()).await;
        mtak.inject_eha(channel("A-0001", 7, true)).unwrap();

        let mut criteria = EhaCriteria::channel("A-0001");
        criteria.dn = Some("7".to_string());
        let found = mtak
            .wait_eha(&criteria, WaitOptions {
                timeout: Some(1),
                lookback: Some(30),
                ..WaitOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(found.map(|v| v.channel_id), Some("A-0001".to_string()));
    }

    #[tokio::test]
    async fn test_wait_evr_times_out() {
        let (mtak, _uplink, _feed) = session(MtakConfig::default()).await;
        let criteria = EvrCriteria {
            event_id: Some(42),
            ..EvrCriteria::default()
        };
        let found = mtak
            .wait_evr(&criteria, WaitOptions {
                timeout: Some(0),
                ..WaitOptions::default()
            })
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_get_evr_newest_first_with_max() {
        let (mtak, _uplink, _feed) = session(MtakConfig::default()).await;
        for id in 1..=3 {
            mtak.inject_evr(Evr {
                name: "EVR_TEST".to_string(),
                event_id: id,
                level: "ACTIVITY_HI".to_string(),
                realtime: true,
                ..Evr::default()
            })
            .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let criteria = EvrCriteria {
            level: Some("activity_hi".to_string()),
            max_num: Some(2),
            ..EvrCriteria::default()
        };
        let evrs = mtak.get_evr(&criteria).unwrap();
        assert_eq!(evrs.iter().map(|e| e.event_id).collect::<Vec<_>>(), vec![3, 2]);

        let all = mtak
            .get_evr(&EvrCriteria {
                max_num: Some(0),
                ..criteria
            })
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_products_and_cfdp_indications() {
        let (mtak, _uplink, _feed) = session(MtakConfig::default()).await;
        mtak.inject_dp(Product {
            name: "img".to_string(),
            apid: 5,
            transaction_id: "t1".to_string(),
            status: ProductStatus::Complete,
            ..Product::default()
        })
        .unwrap();
        mtak.inject_cfdp_ind(CfdpIndication {
            indication_type: "TRANSACTION_FINISHED".to_string(),
            source_entity_id: "1".to_string(),
            transaction_sequence_number: "9".to_string(),
            ..CfdpIndication::default()
        })
        .unwrap();

        let products = mtak
            .get_dp(&ProductCriteria {
                apid: Some(5),
                status: Some("complete".to_string()),
                ..ProductCriteria::default()
            })
            .unwrap();
        assert_eq!(products.len(), 1);
        assert!(mtak.get_dp(&ProductCriteria::default()).unwrap().is_empty());

        let indications = mtak
            .get_cfdp_ind(&CfdpCriteria {
                source_entity_id: Some("1".to_string()),
                ..CfdpCriteria::default()
            })
            .unwrap();
        assert_eq!(indications.len(), 1);

        mtak.flush_all().unwrap();
        assert!(mtak
            .get_cfdp_ind(&CfdpCriteria::default())
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_inject_disabled_is_ignored() {
        let mut config = MtakConfig::default();
        config.inject.disabled = true;
        let (mtak, _uplink, _feed) = session(config).await;
        mtak.inject_eha(channel("A-0001", 1, true)).unwrap();
        assert_eq!(mtak.store().counters().chan_val, 0);
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let (mtak, _uplink, _feed) = session(MtakConfig::default()).await;
        mtak.shutdown().await.unwrap();
        assert!(matches!(mtak.flush_eha(), Err(MtakError::InvalidStateError { .. })));
        assert!(matches!(
            mtak.send_fsw_cmd("NOOP", SendOptions::default()).await,
            Err(MtakError::InvalidStateError { .. })
        ));
        mtak.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_ignores_conflicting_arguments() {
        let (mtak, _uplink, _feed) = session(MtakConfig::default()).await;
        mtak.wait(Some(100.0), Some("2000-001T00:00:00"), None).await.unwrap();
        mtak.wait(None, Some("2000-001T00:00:00"), None).await.unwrap();
        mtak.wait(Some(0.01), None, Some(0.005)).await.unwrap();
        mtak.wait_sclk(None, None).await.unwrap();
    }

    #[test]
    fn test_epoch_conversion() {
        assert_eq!("j2000".parse::<Epoch>().unwrap(), Epoch::J2000);
        assert!("mars".parse::<Epoch>().is_err());
        assert!((Epoch::J2000.convert(J2000_SECONDS + 1.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_truncate_newest() {
        assert_eq!(truncate_newest(vec![3, 2, 1], Some(2), "x"), vec![3, 2]);
        assert_eq!(truncate_newest(vec![3, 2, 1], Some(-1), "x"), vec![3, 2, 1]);
        assert_eq!(realtime_filter(true, true), None);
        assert_eq!(realtime_filter(false, true), Some(false));
    }
}
