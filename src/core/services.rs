//! REST clients for the Command Preparation and Dispatch (CPD) service, the
//! Global LAD telemetry cache and the CFDP Processor.

use crate::utils::error::{MtakError, Result};
use crate::utils::time::{format_time, SclkFormat};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const CPD_PING_ATTEMPTS: u32 = 3;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn http_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}

fn parse_base(field: &str, base_url: &str) -> Result<Url> {
    let mut url = Url::parse(base_url).map_err(|e| MtakError::InvalidConfigValueError {
        field: field.to_string(),
        value: base_url.to_string(),
        reason: e.to_string(),
    })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!("Service error body: {}", body);
    Err(MtakError::from_http_status(
        status.as_u16(),
        status.canonical_reason().unwrap_or_default(),
    ))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpdResponse {
    pub directive: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpdConnectionStatus {
    #[serde(flatten)]
    pub response: CpdResponse,
    pub connection_status: String,
    pub connected_station: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpdConfiguration {
    #[serde(flatten)]
    pub response: CpdResponse,
    pub preparation_state: String,
    pub execution_state: String,
    pub execution_mode: String,
    pub execution_method: String,
    pub aggregation_method: String,
}

/// Directives understood by the CPD service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpdDirective {
    ConnectToStation,
    DisconnectFromStation,
    QueryConnectionStatus,
    SetExecutionState,
    QueryConfiguration,
}

impl CpdDirective {
    pub fn as_str(&self) -> &'static str {
        match self {
            CpdDirective::ConnectToStation => "CONNECT_TO_STATION",
            CpdDirective::DisconnectFromStation => "DISCONNECT_FROM_STATION",
            CpdDirective::QueryConnectionStatus => "QUERY_CONNECTION_STATUS",
            CpdDirective::SetExecutionState => "SET_EXECUTION_STATE",
            CpdDirective::QueryConfiguration => "QUERY_CONFIGURATION",
        }
    }
}

pub struct CpdClient {
    client: Client,
    base_url: Url,
    retry_delay: Duration,
}

impl CpdClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: http_client(DEFAULT_REQUEST_TIMEOUT)?,
            base_url: parse_base("services.cpd_url", base_url)?,
            retry_delay: Duration::from_secs(1),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = http_client(timeout)?;
        Ok(self)
    }

    /// Delay between ping attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| MtakError::ConfigError {
            message: format!("Invalid CPD path '{}': {}", path, e),
        })
    }

    /// True once the service answers; tried three times.
    pub async fn ping(&self) -> bool {
        for attempt in 1..=CPD_PING_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(self.retry_delay).await;
            }
            let Ok(url) = self.endpoint("cpd/ping") else {
                return false;
            };
            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    info!("Successfully contacted CPD server");
                    return true;
                }
                Ok(response) => warn!(
                    "Unable to contact CPD server (HTTP {})...trying again...",
                    response.status()
                ),
                Err(e) => warn!("Unable to contact CPD server ({})...trying again...", e),
            }
        }
        false
    }

    async fn send_directive<T: DeserializeOwned>(
        &self,
        directive: CpdDirective,
        params: &[(&str, String)],
    ) -> Result<T> {
        let url = self.endpoint("cpd/directive")?;
        let mut query = vec![("directive", directive.as_str().to_string())];
        query.extend(params.iter().map(|(k, v)| (*k, v.clone())));
        debug!("Sending CPD directive {} with {:?}", directive.as_str(), params);

        let response = self
            .client
            .post(url)
            .query(&query)
            .send()
            .await
            .map_err(|e| MtakError::ConnectionError {
                message: format!("CPD service is not available: {}", e),
            })?;
        let response = check_status(response).await?;
        Ok(response.json::<T>().await?)
    }

    pub async fn connect_to_station(&self, station_id: u32) -> Result<CpdResponse> {
        self.send_directive(
            CpdDirective::ConnectToStation,
            &[("stationId", station_id.to_string())],
        )
        .await
    }

    pub async fn disconnect_from_station(&self) -> Result<CpdResponse> {
        self.send_directive(CpdDirective::DisconnectFromStation, &[])
            .await
    }

    pub async fn query_connection_status(&self) -> Result<CpdConnectionStatus> {
        self.send_directive(CpdDirective::QueryConnectionStatus, &[])
            .await
    }

    pub async fn set_execution_state(&self, state: &str) -> Result<CpdResponse> {
        self.send_directive(
            CpdDirective::SetExecutionState,
            &[("executionState", state.to_string())],
        )
        .await
    }

    pub async fn query_configuration(&self) -> Result<CpdConfiguration> {
        self.send_directive(CpdDirective::QueryConfiguration, &[])
            .await
    }
}

/// A channel value as returned by the Global LAD.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LadChannelValue {
    pub channel_id: String,
    pub channel_type: Option<String>,
    pub dn: serde_json::Value,
    pub eu: Option<f64>,
    pub status: Option<String>,
    pub dn_alarm_state: Option<String>,
    pub eu_alarm_state: Option<String>,
    pub event_time: String,
    pub ert: String,
    pub ert_milliseconds: i64,
    pub scet: String,
    pub scet_milliseconds: i64,
    pub sclk: String,
    pub sclk_coarse: u64,
    pub sclk_fine: u64,
    pub session_number: u64,
    pub host: String,
    pub venue: String,
    pub scid: u32,
    pub dss_id: i32,
    pub vcid: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LadEvr {
    pub evr_id: i64,
    pub evr_name: String,
    pub evr_level: String,
    pub message: String,
    #[serde(rename = "TaskName")]
    pub task_name: Option<String>,
    #[serde(rename = "SequenceId")]
    pub sequence_id: Option<String>,
    pub event_time: String,
    pub ert: String,
    pub ert_milliseconds: i64,
    pub scet: String,
    pub scet_milliseconds: i64,
    pub sclk: String,
    pub sclk_coarse: u64,
    pub sclk_fine: u64,
    pub session_number: u64,
    pub host: String,
    pub venue: String,
    pub scid: u32,
    pub dss_id: i32,
    pub vcid: i32,
}

/// Lower time bound for the LAD convenience queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadFrom {
    Sclk { exact: u64, scid: u32 },
    Scet(i64),
    Ert(i64),
}

/// Builder for `globallad/{eha|evr}/{source}/{recordedState}/{timeType}`
/// queries. List parameters accumulate, single ones overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LadQuery {
    telem_type: &'static str,
    source: String,
    recorded_state: String,
    time_type: String,
    params: Vec<(String, String)>,
}

impl LadQuery {
    fn new(telem_type: &'static str, max_results: i64) -> Self {
        Self {
            telem_type,
            source: "all".to_string(),
            recorded_state: "both".to_string(),
            time_type: "ert".to_string(),
            params: vec![("maxResults".to_string(), max_results.to_string())],
        }
    }

    pub fn eha() -> Self {
        Self::new("eha", 10)
    }

    pub fn evr() -> Self {
        Self::new("evr", 100)
    }

    fn add(mut self, name: &str, value: impl ToString) -> Self {
        self.params.push((name.to_string(), value.to_string()));
        self
    }

    fn set(mut self, name: &str, value: impl ToString) -> Self {
        self.params.retain(|(k, _)| k != name);
        self.add(name, value)
    }

    pub fn channel_id(self, id: &str) -> Self {
        self.add("channelId", id)
    }

    pub fn evr_level(self, level: &str) -> Self {
        self.add("evrLevel", level)
    }

    pub fn evr_name(self, name: &str) -> Self {
        self.add("evrName", name)
    }

    pub fn evr_message(self, pattern: &str) -> Self {
        self.add("evrMessage", pattern)
    }

    pub fn event_id(self, id: i64) -> Self {
        self.add("evrId", id)
    }

    pub fn session_number(self, session: &str) -> Self {
        self.add("sessionNumber", session)
    }

    pub fn host(self, host: &str) -> Self {
        self.add("host", host)
    }

    pub fn venue(self, venue: &str) -> Self {
        self.add("venue", venue)
    }

    pub fn dss_id(self, dss_id: i32) -> Self {
        self.add("dssId", dss_id)
    }

    pub fn vcid(self, vcid: i32) -> Self {
        self.add("vcid", vcid)
    }

    pub fn scid(self, scid: u32) -> Self {
        self.set("scid", scid)
    }

    /// Results per identifier; negative means unlimited.
    pub fn max_results(self, max: i64) -> Self {
        self.set("maxResults", max)
    }

    pub fn after(self, time: &str) -> Self {
        self.set("lowerBoundTime", time)
    }

    pub fn before(self, time: &str) -> Self {
        self.set("upperBoundTime", time)
    }

    pub fn use_ert(mut self) -> Self {
        self.time_type = "ert".to_string();
        self
    }

    pub fn use_scet(mut self) -> Self {
        self.time_type = "scet".to_string();
        self
    }

    pub fn use_event_time(mut self) -> Self {
        self.time_type = "event".to_string();
        self
    }

    /// SCLK bounds need the spacecraft they belong to.
    pub fn use_sclk(mut self, scid: u32) -> Self {
        self.time_type = "sclk".to_string();
        self.scid(scid)
    }

    pub fn realtime_only(mut self) -> Self {
        self.recorded_state = "realtime".to_string();
        self
    }

    pub fn recorded_only(mut self) -> Self {
        self.recorded_state = "recorded".to_string();
        self
    }

    pub fn fsw_only(mut self) -> Self {
        self.source = "fsw".to_string();
        self
    }

    pub fn sse_only(mut self) -> Self {
        self.source = "sse".to_string();
        self
    }

    pub fn monitor_only(mut self) -> Self {
        self.source = "monitor".to_string();
        self
    }

    pub fn header_only(mut self) -> Self {
        self.source = "header".to_string();
        self
    }

    pub fn uri(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.telem_type, self.source, self.recorded_state, self.time_type
        )
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    fn from_bound(self, from: LadFrom, sclk: &SclkFormat) -> Self {
        match from {
            LadFrom::Sclk { exact, scid } => self.use_sclk(scid).after(&sclk.format(exact)),
            LadFrom::Scet(ms) => self.use_scet().after(&format_time(ms, true)),
            LadFrom::Ert(ms) => self.use_ert().after(&format_time(ms, true)),
        }
    }
}

pub struct GlobalLadClient {
    client: Client,
    base_url: Url,
    sclk: SclkFormat,
}

impl GlobalLadClient {
    pub fn new(base_url: &str, sclk: SclkFormat) -> Result<Self> {
        Ok(Self {
            client: http_client(DEFAULT_REQUEST_TIMEOUT)?,
            base_url: parse_base("services.global_lad_url", base_url)?,
            sclk,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = http_client(timeout)?;
        Ok(self)
    }

    async fn query<T: DeserializeOwned>(&self, query: &LadQuery) -> Result<BTreeMap<String, Vec<T>>> {
        let url = self
            .base_url
            .join(&format!("globallad/{}", query.uri()))
            .map_err(|e| MtakError::ConfigError {
                message: format!("Invalid Global LAD query '{}': {}", query.uri(), e),
            })?;
        debug!("Global LAD query {} {:?}", url, query.params());

        let response = self
            .client
            .get(url)
            .query(query.params())
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    MtakError::ConnectionError {
                        message: format!(
                            "Global LAD service at {} is not available",
                            self.base_url
                        ),
                    }
                } else {
                    MtakError::HttpError(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(MtakError::AutoError {
                message: format!(
                    "Global LAD query failed: HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or_default()
                ),
            });
        }
        Ok(response.json().await?)
    }

    /// Channel values keyed by channel id.
    pub async fn fetch_channels(&self, query: &LadQuery) -> Result<BTreeMap<String, Vec<LadChannelValue>>> {
        self.query(query).await
    }

    /// EVRs keyed by level.
    pub async fn fetch_evrs(&self, query: &LadQuery) -> Result<BTreeMap<String, Vec<LadEvr>>> {
        self.query(query).await
    }

    /// FSW values of one channel newer than `from`.
    pub async fn get_eha(
        &self,
        channel_id: &str,
        realtime: bool,
        from: LadFrom,
    ) -> Result<Vec<LadChannelValue>> {
        let query = LadQuery::eha().channel_id(channel_id).max_results(-1).fsw_only();
        let query = if realtime { query.realtime_only() } else { query.recorded_only() };
        let query = query.from_bound(from, &self.sclk);
        Ok(self.fetch_channels(&query).await?.into_values().flatten().collect())
    }

    /// Monitor channel values produced by one station.
    pub async fn get_monitor(
        &self,
        channel_id: &str,
        station_id: i32,
        from_ert: i64,
        realtime: bool,
    ) -> Result<Vec<LadChannelValue>> {
        let query = LadQuery::eha()
            .monitor_only()
            .channel_id(channel_id)
            .dss_id(station_id)
            .max_results(-1);
        let query = if realtime { query.realtime_only() } else { query.recorded_only() };
        let query = query.from_bound(LadFrom::Ert(from_ert), &self.sclk);
        Ok(self.fetch_channels(&query).await?.into_values().flatten().collect())
    }

    /// FSW EVRs with one event id newer than `from`.
    pub async fn get_evr(&self, event_id: i64, realtime: bool, from: LadFrom) -> Result<Vec<LadEvr>> {
        let query = LadQuery::evr().event_id(event_id).max_results(-1).fsw_only();
        let query = if realtime { query.realtime_only() } else { query.recorded_only() };
        let query = query.from_bound(from, &self.sclk);
        Ok(self.fetch_evrs(&query).await?.into_values().flatten().collect())
    }
}

/// Body of a CFDP Processor `action/put` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CfdpPutRequest {
    pub requester_id: String,
    pub destination_entity: u64,
    pub source_file_name: String,
    pub destination_file_name: String,
    /// 1 unacknowledged, 2 acknowledged, 0 for the processor's default.
    pub service_class: u8,
    pub session_key: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub messages_to_user: Vec<String>,
    pub save_first: Option<bool>,
    pub save_file_as: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CfdpPutResponse {
    pub request_id: serde_json::Value,
    /// `(source entity id, transaction sequence number)`
    pub new_transaction_id: (u64, u64),
}

impl CfdpPutResponse {
    pub fn request_id(&self) -> String {
        match &self.request_id {
            serde_json::Value::String(id) => id.clone(),
            other => other.to_string(),
        }
    }

    pub fn source_entity_id(&self) -> String {
        self.new_transaction_id.0.to_string()
    }

    pub fn transaction_sequence_number(&self) -> String {
        self.new_transaction_id.1.to_string()
    }
}

pub struct CfdpProcessorClient {
    client: Client,
    base_url: Url,
}

impl CfdpProcessorClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: http_client(DEFAULT_REQUEST_TIMEOUT)?,
            base_url: parse_base("services.cfdp_processor_url", base_url)?,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = http_client(timeout)?;
        Ok(self)
    }

    /// Start a PUT transaction; the response names the new transaction.
    pub async fn put(&self, request: &CfdpPutRequest) -> Result<CfdpPutResponse> {
        let url = self
            .base_url
            .join("action/put")
            .map_err(|e| MtakError::ConfigError {
                message: format!("Invalid CFDP Processor URL {}: {}", self.base_url, e),
            })?;
        debug!("CFDP PUT @ {} = {:?}", url, request);

        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| MtakError::ConnectionError {
                message: format!(
                    "Could not send PUT request to CFDP Processor at {}. Check connection or check if CFDP Processor is running. ({})",
                    self.base_url, e
                ),
            })?;
        let response = check_status(response).await?;
        Ok(response.json::<CfdpPutResponse>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_uri_and_params() {
        let query = LadQuery::eha()
            .channel_id("A-0001")
            .channel_id("B-*")
            .realtime_only()
            .fsw_only()
            .max_results(-1);
        assert_eq!(query.uri(), "eha/fsw/realtime/ert");
        let ids: Vec<&str> = query
            .params()
            .iter()
            .filter(|(k, _)| k == "channelId")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(ids, vec!["A-0001", "B-*"]);
        assert_eq!(
            query.params().iter().filter(|(k, _)| k == "maxResults").count(),
            1
        );
    }

    #[test]
    fn test_sclk_bound_sets_scid() {
        let query = LadQuery::evr().from_bound(
            LadFrom::Sclk { exact: 5 << 16, scid: 76 },
            &SclkFormat::default(),
        );
        assert_eq!(query.uri(), "evr/all/both/sclk");
        assert!(query.params().contains(&("scid".to_string(), "76".to_string())));
        assert!(query
            .params()
            .contains(&("lowerBoundTime".to_string(), "0000000005-00000".to_string())));
    }

    #[test]
    fn test_lad_rows_deserialize() {
        let body = r#"{"A-0001":[{"channelId":"A-0001","dn":12,"eu":1.5,"ert":"2024-001T00:00:00.000","sessionNumber":7}]}"#;
        let rows: BTreeMap<String, Vec<LadChannelValue>> = serde_json::from_str(body).unwrap();
        let value = &rows["A-0001"][0];
        assert_eq!(value.dn, serde_json::json!(12));
        assert_eq!(value.eu, Some(1.5));
        assert_eq!(value.session_number, 7);

        let body = r#"{"COMMAND":[{"evrId":9,"evrName":"CMD_DISPATCH","evrLevel":"COMMAND","message":"ok","TaskName":"cmd"}]}"#;
        let rows: BTreeMap<String, Vec<LadEvr>> = serde_json::from_str(body).unwrap();
        assert_eq!(rows["COMMAND"][0].task_name.as_deref(), Some("cmd"));
    }

    #[test]
    fn test_cfdp_put_body_and_reply() {
        let request = CfdpPutRequest {
            requester_id: "ops".into(),
            destination_entity: 25,
            source_file_name: "seq/load.bin".into(),
            destination_file_name: "seq/load.bin".into(),
            service_class: 2,
            session_key: Some(42),
            ..Default::default()
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["destinationEntity"], 25);
        assert_eq!(body["sessionKey"], 42);
        assert!(body["saveFirst"].is_null());
        assert!(body.get("messagesToUser").is_none());

        let reply: CfdpPutResponse =
            serde_json::from_str(r#"{"requestId":"R-1","newTransactionId":[3,118]}"#).unwrap();
        assert_eq!(reply.request_id(), "R-1");
        assert_eq!(reply.source_entity_id(), "3");
        assert_eq!(reply.transaction_sequence_number(), "118");

        let reply: CfdpPutResponse =
            serde_json::from_str(r#"{"requestId":7,"newTransactionId":[3,119]}"#).unwrap();
        assert_eq!(reply.request_id(), "7");
    }

    #[test]
    fn test_bad_base_url() {
        assert!(CpdClient::new("not a url").is_err());
    }
}
