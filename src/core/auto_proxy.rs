//! AUTO uplink proxy: a REST front end (`chill_auto_uplink_server`) that
//! radiates SCMFs and CFDP PDUs and records log messages in a session.

use crate::config::toml_config::MtakConfig;
use crate::core::locate_tool;
use crate::domain::ports::{CommandUplink, FileLoad, UplinkOptions};
use crate::utils::error::{MtakError, Result};
use crate::utils::logger::LogLevel;
use crate::utils::validation::validate_existing_file;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

pub const AUTO_SERVER_APP: &str = "internal/chill_auto_uplink_server";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session the proxy logs uplink activity under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub venue: String,
    pub key: String,
    pub host: String,
    pub scid: String,
}

impl SessionInfo {
    /// Parse the `venue=..,key=..,host=..,scid=..` session response.
    pub fn parse(body: &str) -> Result<Self> {
        let fields: HashMap<&str, &str> = body
            .trim()
            .split(',')
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();

        let get = |name: &str| -> Result<String> {
            fields
                .get(name)
                .map(|v| v.to_string())
                .ok_or_else(|| MtakError::AutoError {
                    message: format!("Session response is missing '{}': {}", name, body.trim()),
                })
        };

        Ok(Self {
            venue: get("venue")?,
            key: get("key")?,
            host: get("host")?,
            scid: get("scid")?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutoCounters {
    pub scmfs_sent: u64,
    pub failed_scmfs: u64,
    pub pdus_sent: u64,
    pub failed_pdus: u64,
}

/// Find the first port in `start..=start+range` nobody is listening on.
pub async fn find_open_port(host: &str, start: u16, range: u16) -> Result<u16> {
    let last = start.saturating_add(range);
    for port in start..=last {
        match TcpStream::connect((host, port)).await {
            Ok(_) => debug!("Port {} on {} is in use", port, host),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => return Ok(port),
            Err(e) => debug!("Port {} on {} is not usable: {}", port, host, e),
        }
    }
    Err(MtakError::AutoError {
        message: "Cannot find an available port to start the AUTO uplink proxy".to_string(),
    })
}

fn is_digits(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}

async fn monitor_child(
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
    exit_message: Arc<Mutex<Option<String>>>,
    interval: Duration,
    log_path: PathBuf,
) {
    loop {
        tokio::time::sleep(interval).await;
        let mut guard = child.lock().await;
        let Some(process) = guard.as_mut() else {
            return;
        };
        let status = match process.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => continue,
            Err(e) => {
                warn!("Could not poll the AUTO uplink proxy: {}", e);
                return;
            }
        };

        let message = match status.code() {
            Some(0) => "Uplink proxy terminated with exit code 0".to_string(),
            Some(code) => format!(
                "Uplink proxy terminated with errors, exit code {}. See {} for more details",
                code,
                log_path.display()
            ),
            None => format!(
                "Uplink proxy was terminated by a signal. See {} for more details",
                log_path.display()
            ),
        };
        if status.success() {
            info!("{}", message);
        } else {
            error!("{}", message);
        }
        *lock(&exit_message) = Some(message);
        return;
    }
}

/// Client for the AUTO uplink proxy, optionally owning its process.
pub struct AutoProxy {
    config: MtakConfig,
    client: Client,
    base_url: Mutex<Option<Url>>,
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    exit_message: Arc<Mutex<Option<String>>>,
    log_path: Mutex<Option<PathBuf>>,
    session: Mutex<Option<SessionInfo>>,
    uplink_rates: Mutex<String>,
    counters: Mutex<AutoCounters>,
}

impl AutoProxy {
    pub fn new(config: MtakConfig) -> Self {
        Self {
            config,
            client: Client::new(),
            base_url: Mutex::new(None),
            child: Arc::new(tokio::sync::Mutex::new(None)),
            monitor: Mutex::new(None),
            exit_message: Arc::new(Mutex::new(None)),
            log_path: Mutex::new(None),
            session: Mutex::new(None),
            uplink_rates: Mutex::new("ANY".to_string()),
            counters: Mutex::new(AutoCounters::default()),
        }
    }

    pub fn base_url(&self) -> Option<Url> {
        lock(&self.base_url).clone()
    }

    pub fn session(&self) -> Option<SessionInfo> {
        lock(&self.session).clone()
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        lock(&self.log_path).clone()
    }

    pub fn counters(&self) -> AutoCounters {
        *lock(&self.counters)
    }

    fn scheme(&self) -> &'static str {
        if self.config.proxy.rest_insecure {
            "http"
        } else {
            "https"
        }
    }

    pub fn server_args(&self, port: u16) -> Vec<String> {
        let mut args = vec!["--restPort".to_string(), port.to_string()];
        if self.config.proxy.rest_insecure {
            args.push("--restInsecure".to_string());
        }

        if let Some(db) = &self.config.database {
            if !db.host.trim().is_empty() {
                args.extend(["--databaseHost".to_string(), db.host.clone()]);
            }
            args.extend(["--databasePort".to_string(), db.port.to_string()]);
            if let Some(user) = db.user.as_ref().filter(|u| !u.trim().is_empty()) {
                args.extend(["--dbUser".to_string(), user.clone()]);
            }
            if let Some(password) = db.password.as_ref().filter(|p| !p.trim().is_empty()) {
                args.extend(["--dbPwd".to_string(), password.clone()]);
            }
        }

        if let Some(security) = &self.config.security {
            if let Some(keytab) = security.keytab_file.as_ref().filter(|k| !k.trim().is_empty()) {
                let method = security
                    .login_method
                    .clone()
                    .unwrap_or_else(|| "KEYTAB_FILE".to_string());
                args.extend(["--loginMethod".to_string(), method]);
                args.extend(["--keytabFile".to_string(), keytab.clone()]);
                args.extend([
                    "--username".to_string(),
                    security.username.clone().unwrap_or_default(),
                ]);
            }
            if let Some(role) = security.role.as_ref().filter(|r| !r.trim().is_empty()) {
                args.extend(["--role".to_string(), role.clone()]);
            }
        }

        if let Some(log_file) = self.config.proxy.log_file.as_ref().filter(|f| !f.trim().is_empty()) {
            args.extend(["--logFile".to_string(), log_file.clone()]);
        }
        if self.config.proxy.log_to_db {
            args.push("--logToDb".to_string());
        }
        args
    }

    fn server_log_path(&self) -> PathBuf {
        match self.config.proxy.log_file.as_ref().filter(|f| !f.trim().is_empty()) {
            Some(path) => PathBuf::from(path),
            None => MtakConfig::log_dir().join(format!(
                "chill_auto_uplink_server-{}.log",
                chrono::Utc::now().timestamp()
            )),
        }
    }

    /// Spawn the proxy on a free port and wait for it to report `OK`.
    pub async fn start(&self) -> Result<()> {
        if self.child.lock().await.is_some() {
            warn!("AUTO uplink proxy has already been started");
            return Ok(());
        }

        let proxy = &self.config.proxy;
        let port = find_open_port(&proxy.rest_host, proxy.rest_port, proxy.port_scan_range).await?;
        let program = locate_tool(AUTO_SERVER_APP)?;
        let args = self.server_args(port);

        let log_path = self.server_log_path();
        let log = std::fs::File::create(&log_path)?;
        info!("AUTO uplink proxy log file written to {}", log_path.display());

        debug!("Running process {} {}", program.display(), args.join(" "));
        let child = Command::new(&program)
            .args(&args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::from(log.try_clone()?))
            .stderr(std::process::Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MtakError::AutoError {
                message: format!("Could not start the AUTO uplink proxy: {}", e),
            })?;

        *self.child.lock().await = Some(child);
        *lock(&self.exit_message) = None;
        *lock(&self.log_path) = Some(log_path.clone());
        *lock(&self.base_url) = Some(self.url_for(&proxy.rest_host, port)?);

        let monitor = tokio::spawn(monitor_child(
            Arc::clone(&self.child),
            Arc::clone(&self.exit_message),
            Duration::from_secs(proxy.monitor_interval_secs),
            log_path,
        ));
        if let Some(previous) = lock(&self.monitor).replace(monitor) {
            previous.abort();
        }

        self.check_ready().await
    }

    fn url_for(&self, host: &str, port: u16) -> Result<Url> {
        Url::parse(&format!("{}://{}:{}/", self.scheme(), host, port)).map_err(|e| {
            MtakError::InvalidConfigValueError {
                field: "proxy.rest_host".to_string(),
                value: host.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Use a proxy somebody else started.
    pub fn attach(&self, base_url: &str) -> Result<()> {
        let mut url = Url::parse(base_url).map_err(|e| MtakError::InvalidConfigValueError {
            field: "base_url".to_string(),
            value: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        *lock(&self.base_url) = Some(url);
        Ok(())
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        form: Option<Form>,
    ) -> Result<String> {
        if let Some(message) = lock(&self.exit_message).clone() {
            error!("AMPCS proxy exited unexpectedly");
            return Err(MtakError::AmpcsError {
                message: format!("AMPCS proxy exited unexpectedly:\n{}", message),
            });
        }

        let base = self.base_url().ok_or_else(|| MtakError::InvalidStateError {
            message: "The AUTO uplink proxy has not been started".to_string(),
        })?;
        let url = base.join(path).map_err(|e| MtakError::AutoError {
            message: format!("Invalid proxy path '{}': {}", path, e),
        })?;

        debug!("Requesting {} to URI {} with {:?}", method, url, query);
        let mut builder = self.client.request(method, url).query(query);
        if let Some(form) = form {
            builder = builder.multipart(form);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            error!("{}", body);
            return Err(MtakError::from_http_status(
                status.as_u16(),
                status.canonical_reason().unwrap_or_default(),
            ));
        }
        debug!("Proxy Response: {}", body);
        Ok(body)
    }

    pub async fn status(&self) -> Result<String> {
        self.request(Method::GET, "auto/status", &[], None).await
    }

    /// Poll `auto/status` until it answers `OK`.
    pub async fn check_ready(&self) -> Result<()> {
        let proxy = &self.config.proxy;
        let attempts = proxy.status_retries.max(1);
        for attempt in 1..=attempts {
            match self.status().await {
                Ok(body) if body.trim() == "OK" => {
                    debug!("Received AUTO proxy status response {}", body.trim());
                    return Ok(());
                }
                Ok(body) => debug!("AUTO uplink proxy not ready ({}). Attempt: {}", body.trim(), attempt),
                Err(e) => debug!("Unable to connect to AUTO uplink proxy. Attempt: {} {}", attempt, e),
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_secs(proxy.status_retry_delay_secs)).await;
            }
        }

        let url = self
            .base_url()
            .map(|u| u.to_string())
            .unwrap_or_default();
        Err(MtakError::AmpcsError {
            message: format!("Unable to GET AUTO status @ {}auto/status", url),
        })
    }

    /// Start a session from a config file, attach to an existing one, or
    /// (with no arguments) attach to the latest uplink session.
    pub async fn init_session(
        &self,
        config_file: Option<&str>,
        session_id: Option<&str>,
        session_host: Option<&str>,
    ) -> Result<SessionInfo> {
        let query: Vec<(&str, String)> = match (config_file, session_id, session_host) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(MtakError::AutoError {
                    message: "Cannot specify both sessionId or sessionHost if sessionConfigFile is specified".to_string(),
                });
            }
            (Some(file), None, None) => {
                validate_existing_file("session_config_file", file)?;
                debug!("Initializing new session with {}", file);
                vec![("sessionConfigFile", file.to_string())]
            }
            (None, Some(id), Some(host)) => {
                debug!("Attaching to session (id={}, host={})", id, host);
                vec![("sessionId", id.to_string()), ("sessionHost", host.to_string())]
            }
            (None, None, None) => {
                debug!("Attaching to latest uplink session");
                Vec::new()
            }
            (None, _, _) => {
                return Err(MtakError::AutoError {
                    message: "sessionId and sessionHost must be specified together".to_string(),
                });
            }
        };

        let body = self.request(Method::POST, "auto/session", &query, None).await?;
        let session = SessionInfo::parse(&body)?;
        info!(
            "AUTO session key={} host={} venue={} scid={}",
            session.key, session.host, session.venue, session.scid
        );
        *lock(&self.session) = Some(session.clone());
        Ok(session)
    }

    pub async fn log(&self, level: &str, message: &str) -> Result<()> {
        let level = LogLevel::parse(level);
        self.request(
            Method::POST,
            "auto/log",
            &[("level", level.as_str().to_string()), ("message", message.to_string())],
            None,
        )
        .await
        .map(|_| ())
    }

    /// Rates attached to subsequent SCMF sends; `None` means `ANY`.
    pub fn set_rates(&self, rates: Option<&[f64]>) {
        let rates = match rates {
            Some(rates) if !rates.is_empty() => rates
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(","),
            _ => "ANY".to_string(),
        };
        info!("AUTO uplink rates set to {}", rates);
        *lock(&self.uplink_rates) = rates;
    }

    pub async fn send_scmf_file(
        &self,
        scmf_file: &str,
        validate: bool,
        wait_for_radiation: u32,
    ) -> Result<()> {
        if scmf_file.trim().is_empty() {
            return Err(MtakError::AutoError {
                message: "SCMF file cannot be empty".to_string(),
            });
        }
        let rates = lock(&self.uplink_rates).clone();
        let result = self
            .request(
                Method::POST,
                "auto/send_scmf",
                &[
                    ("scmfFile", scmf_file.to_string()),
                    ("validateScmf", validate.to_string()),
                    ("waitForRadiation", wait_for_radiation.to_string()),
                    ("uplinkRates", rates),
                ],
                None,
            )
            .await
            .map(|_| ());

        let mut counters = lock(&self.counters);
        match &result {
            Ok(()) => counters.scmfs_sent += 1,
            Err(_) => counters.failed_scmfs += 1,
        }
        result
    }

    /// Upload a CFDP PDU file for radiation to `entity_id`, optionally on a
    /// specific virtual channel.
    pub async fn send_pdu_file(&self, pdu_file: &str, entity_id: &str, vcid: Option<&str>) -> Result<()> {
        if !Path::new(pdu_file).is_file() {
            return Err(MtakError::AutoError {
                message: "PDU file is not valid".to_string(),
            });
        }
        if !is_digits(entity_id) {
            return Err(MtakError::AutoError {
                message: "EntityId must be a number".to_string(),
            });
        }
        let path = match vcid {
            Some(vcid) if !is_digits(vcid) => {
                return Err(MtakError::AutoError {
                    message: "Vcid must be a number".to_string(),
                });
            }
            Some(vcid) => format!("auto/send_pdu_file/{}", vcid),
            None => "auto/send_pdu_file".to_string(),
        };

        let bytes = tokio::fs::read(pdu_file).await?;
        let file_name = Path::new(pdu_file)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "pdu".to_string());
        let form = Form::new().part("pduFile", Part::bytes(bytes).file_name(file_name));

        let result = self
            .request(
                Method::POST,
                &path,
                &[("destinationEntityId", entity_id.to_string())],
                Some(form),
            )
            .await
            .map(|_| ());

        let mut counters = lock(&self.counters);
        match &result {
            Ok(()) => counters.pdus_sent += 1,
            Err(_) => counters.failed_pdus += 1,
        }
        result
    }

    /// Kill the proxy process if this client started it.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(monitor) = lock(&self.monitor).take() {
            monitor.abort();
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Ok(None) = child.try_wait() {
                if let Err(e) = child.kill().await {
                    error!("Could not stop the AUTO uplink proxy: {}", e);
                }
            }
            info!("AUTO uplink proxy stopped");
        }
        Ok(())
    }

    fn unsupported(&self, what: &str) -> Result<()> {
        Err(MtakError::NotImplemented {
            message: format!("The AUTO uplink proxy cannot send {}", what),
        })
    }
}

#[async_trait]
impl CommandUplink for AutoProxy {
    async fn send_flight_command(&self, _command: &str, _options: &UplinkOptions) -> Result<()> {
        self.unsupported("flight commands")
    }

    async fn send_sse_command(&self, _command: &str) -> Result<()> {
        self.unsupported("SSE commands")
    }

    async fn send_file_load(&self, _load: &FileLoad, _options: &UplinkOptions) -> Result<()> {
        self.unsupported("file loads")
    }

    async fn send_scmf(
        &self,
        path: &str,
        disable_checks: Option<bool>,
        wait_for_radiation: u32,
    ) -> Result<()> {
        let validate = !disable_checks.unwrap_or(false);
        self.send_scmf_file(path, validate, wait_for_radiation).await
    }

    async fn send_raw_data(&self, _path: &str, _hex: Option<bool>, _wfr: u32) -> Result<()> {
        self.unsupported("raw data files")
    }

    async fn send_command_list_file(&self, _path: &str, _options: &UplinkOptions) -> Result<()> {
        self.unsupported("command list files")
    }

    async fn send_log(&self, level: &str, message: &str) -> Result<()> {
        self.log(level, message).await
    }

    async fn set_uplink_rates(&self, rates: Option<&[f64]>) -> Result<()> {
        self.set_rates(rates);
        Ok(())
    }

    fn summary(&self) -> String {
        let c = self.counters();
        let rule = "-".repeat(28);
        [
            rule.clone(),
            "AUTO Uplink Transmissions".to_string(),
            rule,
            String::new(),
            format!("Total Successful SCMF Sends = {}", c.scmfs_sent),
            format!("Total Failed SCMF Sends = {}", c.failed_scmfs),
            String::new(),
            format!("Total Successful CFDP PDU Sends = {}", c.pdus_sent),
            format!("Total Failed CFDP PDU Sends = {}", c.failed_pdus),
        ]
        .join("\n")
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_info_parse() {
        let session = SessionInfo::parse("venue=TESTSET,key=123,host=ops1,scid=76\n").unwrap();
        assert_eq!(session.venue, "TESTSET");
        assert_eq!(session.key, "123");
        assert_eq!(session.host, "ops1");
        assert_eq!(session.scid, "76");

        assert!(matches!(
            SessionInfo::parse("venue=TESTSET,key=123"),
            Err(MtakError::AutoError { .. })
        ));
    }

    #[test]
    fn test_server_args() {
        let mut config = MtakConfig::default();
        config.proxy.log_to_db = true;
        config.security = Some(crate::config::toml_config::SecurityConfig {
            login_method: None,
            keytab_file: Some("/k.keytab".to_string()),
            username: Some("ops".to_string()),
            role: Some("ACE".to_string()),
        });
        let args = AutoProxy::new(config).server_args(8390);
        assert_eq!(&args[..3], &["--restPort", "8390", "--restInsecure"]);
        assert!(args.windows(2).any(|w| w == ["--loginMethod", "KEYTAB_FILE"]));
        assert!(args.windows(2).any(|w| w == ["--username", "ops"]));
        assert!(args.windows(2).any(|w| w == ["--role", "ACE"]));
        assert_eq!(args.last().map(String::as_str), Some("--logToDb"));
    }

    #[tokio::test]
    async fn test_find_open_port_skips_listeners() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy = listener.local_addr().unwrap().port();
        let port = find_open_port("127.0.0.1", busy, 5).await.unwrap();
        assert_ne!(port, busy);
        assert!(port > busy);
    }

    #[tokio::test]
    async fn test_find_open_port_range_includes_both_ends() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy = listener.local_addr().unwrap().port();
        assert!(matches!(
            find_open_port("127.0.0.1", busy, 0).await,
            Err(MtakError::AutoError { .. })
        ));

        drop(listener);
        assert_eq!(find_open_port("127.0.0.1", busy, 0).await.unwrap(), busy);
    }

    #[tokio::test]
    async fn test_requests_fail_after_proxy_exit() {
        let proxy = AutoProxy::new(MtakConfig::default());
        proxy.attach("http://127.0.0.1:1").unwrap();
        *lock(&proxy.exit_message) =
            Some("Uplink proxy terminated with errors, exit code 1".to_string());

        let err = proxy.status().await.unwrap_err();
        match err {
            MtakError::AmpcsError { message } => assert!(message.contains("exit code 1")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_before_start_is_invalid_state() {
        let proxy = AutoProxy::new(MtakConfig::default());
        assert!(matches!(
            proxy.log("INFO", "hello").await,
            Err(MtakError::InvalidStateError { .. })
        ));
    }

    #[tokio::test]
    async fn test_session_argument_rules() {
        let proxy = AutoProxy::new(MtakConfig::default());
        proxy.attach("http://127.0.0.1:1").unwrap();
        assert!(matches!(
            proxy.init_session(Some("/tmp/x.xml"), Some("1"), None).await,
            Err(MtakError::AutoError { .. })
        ));
        assert!(matches!(
            proxy.init_session(None, Some("1"), None).await,
            Err(MtakError::AutoError { .. })
        ));
        assert!(matches!(
            proxy.init_session(Some("/no/such/session.xml"), None, None).await,
            Err(MtakError::InvalidConfigValueError { .. })
        ));
    }

    #[tokio::test]
    async fn test_pdu_argument_rules() {
        let proxy = AutoProxy::new(MtakConfig::default());
        proxy.attach("http://127.0.0.1:1").unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().to_string();

        assert!(matches!(
            proxy.send_pdu_file("/no/such/file.pdu", "1", None).await,
            Err(MtakError::AutoError { .. })
        ));
        assert!(matches!(
            proxy.send_pdu_file(&path, "abc", None).await,
            Err(MtakError::AutoError { .. })
        ));
        assert!(matches!(
            proxy.send_pdu_file(&path, "1", Some("x")).await,
            Err(MtakError::AutoError { .. })
        ));
    }
}
