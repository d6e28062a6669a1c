//! MTAK uplink proxy. Requests are comma separated lines written to the
//! stdin of `chill_mtak_uplink_server`; each is answered on stdout by log
//! lines and a `Success=N` return code.

use crate::config::toml_config::{MtakConfig, UplinkConnectionType};
use crate::core::locate_tool;
use crate::domain::ports::{CommandUplink, FileLoad, UplinkOptions};
use crate::utils::error::{MtakError, Result};
use crate::utils::logger::{relay_process_line, LogLevel};
use crate::utils::validation::{validate_existing_file, validate_numeric};
use async_trait::async_trait;
use regex::Regex;
use std::fmt::Display;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

pub const UPLINK_SERVER_APP: &str = "internal/chill_mtak_uplink_server";
pub const SSE_PREFIX: &str = "sse:";

const READY_LINE: &str = "MTAK uplink server ready for commands";
const TERMINATOR: &str = ";;;";
const DELIMITER: &str = ",";
const RESPONSE_GRACE_SECS: u64 = 30;

fn success_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Success=(\d\d?)").expect("valid success regex"))
}

fn log_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^.*(INFO|WARN|ERROR|FATAL|CRITICAL).*$").expect("valid log regex")
    })
}

fn quoted_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"^("|')(.+)("|')$"#).expect("valid quote regex"))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UplinkCounters {
    pub flight_commands_sent: u64,
    pub failed_flight_commands: u64,
    pub sse_commands_sent: u64,
    pub failed_sse_commands: u64,
    pub file_loads_sent: u64,
    pub failed_file_loads: u64,
    pub scmfs_sent: u64,
    pub failed_scmfs: u64,
    pub raw_datas_sent: u64,
    pub failed_raw_datas: u64,
}

/// Remove one pair of surrounding quotes, as a shell would.
pub fn strip_quotes(command: &str) -> &str {
    match quoted_pattern().captures(command) {
        Some(caps) => caps.get(2).map_or(command, |m| m.as_str()),
        None => command,
    }
}

fn field<T: Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn request(prefix: &str, fields: &[String]) -> String {
    let mut parts = Vec::with_capacity(fields.len() + 1);
    parts.push(prefix.to_string());
    parts.extend(fields.iter().cloned());
    parts.join(DELIMITER)
}

pub fn command_request(command: &str, options: &UplinkOptions) -> String {
    request(
        "CMD",
        &[
            field(options.validate),
            field(options.string_id.as_deref()),
            field(options.virtual_channel),
            field(options.scid),
            options.wait_for_radiation.to_string(),
            command.to_string(),
        ],
    )
}

pub fn file_load_request(load: &FileLoad, options: &UplinkOptions) -> String {
    request(
        "FILE",
        &[
            field(load.overwrite),
            field(options.string_id.as_deref()),
            field(options.virtual_channel),
            field(options.scid),
            load.source.clone(),
            load.target.clone(),
            load.file_type.unwrap_or(0).to_string(),
            options.wait_for_radiation.to_string(),
        ],
    )
}

pub fn command_list_request(path: &str, options: &UplinkOptions) -> String {
    request(
        "CMDLIST",
        &[
            field(options.validate),
            field(options.string_id.as_deref()),
            field(options.virtual_channel),
            field(options.scid),
            path.to_string(),
            options.wait_for_radiation.to_string(),
        ],
    )
}

pub fn uplink_rate_request(rates: Option<&[f64]>) -> String {
    match rates {
        Some(rates) if !rates.is_empty() => {
            let rates: Vec<String> = rates.iter().map(|r| r.to_string()).collect();
            request("UPLINKRATE", &rates)
        }
        _ => request("UPLINKRATE", &["ANY".to_string()]),
    }
}

/// Commands in a command list file: one per line, `//` starts a comment.
pub fn command_list_entries(content: &str) -> Vec<&str> {
    content
        .lines()
        .map(|line| line.split("//").next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Log a server output line at the level it names.
fn relay_server_line(line: &str) -> bool {
    match log_pattern().captures(line) {
        Some(caps) => {
            LogLevel::parse(&caps[1]).emit(&format!("[chill_mtak_uplink_server] {}", line.trim()));
            true
        }
        None => false,
    }
}

type ServerLines = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;

struct UplinkChannel {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    lines: ServerLines,
    child: Option<Child>,
}

/// Wait for the ready banner. Error lines printed before it are returned in
/// the failure.
async fn await_ready(lines: &mut ServerLines, limit: Duration) -> Result<()> {
    let mut errors = Vec::new();
    let outcome = tokio::time::timeout(limit, async {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.contains(READY_LINE) {
                        return true;
                    }
                    if ["ERROR", "CRITICAL", "FATAL"].iter().any(|l| line.contains(l)) {
                        errors.push(line.trim().to_string());
                    }
                    relay_process_line("chill_mtak_uplink_server", &line);
                }
                _ => return false,
            }
        }
    })
    .await;

    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => Err(MtakError::UplinkError {
            message: format!(
                "Errors while launching uplink server process:\n{}",
                errors.join("\n")
            ),
        }),
        Err(_) => Err(MtakError::UplinkError {
            message: format!(
                "Uplink server was not ready after {} seconds:\n{}",
                limit.as_secs(),
                errors.join("\n")
            ),
        }),
    }
}

/// Read until the return code, keeping the log lines seen on the way.
async fn read_return_code(lines: &mut ServerLines, sent: &str, output: &mut Vec<String>) -> Option<u32> {
    loop {
        let line = lines.next_line().await.ok()??;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.contains(sent) {
            continue;
        }
        if relay_server_line(trimmed) {
            output.push(trimmed.to_string());
        }
        if let Some(caps) = success_pattern().captures(trimmed) {
            return caps[1].parse().ok();
        }
    }
}

/// Collect the lines that trail the return code until the server goes quiet.
async fn drain(lines: &mut ServerLines, output: &mut Vec<String>, quiet: Duration) {
    while let Ok(Ok(Some(line))) = tokio::time::timeout(quiet, lines.next_line()).await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        relay_server_line(trimmed);
        output.push(trimmed.to_string());
    }
}

fn failure_output(output: &[String]) -> String {
    output
        .iter()
        .filter(|line| !line.contains("INFO") && !line.contains("WARN"))
        .cloned()
        .collect::<Vec<_>>()
        .join("\n")
}

/// Uplink through a `chill_mtak_uplink_server` child process.
pub struct UplinkProxy {
    config: MtakConfig,
    counters: Mutex<UplinkCounters>,
    channel: tokio::sync::Mutex<Option<UplinkChannel>>,
    drain_quiet: Duration,
}

impl UplinkProxy {
    pub fn new(config: MtakConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(UplinkCounters::default()),
            channel: tokio::sync::Mutex::new(None),
            drain_quiet: Duration::from_secs(1),
        }
    }

    pub fn counters(&self) -> UplinkCounters {
        *lock(&self.counters)
    }

    pub async fn is_running(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    fn record(&self, update: impl FnOnce(&mut UplinkCounters)) {
        update(&mut lock(&self.counters));
    }

    /// Both FSW and (when present) SSE uplink endpoints must be configured.
    pub fn check_network(&self) -> Result<()> {
        let uplink = &self.config.uplink;
        if uplink.fsw_host.trim().is_empty() || uplink.fsw_port.map_or(true, |p| p == 0) {
            return Err(MtakError::InvalidStateError {
                message: "The FSW uplink host and/or port are not available. Cannot send uplink to the FSW.".to_string(),
            });
        }
        if uplink.has_sse {
            let host_missing = uplink.sse_host.as_deref().map_or(true, |h| h.trim().is_empty());
            if host_missing || uplink.sse_port.map_or(true, |p| p == 0) {
                return Err(MtakError::InvalidStateError {
                    message: "The SSE host and/or uplink port are not available. Cannot send uplink to the SSE.".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn server_args(&self) -> Result<Vec<String>> {
        let key = self.config.session.key.clone().unwrap_or_default();
        validate_numeric("session.key", &key).map_err(|_| MtakError::InvalidInitError {
            message: format!(
                "Cannot start the uplink proxy because the session key \"{}\" is invalid.",
                key
            ),
        })?;

        let uplink = &self.config.uplink;
        let mut args = vec![
            "-K".to_string(),
            key,
            "--fswUplinkHost".to_string(),
            uplink.fsw_host.clone(),
            "--fswUplinkPort".to_string(),
            field(uplink.fsw_port),
        ];
        if uplink.has_sse {
            args.extend(["--sseHost".to_string(), field(uplink.sse_host.as_deref())]);
            args.extend(["--sseUplinkPort".to_string(), field(uplink.sse_port)]);
        }
        if let Some(db) = &self.config.database {
            args.extend(["--databaseHost".to_string(), db.host.clone()]);
            args.extend(["--databasePort".to_string(), db.port.to_string()]);
            if let Some(user) = &db.user {
                args.extend(["--dbUser".to_string(), user.clone()]);
            }
            if let Some(password) = &db.password {
                args.extend(["--dbPwd".to_string(), password.clone()]);
            }
        }
        if let Some(jms) = &self.config.jms {
            args.extend(["--jmsHost".to_string(), jms.host.clone()]);
            args.extend(["--jmsPort".to_string(), jms.port.to_string()]);
        }
        if let Some(security) = &self.config.security {
            if let Some(method) = &security.login_method {
                args.extend(["--loginMethod".to_string(), method.clone()]);
            }
            if let Some(keytab) = &security.keytab_file {
                args.extend(["--keytabFile".to_string(), keytab.clone()]);
            }
            if let Some(role) = &security.role {
                args.extend(["--role".to_string(), role.clone()]);
            }
            if let Some(username) = &security.username {
                args.extend(["--username".to_string(), username.clone()]);
            }
        }
        Ok(args)
    }

    /// Spawn the uplink server and wait until it accepts requests.
    pub async fn start(&self) -> Result<()> {
        let mut channel = self.channel.lock().await;
        if channel.is_some() {
            warn!("Uplink Proxy has already been started. Make sure you did not call \"start()\" twice.");
            return Ok(());
        }

        self.check_network()?;
        let args = self.server_args()?;
        let program = locate_tool(UPLINK_SERVER_APP)?;

        debug!("Running process {} {}", program.display(), args.join(" "));
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MtakError::UplinkError {
                message: format!("Could not start the uplink server process: {}", e),
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(MtakError::UplinkError {
                message: "Uplink server process has no stdio pipes".to_string(),
            });
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    relay_process_line("chill_mtak_uplink_server", &line);
                }
            });
        }

        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(stdout);
        let mut lines = BufReader::new(reader).lines();
        let limit = Duration::from_secs(self.config.uplink.ready_timeout_secs);
        if let Err(e) = await_ready(&mut lines, limit).await {
            let _ = child.kill().await;
            return Err(e);
        }

        *channel = Some(UplinkChannel {
            writer: Box::new(stdin),
            lines,
            child: Some(child),
        });
        info!("MTAK uplink server is ready");
        Ok(())
    }

    /// Talk to an uplink server over existing streams instead of spawning
    /// one. The ready banner is still expected.
    pub async fn attach<W, R>(&self, writer: W, reader: R) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut channel = self.channel.lock().await;
        if channel.is_some() {
            return Err(MtakError::InvalidStateError {
                message: "Uplink Proxy is already running".to_string(),
            });
        }
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let mut lines = BufReader::new(reader).lines();
        await_ready(&mut lines, Duration::from_secs(self.config.uplink.ready_timeout_secs)).await?;
        *channel = Some(UplinkChannel {
            writer: Box::new(writer),
            lines,
            child: None,
        });
        Ok(())
    }

    async fn transmit(&self, uplink: &str, wait_for_radiation: u32) -> Result<()> {
        let mut guard = self.channel.lock().await;
        let channel = guard.as_mut().ok_or_else(|| MtakError::InvalidStateError {
            message: "The MTAK Uplink proxy is not running. Make sure the session MTAK is attached to is configured for uplink.".to_string(),
        })?;

        if let Some(child) = channel.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(MtakError::UplinkError {
                    message: format!(
                        "Uplink server process died unexpectedly ({}). Cannot transmit any uplink.",
                        status
                    ),
                });
            }
        }

        let sent = format!("{}{}", uplink, TERMINATOR);
        channel.writer.write_all(format!("{}\n", sent).as_bytes()).await?;
        channel.writer.flush().await?;

        let mut output = Vec::new();
        let limit = Duration::from_secs(RESPONSE_GRACE_SECS + u64::from(wait_for_radiation));
        let code = tokio::time::timeout(limit, read_return_code(&mut channel.lines, &sent, &mut output))
            .await
            .ok()
            .flatten();
        let Some(code) = code else {
            return Err(MtakError::RadiationError {
                message: "Error radiating uplink".to_string(),
            });
        };

        drain(&mut channel.lines, &mut output, self.drain_quiet).await;
        match code {
            0 => Ok(()),
            code => Err(MtakError::from_return_code(code, &failure_output(&output))),
        }
    }

    fn count_command_list(&self, content: &str, succeeded: bool) {
        self.record(|c| {
            for entry in command_list_entries(content) {
                match (entry.starts_with(SSE_PREFIX), succeeded) {
                    (true, true) => c.sse_commands_sent += 1,
                    (true, false) => c.failed_sse_commands += 1,
                    (false, true) => c.flight_commands_sent += 1,
                    (false, false) => c.failed_flight_commands += 1,
                }
            }
        });
    }
}

#[async_trait]
impl CommandUplink for UplinkProxy {
    async fn send_flight_command(&self, command: &str, options: &UplinkOptions) -> Result<()> {
        info!("Sending flight command \"{}\" ({:?})", command, options);
        let command = strip_quotes(command);

        if command.starts_with(SSE_PREFIX) && self.config.uplink.has_sse {
            self.record(|c| c.failed_flight_commands += 1);
            let message = format!(
                "A flight command cannot start with the reserved SSE command prefix '{}'",
                SSE_PREFIX
            );
            error!("{}", message);
            return Err(MtakError::CommandFormatError { message });
        }

        let result = self
            .transmit(&command_request(command, options), options.wait_for_radiation)
            .await;
        self.record(|c| match &result {
            Ok(()) => c.flight_commands_sent += 1,
            Err(_) => c.failed_flight_commands += 1,
        });
        result
    }

    async fn send_sse_command(&self, command: &str) -> Result<()> {
        if !self.config.uplink.has_sse {
            return Err(MtakError::NotImplemented {
                message: "The current mission does not have an SSE. Cannot send SSE commands.".to_string(),
            });
        }
        info!("Sending SSE command \"{}\"", command);
        let command = strip_quotes(command);
        let command = if command.starts_with(SSE_PREFIX) {
            command.to_string()
        } else {
            format!("{}{}", SSE_PREFIX, command)
        };

        let options = UplinkOptions::default();
        let result = self.transmit(&command_request(&command, &options), 0).await;
        self.record(|c| match &result {
            Ok(()) => c.sse_commands_sent += 1,
            Err(_) => c.failed_sse_commands += 1,
        });
        result
    }

    async fn send_file_load(&self, load: &FileLoad, options: &UplinkOptions) -> Result<()> {
        info!("Sending file load {} -> {}", load.source, load.target);
        let result = self
            .transmit(&file_load_request(load, options), options.wait_for_radiation)
            .await;
        self.record(|c| match &result {
            Ok(()) => c.file_loads_sent += 1,
            Err(_) => c.failed_file_loads += 1,
        });
        result
    }

    async fn send_scmf(
        &self,
        path: &str,
        disable_checks: Option<bool>,
        wait_for_radiation: u32,
    ) -> Result<()> {
        info!("Sending SCMF {}", path);
        let uplink = request(
            "SCMF",
            &[
                field(disable_checks),
                path.to_string(),
                wait_for_radiation.to_string(),
            ],
        );
        let result = self.transmit(&uplink, wait_for_radiation).await;
        self.record(|c| match &result {
            Ok(()) => c.scmfs_sent += 1,
            Err(_) => c.failed_scmfs += 1,
        });
        result
    }

    async fn send_raw_data(
        &self,
        path: &str,
        hex: Option<bool>,
        wait_for_radiation: u32,
    ) -> Result<()> {
        info!("Sending raw data file {}", path);
        let uplink = request(
            "RAW",
            &[field(hex), path.to_string(), wait_for_radiation.to_string()],
        );
        let result = self.transmit(&uplink, wait_for_radiation).await;
        self.record(|c| match &result {
            Ok(()) => c.raw_datas_sent += 1,
            Err(_) => c.failed_raw_datas += 1,
        });
        result
    }

    async fn send_command_list_file(&self, path: &str, options: &UplinkOptions) -> Result<()> {
        validate_existing_file("command_list_file", path)?;
        info!("Sending command list file {}", path);
        let content = tokio::fs::read_to_string(path).await?;

        let result = self
            .transmit(&command_list_request(path, options), options.wait_for_radiation)
            .await;
        self.count_command_list(&content, result.is_ok());
        result
    }

    async fn send_log(&self, level: &str, message: &str) -> Result<()> {
        let level = LogLevel::parse(level);
        self.transmit(&request("LOG", &[level.as_str().to_string(), message.to_string()]), 0)
            .await
    }

    async fn set_uplink_rates(&self, rates: Option<&[f64]>) -> Result<()> {
        if self.config.uplink.connection_type != UplinkConnectionType::CommandService {
            debug!("Uplink rates only apply to COMMAND_SERVICE connections");
            return Ok(());
        }
        self.transmit(&uplink_rate_request(rates), 0).await
    }

    fn summary(&self) -> String {
        let c = self.counters();
        let rule = "-".repeat(28);
        let mut lines = vec![
            rule.clone(),
            "Uplink Transmissions".to_string(),
            rule,
            String::new(),
            format!("Total Successful Flight Commands = {}", c.flight_commands_sent),
            format!("Total Failed Flight Commands = {}", c.failed_flight_commands),
            String::new(),
            format!("Total Successful File Load Sends = {}", c.file_loads_sent),
            format!("Total Failed File Load Sends = {}", c.failed_file_loads),
            String::new(),
            format!("Total Successful SCMF Sends = {}", c.scmfs_sent),
            format!("Total Failed SCMF Sends = {}", c.failed_scmfs),
            String::new(),
            format!("Total Success Raw Data File Sends = {}", c.raw_datas_sent),
            format!("Total Failed Raw Data File Sends = {}", c.failed_raw_datas),
        ];
        if self.config.uplink.has_sse {
            lines.push(format!("Total Successful SSE Commands = {}", c.sse_commands_sent));
            lines.push(format!("Total Failed SSE Commands = {}", c.failed_sse_commands));
        }
        lines.join("\n")
    }

    async fn stop(&self) -> Result<()> {
        let Some(mut channel) = self.channel.lock().await.take() else {
            warn!("Uplink Proxy is already stopped. Make sure you did not call \"stop()\" twice.");
            return Ok(());
        };

        let _ = channel.writer.shutdown().await;
        drop(channel.writer);

        if let Some(mut child) = channel.child.take() {
            let limit = Duration::from_secs(self.config.uplink.stop_timeout_secs);
            match tokio::time::timeout(limit, child.wait()).await {
                Ok(Ok(status)) => debug!("Uplink server exited with {}", status),
                Ok(Err(e)) => error!("Error waiting for the uplink server: {}", e),
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        error!("Could not kill the uplink server process: {}", e);
                    }
                    warn!("MTAK Uplink Proxy shutdown signal has been forced");
                }
            }
        }
        info!("MTAK Uplink Proxy has been stopped");
        Ok(())
    }
}

/// Stand-in for missions without uplink.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyUplinkProxy;

impl DummyUplinkProxy {
    fn unsupported<T>(&self) -> Result<T> {
        Err(MtakError::NotImplemented {
            message: "Uplink is not available for the current mission".to_string(),
        })
    }
}

#[async_trait]
impl CommandUplink for DummyUplinkProxy {
    async fn send_flight_command(&self, _command: &str, _options: &UplinkOptions) -> Result<()> {
        self.unsupported()
    }

    async fn send_sse_command(&self, _command: &str) -> Result<()> {
        self.unsupported()
    }

    async fn send_file_load(&self, _load: &FileLoad, _options: &UplinkOptions) -> Result<()> {
        self.unsupported()
    }

    async fn send_scmf(&self, _path: &str, _disable_checks: Option<bool>, _wfr: u32) -> Result<()> {
        self.unsupported()
    }

    async fn send_raw_data(&self, _path: &str, _hex: Option<bool>, _wfr: u32) -> Result<()> {
        self.unsupported()
    }

    async fn send_command_list_file(&self, _path: &str, _options: &UplinkOptions) -> Result<()> {
        self.unsupported()
    }

    async fn send_log(&self, _level: &str, _message: &str) -> Result<()> {
        self.unsupported()
    }

    async fn set_uplink_rates(&self, _rates: Option<&[f64]>) -> Result<()> {
        self.unsupported()
    }

    fn summary(&self) -> String {
        String::new()
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;

    fn config(has_sse: bool) -> MtakConfig {
        let mut config = MtakConfig::default();
        config.session.key = Some("42".to_string());
        config.uplink.fsw_port = Some(12345);
        config.uplink.has_sse = has_sse;
        config.uplink.ready_timeout_secs = 2;
        config
    }

    /// Fake uplink server: prints the banner, then answers each request with
    /// the lines `respond` returns. Yields every request it saw.
    fn fake_server(
        respond: fn(&str) -> Vec<String>,
    ) -> (DuplexStream, DuplexStream, JoinHandle<Vec<String>>) {
        let (proxy_writer, server_reader) = duplex(4096);
        let (mut server_writer, proxy_reader) = duplex(4096);
        let handle = tokio::spawn(async move {
            server_writer
                .write_all(format!("{}\n", READY_LINE).as_bytes())
                .await
                .unwrap();
            let mut requests = Vec::new();
            let mut lines = BufReader::new(server_reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                for reply in respond(&line) {
                    server_writer
                        .write_all(format!("{}\n", reply).as_bytes())
                        .await
                        .unwrap();
                }
                requests.push(line);
            }
            requests
        });
        (proxy_writer, proxy_reader, handle)
    }

    fn accept_all(_line: &str) -> Vec<String> {
        vec!["INFO Request received".to_string(), "Success=0".to_string()]
    }

    fn reject_all(_line: &str) -> Vec<String> {
        vec![
            "ERROR Command service rejected the request".to_string(),
            "Success=5".to_string(),
        ]
    }

    async fn attached(
        config: MtakConfig,
        respond: fn(&str) -> Vec<String>,
    ) -> (UplinkProxy, JoinHandle<Vec<String>>) {
        let mut proxy = UplinkProxy::new(config);
        proxy.drain_quiet = Duration::from_millis(50);
        let (writer, reader, handle) = fake_server(respond);
        proxy.attach(writer, reader).await.unwrap();
        (proxy, handle)
    }

    #[test]
    fn test_request_formats() {
        let options = UplinkOptions {
            validate: Some(true),
            string_id: Some("A".to_string()),
            virtual_channel: None,
            scid: Some(76),
            wait_for_radiation: 10,
        };
        assert_eq!(
            command_request("FLIGHT_SOFTWARE_CMD(1)", &options),
            "CMD,true,A,,76,10,FLIGHT_SOFTWARE_CMD(1)"
        );

        let load = FileLoad {
            source: "/tmp/a.bin".to_string(),
            target: "/fsw/a.bin".to_string(),
            file_type: None,
            overwrite: Some(false),
        };
        assert_eq!(
            file_load_request(&load, &UplinkOptions::default()),
            "FILE,false,,,,/tmp/a.bin,/fsw/a.bin,0,0"
        );
        assert_eq!(uplink_rate_request(None), "UPLINKRATE,ANY");
        assert_eq!(uplink_rate_request(Some(&[1.0, 2000.5])), "UPLINKRATE,1,2000.5");
    }

    #[test]
    fn test_strip_quotes_and_command_lists() {
        assert_eq!(strip_quotes("\"NO_OP\""), "NO_OP");
        assert_eq!(strip_quotes("'NO_OP'"), "NO_OP");
        assert_eq!(strip_quotes("NO_OP"), "NO_OP");

        let content = "// header\nCMD_A\n\n  sse:PING // trailing\nCMD_B\n";
        assert_eq!(command_list_entries(content), vec!["CMD_A", "sse:PING", "CMD_B"]);
    }

    #[test]
    fn test_server_args_and_network_checks() {
        let proxy = UplinkProxy::new(config(true));
        assert!(matches!(
            proxy.check_network(),
            Err(MtakError::InvalidStateError { .. })
        ));

        let mut cfg = config(false);
        cfg.security = Some(crate::config::toml_config::SecurityConfig {
            login_method: Some("KEYTAB_FILE".to_string()),
            keytab_file: Some("/etc/me.keytab".to_string()),
            username: None,
            role: Some("ACE".to_string()),
        });
        let proxy = UplinkProxy::new(cfg);
        proxy.check_network().unwrap();
        let args = proxy.server_args().unwrap();
        assert_eq!(&args[..6], &["-K", "42", "--fswUplinkHost", "localhost", "--fswUplinkPort", "12345"]);
        assert!(args.windows(2).any(|w| w == ["--keytabFile", "/etc/me.keytab"]));
        assert!(args.windows(2).any(|w| w == ["--role", "ACE"]));

        let mut cfg = config(false);
        cfg.session.key = Some("abc".to_string());
        assert!(matches!(
            UplinkProxy::new(cfg).server_args(),
            Err(MtakError::InvalidInitError { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_before_start_is_invalid_state() {
        let proxy = UplinkProxy::new(config(false));
        let err = proxy
            .send_flight_command("NO_OP", &UplinkOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MtakError::InvalidStateError { .. }));
    }

    #[tokio::test]
    async fn test_flight_command_success() {
        let (proxy, server) = attached(config(false), accept_all).await;
        proxy
            .send_flight_command("'NO_OP'", &UplinkOptions::default())
            .await
            .unwrap();
        assert_eq!(proxy.counters().flight_commands_sent, 1);

        proxy.stop().await.unwrap();
        let requests = server.await.unwrap();
        assert_eq!(requests, vec!["CMD,,,,,0,NO_OP;;;".to_string()]);
    }

    #[tokio::test]
    async fn test_nonzero_code_maps_error() {
        let (proxy, _server) = attached(config(false), reject_all).await;
        let err = proxy
            .send_scmf("/tmp/x.scmf", Some(true), 0)
            .await
            .unwrap_err();
        match err {
            MtakError::CommandServiceError { message } => {
                assert!(message.contains("rejected the request"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(proxy.counters().failed_scmfs, 1);
    }

    #[tokio::test]
    async fn test_eof_before_code_is_radiation_error() {
        let mut proxy = UplinkProxy::new(config(false));
        proxy.drain_quiet = Duration::from_millis(50);
        let (writer, _server_input) = duplex(4096);
        let (mut server_output, reader) = duplex(4096);
        server_output
            .write_all(format!("{}\n", READY_LINE).as_bytes())
            .await
            .unwrap();
        proxy.attach(writer, reader).await.unwrap();
        drop(server_output);

        let err = proxy
            .send_raw_data("/tmp/raw.bin", None, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, MtakError::RadiationError { .. }));
        assert_eq!(proxy.counters().failed_raw_datas, 1);
    }

    #[tokio::test]
    async fn test_sse_rules() {
        let (proxy, server) = attached(config(true), accept_all).await;
        let err = proxy
            .send_flight_command("sse:PING", &UplinkOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MtakError::CommandFormatError { .. }));
        assert_eq!(proxy.counters().failed_flight_commands, 1);

        proxy.send_sse_command("PING").await.unwrap();
        assert_eq!(proxy.counters().sse_commands_sent, 1);
        assert!(proxy.summary().contains("Total Successful SSE Commands = 1"));

        proxy.stop().await.unwrap();
        let requests = server.await.unwrap();
        assert_eq!(requests, vec!["CMD,,,,,0,sse:PING;;;".to_string()]);

        let no_sse = UplinkProxy::new(config(false));
        assert!(matches!(
            no_sse.send_sse_command("PING").await,
            Err(MtakError::NotImplemented { .. })
        ));
        assert!(!no_sse.summary().contains("SSE"));
    }

    #[tokio::test]
    async fn test_command_list_counts_lines() {
        let (proxy, _server) = attached(config(true), reject_all).await;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "// list\nCMD_A\nCMD_B // second\n\nsse:PING").unwrap();
        let path = file.path().to_string_lossy().to_string();

        assert!(proxy
            .send_command_list_file(&path, &UplinkOptions::default())
            .await
            .is_err());
        let counters = proxy.counters();
        assert_eq!(counters.failed_flight_commands, 2);
        assert_eq!(counters.failed_sse_commands, 1);
    }

    #[tokio::test]
    async fn test_uplink_rates_skip_socket_connections() {
        let mut cfg = config(false);
        cfg.uplink.connection_type = UplinkConnectionType::Socket;
        let proxy = UplinkProxy::new(cfg);
        proxy.set_uplink_rates(Some(&[1.0])).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_banner_fails_attach() {
        let proxy = UplinkProxy::new(config(false));
        let (writer, _unused) = duplex(64);
        let (mut server, reader) = duplex(256);
        server
            .write_all(b"ERROR Unable to connect to command service\n")
            .await
            .unwrap();
        drop(server);
        let err = proxy.attach(writer, reader).await.unwrap_err();
        match err {
            MtakError::UplinkError { message } => {
                assert!(message.contains("Unable to connect"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dummy_proxy() {
        let proxy = DummyUplinkProxy;
        assert!(matches!(
            proxy.send_log("INFO", "hi").await,
            Err(MtakError::NotImplemented { .. })
        ));
        assert!(proxy.summary().is_empty());
        proxy.stop().await.unwrap();
    }
}
