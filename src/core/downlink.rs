//! Downlink side: the telemetry store fed by the downlink server socket, and
//! the proxy that owns the `chill_mtak_downlink_server` child process.

use crate::config::toml_config::{DownlinkConfig, MtakConfig, WaitConfig};
use crate::core::collection::{summary_string, CfdpIndicationTable, ChannelValueTable, EvrTable, ProductTable};
use crate::core::locate_tool;
use crate::core::wait::{WaitCondition, WaitKind, WaitResult};
use crate::domain::codec;
use crate::domain::model::Telemetry;
use crate::utils::error::{MtakError, Result};
use crate::utils::logger::relay_process_line;
use crate::utils::time::SclkFormat;
use crate::utils::validation::validate_numeric;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DOWNLINK_SERVER_APP: &str = "internal/chill_mtak_downlink_server";
const PORT_SCAN_RANGE: u16 = 100;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-call overrides for [`TelemetryStore::register_sync_wait`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WaitOptions {
    /// Seconds; negative waits forever.
    pub timeout: Option<i64>,
    /// Seconds of received telemetry to search before blocking.
    pub lookback: Option<u64>,
    /// SCLK ticks to wait. Replaces `timeout` when set.
    pub sclk_timeout: Option<f64>,
    /// SCLK ticks to search back. Replaces `lookback` when set.
    pub sclk_lookback: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownlinkCounters {
    pub chan_val: u64,
    pub recorded_chan_val: u64,
    pub evr: u64,
    pub recorded_evr: u64,
    pub product: u64,
    pub cfdp_indication: u64,
}

/// Newest spacecraft and ground times seen on realtime EHA and EVRs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeMarks {
    pub sclk_exact: u64,
    pub scet_exact: i64,
    pub scet_nano: u64,
    pub ert_exact: i64,
}

struct PendingWait {
    id: u64,
    condition: WaitCondition,
    sclk_deadline: Option<u64>,
    notify: Option<oneshot::Sender<()>>,
}

impl PendingWait {
    fn wake(&mut self) {
        if let Some(tx) = self.notify.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum LookbackBound {
    ReceivedSince(DateTime<Utc>),
    SclkSince(u64),
}

/// Identity fields pulled out of a condition so the tables can be searched
/// while the condition itself is being checked.
enum LookbackTarget {
    Channels {
        channel_id: Option<String>,
        name: Option<String>,
        realtime: Option<bool>,
    },
    Evrs {
        event_id: Option<i64>,
        name: Option<String>,
        realtime: Option<bool>,
    },
    Products {
        apid: Option<u32>,
        name: Option<String>,
    },
    CfdpIndications {
        source_entity_id: Option<String>,
        transaction_sequence_number: Option<String>,
        indication_types: Vec<String>,
    },
    Unsupported,
}

impl LookbackTarget {
    fn of(condition: &WaitCondition) -> Self {
        match condition.kind() {
            WaitKind::ChannelValue(w) => LookbackTarget::Channels {
                channel_id: w.channel_id.clone(),
                name: w.name.clone(),
                realtime: w.realtime,
            },
            WaitKind::Evr(w) => LookbackTarget::Evrs {
                event_id: w.event_id,
                name: w.name.clone(),
                realtime: w.realtime,
            },
            WaitKind::Product(w) => LookbackTarget::Products {
                apid: w.apid,
                name: w.name.clone(),
            },
            WaitKind::CfdpIndication(w) => LookbackTarget::CfdpIndications {
                source_entity_id: w.source_entity_id.clone(),
                transaction_sequence_number: w.transaction_sequence_number.clone(),
                indication_types: w.indication_type_list.clone(),
            },
            WaitKind::Compound(_) => LookbackTarget::Unsupported,
        }
    }
}

/// Walk `items` newest first until one falls outside the lookback window.
fn scan_lookback<I>(bound: LookbackBound, condition: &mut WaitCondition, items: I) -> bool
where
    I: IntoIterator<Item = Telemetry>,
{
    for item in items {
        let in_window = match bound {
            LookbackBound::ReceivedSince(since) => item.receive_time().is_some_and(|t| t >= since),
            LookbackBound::SclkSince(since) => item.sclk_exact().is_some_and(|s| s >= since),
        };
        if !in_window {
            info!("No value found during lookback...will wait for new telemetry to arrive");
            return false;
        }
        if condition.check(&item) {
            info!("Wait succeeded (found value during lookback)");
            return true;
        }
    }
    false
}

/// Thread-safe home of everything received on the downlink.
pub struct TelemetryStore {
    sclk: SclkFormat,
    wait_defaults: WaitConfig,
    realtime_channels: Mutex<ChannelValueTable>,
    recorded_channels: Mutex<ChannelValueTable>,
    realtime_evrs: Mutex<EvrTable>,
    recorded_evrs: Mutex<EvrTable>,
    products: Mutex<ProductTable>,
    cfdp_indications: Mutex<CfdpIndicationTable>,
    counters: Mutex<DownlinkCounters>,
    marks: Mutex<TimeMarks>,
    waits: Mutex<Vec<PendingWait>>,
    next_wait_id: AtomicU64,
}

impl TelemetryStore {
    pub fn new(downlink: &DownlinkConfig, wait_defaults: WaitConfig, sclk: SclkFormat) -> Self {
        Self {
            sclk,
            wait_defaults,
            realtime_channels: Mutex::new(ChannelValueTable::new(downlink.channel_list_size)),
            recorded_channels: Mutex::new(ChannelValueTable::new(downlink.channel_list_size)),
            realtime_evrs: Mutex::new(EvrTable::new(downlink.evr_list_size)),
            recorded_evrs: Mutex::new(EvrTable::new(downlink.evr_list_size)),
            products: Mutex::new(ProductTable::new(downlink.product_list_size)),
            cfdp_indications: Mutex::new(CfdpIndicationTable::new(
                downlink.cfdp_indication_list_size,
            )),
            counters: Mutex::new(DownlinkCounters::default()),
            marks: Mutex::new(TimeMarks::default()),
            waits: Mutex::new(Vec::new()),
            next_wait_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &MtakConfig) -> Self {
        Self::new(&config.downlink, config.wait.clone(), config.sclk.clone())
    }

    pub fn sclk_format(&self) -> &SclkFormat {
        &self.sclk
    }

    pub fn realtime_channels(&self) -> MutexGuard<'_, ChannelValueTable> {
        lock(&self.realtime_channels)
    }

    pub fn recorded_channels(&self) -> MutexGuard<'_, ChannelValueTable> {
        lock(&self.recorded_channels)
    }

    pub fn realtime_evrs(&self) -> MutexGuard<'_, EvrTable> {
        lock(&self.realtime_evrs)
    }

    pub fn recorded_evrs(&self) -> MutexGuard<'_, EvrTable> {
        lock(&self.recorded_evrs)
    }

    pub fn products(&self) -> MutexGuard<'_, ProductTable> {
        lock(&self.products)
    }

    pub fn cfdp_indications(&self) -> MutexGuard<'_, CfdpIndicationTable> {
        lock(&self.cfdp_indications)
    }

    pub fn counters(&self) -> DownlinkCounters {
        *lock(&self.counters)
    }

    pub fn time_marks(&self) -> TimeMarks {
        *lock(&self.marks)
    }

    pub fn current_sclk_exact(&self) -> u64 {
        lock(&self.marks).sclk_exact
    }

    /// Number of conditions currently waiting on telemetry.
    pub fn pending_waits(&self) -> usize {
        lock(&self.waits).len()
    }

    /// Zero the counters and time marks. Called when the downlink (re)starts.
    pub fn reset(&self) {
        *lock(&self.counters) = DownlinkCounters::default();
        *lock(&self.marks) = TimeMarks::default();
    }

    /// Store one item, advance the clocks and wake any waits it satisfies.
    pub fn ingest(&self, mut item: Telemetry) {
        item.set_receive_time(Utc::now());

        let mut advances_clock = false;
        match &item {
            Telemetry::ChannelValue(value) => {
                if value.realtime {
                    lock(&self.realtime_channels).insert(value.clone());
                    lock(&self.counters).chan_val += 1;
                    advances_clock = true;
                } else {
                    lock(&self.recorded_channels).insert(value.clone());
                    lock(&self.counters).recorded_chan_val += 1;
                }
            }
            Telemetry::Evr(evr) => {
                if evr.realtime {
                    lock(&self.realtime_evrs).insert(evr.clone());
                    lock(&self.counters).evr += 1;
                    advances_clock = true;
                } else {
                    lock(&self.recorded_evrs).insert(evr.clone());
                    lock(&self.counters).recorded_evr += 1;
                }
            }
            Telemetry::Product(product) => {
                lock(&self.products).insert(product.clone());
                lock(&self.counters).product += 1;
            }
            Telemetry::CfdpIndication(indication) => {
                lock(&self.cfdp_indications).insert(indication.clone());
                lock(&self.counters).cfdp_indication += 1;
            }
        }

        // products and recorded telemetry carry SCLKs that can run backwards
        if advances_clock {
            self.advance_time_marks(&item);
        }
        self.check_waits(&item);
    }

    /// Decode a wire line and ingest it. Unknown prefixes are skipped.
    pub fn ingest_line(&self, line: &str) -> Result<()> {
        if let Some(item) = codec::parse_line(line)? {
            self.ingest(item);
        }
        Ok(())
    }

    fn advance_time_marks(&self, item: &Telemetry) {
        let (sclk, scet, scet_nano, ert) = match item {
            Telemetry::ChannelValue(v) => (v.sclk_exact, v.scet_exact, v.scet_nano, v.ert_exact),
            Telemetry::Evr(e) => (e.sclk_exact, e.scet_exact, e.scet_nano, e.ert_exact),
            _ => return,
        };
        let mut marks = lock(&self.marks);
        marks.sclk_exact = marks.sclk_exact.max(sclk);
        marks.scet_exact = marks.scet_exact.max(scet);
        marks.scet_nano = marks.scet_nano.max(scet_nano);
        marks.ert_exact = marks.ert_exact.max(ert);
    }

    fn check_waits(&self, item: &Telemetry) {
        let current_sclk = self.current_sclk_exact();
        let mut waits = lock(&self.waits);
        for pending in waits.iter_mut() {
            if pending.condition.check(item) {
                pending.wake();
            }
            if pending.sclk_deadline.is_some_and(|deadline| current_sclk >= deadline) {
                pending.wake();
            }
        }
    }

    /// Wake every registered wait so its caller returns with whatever it has.
    pub fn release_waits(&self) {
        for pending in lock(&self.waits).iter_mut() {
            pending.wake();
        }
    }

    /// Block until `condition` is met by telemetry in the lookback window or
    /// by new telemetry, or until the timeout passes.
    ///
    /// Returns `Ok(None)` on timeout.
    pub async fn register_sync_wait(
        &self,
        condition: impl Into<WaitCondition>,
        options: WaitOptions,
    ) -> Result<Option<WaitResult>> {
        let condition = condition.into();
        condition.check_required_settings()?;

        let timeout = match options.sclk_timeout {
            Some(_) => None,
            None => Some(options.timeout.unwrap_or(self.wait_defaults.default_timeout)),
        };
        let lookback = match options.sclk_lookback {
            Some(_) => None,
            None => Some(options.lookback.unwrap_or(self.wait_defaults.default_lookback)),
        };

        let sclk_deadline = options
            .sclk_timeout
            .filter(|ticks| *ticks > 0.0)
            .map(|ticks| self.sclk_after(ticks));

        let (tx, rx) = oneshot::channel();
        let id = self.next_wait_id.fetch_add(1, Ordering::Relaxed);
        let pending = PendingWait {
            id,
            condition,
            sclk_deadline,
            notify: Some(tx),
        };

        if let Some(result) = self.lookback_or_register(pending, lookback, options.sclk_lookback) {
            return Ok(Some(result));
        }

        match timeout {
            Some(seconds) if seconds >= 0 => {
                let limit = Duration::from_secs(seconds as u64);
                if tokio::time::timeout(limit, rx).await.is_err() {
                    debug!(wait_id = id, "Wait timed out after {} seconds", seconds);
                }
            }
            _ => {
                let _ = rx.await;
            }
        }

        let finished = {
            let mut waits = lock(&self.waits);
            waits
                .iter()
                .position(|w| w.id == id)
                .map(|idx| waits.remove(idx))
        };
        Ok(finished.and_then(|w| w.condition.result()))
    }

    /// Search recent telemetry for a match. When nothing matches the wait is
    /// registered before the table locks are released, so no item can arrive
    /// unseen in between.
    fn lookback_or_register(
        &self,
        mut pending: PendingWait,
        lookback: Option<u64>,
        sclk_lookback: Option<f64>,
    ) -> Option<WaitResult> {
        let bound = match (lookback, sclk_lookback) {
            (Some(seconds), _) if seconds > 0 => Some(LookbackBound::ReceivedSince(
                i64::try_from(seconds)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .and_then(|span| Utc::now().checked_sub_signed(span))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
            )),
            (None, Some(ticks)) if ticks > 0.0 => {
                let lower = self
                    .current_sclk_exact()
                    .saturating_sub(self.sclk.from_float(ticks));
                (lower > 0).then_some(LookbackBound::SclkSince(lower))
            }
            _ => None,
        };

        let Some(bound) = bound else {
            lock(&self.waits).push(pending);
            return None;
        };

        match LookbackTarget::of(&pending.condition) {
            LookbackTarget::Channels {
                channel_id,
                name,
                realtime,
            } => {
                let realtime_table = lock(&self.realtime_channels);
                let recorded_table = lock(&self.recorded_channels);
                let pick = |table: &ChannelValueTable| -> Vec<Telemetry> {
                    let values = match (&channel_id, &name) {
                        (Some(id), _) => table.by_id(id),
                        (None, Some(name)) => table.by_name(name),
                        (None, None) => Vec::new(),
                    };
                    values.into_iter().cloned().map(Telemetry::from).collect()
                };

                let mut found = false;
                if realtime != Some(false) {
                    found = scan_lookback(bound, &mut pending.condition, pick(&*realtime_table));
                }
                if !found && realtime != Some(true) {
                    found = scan_lookback(bound, &mut pending.condition, pick(&*recorded_table));
                }
                self.finish_lookback(pending, found)
            }
            LookbackTarget::Evrs {
                event_id,
                name,
                realtime,
            } => {
                let realtime_table = lock(&self.realtime_evrs);
                let recorded_table = lock(&self.recorded_evrs);
                let pick = |table: &EvrTable| -> Vec<Telemetry> {
                    let evrs = match (event_id, &name) {
                        (Some(id), _) => table.by_id(id),
                        (None, Some(name)) => table.by_name(name),
                        (None, None) => Vec::new(),
                    };
                    evrs.into_iter().cloned().map(Telemetry::from).collect()
                };

                let mut found = false;
                if realtime != Some(false) {
                    found = scan_lookback(bound, &mut pending.condition, pick(&*realtime_table));
                }
                if !found && realtime != Some(true) {
                    found = scan_lookback(bound, &mut pending.condition, pick(&*recorded_table));
                }
                self.finish_lookback(pending, found)
            }
            LookbackTarget::Products { apid, name } => {
                let table = lock(&self.products);
                let products = match (apid, &name) {
                    (Some(apid), _) => table.by_apid(apid),
                    (None, Some(name)) => table.by_name(name),
                    (None, None) => Vec::new(),
                };
                let candidates: Vec<Telemetry> =
                    products.into_iter().cloned().map(Telemetry::from).collect();
                let found = scan_lookback(bound, &mut pending.condition, candidates);
                self.finish_lookback(pending, found)
            }
            LookbackTarget::CfdpIndications {
                source_entity_id,
                transaction_sequence_number,
                indication_types,
            } => {
                let table = lock(&self.cfdp_indications);
                let candidates: Vec<Telemetry> = table
                    .filtered(
                        source_entity_id.as_deref(),
                        transaction_sequence_number.as_deref(),
                        &indication_types,
                    )
                    .into_iter()
                    .cloned()
                    .map(Telemetry::from)
                    .collect();
                let found = scan_lookback(bound, &mut pending.condition, candidates);
                self.finish_lookback(pending, found)
            }
            LookbackTarget::Unsupported => {
                lock(&self.waits).push(pending);
                None
            }
        }
    }

    fn finish_lookback(&self, pending: PendingWait, found: bool) -> Option<WaitResult> {
        if found {
            return pending.condition.result();
        }
        lock(&self.waits).push(pending);
        None
    }

    /// Sleep until the SCLK advances `ticks` past its current value.
    pub async fn wait_by_sclk(&self, ticks: f64) {
        if ticks <= 0.0 {
            return;
        }
        self.wait_for_sclk(self.sclk_after(ticks)).await;
    }

    fn sclk_after(&self, ticks: f64) -> u64 {
        self.current_sclk_exact()
            .saturating_add(self.sclk.from_float(ticks))
    }

    /// Sleep until the SCLK reaches `until`.
    pub async fn wait_until_sclk(&self, until: &str) -> Result<()> {
        let end = self.sclk.parse(until)?;
        self.wait_for_sclk(end).await;
        Ok(())
    }

    async fn wait_for_sclk(&self, end: u64) {
        let mut delay = Duration::from_micros(500);
        while self.current_sclk_exact() < end {
            delay = (delay * 2).min(Duration::from_millis(50));
            tokio::time::sleep(delay).await;
        }
    }

    pub fn flush_eha(&self) {
        lock(&self.realtime_channels).clear();
        lock(&self.recorded_channels).clear();
    }

    pub fn flush_evr(&self) {
        lock(&self.realtime_evrs).clear();
        lock(&self.recorded_evrs).clear();
    }

    pub fn flush_dp(&self) {
        lock(&self.products).clear();
    }

    pub fn flush_cfdp_ind(&self) {
        lock(&self.cfdp_indications).clear();
    }

    pub fn flush_all(&self) {
        self.flush_eha();
        self.flush_evr();
        self.flush_dp();
        self.flush_cfdp_ind();
    }

    pub fn summary(&self) -> String {
        let counters = self.counters();
        let unique_realtime = lock(&self.realtime_channels).len();
        let unique_recorded = lock(&self.recorded_channels).len();
        let realtime_levels = summary_string(&lock(&self.realtime_evrs).level_summary(), "");
        let recorded_levels = summary_string(&lock(&self.recorded_evrs).level_summary(), "");
        let apids = summary_string(&lock(&self.products).apid_summary(), "APID ");
        let rule = "-".repeat(28);

        format!(
            "\n{rule}\nEHA Telemetry\n{rule}\n\n\
             Realtime\n=========\n\
             Total Channel Values Received = {}\n\
             Total Unique Channels Updated = {}\n\n\
             Recorded\n=========\n\
             Total Channel Values Received = {}\n\
             Total Unique Channels Updated = {}\n\n\
             {rule}\nEVR Telemetry\n{rule}\n\n\
             Realtime\n=========\n\
             Total EVRs Received = {}\n\
             Level Summary\n\n{}\n\n\
             Recorded\n=========\n\
             Total EVRs Received = {}\n\
             Level Summary\n\n{}\n\n\
             {rule}\nProduct Telemetry\n{rule}\n\
             Total Product Messages Received = {}\n\n\
             APID Summary\n\n{}\n\n\
             {rule}\nCFDP Indications\n{rule}\n\
             Total CFDP Indications Received = {}\n",
            counters.chan_val,
            unique_realtime,
            counters.recorded_chan_val,
            unique_recorded,
            counters.evr,
            realtime_levels,
            counters.recorded_evr,
            recorded_levels,
            counters.product,
            apids,
            counters.cfdp_indication,
            rule = rule,
        )
    }
}

/// Bind a loopback listener on `start`, moving up a port at a time while the
/// address is taken.
pub async fn bind_listener(start: u16) -> Result<(TcpListener, u16)> {
    let mut port = start;
    for _ in 0..PORT_SCAN_RANGE {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                return Ok((listener, bound));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                debug!("Downlink port {} in use, trying {}", port, port.wrapping_add(1));
                port = port.wrapping_add(1).max(1);
            }
            Err(e) => return Err(MtakError::IoError(e)),
        }
    }
    Err(MtakError::DownlinkError {
        message: format!(
            "No free downlink port in {}..{}",
            start,
            start.saturating_add(PORT_SCAN_RANGE)
        ),
    })
}

async fn read_telemetry<R>(store: Arc<TelemetryStore>, reader: R, mut shutdown: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(e) = store.ingest_line(&line) {
                        error!("Error processing the following telemetry item: {}\n{}", line, e);
                    }
                }
                Ok(None) => {
                    error!("MTAK background downlink server died or was killed. Cannot process any more telemetry.");
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    error!("Dropping undecodable telemetry line: {}", e);
                }
                Err(e) => {
                    error!("Background downlink reader stopped: {}", e);
                    break;
                }
            }
        }
    }
}

struct RunningDownlink {
    shutdown: watch::Sender<bool>,
    reader: JoinHandle<()>,
    relay: Option<JoinHandle<()>>,
    child: Option<Child>,
}

/// Owns the downlink server process and the task that reads its socket.
pub struct DownlinkProxy {
    config: MtakConfig,
    store: Arc<TelemetryStore>,
    port: Mutex<u16>,
    running: Mutex<Option<RunningDownlink>>,
}

impl DownlinkProxy {
    pub fn new(config: MtakConfig) -> Self {
        let store = Arc::new(TelemetryStore::from_config(&config));
        let port = config.downlink.port;
        Self {
            config,
            store,
            port: Mutex::new(port),
            running: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    /// Port the proxy listens on (after any increments past busy ports).
    pub fn port(&self) -> u16 {
        *lock(&self.port)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running)
            .as_ref()
            .is_some_and(|r| !r.reader.is_finished())
    }

    /// Arguments for the downlink server process.
    pub fn server_args(&self, port: u16) -> Result<Vec<String>> {
        let key = self.config.session.key.clone().unwrap_or_default();
        validate_numeric("session.key", &key).map_err(|_| MtakError::InvalidInitError {
            message: format!(
                "Cannot start the downlink proxy because the session key \"{}\" is invalid.",
                key
            ),
        })?;

        let mut args = vec!["--testKey".to_string(), key];
        if let Some(db) = &self.config.database {
            if !db.host.trim().is_empty() {
                args.extend(["--databaseHost".to_string(), db.host.clone()]);
            }
            args.extend(["--databasePort".to_string(), db.port.to_string()]);
            if let Some(user) = db.user.as_ref().filter(|u| !u.trim().is_empty()) {
                args.extend(["--dbUser".to_string(), user.clone()]);
            }
            if let Some(password) = db.password.as_ref().filter(|p| !p.trim().is_empty()) {
                args.extend(["--databasePassword".to_string(), password.clone()]);
            }
        }
        if let Some(jms) = &self.config.jms {
            args.extend(["-j".to_string(), jms.host.clone()]);
            args.extend(["-n".to_string(), jms.port.to_string()]);
        }

        let downlink = &self.config.downlink;
        let flags = [
            (downlink.ignore_eha, "--ignoreEha"),
            (downlink.ignore_evrs, "--ignoreEvrs"),
            (downlink.ignore_products, "--ignoreProducts"),
            (downlink.ignore_fsw, "--ignoreFsw"),
            (downlink.ignore_sse, "--ignoreSse"),
            (downlink.ignore_cfdp_indications, "--ignoreCfdpIndications"),
            (downlink.fetch_lad, "--fetchLad"),
        ];
        args.extend(
            flags
                .iter()
                .filter(|(enabled, _)| *enabled)
                .map(|(_, flag)| flag.to_string()),
        );

        let lists = [
            (&downlink.channel_ids, "--channelIds"),
            (&downlink.modules, "--modules"),
            (&downlink.subsystems, "--subsystems"),
            (&downlink.ops_categories, "--opsCategories"),
        ];
        for (values, flag) in lists {
            if !values.is_empty() {
                args.extend([flag.to_string(), values.join(",")]);
            }
        }

        args.extend(["--mtakDownlinkPort".to_string(), port.to_string()]);
        Ok(args)
    }

    /// Spawn the downlink server and start reading telemetry from it.
    /// Resets the counters and time marks.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            warn!("Downlink Proxy has already been started. Make sure you did not call \"start()\" twice.");
            return Ok(());
        }

        let (listener, port) = bind_listener(self.config.downlink.port).await?;
        let args = self.server_args(port)?;
        let program = locate_tool(DOWNLINK_SERVER_APP).map_err(|e| MtakError::DownlinkError {
            message: format!("Error initializing downlink: {}", e),
        })?;

        self.store.reset();
        *lock(&self.port) = port;

        debug!("Running process {} {}", program.display(), args.join(" "));
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!("Could not start the background downlink server app: {}", e);
                MtakError::DownlinkError {
                    message: format!("Error initializing downlink: {}", e),
                }
            })?;

        let relay = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    relay_process_line("chill_mtak_downlink_server", &line);
                }
            })
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let store = Arc::clone(&self.store);
        let accept_timeout = Duration::from_secs(self.config.downlink.accept_timeout_secs);
        let reader = tokio::spawn(async move {
            let mut shutdown_rx = shutdown_rx;
            let accepted = tokio::select! {
                _ = shutdown_rx.changed() => return,
                accepted = tokio::time::timeout(accept_timeout, listener.accept()) => accepted,
            };
            match accepted {
                Ok(Ok((socket, peer))) => {
                    info!("Downlink server connected from {}", peer);
                    read_telemetry(store, socket, shutdown_rx).await;
                }
                Ok(Err(e)) => error!("Downlink accept failed: {}", e),
                Err(_) => error!(
                    "Background MTAK telemetry task could not connect to MTAK downlink server at \"localhost:{}\". Connection timed out.",
                    port
                ),
            }
        });

        *lock(&self.running) = Some(RunningDownlink {
            shutdown,
            reader,
            relay,
            child: Some(child),
        });
        info!("Started MTAK downlink on port {}", port);
        Ok(())
    }

    /// Read telemetry from an already connected stream instead of spawning
    /// the downlink server.
    pub fn start_with_stream<R>(&self, stream: R) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        if self.is_running() {
            return Err(MtakError::InvalidStateError {
                message: "Downlink Proxy is already running".to_string(),
            });
        }
        self.store.reset();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let reader = tokio::spawn(read_telemetry(Arc::clone(&self.store), stream, shutdown_rx));
        *lock(&self.running) = Some(RunningDownlink {
            shutdown,
            reader,
            relay: None,
            child: None,
        });
        Ok(())
    }

    /// Stop reading and kill the downlink server.
    pub async fn stop(&self) -> Result<()> {
        let Some(mut running) = lock(&self.running).take() else {
            warn!("Downlink Proxy is already stopped. Make sure you did not call \"stop()\" twice.");
            return Ok(());
        };

        info!("Waiting for Downlink Proxy background downlink server task to terminate...");
        let _ = running.shutdown.send(true);

        if let Some(child) = running.child.as_mut() {
            if let Err(e) = child.kill().await {
                error!("There was an error while attempting to kill the background downlink server process: {}", e);
            }
        }

        let join_limit = Duration::from_millis(self.config.downlink.polling_timeout_ms * 4);
        if tokio::time::timeout(join_limit, &mut running.reader).await.is_err() {
            warn!("Background downlink server task did not stop in time");
            running.reader.abort();
        }
        if let Some(relay) = running.relay.take() {
            relay.abort();
        }

        info!("MTAK Downlink Proxy shutdown signal has been sent (telemetry has stopped flowing)...");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::wait::{ChanValWait, CompoundWait, EvrWait};
    use crate::domain::model::{ChanVal, ChannelType, Dn, Evr};

    fn store() -> TelemetryStore {
        TelemetryStore::from_config(&MtakConfig::default())
    }

    fn chan(id: &str, dn: i64, sclk: u64, realtime: bool) -> Telemetry {
        Telemetry::ChannelValue(ChanVal {
            channel_id: id.to_string(),
            name: format!("NAME_{}", id),
            channel_type: ChannelType::SignedInt,
            dn: Some(Dn::Int(dn)),
            sclk_exact: sclk,
            scet_exact: 1000,
            ert_exact: 2000,
            realtime,
            ..Default::default()
        })
    }

    fn evr(id: i64, realtime: bool) -> Telemetry {
        Telemetry::Evr(Evr {
            event_id: id,
            name: format!("EVR_{}", id),
            level: "COMMAND".to_string(),
            realtime,
            ..Default::default()
        })
    }

    #[test]
    fn test_ingest_routes_and_counts() {
        let store = store();
        store.ingest(chan("A-0001", 1, 10, true));
        store.ingest(chan("A-0001", 2, 5, false));
        store.ingest(evr(3, true));

        let counters = store.counters();
        assert_eq!(counters.chan_val, 1);
        assert_eq!(counters.recorded_chan_val, 1);
        assert_eq!(counters.evr, 1);
        assert_eq!(store.realtime_channels().count(), 1);
        assert_eq!(store.recorded_channels().count(), 1);
        assert!(store.realtime_channels().by_id("A-0001")[0].receive_time.is_some());
    }

    #[test]
    fn test_recorded_telemetry_does_not_move_clock() {
        let store = store();
        store.ingest(chan("A-0001", 1, 100, true));
        store.ingest(chan("A-0001", 1, 500, false));
        assert_eq!(store.current_sclk_exact(), 100);
        store.ingest(chan("A-0001", 1, 50, true));
        assert_eq!(store.current_sclk_exact(), 100);
        assert_eq!(store.time_marks().ert_exact, 2000);
    }

    #[test]
    fn test_flush_keeps_counters() {
        let store = store();
        store.ingest(chan("A-0001", 1, 10, true));
        store.flush_all();
        assert!(store.realtime_channels().is_empty());
        assert_eq!(store.counters().chan_val, 1);
    }

    #[test]
    fn test_summary_lists_levels() {
        let store = store();
        store.ingest(evr(1, true));
        let summary = store.summary();
        assert!(summary.contains("Total EVRs Received = 1"));
        assert!(summary.contains("COMMAND = 1"));
        assert!(summary.contains("APID Summary\n\nEmpty"));
    }

    #[tokio::test]
    async fn test_wait_times_out_and_deregisters() {
        let store = store();
        let wait = ChanValWait {
            channel_id: Some("A-0001".into()),
            ..Default::default()
        };
        let options = WaitOptions {
            timeout: Some(0),
            ..Default::default()
        };
        let result = store.register_sync_wait(wait, options).await.unwrap();
        assert!(result.is_none());
        assert_eq!(store.pending_waits(), 0);
    }

    #[tokio::test]
    async fn test_wait_rejects_missing_identity() {
        let store = store();
        let err = store
            .register_sync_wait(EvrWait::default(), WaitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MtakError::WaitError { .. }));
    }

    #[tokio::test]
    async fn test_lookback_finds_recent_value() {
        let store = store();
        store.ingest(chan("A-0001", 7, 10, true));

        let wait = ChanValWait {
            channel_id: Some("A-0001".into()),
            dn: Some("7".into()),
            ..Default::default()
        };
        let options = WaitOptions {
            timeout: Some(0),
            lookback: Some(30),
            ..Default::default()
        };
        let result = store.register_sync_wait(wait, options).await.unwrap();
        assert!(matches!(
            result.and_then(WaitResult::into_single),
            Some(Telemetry::ChannelValue(v)) if v.dn == Some(Dn::Int(7))
        ));
        assert_eq!(store.pending_waits(), 0);
    }

    #[tokio::test]
    async fn test_lookback_respects_realtime_filter() {
        let store = store();
        store.ingest(chan("A-0001", 7, 10, false));

        let wait = ChanValWait {
            channel_id: Some("A-0001".into()),
            realtime: Some(true),
            ..Default::default()
        };
        let options = WaitOptions {
            timeout: Some(0),
            lookback: Some(30),
            ..Default::default()
        };
        assert!(store.register_sync_wait(wait, options).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sclk_lookback() {
        let store = store();
        let fmt = SclkFormat::default();
        store.ingest(evr(9, true));
        store.ingest(chan("A-0001", 1, fmt.parse("100").unwrap(), true));

        let wait = EvrWait {
            event_id: Some(9),
            ..Default::default()
        };
        // evr has sclk 0, outside a 10 tick window below 100
        let options = WaitOptions {
            timeout: Some(0),
            sclk_timeout: None,
            sclk_lookback: Some(10.0),
            ..Default::default()
        };
        assert!(store.register_sync_wait(wait.clone(), options).await.unwrap().is_none());

        store.ingest(Telemetry::Evr(Evr {
            event_id: 9,
            sclk_exact: fmt.parse("95").unwrap(),
            realtime: true,
            ..Default::default()
        }));
        let result = store.register_sync_wait(wait, options).await.unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn test_huge_sclk_waits_do_not_wrap() {
        let store = store();
        let fmt = SclkFormat::default();
        store.ingest(chan("A-0001", 1, fmt.parse("100").unwrap(), true));

        let sleeping = tokio::time::timeout(Duration::from_millis(50), store.wait_by_sclk(1.0e15)).await;
        assert!(sleeping.is_err());

        let options = WaitOptions {
            timeout: Some(0),
            lookback: Some(u64::MAX),
            ..Default::default()
        };
        let wait = ChanValWait {
            channel_id: Some("A-0001".to_string()),
            ..Default::default()
        };
        assert!(store.register_sync_wait(wait, options).await.unwrap().is_some());

        assert!(matches!(
            store.wait_until_sclk("1000000000000000").await,
            Err(MtakError::TimeFormatError { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_is_woken_by_new_telemetry() {
        let store = Arc::new(store());
        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let wait = EvrWait {
                    name: Some("EVR_42".into()),
                    ..Default::default()
                };
                let options = WaitOptions {
                    timeout: Some(5),
                    ..Default::default()
                };
                store.register_sync_wait(wait, options).await
            })
        };

        while store.pending_waits() == 0 {
            tokio::task::yield_now().await;
        }
        store.ingest(evr(41, true));
        store.ingest(evr(42, true));

        let result = waiter.await.unwrap().unwrap();
        assert!(matches!(
            result.and_then(WaitResult::into_single),
            Some(Telemetry::Evr(e)) if e.event_id == 42
        ));
    }

    #[tokio::test]
    async fn test_sclk_timeout_releases_wait() {
        let store = Arc::new(store());
        let fmt = SclkFormat::default();
        store.ingest(chan("A-0001", 1, fmt.parse("100").unwrap(), true));

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let wait = EvrWait {
                    event_id: Some(1),
                    ..Default::default()
                };
                let options = WaitOptions {
                    sclk_timeout: Some(5.0),
                    ..Default::default()
                };
                store.register_sync_wait(wait, options).await
            })
        };

        while store.pending_waits() == 0 {
            tokio::task::yield_now().await;
        }
        store.ingest(chan("A-0001", 1, fmt.parse("106").unwrap(), true));
        assert!(waiter.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compound_wait_skips_lookback() {
        let store = Arc::new(store());
        store.ingest(evr(1, true));

        let compound = CompoundWait::or(vec![EvrWait {
            event_id: Some(1),
            ..Default::default()
        }
        .into()]);
        let options = WaitOptions {
            timeout: Some(0),
            lookback: Some(30),
            ..Default::default()
        };
        assert!(store.register_sync_wait(compound, options).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wait_by_sclk_returns_once_clock_advances() {
        let store = Arc::new(store());
        let fmt = SclkFormat::default();
        store.ingest(chan("A-0001", 1, fmt.parse("10").unwrap(), true));

        let sleeper = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.wait_by_sclk(2.0).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!sleeper.is_finished());
        store.ingest(chan("A-0001", 1, fmt.parse("12").unwrap(), true));
        tokio::time::timeout(Duration::from_secs(2), sleeper)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_listener_skips_busy_port() {
        let (first, port) = bind_listener(0).await.unwrap();
        let (_second, next) = bind_listener(port).await.unwrap();
        assert_ne!(port, next);
        drop(first);
    }

    #[test]
    fn test_server_args_require_numeric_key() {
        let proxy = DownlinkProxy::new(MtakConfig::default());
        assert!(matches!(
            proxy.server_args(60001),
            Err(MtakError::InvalidInitError { .. })
        ));

        let mut config = MtakConfig::default();
        config.session.key = Some("42".into());
        config.downlink.ignore_eha = true;
        config.downlink.channel_ids = vec!["A-0001".into(), "A-0002".into()];
        let proxy = DownlinkProxy::new(config);
        let args = proxy.server_args(60005).unwrap();
        assert_eq!(&args[..2], &["--testKey".to_string(), "42".to_string()]);
        assert!(args.contains(&"--ignoreEha".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "--channelIds" && w[1] == "A-0001,A-0002"));
        assert_eq!(args[args.len() - 1], "60005");
    }
}
