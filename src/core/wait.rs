//! Wait conditions checked against incoming telemetry.
//!
//! A condition only compares the fields that were set on it, ANDing them all.
//! Once a condition is met it stays met and keeps the item that met it.

use crate::domain::model::{ChanVal, CfdpIndication, Dn, Evr, Product, ProductStatus, Telemetry, TelemetryKind};
use crate::utils::error::{MtakError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChanValWait {
    pub channel_id: Option<String>,
    pub name: Option<String>,
    /// Raw DN values, converted with the channel's type on first match.
    pub dn: Option<String>,
    pub dn_start: Option<String>,
    pub dn_end: Option<String>,
    pub eu: Option<f64>,
    pub eu_start: Option<f64>,
    pub eu_end: Option<f64>,
    pub ert_exact_start: Option<i64>,
    pub ert_exact_end: Option<i64>,
    pub scet_exact_start: Option<i64>,
    pub scet_exact_end: Option<i64>,
    pub sclk_exact_start: Option<u64>,
    pub sclk_exact_end: Option<u64>,
    pub realtime: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvrWait {
    pub event_id: Option<i64>,
    pub name: Option<String>,
    pub level: Option<String>,
    pub module: Option<String>,
    pub message: Option<String>,
    pub message_substr: Option<String>,
    pub ert_exact_start: Option<i64>,
    pub ert_exact_end: Option<i64>,
    pub scet_exact_start: Option<i64>,
    pub scet_exact_end: Option<i64>,
    pub sclk_exact_start: Option<u64>,
    pub sclk_exact_end: Option<u64>,
    pub realtime: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductWait {
    pub apid: Option<u32>,
    pub name: Option<String>,
    pub transaction_id: Option<String>,
    pub status: Option<ProductStatus>,
    pub dvt_scet_exact_start: Option<i64>,
    pub dvt_scet_exact_end: Option<i64>,
    pub dvt_sclk_exact_start: Option<u64>,
    pub dvt_sclk_exact_end: Option<u64>,
    pub ert_exact_start: Option<i64>,
    pub ert_exact_end: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CfdpIndicationWait {
    /// Empty matches every indication type.
    pub indication_type_list: Vec<String>,
    pub source_entity_id: Option<String>,
    pub transaction_sequence_number: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WaitOperator {
    And,
    #[default]
    Or,
}

impl std::str::FromStr for WaitOperator {
    type Err = MtakError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("and") {
            Ok(WaitOperator::And)
        } else {
            Ok(WaitOperator::Or)
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompoundWait {
    pub operator: WaitOperator,
    pub conditions: Vec<WaitCondition>,
}

impl CompoundWait {
    pub fn and(conditions: Vec<WaitCondition>) -> Self {
        Self {
            operator: WaitOperator::And,
            conditions,
        }
    }

    pub fn or(conditions: Vec<WaitCondition>) -> Self {
        Self {
            operator: WaitOperator::Or,
            conditions,
        }
    }
}

#[derive(Debug, Clone)]
pub enum WaitKind {
    ChannelValue(ChanValWait),
    Evr(EvrWait),
    Product(ProductWait),
    CfdpIndication(CfdpIndicationWait),
    Compound(CompoundWait),
}

/// What a met condition hands back to the waiter.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitResult {
    Single(Telemetry),
    Compound(Vec<Telemetry>),
}

impl WaitResult {
    pub fn items(&self) -> Vec<&Telemetry> {
        match self {
            WaitResult::Single(item) => vec![item],
            WaitResult::Compound(items) => items.iter().collect(),
        }
    }

    pub fn into_single(self) -> Option<Telemetry> {
        match self {
            WaitResult::Single(item) => Some(item),
            WaitResult::Compound(mut items) => {
                if items.is_empty() {
                    None
                } else {
                    Some(items.remove(0))
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct FormattedDn {
    dn: Option<Dn>,
    start: Option<Dn>,
    end: Option<Dn>,
    invalid: bool,
}

/// A registered condition plus its sticky match state.
#[derive(Debug, Clone)]
pub struct WaitCondition {
    kind: WaitKind,
    matched: Option<Telemetry>,
    met: bool,
    formatted: Option<FormattedDn>,
}

impl From<WaitKind> for WaitCondition {
    fn from(kind: WaitKind) -> Self {
        Self {
            kind,
            matched: None,
            met: false,
            formatted: None,
        }
    }
}

impl From<ChanValWait> for WaitCondition {
    fn from(wait: ChanValWait) -> Self {
        WaitKind::ChannelValue(wait).into()
    }
}

impl From<EvrWait> for WaitCondition {
    fn from(wait: EvrWait) -> Self {
        WaitKind::Evr(wait).into()
    }
}

impl From<ProductWait> for WaitCondition {
    fn from(wait: ProductWait) -> Self {
        WaitKind::Product(wait).into()
    }
}

impl From<CfdpIndicationWait> for WaitCondition {
    fn from(wait: CfdpIndicationWait) -> Self {
        WaitKind::CfdpIndication(wait).into()
    }
}

impl From<CompoundWait> for WaitCondition {
    fn from(wait: CompoundWait) -> Self {
        WaitKind::Compound(wait).into()
    }
}

impl WaitCondition {
    pub fn kind(&self) -> &WaitKind {
        &self.kind
    }

    /// The telemetry type this condition listens for; `None` for compounds.
    pub fn telemetry_kind(&self) -> Option<TelemetryKind> {
        match &self.kind {
            WaitKind::ChannelValue(_) => Some(TelemetryKind::ChannelValue),
            WaitKind::Evr(_) => Some(TelemetryKind::Evr),
            WaitKind::Product(_) => Some(TelemetryKind::Product),
            WaitKind::CfdpIndication(_) => Some(TelemetryKind::CfdpIndication),
            WaitKind::Compound(_) => None,
        }
    }

    pub fn check_required_settings(&self) -> Result<()> {
        let missing = match &self.kind {
            WaitKind::ChannelValue(w) if w.channel_id.is_none() && w.name.is_none() => {
                "A channel value wait condition must either specify a channel ID or channel name."
            }
            WaitKind::Evr(w) if w.event_id.is_none() && w.name.is_none() => {
                "An EVR wait condition must either specify an event ID or EVR name."
            }
            WaitKind::Product(w) if w.apid.is_none() && w.name.is_none() => {
                "A product wait condition must either specify an APID or product name."
            }
            WaitKind::Compound(c) => {
                return c
                    .conditions
                    .iter()
                    .try_for_each(WaitCondition::check_required_settings)
            }
            _ => return Ok(()),
        };
        Err(MtakError::WaitError {
            message: missing.to_string(),
        })
    }

    /// `Some(true)` scans realtime telemetry only, `Some(false)` recorded only,
    /// `None` both.
    pub fn realtime_filter(&self) -> Option<bool> {
        match &self.kind {
            WaitKind::ChannelValue(w) => w.realtime,
            WaitKind::Evr(w) => w.realtime,
            _ => None,
        }
    }

    pub fn is_met(&self) -> bool {
        self.met
    }

    /// Test one item. Sticky: a met condition keeps returning true.
    pub fn check(&mut self, item: &Telemetry) -> bool {
        if self.met {
            return true;
        }

        let met = match &mut self.kind {
            WaitKind::Compound(compound) => {
                let mut any = false;
                let mut all = true;
                // every child sees the item so each can latch its own match
                for child in compound.conditions.iter_mut() {
                    if child.check(item) {
                        any = true;
                    } else {
                        all = false;
                    }
                }
                match compound.operator {
                    WaitOperator::Or => any,
                    WaitOperator::And => all,
                }
            }
            WaitKind::ChannelValue(wait) => match item {
                Telemetry::ChannelValue(value) => {
                    chan_val_matches(wait, &mut self.formatted, value)
                }
                _ => false,
            },
            WaitKind::Evr(wait) => matches!(item, Telemetry::Evr(evr) if evr_matches(wait, evr)),
            WaitKind::Product(wait) => {
                matches!(item, Telemetry::Product(product) if product_matches(wait, product))
            }
            WaitKind::CfdpIndication(wait) => {
                matches!(item, Telemetry::CfdpIndication(ind) if cfdp_matches(wait, ind))
            }
        };

        if met {
            self.met = true;
            if !matches!(self.kind, WaitKind::Compound(_)) {
                self.matched = Some(item.clone());
            }
        }
        met
    }

    pub fn result(&self) -> Option<WaitResult> {
        if !self.met {
            return None;
        }
        match &self.kind {
            WaitKind::Compound(compound) => {
                let mut items: Vec<Telemetry> = Vec::new();
                for child in &compound.conditions {
                    if let Some(result) = child.result() {
                        for item in result.items() {
                            if !items.contains(item) {
                                items.push(item.clone());
                            }
                        }
                    }
                }
                Some(WaitResult::Compound(items))
            }
            _ => self.matched.clone().map(WaitResult::Single),
        }
    }
}

fn eq<T: PartialEq>(target: &Option<T>, value: &T) -> bool {
    target.as_ref().map_or(true, |t| t == value)
}

fn at_least<T: PartialOrd>(start: &Option<T>, value: &T) -> bool {
    start.as_ref().map_or(true, |s| {
        matches!(value.partial_cmp(s), Some(Ordering::Greater | Ordering::Equal))
    })
}

fn at_most<T: PartialOrd>(end: &Option<T>, value: &T) -> bool {
    end.as_ref().map_or(true, |e| {
        matches!(value.partial_cmp(e), Some(Ordering::Less | Ordering::Equal))
    })
}

fn within<T: PartialOrd>(start: &Option<T>, end: &Option<T>, value: &T) -> bool {
    at_least(start, value) && at_most(end, value)
}

/// Identity check: the id when set, otherwise the name.
fn identity<I: PartialEq>(id: &Option<I>, name: &Option<String>, value_id: &I, value_name: &str) -> bool {
    match (id, name) {
        (Some(id), _) => id == value_id,
        (None, Some(name)) => name == value_name,
        (None, None) => true,
    }
}

fn format_dn(formatted: &mut Option<FormattedDn>, wait: &ChanValWait, value: &ChanVal) -> FormattedDn {
    if let Some(existing) = formatted {
        return existing.clone();
    }

    let mut result = FormattedDn::default();
    let mut convert = |raw: &Option<String>| -> Option<Dn> {
        let raw = raw.as_ref()?;
        match Dn::format(value.channel_type, raw) {
            Ok(dn) => Some(dn),
            Err(e) => {
                warn!(channel_id = %value.channel_id, "Wait condition DN is unusable: {}", e);
                result.invalid = true;
                None
            }
        }
    };
    let dn = convert(&wait.dn);
    let start = convert(&wait.dn_start);
    let end = convert(&wait.dn_end);
    result.dn = dn;
    result.start = start;
    result.end = end;

    *formatted = Some(result.clone());
    result
}

fn chan_val_matches(wait: &ChanValWait, formatted: &mut Option<FormattedDn>, value: &ChanVal) -> bool {
    if !identity(&wait.channel_id, &wait.name, &value.channel_id, &value.name) {
        return false;
    }

    let dn = format_dn(formatted, wait, value);
    if dn.invalid {
        return false;
    }

    let dn_ok = match &value.dn {
        Some(actual) => eq(&dn.dn, actual) && within(&dn.start, &dn.end, actual),
        None => dn.dn.is_none() && dn.start.is_none() && dn.end.is_none(),
    };
    let eu_ok = match value.eu {
        Some(actual) => eq(&wait.eu, &actual) && within(&wait.eu_start, &wait.eu_end, &actual),
        None => wait.eu.is_none() && wait.eu_start.is_none() && wait.eu_end.is_none(),
    };

    dn_ok
        && eu_ok
        && within(&wait.ert_exact_start, &wait.ert_exact_end, &value.ert_exact)
        && within(&wait.scet_exact_start, &wait.scet_exact_end, &value.scet_exact)
        && within(&wait.sclk_exact_start, &wait.sclk_exact_end, &value.sclk_exact)
        && eq(&wait.realtime, &value.realtime)
}

fn evr_matches(wait: &EvrWait, evr: &Evr) -> bool {
    identity(&wait.event_id, &wait.name, &evr.event_id, &evr.name)
        && eq(&wait.level, &evr.level)
        && eq(&wait.module, &evr.module)
        && eq(&wait.message, &evr.message)
        && wait
            .message_substr
            .as_ref()
            .map_or(true, |s| evr.message.contains(s.as_str()))
        && within(&wait.ert_exact_start, &wait.ert_exact_end, &evr.ert_exact)
        && within(&wait.scet_exact_start, &wait.scet_exact_end, &evr.scet_exact)
        && within(&wait.sclk_exact_start, &wait.sclk_exact_end, &evr.sclk_exact)
        && eq(&wait.realtime, &evr.realtime)
}

fn product_matches(wait: &ProductWait, product: &Product) -> bool {
    identity(&wait.apid, &wait.name, &product.apid, &product.name)
        && eq(&wait.transaction_id, &product.transaction_id)
        && eq(&wait.status, &product.status)
        && within(&wait.dvt_scet_exact_start, &wait.dvt_scet_exact_end, &product.dvt_scet_exact)
        && within(&wait.dvt_sclk_exact_start, &wait.dvt_sclk_exact_end, &product.dvt_sclk_exact)
        && within(&wait.ert_exact_start, &wait.ert_exact_end, &product.ert_exact)
}

fn cfdp_matches(wait: &CfdpIndicationWait, indication: &CfdpIndication) -> bool {
    (wait.indication_type_list.is_empty()
        || wait
            .indication_type_list
            .iter()
            .any(|t| t == &indication.indication_type))
        && eq(&wait.source_entity_id, &indication.source_entity_id)
        && eq(
            &wait.transaction_sequence_number,
            &indication.transaction_sequence_number,
        )
}
