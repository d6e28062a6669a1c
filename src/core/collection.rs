//! Bounded lookup tables for received telemetry.
//!
//! Every table maps a key to a deque of items, newest first. Pushing past the
//! configured bound drops the oldest item for that key. Tables do no locking
//! of their own; the downlink store owns one mutex per table.

use crate::domain::model::{transaction_key, CfdpIndication, ChanVal, ChannelType, Evr, Product, ProductStatus};
use crate::utils::error::Result;
use crate::utils::time;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;

/// A ground time bound: milliseconds since the epoch plus the sub-millisecond
/// digits carried by SCET.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroundTime {
    pub ms: i64,
    pub nanos: u64,
}

impl GroundTime {
    pub fn parse(value: &str) -> Result<Self> {
        Ok(Self {
            ms: time::parse_time_string(value)?,
            nanos: time::time_string_nanos(value),
        })
    }
}

impl From<i64> for GroundTime {
    fn from(ms: i64) -> Self {
        Self { ms, nanos: 0 }
    }
}

/// Inclusive range test. On an endpoint tie the nano field decides, when the
/// item carries one.
pub(crate) fn in_range<T: PartialOrd + Copy>(
    value: T,
    nanos: Option<u64>,
    start: Option<(T, u64)>,
    end: Option<(T, u64)>,
) -> bool {
    let after_start = match start {
        None => true,
        Some((s, s_nanos)) => value > s || (value == s && nanos.map_or(true, |n| n >= s_nanos)),
    };
    let before_end = match end {
        None => true,
        Some((e, e_nanos)) => value < e || (value == e && nanos.map_or(true, |n| n <= e_nanos)),
    };
    after_start && before_end
}

fn ground(bound: Option<GroundTime>) -> Option<(i64, u64)> {
    bound.map(|b| (b.ms, b.nanos))
}

fn ticks(bound: Option<u64>) -> Option<(u64, u64)> {
    bound.map(|b| (b, 0))
}

/// Key -> newest-first bounded history.
#[derive(Debug, Clone)]
struct History<K, T> {
    max_len: usize,
    entries: HashMap<K, VecDeque<T>>,
}

impl<K: Eq + Hash + Clone + Ord, T> History<K, T> {
    fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            entries: HashMap::new(),
        }
    }

    fn push(&mut self, key: K, item: T) {
        let list = self.entries.entry(key).or_default();
        list.push_front(item);
        list.truncate(self.max_len);
    }

    fn get(&self, key: &K) -> impl Iterator<Item = &T> {
        self.entries.get(key).into_iter().flatten()
    }

    fn keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.values().flatten()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn count(&self) -> usize {
        self.entries.values().map(VecDeque::len).sum()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug, Clone)]
pub struct ChannelValueTable {
    history: History<String, ChanVal>,
    names: HashMap<String, String>,
}

impl ChannelValueTable {
    pub fn new(max_len: usize) -> Self {
        Self {
            history: History::new(max_len),
            names: HashMap::new(),
        }
    }

    pub fn insert(&mut self, value: ChanVal) {
        if !value.name.is_empty() {
            self.names
                .entry(value.name.clone())
                .or_insert_with(|| value.channel_id.clone());
        }
        self.history.push(value.channel_id.clone(), value);
    }

    pub fn ids(&self) -> Vec<String> {
        self.history.keys()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn by_id(&self, channel_id: &str) -> Vec<&ChanVal> {
        self.history.get(&channel_id.to_string()).collect()
    }

    pub fn by_name(&self, name: &str) -> Vec<&ChanVal> {
        match self.names.get(name) {
            Some(id) => self.by_id(id),
            None => Vec::new(),
        }
    }

    /// Newest value for a channel id, or for a name when no id is given.
    pub fn latest(&self, channel_id: Option<&str>, name: Option<&str>) -> Option<&ChanVal> {
        match (channel_id, name) {
            (Some(id), _) => self.by_id(id).into_iter().next(),
            (None, Some(name)) => self.by_name(name).into_iter().next(),
            (None, None) => None,
        }
    }

    /// Every value of every channel whose newest value has this type.
    pub fn by_type(&self, channel_type: ChannelType) -> Vec<&ChanVal> {
        self.history
            .entries
            .values()
            .filter(|list| list.front().map(|v| v.channel_type) == Some(channel_type))
            .flatten()
            .collect()
    }

    pub fn by_ert_range(&self, start: Option<GroundTime>, end: Option<GroundTime>) -> Vec<&ChanVal> {
        self.history
            .iter()
            .filter(|v| in_range(v.ert_exact, None, ground(start), ground(end)))
            .collect()
    }

    pub fn by_scet_range(&self, start: Option<GroundTime>, end: Option<GroundTime>) -> Vec<&ChanVal> {
        self.history
            .iter()
            .filter(|v| in_range(v.scet_exact, Some(v.scet_nano), ground(start), ground(end)))
            .collect()
    }

    pub fn by_sclk_range(&self, start: Option<u64>, end: Option<u64>) -> Vec<&ChanVal> {
        self.history
            .iter()
            .filter(|v| in_range(v.sclk_exact, None, ticks(start), ticks(end)))
            .collect()
    }

    /// Number of distinct channels.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.len() == 0
    }

    pub fn count(&self) -> usize {
        self.history.count()
    }

    pub fn to_list(&self) -> Vec<&ChanVal> {
        self.history.iter().collect()
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.names.clear();
    }
}

/// Filter used by [`EvrTable::by_attributes`]. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvrQuery {
    pub name: Option<String>,
    pub event_id: Option<i64>,
    pub level: Option<String>,
    pub module: Option<String>,
    pub ert_start: Option<i64>,
    pub ert_end: Option<i64>,
    pub scet_start: Option<i64>,
    pub scet_end: Option<i64>,
    pub sclk_start: Option<u64>,
    pub sclk_end: Option<u64>,
    pub message: Option<String>,
    pub message_substr: Option<String>,
}

impl EvrQuery {
    fn matches(&self, evr: &Evr) -> bool {
        if let Some(level) = &self.level {
            if !evr.level.eq_ignore_ascii_case(level) {
                return false;
            }
        }
        if let Some(module) = &self.module {
            if &evr.module != module {
                return false;
            }
        }
        if !in_range(evr.ert_exact, None, self.ert_start.map(|s| (s, 0)), self.ert_end.map(|e| (e, 0))) {
            return false;
        }
        if !in_range(
            evr.scet_exact,
            None,
            self.scet_start.map(|s| (s, 0)),
            self.scet_end.map(|e| (e, 0)),
        ) {
            return false;
        }
        if !in_range(evr.sclk_exact, None, ticks(self.sclk_start), ticks(self.sclk_end)) {
            return false;
        }
        if let Some(message) = &self.message {
            if &evr.message != message {
                return false;
            }
        }
        if let Some(substr) = &self.message_substr {
            if !evr.message.contains(substr.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct EvrTable {
    history: History<i64, Evr>,
    names: HashMap<String, i64>,
}

impl EvrTable {
    pub fn new(max_len: usize) -> Self {
        Self {
            history: History::new(max_len),
            names: HashMap::new(),
        }
    }

    pub fn insert(&mut self, evr: Evr) {
        if !evr.name.is_empty() {
            self.names.entry(evr.name.clone()).or_insert(evr.event_id);
        }
        self.history.push(evr.event_id, evr);
    }

    pub fn event_ids(&self) -> Vec<i64> {
        self.history.keys()
    }

    pub fn by_id(&self, event_id: i64) -> Vec<&Evr> {
        self.history.get(&event_id).collect()
    }

    pub fn by_name(&self, name: &str) -> Vec<&Evr> {
        match self.names.get(name) {
            Some(id) => self.by_id(*id),
            None => Vec::new(),
        }
    }

    pub fn by_level(&self, level: &str) -> Vec<&Evr> {
        self.filter(|e| e.level.eq_ignore_ascii_case(level))
    }

    pub fn by_module(&self, module: &str) -> Vec<&Evr> {
        self.filter(|e| e.module == module)
    }

    pub fn from_sse(&self) -> Vec<&Evr> {
        self.filter(|e| e.from_sse)
    }

    pub fn from_fsw(&self) -> Vec<&Evr> {
        self.filter(|e| !e.from_sse)
    }

    pub fn realtime(&self) -> Vec<&Evr> {
        self.filter(|e| e.realtime)
    }

    pub fn recorded(&self) -> Vec<&Evr> {
        self.filter(|e| !e.realtime)
    }

    pub fn by_ert_range(&self, start: Option<GroundTime>, end: Option<GroundTime>) -> Vec<&Evr> {
        self.filter(|e| in_range(e.ert_exact, None, ground(start), ground(end)))
    }

    pub fn by_scet_range(&self, start: Option<GroundTime>, end: Option<GroundTime>) -> Vec<&Evr> {
        self.filter(|e| in_range(e.scet_exact, Some(e.scet_nano), ground(start), ground(end)))
    }

    pub fn by_sclk_range(&self, start: Option<u64>, end: Option<u64>) -> Vec<&Evr> {
        self.filter(|e| in_range(e.sclk_exact, None, ticks(start), ticks(end)))
    }

    /// Look up by name or event id first, then narrow by the remaining fields.
    /// A name and id that point at different EVRs match nothing.
    pub fn by_attributes(&self, query: &EvrQuery) -> Vec<&Evr> {
        let event_id = match (&query.name, query.event_id) {
            (Some(name), Some(id)) => match self.names.get(name) {
                Some(mapped) if *mapped != id => return Vec::new(),
                _ => Some(id),
            },
            (Some(name), None) => match self.names.get(name) {
                Some(mapped) => Some(*mapped),
                None => return Vec::new(),
            },
            (None, id) => id,
        };

        let candidates = match event_id {
            Some(id) => self.by_id(id),
            None => self.to_list(),
        };

        candidates.into_iter().filter(|e| query.matches(e)).collect()
    }

    /// EVR counts per level.
    pub fn level_summary(&self) -> BTreeMap<String, usize> {
        let mut summary = BTreeMap::new();
        for evr in self.history.iter() {
            *summary.entry(evr.level.clone()).or_insert(0) += 1;
        }
        summary
    }

    pub fn module_summary(&self) -> BTreeMap<String, usize> {
        let mut summary = BTreeMap::new();
        for evr in self.history.iter() {
            *summary.entry(evr.module.clone()).or_insert(0) += 1;
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.len() == 0
    }

    pub fn count(&self) -> usize {
        self.history.count()
    }

    pub fn to_list(&self) -> Vec<&Evr> {
        self.history.iter().collect()
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.names.clear();
    }

    fn filter<F: Fn(&Evr) -> bool>(&self, predicate: F) -> Vec<&Evr> {
        self.history.iter().filter(|e| predicate(e)).collect()
    }
}

/// Filter used by [`ProductTable::by_attributes`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductQuery {
    pub name: Option<String>,
    pub apid: Option<u32>,
    pub transaction_id: Option<String>,
    pub status: Option<ProductStatus>,
    pub ert_start: Option<i64>,
    pub ert_end: Option<i64>,
    pub dvt_scet_start: Option<i64>,
    pub dvt_scet_end: Option<i64>,
    pub dvt_sclk_start: Option<u64>,
    pub dvt_sclk_end: Option<u64>,
}

impl ProductQuery {
    fn matches(&self, product: &Product) -> bool {
        self.name.as_ref().map_or(true, |n| &product.name == n)
            && self.apid.map_or(true, |a| product.apid == a)
            && self
                .transaction_id
                .as_ref()
                .map_or(true, |t| &product.transaction_id == t)
            && self.status.map_or(true, |s| product.status == s)
            && in_range(
                product.ert_exact,
                None,
                self.ert_start.map(|s| (s, 0)),
                self.ert_end.map(|e| (e, 0)),
            )
            && in_range(
                product.dvt_scet_exact,
                None,
                self.dvt_scet_start.map(|s| (s, 0)),
                self.dvt_scet_end.map(|e| (e, 0)),
            )
            && in_range(
                product.dvt_sclk_exact,
                None,
                ticks(self.dvt_sclk_start),
                ticks(self.dvt_sclk_end),
            )
    }
}

#[derive(Debug, Clone)]
pub struct ProductTable {
    history: History<u32, Product>,
}

impl ProductTable {
    pub fn new(max_len: usize) -> Self {
        Self {
            history: History::new(max_len),
        }
    }

    pub fn insert(&mut self, product: Product) {
        self.history.push(product.apid, product);
    }

    pub fn apids(&self) -> Vec<u32> {
        self.history.keys()
    }

    pub fn by_apid(&self, apid: u32) -> Vec<&Product> {
        self.history.get(&apid).collect()
    }

    pub fn by_name(&self, name: &str) -> Vec<&Product> {
        self.filter(|p| p.name == name)
    }

    pub fn by_status(&self, status: ProductStatus) -> Vec<&Product> {
        self.filter(|p| p.status == status)
    }

    pub fn by_transaction_id(&self, transaction_id: &str) -> Vec<&Product> {
        self.filter(|p| p.transaction_id == transaction_id)
    }

    pub fn by_ert_range(&self, start: Option<GroundTime>, end: Option<GroundTime>) -> Vec<&Product> {
        self.filter(|p| in_range(p.ert_exact, None, ground(start), ground(end)))
    }

    pub fn by_dvt_scet_range(&self, start: Option<GroundTime>, end: Option<GroundTime>) -> Vec<&Product> {
        self.filter(|p| in_range(p.dvt_scet_exact, None, ground(start), ground(end)))
    }

    pub fn by_dvt_sclk_range(&self, start: Option<u64>, end: Option<u64>) -> Vec<&Product> {
        self.filter(|p| in_range(p.dvt_sclk_exact, None, ticks(start), ticks(end)))
    }

    pub fn by_attributes(&self, query: &ProductQuery) -> Vec<&Product> {
        let candidates = match query.apid {
            Some(apid) => self.by_apid(apid),
            None => self.to_list(),
        };
        candidates.into_iter().filter(|p| query.matches(p)).collect()
    }

    /// Product counts per APID.
    pub fn apid_summary(&self) -> BTreeMap<u32, usize> {
        self.history
            .entries
            .iter()
            .map(|(apid, list)| (*apid, list.len()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.len() == 0
    }

    pub fn count(&self) -> usize {
        self.history.count()
    }

    pub fn to_list(&self) -> Vec<&Product> {
        self.history.iter().collect()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    fn filter<F: Fn(&Product) -> bool>(&self, predicate: F) -> Vec<&Product> {
        self.history.iter().filter(|p| predicate(p)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct CfdpIndicationTable {
    history: History<String, CfdpIndication>,
}

impl CfdpIndicationTable {
    pub fn new(max_len: usize) -> Self {
        Self {
            history: History::new(max_len),
        }
    }

    pub fn insert(&mut self, indication: CfdpIndication) {
        self.history.push(indication.transaction_id(), indication);
    }

    pub fn transaction_ids(&self) -> Vec<String> {
        self.history.keys()
    }

    pub fn by_transaction_id(
        &self,
        source_entity_id: &str,
        transaction_sequence_number: &str,
    ) -> Vec<&CfdpIndication> {
        self.history
            .get(&transaction_key(source_entity_id, transaction_sequence_number))
            .collect()
    }

    /// Indications for a source entity and/or sequence number, optionally
    /// restricted to a set of indication types.
    pub fn filtered(
        &self,
        source_entity_id: Option<&str>,
        transaction_sequence_number: Option<&str>,
        indication_types: &[String],
    ) -> Vec<&CfdpIndication> {
        let candidates = match (source_entity_id, transaction_sequence_number) {
            (Some(src), Some(seq)) => self.by_transaction_id(src, seq),
            (Some(src), None) => self
                .history
                .iter()
                .filter(|i| i.source_entity_id == src)
                .collect(),
            (None, Some(seq)) => self
                .history
                .iter()
                .filter(|i| i.transaction_sequence_number == seq)
                .collect(),
            (None, None) => self.to_list(),
        };

        if indication_types.is_empty() {
            return candidates;
        }
        candidates
            .into_iter()
            .filter(|i| indication_types.iter().any(|t| t == &i.indication_type))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.len() == 0
    }

    pub fn count(&self) -> usize {
        self.history.count()
    }

    pub fn to_list(&self) -> Vec<&CfdpIndication> {
        self.history.iter().collect()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

/// One `key = value` line per entry, or `Empty`.
pub fn summary_string<K: std::fmt::Display, V: std::fmt::Display>(
    summary: &BTreeMap<K, V>,
    line_prefix: &str,
) -> String {
    if summary.is_empty() {
        return "Empty".to_string();
    }
    summary
        .iter()
        .map(|(key, value)| format!("{}{} = {}\n", line_prefix, key, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chan(id: &str, name: &str, sclk: u64, scet: i64, scet_nano: u64) -> ChanVal {
        ChanVal {
            channel_id: id.to_string(),
            name: name.to_string(),
            channel_type: ChannelType::UnsignedInt,
            sclk_exact: sclk,
            scet_exact: scet,
            scet_nano,
            ert_exact: scet,
            realtime: true,
            ..Default::default()
        }
    }

    fn evr(id: i64, name: &str, level: &str, message: &str) -> Evr {
        Evr {
            event_id: id,
            name: name.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            module: "FSW".to_string(),
            realtime: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_channel_table_bounds_history_newest_first() {
        let mut table = ChannelValueTable::new(2);
        for sclk in 1..=3 {
            table.insert(chan("A-0001", "VOLTAGE", sclk, 0, 0));
        }
        let values = table.by_id("A-0001");
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].sclk_exact, 3);
        assert_eq!(values[1].sclk_exact, 2);
        assert_eq!(table.by_name("VOLTAGE").len(), 2);
        assert_eq!(table.count(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_channel_name_index_keeps_first_id() {
        let mut table = ChannelValueTable::new(5);
        table.insert(chan("A-0001", "VOLTAGE", 1, 0, 0));
        table.insert(chan("A-0002", "VOLTAGE", 2, 0, 0));
        assert_eq!(table.by_name("VOLTAGE")[0].channel_id, "A-0001");
        assert_eq!(table.ids(), vec!["A-0001".to_string(), "A-0002".to_string()]);
        assert_eq!(
            table.latest(None, Some("VOLTAGE")).map(|v| v.sclk_exact),
            Some(1)
        );
    }

    #[test]
    fn test_scet_range_uses_nanos_on_endpoints() {
        let mut table = ChannelValueTable::new(10);
        table.insert(chan("A-0001", "A", 1, 1000, 100));
        table.insert(chan("A-0002", "B", 1, 1000, 900));
        table.insert(chan("A-0003", "C", 1, 2000, 0));

        let start = GroundTime { ms: 1000, nanos: 500 };
        let found = table.by_scet_range(Some(start), None);
        let mut ids: Vec<&str> = found.iter().map(|v| v.channel_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["A-0002", "A-0003"]);

        let end = GroundTime { ms: 1000, nanos: 500 };
        let found = table.by_scet_range(None, Some(end));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].channel_id, "A-0001");
    }

    #[test]
    fn test_sclk_range_is_inclusive() {
        let mut table = ChannelValueTable::new(10);
        for sclk in [10, 20, 30] {
            table.insert(chan(&format!("A-{}", sclk), "X", sclk, 0, 0));
        }
        assert_eq!(table.by_sclk_range(Some(10), Some(20)).len(), 2);
        assert_eq!(table.by_sclk_range(Some(21), None).len(), 1);
    }

    #[test]
    fn test_by_type_matches_newest_value() {
        let mut table = ChannelValueTable::new(10);
        let mut value = chan("A-0001", "A", 1, 0, 0);
        value.channel_type = ChannelType::Float;
        table.insert(value);
        table.insert(chan("A-0002", "B", 1, 0, 0));
        assert_eq!(table.by_type(ChannelType::Float).len(), 1);
        assert!(table.by_type(ChannelType::Ascii).is_empty());
    }

    #[test]
    fn test_evr_by_attributes_name_id_mismatch_is_empty() {
        let mut table = EvrTable::new(10);
        table.insert(evr(1, "BOOT", "ACTIVITY_HI", "booted"));
        table.insert(evr(2, "FAULT", "FATAL", "fault seen"));

        let query = EvrQuery {
            name: Some("BOOT".into()),
            event_id: Some(2),
            ..Default::default()
        };
        assert!(table.by_attributes(&query).is_empty());

        let query = EvrQuery {
            name: Some("BOOT".into()),
            ..Default::default()
        };
        assert_eq!(table.by_attributes(&query).len(), 1);

        let query = EvrQuery {
            name: Some("UNKNOWN".into()),
            ..Default::default()
        };
        assert!(table.by_attributes(&query).is_empty());
    }

    #[test]
    fn test_evr_by_attributes_filters() {
        let mut table = EvrTable::new(10);
        table.insert(evr(1, "BOOT", "ACTIVITY_HI", "booted ok"));
        table.insert(evr(2, "FAULT", "FATAL", "fault seen"));
        table.insert(evr(3, "FAULT2", "fatal", "fault cleared"));

        let query = EvrQuery {
            level: Some("FATAL".into()),
            message_substr: Some("fault".into()),
            ..Default::default()
        };
        assert_eq!(table.by_attributes(&query).len(), 2);

        let query = EvrQuery {
            message: Some("fault cleared".into()),
            ..Default::default()
        };
        assert_eq!(table.by_attributes(&query)[0].event_id, 3);
        assert_eq!(table.by_level("Fatal").len(), 2);
    }

    #[test]
    fn test_evr_summaries() {
        let mut table = EvrTable::new(10);
        table.insert(evr(1, "A", "FATAL", "x"));
        table.insert(evr(2, "B", "FATAL", "y"));
        table.insert(evr(3, "C", "COMMAND", "z"));

        let summary = table.level_summary();
        assert_eq!(summary.get("FATAL"), Some(&2));
        assert_eq!(summary_string(&summary, ""), "COMMAND = 1\nFATAL = 2\n");
        assert_eq!(table.module_summary().get("FSW"), Some(&3));
    }

    #[test]
    fn test_summary_string_empty() {
        let summary: BTreeMap<String, usize> = BTreeMap::new();
        assert_eq!(summary_string(&summary, "APID "), "Empty");
    }

    #[test]
    fn test_product_queries() {
        let mut table = ProductTable::new(10);
        for (apid, status) in [(5, ProductStatus::Partial), (5, ProductStatus::Complete), (7, ProductStatus::Complete)] {
            table.insert(Product {
                apid,
                name: format!("prod_{}", apid),
                transaction_id: format!("tx-{}-{}", apid, status),
                status,
                ..Default::default()
            });
        }
        assert_eq!(table.by_apid(5).len(), 2);
        assert_eq!(table.by_status(ProductStatus::Complete).len(), 2);
        assert_eq!(table.by_transaction_id("tx-5-Partial").len(), 1);
        assert_eq!(table.apid_summary().get(&5), Some(&2));

        let query = ProductQuery {
            apid: Some(5),
            status: Some(ProductStatus::Complete),
            ..Default::default()
        };
        assert_eq!(table.by_attributes(&query).len(), 1);
    }

    #[test]
    fn test_cfdp_table_keyed_by_transaction() {
        let mut table = CfdpIndicationTable::new(5);
        for (src, seq, kind) in [("1", "10", "Metadata"), ("1", "10", "TransactionFinished"), ("2", "11", "Fault")] {
            table.insert(CfdpIndication {
                source_entity_id: src.to_string(),
                transaction_sequence_number: seq.to_string(),
                indication_type: kind.to_string(),
                ..Default::default()
            });
        }
        assert_eq!(table.transaction_ids(), vec!["1:10".to_string(), "2:11".to_string()]);
        assert_eq!(table.by_transaction_id("1", "10").len(), 2);
        assert_eq!(
            table.by_transaction_id("1", "10")[0].indication_type,
            "TransactionFinished"
        );
        assert_eq!(table.filtered(Some("1"), None, &["Metadata".to_string()]).len(), 1);
        assert_eq!(table.filtered(None, Some("11"), &[]).len(), 1);
        assert_eq!(table.count(), 3);
    }
}
