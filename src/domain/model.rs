use crate::utils::error::{MtakError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    #[default]
    Ascii,
    SignedInt,
    Status,
    Boolean,
    Float,
    UnsignedInt,
    Digital,
    Time,
}

pub const VALID_CHANNEL_TYPES: &[&str] = &[
    "ascii",
    "signed_int",
    "status",
    "bool",
    "boolean",
    "float",
    "double",
    "unsigned_int",
    "digital",
    "time",
];

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Ascii => "ascii",
            ChannelType::SignedInt => "signed_int",
            ChannelType::Status => "status",
            ChannelType::Boolean => "boolean",
            ChannelType::Float => "float",
            ChannelType::UnsignedInt => "unsigned_int",
            ChannelType::Digital => "digital",
            ChannelType::Time => "time",
        }
    }
}

impl FromStr for ChannelType {
    type Err = MtakError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ascii" => Ok(ChannelType::Ascii),
            "signed_int" => Ok(ChannelType::SignedInt),
            "status" => Ok(ChannelType::Status),
            "bool" | "boolean" => Ok(ChannelType::Boolean),
            "float" | "double" => Ok(ChannelType::Float),
            "unsigned_int" => Ok(ChannelType::UnsignedInt),
            "digital" => Ok(ChannelType::Digital),
            "time" => Ok(ChannelType::Time),
            other => Err(MtakError::InvalidConfigValueError {
                field: "channel_type".to_string(),
                value: other.to_string(),
                reason: format!("Valid types are: {}", VALID_CHANNEL_TYPES.join(", ")),
            }),
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A channel data number, typed by the channel's dictionary type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dn {
    Int(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
}

impl Dn {
    /// Convert a raw value into the representation used by `channel_type`.
    pub fn format(channel_type: ChannelType, raw: &str) -> Result<Dn> {
        let value = raw.trim();
        let bad = |reason: &str| MtakError::InvalidConfigValueError {
            field: "dn".to_string(),
            value: raw.to_string(),
            reason: format!("{} for {} channel", reason, channel_type),
        };

        match channel_type {
            ChannelType::Ascii => Ok(Dn::Text(raw.to_string())),
            ChannelType::SignedInt | ChannelType::Status | ChannelType::Boolean => value
                .parse::<i64>()
                .map(Dn::Int)
                .map_err(|_| bad("not an integer")),
            ChannelType::Float => value
                .parse::<f64>()
                .map(Dn::Float)
                .map_err(|_| bad("not a number")),
            ChannelType::UnsignedInt | ChannelType::Digital | ChannelType::Time => {
                if value.starts_with('-') {
                    return Err(bad("negative value"));
                }
                value
                    .parse::<u64>()
                    .map(Dn::Unsigned)
                    .map_err(|_| bad("not an unsigned integer"))
            }
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Dn::Int(v) => Some(*v as f64),
            Dn::Unsigned(v) => Some(*v as f64),
            Dn::Float(v) => Some(*v),
            Dn::Text(_) => None,
        }
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for Dn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Dn::Text(a), Dn::Text(b)) => a.partial_cmp(b),
            (Dn::Int(a), Dn::Int(b)) => a.partial_cmp(b),
            (Dn::Unsigned(a), Dn::Unsigned(b)) => a.partial_cmp(b),
            (Dn::Int(a), Dn::Unsigned(b)) => (*a as i128).partial_cmp(&(*b as i128)),
            (Dn::Unsigned(a), Dn::Int(b)) => (*a as i128).partial_cmp(&(*b as i128)),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dn::Int(v) => write!(f, "{}", v),
            Dn::Unsigned(v) => write!(f, "{}", v),
            Dn::Float(v) => write!(f, "{}", v),
            Dn::Text(v) => f.write_str(v),
        }
    }
}

pub(crate) fn is_true_value(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "y" | "yes" | "t" | "true" | "1"
    )
}

pub(crate) fn is_false_value(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "n" | "no" | "f" | "false" | "0"
    )
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChanVal {
    pub receive_time: Option<DateTime<Utc>>,
    pub event_time: String,
    pub event_time_exact: i64,
    pub sclk: String,
    pub sclk_coarse: u64,
    pub sclk_fine: u64,
    pub sclk_exact: u64,
    pub ert: String,
    pub ert_exact: i64,
    pub ert_exact_fine: i64,
    pub scet: String,
    pub scet_exact: i64,
    pub scet_nano: u64,
    pub lst: String,
    pub lst_exact: i64,
    pub realtime: bool,
    pub channel_id: String,
    pub channel_type: ChannelType,
    pub name: String,
    pub module: String,
    pub dn_units: String,
    pub eu_units: String,
    pub status: Option<String>,
    pub dn: Option<Dn>,
    pub eu: Option<f64>,
    pub dss_id: Option<u32>,
    pub vcid: String,
    pub alarms: Vec<(String, String)>,
}

impl ChanVal {
    /// Boolean channels may carry true/false aliases in their status field.
    pub fn status_bool(&self) -> Option<bool> {
        if self.channel_type != ChannelType::Boolean {
            return None;
        }
        let status = self.status.as_deref()?;
        if is_false_value(status) {
            Some(false)
        } else if is_true_value(status) {
            Some(true)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evr {
    pub receive_time: Option<DateTime<Utc>>,
    pub name: String,
    pub level: String,
    pub event_id: i64,
    pub message: String,
    pub from_sse: bool,
    pub event_time: String,
    pub event_time_exact: i64,
    pub realtime: bool,
    pub sclk: String,
    pub sclk_coarse: u64,
    pub sclk_fine: u64,
    pub sclk_exact: u64,
    pub scet: String,
    pub scet_exact: i64,
    pub scet_nano: u64,
    pub lst: String,
    pub lst_exact: i64,
    pub ert: String,
    pub ert_exact: i64,
    pub ert_exact_fine: i64,
    pub dss_id: Option<u32>,
    pub vcid: String,
    pub module: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductStatus {
    NotStarted,
    InProgress,
    Complete,
    Partial,
    #[default]
    Unknown,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::NotStarted => "NotStarted",
            ProductStatus::InProgress => "InProgress",
            ProductStatus::Complete => "Complete",
            ProductStatus::Partial => "Partial",
            ProductStatus::Unknown => "Unknown",
        }
    }
}

impl FromStr for ProductStatus {
    type Err = MtakError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "notstarted" => Ok(ProductStatus::NotStarted),
            "inprogress" => Ok(ProductStatus::InProgress),
            "complete" => Ok(ProductStatus::Complete),
            "partial" => Ok(ProductStatus::Partial),
            "" | "unknown" => Ok(ProductStatus::Unknown),
            _ => Err(MtakError::InvalidConfigValueError {
                field: "status".to_string(),
                value: s.to_string(),
                reason: "expected NotStarted, InProgress, Complete or Partial".to_string(),
            }),
        }
    }
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub receive_time: Option<DateTime<Utc>>,
    pub name: String,
    pub transaction_id: String,
    pub apid: u32,
    pub dvt_coarse: u64,
    pub dvt_fine: u64,
    pub dvt_sclk: String,
    pub dvt_sclk_exact: u64,
    pub dvt_scet: String,
    pub dvt_scet_exact: i64,
    pub event_time: String,
    pub ert: String,
    pub ert_exact: i64,
    pub total_parts: u32,
    pub complete_file: String,
    pub data_file: String,
    pub status: ProductStatus,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CfdpIndication {
    pub receive_time: Option<DateTime<Utc>>,
    pub indication_type: String,
    pub source_entity_id: String,
    pub transaction_sequence_number: String,
    pub event_time: String,
}

impl CfdpIndication {
    /// Table key, `<source entity>:<sequence number>`.
    pub fn transaction_id(&self) -> String {
        transaction_key(&self.source_entity_id, &self.transaction_sequence_number)
    }
}

pub fn transaction_key(source_entity_id: &str, transaction_sequence_number: &str) -> String {
    format!("{}:{}", source_entity_id, transaction_sequence_number)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryKind {
    ChannelValue,
    Evr,
    Product,
    CfdpIndication,
}

/// One item off the downlink stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Telemetry {
    ChannelValue(ChanVal),
    Evr(Evr),
    Product(Product),
    CfdpIndication(CfdpIndication),
}

impl Telemetry {
    pub fn kind(&self) -> TelemetryKind {
        match self {
            Telemetry::ChannelValue(_) => TelemetryKind::ChannelValue,
            Telemetry::Evr(_) => TelemetryKind::Evr,
            Telemetry::Product(_) => TelemetryKind::Product,
            Telemetry::CfdpIndication(_) => TelemetryKind::CfdpIndication,
        }
    }

    pub fn receive_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Telemetry::ChannelValue(v) => v.receive_time,
            Telemetry::Evr(v) => v.receive_time,
            Telemetry::Product(v) => v.receive_time,
            Telemetry::CfdpIndication(v) => v.receive_time,
        }
    }

    pub fn set_receive_time(&mut self, time: DateTime<Utc>) {
        let slot = match self {
            Telemetry::ChannelValue(v) => &mut v.receive_time,
            Telemetry::Evr(v) => &mut v.receive_time,
            Telemetry::Product(v) => &mut v.receive_time,
            Telemetry::CfdpIndication(v) => &mut v.receive_time,
        };
        *slot = Some(time);
    }

    /// Products count as realtime; CFDP indications carry no SCLK and never do.
    pub fn is_realtime(&self) -> bool {
        match self {
            Telemetry::ChannelValue(v) => v.realtime,
            Telemetry::Evr(v) => v.realtime,
            Telemetry::Product(_) => true,
            Telemetry::CfdpIndication(_) => false,
        }
    }

    pub fn sclk_exact(&self) -> Option<u64> {
        match self {
            Telemetry::ChannelValue(v) => Some(v.sclk_exact),
            Telemetry::Evr(v) => Some(v.sclk_exact),
            Telemetry::Product(v) => Some(v.dvt_sclk_exact),
            Telemetry::CfdpIndication(_) => None,
        }
    }
}

impl From<ChanVal> for Telemetry {
    fn from(value: ChanVal) -> Self {
        Telemetry::ChannelValue(value)
    }
}

impl From<Evr> for Telemetry {
    fn from(value: Evr) -> Self {
        Telemetry::Evr(value)
    }
}

impl From<Product> for Telemetry {
    fn from(value: Product) -> Self {
        Telemetry::Product(value)
    }
}

impl From<CfdpIndication> for Telemetry {
    fn from(value: CfdpIndication) -> Self {
        Telemetry::CfdpIndication(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_dn_by_type() {
        assert_eq!(Dn::format(ChannelType::Ascii, "abc").unwrap(), Dn::Text("abc".into()));
        assert_eq!(Dn::format(ChannelType::SignedInt, "-5").unwrap(), Dn::Int(-5));
        assert_eq!(Dn::format(ChannelType::Boolean, "1").unwrap(), Dn::Int(1));
        assert_eq!(Dn::format(ChannelType::Float, "2.5").unwrap(), Dn::Float(2.5));
        assert_eq!(Dn::format(ChannelType::Time, "7").unwrap(), Dn::Unsigned(7));
        assert!(Dn::format(ChannelType::UnsignedInt, "-7").is_err());
        assert!(Dn::format(ChannelType::SignedInt, "abc").is_err());
    }

    #[test]
    fn test_unknown_channel_type_is_rejected() {
        assert_eq!("DOUBLE".parse::<ChannelType>().unwrap(), ChannelType::Float);
        assert_eq!("bool".parse::<ChannelType>().unwrap(), ChannelType::Boolean);
        assert!("quaternion".parse::<ChannelType>().is_err());
    }

    #[test]
    fn test_dn_cross_kind_ordering() {
        assert!(Dn::Int(5) < Dn::Unsigned(6));
        assert!(Dn::Float(5.5) > Dn::Int(5));
        assert_eq!(Dn::Int(5), Dn::Unsigned(5));
        assert_eq!(Dn::Text("a".into()).partial_cmp(&Dn::Int(1)), None);
    }

    #[test]
    fn test_boolean_status_aliases() {
        let mut value = ChanVal {
            channel_type: ChannelType::Boolean,
            status: Some("Yes".to_string()),
            ..Default::default()
        };
        assert_eq!(value.status_bool(), Some(true));
        value.status = Some("f".to_string());
        assert_eq!(value.status_bool(), Some(false));
        value.status = Some("ARMED".to_string());
        assert_eq!(value.status_bool(), None);
    }

    #[test]
    fn test_product_status_parse() {
        assert_eq!("InProgress".parse::<ProductStatus>().unwrap(), ProductStatus::InProgress);
        assert_eq!("not_started".parse::<ProductStatus>().unwrap(), ProductStatus::NotStarted);
        assert!("bogus".parse::<ProductStatus>().is_err());
    }
}
