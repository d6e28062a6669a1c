//! Line codec for the downlink server socket.
//!
//! Every message is a single line whose fields are separated by the two
//! character sequence `\,`. The first field names the message type.

use crate::domain::model::{
    is_true_value, CfdpIndication, ChanVal, ChannelType, Dn, Evr, Product, ProductStatus,
    Telemetry,
};
use crate::utils::error::{MtakError, Result};
use crate::utils::time;
use std::str::FromStr;

pub const FIELD_SEPARATOR: &str = "\\,";

const CHANNEL_FIELDS: usize = 27;
const EVR_FIELDS: usize = 24;
const PRODUCT_FIELDS: usize = 18;
const CFDP_FIELDS: usize = 5;

/// Decode one line. Returns `Ok(None)` for blank lines and unknown prefixes.
pub fn parse_line(line: &str) -> Result<Option<Telemetry>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Ok(None);
    }

    // "cf" must be tested ahead of the single-letter prefixes
    let telemetry = if line.starts_with("cf") {
        Telemetry::CfdpIndication(parse_cfdp_indication(line)?)
    } else if line.starts_with("ch") {
        Telemetry::ChannelValue(parse_channel_value(line)?)
    } else if line.starts_with('e') {
        Telemetry::Evr(parse_evr(line)?)
    } else if line.starts_with('p') {
        Telemetry::Product(parse_product(line)?)
    } else {
        return Ok(None);
    };

    Ok(Some(telemetry))
}

struct Fields<'a> {
    kind: &'static str,
    pieces: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn split(kind: &'static str, line: &'a str, minimum: usize) -> Result<Self> {
        let pieces: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        if pieces.len() < minimum {
            return Err(MtakError::CsvFormatError {
                message: format!(
                    "{} message has {} fields, expected at least {}",
                    kind,
                    pieces.len(),
                    minimum
                ),
            });
        }
        Ok(Self { kind, pieces })
    }

    fn str(&self, idx: usize) -> &'a str {
        self.pieces.get(idx).copied().unwrap_or("").trim()
    }

    fn string(&self, idx: usize) -> String {
        self.str(idx).to_string()
    }

    fn number<T: FromStr + Default>(&self, idx: usize) -> Result<T> {
        let raw = self.str(idx);
        if raw.is_empty() {
            return Ok(T::default());
        }
        raw.parse::<T>().map_err(|_| MtakError::CsvFormatError {
            message: format!("{} field {} is not numeric: '{}'", self.kind, idx, raw),
        })
    }

    fn optional<T: FromStr>(&self, idx: usize) -> Option<T> {
        let raw = self.str(idx);
        if raw.is_empty() {
            None
        } else {
            raw.parse::<T>().ok()
        }
    }

    fn flag(&self, idx: usize) -> bool {
        is_true_value(self.str(idx))
    }

    /// Trailing non-empty key/value pairs starting at `start`.
    fn pairs(&self, start: usize) -> Vec<(String, String)> {
        self.pieces
            .get(start..)
            .unwrap_or(&[])
            .chunks(2)
            .filter(|chunk| chunk.len() == 2 && chunk.iter().all(|s| !s.trim().is_empty()))
            .map(|chunk| (chunk[0].trim().to_string(), chunk[1].trim().to_string()))
            .collect()
    }
}

pub fn parse_channel_value(line: &str) -> Result<ChanVal> {
    let f = Fields::split("channel", line, CHANNEL_FIELDS)?;
    let channel_type: ChannelType = f.str(17).parse()?;

    let mut scet_exact = f.number(11)?;
    let mut scet_nano = f.number(12)?;
    let scet = f.string(10);
    if scet.contains('.') {
        scet_exact = time::parse_time_string(&scet)?;
        scet_nano = time::time_string_nanos(&scet);
    }

    let raw_dn = f.str(23);
    let dn = if channel_type == ChannelType::Ascii {
        Some(Dn::Text(raw_dn.to_string()))
    } else if raw_dn.is_empty() {
        None
    } else {
        Some(Dn::format(channel_type, raw_dn)?)
    };

    let status = Some(f.string(22)).filter(|s| !s.is_empty());

    Ok(ChanVal {
        receive_time: None,
        event_time: f.string(1),
        event_time_exact: f.number(2)?,
        sclk: f.string(3),
        sclk_coarse: f.number(4)?,
        sclk_fine: f.number(5)?,
        sclk_exact: f.number(6)?,
        ert: f.string(7),
        ert_exact: f.number(8)?,
        ert_exact_fine: f.number(9)?,
        scet,
        scet_exact,
        scet_nano,
        lst: f.string(13),
        lst_exact: f.number(14)?,
        realtime: f.flag(15),
        channel_id: f.string(16),
        channel_type,
        name: f.string(18),
        module: f.string(19),
        dn_units: f.string(20),
        eu_units: f.string(21),
        status,
        dn,
        eu: f.optional(24),
        dss_id: f.optional(25),
        vcid: f.string(26),
        alarms: f.pairs(CHANNEL_FIELDS),
    })
}

pub fn parse_evr(line: &str) -> Result<Evr> {
    let f = Fields::split("EVR", line, EVR_FIELDS)?;

    let mut scet_exact = f.number(14)?;
    let mut scet_nano = f.number(15)?;
    let scet = f.string(13);
    if scet.contains('.') {
        scet_exact = time::parse_time_string(&scet)?;
        scet_nano = time::time_string_nanos(&scet);
    }

    Ok(Evr {
        receive_time: None,
        name: f.string(1),
        level: f.string(2),
        event_id: f.number(3)?,
        message: f.string(4),
        from_sse: f.flag(5),
        event_time: f.string(6),
        event_time_exact: f.number(7)?,
        realtime: f.flag(8),
        sclk: f.string(9),
        sclk_coarse: f.number(10)?,
        sclk_fine: f.number(11)?,
        sclk_exact: f.number(12)?,
        scet,
        scet_exact,
        scet_nano,
        lst: f.string(16),
        lst_exact: f.number(17)?,
        ert: f.string(18),
        ert_exact: f.number(19)?,
        ert_exact_fine: f.number(20)?,
        dss_id: f.optional(21),
        vcid: f.string(22),
        module: f.string(23),
        metadata: f.pairs(EVR_FIELDS).into_iter().collect(),
    })
}

pub fn parse_product(line: &str) -> Result<Product> {
    let f = Fields::split("product", line, PRODUCT_FIELDS)?;

    Ok(Product {
        receive_time: None,
        name: f.string(1),
        transaction_id: f.string(2),
        apid: f.number(3)?,
        dvt_coarse: f.number(4)?,
        dvt_fine: f.number(5)?,
        dvt_sclk: f.string(6),
        dvt_sclk_exact: f.number(7)?,
        dvt_scet: f.string(8),
        dvt_scet_exact: f.number(9)?,
        event_time: f.string(10),
        ert: f.string(11),
        ert_exact: f.number(12)?,
        total_parts: f.number(13)?,
        complete_file: f.string(14),
        data_file: f.string(15),
        status: ProductStatus::from_str(f.str(16))?,
        reason: f.string(17),
    })
}

pub fn parse_cfdp_indication(line: &str) -> Result<CfdpIndication> {
    let f = Fields::split("CFDP indication", line, CFDP_FIELDS)?;

    Ok(CfdpIndication {
        receive_time: None,
        indication_type: f.string(1),
        source_entity_id: f.string(2),
        transaction_sequence_number: f.string(3),
        event_time: f.string(4),
    })
}

fn join(fields: Vec<String>) -> String {
    fields.join(FIELD_SEPARATOR)
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

/// Encode telemetry back into its wire line (without the trailing newline).
pub fn to_wire(telemetry: &Telemetry) -> String {
    match telemetry {
        Telemetry::ChannelValue(v) => {
            let mut fields = vec![
                "chan".to_string(),
                v.event_time.clone(),
                v.event_time_exact.to_string(),
                v.sclk.clone(),
                v.sclk_coarse.to_string(),
                v.sclk_fine.to_string(),
                v.sclk_exact.to_string(),
                v.ert.clone(),
                v.ert_exact.to_string(),
                v.ert_exact_fine.to_string(),
                v.scet.clone(),
                v.scet_exact.to_string(),
                v.scet_nano.to_string(),
                v.lst.clone(),
                v.lst_exact.to_string(),
                v.realtime.to_string(),
                v.channel_id.clone(),
                v.channel_type.to_string(),
                v.name.clone(),
                v.module.clone(),
                v.dn_units.clone(),
                v.eu_units.clone(),
                opt(&v.status),
                opt(&v.dn),
                opt(&v.eu),
                opt(&v.dss_id),
                v.vcid.clone(),
            ];
            for (alarm, state) in &v.alarms {
                fields.push(alarm.clone());
                fields.push(state.clone());
            }
            join(fields)
        }
        Telemetry::Evr(v) => {
            let mut fields = vec![
                "evr".to_string(),
                v.name.clone(),
                v.level.clone(),
                v.event_id.to_string(),
                v.message.clone(),
                v.from_sse.to_string(),
                v.event_time.clone(),
                v.event_time_exact.to_string(),
                v.realtime.to_string(),
                v.sclk.clone(),
                v.sclk_coarse.to_string(),
                v.sclk_fine.to_string(),
                v.sclk_exact.to_string(),
                v.scet.clone(),
                v.scet_exact.to_string(),
                v.scet_nano.to_string(),
                v.lst.clone(),
                v.lst_exact.to_string(),
                v.ert.clone(),
                v.ert_exact.to_string(),
                v.ert_exact_fine.to_string(),
                opt(&v.dss_id),
                v.vcid.clone(),
                v.module.clone(),
            ];
            for (key, value) in &v.metadata {
                fields.push(key.clone());
                fields.push(value.clone());
            }
            join(fields)
        }
        Telemetry::Product(v) => join(vec![
            "prod".to_string(),
            v.name.clone(),
            v.transaction_id.clone(),
            v.apid.to_string(),
            v.dvt_coarse.to_string(),
            v.dvt_fine.to_string(),
            v.dvt_sclk.clone(),
            v.dvt_sclk_exact.to_string(),
            v.dvt_scet.clone(),
            v.dvt_scet_exact.to_string(),
            v.event_time.clone(),
            v.ert.clone(),
            v.ert_exact.to_string(),
            v.total_parts.to_string(),
            v.complete_file.clone(),
            v.data_file.clone(),
            v.status.to_string(),
            v.reason.clone(),
        ]),
        Telemetry::CfdpIndication(v) => join(vec![
            "cfdp".to_string(),
            v.indication_type.clone(),
            v.source_entity_id.clone(),
            v.transaction_sequence_number.clone(),
            v.event_time.clone(),
        ]),
    }
}
