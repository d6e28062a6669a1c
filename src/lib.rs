pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

pub use config::MtakConfig;
pub use core::{
    AutoProxy, CommandUplink, DownlinkProxy, DummyUplinkProxy, Mtak, TelemetryStore, UplinkProxy,
    WaitOptions,
};
pub use domain::model::{CfdpIndication, ChanVal, Evr, Product, Telemetry};
pub use utils::error::{MtakError, Result};
