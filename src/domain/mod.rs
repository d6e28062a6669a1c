// Domain layer: telemetry models, the downlink wire codec and the uplink port.

pub mod codec;
pub mod model;
pub mod ports;
