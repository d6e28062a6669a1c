pub mod auto_proxy;
pub mod collection;
pub mod downlink;
pub mod services;
pub mod uplink;
pub mod wait;
pub mod wrapper;

use crate::config::toml_config::MtakConfig;
use crate::utils::error::{MtakError, Result};
use std::path::PathBuf;

pub use crate::domain::ports::{CommandUplink, FileLoad, UplinkOptions};
pub use auto_proxy::{AutoProxy, SessionInfo};
pub use downlink::{DownlinkProxy, TelemetryStore, WaitOptions};
pub use uplink::{DummyUplinkProxy, UplinkProxy};
pub use wait::{CompoundWait, WaitCondition, WaitResult};
pub use wrapper::Mtak;

/// Resolve an AMPCS executable, failing early when `CHILL_GDS` points at an
/// installation that does not have it.
pub(crate) fn locate_tool(name: &str) -> Result<PathBuf> {
    let path = MtakConfig::chill_tool(name);
    let installed = std::env::var_os("CHILL_GDS").is_some_and(|root| !root.is_empty());
    if installed && !path.is_file() {
        return Err(MtakError::EnvironmentError {
            message: format!(
                "Cannot find the required script {}. Check that CHILL_GDS is set correctly.",
                path.display()
            ),
        });
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_tool_name_is_left_to_path_lookup() {
        if std::env::var_os("CHILL_GDS").is_none() {
            let path = locate_tool("internal/some_tool").expect("bare name");
            assert_eq!(path, PathBuf::from("internal/some_tool"));
        }
    }
}
