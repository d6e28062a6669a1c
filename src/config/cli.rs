use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "mtak")]
#[command(about = "Mission test automation against an AMPCS session")]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, default_value = "mtak.toml")]
    pub config: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log as JSON lines instead of text
    #[arg(long, global = true)]
    pub json_log: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check that a running AUTO uplink proxy answers its status endpoint
    Status(ProxyTarget),

    /// Attach the AUTO uplink proxy to an AMPCS session
    Session {
        #[command(flatten)]
        target: ProxyTarget,

        /// Session configuration file
        #[arg(long, conflicts_with_all = ["session_id", "session_host"])]
        session_config: Option<String>,

        /// Existing session id
        #[arg(long, requires = "session_host")]
        session_id: Option<String>,

        /// Host of the existing session
        #[arg(long, requires = "session_id")]
        session_host: Option<String>,
    },

    /// Radiate an SCMF through the AUTO uplink proxy
    SendScmf {
        #[command(flatten)]
        target: ProxyTarget,

        scmf_file: String,

        /// Skip checksum and dictionary version checks
        #[arg(long)]
        disable_checks: bool,

        /// Seconds to wait for radiation confirmation
        #[arg(long, default_value = "0")]
        wait_for_radiation: u32,

        /// Comma separated uplink bit rates
        #[arg(long, value_delimiter = ',')]
        uplink_rates: Vec<f64>,
    },

    /// Send a CFDP PDU file through the AUTO uplink proxy
    SendPdu {
        #[command(flatten)]
        target: ProxyTarget,

        pdu_file: String,

        #[arg(long)]
        entity_id: String,

        #[arg(long)]
        vcid: Option<String>,
    },

    /// Write a message into the session log
    Log {
        #[command(flatten)]
        target: ProxyTarget,

        message: String,

        #[arg(long, default_value = "INFO")]
        level: String,
    },

    /// Send a flight command through a spawned MTAK uplink server
    SendCmd(SendCmdArgs),

    /// Run the downlink proxy and report what arrives
    Watch(WatchArgs),

    /// Query channel values from the Global LAD
    LadEha {
        channel_id: String,

        #[arg(long)]
        recorded: bool,

        /// Only values with an ERT after this time
        #[arg(long)]
        after_ert: Option<String>,
    },

    /// Query EVRs from the Global LAD
    LadEvr {
        event_id: i64,

        #[arg(long)]
        recorded: bool,

        /// Only EVRs with an ERT after this time
        #[arg(long)]
        after_ert: Option<String>,
    },

    /// Start a CFDP PUT transaction on the CFDP Processor
    CfdpPut {
        /// Source file, relative to the processor's uplink files directory
        source_file: String,

        /// Destination entity id
        #[arg(long)]
        destination_entity: u64,

        #[arg(long)]
        destination_file: Option<String>,

        /// 1 unacknowledged, 2 acknowledged, 0 for the processor's default
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        service_class: u8,

        /// Overrides services.cfdp_processor_url
        #[arg(long)]
        url: Option<String>,
    },

    /// Parse SCLK and ground time strings and print their exact values
    Time {
        #[arg(long)]
        sclk: Option<String>,

        #[arg(long)]
        time: Option<String>,
    },
}

/// Where to find the AUTO uplink proxy. Without `--url` a new proxy is
/// spawned for the duration of the command.
#[derive(Debug, Clone, Args)]
pub struct ProxyTarget {
    /// Base URL of an already running proxy
    #[arg(long)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct SendCmdArgs {
    pub command: String,

    #[arg(long)]
    pub string_id: Option<String>,

    #[arg(long)]
    pub virtual_channel: Option<u32>,

    #[arg(long)]
    pub scid: Option<u32>,

    #[arg(long)]
    pub no_validate: bool,

    #[arg(long, default_value = "0")]
    pub wait_for_radiation: u32,
}

#[derive(Debug, Clone, Args)]
pub struct WatchArgs {
    /// Seconds to watch when no condition is given, or the wait timeout
    #[arg(long, default_value = "60")]
    pub seconds: i64,

    /// Stop when this channel reports a value
    #[arg(long)]
    pub channel_id: Option<String>,

    /// DN the channel value must have
    #[arg(long, requires = "channel_id")]
    pub dn: Option<String>,

    /// Stop when an EVR with this event id arrives
    #[arg(long, conflicts_with = "channel_id")]
    pub event_id: Option<i64>,

    /// Read telemetry lines from this file instead of spawning the downlink server
    #[arg(long)]
    pub replay: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_scmf() {
        let cli = Cli::parse_from([
            "mtak",
            "--config",
            "ops.toml",
            "send-scmf",
            "load.scmf",
            "--uplink-rates",
            "1000,2000",
            "--url",
            "http://localhost:8384/",
        ]);
        assert_eq!(cli.config, "ops.toml");
        match cli.command {
            Command::SendScmf {
                target,
                scmf_file,
                uplink_rates,
                disable_checks,
                ..
            } => {
                assert_eq!(scmf_file, "load.scmf");
                assert_eq!(uplink_rates, vec![1000.0, 2000.0]);
                assert!(!disable_checks);
                assert_eq!(target.url.as_deref(), Some("http://localhost:8384/"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_session_arguments_must_pair() {
        assert!(Cli::try_parse_from(["mtak", "session", "--session-id", "12"]).is_err());
        assert!(Cli::try_parse_from([
            "mtak",
            "session",
            "--session-config",
            "s.xml",
            "--session-id",
            "12",
            "--session-host",
            "h"
        ])
        .is_err());
    }

    #[test]
    fn test_watch_defaults() {
        let cli = Cli::parse_from(["mtak", "-v", "watch", "--event-id", "7"]);
        assert!(cli.verbose);
        match cli.command {
            Command::Watch(args) => {
                assert_eq!(args.seconds, 60);
                assert_eq!(args.event_id, Some(7));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cfdp_put_service_class_range() {
        let cli = Cli::parse_from([
            "mtak",
            "cfdp-put",
            "load.bin",
            "--destination-entity",
            "25",
            "--service-class",
            "2",
        ]);
        match cli.command {
            Command::CfdpPut {
                destination_entity,
                service_class,
                ..
            } => {
                assert_eq!(destination_entity, 25);
                assert_eq!(service_class, 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from([
            "mtak",
            "cfdp-put",
            "load.bin",
            "--destination-entity",
            "25",
            "--service-class",
            "3"
        ])
        .is_err());
    }
}
