use ampcs_mtak::config::cli::{Cli, Command, ProxyTarget, SendCmdArgs, WatchArgs};
use ampcs_mtak::core::services::{CfdpProcessorClient, CfdpPutRequest, GlobalLadClient, LadFrom};
use ampcs_mtak::core::wait::{ChanValWait, EvrWait};
use ampcs_mtak::domain::ports::{CommandUplink, UplinkOptions};
use ampcs_mtak::utils::error::ErrorSeverity;
use ampcs_mtak::utils::time::{format_time, parse_time_string};
use ampcs_mtak::utils::logger;
use ampcs_mtak::utils::validation::{validate_required_field, Validate};
use ampcs_mtak::{AutoProxy, DownlinkProxy, MtakConfig, MtakError, Result, UplinkProxy, WaitOptions};
use clap::Parser;
use std::path::Path;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.json_log {
        logger::init_json_logger();
    } else {
        logger::init_cli_logger(cli.verbose);
    }
    tracing::info!("Starting mtak CLI");

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load config file '{}': {}", cli.config, e);
            eprintln!("💡 Make sure the file exists and is valid TOML format");
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    if let Err(e) = run(cli.command, config).await {
        tracing::error!(
            "❌ mtak failed: {} (Category: {:?}, Severity: {:?})",
            e,
            e.category(),
            e.severity()
        );
        tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        eprintln!("💡 {}", e.recovery_suggestion());

        let exit_code = match e.severity() {
            ErrorSeverity::Low => 0,
            ErrorSeverity::Medium => 2,
            ErrorSeverity::High => 1,
            ErrorSeverity::Critical => 3,
        };
        if exit_code > 0 {
            std::process::exit(exit_code);
        }
    }
}

/// The default config file is optional; an explicitly named one is not.
fn load_config(path: &str) -> Result<MtakConfig> {
    if path == "mtak.toml" && !Path::new(path).exists() {
        tracing::info!("No mtak.toml found, using default configuration");
        return Ok(MtakConfig::default());
    }
    tracing::info!("📁 Loading configuration from: {}", path);
    MtakConfig::from_file(path)
}

async fn run(command: Command, config: MtakConfig) -> Result<()> {
    match command {
        Command::Status(target) => {
            with_auto_proxy(config, target, |proxy| async move {
                let status = proxy.status().await?;
                println!("AUTO uplink proxy status: {}", status.trim());
                Ok(())
            })
            .await
        }
        Command::Session {
            target,
            session_config,
            session_id,
            session_host,
        } => {
            with_auto_proxy(config, target, |proxy| async move {
                let session = proxy
                    .init_session(
                        session_config.as_deref(),
                        session_id.as_deref(),
                        session_host.as_deref(),
                    )
                    .await?;
                println!(
                    "Session {} on {} (venue {}, scid {})",
                    session.key, session.host, session.venue, session.scid
                );
                Ok(())
            })
            .await
        }
        Command::SendScmf {
            target,
            scmf_file,
            disable_checks,
            wait_for_radiation,
            uplink_rates,
        } => {
            with_auto_proxy(config, target, |proxy| async move {
                proxy.set_rates(Some(&uplink_rates));
                proxy
                    .send_scmf_file(&scmf_file, !disable_checks, wait_for_radiation)
                    .await?;
                println!("✅ SCMF {} sent", scmf_file);
                Ok(())
            })
            .await
        }
        Command::SendPdu {
            target,
            pdu_file,
            entity_id,
            vcid,
        } => {
            with_auto_proxy(config, target, |proxy| async move {
                proxy
                    .send_pdu_file(&pdu_file, &entity_id, vcid.as_deref())
                    .await?;
                println!("✅ PDU file {} sent", pdu_file);
                Ok(())
            })
            .await
        }
        Command::Log {
            target,
            message,
            level,
        } => {
            with_auto_proxy(config, target, |proxy| async move {
                proxy.log(&level, &message).await
            })
            .await
        }
        Command::SendCmd(args) => send_command(config, args).await,
        Command::Watch(args) => watch(config, args).await,
        Command::LadEha {
            channel_id,
            recorded,
            after_ert,
        } => {
            let client = lad_client(&config)?;
            let from = LadFrom::Ert(after_ert.as_deref().map(parse_time_string).transpose()?.unwrap_or(0));
            for value in client.get_eha(&channel_id, !recorded, from).await? {
                println!("{}", serde_json::to_string(&value)?);
            }
            Ok(())
        }
        Command::LadEvr {
            event_id,
            recorded,
            after_ert,
        } => {
            let client = lad_client(&config)?;
            let from = LadFrom::Ert(after_ert.as_deref().map(parse_time_string).transpose()?.unwrap_or(0));
            for evr in client.get_evr(event_id, !recorded, from).await? {
                println!("{}", serde_json::to_string(&evr)?);
            }
            Ok(())
        }
        Command::CfdpPut {
            source_file,
            destination_entity,
            destination_file,
            service_class,
            url,
        } => {
            let base_url = url.as_deref().unwrap_or(&config.services.cfdp_processor_url);
            let client = CfdpProcessorClient::new(base_url)?
                .with_timeout(config.services.request_timeout())?;
            let request = CfdpPutRequest {
                requester_id: std::env::var("USER").unwrap_or_else(|_| "mtak".to_string()),
                destination_entity,
                destination_file_name: destination_file.unwrap_or_else(|| source_file.clone()),
                source_file_name: source_file,
                service_class,
                session_key: config.session.key.as_deref().and_then(|key| key.parse().ok()),
                ..CfdpPutRequest::default()
            };
            let response = client.put(&request).await?;
            println!(
                "✅ CFDP PUT accepted: requestId={} transactionId={}:{}",
                response.request_id(),
                response.source_entity_id(),
                response.transaction_sequence_number()
            );
            Ok(())
        }
        Command::Time { sclk, time } => {
            if let Some(sclk) = sclk {
                let format = &config.sclk;
                let exact = format.parse(&sclk)?;
                println!(
                    "SCLK {} = exact {} (coarse {}, fine {}, float {}) = {}",
                    sclk,
                    exact,
                    format.coarse(exact),
                    format.fine(exact),
                    format.to_float(exact),
                    format.format(exact)
                );
            }
            if let Some(time) = time {
                let ms = parse_time_string(&time)?;
                println!(
                    "Time {} = {} ms = {} = {}",
                    time,
                    ms,
                    format_time(ms, false),
                    format_time(ms, true)
                );
            }
            Ok(())
        }
    }
}

/// Run `action` against an attached proxy, or against one spawned for the
/// command and shut down afterwards.
async fn with_auto_proxy<F, Fut>(config: MtakConfig, target: ProxyTarget, action: F) -> Result<()>
where
    F: FnOnce(std::sync::Arc<AutoProxy>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let proxy = std::sync::Arc::new(AutoProxy::new(config));
    let spawned = match target.url {
        Some(url) => {
            proxy.attach(&url)?;
            false
        }
        None => {
            proxy.start().await?;
            true
        }
    };

    let outcome = action(std::sync::Arc::clone(&proxy)).await;
    if spawned {
        if let Err(e) = proxy.shutdown().await {
            tracing::warn!("AUTO uplink proxy did not shut down cleanly: {}", e);
        }
    }
    outcome
}

async fn send_command(config: MtakConfig, args: SendCmdArgs) -> Result<()> {
    let uplink = UplinkProxy::new(config);
    uplink.start().await?;

    let options = UplinkOptions {
        validate: Some(!args.no_validate),
        string_id: args.string_id,
        virtual_channel: args.virtual_channel,
        scid: args.scid,
        wait_for_radiation: args.wait_for_radiation,
    };
    let outcome = uplink.send_flight_command(&args.command, &options).await;
    println!("{}", uplink.summary());
    uplink.stop().await?;
    outcome?;
    println!("✅ Command {} sent", args.command);
    Ok(())
}

async fn watch(config: MtakConfig, args: WatchArgs) -> Result<()> {
    let downlink = DownlinkProxy::new(config);
    match &args.replay {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            downlink.start_with_stream(file)?;
        }
        None => downlink.start().await?,
    }

    let options = WaitOptions {
        timeout: Some(args.seconds),
        ..WaitOptions::default()
    };
    let store = downlink.store();
    let matched = if let Some(channel_id) = args.channel_id {
        let condition = ChanValWait {
            channel_id: Some(channel_id),
            dn: args.dn,
            ..ChanValWait::default()
        };
        Some(store.register_sync_wait(condition, options).await?)
    } else if let Some(event_id) = args.event_id {
        let condition = EvrWait {
            event_id: Some(event_id),
            ..EvrWait::default()
        };
        Some(store.register_sync_wait(condition, options).await?)
    } else {
        tokio::time::sleep(Duration::from_secs(args.seconds.max(0) as u64)).await;
        None
    };

    let summary = store.summary();
    downlink.stop().await?;

    match matched {
        Some(Some(result)) => {
            for item in result.items() {
                println!("{}", serde_json::to_string(item)?);
            }
            println!("{}", summary);
            Ok(())
        }
        Some(None) => {
            println!("{}", summary);
            Err(MtakError::WaitError {
                message: format!("No matching telemetry within {} seconds", args.seconds),
            })
        }
        None => {
            println!("{}", summary);
            Ok(())
        }
    }
}

fn lad_client(config: &MtakConfig) -> Result<GlobalLadClient> {
    let url = validate_required_field("services.global_lad_url", &config.services.global_lad_url)?;
    GlobalLadClient::new(url, config.sclk.clone())?.with_timeout(config.services.request_timeout())
}
