use ampcs_mtak::core::CommandUplink;
use ampcs_mtak::{AutoProxy, MtakConfig, MtakError};
use httpmock::prelude::*;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

fn attached_proxy(server: &MockServer) -> AutoProxy {
    let mut config = MtakConfig::default();
    config.proxy.status_retries = 1;
    config.proxy.status_retry_delay_secs = 0;
    let proxy = AutoProxy::new(config);
    proxy.attach(&server.base_url()).unwrap();
    proxy
}

#[tokio::test]
async fn test_status_and_readiness() {
    let server = MockServer::start();
    let status_mock = server.mock(|when, then| {
        when.method(GET).path("/auto/status");
        then.status(200).body("OK");
    });

    let proxy = attached_proxy(&server);
    assert_eq!(proxy.status().await.unwrap(), "OK");
    proxy.check_ready().await.unwrap();
    status_mock.assert_hits(2);
}

#[tokio::test]
async fn test_readiness_failure_names_the_status_url() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/auto/status");
        then.status(200).body("STARTING");
    });

    let proxy = attached_proxy(&server);
    match proxy.check_ready().await {
        Err(MtakError::AmpcsError { message }) => {
            assert!(message.starts_with("Unable to GET AUTO status @"));
            assert!(message.ends_with("auto/status"));
        }
        other => panic!("expected AmpcsError, got {:?}", other),
    }
}

#[tokio::test]
async fn test_init_session_with_existing_session() {
    let server = MockServer::start();
    let session_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/auto/session")
            .query_param("sessionId", "42")
            .query_param("sessionHost", "gds-host");
        then.status(200)
            .body("venue=TESTSET,key=42,host=gds-host,scid=76");
    });

    let proxy = attached_proxy(&server);
    let session = proxy
        .init_session(None, Some("42"), Some("gds-host"))
        .await
        .unwrap();
    session_mock.assert();
    assert_eq!(session.key, "42");
    assert_eq!(session.venue, "TESTSET");
    assert_eq!(proxy.session(), Some(session));
}

#[tokio::test]
async fn test_init_session_with_config_file() {
    let server = MockServer::start();
    let mut session_file = NamedTempFile::new().unwrap();
    writeln!(session_file, "<Session/>").unwrap();
    let path = session_file.path().to_str().unwrap().to_string();

    let session_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/auto/session")
            .query_param("sessionConfigFile", path.as_str());
        then.status(200).body("venue=ATLO,key=7,host=h,scid=1");
    });

    let proxy = attached_proxy(&server);
    let session = proxy.init_session(Some(&path), None, None).await.unwrap();
    session_mock.assert();
    assert_eq!(session.venue, "ATLO");
}

#[tokio::test]
async fn test_log_sends_level_and_message() {
    let server = MockServer::start();
    let log_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/auto/log")
            .query_param("level", "WARNING")
            .query_param("message", "heater check");
        then.status(200).body("");
    });

    let proxy = attached_proxy(&server);
    proxy.send_log("warn", "heater check").await.unwrap();
    log_mock.assert();
}

#[tokio::test]
async fn test_send_scmf_with_rates_and_counts() {
    let server = MockServer::start();
    let scmf_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/auto/send_scmf")
            .query_param("scmfFile", "/data/load.scmf")
            .query_param("validateScmf", "false")
            .query_param("waitForRadiation", "5")
            .query_param("uplinkRates", "1000,2000");
        then.status(200).body("");
    });

    let proxy = attached_proxy(&server);
    proxy
        .set_uplink_rates(Some(&[1000.0, 2000.0]))
        .await
        .unwrap();
    proxy
        .send_scmf("/data/load.scmf", Some(true), 5)
        .await
        .unwrap();
    scmf_mock.assert();

    let counters = proxy.counters();
    assert_eq!(counters.scmfs_sent, 1);
    assert_eq!(counters.failed_scmfs, 0);
    assert!(proxy.summary().contains("AUTO"));
}

#[tokio::test]
async fn test_unauthorized_maps_to_authentication_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/auto/send_scmf");
        then.status(401).body("bad ticket");
    });

    let proxy = attached_proxy(&server);
    let result = proxy.send_scmf_file("/data/load.scmf", true, 0).await;
    assert!(matches!(result, Err(MtakError::AuthenticationError { .. })));
    assert_eq!(proxy.counters().failed_scmfs, 1);
}

#[tokio::test]
async fn test_send_pdu_uploads_multipart_on_vcid_path() {
    let server = MockServer::start();
    let dir = TempDir::new().unwrap();
    let pdu_path = dir.path().join("file.pdu");
    std::fs::write(&pdu_path, [0x01u8, 0x02, 0x03]).unwrap();

    let pdu_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/auto/send_pdu_file/3")
            .query_param("destinationEntityId", "25")
            .body_contains("pduFile");
        then.status(200).body("");
    });

    let proxy = attached_proxy(&server);
    proxy
        .send_pdu_file(pdu_path.to_str().unwrap(), "25", Some("3"))
        .await
        .unwrap();
    pdu_mock.assert();
    assert_eq!(proxy.counters().pdus_sent, 1);
}

#[tokio::test]
async fn test_only_scmf_and_pdu_uploads_are_supported() {
    let server = MockServer::start();
    let any_request = server.mock(|when, then| {
        when.any_request();
        then.status(200);
    });

    let proxy = attached_proxy(&server);
    let result = proxy
        .send_flight_command("NOOP", &Default::default())
        .await;
    assert!(matches!(result, Err(MtakError::NotImplemented { .. })));

    let result = proxy.send_raw_data("/data/frame.bin", Some(false), 0).await;
    assert!(matches!(result, Err(MtakError::NotImplemented { .. })));

    let result = proxy
        .send_command_list_file("/data/cmds.txt", &Default::default())
        .await;
    assert!(matches!(result, Err(MtakError::NotImplemented { .. })));
    any_request.assert_hits(0);
}
