use ampcs_mtak::core::wait::{ChanValWait, CompoundWait, EvrWait};
use ampcs_mtak::domain::codec::to_wire;
use ampcs_mtak::domain::model::{ChanVal, ChannelType, Dn, Evr, Telemetry};
use ampcs_mtak::{DownlinkProxy, MtakConfig, WaitOptions};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};

fn channel_value(id: &str, dn: i64, coarse: u64) -> Telemetry {
    ChanVal {
        channel_id: id.to_string(),
        name: format!("{}_NAME", id),
        channel_type: ChannelType::SignedInt,
        dn: Some(Dn::Int(dn)),
        realtime: true,
        sclk: format!("{:010}-00000", coarse),
        sclk_coarse: coarse,
        sclk_exact: coarse << 16,
        ..ChanVal::default()
    }
    .into()
}

fn evr(event_id: i64, message: &str) -> Telemetry {
    Evr {
        name: format!("EVR_{}", event_id),
        level: "COMMAND".to_string(),
        event_id,
        message: message.to_string(),
        realtime: true,
        ..Evr::default()
    }
    .into()
}

async fn send(feed: &mut DuplexStream, item: &Telemetry) {
    let line = format!("{}\n", to_wire(item));
    feed.write_all(line.as_bytes()).await.unwrap();
    feed.flush().await.unwrap();
}

fn proxy_with_feed() -> (DownlinkProxy, DuplexStream) {
    let proxy = DownlinkProxy::new(MtakConfig::default());
    let (feed, stream) = tokio::io::duplex(64 * 1024);
    proxy.start_with_stream(stream).unwrap();
    (proxy, feed)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_streamed_telemetry_fills_tables_and_clock() {
    let (proxy, mut feed) = proxy_with_feed();
    send(&mut feed, &channel_value("A-0001", 4, 100)).await;
    send(&mut feed, &channel_value("A-0001", 5, 101)).await;
    send(&mut feed, &evr(12, "Dispatched")).await;
    settle().await;

    let store = proxy.store();
    assert_eq!(store.counters().chan_val, 2);
    assert_eq!(store.counters().evr, 1);
    assert_eq!(store.current_sclk_exact(), 101 << 16);
    {
        let channels = store.realtime_channels();
        let latest = channels.latest(Some("A-0001"), None).unwrap();
        assert_eq!(latest.dn, Some(Dn::Int(5)));
    }
    assert!(store.summary().contains("Total Channel Values Received = 2"));

    proxy.stop().await.unwrap();
    assert!(!proxy.is_running());
}

#[tokio::test]
async fn test_wait_released_by_arriving_channel_value() {
    let (proxy, mut feed) = proxy_with_feed();
    let store = proxy.store().clone();

    let waiter = tokio::spawn(async move {
        let condition = ChanValWait {
            channel_id: Some("B-0002".to_string()),
            dn: Some("9".to_string()),
            ..ChanValWait::default()
        };
        let options = WaitOptions {
            timeout: Some(5),
            ..WaitOptions::default()
        };
        store.register_sync_wait(condition, options).await
    });

    settle().await;
    send(&mut feed, &channel_value("B-0002", 8, 10)).await;
    send(&mut feed, &channel_value("B-0002", 9, 11)).await;

    let result = waiter.await.unwrap().unwrap().expect("wait should succeed");
    match result.into_single() {
        Some(Telemetry::ChannelValue(value)) => assert_eq!(value.dn, Some(Dn::Int(9))),
        other => panic!("unexpected result {:?}", other),
    }
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_compound_and_wait_needs_every_condition() {
    let (proxy, mut feed) = proxy_with_feed();
    let store = proxy.store().clone();

    let waiter = tokio::spawn(async move {
        let compound = CompoundWait::and(vec![
            EvrWait {
                event_id: Some(1),
                ..EvrWait::default()
            }
            .into(),
            EvrWait {
                event_id: Some(2),
                ..EvrWait::default()
            }
            .into(),
        ]);
        let options = WaitOptions {
            timeout: Some(5),
            ..WaitOptions::default()
        };
        store.register_sync_wait(compound, options).await
    });

    settle().await;
    send(&mut feed, &evr(1, "first")).await;
    settle().await;
    assert!(!waiter.is_finished());
    send(&mut feed, &evr(2, "second")).await;

    let result = waiter.await.unwrap().unwrap().expect("compound wait should succeed");
    assert_eq!(result.items().len(), 2);
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_wait_times_out_without_matching_telemetry() {
    let (proxy, mut feed) = proxy_with_feed();
    send(&mut feed, &evr(3, "other")).await;

    let condition = EvrWait {
        event_id: Some(99),
        ..EvrWait::default()
    };
    let options = WaitOptions {
        timeout: Some(1),
        ..WaitOptions::default()
    };
    let result = proxy
        .store()
        .register_sync_wait(condition, options)
        .await
        .unwrap();
    assert!(result.is_none());
    assert_eq!(proxy.store().pending_waits(), 0);
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_wait_by_sclk_follows_the_stream() {
    let (proxy, mut feed) = proxy_with_feed();
    send(&mut feed, &channel_value("C-0003", 1, 200)).await;
    settle().await;

    let store = proxy.store().clone();
    let sleeper = tokio::spawn(async move { store.wait_by_sclk(5.0).await });

    settle().await;
    assert!(!sleeper.is_finished());
    send(&mut feed, &channel_value("C-0003", 2, 206)).await;

    tokio::time::timeout(Duration::from_secs(2), sleeper)
        .await
        .expect("sclk wait should finish")
        .unwrap();
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_lines_are_skipped() {
    let (proxy, mut feed) = proxy_with_feed();
    feed.write_all(b"chan,not,enough\n").await.unwrap();
    send(&mut feed, &channel_value("D-0004", 3, 5)).await;
    settle().await;

    assert_eq!(proxy.store().counters().chan_val, 1);
    proxy.stop().await.unwrap();
}
