use crate::integration::infrastructure::{loopback_repeater, SocketTestUtils};
use anyhow::Result;
use repeater_harness::{
    repeater_forwards_payload, shared, Config, HarnessSession, SharedService, UdpCollector,
};
use std::time::Duration;

/// The reference scenario: 8125 forwards to 9125, "foobar" arrives intact
#[tokio::test]
async fn test_repeater_works() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let config = Config::local(loopback_repeater(), Vec::new(), 8125, 9125);
    let report = repeater_forwards_payload(&config).await.map_err(anyhow::Error::msg)?;

    assert_eq!(report.messages.first().map(String::as_str), Some("foobar"));
    assert_eq!(report.messages.len(), 1);
    assert!(report.passed());
    Ok(())
}

/// Every payload comes out byte-for-byte as it went in, one message per send
#[tokio::test]
async fn test_payloads_forwarded_unmodified() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (repeater_port, collector_port) = SocketTestUtils::free_port_pair()?;
    let config = Config::local(loopback_repeater(), Vec::new(), repeater_port, collector_port);

    let mut session = HarnessSession::set_up(&config);
    let collector = shared(UdpCollector::new(config.collector_addr));
    session.add(collector.clone() as SharedService);
    session.start().await.map_err(anyhow::Error::msg)?;
    let client = session.client().map_err(anyhow::Error::msg)?;

    let payloads = [
        "foobar",
        "gorets:1|c",
        "glork:320|ms|@0.1",
        "  padded value  ",
        "multi\nline",
        "ünïcödé:1|g",
    ];
    for payload in payloads {
        let messages = session
            .run(async {
                let collector = collector.lock().await;
                let (messages, sent) = tokio::join!(
                    collector.collect(Duration::from_millis(100)),
                    client.send(payload)
                );
                sent?;
                messages
            })
            .await
            .map_err(anyhow::Error::msg)?;
        assert_eq!(messages, vec![payload.to_string()], "payload {:?} was altered", payload);
    }

    session.tear_down().await.map_err(anyhow::Error::msg)?;
    Ok(())
}

/// Several datagrams inside one window arrive in send order
#[tokio::test]
async fn test_burst_collected_in_order() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (repeater_port, collector_port) = SocketTestUtils::free_port_pair()?;
    let config = Config::local(loopback_repeater(), Vec::new(), repeater_port, collector_port);

    let mut session = HarnessSession::set_up(&config);
    let collector = shared(UdpCollector::new(config.collector_addr));
    session.add(collector.clone() as SharedService);
    session.start().await.map_err(anyhow::Error::msg)?;
    let client = session.client().map_err(anyhow::Error::msg)?;

    let messages = session
        .run(async {
            let collector = collector.lock().await;
            let sender = async {
                for i in 0..5 {
                    client.send(&format!("burst:{}|c", i)).await?;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok::<_, eyre::Report>(())
            };
            let (messages, sent) =
                tokio::join!(collector.collect(Duration::from_millis(300)), sender);
            sent?;
            messages
        })
        .await
        .map_err(anyhow::Error::msg)?;

    let expected: Vec<String> = (0..5).map(|i| format!("burst:{}|c", i)).collect();
    assert_eq!(messages, expected);

    session.tear_down().await.map_err(anyhow::Error::msg)?;
    Ok(())
}
