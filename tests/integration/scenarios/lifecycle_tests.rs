use crate::integration::infrastructure::{loopback_repeater, SocketTestUtils};
use anyhow::Result;
use nix::sys::signal::{kill, Signal};
use repeater_harness::{
    shared, Config, HarnessSession, ManagedService, ProcessState, ServiceError, ServiceState,
    SharedService, UdpCollector, UnexpectedTermination,
};
use std::time::Duration;
use tracing::debug;

fn loopback_config() -> Result<Config> {
    let (repeater_port, collector_port) = SocketTestUtils::free_port_pair()?;
    Ok(Config::local(loopback_repeater(), Vec::new(), repeater_port, collector_port))
}

/// Both services come up in order and go down in the same order
#[tokio::test]
async fn test_session_lifecycle() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let config = loopback_config()?;
    let mut session = HarnessSession::set_up(&config);
    let collector = shared(UdpCollector::new(config.collector_addr));
    session.add(collector.clone() as SharedService);

    // Nothing is exposed before readiness
    assert!(session.client().is_err());
    assert_eq!(session.repeater().lock().await.process_state(), ProcessState::Idle);

    session.start().await.map_err(anyhow::Error::msg)?;
    {
        let repeater = session.repeater().lock().await;
        assert_eq!(repeater.process_state(), ProcessState::Active);
        assert!(repeater.is_running());
        debug!("repeater running with PID {:?}", repeater.pid());
    }
    assert_eq!(collector.lock().await.state(), ServiceState::Running);
    assert!(session.client().is_ok());

    let repeater = session.repeater().clone();
    session.tear_down().await.map_err(anyhow::Error::msg)?;

    let repeater = repeater.lock().await;
    assert_eq!(repeater.process_state(), ProcessState::Terminated);
    assert!(!repeater.is_running());
    assert_eq!(collector.lock().await.state(), ServiceState::Stopped);
    Ok(())
}

/// Killing the repeater behind the harness's back fails the session for good
#[tokio::test]
async fn test_repeater_crash_is_fatal() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let config = loopback_config()?;
    let mut session = HarnessSession::set_up(&config);
    session.start().await.map_err(anyhow::Error::msg)?;

    let pid = session
        .repeater()
        .lock()
        .await
        .pid()
        .ok_or_else(|| anyhow::anyhow!("repeater has no pid"))?;
    kill(pid, Signal::SIGKILL)?;

    let err = session
        .run(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await
        .expect_err("step should be abandoned when the repeater dies");
    let fault = err
        .downcast_ref::<UnexpectedTermination>()
        .expect("error should be the termination fault");
    assert_eq!(fault.service, "repeater");
    assert_eq!(fault.code, None, "killed by a signal, so no exit code");

    assert!(session.run(async { Ok(()) }).await.is_err());
    session.tear_down().await.map_err(anyhow::Error::msg)?;
    Ok(())
}

/// A repeater that never prints the marker fails start instead of hanging
#[tokio::test]
async fn test_silent_repeater_times_out() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut config = Config::local(
        "sh",
        vec!["-c".to_string(), "echo warming up; exec sleep 30".to_string()],
        18600,
        19600,
    );
    config.process.readiness_timeout = Duration::from_millis(300);

    let mut session = HarnessSession::set_up(&config);
    let started = tokio::time::timeout(Duration::from_secs(5), session.start()).await?;
    let err = started.expect_err("start should fail");
    assert!(matches!(
        err.downcast_ref::<ServiceError>(),
        Some(ServiceError::LaunchTimeout { .. })
    ));
    assert!(session.failure().is_none(), "a launch timeout is not a crash");

    session.tear_down().await.map_err(anyhow::Error::msg)?;
    Ok(())
}

/// An occupied collector port surfaces as a setup failure after the repeater started
#[tokio::test]
async fn test_collector_bind_failure() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (_occupied, collector_port) = SocketTestUtils::occupy_udp_port()?;
    let repeater_port = SocketTestUtils::free_udp_port()?;
    let config = Config::local(loopback_repeater(), Vec::new(), repeater_port, collector_port);

    let mut session = HarnessSession::set_up(&config);
    session.add(shared(UdpCollector::new(config.collector_addr)) as SharedService);

    let err = session.start().await.expect_err("bind should fail");
    assert!(matches!(
        err.downcast_ref::<ServiceError>(),
        Some(ServiceError::Bind { .. })
    ));
    assert!(session.client().is_err());

    // The repeater was already up; teardown must still stop it cleanly
    let repeater = session.repeater().clone();
    session.tear_down().await.map_err(anyhow::Error::msg)?;
    assert_eq!(repeater.lock().await.process_state(), ProcessState::Terminated);
    Ok(())
}
