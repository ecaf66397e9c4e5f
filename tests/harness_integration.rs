/// End-to-end runs against throwaway localhost servers: the harness keeping
/// connections alive, a server enforcing an idle timeout, a refusing target,
/// and an operator stop mid-run. Timings are millisecond-scale versions of
/// the second-scale scenarios the harness is meant for.
use std::{net::SocketAddr, time::Duration};

use loris::{config::LorisConfig, error::HarnessError, harness::Harness};
use tokio::{
    io::AsyncReadExt,
    net::TcpListener,
    sync::broadcast,
    task::JoinHandle,
    time::timeout,
};

/// Server that drops any connection idle (no bytes received) longer than
/// `idle`. Connections live until the client stops dripping.
async fn spawn_idle_server(idle: Duration) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match timeout(idle, stream.read(&mut buf)).await {
                        Ok(Ok(0)) | Ok(Err(_)) => break,
                        Ok(Ok(_)) => {}
                        // Idle timeout: dropping the stream sends the FIN
                        // the harness is supposed to observe.
                        Err(_) => break,
                    }
                }
            });
        }
    });
    (addr, handle)
}

fn config_for(addr: SocketAddr) -> LorisConfig {
    let mut config = LorisConfig::default();
    config.target = addr.to_string();
    config.target_count = 10;
    config.ramp_rate = 100;
    config.drip_jitter_ms = 0;
    config.tick_ms = 10;
    config.connect_timeout_ms = 1000;
    config.write_timeout_ms = 500;
    config.shutdown_grace_ms = 1000;
    config
}

fn harness(config: LorisConfig) -> (Harness, broadcast::Sender<()>) {
    let (stop, _) = broadcast::channel(1);
    (Harness::new(config, stop.clone()), stop)
}

#[tokio::test]
async fn dripping_faster_than_the_idle_timeout_survives_the_run() {
    let (addr, server) = spawn_idle_server(Duration::from_millis(500)).await;
    let mut config = config_for(addr);
    config.drip_interval_ms = 150;
    config.duration_ms = 1200;

    let (harness, _stop) = harness(config);
    let report = harness.run().await.expect("run");

    assert_eq!(report.attempted, 10);
    assert_eq!(report.established, 10);
    assert_eq!(report.harness_closed, 10);
    assert_eq!(report.peer_closed, 0);
    assert_eq!(report.errored, 0);
    assert_eq!(report.accounted(), report.attempted);
    server.abort();
}

#[tokio::test]
async fn dripping_slower_than_the_idle_timeout_gets_every_connection_dropped() {
    let (addr, server) = spawn_idle_server(Duration::from_millis(300)).await;
    let mut config = config_for(addr);
    // Misconfigured on purpose: first drip lands after the server gave up.
    config.drip_interval_ms = 800;
    config.duration_ms = 3000;

    let (harness, _stop) = harness(config);
    let report = harness.run().await.expect("run");

    assert_eq!(report.attempted, 10);
    assert_eq!(report.established, 10);
    assert_eq!(report.peer_closed, 10);
    assert_eq!(report.harness_closed, 0);
    assert_eq!(report.accounted(), report.attempted);

    // The close is observed at the drip after the server's timeout, so the
    // recorded alive times sit between the idle limit and the drip interval
    // (plus loop slack).
    let stats = report.time_to_peer_close_ms.expect("peer close stats");
    assert!(stats.min >= 300, "min {} under the idle limit", stats.min);
    assert!(stats.max < 3000, "max {} exceeds the run window", stats.max);
    server.abort();
}

#[tokio::test]
async fn refusing_target_accounts_every_attempt_as_connect_refused() {
    // Bind then drop to get a port with nothing listening on it.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let mut config = config_for(addr);
    config.drip_interval_ms = 100;
    config.duration_ms = 2000;
    config.fail_fast_first_connect = false;

    let (harness, _stop) = harness(config);
    let report = harness.run().await.expect("run");

    assert_eq!(report.attempted, 10);
    assert_eq!(report.established, 0);
    assert_eq!(report.errored, 10);
    assert_eq!(report.errors.get("connect_refused"), Some(&10));
    assert_eq!(report.accounted(), report.attempted);
}

#[tokio::test]
async fn refused_first_attempt_fails_fast_when_configured() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let mut config = config_for(addr);
    config.duration_ms = 2000;

    let (harness, _stop) = harness(config);
    match harness.run().await {
        Err(HarnessError::Configuration(msg)) => {
            assert!(msg.contains("first attempt"), "unexpected message: {msg}");
        }
        other => panic!("expected configuration error, got {other:?}"),
    }
}

#[tokio::test]
async fn unresolvable_target_is_a_configuration_error() {
    let mut config = LorisConfig::default();
    config.target = "host.invalid:80".to_string();
    config.duration_ms = 1000;

    let (harness, _stop) = harness(config);
    assert!(matches!(
        harness.run().await,
        Err(HarnessError::Configuration(_))
    ));
}

#[tokio::test]
async fn stop_mid_run_closes_everything_with_exact_accounting() {
    let (addr, server) = spawn_idle_server(Duration::from_millis(500)).await;
    let mut config = config_for(addr);
    config.drip_interval_ms = 100;
    config.duration_ms = 30_000;

    let (harness, stop) = harness(config);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        let _ = stop.send(());
    });

    let report = timeout(Duration::from_secs(5), harness.run())
        .await
        .expect("run finished well before the nominal duration")
        .expect("run");

    assert_eq!(report.attempted, 10);
    assert_eq!(report.established, 10);
    assert_eq!(report.harness_closed, 10);
    assert_eq!(report.accounted(), report.attempted);
    assert!(report.duration_ms < 5000);
    server.abort();
}
