//! Drives the demo worker binary as a real child process.

use std::time::Duration;

use stdbridge::{HostBridge, HostConfig};
use tokio::process::Command;

const WAIT: Duration = Duration::from_secs(10);

fn spawn_demo(config: HostConfig) -> (HostBridge, tokio::process::Child) {
    let mut command = Command::new(env!("CARGO_BIN_EXE_stdbridge-demo-worker"));
    command.env("STDBRIDGE_LOG", "warn").kill_on_drop(true);
    HostBridge::spawn(command, config).expect("failed to spawn demo worker")
}

#[tokio::test]
async fn demo_worker_serves_calls_and_channels() {
    let (host, mut child) = spawn_demo(HostConfig::default().with_call_timeout(WAIT));

    let add = tokio::time::timeout(WAIT, host.wait_for_function("add"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(add.call([10, 20]).unwrap().await, Ok("30".to_string()));

    let find_longer = tokio::time::timeout(WAIT, host.wait_for_function("find_longer"))
        .await
        .unwrap()
        .unwrap();
    let result = find_longer.call(["foo", "longer_foo"]).unwrap().await;
    assert_eq!(result, Ok("longer_foo".to_string()));

    let echoed = host.receive("channel_echo");
    host.send("channel_a", "hello worker").unwrap();
    assert_eq!(
        tokio::time::timeout(WAIT, echoed).await.unwrap(),
        Ok("hello worker".to_string())
    );

    host.close().await.unwrap();
    tokio::time::timeout(WAIT, host.closed()).await.unwrap();
    assert!(host.is_closed());

    let status = tokio::time::timeout(WAIT, child.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn demo_worker_reports_errors_when_enabled() {
    let mut command = Command::new(env!("CARGO_BIN_EXE_stdbridge-demo-worker"));
    command
        .env("STDBRIDGE_LOG", "error")
        .env("STDBRIDGE_ERROR_FRAMES", "1")
        .kill_on_drop(true);
    let (host, _child) = HostBridge::spawn(command, HostConfig::default()).unwrap();

    let add = tokio::time::timeout(WAIT, host.wait_for_function("add"))
        .await
        .unwrap()
        .unwrap();
    let result = tokio::time::timeout(WAIT, add.call(["ten"]).unwrap())
        .await
        .unwrap();
    assert!(matches!(result, Err(stdbridge::CallError::Remote(_))));
}
