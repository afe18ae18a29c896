//! End-to-end tests that run the `mcpgate` binary
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};

/// Child command that records its pid and then sleeps
const RECORDING_CHILD: &str = r#"sh -c 'echo $$ >> "$MCPGATE_TEST_PIDS"; exec sleep 60' child"#;

struct Gateway {
    child: Child,
    pids_file: PathBuf,
    port: u16,
    _dir: tempfile::TempDir,
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn gateway_command(config: &Path, pids_file: &Path, port: u16) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_mcpgate"));
    cmd.arg(config)
        .env("PORT", port.to_string())
        .env("BIND_ADDRESS", "127.0.0.1")
        .env("BASE_INTERNAL_PORT", "18300")
        .env("PYTHON_SERVER_PORT", "18299")
        .env("ADAPTER_COMMAND", RECORDING_CHILD)
        .env("LOCAL_TOOLS_COMMAND", RECORDING_CHILD)
        .env("SHUTDOWN_GRACE_PERIOD_SECS", "5")
        .env("MCPGATE_TEST_PIDS", pids_file)
        .env_remove("ADMIN_PORT")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Write `config` to a temp dir and start the gateway on a free port
async fn start_gateway(config: &str) -> Gateway {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("mcp.json");
    std::fs::write(&config_path, config).unwrap();
    let pids_file = dir.path().join("pids");
    let port = free_port().await;

    let child = gateway_command(&config_path, &pids_file, port).spawn().unwrap();
    Gateway {
        child,
        pids_file,
        port,
        _dir: dir,
    }
}

fn recorded_pids(path: &Path) -> Vec<i32> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

async fn wait_for_pids(path: &Path, count: usize) -> Vec<i32> {
    for _ in 0..200 {
        let pids = recorded_pids(path);
        if pids.len() >= count {
            return pids;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("expected {} children, saw {:?}", count, recorded_pids(path));
}

async fn wait_for_port(port: u16) {
    for _ in 0..200 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("gateway never listened on {}", port);
}

fn is_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

async fn assert_all_gone(pids: &[i32]) {
    for _ in 0..100 {
        if pids.iter().all(|&pid| !is_alive(pid)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let alive: Vec<i32> = pids.iter().copied().filter(|&pid| is_alive(pid)).collect();
    panic!("children still running: {:?}", alive);
}

async fn signal_and_wait(gateway: &mut Gateway, signal: i32) -> ExitStatus {
    let pid = gateway.child.id().expect("gateway is running") as i32;
    unsafe {
        libc::kill(pid, signal);
    }
    tokio::time::timeout(Duration::from_secs(20), gateway.child.wait())
        .await
        .expect("gateway did not exit")
        .unwrap()
}

const TWO_SERVERS: &str = r#"{"mcpServers": {
    "weather": {"command": "npx", "args": ["-y", "weather-mcp"]},
    "github": {"command": "gh-mcp"}
}}"#;

#[tokio::test]
async fn test_sigterm_stops_every_child_and_exits_zero() {
    let mut gateway = start_gateway(TWO_SERVERS).await;

    // Two adapters plus the local tools server
    let pids = wait_for_pids(&gateway.pids_file, 3).await;
    wait_for_port(gateway.port).await;
    assert!(pids.iter().all(|&pid| is_alive(pid)));

    let status = signal_and_wait(&mut gateway, libc::SIGTERM).await;

    assert!(status.success(), "exit status {:?}", status);
    assert_all_gone(&pids).await;
}

#[tokio::test]
async fn test_sigint_stops_every_child_and_exits_zero() {
    let mut gateway = start_gateway(TWO_SERVERS).await;

    let pids = wait_for_pids(&gateway.pids_file, 3).await;
    wait_for_port(gateway.port).await;

    let status = signal_and_wait(&mut gateway, libc::SIGINT).await;

    assert!(status.success(), "exit status {:?}", status);
    assert_all_gone(&pids).await;
}

/// Run the gateway against `config` and expect it to fail before starting
/// anything
async fn assert_startup_rejected(config: &str, expected_message: &str) {
    let gateway = start_gateway(config).await;
    let port = gateway.port;
    let pids_file = gateway.pids_file.clone();

    let output = tokio::time::timeout(Duration::from_secs(20), gateway.child.wait_with_output())
        .await
        .expect("gateway did not exit")
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains(expected_message), "stderr: {}", stderr);

    // Nothing was spawned and the public port is still free
    assert!(recorded_pids(&pids_file).is_empty());
    assert!(!pids_file.exists());
    TcpListener::bind(("127.0.0.1", port)).await.unwrap();
}

#[tokio::test]
async fn test_empty_server_list_aborts_startup() {
    assert_startup_rejected(r#"{"mcpServers": {}}"#, "contains no servers").await;
}

#[tokio::test]
async fn test_malformed_config_aborts_startup() {
    assert_startup_rejected(r#"{"mcpServers": {"weather": "#, "invalid JSON").await;
}

#[tokio::test]
async fn test_occupied_port_stops_children_and_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("mcp.json");
    std::fs::write(&config_path, TWO_SERVERS).unwrap();
    let pids_file = dir.path().join("pids");

    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let child = gateway_command(&config_path, &pids_file, port).spawn().unwrap();
    let output = tokio::time::timeout(Duration::from_secs(20), child.wait_with_output())
        .await
        .expect("gateway did not exit")
        .unwrap();

    assert!(!output.status.success());
    let pids = recorded_pids(&pids_file);
    assert_all_gone(&pids).await;
}
