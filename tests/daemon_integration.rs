//! End-to-end tests: a real engine serving real Unix sockets in a scratch
//! config dir, driven through the wire protocol.

use serde_json::{Value, json};
use shellgate::daemon::{self, Engine};
use shellgate::settings::{EngineConfig, Paths};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

struct TestDaemon {
    paths: Paths,
    engine: Arc<Engine>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    work_dir: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestDaemon {
    async fn start(global_rules: &str, config: EngineConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::in_dir(dir.path());
        std::fs::write(paths.global_rules(), global_rules).unwrap();
        let work_dir = dir.path().join("work");
        std::fs::create_dir_all(&work_dir).unwrap();

        let engine = Engine::new(config, paths.clone());
        let handle = tokio::spawn(daemon::run(Arc::clone(&engine)));

        // Wait for the client endpoint to come up.
        for _ in 0..100 {
            if paths.engine_socket().exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(paths.engine_socket().exists(), "engine did not start");

        Self {
            paths,
            engine,
            handle,
            work_dir,
            _dir: dir,
        }
    }

    async fn client(&self) -> Wire {
        Wire::connect(self.paths.engine_socket()).await
    }

    async fn observer(&self) -> Wire {
        Wire::connect(self.paths.observer_socket()).await
    }

    fn execute_request(&self, command: &str) -> Value {
        json!({
            "type": "EXECUTE",
            "command": command,
            "working_dir": self.work_dir,
            "environment": {"PATH": "/usr/bin:/bin"},
            "execution_context": "human",
        })
    }

    async fn stop(self) {
        self.engine.trigger_shutdown();
        let _ = self.handle.await;
    }
}

struct Wire {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl Wire {
    async fn connect(path: PathBuf) -> Self {
        let stream = UnixStream::connect(&path).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn send(&mut self, message: &Value) {
        let line = serde_json::to_string(message).unwrap();
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn send_raw(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Read one line and require well-formed JSON (the round-trip property).
    async fn read(&mut self) -> Value {
        let line = self.read_line().await.expect("connection closed");
        serde_json::from_str(&line).expect("response is one valid JSON document")
    }

    async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await.unwrap();
        if n == 0 {
            None
        } else {
            Some(line.trim_end().to_string())
        }
    }

    /// Read events until one with the given name arrives.
    async fn next_event(&mut self, name: &str) -> Value {
        loop {
            let event = self.read().await;
            if event["event"] == name {
                return event;
            }
        }
    }
}

fn short_timeout_config() -> EngineConfig {
    EngineConfig {
        shell: "/bin/sh".to_string(),
        approval_timeout_secs: 1,
        ..EngineConfig::default()
    }
}

const DENY_MARKER_RULES: &str = r#"
rules:
  - name: no-marker
    commands: [echo]
    conditions:
      - type: command_contains
        substring: forbidden-marker
    action: deny
    message: "Marker commands are refused."
"#;

#[tokio::test]
async fn s1_allow_fast_path() {
    let daemon = TestDaemon::start(
        r#"
rules:
  - name: r1
    commands: [rm]
    action: deny
"#,
        short_timeout_config(),
    )
    .await;

    let mut client = daemon.client().await;
    client.send(&daemon.execute_request("ls -la")).await;
    let response = client.read().await;

    assert_eq!(response["decision"], "allow");
    assert_eq!(response["executed"], true);
    assert_eq!(response["exit_code"], 0);

    daemon.stop().await;
}

#[tokio::test]
async fn s2_explicit_deny() {
    let daemon = TestDaemon::start(DENY_MARKER_RULES, short_timeout_config()).await;

    let mut client = daemon.client().await;
    client
        .send(&daemon.execute_request("echo forbidden-marker"))
        .await;
    let response = client.read().await;

    assert_eq!(response["decision"], "deny");
    assert_eq!(response["rule"], "no-marker");
    assert_eq!(response["executed"], false);
    assert_eq!(response["exit_code"], Value::Null);
    assert_eq!(response["message"], "Marker commands are refused.");
    let stderr = response["stderr"].as_str().unwrap();
    assert!(stderr.contains("[SafetyLayer] BLOCKED"));
    assert!(stderr.contains("Rule: no-marker"));

    daemon.stop().await;
}

#[tokio::test]
async fn builtin_defaults_deny_rm_rf_root() {
    let daemon = TestDaemon::start("rules: []", short_timeout_config()).await;

    let mut client = daemon.client().await;
    client.send(&daemon.execute_request("rm -rf /")).await;
    let response = client.read().await;

    assert_eq!(response["decision"], "deny");
    assert_eq!(response["executed"], false);

    daemon.stop().await;
}

#[tokio::test]
async fn s3_redirect() {
    let daemon = TestDaemon::start(
        r#"
rules:
  - name: reroute
    commands: [badcmd]
    action: redirect
    redirect_to: "echo trash $ARGS"
"#,
        short_timeout_config(),
    )
    .await;

    let mut client = daemon.client().await;
    client.send(&daemon.execute_request("badcmd foo.txt")).await;
    let response = client.read().await;

    assert_eq!(response["decision"], "redirect");
    assert_eq!(response["substituted_command"], "echo trash foo.txt");
    assert_eq!(response["executed"], true);
    assert_eq!(response["stdout"], "trash foo.txt\n");

    daemon.stop().await;
}

const APPROVAL_RULES: &str = r#"
rules:
  - name: gated-echo
    commands: [echo]
    conditions:
      - type: command_contains
        substring: gated
    action: require_approval
    message: "Needs a human."
"#;

#[tokio::test]
async fn s4_approval_approved() {
    let config = EngineConfig {
        approval_timeout_secs: 30,
        ..short_timeout_config()
    };
    let daemon = TestDaemon::start(APPROVAL_RULES, config).await;

    let mut observer = daemon.observer().await;
    let mut client = daemon.client().await;
    client.send(&daemon.execute_request("echo gated run")).await;

    let needed = observer.next_event("approval_needed").await;
    let id = needed["payload"]["approval_id"].as_str().unwrap().to_string();
    assert_eq!(needed["payload"]["rule"], "gated-echo");

    observer
        .send(&json!({"type": "APPROVE", "approval_id": id, "message": "go"}))
        .await;

    let response = client.read().await;
    assert_eq!(response["decision"], "require_approval");
    assert_eq!(response["approval_outcome"], "approved");
    assert_eq!(response["approval_reason"], "go");
    assert_eq!(response["executed"], true);
    assert_eq!(response["exit_code"], 0);
    assert_eq!(response["stdout"], "gated run\n");

    let resolved = observer.next_event("approval_resolved").await;
    assert_eq!(resolved["payload"]["outcome"], "approved");

    daemon.stop().await;
}

#[tokio::test]
async fn s5_approval_timeout() {
    let daemon = TestDaemon::start(APPROVAL_RULES, short_timeout_config()).await;

    let mut client = daemon.client().await;
    client.send(&daemon.execute_request("echo gated run")).await;
    let response = client.read().await;

    assert_eq!(response["approval_outcome"], "timeout");
    assert_eq!(response["executed"], false);
    assert_eq!(response["exit_code"], Value::Null);

    daemon.stop().await;
}

#[tokio::test]
async fn s6_single_flight_approvals() {
    let config = EngineConfig {
        approval_timeout_secs: 30,
        ..short_timeout_config()
    };
    let daemon = TestDaemon::start(APPROVAL_RULES, config).await;

    let mut observer = daemon.observer().await;

    // Two clients, identical request, within the coalescing window.
    let mut first = daemon.client().await;
    let mut second = daemon.client().await;
    let request = daemon.execute_request("echo gated twice");
    first.send(&request).await;
    second.send(&request).await;

    let needed = observer.next_event("approval_needed").await;
    let id = needed["payload"]["approval_id"].as_str().unwrap().to_string();
    // Let the second request attach to the same entry before resolving.
    tokio::time::sleep(Duration::from_millis(100)).await;

    observer
        .send(&json!({"type": "APPROVE", "approval_id": id}))
        .await;

    let a = first.read().await;
    let b = second.read().await;
    for response in [&a, &b] {
        assert_eq!(response["approval_outcome"], "approved");
        assert_eq!(response["executed"], true);
    }

    // Exactly one approval_needed for the coalesced pair.
    let resolved = observer.next_event("approval_resolved").await;
    assert_eq!(resolved["payload"]["approval_id"].as_str().unwrap(), id);

    daemon.stop().await;
}

#[tokio::test]
async fn evaluate_does_not_execute() {
    let daemon = TestDaemon::start(DENY_MARKER_RULES, short_timeout_config()).await;

    let mut client = daemon.client().await;
    client
        .send(&json!({
            "type": "EVALUATE",
            "command": "echo forbidden-marker",
            "working_dir": daemon.work_dir,
            "environment": {},
            "execution_context": "ai",
        }))
        .await;
    let response = client.read().await;

    assert_eq!(response["decision"], "deny");
    assert_eq!(response["rule"], "no-marker");
    // EVALUATE responses carry no execution fields.
    assert!(response.get("executed").is_none());

    daemon.stop().await;
}

#[tokio::test]
async fn unparsable_request_gets_diagnostic_then_close() {
    let daemon = TestDaemon::start("rules: []", short_timeout_config()).await;

    let mut client = daemon.client().await;
    client.send_raw("this is not json").await;

    let response = client.read().await;
    assert_eq!(response["ok"], false);
    assert!(response["error"].as_str().unwrap().contains("invalid request"));

    // Server closed the connection after the diagnostic.
    assert_eq!(client.read_line().await, None);

    daemon.stop().await;
}

#[tokio::test]
async fn status_and_reload_round_trip() {
    let daemon = TestDaemon::start("rules: []", short_timeout_config()).await;

    let mut client = daemon.client().await;
    client.send(&json!({"type": "STATUS"})).await;
    let status = client.read().await;
    assert_eq!(status["ok"], true);
    assert!(status["rules_loaded"].as_u64().unwrap() > 0);

    let fingerprint = status["rules_fingerprint"].as_str().unwrap().to_string();

    // Grow the global layer and reload.
    std::fs::write(
        daemon.paths.global_rules(),
        r#"
rules:
  - name: added-later
    commands: [added-later-cmd]
    action: deny
"#,
    )
    .unwrap();
    client.send(&json!({"type": "RELOAD_RULES"})).await;
    let ack = client.read().await;
    assert_eq!(ack["ok"], true);

    client.send(&json!({"type": "STATUS"})).await;
    let status = client.read().await;
    assert_ne!(status["rules_fingerprint"].as_str().unwrap(), fingerprint);

    daemon.stop().await;
}

#[tokio::test]
async fn reload_with_broken_file_reports_and_retains() {
    let daemon = TestDaemon::start(DENY_MARKER_RULES, short_timeout_config()).await;

    let mut client = daemon.client().await;
    std::fs::write(daemon.paths.global_rules(), "rules: [").unwrap();

    client.send(&json!({"type": "RELOAD_RULES"})).await;
    let ack = client.read().await;
    assert_eq!(ack["ok"], false);
    assert!(ack["error"].as_str().unwrap().contains("reload failed"));

    // Prior policy still enforced.
    client
        .send(&daemon.execute_request("echo forbidden-marker"))
        .await;
    let response = client.read().await;
    assert_eq!(response["decision"], "deny");

    daemon.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn socket_permissions_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let daemon = TestDaemon::start("rules: []", short_timeout_config()).await;

    for path in [daemon.paths.engine_socket(), daemon.paths.observer_socket()] {
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600, "{} is not 0600", path.display());
    }

    daemon.stop().await;
}

#[tokio::test]
async fn shutdown_request_stops_engine_and_removes_sockets() {
    let daemon = TestDaemon::start("rules: []", short_timeout_config()).await;
    let engine_socket = daemon.paths.engine_socket();

    let mut client = daemon.client().await;
    client.send(&json!({"type": "SHUTDOWN"})).await;
    let ack = client.read().await;
    assert_eq!(ack["ok"], true);

    let _ = daemon.handle.await;
    assert!(!engine_socket.exists(), "socket node not removed");
}

#[tokio::test]
async fn observer_backlog_includes_existing_pending() {
    let config = EngineConfig {
        approval_timeout_secs: 30,
        ..short_timeout_config()
    };
    let daemon = TestDaemon::start(APPROVAL_RULES, config).await;

    // Create the pending approval before any observer connects.
    let mut client = daemon.client().await;
    client.send(&daemon.execute_request("echo gated late")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A late observer still learns about it.
    let mut observer = daemon.observer().await;
    let needed = observer.next_event("approval_needed").await;
    let id = needed["payload"]["approval_id"].as_str().unwrap().to_string();

    observer
        .send(&json!({"type": "DENY", "approval_id": id, "message": "no"}))
        .await;
    let response = client.read().await;
    assert_eq!(response["approval_outcome"], "denied");
    assert_eq!(response["approval_reason"], "no");
    assert_eq!(response["executed"], false);

    daemon.stop().await;
}
