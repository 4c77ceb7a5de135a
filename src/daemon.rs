//! The engine daemon: owns both byte-stream endpoints, runs the
//! evaluate/approve/execute pipeline, and fans lifecycle events out to
//! observers.
//!
//! All process-wide state (rule cache, git cache, approval table, event bus)
//! is bundled into [`Engine`] and passed explicitly into connection
//! handlers; there are no ambient singletons. Each accepted connection is an
//! independent task serving one in-flight request at a time, so responses on
//! a connection come back in request order.

use crate::approvals::ApprovalCoordinator;
use crate::cache::RuleCache;
use crate::evaluator;
use crate::events::{EventBus, EventKind};
use crate::executor::Executor;
use crate::git_context::GitContextCache;
use crate::models::{CommandContext, Decision, ExecutionContext};
use crate::protocol::{
    Ack, ApprovalParams, CommandParams, EvaluateResponse, ExecuteResponse, Request,
    StatusResponse, denial_banner,
};
use crate::rules::RuleSet;
use crate::settings::{self, EngineConfig, Paths};
use anyhow::Context as _;
use fs2::FileExt;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

pub const VERSION: &str = env!("GIT_VERSION");

/// Process-wide engine state, constructed once.
pub struct Engine {
    pub config: EngineConfig,
    pub paths: Paths,
    rules: RuleCache,
    git: GitContextCache,
    pub approvals: Arc<ApprovalCoordinator>,
    pub bus: EventBus,
    executor: Executor,
    started_at: Instant,
    active_connections: AtomicUsize,
    /// Size of the most recently acquired rule set, for status events.
    rules_seen: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

impl Engine {
    pub fn new(config: EngineConfig, paths: Paths) -> Arc<Self> {
        let bus = EventBus::new();
        let approvals = Arc::new(ApprovalCoordinator::new(
            config.approval_timeout(),
            bus.clone(),
        ));
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            rules: RuleCache::with_global_path(paths.global_rules()),
            git: GitContextCache::new(config.git_cache_ttl()),
            executor: Executor::new(config.shell.clone()),
            approvals,
            bus,
            config,
            paths,
            started_at: Instant::now(),
            active_connections: AtomicUsize::new(0),
            rules_seen: AtomicUsize::new(0),
            shutdown,
        })
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn shutdown_requested(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn diagnostic(&self, note: String) {
        tracing::error!("{note}");
        self.bus.publish(self.status_event(Some(note)));
    }

    fn status_event(&self, note: Option<String>) -> EventKind {
        EventKind::DaemonStatus {
            version: VERSION.to_string(),
            rules_loaded: self.rules_seen.load(Ordering::Relaxed),
            pending_approvals: self.approvals.pending_count(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            note,
        }
    }

    /// Active rule snapshot for a request. A failed rebuild is surfaced as a
    /// diagnostic while the request proceeds under the retained set; a repo
    /// layer that never loaded falls back to the global-only policy. Only
    /// with no loadable policy at all does the engine fail open.
    async fn active_rules(&self, working_dir: &Path) -> Option<Arc<RuleSet>> {
        let rules = match self.rules.acquire(working_dir).await {
            Ok(rules) => Some(rules),
            Err(err) => {
                self.diagnostic(format!("rule load failed: {err}"));
                match self.rules.acquire(working_dir).await {
                    Ok(rules) => Some(rules),
                    Err(_) => self.rules.acquire(Path::new("/")).await.ok(),
                }
            }
        };
        if let Some(rules) = &rules {
            self.rules_seen.store(rules.len(), Ordering::Relaxed);
        }
        rules
    }

    /// Build the request context and evaluate it, emitting the
    /// `command_received` and `evaluation_completed` events.
    async fn evaluate_command(&self, params: &CommandParams) -> (CommandContext, Decision) {
        let environment = settings::filter_environment(&params.environment);
        let execution_context = params.execution_context.unwrap_or_else(|| {
            if params.environment.contains_key(settings::AI_MARKER_ENV) {
                ExecutionContext::Ai
            } else {
                ExecutionContext::Human
            }
        });
        let mut ctx = CommandContext::new(
            params.command.clone(),
            params.working_dir.clone(),
            environment,
            execution_context,
        );

        self.bus.publish(EventKind::CommandReceived {
            fingerprint: ctx.fingerprint_hex(),
            command: ctx.command.clone(),
            working_dir: ctx.working_dir.to_string_lossy().into_owned(),
            execution_context,
        });

        let decision = match self.active_rules(&ctx.working_dir).await {
            Some(rules) => {
                if rules.wants_git(&ctx.executable) {
                    let git = self.git.lookup(&ctx.working_dir).await;
                    ctx.in_git_repo = Some(git.in_repo);
                    ctx.git_branch = git.branch;
                }
                evaluator::evaluate(&ctx, &rules)
            }
            None => {
                // Fail-open: losing protection beats locking the shell.
                self.diagnostic("no loadable rule set; allowing request".to_string());
                Decision::Allow
            }
        };

        self.bus.publish(EventKind::EvaluationCompleted {
            fingerprint: ctx.fingerprint_hex(),
            decision: decision.action().as_str().to_string(),
            rule: decision.rule_name().map(str::to_string),
            message: decision.message().map(str::to_string),
        });

        (ctx, decision)
    }

    pub async fn handle_evaluate(&self, params: &CommandParams) -> EvaluateResponse {
        let (_, decision) = self.evaluate_command(params).await;
        EvaluateResponse::from_decision(&decision)
    }

    pub async fn handle_execute(&self, params: &CommandParams) -> ExecuteResponse {
        let (ctx, decision) = self.evaluate_command(params).await;
        let fingerprint = ctx.fingerprint_hex();

        let response = match &decision {
            Decision::Allow => {
                let result = self
                    .executor
                    .execute(&ctx.command, &ctx.working_dir, &ctx.environment)
                    .await;
                ExecuteResponse::executed(&decision, None, &result)
            }
            Decision::Redirect {
                substituted_command,
                ..
            } => {
                let result = self
                    .executor
                    .execute(substituted_command, &ctx.working_dir, &ctx.environment)
                    .await;
                ExecuteResponse::executed(&decision, None, &result)
            }
            Decision::RequireApproval { rule, message } => {
                let resolution = self.approvals.request(&ctx, rule, message).await;
                if resolution.approved() {
                    let result = self
                        .executor
                        .execute(&ctx.command, &ctx.working_dir, &ctx.environment)
                        .await;
                    ExecuteResponse::executed(
                        &decision,
                        Some((&resolution.outcome, resolution.reason.as_deref())),
                        &result,
                    )
                } else {
                    ExecuteResponse::not_executed(
                        &decision,
                        Some((&resolution.outcome, resolution.reason.as_deref())),
                        Some(denial_banner(rule, message)),
                    )
                }
            }
            Decision::Deny { rule, message, .. } => ExecuteResponse::not_executed(
                &decision,
                None,
                Some(denial_banner(rule, message)),
            ),
        };

        self.bus.publish(EventKind::ExecutionCompleted {
            fingerprint,
            executed: response.executed,
            exit_code: response.exit_code,
            execution_time_ms: response.execution_time_ms,
        });

        response
    }

    pub fn resolve_approval(&self, params: &ApprovalParams, approved: bool) -> Ack {
        if self
            .approvals
            .resolve(&params.approval_id, approved, params.message.clone())
        {
            Ack::ok()
        } else {
            Ack::error(format!("no pending approval `{}`", params.approval_id))
        }
    }

    pub async fn status(&self) -> StatusResponse {
        let rules = self.active_rules(Path::new("/")).await;
        StatusResponse {
            ok: true,
            version: VERSION.to_string(),
            rules_loaded: rules.as_ref().map(|r| r.len()).unwrap_or(0),
            rules_fingerprint: rules
                .map(|r| r.fingerprint().to_string())
                .unwrap_or_default(),
            pending_approvals: self.approvals.pending_summaries(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }

    /// Serve one decoded request; returns the JSON response line (without
    /// the trailing newline).
    async fn dispatch(&self, request: Request) -> String {
        match request {
            Request::Evaluate(params) => to_line(&self.handle_evaluate(&params).await),
            Request::Execute(params) => to_line(&self.handle_execute(&params).await),
            Request::Approve(params) => to_line(&self.resolve_approval(&params, true)),
            Request::Deny(params) => to_line(&self.resolve_approval(&params, false)),
            Request::Status => to_line(&self.status().await),
            Request::ReloadRules => match self.rules.reload(Path::new("/")).await {
                Ok(rules) => {
                    tracing::info!(
                        rules = rules.len(),
                        fingerprint = rules.fingerprint(),
                        "rules reloaded"
                    );
                    to_line(&Ack::ok())
                }
                Err(err) => to_line(&Ack::error(format!("reload failed: {err}"))),
            },
            Request::Shutdown => {
                tracing::info!("shutdown requested over the client endpoint");
                to_line(&Ack::ok())
            }
        }
    }
}

fn to_line<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|e| format!(r#"{{"ok":false,"error":"encode failed: {e}"}}"#))
}

/// One client connection: sequential request/response lines. An unparsable
/// request gets a single diagnostic line and the connection is closed.
async fn handle_client(engine: Arc<Engine>, stream: UnixStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut shutdown = engine.shutdown_requested();

    loop {
        if *shutdown.borrow() {
            break;
        }
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.changed() => break,
        };
        let Ok(Some(line)) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let ack = to_line(&Ack::error(format!("invalid request: {err}")));
                let _ = write_half.write_all(ack.as_bytes()).await;
                let _ = write_half.write_all(b"\n").await;
                break;
            }
        };

        let closing = matches!(request, Request::Shutdown);
        let response = engine.dispatch(request).await;
        if write_half.write_all(response.as_bytes()).await.is_err()
            || write_half.write_all(b"\n").await.is_err()
        {
            break;
        }
        if closing {
            let _ = write_half.flush().await;
            engine.trigger_shutdown();
            break;
        }
    }
}

/// One observer connection: stream events out, accept APPROVE/DENY lines in.
async fn handle_observer(engine: Arc<Engine>, stream: UnixStream) {
    let mut subscription = engine.bus.subscribe();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Catch the new observer up: current status, then any approvals that
    // were already pending when it connected.
    let mut backlog = vec![crate::events::Event {
        kind: engine.status_event(None),
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
    }];
    for pending in engine.approvals.pending_summaries() {
        backlog.push(crate::events::Event {
            kind: EventKind::ApprovalNeeded {
                approval_id: pending.id,
                fingerprint: pending.fingerprint,
                command: pending.command,
                rule: pending.rule,
                reason: pending.reason,
                timeout_secs: pending.expires_in_secs,
            },
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        });
    }
    for event in backlog {
        if write_line(&mut write_half, &event).await.is_err() {
            return;
        }
    }

    let mut shutdown = engine.shutdown_requested();
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if write_line(&mut write_half, &event).await.is_err() {
                    break;
                }
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Request>(&line) {
                    Ok(Request::Approve(params)) => {
                        let _ = engine.resolve_approval(&params, true);
                    }
                    Ok(Request::Deny(params)) => {
                        let _ = engine.resolve_approval(&params, false);
                    }
                    Ok(other) => {
                        tracing::warn!(?other, "unsupported request on observer endpoint");
                    }
                    Err(err) => {
                        tracing::warn!(%err, "unparsable observer message");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn write_line<T: serde::Serialize>(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    value: &T,
) -> std::io::Result<()> {
    let line = to_line(value);
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

fn bind_endpoint(path: &Path) -> anyhow::Result<UnixListener> {
    // A previous unclean shutdown may have left the node behind.
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)
        .with_context(|| format!("bind {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod 0600 {}", path.display()))?;
    }
    Ok(listener)
}

/// Bind endpoints, load rules eagerly, serve until SHUTDOWN or a signal,
/// then drain: stop accepting, resolve pending approvals as shutdown, wait
/// for in-flight work, remove socket nodes.
pub async fn run(engine: Arc<Engine>) -> anyhow::Result<()> {
    std::fs::create_dir_all(&engine.paths.dir)
        .with_context(|| format!("create {}", engine.paths.dir.display()))?;

    // PID file under an exclusive lock: a second engine refuses to start.
    let mut pid_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(engine.paths.pid_file())?;
    pid_file
        .try_lock_exclusive()
        .context("another shellgate engine is already running")?;
    pid_file.set_len(0)?;
    writeln!(pid_file, "{}", std::process::id())?;

    let client_listener = bind_endpoint(&engine.paths.engine_socket())?;
    let observer_listener = bind_endpoint(&engine.paths.observer_socket())?;

    // Eager first load: a broken configuration at startup is an operator
    // error, not something to fail open over.
    let rules = engine
        .rules
        .acquire(Path::new("/"))
        .await
        .context("initial rule load failed")?;
    tracing::info!(
        version = VERSION,
        rules = rules.len(),
        fingerprint = rules.fingerprint(),
        socket = %engine.paths.engine_socket().display(),
        "engine listening"
    );
    engine.bus.publish(engine.status_event(None));

    // Terminating signals translate into the same shutdown path as the
    // SHUTDOWN request.
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(err) => {
                        tracing::error!(%err, "signal handler install failed");
                        return;
                    }
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            tracing::info!("terminating signal received");
            engine.trigger_shutdown();
        });
    }

    let mut connections: JoinSet<()> = JoinSet::new();
    let mut shutdown = engine.shutdown_requested();

    loop {
        tokio::select! {
            accepted = client_listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let engine = Arc::clone(&engine);
                connections.spawn(async move {
                    let active = engine.active_connections.fetch_add(1, Ordering::SeqCst) + 1;
                    if active > engine.config.max_connections {
                        // Soft cap: accept, refuse with a diagnostic, close.
                        tracing::warn!(active, "connection cap exceeded");
                        let mut stream = stream;
                        let ack = to_line(&Ack::error("too many connections"));
                        let _ = stream.write_all(ack.as_bytes()).await;
                        let _ = stream.write_all(b"\n").await;
                    } else {
                        handle_client(Arc::clone(&engine), stream).await;
                    }
                    engine.active_connections.fetch_sub(1, Ordering::SeqCst);
                });
            }
            accepted = observer_listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let engine = Arc::clone(&engine);
                connections.spawn(handle_observer(engine, stream));
            }
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!("draining: rejecting new connections");
    drop(client_listener);
    drop(observer_listener);

    engine.approvals.shutdown();
    while connections.join_next().await.is_some() {}

    let _ = std::fs::remove_file(engine.paths.engine_socket());
    let _ = std::fs::remove_file(engine.paths.observer_socket());
    let _ = fs2::FileExt::unlock(&pid_file);
    let _ = std::fs::remove_file(engine.paths.pid_file());
    tracing::info!("engine stopped");
    Ok(())
}
