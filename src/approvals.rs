//! Pending-approval coordination: suspend `require_approval` requests until
//! an observer resolves them or the deadline passes.
//!
//! Requests with the same fingerprint coalesce into one entry (single
//! flight): observers see one prompt, and every waiter receives the same
//! resolution through its own one-shot channel. All table mutations happen
//! under one short-lived lock; waiting happens outside it.

use crate::events::{EventBus, EventKind};
use crate::models::{ApprovalOutcome, CommandContext};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// How a wait ended, with the optional human-supplied reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: ApprovalOutcome,
    pub reason: Option<String>,
}

impl Resolution {
    pub fn approved(&self) -> bool {
        self.outcome == ApprovalOutcome::Approved
    }
}

struct Entry {
    fingerprint: String,
    command: String,
    rule_name: String,
    reason: String,
    deadline: Instant,
    waiters: Vec<oneshot::Sender<Resolution>>,
}

/// Summary of one pending entry, for STATUS output.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PendingSummary {
    pub id: String,
    pub fingerprint: String,
    pub command: String,
    pub rule: String,
    pub reason: String,
    pub expires_in_secs: u64,
}

pub struct ApprovalCoordinator {
    timeout: Duration,
    bus: EventBus,
    pending: Mutex<HashMap<String, Entry>>,
}

impl ApprovalCoordinator {
    pub fn new(timeout: Duration, bus: EventBus) -> Self {
        Self {
            timeout,
            bus,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for a human verdict on `ctx`. Coalesces with any existing entry
    /// for the same fingerprint; otherwise creates one and announces it.
    pub async fn request(
        &self,
        ctx: &CommandContext,
        rule_name: &str,
        reason: &str,
    ) -> Resolution {
        let fingerprint = ctx.fingerprint_hex();
        let (tx, mut rx) = oneshot::channel();

        let (id, deadline, is_new) = {
            let mut pending = self.pending.lock().unwrap();

            if let Some((id, entry)) = pending
                .iter_mut()
                .find(|(_, e)| e.fingerprint == fingerprint)
            {
                entry.waiters.push(tx);
                (id.clone(), entry.deadline, false)
            } else {
                let id = short_id();
                let deadline = Instant::now() + self.timeout;
                pending.insert(
                    id.clone(),
                    Entry {
                        fingerprint: fingerprint.clone(),
                        command: ctx.command.clone(),
                        rule_name: rule_name.to_string(),
                        reason: reason.to_string(),
                        deadline,
                        waiters: vec![tx],
                    },
                );
                (id, deadline, true)
            }
        };

        if is_new {
            self.bus.publish(EventKind::ApprovalNeeded {
                approval_id: id.clone(),
                fingerprint,
                command: ctx.command.clone(),
                rule: rule_name.to_string(),
                reason: reason.to_string(),
                timeout_secs: self.timeout.as_secs(),
            });
        }

        tokio::select! {
            resolution = &mut rx => match resolution {
                Ok(resolution) => resolution,
                // Sender dropped without a verdict: coordinator went away.
                Err(_) => Resolution {
                    outcome: ApprovalOutcome::Denied,
                    reason: Some("shutdown".to_string()),
                },
            },
            _ = tokio::time::sleep_until(deadline) => {
                // Settle the entry as timed out; if a verdict raced ahead,
                // resolve_with is a no-op and the channel already holds the
                // authoritative resolution for every waiter.
                self.resolve_with(&id, ApprovalOutcome::Timeout, Some("timeout".to_string()));
                match rx.await {
                    Ok(resolution) => resolution,
                    Err(_) => Resolution {
                        outcome: ApprovalOutcome::Timeout,
                        reason: Some("timeout".to_string()),
                    },
                }
            }
        }
    }

    /// Observer verdict. Returns false when the id is unknown or already
    /// settled (only the first resolve takes effect).
    pub fn resolve(&self, id: &str, approved: bool, message: Option<String>) -> bool {
        let outcome = if approved {
            ApprovalOutcome::Approved
        } else {
            ApprovalOutcome::Denied
        };
        self.resolve_with(id, outcome, message)
    }

    fn resolve_with(&self, id: &str, outcome: ApprovalOutcome, reason: Option<String>) -> bool {
        let entry = {
            let mut pending = self.pending.lock().unwrap();
            pending.remove(id)
        };
        let Some(entry) = entry else {
            return false;
        };

        let resolution = Resolution {
            outcome,
            reason: reason.clone(),
        };
        for waiter in entry.waiters {
            let _ = waiter.send(resolution.clone());
        }

        self.bus.publish(EventKind::ApprovalResolved {
            approval_id: id.to_string(),
            fingerprint: entry.fingerprint,
            outcome,
            reason,
        });
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn pending_summaries(&self) -> Vec<PendingSummary> {
        let now = Instant::now();
        let pending = self.pending.lock().unwrap();
        let mut summaries: Vec<_> = pending
            .iter()
            .map(|(id, entry)| PendingSummary {
                id: id.clone(),
                fingerprint: entry.fingerprint.clone(),
                command: entry.command.clone(),
                rule: entry.rule_name.clone(),
                reason: entry.reason.clone(),
                expires_in_secs: entry.deadline.saturating_duration_since(now).as_secs(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Drain everything as `(denied, "shutdown")`. Part of daemon teardown;
    /// no entry may leak.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.pending.lock().unwrap().keys().cloned().collect();
        for id in ids {
            self.resolve_with(&id, ApprovalOutcome::Denied, Some("shutdown".to_string()));
        }
    }
}

/// Short display id: the first segment of a v4 uuid is plenty unique for a
/// table that rarely holds more than a handful of entries.
fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::models::ExecutionContext;
    use std::sync::Arc;

    fn coordinator(timeout: Duration) -> (Arc<ApprovalCoordinator>, EventBus) {
        let bus = EventBus::new();
        (
            Arc::new(ApprovalCoordinator::new(timeout, bus.clone())),
            bus,
        )
    }

    fn ctx(command: &str) -> CommandContext {
        CommandContext::new(
            command,
            "/tmp",
            HashMap::new(),
            ExecutionContext::Human,
        )
    }

    async fn next_approval_id(sub: &mut crate::events::EventSubscription) -> String {
        loop {
            let Some(Event { kind, .. }) = sub.recv().await else {
                panic!("bus closed")
            };
            if let EventKind::ApprovalNeeded { approval_id, .. } = kind {
                return approval_id;
            }
        }
    }

    #[tokio::test]
    async fn test_approve_wakes_waiter() {
        let (coord, bus) = coordinator(Duration::from_secs(30));
        let mut sub = bus.subscribe();

        let waiting = {
            let coord = Arc::clone(&coord);
            let c = ctx("git push --force");
            tokio::spawn(async move { coord.request(&c, "force-push", "force push").await })
        };

        let id = next_approval_id(&mut sub).await;
        assert!(coord.resolve(&id, true, Some("go ahead".to_string())));

        let resolution = waiting.await.unwrap();
        assert_eq!(resolution.outcome, ApprovalOutcome::Approved);
        assert_eq!(resolution.reason.as_deref(), Some("go ahead"));
        assert_eq!(coord.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_deny_wakes_waiter() {
        let (coord, bus) = coordinator(Duration::from_secs(30));
        let mut sub = bus.subscribe();

        let waiting = {
            let coord = Arc::clone(&coord);
            let c = ctx("terraform destroy");
            tokio::spawn(async move { coord.request(&c, "tf", "destroy").await })
        };

        let id = next_approval_id(&mut sub).await;
        assert!(coord.resolve(&id, false, None));

        let resolution = waiting.await.unwrap();
        assert_eq!(resolution.outcome, ApprovalOutcome::Denied);
    }

    #[tokio::test]
    async fn test_timeout_resolves_as_timeout() {
        let (coord, _bus) = coordinator(Duration::from_millis(50));
        let resolution = coord.request(&ctx("git push --force"), "r", "reason").await;
        assert_eq!(resolution.outcome, ApprovalOutcome::Timeout);
        assert_eq!(resolution.reason.as_deref(), Some("timeout"));
        assert_eq!(coord.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_single_flight_same_fingerprint() {
        let (coord, bus) = coordinator(Duration::from_secs(30));
        let mut sub = bus.subscribe();

        let spawn_wait = |coord: &Arc<ApprovalCoordinator>| {
            let coord = Arc::clone(coord);
            let c = ctx("git push --force origin main");
            tokio::spawn(async move { coord.request(&c, "force-push", "force push").await })
        };
        let first = spawn_wait(&coord);
        let second = spawn_wait(&coord);

        let id = next_approval_id(&mut sub).await;
        // Give the second request time to attach before resolving.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coord.pending_count(), 1, "coalesced into one entry");

        coord.resolve(&id, true, None);

        let a = first.await.unwrap();
        let b = second.await.unwrap();
        assert_eq!(a.outcome, ApprovalOutcome::Approved);
        assert_eq!(b.outcome, ApprovalOutcome::Approved);

        // Exactly one approval_needed was ever published.
        let mut needed = 1; // the one consumed above
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(20), sub.recv()).await
        {
            if matches!(event.kind, EventKind::ApprovalNeeded { .. }) {
                needed += 1;
            }
        }
        assert_eq!(needed, 1);
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_get_distinct_entries() {
        let (coord, bus) = coordinator(Duration::from_secs(30));
        let mut sub = bus.subscribe();

        for command in ["git push --force", "terraform destroy"] {
            let coord = Arc::clone(&coord);
            let c = ctx(command);
            tokio::spawn(async move { coord.request(&c, "r", "x").await });
        }

        let first = next_approval_id(&mut sub).await;
        let second = next_approval_id(&mut sub).await;
        assert_ne!(first, second);
        assert_eq!(coord.pending_count(), 2);

        coord.shutdown();
    }

    #[tokio::test]
    async fn test_only_first_resolve_counts() {
        let (coord, bus) = coordinator(Duration::from_secs(30));
        let mut sub = bus.subscribe();

        let waiting = {
            let coord = Arc::clone(&coord);
            let c = ctx("dd if=/dev/zero of=/dev/sda");
            tokio::spawn(async move { coord.request(&c, "dd", "wipe").await })
        };

        let id = next_approval_id(&mut sub).await;
        assert!(coord.resolve(&id, false, None));
        assert!(!coord.resolve(&id, true, None), "second resolve is not_found");
        assert!(!coord.resolve("missing", true, None));

        assert_eq!(waiting.await.unwrap().outcome, ApprovalOutcome::Denied);
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending() {
        let (coord, bus) = coordinator(Duration::from_secs(30));
        let mut sub = bus.subscribe();

        let waiting = {
            let coord = Arc::clone(&coord);
            let c = ctx("git push --force");
            tokio::spawn(async move { coord.request(&c, "r", "x").await })
        };
        let _ = next_approval_id(&mut sub).await;

        coord.shutdown();
        let resolution = waiting.await.unwrap();
        assert_eq!(resolution.outcome, ApprovalOutcome::Denied);
        assert_eq!(resolution.reason.as_deref(), Some("shutdown"));
        assert_eq!(coord.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_summaries() {
        let (coord, bus) = coordinator(Duration::from_secs(300));
        let mut sub = bus.subscribe();

        {
            let coord = Arc::clone(&coord);
            let c = ctx("shred /dev/sda");
            tokio::spawn(async move { coord.request(&c, "confirm-shred", "irreversible").await });
        }
        let id = next_approval_id(&mut sub).await;

        let summaries = coord.pending_summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, id);
        assert_eq!(summaries[0].rule, "confirm-shred");
        assert!(summaries[0].expires_in_secs > 290);

        coord.shutdown();
    }
}
