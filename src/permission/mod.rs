//! Capability policy: rulesets, evaluation and interactive approval.
//!
//! A [`Ruleset`] is an ordered list of `(permission, pattern, action)` rules.
//! [`evaluate`] resolves one target against a ruleset; [`PermissionEngine::ask`]
//! resolves a whole request and, when policy says `ask`, publishes
//! `permission.asked` on the bus and waits for [`PermissionEngine::reply`].

pub mod wildcard;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum::{Display, EnumString};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::bus::{events, EventBus};
use crate::error::{KilnError, Result};
use crate::id::{self, IdPrefix};

/// Permission kind used to escalate repeated identical tool calls.
pub const DOOM_LOOP: &str = "doom_loop";

/// Outcome of evaluating a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Deny,
    Ask,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub permission: String,
    pub pattern: String,
    pub action: PermissionAction,
}

impl PermissionRule {
    pub fn new(
        permission: impl Into<String>,
        pattern: impl Into<String>,
        action: PermissionAction,
    ) -> Self {
        Self {
            permission: permission.into(),
            pattern: pattern.into(),
            action,
        }
    }

    pub fn allow(permission: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(permission, pattern, PermissionAction::Allow)
    }

    pub fn deny(permission: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(permission, pattern, PermissionAction::Deny)
    }

    pub fn ask(permission: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(permission, pattern, PermissionAction::Ask)
    }
}

pub type Ruleset = Vec<PermissionRule>;

/// Resolve `target` for the `permission` kind.
///
/// Rules whose permission globs the kind are folded in order into a
/// pattern table (a later rule replaces an earlier one with the same
/// pattern), then the longest matching pattern decides. With no rule for the
/// kind the answer is `Deny`; with rules but no matching pattern it is `Ask`.
pub fn evaluate(permission: &str, target: &str, ruleset: &[PermissionRule]) -> PermissionAction {
    let mut table: HashMap<&str, PermissionAction> = HashMap::new();
    for rule in ruleset {
        if wildcard::matches(permission, &rule.permission) {
            table.insert(rule.pattern.as_str(), rule.action);
        }
    }
    if table.is_empty() {
        return PermissionAction::Deny;
    }
    wildcard::all(target, table.iter().map(|(pattern, action)| (*pattern, action)))
        .unwrap_or(PermissionAction::Ask)
}

/// Concatenate rulesets; later rules take precedence on equal patterns.
pub fn merge(rulesets: &[&[PermissionRule]]) -> Ruleset {
    rulesets.iter().flat_map(|set| set.iter().cloned()).collect()
}

/// Tool ids hidden from the model because policy denies them outright.
pub fn disabled<'a>(tools: impl IntoIterator<Item = &'a str>, ruleset: &[PermissionRule]) -> HashSet<String> {
    tools
        .into_iter()
        .filter(|tool| {
            ruleset
                .iter()
                .rev()
                .find(|rule| wildcard::matches(tool, &rule.permission))
                .is_some_and(|rule| rule.pattern == "*" && rule.action == PermissionAction::Deny)
        })
        .map(str::to_string)
        .collect()
}

/// Config shape for a single permission kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionSetting {
    Action(PermissionAction),
    Patterns(BTreeMap<String, PermissionAction>),
}

/// `permission -> action` or `permission -> { pattern -> action }`.
pub type PermissionConfig = BTreeMap<String, PermissionSetting>;

/// Flatten a permission config into a ruleset.
///
/// Wildcard permission keys are emitted first so specific keys override them.
/// Patterns starting with `~/` or `$HOME/` are expanded to the home directory.
pub fn from_config(config: &PermissionConfig) -> Ruleset {
    let mut keys: Vec<&String> = config.keys().collect();
    keys.sort_by_key(|key| (!key.contains('*'), key.len()));

    let mut ruleset = Ruleset::new();
    for key in keys {
        match &config[key] {
            PermissionSetting::Action(action) => {
                ruleset.push(PermissionRule::new(key.clone(), "*", *action));
            }
            PermissionSetting::Patterns(patterns) => {
                let mut sorted: Vec<(&String, &PermissionAction)> = patterns.iter().collect();
                sorted.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(b.0)));
                for (pattern, action) in sorted {
                    ruleset.push(PermissionRule::new(key.clone(), expand_home(pattern), *action));
                }
            }
        }
    }
    ruleset
}

fn expand_home(pattern: &str) -> String {
    let Some(base) = directories::BaseDirs::new() else {
        return pattern.to_string();
    };
    let home = base.home_dir().to_string_lossy();
    for prefix in ["~/", "$HOME/"] {
        if let Some(rest) = pattern.strip_prefix(prefix) {
            return format!("{home}/{rest}");
        }
    }
    if pattern == "~" || pattern == "$HOME" {
        return home.into_owned();
    }
    pattern.to_string()
}

/// Tool call that raised a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRef {
    pub message_id: String,
    pub call_id: String,
}

/// A question put to policy (and possibly a human).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bon::Builder)]
pub struct PermissionRequest {
    #[builder(default = id::ascending(IdPrefix::Permission), into)]
    pub id: String,
    #[builder(into)]
    pub session_id: String,
    #[builder(into)]
    pub permission: String,
    pub patterns: Vec<String>,
    /// Patterns approved for the rest of the session on an `always` reply.
    #[builder(default)]
    pub always: Vec<String>,
    #[builder(default = Value::Object(Default::default()))]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolRef>,
}

/// Human answer to a pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "lowercase")]
pub enum Reply {
    Once,
    Always,
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Reply {
    fn kind(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Always => "always",
            Self::Reject { .. } => "reject",
        }
    }
}

struct Pending {
    request: PermissionRequest,
    ruleset: Ruleset,
    tx: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct EngineState {
    pending: HashMap<String, Pending>,
    approved: HashMap<String, Ruleset>,
}

/// Owns the pending-request table and the per-session approvals.
pub struct PermissionEngine {
    bus: EventBus,
    state: Mutex<EngineState>,
}

impl std::fmt::Debug for PermissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("PermissionEngine")
            .field("pending", &state.pending.len())
            .field("sessions", &state.approved.len())
            .finish()
    }
}

/// Removes a pending entry when the asking future goes away.
struct PendingGuard<'a> {
    engine: &'a PermissionEngine,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.engine.state().pending.remove(&self.id);
    }
}

impl PermissionEngine {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            state: Mutex::new(EngineState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Resolve `request` against `ruleset` plus the session's approvals.
    ///
    /// Returns immediately when every pattern is allowed and fails without
    /// prompting when any pattern is denied. Otherwise publishes
    /// `permission.asked` and waits for a reply or for `cancel`.
    pub async fn ask(
        &self,
        request: PermissionRequest,
        ruleset: &[PermissionRule],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let rx = {
            let mut state = self.state();
            let approved = state
                .approved
                .get(&request.session_id)
                .cloned()
                .unwrap_or_default();
            let effective = merge(&[ruleset, approved.as_slice()]);
            let mut needs_answer = false;
            for pattern in &request.patterns {
                match evaluate(&request.permission, pattern, &effective) {
                    PermissionAction::Deny => {
                        tracing::debug!(
                            permission = %request.permission,
                            pattern = %pattern,
                            "permission denied by rule"
                        );
                        return Err(KilnError::PermissionRejected {
                            permission: request.permission.clone(),
                            feedback: None,
                        });
                    }
                    PermissionAction::Ask => needs_answer = true,
                    PermissionAction::Allow => {}
                }
            }
            if !needs_answer {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.pending.insert(
                request.id.clone(),
                Pending {
                    request: request.clone(),
                    ruleset: ruleset.to_vec(),
                    tx,
                },
            );
            rx
        };
        let _guard = PendingGuard {
            engine: self,
            id: request.id.clone(),
        };

        tracing::debug!(
            request_id = %request.id,
            session_id = %request.session_id,
            permission = %request.permission,
            "permission asked"
        );
        self.bus
            .publish_serialized(events::PERMISSION_ASKED, &request)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KilnError::Canceled),
            answer = rx => answer.unwrap_or(Err(KilnError::Canceled)),
        }
    }

    /// Answer a pending request. Returns `false` if it was not pending.
    pub fn reply(&self, request_id: &str, reply: Reply) -> bool {
        let mut resolved: Vec<(PermissionRequest, &'static str, oneshot::Sender<Result<()>>, Result<()>)> =
            Vec::new();
        {
            let mut state = self.state();
            let Some(pending) = state.pending.remove(request_id) else {
                return false;
            };
            let session_id = pending.request.session_id.clone();

            match &reply {
                Reply::Once => {
                    resolved.push((pending.request, "once", pending.tx, Ok(())));
                }
                Reply::Reject { message } => {
                    let permission = pending.request.permission.clone();
                    resolved.push((
                        pending.request,
                        "reject",
                        pending.tx,
                        Err(KilnError::PermissionRejected {
                            permission,
                            feedback: message.clone(),
                        }),
                    ));
                    let siblings: Vec<String> = state
                        .pending
                        .iter()
                        .filter(|(_, p)| p.request.session_id == session_id)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in siblings {
                        if let Some(p) = state.pending.remove(&id) {
                            let permission = p.request.permission.clone();
                            resolved.push((
                                p.request,
                                "reject",
                                p.tx,
                                Err(KilnError::PermissionRejected {
                                    permission,
                                    feedback: None,
                                }),
                            ));
                        }
                    }
                }
                Reply::Always => {
                    let approved = state.approved.entry(session_id.clone()).or_default();
                    for pattern in &pending.request.always {
                        approved.push(PermissionRule::allow(
                            pending.request.permission.clone(),
                            pattern.clone(),
                        ));
                    }
                    let approved = approved.clone();
                    resolved.push((pending.request, "always", pending.tx, Ok(())));

                    let now_allowed: Vec<String> = state
                        .pending
                        .iter()
                        .filter(|(_, p)| {
                            p.request.session_id == session_id && {
                                let effective = merge(&[p.ruleset.as_slice(), approved.as_slice()]);
                                p.request.patterns.iter().all(|pattern| {
                                    evaluate(&p.request.permission, pattern, &effective)
                                        == PermissionAction::Allow
                                })
                            }
                        })
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in now_allowed {
                        if let Some(p) = state.pending.remove(&id) {
                            resolved.push((p.request, "always", p.tx, Ok(())));
                        }
                    }
                }
            }
        }

        for (request, kind, tx, answer) in resolved {
            tracing::debug!(request_id = %request.id, reply = kind, "permission replied");
            let _ = tx.send(answer);
            let published = self.bus.publish(
                events::PERMISSION_REPLIED,
                json!({
                    "session_id": request.session_id,
                    "request_id": request.id,
                    "reply": kind,
                }),
            );
            if let Err(err) = published {
                tracing::warn!(error = %err, "failed to publish permission reply");
            }
        }
        tracing::trace!(reply = reply.kind(), "reply handled");
        true
    }

    /// Outstanding requests, oldest first.
    pub fn pending(&self) -> Vec<PermissionRequest> {
        let mut list: Vec<PermissionRequest> = self
            .state()
            .pending
            .values()
            .map(|p| p.request.clone())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Rules added by `always` replies in `session_id`.
    pub fn approved(&self, session_id: &str) -> Ruleset {
        self.state()
            .approved
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn engine() -> Arc<PermissionEngine> {
        Arc::new(PermissionEngine::new(EventBus::new()))
    }

    fn request(session: &str, permission: &str, patterns: &[&str]) -> PermissionRequest {
        PermissionRequest::builder()
            .session_id(session)
            .permission(permission)
            .patterns(patterns.iter().map(|p| p.to_string()).collect())
            .always(patterns.iter().map(|p| p.to_string()).collect())
            .build()
    }

    async fn wait_for_pending(engine: &PermissionEngine, count: usize) {
        for _ in 0..100 {
            if engine.pending().len() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {count} pending requests");
    }

    #[test]
    fn evaluate_defaults_and_specificity() {
        let ruleset = vec![
            PermissionRule::allow("bash", "*"),
            PermissionRule::ask("bash", "git *"),
            PermissionRule::deny("bash", "git push *"),
            PermissionRule::ask("edit", "src/*"),
        ];
        assert_eq!(evaluate("bash", "ls", &ruleset), PermissionAction::Allow);
        assert_eq!(evaluate("bash", "git status", &ruleset), PermissionAction::Ask);
        assert_eq!(evaluate("bash", "git push origin", &ruleset), PermissionAction::Deny);
        assert_eq!(evaluate("webfetch", "x", &ruleset), PermissionAction::Deny);
        assert_eq!(evaluate("edit", "README.md", &ruleset), PermissionAction::Ask);
    }

    #[test]
    fn evaluate_is_deterministic() {
        let ruleset = vec![
            PermissionRule::allow("*", "*"),
            PermissionRule::deny("bash", "rm *"),
            PermissionRule::ask("bash", "rm -i *"),
        ];
        let first = evaluate("bash", "rm -i foo", &ruleset);
        for _ in 0..50 {
            assert_eq!(evaluate("bash", "rm -i foo", &ruleset), first);
        }
    }

    #[test]
    fn later_rule_overrides_same_pattern() {
        let base = vec![PermissionRule::allow("*", "*")];
        let patch = vec![PermissionRule::deny("bash", "*")];
        let merged = merge(&[base.as_slice(), patch.as_slice()]);
        assert_eq!(merged.len(), 2);
        assert_eq!(evaluate("bash", "ls", &merged), PermissionAction::Deny);
        assert_eq!(evaluate("read", "a.txt", &merged), PermissionAction::Allow);
    }

    #[test]
    fn from_config_puts_wildcards_first() {
        let config: PermissionConfig = serde_json::from_value(json!({
            "bash": { "*": "ask", "git status": "allow" },
            "*": "allow",
            "webfetch": "deny"
        }))
        .unwrap();
        let ruleset = from_config(&config);
        assert_eq!(ruleset[0], PermissionRule::allow("*", "*"));
        assert_eq!(evaluate("bash", "git status", &ruleset), PermissionAction::Allow);
        assert_eq!(evaluate("bash", "make", &ruleset), PermissionAction::Ask);
        assert_eq!(evaluate("webfetch", "https://x", &ruleset), PermissionAction::Deny);
        assert_eq!(evaluate("read", "a", &ruleset), PermissionAction::Allow);
    }

    #[test]
    fn from_config_expands_home() {
        let config: PermissionConfig =
            serde_json::from_value(json!({ "external_directory": { "~/projects/*": "allow" } })).unwrap();
        let ruleset = from_config(&config);
        assert!(!ruleset[0].pattern.starts_with('~'));
        assert!(ruleset[0].pattern.ends_with("/projects/*"));
    }

    #[test]
    fn disabled_hides_blanket_denied_tools() {
        let ruleset = vec![
            PermissionRule::allow("*", "*"),
            PermissionRule::deny("bash", "*"),
            PermissionRule::deny("edit", "secret/*"),
        ];
        let hidden = disabled(["bash", "edit", "read"], &ruleset);
        assert_eq!(hidden, HashSet::from(["bash".to_string()]));
    }

    #[tokio::test]
    async fn allowed_requests_return_without_asking() {
        let engine = engine();
        let ruleset = vec![PermissionRule::allow("*", "*")];
        engine
            .ask(request("ses_1", "read", &["a.txt"]), &ruleset, &CancellationToken::new())
            .await
            .unwrap();
        assert!(engine.pending().is_empty());
    }

    #[tokio::test]
    async fn denied_requests_fail_without_publishing() {
        let engine = engine();
        let asked = Arc::new(Mutex::new(0));
        let counter = asked.clone();
        engine.bus().subscribe(events::PERMISSION_ASKED, move |_| {
            *counter.lock().unwrap() += 1;
        });
        let ruleset = vec![PermissionRule::deny("bash", "*")];
        let err = engine
            .ask(request("ses_1", "bash", &["ls"]), &ruleset, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::PermissionRejected { .. }));
        assert_eq!(*asked.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn once_reply_resolves_and_is_not_remembered() {
        let engine = engine();
        let ruleset = vec![PermissionRule::ask("bash", "*")];
        let asker = engine.clone();
        let rs = ruleset.clone();
        let task = tokio::spawn(async move {
            asker
                .ask(request("ses_1", "bash", &["make"]), &rs, &CancellationToken::new())
                .await
        });
        wait_for_pending(&engine, 1).await;
        let id = engine.pending()[0].id.clone();
        assert!(engine.reply(&id, Reply::Once));
        task.await.unwrap().unwrap();
        assert!(!engine.reply(&id, Reply::Once), "second reply is ignored");
        assert!(engine.approved("ses_1").is_empty());
    }

    #[tokio::test]
    async fn always_reply_persists_and_resolves_siblings() {
        let engine = engine();
        let ruleset = vec![PermissionRule::ask("bash", "*")];
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let asker = engine.clone();
            let rs = ruleset.clone();
            tasks.push(tokio::spawn(async move {
                asker
                    .ask(request("ses_1", "bash", &["make"]), &rs, &CancellationToken::new())
                    .await
            }));
        }
        wait_for_pending(&engine, 2).await;
        let id = engine.pending()[0].id.clone();
        assert!(engine.reply(&id, Reply::Always));
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert!(engine.pending().is_empty());
        assert_eq!(engine.approved("ses_1"), vec![PermissionRule::allow("bash", "make")]);

        engine
            .ask(request("ses_1", "bash", &["make"]), &ruleset, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reject_reply_carries_feedback_and_rejects_session() {
        let engine = engine();
        let ruleset = vec![PermissionRule::ask("*", "*")];
        let mut tasks = Vec::new();
        for (session, target) in [("ses_1", "a"), ("ses_1", "b"), ("ses_2", "c")] {
            let asker = engine.clone();
            let rs = ruleset.clone();
            tasks.push(tokio::spawn(async move {
                asker
                    .ask(request(session, "edit", &[target]), &rs, &CancellationToken::new())
                    .await
            }));
        }
        wait_for_pending(&engine, 3).await;
        let target = engine
            .pending()
            .into_iter()
            .find(|r| r.patterns == vec!["a".to_string()])
            .unwrap();
        engine.reply(
            &target.id,
            Reply::Reject {
                message: Some("use the other file".into()),
            },
        );

        let mut results = Vec::new();
        for task in tasks.drain(..2) {
            results.push(task.await.unwrap());
        }
        match &results[0] {
            Err(KilnError::PermissionRejected { feedback, .. }) => {
                assert_eq!(feedback.as_deref(), Some("use the other file"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(results[1], Err(KilnError::PermissionRejected { .. })));
        assert_eq!(engine.pending().len(), 1, "other sessions stay pending");
    }

    #[tokio::test]
    async fn cancellation_discards_pending_entry() {
        let engine = engine();
        let ruleset = vec![PermissionRule::ask("*", "*")];
        let cancel = CancellationToken::new();
        let asker = engine.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            asker
                .ask(request("ses_1", "bash", &["ls"]), &ruleset, &token)
                .await
        });
        wait_for_pending(&engine, 1).await;
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, KilnError::Canceled));
        assert!(engine.pending().is_empty());
    }

    #[tokio::test]
    async fn asked_event_is_published_and_replied_from_handler() {
        let engine = engine();
        let replier = Arc::downgrade(&engine);
        engine.bus().subscribe(events::PERMISSION_ASKED, move |event| {
            let id = event.properties["id"].as_str().unwrap_or_default().to_string();
            if let Some(engine) = replier.upgrade() {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    engine.reply(&id, Reply::Once);
                });
            }
        });
        let ruleset = vec![PermissionRule::ask("*", "*")];
        engine
            .ask(request("ses_1", "bash", &["ls"]), &ruleset, &CancellationToken::new())
            .await
            .unwrap();
    }
}
