//! Approval & Skill Guard (C5)
//!
//! Two sub-responsibilities sharing the [`Storage`] layer: a persisted
//! [`ApprovalStore`] of tool-access grants, and a per-session [`SkillGuard`]
//! tool-allowlist policy. Grounded in the teacher's `security/policy.rs`
//! allow/deny-pattern shape and `key_server::store`'s indexed-record layout
//! (`approval:{id}` plus `approval:index:session:{id}` / `:user:{id}`).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::storage::{SetOptions, Storage};
use crate::{Error, Result};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// Scope an [`ApprovalRecord`] is granted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalScope {
    /// Valid for the lifetime of one session.
    Session,
    /// Valid for a user across sessions.
    User,
    /// Valid until `granted_at + ttl_ms`.
    TimeLimited,
    /// Valid only within a specific, caller-defined context.
    ContextSpecific,
}

/// Lifecycle state of an [`ApprovalRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    /// Requested but not yet decided.
    Pending,
    /// Granted and currently in force.
    Approved,
    /// Explicitly revoked.
    Revoked,
    /// Past its effective expiry.
    Expired,
}

/// A persisted grant of tool access. See §3 `ApprovalRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Fresh id assigned on grant.
    pub id: String,
    /// Tool this record authorizes.
    pub tool_id: String,
    /// Scope under which the grant applies.
    pub scope: ApprovalScope,
    /// Current lifecycle state.
    pub state: ApprovalState,
    /// Required when `scope == Session`.
    pub session_id: Option<String>,
    /// Required when `scope == User`.
    pub user_id: Option<String>,
    /// Arbitrary caller-defined context, required to disambiguate
    /// `ContextSpecific` grants.
    pub context: Option<String>,
    /// Required when `scope == TimeLimited`.
    pub ttl_ms: Option<i64>,
    /// When the grant was approved, epoch ms.
    pub granted_at: Option<i64>,
    /// Who approved it.
    pub granted_by: String,
    /// When the grant was revoked, epoch ms.
    pub revoked_at: Option<i64>,
    /// Who revoked it.
    pub revoked_by: Option<String>,
    /// Free-text reason (grant or revoke).
    pub reason: Option<String>,
    /// Caller-defined metadata.
    pub metadata: Option<serde_json::Value>,
}

impl ApprovalRecord {
    fn is_expired(&self, now: i64) -> bool {
        if self.state == ApprovalState::Revoked {
            return true;
        }
        if self.scope == ApprovalScope::TimeLimited {
            if let (Some(granted_at), Some(ttl_ms)) = (self.granted_at, self.ttl_ms) {
                return granted_at + ttl_ms < now;
            }
        }
        false
    }

    fn matches(&self, tool_id: &str, session_id: Option<&str>, user_id: Option<&str>, context: Option<&str>) -> bool {
        if self.tool_id != tool_id {
            return false;
        }
        match self.scope {
            ApprovalScope::Session => self.session_id.as_deref() == session_id,
            ApprovalScope::User => self.user_id.as_deref() == user_id,
            ApprovalScope::TimeLimited => {
                self.session_id.as_deref() == session_id || self.user_id.as_deref() == user_id
            }
            ApprovalScope::ContextSpecific => self.context.as_deref() == context,
        }
    }
}

/// Inputs for [`ApprovalStore::grant_approval`].
#[derive(Debug, Clone)]
pub struct GrantApproval {
    /// Tool to authorize.
    pub tool_id: String,
    /// Scope of the grant.
    pub scope: ApprovalScope,
    /// Session id, required for `Session` scope.
    pub session_id: Option<String>,
    /// User id, required for `User` scope.
    pub user_id: Option<String>,
    /// TTL, required for `TimeLimited` scope.
    pub ttl_ms: Option<i64>,
    /// Context, required for `ContextSpecific` scope.
    pub context: Option<String>,
    /// Who is granting this.
    pub granted_by: String,
    /// Free-text reason.
    pub reason: Option<String>,
    /// Caller-defined metadata.
    pub metadata: Option<serde_json::Value>,
}

/// Filter for [`ApprovalStore::query_approvals`].
#[derive(Debug, Clone, Default)]
pub struct ApprovalQuery {
    /// Restrict to a session id.
    pub session_id: Option<String>,
    /// Restrict to a user id.
    pub user_id: Option<String>,
    /// Restrict to a tool id.
    pub tool_id: Option<String>,
    /// Restrict to a scope.
    pub scope: Option<ApprovalScope>,
    /// Restrict to these states; empty means all states.
    pub states: Vec<ApprovalState>,
    /// Include records that are past their effective expiry.
    pub include_expired: bool,
}

fn record_key(id: &str) -> String {
    format!("approval:{id}")
}
fn session_index_key(session_id: &str) -> String {
    format!("approval:index:session:{session_id}")
}
fn user_index_key(user_id: &str) -> String {
    format!("approval:index:user:{user_id}")
}

/// Persisted store of [`ApprovalRecord`]s (§4.5 `ApprovalStore`).
pub struct ApprovalStore {
    storage: Arc<dyn Storage>,
}

impl ApprovalStore {
    /// Construct a store over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    async fn read_index(&self, key: &str) -> Result<Vec<String>> {
        match self.storage.get(key).await? {
            Some(raw) => Ok(serde_json::from_slice(&raw).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    async fn append_index(&self, key: &str, id: &str) -> Result<()> {
        let mut ids = self.read_index(key).await?;
        if !ids.iter().any(|i| i == id) {
            ids.push(id.to_string());
            self.storage.set(key, serde_json::to_vec(&ids)?, SetOptions::default()).await?;
        }
        Ok(())
    }

    async fn remove_from_index(&self, key: &str, id: &str) -> Result<()> {
        let mut ids = self.read_index(key).await?;
        ids.retain(|i| i != id);
        if ids.is_empty() {
            self.storage.delete(key).await?;
        } else {
            self.storage.set(key, serde_json::to_vec(&ids)?, SetOptions::default()).await?;
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<ApprovalRecord>> {
        match self.storage.get(&record_key(id)).await? {
            Some(raw) => Ok(serde_json::from_slice(&raw).ok()),
            None => Ok(None),
        }
    }

    /// True iff any approved, unexpired record matches.
    pub async fn is_approved(
        &self,
        tool_id: &str,
        session_id: Option<&str>,
        user_id: Option<&str>,
        context: Option<&str>,
    ) -> Result<bool> {
        Ok(self
            .get_approval(tool_id, session_id, user_id, context)
            .await?
            .is_some())
    }

    /// The matching approved, unexpired record, if any. Matching rules are
    /// applied in the order given in §4.5.
    pub async fn get_approval(
        &self,
        tool_id: &str,
        session_id: Option<&str>,
        user_id: Option<&str>,
        context: Option<&str>,
    ) -> Result<Option<ApprovalRecord>> {
        let mut ids = HashSet::new();
        if let Some(sid) = session_id {
            ids.extend(self.read_index(&session_index_key(sid)).await?);
        }
        if let Some(uid) = user_id {
            ids.extend(self.read_index(&user_index_key(uid)).await?);
        }

        let now = now_ms();
        for id in ids {
            if let Some(record) = self.load(&id).await? {
                if record.state == ApprovalState::Approved
                    && !record.is_expired(now)
                    && record.matches(tool_id, session_id, user_id, context)
                {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    /// Query approvals by arbitrary filters.
    pub async fn query_approvals(&self, query: &ApprovalQuery) -> Result<Vec<ApprovalRecord>> {
        let mut ids = HashSet::new();
        if let Some(sid) = &query.session_id {
            ids.extend(self.read_index(&session_index_key(sid)).await?);
        }
        if let Some(uid) = &query.user_id {
            ids.extend(self.read_index(&user_index_key(uid)).await?);
        }
        if ids.is_empty() && query.session_id.is_none() && query.user_id.is_none() {
            // No index to scope by: fall back to a full scan.
            ids.extend(
                self.storage
                    .scan("approval:*")
                    .await?
                    .into_iter()
                    .filter(|k| !k.starts_with("approval:index:"))
                    .filter_map(|k| k.strip_prefix("approval:").map(str::to_string)),
            );
        }

        let now = now_ms();
        let mut out = Vec::new();
        for id in ids {
            let Some(record) = self.load(&id).await? else {
                continue;
            };
            if let Some(tool_id) = &query.tool_id {
                if &record.tool_id != tool_id {
                    continue;
                }
            }
            if let Some(scope) = query.scope {
                if record.scope != scope {
                    continue;
                }
            }
            if !query.states.is_empty() && !query.states.contains(&record.state) {
                continue;
            }
            if !query.include_expired && record.is_expired(now) {
                continue;
            }
            out.push(record);
        }
        Ok(out)
    }

    /// Create an approved record with a fresh id.
    pub async fn grant_approval(&self, grant: GrantApproval) -> Result<ApprovalRecord> {
        match grant.scope {
            ApprovalScope::Session if grant.session_id.is_none() => {
                return Err(Error::Config("session scope requires session_id".to_string()));
            }
            ApprovalScope::User if grant.user_id.is_none() => {
                return Err(Error::Config("user scope requires user_id".to_string()));
            }
            ApprovalScope::TimeLimited if grant.ttl_ms.is_none() => {
                return Err(Error::Config("time_limited scope requires ttl_ms".to_string()));
            }
            _ => {}
        }

        let record = ApprovalRecord {
            id: crypto::random_uuid().to_string(),
            tool_id: grant.tool_id,
            scope: grant.scope,
            state: ApprovalState::Approved,
            session_id: grant.session_id.clone(),
            user_id: grant.user_id.clone(),
            context: grant.context,
            ttl_ms: grant.ttl_ms,
            granted_at: Some(now_ms()),
            granted_by: grant.granted_by,
            revoked_at: None,
            revoked_by: None,
            reason: grant.reason,
            metadata: grant.metadata,
        };

        self.storage
            .set(&record_key(&record.id), serde_json::to_vec(&record)?, SetOptions::default())
            .await?;
        if let Some(sid) = &grant.session_id {
            self.append_index(&session_index_key(sid), &record.id).await?;
        }
        if let Some(uid) = &grant.user_id {
            self.append_index(&user_index_key(uid), &record.id).await?;
        }

        Ok(record)
    }

    /// Revoke the matching approval, if any. Returns whether one was found.
    pub async fn revoke_approval(
        &self,
        tool_id: &str,
        session_id: Option<&str>,
        user_id: Option<&str>,
        revoked_by: String,
        reason: Option<String>,
    ) -> Result<bool> {
        let Some(mut record) = self.get_approval(tool_id, session_id, user_id, None).await? else {
            return Ok(false);
        };
        record.state = ApprovalState::Revoked;
        record.revoked_at = Some(now_ms());
        record.revoked_by = Some(revoked_by);
        record.reason = reason;
        self.storage
            .set(&record_key(&record.id), serde_json::to_vec(&record)?, SetOptions::default())
            .await?;
        Ok(true)
    }

    /// Remove every approval granted under `session_id`, returning the count.
    pub async fn clear_session_approvals(&self, session_id: &str) -> Result<u64> {
        let ids = self.read_index(&session_index_key(session_id)).await?;
        let mut count = 0;
        for id in &ids {
            if self.storage.delete(&record_key(id)).await? {
                count += 1;
            }
        }
        self.storage.delete(&session_index_key(session_id)).await?;
        Ok(count)
    }
}

/// Tool-call policy mode attached to a session (§4.5 Skill Guard).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    /// Deny anything outside the allowlist.
    Strict,
    /// Allow via a callback-mediated approval prompt; deny without one.
    Approval,
    /// Allow with a warning; no gating.
    Permissive,
}

/// Outcome of [`SkillGuard::check_tool_authorization`].
#[derive(Debug, Clone)]
pub struct ToolAuthorizationResult {
    /// Whether the call may proceed immediately.
    pub allowed: bool,
    /// The (possibly normalized) tool name that was checked.
    pub tool_name: String,
    /// Human-readable explanation.
    pub reason: String,
    /// Set when `allowed == false` but an approval could unblock it.
    pub requires_approval: bool,
}

/// Normalize `owner:name` tool ids to their unqualified `name`, since
/// allowlists are authored from skill manifests that do not know about
/// runtime owners (§4.5).
#[must_use]
pub fn normalize_tool_name(tool_id: &str) -> &str {
    tool_id.split_once(':').map_or(tool_id, |(_, name)| name)
}

/// Per-session tool-allowlist policy.
pub struct SkillGuard {
    policy_mode: PolicyMode,
    tool_allowlist: HashSet<String>,
    active_skill_id: Option<String>,
}

impl SkillGuard {
    /// Construct a guard in `policy_mode` with an initial allowlist.
    #[must_use]
    pub fn new(policy_mode: PolicyMode, tool_allowlist: HashSet<String>, active_skill_id: Option<String>) -> Self {
        Self {
            policy_mode,
            tool_allowlist,
            active_skill_id,
        }
    }

    /// The currently active skill id, if any.
    #[must_use]
    pub fn active_skill_id(&self) -> Option<&str> {
        self.active_skill_id.as_deref()
    }

    fn is_on_allowlist(&self, tool_name: &str) -> bool {
        self.tool_allowlist.contains(normalize_tool_name(tool_name))
    }

    /// Resolve whether `tool_name` may be invoked right now.
    #[must_use]
    pub fn check_tool_authorization(&self, tool_name: &str) -> ToolAuthorizationResult {
        let normalized = normalize_tool_name(tool_name).to_string();
        if self.is_on_allowlist(tool_name) {
            return ToolAuthorizationResult {
                allowed: true,
                tool_name: normalized,
                reason: "tool is on the session allowlist".to_string(),
                requires_approval: false,
            };
        }

        match self.policy_mode {
            PolicyMode::Strict => ToolAuthorizationResult {
                allowed: false,
                tool_name: normalized,
                reason: "tool not on allowlist (strict policy)".to_string(),
                requires_approval: false,
            },
            PolicyMode::Approval => ToolAuthorizationResult {
                allowed: false,
                tool_name: normalized,
                reason: "tool not on allowlist, approval required".to_string(),
                requires_approval: true,
            },
            PolicyMode::Permissive => ToolAuthorizationResult {
                allowed: true,
                tool_name: normalized,
                reason: "tool not on allowlist but policy is permissive".to_string(),
                requires_approval: false,
            },
        }
    }

    /// Grant `tool_name` a durable place on the session allowlist (used
    /// after an approval callback accepts a call under `Approval` mode).
    pub fn allow(&mut self, tool_name: &str) {
        self.tool_allowlist.insert(normalize_tool_name(tool_name).to_string());
    }
}
