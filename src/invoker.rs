//! Invoker Core (C6) — the heart of the runtime.
//!
//! A generic staged flow runner: every MCP operation is expressed as a
//! [`Plan`] (`pre`/`execute`/`post`/`finalize`/`error` stage lists) plus a
//! set of [`Hook`]s discovered once and cached per plan (§9: "model each
//! flow as a struct implementing an interface... metadata is plain data,
//! not runtime reflection"). `around` hooks wrap their stage body as onion
//! layers built from a small recursive [`ComposedStage`] rather than a
//! generic higher-order-function composition, which Rust's trait-object
//! model does not make ergonomic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::authz::Authorization;
use crate::session::SessionRecord;
use crate::{Error, Result};

/// A single stage, will, or did handler.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Run this hook against the live context.
    async fn call(&self, ctx: &mut FlowContext) -> Result<()>;
}

/// Blanket impl so plain async closures captured in an `Arc` work as hooks
/// without a bespoke struct per callsite.
#[async_trait]
impl<F> Hook for F
where
    F: for<'a> Fn(&'a mut FlowContext) -> futures::future::BoxFuture<'a, Result<()>> + Send + Sync,
{
    async fn call(&self, ctx: &mut FlowContext) -> Result<()> {
        (self)(ctx).await
    }
}

/// An `around(stage)` hook: receives the composed remainder of the onion
/// (`next`) and decides whether/when to invoke it.
#[async_trait]
pub trait AroundHandler: Send + Sync {
    /// Run this layer, calling `next.call(ctx)` to continue inward.
    async fn call(&self, ctx: &mut FlowContext, next: &(dyn Hook + Sync)) -> Result<()>;
}

/// Which hook slot an entry occupies for a given stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// The stage's own body; at most one per stage.
    Stage,
    /// Runs before the stage body, descending priority order.
    Will,
    /// Runs after the stage body, ascending priority order.
    Did,
    /// Wraps the stage body as an onion layer.
    Around,
}

enum HookHandler {
    Plain(Arc<dyn Hook>),
    Around(Arc<dyn AroundHandler>),
}

/// A registered hook: kind, target stage, ordering, and optional filter.
pub struct HookEntry {
    /// Slot this hook occupies.
    pub kind: HookKind,
    /// Stage label this hook is attached to.
    pub stage: String,
    /// Higher runs first for `will`/`stage`/`around`; lower runs first for `did`.
    pub priority: i32,
    /// Skip this hook for invocations where the filter returns `false`.
    pub filter: Option<Arc<dyn Fn(&FlowContext) -> bool + Send + Sync>>,
    handler: HookHandler,
    registration_order: usize,
}

impl HookEntry {
    /// A plain `will`/`did`/`stage` hook entry.
    #[must_use]
    pub fn plain(kind: HookKind, stage: impl Into<String>, priority: i32, handler: Arc<dyn Hook>) -> Self {
        Self {
            kind,
            stage: stage.into(),
            priority,
            filter: None,
            handler: HookHandler::Plain(handler),
            registration_order: 0,
        }
    }

    /// An `around` hook entry.
    #[must_use]
    pub fn around(stage: impl Into<String>, priority: i32, handler: Arc<dyn AroundHandler>) -> Self {
        Self {
            kind: HookKind::Around,
            stage: stage.into(),
            priority,
            filter: None,
            handler: HookHandler::Around(handler),
            registration_order: 0,
        }
    }

    /// Attach a filter predicate evaluated against the live context.
    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn Fn(&FlowContext) -> bool + Send + Sync>) -> Self {
        self.filter = Some(filter);
        self
    }

    fn enabled(&self, ctx: &FlowContext) -> bool {
        self.filter.as_ref().is_none_or(|f| f(ctx))
    }
}

/// A declarative stage pipeline. Stage labels are plain strings; ordering
/// within each list is stable and authoritative (§3 `FlowPlan`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Plan name, used for lookup and logging.
    pub name: String,
    /// Stages run before `execute`.
    pub pre: Vec<String>,
    /// Flow-specific stages.
    pub execute: Vec<String>,
    /// Stages run after `execute` succeeds (or is sealed).
    pub post: Vec<String>,
    /// Stages that always run, exactly once, regardless of outcome.
    pub finalize: Vec<String>,
    /// Stages run when `pre`/`execute`/`post` raised an error.
    pub error: Vec<String>,
}

impl Plan {
    /// The default plan applied to MCP operations unless overridden (§4.6).
    #[must_use]
    pub fn default_mcp_plan(name: impl Into<String>, execute: Vec<String>) -> Self {
        Self {
            name: name.into(),
            pre: vec![
                "bindProviders".to_string(),
                "acquireQuota".to_string(),
                "acquireSemaphore".to_string(),
                "parseInput".to_string(),
                "deductInput".to_string(),
                "validateInput".to_string(),
            ],
            execute,
            post: vec!["redactOutput".to_string(), "validateOutput".to_string()],
            finalize: vec!["audit".to_string(), "metrics".to_string()],
            error: vec!["error".to_string()],
        }
    }
}

/// Cooperative cancellation signal, checked at stage boundaries and
/// between each `around` layer and its `next` (§4.6, §5).
#[derive(Debug, Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    /// A fresh, not-yet-cancelled signal.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-run mutable state threaded through every stage and hook (§3 `FlowContext`).
pub struct FlowContext {
    /// Request input.
    pub input: serde_json::Value,
    /// Mutable scratch state, copy-on-write from the caller's perspective.
    pub state: serde_json::Value,
    output: Option<serde_json::Value>,
    sealed: bool,
    /// Error captured when a stage/hook fails, visible to `error` stages.
    pub error: Option<Arc<Error>>,
    /// The caller's authorization, when known.
    pub authorization: Option<Arc<Authorization>>,
    /// The bound session record, when known.
    pub session: Option<SessionRecord>,
    /// Cooperative cancellation signal.
    pub cancel: Cancel,
}

impl FlowContext {
    /// Start a fresh context for `input`.
    #[must_use]
    pub fn new(input: serde_json::Value) -> Self {
        Self {
            input,
            state: serde_json::Value::Object(serde_json::Map::new()),
            output: None,
            sealed: false,
            error: None,
            authorization: None,
            session: None,
            cancel: Cancel::new(),
        }
    }

    /// Seal the response. The first call wins; later calls are no-ops
    /// (§3: "response is sealed when the first respond() is called and
    /// further stage output is ignored").
    pub fn respond(&mut self, value: serde_json::Value) {
        if !self.sealed {
            self.output = Some(value);
            self.sealed = true;
        }
    }

    /// Whether a response has already been sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// The sealed output, if any.
    #[must_use]
    pub fn output(&self) -> Option<&serde_json::Value> {
        self.output.as_ref()
    }
}

struct CompiledStage {
    will: Vec<Arc<dyn Hook>>,
    around: Vec<Arc<dyn AroundHandler>>,
    stage: Option<Arc<dyn Hook>>,
    did: Vec<Arc<dyn Hook>>,
    filters: HashMap<usize, Arc<dyn Fn(&FlowContext) -> bool + Send + Sync>>,
}

struct CompiledPlan {
    plan: Plan,
    stages: HashMap<String, CompiledStage>,
}

/// A `stage + [around]` chain, composed as an onion: each layer checks
/// cancellation, then either calls `next` or short-circuits.
struct ComposedStage<'a> {
    around: &'a [Arc<dyn AroundHandler>],
    base: &'a (dyn Hook + Sync),
}

#[async_trait]
impl Hook for ComposedStage<'_> {
    async fn call(&self, ctx: &mut FlowContext) -> Result<()> {
        if ctx.cancel.is_cancelled() {
            return Err(Error::FlowCancelled);
        }
        match self.around.split_first() {
            Some((first, rest)) => {
                let next = ComposedStage { around: rest, base: self.base };
                first.call(ctx, &next).await
            }
            None => self.base.call(ctx).await,
        }
    }
}

struct NoopStage;
#[async_trait]
impl Hook for NoopStage {
    async fn call(&self, _ctx: &mut FlowContext) -> Result<()> {
        Ok(())
    }
}

/// Executes [`Plan`]s against registered [`HookEntry`] sets with the
/// deterministic ordering rules of §4.6.
#[derive(Default)]
pub struct Invoker {
    plans: HashMap<String, CompiledPlan>,
}

impl Invoker {
    /// Construct an empty invoker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `plan` with `hooks` and cache the result under `plan.name`.
    /// Hooks are grouped by `(kind, stage)` once here; dispatch reuses the
    /// compiled order for every run.
    pub fn register_plan(&mut self, plan: Plan, mut hooks: Vec<HookEntry>) {
        for (i, entry) in hooks.iter_mut().enumerate() {
            entry.registration_order = i;
        }

        let mut by_stage: HashMap<String, Vec<HookEntry>> = HashMap::new();
        for entry in hooks {
            by_stage.entry(entry.stage.clone()).or_default().push(entry);
        }

        let mut stages = HashMap::new();
        for (stage_label, mut entries) in by_stage {
            let mut will = Vec::new();
            let mut around = Vec::new();
            let mut did = Vec::new();
            let mut stage_handler = None;
            let mut filters = HashMap::new();

            let mut will_around_stage = Vec::new();
            let mut did_entries = Vec::new();
            for entry in entries.drain(..) {
                if entry.kind == HookKind::Did {
                    did_entries.push(entry);
                } else {
                    will_around_stage.push(entry);
                }
            }

            // will/stage/around: descending priority, ties by registration order.
            will_around_stage.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.registration_order.cmp(&b.registration_order))
            });
            for entry in will_around_stage {
                if let Some(f) = entry.filter.clone() {
                    filters.insert(entry.registration_order, f);
                }
                match entry.handler {
                    HookHandler::Plain(h) if entry.kind == HookKind::Will => will.push(h),
                    HookHandler::Plain(h) if entry.kind == HookKind::Stage => stage_handler = Some(h),
                    HookHandler::Around(h) => around.push(h),
                    HookHandler::Plain(_) => {}
                }
            }

            // did: ascending priority, ties by registration order.
            did_entries.sort_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.registration_order.cmp(&b.registration_order))
            });
            for entry in did_entries {
                if let HookHandler::Plain(h) = entry.handler {
                    did.push(h);
                }
            }

            stages.insert(
                stage_label,
                CompiledStage {
                    will,
                    around,
                    stage: stage_handler,
                    did,
                    filters,
                },
            );
        }

        self.plans.insert(plan.name.clone(), CompiledPlan { plan, stages });
    }

    async fn run_stage(&self, compiled: &CompiledStage, ctx: &mut FlowContext) -> Result<()> {
        for hook in &compiled.will {
            if ctx.cancel.is_cancelled() {
                return Err(Error::FlowCancelled);
            }
            hook.call(ctx).await?;
        }

        if ctx.cancel.is_cancelled() {
            return Err(Error::FlowCancelled);
        }
        let base: &(dyn Hook + Sync) = compiled.stage.as_deref().unwrap_or(&NoopStage);
        let composed = ComposedStage {
            around: &compiled.around,
            base,
        };
        composed.call(ctx).await?;

        for hook in &compiled.did {
            if ctx.cancel.is_cancelled() {
                return Err(Error::FlowCancelled);
            }
            hook.call(ctx).await?;
        }
        Ok(())
    }

    async fn run_stage_list(&self, compiled: &CompiledPlan, labels: &[String], ctx: &mut FlowContext) -> Result<()> {
        for label in labels {
            if ctx.cancel.is_cancelled() {
                return Err(Error::FlowCancelled);
            }
            let Some(stage) = compiled.stages.get(label) else {
                continue;
            };
            self.run_stage(stage, ctx).await?;
        }
        Ok(())
    }

    /// Run the plan named `plan_name` against `ctx`, following the
    /// `pre -> execute -> post -> [error] -> finalize` protocol.
    pub async fn dispatch(&self, plan_name: &str, mut ctx: FlowContext) -> Result<serde_json::Value> {
        let compiled = self.plans.get(plan_name).ok_or(Error::FlowNotFound)?;

        let mut run_error = None;
        'stages: for labels in [&compiled.plan.pre, &compiled.plan.execute, &compiled.plan.post] {
            if let Err(e) = self.run_stage_list(compiled, labels, &mut ctx).await {
                run_error = Some(e);
                break 'stages;
            }
        }

        if let Some(e) = run_error {
            ctx.error = Some(Arc::new(e));
            if let Err(new_err) = self.run_stage_list(compiled, &compiled.plan.error, &mut ctx).await {
                tracing::warn!(
                    cause = %ctx.error.as_ref().map(ToString::to_string).unwrap_or_default(),
                    "error stage raised a new error, replacing the original"
                );
                ctx.error = Some(Arc::new(new_err));
            }
        }

        if let Err(e) = self.run_stage_list(compiled, &compiled.plan.finalize, &mut ctx).await {
            tracing::warn!(error = %e, "finalize stage error swallowed");
        }

        if let Some(output) = ctx.output.take() {
            return Ok(output);
        }
        match ctx.error {
            Some(e) => Err(Arc::try_unwrap(e).unwrap_or_else(|arc| Error::Internal(arc.to_string()))),
            None => Ok(serde_json::Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHook {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Hook for RecordingHook {
        async fn call(&self, _ctx: &mut FlowContext) -> Result<()> {
            self.log.lock().unwrap().push(self.label);
            Ok(())
        }
    }

    fn hook(label: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<dyn Hook> {
        Arc::new(RecordingHook { label, log: Arc::clone(log) })
    }

    #[tokio::test]
    async fn runs_pre_execute_post_finalize_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plan = Plan {
            name: "t".to_string(),
            pre: vec!["p".to_string()],
            execute: vec!["e".to_string()],
            post: vec!["o".to_string()],
            finalize: vec!["f".to_string()],
            error: vec![],
        };
        let hooks = vec![
            HookEntry::plain(HookKind::Stage, "p", 0, hook("pre", &log)),
            HookEntry::plain(HookKind::Stage, "e", 0, hook("execute", &log)),
            HookEntry::plain(HookKind::Stage, "o", 0, hook("post", &log)),
            HookEntry::plain(HookKind::Stage, "f", 0, hook("finalize", &log)),
        ];
        let mut invoker = Invoker::new();
        invoker.register_plan(plan, hooks);

        invoker.dispatch("t", FlowContext::new(serde_json::Value::Null)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["pre", "execute", "post", "finalize"]);
    }

    #[tokio::test]
    async fn will_runs_descending_priority_did_runs_ascending() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plan = Plan {
            name: "t".to_string(),
            pre: vec![],
            execute: vec!["e".to_string()],
            post: vec![],
            finalize: vec![],
            error: vec![],
        };
        let hooks = vec![
            HookEntry::plain(HookKind::Will, "e", 1, hook("will-low", &log)),
            HookEntry::plain(HookKind::Will, "e", 10, hook("will-high", &log)),
            HookEntry::plain(HookKind::Stage, "e", 0, hook("stage", &log)),
            HookEntry::plain(HookKind::Did, "e", 10, hook("did-high", &log)),
            HookEntry::plain(HookKind::Did, "e", 1, hook("did-low", &log)),
        ];
        let mut invoker = Invoker::new();
        invoker.register_plan(plan, hooks);

        invoker.dispatch("t", FlowContext::new(serde_json::Value::Null)).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["will-high", "will-low", "stage", "did-low", "did-high"]
        );
    }

    struct LoggingAround {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl AroundHandler for LoggingAround {
        async fn call(&self, ctx: &mut FlowContext, next: &(dyn Hook + Sync)) -> Result<()> {
            self.log.lock().unwrap().push(self.label);
            next.call(ctx).await
        }
    }

    #[tokio::test]
    async fn around_wraps_stage_as_onion() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plan = Plan {
            name: "t".to_string(),
            pre: vec![],
            execute: vec!["e".to_string()],
            post: vec![],
            finalize: vec![],
            error: vec![],
        };
        let hooks = vec![
            HookEntry::around("e", 10, Arc::new(LoggingAround { label: "outer", log: Arc::clone(&log) })),
            HookEntry::around("e", 1, Arc::new(LoggingAround { label: "inner", log: Arc::clone(&log) })),
            HookEntry::plain(HookKind::Stage, "e", 0, hook("stage", &log)),
        ];
        let mut invoker = Invoker::new();
        invoker.register_plan(plan, hooks);

        invoker.dispatch("t", FlowContext::new(serde_json::Value::Null)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner", "stage"]);
    }

    struct FailingHook;
    #[async_trait]
    impl Hook for FailingHook {
        async fn call(&self, _ctx: &mut FlowContext) -> Result<()> {
            Err(Error::Internal("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn error_jumps_to_error_stage_and_finalize_still_runs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plan = Plan {
            name: "t".to_string(),
            pre: vec![],
            execute: vec!["e".to_string()],
            post: vec!["should-not-run".to_string()],
            finalize: vec!["f".to_string()],
            error: vec!["err".to_string()],
        };
        let hooks = vec![
            HookEntry::plain(HookKind::Stage, "e", 0, Arc::new(FailingHook)),
            HookEntry::plain(HookKind::Stage, "should-not-run", 0, hook("post-should-not-run", &log)),
            HookEntry::plain(HookKind::Stage, "err", 0, hook("error", &log)),
            HookEntry::plain(HookKind::Stage, "f", 0, hook("finalize", &log)),
        ];
        let mut invoker = Invoker::new();
        invoker.register_plan(plan, hooks);

        let result = invoker.dispatch("t", FlowContext::new(serde_json::Value::Null)).await;
        assert!(result.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["error", "finalize"]);
    }

    #[tokio::test]
    async fn finalize_runs_exactly_once_on_success() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plan = Plan {
            name: "t".to_string(),
            pre: vec![],
            execute: vec![],
            post: vec![],
            finalize: vec!["f".to_string()],
            error: vec![],
        };
        let hooks = vec![HookEntry::plain(HookKind::Stage, "f", 0, hook("finalize", &log))];
        let mut invoker = Invoker::new();
        invoker.register_plan(plan, hooks);

        invoker.dispatch("t", FlowContext::new(serde_json::Value::Null)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["finalize"]);
    }

    #[tokio::test]
    async fn respond_seals_output_against_later_writers() {
        struct RespondHook(serde_json::Value);
        #[async_trait]
        impl Hook for RespondHook {
            async fn call(&self, ctx: &mut FlowContext) -> Result<()> {
                ctx.respond(self.0.clone());
                Ok(())
            }
        }

        let plan = Plan {
            name: "t".to_string(),
            pre: vec![],
            execute: vec!["e".to_string()],
            post: vec!["o".to_string()],
            finalize: vec![],
            error: vec![],
        };
        let hooks = vec![
            HookEntry::plain(HookKind::Stage, "e", 0, Arc::new(RespondHook(serde_json::json!("first")))),
            HookEntry::plain(HookKind::Stage, "o", 0, Arc::new(RespondHook(serde_json::json!("second")))),
        ];
        let mut invoker = Invoker::new();
        invoker.register_plan(plan, hooks);

        let out = invoker.dispatch("t", FlowContext::new(serde_json::Value::Null)).await.unwrap();
        assert_eq!(out, serde_json::json!("first"));
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_stages_but_runs_finalize() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plan = Plan {
            name: "t".to_string(),
            pre: vec!["p".to_string()],
            execute: vec!["e".to_string()],
            post: vec![],
            finalize: vec!["f".to_string()],
            error: vec![],
        };

        struct CancellingHook;
        #[async_trait]
        impl Hook for CancellingHook {
            async fn call(&self, ctx: &mut FlowContext) -> Result<()> {
                ctx.cancel.cancel();
                Ok(())
            }
        }

        let hooks = vec![
            HookEntry::plain(HookKind::Stage, "p", 0, Arc::new(CancellingHook)),
            HookEntry::plain(HookKind::Stage, "e", 0, hook("should-not-run", &log)),
            HookEntry::plain(HookKind::Stage, "f", 0, hook("finalize", &log)),
        ];
        let mut invoker = Invoker::new();
        invoker.register_plan(plan, hooks);

        let result = invoker.dispatch("t", FlowContext::new(serde_json::Value::Null)).await;
        assert!(result.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["finalize"]);
    }

    #[tokio::test]
    async fn determinism_same_hooks_same_order_every_run() {
        let plan = Plan {
            name: "t".to_string(),
            pre: vec![],
            execute: vec!["e".to_string()],
            post: vec![],
            finalize: vec![],
            error: vec![],
        };
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = vec![
            HookEntry::plain(HookKind::Will, "e", 5, hook("a", &log)),
            HookEntry::plain(HookKind::Will, "e", 5, hook("b", &log)),
            HookEntry::plain(HookKind::Will, "e", 5, hook("c", &log)),
        ];
        let mut invoker = Invoker::new();
        invoker.register_plan(plan, hooks);

        invoker.dispatch("t", FlowContext::new(serde_json::Value::Null)).await.unwrap();
        let first_run = log.lock().unwrap().clone();
        log.lock().unwrap().clear();
        invoker.dispatch("t", FlowContext::new(serde_json::Value::Null)).await.unwrap();
        let second_run = log.lock().unwrap().clone();

        assert_eq!(first_run, second_run);
        assert_eq!(first_run, vec!["a", "b", "c"]);
    }
}
