//! Pipeline execution: one matched or scheduled task invocation grows
//! into a queue of steps run in order, with access-control gates up
//! front and per-step environment assembly for external processes.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::brain::{Brain, Checkout};
use crate::connector::{Connector, MessageFormat};
use crate::dispatch::Dispatch;
use crate::protocol::{RetVal, TaskOutcome};
use crate::replies::{ReplyOutcome, ReplyWaiters};
use crate::tasks::registry::{Registry, RegistrySnapshot};
use crate::tasks::{Parameter, Task, TaskSpec};

/// Elevation seam: stronger-than-password verification for sensitive
/// commands, e.g. a TOTP check. `immediate` requests re-verification
/// even within the elevation grace window.
#[async_trait]
pub trait Elevator: Send + Sync {
    async fn elevate(&self, user: &str, immediate: bool) -> bool;
}

/// Everything a pipeline needs, owned once by the robot and shared by
/// reference. No globals; tests wire up their own.
pub struct Services {
    pub connector: Arc<dyn Connector>,
    pub brain: Arc<Brain>,
    pub registry: Arc<Registry>,
    pub replies: Arc<ReplyWaiters>,
    pub elevator: Option<Arc<dyn Elevator>>,
    pub admin_users: Vec<String>,
    pub bot_name: String,
    pub local_port: u16,
}

impl Services {
    pub fn is_admin(&self, user: &str) -> bool {
        self.admin_users.iter().any(|u| u == user)
    }
}

/// Per-step context handed to native handlers and the bridge.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: String,
    pub user: String,
    pub channel: Option<String>,
    pub task_name: String,
    pub namespace: String,
    pub format: MessageFormat,
}

#[derive(Default)]
struct PendingOps {
    queue: Vec<TaskSpec>,
    fail_task: Option<TaskSpec>,
}

/// The API surface a running task sees: messaging, memory, replies,
/// and pipeline extension. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct TaskApi {
    services: Arc<Services>,
    ctx: RunContext,
    pending: Arc<Mutex<PendingOps>>,
}

impl TaskApi {
    pub fn user(&self) -> &str {
        &self.ctx.user
    }

    pub fn channel(&self) -> Option<&str> {
        self.ctx.channel.as_deref()
    }

    /// Post to the originating channel, or DM the user for a direct
    /// exchange.
    pub async fn say(&self, text: &str) -> RetVal {
        match &self.ctx.channel {
            Some(ch) => {
                self.services
                    .connector
                    .send_channel_message(ch, text, self.ctx.format)
                    .await
            }
            None => {
                self.services
                    .connector
                    .send_user_message(&self.ctx.user, text, self.ctx.format)
                    .await
            }
        }
    }

    /// Like `say`, but mentions the user in a channel.
    pub async fn reply(&self, text: &str) -> RetVal {
        match &self.ctx.channel {
            Some(ch) => {
                self.services
                    .connector
                    .send_user_channel_message(&self.ctx.user, ch, text, self.ctx.format)
                    .await
            }
            None => {
                self.services
                    .connector
                    .send_user_message(&self.ctx.user, text, self.ctx.format)
                    .await
            }
        }
    }

    fn datum_key(&self, key: &str) -> String {
        format!("{}:{}", self.ctx.namespace, key)
    }

    /// Long-term memory access, namespaced to the task.
    pub async fn checkout(&self, key: &str, for_write: bool) -> Checkout {
        self.services.brain.checkout(&self.datum_key(key), for_write).await
    }

    pub fn update(&self, key: &str, token: &str, payload: &str) -> RetVal {
        self.services.brain.update(&self.datum_key(key), token, payload)
    }

    pub fn checkin(&self, key: &str, token: &str) -> RetVal {
        self.services.brain.checkin(&self.datum_key(key), token)
    }

    /// Block for the user's next message in this context.
    pub async fn wait_for_reply(
        &self,
        pattern: &str,
        timeout: Duration,
    ) -> Result<ReplyOutcome, regex::Error> {
        self.services
            .replies
            .wait_for_reply(&self.ctx.user, self.ctx.channel.as_deref(), pattern, timeout)
            .await
    }

    /// Append a task to run after the current step completes.
    pub fn add_task(&self, spec: TaskSpec) {
        self.pending.lock().expect("pending ops poisoned").queue.push(spec);
    }

    /// Set the task to run if the pipeline later fails.
    pub fn set_fail_task(&self, spec: TaskSpec) {
        self.pending.lock().expect("pending ops poisoned").fail_task = Some(spec);
    }

    pub fn is_admin(&self) -> bool {
        self.services.is_admin(&self.ctx.user)
    }

    pub fn bot_name(&self) -> &str {
        &self.services.bot_name
    }

    /// The registry snapshot current right now, for tasks that browse
    /// other tasks, like the help system.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.services.registry.current()
    }
}

/// One resolved step in a pipeline.
pub struct TaskInvocation {
    pub task: Arc<Task>,
    pub command: String,
    pub args: Vec<String>,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub task_name: String,
    pub command: String,
    pub outcome: TaskOutcome,
    pub at: DateTime<Utc>,
}

/// Entry persisted to the brain under `histories:<job>`.
#[derive(Debug, Serialize, Deserialize)]
struct StoredHistory {
    run_id: String,
    outcome: String,
    at: DateTime<Utc>,
}

const DEFAULT_MAX_HISTORIES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// A step returned Fail or ConfigurationError; the fail task, if
    /// any, was run.
    Failed,
    /// A step reported MechanismFail; the pipeline stopped cold.
    Aborted,
    /// The run never started: gate refusal or shutdown.
    Rejected(String),
}

pub struct PipelineResult {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub history: Vec<HistoryRecord>,
}

pub struct PipelineEngine {
    services: Arc<Services>,
    active: AtomicUsize,
    accepting: AtomicBool,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PipelineEngine {
    pub fn new(services: Arc<Services>) -> Self {
        PipelineEngine {
            services,
            active: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Refuse new pipelines; running ones finish normally.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Wait up to `grace` for running pipelines to finish. Returns
    /// true when everything drained.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        while self.active() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    /// Run a dispatched invocation on behalf of a chat user, with the
    /// access-control gates applied.
    pub async fn run_dispatch(
        &self,
        dispatch: Dispatch,
        user: &str,
        channel: Option<&str>,
    ) -> PipelineResult {
        // A triggered job runs in its own channel, not wherever the
        // trigger text happened to be heard.
        let job_channel = match dispatch.task.as_ref() {
            Task::Job(job) if !job.channel.is_empty() => Some(job.channel.clone()),
            _ => None,
        };
        let channel = job_channel.as_deref().or(channel);
        let seed = TaskInvocation {
            task: dispatch.task,
            command: dispatch.command,
            args: dispatch.args,
            parameters: dispatch.parameters,
        };
        self.execute(seed, user, channel, false).await
    }

    /// Run a task unattended: scheduled jobs, triggers, and startup
    /// initialization. Gates are bypassed; there is no human to refuse.
    pub async fn run_automatic(
        &self,
        task: Arc<Task>,
        command: &str,
        args: Vec<String>,
        parameters: Vec<Parameter>,
        channel: Option<&str>,
    ) -> PipelineResult {
        let bot_name = self.services.bot_name.clone();
        let seed = TaskInvocation {
            task,
            command: command.to_string(),
            args,
            parameters,
        };
        self.execute(seed, &bot_name, channel, true).await
    }

    async fn execute(
        &self,
        seed: TaskInvocation,
        user: &str,
        channel: Option<&str>,
        automatic: bool,
    ) -> PipelineResult {
        let run_id = new_run_id();
        if !self.accepting.load(Ordering::SeqCst) {
            return PipelineResult {
                run_id,
                outcome: RunOutcome::Rejected("shutting down".to_string()),
                history: Vec::new(),
            };
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        // Pipelines run against the snapshot current at start; a
        // reload mid-run changes nothing underneath them.
        let snapshot = self.services.registry.current();

        // Every interactive run passes the gates; message matchers and
        // catch-all are no less a command than an addressed one.
        let mut history: Vec<HistoryRecord> = Vec::new();
        if !automatic {
            if let Err(refusal) = self
                .check_gates(&run_id, &seed, user, channel, &mut history)
                .await
            {
                let ctx = self.context(&run_id, &seed, user, channel);
                let api = self.api(ctx);
                api.reply(&refusal).await;
                return PipelineResult {
                    run_id,
                    outcome: RunOutcome::Rejected(refusal),
                    history,
                };
            }
        }

        if let Task::Job(job) = seed.task.as_ref() {
            let env = self.build_env(&run_id, &seed, user, channel);
            if let Some(missing) = job
                .required_parameters
                .iter()
                .find(|p| !env.contains_key(p.as_str()))
            {
                let msg = format!(
                    "job '{}' missing required parameter {}",
                    job.core.name, missing
                );
                error!("{msg}");
                self.notify_failure(job, &msg).await;
                return PipelineResult {
                    run_id,
                    outcome: RunOutcome::Rejected(msg),
                    history,
                };
            }
        }

        let primary = seed.task.clone();
        let mut queue: VecDeque<TaskInvocation> = VecDeque::new();
        queue.push_back(seed);
        let mut fail_spec: Option<TaskSpec> = None;
        let mut outcome = RunOutcome::Completed;

        while let Some(inv) = queue.pop_front() {
            let pending = Arc::new(Mutex::new(PendingOps::default()));
            let step = self
                .run_step(&run_id, &inv, user, channel, pending.clone())
                .await;
            history.push(HistoryRecord {
                task_name: inv.task.core().name.clone(),
                command: inv.command.clone(),
                outcome: step,
                at: Utc::now(),
            });

            {
                let mut ops = pending.lock().expect("pending ops poisoned");
                if let Some(spec) = ops.fail_task.take() {
                    fail_spec = Some(spec);
                }
                for spec in ops.queue.drain(..) {
                    match resolve_spec(&snapshot, &spec) {
                        Ok(next) => queue.push_back(next),
                        Err(reason) => {
                            error!("pipeline {run_id}: {reason}");
                            outcome = RunOutcome::Failed;
                        }
                    }
                }
            }
            if outcome == RunOutcome::Failed {
                break;
            }

            match step {
                TaskOutcome::Normal => continue,
                TaskOutcome::Fail | TaskOutcome::ConfigurationError => {
                    warn!(
                        "pipeline {run_id}: task '{}' returned {:?}",
                        inv.task.core().name,
                        step
                    );
                    outcome = RunOutcome::Failed;
                    break;
                }
                TaskOutcome::MechanismFail => {
                    error!(
                        "pipeline {run_id}: mechanism failure in '{}', aborting",
                        inv.task.core().name
                    );
                    outcome = RunOutcome::Aborted;
                    break;
                }
            }
        }

        // The fail task runs for Fail and ConfigurationError, never
        // for a mechanism failure.
        if outcome == RunOutcome::Failed {
            if let Some(spec) = fail_spec {
                match resolve_spec(&snapshot, &spec) {
                    Ok(inv) => {
                        let pending = Arc::new(Mutex::new(PendingOps::default()));
                        let step = self
                            .run_step(&run_id, &inv, user, channel, pending)
                            .await;
                        history.push(HistoryRecord {
                            task_name: inv.task.core().name.clone(),
                            command: inv.command.clone(),
                            outcome: step,
                            at: Utc::now(),
                        });
                    }
                    Err(reason) => error!("pipeline {run_id}: fail task: {reason}"),
                }
            }
        }

        if let Task::Job(job) = primary.as_ref() {
            self.finish_job(&run_id, job, &outcome).await;
        }

        info!("pipeline {run_id} finished: {:?}", outcome);
        PipelineResult { run_id, outcome, history }
    }

    fn context(
        &self,
        run_id: &str,
        inv: &TaskInvocation,
        user: &str,
        channel: Option<&str>,
    ) -> RunContext {
        RunContext {
            run_id: run_id.to_string(),
            user: user.to_string(),
            channel: channel.map(str::to_string),
            task_name: inv.task.core().name.clone(),
            namespace: inv.task.core().namespace.clone(),
            format: MessageFormat::Variable,
        }
    }

    fn api(&self, ctx: RunContext) -> TaskApi {
        TaskApi {
            services: self.services.clone(),
            ctx,
            pending: Arc::new(Mutex::new(PendingOps::default())),
        }
    }

    async fn run_step(
        &self,
        run_id: &str,
        inv: &TaskInvocation,
        user: &str,
        channel: Option<&str>,
        pending: Arc<Mutex<PendingOps>>,
    ) -> TaskOutcome {
        let core = inv.task.core();
        if core.disabled {
            error!("pipeline {run_id}: task '{}' is disabled", core.name);
            return TaskOutcome::ConfigurationError;
        }
        let ctx = self.context(run_id, inv, user, channel);
        if let Some(native) = inv.task.as_plugin().and_then(|p| p.native.as_ref()) {
            let api = TaskApi {
                services: self.services.clone(),
                ctx,
                pending,
            };
            return native.handler.handle(api, &inv.command, &inv.args).await;
        }
        let Some(path) = &core.path else {
            error!("pipeline {run_id}: task '{}' has no implementation", core.name);
            return TaskOutcome::ConfigurationError;
        };
        let env = self.build_env(run_id, inv, user, channel);
        match crate::exec::run_external(path, &inv.command, &inv.args, &env).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("pipeline {run_id}: running '{}': {e:#}", core.name);
                TaskOutcome::MechanismFail
            }
        }
    }

    /// Environment for an external step: declared parameters first,
    /// namespace secrets from the brain on top, invocation parameters
    /// highest, plus the robot builtins.
    fn build_env(
        &self,
        run_id: &str,
        inv: &TaskInvocation,
        user: &str,
        channel: Option<&str>,
    ) -> HashMap<String, String> {
        let core = inv.task.core();
        let mut env: HashMap<String, String> = HashMap::new();
        for p in &core.parameters {
            env.insert(p.name.clone(), p.value.clone());
        }
        let secrets_key = format!("secrets:{}", core.namespace);
        if let Some(raw) = self.services.brain.peek(&secrets_key) {
            match serde_json::from_str::<HashMap<String, String>>(&raw) {
                Ok(secrets) => env.extend(secrets),
                Err(e) => warn!("malformed secrets for '{}': {e}", core.namespace),
            }
        }
        for p in &inv.parameters {
            env.insert(p.name.clone(), p.value.clone());
        }
        env.insert("COGBOT_USER".to_string(), user.to_string());
        env.insert(
            "COGBOT_CHANNEL".to_string(),
            channel.unwrap_or_default().to_string(),
        );
        env.insert("COGBOT_RUN_ID".to_string(), run_id.to_string());
        env.insert("COGBOT_CALLER_ID".to_string(), core.task_id.clone());
        env.insert(
            "COGBOT_HTTP_POST".to_string(),
            format!("http://127.0.0.1:{}/json", self.services.local_port),
        );
        env
    }

    /// Admin, authorization, and elevation checks for an interactive
    /// dispatch, in that order. Returns the refusal message on the
    /// first gate that fails; an authorizer run is recorded in the
    /// pipeline's history like any other step.
    async fn check_gates(
        &self,
        run_id: &str,
        seed: &TaskInvocation,
        user: &str,
        channel: Option<&str>,
        history: &mut Vec<HistoryRecord>,
    ) -> Result<(), String> {
        let Some(plugin) = seed.task.as_plugin() else {
            return Ok(());
        };
        let core = &plugin.core;

        if core.require_admin || plugin.admin_commands.iter().any(|c| c == &seed.command) {
            if !self.services.is_admin(user) {
                return Err(
                    "Sorry, that command is only available to bot administrators".to_string(),
                );
            }
        }

        let needs_auth = !core.authorizer.is_empty()
            && (plugin.authorize_all_commands
                || plugin.authorized_commands.iter().any(|c| c == &seed.command));
        if needs_auth {
            let snapshot = self.services.registry.current();
            let Some(auth_task) = snapshot.task_by_name(&core.authorizer) else {
                return Err(format!(
                    "Sorry, authorizer '{}' isn't available",
                    core.authorizer
                ));
            };
            let auth_require = if core.auth_require.is_empty() {
                core.name.clone()
            } else {
                core.auth_require.clone()
            };
            let inv = TaskInvocation {
                task: auth_task,
                command: "authorize".to_string(),
                args: vec![auth_require, seed.command.clone()],
                parameters: Vec::new(),
            };
            let pending = Arc::new(Mutex::new(PendingOps::default()));
            let outcome = self.run_step(run_id, &inv, user, channel, pending).await;
            history.push(HistoryRecord {
                task_name: inv.task.core().name.clone(),
                command: inv.command.clone(),
                outcome,
                at: Utc::now(),
            });
            match outcome {
                TaskOutcome::Normal => {}
                TaskOutcome::Fail => {
                    return Err("Sorry, you're not authorized for that command".to_string());
                }
                _ => {
                    return Err("Sorry, authorization failed with a mechanism error".to_string());
                }
            }
        }

        let immediate = plugin
            .elevate_immediate_commands
            .iter()
            .any(|c| c == &seed.command);
        let needs_elevation =
            immediate || plugin.elevated_commands.iter().any(|c| c == &seed.command);
        if needs_elevation {
            let Some(elevator) = &self.services.elevator else {
                return Err("Sorry, elevation is required but no elevator is configured".to_string());
            };
            if !elevator.elevate(user, immediate).await {
                return Err("Sorry, elevation failed".to_string());
            }
        }
        Ok(())
    }

    async fn notify_failure(&self, job: &crate::tasks::JobTask, msg: &str) {
        if !job.channel.is_empty() {
            self.services
                .connector
                .send_channel_message(&job.channel, msg, MessageFormat::Variable)
                .await;
        }
        if !job.notify.is_empty() {
            self.services
                .connector
                .send_user_message(&job.notify, msg, MessageFormat::Variable)
                .await;
        }
    }

    /// Post job status, notify per the job's flags, and append the run
    /// to the job's bounded history in the brain.
    async fn finish_job(&self, run_id: &str, job: &crate::tasks::JobTask, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Completed => {
                let msg = format!("Job '{}' completed successfully", job.core.name);
                if job.success_status && !job.channel.is_empty() {
                    self.services
                        .connector
                        .send_channel_message(&job.channel, &msg, MessageFormat::Variable)
                        .await;
                }
                if job.notify_success && !job.notify.is_empty() {
                    self.services
                        .connector
                        .send_user_message(&job.notify, &msg, MessageFormat::Variable)
                        .await;
                }
            }
            RunOutcome::Failed | RunOutcome::Aborted => {
                self.notify_failure(job, &format!("Job '{}' failed", job.core.name))
                    .await;
            }
            RunOutcome::Rejected(_) => return,
        }
        self.record_history(run_id, job, outcome).await;
    }

    async fn record_history(&self, run_id: &str, job: &crate::tasks::JobTask, outcome: &RunOutcome) {
        let key = format!("histories:{}", job.core.name);
        let co = self.services.brain.checkout(&key, true).await;
        if co.ret != RetVal::Ok {
            warn!("couldn't check out job history '{}': {:?}", key, co.ret);
            return;
        }
        let mut entries: Vec<StoredHistory> = co
            .payload
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        entries.push(StoredHistory {
            run_id: run_id.to_string(),
            outcome: format!("{outcome:?}"),
            at: Utc::now(),
        });
        let cap = if job.core.max_histories > 0 {
            job.core.max_histories
        } else {
            DEFAULT_MAX_HISTORIES
        };
        if entries.len() > cap {
            let drop = entries.len() - cap;
            entries.drain(..drop);
        }
        match serde_json::to_string(&entries) {
            Ok(payload) => {
                let ret = self.services.brain.update(&key, &co.token, &payload);
                if ret != RetVal::Ok {
                    warn!("couldn't store job history '{}': {:?}", key, ret);
                }
            }
            Err(e) => {
                warn!("couldn't serialize job history '{}': {e}", key);
                self.services.brain.checkin(&key, &co.token);
            }
        }
    }
}

fn resolve_spec(
    snapshot: &RegistrySnapshot,
    spec: &TaskSpec,
) -> Result<TaskInvocation, String> {
    let Some(task) = snapshot.task_by_name(&spec.name) else {
        return Err(format!("added task '{}' not found", spec.name));
    };
    if task.core().disabled {
        return Err(format!("added task '{}' is disabled", spec.name));
    }
    let command = if spec.command.is_empty() {
        "run".to_string()
    } else {
        spec.command.clone()
    };
    Ok(TaskInvocation {
        task,
        command,
        args: spec.arguments.clone(),
        parameters: spec.parameters.clone(),
    })
}

fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::memory::MemoryStore;
    use crate::config::BotConfig;
    use crate::connector::RecordingConnector;
    use crate::tasks::registry::{NativeSpec, Registry};
    use crate::tasks::{NativeHandler, NativeRef};

    struct SayHandler;

    #[async_trait]
    impl NativeHandler for SayHandler {
        async fn handle(&self, api: TaskApi, command: &str, _args: &[String]) -> TaskOutcome {
            api.say(&format!("{command}: PONG")).await;
            TaskOutcome::Normal
        }
    }

    struct ChainHandler;

    #[async_trait]
    impl NativeHandler for ChainHandler {
        async fn handle(&self, api: TaskApi, command: &str, _args: &[String]) -> TaskOutcome {
            match command {
                "start" => {
                    api.say("first").await;
                    api.add_task(TaskSpec {
                        name: "chain".to_string(),
                        command: "second".to_string(),
                        ..TaskSpec::default()
                    });
                    TaskOutcome::Normal
                }
                "second" => {
                    api.say("second").await;
                    TaskOutcome::Normal
                }
                _ => TaskOutcome::Fail,
            }
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl NativeHandler for FailingHandler {
        async fn handle(&self, api: TaskApi, command: &str, _args: &[String]) -> TaskOutcome {
            match command {
                "doomed" => {
                    api.set_fail_task(TaskSpec {
                        name: "cleanup".to_string(),
                        command: "cleanup".to_string(),
                        ..TaskSpec::default()
                    });
                    TaskOutcome::Fail
                }
                "cleanup" => {
                    api.say("cleaning up").await;
                    TaskOutcome::Normal
                }
                "broken" => TaskOutcome::MechanismFail,
                _ => TaskOutcome::Normal,
            }
        }
    }

    struct CountingHandler(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl NativeHandler for CountingHandler {
        async fn handle(&self, _api: TaskApi, command: &str, args: &[String]) -> TaskOutcome {
            self.0
                .lock()
                .unwrap()
                .push(format!("{command} {}", args.join(" ")));
            if command == "authorize" && args.first().map(String::as_str) == Some("denied") {
                return TaskOutcome::Fail;
            }
            TaskOutcome::Normal
        }
    }

    struct StubElevator {
        allow: bool,
        calls: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl Elevator for StubElevator {
        async fn elevate(&self, _user: &str, immediate: bool) -> bool {
            self.calls.lock().unwrap().push(immediate);
            self.allow
        }
    }

    fn native(name: &str, config: &str, handler: Arc<dyn NativeHandler>) -> NativeSpec {
        NativeSpec {
            name: name.to_string(),
            native: NativeRef {
                handler,
                default_config: config.to_string(),
                config_decoder: None,
            },
        }
    }

    async fn harness(
        natives: Vec<NativeSpec>,
        elevator: Option<Arc<dyn Elevator>>,
    ) -> (Arc<Services>, PipelineEngine, Arc<RecordingConnector>) {
        let registry = Arc::new(Registry::new(natives));
        registry.reload(&BotConfig::default()).await.unwrap();
        let connector = Arc::new(RecordingConnector::new());
        let services = Arc::new(Services {
            connector: connector.clone(),
            brain: Arc::new(Brain::new(Box::new(MemoryStore::new()))),
            registry,
            replies: Arc::new(ReplyWaiters::new()),
            elevator,
            admin_users: vec!["root_user".to_string()],
            bot_name: "cogbot".to_string(),
            local_port: 8880,
        });
        let engine = PipelineEngine::new(services.clone());
        (services, engine, connector)
    }

    fn dispatch_for(services: &Services, name: &str, command: &str) -> Dispatch {
        Dispatch {
            task: services.registry.current().task_by_name(name).unwrap(),
            command: command.to_string(),
            args: Vec::new(),
            parameters: Vec::new(),
            is_command: true,
        }
    }

    const OPEN: &str = "AllChannels: true\nCommandMatchers:\n  - Command: x\n    Regex: x\n";

    #[tokio::test]
    async fn single_step_pipeline_says_and_completes() {
        let (services, engine, connector) =
            harness(vec![native("ping", OPEN, Arc::new(SayHandler))], None).await;
        let result = engine
            .run_dispatch(dispatch_for(&services, "ping", "ping"), "alice", Some("general"))
            .await;
        assert_eq!(result.outcome, RunOutcome::Completed);
        assert_eq!(result.history.len(), 1);
        assert_eq!(result.history[0].outcome, TaskOutcome::Normal);
        let sent = connector.sent();
        assert_eq!(sent[0].channel.as_deref(), Some("general"));
        assert_eq!(sent[0].text, "ping: PONG");
    }

    #[tokio::test]
    async fn added_tasks_run_in_order() {
        let (services, engine, connector) =
            harness(vec![native("chain", OPEN, Arc::new(ChainHandler))], None).await;
        let result = engine
            .run_dispatch(dispatch_for(&services, "chain", "start"), "alice", None)
            .await;
        assert_eq!(result.outcome, RunOutcome::Completed);
        assert_eq!(result.history.len(), 2);
        let texts: Vec<String> = connector.sent().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn fail_task_runs_on_failure_but_not_mechanism_failure() {
        let (services, engine, connector) = harness(
            vec![native("cleanup", OPEN, Arc::new(FailingHandler))],
            None,
        )
        .await;
        let result = engine
            .run_dispatch(dispatch_for(&services, "cleanup", "doomed"), "alice", None)
            .await;
        assert_eq!(result.outcome, RunOutcome::Failed);
        assert_eq!(result.history.len(), 2);
        assert_eq!(result.history[1].command, "cleanup");
        assert_eq!(connector.sent()[0].text, "cleaning up");

        let result = engine
            .run_dispatch(dispatch_for(&services, "cleanup", "broken"), "alice", None)
            .await;
        assert_eq!(result.outcome, RunOutcome::Aborted);
        assert_eq!(result.history.len(), 1);
    }

    #[tokio::test]
    async fn admin_gate_refuses_non_admins() {
        let doc = "AllChannels: true\nRequireAdmin: true\nCommandMatchers:\n  - Command: x\n    Regex: x\n";
        let (services, engine, connector) =
            harness(vec![native("sudo", doc, Arc::new(SayHandler))], None).await;

        let result = engine
            .run_dispatch(dispatch_for(&services, "sudo", "x"), "mallory", Some("ops"))
            .await;
        assert!(matches!(result.outcome, RunOutcome::Rejected(_)));
        assert!(connector.sent()[0].text.contains("administrators"));

        let result = engine
            .run_dispatch(dispatch_for(&services, "sudo", "x"), "root_user", Some("ops"))
            .await;
        assert_eq!(result.outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn admin_gate_covers_message_matcher_commands() {
        // An admin command reachable through a MessageMatcher must be
        // gated exactly like an addressed one.
        let doc = "AllChannels: true\nAdminCommands: [ \"wipe\" ]\nMessageMatchers:\n  - Command: wipe\n    Regex: \"wipe the database\"\n";
        let (services, engine, connector) =
            harness(vec![native("janitor", doc, Arc::new(SayHandler))], None).await;

        let mut d = dispatch_for(&services, "janitor", "wipe");
        d.is_command = false;
        let result = engine.run_dispatch(d, "mallory", Some("general")).await;
        assert!(matches!(result.outcome, RunOutcome::Rejected(_)));
        assert!(connector.sent()[0].text.contains("administrators"));

        let mut d = dispatch_for(&services, "janitor", "wipe");
        d.is_command = false;
        let result = engine.run_dispatch(d, "root_user", Some("general")).await;
        assert_eq!(result.outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn authorizer_gate_allows_and_denies() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let auth_doc = "AllChannels: true\nCommandMatchers:\n  - Command: authorize\n    Regex: authorize\n";
        let allowed_doc = r#"
AllChannels: true
Authorizer: groups
AuthorizeAllCommands: true
CommandMatchers:
  - Command: x
    Regex: x
"#;
        let denied_doc = r#"
AllChannels: true
Authorizer: groups
AuthRequire: denied
AuthorizeAllCommands: true
CommandMatchers:
  - Command: x
    Regex: x
"#;
        let (services, engine, _connector) = harness(
            vec![
                native("groups", auth_doc, Arc::new(CountingHandler(log.clone()))),
                native("open_door", allowed_doc, Arc::new(SayHandler)),
                native("locked_door", denied_doc, Arc::new(SayHandler)),
            ],
            None,
        )
        .await;

        let result = engine
            .run_dispatch(dispatch_for(&services, "open_door", "x"), "alice", None)
            .await;
        assert_eq!(result.outcome, RunOutcome::Completed);
        assert_eq!(log.lock().unwrap()[0], "authorize open_door x");
        // The authorizer run is the first history record of the run.
        assert_eq!(result.history.len(), 2);
        assert_eq!(result.history[0].task_name, "groups");
        assert_eq!(result.history[0].command, "authorize");
        assert_eq!(result.history[0].outcome, TaskOutcome::Normal);

        let result = engine
            .run_dispatch(dispatch_for(&services, "locked_door", "x"), "alice", None)
            .await;
        assert!(matches!(result.outcome, RunOutcome::Rejected(_)));
        assert_eq!(result.history.len(), 1);
        assert_eq!(result.history[0].outcome, TaskOutcome::Fail);
    }

    #[tokio::test]
    async fn elevation_gate_consults_the_elevator() {
        let doc = r#"
AllChannels: true
ElevatedCommands: [ "x" ]
ElevateImmediateCommands: [ "y" ]
CommandMatchers:
  - Command: x
    Regex: x
  - Command: y
    Regex: y
"#;
        let elevator = Arc::new(StubElevator {
            allow: true,
            calls: Mutex::new(Vec::new()),
        });
        let (services, engine, _connector) = harness(
            vec![native("vault", doc, Arc::new(SayHandler))],
            Some(elevator.clone()),
        )
        .await;

        let result = engine
            .run_dispatch(dispatch_for(&services, "vault", "x"), "alice", None)
            .await;
        assert_eq!(result.outcome, RunOutcome::Completed);
        let result = engine
            .run_dispatch(dispatch_for(&services, "vault", "y"), "alice", None)
            .await;
        assert_eq!(result.outcome, RunOutcome::Completed);
        assert_eq!(*elevator.calls.lock().unwrap(), vec![false, true]);
    }

    #[tokio::test]
    async fn elevation_without_elevator_is_refused() {
        let doc = r#"
AllChannels: true
ElevatedCommands: [ "x" ]
CommandMatchers:
  - Command: x
    Regex: x
"#;
        let (services, engine, connector) =
            harness(vec![native("vault", doc, Arc::new(SayHandler))], None).await;
        let result = engine
            .run_dispatch(dispatch_for(&services, "vault", "x"), "alice", None)
            .await;
        assert!(matches!(result.outcome, RunOutcome::Rejected(_)));
        assert!(connector.sent()[0].text.contains("no elevator"));
    }

    #[tokio::test]
    async fn automatic_runs_bypass_gates() {
        let doc = "AllChannels: true\nRequireAdmin: true\nCommandMatchers:\n  - Command: x\n    Regex: x\n";
        let (services, engine, _connector) =
            harness(vec![native("sudo", doc, Arc::new(SayHandler))], None).await;
        let task = services.registry.current().task_by_name("sudo").unwrap();
        let result = engine
            .run_automatic(task, "x", Vec::new(), Vec::new(), None)
            .await;
        assert_eq!(result.outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn stopped_engine_rejects_new_pipelines() {
        let (services, engine, _connector) =
            harness(vec![native("ping", OPEN, Arc::new(SayHandler))], None).await;
        engine.stop_accepting();
        let result = engine
            .run_dispatch(dispatch_for(&services, "ping", "ping"), "alice", None)
            .await;
        assert_eq!(
            result.outcome,
            RunOutcome::Rejected("shutting down".to_string())
        );
        assert!(engine.drain(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn secrets_and_parameters_layer_into_the_environment() {
        let (services, engine, _connector) =
            harness(vec![native("ping", OPEN, Arc::new(SayHandler))], None).await;
        // Stash namespace secrets the way the bridge would.
        let co = services.brain.checkout("secrets:deploy", true).await;
        services.brain.update(
            "secrets:deploy",
            &co.token,
            r#"{"DEPLOY_KEY":"hunter2","REGION":"us-east-1"}"#,
        );

        let mut core = crate::tasks::TaskCore::new("deploy", "ab".repeat(16));
        core.parameters = vec![
            Parameter { name: "REGION".to_string(), value: "eu-west-1".to_string() },
            Parameter { name: "TIER".to_string(), value: "staging".to_string() },
        ];
        let task = Arc::new(Task::Bare(core));
        let inv = TaskInvocation {
            task,
            command: "run".to_string(),
            args: Vec::new(),
            parameters: vec![Parameter {
                name: "TIER".to_string(),
                value: "prod".to_string(),
            }],
        };
        let env = engine.build_env("run1", &inv, "alice", Some("ops"));
        // Secrets beat declared parameters; invocation beats both.
        assert_eq!(env.get("DEPLOY_KEY").unwrap(), "hunter2");
        assert_eq!(env.get("REGION").unwrap(), "us-east-1");
        assert_eq!(env.get("TIER").unwrap(), "prod");
        assert_eq!(env.get("COGBOT_USER").unwrap(), "alice");
        assert_eq!(env.get("COGBOT_CHANNEL").unwrap(), "ops");
        assert!(env.get("COGBOT_HTTP_POST").unwrap().ends_with("/json"));
    }

    #[tokio::test]
    async fn job_missing_required_parameter_is_rejected_and_notified() {
        let (services, engine, connector) = harness(Vec::new(), None).await;
        let mut job = crate::tasks::JobTask::new(crate::tasks::TaskCore::new(
            "nightly",
            "cd".repeat(16),
        ));
        job.channel = "builds".to_string();
        job.required_parameters = vec!["TARGET".to_string()];
        let task = Arc::new(Task::Job(job));
        let result = engine
            .run_automatic(task, "run", Vec::new(), Vec::new(), Some("builds"))
            .await;
        assert!(matches!(result.outcome, RunOutcome::Rejected(_)));
        assert!(connector.sent()[0].text.contains("TARGET"));
        let _ = services;
    }

    #[tokio::test]
    async fn job_history_is_recorded_and_bounded() {
        let (services, engine, _connector) = harness(Vec::new(), None).await;
        let mut core = crate::tasks::TaskCore::new("nightly", "ef".repeat(16));
        core.max_histories = 2;
        // A job with a native-less, path-less core fails its only
        // step, which still records a history entry.
        let task = Arc::new(Task::Job(crate::tasks::JobTask::new(core)));
        for _ in 0..3 {
            engine
                .run_automatic(task.clone(), "run", Vec::new(), Vec::new(), None)
                .await;
        }
        let raw = services.brain.peek("histories:nightly").unwrap();
        let entries: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["outcome"], "Failed");
    }
}
