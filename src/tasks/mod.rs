//! Task data model: plugins, jobs, and bare tasks.
//!
//! A `Task` is a tagged variant over a shared `TaskCore`. Plugins
//! respond to matched chat commands, jobs run on a schedule or
//! trigger, bare tasks carry no configuration document and only ever
//! appear inside pipelines.

pub mod pattern;
pub mod registry;

use std::any::Any;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::pipeline::TaskApi;
use crate::protocol::TaskOutcome;

/// Task names are letters, digits and underscores only, so brain
/// functions can use `:` as a separator.
static TASK_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\w+$").unwrap());

/// Names no external task may claim.
pub const RESERVED_NAMES: &[&str] = &["bot"];

pub fn valid_task_name(name: &str) -> bool {
    TASK_NAME.is_match(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Plugin,
    Job,
    Bare,
}

/// A command, message, reply, or trigger matcher from a task's
/// configuration document. The compiled regex is filled in at load
/// time; a pattern that fails to compile disables the owning task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InputMatcher {
    #[serde(rename = "Regex")]
    pub regex: String,
    #[serde(rename = "Command", default)]
    pub command: String,
    /// Reply matchers use a label instead of a command.
    #[serde(rename = "Label", default)]
    pub label: String,
    /// Names for capture-group contexts, for "it" support.
    #[serde(rename = "Contexts", default)]
    pub contexts: Vec<String>,
    /// Jobs only: the user allowed to fire this trigger.
    #[serde(rename = "User", default)]
    pub user: String,
    /// Jobs only: parameter names bound to capture groups, in order.
    #[serde(rename = "Parameters", default)]
    pub parameters: Vec<String>,
    #[serde(skip)]
    pub re: Option<Regex>,
}

impl InputMatcher {
    /// Match against text and return the capture groups as arguments.
    pub fn capture(&self, text: &str) -> Option<Vec<String>> {
        let re = self.re.as_ref()?;
        let caps = re.captures(text)?;
        Some(
            (1..caps.len())
                .map(|i| caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect(),
        )
    }
}

/// Keywords and help text for the robot's help system.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginHelp {
    #[serde(rename = "Keywords", default)]
    pub keywords: Vec<String>,
    #[serde(rename = "Helptext", default)]
    pub helptext: Vec<String>,
}

/// Parameters become environment variables for the task process.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Parameter {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: String,
}

/// A task reference with fixed arguments, as written in scheduled-job
/// configuration or passed when a task appends to a pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Command", default)]
    pub command: String,
    #[serde(rename = "Arguments", default)]
    pub arguments: Vec<String>,
    #[serde(rename = "Parameters", default)]
    pub parameters: Vec<Parameter>,
}

/// A cron expression bound to a task and a fixed argument set. This is
/// declarative configuration, not a runtime entity.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduledTask {
    #[serde(rename = "Schedule")]
    pub schedule: String,
    #[serde(flatten)]
    pub spec: TaskSpec,
}

/// Attributes common to every task variant.
#[derive(Debug, Clone, Default)]
pub struct TaskCore {
    pub name: String,
    /// 32-char random hex, stable across reloads; the cross-reference
    /// key that survives name collisions between kinds.
    pub task_id: String,
    /// Tasks sharing a namespace share long-term memories and
    /// propagated environment variables. Defaults to the name.
    pub namespace: String,
    /// Path to the executable for externally-implemented tasks.
    pub path: Option<PathBuf>,
    pub disabled: bool,
    pub reason: Option<String>,
    pub allow_direct: bool,
    pub direct_only: bool,
    pub channels: Vec<String>,
    pub all_channels: bool,
    pub require_admin: bool,
    pub users: Vec<String>,
    pub elevator: String,
    pub authorizer: String,
    pub auth_require: String,
    pub max_histories: usize,
    pub parameters: Vec<Parameter>,
}

impl TaskCore {
    pub fn new(name: &str, task_id: String) -> Self {
        TaskCore {
            name: name.to_string(),
            task_id,
            namespace: name.to_string(),
            ..TaskCore::default()
        }
    }

    pub fn disable(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!("disabling task '{}': {}", self.name, reason);
        self.disabled = true;
        self.reason = Some(reason);
    }

    /// Whether this task may be triggered from the given context.
    /// `None` means a direct message.
    pub fn visible_in(&self, channel: Option<&str>) -> bool {
        match channel {
            None => self.allow_direct,
            Some(_) if self.direct_only => false,
            Some(ch) => {
                if !self.channels.is_empty() {
                    self.channels.iter().any(|c| c == ch)
                } else {
                    self.all_channels
                }
            }
        }
    }
}

/// Callback surface a natively-implemented plugin registers.
#[async_trait]
pub trait NativeHandler: Send + Sync {
    async fn handle(&self, api: TaskApi, command: &str, args: &[String]) -> TaskOutcome;
}

/// Typed decoder for a native plugin's `Config` block, registered at
/// compile time so configuration stays type-safe without reflection.
pub type ConfigDecoder =
    Arc<dyn Fn(&serde_json::Value) -> anyhow::Result<Arc<dyn Any + Send + Sync>> + Send + Sync>;

pub fn config_decoder<T>() -> ConfigDecoder
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    Arc::new(|value| {
        let decoded: T = serde_json::from_value(value.clone())?;
        Ok(Arc::new(decoded) as Arc<dyn Any + Send + Sync>)
    })
}

/// In-process implementation of a plugin: handler callback, default
/// configuration document, and an optional typed config decoder.
#[derive(Clone)]
pub struct NativeRef {
    pub handler: Arc<dyn NativeHandler>,
    pub default_config: String,
    pub config_decoder: Option<ConfigDecoder>,
}

pub struct PluginTask {
    pub core: TaskCore,
    /// `Some` for natively-implemented plugins, `None` for external.
    pub native: Option<NativeRef>,
    pub admin_commands: Vec<String>,
    pub elevated_commands: Vec<String>,
    pub elevate_immediate_commands: Vec<String>,
    pub authorized_commands: Vec<String>,
    pub authorize_all_commands: bool,
    pub help: Vec<PluginHelp>,
    pub command_matchers: Vec<InputMatcher>,
    pub message_matchers: Vec<InputMatcher>,
    pub reply_matchers: Vec<InputMatcher>,
    pub catch_all: bool,
    /// The merged `Config` block, served raw over the bridge.
    pub raw_config: Option<serde_json::Value>,
    /// The decoded typed config for native plugins.
    pub native_config: Option<Arc<dyn Any + Send + Sync>>,
}

impl PluginTask {
    pub fn new(core: TaskCore, native: Option<NativeRef>) -> Self {
        PluginTask {
            core,
            native,
            admin_commands: Vec::new(),
            elevated_commands: Vec::new(),
            elevate_immediate_commands: Vec::new(),
            authorized_commands: Vec::new(),
            authorize_all_commands: false,
            help: Vec::new(),
            command_matchers: Vec::new(),
            message_matchers: Vec::new(),
            reply_matchers: Vec::new(),
            catch_all: false,
            raw_config: None,
            native_config: None,
        }
    }

    pub fn reply_matcher(&self, label: &str) -> Option<&InputMatcher> {
        self.reply_matchers.iter().find(|m| m.label == label)
    }
}

#[derive(Debug)]
pub struct JobTask {
    pub core: TaskCore,
    /// Where job status updates are posted. A job with no channel
    /// cannot run unsupervised and is never scheduled.
    pub channel: String,
    /// User to notify on failure.
    pub notify: String,
    pub success_status: bool,
    pub notify_success: bool,
    /// Parameters that must be supplied before a run may start.
    pub required_parameters: Vec<String>,
    /// Heard-message triggers, e.g. from an integration user.
    pub triggers: Vec<InputMatcher>,
}

impl JobTask {
    pub fn new(core: TaskCore) -> Self {
        JobTask {
            core,
            channel: String::new(),
            notify: String::new(),
            success_status: false,
            notify_success: false,
            required_parameters: Vec::new(),
            triggers: Vec::new(),
        }
    }
}

pub enum Task {
    Plugin(PluginTask),
    Job(JobTask),
    Bare(TaskCore),
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Plugin(_) => TaskKind::Plugin,
            Task::Job(_) => TaskKind::Job,
            Task::Bare(_) => TaskKind::Bare,
        }
    }

    pub fn core(&self) -> &TaskCore {
        match self {
            Task::Plugin(p) => &p.core,
            Task::Job(j) => &j.core,
            Task::Bare(c) => c,
        }
    }

    pub fn core_mut(&mut self) -> &mut TaskCore {
        match self {
            Task::Plugin(p) => &mut p.core,
            Task::Job(j) => &mut j.core,
            Task::Bare(c) => c,
        }
    }

    pub fn as_plugin(&self) -> Option<&PluginTask> {
        match self {
            Task::Plugin(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_job(&self) -> Option<&JobTask> {
        match self {
            Task::Job(j) => Some(j),
            _ => None,
        }
    }
}

/// A successful match of inbound text against one of a task's
/// matchers.
#[derive(Debug, Clone)]
pub struct MatchHit {
    pub command: String,
    pub args: Vec<String>,
    pub parameters: Vec<Parameter>,
}

/// Capability seam for anything that can claim an inbound message.
pub trait Matchable {
    /// Matchers tried only when the robot was explicitly addressed.
    fn match_addressed(&self, text: &str) -> Option<MatchHit>;
    /// Matchers tried on every heard message.
    fn match_heard(&self, user: &str, text: &str) -> Option<MatchHit>;
}

impl Matchable for PluginTask {
    fn match_addressed(&self, text: &str) -> Option<MatchHit> {
        for m in &self.command_matchers {
            if let Some(args) = m.capture(text) {
                return Some(MatchHit {
                    command: m.command.clone(),
                    args,
                    parameters: Vec::new(),
                });
            }
        }
        None
    }

    fn match_heard(&self, _user: &str, text: &str) -> Option<MatchHit> {
        for m in &self.message_matchers {
            if let Some(args) = m.capture(text) {
                return Some(MatchHit {
                    command: m.command.clone(),
                    args,
                    parameters: Vec::new(),
                });
            }
        }
        None
    }
}

impl Matchable for JobTask {
    fn match_addressed(&self, _text: &str) -> Option<MatchHit> {
        None
    }

    /// Triggers fire a job run with capture groups bound to the
    /// trigger's named parameters, restricted to the declared user.
    fn match_heard(&self, user: &str, text: &str) -> Option<MatchHit> {
        for t in &self.triggers {
            if !t.user.is_empty() && t.user != user {
                continue;
            }
            if let Some(args) = t.capture(text) {
                let parameters = t
                    .parameters
                    .iter()
                    .zip(args.iter())
                    .map(|(name, value)| Parameter {
                        name: name.clone(),
                        value: value.clone(),
                    })
                    .collect();
                return Some(MatchHit {
                    command: "run".to_string(),
                    args: Vec::new(),
                    parameters,
                });
            }
        }
        None
    }
}
