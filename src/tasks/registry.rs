//! Task registry and configuration loader.
//!
//! `reload` rebuilds a complete candidate snapshot from natively
//! registered handlers, externally declared tasks, and per-task
//! configuration documents, then installs it atomically. Per-task
//! problems disable only the offending task, always with a recorded
//! reason; dispatch and scheduling never observe a half-built
//! registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Result, bail};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::BotConfig;
use crate::tasks::{
    JobTask, NativeRef, PluginTask, RESERVED_NAMES, Task, TaskCore, pattern, valid_task_name,
};

/// A natively-implemented plugin registered before startup.
pub struct NativeSpec {
    pub name: String,
    pub native: NativeRef,
}

/// Process-wide name→ID map. Append-only: a name's ID is generated
/// once and reused on every subsequent reload, so task IDs stay
/// stable for the life of the process.
#[derive(Default)]
pub struct TaskIdMap {
    map: Mutex<HashMap<String, String>>,
}

impl TaskIdMap {
    pub fn get_or_assign(&self, name: &str) -> String {
        let mut map = self.map.lock().expect("task id map poisoned");
        if let Some(id) = map.get(name) {
            return id.clone();
        }
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let id = hex::encode(bytes);
        map.insert(name.to_string(), id.clone());
        id
    }
}

/// An immutable, internally consistent view of all loaded tasks.
pub struct RegistrySnapshot {
    pub tasks: Vec<Arc<Task>>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<String, usize>,
}

impl RegistrySnapshot {
    pub fn empty() -> Self {
        RegistrySnapshot {
            tasks: Vec::new(),
            by_name: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn task_by_name(&self, name: &str) -> Option<Arc<Task>> {
        self.by_name.get(name).map(|&i| self.tasks[i].clone())
    }

    pub fn task_by_id(&self, id: &str) -> Option<Arc<Task>> {
        self.by_id.get(id).map(|&i| self.tasks[i].clone())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub enabled: usize,
    pub disabled: usize,
    pub skipped: usize,
}

/// The registry service object. One instance is owned by the robot
/// and passed by reference to the dispatcher, scheduler, and pipeline
/// engine; there are no process-wide globals.
pub struct Registry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    id_map: TaskIdMap,
    natives: Vec<NativeSpec>,
    diagnostics: Mutex<HashMap<String, Vec<String>>>,
}

impl Registry {
    pub fn new(natives: Vec<NativeSpec>) -> Self {
        Registry {
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::empty())),
            id_map: TaskIdMap::default(),
            natives,
            diagnostics: Mutex::new(HashMap::new()),
        }
    }

    /// Copy the current snapshot reference. Readers hold the lock
    /// only long enough to clone the Arc.
    pub fn current(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().expect("registry lock poisoned").clone()
    }

    /// Load-time diagnostics recorded for a task, for the admin
    /// inspection surface.
    pub fn diagnostics(&self, task_id: &str) -> Vec<String> {
        self.diagnostics
            .lock()
            .expect("diagnostics poisoned")
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    fn note(&self, notes: &mut HashMap<String, Vec<String>>, task_id: &str, msg: String) {
        debug!("task {}: {}", task_id, msg);
        notes.entry(task_id.to_string()).or_default().push(msg);
    }

    /// Rebuild the registry from configuration. Per-task failures
    /// disable that task and continue; only a catastrophic error
    /// before any task is processed aborts the reload, leaving the
    /// previous snapshot live.
    pub async fn reload(&self, cfg: &BotConfig) -> Result<LoadReport> {
        let mut notes: HashMap<String, Vec<String>> = HashMap::new();
        let mut tasks: Vec<Task> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();
        let mut report = LoadReport::default();

        // Natively-registered handlers are seeded first; a duplicate
        // registration is a programmer error and aborts the load.
        for spec in &self.natives {
            if by_name.contains_key(&spec.name) {
                bail!("duplicate native plugin registration: {}", spec.name);
            }
            let core = TaskCore::new(&spec.name, self.id_map.get_or_assign(&spec.name));
            by_name.insert(spec.name.clone(), tasks.len());
            tasks.push(Task::Plugin(PluginTask::new(core, Some(spec.native.clone()))));
        }

        for (index, decl) in cfg.external_tasks.iter().enumerate() {
            if !valid_task_name(&decl.name) {
                error!(
                    "external task #{}: name '{}' is not alphanumeric/underscore, skipping",
                    index + 1,
                    decl.name
                );
                report.skipped += 1;
                continue;
            }
            if RESERVED_NAMES.contains(&decl.name.as_str()) {
                error!("external task name '{}' is reserved, skipping", decl.name);
                report.skipped += 1;
                continue;
            }
            if by_name.contains_key(&decl.name) {
                error!(
                    "external task #{}: name '{}' duplicates an earlier task, skipping",
                    index + 1,
                    decl.name
                );
                report.skipped += 1;
                continue;
            }
            let mut core = TaskCore::new(&decl.name, self.id_map.get_or_assign(&decl.name));
            if !decl.namespace.is_empty() {
                core.namespace = decl.namespace.clone();
            }
            if decl.path.is_empty() {
                let msg = format!("task '{}' has an empty path, disabling", decl.name);
                self.note(&mut notes, &core.task_id, msg.clone());
                core.disable(msg);
            } else {
                core.path = Some(resolve_path(&decl.path, cfg));
            }
            let task = match decl.task_type.to_ascii_lowercase().as_str() {
                "plugin" => Task::Plugin(PluginTask::new(core, None)),
                "job" => Task::Job(JobTask::new(core)),
                "task" => Task::Bare(core),
                other => {
                    error!(
                        "external task '{}' has unknown type '{}', should be plugin|job|task, skipping",
                        decl.name, other
                    );
                    report.skipped += 1;
                    continue;
                }
            };
            by_name.insert(decl.name.clone(), tasks.len());
            tasks.push(task);
        }

        // Load and validate per-task configuration documents.
        for task in &mut tasks {
            if task.core().disabled {
                continue;
            }
            match task {
                Task::Plugin(plugin) => {
                    if let Err(reason) = self.configure_plugin(plugin, cfg).await {
                        self.note(&mut notes, &plugin.core.task_id, reason.clone());
                        plugin.core.disable(reason);
                    }
                }
                Task::Job(job) => {
                    if let Err(reason) = self.configure_job(job, cfg) {
                        self.note(&mut notes, &job.core.task_id, reason.clone());
                        job.core.disable(reason);
                    }
                }
                // Bare tasks carry no configuration document.
                Task::Bare(_) => {}
            }
        }

        for task in &tasks {
            if task.core().disabled {
                report.disabled += 1;
            } else {
                report.enabled += 1;
            }
        }

        let by_id = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.core().task_id.clone(), i))
            .collect();
        let snapshot = RegistrySnapshot {
            tasks: tasks.into_iter().map(Arc::new).collect(),
            by_name,
            by_id,
        };

        // Atomic install: swap the snapshot, never mutate in place.
        *self.snapshot.write().expect("registry lock poisoned") = Arc::new(snapshot);
        *self.diagnostics.lock().expect("diagnostics poisoned") = notes;
        info!(
            "registry loaded: {} enabled, {} disabled, {} skipped",
            report.enabled, report.disabled, report.skipped
        );
        Ok(report)
    }

    async fn configure_plugin(&self, plugin: &mut PluginTask, cfg: &BotConfig) -> StdResult {
        let default_doc = match &plugin.native {
            Some(native) => native.default_config.clone(),
            None => {
                let Some(path) = plugin.core.path.clone() else {
                    return Err("external plugin has no path".to_string());
                };
                crate::exec::fetch_default_config(&path)
                    .await
                    .map_err(|e| format!("error getting default configuration: {e}"))?
            }
        };
        let mut doc = parse_doc(&default_doc)
            .map_err(|e| format!("error parsing default configuration: {e}"))?;
        overlay_config_files(&mut doc, "plugins", &plugin.core.name, cfg)?;

        let flags = apply_plugin_config(plugin, &doc)?;
        if flags.disabled_by_config {
            return Err("disabled by configuration".to_string());
        }
        resolve_direct_visibility(plugin, &flags, cfg.default_allow_direct)?;
        resolve_channel_visibility(plugin, &flags, &cfg.default_channels)?;
        compile_plugin_matchers(plugin)?;
        check_security_commands(plugin)?;
        decode_native_config(plugin)?;
        debug!("configured plugin '{}'", plugin.core.name);
        Ok(())
    }

    fn configure_job(&self, job: &mut JobTask, cfg: &BotConfig) -> StdResult {
        let mut doc = serde_json::Map::new();
        overlay_config_files(&mut doc, "jobs", &job.core.name, cfg)?;
        apply_job_config(job, &doc)?;
        for trigger in &mut job.triggers {
            let re = pattern::compile_unanchored(&trigger.regex)
                .map_err(|e| format!("couldn't compile trigger regex '{}': {e}", trigger.regex))?;
            trigger.re = Some(re);
        }
        debug!("configured job '{}'", job.core.name);
        Ok(())
    }
}

type StdResult = std::result::Result<(), String>;

fn resolve_path(raw: &str, cfg: &BotConfig) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    // Relative paths are searched in the install path first, then the
    // config path.
    let installed = cfg.install_path.join(path);
    if installed.exists() {
        return installed;
    }
    let configured = cfg.config_path.join(path);
    if configured.exists() {
        return configured;
    }
    path.to_path_buf()
}

/// Parse one YAML configuration document into a key→value map. An
/// empty document is an empty map.
fn parse_doc(raw: &str) -> std::result::Result<serde_json::Map<String, Value>, String> {
    let value: Value = serde_yaml::from_str(raw).map_err(|e| e.to_string())?;
    match value {
        Value::Null => Ok(serde_json::Map::new()),
        Value::Object(map) => Ok(map),
        other => Err(format!("expected a mapping, got: {other}")),
    }
}

/// Overlay installation-path and configuration-path documents on top
/// of the default, in that precedence order: custom overrides default.
fn overlay_config_files(
    doc: &mut serde_json::Map<String, Value>,
    subdir: &str,
    name: &str,
    cfg: &BotConfig,
) -> StdResult {
    for base in [&cfg.install_path, &cfg.config_path] {
        if base.as_os_str().is_empty() {
            continue;
        }
        let path = base.join("conf").join(subdir).join(format!("{name}.yaml"));
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let overlay = parse_doc(&raw)
                    .map_err(|e| format!("problem loading configuration {path:?}: {e}"))?;
                for (key, value) in overlay {
                    doc.insert(key, value);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(format!("problem reading configuration {path:?}: {e}")),
        }
    }
    Ok(())
}

/// Boolean false can be explicitly configured or defaulted; in a few
/// places that distinction matters, so explicit settings are tracked.
#[derive(Default)]
struct PluginConfigFlags {
    explicit_allow_direct: bool,
    explicit_deny_direct: bool,
    deny_direct: bool,
    explicit_all_channels: bool,
    disabled_by_config: bool,
}

fn field<T: DeserializeOwned>(key: &str, value: &Value) -> std::result::Result<T, String> {
    serde_json::from_value(value.clone())
        .map_err(|e| format!("error unmarshalling value for '{key}': {e}"))
}

/// Validate every configuration key against the fixed allow-list and
/// assign recognized values. An unrecognized key disables the plugin;
/// silent typos in security configuration are worse than a hard stop.
fn apply_plugin_config(
    plugin: &mut PluginTask,
    doc: &serde_json::Map<String, Value>,
) -> std::result::Result<PluginConfigFlags, String> {
    let mut flags = PluginConfigFlags::default();
    for (key, value) in doc {
        match key.as_str() {
            "Disabled" => flags.disabled_by_config = field(key, value)?,
            "AllowDirect" => {
                plugin.core.allow_direct = field(key, value)?;
                flags.explicit_allow_direct = true;
            }
            "DirectOnly" => plugin.core.direct_only = field(key, value)?,
            "DenyDirect" => {
                flags.deny_direct = field(key, value)?;
                flags.explicit_deny_direct = true;
            }
            "Channels" => plugin.core.channels = field(key, value)?,
            "AllChannels" => {
                plugin.core.all_channels = field(key, value)?;
                flags.explicit_all_channels = true;
            }
            "RequireAdmin" => plugin.core.require_admin = field(key, value)?,
            "Users" => plugin.core.users = field(key, value)?,
            "Elevator" => plugin.core.elevator = field(key, value)?,
            "Authorizer" => plugin.core.authorizer = field(key, value)?,
            "AuthRequire" => plugin.core.auth_require = field(key, value)?,
            "NameSpace" => {
                let ns: String = field(key, value)?;
                if !ns.is_empty() {
                    plugin.core.namespace = ns;
                }
            }
            "MaxHistories" => plugin.core.max_histories = field(key, value)?,
            "Parameters" => plugin.core.parameters = field(key, value)?,
            "AdminCommands" => plugin.admin_commands = field(key, value)?,
            "ElevatedCommands" => plugin.elevated_commands = field(key, value)?,
            "ElevateImmediateCommands" => {
                plugin.elevate_immediate_commands = field(key, value)?
            }
            "AuthorizedCommands" => plugin.authorized_commands = field(key, value)?,
            "AuthorizeAllCommands" => plugin.authorize_all_commands = field(key, value)?,
            "Help" => plugin.help = field(key, value)?,
            "CommandMatchers" => plugin.command_matchers = field(key, value)?,
            "MessageMatchers" => plugin.message_matchers = field(key, value)?,
            "ReplyMatchers" => plugin.reply_matchers = field(key, value)?,
            "CatchAll" => plugin.catch_all = field(key, value)?,
            "Config" => plugin.raw_config = Some(value.clone()),
            unknown => {
                return Err(format!("invalid configuration key: {unknown}"));
            }
        }
    }
    Ok(flags)
}

/// Three-way direct-message visibility resolution, including the
/// deprecated DenyDirect flag.
fn resolve_direct_visibility(
    plugin: &mut PluginTask,
    flags: &PluginConfigFlags,
    default_allow_direct: bool,
) -> StdResult {
    let mut explicit_allow = flags.explicit_allow_direct;
    if plugin.core.direct_only {
        if explicit_allow {
            if !plugin.core.allow_direct {
                return Err(
                    "conflicting values for AllowDirect (false) and DirectOnly (true)".to_string(),
                );
            }
        } else {
            // DirectOnly implies AllowDirect unless contradicted.
            plugin.core.allow_direct = true;
            explicit_allow = true;
        }
    }
    if explicit_allow
        && flags.explicit_deny_direct
        && plugin.core.allow_direct == flags.deny_direct
    {
        return Err("conflicting values for AllowDirect and deprecated DenyDirect".to_string());
    }
    if flags.explicit_deny_direct && !explicit_allow {
        warn!(
            "deprecated DenyDirect for '{}'; setting AllowDirect = {}",
            plugin.core.name, !flags.deny_direct
        );
        plugin.core.allow_direct = !flags.deny_direct;
        explicit_allow = true;
    }
    if !explicit_allow {
        plugin.core.allow_direct = default_allow_direct;
    }
    Ok(())
}

/// Channel visibility: default channel list when none configured,
/// otherwise default AllChannels on. A plugin reachable nowhere is
/// disabled.
fn resolve_channel_visibility(
    plugin: &mut PluginTask,
    flags: &PluginConfigFlags,
    default_channels: &[String],
) -> StdResult {
    if plugin.core.channels.is_empty() {
        if !default_channels.is_empty() {
            // AllChannels = true is always explicit.
            if !plugin.core.all_channels {
                plugin.core.channels = default_channels.to_vec();
            }
        } else if !flags.explicit_all_channels {
            plugin.core.all_channels = true;
        }
    }
    if plugin.core.channels.is_empty() && !(plugin.core.allow_direct || plugin.core.all_channels) {
        return Err("not visible in any channel or by direct message".to_string());
    }
    Ok(())
}

/// Command and reply patterns are anchored to the full normalized
/// message; message patterns are left unanchored.
fn compile_plugin_matchers(plugin: &mut PluginTask) -> StdResult {
    for m in plugin
        .command_matchers
        .iter_mut()
        .chain(plugin.reply_matchers.iter_mut())
    {
        let re = pattern::compile_anchored(&m.regex)
            .map_err(|e| format!("couldn't compile regex '{}': {e}", m.regex))?;
        m.re = Some(re);
    }
    for m in plugin.message_matchers.iter_mut() {
        let re = pattern::compile_unanchored(&m.regex)
            .map_err(|e| format!("couldn't compile message regex '{}': {e}", m.regex))?;
        m.re = Some(re);
    }
    Ok(())
}

/// Every name in the security command lists must reference a command
/// from this plugin's own matchers; a dangling reference is a typo
/// waiting to punch a hole in access control.
fn check_security_commands(plugin: &PluginTask) -> StdResult {
    let lists: [(&str, &[String]); 4] = [
        ("admin", &plugin.admin_commands),
        ("elevated", &plugin.elevated_commands),
        ("elevate immediate", &plugin.elevate_immediate_commands),
        ("authorized", &plugin.authorized_commands),
    ];
    for (kind, list) in lists {
        for name in list {
            let found = plugin
                .command_matchers
                .iter()
                .chain(plugin.message_matchers.iter())
                .any(|m| &m.command == name);
            if !found {
                return Err(format!(
                    "{kind} command '{name}' didn't match a command from CommandMatchers or MessageMatchers"
                ));
            }
        }
    }
    Ok(())
}

/// Native plugins with a registered config decoder get their merged
/// `Config` block decoded into the typed struct now, so every later
/// access is lock-free and type-safe. Config supplied with no decoder
/// registered is fatal for the task; a registered decoder with no
/// config is only a warning.
fn decode_native_config(plugin: &mut PluginTask) -> StdResult {
    let Some(native) = &plugin.native else {
        return Ok(());
    };
    match (&native.config_decoder, &plugin.raw_config) {
        (Some(decode), Some(raw)) => {
            let typed =
                decode(raw).map_err(|e| format!("error decoding plugin Config block: {e}"))?;
            plugin.native_config = Some(typed);
            Ok(())
        }
        (Some(_), None) => {
            warn!(
                "plugin '{}' registered a config struct, but no Config block is configured",
                plugin.core.name
            );
            Ok(())
        }
        (None, Some(_)) => Err(
            "custom configuration supplied, but no config struct was registered".to_string(),
        ),
        (None, None) => Ok(()),
    }
}

const JOB_KEYS: &[&str] = &[
    "Channel",
    "Notify",
    "SuccessStatus",
    "NotifySuccess",
    "RequiredParameters",
    "Triggers",
    "Parameters",
    "Disabled",
    "NameSpace",
    "MaxHistories",
];

fn apply_job_config(job: &mut JobTask, doc: &serde_json::Map<String, Value>) -> StdResult {
    for (key, value) in doc {
        if !JOB_KEYS.contains(&key.as_str()) {
            return Err(format!("invalid configuration key: {key}"));
        }
        match key.as_str() {
            "Channel" => job.channel = field(key, value)?,
            "Notify" => job.notify = field(key, value)?,
            "SuccessStatus" => job.success_status = field(key, value)?,
            "NotifySuccess" => job.notify_success = field(key, value)?,
            "RequiredParameters" => job.required_parameters = field(key, value)?,
            "Triggers" => job.triggers = field(key, value)?,
            "Parameters" => job.core.parameters = field(key, value)?,
            "Disabled" => {
                if field::<bool>(key, value)? {
                    return Err("disabled by configuration".to_string());
                }
            }
            "NameSpace" => {
                let ns: String = field(key, value)?;
                if !ns.is_empty() {
                    job.core.namespace = ns;
                }
            }
            "MaxHistories" => job.core.max_histories = field(key, value)?,
            _ => unreachable!("key checked against JOB_KEYS"),
        }
    }
    Ok(())
}
