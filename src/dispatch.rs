//! Inbound message dispatch: recognize when the robot is addressed,
//! strip the address form, and collect every task invocation an event
//! should start. The dispatcher only matches; running what it found is
//! the pipeline engine's business.

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::BotConfig;
use crate::connector::ChatEvent;
use crate::tasks::registry::RegistrySnapshot;
use crate::tasks::{Matchable, Parameter, Task, TaskKind};

/// Recognizes the configured address forms: a leading "name:",
/// "name,", a leading alias character, or a trailing ", name"
/// vocative. Direct messages are always addressed.
pub struct Addressing {
    prefix: Regex,
    suffix: Regex,
}

impl Addressing {
    pub fn new(name: &str, alias: Option<char>) -> Self {
        let name_pat = regex::escape(name);
        let prefix_pat = match alias {
            Some(ch) => format!(
                r"^(?i:@?{name_pat}[:,]?\s+|{})",
                regex::escape(&ch.to_string())
            ),
            None => format!(r"^(?i:@?{name_pat}[:,]?\s+)"),
        };
        let suffix_pat = format!(r"(?i:,\s+@?{name_pat}[.!?]?)\s*$");
        Addressing {
            prefix: Regex::new(&prefix_pat).expect("address prefix pattern"),
            suffix: Regex::new(&suffix_pat).expect("address suffix pattern"),
        }
    }

    /// Whether `text` addresses the robot, and the text with the
    /// address form removed.
    pub fn strip(&self, text: &str, direct: bool) -> (bool, String) {
        let trimmed = text.trim();
        if direct {
            return (true, trimmed.to_string());
        }
        if let Some(m) = self.prefix.find(trimmed) {
            return (true, trimmed[m.end()..].trim().to_string());
        }
        if let Some(m) = self.suffix.find(trimmed) {
            return (true, trimmed[..m.start()].trim().to_string());
        }
        (false, trimmed.to_string())
    }
}

/// One task invocation the dispatcher decided an event should start.
#[derive(Clone)]
pub struct Dispatch {
    pub task: Arc<Task>,
    pub command: String,
    pub args: Vec<String>,
    pub parameters: Vec<Parameter>,
    /// True when this came from a command matcher on an addressed
    /// message, false for ambient message matchers and job triggers.
    pub is_command: bool,
}

pub struct Dispatcher {
    addressing: Addressing,
}

impl Dispatcher {
    pub fn new(cfg: &BotConfig) -> Self {
        Dispatcher {
            addressing: Addressing::new(&cfg.name, cfg.alias_char()),
        }
    }

    /// Match one inbound event against every visible task in the
    /// snapshot. Command matchers only see addressed messages with the
    /// address form stripped; message matchers and job triggers hear
    /// the raw text of everything.
    pub fn match_event(&self, snap: &RegistrySnapshot, event: &ChatEvent) -> Vec<Dispatch> {
        let direct = event.channel.is_none();
        let (addressed, stripped) =
            self.addressing.strip(&event.text, direct || event.addressed);
        let channel = event.channel.as_deref();

        let mut dispatches = Vec::new();
        let mut command_matched = false;
        for task in &snap.tasks {
            let core = task.core();
            if core.disabled {
                continue;
            }
            // Jobs listen for their triggers anywhere; the run itself
            // happens in the job's own channel.
            let visible = match task.as_ref() {
                Task::Job(_) => true,
                _ => core.visible_in(channel),
            };
            if !visible {
                continue;
            }
            if !core.users.is_empty() && !core.users.iter().any(|u| u == &event.user) {
                continue;
            }
            let hit = match task.as_ref() {
                Task::Plugin(plugin) => {
                    let mut hit = None;
                    if addressed {
                        hit = plugin.match_addressed(&stripped);
                    }
                    if hit.is_none() {
                        hit = plugin.match_heard(&event.user, &event.text);
                    }
                    hit
                }
                Task::Job(job) => job.match_heard(&event.user, &event.text),
                Task::Bare(_) => None,
            };
            if let Some(hit) = hit {
                let is_command = addressed && task.kind() == TaskKind::Plugin;
                if is_command {
                    command_matched = true;
                }
                debug!(
                    "dispatching '{}' command '{}' for {}",
                    core.name, hit.command, event.user
                );
                dispatches.push(Dispatch {
                    task: task.clone(),
                    command: hit.command,
                    args: hit.args,
                    parameters: hit.parameters,
                    is_command,
                });
            }
        }

        if dispatches.len() > 1 {
            let names: Vec<&str> = dispatches
                .iter()
                .map(|d| d.task.core().name.as_str())
                .collect();
            warn!("message from {} matched multiple tasks: {:?}", event.user, names);
        }

        // An addressed message nobody claimed goes to catch-all
        // plugins with the full stripped text as the only argument.
        if addressed && !command_matched {
            for task in &snap.tasks {
                let Task::Plugin(plugin) = task.as_ref() else {
                    continue;
                };
                if plugin.core.disabled || !plugin.catch_all || !plugin.core.visible_in(channel) {
                    continue;
                }
                dispatches.push(Dispatch {
                    task: task.clone(),
                    command: "catchall".to_string(),
                    args: vec![stripped.clone()],
                    parameters: Vec::new(),
                    is_command: true,
                });
            }
        }
        dispatches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::registry::{NativeSpec, Registry};
    use crate::tasks::{NativeHandler, NativeRef};
    use crate::pipeline::TaskApi;
    use crate::protocol::TaskOutcome;
    use async_trait::async_trait;

    struct NoopHandler;

    #[async_trait]
    impl NativeHandler for NoopHandler {
        async fn handle(&self, _api: TaskApi, _command: &str, _args: &[String]) -> TaskOutcome {
            TaskOutcome::Normal
        }
    }

    fn native(name: &str, default_config: &str) -> NativeSpec {
        NativeSpec {
            name: name.to_string(),
            native: NativeRef {
                handler: std::sync::Arc::new(NoopHandler),
                default_config: default_config.to_string(),
                config_decoder: None,
            },
        }
    }

    fn event(user: &str, channel: Option<&str>, text: &str) -> ChatEvent {
        ChatEvent {
            user: user.to_string(),
            channel: channel.map(str::to_string),
            text: text.to_string(),
            addressed: false,
        }
    }

    async fn snapshot_with(natives: Vec<NativeSpec>, cfg: &BotConfig) -> Arc<RegistrySnapshot> {
        let registry = Registry::new(natives);
        registry.reload(cfg).await.unwrap();
        registry.current()
    }

    const PING: &str = r#"
AllChannels: true
CommandMatchers:
  - Command: ping
    Regex: "(?i:ping)"
"#;

    #[test]
    fn addressing_forms_are_recognized_and_stripped() {
        let addr = Addressing::new("floyd", Some(';'));
        for (input, want) in [
            ("floyd: ping", "ping"),
            ("floyd, ping", "ping"),
            ("Floyd ping", "ping"),
            ("@floyd ping", "ping"),
            (";ping", "ping"),
            ("ping, floyd", "ping"),
            ("ping, floyd?", "ping"),
        ] {
            let (addressed, stripped) = addr.strip(input, false);
            assert!(addressed, "{input:?} should address the robot");
            assert_eq!(stripped, want, "{input:?}");
        }
        let (addressed, _) = addr.strip("just chatting about floydian slips", false);
        assert!(!addressed);
        // DMs are always addressed, nothing to strip.
        let (addressed, stripped) = addr.strip("ping", true);
        assert!(addressed);
        assert_eq!(stripped, "ping");
    }

    #[tokio::test]
    async fn addressed_command_dispatches_plugin() {
        let cfg = BotConfig::default();
        let snap = snapshot_with(vec![native("ping", PING)], &cfg).await;
        let d = Dispatcher::new(&cfg);

        let got = d.match_event(&snap, &event("alice", Some("general"), "cogbot: ping"));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].command, "ping");
        assert!(got[0].is_command);

        // Unaddressed, command matchers stay silent.
        assert!(d.match_event(&snap, &event("alice", Some("general"), "ping")).is_empty());
        // DMs need no address form.
        let got = d.match_event(&snap, &event("alice", None, "ping"));
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn message_matchers_hear_unaddressed_text() {
        let doc = r#"
AllChannels: true
MessageMatchers:
  - Command: lunch
    Regex: "(?i:lunch time)"
"#;
        let cfg = BotConfig::default();
        let snap = snapshot_with(vec![native("social", doc)], &cfg).await;
        let d = Dispatcher::new(&cfg);

        let got = d.match_event(&snap, &event("bob", Some("random"), "hey all, lunch time soon?"));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].command, "lunch");
        assert!(!got[0].is_command);
    }

    #[tokio::test]
    async fn visibility_and_user_gates_are_enforced() {
        let doc = r#"
Channels: [ "ops" ]
Users: [ "alice" ]
CommandMatchers:
  - Command: deploy
    Regex: "deploy"
"#;
        let cfg = BotConfig::default();
        let snap = snapshot_with(vec![native("deploy", doc)], &cfg).await;
        let d = Dispatcher::new(&cfg);

        assert_eq!(d.match_event(&snap, &event("alice", Some("ops"), "cogbot: deploy")).len(), 1);
        // Wrong channel.
        assert!(d.match_event(&snap, &event("alice", Some("random"), "cogbot: deploy")).is_empty());
        // Wrong user.
        assert!(d.match_event(&snap, &event("mallory", Some("ops"), "cogbot: deploy")).is_empty());
    }

    #[tokio::test]
    async fn unclaimed_addressed_message_goes_to_catch_all() {
        let catchall = r#"
AllChannels: true
CatchAll: true
"#;
        let cfg = BotConfig::default();
        let snap = snapshot_with(vec![native("ping", PING), native("fallback", catchall)], &cfg).await;
        let d = Dispatcher::new(&cfg);

        let got = d.match_event(&snap, &event("alice", Some("general"), "cogbot: do a barrel roll"));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].task.core().name, "fallback");
        assert_eq!(got[0].command, "catchall");
        assert_eq!(got[0].args, vec!["do a barrel roll".to_string()]);

        // A claimed command never reaches catch-all.
        let got = d.match_event(&snap, &event("alice", Some("general"), "cogbot: ping"));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].task.core().name, "ping");
    }
}
