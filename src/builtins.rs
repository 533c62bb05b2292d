//! Built-in native plugins every robot carries: liveness checks and
//! the help system. These go through the same registry, matchers, and
//! pipeline as any other plugin.

use std::sync::Arc;

use async_trait::async_trait;

use crate::pipeline::TaskApi;
use crate::protocol::TaskOutcome;
use crate::tasks::registry::NativeSpec;
use crate::tasks::{NativeHandler, NativeRef, Task};

/// The native plugins registered on every robot.
pub fn native_plugins() -> Vec<NativeSpec> {
    vec![ping_plugin(), help_plugin()]
}

const PING_CONFIG: &str = r#"
Help:
  - Keywords: [ "ping" ]
    Helptext: [ "(bot), ping - verify the robot is alive" ]
  - Keywords: [ "thanks" ]
    Helptext: [ "(bot), thanks - politeness is free" ]
CommandMatchers:
  - Command: ping
    Regex: "(?i:ping)"
  - Command: thanks
    Regex: "(?i:thanks?( you)?!?)"
"#;

struct PingHandler;

#[async_trait]
impl NativeHandler for PingHandler {
    async fn handle(&self, api: TaskApi, command: &str, _args: &[String]) -> TaskOutcome {
        match command {
            "ping" => {
                api.reply("PONG").await;
                TaskOutcome::Normal
            }
            "thanks" => {
                api.reply("You're welcome!").await;
                TaskOutcome::Normal
            }
            // "init" and anything else synthetic.
            _ => TaskOutcome::Normal,
        }
    }
}

fn ping_plugin() -> NativeSpec {
    NativeSpec {
        name: "ping".to_string(),
        native: NativeRef {
            handler: Arc::new(PingHandler),
            default_config: PING_CONFIG.to_string(),
            config_decoder: None,
        },
    }
}

const HELP_CONFIG: &str = r#"
Help:
  - Keywords: [ "help" ]
    Helptext: [ "(bot), help <keyword> - list commands matching the keyword" ]
CommandMatchers:
  - Command: help
    Regex: '(?i:help ?([\w]+)?)'
"#;

struct HelpHandler;

#[async_trait]
impl NativeHandler for HelpHandler {
    async fn handle(&self, api: TaskApi, command: &str, args: &[String]) -> TaskOutcome {
        if command != "help" {
            return TaskOutcome::Normal;
        }
        let keyword = args.first().map(String::as_str).unwrap_or_default();
        let snapshot = api.snapshot();
        let mut lines: Vec<String> = Vec::new();
        for task in &snapshot.tasks {
            let Task::Plugin(plugin) = task.as_ref() else {
                continue;
            };
            if plugin.core.disabled || !plugin.core.visible_in(api.channel()) {
                continue;
            }
            for help in &plugin.help {
                if !keyword.is_empty() && !help.keywords.iter().any(|k| k == keyword) {
                    continue;
                }
                for text in &help.helptext {
                    lines.push(text.replace("(bot)", api.bot_name()));
                }
            }
        }
        if lines.is_empty() {
            api.say(&format!("Sorry, I've got nothing for '{keyword}'"))
                .await;
        } else {
            lines.sort();
            lines.dedup();
            api.say(&lines.join("\n")).await;
        }
        TaskOutcome::Normal
    }
}

fn help_plugin() -> NativeSpec {
    NativeSpec {
        name: "help".to_string(),
        native: NativeRef {
            handler: Arc::new(HelpHandler),
            default_config: HELP_CONFIG.to_string(),
            config_decoder: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::Brain;
    use crate::brain::memory::MemoryStore;
    use crate::config::BotConfig;
    use crate::connector::RecordingConnector;
    use crate::dispatch::Dispatcher;
    use crate::pipeline::{PipelineEngine, RunOutcome, Services};
    use crate::replies::ReplyWaiters;
    use crate::tasks::registry::Registry;

    async fn harness() -> (
        Arc<Services>,
        PipelineEngine,
        Dispatcher,
        Arc<RecordingConnector>,
    ) {
        let registry = Arc::new(Registry::new(native_plugins()));
        let cfg = BotConfig::default();
        registry.reload(&cfg).await.unwrap();
        let connector = Arc::new(RecordingConnector::new());
        let services = Arc::new(Services {
            connector: connector.clone(),
            brain: Arc::new(Brain::new(Box::new(MemoryStore::new()))),
            registry,
            replies: Arc::new(ReplyWaiters::new()),
            elevator: None,
            admin_users: Vec::new(),
            bot_name: "cogbot".to_string(),
            local_port: 8880,
        });
        let engine = PipelineEngine::new(services.clone());
        (services, engine, Dispatcher::new(&cfg), connector)
    }

    async fn run(text: &str) -> Vec<String> {
        let (services, engine, dispatcher, connector) = harness().await;
        let event = crate::connector::ChatEvent {
            user: "alice".to_string(),
            channel: Some("general".to_string()),
            text: text.to_string(),
            addressed: false,
        };
        for d in dispatcher.match_event(&services.registry.current(), &event) {
            let result = engine.run_dispatch(d, &event.user, event.channel.as_deref()).await;
            assert_eq!(result.outcome, RunOutcome::Completed);
        }
        connector.sent().into_iter().map(|m| m.text).collect()
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        assert_eq!(run("cogbot: ping").await, vec!["PONG".to_string()]);
    }

    #[tokio::test]
    async fn thanks_gets_a_reply() {
        assert_eq!(run("cogbot: thank you!").await, vec!["You're welcome!".to_string()]);
    }

    #[tokio::test]
    async fn help_lists_matching_keywords_with_bot_name() {
        let sent = run("cogbot: help ping").await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("cogbot, ping"));
        assert!(!sent[0].contains("(bot)"));
        assert!(!sent[0].contains("help <keyword>"));
    }

    #[tokio::test]
    async fn bare_help_lists_everything() {
        let sent = run("cogbot: help").await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("ping"));
        assert!(sent[0].contains("help <keyword>"));
    }

    #[tokio::test]
    async fn unknown_keyword_apologizes() {
        let sent = run("cogbot: help quantum").await;
        assert!(sent[0].contains("nothing for 'quantum'"));
    }
}
