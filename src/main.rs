use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use cogbot::bot::Robot;
use cogbot::config::BotConfig;
use cogbot::connector::{ChatEvent, TerminalConnector};
use cogbot::logging;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("COGBOT_CONFIG").ok())
        .unwrap_or_else(|| "conf/cogbot.yaml".to_string());
    let cfg = match std::fs::metadata(&config_path) {
        Ok(_) => BotConfig::load(&config_path)?,
        Err(_) => {
            info!("no configuration at '{config_path}', starting with defaults");
            BotConfig::default()
        }
    };

    let connector = Arc::new(TerminalConnector::new(cfg.name.clone()));
    let robot = Robot::new(cfg, connector)?;
    robot.start().await?;

    // Terminal event loop: each line is a direct message, or a channel
    // message when prefixed "#channel ". "quit" shuts down.
    info!("type messages below; 'quit' to exit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        let (channel, text) = match line.strip_prefix('#') {
            Some(rest) => match rest.split_once(' ') {
                Some((channel, text)) => (Some(channel.to_string()), text.to_string()),
                None => (Some(rest.to_string()), String::new()),
            },
            None => (None, line),
        };
        let event = ChatEvent {
            user: "terminal".to_string(),
            channel,
            text,
            addressed: false,
        };
        // A pipeline may block in wait_for_reply; the answer arrives on
        // the next line, so the read loop can't wait for it.
        let robot = robot.clone();
        tokio::spawn(async move {
            robot.handle_event(event).await;
        });
    }

    robot.shutdown(Duration::from_secs(5)).await;
    Ok(())
}
