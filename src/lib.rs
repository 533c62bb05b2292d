//! cogbot: a chatops automation robot. Plugins, jobs, and bare tasks
//! are loaded from YAML configuration, matched against chat by the
//! dispatcher, and run as pipelines with a durable brain, a cron
//! scheduler, and a localhost RPC bridge for external task processes.

pub mod bot;
pub mod brain;
pub mod bridge;
pub mod builtins;
pub mod config;
pub mod connector;
pub mod dispatch;
pub mod exec;
pub mod logging;
pub mod pipeline;
pub mod protocol;
pub mod replies;
pub mod scheduler;
pub mod tasks;
