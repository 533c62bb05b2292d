//! Robot assembly and lifecycle: wire the services together, load
//! configuration, run the event loop pieces, and shut down cleanly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::brain::memory::MemoryStore;
use crate::brain::sqlite::SqliteStore;
use crate::brain::{Brain, BrainStore};
use crate::builtins;
use crate::config::BotConfig;
use crate::connector::{ChatEvent, Connector};
use crate::dispatch::Dispatcher;
use crate::pipeline::{Elevator, PipelineEngine, PipelineResult, Services};
use crate::replies::ReplyWaiters;
use crate::scheduler::Scheduler;
use crate::tasks::Task;
use crate::tasks::registry::{NativeSpec, Registry};

pub struct Robot {
    cfg: BotConfig,
    services: Arc<Services>,
    engine: Arc<PipelineEngine>,
    dispatcher: Dispatcher,
    scheduler: tokio::sync::Mutex<Scheduler>,
    started: AtomicBool,
}

fn brain_from_config(cfg: &BotConfig) -> Result<Brain> {
    let store: Box<dyn BrainStore> = match cfg.brain.provider.to_ascii_lowercase().as_str() {
        "" | "memory" => Box::new(MemoryStore::new()),
        "sqlite" => {
            let path = cfg
                .brain
                .file
                .clone()
                .unwrap_or_else(|| cfg.config_path.join("brain.db"));
            Box::new(SqliteStore::open(&path)?)
        }
        other => anyhow::bail!("unknown brain provider '{other}'"),
    };
    Ok(Brain::new(store))
}

impl Robot {
    /// Build a robot with the standard built-in plugins and no
    /// elevator.
    pub fn new(cfg: BotConfig, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        Robot::with_parts(cfg, connector, builtins::native_plugins(), None)
    }

    /// Full-control constructor: extra native plugins and an optional
    /// elevator implementation.
    pub fn with_parts(
        cfg: BotConfig,
        connector: Arc<dyn Connector>,
        natives: Vec<NativeSpec>,
        elevator: Option<Arc<dyn Elevator>>,
    ) -> Result<Arc<Self>> {
        let brain = brain_from_config(&cfg).context("initializing the brain")?;
        let registry = Arc::new(Registry::new(natives));
        let services = Arc::new(Services {
            connector,
            brain: Arc::new(brain),
            registry,
            replies: Arc::new(ReplyWaiters::new()),
            elevator,
            admin_users: cfg.admin_users.clone(),
            bot_name: cfg.name.clone(),
            local_port: cfg.local_port,
        });
        let engine = Arc::new(PipelineEngine::new(services.clone()));
        let dispatcher = Dispatcher::new(&cfg);
        Ok(Arc::new(Robot {
            cfg,
            services,
            engine,
            dispatcher,
            scheduler: tokio::sync::Mutex::new(Scheduler::new()),
            started: AtomicBool::new(false),
        }))
    }

    pub fn services(&self) -> Arc<Services> {
        self.services.clone()
    }

    pub fn engine(&self) -> Arc<PipelineEngine> {
        self.engine.clone()
    }

    /// Load configuration, start the bridge and scheduler, join
    /// channels, and initialize plugins. Must be called once before
    /// events are handled.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.load().await?;

        let services = self.services.clone();
        let port = self.cfg.local_port;
        tokio::spawn(async move {
            if let Err(e) = crate::bridge::serve(services, port).await {
                warn!("plugin bridge exited: {e:#}");
            }
        });

        for channel in &self.cfg.join_channels {
            self.services.connector.join_channel(channel).await;
        }

        self.initialize_plugins().await;
        self.started.store(true, Ordering::SeqCst);
        info!("robot '{}' is up", self.cfg.name);
        Ok(())
    }

    /// Reload task configuration and rebuild the schedule. Running
    /// pipelines keep their old snapshot; the new one serves everything
    /// started afterward.
    pub async fn reload(self: &Arc<Self>) -> Result<()> {
        self.load().await?;
        if self.started.load(Ordering::SeqCst) {
            self.initialize_plugins().await;
        }
        Ok(())
    }

    async fn load(self: &Arc<Self>) -> Result<()> {
        self.services.registry.reload(&self.cfg).await?;
        let mut scheduler = self.scheduler.lock().await;
        scheduler
            .rebuild(
                self.engine.clone(),
                self.services.registry.clone(),
                &self.cfg.scheduled_jobs,
                self.cfg.timezone(),
            )
            .await?;
        Ok(())
    }

    /// Every enabled plugin gets a synthetic `init` run at startup and
    /// after each reload.
    async fn initialize_plugins(self: &Arc<Self>) {
        let snapshot = self.services.registry.current();
        for task in &snapshot.tasks {
            if !matches!(task.as_ref(), Task::Plugin(_)) || task.core().disabled {
                continue;
            }
            self.engine
                .run_automatic(task.clone(), "init", Vec::new(), Vec::new(), None)
                .await;
        }
    }

    /// Handle one inbound chat event: ignore list first, then waiting
    /// replies, then plugin and job matching. Returns the results of
    /// the pipelines the event started.
    pub async fn handle_event(self: &Arc<Self>, event: ChatEvent) -> Vec<PipelineResult> {
        if self.cfg.ignore_users.iter().any(|u| u == &event.user) {
            debug!("ignoring message from {}", event.user);
            return Vec::new();
        }
        if self
            .services
            .replies
            .deliver(&event.user, event.channel.as_deref(), &event.text)
        {
            return Vec::new();
        }
        let snapshot = self.services.registry.current();
        let dispatches = self.dispatcher.match_event(&snapshot, &event);
        // Independently matched tasks run concurrently; no ordering is
        // promised across pipelines.
        let handles: Vec<_> = dispatches
            .into_iter()
            .map(|dispatch| {
                let engine = self.engine.clone();
                let user = event.user.clone();
                let channel = event.channel.clone();
                tokio::spawn(async move {
                    engine.run_dispatch(dispatch, &user, channel.as_deref()).await
                })
            })
            .collect();
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => warn!("pipeline task panicked: {e}"),
            }
        }
        results
    }

    /// Stop taking new work, halt the scheduler, and wait out running
    /// pipelines up to `grace`.
    pub async fn shutdown(self: &Arc<Self>, grace: Duration) {
        info!("shutting down");
        self.engine.stop_accepting();
        if let Err(e) = self.scheduler.lock().await.shutdown().await {
            warn!("scheduler shutdown: {e:#}");
        }
        if !self.engine.drain(grace).await {
            warn!(
                "{} pipeline(s) still running after {:?}, exiting anyway",
                self.engine.active(),
                grace
            );
        }
    }
}
