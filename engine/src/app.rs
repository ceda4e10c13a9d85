//! Core application

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use tokio_stream::wrappers::WatchStream;

use crate::core::cli::{self, CliConfig, Commands};
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME_LOWER, ENV_LOG, ENV_SCOPE};
use crate::core::shutdown::ShutdownService;
use crate::data::http::HttpBackend;
use crate::engine::{EngineSnapshot, LoadState, TelemetryEngine};

pub struct CoreApp {
    pub shutdown: ShutdownService,
    pub config: AppConfig,
    pub engine: TelemetryEngine,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();
        tracing::trace!(command = ?command, "Parsed command");

        let app = Self::init(&cli_config)?;
        let result = match command.unwrap_or(Commands::Watch) {
            Commands::Watch => app.watch().await,
            Commands::Stats => app.print_stats().await,
            Commands::Compare { span_id } => app.print_comparison(&span_id).await,
        };

        app.shutdown.shutdown().await;
        result
    }

    fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;

        let backend = HttpBackend::new(
            &config.backend.url,
            config.backend.api_key.clone(),
            Duration::from_secs(config.backend.timeout_secs),
        )
        .context("Failed to initialize telemetry backend")?;
        tracing::debug!(url = %config.backend.url, "Backend initialized");

        let engine = TelemetryEngine::spawn(Arc::new(backend), config.engine_config());
        let shutdown = ShutdownService::new(engine.clone());

        Ok(Self {
            shutdown,
            config,
            engine,
        })
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    fn scope(&self) -> Result<&str> {
        self.config
            .scope
            .as_deref()
            .with_context(|| format!("No scope configured: pass --scope or set {}", ENV_SCOPE))
    }

    /// Follow the scope until Ctrl+C, logging a summary per published snapshot
    async fn watch(&self) -> Result<()> {
        self.shutdown.install_signal_handlers();

        let scope = self.scope()?;
        self.engine
            .configure(scope)
            .await
            .with_context(|| format!("Failed to watch scope '{}'", scope))?;
        tracing::info!(scope, filters = ?self.config.filters, "Watching");

        let mut updates = WatchStream::from_changes(self.engine.subscribe());
        let shutdown = self.shutdown.wait();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                next = updates.next() => match next {
                    Some(snapshot) if snapshot.is_loading() => {
                        tracing::debug!(generation = snapshot.generation, "Loading...");
                    }
                    Some(snapshot) => Self::log_summary(&snapshot),
                    None => {
                        tracing::warn!("Telemetry engine stopped");
                        break;
                    }
                },
            }
        }

        Ok(())
    }

    fn log_summary(snapshot: &EngineSnapshot) {
        if let Some(e) = snapshot.sessions_state.error() {
            tracing::warn!(error = %e, "Session query failed, showing last known data");
        }

        let now = Utc::now();
        let stats = snapshot.effective_stats().unwrap_or_default();
        tracing::info!(
            sessions = snapshot.sessions.len(),
            live = snapshot.live_session_ids(now).len(),
            spans = stats.total_spans,
            errors = stats.error_count,
            timeouts = stats.timeout_count,
            p95_ms = ?stats.p95_ms,
            cost = stats.total_cost,
            realtime = snapshot.realtime_connected,
            state = snapshot.sessions_state.as_str(),
            "Snapshot updated"
        );
    }

    /// Configure the scope and wait for both initial queries to settle
    async fn load(&self) -> Result<Arc<EngineSnapshot>> {
        let scope = self.scope()?;
        self.engine
            .configure(scope)
            .await
            .with_context(|| format!("Failed to load scope '{}'", scope))?;

        // Fetches are bounded by the backend timeout; allow a little slack
        let limit = Duration::from_secs(self.config.backend.timeout_secs + 1);
        let mut updates = self.engine.subscribe();
        let snapshot = tokio::time::timeout(limit, updates.wait_for(|s| !s.is_loading()))
            .await
            .context("Timed out waiting for telemetry")?
            .map(|s| s.clone())
            .context("Telemetry engine stopped")?;
        Ok(snapshot)
    }

    async fn print_stats(&self) -> Result<()> {
        let snapshot = self.load().await?;

        if let LoadState::Failed(e) = &snapshot.stats_state {
            tracing::warn!(error = %e, "Backend stats unavailable, computed from loaded sessions");
        }
        let stats = snapshot
            .effective_stats()
            .context("No stats available for the current filters")?;

        println!("{}", serde_json::to_string_pretty(&stats)?);
        Ok(())
    }

    async fn print_comparison(&self, span_id: &str) -> Result<()> {
        let snapshot = self.load().await?;
        if let Some(e) = snapshot.sessions_state.error() {
            anyhow::bail!("Session query failed: {}", e);
        }

        let outcome = self
            .engine
            .compare(span_id)
            .await
            .with_context(|| format!("Failed to compare span '{}'", span_id))?;

        println!("{}", serde_json::to_string_pretty(&outcome)?);
        Ok(())
    }
}
