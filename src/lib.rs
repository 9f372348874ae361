//! Ferrogate - adaptive-scoring HTTP reverse-proxy load balancer
//!
//! Fronts a fixed set of upstream nodes and spreads requests across them
//! with a smooth weighted round-robin whose weights adapt at runtime:
//!
//! - every node carries a passive score (observed request outcomes) and an
//!   active score (periodic scripted probes);
//! - an optional connection-balance correction nudges weights toward an
//!   even spread of in-flight requests;
//! - the dispatcher retries failed attempts across nodes, with a scripted
//!   trigger hook that can inspect responses and demand a re-select.
//!
//! # Architecture
//!
//! ```text
//!            +-------------+
//!            |  dispatch/  |----------------+
//!            +------+------+                |
//!                   |                       |
//!            +------v------+         +------v------+
//!            |  balance/   |         |   script/   |
//!            | (SWRR+score)|         | (host iface)|
//!            +------+------+         +------^------+
//!                   |                       |
//!       +-----------+-----------+          |
//!       |           |           |          |
//! +-----v----+ +----v-----+ +---v-----+    |
//! |  admin/  | | config/  | | health/ |----+
//! +----------+ +----------+ +---------+
//! ```

pub mod admin;
pub mod balance;
pub mod common;
pub mod config;
pub mod dispatch;
pub mod health;
pub mod script;

pub use common::error::{Error, Result};
pub use config::Config;

use balance::Balancer;
use health::HealthChecker;
use script::{CommandScriptHost, ScriptHost};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub balancer: Arc<Balancer>,
    pub script_host: Arc<dyn ScriptHost>,
    /// Path the config was loaded from; admin reload re-parses it
    pub config_path: Arc<PathBuf>,
}

/// Gateway instance managing all components
pub struct Gateway {
    state: AppState,
    listen: String,
}

impl Gateway {
    /// Create a new Gateway from configuration
    pub fn new(config: Config, config_path: PathBuf) -> Result<Self> {
        let listen = config.gateway.listen.clone();
        let node_count = config.nodes.len();
        let balancer = Arc::new(Balancer::new(config)?);
        info!("loaded {} upstream nodes", node_count);

        let state = AppState {
            balancer,
            script_host: Arc::new(CommandScriptHost::new()),
            config_path: Arc::new(config_path),
        };
        Ok(Gateway { state, listen })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the full router: admin surface first, everything else proxied.
    pub fn router(&self) -> axum::Router {
        let write_timeout = self.state.balancer.config().gateway.write_timeout;
        admin::routes(self.state.clone())
            .fallback(dispatch::handle)
            .layer(TimeoutLayer::new(write_timeout))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until ctrl-c: data plane + admin, plus the health-check driver
    /// and the effective-weight recovery sweep.
    pub async fn run(&self) -> Result<()> {
        let checker = Arc::new(HealthChecker::new(
            self.state.balancer.clone(),
            self.state.script_host.clone(),
        ));
        let health_task = tokio::spawn(checker.run());
        let recovery_task = tokio::spawn(self.state.balancer.clone().run_recovery());

        let listener = tokio::net::TcpListener::bind(&self.listen).await?;
        info!("ferrogate v{} listening on {}", VERSION, self.listen);

        axum::serve(
            listener,
            self.router().into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
        })
        .await?;

        health_task.abort();
        recovery_task.abort();
        info!("gateway stopped");
        Ok(())
    }
}
