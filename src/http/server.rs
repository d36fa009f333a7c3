//! HTTP server setup.
//!
//! # Responsibilities
//! - Build shared state (token store, rate limiter, pipeline) from config
//! - Create the axum Router with handlers and tower-http layers
//! - Run the background sweeper
//! - Serve with graceful shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    middleware,
    routing::{delete, get},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::GuardConfig;
use crate::error::GuardError;
use crate::http::handlers::{self, AppState};
use crate::lifecycle::Shutdown;
use crate::pipeline::{pipeline_middleware, RequestPipeline};
use crate::security::{RateLimiter, TokenStore};

/// The guard's HTTP server.
pub struct GuardServer {
    router: Router,
    config: GuardConfig,
    tokens: Arc<TokenStore>,
    limiter: Arc<RateLimiter>,
}

impl GuardServer {
    /// Build every component. Fails on a configuration the pipeline refuses.
    pub fn new(config: GuardConfig) -> Result<Self, GuardError> {
        let tokens = Arc::new(TokenStore::new(&config.csrf));
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let pipeline = Arc::new(RequestPipeline::from_config(
            &config,
            limiter.clone(),
            tokens.clone(),
        )?);

        let state = AppState::new(&config, tokens.clone());
        let router = Self::build_router(&config, state, pipeline);

        Ok(Self {
            router,
            config,
            tokens,
            limiter,
        })
    }

    /// Build the router. Layers listed last wrap outermost.
    #[allow(deprecated)]
    fn build_router(config: &GuardConfig, state: AppState, pipeline: Arc<RequestPipeline>) -> Router {
        Router::new()
            .route("/health", get(handlers::health))
            .route("/session/token", get(handlers::issue_token))
            .route("/session", delete(handlers::end_session))
            .route(
                "/comments",
                get(handlers::list_comments).post(handlers::create_comment),
            )
            .route("/board", get(handlers::board))
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(
                config.server.request_timeout_secs,
            )))
            .layer(middleware::from_fn_with_state(pipeline, pipeline_middleware))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// A clone of the router, for driving requests without a socket.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn tokens(&self) -> Arc<TokenStore> {
        self.tokens.clone()
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        self.limiter.clone()
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Serve on `listener` until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let sweeper = spawn_sweeper(
            self.limiter.clone(),
            self.tokens.clone(),
            Duration::from_secs(self.config.server.sweep_interval_secs),
            shutdown.subscribe(),
        );

        let mut stop = shutdown.subscribe();
        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.recv().await;
            })
            .await;

        shutdown.trigger();
        if let Err(err) = sweeper.await {
            tracing::warn!(error = %err, "Sweeper task failed");
        }

        served?;
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Periodically evict idle rate windows and expired sessions.
pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    tokens: Arc<TokenStore>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let windows = limiter.evict_idle(now);
                    let sessions = tokens.purge_expired(now);
                    if windows > 0 || sessions > 0 {
                        tracing::debug!(windows, sessions, "Swept idle state");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Sweeper stopped");
                    break;
                }
            }
        }
    })
}
