//! HTTP surface
//!
//! One appointment route plus the liveness and stats endpoints:
//! - POST /appointment - submit an appointment, returns it with the receipt
//!   signature
//! - GET /health - liveness probe
//! - GET /stats - JSON service counters
//!
//! Validation and inspection failures map to 400, the per-IP rate limit to
//! 429, the global limit to 503; anything else is a plain 500. No
//! unclassified error escapes a handler.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::appointment::Appointment;
use crate::error::TowerError;
use crate::tower::Tower;

/// Sliding-window request limits, per IP and global.
pub struct RateLimiter {
    user_max: u32,
    user_window: Duration,
    global_max: u32,
    global_window: Duration,
    per_ip: HashMap<IpAddr, Vec<Instant>>,
    global: Vec<Instant>,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed,
    UserLimited,
    GlobalLimited,
}

impl RateLimiter {
    pub fn new(
        user_max: u32,
        user_window: Duration,
        global_max: u32,
        global_window: Duration,
    ) -> Self {
        Self {
            user_max,
            user_window,
            global_max,
            global_window,
            per_ip: HashMap::new(),
            global: Vec::new(),
        }
    }

    pub fn check(&mut self, ip: IpAddr, now: Instant) -> LimitDecision {
        let global_cutoff = now.checked_sub(self.global_window);
        self.global
            .retain(|at| global_cutoff.map(|cutoff| *at > cutoff).unwrap_or(true));
        if self.global.len() >= self.global_max as usize {
            return LimitDecision::GlobalLimited;
        }

        let user_cutoff = now.checked_sub(self.user_window);
        let hits = self.per_ip.entry(ip).or_default();
        hits.retain(|at| user_cutoff.map(|cutoff| *at > cutoff).unwrap_or(true));
        if hits.len() >= self.user_max as usize {
            return LimitDecision::UserLimited;
        }

        hits.push(now);
        self.global.push(now);
        LimitDecision::Allowed
    }
}

struct ApiState {
    tower: Arc<Tower>,
    limiter: Mutex<RateLimiter>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

fn error_response(status: StatusCode, code: &'static str, message: String) -> Response {
    (status, Json(ErrorBody { error: message, code })).into_response()
}

fn tower_error_response(error: TowerError) -> Response {
    match &error {
        TowerError::Validation(e) => error_response(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            e.to_string(),
        ),
        TowerError::Inspection(e) => error_response(
            StatusCode::BAD_REQUEST,
            "INSPECTION_FAILED",
            e.to_string(),
        ),
        // internal detail stays in the logs
        _ => {
            warn!(code = error.error_code(), error = %error, "appointment request failed internally");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error.error_code(),
                "internal error".to_string(),
            )
        }
    }
}

async fn add_appointment(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<Value>,
) -> Response {
    let decision = state
        .limiter
        .lock()
        .expect("rate limiter lock")
        .check(peer.ip(), Instant::now());
    match decision {
        LimitDecision::Allowed => {}
        LimitDecision::UserLimited => {
            debug!(ip = %peer.ip(), "per-IP rate limit hit");
            return error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "too many requests from this address".to_string(),
            );
        }
        LimitDecision::GlobalLimited => {
            debug!("global rate limit hit");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_BUSY",
                "service is at capacity".to_string(),
            );
        }
    }

    let appointment: Appointment = match serde_json::from_value(body) {
        Ok(appointment) => appointment,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "VALIDATION_FAILED",
                format!("malformed request body: {e}"),
            )
        }
    };

    match state.tower.add_appointment(appointment).await {
        Ok(signed) => (StatusCode::OK, Json(signed)).into_response(),
        Err(error) => tower_error_response(error),
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn stats(State(state): State<Arc<ApiState>>) -> Response {
    let stats = state.tower.stats_handle().read().await.clone();
    Json(stats).into_response()
}

/// Build the router for the tower's HTTP surface.
pub fn router(tower: Arc<Tower>) -> Router {
    let config = tower.config();
    let limiter = RateLimiter::new(
        config.rate_limit_user_max,
        Duration::from_millis(config.rate_limit_user_window_ms),
        config.rate_limit_global_max,
        Duration::from_millis(config.rate_limit_global_window_ms),
    );
    let state = Arc::new(ApiState {
        tower,
        limiter: Mutex::new(limiter),
    });
    Router::new()
        .route("/appointment", post(add_appointment))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Serve the HTTP surface until the process shuts down.
pub async fn serve(tower: Arc<Tower>) -> anyhow::Result<()> {
    let config = tower.config();
    let address = format!("{}:{}", config.host_name, config.host_port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(%address, "HTTP listener started");
    let app = router(tower);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_ip_limit() {
        let mut limiter = RateLimiter::new(
            2,
            Duration::from_secs(60),
            100,
            Duration::from_secs(60),
        );
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let now = Instant::now();

        assert_eq!(limiter.check(ip, now), LimitDecision::Allowed);
        assert_eq!(limiter.check(ip, now), LimitDecision::Allowed);
        assert_eq!(limiter.check(ip, now), LimitDecision::UserLimited);

        // a different address is unaffected
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(limiter.check(other, now), LimitDecision::Allowed);
    }

    #[test]
    fn test_global_limit_wins() {
        let mut limiter = RateLimiter::new(
            10,
            Duration::from_secs(60),
            2,
            Duration::from_secs(60),
        );
        let now = Instant::now();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert_eq!(limiter.check(a, now), LimitDecision::Allowed);
        assert_eq!(limiter.check(b, now), LimitDecision::Allowed);
        let c: IpAddr = "10.0.0.3".parse().unwrap();
        assert_eq!(limiter.check(c, now), LimitDecision::GlobalLimited);
    }

    #[test]
    fn test_window_expiry_readmits() {
        let mut limiter = RateLimiter::new(
            1,
            Duration::from_millis(100),
            100,
            Duration::from_secs(60),
        );
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let start = Instant::now();

        assert_eq!(limiter.check(ip, start), LimitDecision::Allowed);
        assert_eq!(limiter.check(ip, start), LimitDecision::UserLimited);
        // past the window the slot frees up
        let later = start + Duration::from_millis(150);
        assert_eq!(limiter.check(ip, later), LimitDecision::Allowed);
    }
}
