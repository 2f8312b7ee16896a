use crate::generation::{ConfigDump, GenerationManager};
use crate::stats::{CoreStatsEntry, StatsSnapshot, StatsTable};
use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub manager: Arc<GenerationManager>,
    pub stats: Arc<StatsTable>,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

struct Metrics {
    registry: Registry,
    rx_total: Counter,
    tx_total: Counter,
    dropped_total: Counter,
    stolen_total: Counter,
    tx_shortfall_total: Counter,
    generation: Gauge,
    pool_in_use: Gauge,
    /// Held across read-then-increment so concurrent scrapes add each delta once.
    sync_lock: Mutex<()>,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let rx_total = Counter::default();
        let tx_total = Counter::default();
        let dropped_total = Counter::default();
        let stolen_total = Counter::default();
        let tx_shortfall_total = Counter::default();
        let generation = Gauge::default();
        let pool_in_use = Gauge::default();

        registry.register("ringwall_rx_packets", "Packets received from ports", rx_total.clone());
        registry.register("ringwall_tx_packets", "Packets transmitted to ports", tx_total.clone());
        registry.register(
            "ringwall_dropped_packets",
            "Packets dropped by the dataplane",
            dropped_total.clone(),
        );
        registry.register(
            "ringwall_stolen_packets",
            "Packets consumed by inspection modules",
            stolen_total.clone(),
        );
        registry.register(
            "ringwall_tx_shortfalls",
            "Transmit bursts the port did not fully accept",
            tx_shortfall_total.clone(),
        );
        registry.register(
            "ringwall_config_generation",
            "Global configuration generation",
            generation.clone(),
        );
        registry.register(
            "ringwall_pool_in_use",
            "Packet buffers currently allocated",
            pool_in_use.clone(),
        );

        Self {
            registry,
            rx_total,
            tx_total,
            dropped_total,
            stolen_total,
            tx_shortfall_total,
            generation,
            pool_in_use,
            sync_lock: Mutex::new(()),
        }
    }

    /// Bring the monotonic counters up to the absolute totals.
    fn sync(&self, totals: &StatsSnapshot) {
        let _guard = self.sync_lock.lock().unwrap_or_else(|e| e.into_inner());
        for (counter, value) in [
            (&self.rx_total, totals.rx),
            (&self.tx_total, totals.tx),
            (&self.dropped_total, totals.dropped),
            (&self.stolen_total, totals.stolen),
            (&self.tx_shortfall_total, totals.tx_shortfall),
        ] {
            let current = counter.get();
            if value > current {
                counter.inc_by(value - current);
            }
        }
    }
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    generation: i64,
    switch_in_progress: bool,
}

#[derive(Serialize)]
pub struct StatsResponse {
    uptime_seconds: u64,
    totals: StatsSnapshot,
    per_core: Vec<CoreStatsEntry>,
    pool_in_use: usize,
    packets_per_second: f64,
}

#[derive(Serialize)]
pub struct ReloadResponse {
    requested: bool,
    generation: i64,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let metrics = Arc::new(Metrics::new());

    let mut app = Router::new()
        .route("/api/config", get(get_config))
        .route("/api/reload", post(post_reload))
        .route("/api/health", get(get_health))
        .route("/api/stats", get(get_stats))
        .route("/metrics", get({
            let m = metrics.clone();
            let s = state.clone();
            move || get_metrics(s.clone(), m.clone())
        }));

    // Apply IP allowlist middleware if configured.
    if !allowed_ips.is_empty() {
        let nets: Arc<Vec<IpNet>> = Arc::new(
            allowed_ips
                .iter()
                .filter_map(|s| s.parse::<IpNet>().ok())
                .collect(),
        );
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if allowed.iter().any(|net| net.contains(&ip)) {
            return next.run(req).await.into_response();
        }
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_config(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ConfigDump>, StatusCode> {
    state
        .manager
        .dump()
        .map(Json)
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)
}

async fn post_reload(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReloadResponse>) {
    let requested = state.manager.request_reload();
    if requested {
        tracing::info!("reload requested via api");
    }
    let status = if requested {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReloadResponse {
            requested,
            generation: state.manager.global_generation(),
        }),
    )
}

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let switching = state
        .manager
        .active()
        .is_some_and(|active| active.switch_in_progress());
    Json(HealthResponse {
        status: "ok".to_string(),
        generation: state.manager.global_generation(),
        switch_in_progress: switching,
    })
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let uptime = state.start_time.elapsed().as_secs();
    let totals = state.stats.totals();
    let (lcores, pool_in_use) = match state.manager.active() {
        Some(active) => (
            active.workers.packet_cores().map(|w| w.lcore).collect(),
            active.pool.in_use(),
        ),
        None => (Vec::new(), 0),
    };

    let packets_per_second = if uptime > 0 {
        totals.rx as f64 / uptime as f64
    } else {
        0.0
    };

    Json(StatsResponse {
        uptime_seconds: uptime,
        totals,
        per_core: state.stats.per_core(lcores),
        pool_in_use,
        packets_per_second,
    })
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> impl IntoResponse {
    metrics.sync(&state.stats.totals());
    metrics.generation.set(state.manager.global_generation());
    let in_use = state.manager.active().map_or(0, |a| a.pool.in_use());
    metrics.pool_in_use.set(in_use as i64);

    let mut buf = String::new();
    if encode(&mut buf, &metrics.registry).is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::CoreStats;
    use crate::testutil::Fixture;
    use std::time::Duration;

    fn app_state(fixture: &Fixture) -> Arc<AppState> {
        let manager = GenerationManager::new(
            fixture.registry.clone(),
            fixture.snapshot(),
            Duration::from_millis(1),
        )
        .unwrap();
        Arc::new(AppState {
            manager: Arc::new(manager),
            stats: fixture.stats.clone(),
            start_time: Instant::now(),
        })
    }

    #[tokio::test]
    async fn test_config_dump() {
        let fixture = Fixture::vwire_pair();
        let state = app_state(&fixture);

        let Json(dump) = get_config(State(state)).await.unwrap();
        assert_eq!(dump.port_num, 2);
        assert_eq!(dump.worker_num, 2);
        assert!(dump.promiscuous);
        assert_eq!(dump.global_generation, 0);
        let hooks: Vec<&str> = dump.pipeline.iter().map(|h| h.hook).collect();
        assert_eq!(hooks, ["ingress", "prerouting", "egress"]);
        assert_eq!(dump.modules.len(), 3);
    }

    #[tokio::test]
    async fn test_reload_sets_request() {
        let fixture = Fixture::vwire_pair();
        let state = app_state(&fixture);

        let (status, Json(body)) = post_reload(State(state.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body.requested);
        assert!(state.manager.take_reload_request());
    }

    #[tokio::test]
    async fn test_stats_per_core() {
        let fixture = Fixture::vwire_pair();
        let state = app_state(&fixture);
        CoreStats::add(&fixture.stats.core(2).rx, 3);

        let Json(stats) = get_stats(State(state)).await;
        assert_eq!(stats.totals.rx, 3);
        assert_eq!(stats.per_core.len(), 1);
        assert_eq!(stats.per_core[0].lcore, 2);
    }

    #[tokio::test]
    async fn test_metrics_sync_is_monotonic() {
        let metrics = Metrics::new();
        let mut totals = StatsSnapshot {
            rx: 10,
            ..StatsSnapshot::default()
        };
        metrics.sync(&totals);
        metrics.sync(&totals);
        assert_eq!(metrics.rx_total.get(), 10);

        totals.rx = 15;
        metrics.sync(&totals);
        assert_eq!(metrics.rx_total.get(), 15);

        let mut buf = String::new();
        encode(&mut buf, &metrics.registry).unwrap();
        assert!(buf.contains("ringwall_rx_packets_total 15"));
    }

    #[test]
    fn test_concurrent_metrics_sync_counts_once() {
        let metrics = Arc::new(Metrics::new());
        let totals = StatsSnapshot {
            rx: 1_000,
            tx: 400,
            ..StatsSnapshot::default()
        };

        let scrapers: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        metrics.sync(&totals);
                    }
                })
            })
            .collect();
        for scraper in scrapers {
            scraper.join().unwrap();
        }

        assert_eq!(metrics.rx_total.get(), 1_000);
        assert_eq!(metrics.tx_total.get(), 400);
    }
}
