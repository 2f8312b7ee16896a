use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::generation::GenerationManager;

/// Control-plane loop: picks up reload requests and drives reload + switch.
///
/// A switch blocks until every worker core has moved over, so it runs on the
/// blocking pool while this task keeps its tick.
pub async fn run(manager: Arc<GenerationManager>, tick: Duration, shutdown: Arc<AtomicBool>) {
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(tick_ms = tick.as_millis() as u64, "management loop started");

    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if !manager.take_reload_request() {
            continue;
        }

        tracing::info!(generation = manager.global_generation(), "reload requested");
        let m = manager.clone();
        match tokio::task::spawn_blocking(move || m.switch()).await {
            Ok(Ok(generation)) => tracing::info!(generation, "reload applied"),
            Ok(Err(e)) => tracing::warn!("reload rejected, keeping active configuration: {}", e),
            Err(e) => tracing::error!("reload task failed: {}", e),
        }
    }

    tracing::info!("management loop stopped");
}
