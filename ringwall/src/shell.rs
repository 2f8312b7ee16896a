//! Line-oriented operator shell over TCP.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::generation::{ConfigDump, GenerationManager};
use crate::stats::StatsTable;

const PROMPT: &str = "ringwall> ";

const HELP: &str = "\
show config   dump the active configuration
show stats    per-core packet counters
reload        request a configuration reload
help          this text
quit          close the session
";

pub enum Reply {
    Text(String),
    Quit,
}

/// Execute one shell command.
pub fn execute(line: &str, manager: &GenerationManager, stats: &StatsTable) -> Reply {
    let words: Vec<&str> = line.split_whitespace().collect();
    let text = match words.as_slice() {
        [] => String::new(),
        ["show", "config"] => match manager.dump() {
            Some(dump) => render_dump(&dump),
            None => "no active configuration\n".to_string(),
        },
        ["show", "stats"] => render_stats(manager, stats),
        ["reload"] => {
            if manager.request_reload() {
                tracing::info!("reload requested via shell");
                "reload requested\n".to_string()
            } else {
                "no active configuration\n".to_string()
            }
        }
        ["help"] | ["?"] => HELP.to_string(),
        ["quit"] | ["exit"] => return Reply::Quit,
        _ => format!("unknown command: {}\n", line.trim()),
    };
    Reply::Text(text)
}

pub fn render_dump(dump: &ConfigDump) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "pool: {} buffers {} in use {} free {} size {}",
        dump.pool.name,
        dump.pool.capacity,
        dump.pool.in_use,
        dump.pool.available,
        dump.pool.buffer_size
    );
    let _ = writeln!(out, "promiscuous: {}", dump.promiscuous);
    let _ = writeln!(
        out,
        "workers: {} ports: {} queues: {} inspection rings: {} tx rings: {}",
        dump.worker_num, dump.port_num, dump.queue_num, dump.inspection_rings, dump.tx_rings
    );
    let _ = writeln!(
        out,
        "active slot: {:?} generation: {}{}",
        dump.active_slot,
        dump.global_generation,
        if dump.switch_in_progress { " (switching)" } else { "" }
    );
    for port in &dump.ports {
        let _ = writeln!(
            out,
            "  port {} type {:?} bus {} mac {} vwire {}",
            port.id, port.kind, port.bus, port.mac, port.vwire
        );
    }
    for worker in &dump.workers {
        let generation = worker
            .generation
            .map_or_else(|| "-".to_string(), |g| g.to_string());
        let _ = writeln!(
            out,
            "  lcore {} role {} ports {:?} queues {:?} generation {}",
            worker.lcore,
            worker.role.name(),
            worker.ports,
            worker.queues,
            generation
        );
    }
    for module in &dump.modules {
        let _ = writeln!(
            out,
            "  module {} {}{}: {}",
            module.id,
            module.name,
            if module.enabled { "" } else { " (disabled)" },
            module.state.as_deref().unwrap_or("-")
        );
    }
    for hook in &dump.pipeline {
        let _ = writeln!(out, "  hook {}: {}", hook.hook, hook.modules.join(" -> "));
    }
    if let Some(status) = &dump.last_reload {
        let _ = writeln!(
            out,
            "last reload: {} generation {} at {}: {}",
            if status.ok { "ok" } else { "failed" },
            status.generation,
            status.at.to_rfc3339(),
            status.message
        );
    }
    out
}

fn render_stats(manager: &GenerationManager, stats: &StatsTable) -> String {
    let lcores: Vec<u16> = manager
        .active()
        .map(|a| a.workers.packet_cores().map(|w| w.lcore).collect())
        .unwrap_or_default();

    let mut out = String::new();
    for entry in stats.per_core(lcores) {
        let s = entry.stats;
        let _ = writeln!(
            out,
            "  lcore {:>3} rx {} tx {} dropped {} stolen {} shortfall {} spins {}",
            entry.lcore, s.rx, s.tx, s.dropped, s.stolen, s.tx_shortfall, s.ring_full_spins
        );
    }
    let t = stats.totals();
    let _ = writeln!(
        out,
        "total rx {} tx {} dropped {} stolen {}",
        t.rx, t.tx, t.dropped, t.stolen
    );
    out
}

/// Accept shell sessions until `shutdown` is set.
pub async fn serve(
    listener: TcpListener,
    manager: Arc<GenerationManager>,
    stats: Arc<StatsTable>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("shell accept failed: {}", e);
                continue;
            }
        };
        tracing::debug!(%peer, "shell session opened");
        let manager = manager.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            if let Err(e) = session(stream, &manager, &stats).await {
                tracing::debug!(%peer, "shell session ended: {}", e);
            }
        });
    }
}

async fn session(
    stream: TcpStream,
    manager: &GenerationManager,
    stats: &StatsTable,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(PROMPT.as_bytes()).await?;
    while let Some(line) = lines.next_line().await? {
        match execute(&line, manager, stats) {
            Reply::Quit => break,
            Reply::Text(text) => {
                writer.write_all(text.as_bytes()).await?;
                writer.write_all(PROMPT.as_bytes()).await?;
            }
        }
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Fixture;
    use std::time::Duration;

    fn manager(fixture: &Fixture) -> Arc<GenerationManager> {
        Arc::new(
            GenerationManager::new(
                fixture.registry.clone(),
                fixture.snapshot(),
                Duration::from_millis(1),
            )
            .unwrap(),
        )
    }

    fn text(reply: Reply) -> String {
        match reply {
            Reply::Text(text) => text,
            Reply::Quit => panic!("unexpected quit"),
        }
    }

    #[test]
    fn test_show_config() {
        let fixture = Fixture::vwire_pair();
        let manager = manager(&fixture);

        let out = text(execute("show  config", &manager, &fixture.stats));
        assert!(out.contains("workers: 2 ports: 2 queues: 1"));
        assert!(out.contains("lcore 2 role RTX_WORKER"));
        assert!(out.contains("active slot: A generation: 0"));
        assert!(out.contains("module 1 interface: vwire 7 1<->2"));
        assert!(out.contains("module 3 acl: no rules, accepting everything"));
        assert!(out.contains("hook ingress: decoder -> acl"));
        assert!(out.contains("hook prerouting: interface"));
        assert!(!out.contains("hook forward"));
    }

    #[test]
    fn test_reload_and_status() {
        let fixture = Fixture::vwire_pair();
        let manager = manager(&fixture);

        assert_eq!(text(execute("reload", &manager, &fixture.stats)), "reload requested\n");
        assert!(manager.take_reload_request());
        manager.switch().unwrap();

        let out = text(execute("show config", &manager, &fixture.stats));
        assert!(out.contains("last reload: ok generation 1"));
    }

    #[test]
    fn test_unknown_and_quit() {
        let fixture = Fixture::vwire_pair();
        let manager = manager(&fixture);

        assert!(text(execute("frobnicate", &manager, &fixture.stats)).starts_with("unknown command"));
        assert!(matches!(execute("quit", &manager, &fixture.stats), Reply::Quit));
        assert!(text(execute("", &manager, &fixture.stats)).is_empty());
    }

    #[tokio::test]
    async fn test_session_over_tcp() {
        let fixture = Fixture::vwire_pair();
        let manager = manager(&fixture);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        tokio::spawn(serve(listener, manager, fixture.stats.clone(), shutdown));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"show stats\nquit\n").await.unwrap();
        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut client, &mut out)
            .await
            .unwrap();

        assert!(out.starts_with(PROMPT));
        assert!(out.contains("lcore   2 rx 0"));
        assert!(out.contains("total rx 0"));
    }
}
