/// Master: binds the shared-port receiver sockets, spawns the workers,
/// drives the flush timer, merges per-worker bundles, and ships the
/// report to graphite.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};

use tallier_protocol::{FrequencyCounter, DEFAULT_FREQUENCY_SIZE};

use crate::bundle::{AccumulationBundle, KEY_COUNT_PREFIX};
use crate::command::{self, InspectState};
use crate::graphite;
use crate::heartbeat::HaroldClient;
use crate::worker::{Command, Reply, Worker};
use crate::Config;

/// How often the top-key summary is written to the log.
const TOP_KEY_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period for a worker's shutdown reply before its task is
/// aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

struct WorkerHandle {
    id: usize,
    commands: mpsc::Sender<Command>,
    replies: mpsc::Receiver<Reply>,
    task: JoinHandle<()>,
}

pub struct Master {
    config: Config,
    graphite_host: String,
    graphite_port: u16,
    harold: Option<HaroldClient>,
    workers: Vec<WorkerHandle>,
    last_flush_time: Instant,
    next_flush_time: Instant,
    num_stats: u64,
    flush_count: u64,
    freq: FrequencyCounter,
    last_top_log: Instant,
    started: Instant,
    inspect: Arc<RwLock<InspectState>>,
}

impl Master {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        anyhow::ensure!(
            config.tallier.num_workers >= 1,
            "tallier.num_workers must be >= 1"
        );
        let (host, port) = config
            .graphite
            .graphite_addr
            .rsplit_once(':')
            .context("graphite.graphite_addr must be host:port")?;
        let graphite_port: u16 = port
            .parse()
            .context("graphite.graphite_addr port is not a number")?;
        let graphite_host = host.to_string();

        let harold = if config.tallier.enable_heartbeat {
            config
                .harold
                .as_ref()
                .map(|h| HaroldClient::new(&h.base_url, &h.secret))
        } else {
            None
        };

        let now = Instant::now();
        Ok(Self {
            config,
            graphite_host,
            graphite_port,
            harold,
            workers: Vec::new(),
            last_flush_time: now,
            next_flush_time: now,
            num_stats: 0,
            flush_count: 0,
            freq: FrequencyCounter::new(DEFAULT_FREQUENCY_SIZE),
            last_top_log: now,
            started: now,
            inspect: Arc::new(RwLock::new(InspectState::default())),
        })
    }

    /// Binds the sockets, spawns the workers, and runs the flush
    /// scheduler until interrupted.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.spawn_workers()?;

        if let Some(command_port) = self.config.tallier.command_port {
            let iface = self.config.tallier.interface.clone();
            let inspect = Arc::clone(&self.inspect);
            let started = self.started;
            tokio::spawn(async move {
                if let Err(e) = command::run(&iface, command_port, inspect, started).await {
                    error!("command service error: {}", e);
                }
            });
        }

        let interval = Duration::from_secs_f64(self.config.tallier.flush_interval);
        self.last_flush_time = Instant::now();
        self.next_flush_time = self.last_flush_time + interval;
        info!(
            port = self.config.tallier.port,
            workers = self.workers.len(),
            flush_interval = self.config.tallier.flush_interval,
            "tallier running"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(self.next_flush_time) => {
                    self.flush().await;
                    self.next_flush_time += interval;

                    // Keep cadence independent of processing jitter; when
                    // more than a full interval behind, skip to the latest
                    // boundary instead of flushing back-to-back.
                    let now = Instant::now();
                    if self.next_flush_time < now {
                        let mut skipped = 0u32;
                        while self.next_flush_time < now {
                            self.next_flush_time += interval;
                            skipped += 1;
                        }
                        warn!(skipped, "flush fell behind; coalescing to latest boundary");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down...");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn spawn_workers(&mut self) -> anyhow::Result<()> {
        let iface: Ipv4Addr = if self.config.tallier.interface.is_empty() {
            Ipv4Addr::UNSPECIFIED
        } else {
            self.config
                .tallier
                .interface
                .parse()
                .context("tallier.interface is not an IPv4 address")?
        };

        for id in 0..self.config.tallier.num_workers {
            let std_socket = create_stats_socket(iface, self.config.tallier.port)
                .with_context(|| format!("binding stats socket for worker {id}"))?;
            let socket = UdpSocket::from_std(std_socket)?;
            let (command_tx, command_rx) = mpsc::channel(4);
            let (reply_tx, reply_rx) = mpsc::channel(4);
            let task = tokio::spawn(Worker::new(id, socket, command_rx, reply_tx).run());
            self.workers.push(WorkerHandle {
                id,
                commands: command_tx,
                replies: reply_rx,
                task,
            });
        }
        Ok(())
    }

    /// One flush cycle: broadcast FLUSH, collect bundles under a
    /// deadline, merge, report, ship.
    async fn flush(&mut self) {
        let mut bundles = Vec::with_capacity(self.workers.len());
        let deadline = Duration::from_secs_f64(self.config.tallier.flush_interval);

        for worker in &mut self.workers {
            // A reply left over from a previously timed-out cycle would
            // otherwise be mistaken for this cycle's bundle.
            while let Ok(stale) = worker.replies.try_recv() {
                warn!(worker = worker.id, reply = ?stale, "discarding stale reply");
            }
            if worker.commands.send(Command::Flush).await.is_err() {
                warn!(worker = worker.id, "worker gone; skipping");
            }
        }

        for worker in &mut self.workers {
            match timeout(deadline, worker.replies.recv()).await {
                Ok(Some(Reply::Bundle(bundle))) => bundles.push(bundle),
                Ok(Some(Reply::MessageCount(_))) => {
                    warn!(worker = worker.id, "unexpected shutdown reply to flush")
                }
                Ok(None) => warn!(worker = worker.id, "reply channel closed"),
                Err(_) => warn!(
                    worker = worker.id,
                    "flush reply deadline missed; skipping this worker's data"
                ),
            }
        }

        let (mut agg, key_counts) = merge_bundles(bundles);
        self.freq.sample_batch(key_counts);
        self.log_top_keys();

        let now = Instant::now();
        let interval = (now - self.last_flush_time).as_secs_f64();
        self.last_flush_time = now;
        let now_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        self.num_stats += (agg.counters.len() + agg.timers.len()) as u64;
        let lines = graphite::build_report(
            &agg.counters,
            &mut agg.timers,
            self.num_stats,
            self.workers.len(),
            interval,
            now_epoch,
        );

        match graphite::send_report(&self.graphite_host, self.graphite_port, &lines).await {
            Ok(()) => {
                info!(lines = lines.len(), "stats sent to graphite");
                if let Some(harold) = &self.harold {
                    let ttl = (self.config.tallier.flush_interval * 3.0) as u64;
                    if let Err(e) = harold.heartbeat("tallier", ttl).await {
                        error!("error sending heartbeat to harold: {}", e);
                    }
                }
            }
            Err(e) => error!("failed to send stats to graphite: {}", e),
        }

        self.flush_count += 1;
        self.refresh_inspect_state().await;
    }

    fn log_top_keys(&mut self) {
        if self.last_top_log.elapsed() < TOP_KEY_LOG_INTERVAL {
            return;
        }
        let top = self.freq.top(10);
        if !top.is_empty() {
            let (retained, total) = self.freq.coverage();
            let summary = top
                .iter()
                .map(|(key, count)| format!("{key}={count}"))
                .collect::<Vec<_>>()
                .join(" ");
            info!(retained, total, "top stat keys: {}", summary);
        }
        self.last_top_log = Instant::now();
    }

    async fn refresh_inspect_state(&self) {
        let mut state = self.inspect.write().await;
        state.num_stats = self.num_stats;
        state.num_workers = self.workers.len();
        state.flush_count = self.flush_count;
        state.top = self.freq.top(10);
        state.coverage = self.freq.coverage();
    }

    /// Orderly shutdown: broadcast SHUTDOWN, give each worker a grace
    /// period to report its lifetime message count, abort stragglers,
    /// then join everything.
    async fn shutdown(&mut self) {
        info!("sending shutdown command...");
        for worker in &self.workers {
            let _ = worker.commands.send(Command::Shutdown).await;
        }

        let mut counts = Vec::with_capacity(self.workers.len());
        for worker in &mut self.workers {
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match timeout(remaining, worker.replies.recv()).await {
                    Ok(Some(Reply::MessageCount(count))) => {
                        counts.push(count);
                        break;
                    }
                    // Late flush bundle; keep draining for the count.
                    Ok(Some(Reply::Bundle(_))) => continue,
                    Ok(None) | Err(_) => {
                        warn!(worker = worker.id, "no shutdown reply; terminating");
                        worker.task.abort();
                        break;
                    }
                }
            }
        }

        for worker in self.workers.drain(..) {
            let _ = worker.task.await;
        }
        info!(
            total = counts.iter().sum::<u64>(),
            per_worker = ?counts,
            "shutdown complete"
        );
    }
}

/// Builds one nonblocking UDP socket bound to the stats endpoint with
/// SO_REUSEPORT, so every worker gets its own kernel receive queue on
/// the same port.
fn create_stats_socket(iface: Ipv4Addr, port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let addr = SocketAddrV4::new(iface, port);
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Merges per-worker bundles: counters sum, timer lists concatenate.
/// Returns the merged bundle (with `tallier.messages.total` and
/// `tallier.bytes.total` filled in) and the per-key observation counts
/// destined for the frequency tracker.
fn merge_bundles(bundles: Vec<AccumulationBundle>) -> (AccumulationBundle, Vec<(String, u64)>) {
    let mut agg = AccumulationBundle::new();
    let mut key_counts = Vec::new();
    let mut total_messages = 0.0;
    let mut total_bytes = 0.0;

    for bundle in bundles {
        for (key, value) in bundle.counters {
            if let Some(stripped) = key.strip_prefix(KEY_COUNT_PREFIX) {
                key_counts.push((stripped.to_string(), value as u64));
            }
            if key.starts_with("tallier.messages.child_") {
                total_messages += value;
            } else if key.starts_with("tallier.bytes.child_") {
                total_bytes += value;
            }
            *agg.counters.entry(key).or_insert(0.0) += value;
        }
        for (key, values) in bundle.timers {
            agg.timers.entry(key).or_default().extend(values);
        }
    }

    agg.counters
        .insert("tallier.messages.total".to_string(), total_messages);
    agg.counters
        .insert("tallier.bytes.total".to_string(), total_bytes);
    (agg, key_counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ListenerState;
    use std::collections::HashSet;

    #[test]
    fn test_merge_sums_counters_and_concats_timers() {
        let mut a = AccumulationBundle::new();
        a.counters.insert("x".to_string(), 1.0);
        a.timers.insert("t".to_string(), vec![5.0, 1.0]);
        let mut b = AccumulationBundle::new();
        b.counters.insert("x".to_string(), 2.0);
        b.timers.insert("t".to_string(), vec![3.0]);

        let (agg, _) = merge_bundles(vec![a, b]);
        assert_eq!(agg.counters["x"], 3.0);
        let mut merged = agg.timers["t"].clone();
        merged.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(merged, vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_merge_extracts_key_counts_and_child_totals() {
        let mut a = AccumulationBundle::new();
        a.counters.insert("tallier._key_counts.x".to_string(), 4.0);
        a.counters
            .insert("tallier.messages.child_0".to_string(), 10.0);
        a.counters.insert("tallier.bytes.child_0".to_string(), 80.0);
        let mut b = AccumulationBundle::new();
        b.counters.insert("tallier._key_counts.x".to_string(), 2.0);
        b.counters
            .insert("tallier.messages.child_1".to_string(), 5.0);
        b.counters.insert("tallier.bytes.child_1".to_string(), 40.0);

        let (agg, key_counts) = merge_bundles(vec![a, b]);
        assert_eq!(agg.counters["tallier.messages.total"], 15.0);
        assert_eq!(agg.counters["tallier.bytes.total"], 120.0);
        // Per-child keys stay in the report alongside the totals.
        assert_eq!(agg.counters["tallier.messages.child_0"], 10.0);
        assert_eq!(agg.counters["tallier._key_counts.x"], 6.0);

        let total: u64 = key_counts
            .iter()
            .filter(|(k, _)| k == "x")
            .map(|(_, c)| c)
            .sum();
        assert_eq!(total, 6);
    }

    #[test]
    fn test_counter_scaling_is_partition_independent() {
        // y:2|c@0.5 contributes 4.0 no matter which worker sees it.
        let mut solo = ListenerState::new(0);
        solo.handle_datagram(b"y:2|c@0.5");
        solo.handle_datagram(b"y:2|c@0.5");
        let (merged_solo, _) = merge_bundles(vec![solo.flush()]);

        let mut w0 = ListenerState::new(0);
        let mut w1 = ListenerState::new(1);
        w0.handle_datagram(b"y:2|c@0.5");
        w1.handle_datagram(b"y:2|c@0.5");
        let (merged_split, _) = merge_bundles(vec![w0.flush(), w1.flush()]);

        assert_eq!(merged_solo.counters["y"], 8.0);
        assert_eq!(merged_split.counters["y"], 8.0);
    }

    #[test]
    fn test_single_counter_end_to_end() {
        let mut listener = ListenerState::new(0);
        listener.handle_datagram(b"x:3|c");
        let (mut agg, key_counts) = merge_bundles(vec![listener.flush()]);

        let mut num_stats = 0u64;
        num_stats += (agg.counters.len() + agg.timers.len()) as u64;
        let lines =
            graphite::build_report(&agg.counters, &mut agg.timers, num_stats, 1, 10.0, 1000);

        for expected in [
            "stats.x 0.300000 1000",
            "stats_counts.x 3.000000 1000",
            "stats_counts.tallier._key_counts.x 1.000000 1000",
            "stats_counts.tallier.messages.child_0 1.000000 1000",
            "stats_counts.tallier.bytes.child_0 5.000000 1000",
            "stats_counts.tallier.messages.total 1.000000 1000",
            "stats_counts.tallier.bytes.total 5.000000 1000",
            "stats.tallier.num_stats 6.000000 1000",
            "stats.tallier.num_workers 1.000000 1000",
        ] {
            assert!(
                lines.contains(&expected.to_string()),
                "missing line: {expected}"
            );
        }
        assert_eq!(key_counts, vec![("x".to_string(), 1)]);
    }

    /// Same sample multiset, different two-worker partitions, identical
    /// report line sets. Datagram lengths are matched so the per-child
    /// byte counters agree too.
    #[test]
    fn test_report_is_partition_invariant() {
        let d1: &[u8] = b"x:1|c";
        let d2: &[u8] = b"x:2|c";
        let d3: &[u8] = b"a:4|ms";
        let d4: &[u8] = b"a:9|ms";

        let report = |w0_datagrams: &[&[u8]], w1_datagrams: &[&[u8]]| -> HashSet<String> {
            let mut w0 = ListenerState::new(0);
            let mut w1 = ListenerState::new(1);
            for d in w0_datagrams {
                w0.handle_datagram(d);
            }
            for d in w1_datagrams {
                w1.handle_datagram(d);
            }
            let (mut agg, _) = merge_bundles(vec![w0.flush(), w1.flush()]);
            graphite::build_report(&agg.counters, &mut agg.timers, 0, 2, 10.0, 1000)
                .into_iter()
                .collect()
        };

        let first = report(&[d1, d3], &[d2, d4]);
        let second = report(&[d1, d4], &[d2, d3]);
        assert_eq!(first, second);
    }
}
