/// Graphite report construction and delivery.
///
/// One plaintext line per metric, one fresh TCP connection per flush.
/// A failed send drops the report; the flush cadence is never extended
/// for the sink's sake.

use std::collections::HashMap;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use tallier_protocol::TIMER_PERCENTILE;

/// Builds the report lines for one flush. `interval` is the measured
/// seconds since the previous flush; `now` is the wall-clock epoch
/// timestamp stamped on every line. Timer value lists are sorted in
/// place.
pub fn build_report(
    counters: &HashMap<String, f64>,
    timers: &mut HashMap<String, Vec<f64>>,
    num_stats: u64,
    num_workers: usize,
    interval: f64,
    now: u64,
) -> Vec<String> {
    let mut lines = Vec::with_capacity(counters.len() * 2 + timers.len() * 6 + 2);

    for (key, value) in counters {
        lines.push(format!("stats.{key} {:.6} {now}", value / interval));
        lines.push(format!("stats_counts.{key} {value:.6} {now}"));
    }

    for (key, values) in timers.iter_mut() {
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let (Some(lower), Some(upper)) = (values.first(), values.last()) else {
            continue;
        };
        let count = values.len();
        let rank = count * TIMER_PERCENTILE as usize / 100;
        let at_percentile = values[rank.min(count - 1)];
        let mean = values.iter().sum::<f64>() / count as f64;

        lines.push(format!("stats.timers.{key}.lower {lower:.6} {now}"));
        lines.push(format!("stats.timers.{key}.upper {upper:.6} {now}"));
        lines.push(format!(
            "stats.timers.{key}.upper_{TIMER_PERCENTILE} {at_percentile:.6} {now}"
        ));
        lines.push(format!("stats.timers.{key}.mean {mean:.6} {now}"));
        lines.push(format!("stats.timers.{key}.count {:.6} {now}", count as f64));
        lines.push(format!(
            "stats.timers.{key}.rate {:.6} {now}",
            count as f64 / interval
        ));
    }

    lines.push(format!(
        "stats.tallier.num_stats {:.6} {now}",
        num_stats as f64
    ));
    lines.push(format!(
        "stats.tallier.num_workers {:.6} {now}",
        num_workers as f64
    ));

    lines
}

/// Ships one report: connect, write all lines newline-joined with a
/// trailing newline, close.
pub async fn send_report(host: &str, port: u16, lines: &[String]) -> anyhow::Result<()> {
    let mut stream = TcpStream::connect((host, port)).await?;
    let payload = lines.join("\n") + "\n";
    stream.write_all(payload.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
