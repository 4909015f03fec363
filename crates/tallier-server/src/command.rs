/// Inspection command service.
///
/// Line-oriented TCP: requests are `\r\n`-terminated and
/// case-insensitive. A recognized command replies with a body whose
/// lines are dot-stuffed (a leading `.` gets doubled) and terminated by
/// a line containing only `.`. Anything else replies
/// `ERROR: invalid command`.
///
/// The handlers only read a snapshot the master refreshes after each
/// flush; they never touch worker state.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Aggregate state exposed to inspection clients, refreshed by the
/// master after each flush.
#[derive(Debug, Default, Clone)]
pub struct InspectState {
    pub num_stats: u64,
    pub num_workers: usize,
    pub flush_count: u64,
    pub top: Vec<(String, u64)>,
    pub coverage: (u64, u64),
}

const COMMANDS: &[&str] = &["COVERAGE", "HELP", "STATS", "TOP"];

pub async fn run(
    iface: &str,
    port: u16,
    state: Arc<RwLock<InspectState>>,
    started: Instant,
) -> anyhow::Result<()> {
    let ip: Ipv4Addr = if iface.is_empty() {
        Ipv4Addr::UNSPECIFIED
    } else {
        iface.parse()?
    };
    let listener = TcpListener::bind((ip, port)).await?;
    info!(port, "command service listening");

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(from = %addr, "command connection");
                let state = Arc::clone(&state);
                tokio::spawn(handle_connection(stream, state, started));
            }
            Err(e) => warn!("command accept error: {}", e),
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<RwLock<InspectState>>, started: Instant) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let request = line.trim_end_matches(['\r', '\n']);
        let response = run_command(request, &state, started).await;
        if writer.write_all(response.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn run_command(request: &str, state: &RwLock<InspectState>, started: Instant) -> String {
    let lowered = request.to_lowercase();
    let mut parts = lowered.split_whitespace();
    let body = match parts.next() {
        Some("help") => Some(cmd_help()),
        Some("stats") => Some(cmd_stats(&*state.read().await, started)),
        Some("top") => Some(cmd_top(
            &*state.read().await,
            parts.next().and_then(|n| n.parse().ok()).unwrap_or(10),
        )),
        Some("coverage") => Some(cmd_coverage(&*state.read().await)),
        _ => None,
    };

    match body {
        Some(lines) => {
            let mut out = String::new();
            for line in lines {
                if line.starts_with('.') {
                    out.push('.');
                }
                out.push_str(&line);
                out.push_str("\r\n");
            }
            out.push_str(".\r\n");
            out
        }
        None => "ERROR: invalid command\r\n".to_string(),
    }
}

fn cmd_help() -> Vec<String> {
    let mut lines = vec!["Available commands:".to_string()];
    lines.extend(COMMANDS.iter().map(|c| format!("  {c}")));
    lines
}

fn cmd_stats(state: &InspectState, started: Instant) -> Vec<String> {
    vec![
        format!("uptime_seconds: {}", started.elapsed().as_secs()),
        format!("num_workers: {}", state.num_workers),
        format!("num_stats: {}", state.num_stats),
        format!("flush_count: {}", state.flush_count),
    ]
}

fn cmd_top(state: &InspectState, n: usize) -> Vec<String> {
    if state.top.is_empty() {
        return vec!["no stat keys observed yet".to_string()];
    }
    state
        .top
        .iter()
        .take(n)
        .map(|(key, count)| format!("{key}={count}"))
        .collect()
}

fn cmd_coverage(state: &InspectState) -> Vec<String> {
    let (retained, total) = state.coverage;
    vec![format!("{retained}/{total}")]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_keys() -> Arc<RwLock<InspectState>> {
        Arc::new(RwLock::new(InspectState {
            num_stats: 12,
            num_workers: 2,
            flush_count: 3,
            top: vec![
                ("api.hits".to_string(), 40),
                (".dotted".to_string(), 7),
            ],
            coverage: (47, 50),
        }))
    }

    #[tokio::test]
    async fn test_unknown_command_rejected() {
        let state = state_with_keys();
        let out = run_command("bogus", &state, Instant::now()).await;
        assert_eq!(out, "ERROR: invalid command\r\n");
        let out = run_command("", &state, Instant::now()).await;
        assert_eq!(out, "ERROR: invalid command\r\n");
    }

    #[tokio::test]
    async fn test_commands_are_case_insensitive() {
        let state = state_with_keys();
        let out = run_command("HeLp", &state, Instant::now()).await;
        assert!(out.starts_with("Available commands:\r\n"));
        assert!(out.ends_with(".\r\n"));
        assert!(out.contains("  TOP\r\n"));
    }

    #[tokio::test]
    async fn test_top_respects_limit_and_dot_stuffs() {
        let state = state_with_keys();
        let out = run_command("top 5", &state, Instant::now()).await;
        assert!(out.contains("api.hits=40\r\n"));
        // A body line starting with `.` is prefixed with another `.`.
        assert!(out.contains("\r\n..dotted=7\r\n"));
        assert!(out.ends_with("\r\n.\r\n"));

        let out = run_command("top 1", &state, Instant::now()).await;
        assert!(!out.contains("dotted"));
    }

    #[tokio::test]
    async fn test_coverage_body() {
        let state = state_with_keys();
        let out = run_command("coverage", &state, Instant::now()).await;
        assert_eq!(out, "47/50\r\n.\r\n");
    }
}
