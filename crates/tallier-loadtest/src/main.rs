/// Tallier load generator.
///
/// Sends synthetic stat datagrams at a regulated rate so the daemon's
/// ingest path, flush cycle, and graphite output can be exercised on a
/// real socket.
///
/// Usage:
///   tallier-loadtest counters            Plain counter traffic
///   tallier-loadtest timers              Timer traffic
///   tallier-loadtest mixed               Counters, sampled counters, and timers
///   tallier-loadtest compressed          Multi-line datagrams using prefix compression

use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::net::UdpSocket;

use tallier_protocol::Sample;

#[derive(Parser, Debug)]
#[command(name = "tallier-loadtest", about = "Tallier UDP traffic generator")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Daemon address to send stat datagrams to
    #[arg(short, long, default_value = "127.0.0.1:8125", global = true)]
    target: String,

    /// Datagrams per second
    #[arg(short, long, default_value = "1000", global = true)]
    rate: u64,

    /// Test duration in seconds
    #[arg(short, long, default_value = "10", global = true)]
    duration: u64,

    /// Number of distinct stat keys to cycle through
    #[arg(short, long, default_value = "50", global = true)]
    keys: usize,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plain counter samples
    Counters,
    /// Timer samples with varying values
    Timers,
    /// A blend of counters, sampled counters, and timers
    Mixed,
    /// Multi-line datagrams compressed against their previous line
    Compressed,
}

fn datagram_for(command: &Command, seq: u64, keys: usize) -> String {
    let key_id = seq as usize % keys;
    match command {
        Command::Counters => format!("loadtest.counter.{key_id}:1|c"),
        Command::Timers => format!("loadtest.timer.{key_id}:{}|ms", seq % 250),
        Command::Mixed => match seq % 3 {
            0 => format!("loadtest.counter.{key_id}:2|c"),
            1 => format!("loadtest.sampled.{key_id}:2|c@0.5"),
            _ => format!("loadtest.timer.{key_id}:{}|ms", seq % 250),
        },
        Command::Compressed => {
            let lines = vec![
                format!("loadtest.compressed.{key_id}.first:1|c"),
                format!("loadtest.compressed.{key_id}.second:2|c"),
                format!("loadtest.compressed.{key_id}.third:{}|ms", seq % 250),
            ];
            build_compressed(&lines)
        }
    }
}

/// Joins lines into one datagram, replacing each line's shared prefix
/// with the previous line by a `^hh` header.
fn build_compressed(lines: &[String]) -> String {
    let mut out = String::new();
    let mut previous = "";
    for (i, line) in lines.iter().enumerate() {
        if i == 0 {
            out.push_str(line);
        } else {
            let common = common_prefix_len(previous, line).min(255);
            out.push('\n');
            out.push_str(&format!("^{common:02x}"));
            out.push_str(&line[common..]);
        }
        previous = line;
    }
    out
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(&args.target).await?;

    println!(
        "Sending to {} at {} datagrams/s for {}s ({} keys)...",
        args.target, args.rate, args.duration, args.keys
    );

    let interval_us = 1_000_000 / args.rate.max(1);
    let mut seq: u64 = 0;
    let mut sent: u64 = 0;
    let mut bytes: u64 = 0;
    let mut samples: u64 = 0;
    let start = Instant::now();
    let deadline = start + Duration::from_secs(args.duration);

    while Instant::now() < deadline {
        let datagram = datagram_for(&args.command, seq, args.keys.max(1));
        samples += Sample::parse(datagram.as_bytes()).len() as u64;
        match socket.send(datagram.as_bytes()).await {
            Ok(n) => {
                sent += 1;
                bytes += n as u64;
            }
            Err(e) => eprintln!("send error: {e}"),
        }
        seq = seq.wrapping_add(1);
        tokio::time::sleep(Duration::from_micros(interval_us)).await;
    }

    let elapsed = start.elapsed().as_secs_f64();
    println!("\nSummary:");
    println!("  Duration:  {elapsed:.1}s");
    println!("  Datagrams: {sent}");
    println!("  Samples:   {samples}");
    println!("  Bytes:     {bytes}");
    println!("  Rate:      {:.0} datagrams/s", sent as f64 / elapsed);

    Ok(())
}
