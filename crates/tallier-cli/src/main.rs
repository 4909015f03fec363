use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[command(name = "tallier", about = "Tallier inspection CLI")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Command service address
    #[arg(short, long, default_value = "127.0.0.1:8126", global = true)]
    addr: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show aggregate daemon stats
    Stats,
    /// Show the most frequent stat keys
    Top {
        /// Number of keys to show
        #[arg(default_value = "10")]
        count: usize,
    },
    /// Show frequency tracker coverage (retained/total)
    Coverage,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let request = match &args.command {
        Commands::Stats => "STATS".to_string(),
        Commands::Top { count } => format!("TOP {count}"),
        Commands::Coverage => "COVERAGE".to_string(),
    };

    let stream = TcpStream::connect(&args.addr).await?;
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(format!("{request}\r\n").as_bytes())
        .await?;

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut first = true;
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            anyhow::bail!("connection closed before response terminator");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if first {
            first = false;
            if let Some(message) = trimmed.strip_prefix("ERROR:") {
                anyhow::bail!("server error:{message}");
            }
        }
        if trimmed == "." {
            break;
        }
        // Undo dot-stuffing
        println!("{}", trimmed.strip_prefix('.').unwrap_or(trimmed));
    }
    Ok(())
}
