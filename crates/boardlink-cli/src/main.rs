//! Boardlink CLI
//!
//! Talks directly to a board's local-network file API, and scans for boards
//! advertising the BLE file transfer service.

use anyhow::{Context, Result, bail};
use boardlink_core::{BoardScanner, BoardSession, PairingStore, WifiPeripheral};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "boardlink", version, about = "File exchange with CircuitPython boards")]
struct Cli {
    /// Board host name or address on the local network
    #[arg(long, global = true)]
    host: Option<String>,

    /// HTTP port of the board's file API
    #[arg(long, global = true, default_value = "80")]
    port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for boards over BLE
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },
    /// List a directory on the board
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Download a file from the board
    Get {
        path: String,
        /// Local destination (default: file name in the working directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Upload a file to the board
    Put {
        file: PathBuf,
        /// Destination path on the board (default: /<file name>)
        path: Option<String>,
    },
    /// Delete a file on the board
    Rm { path: String },
    /// Create a directory on the board
    Mkdir { path: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .try_init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { timeout } => scan(Duration::from_secs(timeout)).await,
        Commands::Ls { path } => {
            let session = connect(cli.host.as_deref(), cli.port).await?;
            match session.list_directory(&path).await? {
                None => bail!("{path}: no such directory"),
                Some(entries) => {
                    for entry in entries {
                        if entry.is_directory {
                            println!("{}/", entry.name);
                        } else {
                            println!("{:>10}  {}", entry.file_size, entry.name);
                        }
                    }
                    Ok(())
                }
            }
        }
        Commands::Get { path, output } => {
            let session = connect(cli.host.as_deref(), cli.port).await?;
            let data = session.read_file(&path).await?;
            let dest = output.unwrap_or_else(|| {
                PathBuf::from(path.rsplit('/').next().unwrap_or(path.as_str()))
            });
            std::fs::write(&dest, &data)
                .with_context(|| format!("writing {}", dest.display()))?;
            println!("{} -> {} ({} bytes)", path, dest.display(), data.len());
            Ok(())
        }
        Commands::Put { file, path } => {
            let data = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .context("source has no file name")?;
            let dest = path.unwrap_or_else(|| format!("/{name}"));
            let session = connect(cli.host.as_deref(), cli.port).await?;
            session.write_file(&dest, &data).await?;
            println!("{} -> {} ({} bytes)", file.display(), dest, data.len());
            Ok(())
        }
        Commands::Rm { path } => {
            let session = connect(cli.host.as_deref(), cli.port).await?;
            if session.delete_file(&path).await? {
                println!("deleted {path}");
            } else {
                bail!("{path}: no such file");
            }
            Ok(())
        }
        Commands::Mkdir { path } => {
            let session = connect(cli.host.as_deref(), cli.port).await?;
            if session.make_directory(&path).await? {
                println!("created {path}");
            } else {
                println!("{path} already exists");
            }
            Ok(())
        }
    }
}

async fn scan(timeout: Duration) -> Result<()> {
    let scanner = BoardScanner::new().await?;
    let boards = scanner.scan(timeout, None).await?;
    if boards.is_empty() {
        println!("no boards found");
    } else {
        for board in boards {
            println!(
                "{}  {}  rssi={}",
                board.name.as_deref().unwrap_or("<unknown>"),
                board.address,
                board.rssi.map_or("?".to_string(), |r| r.to_string()),
            );
        }
    }
    Ok(())
}

async fn connect(host: Option<&str>, port: u16) -> Result<Arc<BoardSession>> {
    let host = host.context("--host is required for file operations")?;

    let store = PairingStore::load();
    let transport = Arc::new(
        WifiPeripheral::new(host, port)?.with_password(store.password_for_host(host)),
    );
    let session = BoardSession::new(transport, None)
        .await
        .with_context(|| format!("connecting to {host}"))?;
    if !session.is_file_transfer_enabled() {
        bail!("{host} does not expose the file API");
    }
    Ok(Arc::new(session))
}
