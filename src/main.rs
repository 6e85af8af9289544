use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing_subscriber::{fmt, EnvFilter};

use peershare::config::Config;
use peershare::models::{PeerAddress, Visibility};
use peershare::peer::Node;
use peershare::tracker::Tracker;

#[derive(Parser)]
#[command(name = "peershare", about = "Peer-to-peer file distribution")]
struct Cli {
    /// JSON config file; missing fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the tracker: the directory of live peers and their files.
    Tracker {
        #[arg(long, default_value = "0.0.0.0:7000")]
        listen: String,
    },
    /// Run a peer node with an interactive command loop on stdin.
    Peer {
        #[arg(long, default_value = "0.0.0.0:0")]
        listen: String,
        /// Tracker address, e.g. 192.168.1.10:7000.
        #[arg(long)]
        tracker: String,
        /// Display name advertised alongside this peer's address.
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Command::Tracker { listen } => {
            let tracker = Tracker::bind(&listen, config).await?;
            tracker.run().await
        }
        Command::Peer {
            listen,
            tracker,
            name,
        } => {
            let node = Node::start(&listen, name, &tracker, config).await?;
            command_loop(node).await
        }
    }
}

const HELP: &str = "commands:
  share <path> [ip:port ...]   stage and publish a file (private to the listed peers)
  unshare <fileName>           retract a share and drop the staged copy
  query <keyword>              search the tracker directory
  search <ip:port> <fileName>  ask one peer directly whether it shares a file
  refresh                      re-fetch the directory visible to this peer
  download <fileName> <dest>   download from whoever offers the file
  status                       progress of all tasks
  pause <taskId> | resume <taskId> | cancel <taskId>
  cleanup <taskId> [...]       release bookkeeping of finished tasks
  peers                        peers the tracker currently knows
  quit";

/// Line-oriented operator loop; every command maps onto one node operation.
async fn command_loop(node: Arc<Node>) -> anyhow::Result<()> {
    println!("peer {} ready; type 'help' for commands", node.address());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            continue;
        };
        let args = parts.collect::<Vec<&str>>();
        match command {
            "share" if !args.is_empty() => {
                let visibility = match parse_allowed_peers(&args[1..]) {
                    Ok(allowed) if allowed.is_empty() => Visibility::Public,
                    Ok(allowed) => Visibility::Private(allowed),
                    Err(bad) => {
                        println!("not an ip:port: {}", bad);
                        continue;
                    }
                };
                match node.share(PathBuf::from(args[0]), visibility).await {
                    Ok(id) => println!("share started: {}", id),
                    Err(err) => println!("share failed: {}", err),
                }
            }
            "unshare" if args.len() == 1 => match node.unshare(args[0]).await {
                Ok(true) => println!("unshared {}", args[0]),
                Ok(false) => println!("not shared: {}", args[0]),
                Err(err) => println!("unshare failed: {}", err),
            },
            "query" if args.len() == 1 => match node.query(args[0]).await {
                Ok(hits) if hits.is_empty() => println!("no matches"),
                Ok(hits) => {
                    for record in hits {
                        println!(
                            "  {} ({} bytes) @ {} [{}]",
                            record.file_name, record.file_size, record.owner, record.file_hash
                        );
                    }
                }
                Err(err) => println!("query failed: {}", err),
            },
            "search" if args.len() == 2 => {
                let Some(peer) = parse_peer(args[0]) else {
                    println!("not an ip:port: {}", args[0]);
                    continue;
                };
                match node.search(&peer, args[1]).await {
                    Ok(Some(record)) => println!(
                        "  {} ({} bytes) @ {} [{}]",
                        record.file_name, record.file_size, record.owner, record.file_hash
                    ),
                    Ok(None) => println!("{} does not share {}", peer, args[1]),
                    Err(err) => println!("search failed: {}", err),
                }
            }
            "refresh" => match node.refresh().await {
                Ok(records) => println!("directory has {} visible files", records.len()),
                Err(err) => println!("refresh failed: {}", err),
            },
            "download" if args.len() == 2 => {
                // The cached view may predate the share; refresh once before
                // giving up on the name.
                let record = match node.find_record(args[0]) {
                    Some(record) => Some(record),
                    None => match node.refresh().await {
                        Ok(_) => node.find_record(args[0]),
                        Err(err) => {
                            println!("refresh failed: {}", err);
                            continue;
                        }
                    },
                };
                match record {
                    Some(record) => match node.download(record, PathBuf::from(args[1])).await {
                        Ok(id) => println!("download started: {}", id),
                        Err(err) => println!("download failed: {}", err),
                    },
                    None => println!("no visible file named {}", args[0]),
                }
            }
            "status" => {
                for progress in node.snapshots() {
                    println!(
                        "  {} {} {} {}% ({}/{} bytes){}",
                        progress.id,
                        progress.kind.label(),
                        progress.status.label(),
                        progress.percentage,
                        progress.bytes_transferred,
                        progress.total_bytes,
                        if progress.stalled { " [stalled]" } else { "" }
                    );
                }
            }
            "pause" if args.len() == 1 => report(node.pause(args[0]), args[0]),
            "resume" if args.len() == 1 => report(node.resume(args[0]), args[0]),
            "cancel" if args.len() == 1 => report(node.cancel(args[0]), args[0]),
            "cleanup" if !args.is_empty() => {
                let ids = args.iter().map(|id| id.to_string()).collect::<Vec<String>>();
                node.cleanup(&ids);
                println!("cleaned up {} task(s)", ids.len());
            }
            "peers" => match node.known_peers().await {
                Ok(peers) => {
                    for peer in peers {
                        println!("  {}", peer);
                    }
                }
                Err(err) => println!("peers failed: {}", err),
            },
            "help" => println!("{}", HELP),
            "quit" | "exit" => break,
            _ => println!("unknown command; type 'help'"),
        }
    }
    Ok(())
}

fn report(found: bool, task_id: &str) {
    if found {
        println!("ok");
    } else {
        println!("no such task: {}", task_id);
    }
}

fn parse_peer(arg: &str) -> Option<PeerAddress> {
    let (ip, port) = arg.rsplit_once(':')?;
    Some(PeerAddress::new(ip, port.parse::<u16>().ok()?))
}

fn parse_allowed_peers<'a>(args: &[&'a str]) -> Result<HashSet<PeerAddress>, &'a str> {
    let mut allowed = HashSet::new();
    for &arg in args {
        match parse_peer(arg) {
            Some(peer) => allowed.insert(peer),
            None => return Err(arg),
        };
    }
    Ok(allowed)
}
