use std::collections::HashSet;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use driftfs::{
    new_encryption_key, parse_key_hex, FileServer, FileServerConfig, PathTransform,
};

#[derive(Parser, Debug)]
#[command(name = "driftfs")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on (host:port); an empty host binds loopback.
    #[arg(short, long, default_value = ":4001")]
    bind: String,

    /// Peer to dial at startup (host:port); repeatable.
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<String>,

    /// Root directory for blob storage.
    #[arg(short, long, default_value = "./driftfs-data")]
    storage_root: PathBuf,

    /// Node identifier; generated when omitted.
    #[arg(long, default_value = "")]
    node_id: String,

    /// Shared encryption key as 64 hex characters. When omitted an
    /// ephemeral key is generated and printed; peers must share the key.
    #[arg(short, long)]
    key: Option<String>,

    /// Blob path layout: content_addressed, or identity (testing only).
    #[arg(long, default_value = "content_addressed")]
    path_transform: String,

    /// Capacity of the inbound control-message queue.
    #[arg(long, default_value_t = 1024)]
    queue_capacity: usize,

    /// Upper bound on control frame payloads in bytes.
    #[arg(long, default_value_t = 1024 * 1024)]
    max_control_payload: u32,

    /// Allowed peer endpoint (ip:port); repeatable. All peers are
    /// admitted when no allow-list is given.
    #[arg(long = "allow", value_name = "ADDR")]
    allow: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let encryption_key = match &args.key {
        Some(hex_key) => parse_key_hex(hex_key).context("invalid --key")?,
        None => {
            let key = new_encryption_key();
            warn!(
                key = %hex::encode(key),
                "no --key given; generated an ephemeral key, peers must use the same one"
            );
            key
        }
    };

    let path_transform = match args.path_transform.as_str() {
        "content_addressed" => PathTransform::ContentAddressed,
        "identity" => PathTransform::Identity,
        other => bail!("unknown path transform: {}", other),
    };

    let mut config = FileServerConfig::new(args.bind, args.storage_root, encryption_key);
    config.node_id = args.node_id;
    config.path_transform = path_transform;
    config.bootstrap_nodes = args.bootstrap;
    config.queue_capacity = args.queue_capacity;
    config.max_control_payload = args.max_control_payload;
    if !args.allow.is_empty() {
        let allowed: HashSet<String> = args.allow.into_iter().collect();
        config.allow_predicate = Some(Arc::new(move |addr: &str| allowed.contains(addr)));
    }

    let server = FileServer::new(config)?;
    server.start().await?;
    info!(node = %server.node_id(), "node identity");

    run_shell(&server).await?;

    server.stop().await;
    Ok(())
}

/// Interactive command shell over stdin. Drives the server through its
/// public surface only.
async fn run_shell(server: &FileServer) -> Result<()> {
    println!("driftfs shell ready, type 'help' for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("driftfs> ");
        std::io::stdout().flush().ok();

        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        match handle_command(server, line.trim()).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("error: {:#}", e),
        }
    }
    Ok(())
}

/// Execute one shell command. Returns `Ok(false)` when the shell should
/// exit.
async fn handle_command(server: &FileServer, line: &str) -> Result<bool> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [] => {}
        ["store", key, path] => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("cannot open {}", path))?;
            server.store(key, file).await?;
            println!("stored {}", key);
        }
        ["get", key] => match server.get(key).await? {
            Some((size, mut reader)) => {
                let mut contents = Vec::new();
                std::io::Read::read_to_end(&mut reader, &mut contents)?;
                println!("({} bytes) {}", size, String::from_utf8_lossy(&contents));
            }
            None => println!("not found: {}", key),
        },
        ["get", key, out] => match server.get(key).await? {
            Some((size, mut reader)) => {
                let mut file = std::fs::File::create(out)
                    .with_context(|| format!("cannot create {}", out))?;
                std::io::copy(&mut reader, &mut file)?;
                println!("wrote {} bytes to {}", size, out);
            }
            None => println!("not found: {}", key),
        },
        ["has", key] => {
            println!("{}", if server.has(key) { "yes" } else { "no" });
        }
        ["delete", key] => {
            println!(
                "{}",
                if server.delete(key) { "deleted" } else { "nothing to delete" }
            );
        }
        ["peers"] => {
            println!("{} connected", server.peer_count());
        }
        ["help"] => {
            println!("commands:");
            println!("  store <key> <file>   insert a file under a key");
            println!("  get <key> [out]      fetch a key, print or write to a file");
            println!("  has <key>            check the local store");
            println!("  delete <key>         remove the local blob");
            println!("  peers                count connected peers");
            println!("  exit                 stop the node and leave");
        }
        ["exit"] | ["quit"] => return Ok(false),
        other => {
            println!("unknown command: {} (try 'help')", other.join(" "));
        }
    }
    Ok(true)
}
