use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use logger::logger;
use replication::{Primary, Replica};
use server::{Role, Server};
use storage::{snapshot, Store};

// Use jemalloc as the global allocator for better memory efficiency
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Debug, Parser)]
#[command(name = "ember", about = "In-memory key-value server with primary/replica replication")]
struct Args {
    /// TCP port to listen on
    #[clap(long, default_value_t = 6379)]
    port: u16,

    /// Start as a replica of "<host> <port>"
    #[clap(long, value_name = "HOST PORT")]
    replicaof: Option<String>,

    /// Directory holding the snapshot file
    #[clap(long)]
    dir: Option<PathBuf>,

    /// Snapshot file name inside --dir
    #[clap(long)]
    dbfilename: Option<String>,
}

#[tokio::main]
async fn main() {
    logger::setup_logging();
    let args = Args::parse();

    let ascii_logo = r#"
   ____ __ _  ___  ___ ____
  / __//  ' \/ _ \/ -_) __/
 /___//_/_/_/_.__/\__/_/
------------------------------------------------
 In-memory key-value server with replication
------------------------------------------------
    "#;

    println!("{}", ascii_logo);

    let store = Store::new();
    if let (Some(dir), Some(name)) = (&args.dir, &args.dbfilename) {
        let path = dir.join(name);
        if path.exists() {
            load_snapshot(&store, &path).await;
        } else {
            warn!("snapshot file {:?} does not exist, starting empty", path);
        }
    }

    let role = match &args.replicaof {
        None => {
            info!("starting as primary");
            Role::Primary(Arc::new(Primary::new()))
        }
        Some(spec) => {
            let (host, port) = match parse_replicaof(spec) {
                Ok(target) => target,
                Err(e) => {
                    error!("invalid --replicaof: {}", e);
                    process::exit(1);
                }
            };
            info!("starting as replica of {}:{}", host, port);
            let replica = Replica::new(store.clone(), args.port, host, port);
            tokio::spawn(async move { replica.run().await });
            Role::Replica
        }
    };

    let server = Server::new(args.port, store, role);
    if let Err(e) = server.run().await {
        error!("server error: {}", e);
        process::exit(1);
    }
}

async fn load_snapshot(store: &Store, path: &Path) {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) => {
            warn!("could not open snapshot {:?}: {}", path, e);
            return;
        }
    };
    match snapshot::load(&mut file) {
        Ok(entries) => {
            let count = entries.len();
            for entry in entries {
                store.set(&entry.key, &entry.value, entry.ttl).await;
            }
            info!("loaded {} key(s) from snapshot {:?}", count, path);
        }
        Err(e) => {
            warn!(
                "could not load snapshot {:?}: {}; continuing with an empty store",
                path, e
            );
        }
    }
}

fn parse_replicaof(spec: &str) -> Result<(String, u16), String> {
    let parts: Vec<&str> = spec.split_whitespace().collect();
    match parts.as_slice() {
        [host, port] => port
            .parse()
            .map(|port| (host.to_string(), port))
            .map_err(|_| format!("invalid primary port {:?}", port)),
        _ => Err(format!("expected \"<host> <port>\", got {:?}", spec)),
    }
}
