use std::fmt;
use std::io::{self, Cursor};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::sleep;

use protocol::ProtocolError;
use storage::{snapshot, Store};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Error type for the replica side of replication.
#[derive(Debug)]
pub enum ReplicationError {
    HandshakeFailed(String),
    Protocol(ProtocolError),
    Io(io::Error),
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationError::HandshakeFailed(msg) => write!(f, "handshake failed: {}", msg),
            ReplicationError::Protocol(e) => write!(f, "{}", e),
            ReplicationError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ReplicationError {}

impl From<ProtocolError> for ReplicationError {
    fn from(err: ProtocolError) -> Self {
        ReplicationError::Protocol(err)
    }
}

impl From<io::Error> for ReplicationError {
    fn from(err: io::Error) -> Self {
        ReplicationError::Io(err)
    }
}

struct ReplicaState {
    repl_id: String,
    repl_offset: i64,
}

/// Replica-side replication manager: outbound handshake, full-resync
/// reception and application of the primary's command stream.
///
/// The stream reader task is the sole writer of the offset state.
pub struct Replica {
    store: Store,
    listening_port: u16,
    primary_host: String,
    primary_port: u16,
    state: Mutex<ReplicaState>,
}

impl Replica {
    pub fn new(store: Store, listening_port: u16, primary_host: String, primary_port: u16) -> Self {
        Replica {
            store,
            listening_port,
            primary_host,
            primary_port,
            state: Mutex::new(ReplicaState {
                repl_id: String::new(),
                repl_offset: 0,
            }),
        }
    }

    pub async fn repl_offset(&self) -> i64 {
        self.state.lock().await.repl_offset
    }

    /// Connect, sync and follow the primary, reconnecting with a fixed
    /// backoff whenever the link drops. Never returns.
    pub async fn run(&self) {
        loop {
            if let Err(e) = self.session().await {
                warn!(
                    "replication link to {}:{} lost: {}",
                    self.primary_host, self.primary_port, e
                );
            }
            info!("reconnecting to primary in {:?}", RECONNECT_BACKOFF);
            sleep(RECONNECT_BACKOFF).await;
        }
    }

    async fn session(&self) -> Result<(), ReplicationError> {
        let stream =
            TcpStream::connect((self.primary_host.as_str(), self.primary_port)).await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        self.handshake(&mut reader, &mut writer).await?;
        info!(
            "full resync from {}:{} complete, entering stream mode",
            self.primary_host, self.primary_port
        );
        self.stream_commands(&mut reader, &mut writer).await
    }

    /// The four-step handshake, then receipt of the snapshot payload.
    async fn handshake(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), ReplicationError> {
        let port = self.listening_port.to_string();
        for step in [
            vec!["PING"],
            vec!["REPLCONF", "listening-port", port.as_str()],
            vec!["REPLCONF", "capa", "psync2"],
        ] {
            writer
                .write_all(protocol::encode_array(&step).as_bytes())
                .await?;
            let reply = protocol::read_line(reader).await?;
            debug!("handshake step {:?} answered {:?}", step[0], reply);
        }

        writer
            .write_all(protocol::encode_array(&["PSYNC", "?", "-1"]).as_bytes())
            .await?;
        let reply = protocol::read_line(reader).await?;
        let parts: Vec<&str> = reply.split_whitespace().collect();
        if parts.len() != 3 || parts[0] != "+FULLRESYNC" {
            return Err(ReplicationError::HandshakeFailed(format!(
                "unexpected PSYNC reply {:?}",
                reply
            )));
        }
        let offset: i64 = parts[2].parse().map_err(|_| {
            ReplicationError::HandshakeFailed(format!("invalid replication offset {:?}", parts[2]))
        })?;

        let payload = protocol::read_bulk_bytes(reader).await?;
        match snapshot::load(&mut Cursor::new(&payload)) {
            Ok(entries) => {
                let count = entries.len();
                for entry in entries {
                    self.store.set(&entry.key, &entry.value, entry.ttl).await;
                }
                info!(
                    "applied resync snapshot: {} bytes, {} key(s)",
                    payload.len(),
                    count
                );
            }
            Err(e) => warn!("could not decode resync snapshot: {}", e),
        }

        let mut state = self.state.lock().await;
        state.repl_id = parts[1].to_string();
        state.repl_offset = offset;
        Ok(())
    }

    /// Stream mode: apply propagated commands, answer GETACK probes, and
    /// account for every frame's encoded length - the GETACK included, since
    /// the primary wrote those bytes into the stream as well.
    async fn stream_commands(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), ReplicationError> {
        loop {
            let argv = protocol::parse(reader).await?;
            if argv.is_empty() {
                continue;
            }

            if argv.len() == 3
                && argv[0].eq_ignore_ascii_case("REPLCONF")
                && argv[1].eq_ignore_ascii_case("GETACK")
            {
                // The reply carries the offset from before this GETACK frame.
                let offset = self.state.lock().await.repl_offset;
                let ack = protocol::encode_array(&["REPLCONF", "ACK", &offset.to_string()]);
                writer.write_all(ack.as_bytes()).await?;
                debug!("acknowledged offset {}", offset);
            } else {
                self.apply(&argv).await;
            }

            let mut state = self.state.lock().await;
            state.repl_offset += protocol::encode_array(&argv).len() as i64;
        }
    }

    /// Apply one replicated command to the local store. Nothing is written
    /// back to the primary and nothing is re-propagated from here.
    async fn apply(&self, argv: &[String]) {
        match argv[0].to_ascii_uppercase().as_str() {
            "SET" => match parse_set(argv) {
                Ok((key, value, ttl)) => self.store.set(key, value, ttl).await,
                Err(e) => warn!("ignoring malformed replicated SET: {}", e),
            },
            // Keepalives from the primary carry no effect but still count
            // toward the offset.
            "PING" => {}
            "REPLCONF" => {}
            other => debug!("ignoring replicated command {:?}", other),
        }
    }
}

fn parse_set(argv: &[String]) -> Result<(&str, &str, Option<Duration>), String> {
    if argv.len() < 3 {
        return Err("wrong number of arguments".to_string());
    }
    let mut ttl = None;
    if argv.len() == 5 && argv[3].eq_ignore_ascii_case("PX") {
        let millis: i64 = argv[4]
            .parse()
            .map_err(|_| format!("invalid PX value {:?}", argv[4]))?;
        if millis > 0 {
            ttl = Some(Duration::from_millis(millis as u64));
        }
    }
    Ok((&argv[1], &argv[2], ttl))
}
