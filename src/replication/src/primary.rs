use std::io;
use std::sync::Arc;

use log::{debug, warn};
use rand::Rng;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};

use protocol::ProtocolError;
use storage::EMPTY_SNAPSHOT;

/// Acks beyond this are dropped; the next WAIT re-polls with a fresh GETACK.
const ACK_INBOX_CAPACITY: usize = 128;

/// One registered replica connection.
struct ReplicaHandle {
    id: u64,
    writer: OwnedWriteHalf,
    last_known_ack: i64,
}

/// Registry and offsets, guarded together so that a propagated frame reaches
/// a coherent snapshot of the replica set and the offset advance is atomic
/// with respect to it.
struct PrimaryState {
    repl_offset: i64,
    last_write_offset: i64,
    had_write_since_last_wait: bool,
    next_replica_id: u64,
    replicas: Vec<ReplicaHandle>,
}

/// Primary-side replication manager: replica registry, command propagation,
/// offset tracking and the WAIT acknowledgement barrier.
pub struct Primary {
    repl_id: String,
    state: Mutex<PrimaryState>,
    ack_tx: mpsc::Sender<i64>,
    ack_rx: Mutex<mpsc::Receiver<i64>>,
}

impl Primary {
    pub fn new() -> Self {
        let (ack_tx, ack_rx) = mpsc::channel(ACK_INBOX_CAPACITY);
        Primary {
            repl_id: generate_repl_id(),
            state: Mutex::new(PrimaryState {
                repl_offset: 0,
                last_write_offset: 0,
                had_write_since_last_wait: false,
                next_replica_id: 0,
                replicas: Vec::new(),
            }),
            ack_tx,
            ack_rx: Mutex::new(ack_rx),
        }
    }

    pub fn repl_id(&self) -> &str {
        &self.repl_id
    }

    pub async fn repl_offset(&self) -> i64 {
        self.state.lock().await.repl_offset
    }

    pub async fn replica_count(&self) -> usize {
        self.state.lock().await.replicas.len()
    }

    /// Last offset each registered replica acknowledged.
    pub async fn replica_acks(&self) -> Vec<i64> {
        let state = self.state.lock().await;
        state.replicas.iter().map(|r| r.last_known_ack).collect()
    }

    /// Answer a PSYNC: the FULLRESYNC preamble, then the snapshot payload as
    /// a bulk header followed by the raw bytes with no trailing CRLF.
    pub async fn send_full_resync<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let offset = self.state.lock().await.repl_offset;
        let preamble =
            protocol::encode_simple(&format!("FULLRESYNC {} {}", self.repl_id, offset));
        writer.write_all(preamble.as_bytes()).await?;
        writer
            .write_all(format!("${}\r\n", EMPTY_SNAPSHOT.len()).as_bytes())
            .await?;
        writer.write_all(EMPTY_SNAPSHOT).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Register a connection that completed PSYNC and start its ack reader.
    pub async fn register_replica(
        self: Arc<Self>,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) {
        let id = {
            let mut state = self.state.lock().await;
            state.next_replica_id += 1;
            let id = state.next_replica_id;
            state.replicas.push(ReplicaHandle {
                id,
                writer,
                last_known_ack: 0,
            });
            id
        };

        tokio::spawn(async move {
            self.read_acks(id, reader).await;
        });
        debug!("registered replica #{}", id);
    }

    /// Per-replica reader task. Frames of the shape REPLCONF ACK <offset>
    /// feed the ack inbox, everything else on this connection is ignored.
    async fn read_acks(&self, id: u64, mut reader: BufReader<OwnedReadHalf>) {
        loop {
            let frame = match protocol::parse(&mut reader).await {
                Ok(frame) => frame,
                Err(ProtocolError::Eof) => {
                    debug!("replica #{} closed its connection", id);
                    return;
                }
                Err(e) => {
                    warn!("replica #{} ack stream error: {}", id, e);
                    return;
                }
            };

            if frame.len() == 3
                && frame[0].eq_ignore_ascii_case("REPLCONF")
                && frame[1].eq_ignore_ascii_case("ACK")
            {
                match frame[2].parse::<i64>() {
                    Ok(offset) => self.record_ack(id, offset).await,
                    Err(_) => {
                        warn!("replica #{} sent non-numeric ack offset {:?}", id, frame[2])
                    }
                }
            }
        }
    }

    async fn record_ack(&self, id: u64, offset: i64) {
        {
            let mut state = self.state.lock().await;
            if let Some(replica) = state.replicas.iter_mut().find(|r| r.id == id) {
                replica.last_known_ack = offset;
            }
        }
        debug!("replica #{} acknowledged offset {}", id, offset);
        if self.ack_tx.try_send(offset).is_err() {
            debug!("ack inbox full, dropping ack at offset {}", offset);
        }
    }

    /// Fan a committed write out to every registered replica and advance the
    /// replication offset by the frame's encoded length.
    pub async fn propagate(&self, argv: &[String]) {
        let frame = protocol::encode_array(argv);
        let mut state = self.state.lock().await;
        write_to_replicas(&mut state, frame.as_bytes()).await;
        state.repl_offset += frame.len() as i64;
        state.last_write_offset = state.repl_offset;
        state.had_write_since_last_wait = true;
        debug!(
            "propagated {:?} to {} replica(s), replication offset now {}",
            argv.first().map(String::as_str).unwrap_or(""),
            state.replicas.len(),
            state.repl_offset
        );
    }

    /// Block until `num_replicas` replicas acknowledge the latest write or
    /// the timeout fires, returning how many did.
    ///
    /// Without a write since the previous WAIT this returns the replica
    /// count without polling.
    pub async fn wait_for_acks(&self, num_replicas: usize, timeout_ms: u64) -> i64 {
        {
            let state = self.state.lock().await;
            if !state.had_write_since_last_wait {
                return state.replicas.len() as i64;
            }
        }

        let target = {
            let mut state = self.state.lock().await;
            let target = state.last_write_offset;
            let getack = protocol::encode_array(&["REPLCONF", "GETACK", "*"]);
            write_to_replicas(&mut state, getack.as_bytes()).await;
            // The GETACK frame is part of the stream replicas account for,
            // so it advances the offset here too; the barrier target stays
            // at the last write.
            state.repl_offset += getack.len() as i64;
            target
        };

        let mut acks: i64 = 0;
        if acks < num_replicas as i64 {
            let mut inbox = self.ack_rx.lock().await;
            let deadline = sleep(Duration::from_millis(timeout_ms));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    received = inbox.recv() => match received {
                        Some(offset) if offset >= target => {
                            acks += 1;
                            if acks >= num_replicas as i64 {
                                break;
                            }
                        }
                        // Acks older than the target are not counted.
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        }

        self.state.lock().await.had_write_since_last_wait = false;
        acks
    }
}

impl Default for Primary {
    fn default() -> Self {
        Primary::new()
    }
}

/// Write one encoded frame to every replica. A replica whose socket fails
/// is logged and dropped from the registry.
async fn write_to_replicas(state: &mut PrimaryState, bytes: &[u8]) {
    let mut broken = Vec::new();
    for replica in state.replicas.iter_mut() {
        if let Err(e) = replica.writer.write_all(bytes).await {
            warn!("dropping replica #{}: write failed: {}", replica.id, e);
            broken.push(replica.id);
        }
    }
    if !broken.is_empty() {
        state.replicas.retain(|r| !broken.contains(&r.id));
    }
}

/// 40 hex characters, chosen once at startup.
fn generate_repl_id() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..40).map(|_| HEX[rng.gen_range(0..HEX.len())] as char).collect()
}
