use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use protocol::ProtocolError;
use replication::Primary;
use storage::Store;

use crate::error::ServerError;

/// The node's replication role, fixed for the lifetime of the process.
///
/// The role doubles as the propagation sink: command handlers hand every
/// committed write to [`Role::propagate`] and never branch on the role
/// themselves. On a replica the sink is a no-op.
#[derive(Clone)]
pub enum Role {
    Primary(Arc<Primary>),
    Replica,
}

impl Role {
    async fn propagate(&self, argv: &[String]) {
        match self {
            Role::Primary(primary) => primary.propagate(argv).await,
            Role::Replica => {}
        }
    }

    async fn info_payload(&self) -> String {
        match self {
            Role::Primary(primary) => format!(
                "role:leader\nleader_replid:{}\nleader_repl_offset:{}\n",
                primary.repl_id(),
                primary.repl_offset().await
            ),
            Role::Replica => "role:follower\n".to_string(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Role::Primary(_) => "primary",
            Role::Replica => "replica",
        }
    }
}

pub struct Server {
    host: String,
    port: u16,
    store: Store,
    role: Role,
}

impl Server {
    pub fn new(port: u16, store: Store, role: Role) -> Self {
        Server {
            host: "0.0.0.0".to_string(),
            port,
            store,
            role,
        }
    }

    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr).await.map_err(ServerError::Bind)?;

        info!("listening on {} as {}", addr, self.role.name());

        // Shutdown broadcast channel
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let shutdown_tx_clone = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("received shutdown signal, stopping server...");
            let _ = shutdown_tx_clone.send(());
        });

        loop {
            let mut shutdown_rx = shutdown_tx.subscribe();

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let store = self.store.clone();
                            let role = self.role.clone();
                            let mut client_shutdown_rx = shutdown_tx.subscribe();

                            debug!("new connection from {}", peer_addr);

                            tokio::spawn(async move {
                                let result =
                                    handle_client(stream, store, role, &mut client_shutdown_rx)
                                        .await;

                                if let Err(e) = result {
                                    info!("connection closed from {}: {}", peer_addr, e);
                                } else {
                                    debug!("connection closed from {}", peer_addr);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("server stopped");
                    return Ok(());
                }
            }
        }
    }
}

/// What the read loop should do after a command was processed.
enum Flow {
    Continue,
    /// The connection completed PSYNC; its socket now belongs to the
    /// replication manager.
    Handover,
}

async fn handle_client(
    stream: TcpStream,
    store: Store,
    role: Role,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        tokio::select! {
            parsed = protocol::parse(&mut reader) => {
                let argv = match parsed {
                    Ok(argv) => argv,
                    Err(ProtocolError::Eof) => return Ok(()),
                    Err(e) => {
                        warn!("closing connection: {}", e);
                        return Ok(());
                    }
                };

                match process_command(&argv, &store, &role, &mut writer).await? {
                    Flow::Continue => {}
                    Flow::Handover => {
                        if let Role::Primary(primary) = &role {
                            Arc::clone(primary).register_replica(reader, writer).await;
                        }
                        return Ok(());
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("client handler received shutdown signal");
                return Ok(());
            }
        }
    }
}

/// Dispatch one parsed command, writing exactly one reply frame (PSYNC and
/// the silent REPLCONF ACK form are the exceptions).
async fn process_command(
    argv: &[String],
    store: &Store,
    role: &Role,
    writer: &mut OwnedWriteHalf,
) -> std::io::Result<Flow> {
    if argv.is_empty() {
        reply(writer, protocol::encode_error("empty command provided")).await?;
        return Ok(Flow::Continue);
    }

    match argv[0].to_ascii_uppercase().as_str() {
        "PING" => reply(writer, protocol::encode_simple("PONG")).await?,
        "ECHO" => {
            if argv.len() < 2 {
                reply(
                    writer,
                    protocol::encode_error("wrong number of arguments for 'echo' command"),
                )
                .await?;
            } else {
                reply(writer, protocol::encode_bulk(&argv[1])).await?;
            }
        }
        "SET" => handle_set(argv, store, role, writer).await?,
        "GET" => {
            if argv.len() != 2 {
                reply(
                    writer,
                    protocol::encode_error("wrong number of arguments for 'get' command"),
                )
                .await?;
            } else {
                match store.get(&argv[1]).await {
                    Some(value) => reply(writer, protocol::encode_bulk(&value)).await?,
                    None => reply(writer, protocol::encode_null()).await?,
                }
            }
        }
        "INFO" => {
            let payload = role.info_payload().await;
            reply(writer, protocol::encode_bulk(&payload)).await?;
        }
        "REPLCONF" => {
            // ACK frames arriving here carry no reply; every other REPLCONF
            // form is acknowledged and its contents ignored.
            let is_ack = argv.get(1).is_some_and(|arg| arg.eq_ignore_ascii_case("ACK"));
            if !is_ack {
                reply(writer, protocol::encode_simple("OK")).await?;
            }
        }
        "PSYNC" => match role {
            Role::Primary(primary) => {
                primary.send_full_resync(writer).await?;
                return Ok(Flow::Handover);
            }
            Role::Replica => {
                reply(writer, protocol::encode_error("PSYNC only supported by leader")).await?;
            }
        },
        "WAIT" => handle_wait(argv, role, writer).await?,
        _ => {
            reply(
                writer,
                protocol::encode_error(&format!("unknown command '{}'", argv[0])),
            )
            .await?;
        }
    }

    Ok(Flow::Continue)
}

async fn handle_set(
    argv: &[String],
    store: &Store,
    role: &Role,
    writer: &mut OwnedWriteHalf,
) -> std::io::Result<()> {
    if argv.len() < 3 {
        return reply(
            writer,
            protocol::encode_error("wrong number of arguments for 'set' command"),
        )
        .await;
    }

    let mut ttl = None;
    if argv.len() == 5 && argv[3].eq_ignore_ascii_case("PX") {
        match argv[4].parse::<i64>() {
            Ok(millis) if millis > 0 => ttl = Some(Duration::from_millis(millis as u64)),
            // A non-positive PX behaves like no expiry at all.
            Ok(_) => {}
            Err(_) => {
                return reply(writer, protocol::encode_error("invalid PX value")).await;
            }
        }
    }

    store.set(&argv[1], &argv[2], ttl).await;
    reply(writer, protocol::encode_simple("OK")).await?;
    role.propagate(argv).await;
    Ok(())
}

async fn handle_wait(
    argv: &[String],
    role: &Role,
    writer: &mut OwnedWriteHalf,
) -> std::io::Result<()> {
    let primary = match role {
        Role::Primary(primary) => primary,
        Role::Replica => {
            return reply(writer, protocol::encode_error("WAIT only supported by leader")).await;
        }
    };

    if argv.len() < 3 {
        return reply(
            writer,
            protocol::encode_error("wrong number of arguments for 'wait' command"),
        )
        .await;
    }
    let num_replicas: usize = match argv[1].parse() {
        Ok(n) => n,
        Err(_) => {
            return reply(writer, protocol::encode_error("invalid number of replicas")).await;
        }
    };
    let timeout_ms: u64 = match argv[2].parse() {
        Ok(ms) => ms,
        Err(_) => return reply(writer, protocol::encode_error("invalid timeout")).await,
    };

    let acks = primary.wait_for_acks(num_replicas, timeout_ms).await;
    reply(writer, protocol::encode_integer(acks)).await
}

async fn reply(writer: &mut OwnedWriteHalf, frame: String) -> std::io::Result<()> {
    writer.write_all(frame.as_bytes()).await
}
