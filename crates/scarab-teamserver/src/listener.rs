//! Named beacon listeners: dual TCP/UDP endpoints bound on demand.
//!
//! Each listener binds a TCP listener and a UDP socket on the same
//! address. Accepted TCP connections get their own task; reads deliver one
//! whole frame per call to the handler (the beacon writes one message per
//! send), replies and pushed frames drain through a serialized writer.
//! Every UDP datagram is one frame, answered with a single `send_to`.
//!
//! Listeners are tracked by name. `stop` signals the endpoint worker and
//! waits for it to drain; the worker removes its own registry entry on the
//! way out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use scarab_core::messages::ServerItem;
use scarab_core::session::{ConnContext, ConnHandle};

use crate::handler::BeaconHandler;

/// Largest UDP datagram we accept.
const MAX_DATAGRAM: usize = 65_535;

/// Initial read buffer size for TCP connections.
const READ_BUF_SIZE: usize = 8 * 1024;

/// Errors from listener management.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// A listener with this name is already running.
    #[error("duplicate listener name: {name}")]
    Duplicate {
        /// The contested name.
        name: String,
    },

    /// No listener with this name is running.
    #[error("no listener named {name} is running")]
    NotRunning {
        /// The unknown name.
        name: String,
    },

    /// The endpoint could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying socket error.
        source: std::io::Error,
    },
}

struct ListenerEntry {
    addr: String,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Registry of running beacon listeners.
#[derive(Default)]
pub struct ListenerManager {
    listeners: Arc<RwLock<HashMap<String, ListenerEntry>>>,
}

impl ListenerManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a named dual TCP/UDP listener at `addr`, wired to `handler`.
    ///
    /// The recorded address is the resolved local address, so binding port
    /// 0 yields the actual port in [`ListenerManager::list`].
    ///
    /// # Errors
    ///
    /// [`ListenerError::Duplicate`] when `name` is already running,
    /// [`ListenerError::Bind`] when either socket cannot be bound.
    pub async fn start(
        &self,
        name: &str,
        addr: &str,
        handler: Arc<BeaconHandler>,
    ) -> Result<(), ListenerError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Reserve the name first so concurrent starts cannot both bind.
        {
            let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
            if listeners.contains_key(name) {
                return Err(ListenerError::Duplicate {
                    name: name.to_string(),
                });
            }
            listeners.insert(
                name.to_string(),
                ListenerEntry {
                    addr: addr.to_string(),
                    shutdown: shutdown_tx,
                    worker: Mutex::new(None),
                },
            );
        }

        let bound = async {
            let tcp = TcpListener::bind(addr).await?;
            let local = tcp.local_addr()?;
            // TCP and UDP port namespaces are independent, so the resolved
            // port is reusable for the datagram side.
            let udp = UdpSocket::bind(local).await?;
            Ok::<_, std::io::Error>((tcp, udp, local))
        }
        .await;

        let (tcp, udp, local) = match bound {
            Ok(sockets) => sockets,
            Err(source) => {
                let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
                listeners.remove(name);
                return Err(ListenerError::Bind {
                    addr: addr.to_string(),
                    source,
                });
            }
        };

        info!(name, addr = %local, "beacon listener started");

        let worker = tokio::spawn(endpoint_worker(
            name.to_string(),
            Arc::clone(&self.listeners),
            tcp,
            udp,
            handler,
            shutdown_rx,
        ));

        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = listeners.get_mut(name) {
            entry.addr = local.to_string();
            *entry.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker);
        }
        Ok(())
    }

    /// Stops the named listener and waits for its worker to drain.
    ///
    /// # Errors
    ///
    /// [`ListenerError::NotRunning`] when `name` is unknown.
    pub async fn stop(&self, name: &str) -> Result<(), ListenerError> {
        let worker = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            let entry = listeners.get(name).ok_or_else(|| ListenerError::NotRunning {
                name: name.to_string(),
            })?;
            let _ = entry.shutdown.send(true);
            let taken = entry.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
            taken
        };

        if let Some(worker) = worker {
            let _ = worker.await;
        }
        Ok(())
    }

    /// Snapshot of running listeners, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<ServerItem> {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        let mut items: Vec<ServerItem> = listeners
            .iter()
            .map(|(name, entry)| ServerItem {
                name: name.clone(),
                addr: entry.addr.clone(),
            })
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        items
    }
}

/// Accept loop for one named endpoint. Removes its registry entry on exit.
async fn endpoint_worker(
    name: String,
    listeners: Arc<RwLock<HashMap<String, ListenerEntry>>>,
    tcp: TcpListener,
    udp: UdpSocket,
    handler: Arc<BeaconHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let udp = Arc::new(udp);
    let mut datagram = vec![0u8; MAX_DATAGRAM];
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            accepted = tcp.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(listener = %name, %peer, "beacon connected");
                    connections.spawn(serve_tcp_conn(
                        stream,
                        peer,
                        Arc::clone(&handler),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(listener = %name, error = %e, "accept failed"),
            },

            received = udp.recv_from(&mut datagram) => match received {
                Ok((len, peer)) => {
                    handle_datagram(&handler, &udp, peer, &datagram[..len]).await;
                }
                Err(e) => warn!(listener = %name, error = %e, "datagram receive failed"),
            },
        }
    }

    // Drain per-connection tasks; each observes the same shutdown signal.
    while connections.join_next().await.is_some() {}

    let mut map = listeners.write().unwrap_or_else(|e| e.into_inner());
    map.remove(&name);
    info!(listener = %name, "beacon listener stopped");
}

/// One UDP datagram in, at most one datagram out.
async fn handle_datagram(
    handler: &Arc<BeaconHandler>,
    socket: &Arc<UdpSocket>,
    peer: SocketAddr,
    frame: &[u8],
) {
    let conn = ConnHandle::udp(peer, Arc::clone(socket));
    // Datagram "connections" are one frame long; the context never sees a
    // close event.
    let ctx = ConnContext::new();
    match handler.on_message(frame, &conn, &ctx) {
        Ok(reply) => {
            if let Err(e) = socket.send_to(&reply, peer).await {
                warn!(%peer, error = %e, "datagram reply failed");
            }
        }
        Err(e) => warn!(%peer, error = %e, "dropping datagram"),
    }
}

/// Read loop for one TCP beacon connection.
async fn serve_tcp_conn(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<BeaconHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, writer) = stream.into_split();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(drain_writes(writer, writer_rx, peer));

    let conn = ConnHandle::tcp(peer, writer_tx);
    let ctx = ConnContext::new();

    read_frames(&mut reader, &conn, &ctx, &handler, &mut shutdown, peer).await;

    handler.on_close(&ctx);
    // Dropping the handle closes the writer channel and ends the task.
    drop(conn);
    let _ = writer_task.await;
    debug!(%peer, "beacon disconnected");
}

async fn read_frames(
    reader: &mut OwnedReadHalf,
    conn: &ConnHandle,
    ctx: &ConnContext,
    handler: &Arc<BeaconHandler>,
    shutdown: &mut watch::Receiver<bool>,
    peer: SocketAddr,
) {
    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,

            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => return,
                Ok(_) => {
                    // One read, one frame: the beacon writes one message
                    // per send and frames carry no length prefix on TCP.
                    let frame = buf.split();
                    match handler.on_message(&frame, conn, ctx) {
                        Ok(reply) => {
                            if conn.send(reply).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(%peer, error = %e, "closing beacon connection");
                            return;
                        }
                    }
                }
                Err(e) => {
                    debug!(%peer, error = %e, "read failed");
                    return;
                }
            },
        }
    }
}

/// Serializes all writes to one connection.
async fn drain_writes(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<bytes::Bytes>,
    peer: SocketAddr,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = writer.write_all(&chunk).await {
            debug!(%peer, error = %e, "write failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use scarab_core::bus::MessageBus;
    use scarab_core::crypto::RsaKeyPair;
    use scarab_core::session::SessionRegistry;

    use super::*;
    use crate::store::{SqliteStore, Store};

    fn test_handler() -> Arc<BeaconHandler> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        Arc::new(BeaconHandler::new(
            Arc::new(RsaKeyPair::generate(1024).unwrap()),
            Arc::new(SessionRegistry::new()),
            store,
            MessageBus::new(),
        ))
    }

    #[tokio::test]
    async fn lifecycle_start_duplicate_list_stop() {
        let manager = ListenerManager::new();
        let handler = test_handler();

        manager
            .start("L1", "127.0.0.1:0", Arc::clone(&handler))
            .await
            .unwrap();

        let err = manager
            .start("L1", "127.0.0.1:0", Arc::clone(&handler))
            .await
            .unwrap_err();
        assert!(matches!(err, ListenerError::Duplicate { name } if name == "L1"));

        let running = manager.list();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "L1");
        assert_ne!(running[0].addr, "127.0.0.1:0");

        manager.stop("L1").await.unwrap();
        assert!(manager.list().is_empty());

        let err = manager.stop("L1").await.unwrap_err();
        assert!(matches!(err, ListenerError::NotRunning { name } if name == "L1"));
    }

    #[tokio::test]
    async fn distinct_names_run_side_by_side() {
        let manager = ListenerManager::new();
        let handler = test_handler();

        manager
            .start("L1", "127.0.0.1:0", Arc::clone(&handler))
            .await
            .unwrap();
        manager
            .start("L2", "127.0.0.1:0", Arc::clone(&handler))
            .await
            .unwrap();

        let names: Vec<_> = manager.list().into_iter().map(|item| item.name).collect();
        assert_eq!(names, ["L1", "L2"]);

        manager.stop("L1").await.unwrap();
        manager.stop("L2").await.unwrap();
    }

    #[tokio::test]
    async fn bind_failure_releases_the_name() {
        let manager = ListenerManager::new();
        let handler = test_handler();

        let err = manager
            .start("L1", "256.0.0.1:0", Arc::clone(&handler))
            .await
            .unwrap_err();
        assert!(matches!(err, ListenerError::Bind { .. }));

        // The name is free again.
        manager
            .start("L1", "127.0.0.1:0", Arc::clone(&handler))
            .await
            .unwrap();
        manager.stop("L1").await.unwrap();
    }
}
