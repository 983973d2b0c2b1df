//! `TcpConvergenceLayer`: the `dtn_daemon::ConvergenceLayer` implementation
//! realized over TCP (§4.5). Owns the listener and the table of open
//! per-link connections; dispatches `send_bundle`/`cancel_bundle` into the
//! relevant connection's command channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dtn_core::{Bundle, BundleId, DtnResult, EndpointId};
use dtn_daemon::{ContactId, ConvergenceLayer, Event, EventSender, LinkId, LinkParams};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::connection::{self, Command, ConnectionParams};
use crate::error::ClError;

struct OpenConnection {
    contact: ContactId,
    cmd_tx: mpsc::Sender<Command>,
}

pub struct TcpConvergenceLayer {
    local_eid: EndpointId,
    events: EventSender,
    /// Nexthop `host:port` and tunables registered per link via `init_link`;
    /// used both to dial out on `open_contact` and to match an inbound
    /// connection's peer address back to a known link.
    nexthops: Arc<Mutex<HashMap<LinkId, (String, LinkParams)>>>,
    connections: Arc<Mutex<HashMap<LinkId, OpenConnection>>>,
    next_contact_id: Arc<AtomicU64>,
    listener_cancel: Arc<Mutex<Option<CancellationToken>>>,
}

impl TcpConvergenceLayer {
    pub fn new(local_eid: EndpointId, events: EventSender) -> Self {
        TcpConvergenceLayer {
            local_eid,
            events,
            nexthops: Arc::new(Mutex::new(HashMap::new())),
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_contact_id: Arc::new(AtomicU64::new(1)),
            listener_cancel: Arc::new(Mutex::new(None)),
        }
    }
}

fn connection_params(params: &LinkParams) -> ConnectionParams {
    ConnectionParams {
        block_length: params.block_length,
        keepalive_interval: params.keepalive_interval,
        data_timeout: params.data_timeout,
        reactive_frag_enabled: params.reactive_frag_enabled,
        block_ack_enabled: true,
    }
}

#[async_trait]
impl ConvergenceLayer for TcpConvergenceLayer {
    fn name(&self) -> &str {
        "tcp"
    }

    /// Binds `local_spec` (a `host:port` pair) and accepts connections in a
    /// background task. An accepted connection is matched against a link
    /// whose registered nexthop equals the peer address; an unmatched peer
    /// is offered an `Opportunistic` link minted on the fly via
    /// `Event::LinkCreateOpportunistic` rather than dropped, per §4.4.
    async fn interface_up(&self, local_spec: &str) -> DtnResult<()> {
        let listener = TcpListener::bind(local_spec).await.map_err(ClError::Io)?;
        let cancel = CancellationToken::new();
        *self.listener_cancel.lock().await = Some(cancel.clone());

        let nexthops = self.nexthops.clone();
        let connections = self.connections.clone();
        let next_contact_id = self.next_contact_id.clone();
        let events = self.events.clone();
        let local_eid = self.local_eid.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                log::warn!("tcp cl: accept failed: {err}");
                                continue;
                            }
                        };
                        let peer_addr = peer.to_string();
                        let found = {
                            let table = nexthops.lock().await;
                            table.iter().find(|(_, (addr, _))| addr.as_str() == peer_addr).map(|(l, (_, p))| (*l, p.clone()))
                        };
                        let (link, params) = match found {
                            Some(hit) => hit,
                            None => {
                                log::info!("tcp cl: inbound connection from unregistered peer {peer}, minting an opportunistic link");
                                let (tx, rx) = oneshot::channel();
                                if events
                                    .push(Event::LinkCreateOpportunistic {
                                        nexthop: peer_addr.clone(),
                                        clayer: "tcp".to_string(),
                                        reply: Some(tx),
                                    })
                                    .await
                                    .is_err()
                                {
                                    continue;
                                }
                                let Ok(link) = rx.await else { continue };
                                let params = LinkParams::default();
                                nexthops.lock().await.insert(link, (peer_addr.clone(), params.clone()));
                                (link, params)
                            }
                        };
                        if connections.lock().await.contains_key(&link) {
                            log::warn!("link {link}: inbound connection while one is already open, dropping");
                            continue;
                        }
                        let (prep_tx, prep_rx) = oneshot::channel();
                        if events.push(Event::LinkPrepareInbound { link, reply: Some(prep_tx) }).await.is_err() {
                            continue;
                        }
                        if prep_rx.await.is_err() {
                            log::warn!("link {link}: not ready for an inbound contact, dropping");
                            continue;
                        }
                        let contact = next_contact_id.fetch_add(1, Ordering::Relaxed);
                        let (cmd_tx, cmd_rx) = mpsc::channel(32);
                        let conn_cancel = CancellationToken::new();
                        connection::spawn(
                            stream,
                            link,
                            contact,
                            local_eid.clone(),
                            connection_params(&params),
                            events.clone(),
                            cmd_rx,
                            conn_cancel,
                        );
                        connections.lock().await.insert(link, OpenConnection { contact, cmd_tx });
                    }
                }
            }
        });
        Ok(())
    }

    async fn interface_down(&self, _local_spec: &str) -> DtnResult<()> {
        if let Some(cancel) = self.listener_cancel.lock().await.take() {
            cancel.cancel();
        }
        Ok(())
    }

    async fn init_link(&self, link: LinkId, nexthop: &str, params: LinkParams) -> DtnResult<()> {
        self.nexthops.lock().await.insert(link, (nexthop.to_string(), params));
        Ok(())
    }

    async fn open_contact(&self, link: LinkId) -> DtnResult<()> {
        let (nexthop, params) = self
            .nexthops
            .lock()
            .await
            .get(&link)
            .cloned()
            .ok_or(ClError::NoConnection(link))?;
        if self.connections.lock().await.contains_key(&link) {
            return Err(ClError::AlreadyConnected(link).into());
        }

        let events = self.events.clone();
        let local_eid = self.local_eid.clone();
        let connections = self.connections.clone();
        let next_contact_id = self.next_contact_id.clone();

        tokio::spawn(async move {
            match TcpStream::connect(&nexthop).await {
                Ok(stream) => {
                    let contact = next_contact_id.fetch_add(1, Ordering::Relaxed);
                    let (cmd_tx, cmd_rx) = mpsc::channel(32);
                    let cancel = CancellationToken::new();
                    connection::spawn(
                        stream,
                        link,
                        contact,
                        local_eid,
                        connection_params(&params),
                        events,
                        cmd_rx,
                        cancel,
                    );
                    connections.lock().await.insert(link, OpenConnection { contact, cmd_tx });
                }
                Err(err) => {
                    log::warn!("link {link}: connect to {nexthop} failed: {err}");
                    let _ = events.push(Event::ContactOpenFailed { link }).await;
                }
            }
        });
        Ok(())
    }

    async fn close_contact(&self, link: LinkId, _contact: ContactId) -> DtnResult<()> {
        let conn = self.connections.lock().await.remove(&link);
        match conn {
            Some(conn) => {
                let _ = conn.cmd_tx.send(Command::Close).await;
                Ok(())
            }
            None => Err(ClError::NoConnection(link).into()),
        }
    }

    async fn send_bundle(&self, contact: ContactId, bundle: Bundle) -> DtnResult<()> {
        let connections = self.connections.lock().await;
        let conn = connections
            .values()
            .find(|c| c.contact == contact)
            .ok_or(ClError::NoSuchContact(contact))?;
        conn.cmd_tx
            .send(Command::Send(Box::new(bundle)))
            .await
            .map_err(|_| ClError::Closed)?;
        Ok(())
    }

    async fn cancel_bundle(&self, contact: ContactId, bundle_id: BundleId) -> DtnResult<()> {
        let connections = self.connections.lock().await;
        let conn = connections
            .values()
            .find(|c| c.contact == contact)
            .ok_or(ClError::NoSuchContact(contact))?;
        conn.cmd_tx
            .send(Command::Cancel(bundle_id))
            .await
            .map_err(|_| ClError::Closed)?;
        Ok(())
    }
}
