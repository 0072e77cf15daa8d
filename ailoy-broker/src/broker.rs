//! The broker event pump.
//!
//! A single task owns the routing state: which connections are clients,
//! which are VM workers, which VM hosts which component, and which
//! transactions are in flight. Requests are forwarded to the serving VM
//! under a broker-assigned transaction id; responses are rewritten back to
//! the originating client's id. Components are not assumed reentrant;
//! serialization happens VM-side, the broker only routes.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use ailoy_types::{ComponentError, Value};

use crate::error::BrokerError;
use crate::packet::{Packet, PacketType};
use crate::transport::{self, Connection, Incoming, PeerKind};

/// Handle to a running broker. Shut it down explicitly or let the facade's
/// process-wide registry do so when the last runtime drops.
#[derive(Debug)]
pub struct BrokerHandle {
    url: String,
    token: CancellationToken,
}

impl BrokerHandle {
    /// The endpoint URL this broker serves.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stop the pump and unbind the endpoint.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Spawn a broker bound to `url`.
pub fn spawn(url: &str) -> Result<BrokerHandle, BrokerError> {
    let listener = transport::bind(url)?;
    let token = CancellationToken::new();
    let pump_token = token.clone();
    let pump_url = url.to_owned();
    tokio::spawn(async move {
        Pump::new(pump_url).run(listener, pump_token).await;
    });
    Ok(BrokerHandle {
        url: url.to_owned(),
        token,
    })
}

enum Event {
    Received(u64, Packet),
    Closed(u64),
}

struct VmInfo {
    component_types: HashSet<String>,
    operators: HashSet<String>,
}

struct Route {
    client: u64,
    client_tx: u64,
    vm: u64,
    streaming: bool,
    defines: Option<Uuid>,
    deletes: Option<Uuid>,
}

struct Pump {
    url: String,
    conns: HashMap<u64, transport::PacketSender>,
    vms: HashMap<u64, VmInfo>,
    clients: HashSet<u64>,
    components: HashMap<Uuid, u64>,
    pending: HashMap<u64, Route>,
    reverse: HashMap<(u64, u64), u64>,
    next_conn: u64,
    next_tx: u64,
}

impl Pump {
    fn new(url: String) -> Self {
        Self {
            url,
            conns: HashMap::new(),
            vms: HashMap::new(),
            clients: HashSet::new(),
            components: HashMap::new(),
            pending: HashMap::new(),
            reverse: HashMap::new(),
            next_conn: 0,
            next_tx: 0,
        }
    }

    async fn run(mut self, mut listener: transport::Listener, token: CancellationToken) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                incoming = listener.accept() => {
                    match incoming {
                        Some(peer) => self.attach(peer, &event_tx),
                        None => break,
                    }
                }
                event = event_rx.recv() => {
                    match event {
                        Some(Event::Received(conn, packet)) => self.route(conn, packet),
                        Some(Event::Closed(conn)) => self.detach(conn),
                        None => break,
                    }
                }
            }
        }
        debug!(url = %self.url, "broker stopped");
    }

    fn attach(&mut self, peer: Incoming, events: &mpsc::UnboundedSender<Event>) {
        let id = self.next_conn;
        self.next_conn += 1;

        let Incoming { kind, conn } = peer;
        let Connection {
            sender,
            mut receiver,
        } = conn;
        self.conns.insert(id, sender);
        match kind {
            PeerKind::Client => {
                self.clients.insert(id);
                debug!(url = %self.url, conn = id, "client attached");
            }
            PeerKind::Vm {
                component_types,
                operators,
            } => {
                debug!(url = %self.url, conn = id, ?component_types, "vm attached");
                self.vms.insert(
                    id,
                    VmInfo {
                        component_types: component_types.into_iter().collect(),
                        operators: operators.into_iter().collect(),
                    },
                );
            }
        }

        let events = events.clone();
        tokio::spawn(async move {
            while let Some(result) = receiver.recv().await {
                match result {
                    Ok(packet) => {
                        if events.send(Event::Received(id, packet)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(conn = id, error = %e, "dropping undecodable frame");
                    }
                }
            }
            let _ = events.send(Event::Closed(id));
        });
    }

    fn detach(&mut self, conn: u64) {
        self.conns.remove(&conn);
        if self.vms.remove(&conn).is_some() {
            self.components.retain(|_, vm| *vm != conn);
            let failed: Vec<u64> = self
                .pending
                .iter()
                .filter(|(_, r)| r.vm == conn)
                .map(|(tx, _)| *tx)
                .collect();
            for tx in failed {
                if let Some(route) = self.pending.remove(&tx) {
                    self.reverse.remove(&(route.client, route.client_tx));
                    self.reply_error(
                        route.client,
                        route.client_tx,
                        ComponentError::transport("vm disconnected"),
                    );
                }
            }
        }
        if self.clients.remove(&conn) {
            let orphaned: Vec<u64> = self
                .pending
                .iter()
                .filter(|(_, r)| r.client == conn)
                .map(|(tx, _)| *tx)
                .collect();
            for tx in orphaned {
                if let Some(route) = self.pending.remove(&tx) {
                    self.reverse.remove(&(route.client, route.client_tx));
                    if route.streaming {
                        self.forward_to(
                            route.vm,
                            Packet::new(PacketType::Cancel, tx, Value::Null),
                        );
                    }
                }
            }
        }
    }

    fn route(&mut self, conn: u64, packet: Packet) {
        if packet.ptype.is_request() {
            self.route_request(conn, packet);
        } else {
            self.route_response(conn, packet);
        }
    }

    fn route_request(&mut self, client: u64, packet: Packet) {
        if packet.ptype == PacketType::Cancel {
            if let Some(&broker_tx) = self.reverse.get(&(client, packet.tx_id))
                && let Some(route) = self.pending.get(&broker_tx)
            {
                let vm = route.vm;
                self.forward_to(vm, Packet::new(PacketType::Cancel, broker_tx, Value::Null));
            }
            return;
        }

        let vm = match self.pick_vm(&packet) {
            Ok(vm) => vm,
            Err(err) => {
                self.reply_error(client, packet.tx_id, err);
                return;
            }
        };

        let broker_tx = self.next_tx;
        self.next_tx += 1;
        self.pending.insert(
            broker_tx,
            Route {
                client,
                client_tx: packet.tx_id,
                vm,
                streaming: packet.ptype == PacketType::IterMethod,
                defines: (packet.ptype == PacketType::Define)
                    .then_some(packet.component_id)
                    .flatten(),
                deletes: (packet.ptype == PacketType::Delete)
                    .then_some(packet.component_id)
                    .flatten(),
            },
        );
        self.reverse.insert((client, packet.tx_id), broker_tx);

        let mut forwarded = packet;
        forwarded.tx_id = broker_tx;
        self.forward_to(vm, forwarded);
    }

    fn pick_vm(&self, packet: &Packet) -> Result<u64, ComponentError> {
        match packet.ptype {
            PacketType::Define => {
                let type_name = packet
                    .body
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ComponentError::validation("define requires a type"))?;
                if packet.component_id.is_none() {
                    return Err(ComponentError::validation("define requires a component id"));
                }
                self.vms
                    .iter()
                    .find(|(_, info)| info.component_types.contains(type_name))
                    .map(|(id, _)| *id)
                    .ok_or_else(|| {
                        ComponentError::not_found(format!(
                            "no module provides component type {type_name}"
                        ))
                    })
            }
            PacketType::Call => {
                let name = packet
                    .body
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ComponentError::validation("call requires an operator name"))?;
                self.vms
                    .iter()
                    .find(|(_, info)| info.operators.contains(name))
                    .map(|(id, _)| *id)
                    .ok_or_else(|| {
                        ComponentError::not_found(format!("no module provides operator {name}"))
                    })
            }
            PacketType::Delete | PacketType::CallMethod | PacketType::IterMethod => {
                let id = packet
                    .component_id
                    .ok_or_else(|| ComponentError::validation("missing component id"))?;
                self.components
                    .get(&id)
                    .copied()
                    .ok_or_else(|| ComponentError::not_found(format!("unknown component {id}")))
            }
            _ => Err(ComponentError::validation("not a routable request")),
        }
    }

    fn route_response(&mut self, _vm: u64, packet: Packet) {
        let broker_tx = packet.tx_id;
        let terminal = !matches!(packet.ptype, PacketType::Partial);
        let route = if terminal {
            self.pending.remove(&packet.tx_id)
        } else {
            // Partial frames keep the route alive.
            self.pending.get(&packet.tx_id).map(|r| Route {
                client: r.client,
                client_tx: r.client_tx,
                vm: r.vm,
                streaming: r.streaming,
                defines: None,
                deletes: None,
            })
        };
        let Some(route) = route else {
            debug!(tx = packet.tx_id, "response for unknown transaction");
            return;
        };
        if terminal {
            self.reverse.remove(&(route.client, route.client_tx));
            if packet.ptype == PacketType::Ok {
                if let Some(id) = route.defines {
                    self.components.insert(id, route.vm);
                }
                if let Some(id) = route.deletes {
                    self.components.remove(&id);
                }
            }
        }

        let mut forwarded = packet;
        forwarded.tx_id = route.client_tx;
        let delivered = self
            .conns
            .get(&route.client)
            .map(|s| s.send(&forwarded).is_ok())
            .unwrap_or(false);
        if !delivered && route.streaming && !terminal {
            // Client vanished mid-stream; stop the producer.
            self.forward_to(
                route.vm,
                Packet::new(PacketType::Cancel, broker_tx, Value::Null),
            );
        }
    }

    fn forward_to(&mut self, conn: u64, packet: Packet) {
        if let Some(sender) = self.conns.get(&conn)
            && sender.send(&packet).is_err()
        {
            debug!(conn, "peer gone while forwarding");
        }
    }

    fn reply_error(&mut self, client: u64, tx_id: u64, err: ComponentError) {
        let body = serde_json::to_value(&err)
            .map(Value::from)
            .unwrap_or(Value::Null);
        self.forward_to(client, Packet::new(PacketType::Error, tx_id, body));
    }
}
