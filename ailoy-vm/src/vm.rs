//! The VM worker: hosts components, dispatches packets to operators and
//! component methods, streams multi-frame responses.
//!
//! Each packet fans out to its own task; per-component serialization comes
//! from an async mutex held for the duration of the method (including the
//! whole lifetime of an iterative stream). Cancellation stops scheduling
//! further steps after the current one completes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use ailoy_broker::packet::{Packet, PacketType};
use ailoy_broker::transport::{self, PacketSender, PeerKind};
use ailoy_broker::BrokerError;
use ailoy_types::{ComponentError, Value};

use crate::component::Component;
use crate::module::ModuleRegistry;

type ComponentCell = Arc<Mutex<Box<dyn Component>>>;
type ComponentMap = Arc<StdMutex<HashMap<Uuid, ComponentCell>>>;
type CancelMap = Arc<StdMutex<HashMap<u64, CancellationToken>>>;

/// Handle to a running VM worker.
#[derive(Debug)]
pub struct VmHandle {
    token: CancellationToken,
}

impl VmHandle {
    /// Stop the worker. In-flight method tasks finish their current step.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

impl Drop for VmHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Connect a VM serving `registry` to the broker at `url`.
pub fn spawn(url: &str, registry: ModuleRegistry) -> Result<VmHandle, BrokerError> {
    let conn = transport::connect(
        url,
        PeerKind::Vm {
            component_types: registry.component_types(),
            operators: registry.operator_names(),
        },
    )?;
    let token = CancellationToken::new();
    let worker_token = token.clone();
    tokio::spawn(async move {
        let worker = Worker {
            registry,
            reply: conn.sender,
            components: Arc::new(StdMutex::new(HashMap::new())),
            cancels: Arc::new(StdMutex::new(HashMap::new())),
        };
        let mut receiver = conn.receiver;
        loop {
            tokio::select! {
                _ = worker_token.cancelled() => break,
                next = receiver.recv() => {
                    match next {
                        Some(Ok(packet)) => worker.dispatch(packet),
                        Some(Err(e)) => warn!(error = %e, "vm dropped undecodable frame"),
                        None => break,
                    }
                }
            }
        }
        debug!("vm worker stopped");
    });
    Ok(VmHandle { token })
}

struct Worker {
    registry: ModuleRegistry,
    reply: PacketSender,
    components: ComponentMap,
    cancels: CancelMap,
}

impl Worker {
    fn dispatch(&self, packet: Packet) {
        match packet.ptype {
            PacketType::Define => self.handle_define(packet),
            PacketType::Delete => self.handle_delete(packet),
            PacketType::Call => self.handle_call(packet),
            PacketType::CallMethod => self.handle_call_method(packet),
            PacketType::IterMethod => self.handle_iter_method(packet),
            PacketType::Cancel => {
                let cancel = self
                    .cancels
                    .lock()
                    .expect("cancel table poisoned")
                    .get(&packet.tx_id)
                    .cloned();
                if let Some(token) = cancel {
                    token.cancel();
                }
            }
            other => debug!(ptype = ?other, "unexpected packet on vm connection"),
        }
    }

    fn handle_define(&self, packet: Packet) {
        let reply = self.reply.clone();
        let tx_id = packet.tx_id;
        let Some(id) = packet.component_id else {
            send_error(&reply, tx_id, ComponentError::validation("define requires a component id"));
            return;
        };
        let type_name = match packet.body.get("type").and_then(Value::as_str) {
            Some(t) => t.to_owned(),
            None => {
                send_error(&reply, tx_id, ComponentError::validation("define requires a type"));
                return;
            }
        };
        let attrs = packet.body.get("attrs").cloned().unwrap_or(Value::Null);

        if self
            .components
            .lock()
            .expect("component table poisoned")
            .contains_key(&id)
        {
            send_error(
                &reply,
                tx_id,
                ComponentError::already_exists(format!("component {id} already defined")),
            );
            return;
        }
        let Some(factory) = self.registry.factory(&type_name) else {
            send_error(
                &reply,
                tx_id,
                ComponentError::not_found(format!("unknown component type {type_name}")),
            );
            return;
        };

        let components = Arc::clone(&self.components);
        tokio::spawn(async move {
            match factory(attrs).await {
                Ok(component) => {
                    let mut table = components.lock().expect("component table poisoned");
                    if table.contains_key(&id) {
                        send_error(
                            &reply,
                            tx_id,
                            ComponentError::already_exists(format!(
                                "component {id} already defined"
                            )),
                        );
                        return;
                    }
                    table.insert(id, Arc::new(Mutex::new(component)));
                    drop(table);
                    debug!(component = %id, r#type = %type_name, "component defined");
                    send_ok(&reply, tx_id, Value::Null);
                }
                Err(err) => send_error(&reply, tx_id, err),
            }
        });
    }

    fn handle_delete(&self, packet: Packet) {
        let Some(id) = packet.component_id else {
            send_error(
                &self.reply,
                packet.tx_id,
                ComponentError::validation("delete requires a component id"),
            );
            return;
        };
        let removed = self
            .components
            .lock()
            .expect("component table poisoned")
            .remove(&id);
        match removed {
            Some(cell) => {
                let reply = self.reply.clone();
                let tx_id = packet.tx_id;
                tokio::spawn(async move {
                    // Wait for any in-flight method before tearing down.
                    let _guard = cell.lock().await;
                    drop(_guard);
                    drop(cell);
                    send_ok(&reply, tx_id, Value::Null);
                });
            }
            None => send_error(
                &self.reply,
                packet.tx_id,
                ComponentError::not_found(format!("unknown component {id}")),
            ),
        }
    }

    fn handle_call(&self, packet: Packet) {
        let reply = self.reply.clone();
        let tx_id = packet.tx_id;
        let Some(name) = packet.body.get("name").and_then(Value::as_str) else {
            send_error(&reply, tx_id, ComponentError::validation("call requires an operator name"));
            return;
        };
        let inputs = packet.body.get("inputs").cloned().unwrap_or(Value::Null);
        let Some(operator) = self.registry.operator(name) else {
            send_error(
                &reply,
                tx_id,
                ComponentError::not_found(format!("unknown operator {name}")),
            );
            return;
        };
        tokio::spawn(async move {
            match operator(inputs).await {
                Ok(value) => send_ok(&reply, tx_id, value),
                Err(err) => send_error(&reply, tx_id, err),
            }
        });
    }

    fn handle_call_method(&self, packet: Packet) {
        let reply = self.reply.clone();
        let tx_id = packet.tx_id;
        let (cell, method, inputs) = match self.resolve_method(&packet) {
            Ok(parts) => parts,
            Err(err) => {
                send_error(&reply, tx_id, err);
                return;
            }
        };
        tokio::spawn(async move {
            let mut component = cell.lock().await;
            match component.call_method(&method, inputs).await {
                Ok(value) => send_ok(&reply, tx_id, value),
                Err(err) => send_error(&reply, tx_id, err),
            }
        });
    }

    fn handle_iter_method(&self, packet: Packet) {
        let reply = self.reply.clone();
        let tx_id = packet.tx_id;
        let (cell, method, inputs) = match self.resolve_method(&packet) {
            Ok(parts) => parts,
            Err(err) => {
                send_error(&reply, tx_id, err);
                return;
            }
        };

        let token = CancellationToken::new();
        self.cancels
            .lock()
            .expect("cancel table poisoned")
            .insert(tx_id, token.clone());
        let cancels = Arc::clone(&self.cancels);

        tokio::spawn(async move {
            // The guard stays alive for the whole stream: one in-flight
            // method per component.
            let mut component = cell.lock().await;
            let outcome = component.iter_method(&method, inputs);
            match outcome {
                Ok(mut stream) => loop {
                    tokio::select! {
                        _ = token.cancelled() => {
                            send_error(&reply, tx_id, ComponentError::cancelled("stream cancelled"));
                            break;
                        }
                        frame = stream.next() => match frame {
                            Some(Ok(value)) => {
                                let _ = reply.send(&Packet::new(PacketType::Partial, tx_id, value));
                            }
                            Some(Err(err)) => {
                                send_error(&reply, tx_id, err);
                                break;
                            }
                            None => {
                                let _ = reply.send(&Packet::new(PacketType::Final, tx_id, Value::Null));
                                break;
                            }
                        }
                    }
                },
                Err(err) => send_error(&reply, tx_id, err),
            }
            cancels.lock().expect("cancel table poisoned").remove(&tx_id);
        });
    }

    fn resolve_method(
        &self,
        packet: &Packet,
    ) -> Result<(ComponentCell, String, Value), ComponentError> {
        let id = packet
            .component_id
            .ok_or_else(|| ComponentError::validation("missing component id"))?;
        let method = packet
            .body
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| ComponentError::validation("missing method name"))?
            .to_owned();
        let inputs = packet.body.get("inputs").cloned().unwrap_or(Value::Null);
        let cell = self
            .components
            .lock()
            .expect("component table poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| ComponentError::not_found(format!("unknown component {id}")))?;
        Ok((cell, method, inputs))
    }
}

fn send_ok(reply: &PacketSender, tx_id: u64, body: Value) {
    let _ = reply.send(&Packet::new(PacketType::Ok, tx_id, body));
}

fn send_error(reply: &PacketSender, tx_id: u64, err: ComponentError) {
    let body = serde_json::to_value(&err)
        .map(Value::from)
        .unwrap_or(Value::Null);
    let _ = reply.send(&Packet::new(PacketType::Error, tx_id, body));
}
