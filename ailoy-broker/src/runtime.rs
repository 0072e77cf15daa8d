//! The runtime client: the host-facing handle onto a broker endpoint.
//!
//! A [`Runtime`] owns one client connection. A background reader demuxes
//! response packets to their waiting transactions: instant calls resolve a
//! oneshot, iterative calls feed an ordered [`FrameStream`]. Dropping a
//! stream before its final frame sends a cancel packet so the VM stops
//! scheduling further steps.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use ailoy_types::{ComponentError, Value};

use crate::error::BrokerError;
use crate::packet::{Packet, PacketType};
use crate::transport::{self, PacketSender, PeerKind};

enum Pending {
    Once(oneshot::Sender<Result<Value, ComponentError>>),
    Stream(mpsc::UnboundedSender<Result<Value, ComponentError>>),
}

struct Shared {
    sender: PacketSender,
    next_tx: AtomicU64,
    pending: StdMutex<HashMap<u64, Pending>>,
}

impl Shared {
    fn begin_once(&self) -> (u64, oneshot::Receiver<Result<Value, ComponentError>>) {
        let tx_id = self.next_tx.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending table poisoned")
            .insert(tx_id, Pending::Once(tx));
        (tx_id, rx)
    }

    fn begin_stream(&self) -> (u64, mpsc::UnboundedReceiver<Result<Value, ComponentError>>) {
        let tx_id = self.next_tx.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending
            .lock()
            .expect("pending table poisoned")
            .insert(tx_id, Pending::Stream(tx));
        (tx_id, rx)
    }

    fn abandon(&self, tx_id: u64) {
        self.pending
            .lock()
            .expect("pending table poisoned")
            .remove(&tx_id);
    }
}

/// Client handle onto a broker endpoint. Cheap to clone; the underlying
/// connection closes when the last clone drops.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
    _reader: Arc<ReaderGuard>,
}

struct ReaderGuard(tokio::task::JoinHandle<()>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Runtime {
    /// Connect to the broker at `url` as a client.
    pub fn connect(url: &str) -> Result<Self, BrokerError> {
        let conn = transport::connect(url, PeerKind::Client)?;
        let shared = Arc::new(Shared {
            sender: conn.sender,
            next_tx: AtomicU64::new(0),
            pending: StdMutex::new(HashMap::new()),
        });

        let reader_shared = Arc::clone(&shared);
        let mut receiver = conn.receiver;
        let reader = tokio::spawn(async move {
            while let Some(result) = receiver.recv().await {
                let packet = match result {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(error = %e, "client dropped undecodable frame");
                        continue;
                    }
                };
                dispatch(&reader_shared, packet);
            }
            // Connection gone: fail everything still pending.
            let mut pending = reader_shared.pending.lock().expect("pending table poisoned");
            for (_, entry) in pending.drain() {
                let err = ComponentError::transport("connection closed");
                match entry {
                    Pending::Once(tx) => {
                        let _ = tx.send(Err(err));
                    }
                    Pending::Stream(tx) => {
                        let _ = tx.send(Err(err));
                    }
                }
            }
        });

        Ok(Self {
            shared,
            _reader: Arc::new(ReaderGuard(reader)),
        })
    }

    /// Create a component of `type_name` with the given attributes,
    /// returning its id.
    pub async fn define_component(
        &self,
        type_name: &str,
        attrs: Value,
    ) -> Result<Uuid, BrokerError> {
        let id = Uuid::new_v4();
        self.define_component_with_id(id, type_name, attrs).await?;
        Ok(id)
    }

    /// Create a component under a caller-chosen id.
    pub async fn define_component_with_id(
        &self,
        id: Uuid,
        type_name: &str,
        attrs: Value,
    ) -> Result<(), BrokerError> {
        let body = Value::map([
            ("type", Value::from(type_name)),
            ("attrs", attrs),
        ]);
        let (tx_id, rx) = self.shared.begin_once();
        self.shared
            .sender
            .send(&Packet::to_component(PacketType::Define, tx_id, id, body))?;
        await_once(&self.shared, tx_id, rx).await?;
        Ok(())
    }

    /// Destroy a component.
    pub async fn delete_component(&self, id: Uuid) -> Result<(), BrokerError> {
        let (tx_id, rx) = self.shared.begin_once();
        self.shared.sender.send(&Packet::to_component(
            PacketType::Delete,
            tx_id,
            id,
            Value::Null,
        ))?;
        await_once(&self.shared, tx_id, rx).await?;
        Ok(())
    }

    /// Invoke a stateless module operator.
    pub async fn call(&self, name: &str, inputs: Value) -> Result<Value, BrokerError> {
        let body = Value::map([("name", Value::from(name)), ("inputs", inputs)]);
        let (tx_id, rx) = self.shared.begin_once();
        self.shared
            .sender
            .send(&Packet::new(PacketType::Call, tx_id, body))?;
        await_once(&self.shared, tx_id, rx).await
    }

    /// Invoke an instant component method: exactly one response frame.
    pub async fn call_method(
        &self,
        id: Uuid,
        method: &str,
        inputs: Value,
    ) -> Result<Value, BrokerError> {
        let body = Value::map([("method", Value::from(method)), ("inputs", inputs)]);
        let (tx_id, rx) = self.shared.begin_once();
        self.shared.sender.send(&Packet::to_component(
            PacketType::CallMethod,
            tx_id,
            id,
            body,
        ))?;
        await_once(&self.shared, tx_id, rx).await
    }

    /// Invoke an iterative component method, returning the ordered frame
    /// stream. Dropping the stream early cancels the call.
    pub fn iter_method(&self, id: Uuid, method: &str, inputs: Value) -> FrameStream {
        let body = Value::map([("method", Value::from(method)), ("inputs", inputs)]);
        let (tx_id, rx) = self.shared.begin_stream();
        let send_result = self.shared.sender.send(&Packet::to_component(
            PacketType::IterMethod,
            tx_id,
            id,
            body,
        ));
        if let Err(e) = send_result {
            self.shared.abandon(tx_id);
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(Err(ComponentError::from(e)));
            return FrameStream {
                rx,
                tx_id,
                shared: Arc::clone(&self.shared),
                finished: false,
            };
        }
        FrameStream {
            rx,
            tx_id,
            shared: Arc::clone(&self.shared),
            finished: false,
        }
    }
}

fn dispatch(shared: &Shared, packet: Packet) {
    let mut pending = shared.pending.lock().expect("pending table poisoned");
    match packet.ptype {
        PacketType::Ok => {
            if let Some(Pending::Once(tx)) = pending.remove(&packet.tx_id) {
                let _ = tx.send(Ok(packet.body));
            }
        }
        PacketType::Error => {
            let err = decode_error(&packet.body);
            match pending.remove(&packet.tx_id) {
                Some(Pending::Once(tx)) => {
                    let _ = tx.send(Err(err));
                }
                Some(Pending::Stream(tx)) => {
                    let _ = tx.send(Err(err));
                }
                None => {}
            }
        }
        PacketType::Partial => {
            if let Some(Pending::Stream(tx)) = pending.get(&packet.tx_id)
                && tx.send(Ok(packet.body)).is_err()
            {
                pending.remove(&packet.tx_id);
            }
        }
        PacketType::Final => {
            // Dropping the sender closes the stream after queued frames.
            pending.remove(&packet.tx_id);
        }
        other => debug!(ptype = ?other, "unexpected packet on client connection"),
    }
}

fn decode_error(body: &Value) -> ComponentError {
    serde_json::to_value(body)
        .ok()
        .and_then(|v| serde_json::from_value::<ComponentError>(v).ok())
        .unwrap_or_else(|| ComponentError::transport("malformed error body"))
}

async fn await_once(
    shared: &Shared,
    tx_id: u64,
    rx: oneshot::Receiver<Result<Value, ComponentError>>,
) -> Result<Value, BrokerError> {
    match rx.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(BrokerError::Component(err)),
        Err(_) => {
            shared.abandon(tx_id);
            Err(BrokerError::ConnectionClosed)
        }
    }
}

/// Ordered frames of an iterative method call.
///
/// Yields each `partial` body; ends cleanly after the `final` packet, or
/// with one `Err` item on an `error` packet. Dropping before the end sends
/// a cancel.
pub struct FrameStream {
    rx: mpsc::UnboundedReceiver<Result<Value, ComponentError>>,
    tx_id: u64,
    shared: Arc<Shared>,
    finished: bool,
}

impl Stream for FrameStream {
    type Item = Result<Value, ComponentError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.rx.poll_recv(cx);
        if let Poll::Ready(item) = &polled {
            match item {
                None | Some(Err(_)) => this.finished = true,
                Some(Ok(_)) => {}
            }
        }
        polled
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.abandon(self.tx_id);
            let _ = self
                .shared
                .sender
                .send(&Packet::new(PacketType::Cancel, self.tx_id, Value::Null));
        }
    }
}
