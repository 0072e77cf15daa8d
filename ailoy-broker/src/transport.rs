//! Named in-process transport.
//!
//! Endpoints are registered in a process-wide table under `inproc://<name>`
//! URLs. A connection is a pair of unbounded byte channels carrying encoded
//! packet frames, so the wire codec is exercised even without a socket.
//! The transport is a seam: a TCP implementation would reuse [`Packet`]'s
//! framing unchanged.

use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, OnceLock};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::error::BrokerError;
use crate::packet::Packet;

/// What a connecting peer is, declared at handshake time.
#[derive(Debug, Clone)]
pub enum PeerKind {
    /// A runtime client issuing requests.
    Client,
    /// A VM worker serving modules.
    Vm {
        /// Component types this VM can instantiate.
        component_types: Vec<String>,
        /// Stateless operators this VM serves.
        operators: Vec<String>,
    },
}

/// Send half of a connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PacketSender {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl PacketSender {
    /// Encode and send one packet. Fails when the peer is gone.
    pub fn send(&self, packet: &Packet) -> Result<(), BrokerError> {
        self.tx
            .send(packet.encode())
            .map_err(|_| BrokerError::ConnectionClosed)
    }
}

/// Receive half of a connection, with the frame reassembly buffer.
#[derive(Debug)]
pub struct PacketReceiver {
    rx: mpsc::UnboundedReceiver<Bytes>,
    buf: BytesMut,
}

impl PacketReceiver {
    /// Receive the next packet. `None` when the peer closed.
    pub async fn recv(&mut self) -> Option<Result<Packet, BrokerError>> {
        loop {
            match Packet::decode(&mut self.buf) {
                Ok(Some(packet)) => return Some(Ok(packet)),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }
            match self.rx.recv().await {
                Some(frame) => self.buf.extend_from_slice(&frame),
                None => return None,
            }
        }
    }
}

/// A bidirectional packet connection.
#[derive(Debug)]
pub struct Connection {
    /// Send half.
    pub sender: PacketSender,
    /// Receive half.
    pub receiver: PacketReceiver,
}

/// A freshly accepted peer.
#[derive(Debug)]
pub struct Incoming {
    /// What the peer declared itself to be.
    pub kind: PeerKind,
    /// The broker-side end of the connection.
    pub conn: Connection,
}

/// Accept side of a bound endpoint. Dropping it unbinds the URL.
#[derive(Debug)]
pub struct Listener {
    url: String,
    rx: mpsc::UnboundedReceiver<Incoming>,
}

impl Listener {
    /// Wait for the next peer. `None` once the endpoint is unreachable.
    pub async fn accept(&mut self) -> Option<Incoming> {
        self.rx.recv().await
    }

    /// The URL this listener is bound to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(endpoints) = ENDPOINTS.get() {
            endpoints.lock().expect("endpoint table poisoned").remove(&self.url);
        }
    }
}

static ENDPOINTS: OnceLock<StdMutex<HashMap<String, mpsc::UnboundedSender<Incoming>>>> =
    OnceLock::new();

fn endpoints() -> &'static StdMutex<HashMap<String, mpsc::UnboundedSender<Incoming>>> {
    ENDPOINTS.get_or_init(|| StdMutex::new(HashMap::new()))
}

fn channel_pair() -> (Connection, Connection) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let left = Connection {
        sender: PacketSender { tx: a_tx },
        receiver: PacketReceiver {
            rx: b_rx,
            buf: BytesMut::new(),
        },
    };
    let right = Connection {
        sender: PacketSender { tx: b_tx },
        receiver: PacketReceiver {
            rx: a_rx,
            buf: BytesMut::new(),
        },
    };
    (left, right)
}

/// Bind an endpoint URL, returning its listener.
///
/// # Errors
///
/// Fails when the URL is already bound.
pub fn bind(url: &str) -> Result<Listener, BrokerError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut table = endpoints().lock().expect("endpoint table poisoned");
    if table.contains_key(url) {
        return Err(BrokerError::Codec(format!("endpoint {url} already bound")));
    }
    table.insert(url.to_owned(), tx);
    Ok(Listener {
        url: url.to_owned(),
        rx,
    })
}

/// Connect to a bound endpoint, declaring the peer kind.
pub fn connect(url: &str, kind: PeerKind) -> Result<Connection, BrokerError> {
    let accept_tx = {
        let table = endpoints().lock().expect("endpoint table poisoned");
        table
            .get(url)
            .cloned()
            .ok_or_else(|| BrokerError::EndpointNotFound(url.to_owned()))?
    };
    let (peer_side, broker_side) = channel_pair();
    accept_tx
        .send(Incoming {
            kind,
            conn: broker_side,
        })
        .map_err(|_| BrokerError::EndpointNotFound(url.to_owned()))?;
    Ok(peer_side)
}

/// True when an endpoint is currently bound at `url`.
pub fn is_bound(url: &str) -> bool {
    endpoints()
        .lock()
        .expect("endpoint table poisoned")
        .contains_key(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use ailoy_types::Value;

    #[tokio::test]
    async fn connect_send_receive() {
        let mut listener = bind("inproc://t-basic").unwrap();
        let client = connect("inproc://t-basic", PeerKind::Client).unwrap();

        let mut accepted = listener.accept().await.unwrap();
        client
            .sender
            .send(&Packet::new(PacketType::Call, 1, Value::from("ping")))
            .unwrap();

        let got = accepted.conn.receiver.recv().await.unwrap().unwrap();
        assert_eq!(got.tx_id, 1);
        assert_eq!(got.body.as_str(), Some("ping"));
    }

    #[tokio::test]
    async fn connect_to_unbound_url_fails() {
        let err = connect("inproc://t-missing", PeerKind::Client).unwrap_err();
        assert!(matches!(err, BrokerError::EndpointNotFound(_)));
    }

    #[tokio::test]
    async fn drop_unbinds() {
        {
            let _listener = bind("inproc://t-drop").unwrap();
            assert!(is_bound("inproc://t-drop"));
        }
        assert!(!is_bound("inproc://t-drop"));
    }

    #[tokio::test]
    async fn receiver_reassembles_across_frames() {
        let mut listener = bind("inproc://t-frames").unwrap();
        let client = connect("inproc://t-frames", PeerKind::Client).unwrap();
        let mut accepted = listener.accept().await.unwrap();

        for i in 0..3u64 {
            client
                .sender
                .send(&Packet::new(PacketType::Partial, i, Value::Int(i as i64)))
                .unwrap();
        }
        for i in 0..3u64 {
            let got = accepted.conn.receiver.recv().await.unwrap().unwrap();
            assert_eq!(got.tx_id, i);
        }
    }
}
