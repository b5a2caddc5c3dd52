//! Peer network: authenticated point-to-point replica links.
//!
//! Every replica listens on its configured address and dials every other
//! replica. The first frame on a dialed link is `HELLO` carrying the
//! dialer's replica id, which tags all traffic read from the inbound side;
//! an id outside the replica set closes the connection. Outbound links
//! reconnect with a fixed backoff, so transient failures cost at most the
//! messages written while the link was down - the fetch engine re-requests
//! anything that mattered.
//!
//! Frames from a single peer are decoded and forwarded in arrival order;
//! interleaving across peers is arbitrary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use threechain_core::{Event, OutboundMessage};
use threechain_types::{ReplicaId, ReplicaSet};
use threechain_wire::{decode_frame_header, PeerMessage, WireError, FRAME_HEADER_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Errors from the peer network.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("no address configured for replica {0}")]
    UnknownReplica(ReplicaId),

    #[error("peer sent an unexpected first frame")]
    MissingHello,
}

/// Delay between outbound reconnection attempts.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Outbound queue depth per peer.
const PEER_QUEUE: usize = 1024;

/// Handle to the spawned peer network.
pub struct PeerNetwork {
    senders: HashMap<ReplicaId, mpsc::Sender<PeerMessage>>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerNetwork {
    /// Bind the replica listener and dial all peers.
    pub async fn spawn(
        id: ReplicaId,
        replicas: Arc<ReplicaSet>,
        event_tx: mpsc::Sender<Event>,
    ) -> Result<Self, NetError> {
        let listen_addr = replicas.addr(id).ok_or(NetError::UnknownReplica(id))?;
        let listener = TcpListener::bind(listen_addr).await?;
        info!(addr = %listen_addr, "replica listener bound");

        let mut tasks = Vec::new();
        let mut senders = HashMap::new();

        // Inbound: accept, await HELLO, then pump frames into the loop.
        {
            let replicas = replicas.clone();
            let event_tx = event_tx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let (stream, addr) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    trace!(peer_addr = %addr, "inbound connection");
                    let replicas = replicas.clone();
                    let event_tx = event_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_inbound(stream, replicas, event_tx).await {
                            debug!(peer_addr = %addr, error = %e, "inbound link closed");
                        }
                    });
                }
            }));
        }

        // Outbound: one reconnecting writer per peer.
        for peer in replicas.peers_of(id) {
            let addr = replicas.addr(peer).ok_or(NetError::UnknownReplica(peer))?;
            let (tx, rx) = mpsc::channel(PEER_QUEUE);
            senders.insert(peer, tx);
            tasks.push(tokio::spawn(outbound_link(id, peer, addr, rx)));
        }

        Ok(Self { senders, tasks })
    }

    /// Send to one replica. Drops the message if the peer's queue is full
    /// or the link task died (the protocol recovers via fetch).
    pub async fn send(&self, to: ReplicaId, message: PeerMessage) {
        match self.senders.get(&to) {
            Some(tx) => {
                if tx.send(message).await.is_err() {
                    warn!(peer = %to, "peer link gone, message dropped");
                }
            }
            None => warn!(peer = %to, "send to unknown replica"),
        }
    }

    /// Send to every other replica.
    pub async fn broadcast(&self, message: PeerMessage) {
        for (peer, tx) in &self.senders {
            if tx.send(message.clone()).await.is_err() {
                warn!(peer = %peer, "peer link gone, broadcast message dropped");
            }
        }
    }

    /// Convert an outbound protocol message and deliver it.
    pub async fn dispatch(&self, to: Option<ReplicaId>, message: OutboundMessage) {
        let wire = to_wire(message);
        match to {
            Some(peer) => self.send(peer, wire).await,
            None => self.broadcast(wire).await,
        }
    }

    /// Tear the network down.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn to_wire(message: OutboundMessage) -> PeerMessage {
    match message {
        OutboundMessage::Propose(p) => PeerMessage::Propose(p),
        OutboundMessage::Vote(v) => PeerMessage::Vote(v),
        OutboundMessage::BlockRequest(hashes) => PeerMessage::ReqBlock(hashes),
        OutboundMessage::BlockResponse(blocks) => PeerMessage::RespBlock(blocks),
    }
}

/// One framed read: either a message or a malformed-but-consumed frame.
enum Frame {
    Msg(PeerMessage),
    /// The payload was read off the stream but did not decode; the link
    /// stays usable.
    Malformed(WireError),
}

/// Read one framed peer message.
///
/// A header that does not parse is fatal for the link (framing is lost);
/// a payload that does not decode is reported as [`Frame::Malformed`].
async fn read_frame(stream: &mut TcpStream) -> Result<Frame, NetError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let (opcode, len) = decode_frame_header(&header).map_err(NetError::Wire)?;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    match PeerMessage::decode(opcode, &payload) {
        Ok(msg) => Ok(Frame::Msg(msg)),
        Err(e) => Ok(Frame::Malformed(e)),
    }
}

/// Inbound side: identify the peer, then forward frames as events.
async fn serve_inbound(
    mut stream: TcpStream,
    replicas: Arc<ReplicaSet>,
    event_tx: mpsc::Sender<Event>,
) -> Result<(), NetError> {
    let from = match read_frame(&mut stream).await? {
        Frame::Msg(PeerMessage::Hello(id)) if replicas.contains(id) => id,
        Frame::Msg(PeerMessage::Hello(id)) => {
            warn!(claimed = %id, "hello from replica outside the set");
            return Ok(());
        }
        _ => return Err(NetError::MissingHello),
    };
    debug!(peer = %from, "peer link identified");

    loop {
        let event = match read_frame(&mut stream).await? {
            Frame::Msg(PeerMessage::Propose(proposal)) => {
                Event::ProposalReceived { proposal, from }
            }
            Frame::Msg(PeerMessage::Vote(vote)) => Event::VoteReceived { vote, from },
            Frame::Msg(PeerMessage::ReqBlock(hashes)) => {
                Event::BlockRequestReceived { hashes, from }
            }
            Frame::Msg(PeerMessage::RespBlock(blocks)) => {
                Event::BlockResponseReceived { blocks, from }
            }
            Frame::Msg(PeerMessage::Hello(_)) => {
                trace!(peer = %from, "redundant hello ignored");
                continue;
            }
            Frame::Malformed(e) => {
                warn!(peer = %from, error = %e, "malformed message dropped");
                continue;
            }
        };
        if event_tx.send(event).await.is_err() {
            // Event loop shut down.
            return Ok(());
        }
    }
}

/// Outbound side: keep one identified link to `peer` alive and drain the
/// queue into it.
async fn outbound_link(
    id: ReplicaId,
    peer: ReplicaId,
    addr: std::net::SocketAddr,
    mut rx: mpsc::Receiver<PeerMessage>,
) {
    'reconnect: loop {
        let mut stream = match TcpStream::connect(addr).await {
            Ok(s) => s,
            Err(e) => {
                trace!(peer = %peer, error = %e, "dial failed, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        let hello = PeerMessage::Hello(id).to_frame();
        if stream.write_all(&hello).await.is_err() {
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }
        debug!(peer = %peer, addr = %addr, "peer link established");

        while let Some(message) = rx.recv().await {
            let frame = message.to_frame();
            if let Err(e) = stream.write_all(&frame).await {
                warn!(peer = %peer, error = %e, "peer write failed, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue 'reconnect;
            }
        }
        // Queue closed: the runner is shutting down.
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threechain_types::{hash_bytes, ReplicaInfo, SecretKey};

    async fn two_replica_set() -> Arc<ReplicaSet> {
        // Bind throwaway listeners to find two free ports.
        let l0 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let l1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a0 = l0.local_addr().unwrap();
        let a1 = l1.local_addr().unwrap();
        drop((l0, l1));

        Arc::new(
            ReplicaSet::new(vec![
                ReplicaInfo {
                    id: ReplicaId(0),
                    addr: a0,
                    public_key: SecretKey::from_bytes(&[1; 32]).public_key(),
                },
                ReplicaInfo {
                    id: ReplicaId(1),
                    addr: a1,
                    public_key: SecretKey::from_bytes(&[2; 32]).public_key(),
                },
            ])
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn frames_flow_between_replicas() {
        let replicas = two_replica_set().await;
        let (tx0, _rx0) = mpsc::channel(64);
        let (tx1, mut rx1) = mpsc::channel(64);

        let net0 = PeerNetwork::spawn(ReplicaId(0), replicas.clone(), tx0)
            .await
            .unwrap();
        let _net1 = PeerNetwork::spawn(ReplicaId(1), replicas.clone(), tx1)
            .await
            .unwrap();

        let hashes = vec![hash_bytes(b"wanted")];
        net0.dispatch(
            Some(ReplicaId(1)),
            OutboundMessage::BlockRequest(hashes.clone()),
        )
        .await;

        let event = tokio::time::timeout(Duration::from_secs(5), rx1.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        match event {
            Event::BlockRequestReceived { hashes: got, from } => {
                assert_eq!(got, hashes);
                assert_eq!(from, ReplicaId(0));
            }
            other => panic!("unexpected event {}", other.type_name()),
        }
        net0.shutdown();
    }

    #[tokio::test]
    async fn broadcast_reaches_all_peers() {
        let replicas = two_replica_set().await;
        let (tx0, _rx0) = mpsc::channel(64);
        let (tx1, mut rx1) = mpsc::channel(64);

        let net0 = PeerNetwork::spawn(ReplicaId(0), replicas.clone(), tx0)
            .await
            .unwrap();
        let _net1 = PeerNetwork::spawn(ReplicaId(1), replicas.clone(), tx1)
            .await
            .unwrap();

        net0.dispatch(None, OutboundMessage::BlockRequest(vec![hash_bytes(b"x")]))
            .await;

        let event = tokio::time::timeout(Duration::from_secs(5), rx1.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert!(matches!(event, Event::BlockRequestReceived { .. }));
        net0.shutdown();
    }
}
