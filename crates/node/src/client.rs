//! Client interface: accept commands, return finality proofs.
//!
//! Clients connect over TCP to the configured client port and send
//! `REQ_CMD` frames; every submitted command is answered with at least one
//! `RESP_CMD` carrying a `Finality`. The not-proposer sentinel may be
//! followed by a second response on the same connection once the command's
//! commit propagates to this replica, so a request entry survives the
//! sentinel and is dropped after a concluding decision.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use threechain_core::{Event, RequestId};
use threechain_types::{Decision, Finality};
use threechain_wire::{decode_frame_header, ClientMessage, FRAME_HEADER_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{tcp::OwnedWriteHalf, TcpListener};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Per-connection response queue depth.
const RESPONSE_QUEUE: usize = 64;

type ReplySender = mpsc::Sender<Finality>;

/// Handle to the spawned client listener.
pub struct ClientGateway {
    /// Outstanding request → responder for its connection.
    registry: Arc<Mutex<HashMap<RequestId, ReplySender>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ClientGateway {
    /// Bind the client listener on `cport`.
    pub async fn spawn(cport: u16, event_tx: mpsc::Sender<Event>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", cport)).await?;
        debug!(cport, "client listener bound");

        let registry: Arc<Mutex<HashMap<RequestId, ReplySender>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let next_request = Arc::new(AtomicU64::new(0));

        let accept_registry = registry.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "client accept failed");
                        continue;
                    }
                };
                trace!(client = %addr, "client connected");
                let registry = accept_registry.clone();
                let next_request = next_request.clone();
                let event_tx = event_tx.clone();
                tokio::spawn(async move {
                    serve_client(stream, registry, next_request, event_tx).await;
                });
            }
        });

        Ok(Self {
            registry,
            tasks: vec![accept_task],
        })
    }

    /// Deliver a finality record to the connection that submitted the
    /// request. A not-proposer sentinel keeps the entry alive for the
    /// later confirmed response; anything else concludes the request.
    pub fn respond(&self, request: RequestId, finality: Finality) {
        let entry = {
            let registry = self.registry.lock().expect("registry poisoned");
            registry.get(&request).cloned()
        };
        let Some(tx) = entry else {
            trace!(?request, "response for a closed client connection");
            return;
        };
        let concluded = finality.decision != Decision::NotProposer;
        if tx.try_send(finality).is_err() {
            debug!(?request, "client connection gone or backlogged");
        }
        if concluded {
            let mut registry = self.registry.lock().expect("registry poisoned");
            registry.remove(&request);
        }
    }

    /// Outstanding request count, for the stat dump.
    pub fn outstanding(&self) -> usize {
        self.registry.lock().expect("registry poisoned").len()
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// One client connection: reader feeds commands into the loop, writer
/// drains finality responses.
async fn serve_client(
    stream: tokio::net::TcpStream,
    registry: Arc<Mutex<HashMap<RequestId, ReplySender>>>,
    next_request: Arc<AtomicU64>,
    event_tx: mpsc::Sender<Event>,
) {
    let peer = stream.peer_addr().ok();
    let (mut reader, writer) = stream.into_split();
    let (reply_tx, reply_rx) = mpsc::channel(RESPONSE_QUEUE);

    let writer_task = tokio::spawn(write_responses(writer, reply_rx));
    let mut issued: Vec<RequestId> = Vec::new();

    loop {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if reader.read_exact(&mut header).await.is_err() {
            break;
        }
        let (opcode, len) = match decode_frame_header(&header) {
            Ok(h) => h,
            Err(e) => {
                warn!(client = ?peer, error = %e, "malformed client frame, closing");
                break;
            }
        };
        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).await.is_err() {
            break;
        }
        let cmd = match ClientMessage::decode(opcode, &payload) {
            Ok(ClientMessage::ReqCmd(cmd)) => cmd,
            Ok(_) => {
                warn!(client = ?peer, "unexpected client opcode, closing");
                break;
            }
            Err(e) => {
                warn!(client = ?peer, error = %e, "malformed client command dropped");
                continue;
            }
        };

        let request = RequestId(next_request.fetch_add(1, Ordering::Relaxed));
        registry
            .lock()
            .expect("registry poisoned")
            .insert(request, reply_tx.clone());
        issued.push(request);

        if event_tx
            .send(Event::CommandSubmitted { cmd, request })
            .await
            .is_err()
        {
            break;
        }
    }

    // Connection closed: drop its outstanding requests.
    {
        let mut registry = registry.lock().expect("registry poisoned");
        for request in issued {
            registry.remove(&request);
        }
    }
    writer_task.abort();
    trace!(client = ?peer, "client disconnected");
}

async fn write_responses(mut writer: OwnedWriteHalf, mut reply_rx: mpsc::Receiver<Finality>) {
    while let Some(finality) = reply_rx.recv().await {
        let frame = ClientMessage::RespCmd(finality).to_frame();
        if writer.write_all(&frame).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use threechain_types::{hash_bytes, Command, ReplicaId};
    use threechain_wire::WireDecode;
    use tokio::net::TcpStream;

    async fn gateway() -> (ClientGateway, mpsc::Receiver<Event>, u16) {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cport = probe.local_addr().unwrap().port();
        drop(probe);
        let (tx, rx) = mpsc::channel(64);
        let gw = ClientGateway::spawn(cport, tx).await.unwrap();
        (gw, rx, cport)
    }

    async fn read_finality(stream: &mut TcpStream) -> Finality {
        let mut header = [0u8; FRAME_HEADER_LEN];
        stream.read_exact(&mut header).await.unwrap();
        let (opcode, len) = decode_frame_header(&header).unwrap();
        assert_eq!(opcode, threechain_wire::Opcode::RespCmd);
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        Finality::from_bytes(&payload).unwrap()
    }

    #[tokio::test]
    async fn submission_round_trips_to_finality() {
        let (gw, mut events, cport) = gateway().await;
        let mut client = TcpStream::connect(("127.0.0.1", cport)).await.unwrap();

        let cmd = Command::new(b"set x".to_vec());
        client
            .write_all(&ClientMessage::ReqCmd(cmd.clone()).to_frame())
            .await
            .unwrap();

        let (cmd_hash, request) = match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            Event::CommandSubmitted { cmd, request } => (cmd.hash(), request),
            other => panic!("unexpected event {}", other.type_name()),
        };
        assert_eq!(cmd_hash, cmd.hash());
        assert_eq!(gw.outstanding(), 1);

        let fin = Finality::committed(ReplicaId(0), hash_bytes(b"blk"), cmd_hash, 0);
        gw.respond(request, fin.clone());

        let got = read_finality(&mut client).await;
        assert_eq!(got, fin);
        assert_eq!(gw.outstanding(), 0);
        gw.shutdown();
    }

    #[tokio::test]
    async fn sentinel_keeps_the_request_open_for_confirmation() {
        let (gw, mut events, cport) = gateway().await;
        let mut client = TcpStream::connect(("127.0.0.1", cport)).await.unwrap();

        let cmd = Command::new(b"later".to_vec());
        client
            .write_all(&ClientMessage::ReqCmd(cmd.clone()).to_frame())
            .await
            .unwrap();

        let request = match events.recv().await.unwrap() {
            Event::CommandSubmitted { request, .. } => request,
            other => panic!("unexpected event {}", other.type_name()),
        };

        // First the sentinel, then the confirmed decision.
        gw.respond(request, Finality::not_proposer(ReplicaId(1), cmd.hash()));
        let first = read_finality(&mut client).await;
        assert_eq!(first.decision, Decision::NotProposer);
        assert_eq!(first.decided_by, ReplicaId(1));
        assert_eq!(gw.outstanding(), 1);

        gw.respond(
            request,
            Finality::committed(ReplicaId(0), hash_bytes(b"blk"), cmd.hash(), 0),
        );
        let second = read_finality(&mut client).await;
        assert_eq!(second.decision, Decision::Committed);
        assert_eq!(gw.outstanding(), 0);
        gw.shutdown();
    }
}
