//! Framed protocol messages.
//!
//! # Frame Format
//!
//! ```text
//! [opcode: u8][len: u32 LE][payload: len bytes]
//! ```
//!
//! Replica-to-replica traffic uses opcodes `0x00`–`0x03` plus the `HELLO`
//! identification frame; client traffic uses `0x04`/`0x05`. `REQ_BLOCK` and
//! `RESP_BLOCK` payloads are a little-endian `u32` count followed by the
//! items, per the peer protocol contract.

use crate::error::WireError;
use crate::io::{get_count, put_u32, WireDecode, WireEncode};
use threechain_types::{Block, Command, Finality, Hash, Proposal, ReplicaId, Vote};

/// Hard ceiling on a frame payload (16 MiB), bounding allocation from a
/// bogus length field before any decode begins.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Bytes in a frame header: opcode plus payload length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Wire opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Propose = 0x00,
    Vote = 0x01,
    ReqBlock = 0x02,
    RespBlock = 0x03,
    ReqCmd = 0x04,
    RespCmd = 0x05,
    /// One-shot peer identification, first frame on every replica link.
    Hello = 0x06,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0x00 => Ok(Opcode::Propose),
            0x01 => Ok(Opcode::Vote),
            0x02 => Ok(Opcode::ReqBlock),
            0x03 => Ok(Opcode::RespBlock),
            0x04 => Ok(Opcode::ReqCmd),
            0x05 => Ok(Opcode::RespCmd),
            0x06 => Ok(Opcode::Hello),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

/// A message between replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Propose(Proposal),
    Vote(Vote),
    ReqBlock(Vec<Hash>),
    RespBlock(Vec<Block>),
    Hello(ReplicaId),
}

impl PeerMessage {
    pub fn opcode(&self) -> Opcode {
        match self {
            PeerMessage::Propose(_) => Opcode::Propose,
            PeerMessage::Vote(_) => Opcode::Vote,
            PeerMessage::ReqBlock(_) => Opcode::ReqBlock,
            PeerMessage::RespBlock(_) => Opcode::RespBlock,
            PeerMessage::Hello(_) => Opcode::Hello,
        }
    }

    /// Encode as a complete frame: header plus payload.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            PeerMessage::Propose(p) => p.encode(&mut payload),
            PeerMessage::Vote(v) => v.encode(&mut payload),
            PeerMessage::ReqBlock(hashes) => {
                put_u32(&mut payload, hashes.len() as u32);
                for h in hashes {
                    h.encode(&mut payload);
                }
            }
            PeerMessage::RespBlock(blocks) => {
                put_u32(&mut payload, blocks.len() as u32);
                for b in blocks {
                    b.encode(&mut payload);
                }
            }
            PeerMessage::Hello(id) => id.encode(&mut payload),
        }
        frame(self.opcode(), payload)
    }

    /// Decode a frame payload for the given opcode.
    pub fn decode(opcode: Opcode, payload: &[u8]) -> Result<Self, WireError> {
        let mut input = payload;
        let msg = match opcode {
            Opcode::Propose => PeerMessage::Propose(Proposal::decode(&mut input)?),
            Opcode::Vote => PeerMessage::Vote(Vote::decode(&mut input)?),
            Opcode::ReqBlock => {
                let count = get_count(&mut input, Hash::LEN)?;
                let mut hashes = Vec::with_capacity(count);
                for _ in 0..count {
                    hashes.push(Hash::decode(&mut input)?);
                }
                PeerMessage::ReqBlock(hashes)
            }
            Opcode::RespBlock => {
                // Minimum block encoding: two counts plus the justify flag.
                let count = get_count(&mut input, 9)?;
                let mut blocks = Vec::with_capacity(count);
                for _ in 0..count {
                    blocks.push(Block::decode(&mut input)?);
                }
                PeerMessage::RespBlock(blocks)
            }
            Opcode::Hello => PeerMessage::Hello(ReplicaId::decode(&mut input)?),
            Opcode::ReqCmd | Opcode::RespCmd => {
                return Err(WireError::InvalidValue("client opcode on replica link"))
            }
        };
        if !input.is_empty() {
            return Err(WireError::TrailingBytes(input.len()));
        }
        Ok(msg)
    }
}

/// A message between a client and a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    ReqCmd(Command),
    RespCmd(Finality),
}

impl ClientMessage {
    pub fn opcode(&self) -> Opcode {
        match self {
            ClientMessage::ReqCmd(_) => Opcode::ReqCmd,
            ClientMessage::RespCmd(_) => Opcode::RespCmd,
        }
    }

    pub fn to_frame(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            ClientMessage::ReqCmd(cmd) => cmd.encode(&mut payload),
            ClientMessage::RespCmd(fin) => fin.encode(&mut payload),
        }
        frame(self.opcode(), payload)
    }

    pub fn decode(opcode: Opcode, payload: &[u8]) -> Result<Self, WireError> {
        let mut input = payload;
        let msg = match opcode {
            Opcode::ReqCmd => ClientMessage::ReqCmd(Command::decode(&mut input)?),
            Opcode::RespCmd => ClientMessage::RespCmd(Finality::decode(&mut input)?),
            _ => return Err(WireError::InvalidValue("replica opcode on client link")),
        };
        if !input.is_empty() {
            return Err(WireError::TrailingBytes(input.len()));
        }
        Ok(msg)
    }
}

/// Prefix a payload with its frame header.
fn frame(opcode: Opcode, payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.push(opcode as u8);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

/// Parse a frame header, returning the opcode and payload length.
///
/// Rejects payloads over [`MAX_FRAME_PAYLOAD`] so a malicious peer cannot
/// force a huge allocation.
pub fn decode_frame_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<(Opcode, usize), WireError> {
    let opcode = Opcode::from_u8(header[0])?;
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(WireError::OverLimit {
            got: len,
            limit: MAX_FRAME_PAYLOAD,
        });
    }
    Ok((opcode, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use threechain_types::{hash_bytes, SecretKey};

    fn frame_roundtrip_peer(msg: PeerMessage) {
        let frame = msg.to_frame();
        let header: [u8; FRAME_HEADER_LEN] = frame[..FRAME_HEADER_LEN].try_into().unwrap();
        let (opcode, len) = decode_frame_header(&header).unwrap();
        assert_eq!(len, frame.len() - FRAME_HEADER_LEN);
        let decoded = PeerMessage::decode(opcode, &frame[FRAME_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn peer_message_roundtrips() {
        let key = SecretKey::from_bytes(&[3; 32]);
        let blk = Block::new(vec![hash_bytes(b"p")], vec![hash_bytes(b"c")], None);

        frame_roundtrip_peer(PeerMessage::Propose(Proposal {
            proposer: ReplicaId(0),
            bqc_hash: hash_bytes(b"bqc"),
            block: blk.clone(),
        }));
        frame_roundtrip_peer(PeerMessage::Vote(Vote::new(
            ReplicaId(1),
            blk.hash(),
            hash_bytes(b"bqc"),
            &key,
        )));
        frame_roundtrip_peer(PeerMessage::ReqBlock(vec![
            hash_bytes(b"a"),
            hash_bytes(b"b"),
        ]));
        frame_roundtrip_peer(PeerMessage::RespBlock(vec![blk, Block::genesis()]));
        frame_roundtrip_peer(PeerMessage::Hello(ReplicaId(2)));
    }

    #[test]
    fn client_message_roundtrips() {
        let cmd = Command::new(b"set x=1".to_vec());
        let frame = ClientMessage::ReqCmd(cmd.clone()).to_frame();
        let header: [u8; FRAME_HEADER_LEN] = frame[..FRAME_HEADER_LEN].try_into().unwrap();
        let (opcode, _) = decode_frame_header(&header).unwrap();
        assert_eq!(opcode, Opcode::ReqCmd);
        let decoded = ClientMessage::decode(opcode, &frame[FRAME_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, ClientMessage::ReqCmd(cmd));

        let fin = Finality::committed(ReplicaId(0), hash_bytes(b"b"), hash_bytes(b"c"), 0);
        let frame = ClientMessage::RespCmd(fin.clone()).to_frame();
        let header: [u8; FRAME_HEADER_LEN] = frame[..FRAME_HEADER_LEN].try_into().unwrap();
        let (opcode, _) = decode_frame_header(&header).unwrap();
        let decoded = ClientMessage::decode(opcode, &frame[FRAME_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, ClientMessage::RespCmd(fin));
    }

    #[test]
    fn client_opcode_rejected_on_replica_link() {
        assert!(PeerMessage::decode(Opcode::ReqCmd, &[]).is_err());
    }

    #[test]
    fn unknown_opcode_rejected() {
        let header = [0xff, 0, 0, 0, 0];
        assert_eq!(
            decode_frame_header(&header),
            Err(WireError::UnknownOpcode(0xff))
        );
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0] = Opcode::Propose as u8;
        header[1..].copy_from_slice(&((MAX_FRAME_PAYLOAD as u32) + 1).to_le_bytes());
        assert!(matches!(
            decode_frame_header(&header),
            Err(WireError::OverLimit { .. })
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut frame = PeerMessage::Hello(ReplicaId(1)).to_frame();
        frame.push(0xab);
        let header: [u8; FRAME_HEADER_LEN] = frame[..FRAME_HEADER_LEN].try_into().unwrap();
        let (opcode, _) = decode_frame_header(&header).unwrap();
        // Payload slice includes the stray byte.
        assert!(PeerMessage::decode(opcode, &frame[FRAME_HEADER_LEN..]).is_err());
    }
}
