//! Canonical encodings of consensus entities.
//!
//! Every entity satisfies `decode(encode(x)) == x`. Block decoding is
//! two-phase: the wire yields the identity fields (parent hashes, command
//! hashes, justify certificate) and `Block::new` recomputes the content
//! hash; height and the delivered flag are reconstituted later by the block
//! store once dependencies resolve.

use crate::error::WireError;
use crate::io::{
    get_bytes, get_count, get_i8, get_u16, get_u32, get_u8, put_bytes, put_i8, put_u16, put_u32,
    put_u8, WireDecode, WireEncode,
};
use threechain_types::{
    Block, Command, Decision, Finality, Hash, Proposal, QuorumCertificate, ReplicaId, Signature,
    Vote,
};

/// Largest accepted command payload (1 MiB).
pub const MAX_CMD_PAYLOAD: usize = 1024 * 1024;

impl WireEncode for Hash {
    fn encode(&self, out: &mut Vec<u8>) {
        put_bytes(out, self.as_bytes());
    }
}

impl WireDecode for Hash {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let bytes = get_bytes(input, Hash::LEN)?;
        Hash::from_slice(bytes).ok_or(WireError::InvalidValue("hash"))
    }
}

impl WireEncode for ReplicaId {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u16(out, self.0);
    }
}

impl WireDecode for ReplicaId {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(ReplicaId(get_u16(input)?))
    }
}

/// Signatures travel as a length-prefixed opaque byte string; the length
/// lets the crypto suite change without a wire format bump.
impl WireEncode for Signature {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u16(out, self.as_bytes().len() as u16);
        put_bytes(out, self.as_bytes());
    }
}

impl WireDecode for Signature {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let len = get_u16(input)? as usize;
        let bytes = get_bytes(input, len)?;
        Signature::from_slice(bytes).ok_or(WireError::InvalidValue("signature length"))
    }
}

impl WireEncode for Command {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.payload().len() as u32);
        put_bytes(out, self.payload());
    }
}

impl WireDecode for Command {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let len = get_u32(input)? as usize;
        if len > MAX_CMD_PAYLOAD {
            return Err(WireError::OverLimit {
                got: len,
                limit: MAX_CMD_PAYLOAD,
            });
        }
        let payload = get_bytes(input, len)?.to_vec();
        Ok(Command::new(payload))
    }
}

impl WireEncode for QuorumCertificate {
    fn encode(&self, out: &mut Vec<u8>) {
        self.block_hash.encode(out);
        put_u32(out, self.signers.len() as u32);
        for (id, sig) in &self.signers {
            id.encode(out);
            sig.encode(out);
        }
    }
}

impl WireDecode for QuorumCertificate {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let block_hash = Hash::decode(input)?;
        // Minimum signer encoding: replica id + signature length prefix.
        let count = get_count(input, 4)?;
        let mut signers = Vec::with_capacity(count);
        for _ in 0..count {
            let id = ReplicaId::decode(input)?;
            let sig = Signature::decode(input)?;
            signers.push((id, sig));
        }
        Ok(QuorumCertificate::new(block_hash, signers))
    }
}

impl WireEncode for Block {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.parent_hashes().len() as u32);
        for p in self.parent_hashes() {
            p.encode(out);
        }
        put_u32(out, self.cmd_hashes().len() as u32);
        for c in self.cmd_hashes() {
            c.encode(out);
        }
        match self.justify() {
            None => put_u8(out, 0),
            Some(qc) => {
                put_u8(out, 1);
                qc.encode(out);
            }
        }
    }
}

impl WireDecode for Block {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let parent_count = get_count(input, Hash::LEN)?;
        let mut parents = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            parents.push(Hash::decode(input)?);
        }
        let cmd_count = get_count(input, Hash::LEN)?;
        let mut cmds = Vec::with_capacity(cmd_count);
        for _ in 0..cmd_count {
            cmds.push(Hash::decode(input)?);
        }
        let justify = match get_u8(input)? {
            0 => None,
            1 => Some(QuorumCertificate::decode(input)?),
            _ => return Err(WireError::InvalidValue("justify flag")),
        };
        Ok(Block::new(parents, cmds, justify))
    }
}

impl WireEncode for Vote {
    fn encode(&self, out: &mut Vec<u8>) {
        self.voter.encode(out);
        self.blk_hash.encode(out);
        self.bqc_hash.encode(out);
        self.signature.encode(out);
    }
}

impl WireDecode for Vote {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Vote {
            voter: ReplicaId::decode(input)?,
            blk_hash: Hash::decode(input)?,
            bqc_hash: Hash::decode(input)?,
            signature: Signature::decode(input)?,
        })
    }
}

impl WireEncode for Proposal {
    fn encode(&self, out: &mut Vec<u8>) {
        self.proposer.encode(out);
        self.bqc_hash.encode(out);
        self.block.encode(out);
    }
}

impl WireDecode for Proposal {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Proposal {
            proposer: ReplicaId::decode(input)?,
            bqc_hash: Hash::decode(input)?,
            block: Block::decode(input)?,
        })
    }
}

impl WireEncode for Finality {
    fn encode(&self, out: &mut Vec<u8>) {
        self.decided_by.encode(out);
        put_i8(out, self.decision as i8);
        put_u32(out, self.position);
        self.cmd_hash.encode(out);
        self.blk_hash.encode(out);
    }
}

impl WireDecode for Finality {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let decided_by = ReplicaId::decode(input)?;
        let decision =
            Decision::from_i8(get_i8(input)?).ok_or(WireError::InvalidValue("decision code"))?;
        let position = get_u32(input)?;
        let cmd_hash = Hash::decode(input)?;
        let blk_hash = Hash::decode(input)?;
        Ok(Finality {
            decided_by,
            decision,
            blk_hash,
            cmd_hash,
            position,
        })
    }
}
