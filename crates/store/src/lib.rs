//! Content-addressed storage of blocks and commands.
//!
//! The store owns the canonical instance of every block and command this
//! replica knows; everyone else holds the hash and looks up. Access is
//! single-threaded (the event loop), so plain `HashMap`s suffice - no lock
//! discipline leaks into the protocol layer.
//!
//! A block moves through two states here:
//!
//! 1. **fetched** - the bytes are present and content-addressed
//! 2. **delivered** - all parents and the justify target are themselves
//!    delivered; height is derived from the main parent
//!
//! Delivery marking is idempotent and enforces the parent precondition.
//! Eviction never touches blocks within the configured horizon behind the
//! committed tip.

use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use threechain_types::{Block, Command, Hash, Height};
use tracing::{debug, trace};

/// Errors from block store operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("block {0} is not in the store")]
    UnknownBlock(Hash),

    #[error("parent {parent} of block {blk} is not delivered")]
    ParentNotDelivered { blk: Hash, parent: Hash },

    #[error("justify target {target} of block {blk} is not fetched")]
    JustifyNotFetched { blk: Hash, target: Hash },
}

/// In-memory content-addressed store.
#[derive(Debug, Default)]
pub struct BlockStore {
    blocks: HashMap<Hash, Block>,
    commands: HashMap<Hash, Command>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store seeded with the pre-delivered genesis block.
    pub fn with_genesis() -> Self {
        let mut store = Self::new();
        let genesis = Block::genesis();
        store.blocks.insert(genesis.hash(), genesis);
        store
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Insertion
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert a block, returning the canonical hash.
    ///
    /// Content-addressed: if the hash is already present the stored
    /// instance wins and the argument is dropped, so duplicate arrivals
    /// fold silently and an already-delivered block is never regressed.
    pub fn add_blk(&mut self, blk: Block) -> Hash {
        let hash = blk.hash();
        self.blocks.entry(hash).or_insert_with(|| {
            trace!(blk = %hash.short(), "stored block");
            blk
        });
        hash
    }

    /// Insert a command, returning the canonical hash. Same contract as
    /// [`add_blk`](Self::add_blk).
    pub fn add_cmd(&mut self, cmd: Command) -> Hash {
        let hash = cmd.hash();
        self.commands.entry(hash).or_insert(cmd);
        hash
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lookup
    // ═══════════════════════════════════════════════════════════════════════

    pub fn find_blk(&self, hash: &Hash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn find_cmd(&self, hash: &Hash) -> Option<&Command> {
        self.commands.get(hash)
    }

    pub fn is_blk_fetched(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn is_blk_delivered(&self, hash: &Hash) -> bool {
        self.blocks.get(hash).is_some_and(|b| b.is_delivered())
    }

    pub fn is_cmd_fetched(&self, hash: &Hash) -> bool {
        self.commands.contains_key(hash)
    }

    /// Height of a delivered block. `None` if unknown or undelivered.
    pub fn blk_height(&self, hash: &Hash) -> Option<Height> {
        self.blocks
            .get(hash)
            .filter(|b| b.is_delivered())
            .map(|b| b.height())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Delivery
    // ═══════════════════════════════════════════════════════════════════════

    /// Mark a block delivered, deriving its height from the main parent.
    ///
    /// Precondition: every parent is delivered and the justify target is
    /// fetched. Returns `Ok(false)` if the block was already delivered
    /// (marking happens exactly once).
    pub fn mark_blk_delivered(&mut self, hash: &Hash) -> Result<bool, StoreError> {
        let blk = self
            .blocks
            .get(hash)
            .ok_or(StoreError::UnknownBlock(*hash))?;
        if blk.is_delivered() {
            return Ok(false);
        }

        let mut height = Height(0);
        for parent in blk.parent_hashes() {
            match self.blocks.get(parent) {
                Some(p) if p.is_delivered() => {}
                _ => {
                    return Err(StoreError::ParentNotDelivered {
                        blk: *hash,
                        parent: *parent,
                    })
                }
            }
        }
        if let Some(main) = blk.main_parent() {
            height = Height(self.blocks[&main].height().0 + 1);
        }
        if let Some(target) = blk.qc_ref() {
            if !self.blocks.contains_key(&target) {
                return Err(StoreError::JustifyNotFetched {
                    blk: *hash,
                    target,
                });
            }
        }

        let blk = self.blocks.get_mut(hash).expect("checked above");
        blk.mark_delivered(height);
        debug!(blk = %hash.short(), height = height.0, "block delivered");
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Cache accounting
    // ═══════════════════════════════════════════════════════════════════════

    pub fn blk_cache_size(&self) -> usize {
        self.blocks.len()
    }

    pub fn cmd_cache_size(&self) -> usize {
        self.commands.len()
    }

    /// Evict blocks (and their commands) that sit more than `horizon`
    /// blocks behind the committed tip.
    ///
    /// Everything reachable from `tip` through parent links within
    /// `horizon` hops is retained, as is anything not yet delivered (it may
    /// still be wanted by an in-flight delivery). Returns the number of
    /// blocks evicted.
    pub fn prune(&mut self, tip: &Hash, horizon: u64) -> usize {
        let Some(tip_blk) = self.blocks.get(tip) else {
            return 0;
        };
        let cutoff = tip_blk.height().0.saturating_sub(horizon);

        // Retained set: BFS over parents, `horizon` hops deep.
        let mut retained: HashSet<Hash> = HashSet::new();
        let mut frontier = VecDeque::from([(*tip, 0u64)]);
        while let Some((hash, depth)) = frontier.pop_front() {
            if !retained.insert(hash) || depth >= horizon {
                continue;
            }
            if let Some(blk) = self.blocks.get(&hash) {
                for parent in blk.parent_hashes() {
                    frontier.push_back((*parent, depth + 1));
                }
            }
        }

        let doomed: Vec<Hash> = self
            .blocks
            .iter()
            .filter(|(h, b)| b.is_delivered() && b.height().0 < cutoff && !retained.contains(h))
            .map(|(h, _)| *h)
            .collect();

        let mut evicted = 0;
        for hash in doomed {
            if let Some(blk) = self.blocks.remove(&hash) {
                for cmd in blk.cmd_hashes() {
                    self.commands.remove(cmd);
                }
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, cutoff, "pruned block cache");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threechain_types::hash_bytes;

    fn child_of(store: &mut BlockStore, parent: Hash, tag: &[u8]) -> Hash {
        let blk = Block::new(vec![parent], vec![hash_bytes(tag)], None);
        store.add_blk(blk)
    }

    #[test]
    fn genesis_is_pre_delivered() {
        let store = BlockStore::with_genesis();
        let genesis = Block::genesis().hash();
        assert!(store.is_blk_fetched(&genesis));
        assert!(store.is_blk_delivered(&genesis));
        assert_eq!(store.blk_height(&genesis), Some(Height(0)));
    }

    #[test]
    fn add_blk_is_idempotent_and_canonical() {
        let mut store = BlockStore::with_genesis();
        let genesis = Block::genesis().hash();
        let h = child_of(&mut store, genesis, b"c");
        store.mark_blk_delivered(&h).unwrap();

        // Re-adding the same content must not clobber the delivered flag.
        let again = store.add_blk(Block::new(vec![genesis], vec![hash_bytes(b"c")], None));
        assert_eq!(again, h);
        assert!(store.is_blk_delivered(&h));
        assert_eq!(store.blk_cache_size(), 2);
    }

    #[test]
    fn delivery_derives_height_and_is_idempotent() {
        let mut store = BlockStore::with_genesis();
        let genesis = Block::genesis().hash();
        let h1 = child_of(&mut store, genesis, b"1");
        let h2 = child_of(&mut store, h1, b"2");

        assert_eq!(store.mark_blk_delivered(&h1), Ok(true));
        assert_eq!(store.blk_height(&h1), Some(Height(1)));
        assert_eq!(store.mark_blk_delivered(&h1), Ok(false));

        assert_eq!(store.mark_blk_delivered(&h2), Ok(true));
        assert_eq!(store.blk_height(&h2), Some(Height(2)));
    }

    #[test]
    fn delivery_requires_delivered_parents() {
        let mut store = BlockStore::with_genesis();
        let genesis = Block::genesis().hash();
        let h1 = child_of(&mut store, genesis, b"1");
        let h2 = child_of(&mut store, h1, b"2");

        // h1 is fetched but not delivered.
        assert_eq!(
            store.mark_blk_delivered(&h2),
            Err(StoreError::ParentNotDelivered {
                blk: h2,
                parent: h1
            })
        );
    }

    #[test]
    fn delivery_requires_fetched_justify_target() {
        let mut store = BlockStore::with_genesis();
        let genesis = Block::genesis().hash();
        let missing = hash_bytes(b"never-seen");
        let qc = threechain_types::QuorumCertificate::new(missing, vec![]);
        let h = store.add_blk(Block::new(vec![genesis], vec![], Some(qc)));

        assert_eq!(
            store.mark_blk_delivered(&h),
            Err(StoreError::JustifyNotFetched {
                blk: h,
                target: missing
            })
        );
    }

    #[test]
    fn commands_are_content_addressed() {
        let mut store = BlockStore::new();
        let h = store.add_cmd(Command::new(b"cmd".to_vec()));
        assert!(store.is_cmd_fetched(&h));
        assert_eq!(store.add_cmd(Command::new(b"cmd".to_vec())), h);
        assert_eq!(store.cmd_cache_size(), 1);
    }

    #[test]
    fn prune_respects_horizon() {
        let mut store = BlockStore::with_genesis();
        let mut tip = Block::genesis().hash();
        let mut chain = vec![tip];
        for i in 0u8..10 {
            tip = child_of(&mut store, tip, &[i]);
            store.mark_blk_delivered(&tip).unwrap();
            chain.push(tip);
        }

        let evicted = store.prune(&tip, 3);
        assert!(evicted > 0);
        // Tip and its 3 ancestors stay.
        for h in &chain[7..] {
            assert!(store.is_blk_fetched(h), "recent block evicted");
        }
        // Genesis (height 0, depth 10) is outside the horizon.
        assert!(!store.is_blk_fetched(&chain[0]));
    }

    #[test]
    fn prune_keeps_undelivered_blocks() {
        let mut store = BlockStore::with_genesis();
        let mut tip = Block::genesis().hash();
        for i in 0u8..6 {
            tip = child_of(&mut store, tip, &[i]);
            store.mark_blk_delivered(&tip).unwrap();
        }
        // An orphan that has not been delivered yet.
        let orphan = store.add_blk(Block::new(vec![hash_bytes(b"unknown")], vec![], None));

        store.prune(&tip, 2);
        assert!(store.is_blk_fetched(&orphan));
    }
}
