//! Tracking of a single piece's download progress, block by block.

use crate::{block_count, block_len, BlockInfo, PeerKey, PieceIndex};

/// The state of a single block within a downloading piece.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum BlockState {
    /// The block may be picked.
    Open,
    /// The block has been requested from the listed peers. Outside end-game
    /// mode this is always a single peer; in end-game mode a block may be
    /// requested from a small bounded number of peers at once.
    Requested(Vec<PeerKey>),
    /// The block arrived and was handed to the disk task by the given peer.
    Writing(PeerKey),
    /// The block was written to disk (but the piece hasn't passed its hash
    /// yet). Blocks that fall entirely within a pad file are born in this
    /// state with no owning peer.
    Finished(Option<PeerKey>),
}

/// Tracks the per-block download state of a piece.
///
/// The accounting invariant `open + requested + writing + finished ==
/// block count` holds after every method; it's what the picker's global
/// bookkeeping rests on.
#[derive(Clone, Debug)]
pub(crate) struct PieceDownload {
    /// The piece this download tracks.
    piece_index: PieceIndex,
    /// The length of the piece, in bytes.
    len: u32,
    /// The number of trailing bytes of the piece that fall within pad
    /// files. Pad files align the next file to a piece boundary, so within
    /// a piece the padding is always a suffix.
    pad_bytes: u32,
    /// The state of each block in the piece.
    blocks: Vec<BlockState>,
    num_requested: usize,
    num_writing: usize,
    num_finished: usize,
}

impl PieceDownload {
    pub fn new(piece_index: PieceIndex, len: u32, pad_bytes: u32) -> Self {
        debug_assert!(pad_bytes < len);
        let data_len = len - pad_bytes;
        let mut num_finished = 0;
        let blocks = (0..block_count(len))
            .map(|block| {
                // blocks entirely within the pad suffix have no bytes to
                // fetch; they are complete from the start
                if block as u32 * crate::BLOCK_LEN >= data_len {
                    num_finished += 1;
                    BlockState::Finished(None)
                } else {
                    BlockState::Open
                }
            })
            .collect();
        Self {
            piece_index,
            len,
            pad_bytes,
            blocks,
            num_requested: 0,
            num_writing: 0,
            num_finished,
        }
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.piece_index
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_open(&self) -> usize {
        self.blocks.len()
            - self.num_requested
            - self.num_writing
            - self.num_finished
    }

    pub fn num_finished(&self) -> usize {
        self.num_finished
    }

    /// True once every block has been written to disk and the piece can be
    /// hash checked.
    pub fn is_complete(&self) -> bool {
        self.num_finished == self.blocks.len()
    }

    /// The `BlockInfo` of the given block index within this piece. The
    /// length is trimmed to exclude the pad suffix: pad bytes are injected
    /// locally as zeros, never transferred.
    pub fn block_info(&self, block: usize) -> BlockInfo {
        let offset = block as u32 * crate::BLOCK_LEN;
        let nominal = block_len(self.len, block);
        let data_len = self.len - self.pad_bytes;
        debug_assert!(offset < data_len);
        BlockInfo {
            piece_index: self.piece_index,
            offset,
            len: nominal.min(data_len - offset),
        }
    }

    /// Picks the next block to request for the given peer, marking it as
    /// requested by that peer.
    ///
    /// Open blocks are picked front to back. When none remain and `end_game`
    /// is set, a block already requested from other peers may be picked,
    /// provided this peer isn't among them and the duplication bound isn't
    /// exhausted. Writing and finished blocks are never picked.
    pub fn pick_block(
        &mut self,
        peer: PeerKey,
        end_game: bool,
        end_game_bound: usize,
    ) -> Option<usize> {
        let pick = self.blocks.iter().position(|b| *b == BlockState::Open);
        let pick = match pick {
            Some(block) => Some(block),
            None if end_game => {
                self.blocks.iter().position(|b| match b {
                    BlockState::Requested(peers) => {
                        !peers.contains(&peer) && peers.len() < end_game_bound
                    }
                    _ => false,
                })
            }
            None => None,
        };
        if let Some(block) = pick {
            self.mark_requested(block, peer);
        }
        pick
    }

    /// Records that the block was requested from the peer. Returns false if
    /// the block can no longer be requested (it is being written or is
    /// finished) or the peer already has it requested.
    pub fn mark_requested(&mut self, block: usize, peer: PeerKey) -> bool {
        match &mut self.blocks[block] {
            state @ BlockState::Open => {
                *state = BlockState::Requested(vec![peer]);
                self.num_requested += 1;
                true
            }
            BlockState::Requested(peers) => {
                if peers.contains(&peer) {
                    return false;
                }
                peers.push(peer);
                true
            }
            _ => false,
        }
    }

    /// The block arrived from the peer and is on its way to disk. Returns
    /// false if the arrival is redundant (the block is already being written
    /// or finished), in which case it should be discarded.
    ///
    /// Any other peers the block was requested from are implicitly dropped;
    /// their in-flight copies will be discarded on arrival.
    pub fn mark_writing(&mut self, block: usize, peer: PeerKey) -> bool {
        match &self.blocks[block] {
            BlockState::Requested(_) | BlockState::Open => {
                if matches!(self.blocks[block], BlockState::Requested(_)) {
                    self.num_requested -= 1;
                }
                self.blocks[block] = BlockState::Writing(peer);
                self.num_writing += 1;
                true
            }
            _ => false,
        }
    }

    /// The disk task confirmed the block hit the disk.
    pub fn mark_finished(&mut self, block: usize) {
        debug_assert!(matches!(self.blocks[block], BlockState::Writing(_)));
        if let BlockState::Writing(peer) = self.blocks[block] {
            self.blocks[block] = BlockState::Finished(Some(peer));
            self.num_writing -= 1;
            self.num_finished += 1;
        }
    }

    /// Clears the peer's outstanding request for the block. If no other peer
    /// had the block requested, it returns to open.
    pub fn abort_request(&mut self, block: usize, peer: PeerKey) {
        if let BlockState::Requested(peers) = &mut self.blocks[block] {
            peers.retain(|p| *p != peer);
            if peers.is_empty() {
                self.blocks[block] = BlockState::Open;
                self.num_requested -= 1;
            }
        }
    }

    /// The disk write of the block failed; it needs to be downloaded again.
    /// The supplying peer is not to blame, so no attribution is recorded.
    pub fn write_failed(&mut self, block: usize) {
        debug_assert!(matches!(self.blocks[block], BlockState::Writing(_)));
        if matches!(self.blocks[block], BlockState::Writing(_)) {
            self.blocks[block] = BlockState::Open;
            self.num_writing -= 1;
        }
    }

    /// Reverts a single finished block to open (used when v2 block hashes
    /// pinpoint one corrupt block).
    pub fn revert_block(&mut self, block: usize) {
        if matches!(self.blocks[block], BlockState::Finished(_)) {
            self.blocks[block] = BlockState::Open;
            self.num_finished -= 1;
        }
    }

    /// Clears the peer's outstanding requests across all blocks, returning
    /// the indices of blocks that became open again. Writing and finished
    /// blocks are unaffected: those bytes have already arrived.
    pub fn abort_peer_requests(&mut self, peer: PeerKey) -> Vec<usize> {
        let mut freed = Vec::new();
        for block in 0..self.blocks.len() {
            if let BlockState::Requested(peers) = &mut self.blocks[block] {
                peers.retain(|p| *p != peer);
                if peers.is_empty() {
                    self.blocks[block] = BlockState::Open;
                    self.num_requested -= 1;
                    freed.push(block);
                }
            }
        }
        freed
    }

    /// The peer that owns each block's latest download attempt, if any.
    pub fn downloaders(&self) -> Vec<Option<PeerKey>> {
        self.blocks
            .iter()
            .map(|b| match b {
                BlockState::Open => None,
                BlockState::Requested(peers) => peers.last().copied(),
                BlockState::Writing(peer) => Some(*peer),
                BlockState::Finished(peer) => *peer,
            })
            .collect()
    }

    /// Checks the accounting invariant. Only meaningful in debug builds.
    pub fn assert_accounting(&self) {
        debug_assert_eq!(
            self.num_open()
                + self.num_requested
                + self.num_writing
                + self.num_finished,
            self.blocks.len()
        );
        debug_assert_eq!(
            self.num_requested,
            self.blocks
                .iter()
                .filter(|b| matches!(b, BlockState::Requested(_)))
                .count()
        );
        debug_assert_eq!(
            self.num_writing,
            self.blocks
                .iter()
                .filter(|b| matches!(b, BlockState::Writing(_)))
                .count()
        );
        debug_assert_eq!(
            self.num_finished,
            self.blocks
                .iter()
                .filter(|b| matches!(b, BlockState::Finished(_)))
                .count()
        );
    }
}
