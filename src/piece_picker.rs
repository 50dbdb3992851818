//! The piece picker decides which blocks to request from which peers.
//!
//! It keeps, for every piece: its priority, its availability in the swarm,
//! and, while the piece is downloading, the per-block owner map. Ownership
//! is strict: outside end-game mode a block is outstanding towards at most
//! one peer, and every request a session has in flight has a matching entry
//! here.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::{
    download::PieceDownload, Bitfield, BlockInfo, PeerKey, PieceIndex,
};

/// Piece and file priorities: 0 means do-not-download, 1 is the default,
/// 7 is reserved for time-critical pieces.
pub type Priority = u8;

pub const PRIO_DONT_DOWNLOAD: Priority = 0;
pub const PRIO_DEFAULT: Priority = 1;
pub const PRIO_TIME_CRITICAL: Priority = 7;
pub const PRIO_MAX: Priority = 7;

/// Options controlling a single `pick` call.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PickOptions {
    /// Pick pieces in ascending index order instead of rarest first (used
    /// for streaming and for swarm-health strategies while seeding).
    pub sequential: bool,
    /// Reverse the main ordering: descending index when sequential, most
    /// available first when rarest-first.
    pub reverse: bool,
    /// Prefer pieces that already have blocks downloaded, reducing the
    /// number of concurrently open pieces and write-queue churn.
    pub prioritize_partials: bool,
    /// Consider the pieces the peer suggested (BEP 6 suggest messages)
    /// ahead of the main ordering.
    pub suggest: bool,
    /// End-game: a block may be requested from multiple peers at once; the
    /// first arrival wins.
    pub end_game: bool,
    /// When nonzero, once a piece has been picked keep picking neighboring
    /// pieces until roughly this many blocks have been returned, to build
    /// contiguous ranges (large web-seed style requests).
    pub prefer_contiguous_blocks: u32,
}

/// Per-piece bookkeeping.
#[derive(Clone, Debug)]
struct Piece {
    /// The piece's priority, 0..=7. Priority 0 removes the piece from all
    /// picking.
    priority: Priority,
    /// The number of peers in the swarm known to have this piece.
    availability: usize,
    /// Whether we have the (hash-checked) piece.
    have: bool,
    /// The deadline of a time-critical piece. Pieces with a deadline sort
    /// before everything else, earliest deadline first.
    deadline: Option<Instant>,
    /// Whether completion of this piece should be announced with an alert.
    alert_when_available: bool,
}

impl Default for Piece {
    fn default() -> Self {
        Self {
            priority: PRIO_DEFAULT,
            availability: 0,
            have: false,
            deadline: None,
            alert_when_available: false,
        }
    }
}

pub(crate) struct PiecePicker {
    /// Per-piece state, indexed by piece.
    pieces: Vec<Piece>,
    /// The length of each piece; only the last piece may differ.
    piece_len: u32,
    last_piece_len: u32,
    /// Trailing pad bytes per piece, parallel to `pieces`. Almost always
    /// zero; nonzero only where pad files overlap the piece.
    pad_bytes: Vec<u32>,
    /// The in-progress pieces and their per-block owner maps.
    downloads: HashMap<PieceIndex, PieceDownload>,
    /// The number of pieces we have.
    num_have: usize,
    /// The number of pieces with nonzero priority that we don't have yet.
    num_wanted_missing: usize,
    /// Seed for the rarest-first tie break, fixed per picker so different
    /// sessions pick differently but one session is deterministic.
    seed: u64,
    /// When at most this many wanted pieces are missing, `is_end_game`
    /// reports true.
    end_game_threshold: usize,
    /// How many peers a single block may be requested from in end-game.
    end_game_bound: usize,
}

impl PiecePicker {
    /// Creates a picker for a torrent with the given piece geometry.
    /// `pad_bytes` lists the trailing pad bytes of each piece; pieces that
    /// are nothing but padding are marked had from the start.
    pub fn new(
        piece_count: usize,
        piece_len: u32,
        last_piece_len: u32,
        pad_bytes: Vec<u32>,
        seed: u64,
        end_game_threshold: usize,
        end_game_bound: usize,
    ) -> Self {
        debug_assert!(piece_count > 0);
        debug_assert_eq!(pad_bytes.len(), piece_count);
        let mut picker = Self {
            pieces: vec![Piece::default(); piece_count],
            piece_len,
            last_piece_len,
            pad_bytes,
            downloads: HashMap::new(),
            num_have: 0,
            num_wanted_missing: piece_count,
            seed,
            end_game_threshold,
            end_game_bound,
        };
        // all-pad pieces are had at time zero: nothing to fetch, nothing to
        // hash
        for index in 0..piece_count {
            if picker.pad_bytes[index] == picker.piece_len_at(index) {
                picker.we_have(index);
            }
        }
        picker
    }

    fn piece_len_at(&self, index: PieceIndex) -> u32 {
        if index + 1 == self.pieces.len() {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    /// The number of pieces we have.
    pub fn num_have(&self) -> usize {
        self.num_have
    }

    /// True once every wanted piece is had.
    pub fn is_complete(&self) -> bool {
        self.num_wanted_missing == 0
    }

    /// True when few enough wanted pieces are missing that duplicate
    /// end-game requests are worthwhile.
    pub fn is_end_game(&self) -> bool {
        self.num_wanted_missing <= self.end_game_threshold
    }

    pub fn own_pieces(&self) -> Bitfield {
        let mut bitfield = Bitfield::with_capacity(self.pieces.len());
        for piece in &self.pieces {
            bitfield.push(piece.have);
        }
        bitfield
    }

    /// Registers that a peer has the piece (from a have message).
    pub fn inc_refcount(&mut self, index: PieceIndex) {
        if let Some(piece) = self.pieces.get_mut(index) {
            piece.availability += 1;
        } else {
            debug_assert!(false, "invalid piece index {}", index);
        }
    }

    /// Removes one peer's claim on the piece.
    pub fn dec_refcount(&mut self, index: PieceIndex) {
        if let Some(piece) = self.pieces.get_mut(index) {
            debug_assert!(piece.availability > 0);
            piece.availability = piece.availability.saturating_sub(1);
        } else {
            debug_assert!(false, "invalid piece index {}", index);
        }
    }

    /// Registers a whole peer bitfield, as received right after the
    /// handshake. Returns true if the peer has any piece we still want
    /// (i.e. whether we are interested in the peer).
    pub fn register_peer_pieces(&mut self, bitfield: &Bitfield) -> bool {
        let mut interested = false;
        for (index, piece) in self.pieces.iter_mut().enumerate() {
            if bitfield.get(index).copied().unwrap_or(false) {
                piece.availability += 1;
                if !piece.have && piece.priority > PRIO_DONT_DOWNLOAD {
                    interested = true;
                }
            }
        }
        interested
    }

    /// Takes a disconnecting peer's bitfield back out of the availability
    /// counts.
    pub fn unregister_peer_pieces(&mut self, bitfield: &Bitfield) {
        for (index, piece) in self.pieces.iter_mut().enumerate() {
            if bitfield.get(index).copied().unwrap_or(false) {
                debug_assert!(piece.availability > 0);
                piece.availability = piece.availability.saturating_sub(1);
            }
        }
    }

    /// Copies the availability of every piece into the given vector.
    pub fn get_availability(&self, out: &mut Vec<usize>) {
        out.clear();
        out.extend(self.pieces.iter().map(|piece| piece.availability));
    }

    pub fn availability(&self, index: PieceIndex) -> usize {
        self.pieces[index].availability
    }

    /// Sets the piece's priority. Priority 0 removes the piece from all
    /// picking (outstanding requests are not cancelled here; the torrent
    /// tier decides that).
    pub fn set_piece_priority(&mut self, index: PieceIndex, priority: Priority) {
        debug_assert!(priority <= PRIO_MAX);
        let piece = &mut self.pieces[index];
        let was_wanted = piece.priority > PRIO_DONT_DOWNLOAD;
        let wanted = priority > PRIO_DONT_DOWNLOAD;
        piece.priority = priority.min(PRIO_MAX);
        if !piece.have {
            match (was_wanted, wanted) {
                (true, false) => self.num_wanted_missing -= 1,
                (false, true) => self.num_wanted_missing += 1,
                _ => {}
            }
        }
    }

    pub fn piece_priority(&self, index: PieceIndex) -> Priority {
        self.pieces[index].priority
    }

    /// Boosts the piece to time-critical: it is picked before everything
    /// else, ordered by deadline.
    pub fn set_piece_deadline(
        &mut self,
        index: PieceIndex,
        deadline: Duration,
        alert_when_available: bool,
    ) {
        let piece = &mut self.pieces[index];
        if piece.have {
            return;
        }
        piece.deadline = Some(Instant::now() + deadline);
        piece.alert_when_available = alert_when_available;
        if piece.priority == PRIO_DONT_DOWNLOAD {
            self.set_piece_priority(index, PRIO_TIME_CRITICAL);
        } else {
            piece.priority = PRIO_TIME_CRITICAL;
        }
    }

    /// Clears a piece's deadline, demoting it back to default priority.
    pub fn reset_piece_deadline(&mut self, index: PieceIndex) {
        let piece = &mut self.pieces[index];
        piece.deadline = None;
        piece.alert_when_available = false;
        if piece.priority == PRIO_TIME_CRITICAL {
            piece.priority = PRIO_DEFAULT;
        }
    }

    /// Whether the piece wants an alert on completion.
    pub fn alert_when_available(&self, index: PieceIndex) -> bool {
        self.pieces[index].alert_when_available
    }

    /// Marks the piece as had (hash checked, or trusted in seed mode).
    /// Clears any download state for it.
    pub fn we_have(&mut self, index: PieceIndex) {
        let piece = &mut self.pieces[index];
        if piece.have {
            return;
        }
        piece.have = true;
        piece.deadline = None;
        if piece.priority > PRIO_DONT_DOWNLOAD {
            self.num_wanted_missing -= 1;
        }
        self.num_have += 1;
        self.downloads.remove(&index);
    }

    /// Marks a previously had piece as missing again (e.g. seed-mode
    /// downgrade after a failed lazy check).
    pub fn we_dont_have(&mut self, index: PieceIndex) {
        let piece = &mut self.pieces[index];
        if !piece.have {
            return;
        }
        piece.have = false;
        if piece.priority > PRIO_DONT_DOWNLOAD {
            self.num_wanted_missing += 1;
        }
        self.num_have -= 1;
    }

    /// Whether we have the piece.
    pub fn have_piece(&self, index: PieceIndex) -> bool {
        self.pieces[index].have
    }

    /// Picks up to `num_blocks` blocks to request from the peer, in policy
    /// order, and marks each as requested by `peer`.
    ///
    /// Every returned block lies in a piece the peer claims to have, is not
    /// had or being written, and (outside end-game) is not outstanding
    /// towards any other peer.
    pub fn pick(
        &mut self,
        peer_has: &Bitfield,
        num_blocks: usize,
        peer: PeerKey,
        options: PickOptions,
        suggested: &[PieceIndex],
    ) -> Vec<BlockInfo> {
        let mut picked = Vec::with_capacity(num_blocks);
        if num_blocks == 0 {
            return picked;
        }

        let candidates = self.candidate_pieces(peer_has, options, suggested);

        for index in candidates {
            if picked.len() >= num_blocks {
                break;
            }
            let picked_before = picked.len();
            self.pick_in_piece(index, peer, options, num_blocks, &mut picked);

            // extent affinity: once a piece yielded blocks, keep walking
            // into its forward neighbors until the contiguous target is
            // reached
            if options.prefer_contiguous_blocks > 0
                && picked.len() > picked_before
            {
                let target = (options.prefer_contiguous_blocks as usize)
                    .min(num_blocks);
                let mut next = index + 1;
                while picked.len() < target
                    && next < self.pieces.len()
                    && self.is_pickable(next, peer_has)
                {
                    self.pick_in_piece(next, peer, options, target, &mut picked);
                    next += 1;
                }
            }
        }

        picked
    }

    /// Records a request made outside of `pick` (e.g. an allowed-fast
    /// request issued while choked). Returns false if the block is already
    /// being written or finished and must not be requested.
    pub fn mark_as_downloading(
        &mut self,
        block: BlockInfo,
        peer: PeerKey,
    ) -> bool {
        let download = self.download_entry(block.piece_index);
        download.mark_requested(block.index_in_piece(), peer)
    }

    /// The block arrived from the peer and is being handed to disk. Returns
    /// false for redundant end-game arrivals, which the caller discards.
    pub fn mark_as_writing(&mut self, block: BlockInfo, peer: PeerKey) -> bool {
        match self.downloads.get_mut(&block.piece_index) {
            Some(download) => download.mark_writing(block.index_in_piece(), peer),
            None => false,
        }
    }

    /// The disk task confirmed the block was written.
    pub fn mark_as_finished(&mut self, block: BlockInfo) {
        if let Some(download) = self.downloads.get_mut(&block.piece_index) {
            download.mark_finished(block.index_in_piece());
            download.assert_accounting();
        }
    }

    /// True once every block of the piece has been written and the piece is
    /// ready for hashing.
    pub fn is_piece_ready_for_hash(&self, index: PieceIndex) -> bool {
        self.downloads
            .get(&index)
            .map(|d| d.is_complete())
            .unwrap_or(false)
    }

    /// Clears a single outstanding request. If no other peer had the block
    /// requested it returns to open.
    pub fn abort_download(&mut self, block: BlockInfo, peer: PeerKey) {
        if let Some(download) = self.downloads.get_mut(&block.piece_index) {
            download.abort_request(block.index_in_piece(), peer);
            download.assert_accounting();
        }
    }

    /// Clears all of a disconnecting peer's outstanding requests, in every
    /// piece. Downloads with no remaining progress are dropped.
    pub fn abort_all_downloads(&mut self, peer: PeerKey) {
        for download in self.downloads.values_mut() {
            download.abort_peer_requests(peer);
            download.assert_accounting();
        }
        self.prune_idle_downloads();
    }

    /// A block failed to be written to disk; it returns to open. The
    /// supplying peer is not blamed, the fault is local.
    pub fn write_failed(&mut self, block: BlockInfo) {
        if let Some(download) = self.downloads.get_mut(&block.piece_index) {
            download.write_failed(block.index_in_piece());
            download.assert_accounting();
        }
    }

    /// Reverts one finished block of a piece (v2 block-hash attribution
    /// identified it as the sole corrupt block).
    pub fn revert_block(&mut self, block: BlockInfo) {
        if let Some(download) = self.downloads.get_mut(&block.piece_index) {
            download.revert_block(block.index_in_piece());
            download.assert_accounting();
        }
    }

    /// Forgets all progress on a piece (hash failure). Returns the
    /// per-block list of contributing peers so they can be fed to the ban
    /// policy.
    pub fn restore_piece(&mut self, index: PieceIndex) -> Vec<Option<PeerKey>> {
        match self.downloads.remove(&index) {
            Some(download) => download.downloaders(),
            None => Vec::new(),
        }
    }

    /// The peer owning each block's latest download attempt.
    pub fn get_downloaders(&self, index: PieceIndex) -> Vec<Option<PeerKey>> {
        self.downloads
            .get(&index)
            .map(|d| d.downloaders())
            .unwrap_or_default()
    }

    /// The `BlockInfo` for a block index of a piece, pad-trimmed.
    pub fn block_info(&self, index: PieceIndex, block: usize) -> BlockInfo {
        match self.downloads.get(&index) {
            Some(download) => download.block_info(block),
            None => {
                let download = PieceDownload::new(
                    index,
                    self.piece_len_at(index),
                    self.pad_bytes[index],
                );
                download.block_info(block)
            }
        }
    }

    fn download_entry(&mut self, index: PieceIndex) -> &mut PieceDownload {
        let piece_len = self.piece_len_at(index);
        let pad_bytes = self.pad_bytes[index];
        self.downloads
            .entry(index)
            .or_insert_with(|| PieceDownload::new(index, piece_len, pad_bytes))
    }

    fn prune_idle_downloads(&mut self) {
        self.downloads.retain(|_, download| {
            download.num_open() != download.block_count()
        });
    }

    /// Whether the piece can contribute blocks for the peer at all.
    fn is_pickable(&self, index: PieceIndex, peer_has: &Bitfield) -> bool {
        let piece = &self.pieces[index];
        !piece.have
            && piece.priority > PRIO_DONT_DOWNLOAD
            && peer_has.get(index).copied().unwrap_or(false)
    }

    /// Produces the ordered list of candidate pieces for a pick.
    fn candidate_pieces(
        &self,
        peer_has: &Bitfield,
        options: PickOptions,
        suggested: &[PieceIndex],
    ) -> Vec<PieceIndex> {
        let mut candidates = Vec::new();

        // 1. time-critical pieces, earliest deadline first
        let mut critical: Vec<PieceIndex> = (0..self.pieces.len())
            .filter(|index| {
                self.pieces[*index].deadline.is_some()
                    && self.is_pickable(*index, peer_has)
            })
            .collect();
        critical.sort_by_key(|index| self.pieces[*index].deadline);
        candidates.extend(critical);

        // 2. suggested pieces
        if options.suggest {
            for index in suggested {
                if *index < self.pieces.len()
                    && self.is_pickable(*index, peer_has)
                    && !candidates.contains(index)
                {
                    candidates.push(*index);
                }
            }
        }

        // 3. partial pieces, rarest first among them
        if options.prioritize_partials {
            let mut partials: Vec<PieceIndex> = self
                .downloads
                .keys()
                .copied()
                .filter(|index| {
                    self.is_pickable(*index, peer_has)
                        && !candidates.contains(index)
                })
                .collect();
            partials.sort_by_key(|index| {
                (
                    self.pieces[*index].availability,
                    self.tie_break(*index),
                )
            });
            candidates.extend(partials);
        }

        // 4. the main ordering over all remaining pickable pieces
        let mut rest: Vec<PieceIndex> = (0..self.pieces.len())
            .filter(|index| {
                self.is_pickable(*index, peer_has)
                    && !candidates.contains(index)
            })
            .collect();
        if options.sequential {
            // ascending indices; reverse flips to descending
            if options.reverse {
                rest.reverse();
            }
        } else {
            // rarest first: group by availability, then the seeded tie
            // break so different sessions pick different pieces within an
            // availability group
            rest.sort_by_key(|index| {
                (self.pieces[*index].availability, self.tie_break(*index))
            });
            if options.reverse {
                rest.reverse();
            }
        }
        // higher priority pieces come before lower priority ones no matter
        // the base ordering (stable sort preserves it within a group)
        rest.sort_by_key(|index| {
            std::cmp::Reverse(self.pieces[*index].priority)
        });
        candidates.extend(rest);

        candidates
    }

    /// Picks as many blocks as allowed from one piece.
    fn pick_in_piece(
        &mut self,
        index: PieceIndex,
        peer: PeerKey,
        options: PickOptions,
        num_blocks: usize,
        picked: &mut Vec<BlockInfo>,
    ) {
        let end_game_bound = self.end_game_bound;
        let download = self.download_entry(index);
        while picked.len() < num_blocks {
            match download.pick_block(peer, options.end_game, end_game_bound)
            {
                Some(block) => picked.push(download.block_info(block)),
                None => break,
            }
        }
        download.assert_accounting();
        // an entry created speculatively that yielded nothing shouldn't
        // linger as a partial piece
        if download.num_open() == download.block_count() {
            self.downloads.remove(&index);
        }
    }

    /// Folds the per-picker seed with a piece index into the tie break used
    /// within an availability group.
    fn tie_break(&self, index: PieceIndex) -> u64 {
        // multiplicative hashing with the golden-ratio constant
        (self.seed ^ (index as u64)).wrapping_mul(0x9e37_79b9_7f4a_7c15)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{block_count, BLOCK_LEN};

    const PIECE_LEN: u32 = 4 * BLOCK_LEN;

    fn picker(piece_count: usize) -> PiecePicker {
        PiecePicker::new(
            piece_count,
            PIECE_LEN,
            PIECE_LEN,
            vec![0; piece_count],
            0,
            2,
            3,
        )
    }

    fn all_set(piece_count: usize) -> Bitfield {
        let mut bitfield = Bitfield::with_capacity(piece_count);
        bitfield.resize(piece_count, true);
        bitfield
    }

    #[test]
    fn test_pick_respects_peer_bitfield() {
        let mut picker = picker(4);
        let mut peer_has = all_set(4);
        peer_has.set(0, false);
        peer_has.set(2, false);

        let picked =
            picker.pick(&peer_has, 100, 1, PickOptions::default(), &[]);
        let pieces: std::collections::HashSet<_> =
            picked.iter().map(|b| b.piece_index).collect();
        assert!(pieces.contains(&1));
        assert!(pieces.contains(&3));
        assert!(!pieces.contains(&0));
        assert!(!pieces.contains(&2));
        // every block is now owned by peer 1
        for block in &picked {
            assert!(!picker.mark_as_downloading(*block, 1));
        }
    }

    #[test]
    fn test_pick_excludes_have_and_zero_priority() {
        let mut picker = picker(4);
        picker.we_have(1);
        picker.set_piece_priority(2, PRIO_DONT_DOWNLOAD);

        let picked =
            picker.pick(&all_set(4), 100, 1, PickOptions::default(), &[]);
        let pieces: std::collections::HashSet<_> =
            picked.iter().map(|b| b.piece_index).collect();
        assert_eq!(
            pieces,
            vec![0, 3].into_iter().collect::<std::collections::HashSet<_>>()
        );
    }

    #[test]
    fn test_rarest_first_ordering() {
        let mut picker = picker(3);
        // piece 2 is the rarest
        for _ in 0..3 {
            picker.inc_refcount(0);
        }
        for _ in 0..2 {
            picker.inc_refcount(1);
        }
        picker.inc_refcount(2);

        let picked = picker.pick(
            &all_set(3),
            block_count(PIECE_LEN),
            1,
            PickOptions::default(),
            &[],
        );
        assert!(picked.iter().all(|b| b.piece_index == 2));
    }

    #[test]
    fn test_sequential_ordering() {
        let mut picker = picker(3);
        // make piece 2 rarest so sequential demonstrably overrides it
        for _ in 0..3 {
            picker.inc_refcount(0);
        }
        for _ in 0..3 {
            picker.inc_refcount(1);
        }
        picker.inc_refcount(2);

        let options = PickOptions {
            sequential: true,
            ..Default::default()
        };
        let picked =
            picker.pick(&all_set(3), block_count(PIECE_LEN), 1, options, &[]);
        assert!(picked.iter().all(|b| b.piece_index == 0));

        let options = PickOptions {
            sequential: true,
            reverse: true,
            ..Default::default()
        };
        let picked =
            picker.pick(&all_set(3), block_count(PIECE_LEN), 2, options, &[]);
        assert!(picked.iter().all(|b| b.piece_index == 2));
    }

    #[test]
    fn test_time_critical_first() {
        let mut picker = picker(4);
        // piece 3 rarest, but piece 1 is time critical
        picker.inc_refcount(0);
        picker.inc_refcount(1);
        picker.inc_refcount(2);
        picker.set_piece_deadline(1, Duration::from_secs(1), true);

        let picked = picker.pick(
            &all_set(4),
            block_count(PIECE_LEN),
            1,
            PickOptions::default(),
            &[],
        );
        assert!(picked.iter().all(|b| b.piece_index == 1));
        assert!(picker.alert_when_available(1));
        assert_eq!(picker.piece_priority(1), PRIO_TIME_CRITICAL);
    }

    #[test]
    fn test_suggested_pieces() {
        let mut picker = picker(4);
        // piece 3 would win rarest-first
        picker.inc_refcount(0);
        picker.inc_refcount(1);
        picker.inc_refcount(2);

        let options = PickOptions {
            suggest: true,
            ..Default::default()
        };
        let picked = picker.pick(
            &all_set(4),
            block_count(PIECE_LEN),
            1,
            options,
            &[2],
        );
        assert!(picked.iter().all(|b| b.piece_index == 2));
    }

    #[test]
    fn test_prioritize_partials() {
        let mut picker = picker(4);
        // peer 1 started piece 2 then vanished mid-piece
        let block = BlockInfo {
            piece_index: 2,
            offset: 0,
            len: BLOCK_LEN,
        };
        assert!(picker.mark_as_downloading(block, 1));
        assert!(picker.mark_as_writing(block, 1));

        let options = PickOptions {
            prioritize_partials: true,
            ..Default::default()
        };
        let picked = picker.pick(&all_set(4), 1, 2, options, &[]);
        assert_eq!(picked[0].piece_index, 2);
        assert_eq!(picked[0].offset, BLOCK_LEN);
    }

    #[test]
    fn test_no_duplicate_requests_outside_end_game() {
        let mut picker = picker(1);
        let picked =
            picker.pick(&all_set(1), 100, 1, PickOptions::default(), &[]);
        assert_eq!(picked.len(), block_count(PIECE_LEN));

        // another peer gets nothing
        let picked =
            picker.pick(&all_set(1), 100, 2, PickOptions::default(), &[]);
        assert!(picked.is_empty());
    }

    #[test]
    fn test_end_game_duplicates_bounded() {
        let mut picker = picker(1);
        let options = PickOptions {
            end_game: true,
            ..Default::default()
        };
        let first = picker.pick(&all_set(1), 100, 1, options, &[]);
        assert_eq!(first.len(), block_count(PIECE_LEN));

        // further peers each get the same blocks, up to the bound of 3
        // owners per block
        for peer in 2..=3 {
            let picked = picker.pick(&all_set(1), 100, peer, options, &[]);
            assert_eq!(picked.len(), block_count(PIECE_LEN));
        }
        let picked = picker.pick(&all_set(1), 100, 4, options, &[]);
        assert!(picked.is_empty());

        // first arrival wins; the others are redundant
        let block = first[0];
        assert!(picker.mark_as_writing(block, 2));
        assert!(!picker.mark_as_writing(block, 1));
        assert!(!picker.mark_as_writing(block, 3));
    }

    #[test]
    fn test_end_game_threshold() {
        let mut picker = picker(4);
        assert!(!picker.is_end_game());
        picker.we_have(0);
        picker.we_have(1);
        // 2 missing <= threshold of 2
        assert!(picker.is_end_game());
    }

    #[test]
    fn test_restore_piece_surfaces_downloaders() {
        let mut picker = picker(1);
        // two peers split the piece's four blocks
        for (peer, blocks) in &[(1u32, 0..2), (2u32, 2..4)] {
            for block in blocks.clone() {
                let info = BlockInfo {
                    piece_index: 0,
                    offset: block * BLOCK_LEN,
                    len: BLOCK_LEN,
                };
                assert!(picker.mark_as_downloading(info, *peer));
                assert!(picker.mark_as_writing(info, *peer));
                picker.mark_as_finished(info);
            }
        }
        assert!(picker.is_piece_ready_for_hash(0));
        assert_eq!(
            picker.get_downloaders(0),
            vec![Some(1), Some(1), Some(2), Some(2)]
        );

        // hash failed: all progress forgotten, contributors surfaced
        let downloaders = picker.restore_piece(0);
        assert_eq!(downloaders, vec![Some(1), Some(1), Some(2), Some(2)]);
        assert!(!picker.is_piece_ready_for_hash(0));

        // the piece is downloadable from scratch again
        let picked =
            picker.pick(&all_set(1), 100, 3, PickOptions::default(), &[]);
        assert_eq!(picked.len(), block_count(PIECE_LEN));
    }

    #[test]
    fn test_abort_download_reopens_block() {
        let mut picker = picker(1);
        let picked =
            picker.pick(&all_set(1), 1, 1, PickOptions::default(), &[]);
        let block = picked[0];

        picker.abort_download(block, 1);
        // the block is pickable again by another peer
        let picked =
            picker.pick(&all_set(1), 1, 2, PickOptions::default(), &[]);
        assert_eq!(picked[0], block);
    }

    #[test]
    fn test_write_failed_reopens_block() {
        let mut picker = picker(1);
        let picked =
            picker.pick(&all_set(1), 1, 1, PickOptions::default(), &[]);
        let block = picked[0];
        assert!(picker.mark_as_writing(block, 1));

        picker.write_failed(block);
        let picked =
            picker.pick(&all_set(1), 1, 2, PickOptions::default(), &[]);
        assert_eq!(picked[0], block);
    }

    #[test]
    fn test_all_pad_piece_is_have_at_time_zero() {
        let picker = PiecePicker::new(
            2,
            PIECE_LEN,
            PIECE_LEN,
            vec![0, PIECE_LEN],
            0,
            0,
            3,
        );
        assert!(!picker.have_piece(0));
        assert!(picker.have_piece(1));
        assert_eq!(picker.num_have(), 1);
    }

    #[test]
    fn test_pad_bytes_never_requested() {
        // one piece whose second half is padding
        let mut picker = PiecePicker::new(
            1,
            PIECE_LEN,
            PIECE_LEN,
            vec![2 * BLOCK_LEN],
            0,
            0,
            3,
        );
        let picked =
            picker.pick(&all_set(1), 100, 1, PickOptions::default(), &[]);
        // only the two data blocks come back
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|b| b.offset < 2 * BLOCK_LEN));
    }

    #[test]
    fn test_availability_refcounting() {
        let mut picker = picker(3);
        let mut bitfield = all_set(3);
        bitfield.set(1, false);
        assert!(picker.register_peer_pieces(&bitfield));
        picker.inc_refcount(1);

        let mut availability = Vec::new();
        picker.get_availability(&mut availability);
        assert_eq!(availability, vec![1, 1, 1]);

        picker.unregister_peer_pieces(&bitfield);
        picker.get_availability(&mut availability);
        assert_eq!(availability, vec![0, 1, 0]);
    }

    #[test]
    fn test_completion_accounting() {
        let mut picker = picker(2);
        assert!(!picker.is_complete());
        picker.we_have(0);
        picker.we_have(1);
        assert!(picker.is_complete());
        assert_eq!(picker.num_have(), 2);

        picker.we_dont_have(1);
        assert!(!picker.is_complete());
        assert_eq!(picker.num_have(), 1);
    }

    #[test]
    fn test_prefer_contiguous_blocks() {
        let mut picker = picker(4);
        // piece 1 would be picked first by rarest-first; with a contiguous
        // budget the picker walks forward into neighboring pieces
        picker.inc_refcount(0);
        picker.inc_refcount(2);
        picker.inc_refcount(3);

        let options = PickOptions {
            prefer_contiguous_blocks: 2 * block_count(PIECE_LEN) as u32,
            ..Default::default()
        };
        let picked = picker.pick(
            &all_set(4),
            2 * block_count(PIECE_LEN),
            1,
            options,
            &[],
        );
        let pieces: Vec<_> = picked.iter().map(|b| b.piece_index).collect();
        assert!(pieces.contains(&1));
        assert!(pieces.contains(&2));
    }
}
