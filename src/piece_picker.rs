//! The piece picker tracks which pieces we have, which are assigned to a
//! session, and picks the next piece a given peer can provide.
//!
//! It is the only state shared across peer sessions. The torrent wraps it in
//! an `Arc<RwLock>`, which serializes all mutations; within the lock every
//! operation below is atomic with respect to the others.

use crate::{Bitfield, PieceIndex};
use crate::error::*;

pub(crate) struct PiecePicker {
    /// The pieces we have downloaded and verified.
    own_pieces: Bitfield,
    /// The pieces currently assigned to some session. Disjoint from
    /// `own_pieces`: a piece leaves this set either by verifying (into
    /// `own_pieces`) or by being released back to unassigned.
    pending_pieces: Bitfield,
}

impl PiecePicker {
    /// Creates a new piece picker for a torrent with the given number of
    /// pieces, none of which we have.
    pub fn new(piece_count: usize) -> Self {
        Self {
            own_pieces: Bitfield::repeat(false, piece_count),
            pending_pieces: Bitfield::repeat(false, piece_count),
        }
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.own_pieces.len()
    }

    /// The number of pieces downloaded and verified so far.
    pub fn own_piece_count(&self) -> usize {
        self.own_pieces.count_ones()
    }

    /// Picks the lowest indexed piece that the peer has, that we don't
    /// have, and that no session is downloading, and assigns it to the
    /// caller. The caller must eventually either report the piece via
    /// [`Self::received_piece`] or hand it back via [`Self::release_piece`].
    ///
    /// The peer's bitfield may be longer than the torrent's piece count
    /// (wire bitfields are padded to a byte boundary); the excess is
    /// ignored.
    pub fn pick_piece(&mut self, available: &Bitfield) -> Option<PieceIndex> {
        for index in 0..self.piece_count() {
            if available.get(index).copied().unwrap_or(false)
                && !self.own_pieces[index]
                && !self.pending_pieces[index]
            {
                self.pending_pieces.set(index, true);
                return Some(index);
            }
        }
        None
    }

    /// Hands an assigned piece back without completing it, making it
    /// eligible for other sessions again. Used when a session is choked,
    /// disconnects, or downloads a corrupt piece. Releasing a piece that is
    /// not pending (e.g. one that has completed in the meantime) is a no-op.
    pub fn release_piece(&mut self, index: PieceIndex) {
        if index < self.piece_count() && self.pending_pieces[index] {
            self.pending_pieces.set(index, false);
        }
    }

    /// Records that an assigned piece has been downloaded and verified. The
    /// piece is never assigned again.
    ///
    /// Completing a piece that was not pending means two sessions were
    /// downloading it at once or it completed twice; both break the
    /// exclusive assignment guarantee, so the call fails.
    pub fn received_piece(&mut self, index: PieceIndex) -> Result<()> {
        if index >= self.piece_count() || !self.pending_pieces[index] {
            return Err(Error::NotPending(index));
        }
        debug_assert!(!self.own_pieces[index]);
        self.pending_pieces.set(index, false);
        self.own_pieces.set(index, true);
        Ok(())
    }

    /// Returns true if the peer has at least one piece that we are still
    /// missing, i.e. whether it is worth being interested in the peer.
    /// Pending pieces count as missing: their download may yet fail.
    pub fn has_missing_in(&self, available: &Bitfield) -> bool {
        (0..self.piece_count()).any(|index| {
            available.get(index).copied().unwrap_or(false)
                && !self.own_pieces[index]
        })
    }

    /// Returns true if every piece has been downloaded and verified.
    pub fn is_done(&self) -> bool {
        self.own_pieces.all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_bitfield(len: usize) -> Bitfield {
        Bitfield::repeat(true, len)
    }

    #[test]
    fn test_picks_lowest_missing_piece() {
        let mut picker = PiecePicker::new(4);
        let available = full_bitfield(4);

        assert_eq!(picker.pick_piece(&available), Some(0));
        // 0 is now pending, so the next pick moves on
        assert_eq!(picker.pick_piece(&available), Some(1));

        picker.received_piece(0).unwrap();
        picker.received_piece(1).unwrap();
        assert_eq!(picker.pick_piece(&available), Some(2));
    }

    #[test]
    fn test_respects_peer_availability() {
        let mut picker = PiecePicker::new(3);
        let mut available = Bitfield::repeat(false, 3);
        available.set(1, true);

        assert_eq!(picker.pick_piece(&available), Some(1));
        assert_eq!(picker.pick_piece(&available), None);
    }

    #[test]
    fn test_assignments_are_exclusive() {
        // two peers advertising everything must never be handed the same
        // piece
        let mut picker = PiecePicker::new(3);
        let peer_a = full_bitfield(3);
        let peer_b = full_bitfield(3);

        let first = picker.pick_piece(&peer_a).unwrap();
        let second = picker.pick_piece(&peer_b).unwrap();
        let third = picker.pick_piece(&peer_a).unwrap();
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_ne!(first, third);
        assert_eq!(picker.pick_piece(&peer_b), None);
    }

    #[test]
    fn test_completed_piece_is_never_reassigned() {
        let mut picker = PiecePicker::new(2);
        let available = full_bitfield(2);

        assert_eq!(picker.pick_piece(&available), Some(0));
        picker.received_piece(0).unwrap();
        assert_eq!(picker.pick_piece(&available), Some(1));
        picker.release_piece(1);
        // 0 is owned now; only 1 may come back
        assert_eq!(picker.pick_piece(&available), Some(1));
    }

    #[test]
    fn test_released_piece_is_picked_again() {
        let mut picker = PiecePicker::new(2);
        let available = full_bitfield(2);

        assert_eq!(picker.pick_piece(&available), Some(0));
        picker.release_piece(0);
        assert_eq!(picker.pick_piece(&available), Some(0));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut picker = PiecePicker::new(2);
        let available = full_bitfield(2);

        picker.release_piece(0);
        picker.release_piece(0);
        assert_eq!(picker.pick_piece(&available), Some(0));

        // releasing a completed piece must not resurrect it
        picker.received_piece(0).unwrap();
        picker.release_piece(0);
        assert_eq!(picker.pick_piece(&available), Some(1));
    }

    #[test]
    fn test_completing_unassigned_piece_fails() {
        let mut picker = PiecePicker::new(2);
        assert!(matches!(
            picker.received_piece(0),
            Err(Error::NotPending(0))
        ));
        assert!(matches!(
            picker.received_piece(7),
            Err(Error::NotPending(7))
        ));
    }

    #[test]
    fn test_is_done() {
        let mut picker = PiecePicker::new(2);
        let available = full_bitfield(2);
        assert!(!picker.is_done());

        while let Some(index) = picker.pick_piece(&available) {
            picker.received_piece(index).unwrap();
        }
        assert!(picker.is_done());
        assert_eq!(picker.own_piece_count(), 2);
    }

    #[test]
    fn test_interest_probe() {
        let mut picker = PiecePicker::new(2);
        let available = full_bitfield(2);
        let nothing = Bitfield::repeat(false, 2);

        assert!(picker.has_missing_in(&available));
        assert!(!picker.has_missing_in(&nothing));

        // a pending piece still counts as missing
        let index = picker.pick_piece(&available).unwrap();
        assert!(picker.has_missing_in(&available));

        picker.received_piece(index).unwrap();
        let mut only_first = Bitfield::repeat(false, 2);
        only_first.set(0, true);
        assert!(!picker.has_missing_in(&only_first));
    }
}
