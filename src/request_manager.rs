//! Decides which piece a ready session works on next.
//!
//! A piece becomes *active* the first time any session requests from it and stays active until
//! it completes or until nobody has chunks of it in flight anymore. Sessions first help finish
//! active pieces, which keeps the number of half-done pieces low. Only when none of those has
//! an unrequested chunk left that the peer can serve is a new piece picked, at random among the
//! pieces the peer has and nobody is working on.

use rand::seq::IteratorRandom;
use tracing::trace;

use crate::{bitfield::Bitfield, piece::Piece};

#[derive(Debug, Clone)]
pub struct RequestManager {
    active: Bitfield,
}

impl RequestManager {
    pub fn new(n_pieces: usize) -> Self {
        Self {
            active: Bitfield::new(n_pieces),
        }
    }

    pub fn active(&self) -> &Bitfield {
        &self.active
    }

    pub fn is_active(&self, index: usize) -> bool {
        self.active.is_set(index)
    }

    /// The piece a session with availability `peer_has` should request from, marking it active.
    /// `None` means the peer has nothing left for us right now.
    pub fn select_piece(
        &mut self,
        peer_has: &Bitfield,
        completed: &Bitfield,
        pieces: &[Piece],
    ) -> Option<usize> {
        // continue an active piece first
        if let Some(index) = self
            .active
            .and(peer_has)
            .set_indices()
            .find(|&i| pieces[i].has_unrequested())
        {
            return Some(index);
        }

        let busy = self.active.or(completed);
        let index = peer_has
            .difference(&busy)
            .set_indices()
            .choose(&mut rand::rng())?;
        trace!(piece = index, "activating piece");
        self.active.set(index);
        Some(index)
    }

    /// Whether [`RequestManager::select_piece`] would find something, without activating it.
    pub fn has_assignable(
        &self,
        peer_has: &Bitfield,
        completed: &Bitfield,
        pieces: &[Piece],
    ) -> bool {
        self.active
            .and(peer_has)
            .set_indices()
            .any(|i| pieces[i].has_unrequested())
            || peer_has.difference(&self.active.or(completed)).cardinality() > 0
    }

    /// Drops a piece from the active set, used when its last in-flight chunk was given back.
    pub fn release(&mut self, index: usize) {
        if self.active.is_set(index) {
            trace!(piece = index, "releasing piece");
            self.active.unset(index);
        }
    }

    pub fn on_complete(&mut self, index: usize) {
        self.active.unset(index);
    }
}

#[cfg(test)]
mod test_request_manager {
    use super::*;
    use crate::BLOCK_MAX;

    fn pieces(n: usize) -> Vec<Piece> {
        (0..n)
            .map(|i| Piece::new(i as u32, i as u64 * 2 * BLOCK_MAX as u64, 2 * BLOCK_MAX, [0; 20]))
            .collect()
    }

    fn bitfield(len: usize, set: &[usize]) -> Bitfield {
        let mut bitfield = Bitfield::new(len);
        for &i in set {
            bitfield.set(i);
        }
        bitfield
    }

    #[test]
    fn continues_active_piece_first() {
        let pieces = pieces(3);
        let mut manager = RequestManager::new(3);
        manager.active.set(1);
        let peer = bitfield(3, &[0, 1, 2]);
        let completed = Bitfield::new(3);
        for _ in 0..20 {
            assert_eq!(manager.select_piece(&peer, &completed, &pieces), Some(1));
        }
        assert_eq!(manager.active().set_indices().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn picks_new_piece_when_active_ones_are_exhausted() {
        let mut pieces = pieces(3);
        let mut manager = RequestManager::new(3);
        manager.active.set(1);
        while pieces[1].next_chunk().is_some() {}
        let peer = bitfield(3, &[0, 1, 2]);
        let completed = bitfield(3, &[2]);

        assert_eq!(manager.select_piece(&peer, &completed, &pieces), Some(0));
        assert!(manager.is_active(0));
    }

    #[test]
    fn skips_active_pieces_the_peer_lacks() {
        let pieces = pieces(4);
        let mut manager = RequestManager::new(4);
        manager.active.set(0);
        let peer = bitfield(4, &[3]);
        assert_eq!(
            manager.select_piece(&peer, &Bitfield::new(4), &pieces),
            Some(3)
        );
    }

    #[test]
    fn nothing_when_peer_has_only_completed_pieces() {
        let pieces = pieces(2);
        let mut manager = RequestManager::new(2);
        let peer = bitfield(2, &[0, 1]);
        let completed = bitfield(2, &[0, 1]);
        assert_eq!(manager.select_piece(&peer, &completed, &pieces), None);
        assert_eq!(manager.active().cardinality(), 0);
    }

    #[test]
    fn assignable_matches_selection() {
        let mut pieces = pieces(2);
        let mut manager = RequestManager::new(2);
        let peer = bitfield(2, &[0]);
        let completed = Bitfield::new(2);
        assert!(manager.has_assignable(&peer, &completed, &pieces));
        assert!(!manager.is_active(0));

        assert_eq!(manager.select_piece(&peer, &completed, &pieces), Some(0));
        while pieces[0].next_chunk().is_some() {}
        assert!(!manager.has_assignable(&peer, &completed, &pieces));
        assert_eq!(manager.select_piece(&peer, &completed, &pieces), None);

        pieces[0].cancel_request(BLOCK_MAX);
        assert!(manager.has_assignable(&peer, &completed, &pieces));
    }

    #[test]
    fn release_and_complete_clear_the_active_bit() {
        let pieces = pieces(2);
        let mut manager = RequestManager::new(2);
        let peer = bitfield(2, &[0]);
        assert_eq!(
            manager.select_piece(&peer, &Bitfield::new(2), &pieces),
            Some(0)
        );
        manager.release(0);
        assert!(!manager.is_active(0));
        manager.active.set(1);
        manager.on_complete(1);
        assert_eq!(manager.active().cardinality(), 0);
    }
}
