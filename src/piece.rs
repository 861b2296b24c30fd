use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::{
    bitfield::Bitfield,
    storage::{Storage, StorageError},
    BLOCK_MAX,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Incomplete,
    Complete,
}

/// A block of a piece, addressed the way REQUEST messages address it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub begin: u32,
    pub length: u32,
}

/// What happened to a block handed to [`Piece::set_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Stored, the piece still misses chunks.
    Stored,
    /// The chunk was already there.
    Duplicate,
    /// Doesn't line up with a chunk of this piece.
    Invalid,
    /// Last chunk stored and the hash matched.
    Completed,
    /// Last chunk stored but the hash didn't match. The piece starts over.
    HashMismatch,
}

#[derive(Debug, Clone)]
pub struct Piece {
    index: u32,
    /// Offset in the concatenated stream of all files.
    offset: u64,
    length: u32,
    hash: [u8; 20],
    requested: Bitfield,
    completed: Bitfield,
    state: PieceState,
}

impl Piece {
    pub fn new(index: u32, offset: u64, length: u32, hash: [u8; 20]) -> Self {
        let n_chunks = length.div_ceil(BLOCK_MAX) as usize;
        Self {
            index,
            offset,
            length,
            hash,
            requested: Bitfield::new(n_chunks),
            completed: Bitfield::new(n_chunks),
            state: PieceState::Incomplete,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn state(&self) -> PieceState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == PieceState::Complete
    }

    pub fn chunk_count(&self) -> usize {
        self.completed.len()
    }

    pub fn requested(&self) -> &Bitfield {
        &self.requested
    }

    pub fn completed(&self) -> &Bitfield {
        &self.completed
    }

    pub fn chunk_len(&self, chunk_i: usize) -> u32 {
        if chunk_i == self.chunk_count() - 1 && self.length % BLOCK_MAX != 0 {
            self.length % BLOCK_MAX
        } else {
            BLOCK_MAX
        }
    }

    /// Whether [`Piece::next_chunk`] would hand out something.
    pub fn has_unrequested(&self) -> bool {
        !self.is_complete() && self.requested.or(&self.completed).unset_indices().next().is_some()
    }

    /// Chunks requested but not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.requested.difference(&self.completed).cardinality()
    }

    /// Claims the lowest chunk that is neither completed nor requested.
    pub fn next_chunk(&mut self) -> Option<Chunk> {
        if self.is_complete() {
            return None;
        }
        let chunk_i = self.requested.or(&self.completed).unset_indices().next()?;
        self.requested.set(chunk_i);
        Some(Chunk {
            begin: chunk_i as u32 * BLOCK_MAX,
            length: self.chunk_len(chunk_i),
        })
    }

    /// Releases the claim on a chunk so it can be requested again.
    pub fn cancel_request(&mut self, begin: u32) {
        if let Some(chunk_i) = self.chunk_index(begin) {
            self.requested.unset(chunk_i);
        }
    }

    fn chunk_index(&self, begin: u32) -> Option<usize> {
        let chunk_i = (begin / BLOCK_MAX) as usize;
        (begin % BLOCK_MAX == 0 && chunk_i < self.chunk_count()).then_some(chunk_i)
    }

    /// Writes a delivered block to storage. Once every chunk is in, the piece is read back and
    /// verified against its hash.
    pub async fn set_data(
        &mut self,
        storage: &Storage,
        begin: u32,
        data: Bytes,
    ) -> Result<BlockOutcome, StorageError> {
        let Some(chunk_i) = self.chunk_index(begin) else {
            return Ok(BlockOutcome::Invalid);
        };
        if data.len() != self.chunk_len(chunk_i) as usize {
            return Ok(BlockOutcome::Invalid);
        }
        if self.completed.is_set(chunk_i) || self.is_complete() {
            debug!(piece = self.index, begin, "ignoring duplicate chunk");
            return Ok(BlockOutcome::Duplicate);
        }

        self.completed.set(chunk_i);
        if let Err(error) = storage.write_range(self.offset + begin as u64, data).await {
            self.completed.unset(chunk_i);
            self.requested.unset(chunk_i);
            return Err(error);
        }

        if !self.completed.is_complete() {
            return Ok(BlockOutcome::Stored);
        }
        match self.verify(storage).await {
            Ok(true) => {
                self.mark_complete();
                Ok(BlockOutcome::Completed)
            }
            Ok(false) => {
                warn!(piece = self.index, "piece failed the hash check, clearing");
                self.reset();
                Ok(BlockOutcome::HashMismatch)
            }
            Err(error) => {
                // unverified data is as good as none
                self.reset();
                Err(error)
            }
        }
    }

    fn reset(&mut self) {
        self.requested.clear();
        self.completed.clear();
    }

    /// Reads the whole piece from storage and compares its hash.
    pub async fn verify(&self, storage: &Storage) -> Result<bool, StorageError> {
        let data = storage.read_range(self.offset, self.length as u64).await?;
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let hash: [u8; 20] = hasher.finalize().into();
        Ok(hash == self.hash)
    }

    /// Marks the piece as present, used for pieces found valid on disk.
    pub fn mark_complete(&mut self) {
        self.requested = Bitfield::full(self.chunk_count());
        self.completed = Bitfield::full(self.chunk_count());
        self.state = PieceState::Complete;
    }

    pub fn read_offset(&self, begin: u32) -> u64 {
        self.offset + begin as u64
    }
}

#[cfg(test)]
mod test_piece {
    use std::{path::PathBuf, time::Duration};

    use super::*;
    use crate::metainfo::{FileEntry, InfoHash};

    const LEN: u32 = 2 * BLOCK_MAX + 100;

    fn content() -> Vec<u8> {
        (0..LEN).map(|i| (i % 251) as u8).collect()
    }

    fn piece() -> Piece {
        Piece::new(0, 0, LEN, InfoHash::of(&content()).0)
    }

    async fn storage(dir: &std::path::Path) -> Storage {
        let entries = [FileEntry {
            path: PathBuf::from("piece.bin"),
            offset: 0,
            length: LEN as u64,
        }];
        Storage::open(dir, &entries, Duration::from_millis(1), 10)
            .await
            .expect("opens")
    }

    fn chunk_of(data: &[u8], chunk: Chunk) -> Bytes {
        Bytes::copy_from_slice(&data[chunk.begin as usize..(chunk.begin + chunk.length) as usize])
    }

    #[test]
    fn chunk_lengths_sum_to_piece_length() {
        for length in [1, BLOCK_MAX - 1, BLOCK_MAX, BLOCK_MAX + 1, 5 * BLOCK_MAX, LEN] {
            let mut piece = Piece::new(0, 0, length, [0; 20]);
            assert_eq!(piece.chunk_count(), length.div_ceil(BLOCK_MAX) as usize);
            let chunks: Vec<_> = std::iter::from_fn(|| piece.next_chunk()).collect();
            assert_eq!(chunks.len(), piece.chunk_count());
            let last = chunks.last().expect("at least one chunk");
            let expected_last = if length % BLOCK_MAX == 0 {
                BLOCK_MAX
            } else {
                length % BLOCK_MAX
            };
            assert_eq!(last.length, expected_last);
            assert_eq!(chunks.iter().map(|c| c.length).sum::<u32>(), length);
        }
    }

    #[test]
    fn next_chunk_goes_in_order_and_respects_cancel() {
        let mut piece = piece();
        assert_eq!(piece.next_chunk().map(|c| c.begin), Some(0));
        assert_eq!(piece.next_chunk().map(|c| c.begin), Some(BLOCK_MAX));
        piece.cancel_request(0);
        assert_eq!(piece.in_flight(), 1);
        assert_eq!(piece.next_chunk().map(|c| c.begin), Some(0));
        assert_eq!(
            piece.next_chunk(),
            Some(Chunk {
                begin: 2 * BLOCK_MAX,
                length: 100
            })
        );
        assert_eq!(piece.next_chunk(), None);
        assert!(!piece.has_unrequested());
    }

    #[tokio::test]
    async fn duplicate_chunk_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(dir.path()).await;
        let data = content();
        let mut piece = piece();
        let chunk = piece.next_chunk().expect("has chunk");

        let outcome = piece.set_data(&storage, chunk.begin, chunk_of(&data, chunk)).await;
        assert_eq!(outcome.expect("writes"), BlockOutcome::Stored);
        let (requested, completed) = (piece.requested().clone(), piece.completed().clone());

        let outcome = piece.set_data(&storage, chunk.begin, chunk_of(&data, chunk)).await;
        assert_eq!(outcome.expect("no io"), BlockOutcome::Duplicate);
        assert_eq!(piece.requested(), &requested);
        assert_eq!(piece.completed(), &completed);
    }

    #[tokio::test]
    async fn completes_with_matching_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(dir.path()).await;
        let data = content();
        let mut piece = piece();
        let mut last = BlockOutcome::Stored;
        while let Some(chunk) = piece.next_chunk() {
            last = piece
                .set_data(&storage, chunk.begin, chunk_of(&data, chunk))
                .await
                .expect("writes");
        }
        assert_eq!(last, BlockOutcome::Completed);
        assert!(piece.is_complete());
        assert!(piece.verify(&storage).await.expect("reads"));
    }

    #[tokio::test]
    async fn hash_mismatch_resets_the_piece() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(dir.path()).await;
        let mut data = content();
        data[5] ^= 0xff;
        let mut piece = piece();
        let mut outcomes = Vec::new();
        for _ in 0..piece.chunk_count() {
            let chunk = piece.next_chunk().expect("has chunk");
            let outcome = piece
                .set_data(&storage, chunk.begin, chunk_of(&data, chunk))
                .await
                .expect("writes");
            outcomes.push(outcome);
        }
        assert_eq!(
            outcomes,
            vec![
                BlockOutcome::Stored,
                BlockOutcome::Stored,
                BlockOutcome::HashMismatch
            ]
        );
        assert_eq!(piece.state(), PieceState::Incomplete);
        assert_eq!(piece.requested().cardinality(), 0);
        assert_eq!(piece.completed().cardinality(), 0);
        assert!(piece.has_unrequested());
    }

    #[tokio::test]
    async fn failed_verification_resets_the_piece() {
        let dir = tempfile::tempdir().expect("tempdir");
        // the last 100 bytes live in a second file
        let entries = [
            FileEntry {
                path: PathBuf::from("head.bin"),
                offset: 0,
                length: (LEN - 100) as u64,
            },
            FileEntry {
                path: PathBuf::from("tail.bin"),
                offset: (LEN - 100) as u64,
                length: 100,
            },
        ];
        let storage = Storage::open(dir.path(), &entries, Duration::from_millis(1), 3)
            .await
            .expect("opens");
        let data = content();
        let mut piece = piece();
        let chunks: Vec<_> = std::iter::from_fn(|| piece.next_chunk()).collect();
        for chunk in [chunks[0], chunks[2]] {
            let outcome = piece.set_data(&storage, chunk.begin, chunk_of(&data, chunk)).await;
            assert_eq!(outcome.expect("writes"), BlockOutcome::Stored);
        }

        // the read back of the tail file never gets through
        let guard = storage.units()[1].try_acquire().expect("free");
        let outcome = piece
            .set_data(&storage, chunks[1].begin, chunk_of(&data, chunks[1]))
            .await;
        assert!(matches!(outcome, Err(StorageError::Busy)));
        assert_eq!(piece.state(), PieceState::Incomplete);
        assert_eq!(piece.completed().cardinality(), 0);
        assert_eq!(piece.in_flight(), 0);
        assert!(piece.has_unrequested());
        drop(guard);

        let mut last = BlockOutcome::Stored;
        while let Some(chunk) = piece.next_chunk() {
            last = piece
                .set_data(&storage, chunk.begin, chunk_of(&data, chunk))
                .await
                .expect("writes");
        }
        assert_eq!(last, BlockOutcome::Completed);
    }

    #[tokio::test]
    async fn misaligned_blocks_are_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(dir.path()).await;
        let mut piece = piece();
        let outcome = piece.set_data(&storage, 7, Bytes::from_static(b"abc")).await;
        assert_eq!(outcome.expect("no io"), BlockOutcome::Invalid);
        let outcome = piece
            .set_data(&storage, 0, Bytes::from_static(b"too short"))
            .await;
        assert_eq!(outcome.expect("no io"), BlockOutcome::Invalid);
        assert_eq!(piece.completed().cardinality(), 0);
    }
}
