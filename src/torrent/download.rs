use std::{net::SocketAddr, sync::Arc};

use tracing::{debug, error, info, warn};

use crate::{
    bitfield::Bitfield,
    config::PeerConfig,
    messages::{
        payloads::{BitfieldPayload, HavePayload, ResponsePiecePayload},
        PeerMessage,
    },
    metainfo::{Info, Metainfo},
    peer::{session::SessionState, UploadView},
    piece::{BlockOutcome, Piece},
    request_manager::RequestManager,
    storage::{Storage, StorageError},
    torrent::{Torrent, TorrentError, TorrentEvent, TorrentStatus},
};

/// Everything that only exists once the metadata is known.
#[derive(Debug)]
pub(super) struct Download {
    pub(super) storage: Arc<Storage>,
    pub(super) pieces: Vec<Piece>,
    /// Verified pieces.
    pub(super) completed: Bitfield,
    pub(super) requests: RequestManager,
    pub(super) piece_length: u64,
    pub(super) total_length: u64,
    pub(super) completed_bytes: u64,
}

impl Download {
    /// Opens the files and checks which pieces are already on disk.
    pub(super) async fn open(
        info: &Info,
        dir: &std::path::Path,
        config: &PeerConfig,
    ) -> Result<Self, StorageError> {
        let storage = Storage::open(
            dir,
            &info.file_entries(),
            config.upload_retry_delay,
            config.upload_retry_limit,
        )
        .await?;
        let pieces = info
            .pieces
            .0
            .iter()
            .enumerate()
            .map(|(i, hash)| {
                Piece::new(
                    i as u32,
                    i as u64 * info.piece_length,
                    info.piece_len(i) as u32,
                    *hash,
                )
            })
            .collect::<Vec<_>>();
        let n_pieces = pieces.len();
        let mut download = Self {
            storage: Arc::new(storage),
            pieces,
            completed: Bitfield::new(n_pieces),
            requests: RequestManager::new(n_pieces),
            piece_length: info.piece_length,
            total_length: info.total_length(),
            completed_bytes: 0,
        };
        download.check_existing().await?;
        Ok(download)
    }

    async fn check_existing(&mut self) -> Result<(), StorageError> {
        for piece in self.pieces.iter_mut() {
            if piece.verify(&self.storage).await? {
                piece.mark_complete();
                self.completed.set(piece.index() as usize);
                self.completed_bytes += piece.length() as u64;
            }
        }
        if self.completed.cardinality() > 0 {
            info!(
                pieces = self.completed.cardinality(),
                "found verified pieces on disk"
            );
        }
        Ok(())
    }

    pub(super) fn is_complete(&self) -> bool {
        self.completed.is_complete()
    }

    pub(super) fn left(&self) -> u64 {
        self.total_length - self.completed_bytes
    }

    pub(super) fn progress(&self) -> f64 {
        if self.total_length == 0 {
            return 1.0;
        }
        self.completed_bytes as f64 / self.total_length as f64
    }

    /// Whether a peer with availability `peer_has` has a piece we lack.
    pub(super) fn wants_from(&self, peer_has: &Bitfield) -> bool {
        peer_has.difference(&self.completed).cardinality() > 0
    }

    /// Whether a peer with availability `peer_has` has a piece nobody is fetching all of.
    pub(super) fn can_assign(&self, peer_has: &Bitfield) -> bool {
        self.requests
            .has_assignable(peer_has, &self.completed, &self.pieces)
    }

    /// Deactivates pieces nobody has requests in flight for anymore.
    pub(super) fn release_idle(&mut self) {
        let idle = self
            .requests
            .active()
            .set_indices()
            .filter(|&i| self.pieces[i].in_flight() == 0 && !self.pieces[i].is_complete())
            .collect::<Vec<_>>();
        for index in idle {
            self.requests.release(index);
        }
    }

    pub(super) fn upload_view(&self) -> UploadView {
        UploadView {
            storage: self.storage.clone(),
            piece_length: self.piece_length,
            total_length: self.total_length,
            have: self.completed.clone(),
        }
    }
}

impl Torrent {
    pub(super) async fn setup(&mut self, metainfo: Metainfo) -> Result<(), TorrentError> {
        let download =
            Download::open(&metainfo.info, &self.config.download_dir, &self.config.peer).await?;
        info!(
            name = %metainfo.info.name,
            pieces = download.pieces.len(),
            have = download.completed.cardinality(),
            "torrent ready"
        );
        let n_pieces = download.pieces.len();
        let bitfield = BitfieldPayload::from(&download.completed);
        let complete = download.is_complete();
        self.metainfo = Some(metainfo);
        self.download = Some(download);
        self.publish_uploads();
        self.publish_stats();

        for session in self.peers.values_mut() {
            session.resolve_availability(n_pieces);
            if session.state == SessionState::Active {
                if let Err(error) = session.send(PeerMessage::Bitfield(bitfield.clone())) {
                    debug!(peer = %session.addr, %error, "failed to send bitfield");
                }
            }
        }
        self.set_status(if complete {
            TorrentStatus::Complete
        } else {
            TorrentStatus::Ready
        });
        self.refresh_all();
        Ok(())
    }

    pub(super) async fn on_block(&mut self, addr: SocketAddr, block: ResponsePiecePayload) {
        self.stats.downloaded += block.block.len() as u64;
        let Some(download) = self.download.as_mut() else {
            debug!(peer = %addr, "block before metadata");
            return;
        };
        if let Some(session) = self.peers.get_mut(&addr) {
            session.on_block(block.index, block.begin);
        }
        let Some(piece) = download.pieces.get_mut(block.index as usize) else {
            warn!(peer = %addr, piece = block.index, "block for a piece that doesn't exist");
            return;
        };

        let outcome = match piece.set_data(&download.storage, block.begin, block.block).await {
            Ok(outcome) => outcome,
            Err(error) => {
                // the chunk is requestable again, another session can bring it
                error!(peer = %addr, piece = block.index, %error, "failed to store block");
                BlockOutcome::Invalid
            }
        };
        match outcome {
            BlockOutcome::Completed => self.on_piece_completed(block.index),
            BlockOutcome::HashMismatch => self.refresh_all(),
            BlockOutcome::Invalid => {
                debug!(peer = %addr, piece = block.index, begin = block.begin, "dropped block");
                if let Some(download) = self.download.as_mut() {
                    download.release_idle();
                }
                self.fill(addr);
            }
            BlockOutcome::Stored | BlockOutcome::Duplicate => self.fill(addr),
        }
    }

    fn on_piece_completed(&mut self, index: u32) {
        let Some(download) = self.download.as_mut() else {
            return;
        };
        let i = index as usize;
        download.completed.set(i);
        download.requests.on_complete(i);
        download.completed_bytes += download.pieces[i].length() as u64;
        let progress = download.progress();
        let complete = download.is_complete();
        debug!(piece = index, progress, "piece completed");

        self.emit(TorrentEvent::PieceCompleted(index));
        self.emit(TorrentEvent::Progress(progress));
        for session in self.peers.values() {
            if session.state != SessionState::Active {
                continue;
            }
            let have = PeerMessage::Have(HavePayload { piece_index: index });
            if let Err(error) = session.send(have) {
                debug!(peer = %session.addr, %error, "failed to send have");
            }
        }
        self.publish_uploads();
        self.publish_stats();

        if complete {
            info!("download complete");
            self.set_status(TorrentStatus::Complete);
        }
        self.refresh_all();
    }

    /// Cancels requests that went unanswered for too long and hands their chunks out again.
    pub(super) fn on_tick(&mut self) {
        let Some(timeout) = self.config.peer.request_timeout else {
            return;
        };
        let Some(download) = self.download.as_mut() else {
            return;
        };
        let now = tokio::time::Instant::now();
        let mut expired_any = false;
        for session in self.peers.values_mut() {
            for request in session.expire(now, timeout, &mut download.pieces) {
                debug!(peer = %session.addr, ?request, "request timed out");
                expired_any = true;
                if let Err(error) = session.send(PeerMessage::Cancel(request)) {
                    debug!(peer = %session.addr, %error, "failed to send cancel");
                }
            }
        }
        if expired_any {
            download.release_idle();
            self.refresh_all();
        }
    }

    pub(super) fn publish_uploads(&self) {
        if let Some(download) = &self.download {
            self.uploads_tx.send_replace(Some(download.upload_view()));
        }
    }
}

#[cfg(test)]
mod test_download {
    use super::*;
    use crate::BLOCK_MAX;

    fn info(content: &[u8]) -> Info {
        Info::single_file("data.bin", 2 * BLOCK_MAX as u64, content)
    }

    #[tokio::test]
    async fn fresh_download_has_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let content = vec![7u8; 5 * BLOCK_MAX as usize];
        let download = Download::open(&info(&content), dir.path(), &PeerConfig::default())
            .await
            .expect("opens");
        assert_eq!(download.pieces.len(), 3);
        assert_eq!(download.pieces[2].length(), BLOCK_MAX);
        assert_eq!(download.completed.cardinality(), 0);
        assert_eq!(download.left(), content.len() as u64);
        assert!(dir.path().join("data.bin").exists());
    }

    #[tokio::test]
    async fn existing_data_is_verified() {
        let dir = tempfile::tempdir().expect("tempdir");
        let content = (0..5 * BLOCK_MAX).map(|i| i as u8).collect::<Vec<_>>();
        let mut on_disk = content.clone();
        // corrupt the second piece
        on_disk[3 * BLOCK_MAX as usize] ^= 0xff;
        std::fs::write(dir.path().join("data.bin"), &on_disk).expect("writes");

        let download = Download::open(&info(&content), dir.path(), &PeerConfig::default())
            .await
            .expect("opens");
        assert_eq!(download.completed.set_indices().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(download.left(), 2 * BLOCK_MAX as u64);
        assert!((download.progress() - 0.6).abs() < 1e-9);
        assert!(download.pieces[0].is_complete());
        assert!(!download.pieces[1].is_complete());

        let view = download.upload_view();
        assert_eq!(view.have, download.completed);
    }

    #[tokio::test]
    async fn idle_active_pieces_are_released() {
        let dir = tempfile::tempdir().expect("tempdir");
        let content = vec![1u8; 4 * BLOCK_MAX as usize];
        let mut download = Download::open(&info(&content), dir.path(), &PeerConfig::default())
            .await
            .expect("opens");
        let peer_has = Bitfield::full(2);
        let index = download
            .requests
            .select_piece(&peer_has, &download.completed, &download.pieces)
            .expect("a piece");
        let chunk = download.pieces[index].next_chunk().expect("a chunk");
        download.release_idle();
        assert!(download.requests.is_active(index));

        download.pieces[index].cancel_request(chunk.begin);
        download.release_idle();
        assert!(!download.requests.is_active(index));
        assert!(download.wants_from(&peer_has));
    }
}
