use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    time::Duration,
};

use bytes::Bytes;
use tokio::{sync::mpsc, time::Instant};

use crate::{
    bitfield::Bitfield,
    messages::{
        payloads::{BitfieldPayload, RequestPiecePayload},
        PeerMessage,
    },
    peer::PeerCommand,
    piece::Piece,
    torrent::error::TorrentError,
};

/// HAVEs kept per session while the piece count is unknown.
const MAX_PENDING_HAVES: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Active,
}

/// What the remote has. Before the metadata is known the piece count is not, so what the remote
/// announces is kept until it can be sized.
#[derive(Debug, Clone)]
enum Availability {
    Pending {
        bitfield: Option<Bytes>,
        haves: HashSet<u32>,
    },
    Known(Bitfield),
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    length: u32,
    since: Instant,
}

/// The torrent's record of one remote peer. The connection itself is run by its own task, this
/// side only keeps the state the scheduling decisions need.
#[derive(Debug)]
pub struct PeerSession {
    pub addr: SocketAddr,
    /// Whether we dialed, only those are redialed after a disconnect.
    pub outbound: bool,
    pub state: SessionState,
    pub peer_id: Option<[u8; 20]>,
    pub supports_extensions: bool,
    /// Extension names to the ids the remote wants them sent with.
    pub extensions: HashMap<String, u8>,
    pub metadata_size: Option<u64>,
    pub client_name: Option<String>,
    availability: Availability,
    /// The remote is choking us.
    pub choked: bool,
    pub am_interested: bool,
    pub am_choking: bool,
    pub peer_interested: bool,
    /// Piece index to chunk begin.
    outstanding: HashMap<u32, HashMap<u32, Outstanding>>,
    num_outstanding: usize,
    pub download_rate: f64,
    pub upload_rate: f64,
    sender: Option<mpsc::UnboundedSender<PeerCommand>>,
}

impl PeerSession {
    pub fn new(addr: SocketAddr, outbound: bool) -> Self {
        Self {
            addr,
            outbound,
            state: if outbound {
                SessionState::Connecting
            } else {
                SessionState::Handshaking
            },
            peer_id: None,
            supports_extensions: false,
            extensions: HashMap::new(),
            metadata_size: None,
            client_name: None,
            availability: Availability::Pending {
                bitfield: None,
                haves: HashSet::new(),
            },
            choked: true,
            am_interested: false,
            am_choking: true,
            peer_interested: false,
            outstanding: HashMap::new(),
            num_outstanding: 0,
            download_rate: 0.0,
            upload_rate: 0.0,
            sender: None,
        }
    }

    pub fn activate(
        &mut self,
        peer_id: [u8; 20],
        supports_extensions: bool,
        sender: mpsc::UnboundedSender<PeerCommand>,
    ) {
        self.peer_id = Some(peer_id);
        self.supports_extensions = supports_extensions;
        self.sender = Some(sender);
        self.state = SessionState::Active;
    }

    pub fn send(&self, message: PeerMessage) -> Result<(), TorrentError> {
        self.command(PeerCommand::Send(message))
    }

    pub fn command(&self, command: PeerCommand) -> Result<(), TorrentError> {
        let Some(sender) = &self.sender else {
            return Err(TorrentError::PeerNotConnected(self.addr));
        };
        sender
            .send(command)
            .map_err(|_| TorrentError::PeerNotConnected(self.addr))
    }

    pub fn availability(&self) -> Option<&Bitfield> {
        match &self.availability {
            Availability::Known(bitfield) => Some(bitfield),
            Availability::Pending { .. } => None,
        }
    }

    pub fn record_bitfield(&mut self, payload: BitfieldPayload, n_pieces: Option<usize>) {
        match (&mut self.availability, n_pieces) {
            (availability, Some(n)) => *availability = Availability::Known(payload.to_bitfield(n)),
            (Availability::Pending { bitfield, .. }, None) => {
                *bitfield = Some(payload.pieces_available)
            }
            (Availability::Known(_), None) => {}
        }
    }

    /// `false` if the index is out of range for a torrent of `n_pieces` pieces.
    pub fn record_have(&mut self, index: u32, n_pieces: Option<usize>) -> bool {
        match &mut self.availability {
            Availability::Known(bitfield) => {
                if index as usize >= bitfield.len() {
                    return false;
                }
                bitfield.set(index as usize);
            }
            Availability::Pending { haves, .. } => match n_pieces {
                Some(n) if index as usize >= n => return false,
                // past the cap they are dropped, the bitfield usually covers them anyway
                _ if haves.len() >= MAX_PENDING_HAVES => {}
                _ => {
                    haves.insert(index);
                }
            },
        }
        true
    }

    /// Sizes whatever was announced before the piece count was known. Out of range indices are
    /// dropped.
    pub fn resolve_availability(&mut self, n_pieces: usize) {
        let Availability::Pending { bitfield, haves } = &self.availability else {
            return;
        };
        let mut resolved = match bitfield {
            Some(bytes) => Bitfield::from_bytes(bytes, n_pieces),
            None => Bitfield::new(n_pieces),
        };
        for &index in haves.iter().filter(|&&i| (i as usize) < n_pieces) {
            resolved.set(index as usize);
        }
        self.availability = Availability::Known(resolved);
    }

    pub fn num_outstanding(&self) -> usize {
        self.num_outstanding
    }

    pub fn is_ready(&self, max_outstanding: usize) -> bool {
        self.state == SessionState::Active
            && self.am_interested
            && !self.choked
            && self.num_outstanding < max_outstanding
    }

    /// Claims chunks of `piece` until the piece or this session's request budget runs out.
    pub fn request_piece(
        &mut self,
        piece: &mut Piece,
        max_outstanding: usize,
        now: Instant,
    ) -> Vec<RequestPiecePayload> {
        let mut requests = Vec::new();
        while self.num_outstanding < max_outstanding {
            let Some(chunk) = piece.next_chunk() else {
                break;
            };
            self.outstanding.entry(piece.index()).or_default().insert(
                chunk.begin,
                Outstanding {
                    length: chunk.length,
                    since: now,
                },
            );
            self.num_outstanding += 1;
            requests.push(RequestPiecePayload::new(
                piece.index(),
                chunk.begin,
                chunk.length,
            ));
        }
        requests
    }

    /// Forgets the request a block answers. `false` if it wasn't requested by this session.
    pub fn on_block(&mut self, index: u32, begin: u32) -> bool {
        let Some(chunks) = self.outstanding.get_mut(&index) else {
            return false;
        };
        let removed = chunks.remove(&begin).is_some();
        if chunks.is_empty() {
            self.outstanding.remove(&index);
        }
        if removed {
            self.num_outstanding -= 1;
        }
        removed
    }

    /// Gives every outstanding request back to its piece. Returns the touched piece indices.
    pub fn release_all(&mut self, pieces: &mut [Piece]) -> Vec<usize> {
        let mut touched = Vec::with_capacity(self.outstanding.len());
        for (index, chunks) in self.outstanding.drain() {
            let Some(piece) = pieces.get_mut(index as usize) else {
                continue;
            };
            for begin in chunks.keys() {
                piece.cancel_request(*begin);
            }
            touched.push(index as usize);
        }
        self.num_outstanding = 0;
        touched
    }

    /// Cancels requests older than `timeout`, giving the chunks back to their pieces. Returns
    /// the cancelled requests so CANCEL can be sent for them.
    pub fn expire(
        &mut self,
        now: Instant,
        timeout: Duration,
        pieces: &mut [Piece],
    ) -> Vec<RequestPiecePayload> {
        let mut expired = Vec::new();
        for (&index, chunks) in self.outstanding.iter_mut() {
            chunks.retain(|&begin, outstanding| {
                if now.duration_since(outstanding.since) < timeout {
                    return true;
                }
                if let Some(piece) = pieces.get_mut(index as usize) {
                    piece.cancel_request(begin);
                }
                expired.push(RequestPiecePayload::new(index, begin, outstanding.length));
                false
            });
        }
        self.outstanding.retain(|_, chunks| !chunks.is_empty());
        self.num_outstanding -= expired.len();
        expired
    }
}

#[cfg(test)]
mod test_session {
    use super::*;
    use crate::BLOCK_MAX;

    fn active_session() -> (PeerSession, mpsc::UnboundedReceiver<PeerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = PeerSession::new("127.0.0.1:6881".parse().expect("valid"), true);
        session.activate([1; 20], true, tx);
        (session, rx)
    }

    #[test]
    fn readiness_needs_interest_unchoke_and_budget() {
        let (mut session, _rx) = active_session();
        assert!(!session.is_ready(2));
        session.am_interested = true;
        assert!(!session.is_ready(2));
        session.choked = false;
        assert!(session.is_ready(2));

        let mut piece = Piece::new(0, 0, 4 * BLOCK_MAX, [0; 20]);
        let requests = session.request_piece(&mut piece, 2, Instant::now());
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1], RequestPiecePayload::new(0, BLOCK_MAX, BLOCK_MAX));
        assert!(!session.is_ready(2));

        assert!(session.on_block(0, 0));
        assert!(!session.on_block(0, 0));
        assert_eq!(session.num_outstanding(), 1);
        assert!(session.is_ready(2));
    }

    #[test]
    fn release_gives_chunks_back() {
        let (mut session, _rx) = active_session();
        let mut pieces = vec![Piece::new(0, 0, 3 * BLOCK_MAX, [0; 20])];
        session.request_piece(&mut pieces[0], 10, Instant::now());
        assert_eq!(pieces[0].in_flight(), 3);
        assert!(!pieces[0].has_unrequested());

        assert_eq!(session.release_all(&mut pieces), vec![0]);
        assert_eq!(pieces[0].in_flight(), 0);
        assert_eq!(session.num_outstanding(), 0);
    }

    #[test]
    fn expired_requests_are_cancelled() {
        let (mut session, _rx) = active_session();
        let mut pieces = vec![Piece::new(0, 0, 2 * BLOCK_MAX, [0; 20])];
        let start = Instant::now();
        session.request_piece(&mut pieces[0], 1, start);
        session.request_piece(&mut pieces[0], 2, start + Duration::from_secs(30));

        let expired = session.expire(start + Duration::from_secs(60), Duration::from_secs(60), &mut pieces);
        assert_eq!(expired, vec![RequestPiecePayload::new(0, 0, BLOCK_MAX)]);
        assert_eq!(session.num_outstanding(), 1);
        assert_eq!(pieces[0].in_flight(), 1);
        assert_eq!(pieces[0].next_chunk().map(|c| c.begin), Some(0));
    }

    #[test]
    fn availability_waits_for_the_piece_count() {
        let mut session = PeerSession::new("127.0.0.1:6881".parse().expect("valid"), false);
        session.record_bitfield(
            BitfieldPayload {
                pieces_available: Bytes::from_static(&[0b1000_0000]),
            },
            None,
        );
        assert!(session.record_have(9, None));
        assert!(session.availability().is_none());

        session.resolve_availability(3);
        let availability = session.availability().expect("sized");
        assert_eq!(availability.set_indices().collect::<Vec<_>>(), vec![0]);
        assert!(!session.record_have(3, Some(3)));
        assert!(session.record_have(2, Some(3)));
    }

    #[test]
    fn pending_haves_are_bounded() {
        let mut session = PeerSession::new("127.0.0.1:6881".parse().expect("valid"), false);
        for _ in 0..1000 {
            assert!(session.record_have(7, None));
        }
        for index in 0..MAX_PENDING_HAVES as u32 + 100 {
            assert!(session.record_have(index, None));
        }
        let Availability::Pending { haves, .. } = &session.availability else {
            panic!("still pending")
        };
        assert_eq!(haves.len(), MAX_PENDING_HAVES);

        session.resolve_availability(10);
        assert_eq!(session.availability().expect("sized").cardinality(), 10);
    }

    #[test]
    fn sends_reach_the_connection_task() {
        let (session, mut rx) = active_session();
        session.send(PeerMessage::Interested).expect("connected");
        assert!(matches!(
            rx.try_recv(),
            Ok(PeerCommand::Send(PeerMessage::Interested))
        ));
        drop(rx);
        assert!(session.send(PeerMessage::Unchoke).is_err());
    }
}
