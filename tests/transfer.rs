//! End to end transfers between two clients on the loopback interface.

use std::{net::SocketAddr, path::Path, time::Duration};

use bittorrent_engine::{
    Client, Config, InfoHash, MagnetLink, MetadataSource, Metainfo, TorrentHandle, TorrentStatus,
};
use sha1::{Digest, Sha1};
use tempfile::TempDir;
use tokio::time::timeout;

const PIECE_LENGTH: usize = 32768;
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn bstr(s: &[u8]) -> Vec<u8> {
    let mut out = format!("{}:", s.len()).into_bytes();
    out.extend_from_slice(s);
    out
}

fn piece_hashes(content: &[u8]) -> Vec<u8> {
    content
        .chunks(PIECE_LENGTH)
        .flat_map(|piece| Sha1::digest(piece).to_vec())
        .collect()
}

/// `d4:info<info>e` where the info dictionary starts with `files_key`, which has to sort before
/// `name`.
fn torrent_bytes(files_key: &[u8], name: &str, content: &[u8]) -> Vec<u8> {
    let mut info = b"d".to_vec();
    info.extend_from_slice(files_key);
    info.extend(b"4:name");
    info.extend(bstr(name.as_bytes()));
    info.extend(format!("12:piece lengthi{PIECE_LENGTH}e6:pieces").into_bytes());
    info.extend(bstr(&piece_hashes(content)));
    info.push(b'e');

    let mut torrent = b"d4:info".to_vec();
    torrent.extend(info);
    torrent.push(b'e');
    torrent
}

fn config(dir: &Path) -> Config {
    let mut config = Config {
        listen_ports: 0..=0,
        download_dir: dir.to_path_buf(),
        tick_interval: Duration::from_millis(200),
        ..Config::default()
    };
    config.peer.reconnect_delay = Some(Duration::from_millis(200));
    config
}

struct Seeder {
    client: Client,
    torrent: TorrentHandle,
    _dir: TempDir,
}

impl Seeder {
    /// A client that has every piece of `metainfo` on disk.
    async fn start(metainfo: &Metainfo, files: &[(&str, &[u8])]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        for (path, data) in files {
            let path = dir.path().join(path);
            std::fs::create_dir_all(path.parent().expect("has a parent")).expect("creates dirs");
            std::fs::write(path, data).expect("writes");
        }
        let client = Client::new(config(dir.path())).await.expect("starts");
        let torrent = client.add_torrent(MetadataSource::Metainfo(Box::new(metainfo.clone())));
        let status = timeout(
            TRANSFER_TIMEOUT,
            torrent.wait_until(|status| *status != TorrentStatus::Loading),
        )
        .await
        .expect("in time");
        assert_eq!(status, Some(TorrentStatus::Complete));
        wait_registered(&client, metainfo.info_hash).await;
        Self {
            client,
            torrent,
            _dir: dir,
        }
    }

    fn addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.client.listen_addr().port()))
    }
}

async fn wait_registered(client: &Client, info_hash: InfoHash) {
    timeout(TRANSFER_TIMEOUT, async {
        while !client.torrents().await.contains(&info_hash) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("torrent registered");
}

async fn wait_complete(torrent: &TorrentHandle) {
    let status = timeout(
        TRANSFER_TIMEOUT,
        torrent.wait_until(|status| {
            matches!(status, TorrentStatus::Complete | TorrentStatus::Error(_))
        }),
    )
    .await
    .expect("download finishes in time");
    assert_eq!(status, Some(TorrentStatus::Complete));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn downloads_a_single_file_torrent() {
    let data = content(PIECE_LENGTH * 2 + 20000, 3);
    let files_key = format!("6:lengthi{}e", data.len()).into_bytes();
    let torrent_file = torrent_bytes(&files_key, "payload.bin", &data);
    let metainfo = Metainfo::from_bytes(&torrent_file).expect("valid torrent");
    assert_eq!(metainfo.info.piece_count(), 3);

    let seeder = Seeder::start(&metainfo, &[("payload.bin", &data)]).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let torrent_path = dir.path().join("payload.torrent");
    std::fs::write(&torrent_path, &torrent_file).expect("writes");
    let download_dir = dir.path().join("downloads");
    let leecher = Client::new(config(&download_dir)).await.expect("starts");
    let torrent = leecher.add_torrent(MetadataSource::File(torrent_path));
    torrent.add_peers(vec![seeder.addr()]).await.expect("running");

    wait_complete(&torrent).await;
    let stats = torrent.stats();
    assert_eq!(stats.left, 0);
    assert_eq!(stats.pieces_completed, 3);
    assert!(stats.downloaded >= data.len() as u64);
    assert_eq!(
        std::fs::read(download_dir.join("payload.bin")).expect("reads"),
        data
    );

    torrent.shutdown().await.expect("running");
    seeder.torrent.shutdown().await.expect("running");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn downloads_a_multi_file_torrent_from_a_magnet_link() {
    let first = content(PIECE_LENGTH + 100, 7);
    let second = content(PIECE_LENGTH / 2, 11);
    let mut data = first.clone();
    data.extend(&second);
    let files_key = format!(
        "5:filesld6:lengthi{}e4:pathl9:first.bineed6:lengthi{}e4:pathl3:sub10:second.bineee",
        first.len(),
        second.len()
    )
    .into_bytes();
    let metainfo =
        Metainfo::from_bytes(&torrent_bytes(&files_key, "album", &data)).expect("valid torrent");

    let seeder = Seeder::start(
        &metainfo,
        &[("album/first.bin", &first), ("album/sub/second.bin", &second)],
    )
    .await;

    let magnet = format!(
        "magnet:?xt=urn:btih:{}&dn=album&x.pe={}",
        metainfo.info_hash,
        seeder.addr()
    );
    let link = MagnetLink::from_url(&magnet).expect("valid magnet link");
    assert_eq!(link.peers, vec![seeder.addr()]);

    let dir = tempfile::tempdir().expect("tempdir");
    let leecher = Client::new(config(dir.path())).await.expect("starts");
    let torrent = leecher.add_torrent(MetadataSource::Magnet(link));
    assert_eq!(torrent.wait_for_info_hash().await, Some(metainfo.info_hash));

    wait_complete(&torrent).await;
    assert_eq!(
        std::fs::read(dir.path().join("album/first.bin")).expect("reads"),
        first
    );
    assert_eq!(
        std::fs::read(dir.path().join("album/sub/second.bin")).expect("reads"),
        second
    );

    torrent.shutdown().await.expect("running");
    seeder.torrent.shutdown().await.expect("running");
}

#[tokio::test]
async fn missing_metainfo_file_fails_the_torrent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = Client::new(config(dir.path())).await.expect("starts");
    let torrent = client.add_torrent(MetadataSource::File(dir.path().join("missing.torrent")));
    let status = timeout(
        TRANSFER_TIMEOUT,
        torrent.wait_until(|status| matches!(status, TorrentStatus::Error(_))),
    )
    .await
    .expect("fails in time");
    assert!(matches!(status, Some(TorrentStatus::Error(_))));
    assert_eq!(torrent.wait_for_info_hash().await, None);
}
