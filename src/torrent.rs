//! # Torrent Metadata and Download Coordination
//!
//! This module decodes the metainfo file and drives the whole download.
//!
//! ## Metainfo
//!
//! A torrent file is a bencoded dictionary. The fields consumed here:
//!
//! - **announce**: tracker URL for peer discovery
//! - **info.name**: suggested output filename
//! - **info.length**: total file size in bytes
//! - **info.piece length**: bytes per piece, except possibly the last
//! - **info.pieces**: concatenated 20-byte SHA-1 digests, one per piece
//!
//! The info-hash identifying the torrent on the wire is the SHA-1 of the
//! re-bencoded `info` dictionary, byte for byte.
//!
//! ## Download coordination
//!
//! `download` builds the piece plan, pre-allocates the output file, then
//! loops until every piece has been verified and written:
//!
//! 1. Announce to the tracker and collect a batch of peers.
//! 2. Spawn one worker thread per peer, all sharing the piece queue and the
//!    output file handle.
//! 3. Wait for the whole batch to finish, then announce again if pieces
//!    remain. Announcing only between batches keeps the loop re-entrancy
//!    free; rediscovery frequency is bounded by peer-batch lifetime.

use crate::piece;
use crate::queue::WorkQueue;
use crate::storage::OutputFile;
use crate::tracker;
use crate::worker::Worker;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use boring::sha::Sha1;
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// Size of SHA-1 hash in bytes
const SHA1_HASH_SIZE: usize = 20;
// Client identifier leading the generated peer id
const PEER_ID_PREFIX: &str = "-LI1000-";
// Peer ids are always 20 bytes on the wire
const PEER_ID_LEN: usize = 20;
// Pause before re-announcing when the tracker returned no peers
const EMPTY_ANNOUNCE_RETRY_SECS: u64 = 5;

/// A single-file torrent and the state needed to download it.
pub struct Torrent {
    /// Tracker URL for peer discovery
    announce: String,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    info_hash: Vec<u8>,
    /// One 20-byte SHA-1 digest per piece
    pieces_hashes: Vec<Vec<u8>>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u32,
    /// Total size of the file in bytes
    length: u32,
    /// Suggested filename from torrent metadata
    name: String,
    /// 20-byte identifier for this client instance
    peer_id: Vec<u8>,
}

/// BencodeInfo structure.
#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Concatenation of all pieces 20-byte SHA-1 hashes
    #[serde(rename = "pieces")]
    pieces: ByteBuf,
    // Size of each piece in bytes
    #[serde(rename = "piece length")]
    piece_length: u32,
    // Size of the file in bytes
    #[serde(rename = "length")]
    length: u32,
    // Suggested filename where to save the file
    #[serde(rename = "name")]
    name: String,
}

/// BencodeTorrent structure.
#[derive(Deserialize, Serialize)]
struct BencodeTorrent {
    // URL of the tracker
    announce: String,
    // Informations about the file
    info: BencodeInfo,
}

impl BencodeInfo {
    /// Hash the bencoded info dictionary to uniquely identify the file.
    fn hash(&self) -> Result<Vec<u8>> {
        let buf: Vec<u8> = ser::to_bytes::<BencodeInfo>(self)?;

        let mut hasher = Sha1::new();
        hasher.update(&buf);

        Ok(hasher.finish().to_vec())
    }

    /// Split the concatenated piece digests into one hash per piece.
    fn split_pieces_hashes(&self) -> Result<Vec<Vec<u8>>> {
        if !self.pieces.len().is_multiple_of(SHA1_HASH_SIZE) {
            return Err(anyhow!("torrent has malformed piece hashes"));
        }

        Ok(self
            .pieces
            .chunks_exact(SHA1_HASH_SIZE)
            .map(|chunk| chunk.to_vec())
            .collect())
    }
}

impl Torrent {
    /// Open and decode a metainfo file.
    ///
    /// # Arguments
    ///
    /// * `filepath` - Path to the torrent.
    ///
    pub fn open(filepath: &Path) -> Result<Torrent> {
        let mut file = match File::open(filepath) {
            Ok(file) => file,
            Err(_) => return Err(anyhow!("could not open torrent")),
        };

        let mut buf = vec![];
        if file.read_to_end(&mut buf).is_err() {
            return Err(anyhow!("could not read torrent"));
        }

        let bencode = match de::from_bytes::<BencodeTorrent>(&buf) {
            Ok(bencode) => bencode,
            Err(_) => return Err(anyhow!("could not decode torrent")),
        };
        if bencode.announce.is_empty() {
            return Err(anyhow!("torrent has no announce url"));
        }

        Ok(Torrent {
            announce: bencode.announce.clone(),
            info_hash: bencode.info.hash()?,
            pieces_hashes: bencode.info.split_pieces_hashes()?,
            piece_length: bencode.info.piece_length,
            length: bencode.info.length,
            name: bencode.info.name.clone(),
            peer_id: generate_peer_id(),
        })
    }

    /// Returns the suggested filename from the torrent metadata.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Download the whole file into `output_path`.
    ///
    /// Returns once every piece has been verified and written, or fails on
    /// a metainfo, tracker or output-file error. Peer failures never
    /// surface here; the pieces they held are simply retried.
    pub fn download(&self, output_path: &Path) -> Result<()> {
        println!(
            "Downloading {:?} ({} pieces)",
            self.name,
            self.pieces_hashes.len()
        );

        let plan = piece::build_plan(self.length, self.piece_length, &self.pieces_hashes)?;
        let queue = Arc::new(WorkQueue::new(plan));
        let output = Arc::new(OutputFile::create(output_path, self.length as u64)?);
        let live_peers = Arc::new(AtomicUsize::new(0));

        // Create progress bar
        let pb = ProgressBar::new(self.length as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}% {msg}",
                )
                .unwrap()
                .progress_chars("#>-"),
        );

        while queue.remaining() > 0 {
            let response =
                tracker::announce(&self.announce, &self.info_hash, &self.peer_id, self.length)?;

            if let Some(interval) = response.interval {
                debug!("Tracker suggests re-announcing every {interval} seconds");
            }
            if response.peers.is_empty() {
                warn!("Tracker returned no peers, retrying announce");
                thread::sleep(Duration::from_secs(EMPTY_ANNOUNCE_RETRY_SECS));
                continue;
            }

            info!("Starting a batch of {} peer sessions", response.peers.len());

            // One worker per peer; the batch shares the queue, the output
            // file and the live-session counter
            let mut handles = Vec::new();
            for peer in response.peers {
                let worker = Worker::new(
                    peer,
                    self.peer_id.clone(),
                    self.info_hash.clone(),
                    Arc::clone(&queue),
                    Arc::clone(&output),
                    Arc::clone(&live_peers),
                    pb.clone(),
                );
                handles.push(thread::spawn(move || worker.run()));
            }

            for handle in handles {
                let _ = handle.join();
            }
        }

        pb.finish_with_message("done");

        Ok(())
    }
}

/// Generate a fresh 20-byte ASCII peer id: the client prefix followed by
/// URL-safe base64 of random bytes.
fn generate_peer_id() -> Vec<u8> {
    let mut random = [0u8; 12];
    let mut rng = rand::thread_rng();
    for byte in random.iter_mut() {
        *byte = rng.gen();
    }

    let suffix = URL_SAFE.encode(random);
    let mut peer_id = PEER_ID_PREFIX.as_bytes().to_vec();
    peer_id.extend_from_slice(&suffix.as_bytes()[..PEER_ID_LEN - PEER_ID_PREFIX.len()]);

    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{Handshake, HANDSHAKE_LEN};
    use crate::message::{Message, MESSAGE_INTERESTED, MESSAGE_PIECE, MESSAGE_REQUEST, MESSAGE_UNCHOKE};
    use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
    use std::env;
    use std::fs;
    use std::io::{Cursor, Write};
    use std::net::TcpListener;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        env::temp_dir().join(format!("torrent-test-{label}-{nanos}"))
    }

    fn sha1(data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finish().to_vec()
    }

    #[test]
    fn peer_id_is_20_url_safe_ascii_bytes_with_the_client_prefix() {
        let peer_id = generate_peer_id();

        assert_eq!(peer_id.len(), PEER_ID_LEN);
        assert!(peer_id.starts_with(PEER_ID_PREFIX.as_bytes()));
        for &byte in &peer_id[PEER_ID_PREFIX.len()..] {
            assert!(
                byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' || byte == b'=',
                "unexpected byte {byte} in peer id"
            );
        }
    }

    #[test]
    fn decodes_metainfo_and_computes_the_info_hash() {
        let info = BencodeInfo {
            pieces: ByteBuf::from(vec![7u8; 40]),
            piece_length: 16_384,
            length: 20_000,
            name: "artifact.bin".to_string(),
        };
        let expected_info_hash = sha1(&ser::to_bytes(&info).unwrap());
        let torrent_file = ser::to_bytes(&BencodeTorrent {
            announce: "http://tracker.example/announce".to_string(),
            info,
        })
        .unwrap();

        let path = temp_path("metainfo");
        fs::write(&path, &torrent_file).unwrap();
        let torrent = Torrent::open(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(torrent.announce, "http://tracker.example/announce");
        assert_eq!(torrent.name(), "artifact.bin");
        assert_eq!(torrent.length, 20_000);
        assert_eq!(torrent.piece_length, 16_384);
        assert_eq!(torrent.pieces_hashes.len(), 2);
        assert_eq!(torrent.pieces_hashes[0], vec![7u8; 20]);
        assert_eq!(torrent.info_hash, expected_info_hash);
        assert_eq!(torrent.peer_id.len(), 20);
    }

    #[test]
    fn rejects_metainfo_with_malformed_piece_hashes() {
        let torrent_file = ser::to_bytes(&BencodeTorrent {
            announce: "http://tracker.example/announce".to_string(),
            info: BencodeInfo {
                pieces: ByteBuf::from(vec![7u8; 39]),
                piece_length: 16_384,
                length: 20_000,
                name: "artifact.bin".to_string(),
            },
        })
        .unwrap();

        let path = temp_path("bad-hashes");
        fs::write(&path, &torrent_file).unwrap();
        let result = Torrent::open(&path);
        fs::remove_file(&path).unwrap();

        assert!(result.is_err());
    }

    #[test]
    fn rejects_garbage_that_is_not_bencode() {
        let path = temp_path("garbage");
        fs::write(&path, b"definitely not bencode").unwrap();
        let result = Torrent::open(&path);
        fs::remove_file(&path).unwrap();

        assert!(result.is_err());
    }

    // End-to-end fixtures: scripted peers that serve any requested block of
    // the given pieces until their session closes, and a one-shot tracker
    // announcing them.

    fn spawn_fixture_peer(
        info_hash: Vec<u8>,
        pieces: Vec<Vec<u8>>,
    ) -> (u16, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();

            let mut frame = [0u8; HANDSHAKE_LEN];
            std::io::Read::read_exact(&mut stream, &mut frame).unwrap();
            assert_eq!(&frame[28..48], &info_hash[..]);
            let reply = Handshake::new(info_hash, b"-XX0001-000000000000".to_vec());
            stream.write_all(&reply.serialize()).unwrap();

            let interested = Message::read_from(&mut stream).unwrap();
            assert_eq!(interested.id, MESSAGE_INTERESTED);

            stream
                .write_all(&Message::new(MESSAGE_UNCHOKE).serialize().unwrap())
                .unwrap();

            // Serve blocks until the downloader hangs up
            while let Ok(request) = Message::read_from(&mut stream) {
                assert_eq!(request.id, MESSAGE_REQUEST);
                let mut header = Cursor::new(request.payload);
                let index = header.read_u32::<BigEndian>().unwrap();
                let begin = header.read_u32::<BigEndian>().unwrap();
                let length = header.read_u32::<BigEndian>().unwrap();
                let piece = &pieces[index as usize];
                let block = &piece[begin as usize..begin as usize + length as usize];

                let mut payload: Vec<u8> = vec![];
                payload.write_u32::<BigEndian>(index).unwrap();
                payload.write_u32::<BigEndian>(begin).unwrap();
                payload.extend_from_slice(block);
                stream
                    .write_all(
                        &Message::new_with_payload(MESSAGE_PIECE, payload)
                            .serialize()
                            .unwrap(),
                    )
                    .unwrap();
            }
        });

        (port, handle)
    }

    fn spawn_fixture_tracker(peer_ports: Vec<u16>) -> (u16, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 2048];
            let n = std::io::Read::read(&mut stream, &mut request).unwrap();
            let request = String::from_utf8_lossy(&request[..n]);
            assert!(request.contains("info_hash="));
            assert!(request.contains("port=6889"));

            let peer_list: String = peer_ports
                .iter()
                .map(|port| format!("d2:ip9:127.0.0.14:porti{port}ee"))
                .collect();
            let body = format!("d8:intervali900e5:peersl{peer_list}ee");
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
        });

        (port, handle)
    }

    #[test]
    fn downloads_a_two_piece_file_from_one_peer() {
        let piece_data = vec![b"hello!".to_vec(), b"world?".to_vec()];
        let info_hash = vec![0x11u8; 20];

        let (peer_port, peer) = spawn_fixture_peer(info_hash.clone(), piece_data.clone());
        let (tracker_port, tracker) = spawn_fixture_tracker(vec![peer_port]);

        let torrent = Torrent {
            announce: format!("http://127.0.0.1:{tracker_port}/announce"),
            info_hash,
            pieces_hashes: piece_data.iter().map(|data| sha1(data)).collect(),
            piece_length: 6,
            length: 12,
            name: "fixture.bin".to_string(),
            peer_id: generate_peer_id(),
        };

        let path = temp_path("one-peer");
        torrent.download(&path).unwrap();
        peer.join().unwrap();
        tracker.join().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"hello!world?");
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn downloads_a_short_last_piece_file_from_two_peers() {
        // Piece 0 is a full 16384-byte piece, piece 1 the 6-byte remainder
        let piece_data = vec![vec![0x5A; 16_384], b"+tail!".to_vec()];
        let file_bytes: Vec<u8> = piece_data.concat();
        let info_hash = vec![0x22u8; 20];

        let (port_a, peer_a) = spawn_fixture_peer(info_hash.clone(), piece_data.clone());
        let (port_b, peer_b) = spawn_fixture_peer(info_hash.clone(), piece_data.clone());
        let (tracker_port, tracker) = spawn_fixture_tracker(vec![port_a, port_b]);

        let torrent = Torrent {
            announce: format!("http://127.0.0.1:{tracker_port}/announce"),
            info_hash,
            pieces_hashes: piece_data.iter().map(|data| sha1(data)).collect(),
            piece_length: 16_384,
            length: 16_390,
            name: "fixture.bin".to_string(),
            peer_id: generate_peer_id(),
        };

        let path = temp_path("two-peers");
        torrent.download(&path).unwrap();
        peer_a.join().unwrap();
        peer_b.join().unwrap();
        tracker.join().unwrap();

        assert_eq!(fs::read(&path).unwrap(), file_bytes);
        fs::remove_file(&path).unwrap();
    }
}
