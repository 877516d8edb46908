//! # Torrent Metadata and Download Coordination
//!
//! A `.torrent` file is a bencoded dictionary:
//!
//! - **announce** / **announce-list**: tracker URLs for peer discovery
//! - **info**: the file description, whose SHA-1 hash identifies the torrent
//!   - **pieces**: concatenated 20-byte SHA-1 hashes, one per piece
//!   - **piece length**: size of every piece except possibly the last
//!   - **length**: total file size
//!   - **name**: suggested output filename
//!
//! This module parses that container, announces to the trackers, and then
//! coordinates the download:
//!
//! 1. Seed a bounded work queue with one item per piece, in index order.
//! 2. Spawn one worker thread per discovered peer, all sharing the queue and
//!    a results channel.
//! 3. Receive verified pieces in whatever order they finish and copy each
//!    into its offset in the output buffer.
//!
//! Pieces arrive unordered across peers; the index carried by each result
//! decides where its bytes land. The coordinator alone owns the output
//! buffer, so assembly needs no locking.

use crate::peer::{parse_compact_peers, Peer};
use crate::piece::{PieceResult, PieceWork};
use crate::worker::Worker;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::bounded;
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;
use url::Url;

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// Port we announce to trackers (we never listen on it; no seeding)
const PORT: u16 = 6881;

const SHA1_HASH_SIZE: usize = 20;

/// A parsed torrent plus everything needed to download it.
#[derive(Default, Clone)]
pub struct Torrent {
    /// Tracker tiers, each a list of URLs (BEP-12)
    tiers: Vec<Vec<String>>,
    /// SHA-1 hash of the bencoded info dictionary
    info_hash: [u8; 20],
    /// Expected SHA-1 hash of every piece, in index order
    pieces_hashes: Vec<[u8; 20]>,
    /// Size of each piece except possibly the last
    piece_length: u32,
    /// Total file size in bytes
    length: u32,
    /// Suggested output filename
    name: String,
    /// Our 20-byte identifier, generated per run
    peer_id: [u8; 20],
    /// Peers discovered through the trackers
    peers: Vec<Peer>,
}

// Field order matters: bencoded dictionaries are sorted by key, and the info
// hash is computed over the re-serialized dictionary.
#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    #[serde(rename = "length")]
    length: u32,
    #[serde(rename = "name")]
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u32,
    #[serde(rename = "pieces")]
    pieces: ByteBuf,
}

#[derive(Deserialize, Serialize)]
struct BencodeTorrent {
    #[serde(default)]
    announce: String,
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    info: BencodeInfo,
}

#[derive(Debug, Deserialize, Serialize)]
struct BencodeTracker {
    // Seconds until the tracker wants to hear from us again; unused since we
    // announce once
    interval: u32,
    // Compact peer list
    peers: ByteBuf,
}

impl BencodeInfo {
    /// Hash the bencoded info dictionary to identify the torrent.
    fn hash(&self) -> Result<[u8; 20]> {
        let buf: Vec<u8> = ser::to_bytes::<BencodeInfo>(self)?;

        let mut hasher = Sha1::new();
        hasher.update(&buf);

        Ok(hasher.finish())
    }

    /// Split the pieces blob into per-piece SHA-1 hashes.
    fn split_pieces_hashes(&self) -> Result<Vec<[u8; 20]>> {
        if !self.pieces.len().is_multiple_of(SHA1_HASH_SIZE) {
            return Err(anyhow!("torrent has a malformed pieces blob"));
        }

        let mut hashes: Vec<[u8; 20]> = Vec::with_capacity(self.pieces.len() / SHA1_HASH_SIZE);
        for chunk in self.pieces.chunks_exact(SHA1_HASH_SIZE) {
            let mut hash = [0; 20];
            hash.copy_from_slice(chunk);
            hashes.push(hash);
        }

        Ok(hashes)
    }
}

impl Torrent {
    /// Build a new, empty torrent.
    pub fn new() -> Self {
        Default::default()
    }

    /// The suggested output filename from the torrent metadata.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a torrent file and discover peers for it.
    pub fn open(&mut self, filepath: PathBuf) -> Result<()> {
        let mut file = match File::open(filepath) {
            Ok(file) => file,
            Err(_) => return Err(anyhow!("could not open torrent")),
        };

        let mut buf = vec![];
        if file.read_to_end(&mut buf).is_err() {
            return Err(anyhow!("could not read torrent"));
        }

        self.from_bencode(&buf)?;
        self.peers = self.request_peers(PORT)?;

        Ok(())
    }

    /// Fill the metadata fields from raw bencoded torrent content.
    fn from_bencode(&mut self, buf: &[u8]) -> Result<()> {
        let bencode = match de::from_bytes::<BencodeTorrent>(buf) {
            Ok(bencode) => bencode,
            Err(_) => return Err(anyhow!("could not decode torrent")),
        };

        // Announce-list tiers are shuffled as per BEP-12; a bare announce
        // becomes a single one-URL tier
        if !bencode.announce_list.is_empty() {
            self.tiers = bencode.announce_list;
            let mut rng = rand::thread_rng();
            for tier in &mut self.tiers {
                tier.shuffle(&mut rng);
            }
        } else if !bencode.announce.is_empty() {
            self.tiers = vec![vec![bencode.announce.clone()]];
        } else {
            return Err(anyhow!("torrent has no announce or announce-list"));
        }

        self.info_hash = bencode.info.hash()?;
        self.pieces_hashes = bencode.info.split_pieces_hashes()?;
        self.piece_length = bencode.info.piece_length;
        self.length = bencode.info.length;
        self.name = bencode.info.name;

        // Fresh random identity for this run
        let mut rng = rand::thread_rng();
        for byte in self.peer_id.iter_mut() {
            *byte = rng.gen();
        }

        Ok(())
    }

    /// Announce to every known tracker and collect the swarm.
    ///
    /// All trackers are queried in parallel; individual failures are skipped
    /// and the surviving responses are merged and deduplicated.
    fn request_peers(&self, port: u16) -> Result<Vec<Peer>> {
        let mut unique_urls = HashSet::new();
        for tier in &self.tiers {
            for tracker_url in tier {
                unique_urls.insert(tracker_url.clone());
            }
        }

        if unique_urls.is_empty() {
            return Err(anyhow!("no tracker URLs available"));
        }

        let responses = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        for tracker_url in unique_urls {
            let info_hash = self.info_hash;
            let peer_id = self.peer_id;
            let length = self.length;
            let responses = Arc::clone(&responses);

            handles.push(thread::spawn(move || {
                let full_url =
                    match build_tracker_url(&info_hash, &tracker_url, &peer_id, port, length) {
                        Ok(full_url) => full_url,
                        Err(_) => return,
                    };

                let client = match reqwest::blocking::Client::builder()
                    .timeout(Duration::from_secs(15))
                    .build()
                {
                    Ok(client) => client,
                    Err(_) => return,
                };

                let body = match client.get(&full_url).send().and_then(|r| r.bytes()) {
                    Ok(body) => body,
                    Err(e) => {
                        debug!("Tracker {} did not answer: {}", tracker_url, e);
                        return;
                    }
                };

                let tracker = match de::from_bytes::<BencodeTracker>(&body) {
                    Ok(tracker) => tracker,
                    Err(_) => return,
                };

                if let Ok(mut guard) = responses.lock() {
                    guard.push(tracker.peers.to_vec());
                }
            }));
        }

        for handle in handles {
            let _ = handle.join();
        }

        // Merge, dropping responses with malformed peer lists
        let responses = responses.lock().unwrap();
        let mut seen = HashSet::new();
        let mut peers = Vec::new();
        for bytes in responses.iter() {
            match parse_compact_peers(bytes) {
                Ok(parsed) => {
                    for peer in parsed {
                        if seen.insert(peer) {
                            peers.push(peer);
                        }
                    }
                }
                Err(_) => continue,
            }
        }

        if peers.is_empty() {
            return Err(anyhow!("could not get peers from any tracker"));
        }

        info!("Discovered {} peers", peers.len());

        Ok(peers)
    }

    /// Download the whole file, returning the assembled bytes.
    pub fn download(&self) -> Result<Vec<u8>> {
        info!(
            "Starting download of {:?} ({} pieces)",
            self.name,
            self.pieces_hashes.len()
        );

        let nb_pieces = self.pieces_hashes.len();

        // The queue doubles as a retry bus: workers put back items they
        // cannot serve, so it must hold every piece at once.
        let (work_tx, work_rx) = bounded::<PieceWork>(nb_pieces);
        let (result_tx, result_rx) = bounded::<PieceResult>(0);

        for (index, hash) in self.pieces_hashes.iter().enumerate() {
            let index = index as u32;
            let work = PieceWork::new(index, *hash, self.piece_length_at(index));
            if work_tx.send(work).is_err() {
                return Err(anyhow!("could not queue piece for download"));
            }
        }

        for peer in &self.peers {
            let worker = Worker::new(
                *peer,
                self.peer_id,
                self.info_hash,
                work_tx.clone(),
                work_rx.clone(),
                result_tx.clone(),
            );
            thread::spawn(move || worker.run());
        }

        // Workers hold the only remaining result senders, so the channel
        // disconnects if every session dies.
        drop(result_tx);

        let pb = ProgressBar::new(self.length as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
                .unwrap()
                .progress_chars("#>-"),
        );

        let mut data: Vec<u8> = vec![0; self.length as usize];
        let mut nb_downloaded = 0;
        while nb_downloaded < nb_pieces {
            let result = match result_rx.recv() {
                Ok(result) => result,
                Err(_) => {
                    return Err(anyhow!(
                        "all peer sessions ended before the download completed"
                    ))
                }
            };

            let begin = self.piece_offset(result.index);
            data[begin..begin + result.data.len()].copy_from_slice(&result.data);
            pb.inc(result.data.len() as u64);
            nb_downloaded += 1;
        }

        Ok(data)
    }

    /// Length of the piece at `index`; the last piece may be short.
    fn piece_length_at(&self, index: u32) -> u32 {
        let begin = index * self.piece_length;
        let end = (begin + self.piece_length).min(self.length);

        end - begin
    }

    /// Byte offset of the piece at `index` in the assembled file.
    fn piece_offset(&self, index: u32) -> usize {
        index as usize * self.piece_length as usize
    }
}

/// Build the announce URL for one tracker.
fn build_tracker_url(
    info_hash: &[u8; 20],
    announce: &str,
    peer_id: &[u8; 20],
    port: u16,
    length: u32,
) -> Result<String> {
    /// Encode every byte as %XX; info hashes and peer ids are raw binary and
    /// cannot go through a text-based urlencoder.
    fn percent_encode_binary(data: &[u8]) -> String {
        const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
        let mut encoded = String::with_capacity(data.len() * 3);

        for &byte in data {
            encoded.push('%');
            encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
            encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
        }

        encoded
    }

    let base_url = match Url::parse(announce) {
        Ok(base_url) => base_url,
        Err(_) => return Err(anyhow!("could not parse tracker url")),
    };

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
        percent_encode_binary(info_hash),
        percent_encode_binary(peer_id),
        port,
        length
    );

    let mut full_url = base_url.to_string();
    if full_url.contains('?') {
        full_url.push('&');
    } else {
        full_url.push('?');
    }
    full_url.push_str(&query);

    Ok(full_url)
}
