//! # Per-Peer Download Session
//!
//! One worker runs on its own thread and owns the whole conversation with one
//! peer: connection setup, the shared work loop, and the block pipeline for
//! the piece currently being downloaded.
//!
//! ## Work distribution
//!
//! All workers drain the same bounded work queue. A worker that cannot serve
//! an item puts it back and moves on:
//!
//! - the peer's bitfield lacks the piece: requeue, keep going
//! - the download fails or times out: requeue, session ends
//! - the piece fails its hash check: requeue, keep going (a later attempt may
//!   land on an honest peer)
//!
//! The queue also acts as the shutdown signal. Once the coordinator has
//! collected every piece it drops the queue, and workers blocked on it
//! return.
//!
//! ## Pipelining
//!
//! Within one piece the worker keeps up to 5 block requests in flight, 16 KiB
//! per block. Blocks may arrive out of order; each PIECE message carries its
//! own offset and is copied straight into place.

use crate::client::Client;
use crate::message::*;
use crate::peer::Peer;
use crate::piece::{PieceResult, PieceWork};

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::{Receiver, Sender};

use std::thread;
use std::time::Duration;

// De-facto pipelining limits used by reference clients
const MAX_BACKLOG: u32 = 5;
const MAX_BLOCK_SIZE: u32 = 16384;

// Hard ceiling for downloading a single piece
const PIECE_TIMEOUT_SECS: u64 = 30;

// Session setup retries (handshake, bitfield)
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECS: u64 = 5;

/// A download session bound to a single peer.
pub struct Worker {
    /// The remote endpoint this session talks to
    peer: Peer,
    /// Our 20-byte identifier
    peer_id: [u8; 20],
    /// SHA-1 hash of the torrent's info dictionary
    info_hash: [u8; 20],
    /// Requeue side of the shared work queue
    work_tx: Sender<PieceWork>,
    /// Drain side of the shared work queue
    work_rx: Receiver<PieceWork>,
    /// Where verified pieces are delivered
    result_tx: Sender<PieceResult>,
}

impl Worker {
    pub fn new(
        peer: Peer,
        peer_id: [u8; 20],
        info_hash: [u8; 20],
        work_tx: Sender<PieceWork>,
        work_rx: Receiver<PieceWork>,
        result_tx: Sender<PieceResult>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            work_tx,
            work_rx,
            result_tx,
        }
    }

    /// Run the session until the queue closes or the peer fails.
    ///
    /// The connection is dropped on every exit path.
    pub fn run(&self) {
        let mut client = match Client::new(self.peer, self.peer_id, self.info_hash) {
            Ok(client) => client,
            Err(e) => {
                debug!("Session with peer {} not started: {}", self.peer, e);
                return;
            }
        };

        if let Err(e) = self.setup(&mut client) {
            warn!("Session setup with peer {} failed: {}", self.peer, e);
            return;
        }

        // We serve no data, but the counterpart expects both courtesies
        // before answering requests: first Unchoke, then Interested.
        if client.send_unchoke().is_err() {
            return;
        }
        if client.send_interested().is_err() {
            return;
        }

        loop {
            let work = match self.work_rx.recv() {
                Ok(work) => work,
                Err(_) => {
                    debug!("Work queue closed, session with peer {} done", self.peer);
                    return;
                }
            };

            // Skip pieces this peer does not have
            if !client.has_piece(work.index) {
                if self.work_tx.send(work).is_err() {
                    return;
                }
                continue;
            }

            let data = match self.download_piece(&mut client, &work) {
                Ok(data) => data,
                Err(e) => {
                    warn!(
                        "Could not download piece {} from peer {}: {}",
                        work.index, self.peer, e
                    );
                    let _ = self.work_tx.send(work);
                    return;
                }
            };

            if let Err(e) = check_integrity(&work, &data) {
                warn!("{}", e);
                if self.work_tx.send(work).is_err() {
                    return;
                }
                continue;
            }

            // Best effort; a failed courtesy does not cost us the piece
            if client.send_have(work.index).is_err() {
                warn!("Could not announce piece {} to peer {}", work.index, self.peer);
            }

            info!("Downloaded piece {} from peer {}", work.index, self.peer);

            if self.result_tx.send(PieceResult::new(work.index, data)).is_err() {
                return;
            }
        }
    }

    /// Handshake and bitfield exchange, with bounded retries.
    ///
    /// The connection is re-dialed between attempts; a peer that fails
    /// `MAX_RETRIES` times is given up on.
    fn setup(&self, client: &mut Client) -> Result<()> {
        let mut attempt = 1;
        loop {
            match client
                .handshake_with_peer()
                .and_then(|_| client.read_bitfield())
            {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if attempt >= MAX_RETRIES {
                        return Err(e);
                    }
                    debug!(
                        "Setup attempt {}/{} with peer {} failed, retrying: {}",
                        attempt, MAX_RETRIES, self.peer, e
                    );
                    thread::sleep(Duration::from_secs(RETRY_DELAY_SECS));
                    client.reconnect()?;
                    attempt += 1;
                }
            }
        }
    }

    /// Download one piece through the request pipeline.
    ///
    /// Keeps up to `MAX_BACKLOG` requests outstanding while the peer leaves
    /// us unchoked, and folds incoming messages into the piece buffer until
    /// every byte has arrived. The whole piece runs under one 30 second
    /// deadline, cleared on success.
    fn download_piece(&self, client: &mut Client, work: &PieceWork) -> Result<Vec<u8>> {
        client.set_deadline(PIECE_TIMEOUT_SECS)?;

        let mut buf: Vec<u8> = vec![0; work.length as usize];
        let mut in_flight: u32 = 0;
        let mut requested: u32 = 0;
        let mut downloaded: u32 = 0;

        while downloaded < work.length {
            // Top up the pipeline
            if !client.is_choked() {
                while in_flight < MAX_BACKLOG && requested < work.length {
                    let block_size = MAX_BLOCK_SIZE.min(work.length - requested);

                    client.send_request(work.index, requested, block_size)?;
                    in_flight += 1;
                    requested += block_size;
                }
            }

            let message = match client.read_message()? {
                Some(message) => message,
                None => continue, // keep-alive
            };

            match message.id {
                MESSAGE_CHOKE => {
                    debug!("Peer {} choked us", self.peer);
                    client.mark_choked();
                }
                MESSAGE_UNCHOKE => {
                    debug!("Peer {} unchoked us", self.peer);
                    client.mark_unchoked();
                }
                MESSAGE_HAVE => client.record_have(&message)?,
                MESSAGE_PIECE => {
                    let n = parse_piece(work.index, &mut buf, &message)?;
                    downloaded += n as u32;
                    in_flight = in_flight.saturating_sub(1);
                }
                id => debug!("Ignoring message id {} from peer {}", id, self.peer),
            }
        }

        client.clear_deadline()?;

        Ok(buf)
    }
}

/// Check a reassembled piece against its expected SHA-1 hash.
pub fn check_integrity(work: &PieceWork, data: &[u8]) -> Result<()> {
    let mut hasher = Sha1::new();
    hasher.update(data);

    if hasher.finish() != work.hash {
        return Err(anyhow!("piece {} failed its integrity check", work.index));
    }

    Ok(())
}
