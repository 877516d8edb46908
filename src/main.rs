//! # Remora BitTorrent Client
//!
//! A command-line BitTorrent client for single-file torrents.
//!
//! ## Usage
//!
//! ```bash
//! remora <torrent_file>
//! remora <torrent_file> -o <output_file>
//! ```
//!
//! ## Architecture
//!
//! - **Main thread**: parses arguments, loads the torrent, announces to the
//!   trackers, and assembles verified pieces into the output file
//! - **Worker threads**: one per peer, each speaking the peer wire protocol
//!   over its own TCP connection
//! - **Channels**: a shared work queue distributes pieces to workers and a
//!   results channel carries verified pieces back

#[macro_use]
extern crate log;

mod bitfield;
mod client;
mod handshake;
mod message;
mod peer;
mod piece;
mod torrent;
mod worker;

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use torrent::Torrent;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent client for single-file torrents."
)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Where to save the file (defaults to the name from the torrent)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

/// Make a torrent-supplied filename safe to create in the working directory.
fn sanitize_filename(filename: &str) -> String {
    // Path separators would let a torrent name escape the directory
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}

/// Ask the user whether an existing file may be replaced.
fn confirm_overwrite(path: &PathBuf) -> Result<bool> {
    print!("'{}' already exists, overwrite? [y/N] ", path.display());
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;

    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn run(args: Args) -> Result<()> {
    if !args.torrent.exists() {
        return Err(anyhow!(
            "could not find torrent file: {}",
            args.torrent.display()
        ));
    }

    // Parse the torrent and discover the swarm
    let mut torrent = Torrent::new();
    torrent.open(args.torrent)?;

    // Pick the output path, preferring an explicit -o over the torrent name
    let output_path = args
        .output
        .unwrap_or_else(|| PathBuf::from(sanitize_filename(torrent.name())));

    if output_path.exists() && !confirm_overwrite(&output_path)? {
        println!("Download cancelled.");
        return Ok(());
    }

    let data: Vec<u8> = torrent.download()?;

    fs::write(&output_path, &data)
        .with_context(|| format!("could not save file '{}'", output_path.display()))?;

    println!("Saved in \"{}\".", output_path.display());

    Ok(())
}

fn main() {
    pretty_env_logger::init_timed();

    if let Err(error) = run(Args::parse()) {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("a\\b"), "a_b");
        assert_eq!(sanitize_filename("plain.iso"), "plain.iso");
    }

    #[test]
    fn sanitize_falls_back_on_empty_name() {
        assert_eq!(sanitize_filename(""), "download");
        assert_eq!(sanitize_filename("   "), "download");
    }
}
