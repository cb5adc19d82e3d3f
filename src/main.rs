//! # Marmot BitTorrent Client
//!
//! A command-line BitTorrent downloader written in Rust.
//!
//! ## Usage
//!
//! ```bash
//! marmot download <torrent_file>
//! ```
//!
//! ## Architecture
//!
//! The client follows a multi-threaded architecture:
//!
//! - **Main thread**: Parses arguments, loads the torrent, runs the
//!   announce/spawn/join cycle until the download completes
//! - **Worker threads**: Each handles communication with one peer
//! - **Shared queue**: Coordinates piece work distribution across workers
//!
//! The file lands in the current working directory under the name carried
//! in the torrent metadata, verified piece by piece against its SHA-1
//! digests.

#[macro_use]
extern crate log;

mod client;
mod handshake;
mod message;
mod peer;
mod piece;
mod queue;
mod storage;
mod torrent;
mod tracker;
mod worker;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use torrent::Torrent;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent downloader, written in Rust."
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download the file described by a metainfo file into the current directory
    Download {
        /// Path to the .torrent file
        torrent: String,
    },
}

/// Sanitize a filename to prevent path traversal and basic issues.
fn sanitize_filename(filename: &str) -> String {
    // Replace path separators with underscores to prevent directory traversal
    let safe_name = filename.replace(['/', '\\'], "_");

    // Use default name if empty
    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Download { torrent } => {
            // Check if torrent file exists
            if !Path::new(&torrent).exists() {
                return Err(anyhow!("could not find torrent file: {}", torrent));
            }

            let torrent = Torrent::open(Path::new(&torrent))?;

            // The output file keeps the advertised name, made filesystem-safe
            let output_filename = sanitize_filename(torrent.name());
            torrent.download(&PathBuf::from(&output_filename))?;

            println!("Saved in {:?}.", output_filename);

            Ok(())
        }
    }
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_separators_are_stripped_from_the_output_name() {
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("dir\\file.bin"), "dir_file.bin");
        assert_eq!(sanitize_filename("plain.iso"), "plain.iso");
    }

    #[test]
    fn empty_names_fall_back_to_a_default() {
        assert_eq!(sanitize_filename(""), "download");
        assert_eq!(sanitize_filename("   "), "download");
    }
}
