use std::error::Error;
use std::fs::File;
use std::io::Read;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use undertow::cli::Args;
use undertow::client::{Client, Config};
use undertow::peer::PeerId;
use undertow::storage::PieceStore;
use undertow::torrent::TorrentMetadata;
use undertow::tracker::HttpTracker;

fn main() -> ExitCode {
    env_logger::init();
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut data = Vec::new();
    File::open(&args.torrent_file)?.read_to_end(&mut data)?;
    let meta = TorrentMetadata::from_bytes(&data)?;
    info!(
        "loaded '{}': {} pieces of {} bytes, {} bytes total, info hash {}",
        meta.name,
        meta.piece_count(),
        meta.piece_length,
        meta.total_length,
        hex::encode(meta.info_hash)
    );

    let store = PieceStore::new(&meta, &args.output_dir)?;
    let client_id = PeerId::random();
    let tracker = HttpTracker::new(&client_id)?;
    let config = Config {
        listen_port: args.port,
        ..Config::default()
    };
    let client = Client::new(client_id, config, Box::new(tracker));

    client.download(&meta, &store)?;
    info!(
        "download complete, {} pieces verified",
        store.downloaded_count()
    );
    Ok(())
}
