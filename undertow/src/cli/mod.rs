use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args {
    /// Path to the .torrent metadata file
    pub torrent_file: PathBuf,

    /// Directory the downloaded files are written into
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Port advertised to the tracker
    #[arg(long, default_value_t = 6881)]
    pub port: u16,
}
