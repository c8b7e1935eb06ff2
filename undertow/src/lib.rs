pub mod cli;
pub mod client;
pub mod peer;
pub mod storage;
pub mod torrent;
pub mod tracker;
pub mod util;

pub use util::Sha1;
