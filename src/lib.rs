pub mod blockinfo;
pub mod choke;
pub mod conf;
pub mod engine;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod storage_info;
pub mod tracker;
pub mod torrent;
pub mod disk;

pub mod avg;
pub mod counter;
pub mod alert;

mod define;
pub use define::*;
