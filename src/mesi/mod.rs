mod common;
mod controller;
mod directory;
mod mshr;
mod stats;

pub use common::{Action, Addr, Cmd, Config, MemEvent, OutPacket, PeerId, Protocol, State};
pub use controller::DirController;
pub use directory::{CacheArray, DirEntry};
pub use mshr::{Mshr, MshrEntry};
pub use stats::Stats;
