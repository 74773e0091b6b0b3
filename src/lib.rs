/*
    A coherence simulator built around a MESI internal-directory controller
    for non-inclusive cache levels with multiple upstream children.
*/

pub mod delayed_q;
pub mod error;
pub mod mesi;
pub mod sim;

pub use error::SimError;
pub use mesi::{Action, Addr, Cmd, Config, DirController, MemEvent, OutPacket, PeerId, Protocol, State};
