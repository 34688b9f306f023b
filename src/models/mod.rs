//! Data models

mod customization;
mod disk;
mod metadata;
mod network;
mod source;
mod state;

pub use customization::*;
pub use disk::*;
pub use metadata::*;
pub use network::*;
pub use source::*;
pub use state::*;
