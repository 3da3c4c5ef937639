pub mod net;
pub mod types;

pub use net::{NetConfig, NetError, NetEvent, NetStats, Network};
pub use types::{Avatar, UserId, now};
