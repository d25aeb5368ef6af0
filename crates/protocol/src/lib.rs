pub mod config;
pub mod messages;
pub mod rpc;
pub mod sdp;

pub use config::*;
pub use messages::*;
pub use rpc::*;
pub use sdp::*;
