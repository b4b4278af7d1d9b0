pub mod connection;
pub mod manager;
pub mod messages;
pub mod peerlist;
pub mod protocol;

pub use manager::{NodeServer, NodeServerConfig, PEERS_FILE, SEED_NODES, TARGET_OUT_DEGREE};
pub use protocol::{PeerSet, ProtocolHandler};
