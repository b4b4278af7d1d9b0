pub mod dispatcher;
pub mod p2p;

pub use dispatcher::{StopToken, WorkerPool};
pub use p2p::{NodeServer, NodeServerConfig, ProtocolHandler};
