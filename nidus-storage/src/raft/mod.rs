// Raft log, persistence, RPC messages, the node state machine and its event loop
pub mod config;
pub mod error;
pub mod kv;
pub mod log;
pub mod memory;
pub mod node;
pub mod rpc;
pub mod server;
pub mod state_machine;
pub mod storage;
pub mod transport;
