//! Consensus core of the nidus replicated key-value store.
//!
//! Everything lives under [`raft`]: the persistent log, the RPC messages,
//! the Raft node state machine, the bucketed KV state machine it drives and
//! the event loop that serializes timers, RPCs and client proposals.

pub mod raft;
