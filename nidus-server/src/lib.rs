//! Network side of a nidus node: framing, the TCP transport between peers,
//! the listener that feeds a node's event loop, and the client sender.

pub mod client;
pub mod launch;
pub mod tcp;
pub mod wire;
