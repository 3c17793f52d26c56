use std::time::Duration;

use crate::message::Message;

/// Input posted to the engine's event queue
#[derive(Debug, Clone)]
pub enum Event<P> {
    /// A locally built proposal offered for the current sequence
    Request(P),
    /// An encoded consensus message received from a peer
    Message(Vec<u8>),
    /// The backend finished committing a block and the head moved
    FinalCommitted,
}

/// Side effect requested by the state machine and carried out by the engine
#[derive(Debug, Clone)]
pub enum Effect<P> {
    /// Rearm the round-change timer
    ResetTimer(Duration),
    /// Check a Preprepare's proposal off the event loop and report back
    Verify { message: Message, proposal: P },
}
