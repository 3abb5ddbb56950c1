// Bus behaviour end to end against the in-memory broker.

mod common;
mod confirms;
mod error_handling;
mod pubsub;
mod recovery;
mod rpc;
