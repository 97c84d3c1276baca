mod client;
mod retry_policy;
pub mod wire;

pub use client::{CompletionClient, DeltaStream};
pub use wire::{wire_messages, FileUrls, WireMessage};
