mod config;
mod coordinator;
mod epoch;
mod error;
mod handlers;
mod message_id;
mod partition;
mod peer;
mod timers;
mod transport;
mod tree;
mod view;
mod wire;

pub use {
  bytes::Bytes,
  config::Config,
  coordinator::{Coordinator, PeerService},
  epoch::{Epoch, EpochPersistence, FileEpochStorage, InMemoryEpochStorage},
  error::Error,
  peer::{PeerSpec, Tag},
  transport::{PeerConnections, Pid},
  tree::BroadcastTree,
  wire::{AppMessage, Frame, ForwardOptions},
};
