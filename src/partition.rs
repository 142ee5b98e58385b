//! Test-only fault injection (§4.7). No teacher counterpart; modeled
//! after the same "side-channel command mutating the same state" shape
//! as the teacher's `Command::BanPeer`.

use rand::Rng;
use tracing::info;

use crate::{
  peer::PeerSpec,
  transport::Transport,
  wire::{Frame, InjectPartition, ResolvePartition},
};

/// `(ref, peer)` pairs denoting injected test partitions.
#[derive(Default)]
pub struct PartitionInjector {
  partitions: Vec<(String, PeerSpec)>,
}

impl PartitionInjector {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_partitioned(&self, peer: &PeerSpec) -> bool {
    self.partitions.iter().any(|(_, p)| p == peer)
  }

  /// Records `(reference, peer)` directly, without generating a
  /// reference or sending anything. Used by `handlers::handle_inject_partition`
  /// when relaying an already-referenced `INJECT_PARTITION` that arrived
  /// from another node.
  pub fn mark(&mut self, reference: String, peer: PeerSpec) {
    self.partitions.push((reference, peer));
  }

  /// Handles an `inject_partition` whose `origin` is this node: generates
  /// a fresh opaque reference, fans `INJECT_PARTITION` out to every
  /// active peer (if `ttl > 0`), and records `(ref, p)` for each.
  /// Returns the generated reference.
  pub fn handle_local<'a>(
    &mut self,
    self_peer: &PeerSpec,
    ttl: u16,
    active: impl Iterator<Item = &'a PeerSpec>,
    transport: &Transport,
  ) -> String {
    let reference = format!("{:016x}", rand::thread_rng().gen::<u64>());
    info!("injecting partition {reference} (ttl {ttl})");

    for peer in active {
      if ttl > 0 {
        transport.send(
          peer,
          Frame::InjectPartition(InjectPartition {
            reference: reference.clone(),
            origin: self_peer.clone(),
            ttl: ttl - 1,
          }),
        );
      }
      self.partitions.push((reference.clone(), peer.clone()));
    }

    reference
  }

  /// Removes every entry tagged `reference`. If anything changed,
  /// propagates `RESOLVE_PARTITION` to every currently active peer and
  /// returns `true`.
  pub fn resolve<'a>(
    &mut self,
    reference: &str,
    active: impl Iterator<Item = &'a PeerSpec>,
    transport: &Transport,
  ) -> bool {
    let before = self.partitions.len();
    self.partitions.retain(|(r, _)| r != reference);
    let changed = self.partitions.len() != before;

    if changed {
      info!("resolving partition {reference}");
      for peer in active {
        transport.send(
          peer,
          Frame::ResolvePartition(ResolvePartition {
            reference: reference.to_string(),
          }),
        );
      }
    }

    changed
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::transport::mock::MockPeerConnections;

  fn peer(name: &str) -> PeerSpec {
    PeerSpec::new(name)
  }

  #[test]
  fn inject_then_resolve_round_trips() {
    let mut injector = PartitionInjector::new();
    let transport = Transport::new(Arc::new(MockPeerConnections::new()));
    let me = peer("me");
    let active = vec![peer("a"), peer("b")];

    let reference = injector.handle_local(&me, 1, active.iter(), &transport);
    assert!(injector.is_partitioned(&peer("a")));
    assert!(injector.is_partitioned(&peer("b")));

    let changed = injector.resolve(&reference, active.iter(), &transport);
    assert!(changed);
    assert!(!injector.is_partitioned(&peer("a")));
  }

  #[test]
  fn resolve_unknown_reference_is_a_noop() {
    let mut injector = PartitionInjector::new();
    let transport = Transport::new(Arc::new(MockPeerConnections::new()));
    assert!(!injector.resolve("nonexistent", std::iter::empty(), &transport));
  }

  #[test]
  fn zero_ttl_records_partitions_without_propagating() {
    let mut injector = PartitionInjector::new();
    let transport = Transport::new(Arc::new(MockPeerConnections::new()));
    let me = peer("me");
    let active = vec![peer("a")];

    injector.handle_local(&me, 0, active.iter(), &transport);
    assert!(injector.is_partitioned(&peer("a")));
  }
}
