//! Bounded active/passive view set with reserved-tag slots.
//!
//! Generalizes the teacher's `topic.rs` active/passive bookkeeping
//! (`active_peers`/`passive_peers`/`starved`/`insert_passive`) with the
//! spec's reserved slots and disconnect-id eviction bookkeeping.

use std::collections::{HashMap, HashSet};

use rand::seq::IteratorRandom;
use tracing::debug;

use crate::{
  config::Config,
  epoch::{DisconnectId, EpochStore},
  message_id::{next_disconnect_id, MessageIdMap},
  peer::{PeerSpec, Tag},
};

/// Outcome of [`ViewSet::add_to_active_view`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveAdmission {
  /// `peer` was self, or already active: no-op.
  NoOp,
  /// `peer` was added with room to spare.
  Added,
  /// `peer` was added after evicting `evicted` to free a slot. The caller
  /// must send `DISCONNECT(self, disconnect_id)` to `evicted` and close
  /// its transport connection.
  AddedWithEviction {
    evicted: PeerSpec,
    disconnect_id: DisconnectId,
  },
}

/// Bounded set of peer specs with reserved-tag slots, plus the larger
/// passive backup set.
pub struct ViewSet {
  self_peer: PeerSpec,
  active: HashMap<String, PeerSpec>,
  passive: HashMap<String, PeerSpec>,
  reserved: HashMap<Tag, Option<PeerSpec>>,
}

impl ViewSet {
  /// Builds a fresh view set. `reservations` must not exceed
  /// `max_active_size`; the caller (`Coordinator::new`) is responsible for
  /// surfacing `Error::ReservationLimitExceeded` before this is called.
  pub fn new(self_peer: PeerSpec, reservations: Vec<Tag>) -> Self {
    Self {
      self_peer,
      active: HashMap::new(),
      passive: HashMap::new(),
      reserved: reservations.into_iter().map(|tag| (tag, None)).collect(),
    }
  }

  pub fn self_peer(&self) -> &PeerSpec {
    &self.self_peer
  }

  pub fn is_active(&self, peer: &PeerSpec) -> bool {
    self.active.contains_key(&peer.name)
  }

  pub fn is_passive(&self, peer: &PeerSpec) -> bool {
    self.passive.contains_key(&peer.name)
  }

  pub fn active_len(&self) -> usize {
    self.active.len()
  }

  pub fn passive_len(&self) -> usize {
    self.passive.len()
  }

  pub fn unfilled_reserved_count(&self) -> usize {
    self.reserved.values().filter(|v| v.is_none()).count()
  }

  pub fn active_members(&self) -> impl Iterator<Item = &PeerSpec> {
    self.active.values()
  }

  pub fn passive_members(&self) -> impl Iterator<Item = &PeerSpec> {
    self.passive.values()
  }

  pub fn reserved_slots(&self) -> impl Iterator<Item = (&Tag, Option<&PeerSpec>)> {
    self.reserved.iter().map(|(t, p)| (t, p.as_ref()))
  }

  pub fn reservation_count(&self) -> usize {
    self.reserved.len()
  }

  /// Reserves `tag` if there is room. Idempotent for an existing tag.
  pub fn reserve(&mut self, tag: Tag, max_active_size: usize) -> bool {
    if self.reserved.contains_key(&tag) {
      return true;
    }
    if self.reserved.len() >= max_active_size {
      return false;
    }
    self.reserved.insert(tag, None);
    true
  }

  /// True if `tag` matches a reserved slot that is currently unfilled.
  pub fn reserved_slot_open(&self, tag: &Tag) -> bool {
    matches!(self.reserved.get(tag), Some(None))
  }

  /// Uniform random draw from `active \ exclude`. Never panics on empty.
  pub fn random_active_excluding(&self, exclude: &HashSet<&str>) -> Option<PeerSpec> {
    self
      .active
      .values()
      .filter(|p| !exclude.contains(p.name.as_str()))
      .choose(&mut rand::thread_rng())
      .cloned()
  }

  /// Uniform random draw from `passive \ exclude`. Never panics on empty.
  pub fn random_passive_excluding(&self, exclude: &HashSet<&str>) -> Option<PeerSpec> {
    self
      .passive
      .values()
      .filter(|p| !exclude.contains(p.name.as_str()))
      .choose(&mut rand::thread_rng())
      .cloned()
  }

  pub fn sample_active(&self, n: usize) -> Vec<PeerSpec> {
    self
      .active
      .values()
      .cloned()
      .choose_multiple(&mut rand::thread_rng(), n)
  }

  pub fn sample_passive(&self, n: usize) -> Vec<PeerSpec> {
    self
      .passive
      .values()
      .cloned()
      .choose_multiple(&mut rand::thread_rng(), n)
  }

  /// §4.3 `add_to_active_view`.
  pub fn add_to_active_view(
    &mut self,
    peer: PeerSpec,
    tag: Option<&Tag>,
    config: &Config,
    sent: &mut MessageIdMap,
    epoch: &EpochStore,
  ) -> ActiveAdmission {
    if peer == self.self_peer || self.is_active(&peer) {
      return ActiveAdmission::NoOp;
    }

    // Race guard: a concurrent passive-add may have occurred.
    self.passive.remove(&peer.name);

    let mut result = ActiveAdmission::Added;

    if config.is_active_full(self.active_len(), self.unfilled_reserved_count()) {
      let reserved_names: HashSet<&str> = self
        .reserved
        .values()
        .flatten()
        .map(|p| p.name.as_str())
        .collect();
      let mut exclude: HashSet<&str> = reserved_names;
      exclude.insert(self.self_peer.name.as_str());

      if let Some(dropped) = self.random_active_excluding(&exclude) {
        self.active.remove(&dropped.name);
        self.insert_passive_unchecked(dropped.clone(), config);

        let id = next_disconnect_id(epoch.current(), &dropped, sent);
        sent.set(&dropped, id);

        debug!("evicting {dropped} from active view to admit {peer}, disconnect id {id}");
        result = ActiveAdmission::AddedWithEviction {
          evicted: dropped,
          disconnect_id: id,
        };
      }
    }

    self.active.insert(peer.name.clone(), peer.clone());

    if let Some(tag) = tag {
      if self.reserved_slot_open(tag) {
        self.reserved.insert(tag.clone(), Some(peer));
      }
    }

    epoch.persist();

    result
  }

  /// §4.4 `add_to_passive_view`.
  pub fn add_to_passive_view(&mut self, peer: PeerSpec, config: &Config) {
    if peer == self.self_peer || self.is_active(&peer) || self.is_passive(&peer) {
      return;
    }
    self.insert_passive_unchecked(peer, config);
  }

  fn insert_passive_unchecked(&mut self, peer: PeerSpec, config: &Config) {
    if self.passive.len() >= config.max_passive_size {
      let exclude: HashSet<&str> = [self.self_peer.name.as_str()].into_iter().collect();
      if let Some(evicted) = self.random_passive_excluding(&exclude) {
        self.passive.remove(&evicted.name);
      }
    }
    // Recheck in case the view was already at or above capacity with
    // nothing evictable (e.g. only self excluded and passive is empty).
    if self.passive.len() < config.max_passive_size {
      self.passive.insert(peer.name.clone(), peer);
    }
  }

  /// Removes `peer` from the active view unconditionally, without
  /// emitting a DISCONNECT (the caller decides whether/what to emit).
  pub fn remove_from_active(&mut self, peer: &PeerSpec) -> bool {
    self.active.remove(&peer.name).is_some()
  }

  pub fn remove_from_passive(&mut self, peer: &PeerSpec) -> bool {
    self.passive.remove(&peer.name).is_some()
  }

  /// §4.2 exchange merge: `E - ({self} ∪ Active)`, each remaining peer
  /// added to the passive view subject to the fullness rule.
  pub fn merge_exchange(&mut self, exchange: Vec<PeerSpec>, config: &Config) {
    for peer in exchange {
      if peer == self.self_peer || self.is_active(&peer) {
        continue;
      }
      self.add_to_passive_view(peer, config);
    }
  }

  /// Composes `[self] ++ sample(Active, k_active) ++ sample(Passive,
  /// k_passive)`, deduplicated, per §4.2.
  pub fn compose_exchange(&self, config: &Config) -> Vec<PeerSpec> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    let mut push = |p: PeerSpec, seen: &mut HashSet<String>| {
      if seen.insert(p.name.clone()) {
        out.push(p);
      }
    };

    push(self.self_peer.clone(), &mut seen);
    for p in self.sample_active(config.shuffle_active_sample) {
      push(p, &mut seen);
    }
    for p in self.sample_passive(config.shuffle_passive_sample) {
      push(p, &mut seen);
    }

    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config(max_active: usize, max_passive: usize) -> Config {
    Config {
      max_active_size: max_active,
      max_passive_size: max_passive,
      ..Config::default()
    }
  }

  fn peer(name: &str) -> PeerSpec {
    PeerSpec::new(name)
  }

  #[test]
  fn self_and_duplicate_active_inserts_are_noops() {
    let me = peer("me");
    let mut views = ViewSet::new(me.clone(), vec![]);
    let config = config(6, 30);
    let mut sent = MessageIdMap::new();
    let epoch = EpochStore::from_data_dir(None);

    assert_eq!(
      views.add_to_active_view(me.clone(), None, &config, &mut sent, &epoch),
      ActiveAdmission::NoOp
    );

    assert_eq!(
      views.add_to_active_view(peer("a"), None, &config, &mut sent, &epoch),
      ActiveAdmission::Added
    );
    assert_eq!(
      views.add_to_active_view(peer("a"), None, &config, &mut sent, &epoch),
      ActiveAdmission::NoOp
    );
  }

  #[test]
  fn active_view_evicts_when_full() {
    let me = peer("me");
    let mut views = ViewSet::new(me, vec![]);
    let config = config(2, 30);
    let mut sent = MessageIdMap::new();
    let epoch = EpochStore::from_data_dir(None);

    views.add_to_active_view(peer("b"), None, &config, &mut sent, &epoch);
    views.add_to_active_view(peer("c"), None, &config, &mut sent, &epoch);
    assert_eq!(views.active_len(), 2);

    let admission = views.add_to_active_view(peer("d"), None, &config, &mut sent, &epoch);
    match admission {
      ActiveAdmission::AddedWithEviction {
        evicted,
        disconnect_id,
      } => {
        assert!(evicted.name == "b" || evicted.name == "c");
        assert_eq!(disconnect_id, DisconnectId::new(epoch.current(), 1));
        assert!(views.is_passive(&evicted));
        assert!(!views.is_active(&evicted));
      }
      other => panic!("expected eviction, got {other:?}"),
    }
    assert_eq!(views.active_len(), 2);
    assert!(views.is_active(&peer("d")));
  }

  #[test]
  fn reserved_slot_is_filled_on_matching_tag() {
    let me = peer("me");
    let mut views = ViewSet::new(me, vec![Tag::new("storage")]);
    let config = config(6, 30);
    let mut sent = MessageIdMap::new();
    let epoch = EpochStore::from_data_dir(None);

    views.add_to_active_view(
      peer("storer"),
      Some(&Tag::new("storage")),
      &config,
      &mut sent,
      &epoch,
    );

    let filled = views
      .reserved_slots()
      .find(|(t, _)| **t == Tag::new("storage"))
      .and_then(|(_, p)| p)
      .cloned();
    assert_eq!(filled, Some(peer("storer")));
  }

  #[test]
  fn eviction_never_picks_a_reserved_filled_peer() {
    let me = peer("me");
    let mut views = ViewSet::new(me, vec![Tag::new("storage")]);
    let config = config(1, 30);
    let mut sent = MessageIdMap::new();
    let epoch = EpochStore::from_data_dir(None);

    // Fill the only slot with a reserved peer.
    views.add_to_active_view(
      peer("storer"),
      Some(&Tag::new("storage")),
      &config,
      &mut sent,
      &epoch,
    );
    assert!(views.is_active(&peer("storer")));

    // Active view is already at capacity (1); admitting another peer would
    // normally evict a random active member to free a slot, but the only
    // active member is reserved-filled and therefore excluded from
    // eviction. Per spec step 3/4, admission still proceeds (no eviction
    // happens), so both peers end up active even though that temporarily
    // exceeds max_active_size.
    let admission = views.add_to_active_view(peer("other"), None, &config, &mut sent, &epoch);
    assert_eq!(admission, ActiveAdmission::Added);
    assert!(views.is_active(&peer("storer")));
    assert!(views.is_active(&peer("other")));
  }

  #[test]
  fn passive_view_evicts_random_member_when_full() {
    let me = peer("me");
    let mut views = ViewSet::new(me, vec![]);
    let config = config(6, 1);

    views.add_to_passive_view(peer("x"), &config);
    assert_eq!(views.passive_len(), 1);
    views.add_to_passive_view(peer("y"), &config);
    assert_eq!(views.passive_len(), 1);
  }

  #[test]
  fn passive_view_rejects_self_and_active_members() {
    let me = peer("me");
    let mut views = ViewSet::new(me.clone(), vec![]);
    let config = config(6, 30);
    let mut sent = MessageIdMap::new();
    let epoch = EpochStore::from_data_dir(None);

    views.add_to_active_view(peer("a"), None, &config, &mut sent, &epoch);
    views.add_to_passive_view(peer("a"), &config);
    assert!(!views.is_passive(&peer("a")));

    views.add_to_passive_view(me, &config);
    assert_eq!(views.passive_len(), 0);
  }

  #[test]
  fn compose_exchange_always_includes_self() {
    let me = peer("me");
    let mut views = ViewSet::new(me.clone(), vec![]);
    let config = config(6, 30);
    views.add_to_passive_view(peer("p1"), &config);

    let exchange = views.compose_exchange(&config);
    assert!(exchange.contains(&me));
  }
}
