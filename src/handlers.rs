//! Reaction to incoming protocol frames (§4.2). Grounded on the
//! teacher's `topic.rs` `consume_join`/`consume_forward_join`/
//! `consume_neighbor`/`consume_disconnect`/`consume_shuffle`/
//! `consume_shuffle_reply` — the last two were `todo!()` there and are
//! implemented here in full.

use std::collections::HashSet;

use metrics::increment_counter;
use tracing::{debug, warn};

use crate::{
  config::Config,
  epoch::{DisconnectId, EpochStore},
  message_id::{is_addable, is_valid_disconnect, MessageIdMap},
  partition::PartitionInjector,
  peer::{PeerSpec, Tag},
  transport::Transport,
  tree::TreeForwarder,
  view::{ActiveAdmission, ViewSet},
  wire::{
    Disconnect,
    ForwardJoin,
    Frame,
    InjectPartition,
    Join,
    Neighbor,
    NeighborAccepted,
    NeighborRejected,
    NeighborRequest,
    Priority,
    RelayMessage,
    ResolvePartition,
    Shuffle,
    ShuffleReply,
  },
};

/// All mutable state the protocol owns, serialized behind the
/// Coordinator (§5). `ProtocolHandlers` methods are the only code
/// allowed to mutate it besides `Coordinator`'s own bookkeeping
/// (reservations, partition injection, tree refresh).
pub(crate) struct CoordinatorState {
  pub views: ViewSet,
  pub sent: MessageIdMap,
  pub recv: MessageIdMap,
  pub epoch: EpochStore,
  pub config: Config,
  pub transport: Transport,
  pub partitions: PartitionInjector,
  pub tree: TreeForwarder,
}

impl CoordinatorState {
  fn self_tag(&self) -> Option<Tag> {
    self.config.tag.clone()
  }

  fn last_recv_id(&self, peer: &PeerSpec) -> DisconnectId {
    self.recv.get(peer).unwrap_or(DisconnectId::new(0, 0))
  }

  /// Applies the side effect of a [`ActiveAdmission`]: on eviction,
  /// sends `DISCONNECT` to the evicted peer and closes its transport.
  fn apply_admission(&mut self, admission: ActiveAdmission) {
    if let ActiveAdmission::AddedWithEviction {
      evicted,
      disconnect_id,
    } = admission
    {
      self.transport.send(
        &evicted,
        Frame::Disconnect(Disconnect {
          peer: self.views.self_peer().clone(),
          disconnect_id,
        }),
      );
      self.transport.disconnect(&evicted);
    }
  }

  /// Shared admission + `NEIGHBOR` reply step used by both `JOIN` and
  /// the terminal case of `FORWARD_JOIN`. Returns `true` if the peer was
  /// (or already is) active.
  fn admit_and_reply(
    &mut self,
    peer: PeerSpec,
    tag: Option<Tag>,
    peer_epoch: u64,
  ) -> bool {
    self.transport.maybe_connect(&peer);

    if !is_addable(peer_epoch, &peer, &self.sent)
      || self.views.is_active(&peer)
      || !self.transport.is_connected(&peer)
    {
      return self.views.is_active(&peer);
    }

    let last_recv = self.last_recv_id(&peer);
    let admission = self.views.add_to_active_view(
      peer.clone(),
      tag.as_ref(),
      &self.config,
      &mut self.sent,
      &self.epoch,
    );
    self.apply_admission(admission);

    self.transport.send(
      &peer,
      Frame::Neighbor(Neighbor {
        peer: self.views.self_peer().clone(),
        tag: self.self_tag(),
        last_disconnect_id: last_recv,
        target: peer.clone(),
      }),
    );

    true
  }

  pub fn handle_join(&mut self, join: Join) {
    increment_counter!("peer_service_join_received");
    let Join { peer, tag, epoch } = join;

    let admitted = self.admit_and_reply(peer.clone(), tag.clone(), epoch);
    if !admitted {
      debug!("rejected stale/duplicate join from {peer}");
    }

    // Finally, forward to every other active member regardless of whether
    // this node admitted the peer itself — a stale epoch or not-yet-connected
    // transport here must not stop the rest of the active view from learning
    // about the join.
    let others: Vec<PeerSpec> = self
      .views
      .active_members()
      .filter(|p| **p != peer)
      .cloned()
      .collect();

    for other in others {
      self.transport.send(
        &other,
        Frame::ForwardJoin(ForwardJoin {
          peer: peer.clone(),
          tag: tag.clone(),
          epoch,
          ttl: self.config.arwl,
          sender: self.views.self_peer().clone(),
        }),
      );
    }
  }

  pub fn handle_forward_join(&mut self, fj: ForwardJoin) {
    increment_counter!("peer_service_forward_join_received");
    let ForwardJoin {
      peer,
      tag,
      epoch,
      ttl,
      sender,
    } = fj;

    if ttl == 0 || self.views.active_len() == 1 {
      self.admit_and_reply(peer, tag, epoch);
      return;
    }

    if ttl == self.config.prwl {
      self.views.add_to_passive_view(peer.clone(), &self.config);
    }

    let exclude: HashSet<&str> = [
      sender.name.as_str(),
      self.views.self_peer().name.as_str(),
      peer.name.as_str(),
    ]
    .into_iter()
    .collect();

    match self.views.random_active_excluding(&exclude) {
      Some(relay) => {
        self.transport.send(
          &relay,
          Frame::ForwardJoin(ForwardJoin {
            peer,
            tag,
            epoch,
            ttl: ttl - 1,
            sender: self.views.self_peer().clone(),
          }),
        );
      }
      None => {
        self.admit_and_reply(peer, tag, epoch);
      }
    }
  }

  pub fn handle_neighbor(&mut self, n: Neighbor) {
    increment_counter!("peer_service_neighbor_received");
    let Neighbor {
      peer,
      tag,
      last_disconnect_id,
      ..
    } = n;

    self.transport.maybe_connect(&peer);
    if is_addable(last_disconnect_id, &peer, &self.sent) && self.transport.is_connected(&peer) {
      let admission = self.views.add_to_active_view(
        peer,
        tag.as_ref(),
        &self.config,
        &mut self.sent,
        &self.epoch,
      );
      self.apply_admission(admission);
    }
  }

  fn neighbor_acceptable(&self, priority: Priority, tag: &Option<Tag>) -> bool {
    match priority {
      Priority::High => true,
      Priority::Normal => {
        if let Some(tag) = tag {
          if self.views.reserved_slot_open(tag) {
            return true;
          }
        }
        !self
          .config
          .is_active_full(self.views.active_len(), self.views.unfilled_reserved_count())
      }
    }
  }

  pub fn handle_neighbor_request(&mut self, req: NeighborRequest) {
    increment_counter!("peer_service_neighbor_request_received");
    let NeighborRequest {
      peer,
      priority,
      tag,
      disconnect_id,
      exchange,
    } = req;

    let exchange_ack = self.views.compose_exchange(&self.config);
    self.transport.maybe_connect(&peer);

    let acceptable = self.neighbor_acceptable(priority, &tag);
    if acceptable
      && is_addable(disconnect_id, &peer, &self.sent)
      && self.transport.is_connected(&peer)
    {
      let last_recv = self.last_recv_id(&peer);
      self.transport.send(
        &peer,
        Frame::NeighborAccepted(NeighborAccepted {
          peer: self.views.self_peer().clone(),
          tag: self.self_tag(),
          last_disconnect_id: last_recv,
          exchange: exchange_ack,
        }),
      );
      let admission = self.views.add_to_active_view(
        peer,
        tag.as_ref(),
        &self.config,
        &mut self.sent,
        &self.epoch,
      );
      self.apply_admission(admission);
    } else {
      self.transport.send(
        &peer,
        Frame::NeighborRejected(NeighborRejected {
          peer: self.views.self_peer().clone(),
          exchange: exchange_ack,
        }),
      );
    }

    self.views.merge_exchange(exchange, &self.config);
  }

  pub fn handle_neighbor_accepted(&mut self, na: NeighborAccepted) {
    increment_counter!("peer_service_neighbor_accepted_received");
    let NeighborAccepted {
      peer,
      tag,
      last_disconnect_id,
      exchange,
    } = na;

    if is_addable(last_disconnect_id, &peer, &self.sent) {
      let admission = self.views.add_to_active_view(
        peer,
        tag.as_ref(),
        &self.config,
        &mut self.sent,
        &self.epoch,
      );
      self.apply_admission(admission);
    }

    self.views.merge_exchange(exchange, &self.config);
  }

  pub fn handle_neighbor_rejected(&mut self, nr: NeighborRejected) {
    increment_counter!("peer_service_neighbor_rejected_received");
    let NeighborRejected { peer, exchange } = nr;

    self.transport.disconnect(&peer);
    self.views.merge_exchange(exchange, &self.config);
  }

  pub fn handle_disconnect(&mut self, d: Disconnect) {
    increment_counter!("peer_service_disconnect_received");
    let Disconnect { peer, disconnect_id } = d;

    if !is_valid_disconnect(&peer, disconnect_id, &self.recv) {
      warn!("dropping stale disconnect from {peer}");
      return;
    }

    self.recv.set(&peer, disconnect_id);
    self.views.remove_from_active(&peer);
    self.views.add_to_passive_view(peer.clone(), &self.config);
    self.transport.disconnect(&peer);

    if self.views.active_len() == 1 {
      self.try_promote_excluding(&peer);
    }
  }

  /// Promotes a random passive peer (excluding `self` and `exclude`) via
  /// a high-priority `NEIGHBOR_REQUEST`. Used both after a disconnect
  /// shrinks the active view to a singleton and by the `random_promotion`
  /// timer (§4.5).
  pub fn try_promote_excluding(&mut self, exclude: &PeerSpec) {
    let excl: HashSet<&str> = [self.views.self_peer().name.as_str(), exclude.name.as_str()]
      .into_iter()
      .collect();

    let Some(candidate) = self.views.random_passive_excluding(&excl) else {
      debug!("no passive candidate available for promotion");
      return;
    };

    self.transport.maybe_connect(&candidate);
    let exchange = self.views.compose_exchange(&self.config);
    let disconnect_id = self.last_recv_id(&candidate);
    self.transport.send(
      &candidate,
      Frame::NeighborRequest(NeighborRequest {
        peer: self.views.self_peer().clone(),
        priority: Priority::High,
        tag: self.self_tag(),
        disconnect_id,
        exchange,
      }),
    );
  }

  pub fn handle_shuffle(&mut self, s: Shuffle) {
    increment_counter!("peer_service_shuffle_received");
    let Shuffle {
      exchange,
      ttl,
      sender,
    } = s;

    if ttl > 0 && self.views.active_len() > 1 {
      let excl: HashSet<&str> =
        [sender.name.as_str(), self.views.self_peer().name.as_str()]
          .into_iter()
          .collect();
      if let Some(relay) = self.views.random_active_excluding(&excl) {
        self.transport.send(
          &relay,
          Frame::Shuffle(Shuffle {
            exchange,
            ttl: ttl - 1,
            sender,
          }),
        );
        return;
      }
    }

    let reply = self.views.sample_passive(exchange.len());
    self.transport.send(
      &sender,
      Frame::ShuffleReply(ShuffleReply {
        exchange: reply,
        sender: self.views.self_peer().clone(),
      }),
    );
    self.views.merge_exchange(exchange, &self.config);
  }

  pub fn handle_shuffle_reply(&mut self, sr: ShuffleReply) {
    increment_counter!("peer_service_shuffle_reply_received");
    self.views.merge_exchange(sr.exchange, &self.config);
  }

  pub fn handle_inject_partition(&mut self, ip: InjectPartition) {
    increment_counter!("peer_service_inject_partition_received");
    let InjectPartition {
      reference,
      origin,
      ttl,
    } = ip;

    let active: Vec<PeerSpec> = self.views.active_members().cloned().collect();
    for peer in &active {
      if ttl > 0 {
        self.transport.send(
          peer,
          Frame::InjectPartition(InjectPartition {
            reference: reference.clone(),
            origin: origin.clone(),
            ttl: ttl - 1,
          }),
        );
      }
    }
    for peer in active {
      self.partitions.mark(reference.clone(), peer);
    }
  }

  pub fn handle_resolve_partition(&mut self, rp: ResolvePartition) {
    increment_counter!("peer_service_resolve_partition_received");
    let active: Vec<PeerSpec> = self.views.active_members().cloned().collect();
    self.partitions.resolve(&rp.reference, active.iter(), &self.transport);
  }

  /// §4.8: a peer receiving a tree-forwarded relay either delivers
  /// directly (the target is one of its active peers) or re-forwards
  /// with a decremented ttl; `ttl == 0` drops silently.
  pub fn handle_relay_message(&mut self, rm: RelayMessage) {
    increment_counter!("peer_service_relay_message_received");
    let RelayMessage { target, inner, ttl } = rm;

    if target == *self.views.self_peer() {
      debug!("relay_message for {target} reached its destination");
      return;
    }

    if self.views.is_active(&target) {
      self.transport.send(
        &target,
        Frame::RelayMessage(RelayMessage {
          target,
          inner,
          ttl: 0,
        }),
      );
      return;
    }

    if ttl == 0 {
      debug!("dropping relay_message for {target}: ttl exhausted");
      return;
    }

    let self_peer = self.views.self_peer().clone();
    for (peer, frame) in self.tree.fanout(&target, inner, ttl - 1, &self_peer) {
      self.transport.send(&peer, frame);
    }
  }

  /// Exhaustive dispatch over a decoded [`Frame`] (§9 Design Note on
  /// tagged-frame dispatch).
  pub fn dispatch(&mut self, frame: Frame) {
    match frame {
      Frame::Join(f) => self.handle_join(f),
      Frame::ForwardJoin(f) => self.handle_forward_join(f),
      Frame::Neighbor(f) => self.handle_neighbor(f),
      Frame::NeighborRequest(f) => self.handle_neighbor_request(f),
      Frame::NeighborAccepted(f) => self.handle_neighbor_accepted(f),
      Frame::NeighborRejected(f) => self.handle_neighbor_rejected(f),
      Frame::Disconnect(f) => self.handle_disconnect(f),
      Frame::Shuffle(f) => self.handle_shuffle(f),
      Frame::ShuffleReply(f) => self.handle_shuffle_reply(f),
      Frame::RelayMessage(f) => self.handle_relay_message(f),
      Frame::InjectPartition(f) => self.handle_inject_partition(f),
      Frame::ResolvePartition(f) => self.handle_resolve_partition(f),
    }
  }
}
