//! The single-writer serialized actor (§4.1, §5, §5.1). Grounded on the
//! teacher's `network.rs` (`Command` enum, `Channel<Command>`, `Stream`
//! poll loop) and `runloop.rs` (actor task owning state, commands
//! processed one at a time) — generalized from a `libp2p::Swarm`-driven
//! loop to one draining a plain `mpsc::UnboundedReceiver<Command>`.

use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::{
  config::Config,
  epoch::EpochStore,
  error::Error,
  handlers::CoordinatorState,
  message_id::MessageIdMap,
  partition::PartitionInjector,
  peer::{PeerSpec, Tag},
  timers,
  transport::{PeerConnections, Transport},
  tree::{BroadcastTree, TreeForwarder},
  view::ViewSet,
  wire::{AppMessage, Frame, ForwardOptions, InjectPartition, RelayMessage},
};

/// Messages accepted by the Coordinator's single input queue. External
/// API calls carry a `oneshot::Sender` reply channel; inbound frames and
/// timer firings are fire-and-forget, matching §5.1's "transport exit as
/// message" and "synchronous to the Coordinator with an infinite wait"
/// semantics without blocking the async runtime.
pub(crate) enum Command {
  Join(PeerSpec, oneshot::Sender<()>),
  Leave(PeerSpec, oneshot::Sender<Result<(), Error>>),
  Reserve(Tag, oneshot::Sender<Result<(), Error>>),
  Members(oneshot::Sender<Vec<PeerSpec>>),
  IsMember(String, oneshot::Sender<bool>),
  PassiveMembers(oneshot::Sender<Vec<PeerSpec>>),
  ReservedSlots(oneshot::Sender<Vec<(Tag, Option<PeerSpec>)>>),
  SendMessage(String, AppMessage, oneshot::Sender<Result<(), Error>>),
  ForwardMessage {
    node: String,
    target: String,
    msg: AppMessage,
    opts: ForwardOptions,
    reply: oneshot::Sender<Result<(), Error>>,
  },
  InjectPartition(PeerSpec, u16, oneshot::Sender<String>),
  ResolvePartition(String, oneshot::Sender<()>),
  OnUp(String, oneshot::Sender<Result<(), Error>>),
  OnDown(String, oneshot::Sender<Result<(), Error>>),
  UpdateMembers(Vec<PeerSpec>, oneshot::Sender<Result<(), Error>>),
  SyncJoin(PeerSpec, oneshot::Sender<Result<(), Error>>),
  ReceiveFrame(Frame),
  DriverExited(crate::transport::Pid),
  TimerShuffle,
  TimerRandomPromotion,
  TimerTreeRefresh,
}

/// Cheap-to-clone external handle, analogous to the teacher's
/// `Topic`/`Network` handles: sends a [`Command`] and awaits its reply,
/// giving callers synchronous-looking semantics over an async queue.
#[derive(Clone)]
pub struct PeerService {
  commands: mpsc::UnboundedSender<Command>,
}

impl PeerService {
  async fn call<T>(
    &self,
    build: impl FnOnce(oneshot::Sender<T>) -> Command,
  ) -> Result<T, Error> {
    let (tx, rx) = oneshot::channel();
    self
      .commands
      .send(build(tx))
      .map_err(|_| Error::CoordinatorGone)?;
    rx.await.map_err(|_| Error::CoordinatorGone)
  }

  /// Triggers connection to `peer` and sends `JOIN` asynchronously.
  /// Always succeeds at the API level.
  pub async fn join(&self, peer: PeerSpec) -> Result<(), Error> {
    self.call(|reply| Command::Join(peer, reply)).await
  }

  pub async fn leave(&self, peer: PeerSpec) -> Result<(), Error> {
    self.call(|reply| Command::Leave(peer, reply)).await?
  }

  /// Idempotent for an existing tag.
  pub async fn reserve(&self, tag: Tag) -> Result<(), Error> {
    self.call(|reply| Command::Reserve(tag, reply)).await?
  }

  pub async fn members(&self) -> Result<Vec<PeerSpec>, Error> {
    self.call(Command::Members).await
  }

  pub async fn is_member(&self, name: impl Into<String>) -> Result<bool, Error> {
    self.call(|reply| Command::IsMember(name.into(), reply)).await
  }

  pub async fn passive_members(&self) -> Result<Vec<PeerSpec>, Error> {
    self.call(Command::PassiveMembers).await
  }

  pub async fn reserved_slots(
    &self,
  ) -> Result<Vec<(Tag, Option<PeerSpec>)>, Error> {
    self.call(Command::ReservedSlots).await
  }

  pub async fn send_message(
    &self,
    name: impl Into<String>,
    msg: AppMessage,
  ) -> Result<(), Error> {
    self
      .call(|reply| Command::SendMessage(name.into(), msg, reply))
      .await?
  }

  pub async fn forward_message(
    &self,
    node: impl Into<String>,
    target: impl Into<String>,
    msg: AppMessage,
    opts: ForwardOptions,
  ) -> Result<(), Error> {
    let node = node.into();
    let target = target.into();
    self
      .call(|reply| Command::ForwardMessage {
        node,
        target,
        msg,
        opts,
        reply,
      })
      .await?
  }

  /// Returns the opaque reference generated for this partition.
  pub async fn inject_partition(
    &self,
    origin: PeerSpec,
    ttl: u16,
  ) -> Result<String, Error> {
    self
      .call(|reply| Command::InjectPartition(origin, ttl, reply))
      .await
  }

  pub async fn resolve_partition(
    &self,
    reference: impl Into<String>,
  ) -> Result<(), Error> {
    self
      .call(|reply| Command::ResolvePartition(reference.into(), reply))
      .await
  }

  pub async fn on_up(&self, name: impl Into<String>) -> Result<(), Error> {
    self.call(|reply| Command::OnUp(name.into(), reply)).await?
  }

  pub async fn on_down(&self, name: impl Into<String>) -> Result<(), Error> {
    self.call(|reply| Command::OnDown(name.into(), reply)).await?
  }

  pub async fn update_members(
    &self,
    members: Vec<PeerSpec>,
  ) -> Result<(), Error> {
    self
      .call(|reply| Command::UpdateMembers(members, reply))
      .await?
  }

  pub async fn sync_join(&self, peer: PeerSpec) -> Result<(), Error> {
    self.call(|reply| Command::SyncJoin(peer, reply)).await?
  }

  /// Feeds a frame decoded elsewhere (e.g. by a `PeerConnections`
  /// driver task) into the Coordinator's queue. Fire-and-forget: the
  /// Coordinator logs and continues on any internal error (§7).
  pub fn receive_frame(&self, frame: Frame) {
    if self.commands.send(Command::ReceiveFrame(frame)).is_err() {
      warn!("coordinator gone, dropping inbound frame");
    }
  }

  /// Decodes a raw inbound byte buffer and feeds it in. Returns an
  /// error for an unrecognized/corrupt encoding rather than panicking,
  /// per §4.2's "Unknown frames" treatment — it does not reach the
  /// Coordinator's queue at all in that case.
  pub fn receive_raw(&self, bytes: &[u8]) -> Result<(), Error> {
    match rmp_serde::from_slice::<Frame>(bytes) {
      Ok(frame) => {
        self.receive_frame(frame);
        Ok(())
      }
      Err(err) => {
        warn!("dropping undecodable inbound frame: {err}");
        Err(Error::Disconnected)
      }
    }
  }

  /// Notifies the Coordinator that a transport driver exited, per
  /// §4.6/§5.1's "transport exit as message" rule.
  pub fn notify_driver_exited(&self, pid: crate::transport::Pid) {
    if self.commands.send(Command::DriverExited(pid)).is_err() {
      warn!("coordinator gone, dropping driver-exit notification");
    }
  }
}

/// Owns the HyParView state exclusively and drains the command queue
/// one item at a time (§5).
pub struct Coordinator {
  state: CoordinatorState,
  tree_collaborator: Box<dyn BroadcastTree>,
  commands: mpsc::UnboundedReceiver<Command>,
}

impl Coordinator {
  /// Builds a fresh Coordinator and spawns it plus its timer tasks,
  /// returning the handle callers actually interact with.
  ///
  /// Fails fatally (§7, `reservation_limit_exceeded`) if more tags are
  /// reserved than `max_active_size` allows — the caller should not
  /// start the service in that case.
  pub fn spawn(
    self_peer: PeerSpec,
    config: Config,
    connections: Arc<dyn PeerConnections>,
    tree: Box<dyn BroadcastTree>,
  ) -> Result<PeerService, Error> {
    if config.reservations.len() > config.max_active_size {
      return Err(Error::ReservationLimitExceeded {
        requested: config.reservations.len(),
        max_active_size: config.max_active_size,
      });
    }

    let epoch = EpochStore::from_data_dir(config.data_dir.as_deref());
    let state = CoordinatorState {
      views: ViewSet::new(self_peer, config.reservations.clone()),
      sent: MessageIdMap::new(),
      recv: MessageIdMap::new(),
      epoch,
      config: config.clone(),
      transport: Transport::new(connections),
      partitions: PartitionInjector::new(),
      tree: TreeForwarder::new(),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator {
      state,
      tree_collaborator: tree,
      commands: rx,
    };

    tokio::spawn(coordinator.run());
    timers::spawn_all(&config, tx.clone());

    Ok(PeerService { commands: tx })
  }

  async fn run(mut self) {
    info!("coordinator started");
    while let Some(command) = self.commands.recv().await {
      self.handle(command);
    }
    info!("coordinator shutting down: all handles dropped");
  }

  fn handle(&mut self, command: Command) {
    match command {
      Command::Join(peer, reply) => {
        self.state.transport.send(
          &peer,
          Frame::Join(crate::wire::Join {
            peer: self.state.views.self_peer().clone(),
            tag: self.state.config.tag.clone(),
            epoch: self.state.epoch.current(),
          }),
        );
        let _ = reply.send(());
      }
      Command::Leave(_, reply) => {
        let _ = reply.send(Err(Error::NotImplemented));
      }
      Command::Reserve(tag, reply) => {
        let max = self.state.config.max_active_size;
        let ok = self.state.views.reserve(tag, max);
        let _ = reply.send(if ok { Ok(()) } else { Err(Error::NoAvailableSlots) });
      }
      Command::Members(reply) => {
        let _ = reply.send(self.state.views.active_members().cloned().collect());
      }
      Command::IsMember(name, reply) => {
        let _ = reply.send(self.state.views.is_active(&PeerSpec::new(name)));
      }
      Command::PassiveMembers(reply) => {
        let _ = reply.send(self.state.views.passive_members().cloned().collect());
      }
      Command::ReservedSlots(reply) => {
        let slots = self
          .state
          .views
          .reserved_slots()
          .map(|(t, p)| (t.clone(), p.cloned()))
          .collect();
        let _ = reply.send(slots);
      }
      Command::SendMessage(name, msg, reply) => {
        let _ = reply.send(self.send_message(&name, msg));
      }
      Command::ForwardMessage {
        node,
        target,
        msg,
        opts,
        reply,
      } => {
        let _ = reply.send(self.forward_message(&node, &target, msg, opts));
      }
      Command::InjectPartition(origin, ttl, reply) => {
        let reference = self.inject_partition(origin, ttl);
        let _ = reply.send(reference);
      }
      Command::ResolvePartition(reference, reply) => {
        self.resolve_partition(&reference);
        let _ = reply.send(());
      }
      Command::OnUp(_, reply)
      | Command::OnDown(_, reply) => {
        let _ = reply.send(Err(Error::NotImplemented));
      }
      Command::UpdateMembers(_, reply) => {
        let _ = reply.send(Err(Error::NotImplemented));
      }
      Command::SyncJoin(_, reply) => {
        let _ = reply.send(Err(Error::NotImplemented));
      }
      Command::ReceiveFrame(frame) => {
        self.state.dispatch(frame);
      }
      Command::DriverExited(pid) => {
        self.on_driver_exited(pid);
      }
      Command::TimerShuffle => self.on_timer_shuffle(),
      Command::TimerRandomPromotion => self.on_timer_random_promotion(),
      Command::TimerTreeRefresh => self.on_timer_tree_refresh(),
    }
  }

  fn send_message(&mut self, name: &str, msg: AppMessage) -> Result<(), Error> {
    let target = PeerSpec::new(name);
    self.state.transport.dispatch_pid(name)?;
    self.state.transport.send(
      &target,
      Frame::RelayMessage(RelayMessage {
        target: target.clone(),
        inner: msg,
        ttl: 0,
      }),
    );
    Ok(())
  }

  /// §4.1: fast-path direct dispatch, falling back to view-consulted
  /// (and, if enabled, tree-forwarded) delivery on failure.
  ///
  /// `node` is the actual destination peer: it is what gets checked
  /// against the partition list and what every delivery path below
  /// routes to. `target`/`opts.server_ref` are the opaque
  /// application-level routing hint documented as ignored (Open
  /// Question (c)) — ignored here too, beyond being threaded into the
  /// per-peer `is_member`/`send_message` signature shape.
  fn forward_message(
    &mut self,
    node: &str,
    _target: &str,
    msg: AppMessage,
    _opts: ForwardOptions,
  ) -> Result<(), Error> {
    let node_peer = PeerSpec::new(node);
    if self.state.partitions.is_partitioned(&node_peer) {
      return Err(Error::Partitioned);
    }

    if self.state.transport.dispatch_pid(node).is_ok() {
      self.state.transport.send(
        &node_peer,
        Frame::RelayMessage(RelayMessage {
          target: node_peer.clone(),
          inner: msg,
          ttl: 0,
        }),
      );
      return Ok(());
    }

    if self.state.views.is_active(&node_peer) {
      self.state.transport.send(
        &node_peer,
        Frame::RelayMessage(RelayMessage {
          target: node_peer.clone(),
          inner: msg,
          ttl: 0,
        }),
      );
      return Ok(());
    }

    if self.state.config.broadcast {
      let self_peer = self.state.views.self_peer().clone();
      let relay_ttl = self.state.config.relay_ttl;
      let frames = self.state.tree.fanout(&node_peer, msg, relay_ttl, &self_peer);
      if frames.is_empty() {
        return Err(Error::Disconnected);
      }
      for (peer, frame) in frames {
        self.state.transport.send(&peer, frame);
      }
      return Ok(());
    }

    Err(Error::Disconnected)
  }

  fn inject_partition(&mut self, origin: PeerSpec, ttl: u16) -> String {
    if &origin == self.state.views.self_peer() {
      let active: Vec<PeerSpec> = self.state.views.active_members().cloned().collect();
      self.state.partitions.handle_local(
        &origin,
        ttl,
        active.iter(),
        &self.state.transport,
      )
    } else {
      let reference = format!("{:016x}", rand::thread_rng().gen::<u64>());
      self.state.transport.send(
        &origin,
        Frame::InjectPartition(InjectPartition {
          reference: reference.clone(),
          origin,
          ttl,
        }),
      );
      reference
    }
  }

  fn resolve_partition(&mut self, reference: &str) {
    let active: Vec<PeerSpec> = self.state.views.active_members().cloned().collect();
    self
      .state
      .partitions
      .resolve(reference, active.iter(), &self.state.transport);
  }

  /// §4.6: on driver exit, prune the connection registry's record of it
  /// and repair the affected view.
  fn on_driver_exited(&mut self, pid: crate::transport::Pid) {
    let Some((peer, _remaining)) = self.state.transport.prune(pid) else {
      return;
    };

    if self.state.views.is_passive(&peer) {
      self.state.views.remove_from_passive(&peer);
    }

    if self.state.views.remove_from_active(&peer) {
      self.state.try_promote_excluding(&peer);
    }
  }

  /// §4.5 `passive_view_maintenance`.
  fn on_timer_shuffle(&mut self) {
    let exchange = self.state.views.compose_exchange(&self.state.config);
    let excl: std::collections::HashSet<&str> =
      [self.state.views.self_peer().name.as_str()].into_iter().collect();

    let Some(target) = self.state.views.random_active_excluding(&excl) else {
      return;
    };

    self.state.transport.send(
      &target,
      Frame::Shuffle(crate::wire::Shuffle {
        exchange,
        ttl: self.state.config.arwl,
        sender: self.state.views.self_peer().clone(),
      }),
    );
  }

  /// §4.5 `random_promotion`.
  fn on_timer_random_promotion(&mut self) {
    if !self.state.config.is_active_starved(
      self.state.views.active_len(),
      self.state.views.unfilled_reserved_count(),
    ) {
      return;
    }

    let self_peer = self.state.views.self_peer().clone();
    self.state.try_promote_excluding(&self_peer);
  }

  /// §4.5/§4.8 `tree_refresh`: re-queries the injected `BroadcastTree`
  /// collaborator for this node's current eager out-links.
  fn on_timer_tree_refresh(&mut self) {
    let self_peer = self.state.views.self_peer().clone();
    self
      .state
      .tree
      .refresh(self.tree_collaborator.as_ref(), &self_peer);
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::tree::mock::MockBroadcastTree;

  #[tokio::test]
  async fn join_triggers_connect_and_reports_ok() {
    let mock = Arc::new(crate::transport::mock::MockPeerConnections::new());
    let service = Coordinator::spawn(
      PeerSpec::new("a"),
      Config {
        random_promotion: false,
        passive_view_shuffle_period: Duration::from_secs(3600),
        ..Config::default()
      },
      mock.clone(),
      Box::new(MockBroadcastTree::new(vec![])),
    )
    .unwrap();

    service.join(PeerSpec::new("b")).await.unwrap();
    assert!(mock.sent_tags().iter().any(|(p, t)| p == "b" && t == "join"));
  }

  #[tokio::test]
  async fn leave_is_not_implemented() {
    let mock = Arc::new(crate::transport::mock::MockPeerConnections::new());
    let service = Coordinator::spawn(
      PeerSpec::new("a"),
      Config {
        random_promotion: false,
        passive_view_shuffle_period: Duration::from_secs(3600),
        ..Config::default()
      },
      mock,
      Box::new(MockBroadcastTree::new(vec![])),
    )
    .unwrap();

    assert_eq!(service.leave(PeerSpec::new("b")).await, Err(Error::NotImplemented));
  }

  #[tokio::test]
  async fn reservation_over_capacity_is_fatal() {
    let mock = Arc::new(crate::transport::mock::MockPeerConnections::new());
    let result = Coordinator::spawn(
      PeerSpec::new("a"),
      Config {
        max_active_size: 1,
        reservations: vec![Tag::new("x"), Tag::new("y")],
        ..Config::default()
      },
      mock,
      Box::new(MockBroadcastTree::new(vec![])),
    );

    assert!(matches!(
      result,
      Err(Error::ReservationLimitExceeded {
        requested: 2,
        max_active_size: 1
      })
    ));
  }

  #[tokio::test]
  async fn reserve_then_members_round_trip() {
    let mock = Arc::new(crate::transport::mock::MockPeerConnections::new());
    let service = Coordinator::spawn(
      PeerSpec::new("a"),
      Config {
        random_promotion: false,
        passive_view_shuffle_period: Duration::from_secs(3600),
        ..Config::default()
      },
      mock,
      Box::new(MockBroadcastTree::new(vec![])),
    )
    .unwrap();

    service.reserve(Tag::new("storage")).await.unwrap();
    let slots = service.reserved_slots().await.unwrap();
    assert_eq!(slots.len(), 1);

    service.join(PeerSpec::new("b")).await.unwrap();
    let members = service.members().await.unwrap();
    assert!(members.is_empty(), "join only sends JOIN; admission happens on reply");
  }

  #[tokio::test]
  async fn forward_message_to_partitioned_peer_is_rejected() {
    let mock = Arc::new(crate::transport::mock::MockPeerConnections::new());
    let service = Coordinator::spawn(
      PeerSpec::new("a"),
      Config {
        random_promotion: false,
        passive_view_shuffle_period: Duration::from_secs(3600),
        ..Config::default()
      },
      mock,
      Box::new(MockBroadcastTree::new(vec![])),
    )
    .unwrap();

    service.receive_frame(Frame::Join(crate::wire::Join {
      peer: PeerSpec::new("b"),
      tag: None,
      epoch: 1,
    }));
    service.inject_partition(PeerSpec::new("a"), 1).await.unwrap();

    let result = service
      .forward_message("b", "ignored-server-ref", AppMessage::from_static(b"hi"), ForwardOptions::default())
      .await;
    assert_eq!(result, Err(Error::Partitioned));
  }

  #[tokio::test]
  async fn forward_message_to_active_peer_dispatches() {
    let mock = Arc::new(crate::transport::mock::MockPeerConnections::new());
    let service = Coordinator::spawn(
      PeerSpec::new("a"),
      Config {
        random_promotion: false,
        passive_view_shuffle_period: Duration::from_secs(3600),
        ..Config::default()
      },
      mock.clone(),
      Box::new(MockBroadcastTree::new(vec![])),
    )
    .unwrap();

    service.receive_frame(Frame::Join(crate::wire::Join {
      peer: PeerSpec::new("c"),
      tag: None,
      epoch: 1,
    }));

    service
      .forward_message("c", "ignored-server-ref", AppMessage::from_static(b"hi"), ForwardOptions::default())
      .await
      .unwrap();

    assert!(mock.sent_tags().iter().any(|(p, t)| p == "c" && t == "relay_message"));
  }
}
