//! The `PeerConnections` collaborator (§4.6): out of scope, referenced
//! only by interface. Generalizes the teacher's `ConnectionTracker` +
//! `runloop::Command::{Connect,Disconnect,SendMessage}` split into a
//! trait boundary, since the concrete TCP/noise/yamux transport stack
//! the teacher drives through `libp2p::Swarm` is not this crate's
//! concern.

use std::{fmt, sync::Arc};

use tracing::{debug, warn};

use crate::{error::Error, peer::PeerSpec, wire::Frame};

/// Opaque handle to a connection driver process/task. Not interpreted
/// by this crate beyond equality and use as a map key.
pub type Pid = u64;

/// Observable operations the protocol consumes over a peer's link.
/// A production implementation backs this with real sockets; this
/// crate never does so itself.
pub trait PeerConnections: Send + Sync {
  /// Idempotent connect attempt. On failure nothing observable changes.
  fn maybe_connect(&self, peer: &PeerSpec);

  /// Fast-path dispatch of an outbound frame over a cached connection.
  fn dispatch(&self, peer: &PeerSpec, frame: &Frame) -> Result<(), Error>;

  /// Resolves the driver pid for a peer, if any.
  fn dispatch_pid(&self, name: &str) -> Result<Pid, Error>;

  fn is_connected(&self, peer: &PeerSpec) -> bool;

  /// Closes the link to `peer`, if any. Mirrors the teacher's
  /// `runloop::Command::Disconnect`.
  fn disconnect(&self, peer: &PeerSpec);

  /// Called on driver exit. Returns the peer and remaining connection
  /// count it represented. Panics are not this crate's call to make on
  /// an unknown pid; callers treat `None` as "already pruned".
  fn prune(&self, pid: Pid) -> Option<(PeerSpec, usize)>;

  fn processes(&self, peer: &PeerSpec) -> Vec<Pid>;

  fn foreach(&self, f: &mut dyn FnMut(&PeerSpec));
}

/// Thin adapter over an injected [`PeerConnections`], matching §4.6's
/// read-only surface the rest of the crate actually calls.
pub struct Transport {
  connections: Arc<dyn PeerConnections>,
}

impl Transport {
  pub fn new(connections: Arc<dyn PeerConnections>) -> Self {
    Self { connections }
  }

  pub fn maybe_connect(&self, peer: &PeerSpec) {
    self.connections.maybe_connect(peer);
  }

  pub fn is_connected(&self, peer: &PeerSpec) -> bool {
    self.connections.is_connected(peer)
  }

  /// Resolves the driver pid for `name`, i.e. whether a live connection
  /// is cached right now. Used by `send_message`/`forward_message` to
  /// decide between a direct dispatch and the view/tree fallback.
  pub fn dispatch_pid(&self, name: &str) -> Result<Pid, Error> {
    self.connections.dispatch_pid(name)
  }

  /// Sends `frame` to `peer`, connecting first if needed. Logs and
  /// swallows dispatch failures the way the teacher's runloop logs
  /// `error!` on a failed `swarm.dial`/`send_to` rather than
  /// propagating — outbound sends are best-effort from the
  /// Coordinator's perspective (§5).
  pub fn send(&self, peer: &PeerSpec, frame: Frame) {
    self.connections.maybe_connect(peer);
    if let Err(err) = self.connections.dispatch(peer, &frame) {
      warn!("failed to dispatch {} to {peer}: {err}", frame.tag());
    } else {
      debug!("dispatched {} to {peer}", frame.tag());
    }
  }

  pub fn disconnect(&self, peer: &PeerSpec) {
    debug!("disconnecting {peer}");
    self.connections.disconnect(peer);
  }

  pub fn prune(&self, pid: Pid) -> Option<(PeerSpec, usize)> {
    self.connections.prune(pid)
  }

  pub fn foreach(&self, f: &mut dyn FnMut(&PeerSpec)) {
    self.connections.foreach(f);
  }
}

impl fmt::Debug for Transport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("Transport")
  }
}

#[cfg(test)]
pub(crate) mod mock {
  use std::collections::HashMap;

  use parking_lot::Mutex;

  use super::*;

  #[derive(Default)]
  struct State {
    next_pid: Pid,
    connected: HashMap<String, Pid>,
    sent: Vec<(String, String)>,
  }

  /// In-memory stand-in for a real `PeerConnections`, used by every
  /// scenario test in this crate. Every `maybe_connect` succeeds
  /// immediately; `dispatch` always succeeds for a connected peer and
  /// records the frame tag sent.
  #[derive(Default)]
  pub struct MockPeerConnections {
    state: Mutex<State>,
  }

  impl MockPeerConnections {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn sent_tags(&self) -> Vec<(String, String)> {
      self.state.lock().sent.clone()
    }
  }

  impl PeerConnections for MockPeerConnections {
    fn maybe_connect(&self, peer: &PeerSpec) {
      let mut state = self.state.lock();
      if !state.connected.contains_key(&peer.name) {
        let pid = state.next_pid;
        state.next_pid += 1;
        state.connected.insert(peer.name.clone(), pid);
      }
    }

    fn dispatch(&self, peer: &PeerSpec, frame: &Frame) -> Result<(), Error> {
      let mut state = self.state.lock();
      if !state.connected.contains_key(&peer.name) {
        return Err(Error::Disconnected);
      }
      state.sent.push((peer.name.clone(), frame.tag().to_string()));
      Ok(())
    }

    fn dispatch_pid(&self, name: &str) -> Result<Pid, Error> {
      self
        .state
        .lock()
        .connected
        .get(name)
        .copied()
        .ok_or(Error::Disconnected)
    }

    fn is_connected(&self, peer: &PeerSpec) -> bool {
      self.state.lock().connected.contains_key(&peer.name)
    }

    fn disconnect(&self, peer: &PeerSpec) {
      self.state.lock().connected.remove(&peer.name);
    }

    fn prune(&self, pid: Pid) -> Option<(PeerSpec, usize)> {
      let mut state = self.state.lock();
      let name = state
        .connected
        .iter()
        .find(|(_, p)| **p == pid)
        .map(|(n, _)| n.clone())?;
      state.connected.remove(&name);
      Some((PeerSpec::new(name), 0))
    }

    fn processes(&self, peer: &PeerSpec) -> Vec<Pid> {
      self
        .state
        .lock()
        .connected
        .get(&peer.name)
        .copied()
        .into_iter()
        .collect()
    }

    fn foreach(&self, f: &mut dyn FnMut(&PeerSpec)) {
      for name in self.state.lock().connected.keys() {
        f(&PeerSpec::new(name.clone()));
      }
    }
  }
}
