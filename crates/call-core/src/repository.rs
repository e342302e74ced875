//! Active calls repository
//!
//! Maps call ids to live calls and keeps a direct dialog -> peer index so
//! in-dialog requests are routed without scanning. The index follows the
//! calls it observes: peers are indexed when added, dropped when removed,
//! and a call is deregistered when it ends. All reads and writes go through
//! one lock.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use crate::call::{Call, CallObserver};
use crate::errors::{CallError, Result};
use crate::peer::CallPeer;
use crate::types::{CallId, CallState, DialogId};

#[derive(Default)]
struct RepositoryInner {
    calls: HashMap<CallId, Arc<Call>>,
    by_dialog: HashMap<DialogId, (CallId, Arc<CallPeer>)>,
}

#[derive(Default)]
pub struct ActiveCallsRepository {
    inner: RwLock<RepositoryInner>,
}

impl ActiveCallsRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track `call` until it ends.
    ///
    /// The repository subscribes before it snapshots the peers, so a peer
    /// added concurrently is indexed by one path or the other.
    pub fn register(self: &Arc<Self>, call: &Arc<Call>) {
        if call.state() == CallState::Ended {
            return;
        }
        {
            let mut inner = self.inner.write();
            if inner.calls.contains_key(&call.id()) {
                return;
            }
            inner.calls.insert(call.id(), call.clone());
        }
        let observer: Weak<dyn CallObserver> = Arc::downgrade(self) as Weak<dyn CallObserver>;
        call.add_observer(observer);

        {
            let mut inner = self.inner.write();
            if inner.calls.contains_key(&call.id()) {
                for peer in call.peers() {
                    Self::index(&mut inner, call.id(), &peer);
                }
            }
        }
        if call.state() == CallState::Ended {
            self.deregister(&call.id());
            return;
        }
        debug!(call = %call.id(), "Call registered");
    }

    /// Index `peer` under its dialog unless a live peer already owns it.
    ///
    /// The check and the insert happen under one lock.
    pub fn claim_dialog(&self, call_id: CallId, peer: &Arc<CallPeer>) -> Result<()> {
        let mut inner = self.inner.write();
        if Self::index(&mut inner, call_id, peer) {
            Ok(())
        } else {
            Err(CallError::invalid_argument(format!("Dialog {} is already in use", peer.dialog())))
        }
    }

    /// Undo [`claim_dialog`](Self::claim_dialog) for a peer that never joined
    pub fn release_dialog(&self, peer: &CallPeer) {
        Self::unindex(&mut self.inner.write(), peer);
    }

    fn index(inner: &mut RepositoryInner, call_id: CallId, peer: &Arc<CallPeer>) -> bool {
        if let Some((_, existing)) = inner.by_dialog.get(peer.dialog()) {
            if existing.id() == peer.id() {
                return true;
            }
            if !existing.state().is_terminal() {
                warn!(
                    dialog = %peer.dialog(),
                    owner = %existing.id(),
                    refused = %peer.id(),
                    "Dialog already belongs to a live peer"
                );
                return false;
            }
        }
        trace!(dialog = %peer.dialog(), peer = %peer.id(), "Indexing peer");
        inner.by_dialog.insert(*peer.dialog(), (call_id, peer.clone()));
        true
    }

    fn unindex(inner: &mut RepositoryInner, peer: &CallPeer) {
        let indexed = inner
            .by_dialog
            .get(peer.dialog())
            .map_or(false, |(_, p)| p.id() == peer.id());
        if indexed {
            inner.by_dialog.remove(peer.dialog());
        }
    }

    pub fn deregister(&self, call_id: &CallId) {
        let mut inner = self.inner.write();
        if inner.calls.remove(call_id).is_some() {
            inner.by_dialog.retain(|_, (owner, _)| owner != call_id);
            debug!(call = %call_id, "Call deregistered");
        }
    }

    pub fn get(&self, call_id: &CallId) -> Option<Arc<Call>> {
        self.inner.read().calls.get(call_id).cloned()
    }

    /// Call owning the peer of `dialog`; `None` means a new call
    pub fn find_call_by_dialog(&self, dialog: &DialogId) -> Option<Arc<Call>> {
        let inner = self.inner.read();
        inner
            .by_dialog
            .get(dialog)
            .and_then(|(call_id, _)| inner.calls.get(call_id).cloned())
    }

    pub fn find_peer_by_dialog(&self, dialog: &DialogId) -> Option<Arc<CallPeer>> {
        self.inner
            .read()
            .by_dialog
            .get(dialog)
            .map(|(_, peer)| peer.clone())
    }

    pub fn calls(&self) -> Vec<Arc<Call>> {
        self.inner.read().calls.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().calls.is_empty()
    }
}

impl CallObserver for ActiveCallsRepository {
    fn peer_added(&self, call: &Call, peer: &Arc<CallPeer>) {
        let mut inner = self.inner.write();
        if inner.calls.contains_key(&call.id()) {
            Self::index(&mut inner, call.id(), peer);
        }
    }

    fn peer_removed(&self, _call: &Call, peer: &Arc<CallPeer>) {
        Self::unindex(&mut self.inner.write(), peer);
    }

    fn call_state_changed(&self, call: &Call, _old: CallState, new: CallState) {
        if new == CallState::Ended {
            self.deregister(&call.id());
        }
    }
}
