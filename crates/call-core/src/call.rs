//! Call aggregate
//!
//! A call owns an ordered list of peers. It is `InProgress` while at least
//! one peer is live and moves to `Ended` exactly once, when the last peer
//! leaves. Observers (the active-calls repository) are told about peers
//! coming and going and about the call state; they are always notified
//! after the call's own lock has been released.

use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::errors::{CallError, Result};
use crate::events::{CoreEvent, EventSink};
use crate::peer::CallPeer;
use crate::types::{CallDirection, CallId, CallPeerState, CallState, PeerId, ProviderId};

/// Receives structural changes of a call
pub trait CallObserver: Send + Sync {
    fn peer_added(&self, call: &Call, peer: &Arc<CallPeer>);
    fn peer_removed(&self, call: &Call, peer: &Arc<CallPeer>);
    fn call_state_changed(&self, call: &Call, old: CallState, new: CallState);
}

#[derive(Debug)]
struct CallInner {
    state: CallState,
    peers: Vec<Arc<CallPeer>>,
}

/// One signalling conversation and its peers
pub struct Call {
    id: CallId,
    provider_id: ProviderId,
    direction: CallDirection,
    events: Arc<dyn EventSink>,
    inner: RwLock<CallInner>,
    observers: RwLock<Vec<Weak<dyn CallObserver>>>,
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("state", &inner.state)
            .field("peers", &inner.peers.len())
            .finish()
    }
}

impl Call {
    pub(crate) fn new(provider_id: ProviderId, direction: CallDirection, events: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            id: CallId::new(),
            provider_id,
            direction,
            events,
            inner: RwLock::new(CallInner {
                state: CallState::Initializing,
                peers: Vec::new(),
            }),
            observers: RwLock::new(Vec::new()),
        })
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn provider_id(&self) -> ProviderId {
        self.provider_id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> CallState {
        self.inner.read().state
    }

    /// Peers in insertion order
    pub fn peers(&self) -> Vec<Arc<CallPeer>> {
        self.inner.read().peers.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<Arc<CallPeer>> {
        self.inner
            .read()
            .peers
            .iter()
            .find(|p| p.id() == peer_id)
            .cloned()
    }

    pub fn add_observer(&self, observer: Weak<dyn CallObserver>) {
        self.observers.write().push(observer);
    }

    fn observers(&self) -> Vec<Arc<dyn CallObserver>> {
        let mut observers = self.observers.write();
        observers.retain(|o| o.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Add a peer. A no-op when it is already part of the call.
    ///
    /// Peers cannot join an ended call.
    pub fn add_peer(self: &Arc<Self>, peer: Arc<CallPeer>) -> Result<()> {
        if peer.call_id() != self.id {
            return Err(CallError::invalid_argument(format!(
                "Peer {} was created for call {}",
                peer.id(),
                peer.call_id()
            )));
        }
        let started = {
            let mut inner = self.inner.write();
            if inner.state == CallState::Ended {
                return Err(CallError::invalid_state(format!("Call {} has ended", self.id)));
            }
            if inner.peers.iter().any(|p| p.id() == peer.id()) {
                return Ok(());
            }
            inner.peers.push(peer.clone());
            let started = inner.state == CallState::Initializing;
            if started {
                inner.state = CallState::InProgress;
            }
            started
        };
        peer.attach(self);

        debug!(call = %self.id, peer = %peer.id(), "Peer added");
        self.events.publish(CoreEvent::PeerAdded {
            call_id: self.id,
            peer_id: *peer.id(),
            remote: peer.remote().to_string(),
        });
        for observer in self.observers() {
            observer.peer_added(self, &peer);
            if started {
                observer.call_state_changed(self, CallState::Initializing, CallState::InProgress);
            }
        }
        Ok(())
    }

    /// Remove a peer; the call ends when its last peer leaves.
    /// Removing an absent peer does nothing.
    pub fn remove_peer(&self, peer_id: &PeerId) {
        let (peer, ended) = {
            let mut inner = self.inner.write();
            let Some(index) = inner.peers.iter().position(|p| p.id() == peer_id) else {
                return;
            };
            let peer = inner.peers.remove(index);
            let ended = inner.peers.is_empty() && inner.state != CallState::Ended;
            if ended {
                inner.state = CallState::Ended;
            }
            (peer, ended)
        };
        peer.detach();

        debug!(call = %self.id, peer = %peer_id, "Peer removed");
        self.events.publish(CoreEvent::PeerRemoved {
            call_id: self.id,
            peer_id: *peer_id,
        });
        let observers = self.observers();
        for observer in &observers {
            observer.peer_removed(self, &peer);
        }

        if ended {
            info!(call = %self.id, "Call ended");
            self.events.publish(CoreEvent::CallEnded { call_id: self.id });
            for observer in &observers {
                observer.call_state_changed(self, CallState::InProgress, CallState::Ended);
            }
        }
    }

    /// Called by a peer after every state change it makes
    pub(crate) fn peer_state_changed(
        &self,
        peer: &CallPeer,
        old: CallPeerState,
        new: CallPeerState,
        reason: Option<String>,
        error: Option<CallError>,
    ) {
        self.events.publish(CoreEvent::PeerStateChanged {
            call_id: self.id,
            peer_id: *peer.id(),
            old,
            new,
            reason,
            error,
        });
        if new.is_terminal() {
            self.remove_peer(peer.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing;
    use crate::events::{ChannelEventSink, NullEventSink};
    use crate::media::MediaCapabilities;
    use crate::types::DialogId;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl CallObserver for Recorder {
        fn peer_added(&self, _call: &Call, peer: &Arc<CallPeer>) {
            self.seen.lock().push(format!("added {}", peer.remote()));
        }

        fn peer_removed(&self, _call: &Call, peer: &Arc<CallPeer>) {
            self.seen.lock().push(format!("removed {}", peer.remote()));
        }

        fn call_state_changed(&self, _call: &Call, old: CallState, new: CallState) {
            self.seen.lock().push(format!("{:?} -> {:?}", old, new));
        }
    }

    fn peer_for(call: &Call, remote: &str) -> Arc<CallPeer> {
        let ctx = testing::context(Arc::new(NullEventSink));
        CallPeer::new(
            ctx,
            call.id(),
            DialogId::new(),
            CallDirection::Outgoing,
            remote,
            MediaCapabilities::default(),
        )
    }

    #[test]
    fn test_observers_follow_peers() {
        let (sink, mut rx) = ChannelEventSink::new();
        let call = Call::new(ProviderId::new(), CallDirection::Outgoing, Arc::new(sink));
        let recorder = Arc::new(Recorder::default());
        let observer: Weak<dyn CallObserver> = Arc::downgrade(&recorder) as Weak<dyn CallObserver>;
        call.add_observer(observer);

        let alice = peer_for(&call, "alice");
        let bob = peer_for(&call, "bob");
        call.add_peer(alice.clone()).unwrap();
        call.add_peer(alice.clone()).unwrap();
        call.add_peer(bob.clone()).unwrap();
        assert_eq!(call.peer_count(), 2);
        assert!(alice.call().is_some());

        call.remove_peer(alice.id());
        call.remove_peer(alice.id());
        call.remove_peer(bob.id());
        assert_eq!(call.state(), CallState::Ended);
        assert!(alice.call().is_none());

        assert_eq!(
            *recorder.seen.lock(),
            vec![
                "added alice".to_string(),
                "Initializing -> InProgress".to_string(),
                "added bob".to_string(),
                "removed alice".to_string(),
                "removed bob".to_string(),
                "InProgress -> Ended".to_string(),
            ]
        );

        let mut ended = 0;
        while let Ok(envelope) = rx.try_recv() {
            if matches!(envelope.event, CoreEvent::CallEnded { .. }) {
                ended += 1;
            }
        }
        assert_eq!(ended, 1);
    }

    #[test]
    fn test_foreign_peer_is_refused() {
        let call = Call::new(ProviderId::new(), CallDirection::Incoming, Arc::new(NullEventSink));
        let other = Call::new(ProviderId::new(), CallDirection::Incoming, Arc::new(NullEventSink));
        let peer = peer_for(&other, "carol");

        let err = call.add_peer(peer).unwrap_err();
        assert!(matches!(err, CallError::InvalidArgument { .. }));
        assert_eq!(call.state(), CallState::Initializing);
    }

    #[test]
    fn test_dropped_observer_is_forgotten() {
        let call = Call::new(ProviderId::new(), CallDirection::Outgoing, Arc::new(NullEventSink));
        {
            let recorder = Arc::new(Recorder::default());
            call.add_observer(Arc::downgrade(&recorder) as Weak<dyn CallObserver>);
        }
        call.add_peer(peer_for(&call, "dave")).unwrap();
        assert!(call.observers().is_empty());
    }
}
