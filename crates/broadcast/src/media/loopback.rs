//! In-process media transport
//!
//! Links created by the same `LoopbackTransport` (or its clones) pair up by
//! offer token: the caller's offer is `loopback-offer:<token>`, the callee
//! answers `loopback-answer:<token>`, and applying the answer makes both ends
//! `Live`. Faults are injected with `sever` (live links drop to `Lost`) and
//! `set_stalled` (links never reach `Live`).

use super::{LinkSpec, LinkState, MediaSource, MediaTransport, RemoteStream, RemoteTrack, TransportLink};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::debug;

const OFFER_PREFIX: &str = "loopback-offer:";
const ANSWER_PREFIX: &str = "loopback-answer:";

#[derive(Default)]
struct LoopbackHub {
    pending: Mutex<HashMap<String, Weak<LoopbackLink>>>,
    links: Mutex<Vec<Weak<LoopbackLink>>>,
    attachments: Mutex<HashMap<String, usize>>,
    stalled: AtomicBool,
}

impl LoopbackHub {
    fn attach(&self, source: &MediaSource) {
        *self.attachments.lock().entry(source.id().to_string()).or_insert(0) += 1;
    }

    fn detach(&self, source: &MediaSource) {
        let mut attachments = self.attachments.lock();
        if let Some(count) = attachments.get_mut(source.id()) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                attachments.remove(source.id());
            }
        }
    }

    fn live_links(&self) -> Vec<Arc<LoopbackLink>> {
        let mut links = self.links.lock();
        links.retain(|l| l.strong_count() > 0);
        links.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Media transport that connects links inside the current process
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
}

impl LoopbackTransport {
    /// Create a transport with no links
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep new and pending links from ever reaching `Live`
    pub fn set_stalled(&self, stalled: bool) {
        self.hub.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Drop every live link that talks to `relay_id` to `Lost`, on both ends
    ///
    /// Returns the number of links severed.
    pub fn sever(&self, relay_id: &str) -> usize {
        let mut severed = 0;
        for link in self.hub.live_links() {
            if link.spec.remote == relay_id && link.mark_lost() {
                severed += 1;
                if let Some(peer) = link.peer() {
                    peer.mark_lost();
                }
            }
        }
        debug!("Severed {} loopback link(s) to {}", severed, relay_id);
        severed
    }

    /// Number of links currently attaching `source_id`
    pub fn attachment_count(&self, source_id: &str) -> usize {
        self.hub.attachments.lock().get(source_id).copied().unwrap_or(0)
    }

    /// Number of links that are not closed
    pub fn open_links(&self) -> usize {
        self.hub
            .live_links()
            .iter()
            .filter(|l| !l.closed.load(Ordering::SeqCst))
            .count()
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    async fn create_link(&self, spec: LinkSpec) -> Result<Arc<dyn TransportLink>> {
        let (state, _) = watch::channel(LinkState::New);
        let hub = Arc::clone(&self.hub);
        let link = Arc::new_cyclic(|self_ref| LoopbackLink {
            hub,
            self_ref: self_ref.clone(),
            token: spec.call_id.to_string(),
            spec,
            state,
            peer: Mutex::new(None),
            remote: Mutex::new(None),
            attached: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.hub.links.lock().push(Arc::downgrade(&link));
        Ok(link)
    }
}

struct LoopbackLink {
    hub: Arc<LoopbackHub>,
    self_ref: Weak<LoopbackLink>,
    token: String,
    spec: LinkSpec,
    state: watch::Sender<LinkState>,
    peer: Mutex<Option<Weak<LoopbackLink>>>,
    remote: Mutex<Option<RemoteStream>>,
    attached: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackLink {
    fn peer(&self) -> Option<Arc<LoopbackLink>> {
        self.peer.lock().as_ref().and_then(Weak::upgrade)
    }

    fn set_state(&self, next: LinkState) -> bool {
        self.state.send_if_modified(|state| {
            let terminal = matches!(*state, LinkState::Lost | LinkState::Closed);
            if terminal || *state == next {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    fn mark_lost(&self) -> bool {
        self.set_state(LinkState::Lost)
    }

    fn attach_source(&self) {
        if let Some(source) = &self.spec.source {
            if !self.attached.swap(true, Ordering::SeqCst) {
                self.hub.attach(source);
            }
        }
    }

    fn stream_from(source: Option<&MediaSource>) -> RemoteStream {
        match source {
            Some(source) => RemoteStream {
                id: source.id().to_string(),
                tracks: source
                    .tracks()
                    .iter()
                    .map(|t| RemoteTrack {
                        id: t.id().to_string(),
                        kind: t.kind(),
                        handle: None,
                    })
                    .collect(),
            },
            None => RemoteStream::default(),
        }
    }
}

#[async_trait]
impl TransportLink for LoopbackLink {
    async fn create_offer(&self) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::MediaTransport("link closed".to_string()));
        }
        self.hub
            .pending
            .lock()
            .insert(self.token.clone(), self.self_ref.clone());
        self.set_state(LinkState::Connecting);
        Ok(format!("{}{}", OFFER_PREFIX, self.token))
    }

    async fn accept_offer(&self, offer: &str) -> Result<String> {
        let token = offer
            .strip_prefix(OFFER_PREFIX)
            .ok_or_else(|| Error::ProtocolViolation(format!("not a loopback offer: {}", offer)))?;

        let caller = self
            .hub
            .pending
            .lock()
            .remove(token)
            .and_then(|w| w.upgrade())
            .ok_or_else(|| Error::MediaTransport(format!("no pending offer {}", token)))?;

        *self.peer.lock() = Some(Weak::clone(&caller.self_ref));
        *caller.peer.lock() = Some(self.self_ref.clone());
        *self.remote.lock() = Some(Self::stream_from(caller.spec.source.as_ref()));
        *caller.remote.lock() = Some(Self::stream_from(self.spec.source.as_ref()));

        self.attach_source();
        self.set_state(LinkState::Connecting);
        Ok(format!("{}{}", ANSWER_PREFIX, token))
    }

    async fn apply_answer(&self, answer: &str) -> Result<()> {
        let token = answer
            .strip_prefix(ANSWER_PREFIX)
            .ok_or_else(|| Error::ProtocolViolation(format!("not a loopback answer: {}", answer)))?;
        if token != self.token {
            return Err(Error::ProtocolViolation(format!(
                "answer for {} applied to {}",
                token, self.token
            )));
        }

        let peer = self
            .peer()
            .ok_or_else(|| Error::ProtocolViolation("answer without accepted offer".to_string()))?;

        self.attach_source();
        if !self.hub.stalled.load(Ordering::SeqCst) {
            self.set_state(LinkState::Live);
            peer.set_state(LinkState::Live);
        }
        Ok(())
    }

    fn state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn remote_stream(&self) -> Option<RemoteStream> {
        if *self.state.borrow() == LinkState::Live {
            self.remote.lock().clone()
        } else {
            None
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.hub.pending.lock().remove(&self.token);
        if self.attached.swap(false, Ordering::SeqCst) {
            if let Some(source) = &self.spec.source {
                self.hub.detach(source);
            }
        }
        self.state.send_if_modified(|state| {
            if *state == LinkState::Closed {
                false
            } else {
                *state = LinkState::Closed;
                true
            }
        });
        debug!("Loopback link {} closed", self.token);
        Ok(())
    }
}
