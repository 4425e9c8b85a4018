//! Offer/answer negotiation and the per-call driver task

use super::{CallHandle, CallId, CallInner, CallState};
use crate::config::BroadcastConfig;
use crate::error::CallFailure;
use crate::identity::PeerIdentity;
use crate::media::{LinkSpec, LinkState, MediaSource, MediaTransport};
use crate::signaling::channel::{CallSignal, IncomingCall, SignalingChannel};
use crate::signaling::protocol::SignalMessage;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Drives offer/answer for individual calls over a signaling channel
#[derive(Clone)]
pub struct MediaCallNegotiator {
    transport: Arc<dyn MediaTransport>,
    negotiation_timeout: Duration,
}

impl MediaCallNegotiator {
    /// Create a negotiator using `transport` for media links
    pub fn new(transport: Arc<dyn MediaTransport>, config: &BroadcastConfig) -> Self {
        Self {
            transport,
            negotiation_timeout: config.negotiation_timeout(),
        }
    }

    /// Deadline for each call to reach `Connected`
    pub fn negotiation_timeout(&self) -> Duration {
        self.negotiation_timeout
    }

    /// Place a call to `target`
    ///
    /// Sends the offer and returns immediately; the call progresses in a
    /// driver task. Await `CallHandle::settled` for the outcome.
    #[instrument(skip(self, channel, local_source), fields(from = %channel.relay_id(), to = %target))]
    pub async fn place_call(
        &self,
        channel: &Arc<SignalingChannel>,
        target: &PeerIdentity,
        local_source: Option<MediaSource>,
    ) -> Result<CallHandle> {
        let deadline = Instant::now() + self.negotiation_timeout;
        let call_id = CallId::new();
        let remote = target.relay_id();

        let (handle, signals) = self
            .prepare(channel, call_id.clone(), remote.clone(), local_source)
            .await?;
        handle.inner.transition(CallState::Offering);

        let offer = match handle.inner.link.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                handle.inner.finish(failed_with(&e), false).await;
                return Err(e);
            }
        };

        if let Err(e) = channel.send(&remote, SignalMessage::Offer { call_id, sdp: offer }) {
            handle.inner.finish(CallState::Failed(CallFailure::ChannelLost), false).await;
            return Err(e);
        }

        info!("Placed call {} to {}", handle.call_id(), remote);
        let driver = tokio::spawn(drive_call(Arc::clone(&handle.inner), signals, deadline));
        handle.set_driver(driver);
        Ok(handle)
    }

    /// Answer an inbound call request with `local_source` attached
    ///
    /// A malformed offer is rejected back to the caller and returned as
    /// `Error::ProtocolViolation`; the channel stays open.
    #[instrument(skip(self, channel, request, local_source), fields(from = %request.from, call_id = %request.call_id))]
    pub async fn accept_inbound_call(
        &self,
        channel: &Arc<SignalingChannel>,
        request: IncomingCall,
        local_source: Option<MediaSource>,
    ) -> Result<CallHandle> {
        let deadline = Instant::now() + self.negotiation_timeout;
        let IncomingCall {
            from,
            call_id,
            offer,
        } = request;

        let (handle, signals) = self
            .prepare(channel, call_id.clone(), from.clone(), local_source)
            .await?;
        handle.inner.transition(CallState::Answering);

        let answer = match handle.inner.link.accept_offer(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Rejecting call {} from {}: {}", call_id, from, e);
                let reject = SignalMessage::Reject {
                    call_id: call_id.clone(),
                    reason: e.to_string(),
                };
                if let Err(send_err) = channel.send(&from, reject) {
                    debug!("Could not send reject for call {}: {}", call_id, send_err);
                }
                handle.inner.finish(failed_with(&e), false).await;
                return Err(e);
            }
        };

        if let Err(e) = channel.send(&from, SignalMessage::Answer { call_id, sdp: answer }) {
            handle.inner.finish(CallState::Failed(CallFailure::ChannelLost), false).await;
            return Err(e);
        }

        handle.inner.transition(CallState::Negotiating);
        debug!("Answered call {} from {}", handle.call_id(), from);
        let driver = tokio::spawn(drive_call(Arc::clone(&handle.inner), signals, deadline));
        handle.set_driver(driver);
        Ok(handle)
    }

    /// Create the link and claim the call's route on the channel
    async fn prepare(
        &self,
        channel: &Arc<SignalingChannel>,
        call_id: CallId,
        remote: String,
        local_source: Option<MediaSource>,
    ) -> Result<(CallHandle, mpsc::UnboundedReceiver<CallSignal>)> {
        let link = self
            .transport
            .create_link(LinkSpec {
                call_id: call_id.clone(),
                local_role: channel.identity().role(),
                remote: remote.clone(),
                source: local_source.clone(),
            })
            .await?;

        let signals = match channel.register_call(&call_id, &remote) {
            Ok(signals) => signals,
            Err(e) => {
                let _ = link.close().await;
                return Err(e);
            }
        };

        let (state, _) = watch::channel(CallState::Idle);
        let inner = Arc::new(CallInner {
            call_id,
            local_role: channel.identity().role(),
            remote,
            state,
            link,
            channel: Arc::downgrade(channel),
            source: local_source,
            driver: Mutex::new(None),
            released: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });

        Ok((CallHandle::from_inner(inner), signals))
    }
}

fn failed_with(error: &Error) -> CallState {
    CallState::Failed(match error {
        Error::ProtocolViolation(detail) => CallFailure::ProtocolViolation(detail.clone()),
        other => CallFailure::Transport(other.to_string()),
    })
}

/// What the driver does after one step
enum Step {
    Continue,
    End { outcome: CallState, notify_remote: bool },
}

fn end(outcome: CallState, notify_remote: bool) -> Step {
    Step::End {
        outcome,
        notify_remote,
    }
}

/// Consume one call's signals and link state, in order, until it ends
async fn drive_call(
    inner: Arc<CallInner>,
    mut signals: mpsc::UnboundedReceiver<CallSignal>,
    deadline: Instant,
) {
    let mut link_state = inner.link.state();

    // Link may already be live (e.g. answer applied before the driver started).
    let step = on_link_state(&inner, *link_state.borrow_and_update());
    if let Step::End { outcome, notify_remote } = step {
        inner.finish(outcome, notify_remote).await;
        return;
    }

    loop {
        let connected = inner.current() == CallState::Connected;

        let step = tokio::select! {
            _ = tokio::time::sleep_until(deadline), if !connected => {
                warn!("Call {} with {} timed out", inner.call_id, inner.remote);
                end(CallState::Failed(CallFailure::NegotiationTimeout), true)
            }
            signal = signals.recv() => on_signal(&inner, signal).await,
            changed = link_state.changed() => match changed {
                Ok(()) => {
                    let state = *link_state.borrow_and_update();
                    on_link_state(&inner, state)
                }
                Err(_) => end(CallState::Failed(CallFailure::TransportLost), true),
            },
        };

        if let Step::End { outcome, notify_remote } = step {
            inner.finish(outcome, notify_remote).await;
            return;
        }
    }
}

async fn on_signal(inner: &CallInner, signal: Option<CallSignal>) -> Step {
    match signal {
        Some(CallSignal::Answer(answer)) => {
            if inner.current() != CallState::Offering {
                warn!("Ignoring unexpected answer for call {} in state {}", inner.call_id, inner.current());
                return Step::Continue;
            }
            inner.transition(CallState::Negotiating);
            match inner.link.apply_answer(&answer).await {
                Ok(()) => Step::Continue,
                Err(e) => {
                    warn!("Call {} answer rejected by transport: {}", inner.call_id, e);
                    end(failed_with(&e), true)
                }
            }
        }
        Some(CallSignal::Rejected(reason)) => {
            if inner.current() == CallState::Connected {
                warn!("Ignoring rejection of connected call {}", inner.call_id);
                return Step::Continue;
            }
            info!("Call {} rejected: {}", inner.call_id, reason);
            end(CallState::Failed(reason), false)
        }
        Some(CallSignal::RemoteClosed) => {
            info!("Call {} closed by {}", inner.call_id, inner.remote);
            end(CallState::Closed, false)
        }
        None => {
            debug!("Route for call {} ended", inner.call_id);
            end(CallState::Failed(CallFailure::ChannelLost), false)
        }
    }
}

fn on_link_state(inner: &CallInner, state: LinkState) -> Step {
    let current = inner.current();
    match state {
        LinkState::Live => {
            if matches!(current, CallState::Negotiating | CallState::Offering | CallState::Answering) {
                inner.transition(CallState::Connected);
                info!("Call {} with {} connected", inner.call_id, inner.remote);
            }
            Step::Continue
        }
        LinkState::Lost if current == CallState::Connected => {
            end(CallState::Failed(CallFailure::TransportLost), true)
        }
        LinkState::Lost => end(
            CallState::Failed(CallFailure::Transport("media path failed during negotiation".to_string())),
            true,
        ),
        LinkState::Closed => end(CallState::Closed, true),
        LinkState::New | LinkState::Connecting => Step::Continue,
    }
}
