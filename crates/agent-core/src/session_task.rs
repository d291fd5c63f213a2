//! One task per negotiation session
//!
//! A [`SessionTask`] owns its [`NegotiationSession`] outright. Signaling
//! input from the dispatcher, transport callbacks and the cancel signal are
//! all consumed by the same loop, one at a time, so a transition never
//! observes another half-applied transition.
//!
//! Every outstanding transport, media, UI or relay operation is raced
//! against the cancel signal. When the session is ended while an operation
//! is pending, that operation's future is dropped and its result can never
//! be applied. Teardown runs exactly once, on the way out of [`SessionTask::run`].
//!
//! A session still in `Idle` or `KeyExchanged` ends as [`EndReason::Expired`]
//! once it has seen no input for the agent's pending session TTL.

use chrono::Utc;
use duet_signal_core::{Candidate, Identity, PublicKey, SessionDescription, SignalingMessage};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::collaborators::{
    CallHandler, Connectivity, KeyGenerator, MediaSource, MediaTrack, PeerTransport, TransportEvent,
    TransportFactory,
};
use crate::error::AgentError;
use crate::session::NegotiationSession;
use crate::types::{CallAction, CallEvent, CallState, EndReason, IncomingCall, Role, SessionSnapshot};

/// Outcome of one step: `Err` ends the session with that reason
type Flow = std::result::Result<(), EndReason>;

/// Collaborators and channels shared by every session of an agent
pub(crate) struct SessionContext {
    pub local: Identity,
    pub outbound: mpsc::Sender<SignalingMessage>,
    pub events: broadcast::Sender<CallEvent>,
    pub media: Arc<dyn MediaSource>,
    pub transports: Arc<dyn TransportFactory>,
    pub handler: Arc<dyn CallHandler>,
    pub keys: Arc<dyn KeyGenerator>,
    pub accept_timeout: Duration,
    pub pending_ttl: Duration,
}

impl SessionContext {
    pub fn emit(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Work handed to a session by the dispatcher
#[derive(Debug)]
pub(crate) enum SessionInput {
    /// The user asked to call this peer
    Call,
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(Candidate),
    Key(PublicKey),
}

impl SessionInput {
    fn name(&self) -> &'static str {
        match self {
            SessionInput::Call => "call",
            SessionInput::Offer(_) => "offer",
            SessionInput::Answer(_) => "answer",
            SessionInput::Candidate(_) => "candidate",
            SessionInput::Key(_) => "key",
        }
    }
}

pub(crate) type CancelSignal = watch::Receiver<Option<EndReason>>;

fn cancel_reason(cancel: &CancelSignal, changed: bool) -> EndReason {
    if !changed {
        // The dispatcher went away
        return EndReason::Shutdown;
    }
    cancel.borrow().clone().unwrap_or(EndReason::Shutdown)
}

/// Run `operation` unless the session is cancelled first
async fn guard<F>(cancel: &mut CancelSignal, operation: F) -> std::result::Result<F::Output, EndReason>
where
    F: Future,
{
    tokio::select! {
        biased;
        changed = cancel.changed() => Err(cancel_reason(cancel, changed.is_ok())),
        output = operation => Ok(output),
    }
}

async fn next_transport_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

fn negotiation_failed(error: AgentError) -> EndReason {
    EndReason::NegotiationFailed(error.to_string())
}

enum Step {
    Input(SessionInput),
    Transport(Option<TransportEvent>),
    End(EndReason),
}

pub(crate) struct SessionTask {
    ctx: Arc<SessionContext>,
    session: NegotiationSession,
    inputs: mpsc::Receiver<SessionInput>,
    cancel: CancelSignal,
    snapshot: watch::Sender<SessionSnapshot>,
    transport: Option<Arc<dyn PeerTransport>>,
    transport_events: Option<mpsc::Receiver<TransportEvent>>,
    tracks: Vec<MediaTrack>,
    media_requested: bool,
    torn_down: bool,
}

impl SessionTask {
    pub fn new(
        ctx: Arc<SessionContext>,
        session: NegotiationSession,
        inputs: mpsc::Receiver<SessionInput>,
        cancel: CancelSignal,
        snapshot: watch::Sender<SessionSnapshot>,
    ) -> Self {
        Self {
            ctx,
            session,
            inputs,
            cancel,
            snapshot,
            transport: None,
            transport_events: None,
            tracks: Vec::new(),
            media_requested: false,
            torn_down: false,
        }
    }

    pub async fn run(mut self) {
        debug!("Session with {} started", self.session.remote().short());
        let mut expires_at = Instant::now() + self.ctx.pending_ttl;

        loop {
            let pending = matches!(self.session.state(), CallState::Idle | CallState::KeyExchanged);
            let step = tokio::select! {
                biased;
                changed = self.cancel.changed() => Step::End(cancel_reason(&self.cancel, changed.is_ok())),
                input = self.inputs.recv() => match input {
                    Some(input) => Step::Input(input),
                    None => Step::End(EndReason::Shutdown),
                },
                event = next_transport_event(&mut self.transport_events) => Step::Transport(event),
                _ = tokio::time::sleep_until(expires_at), if pending => Step::End(EndReason::Expired),
            };

            let flow = match step {
                Step::End(reason) => Err(reason),
                Step::Input(input) => {
                    expires_at = Instant::now() + self.ctx.pending_ttl;
                    debug!(
                        "{} from {} in {}",
                        input.name(),
                        self.session.remote().short(),
                        self.session.state()
                    );
                    self.handle_input(input).await
                }
                Step::Transport(Some(event)) => self.handle_transport_event(event).await,
                Step::Transport(None) => {
                    self.transport_events = None;
                    Err(EndReason::TransportClosed)
                }
            };

            if let Err(reason) = flow {
                self.teardown(reason).await;
                break;
            }
            self.publish();
        }
    }

    async fn handle_input(&mut self, input: SessionInput) -> Flow {
        match input {
            SessionInput::Call => self.start_call().await,
            SessionInput::Offer(offer) => self.on_offer(offer).await,
            SessionInput::Answer(answer) => self.on_answer(answer).await,
            SessionInput::Candidate(candidate) => self.on_remote_candidate(candidate).await,
            SessionInput::Key(key) => self.on_remote_key(key).await,
        }
    }

    async fn start_call(&mut self) -> Flow {
        let state = self.session.state();
        if !matches!(state, CallState::Idle | CallState::KeyExchanged) {
            warn!("Ignoring call request for {} in {}", self.session.remote().short(), state);
            return Ok(());
        }

        info!("Calling {}", self.session.remote());
        self.session.assume_role(Role::Initiator);
        self.send_local_key().await?;
        self.acquire_media().await?;
        self.ensure_transport().await?;

        let transport = self.transport_handle()?;
        let offer = guard(&mut self.cancel, transport.create_description(Role::Initiator))
            .await?
            .map_err(negotiation_failed)?;
        self.session
            .set_local_description(offer.clone())
            .map_err(negotiation_failed)?;
        self.set_state(CallState::OfferSent).await;

        let message = SignalingMessage::offer(&self.ctx.local, self.session.remote(), offer);
        self.send(message).await?;
        self.flush_local_candidates().await
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> Flow {
        match self.session.state() {
            CallState::Idle | CallState::KeyExchanged => self.answer_new_call(offer).await,
            CallState::OfferSent => {
                // Glare: the smaller identity keeps its offer
                if self.ctx.local < *self.session.remote() {
                    debug!("Glare with {}, keeping our offer", self.session.remote().short());
                    return Ok(());
                }
                debug!("Glare with {}, answering their offer", self.session.remote().short());
                self.restart_as_responder().await;
                self.answer(offer).await
            }
            CallState::OfferReceived | CallState::AnswerExchanged | CallState::Connected => {
                info!("Renegotiating with {}", self.session.remote().short());
                self.restart_as_responder().await;
                self.answer(offer).await
            }
            CallState::Ended => Ok(()),
        }
    }

    async fn answer_new_call(&mut self, offer: SessionDescription) -> Flow {
        let remote = self.session.remote().clone();
        self.session.assume_role(Role::Responder);
        self.set_state(CallState::OfferReceived).await;
        self.ctx.emit(CallEvent::IncomingCall {
            remote: remote.clone(),
        });

        let call = IncomingCall {
            remote: remote.clone(),
            remote_public_key: self.session.remote_key().cloned(),
            received_at: Utc::now(),
        };
        let prompt = tokio::time::timeout(self.ctx.accept_timeout, self.ctx.handler.on_incoming_call(call));

        match guard(&mut self.cancel, prompt).await? {
            Ok(CallAction::Accept) => {
                info!("Accepted call from {}", remote);
                self.answer(offer).await
            }
            Ok(CallAction::Reject) => {
                info!("Declined call from {}", remote);
                self.send(SignalingMessage::reject(&self.ctx.local, &remote, Some("declined".into())))
                    .await?;
                Err(EndReason::Declined)
            }
            Ok(CallAction::Ignore) => {
                info!("Ignoring call from {}", remote);
                Err(EndReason::Ignored)
            }
            Err(_) => {
                info!("No answer for call from {} within {:?}", remote, self.ctx.accept_timeout);
                self.send(SignalingMessage::reject(&self.ctx.local, &remote, Some("timeout".into())))
                    .await?;
                Err(EndReason::Declined)
            }
        }
    }

    /// Apply a remote offer and send our answer
    async fn answer(&mut self, offer: SessionDescription) -> Flow {
        self.send_local_key().await?;
        self.acquire_media().await?;
        self.ensure_transport().await?;

        let transport = self.transport_handle()?;
        guard(&mut self.cancel, transport.apply_remote_description(&offer))
            .await?
            .map_err(negotiation_failed)?;
        let buffered = self
            .session
            .set_remote_description(offer)
            .map_err(negotiation_failed)?;
        self.apply_remote_candidates(buffered).await?;

        let answer = guard(&mut self.cancel, transport.create_description(Role::Responder))
            .await?
            .map_err(negotiation_failed)?;
        self.session
            .set_local_description(answer.clone())
            .map_err(negotiation_failed)?;
        self.set_state(CallState::AnswerExchanged).await;

        let message = SignalingMessage::answer(&self.ctx.local, self.session.remote(), answer);
        self.send(message).await?;
        self.flush_local_candidates().await
    }

    async fn restart_as_responder(&mut self) {
        self.session.restart(Role::Responder);
        self.set_state(CallState::OfferReceived).await;
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Flow {
        if self.session.state() != CallState::OfferSent {
            debug!(
                "Ignoring answer from {} in {}",
                self.session.remote().short(),
                self.session.state()
            );
            return Ok(());
        }

        let transport = self.transport_handle()?;
        guard(&mut self.cancel, transport.apply_remote_description(&answer))
            .await?
            .map_err(negotiation_failed)?;
        let buffered = self
            .session
            .set_remote_description(answer)
            .map_err(negotiation_failed)?;
        self.apply_remote_candidates(buffered).await?;
        self.set_state(CallState::AnswerExchanged).await;
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: Candidate) -> Flow {
        if self.session.add_remote_candidate(candidate.clone()) {
            self.apply_remote_candidates(vec![candidate]).await?;
        } else {
            debug!("Buffered candidate from {}", self.session.remote().short());
        }
        Ok(())
    }

    async fn apply_remote_candidates(&mut self, candidates: Vec<Candidate>) -> Flow {
        let Some(transport) = self.transport.clone() else {
            return Ok(());
        };
        for candidate in candidates {
            if let Err(e) = guard(&mut self.cancel, transport.add_remote_candidate(&candidate)).await? {
                warn!("Transport rejected candidate from {}: {}", self.session.remote().short(), e);
            }
        }
        Ok(())
    }

    async fn on_remote_key(&mut self, key: PublicKey) -> Flow {
        debug!("Bound {} byte key for {}", key.len(), self.session.remote().short());
        self.session.set_remote_key(key.clone());
        self.ctx.emit(CallEvent::RemoteKey {
            remote: self.session.remote().clone(),
            key,
        });
        if self.session.state() == CallState::Idle {
            self.set_state(CallState::KeyExchanged).await;
        }
        Ok(())
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Some(candidate) = self.session.queue_local_candidate(candidate) {
                    let message = SignalingMessage::candidate(&self.ctx.local, self.session.remote(), candidate);
                    self.send(message).await?;
                }
                Ok(())
            }
            TransportEvent::ConnectivityChanged(Connectivity::Connected) => {
                if self.session.state() == CallState::AnswerExchanged {
                    info!("Connected to {}", self.session.remote());
                    self.set_state(CallState::Connected).await;
                }
                Ok(())
            }
            TransportEvent::ConnectivityChanged(Connectivity::Failed) => {
                Err(self.transport_failure("connectivity failed".to_string()))
            }
            TransportEvent::ConnectivityChanged(Connectivity::Closed) => Err(EndReason::TransportClosed),
            TransportEvent::ConnectivityChanged(other) => {
                debug!("Transport to {} is {:?}", self.session.remote().short(), other);
                Ok(())
            }
            TransportEvent::RemoteTracks(tracks) => {
                let remote = self.session.remote().clone();
                guard(&mut self.cancel, self.ctx.handler.on_remote_media(&remote, &tracks)).await
            }
            TransportEvent::Failed(reason) => Err(self.transport_failure(reason)),
        }
    }

    fn transport_failure(&self, reason: String) -> EndReason {
        if self.session.state() == CallState::Connected {
            EndReason::TransportFailed(reason)
        } else {
            EndReason::NegotiationFailed(reason)
        }
    }

    async fn send_local_key(&mut self) -> Flow {
        let keys = self.ctx.keys.clone();
        let public = self.session.ensure_local_keys(|| keys.generate());
        let message = SignalingMessage::key(&self.ctx.local, self.session.remote(), public);
        self.send(message).await
    }

    async fn acquire_media(&mut self) -> Flow {
        if self.media_requested {
            return Ok(());
        }
        self.media_requested = true;
        let tracks = guard(&mut self.cancel, self.ctx.media.acquire())
            .await?
            .map_err(negotiation_failed)?;

        let remote = self.session.remote().clone();
        guard(&mut self.cancel, self.ctx.handler.on_local_media(&remote, &tracks)).await?;
        self.tracks = tracks;
        Ok(())
    }

    async fn ensure_transport(&mut self) -> Flow {
        if self.transport.is_some() {
            return Ok(());
        }
        let (transport, events) = guard(&mut self.cancel, self.ctx.transports.create(self.session.remote()))
            .await?
            .map_err(negotiation_failed)?;
        self.transport = Some(transport.clone());
        self.transport_events = Some(events);

        guard(&mut self.cancel, transport.attach_tracks(&self.tracks))
            .await?
            .map_err(negotiation_failed)
    }

    fn transport_handle(&self) -> std::result::Result<Arc<dyn PeerTransport>, EndReason> {
        self.transport
            .clone()
            .ok_or_else(|| EndReason::NegotiationFailed("no transport".to_string()))
    }

    async fn flush_local_candidates(&mut self) -> Flow {
        for candidate in self.session.take_pending_local_candidates() {
            let message = SignalingMessage::candidate(&self.ctx.local, self.session.remote(), candidate);
            self.send(message).await?;
        }
        Ok(())
    }

    async fn send(&mut self, message: SignalingMessage) -> Flow {
        let kind = message.kind();
        if guard(&mut self.cancel, self.ctx.outbound.send(message)).await?.is_err() {
            debug!(
                "Relay link closed, {} for {} not sent",
                kind,
                self.session.remote().short()
            );
        }
        Ok(())
    }

    async fn set_state(&mut self, to: CallState) {
        let from = self.session.set_state(to);
        if from == to {
            return;
        }
        let remote = self.session.remote().clone();
        debug!("{}: {} -> {}", remote.short(), from, to);

        self.publish();
        self.ctx.emit(CallEvent::StateChanged {
            remote: remote.clone(),
            from,
            to,
        });
        self.ctx.handler.on_call_state_changed(&remote, from, to).await;
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.session.snapshot());
    }

    async fn teardown(&mut self, reason: EndReason) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        let remote = self.session.remote().clone();

        if reason.notifies_remote() && self.session.has_local_description() {
            let hangup = SignalingMessage::hangup(&self.ctx.local, &remote);
            if self.ctx.outbound.try_send(hangup).is_err() {
                debug!("Could not send hangup to {}", remote.short());
            }
        }

        if self.media_requested {
            self.ctx.media.stop_all().await;
        }
        self.transport_events = None;
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }

        if let Some(message) = reason.failure_message() {
            warn!("Call with {} failed: {}", remote, message);
            self.ctx.handler.on_negotiation_failed(&remote, &message).await;
            self.ctx.emit(CallEvent::NegotiationFailed {
                remote: remote.clone(),
                reason: message,
            });
        }

        self.set_state(CallState::Ended).await;
        info!("Call with {} ended: {}", remote, reason);
        self.ctx.emit(CallEvent::Ended { remote, reason });
    }
}
