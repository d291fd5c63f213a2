//! Participant agent: builder, public handle and dispatcher
//!
//! ```text
//!   AgentHandle ──commands──▶ ┌────────────┐ ──SessionInput──▶ SessionTask (bob)
//!                             │ Dispatcher │ ──SessionInput──▶ SessionTask (carol)
//!   relay link ──RelayEvent─▶ └────────────┘
//! ```
//!
//! The dispatcher owns the map from remote identity to session. It decides
//! which session an inbound message belongs to, applies the
//! [`AdmissionPolicy`] to new calls and offers, and ends sessions through
//! their cancel signal. It never awaits a session, so one slow call cannot
//! hold up routing for another.
//!
//! Session tasks report back when they exit and their slot is dropped, so the
//! map only ever holds live sessions. Sessions that hold nothing but a remote
//! key are capped and expire.
//!
//! # Example
//!
//! ```no_run
//! use duet_agent_core::{AgentBuilder, AgentConfig, CallState};
//! use duet_agent_core::sim::{AutoAnswer, SimulatedMedia, SimulatedTransportFactory};
//! use duet_signal_core::Identity;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> duet_agent_core::Result<()> {
//! let agent = AgentBuilder::new()
//!     .with_config(AgentConfig::new("ws://localhost:8080"))
//!     .with_media_source(Arc::new(SimulatedMedia::new()))
//!     .with_transport_factory(Arc::new(SimulatedTransportFactory::new()))
//!     .with_call_handler(Arc::new(AutoAnswer::accept()))
//!     .connect()
//!     .await?;
//!
//! let bob = Identity::new("bob")?;
//! agent.call(&bob).await?;
//! agent.wait_for_state(&bob, CallState::Connected, Duration::from_secs(10)).await?;
//! agent.hangup(&bob).await?;
//! # Ok(())
//! # }
//! ```

use duet_signal_core::{Identity, MessageKind, Payload, PublicKey, SessionDescription, SignalingMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collaborators::{CallHandler, KeyGenerator, MediaSource, TransportFactory};
use crate::config::{AdmissionPolicy, AgentConfig};
use crate::error::{AgentError, Result};
use crate::session::NegotiationSession;
use crate::session_task::{SessionContext, SessionInput, SessionTask};
use crate::signaling::{RelayClient, RelayEvent, RelayLink};
use crate::sim::RandomKeyGenerator;
use crate::types::{CallEvent, CallState, EndReason, SessionSnapshot};

const EVENT_CAPACITY: usize = 256;

/// Builds and starts an agent
pub struct AgentBuilder {
    config: AgentConfig,
    media: Option<Arc<dyn MediaSource>>,
    transports: Option<Arc<dyn TransportFactory>>,
    handler: Option<Arc<dyn CallHandler>>,
    keys: Option<Arc<dyn KeyGenerator>>,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            config: AgentConfig::default(),
            media: None,
            transports: None,
            handler: None,
            keys: None,
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.config.identity = Some(identity);
        self
    }

    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.config.relay_url = url.into();
        self
    }

    pub fn with_admission_policy(mut self, policy: AdmissionPolicy) -> Self {
        self.config.admission = policy;
        self
    }

    /// Bound on the call handler's accept/reject decision
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_accept_timeout(timeout);
        self
    }

    /// How long a session holding only a remote key waits for a call or offer
    pub fn with_pending_session_ttl(mut self, ttl: Duration) -> Self {
        self.config = self.config.with_pending_session_ttl(ttl);
        self
    }

    pub fn with_max_pending_sessions(mut self, max: usize) -> Self {
        self.config = self.config.with_max_pending_sessions(max);
        self
    }

    pub fn with_media_source(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_transport_factory(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = Some(transports);
        self
    }

    pub fn with_call_handler(mut self, handler: Arc<dyn CallHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Defaults to [`RandomKeyGenerator`]
    pub fn with_key_generator(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Connect to the configured relay and start the agent
    pub async fn connect(self) -> Result<AgentHandle> {
        self.config.validate()?;
        let link = RelayClient::connect(&self.config.relay_url, self.config.channel_capacity).await?;
        self.start(link)
    }

    /// Start the agent on an already established relay link
    pub fn start(self, link: RelayLink) -> Result<AgentHandle> {
        self.config.validate()?;
        let media = self
            .media
            .ok_or_else(|| AgentError::config("a media source is required"))?;
        let transports = self
            .transports
            .ok_or_else(|| AgentError::config("a transport factory is required"))?;
        let handler = self
            .handler
            .ok_or_else(|| AgentError::config("a call handler is required"))?;
        let keys = self.keys.unwrap_or_else(|| Arc::new(RandomKeyGenerator));
        let identity = self.config.identity.clone().unwrap_or_else(Identity::generate);
        let capacity = self.config.channel_capacity.max(1);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands, command_rx) = mpsc::channel(capacity);

        if link.outbound.try_send(SignalingMessage::register(&identity)).is_err() {
            return Err(AgentError::RelayUnavailable);
        }

        let ctx = Arc::new(SessionContext {
            local: identity.clone(),
            outbound: link.outbound,
            events: events.clone(),
            media,
            transports,
            handler,
            keys,
            accept_timeout: self.config.accept_timeout(),
            pending_ttl: self.config.pending_session_ttl(),
        });

        let (finished, finished_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            ctx,
            admission: self.config.admission,
            capacity,
            max_pending: self.config.max_pending_sessions,
            sessions: HashMap::new(),
            next_generation: 0,
            finished,
            finished_rx,
            commands: command_rx,
            inbound: link.inbound,
            relay_up: true,
        };
        tokio::spawn(dispatcher.run());
        info!("Agent {} started", identity);

        Ok(AgentHandle {
            identity,
            commands,
            events,
        })
    }
}

enum Command {
    Call {
        remote: Identity,
        reply: oneshot::Sender<Result<()>>,
    },
    Hangup {
        remote: Identity,
        reply: oneshot::Sender<Result<()>>,
    },
    HangupAll {
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        remote: Identity,
        reply: oneshot::Sender<Option<SessionSnapshot>>,
    },
    Snapshots {
        reply: oneshot::Sender<Vec<SessionSnapshot>>,
    },
    RelayUp {
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running agent
///
/// Dropping every handle shuts the agent down.
#[derive(Clone)]
pub struct AgentHandle {
    identity: Identity,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CallEvent>,
}

impl AgentHandle {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)
    }

    /// Start a call to `remote`
    ///
    /// Returns once the call is admitted; progress is reported through
    /// [`subscribe`](Self::subscribe) and [`state`](Self::state).
    pub async fn call(&self, remote: &Identity) -> Result<()> {
        let remote = remote.clone();
        self.request(|reply| Command::Call { remote, reply }).await?
    }

    /// End the call with `remote`
    ///
    /// Ending a call that already ended, or that never existed, is a no-op.
    pub async fn hangup(&self, remote: &Identity) -> Result<()> {
        let remote = remote.clone();
        self.request(|reply| Command::Hangup { remote, reply }).await?
    }

    /// End every live call, returning how many were ended
    pub async fn hangup_all(&self) -> Result<usize> {
        self.request(|reply| Command::HangupAll { reply }).await
    }

    pub async fn state(&self, remote: &Identity) -> Option<CallState> {
        self.snapshot(remote).await.map(|s| s.state)
    }

    pub async fn snapshot(&self, remote: &Identity) -> Option<SessionSnapshot> {
        let remote = remote.clone();
        self.request(|reply| Command::Snapshot { remote, reply })
            .await
            .ok()
            .flatten()
    }

    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.request(|reply| Command::Snapshots { reply })
            .await
            .unwrap_or_default()
    }

    /// The key `remote` sent us, if any
    pub async fn remote_public_key(&self, remote: &Identity) -> Option<PublicKey> {
        self.snapshot(remote).await.and_then(|s| s.remote_public_key)
    }

    /// Whether the relay connection is still up
    pub async fn is_relay_connected(&self) -> bool {
        self.request(|reply| Command::RelayUp { reply })
            .await
            .unwrap_or(false)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Wait until the session with `remote` reaches `target`
    ///
    /// Ended sessions are dropped, so when waiting for [`CallState::Ended`]
    /// having no session with `remote` counts as reaching it.
    pub async fn wait_for_state(&self, remote: &Identity, target: CallState, timeout: Duration) -> Result<()> {
        let mut events = self.subscribe();
        let wait = async {
            loop {
                match self.state(remote).await {
                    Some(state) if state == target => return Ok(()),
                    None if target == CallState::Ended => return Ok(()),
                    _ => {}
                }
                match events.recv().await {
                    Ok(CallEvent::StateChanged { remote: r, to, .. }) if &r == remote && to == target => {
                        return Ok(())
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(AgentError::Stopped),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| AgentError::timeout(format!("{} did not reach {}", remote, target)))?
    }

    /// End every call and stop the agent
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

struct SessionSlot {
    generation: u64,
    inputs: mpsc::Sender<SessionInput>,
    cancel: watch::Sender<Option<EndReason>>,
    snapshot: watch::Receiver<SessionSnapshot>,
    /// A call or offer was handed to the session
    engaged: bool,
    task: JoinHandle<()>,
}

impl SessionSlot {
    fn state(&self) -> CallState {
        self.snapshot.borrow().state
    }

    fn is_live(&self) -> bool {
        !self.task.is_finished() && !self.state().is_terminal()
    }

    /// Holds at most a remote key; no call or offer was handed to it
    fn is_pending(&self) -> bool {
        self.is_live() && !self.engaged && matches!(self.state(), CallState::Idle | CallState::KeyExchanged)
    }

    fn is_active(&self) -> bool {
        self.is_live() && (self.engaged || self.state().is_active())
    }

    fn end(&self, reason: EndReason) {
        self.cancel.send_replace(Some(reason));
    }

    fn deliver(&self, remote: &Identity, input: SessionInput) -> bool {
        match self.inputs.try_send(input) {
            Ok(()) => true,
            Err(TrySendError::Full(input)) => {
                warn!("Session with {} is backed up, dropping {:?}", remote.short(), input);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

struct Dispatcher {
    ctx: Arc<SessionContext>,
    admission: AdmissionPolicy,
    capacity: usize,
    max_pending: usize,
    sessions: HashMap<Identity, SessionSlot>,
    next_generation: u64,
    /// Session tasks report here when they exit
    finished: mpsc::UnboundedSender<(Identity, u64)>,
    finished_rx: mpsc::UnboundedReceiver<(Identity, u64)>,
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::Receiver<RelayEvent>,
    relay_up: bool,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                event = self.inbound.recv(), if self.relay_up => match event {
                    Some(RelayEvent::Message(message)) => self.handle_message(message),
                    Some(RelayEvent::Disconnected) | None => self.on_relay_lost(),
                },
                Some((remote, generation)) = self.finished_rx.recv() => self.remove_session(&remote, generation),
            }
        }
        info!("Agent {} stopped", self.ctx.local);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Call { remote, reply } => {
                let _ = reply.send(self.place_call(remote));
            }
            Command::Hangup { remote, reply } => {
                match self.sessions.get(&remote) {
                    Some(slot) if slot.is_live() => slot.end(EndReason::LocalHangup),
                    _ => debug!("No live call with {}, nothing to hang up", remote.short()),
                }
                let _ = reply.send(Ok(()));
            }
            Command::HangupAll { reply } => {
                let _ = reply.send(self.end_where(|_| true, EndReason::LocalHangup));
            }
            Command::Snapshot { remote, reply } => {
                let snapshot = self.sessions.get(&remote).map(|slot| slot.snapshot.borrow().clone());
                let _ = reply.send(snapshot);
            }
            Command::Snapshots { reply } => {
                let snapshots = self
                    .sessions
                    .values()
                    .map(|slot| slot.snapshot.borrow().clone())
                    .collect();
                let _ = reply.send(snapshots);
            }
            Command::RelayUp { reply } => {
                let _ = reply.send(self.relay_up);
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn place_call(&mut self, remote: Identity) -> Result<()> {
        if !self.relay_up {
            return Err(AgentError::RelayUnavailable);
        }
        if remote == self.ctx.local {
            return Err(AgentError::invalid_remote("cannot call ourselves"));
        }
        if self.sessions.get(&remote).map_or(false, |slot| slot.is_active()) {
            return Err(AgentError::AlreadyInCall {
                remote: remote.to_string(),
            });
        }
        let active = self.active_calls_excluding(&remote);
        if !self.admission.admits(active) {
            return Err(AgentError::Busy { active });
        }

        self.ensure_session(&remote);
        if let Some(slot) = self.sessions.get_mut(&remote) {
            slot.engaged = true;
            slot.deliver(&remote, SessionInput::Call);
        }
        Ok(())
    }

    fn handle_message(&mut self, message: SignalingMessage) {
        if let Some(recipient) = message.recipient() {
            if recipient != &self.ctx.local {
                debug!("Dropping {} addressed to {}", message.kind(), recipient.short());
                return;
            }
        }

        let kind = message.kind();
        if kind == MessageKind::Register {
            return;
        }

        let remote = match message.sender_id {
            Some(sender) if sender == self.ctx.local => return,
            Some(sender) => sender,
            None => match self.infer_sender(kind) {
                Some(remote) => remote,
                None => {
                    debug!("Dropping {} without sender: no unique session matches", kind);
                    return;
                }
            },
        };

        let input = match message.payload {
            Payload::Register => return,
            Payload::Offer { offer } => {
                self.admit_offer(remote, offer);
                return;
            }
            Payload::Key { key } => {
                if !self.sessions.get(&remote).map_or(false, |slot| slot.is_live()) {
                    let pending = self.sessions.values().filter(|slot| slot.is_pending()).count();
                    if pending >= self.max_pending {
                        debug!("{} key-only sessions open, dropping key from {}", pending, remote.short());
                        return;
                    }
                    self.ensure_session(&remote);
                }
                SessionInput::Key(key)
            }
            Payload::Answer { answer } => SessionInput::Answer(answer),
            Payload::Candidate { candidate } => SessionInput::Candidate(candidate),
            // Endings go through the cancel signal so they overtake queued
            // input and any pending prompt
            Payload::Reject { reason } => {
                match self.sessions.get(&remote) {
                    Some(slot) if slot.is_live() && slot.state() == CallState::OfferSent => {
                        slot.end(EndReason::Rejected { reason });
                    }
                    _ => debug!("Ignoring reject from {}", remote.short()),
                }
                return;
            }
            Payload::Hangup => {
                match self.sessions.get(&remote) {
                    Some(slot) if slot.is_live() => slot.end(EndReason::RemoteHangup),
                    _ => debug!("No session with {}, dropping hangup", remote.short()),
                }
                return;
            }
        };

        match self.sessions.get(&remote) {
            Some(slot) if slot.is_live() => {
                slot.deliver(&remote, input);
            }
            _ => debug!("No session with {}, dropping {}", remote.short(), kind),
        }
    }

    /// The only session a sender-less message can belong to
    fn infer_sender(&self, kind: MessageKind) -> Option<Identity> {
        let mut matches = self.sessions.iter().filter(|(_, slot)| match kind {
            MessageKind::Answer => slot.is_live() && slot.state() == CallState::OfferSent,
            MessageKind::Offer | MessageKind::Register => false,
            _ => slot.is_live(),
        });
        match (matches.next(), matches.next()) {
            (Some((remote, _)), None) => Some(remote.clone()),
            _ => None,
        }
    }

    fn admit_offer(&mut self, remote: Identity, offer: SessionDescription) {
        let in_call = self.sessions.get(&remote).map_or(false, |slot| slot.is_active());

        if !in_call {
            let active = self.active_calls_excluding(&remote);
            if !self.admission.admits(active) {
                info!("Busy, rejecting offer from {}", remote);
                let reject = SignalingMessage::reject(&self.ctx.local, &remote, Some("busy".to_string()));
                if self.ctx.outbound.try_send(reject).is_err() {
                    debug!("Could not send busy reject to {}", remote.short());
                }
                if let Some(slot) = self.sessions.get(&remote) {
                    if slot.is_live() {
                        slot.end(EndReason::Declined);
                    }
                }
                return;
            }
            self.ensure_session(&remote);
        }

        if let Some(slot) = self.sessions.get_mut(&remote) {
            slot.engaged = true;
            slot.deliver(&remote, SessionInput::Offer(offer));
        }
    }

    fn active_calls_excluding(&self, remote: &Identity) -> usize {
        self.sessions
            .iter()
            .filter(|(id, slot)| *id != remote && slot.is_active())
            .count()
    }

    /// Make sure a live session exists for `remote`
    fn ensure_session(&mut self, remote: &Identity) {
        if self.sessions.get(remote).map_or(false, |slot| slot.is_live()) {
            return;
        }

        let session = NegotiationSession::new(remote.clone());
        let (inputs, input_rx) = mpsc::channel(self.capacity);
        let (cancel, cancel_rx) = watch::channel(None);
        let (snapshot_tx, snapshot) = watch::channel(session.snapshot());
        let task = SessionTask::new(self.ctx.clone(), session, input_rx, cancel_rx, snapshot_tx);

        let generation = self.next_generation;
        self.next_generation += 1;
        let finished = self.finished.clone();
        let key = remote.clone();
        let task = tokio::spawn(async move {
            task.run().await;
            let _ = finished.send((key, generation));
        });

        debug!("New session with {}", remote.short());
        self.sessions.insert(
            remote.clone(),
            SessionSlot {
                generation,
                inputs,
                cancel,
                snapshot,
                engaged: false,
                task,
            },
        );
    }

    /// Drop a finished session unless a newer one has replaced it
    fn remove_session(&mut self, remote: &Identity, generation: u64) {
        if self.sessions.get(remote).map_or(false, |slot| slot.generation == generation) {
            self.sessions.remove(remote);
            debug!("Removed session with {} ({} left)", remote.short(), self.sessions.len());
        }
    }

    fn end_where(&self, filter: impl Fn(&SessionSlot) -> bool, reason: EndReason) -> usize {
        let mut ended = 0;
        for slot in self.sessions.values() {
            if slot.is_live() && filter(slot) {
                slot.end(reason.clone());
                ended += 1;
            }
        }
        ended
    }

    fn on_relay_lost(&mut self) {
        if !self.relay_up {
            return;
        }
        self.relay_up = false;
        warn!("Lost relay connection");
        self.ctx.emit(CallEvent::RelayDisconnected);

        // Connected calls keep their media path; everything still negotiating ends
        let ended = self.end_where(|slot| slot.state().is_negotiating(), EndReason::RelayLost);
        if ended > 0 {
            info!("Ended {} negotiating session(s) after relay loss", ended);
        }
    }

    async fn shutdown(&mut self) {
        self.end_where(|_| true, EndReason::Shutdown);
        for (remote, slot) in self.sessions.drain() {
            if let Err(e) = slot.task.await {
                warn!("Session task for {} failed: {}", remote.short(), e);
            }
        }
    }
}
