//! In-process collaborators for demos and tests
//!
//! - [`SimulatedTransportFactory`] / [`SimulatedTransport`]: synthetic SDP,
//!   one host candidate per description, and connectivity once the
//!   offer/answer exchange completes
//! - [`SimulatedMedia`]: one audio and one video track
//! - [`AutoAnswer`]: a call handler with a fixed decision
//! - [`RandomKeyGenerator`]: random opaque key bytes
//!
//! Every simulated collaborator counts what was done to it, so tests can
//! check that resources are released exactly once.

use async_trait::async_trait;
use duet_signal_core::{Candidate, Identity, PublicKey, SessionDescription};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::collaborators::{
    CallHandler, Connectivity, KeyGenerator, KeyPair, MediaSource, MediaTrack, PeerTransport, TrackKind,
    TransportEvent, TransportFactory,
};
use crate::error::{AgentError, Result};
use crate::types::{CallAction, IncomingCall, Role};

/// Counters shared by a factory and every transport it created
#[derive(Debug, Default)]
pub struct TransportStats {
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    pub descriptions: AtomicUsize,
    pub remote_descriptions: AtomicUsize,
    pub remote_candidates: AtomicUsize,
}

impl TransportStats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote_candidates(&self) -> usize {
        self.remote_candidates.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedTransportFactory {
    stats: Arc<TransportStats>,
    auto_connect: bool,
    fail_with: Option<String>,
}

impl Default for SimulatedTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransportFactory {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(TransportStats::default()),
            auto_connect: true,
            fail_with: None,
        }
    }

    /// Never report connectivity on its own
    pub fn without_auto_connect(mut self) -> Self {
        self.auto_connect = false;
        self
    }

    /// Every `create_description` fails with `reason`
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.fail_with = Some(reason.into());
        self
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl TransportFactory for SimulatedTransportFactory {
    async fn create(&self, remote: &Identity) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<TransportEvent>)> {
        let (events, rx) = mpsc::channel(64);
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        let transport = SimulatedTransport {
            remote: remote.clone(),
            events,
            stats: self.stats.clone(),
            auto_connect: self.auto_connect,
            fail_with: self.fail_with.clone(),
            state: Mutex::new(SimState::default()),
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(transport), rx))
    }
}

#[derive(Debug, Default)]
struct SimState {
    local_offer: bool,
    remote_offer: bool,
    tracks: usize,
    next_port: u16,
}

/// Transport that negotiates with itself
///
/// The offerer reports `Connected` once it applies an answer, the answerer
/// once it creates one.
#[derive(Debug)]
pub struct SimulatedTransport {
    remote: Identity,
    events: mpsc::Sender<TransportEvent>,
    stats: Arc<TransportStats>,
    auto_connect: bool,
    fail_with: Option<String>,
    state: Mutex<SimState>,
    closed: AtomicBool,
}

impl SimulatedTransport {
    /// Push an event as if the underlying transport produced it
    pub fn inject(&self, event: TransportEvent) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.events.try_send(event);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| AgentError::transport("simulated transport state poisoned"))
    }

    fn connected(&self) {
        if self.auto_connect {
            self.inject(TransportEvent::ConnectivityChanged(Connectivity::Connected));
            self.inject(TransportEvent::RemoteTracks(vec![
                MediaTrack::new(format!("{}-audio", self.remote.short()), TrackKind::Audio),
                MediaTrack::new(format!("{}-video", self.remote.short()), TrackKind::Video),
            ]));
        }
    }
}

fn synthetic_sdp(kind: &str, tracks: usize) -> String {
    let session_id: u64 = rand::thread_rng().gen_range(1..u32::MAX as u64);
    let mut sdp = format!(
        "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=duet-{}\r\nt=0 0\r\n",
        session_id, kind
    );
    for mid in 0..tracks.max(1) {
        sdp.push_str(&format!("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:{}\r\n", mid));
    }
    sdp
}

#[async_trait]
impl PeerTransport for SimulatedTransport {
    async fn create_description(&self, role: Role) -> Result<SessionDescription> {
        if let Some(reason) = &self.fail_with {
            return Err(AgentError::transport(reason.clone()));
        }

        let (kind, tracks, port, answered) = {
            let mut state = self.lock()?;
            let answered = match role {
                Role::Initiator => {
                    state.local_offer = true;
                    state.remote_offer = false;
                    false
                }
                Role::Responder => {
                    if !state.remote_offer {
                        return Err(AgentError::transport("cannot answer without a remote offer"));
                    }
                    state.remote_offer = false;
                    true
                }
            };
            state.next_port += 1;
            let kind = if answered { "answer" } else { "offer" };
            (kind, state.tracks, 50000 + state.next_port, answered)
        };

        self.stats.descriptions.fetch_add(1, Ordering::SeqCst);
        let description = SessionDescription::from_sdp(kind, synthetic_sdp(kind, tracks));

        self.inject(TransportEvent::LocalCandidate(Candidate::from_parts(
            format!("candidate:1 1 UDP 2130706431 127.0.0.1 {} typ host", port),
            Some("0"),
            Some(0),
        )));
        if answered {
            self.connected();
        }
        Ok(description)
    }

    async fn apply_remote_description(&self, description: &SessionDescription) -> Result<()> {
        self.stats.remote_descriptions.fetch_add(1, Ordering::SeqCst);
        let answered = {
            let mut state = self.lock()?;
            match description.kind() {
                Some("answer") => {
                    if !state.local_offer {
                        return Err(AgentError::transport("answer without a local offer"));
                    }
                    state.local_offer = false;
                    true
                }
                _ => {
                    state.local_offer = false;
                    state.remote_offer = true;
                    false
                }
            }
        };
        if answered {
            self.connected();
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &Candidate) -> Result<()> {
        debug!("Simulated transport to {} got {:?}", self.remote.short(), candidate.line());
        self.stats.remote_candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn attach_tracks(&self, tracks: &[MediaTrack]) -> Result<()> {
        self.lock()?.tracks = tracks.len();
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Media source with one audio and one video track
#[derive(Debug, Default)]
pub struct SimulatedMedia {
    acquired: AtomicUsize,
    stopped: AtomicUsize,
    fail: AtomicBool,
}

impl SimulatedMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `acquire` fail, like a denied camera permission
    pub fn deny_access(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for SimulatedMedia {
    async fn acquire(&self) -> Result<Vec<MediaTrack>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AgentError::media("access denied"));
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(vec![
            MediaTrack::new(format!("local-audio-{}", n), TrackKind::Audio),
            MediaTrack::new(format!("local-video-{}", n), TrackKind::Video),
        ])
    }

    async fn stop_all(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Call handler that always makes the same decision
#[derive(Debug)]
pub struct AutoAnswer {
    action: CallAction,
    delay: Option<Duration>,
    prompts: AtomicUsize,
    failures: Mutex<Vec<String>>,
}

impl AutoAnswer {
    pub fn new(action: CallAction) -> Self {
        Self {
            action,
            delay: None,
            prompts: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn accept() -> Self {
        Self::new(CallAction::Accept)
    }

    pub fn reject() -> Self {
        Self::new(CallAction::Reject)
    }

    pub fn ignore() -> Self {
        Self::new(CallAction::Ignore)
    }

    /// Think for `delay` before deciding
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many incoming calls were offered to this handler
    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    /// Reasons passed to `on_negotiation_failed`
    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CallHandler for AutoAnswer {
    async fn on_incoming_call(&self, call: IncomingCall) -> CallAction {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        debug!("Incoming call from {}, answering {:?}", call.remote.short(), self.action);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.action
    }

    async fn on_negotiation_failed(&self, _remote: &Identity, reason: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(reason.to_string());
        }
    }
}

/// Random opaque key material
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomKeyGenerator;

impl KeyGenerator for RandomKeyGenerator {
    fn generate(&self) -> KeyPair {
        let mut rng = rand::thread_rng();
        let mut public = vec![0u8; 32];
        let mut secret = vec![0u8; 32];
        rng.fill(&mut public[..]);
        rng.fill(&mut secret[..]);
        KeyPair::new(PublicKey::new(public), secret)
    }
}
