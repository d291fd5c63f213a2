//! Per-peer negotiation state

use chrono::{DateTime, Utc};
use duet_signal_core::{Candidate, Identity, PublicKey, SessionDescription};

use crate::collaborators::KeyPair;
use crate::error::{AgentError, Result};
use crate::types::{CallState, Role, SessionSnapshot};

/// Everything one side knows about a call with one remote peer
///
/// Descriptions are write-once. Remote candidates that arrive before the
/// remote description are buffered and handed back when it is set; local
/// candidates discovered before the local description is sent are queued
/// the same way.
#[derive(Debug)]
pub struct NegotiationSession {
    remote: Identity,
    role: Option<Role>,
    state: CallState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    local_keys: Option<KeyPair>,
    remote_key: Option<PublicKey>,
    remote_candidates: Vec<Candidate>,
    pending_remote_candidates: Vec<Candidate>,
    pending_local_candidates: Vec<Candidate>,
    created_at: DateTime<Utc>,
}

impl NegotiationSession {
    pub fn new(remote: Identity) -> Self {
        Self {
            remote,
            role: None,
            state: CallState::Idle,
            local_description: None,
            remote_description: None,
            local_keys: None,
            remote_key: None,
            remote_candidates: Vec::new(),
            pending_remote_candidates: Vec::new(),
            pending_local_candidates: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Start over in `role`, keeping the peer and both keys
    ///
    /// Used for renegotiation and for yielding on glare. The state is left
    /// unchanged; the caller transitions explicitly.
    pub fn restart(&mut self, role: Role) {
        self.role = Some(role);
        self.local_description = None;
        self.remote_description = None;
        self.remote_candidates.clear();
        self.pending_remote_candidates.clear();
        self.pending_local_candidates.clear();
    }

    pub fn remote(&self) -> &Identity {
        &self.remote
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn assume_role(&mut self, role: Role) {
        self.role = Some(role);
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Set the state, returning the previous one
    pub fn set_state(&mut self, state: CallState) -> CallState {
        std::mem::replace(&mut self.state, state)
    }

    pub fn has_local_description(&self) -> bool {
        self.local_description.is_some()
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description.is_some()
    }

    pub fn set_local_description(&mut self, description: SessionDescription) -> Result<()> {
        if self.local_description.is_some() {
            return Err(AgentError::negotiation("local description already set"));
        }
        self.local_description = Some(description);
        Ok(())
    }

    /// Set the remote description and drain the candidates buffered for it
    pub fn set_remote_description(&mut self, description: SessionDescription) -> Result<Vec<Candidate>> {
        if self.remote_description.is_some() {
            return Err(AgentError::negotiation("remote description already set"));
        }
        self.remote_description = Some(description);
        Ok(std::mem::take(&mut self.pending_remote_candidates))
    }

    /// Record a remote candidate
    ///
    /// Returns `true` if it can go to the transport now, `false` if it was
    /// buffered until the remote description is set.
    pub fn add_remote_candidate(&mut self, candidate: Candidate) -> bool {
        self.remote_candidates.push(candidate.clone());
        if self.remote_description.is_some() {
            true
        } else {
            self.pending_remote_candidates.push(candidate);
            false
        }
    }

    /// Queue a local candidate, or hand it back if it can be sent right away
    pub fn queue_local_candidate(&mut self, candidate: Candidate) -> Option<Candidate> {
        if self.local_description.is_some() {
            Some(candidate)
        } else {
            self.pending_local_candidates.push(candidate);
            None
        }
    }

    pub fn take_pending_local_candidates(&mut self) -> Vec<Candidate> {
        std::mem::take(&mut self.pending_local_candidates)
    }

    /// Public half of the local key pair, generating the pair on first use
    pub fn ensure_local_keys(&mut self, generate: impl FnOnce() -> KeyPair) -> PublicKey {
        self.local_keys.get_or_insert_with(generate).public.clone()
    }

    pub fn remote_key(&self) -> Option<&PublicKey> {
        self.remote_key.as_ref()
    }

    /// Bind the remote public key; a later key replaces an earlier one
    pub fn set_remote_key(&mut self, key: PublicKey) {
        self.remote_key = Some(key);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            remote: self.remote.clone(),
            role: self.role,
            state: self.state,
            has_local_description: self.local_description.is_some(),
            has_remote_description: self.remote_description.is_some(),
            local_public_key: self.local_keys.as_ref().map(|k| k.public.clone()),
            remote_public_key: self.remote_key.clone(),
            remote_candidates: self.remote_candidates.len(),
            buffered_remote_candidates: self.pending_remote_candidates.len(),
            queued_local_candidates: self.pending_local_candidates.len(),
            created_at: self.created_at,
        }
    }
}
