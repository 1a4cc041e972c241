//! Attestation builder state machine.
//!
//! Assembles one [`AttestationMessage`] per cycle from the gateway and the
//! certification service outputs.
//!
//! # State Transitions
//!
//! ```text
//! Idle
//!     ↓ (on_nonce_received)
//! AwaitingAppKey
//!     ↓ (on_app_key)
//! AwaitingCertification
//!     ↓ (on_certified)
//! Assembled
//!     ↓ (on_sent)
//! Sent
//!     ↓ (on_accepted | on_rejected)
//! Accepted | Rejected
//! ```
//!
//! Hardware and certification errors `abort` back to `Idle`. A finished
//! cycle is `reset` to `Idle` and the next one needs a brand-new nonce: the
//! builder refuses any nonce it has already used.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use sovereign_core::{
    current_timestamp, AgentCredential, AttestationMessage, ChallengeNonce, CertifyResponse,
    Error, Result, SessionId,
};

/// Maximum number of state transitions to track in history.
const MAX_HISTORY_SIZE: usize = 64;

/// Maximum number of spent nonces remembered for reuse refusal.
const MAX_USED_NONCES: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuilderState {
    Idle,

    /// Nonce received, waiting for the gateway's application key
    AwaitingAppKey { nonce: ChallengeNonce },

    /// Waiting for the AK certification of the application key
    AwaitingCertification {
        nonce: ChallengeNonce,
        app_key_public: String,
    },

    Assembled { message: AttestationMessage },

    Sent { session: SessionId, sent_at: u64 },

    Accepted {
        session: SessionId,
        /// Serial of the issued agent credential
        serial: String,
    },

    Rejected {
        session: SessionId,
        code: String,
        retryable: bool,
    },
}

impl BuilderState {
    fn name(&self) -> &'static str {
        match self {
            BuilderState::Idle => "Idle",
            BuilderState::AwaitingAppKey { .. } => "AwaitingAppKey",
            BuilderState::AwaitingCertification { .. } => "AwaitingCertification",
            BuilderState::Assembled { .. } => "Assembled",
            BuilderState::Sent { .. } => "Sent",
            BuilderState::Accepted { .. } => "Accepted",
            BuilderState::Rejected { .. } => "Rejected",
        }
    }
}

/// Record of a state transition for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: String,
    pub to_state: String,
    pub timestamp: u64,
    pub reason: Option<String>,
    pub transition_hash: Vec<u8>,
}

pub struct AttestationBuilder {
    agent_id: String,
    current_state: BuilderState,
    history: VecDeque<StateTransition>,
    used_nonces: HashSet<String>,
    used_order: VecDeque<String>,
}

impl AttestationBuilder {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            current_state: BuilderState::Idle,
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
            used_nonces: HashSet::new(),
            used_order: VecDeque::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn current_state(&self) -> &BuilderState {
        &self.current_state
    }

    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.current_state, BuilderState::Idle)
    }

    /// Transition: Idle → AwaitingAppKey
    pub fn on_nonce_received(&mut self, nonce: ChallengeNonce) -> Result<()> {
        if !self.is_idle() {
            return Err(self.invalid("a nonce can only start a cycle from Idle"));
        }
        if self.used_nonces.contains(&nonce.value) {
            return Err(Error::InvalidState("challenge nonce was already used".to_string()));
        }
        if nonce.is_expired() {
            return Err(Error::InvalidState("challenge nonce already expired".to_string()));
        }
        self.mark_used(&nonce.value);
        self.transition(BuilderState::AwaitingAppKey { nonce }, None);
        Ok(())
    }

    /// Transition: AwaitingAppKey → AwaitingCertification
    pub fn on_app_key(&mut self, app_key_public: String) -> Result<()> {
        let BuilderState::AwaitingAppKey { nonce } = &self.current_state else {
            return Err(self.invalid("application key arrives only in AwaitingAppKey"));
        };
        let next = BuilderState::AwaitingCertification {
            nonce: nonce.clone(),
            app_key_public,
        };
        self.transition(next, None);
        Ok(())
    }

    /// Transition: AwaitingCertification → Assembled
    ///
    /// The quote is left empty; the verifier fetches its own.
    pub fn on_certified(&mut self, response: CertifyResponse) -> Result<AttestationMessage> {
        let BuilderState::AwaitingCertification {
            nonce,
            app_key_public,
        } = &self.current_state
        else {
            return Err(self.invalid("certification arrives only in AwaitingCertification"));
        };
        if response.agent_id != self.agent_id {
            return Err(Error::InvalidState(format!(
                "certification service speaks for {}, not {}",
                response.agent_id, self.agent_id
            )));
        }
        if nonce.is_expired() {
            return Err(Error::InvalidState(
                "challenge nonce expired during certification".to_string(),
            ));
        }
        let message = AttestationMessage {
            app_key_public: app_key_public.clone(),
            app_key_certificate: response.certificate,
            challenge_nonce: nonce.value.clone(),
            agent_id: self.agent_id.clone(),
            quote: Vec::new(),
        };
        self.transition(
            BuilderState::Assembled {
                message: message.clone(),
            },
            None,
        );
        Ok(message)
    }

    /// Transition: Assembled → Sent
    pub fn on_sent(&mut self) -> Result<()> {
        let BuilderState::Assembled { message } = &self.current_state else {
            return Err(self.invalid("only an assembled message can be sent"));
        };
        let next = BuilderState::Sent {
            session: message.session(),
            sent_at: current_timestamp(),
        };
        self.transition(next, None);
        Ok(())
    }

    /// Transition: Sent → Accepted
    pub fn on_accepted(&mut self, credential: &AgentCredential) -> Result<()> {
        let BuilderState::Sent { session, .. } = &self.current_state else {
            return Err(self.invalid("a credential is accepted only after sending"));
        };
        let next = BuilderState::Accepted {
            session: session.clone(),
            serial: credential.credential().serial.clone(),
        };
        self.transition(next, Some("agent credential issued".to_string()));
        Ok(())
    }

    /// Transition: Sent → Rejected
    pub fn on_rejected(&mut self, error: &Error) -> Result<()> {
        let BuilderState::Sent { session, .. } = &self.current_state else {
            return Err(self.invalid("a rejection arrives only after sending"));
        };
        let next = BuilderState::Rejected {
            session: session.clone(),
            code: error.code().to_string(),
            retryable: error.is_transient(),
        };
        self.transition(next, Some(error.to_string()));
        Ok(())
    }

    /// Abandon the current cycle. Its nonce stays spent.
    pub fn abort(&mut self, reason: &str) {
        if !self.is_idle() {
            self.transition(BuilderState::Idle, Some(format!("aborted: {}", reason)));
        }
    }

    /// Return to Idle after a finished or abandoned cycle.
    pub fn reset(&mut self) {
        if !self.is_idle() {
            self.transition(BuilderState::Idle, Some("reset".to_string()));
        }
    }

    fn invalid(&self, expectation: &str) -> Error {
        Error::InvalidState(format!("{} (state: {})", expectation, self.current_state.name()))
    }

    fn mark_used(&mut self, nonce: &str) {
        if self.used_order.len() >= MAX_USED_NONCES {
            if let Some(oldest) = self.used_order.pop_front() {
                self.used_nonces.remove(&oldest);
            }
        }
        self.used_nonces.insert(nonce.to_string());
        self.used_order.push_back(nonce.to_string());
    }

    fn transition(&mut self, new_state: BuilderState, reason: Option<String>) {
        let now = current_timestamp();
        let from_state = self.current_state.name().to_string();
        let to_state = new_state.name().to_string();

        let transition_data = format!("{}:{}->{};{}", self.agent_id, from_state, to_state, now);
        let transition_hash = blake3::hash(transition_data.as_bytes()).as_bytes().to_vec();

        debug!(agent_id = %self.agent_id, from = %from_state, to = %to_state, "AttestationBuilder :: Transition");
        self.current_state = new_state;

        if self.history.len() >= MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(StateTransition {
            from_state,
            to_state,
            timestamp: now,
            reason,
            transition_hash,
        });
    }
}
