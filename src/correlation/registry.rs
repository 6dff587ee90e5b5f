//! # Correlation Registry
//!
//! Routes out-of-band responses back to the instance waiting on them.
//!
//! Two DashMaps hold all state: `tokens` tracks every correlation token's lifecycle,
//! `waits` holds one entry per suspended instance. Every operation locks a token
//! entry before touching the owning wait entry and never the other way round, so
//! per-key serialization is all the synchronization there is. Whoever flips a
//! wait's `satisfied` flag gets the one and only [`DeliveryOutcome::Satisfied`].

use crate::models::{NotifyResponse, ReceivedResponse, WaitMode};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("Token {token} was already delivered")]
    DuplicateDelivery { token: String },

    #[error("Token {token} is already registered")]
    DuplicateToken { token: String },

    #[error("Instance {instance_id} already has an active wait")]
    WaitAlreadyActive { instance_id: Uuid },

    #[error("A wait needs at least one token")]
    EmptyWait,
}

impl CorrelationError {
    /// Duplicates corrupt the resume protocol and are never retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DuplicateDelivery { .. } | Self::DuplicateToken { .. }
        )
    }
}

pub type CorrelationResult<T> = Result<T, CorrelationError>;

/// Everything a satisfied wait received, handed to `handle_async_response`
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeBatch {
    pub instance_id: Uuid,
    pub mode: WaitMode,
    pub responses: Vec<ReceivedResponse>,
}

impl ResumeBatch {
    pub fn get(&self, token: &str) -> Option<&NotifyResponse> {
        self.responses
            .iter()
            .find(|received| received.token == token)
            .map(|received| &received.response)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReceivedResponse> {
        self.responses.iter()
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegisterOutcome {
    Waiting,
    /// Early deliveries already satisfy the wait; resume now
    Satisfied(ResumeBatch),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Recorded; the wait still expects more tokens
    Pending { instance_id: Uuid },
    /// No wait owns the token yet; held until one registers it
    Parked,
    /// This delivery completed the wait
    Satisfied(ResumeBatch),
    /// The wait was cancelled, or this is the first response for a token
    /// superseded by a sibling in ANY mode
    Ignored,
}

#[derive(Debug, Clone)]
enum TokenState {
    Parked(NotifyResponse, DateTime<Utc>),
    Awaiting(Uuid),
    Received(Uuid),
    Consumed { instance_id: Uuid, at: DateTime<Utc> },
    /// Wait aborted or timed out; late responses are dropped
    Cancelled { instance_id: Uuid, at: DateTime<Utc> },
    /// Sibling of a satisfied ANY wait; the first response is dropped, a repeat is a duplicate
    Superseded { instance_id: Uuid, at: DateTime<Utc> },
}

impl TokenState {
    fn retired_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Parked(_, at)
            | Self::Consumed { at, .. }
            | Self::Cancelled { at, .. }
            | Self::Superseded { at, .. } => Some(*at),
            Self::Awaiting(_) | Self::Received(_) => None,
        }
    }
}

#[derive(Debug)]
struct WaitEntry {
    mode: WaitMode,
    expected: Vec<String>,
    received: Vec<ReceivedResponse>,
    satisfied: bool,
}

impl WaitEntry {
    fn is_complete(&self) -> bool {
        match self.mode {
            WaitMode::All => self.received.len() >= self.expected.len(),
            WaitMode::Any => !self.received.is_empty(),
        }
    }

    /// Flip to satisfied if complete; returns the batch only for the caller that flipped it
    fn try_satisfy(&mut self, instance_id: Uuid) -> Option<ResumeBatch> {
        if self.satisfied || !self.is_complete() {
            return None;
        }
        self.satisfied = true;
        Some(ResumeBatch {
            instance_id,
            mode: self.mode,
            responses: self.received.clone(),
        })
    }
}

/// Thread-safe token to instance routing table
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    tokens: DashMap<String, TokenState>,
    waits: DashMap<Uuid, WaitEntry>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the tokens an instance suspends on. Responses parked for these
    /// tokens before registration are absorbed in their arrival order.
    pub fn register_wait(
        &self,
        instance_id: Uuid,
        tokens: &[String],
        mode: WaitMode,
    ) -> CorrelationResult<RegisterOutcome> {
        self.register(instance_id, tokens, mode, Vec::new())
    }

    /// Re-register a wait after a restart together with the responses it had
    /// already received. Parked responses for the remaining tokens are absorbed
    /// as in [`register_wait`](Self::register_wait).
    pub fn restore_wait(
        &self,
        instance_id: Uuid,
        tokens: &[String],
        mode: WaitMode,
        received: Vec<ReceivedResponse>,
    ) -> CorrelationResult<RegisterOutcome> {
        self.register(instance_id, tokens, mode, received)
    }

    fn register(
        &self,
        instance_id: Uuid,
        tokens: &[String],
        mode: WaitMode,
        seeded: Vec<ReceivedResponse>,
    ) -> CorrelationResult<RegisterOutcome> {
        if tokens.is_empty() {
            return Err(CorrelationError::EmptyWait);
        }

        match self.waits.entry(instance_id) {
            Entry::Occupied(_) => {
                return Err(CorrelationError::WaitAlreadyActive { instance_id });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(WaitEntry {
                    mode,
                    expected: tokens.to_vec(),
                    received: Vec::new(),
                    satisfied: false,
                });
            }
        }

        let mut absorbed: Vec<ReceivedResponse> = Vec::new();
        let mut restored: Vec<ReceivedResponse> = Vec::new();
        for (index, token) in tokens.iter().enumerate() {
            let prior = seeded.iter().find(|received| &received.token == token);
            let claimed = match self.tokens.entry(token.clone()) {
                Entry::Vacant(vacant) => {
                    match prior {
                        Some(received) => {
                            vacant.insert(TokenState::Received(instance_id));
                            restored.push(received.clone());
                        }
                        None => {
                            vacant.insert(TokenState::Awaiting(instance_id));
                        }
                    }
                    Ok(())
                }
                Entry::Occupied(mut occupied) => match occupied.get().clone() {
                    TokenState::Parked(_, _) if prior.is_some() => {
                        warn!(token = %token, instance_id = %instance_id, "Dropping redelivery of a token received before restart");
                        occupied.insert(TokenState::Received(instance_id));
                        restored.extend(prior.cloned());
                        Ok(())
                    }
                    TokenState::Parked(response, received_at) => {
                        occupied.insert(TokenState::Received(instance_id));
                        absorbed.push(ReceivedResponse {
                            token: token.clone(),
                            response,
                            received_at,
                        });
                        Ok(())
                    }
                    _ => Err(CorrelationError::DuplicateToken {
                        token: token.clone(),
                    }),
                },
            };

            if let Err(err) = claimed {
                self.unwind_registration(instance_id, &tokens[..index], &absorbed);
                return Err(err);
            }
        }

        absorbed.extend(restored);
        absorbed.sort_by_key(|received| received.received_at);

        let batch = match self.waits.get_mut(&instance_id) {
            Some(mut wait) => {
                // Parked responses arrived before anything delivered after registration
                let mut merged = absorbed;
                merged.append(&mut wait.received);
                wait.received = merged;
                wait.try_satisfy(instance_id)
            }
            None => None,
        };

        debug!(
            instance_id = %instance_id,
            token_count = tokens.len(),
            restored = seeded.len(),
            mode = ?mode,
            satisfied = batch.is_some(),
            "Registered correlation wait"
        );

        Ok(match batch {
            Some(batch) => RegisterOutcome::Satisfied(batch),
            None => RegisterOutcome::Waiting,
        })
    }

    fn unwind_registration(
        &self,
        instance_id: Uuid,
        claimed: &[String],
        absorbed: &[ReceivedResponse],
    ) {
        self.waits.remove(&instance_id);
        for token in claimed {
            match absorbed.iter().find(|received| &received.token == token) {
                Some(received) => {
                    self.tokens.insert(
                        token.clone(),
                        TokenState::Parked(received.response.clone(), received.received_at),
                    );
                }
                None => {
                    self.tokens.remove(token);
                }
            }
        }
    }

    /// Deliver a response for a token
    pub fn deliver(
        &self,
        token: &str,
        response: NotifyResponse,
    ) -> CorrelationResult<DeliveryOutcome> {
        let received_at = Utc::now();
        let mut entry = match self.tokens.entry(token.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(TokenState::Parked(response, received_at));
                debug!(token = %token, "Parked response for unregistered token");
                return Ok(DeliveryOutcome::Parked);
            }
            Entry::Occupied(occupied) => occupied,
        };

        let instance_id = match entry.get() {
            TokenState::Awaiting(instance_id) => *instance_id,
            TokenState::Cancelled { instance_id, .. } => {
                warn!(token = %token, instance_id = %instance_id, "Dropping response for cancelled wait");
                return Ok(DeliveryOutcome::Ignored);
            }
            TokenState::Superseded { instance_id, .. } => {
                let instance_id = *instance_id;
                entry.insert(TokenState::Consumed {
                    instance_id,
                    at: received_at,
                });
                debug!(token = %token, instance_id = %instance_id, "Wait already satisfied, ignoring sibling token");
                return Ok(DeliveryOutcome::Ignored);
            }
            TokenState::Parked(..) | TokenState::Received(_) | TokenState::Consumed { .. } => {
                return Err(CorrelationError::DuplicateDelivery {
                    token: token.to_string(),
                });
            }
        };

        let Some(mut wait) = self.waits.get_mut(&instance_id) else {
            entry.insert(TokenState::Cancelled {
                instance_id,
                at: received_at,
            });
            warn!(token = %token, instance_id = %instance_id, "Dropping response for cancelled wait");
            return Ok(DeliveryOutcome::Ignored);
        };

        if wait.satisfied {
            entry.insert(TokenState::Consumed {
                instance_id,
                at: received_at,
            });
            debug!(token = %token, instance_id = %instance_id, "Wait already satisfied, ignoring sibling token");
            return Ok(DeliveryOutcome::Ignored);
        }

        wait.received.push(ReceivedResponse {
            token: token.to_string(),
            response,
            received_at,
        });
        entry.insert(TokenState::Received(instance_id));

        let outcome = match wait.try_satisfy(instance_id) {
            Some(batch) => DeliveryOutcome::Satisfied(batch),
            None => DeliveryOutcome::Pending { instance_id },
        };

        debug!(
            token = %token,
            instance_id = %instance_id,
            received = wait.received.len(),
            expected = wait.expected.len(),
            "Delivered correlation token"
        );

        Ok(outcome)
    }

    /// Whether the instance's wait has fired
    pub fn is_satisfied(&self, instance_id: Uuid) -> bool {
        self.waits
            .get(&instance_id)
            .map(|wait| wait.satisfied)
            .unwrap_or(false)
    }

    pub fn has_wait(&self, instance_id: Uuid) -> bool {
        self.waits.contains_key(&instance_id)
    }

    /// Responses the instance's wait has received so far, in arrival order
    pub fn received(&self, instance_id: Uuid) -> Vec<ReceivedResponse> {
        self.waits
            .get(&instance_id)
            .map(|wait| wait.received.clone())
            .unwrap_or_default()
    }

    /// Remove a satisfied wait once its instance has resumed. Delivered tokens stay
    /// recorded as consumed so a redelivery is still detected.
    pub fn release(&self, instance_id: Uuid) {
        self.retire(instance_id);
    }

    /// Drop a wait that will never resume (abort or timeout). Late responses for its
    /// tokens are ignored rather than parked.
    pub fn cancel(&self, instance_id: Uuid) {
        if self.retire(instance_id) {
            debug!(instance_id = %instance_id, "Cancelled correlation wait");
        }
    }

    fn retire(&self, instance_id: Uuid) -> bool {
        let Some((_, wait)) = self.waits.remove(&instance_id) else {
            return false;
        };
        let now = Utc::now();
        for token in &wait.expected {
            if let Some(mut state) = self.tokens.get_mut(token) {
                let next = match &*state {
                    TokenState::Received(owner) if *owner == instance_id => {
                        TokenState::Consumed {
                            instance_id,
                            at: now,
                        }
                    }
                    TokenState::Awaiting(owner) if *owner == instance_id && wait.satisfied => {
                        TokenState::Superseded {
                            instance_id,
                            at: now,
                        }
                    }
                    TokenState::Awaiting(owner) if *owner == instance_id => {
                        TokenState::Cancelled {
                            instance_id,
                            at: now,
                        }
                    }
                    _ => continue,
                };
                *state = next;
            }
        }
        true
    }

    /// Forget parked, consumed, cancelled and superseded tokens retired before `cutoff`.
    /// Tokens of live waits are kept.
    pub fn prune_consumed(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.tokens.len();
        self.tokens
            .retain(|_, state| state.retired_at().map_or(true, |at| at >= cutoff));
        before - self.tokens.len()
    }

    /// Number of token records held, live or retired
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Number of instances currently waiting
    pub fn pending_count(&self) -> usize {
        self.waits.iter().filter(|wait| !wait.satisfied).count()
    }

    /// Number of responses held for tokens nobody registered yet
    pub fn parked_count(&self) -> usize {
        self.tokens
            .iter()
            .filter(|state| matches!(state.value(), TokenState::Parked(..)))
            .count()
    }
}
