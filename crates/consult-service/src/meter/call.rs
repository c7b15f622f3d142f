//! Metered voice calls.
//!
//! A call is admitted when it starts, accrues only once the provider reports it
//! connected, settles every completed minute while live and charges the final
//! partial minute when it ends. Total billed minutes are `ceil(elapsed / 60)`.
//!
//! A call ends when the caller hangs up, when the voice provider reports the
//! conversation over, when the wallet no longer covers another minute, or when
//! it reaches the longest allowed duration. Every path settles through
//! [`CallMeter::finish`], and only the first one to claim the session does.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use consult_core::{
    call_charge, BillingError, CallId, CallUsage, Expert, ExpertId, Rates, Result, UserId,
};

use crate::ledger::{Charge, CreditLedger};
use crate::memory::MemoryDistiller;
use crate::rates::RateTable;
use crate::voice::{VoiceProvider, VoiceSession};

/// Interval between completed-minute settlements.
pub const SETTLEMENT_INTERVAL: Duration = Duration::from_secs(60);

/// Longest a call may stay connected unless configured otherwise.
pub const DEFAULT_MAX_CALL_DURATION: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Dialing,
    Connected { at: Instant },
    Ended,
}

struct SessionState {
    phase: Phase,
    billed_minutes: u64,
    stop: Option<watch::Sender<bool>>,
}

/// One call between a seeker and an expert. Timers live here and die with it.
struct CallSession {
    id: CallId,
    user_id: UserId,
    expert_id: ExpertId,
    rates: Rates,
    connect_deadline: Instant,
    conversation_id: Option<String>,
    state: tokio::sync::Mutex<SessionState>,
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The caller hung up.
    Caller,
    /// The voice provider reported the conversation over.
    Provider,
    /// The balance no longer covers another minute.
    FundsExhausted,
    /// The call reached the longest allowed duration.
    MaxDuration,
}

/// Material for the relationship memory, handed over when a call ends.
#[derive(Debug, Clone, Default)]
pub struct CallNotes {
    /// Transcript captured by the client.
    pub transcript: Option<String>,
    /// Provider conversation id to fetch the transcript with.
    pub conversation_id: Option<String>,
}

/// Returned to the client when a call is admitted.
#[derive(Debug, Clone, Serialize)]
pub struct CallTicket {
    /// Call identifier.
    pub call_id: CallId,
    /// Rates the call will be billed at.
    pub rates: Rates,
    /// Balance at admission.
    pub balance: i64,
    /// Voice provider credentials, when a voice agent is configured.
    pub voice: Option<VoiceSession>,
    /// Seconds the client has to report the call connected.
    pub connect_window_seconds: u64,
    /// Connected seconds after which the call is ended.
    pub max_duration_seconds: u64,
}

/// Outcome of an ended call.
#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    /// Call identifier.
    pub call_id: CallId,
    /// The expert called.
    pub expert_id: ExpertId,
    /// Whether the call ever connected.
    pub connected: bool,
    /// Connected seconds.
    pub elapsed_seconds: u64,
    /// Minutes billed over the whole call.
    pub billed_minutes: u64,
    /// Credits charged over the whole call.
    pub credits_charged: i64,
    /// Provider conversation id, for transcript retrieval.
    pub conversation_id: Option<String>,
    /// What ended the call.
    pub ended_by: EndReason,
    /// Whether the call was recorded in the relationship memory.
    pub memory_updated: bool,
}

/// Registry of live calls.
#[derive(Clone)]
pub struct CallMeter {
    ledger: CreditLedger,
    rates: RateTable,
    voice: Option<Arc<dyn VoiceProvider>>,
    distiller: Option<MemoryDistiller>,
    connect_timeout: Duration,
    max_duration: Duration,
    settlement_interval: Duration,
    sessions: Arc<Mutex<HashMap<CallId, Arc<CallSession>>>>,
}

impl CallMeter {
    /// Create a call meter.
    #[must_use]
    pub fn new(
        ledger: CreditLedger,
        rates: RateTable,
        voice: Option<Arc<dyn VoiceProvider>>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            rates,
            voice,
            distiller: None,
            connect_timeout,
            max_duration: DEFAULT_MAX_CALL_DURATION,
            settlement_interval: SETTLEMENT_INTERVAL,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// End connected calls after `max_duration`, at the next minute boundary.
    #[must_use]
    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    /// Record every connected call in the relationship memory when it ends.
    #[must_use]
    pub fn with_distiller(mut self, distiller: MemoryDistiller) -> Self {
        self.distiller = Some(distiller);
        self
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<CallId, Arc<CallSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owned_session(&self, call_id: &CallId, user_id: &UserId) -> Result<Arc<CallSession>> {
        let session = self
            .sessions()
            .get(call_id)
            .cloned()
            .ok_or_else(|| not_found(call_id))?;
        if session.user_id != *user_id {
            return Err(BillingError::NotParticipant {
                user_id: user_id.to_string(),
            });
        }
        Ok(session)
    }

    /// Number of calls not yet ended.
    #[must_use]
    pub fn live_calls(&self) -> usize {
        self.sessions().len()
    }

    /// Admit `user_id` for at least one minute and open a call session.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::AdmissionDenied` if the balance does not cover a
    /// minute, or `BillingError::ExternalUnavailable` if the voice token exchange
    /// fails. No session is created in either case.
    pub async fn start(&self, user_id: &UserId, expert: &Expert) -> Result<CallTicket> {
        self.reap_abandoned();

        let rates = self.rates.rate_for(user_id).await?;
        let balance = self.ledger.admit(user_id, rates.call_per_minute).await?;

        let voice = match (&self.voice, expert.voice_agent_id.as_deref()) {
            (Some(provider), Some(agent_id)) => {
                Some(provider.session_token(agent_id).await.map_err(|e| {
                    tracing::warn!(user_id = %user_id, error = %e, "Voice token exchange failed");
                    BillingError::from(e)
                })?)
            }
            _ => None,
        };

        let session = Arc::new(CallSession {
            id: CallId::generate(),
            user_id: *user_id,
            expert_id: expert.id,
            rates,
            connect_deadline: Instant::now() + self.connect_timeout,
            conversation_id: voice.as_ref().and_then(|v| v.conversation_id.clone()),
            state: tokio::sync::Mutex::new(SessionState {
                phase: Phase::Dialing,
                billed_minutes: 0,
                stop: None,
            }),
        });
        self.sessions().insert(session.id, Arc::clone(&session));

        tracing::info!(
            call_id = %session.id,
            user_id = %user_id,
            expert_id = %expert.id,
            call_per_minute = rates.call_per_minute,
            "Call admitted"
        );

        Ok(CallTicket {
            call_id: session.id,
            rates,
            balance,
            voice,
            connect_window_seconds: self.connect_timeout.as_secs(),
            max_duration_seconds: self.max_duration.as_secs(),
        })
    }

    /// Mark a call connected and start accruing.
    ///
    /// Reporting an already connected call again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::ConnectWindowElapsed` if the window has passed (the
    /// session is discarded unbilled), `BillingError::NotFound` for unknown calls
    /// and `BillingError::NotParticipant` for someone else's call.
    pub async fn connected(&self, call_id: &CallId, user_id: &UserId) -> Result<()> {
        let session = self.owned_session(call_id, user_id)?;
        let mut state = session.state.lock().await;

        match state.phase {
            Phase::Connected { .. } => return Ok(()),
            Phase::Ended => return Err(not_found(call_id)),
            Phase::Dialing => {}
        }

        let now = Instant::now();
        if now > session.connect_deadline {
            state.phase = Phase::Ended;
            drop(state);
            self.sessions().remove(call_id);
            tracing::info!(call_id = %call_id, "Connect window elapsed, call discarded");
            return Err(BillingError::ConnectWindowElapsed {
                call_id: call_id.to_string(),
            });
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        state.phase = Phase::Connected { at: now };
        state.stop = Some(stop_tx);
        drop(state);

        tokio::spawn(accrue(self.clone(), Arc::clone(&session), now, stop_rx));

        tracing::info!(call_id = %call_id, user_id = %user_id, "Call connected");
        Ok(())
    }

    /// End a call on the caller's request and charge whatever has not been
    /// settled yet.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::NotFound` for unknown or already ended calls and
    /// `BillingError::NotParticipant` for someone else's call.
    pub async fn end(
        &self,
        call_id: &CallId,
        user_id: &UserId,
        notes: CallNotes,
    ) -> Result<CallSummary> {
        let session = self.owned_session(call_id, user_id)?;
        self.finish(&session, Instant::now(), EndReason::Caller, notes)
            .await
    }

    /// End a call the voice provider reports as over.
    ///
    /// The call is matched by `call_id`, or else by the provider conversation id
    /// it was opened with.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::NotFound` when no live call matches, which includes
    /// calls the caller already ended.
    pub async fn disconnected(
        &self,
        call_id: Option<&CallId>,
        conversation_id: Option<&str>,
        notes: CallNotes,
    ) -> Result<CallSummary> {
        let session = {
            let sessions = self.sessions();
            call_id
                .and_then(|id| sessions.get(id).cloned())
                .or_else(|| {
                    let conversation_id = conversation_id?;
                    sessions
                        .values()
                        .find(|s| s.conversation_id.as_deref() == Some(conversation_id))
                        .cloned()
                })
        };
        let Some(session) = session else {
            return Err(BillingError::NotFound {
                entity: "call",
                id: call_id
                    .map(ToString::to_string)
                    .or_else(|| conversation_id.map(str::to_string))
                    .unwrap_or_default(),
            });
        };

        self.finish(&session, Instant::now(), EndReason::Provider, notes)
            .await
    }

    /// Settle and close `session` as of `cutoff`.
    async fn finish(
        &self,
        session: &Arc<CallSession>,
        cutoff: Instant,
        reason: EndReason,
        notes: CallNotes,
    ) -> Result<CallSummary> {
        // Whoever removes the session settles it.
        if self.sessions().remove(&session.id).is_none() {
            return Err(not_found(&session.id));
        }

        let mut state = session.state.lock().await;
        let (elapsed_seconds, connected) = match state.phase {
            Phase::Connected { at } => (connected_seconds(at, cutoff), true),
            Phase::Dialing | Phase::Ended => (0, false),
        };
        let usage = CallUsage {
            elapsed_seconds,
            billed_minutes: state.billed_minutes,
        };
        state.billed_minutes = usage.minutes();
        state.phase = Phase::Ended;
        if let Some(stop) = state.stop.take() {
            let _ = stop.send(true);
        }
        drop(state);

        if usage.due_minutes() > 0 {
            self.ledger
                .settle(
                    &session.user_id,
                    usage.credits_due(&session.rates),
                    Charge::call(session.id, session.expert_id, &usage),
                )
                .await;
        }

        let billed_minutes = usage.minutes();
        let credits_charged = call_charge(
            billed_minutes.saturating_mul(60),
            session.rates.call_per_minute,
        );
        tracing::info!(
            call_id = %session.id,
            user_id = %session.user_id,
            ended_by = ?reason,
            connected = connected,
            elapsed_seconds = elapsed_seconds,
            billed_minutes = billed_minutes,
            credits_charged = credits_charged,
            "Call ended"
        );

        let conversation_id = notes
            .conversation_id
            .or_else(|| session.conversation_id.clone());
        let memory_updated = match &self.distiller {
            Some(distiller) if connected => distiller
                .distill(
                    &session.user_id,
                    &session.expert_id,
                    notes.transcript.as_deref(),
                    conversation_id.as_deref(),
                )
                .await
                .map_err(|e| {
                    tracing::warn!(call_id = %session.id, error = %e, "Memory update failed");
                })
                .is_ok(),
            _ => false,
        };

        Ok(CallSummary {
            call_id: session.id,
            expert_id: session.expert_id,
            connected,
            elapsed_seconds,
            billed_minutes,
            credits_charged,
            conversation_id,
            ended_by: reason,
            memory_updated,
        })
    }

    /// Drop sessions that never connected within their window.
    fn reap_abandoned(&self) {
        let now = Instant::now();
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, session| {
            now <= session.connect_deadline
                || session
                    .state
                    .try_lock()
                    .map_or(true, |state| state.phase != Phase::Dialing)
        });
        let reaped = before - sessions.len();
        if reaped > 0 {
            tracing::debug!(reaped = reaped, "Discarded calls that never connected");
        }
    }
}

fn not_found(call_id: &CallId) -> BillingError {
    BillingError::NotFound {
        entity: "call",
        id: call_id.to_string(),
    }
}

/// Whole seconds from `at` to `until`, counting a started second as a full one.
fn connected_seconds(at: Instant, until: Instant) -> u64 {
    let elapsed = until.saturating_duration_since(at);
    elapsed.as_secs() + u64::from(elapsed.subsec_nanos() > 0)
}

/// Settle completed minutes until the call ends, ending it once the wallet or
/// the duration limit runs out.
async fn accrue(
    meter: CallMeter,
    session: Arc<CallSession>,
    connected_at: Instant,
    mut stop: watch::Receiver<bool>,
) {
    let interval = meter.settlement_interval;
    let mut ticker = interval_at(connected_at + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => return,
        }

        let (usage, at) = {
            let mut state = session.state.lock().await;
            let Phase::Connected { at } = state.phase else {
                return;
            };
            let completed = Instant::now().duration_since(at).as_secs() / 60;
            let usage = CallUsage {
                elapsed_seconds: completed * 60,
                billed_minutes: state.billed_minutes,
            };
            state.billed_minutes = usage.minutes();
            (usage, at)
        };

        let mut balance = None;
        if usage.due_minutes() > 0 {
            balance = meter
                .ledger
                .settle(
                    &session.user_id,
                    usage.credits_due(&session.rates),
                    Charge::call(session.id, session.expert_id, &usage),
                )
                .await;
        }

        let billed = Duration::from_secs(usage.minutes().saturating_mul(60));
        let reason = if balance.is_some_and(|b| b < session.rates.call_per_minute) {
            EndReason::FundsExhausted
        } else if billed >= meter.max_duration {
            EndReason::MaxDuration
        } else {
            continue;
        };

        tracing::info!(
            call_id = %session.id,
            reason = ?reason,
            balance = ?balance,
            "Ending call at minute boundary"
        );
        // The caller may have hung up meanwhile; that end already settled.
        if let Err(e) = meter
            .finish(&session, at + billed, reason, CallNotes::default())
            .await
        {
            tracing::debug!(call_id = %session.id, error = %e, "Call already ended");
        }
        return;
    }
}
