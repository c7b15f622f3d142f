//! Application state.

use std::sync::Arc;
use std::time::Duration;

use consult_store::Store;

use crate::bus::MessageBus;
use crate::config::ServiceConfig;
use crate::ledger::CreditLedger;
use crate::lifecycle::ConsultationLifecycle;
use crate::memory::MemoryDistiller;
use crate::meter::{CallMeter, ChatMeter};
use crate::notify::{NoopNotifier, Notifier, PushNotifier};
use crate::provider::{ChatProvider, OpenAiClient};
use crate::rates::RateTable;
use crate::voice::{VoiceClient, VoiceProvider};

/// External collaborators the engine talks to.
#[derive(Clone)]
pub struct Providers {
    /// Chat model, for AI chat and memory extraction.
    pub chat: Option<Arc<dyn ChatProvider>>,
    /// Voice call backend.
    pub voice: Option<Arc<dyn VoiceProvider>>,
    /// Push delivery.
    pub notifier: Arc<dyn Notifier>,
}

impl Providers {
    /// Build the configured clients. Misconfigured clients are disabled, not fatal.
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        let chat = config
            .ai_api_url
            .as_ref()
            .zip(config.ai_api_key.as_ref())
            .and_then(|(url, key)| match OpenAiClient::new(url, key, &config.ai_model) {
                Ok(client) => {
                    tracing::info!(ai_url = %url, model = %config.ai_model, "Chat provider enabled");
                    Some(Arc::new(client) as Arc<dyn ChatProvider>)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create chat client");
                    None
                }
            });
        if chat.is_none() {
            tracing::warn!("Chat provider not configured - AI chat and memory extraction disabled");
        }

        let voice = config
            .voice_api_url
            .as_ref()
            .zip(config.voice_api_key.as_ref())
            .and_then(|(url, key)| match VoiceClient::new(url, key) {
                Ok(client) => {
                    tracing::info!(voice_url = %url, "Voice provider enabled");
                    Some(Arc::new(client) as Arc<dyn VoiceProvider>)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create voice client");
                    None
                }
            });
        if voice.is_none() {
            tracing::warn!("Voice provider not configured - calls run without session tokens");
        }

        let notifier: Arc<dyn Notifier> = match config
            .push_url
            .as_ref()
            .map(|url| PushNotifier::new(url, config.push_api_key.clone()))
        {
            Some(Ok(push)) => {
                tracing::info!("Push notifications enabled");
                Arc::new(push)
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Failed to create push client");
                Arc::new(NoopNotifier)
            }
            None => {
                tracing::warn!("Push not configured - recipients will not be alerted");
                Arc::new(NoopNotifier)
            }
        };

        Self {
            chat,
            voice,
            notifier,
        }
    }

    /// No external collaborators at all.
    #[must_use]
    pub fn none() -> Self {
        Self {
            chat: None,
            voice: None,
            notifier: Arc::new(NoopNotifier),
        }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The storage backend.
    pub store: Arc<dyn Store>,

    /// Service configuration.
    pub config: ServiceConfig,

    /// Credit ledger.
    pub ledger: CreditLedger,

    /// Rate resolution.
    pub rates: RateTable,

    /// Consultation state machine.
    pub lifecycle: ConsultationLifecycle,

    /// Consultation message fan-out.
    pub bus: MessageBus,

    /// Metered AI chat.
    pub chat: ChatMeter,

    /// Metered voice calls.
    pub calls: CallMeter,

    /// Post-call memory.
    pub distiller: MemoryDistiller,
}

impl AppState {
    /// Create application state with clients built from `config`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Self {
        let providers = Providers::from_config(&config);
        Self::with_providers(store, config, providers)
    }

    /// Create application state around explicit collaborators.
    #[must_use]
    pub fn with_providers(
        store: Arc<dyn Store>,
        config: ServiceConfig,
        providers: Providers,
    ) -> Self {
        let ledger = CreditLedger::new(store.clone());
        let rates = RateTable::new(store.clone());
        let lifecycle = ConsultationLifecycle::new(store.clone());
        let bus = MessageBus::new(store.clone(), lifecycle.clone(), providers.notifier);
        let chat = ChatMeter::new(
            ledger.clone(),
            rates.clone(),
            store.clone(),
            providers.chat.clone(),
            config.pricing.chat_markup,
        );
        let distiller =
            MemoryDistiller::new(store.clone(), providers.chat, providers.voice.clone());
        let calls = CallMeter::new(
            ledger.clone(),
            rates.clone(),
            providers.voice,
            Duration::from_secs(config.call_connect_timeout_seconds),
        )
        .with_max_duration(Duration::from_secs(config.call_max_duration_seconds))
        .with_distiller(distiller.clone());

        Self {
            store,
            config,
            ledger,
            rates,
            lifecycle,
            bus,
            chat,
            calls,
            distiller,
        }
    }
}
