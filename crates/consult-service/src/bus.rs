//! Realtime message bus.
//!
//! Messages are persisted first and then fanned out to live subscribers. Insert
//! and publish for one consultation happen under that consultation's gate, so
//! subscribers observe messages in sequence order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast;

use consult_core::{
    BillingError, Consultation, ConsultationId, ConsultationStatus, Message, MessageKind,
    NewMessage, Result, UserId,
};
use consult_store::{Store, StoreError};

use crate::lifecycle::ConsultationLifecycle;
use crate::notify::{Notification, Notifier};

/// Messages buffered per subscriber before it is reported as lagging.
const CHANNEL_CAPACITY: usize = 256;

/// Longest message preview included in a notification.
const PREVIEW_CHARS: usize = 120;

struct Channel {
    gate: tokio::sync::Mutex<()>,
    tx: broadcast::Sender<Message>,
}

impl Channel {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            gate: tokio::sync::Mutex::new(()),
            tx,
        }
    }
}

/// Ordered fan-out of consultation messages plus unread bookkeeping.
#[derive(Clone)]
pub struct MessageBus {
    store: Arc<dyn Store>,
    lifecycle: ConsultationLifecycle,
    notifier: Arc<dyn Notifier>,
    channels: Arc<Mutex<HashMap<ConsultationId, Arc<Channel>>>>,
}

impl MessageBus {
    /// Create a bus over `store`.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        lifecycle: ConsultationLifecycle,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            lifecycle,
            notifier,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn channel(&self, id: &ConsultationId) -> Arc<Channel> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(*id)
            .or_insert_with(|| Arc::new(Channel::new()))
            .clone()
    }

    // =========================================================================
    // Send / receive
    // =========================================================================

    /// Persist and publish a message from `sender`.
    ///
    /// The first message of a waiting consultation activates it. The other party
    /// is notified in the background; notification failures are only logged.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::NotParticipant` for outsiders,
    /// `BillingError::TransitionRejected` for completed consultations and
    /// `BillingError::NotFound` for unknown ones.
    pub async fn send(
        &self,
        id: &ConsultationId,
        sender: &UserId,
        content: &str,
        kind: MessageKind,
    ) -> Result<Message> {
        let (consultation, party) = self.lifecycle.get(id, sender).await?;

        let channel = self.channel(id);
        let message = {
            let _guard = channel.gate.lock().await;
            // Status is read under the gate; `complete` takes the same gate.
            let inserted = match self.ensure_open(id).await {
                Ok(()) => {
                    self.store
                        .insert_message(NewMessage {
                            consultation_id: *id,
                            sender: *sender,
                            content: content.to_string(),
                            kind,
                        })
                        .await
                }
                Err(e) => Err(e),
            };
            match inserted {
                Ok(message) => {
                    // No receivers is fine; pull clients catch up via `messages`.
                    let _ = channel.tx.send(message.clone());
                    message
                }
                Err(e) => {
                    if matches!(e, StoreError::ConsultationClosed { .. }) {
                        self.close(id);
                    }
                    return Err(e.into());
                }
            }
        };

        tracing::debug!(
            consultation_id = %id,
            seq = message.seq,
            sender = %sender,
            "Message published"
        );

        if consultation.status == ConsultationStatus::Waiting {
            self.lifecycle.activate(id).await?;
        }

        self.notify_recipient(&consultation, consultation.user_of(party.counterpart()), &message);
        Ok(message)
    }

    fn notify_recipient(&self, consultation: &Consultation, recipient: UserId, message: &Message) {
        let preview: String = message.content.chars().take(PREVIEW_CHARS).collect();
        let notification = Notification {
            recipient,
            title: "New message".to_string(),
            body: preview,
        };
        let notifier = Arc::clone(&self.notifier);
        let consultation_id = consultation.id;

        tokio::spawn(async move {
            if let Err(e) = notifier.notify(notification).await {
                tracing::warn!(
                    consultation_id = %consultation_id,
                    recipient = %recipient,
                    error = %e,
                    "Failed to notify recipient"
                );
            }
        });
    }

    /// Live feed of messages inserted after this call.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::NotParticipant` for outsiders,
    /// `BillingError::TransitionRejected` for completed consultations and
    /// `BillingError::NotFound` for unknown ones.
    pub async fn subscribe(
        &self,
        id: &ConsultationId,
        reader: &UserId,
    ) -> Result<broadcast::Receiver<Message>> {
        self.lifecycle.get(id, reader).await?;

        let channel = self.channel(id);
        let _guard = channel.gate.lock().await;
        if let Err(e) = self.ensure_open(id).await {
            if matches!(e, StoreError::ConsultationClosed { .. }) {
                self.close(id);
            }
            return Err(e.into());
        }
        Ok(channel.tx.subscribe())
    }

    /// Complete a consultation and end its live subscriptions.
    ///
    /// Runs under the consultation's gate, so no message is published after the
    /// completion and no feed attaches to the dropped channel.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::NotParticipant` or `BillingError::NotFound`.
    pub async fn complete(&self, id: &ConsultationId, actor: &UserId) -> Result<Consultation> {
        self.lifecycle.get(id, actor).await?;

        let channel = self.channel(id);
        let _guard = channel.gate.lock().await;
        let completed = self.lifecycle.complete(id, actor).await;
        self.close(id);
        completed
    }

    /// Stored messages in order, optionally only those after `after_seq`.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Storage` if the store fails.
    pub async fn messages(
        &self,
        id: &ConsultationId,
        after_seq: Option<u64>,
    ) -> Result<Vec<Message>> {
        Ok(self.store.list_messages(id, after_seq).await?)
    }

    async fn ensure_open(&self, id: &ConsultationId) -> std::result::Result<(), StoreError> {
        match self.store.get_consultation(id).await? {
            Some(c) if c.status == ConsultationStatus::Completed => {
                Err(StoreError::ConsultationClosed { id: id.to_string() })
            }
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                entity: "consultation",
                id: id.to_string(),
            }),
        }
    }

    /// Drop the live channel of a finished consultation, ending its subscriptions.
    fn close(&self, id: &ConsultationId) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if channels.remove(id).is_some() {
            tracing::debug!(consultation_id = %id, "Message channel closed");
        }
    }

    // =========================================================================
    // Unread bookkeeping
    // =========================================================================

    /// Messages from the other party newer than `reader`'s marker.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::NotParticipant` or `BillingError::NotFound`.
    pub async fn unread_count(&self, id: &ConsultationId, reader: &UserId) -> Result<usize> {
        let (consultation, party) = self.lifecycle.get(id, reader).await?;
        Ok(self
            .store
            .count_unread(id, reader, consultation.read_marker(party))
            .await?)
    }

    /// Unread counts for every consultation `reader` takes part in, newest first.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Storage` if the store fails.
    pub async fn unread_counts(&self, reader: &UserId) -> Result<Vec<(Consultation, usize)>> {
        let consultations = self.lifecycle.list_for(reader).await?;
        let mut counts = Vec::with_capacity(consultations.len());
        for consultation in consultations {
            let Some(party) = consultation.party_of(reader) else {
                continue;
            };
            let unread = self
                .store
                .count_unread(&consultation.id, reader, consultation.read_marker(party))
                .await?;
            counts.push((consultation, unread));
        }
        Ok(counts)
    }

    /// Move `reader`'s marker to now. Never moves it backwards.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::NotParticipant` or `BillingError::NotFound`.
    pub async fn mark_read(&self, id: &ConsultationId, reader: &UserId) -> Result<Consultation> {
        let (_, party) = self.lifecycle.get(id, reader).await?;
        Ok(self.store.mark_read(id, party, Utc::now()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use consult_core::{Expert, ExpertId, ExpertKind};
    use consult_store::MemoryStore;

    use crate::notify::NotifyError;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: StdMutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: Notification) -> std::result::Result<(), NotifyError> {
            self.sent.lock().unwrap().push(notification);
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _: Notification) -> std::result::Result<(), NotifyError> {
            Err(NotifyError::Rejected { status: 503 })
        }
    }

    struct Fixture {
        bus: MessageBus,
        lifecycle: ConsultationLifecycle,
        consultation: Consultation,
    }

    async fn fixture(notifier: Arc<dyn Notifier>) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let expert = Expert {
            id: ExpertId::generate(),
            display_name: "Mira".into(),
            kind: ExpertKind::Human,
            linked_user: Some(UserId::generate()),
            persona: None,
            voice_agent_id: None,
            created_at: Utc::now(),
        };
        store.put_expert(&expert).await.unwrap();

        let lifecycle = ConsultationLifecycle::new(store.clone());
        let consultation = lifecycle
            .open(&UserId::generate(), &expert.id, "career")
            .await
            .unwrap();

        Fixture {
            bus: MessageBus::new(store, lifecycle.clone(), notifier),
            lifecycle,
            consultation,
        }
    }

    #[tokio::test]
    async fn first_message_activates_and_publishes_in_order() {
        let f = fixture(Arc::new(RecordingNotifier::default())).await;
        let c = &f.consultation;
        let mut rx = f.bus.subscribe(&c.id, &c.seeker).await.unwrap();

        for text in ["hello", "are you there?", "thanks"] {
            f.bus
                .send(&c.id, &c.seeker, text, MessageKind::Text)
                .await
                .unwrap();
        }

        let received: Vec<u64> = vec![
            rx.recv().await.unwrap().seq,
            rx.recv().await.unwrap().seq,
            rx.recv().await.unwrap().seq,
        ];
        assert!(received.windows(2).all(|w| w[0] < w[1]));

        let (current, _) = f.lifecycle.get(&c.id, &c.seeker).await.unwrap();
        assert_eq!(current.status, ConsultationStatus::Active);
    }

    #[tokio::test]
    async fn unread_then_mark_read_resets() {
        let f = fixture(Arc::new(RecordingNotifier::default())).await;
        let c = &f.consultation;

        for text in ["one", "two", "three"] {
            f.bus
                .send(&c.id, &c.seeker, text, MessageKind::Text)
                .await
                .unwrap();
        }
        assert_eq!(f.bus.unread_count(&c.id, &c.expert_user).await.unwrap(), 3);
        assert_eq!(f.bus.unread_count(&c.id, &c.seeker).await.unwrap(), 0);

        f.bus.mark_read(&c.id, &c.expert_user).await.unwrap();
        assert_eq!(f.bus.unread_count(&c.id, &c.expert_user).await.unwrap(), 0);

        let counts = f.bus.unread_counts(&c.expert_user).await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].1, 0);
    }

    #[tokio::test]
    async fn outsiders_and_completed_consultations_are_rejected() {
        let f = fixture(Arc::new(RecordingNotifier::default())).await;
        let c = &f.consultation;

        assert!(matches!(
            f.bus
                .send(&c.id, &UserId::generate(), "hi", MessageKind::Text)
                .await,
            Err(BillingError::NotParticipant { .. })
        ));

        f.lifecycle.complete(&c.id, &c.seeker).await.unwrap();
        assert!(matches!(
            f.bus.send(&c.id, &c.seeker, "hi", MessageKind::Text).await,
            Err(BillingError::TransitionRejected { .. })
        ));
        assert!(f.bus.messages(&c.id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recipient_is_notified() {
        let notifier = Arc::new(RecordingNotifier::default());
        let f = fixture(notifier.clone()).await;
        let c = &f.consultation;

        f.bus
            .send(&c.id, &c.expert_user, "Your chart is ready", MessageKind::Text)
            .await
            .unwrap();

        for _ in 0..50 {
            if !notifier.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, c.seeker);
        assert_eq!(sent[0].body, "Your chart is ready");
    }

    #[tokio::test]
    async fn notification_failure_does_not_fail_send() {
        let f = fixture(Arc::new(FailingNotifier)).await;
        let c = &f.consultation;

        let message = f
            .bus
            .send(&c.id, &c.seeker, "hello", MessageKind::Text)
            .await
            .unwrap();
        assert_eq!(f.bus.messages(&c.id, None).await.unwrap(), vec![message]);
    }

    #[tokio::test]
    async fn pull_after_seq() {
        let f = fixture(Arc::new(RecordingNotifier::default())).await;
        let c = &f.consultation;
        let mut last = 0;
        for text in ["a", "b", "c"] {
            last = f
                .bus
                .send(&c.id, &c.seeker, text, MessageKind::Text)
                .await
                .unwrap()
                .seq;
        }

        let tail = f.bus.messages(&c.id, Some(last - 1)).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].content, "c");
    }

    fn open_channels(bus: &MessageBus) -> usize {
        bus.channels.lock().unwrap().len()
    }

    #[tokio::test]
    async fn completing_ends_subscriptions() {
        let f = fixture(Arc::new(RecordingNotifier::default())).await;
        let c = &f.consultation;
        let mut rx = f.bus.subscribe(&c.id, &c.expert_user).await.unwrap();

        let done = f.bus.complete(&c.id, &c.seeker).await.unwrap();
        assert_eq!(done.status, ConsultationStatus::Completed);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(open_channels(&f.bus), 0);
    }

    #[tokio::test]
    async fn completed_consultations_get_no_live_feed() {
        let f = fixture(Arc::new(RecordingNotifier::default())).await;
        let c = &f.consultation;
        f.bus.complete(&c.id, &c.seeker).await.unwrap();

        assert!(matches!(
            f.bus.subscribe(&c.id, &c.seeker).await,
            Err(BillingError::TransitionRejected { .. })
        ));
        assert_eq!(open_channels(&f.bus), 0);
    }

    #[tokio::test]
    async fn send_racing_completion_is_rejected_and_drops_the_channel() {
        let f = fixture(Arc::new(RecordingNotifier::default())).await;
        let c = &f.consultation;
        let mut rx = f.bus.subscribe(&c.id, &c.seeker).await.unwrap();

        // Completed behind the bus's back, as a concurrent end would be.
        f.lifecycle.complete(&c.id, &c.expert_user).await.unwrap();
        assert!(matches!(
            f.bus.send(&c.id, &c.seeker, "late", MessageKind::Text).await,
            Err(BillingError::TransitionRejected { .. })
        ));

        assert!(f.bus.messages(&c.id, None).await.unwrap().is_empty());
        assert_eq!(open_channels(&f.bus), 0);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
