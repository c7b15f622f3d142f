//! Key encoding utilities for `RocksDB`.
//!
//! Composite keys concatenate fixed-width 16-byte ids so that prefix iteration
//! returns rows in id order. ULIDs sort by time; message sequence numbers are
//! big-endian so they sort numerically.

use consult_core::{ConsultationId, ExpertId, TransactionId, UserId};

/// Create a balance key from a user ID.
#[must_use]
pub fn balance_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create a transaction key from a transaction ID.
#[must_use]
pub fn transaction_key(transaction_id: &TransactionId) -> Vec<u8> {
    transaction_id.to_bytes().to_vec()
}

/// Create a user-transaction index key.
///
/// Format: `user_id (16 bytes) || transaction_id (16 bytes)`
#[must_use]
pub fn user_transaction_key(user_id: &UserId, transaction_id: &TransactionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&transaction_id.to_bytes());
    key
}

/// Prefix shared by every index key of a user.
#[must_use]
pub fn user_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Extract the transaction ID from a user-transaction index key.
#[must_use]
pub fn transaction_id_from_user_key(key: &[u8]) -> Option<TransactionId> {
    let bytes: [u8; 16] = key.get(16..32)?.try_into().ok()?;
    Some(TransactionId::from_bytes(bytes))
}

/// Create a consultation key.
#[must_use]
pub fn consultation_key(id: &ConsultationId) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Create a participant-consultation index key.
///
/// Format: `user_id (16 bytes) || consultation_id (16 bytes)`
#[must_use]
pub fn user_consultation_key(user_id: &UserId, id: &ConsultationId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

/// Extract the consultation ID from a participant-consultation index key.
#[must_use]
pub fn consultation_id_from_user_key(key: &[u8]) -> Option<ConsultationId> {
    let bytes: [u8; 16] = key.get(16..32)?.try_into().ok()?;
    Some(ConsultationId::from_uuid(uuid::Uuid::from_bytes(bytes)))
}

/// Create a message key.
///
/// Format: `consultation_id (16 bytes) || seq (8 bytes, big-endian)`
#[must_use]
pub fn message_key(id: &ConsultationId, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(id.as_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Prefix of all messages of a consultation.
#[must_use]
pub fn messages_prefix(id: &ConsultationId) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Create a memory key.
///
/// Format: `user_id (16 bytes) || expert_id (16 bytes)`
#[must_use]
pub fn memory_key(user_id: &UserId, expert_id: &ExpertId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(expert_id.as_bytes());
    key
}

/// Create a payment grant key from the provider transaction id.
#[must_use]
pub fn payment_key(transaction_id: &str) -> Vec<u8> {
    transaction_id.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_transaction_key_format() {
        let user_id = UserId::generate();
        let tx_id = TransactionId::generate();
        let key = user_transaction_key(&user_id, &tx_id);

        assert_eq!(key.len(), 32);
        assert_eq!(&key[..16], user_id.as_bytes());
        assert_eq!(transaction_id_from_user_key(&key), Some(tx_id));
    }

    #[test]
    fn short_index_key_is_rejected() {
        assert_eq!(transaction_id_from_user_key(&[0u8; 20]), None);
        assert_eq!(consultation_id_from_user_key(&[0u8; 16]), None);
    }

    #[test]
    fn consultation_index_extracts_id() {
        let user_id = UserId::generate();
        let id = ConsultationId::generate();
        let key = user_consultation_key(&user_id, &id);
        assert_eq!(consultation_id_from_user_key(&key), Some(id));
    }

    #[test]
    fn message_keys_sort_numerically() {
        let id = ConsultationId::generate();
        assert!(message_key(&id, 2) < message_key(&id, 10));
        assert!(message_key(&id, 255) < message_key(&id, 256));
        assert!(message_key(&id, 1).starts_with(&messages_prefix(&id)));
    }
}
