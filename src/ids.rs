use crate::error::ChatError;
use crate::tree::types::{ChatId, FileId, MessageId};

/// Identifier-encryption collaborator.
///
/// Clients only ever see encrypted ids; tree operations take decrypted ones.
pub trait IdCipher: Send + Sync {
    fn encrypt(&self, id: u64) -> String;

    /// # Errors
    ///
    /// Returns [`ChatError::BadRequest`] when `encoded` is not an id this
    /// cipher produced.
    fn decrypt(&self, encoded: &str) -> Result<u64, ChatError>;

    fn encrypt_message_id(&self, id: MessageId) -> String {
        self.encrypt(id.0)
    }

    /// # Errors
    ///
    /// Returns [`ChatError::BadRequest`] for malformed input.
    fn decrypt_message_id(&self, encoded: &str) -> Result<MessageId, ChatError> {
        self.decrypt(encoded).map(MessageId)
    }

    /// Optional form used for "new leaf" parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::BadRequest`] for malformed input.
    fn decrypt_message_id_or_none(
        &self,
        encoded: Option<&str>,
    ) -> Result<Option<MessageId>, ChatError> {
        encoded.map(|raw| self.decrypt_message_id(raw)).transpose()
    }

    fn encrypt_chat_id(&self, id: ChatId) -> String {
        self.encrypt(id.0)
    }

    /// # Errors
    ///
    /// Returns [`ChatError::BadRequest`] for malformed input.
    fn decrypt_chat_id(&self, encoded: &str) -> Result<ChatId, ChatError> {
        self.decrypt(encoded).map(ChatId)
    }

    fn encrypt_file_id(&self, id: FileId) -> String {
        self.encrypt(id.0)
    }
}

const MIX_MULTIPLIER: u64 = 0x9e37_79b9_7f4a_7c15;
const ENCODED_LEN: usize = 16;

/// Reversible keyed permutation of `u64` ids rendered as 16 hex digits.
///
/// Hides sequential ids from clients. It is obfuscation, not a security
/// boundary; ownership checks still run on every operation.
#[derive(Debug, Clone)]
pub struct ObfuscatingIdCipher {
    key: u64,
    inverse: u64,
}

impl ObfuscatingIdCipher {
    #[must_use]
    pub fn new(key: u64) -> Self {
        Self {
            key,
            inverse: modular_inverse(MIX_MULTIPLIER),
        }
    }

    /// Cipher with a process-random key.
    #[must_use]
    pub fn random() -> Self {
        Self::new(fastrand::u64(..))
    }
}

// Newton iteration for the inverse of an odd number modulo 2^64.
fn modular_inverse(odd: u64) -> u64 {
    let mut inverse = odd;
    for _ in 0..6 {
        inverse = inverse.wrapping_mul(2u64.wrapping_sub(odd.wrapping_mul(inverse)));
    }
    inverse
}

impl IdCipher for ObfuscatingIdCipher {
    fn encrypt(&self, id: u64) -> String {
        let mixed = (id ^ self.key).wrapping_mul(MIX_MULTIPLIER);
        format!("{mixed:016x}")
    }

    fn decrypt(&self, encoded: &str) -> Result<u64, ChatError> {
        if encoded.len() != ENCODED_LEN || !encoded.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ChatError::BadRequest(format!("invalid id '{encoded}'")));
        }
        let mixed = u64::from_str_radix(encoded, 16)
            .map_err(|err| ChatError::BadRequest(format!("invalid id '{encoded}': {err}")))?;
        Ok(mixed.wrapping_mul(self.inverse) ^ self.key)
    }
}
