//! Cryptography
//!
//! Encryption of token material at rest.

pub mod encryption;

pub use encryption::{
    decrypt, encrypt, EncryptedBlob, EncryptionKey, EncryptionService, ALGORITHM_ID,
};
