//! qumail-core: per-message keys, packet protocols and the encrypted outbox.
//!
//! # Module layout
//! - `key`            single-use symmetric key, zeroized on drop
//! - `kms_client`     `KeyProvider` trait and the HTTP key-management client
//! - `packet`         protocol levels and wire framing
//! - `cipher`         OTP / AES-CBC / PQC-hybrid / plaintext encode and decode
//! - `transcript`     encrypted, append-only outbox of sent packets
//! - `transport`      `Transport` trait and the spool-directory transport
//! - `pipeline`       key -> encrypt -> transmit -> log orchestration
//! - `crypto`         at-rest AEAD helpers
//! - `secure_storage` OS keyring access
//! - `paths`          per-user data and config locations

pub mod cipher;
pub mod crypto;
pub mod key;
pub mod kms_client;
pub mod packet;
pub mod paths;
pub mod pipeline;
pub mod secure_storage;
pub mod transcript;
pub mod transport;

pub use cipher::CipherError;
pub use key::{SymmetricKey, FALLBACK_KEY_ID};
pub use kms_client::{KeyProvider, KmsClient, KmsConfig, KmsError};
pub use packet::{Packet, ProtocolLevel, SecurePacket};
pub use pipeline::{MessagePipeline, PipelineConfig, PipelineError, PipelineStage, SendOutcome, SendRequest};
pub use transcript::{SecureTranscript, TranscriptEntry, TranscriptError, TranscriptKeySource};
pub use transport::{Identity, SpoolTransport, Transport, TransportError};
