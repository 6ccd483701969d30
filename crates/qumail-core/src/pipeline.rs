//! One send, start to finish:
//!
//!   AcquiringKey -> Encrypting -> Transmitting -> Logging -> Done
//!
//! Any failure in the first three stages aborts with that stage's error and
//! nothing is written to the transcript. A failure while logging happens after
//! the packet has left, so it is reported as [`SendOutcome::SentNotLogged`]
//! rather than as an error.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::cipher::{self, CipherError};
use crate::kms_client::{KeyProvider, KmsError, DEFAULT_KEY_SIZE};
use crate::packet::{ProtocolLevel, SecurePacket};
use crate::transcript::{SecureTranscript, TranscriptEntry, TranscriptError};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub key_size: usize,
    pub key_timeout: Duration,
    pub transport_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            key_size: DEFAULT_KEY_SIZE,
            key_timeout: Duration::from_secs(10),
            transport_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    AcquiringKey,
    Encrypting,
    Transmitting,
    Logging,
    Done,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::AcquiringKey => "acquiring key",
            PipelineStage::Encrypting => "encrypting",
            PipelineStage::Transmitting => "transmitting",
            PipelineStage::Logging => "logging",
            PipelineStage::Done => "done",
        };
        f.write_str(name)
    }
}

pub struct SendRequest {
    pub recipient: String,
    pub subject: String,
    pub body: Zeroizing<String>,
    pub level: ProtocolLevel,
}

#[derive(Debug)]
pub enum SendOutcome {
    Delivered(SecurePacket),
    /// The transport accepted the packet but the local transcript write failed.
    SentNotLogged {
        packet: SecurePacket,
        error: TranscriptError,
    },
}

impl SendOutcome {
    pub fn packet(&self) -> &SecurePacket {
        match self {
            SendOutcome::Delivered(packet) | SendOutcome::SentNotLogged { packet, .. } => packet,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Kms(#[from] KmsError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("send cancelled while {0}")]
    Cancelled(PipelineStage),
}

impl PipelineError {
    /// Stage at which the send was aborted.
    pub fn stage(&self) -> PipelineStage {
        match self {
            PipelineError::Kms(_) => PipelineStage::AcquiringKey,
            PipelineError::Cipher(_) => PipelineStage::Encrypting,
            PipelineError::Transport(_) => PipelineStage::Transmitting,
            PipelineError::Cancelled(stage) => *stage,
        }
    }
}

pub struct MessagePipeline {
    keys: Arc<dyn KeyProvider>,
    transport: Arc<dyn Transport>,
    transcript: Arc<SecureTranscript>,
    config: PipelineConfig,
}

impl MessagePipeline {
    pub fn new(
        keys: Arc<dyn KeyProvider>,
        transport: Arc<dyn Transport>,
        transcript: Arc<SecureTranscript>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            keys,
            transport,
            transcript,
            config,
        }
    }

    pub fn transcript(&self) -> &Arc<SecureTranscript> {
        &self.transcript
    }

    pub async fn send(&self, request: &SendRequest) -> Result<SendOutcome, PipelineError> {
        let (_never, cancel) = watch::channel(false);
        self.send_with_cancel(request, cancel).await
    }

    /// Like [`send`](Self::send), aborting at either network wait once
    /// `cancel` reads `true`.
    pub async fn send_with_cancel(
        &self,
        request: &SendRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<SendOutcome, PipelineError> {
        debug!(stage = %PipelineStage::AcquiringKey, level = %request.level, "send started");
        let key = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                return Err(abort(PipelineError::Cancelled(PipelineStage::AcquiringKey)));
            }
            fetched = timeout(self.config.key_timeout, self.keys.fetch_key(self.config.key_size)) => {
                match fetched {
                    Ok(Ok(key)) => key,
                    Ok(Err(e)) => return Err(abort(e.into())),
                    Err(_) => {
                        return Err(abort(
                            KmsError::Unreachable(format!(
                                "key request timed out after {:?}",
                                self.config.key_timeout
                            ))
                            .into(),
                        ));
                    }
                }
            }
        };

        debug!(stage = %PipelineStage::Encrypting, key_id = key.id(), "key acquired");
        let encoded = cipher::encode(request.level, &request.body, &key);
        let key_id = key.id().to_string();
        drop(key);
        let packet = SecurePacket {
            level: request.level,
            ciphertext: encoded.map_err(|e| abort(e.into()))?,
            key_id,
        };

        debug!(stage = %PipelineStage::Transmitting, recipient = %request.recipient, "packet encoded");
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                return Err(abort(PipelineError::Cancelled(PipelineStage::Transmitting)));
            }
            sent = timeout(
                self.config.transport_timeout,
                self.transport.send(&request.recipient, &request.subject, &packet.ciphertext, &packet.key_id),
            ) => {
                match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(abort(e.into())),
                    Err(_) => return Err(abort(TransportError::Timeout.into())),
                }
            }
        }

        debug!(stage = %PipelineStage::Logging, key_id = %packet.key_id, "packet handed off");
        let entry = TranscriptEntry::for_packet(&request.recipient, &request.subject, &packet);
        let transcript = Arc::clone(&self.transcript);
        let logged = tokio::task::spawn_blocking(move || transcript.append(entry))
            .await
            .unwrap_or_else(|e| {
                Err(TranscriptError::Persistence(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("transcript task: {e}"),
                )))
            });

        match logged {
            Ok(()) => {
                info!(stage = %PipelineStage::Done, key_id = %packet.key_id, level = %packet.level, "transmission complete");
                Ok(SendOutcome::Delivered(packet))
            }
            Err(error) => {
                warn!(key_id = %packet.key_id, error = %error, "packet sent but not recorded in transcript");
                Ok(SendOutcome::SentNotLogged { packet, error })
            }
        }
    }
}

fn abort(err: PipelineError) -> PipelineError {
    warn!(stage = %err.stage(), error = %err, "send aborted");
    err
}

/// Resolves once the cancel flag is set. Never resolves if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
