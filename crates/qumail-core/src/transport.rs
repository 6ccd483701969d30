//! Hand-off of finished packets to the outside world.
//!
//! The pipeline only knows the [`Transport`] contract. [`SpoolTransport`]
//! renders each packet as a mail message and drops it into an outgoing
//! spool directory for whatever relay picks it up.

use async_trait::async_trait;
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

pub const SUBJECT_PREFIX: &str = "SECURE_PACKET: ";
pub const SENDER_NAME: &str = "QuMail Secure Terminal";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport authentication failed: {0}")]
    Authentication(String),
    #[error("transport network error: {0}")]
    Network(String),
    #[error("transport timed out")]
    Timeout,
    #[error("{0} contains a line break")]
    HeaderInjection(&'static str),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        ciphertext: &str,
        key_id: &str,
    ) -> Result<(), TransportError>;
}

/// Sender identity handed to the transport by the settings layer.
#[derive(Clone)]
pub struct Identity {
    pub user: String,
    pub credential: Zeroizing<String>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn is_configured(&self) -> bool {
        !self.user.trim().is_empty() && !self.credential.trim().is_empty()
    }
}

/// Body framing shared by every transport.
pub fn render_body(ciphertext: &str, key_id: &str) -> String {
    format!(
        "--- BEGIN QUMAIL SECURE PACKET ---\n\
         TIMESTAMP: {} UTC\n\
         KEY_ID: {}\n\
         DATA: {}\n\
         --- END QUMAIL SECURE PACKET ---",
        Utc::now().format("%Y-%m-%d %H:%M:%S"),
        key_id,
        ciphertext
    )
}

pub struct SpoolTransport {
    spool_dir: PathBuf,
    identity: Identity,
}

impl SpoolTransport {
    pub fn new(spool_dir: impl Into<PathBuf>, identity: Identity) -> Self {
        Self {
            spool_dir: spool_dir.into(),
            identity,
        }
    }

    fn render_message(&self, recipient: &str, subject: &str, ciphertext: &str, key_id: &str) -> String {
        format!(
            "From: {} <{}>\r\nTo: <{}>\r\nSubject: {}{}\r\nDate: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
            SENDER_NAME,
            self.identity.user,
            recipient,
            SUBJECT_PREFIX,
            subject,
            Utc::now().to_rfc2822(),
            render_body(ciphertext, key_id).replace('\n', "\r\n"),
        )
    }
}

fn check_header_value(field: &'static str, value: &str) -> Result<(), TransportError> {
    if value.contains(['\r', '\n']) {
        return Err(TransportError::HeaderInjection(field));
    }
    Ok(())
}

#[async_trait]
impl Transport for SpoolTransport {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        ciphertext: &str,
        key_id: &str,
    ) -> Result<(), TransportError> {
        if !self.identity.is_configured() {
            return Err(TransportError::Authentication(
                "sender identity or app credential not configured".into(),
            ));
        }
        if recipient.trim().is_empty() {
            return Err(TransportError::Network("recipient address is empty".into()));
        }
        check_header_value("sender", &self.identity.user)?;
        check_header_value("recipient", recipient)?;
        check_header_value("subject", subject)?;

        let message = self.render_message(recipient, subject, ciphertext, key_id);
        let spool_dir = self.spool_dir.clone();
        let staged = tokio::task::spawn_blocking(move || -> std::io::Result<NamedTempFile> {
            fs::create_dir_all(&spool_dir)?;
            let mut staging = NamedTempFile::new_in(&spool_dir)?;
            staging.write_all(message.as_bytes())?;
            staging.as_file().sync_all()?;
            Ok(staging)
        })
        .await
        .map_err(|e| TransportError::Network(format!("spool task: {e}")))?
        .map_err(|e| TransportError::Network(format!("spool write: {e}")))?;

        // No await past this point: a send dropped while staging leaves the
        // temp file to be removed with the task output, never a visible .eml.
        let target = self.spool_dir.join(format!("{}.eml", Uuid::new_v4()));
        staged
            .persist(&target)
            .map_err(|e| TransportError::Network(format!("spool write: {}", e.error)))?;
        info!(path = %target.display(), key_id, "packet spooled");
        Ok(())
    }
}
