use async_trait::async_trait;
use parking_lot::Mutex;
use qumail_core::cipher;
use qumail_core::kms_client::{KeyProvider, KmsError};
use qumail_core::pipeline::{
    MessagePipeline, PipelineConfig, PipelineError, PipelineStage, SendOutcome, SendRequest,
};
use qumail_core::transcript::{EphemeralKeySource, SecureTranscript};
use qumail_core::transport::{Identity, SpoolTransport, Transport, TransportError};
use qumail_core::{ProtocolLevel, SymmetricKey};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::watch;
use zeroize::Zeroizing;

enum KeyBehaviour {
    Issue(usize),
    Reject,
    Hang,
}

struct FakeKms {
    behaviour: KeyBehaviour,
    calls: AtomicUsize,
}

impl FakeKms {
    fn new(behaviour: KeyBehaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyProvider for FakeKms {
    async fn fetch_key(&self, _size_bytes: usize) -> Result<SymmetricKey, KmsError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.behaviour {
            KeyBehaviour::Issue(len) => Ok(SymmetricKey::new(format!("K{n}"), vec![0u8; len])),
            KeyBehaviour::Reject => Err(KmsError::Rejected(reqwest::StatusCode::FORBIDDEN)),
            KeyBehaviour::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

enum SendBehaviour {
    Accept,
    Refuse,
    Hang,
}

struct FakeTransport {
    behaviour: SendBehaviour,
    sent: Mutex<Vec<(String, String, String, String)>>,
}

impl FakeTransport {
    fn new(behaviour: SendBehaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<(String, String, String, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        ciphertext: &str,
        key_id: &str,
    ) -> Result<(), TransportError> {
        match self.behaviour {
            SendBehaviour::Accept => {
                self.sent.lock().push((
                    recipient.to_string(),
                    subject.to_string(),
                    ciphertext.to_string(),
                    key_id.to_string(),
                ));
                Ok(())
            }
            SendBehaviour::Refuse => Err(TransportError::Authentication("bad app password".into())),
            SendBehaviour::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

fn transcript_at(path: &Path) -> Arc<SecureTranscript> {
    Arc::new(SecureTranscript::new(path, Arc::new(EphemeralKeySource::new())))
}

fn config() -> PipelineConfig {
    PipelineConfig {
        key_size: 32,
        key_timeout: Duration::from_millis(200),
        transport_timeout: Duration::from_millis(200),
    }
}

fn request(level: ProtocolLevel) -> SendRequest {
    SendRequest {
        recipient: "you@example.com".into(),
        subject: "status".into(),
        body: Zeroizing::new("HELLO".into()),
        level,
    }
}

#[tokio::test]
async fn delivered_packet_is_sent_then_logged() {
    let dir = tempdir().unwrap();
    let kms = FakeKms::new(KeyBehaviour::Issue(32));
    let transport = FakeTransport::new(SendBehaviour::Accept);
    let transcript = transcript_at(&dir.path().join("outbox.dat"));
    let pipeline = MessagePipeline::new(kms.clone(), transport.clone(), transcript.clone(), config());

    let outcome = pipeline.send(&request(ProtocolLevel::PqcHybrid)).await.unwrap();
    let packet = match outcome {
        SendOutcome::Delivered(packet) => packet,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(packet.level, ProtocolLevel::PqcHybrid);
    assert_eq!(packet.key_id, "K1");
    assert!(packet.ciphertext.starts_with("PQC_v1."));

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].2, packet.ciphertext);
    assert_eq!(sent[0].3, "K1");

    let entries = transcript.load_all();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].recipient, "you@example.com");
    assert_eq!(entries[0].subject, "status");
    assert_eq!(entries[0].ciphertext, packet.ciphertext);
    assert_eq!(entries[0].key_id, "K1");
    assert!(!entries[0].ciphertext.contains("HELLO"));

    let same_key = SymmetricKey::new("K1", vec![0u8; 32]);
    assert_eq!(
        cipher::decode(ProtocolLevel::PqcHybrid, &entries[0].ciphertext, &same_key).unwrap(),
        "HELLO"
    );
}

#[tokio::test]
async fn every_send_uses_a_fresh_key() {
    let dir = tempdir().unwrap();
    let kms = FakeKms::new(KeyBehaviour::Issue(32));
    let transport = FakeTransport::new(SendBehaviour::Accept);
    let transcript = transcript_at(&dir.path().join("outbox.dat"));
    let pipeline = MessagePipeline::new(kms.clone(), transport, transcript.clone(), config());

    pipeline.send(&request(ProtocolLevel::Otp)).await.unwrap();
    pipeline.send(&request(ProtocolLevel::Plaintext)).await.unwrap();

    assert_eq!(kms.calls(), 2);
    let ids: Vec<String> = transcript.load_all().into_iter().map(|e| e.key_id).collect();
    assert_eq!(ids, vec!["K1".to_string(), "K2".to_string()]);
}

#[tokio::test]
async fn kms_rejection_aborts_before_transport() {
    let dir = tempdir().unwrap();
    let kms = FakeKms::new(KeyBehaviour::Reject);
    let transport = FakeTransport::new(SendBehaviour::Accept);
    let transcript = transcript_at(&dir.path().join("outbox.dat"));
    let pipeline = MessagePipeline::new(kms, transport.clone(), transcript.clone(), config());

    let err = pipeline.send(&request(ProtocolLevel::Aes)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Kms(KmsError::Rejected(_))));
    assert_eq!(err.stage(), PipelineStage::AcquiringKey);
    assert!(transport.sent().is_empty());
    assert!(transcript.load_all().is_empty());
}

#[tokio::test]
async fn unusable_key_aborts_while_encrypting() {
    let dir = tempdir().unwrap();
    let kms = FakeKms::new(KeyBehaviour::Issue(20));
    let transport = FakeTransport::new(SendBehaviour::Accept);
    let transcript = transcript_at(&dir.path().join("outbox.dat"));
    let pipeline = MessagePipeline::new(kms, transport.clone(), transcript.clone(), config());

    let err = pipeline.send(&request(ProtocolLevel::Aes)).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Cipher(cipher::CipherError::InvalidKeyLength(20))
    ));
    assert_eq!(err.stage(), PipelineStage::Encrypting);
    assert!(transport.sent().is_empty());
    assert!(transcript.load_all().is_empty());
}

#[tokio::test]
async fn transport_failure_leaves_no_transcript_entry() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.dat");
    let kms = FakeKms::new(KeyBehaviour::Issue(32));
    let transport = FakeTransport::new(SendBehaviour::Refuse);
    let transcript = transcript_at(&path);
    let pipeline = MessagePipeline::new(kms, transport, transcript.clone(), config());

    let err = pipeline.send(&request(ProtocolLevel::Aes)).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Transport(TransportError::Authentication(_))
    ));
    assert!(!path.exists());
    assert!(transcript.load_all().is_empty());
}

#[tokio::test]
async fn slow_transport_times_out() {
    let dir = tempdir().unwrap();
    let kms = FakeKms::new(KeyBehaviour::Issue(32));
    let transport = FakeTransport::new(SendBehaviour::Hang);
    let transcript = transcript_at(&dir.path().join("outbox.dat"));
    let pipeline = MessagePipeline::new(kms, transport, transcript.clone(), config());

    let err = pipeline.send(&request(ProtocolLevel::Otp)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Transport(TransportError::Timeout)));
    assert!(transcript.load_all().is_empty());
}

#[tokio::test]
async fn slow_kms_times_out_as_unreachable() {
    let dir = tempdir().unwrap();
    let kms = FakeKms::new(KeyBehaviour::Hang);
    let transport = FakeTransport::new(SendBehaviour::Accept);
    let transcript = transcript_at(&dir.path().join("outbox.dat"));
    let pipeline = MessagePipeline::new(kms, transport.clone(), transcript, config());

    let err = pipeline.send(&request(ProtocolLevel::Otp)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Kms(KmsError::Unreachable(_))));
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn append_failure_is_reported_as_sent_not_logged() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.dat");
    std::fs::create_dir_all(path.join("blocker")).unwrap();
    let kms = FakeKms::new(KeyBehaviour::Issue(32));
    let transport = FakeTransport::new(SendBehaviour::Accept);
    let pipeline = MessagePipeline::new(kms, transport.clone(), transcript_at(&path), config());

    let outcome = pipeline.send(&request(ProtocolLevel::Aes)).await.unwrap();
    match outcome {
        SendOutcome::SentNotLogged { packet, .. } => {
            assert_eq!(transport.sent()[0].2, packet.ciphertext);
        }
        other => panic!("expected SentNotLogged, got {other:?}"),
    }
}

#[tokio::test]
async fn cancel_while_waiting_for_key() {
    let dir = tempdir().unwrap();
    let kms = FakeKms::new(KeyBehaviour::Hang);
    let transport = FakeTransport::new(SendBehaviour::Accept);
    let transcript = transcript_at(&dir.path().join("outbox.dat"));
    let mut config = config();
    config.key_timeout = Duration::from_secs(30);
    let pipeline = MessagePipeline::new(kms, transport.clone(), transcript.clone(), config);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_tx.send(true).ok();
        // Keep the sender alive until the pipeline has observed the flag.
        tokio::time::sleep(Duration::from_millis(200)).await;
    });
    let err = pipeline
        .send_with_cancel(&request(ProtocolLevel::Aes), cancel_rx)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled(PipelineStage::AcquiringKey)));
    assert!(transport.sent().is_empty());
    assert!(transcript.load_all().is_empty());
}

#[tokio::test]
async fn cancel_while_transmitting_writes_nothing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.dat");
    let kms = FakeKms::new(KeyBehaviour::Issue(32));
    let transport = FakeTransport::new(SendBehaviour::Hang);
    let mut config = config();
    config.transport_timeout = Duration::from_secs(30);
    let pipeline = MessagePipeline::new(kms, transport, transcript_at(&path), config);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_tx.send(true).ok();
        tokio::time::sleep(Duration::from_millis(200)).await;
    });
    let err = pipeline
        .send_with_cancel(&request(ProtocolLevel::Otp), cancel_rx)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled(PipelineStage::Transmitting)));
    assert!(!path.exists());
}

#[tokio::test]
async fn already_cancelled_send_never_fetches_a_key() {
    let dir = tempdir().unwrap();
    let kms = FakeKms::new(KeyBehaviour::Issue(32));
    let transport = FakeTransport::new(SendBehaviour::Accept);
    let pipeline = MessagePipeline::new(
        kms.clone(),
        transport,
        transcript_at(&dir.path().join("outbox.dat")),
        config(),
    );

    let (_cancel_tx, cancel_rx) = watch::channel(true);
    let err = pipeline
        .send_with_cancel(&request(ProtocolLevel::Otp), cancel_rx)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled(PipelineStage::AcquiringKey)));
    assert_eq!(kms.calls(), 0);
}

#[test]
fn timed_out_spool_write_never_lands() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let dir = tempdir().unwrap();
    let spool = dir.path().join("outgoing");
    let transport = Arc::new(SpoolTransport::new(
        &spool,
        Identity {
            user: "me@example.com".into(),
            credential: Zeroizing::new("app-password".into()),
        },
    ));
    let transcript = transcript_at(&dir.path().join("outbox.dat"));
    let mut config = config();
    config.transport_timeout = Duration::from_millis(100);
    let pipeline = MessagePipeline::new(
        FakeKms::new(KeyBehaviour::Issue(32)),
        transport,
        transcript.clone(),
        config,
    );

    let result = rt.block_on(async {
        // Hold the only blocking thread so the spool write queues behind it.
        let busy = tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_millis(500)));
        let result = pipeline.send(&request(ProtocolLevel::Aes)).await;
        busy.await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        result
    });

    let err = result.unwrap_err();
    assert!(matches!(err, PipelineError::Transport(TransportError::Timeout)));
    assert!(transcript.load_all().is_empty());
    let spooled = std::fs::read_dir(&spool)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "eml"))
                .count()
        })
        .unwrap_or(0);
    assert_eq!(spooled, 0);
}
