use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use clap::{Parser, Subcommand};
use qumail_core::transcript::KeyringKeySource;
use qumail_core::{
    cipher, paths, secure_storage, Identity, KmsClient, KmsConfig, MessagePipeline,
    PipelineConfig, ProtocolLevel, SecureTranscript, SendOutcome, SendRequest, SpoolTransport,
    SymmetricKey, TranscriptEntry,
};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

mod settings;

use crate::settings::{Settings, ENV_KMS_API_KEY};

const ENV_APP_PASSWORD: &str = "QUMAIL_APP_PASSWORD";
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const PREVIEW_CHARS: usize = 60;

#[derive(Parser, Debug)]
#[command(name = "qumail", author, version, about = "QuMail secure packet terminal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Save sender identity and store the app password in the keyring
    Configure {
        #[arg(long)]
        email: String,
        #[arg(long)]
        kms_url: Option<String>,
        #[arg(long)]
        kms_timeout: Option<u64>,
        /// Also prompt for the KMS API key
        #[arg(long)]
        kms_api_key: bool,
    },
    /// Encrypt one message with a fresh key and send it
    Send {
        #[arg(long)]
        to: String,
        #[arg(short, long, default_value = "")]
        subject: String,
        /// 1|otp, 2|aes, 3|pqc, 4|plain
        #[arg(short, long)]
        level: Option<ProtocolLevel>,
        /// Message body; read from stdin when omitted
        #[arg(short, long)]
        body: Option<String>,
    },
    /// List packets recorded in the encrypted outbox
    Outbox {
        #[arg(long)]
        json: bool,
    },
    /// Delete the encrypted outbox
    Clear,
    /// Decode a packet locally with a known key
    Decrypt {
        #[arg(short, long)]
        level: ProtocolLevel,
        /// Base64 key bytes; not needed at the plaintext level
        #[arg(short, long)]
        key: Option<String>,
        #[arg(short, long)]
        packet: String,
    },
    /// Check KMS reachability and identity configuration
    Diagnostics,
    /// Interactive terminal; the outbox is cleared when it starts
    Session {
        #[arg(short, long)]
        level: Option<ProtocolLevel>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Configure {
            email,
            kms_url,
            kms_timeout,
            kms_api_key,
        } => configure(email, kms_url, kms_timeout, kms_api_key),
        Commands::Send {
            to,
            subject,
            level,
            body,
        } => {
            let settings = load_settings()?;
            let body = match body {
                Some(body) => Zeroizing::new(body),
                None => read_stdin_body()?,
            };
            let request = SendRequest {
                recipient: to,
                subject,
                body,
                level: level.unwrap_or(settings.default_level),
            };
            let pipeline = build_pipeline(&settings)?;
            transmit(&pipeline, &request).await
        }
        Commands::Outbox { json } => print_outbox(&open_transcript()?.load_all(), json),
        Commands::Clear => {
            let transcript = open_transcript()?;
            transcript.clear().context("clear outbox")?;
            println!("outbox cleared: {}", transcript.path().display());
            Ok(())
        }
        Commands::Decrypt { level, key, packet } => decrypt_packet(level, key, &packet),
        Commands::Diagnostics => diagnostics(&load_settings()?).await,
        Commands::Session { level } => session(load_settings()?, level).await,
    }
}

fn load_settings() -> Result<Settings> {
    let path = paths::settings_path()?;
    let mut settings =
        Settings::load(&path).with_context(|| format!("load settings {}", path.display()))?;
    settings.apply_overrides(|name| std::env::var(name).ok())?;
    Ok(settings)
}

fn open_transcript() -> Result<Arc<SecureTranscript>> {
    Ok(Arc::new(SecureTranscript::new(
        paths::transcript_path()?,
        Arc::new(KeyringKeySource::for_current_user()),
    )))
}

fn kms_api_key(settings: &Settings) -> Result<Option<Zeroizing<String>>> {
    if let Some(key) = std::env::var(ENV_KMS_API_KEY).ok().filter(|k| !k.is_empty()) {
        return Ok(Some(Zeroizing::new(key)));
    }
    secure_storage::get_kms_api_key(&settings.kms.url)
}

fn load_identity(settings: &Settings) -> Identity {
    let user = settings.identity.clone().unwrap_or_default();
    let credential = if user.trim().is_empty() {
        None
    } else {
        secure_storage::get_credential(&user).unwrap_or_else(|err| {
            warn!(error = %err, "app credential unavailable");
            None
        })
    };
    Identity {
        user,
        credential: credential.unwrap_or_else(|| Zeroizing::new(String::new())),
    }
}

fn build_pipeline(settings: &Settings) -> Result<MessagePipeline> {
    let api_key = kms_api_key(settings)?.unwrap_or_else(|| {
        warn!(endpoint = %settings.kms.url, "no KMS API key configured");
        Zeroizing::new(String::new())
    });
    let kms = KmsClient::new(&KmsConfig {
        endpoint: settings.kms.url.clone(),
        api_key,
        timeout: settings.kms_timeout(),
    })?;
    let spool_dir = match &settings.spool_dir {
        Some(dir) => dir.clone(),
        None => paths::spool_dir()?,
    };
    let transport = SpoolTransport::new(spool_dir, load_identity(settings));
    let config = PipelineConfig {
        key_size: settings.kms.key_size,
        key_timeout: settings.kms_timeout(),
        transport_timeout: settings.transport_timeout(),
    };
    Ok(MessagePipeline::new(
        Arc::new(kms),
        Arc::new(transport),
        open_transcript()?,
        config,
    ))
}

/// Runs one send; Ctrl-C while it is in flight cancels it.
async fn transmit(pipeline: &MessagePipeline, request: &SendRequest) -> Result<()> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let watcher = tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => {
                let _ = cancel_tx.send(true);
                cancel_tx.closed().await;
            }
            _ = cancel_tx.closed() => {}
        }
    });
    let result = pipeline.send_with_cancel(request, cancel_rx).await;
    watcher.abort();

    match result {
        Ok(SendOutcome::Delivered(packet)) => {
            println!(
                "[PASS] TRANSMISSION COMPLETE level={} key_id={}",
                packet.level.number(),
                packet.key_id
            );
            Ok(())
        }
        Ok(SendOutcome::SentNotLogged { packet, error }) => {
            println!(
                "[PASS] TRANSMISSION COMPLETE level={} key_id={}",
                packet.level.number(),
                packet.key_id
            );
            eprintln!("[WARN] packet was sent but not recorded in the outbox: {error}");
            Ok(())
        }
        Err(err) => {
            let stage = err.stage();
            Err(anyhow::Error::new(err).context(format!("send aborted while {stage}")))
        }
    }
}

fn read_stdin_body() -> Result<Zeroizing<String>> {
    let mut body = Zeroizing::new(String::new());
    std::io::stdin()
        .read_to_string(&mut body)
        .context("read message body from stdin")?;
    while body.ends_with('\n') || body.ends_with('\r') {
        body.pop();
    }
    Ok(body)
}

fn preview(ciphertext: &str) -> String {
    if ciphertext.chars().count() <= PREVIEW_CHARS {
        return ciphertext.to_string();
    }
    let head: String = ciphertext.chars().take(PREVIEW_CHARS).collect();
    format!("{head}...")
}

fn print_outbox(entries: &[TranscriptEntry], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("outbox is empty");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  to={}  key_id={}  subject={}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.recipient,
            entry.key_id,
            entry.subject
        );
        println!("    {}", preview(&entry.ciphertext));
    }
    Ok(())
}

fn decrypt_packet(level: ProtocolLevel, key: Option<String>, packet: &str) -> Result<()> {
    let bytes = match key {
        Some(encoded) => general_purpose::STANDARD
            .decode(encoded.trim())
            .context("key is not valid base64")?,
        None if !level.uses_key() => Vec::new(),
        None => return Err(anyhow!("--key is required at level {}", level.number())),
    };
    let key = SymmetricKey::new("LOCAL", bytes);
    let text = Zeroizing::new(
        cipher::decode(level, packet.trim(), &key).context("DECRYPTION_FAILED")?,
    );
    println!("{}", text.as_str());
    Ok(())
}

async fn diagnostics(settings: &Settings) -> Result<()> {
    println!(">>> DIAGNOSTIC SEQUENCE");
    let probe = KmsClient::new(&KmsConfig {
        endpoint: settings.kms.url.clone(),
        api_key: Zeroizing::new(String::new()),
        timeout: PROBE_TIMEOUT,
    })?;
    match probe.probe().await {
        Ok(status) => println!("[PASS] KMS NODE: online ({status})"),
        Err(err) => println!("[FAIL] KMS NODE: offline ({err})"),
    }
    match kms_api_key(settings) {
        Ok(Some(_)) => println!("[PASS] KMS API KEY: configured"),
        Ok(None) => println!("[FAIL] KMS API KEY: missing"),
        Err(err) => println!("[FAIL] KMS API KEY: {err}"),
    }
    let identity = load_identity(settings);
    if identity.is_configured() {
        println!("[PASS] IDENTITY: {}", identity.user);
    } else if identity.user.trim().is_empty() {
        println!("[FAIL] IDENTITY: missing");
    } else {
        println!("[FAIL] IDENTITY: no app password for {}", identity.user);
    }
    let entries = open_transcript()?.load_all();
    println!("[INFO] OUTBOX: {} recorded packet(s)", entries.len());
    println!("DIAGNOSTICS COMPLETE");
    Ok(())
}

fn configure(
    email: String,
    kms_url: Option<String>,
    kms_timeout: Option<u64>,
    set_api_key: bool,
) -> Result<()> {
    let email = email.trim().to_string();
    if !email.contains('@') {
        return Err(anyhow!("not an email address: {email}"));
    }
    let path = paths::settings_path()?;
    let mut settings = Settings::load(&path)?;
    settings.identity = Some(email.clone());
    if let Some(url) = kms_url {
        settings.kms.url = url;
    }
    if let Some(secs) = kms_timeout {
        if secs == 0 {
            return Err(anyhow!("--kms-timeout must be at least 1 second"));
        }
        settings.kms.timeout_secs = secs;
    }

    let password = prompt_secret(ENV_APP_PASSWORD, "App password: ")?;
    secure_storage::store_credential(&email, &password)?;
    if set_api_key {
        let api_key = prompt_secret(ENV_KMS_API_KEY, "KMS API key: ")?;
        secure_storage::store_kms_api_key(&settings.kms.url, &api_key)?;
    }
    settings.save(&path)?;
    info!(identity = %email, "identity configured");
    println!("settings saved to {}", path.display());
    Ok(())
}

fn prompt_secret(env_var: &str, prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(value) = std::env::var(env_var) {
        if !value.is_empty() {
            return Ok(Zeroizing::new(value));
        }
    }
    let value = Zeroizing::new(
        rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?,
    );
    if value.trim().is_empty() {
        return Err(anyhow!("empty value not accepted"));
    }
    Ok(value)
}

type InputLines = Lines<BufReader<Stdin>>;

async fn session(settings: Settings, level: Option<ProtocolLevel>) -> Result<()> {
    let pipeline = build_pipeline(&settings)?;
    pipeline
        .transcript()
        .clear()
        .context("clear outbox at session start")?;
    info!("session started with an empty outbox");

    let mut level = level.unwrap_or(settings.default_level);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("QuMail secure terminal. Type 'help' for commands.");
    loop {
        prompt(&format!("qumail[{}]> ", level.number())).await?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let mut parts = line.trim().splitn(2, char::is_whitespace);
        let command = parts.next().unwrap_or_default();
        let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());
        match (command, arg) {
            ("", _) => continue,
            ("quit" | "exit", _) => break,
            ("help", _) => print_session_help(),
            ("outbox", _) => print_outbox(&pipeline.transcript().load_all(), false)?,
            ("level", None) => println!("level {} ({level})", level.number()),
            ("level", Some(arg)) => match arg.parse::<ProtocolLevel>() {
                Ok(next) => {
                    level = next;
                    println!("level set to {} ({level})", level.number());
                }
                Err(err) => println!("{err}"),
            },
            ("send", _) => {
                let Some(request) = read_message(&mut lines, level).await? else {
                    break;
                };
                if let Err(err) = transmit(&pipeline, &request).await {
                    println!("[FAIL] {err:#}");
                }
            }
            (other, _) => println!("unknown command '{other}'; type 'help'"),
        }
    }
    println!("session closed");
    Ok(())
}

fn print_session_help() {
    println!("  send           compose and send a message");
    println!("  level [1-4]    show or set the protocol level");
    println!("  outbox         list packets sent this session");
    println!("  quit           leave the terminal");
}

async fn prompt(text: &str) -> Result<()> {
    let mut out = tokio::io::stdout();
    out.write_all(text.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

async fn ask(lines: &mut InputLines, question: &str) -> Result<Option<String>> {
    prompt(question).await?;
    Ok(lines.next_line().await?.map(|l| l.trim().to_string()))
}

/// Returns `None` if stdin closes mid-message.
async fn read_message(lines: &mut InputLines, level: ProtocolLevel) -> Result<Option<SendRequest>> {
    let Some(recipient) = ask(lines, "to: ").await? else {
        return Ok(None);
    };
    let Some(subject) = ask(lines, "subject: ").await? else {
        return Ok(None);
    };
    println!("body, end with a line containing only '.':");
    let mut body = Zeroizing::new(String::new());
    loop {
        let Some(line) = lines.next_line().await? else {
            return Ok(None);
        };
        let line = Zeroizing::new(line);
        if line.as_str() == "." {
            break;
        }
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(&line);
    }
    Ok(Some(SendRequest {
        recipient,
        subject,
        body,
        level,
    }))
}
