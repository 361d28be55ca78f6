//! ss: SecureSend command-line client
//!
//! Commands:
//!   pin new|check|words|from-words  - generate, validate and spell PINs
//!   seal / open                     - encrypted clipboard envelope
//!   qr split / qr join              - multi-frame QR payload codec
//!   token verify <token>            - check a passkey contact token
//!   fingerprint <hex>               - display fingerprint of a key or public id
//!   send / receive                  - PIN transfer over the NATS relay

use anyhow::{Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ss_core::config::SecureSendConfig;
use ss_core::{now_millis, ContentType, TransferMetadata, TransportMethod};
use ss_crypto::{generate_pin, open_envelope, pin_to_words, seal_envelope, words_to_pin, KdfParams, Pin};
use ss_passkey::{fingerprint, verify_contact_token};
use ss_qr::{split_frames, CollectStatus, FrameCollector};
use ss_signal::nats::NatsRelay;
use ss_signal::{LoopbackNetwork, RelayOptions, RelayTransport};
use ss_storage::{BucketCredentials, OperatorBlobStore};
use ss_transfer::{Outgoing, Received, Session, SessionConfig, TransferSecret};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "ss",
    version,
    about = "SecureSend client",
    long_about = "ss: PIN transfers, clipboard envelopes, QR frames and contact tokens for SecureSend"
)]
struct Cli {
    /// Path to securesend.toml configuration file
    #[arg(long, short = 'c', env = "SS_CONFIG", default_value = "securesend.toml")]
    config: PathBuf,

    /// Log level or filter directive (logs go to stderr)
    #[arg(long, env = "SS_LOG", default_value = "warn")]
    log: String,

    /// Log output format
    #[arg(long, env = "SS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// PIN generation and validation
    Pin {
        #[command(subcommand)]
        action: PinAction,
    },

    /// Encrypt text into a clipboard envelope (base64 on stdout)
    Seal {
        /// PIN to seal under (prompted when omitted)
        #[arg(long, env = "SS_PIN", hide_env_values = true)]
        pin: Option<String>,
        /// Read the text from a file instead of stdin
        #[arg(long, short = 'f')]
        file: Option<PathBuf>,
    },

    /// Decrypt a clipboard envelope
    Open {
        /// Base64 envelope (read from stdin when omitted)
        envelope: Option<String>,
        /// PIN the envelope was sealed under (prompted when omitted)
        #[arg(long, env = "SS_PIN", hide_env_values = true)]
        pin: Option<String>,
    },

    /// Multi-frame QR payload codec
    Qr {
        #[command(subcommand)]
        action: QrAction,
    },

    /// Passkey contact tokens
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Print the fingerprint of a hex-encoded public key or public id
    Fingerprint {
        hex: String,
    },

    /// Send text (stdin) or a file to whoever enters the printed PIN
    ///
    /// Signaling goes over the configured NATS relay; the encrypted payload
    /// travels through the fallback bucket. Credentials are read from
    /// AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY.
    Send {
        /// File to send (text from stdin when omitted)
        #[arg(long, short = 'f')]
        file: Option<PathBuf>,
        /// Relay PIN to use instead of a generated one
        #[arg(long, env = "SS_PIN", hide_env_values = true)]
        pin: Option<String>,
    },

    /// Receive a transfer announced under a relay PIN
    Receive {
        /// Relay PIN from the sender (prompted when omitted)
        #[arg(long, env = "SS_PIN", hide_env_values = true)]
        pin: Option<String>,
        /// Where to write the payload (text goes to stdout, files keep their name)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum PinAction {
    /// Generate a fresh PIN
    New {
        /// Transport the PIN selects: relay, cloud or manual
        #[arg(long, short = 'm', default_value = "relay")]
        method: TransportMethod,
        /// Also print the PIN as words
        #[arg(long)]
        words: bool,
    },
    /// Validate a PIN and report the transport it selects
    Check { pin: String },
    /// Spell a PIN as words for reading aloud
    Words { pin: String },
    /// Recover a PIN from its spoken words
    #[command(name = "from-words")]
    FromWords {
        #[arg(required = true, num_args = 1..)]
        words: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum QrAction {
    /// Split text into QR frames, one per line
    Split {
        /// Input file (stdin when omitted)
        input: Option<PathBuf>,
        /// Characters per frame (overrides config)
        #[arg(long)]
        capacity: Option<usize>,
    },
    /// Reassemble frames (one per line, any order) into the original text
    Join {
        /// Input file (stdin when omitted)
        input: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum TokenAction {
    /// Verify a contact token and print who it vouches for
    Verify {
        /// Token text; a trailing comment may span several arguments
        #[arg(required = true, num_args = 1..)]
        token: Vec<String>,
    },
}

/// What a clipboard envelope carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ClipboardPayload {
    text: String,
    created_at: u64,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log, cli.log_format);
    let config = SecureSendConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;
    let kdf = KdfParams::from(&config.kdf);

    match cli.command {
        Commands::Pin { action } => cmd_pin(action),
        Commands::Seal { pin, file } => {
            let text = read_input(file.as_deref())?;
            let secret = pin_secret(pin)?;
            let sealed = tokio::task::spawn_blocking(move || seal_text(&secret, text, &kdf))
                .await
                .context("seal task panicked")??;
            println!("{sealed}");
            Ok(())
        }
        Commands::Open { envelope, pin } => {
            let envelope = match envelope {
                Some(text) => text,
                None => read_input(None)?,
            };
            let secret = pin_secret(pin)?;
            let payload = tokio::task::spawn_blocking(move || open_text(&secret, &envelope, &kdf))
                .await
                .context("open task panicked")??;
            tracing::debug!(created_at = payload.created_at, "envelope opened");
            print!("{}", payload.text);
            Ok(())
        }
        Commands::Qr {
            action: QrAction::Split { input, capacity },
        } => {
            let text = read_input(input.as_deref())?;
            let capacity = capacity.unwrap_or(config.qr.frame_capacity);
            for frame in qr_split(text.trim_end_matches(['\r', '\n']), capacity) {
                println!("{frame}");
            }
            Ok(())
        }
        Commands::Qr {
            action: QrAction::Join { input },
        } => {
            let text = read_input(input.as_deref())?;
            println!("{}", qr_join(&text)?);
            Ok(())
        }
        Commands::Token {
            action: TokenAction::Verify { token },
        } => cmd_token_verify(&token.join(" ")),
        Commands::Fingerprint { hex } => {
            let bytes = hex::decode(hex.trim()).context("fingerprint input must be hex")?;
            println!("{}", fingerprint(&bytes));
            Ok(())
        }
        Commands::Send { file, pin } => cmd_send(&config, file.as_deref(), pin).await,
        Commands::Receive { pin, output } => cmd_receive(&config, pin, output).await,
    }
}

// ── Logging ───────────────────────────────────────────────────────────────────

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── pin ───────────────────────────────────────────────────────────────────────

fn cmd_pin(action: PinAction) -> Result<()> {
    match action {
        PinAction::New { method, words } => {
            let pin = generate_pin(method);
            println!("{}", pin.expose());
            if words {
                println!("{}", pin_to_words(&pin));
            }
        }
        PinAction::Check { pin } => {
            let pin = Pin::parse(pin.trim()).context("invalid PIN")?;
            println!("valid ({} transport)", pin.method());
        }
        PinAction::Words { pin } => {
            let pin = Pin::parse(pin.trim()).context("invalid PIN")?;
            println!("{}", pin_to_words(&pin));
        }
        PinAction::FromWords { words } => {
            let pin = words_to_pin(&words.join(" ")).context("words do not spell a valid PIN")?;
            println!("{}", pin.expose());
        }
    }
    Ok(())
}

// ── seal / open ───────────────────────────────────────────────────────────────

/// Take the PIN from the command line or prompt for it, then validate it.
fn read_pin(given: Option<String>) -> Result<Pin> {
    let text = match given {
        Some(text) => text,
        None => rpassword::prompt_password("PIN: ").context("reading PIN from terminal")?,
    };
    Pin::parse(text.trim()).context("invalid PIN")
}

fn pin_secret(given: Option<String>) -> Result<SecretString> {
    let pin = read_pin(given)?;
    Ok(SecretString::from(pin.expose().to_string()))
}

fn seal_text(secret: &SecretString, text: String, kdf: &KdfParams) -> Result<String> {
    let payload = ClipboardPayload {
        text,
        created_at: now_millis(),
    };
    let sealed = seal_envelope(secret, &payload, kdf).context("sealing envelope")?;
    Ok(B64.encode(sealed))
}

fn open_text(secret: &SecretString, envelope: &str, kdf: &KdfParams) -> Result<ClipboardPayload> {
    let compact: String = envelope.split_whitespace().collect();
    let bytes = B64
        .decode(compact.as_bytes())
        .context("envelope is not base64")?;
    open_envelope(secret, &bytes, kdf).context("opening envelope")
}

// ── qr ────────────────────────────────────────────────────────────────────────

fn qr_split(text: &str, capacity: usize) -> Vec<String> {
    split_frames(text, capacity.max(1))
        .iter()
        .map(|frame| frame.to_text())
        .collect()
}

fn qr_join(lines: &str) -> Result<String> {
    let mut collector = FrameCollector::new();
    let mut last = None;
    for line in lines.lines().filter(|l| !l.trim().is_empty()) {
        match collector
            .accept_text(line)
            .with_context(|| format!("rejected frame: {line}"))?
        {
            CollectStatus::Complete(payload) => return Ok(payload),
            CollectStatus::Pending { received, total } => last = Some((received, total)),
        }
    }
    match last {
        Some((received, total)) => anyhow::bail!("incomplete: {received} of {total} frames"),
        None => anyhow::bail!("no frames in input"),
    }
}

// ── token ─────────────────────────────────────────────────────────────────────

fn cmd_token_verify(token: &str) -> Result<()> {
    let contact = verify_contact_token(token.trim()).context("contact token rejected")?;
    println!("fingerprint: {}", contact.fingerprint);
    println!("public id:   {}", hex::encode(contact.sub));
    println!("issued at:   {}", contact.iat);
    if let Some(comment) = &contact.comment {
        println!("comment:     {comment}");
    }
    Ok(())
}

// ── send / receive ────────────────────────────────────────────────────────────

fn relay_pin(pin: Pin) -> Result<Pin> {
    anyhow::ensure!(
        pin.method() == TransportMethod::Relay,
        "this PIN selects the {} transport; only relay PINs work here",
        pin.method()
    );
    Ok(pin)
}

/// NATS signaling with every payload routed through the fallback bucket,
/// since a terminal has no direct data channel to offer.
async fn relay_transport(config: &SecureSendConfig, pin: &Pin) -> Result<RelayTransport<NatsRelay>> {
    let credentials = BucketCredentials::from_env()?;
    let blobs =
        OperatorBlobStore::from_config(&config.storage, &credentials).context("opening the fallback bucket")?;

    let relay = NatsRelay::connect(&config.relay.nats_url)
        .await
        .context("connecting to the signaling relay")?;
    let options = RelayOptions {
        force_fallback: true,
        ..RelayOptions::from_config(config)
    };
    let secret = SecretString::from(pin.expose().to_string());
    let transport = RelayTransport::connect(relay, Box::new(LoopbackNetwork::blocked().peer()), &secret, options)
        .await
        .context("joining the relay topic")?;
    Ok(transport.with_blob_store(Arc::new(blobs)))
}

/// A session that Ctrl-C cancels.
fn interruptible_session(config: &SecureSendConfig) -> Session {
    let session = Session::new(SessionConfig::from_config(config));
    let token = session.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    session
}

fn outgoing(file: Option<&Path>) -> Result<Outgoing> {
    let Some(path) = file else {
        return Ok(Outgoing::Text(read_input(None)?));
    };
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?
        .to_string();
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Outgoing::File {
        name,
        mime_type: None,
        data,
    })
}

async fn cmd_send(config: &SecureSendConfig, file: Option<&Path>, pin: Option<String>) -> Result<()> {
    let payload = outgoing(file)?;
    let pin = match pin {
        Some(text) => relay_pin(Pin::parse(text.trim()).context("invalid PIN")?)?,
        None => generate_pin(TransportMethod::Relay),
    }
    .with_ttl(config.transfer.pin_ttl());
    let mut transport = relay_transport(config, &pin).await?;

    println!("PIN: {}", pin.expose());
    println!("     {}", pin_to_words(&pin));
    let session = interruptible_session(config);
    session
        .send(&mut transport, &TransferSecret::Pin(pin), payload)
        .await
        .context("send failed")?;
    eprintln!("delivered");
    Ok(())
}

async fn cmd_receive(config: &SecureSendConfig, pin: Option<String>, output: Option<PathBuf>) -> Result<()> {
    let pin = relay_pin(read_pin(pin)?)?;
    let mut transport = relay_transport(config, &pin).await?;
    let session = interruptible_session(config);
    let received = session
        .receive(&mut transport, &TransferSecret::Pin(pin))
        .await
        .context("receive failed")?;
    deliver(&received, output)
}

/// Where a received payload lands; `None` means stdout.
fn output_path(metadata: &TransferMetadata, output: Option<PathBuf>) -> Option<PathBuf> {
    match (metadata.content_type, output) {
        (_, Some(path)) => Some(path),
        (ContentType::Text, None) => None,
        // never let the sender pick a directory
        (ContentType::File, None) => Some(PathBuf::from(
            metadata
                .file_name
                .as_deref()
                .and_then(|name| Path::new(name).file_name())
                .unwrap_or_else(|| "received.bin".as_ref()),
        )),
    }
}

fn deliver(received: &Received, output: Option<PathBuf>) -> Result<()> {
    match output_path(&received.metadata, output) {
        Some(path) => {
            std::fs::write(&path, &received.data[..]).with_context(|| format!("writing {}", path.display()))?;
            eprintln!("saved {} bytes to {}", received.data.len(), path.display());
        }
        None => print!("{}", received.text()?),
    }
    Ok(())
}

// ── helpers ───────────────────────────────────────────────────────────────────

fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
        }
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("reading stdin")?;
            Ok(text)
        }
    }
}
