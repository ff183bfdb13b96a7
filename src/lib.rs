//! Client library for the local AI daemon.
//!
//! Each capability (chat, OCR, image recognition, speech recognition, speech
//! synthesis, function calling, embedding search, model registry) is exposed as
//! a client object that forwards calls over a local message bus. Clients that
//! need one create a daemon session lazily on first use and tear it down when
//! dropped.
//!
//! ```no_run
//! use ai_daemon_client::{ChatClient, ChatHistory, ClientConfig, Params};
//!
//! let chat = ChatClient::connect(&ClientConfig::from_env());
//! let history = [ChatHistory::system("Answer briefly.")];
//! let answer = chat.chat("What is the capital of France?", &history, &Params::new())?;
//! println!("{answer}");
//! # Ok::<(), ai_daemon_client::AiError>(())
//! ```
//!
//! The crate also ships `aictl`, a command-line front end over the same clients.

pub mod bus;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod model;
pub mod params;
pub mod reply;
pub mod session;
pub mod state;
pub mod stream;

pub use capabilities::{
    ChatClient, ChatEvent, EmbeddingClient, FunctionCallingClient, ImageEvent,
    ImageRecognitionClient, ModelManager, OcrClient, RecognitionEvent, SpeechToTextClient,
    SynthesisEvent, TextToSpeechClient,
};
pub use config::ClientConfig;
pub use error::{AiError, ErrorCode, LastError};
pub use model::{ChatHistory, ChatRole, DeployType, DocumentInfo, ModelInfo, Region, SearchResult};
pub use params::Params;
pub use session::Capability;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

/// How long a stream follower blocks on the event channel per iteration.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "aictl",
    version,
    about = "Command-line client for the local AI daemon"
)]
pub struct Cli {
    /// Path to the daemon socket (defaults to /tmp/ai-daemon-$USER.sock)
    #[arg(long, global = true, env = "AI_DAEMON_SOCKET")]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a prompt to the chat model
    Chat {
        prompt: String,

        /// System message sent ahead of the prompt
        #[arg(long)]
        system: Option<String>,

        /// Print output as it is generated
        #[arg(long)]
        stream: bool,

        /// Model parameter as key=value (repeatable)
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Extract text from an image
    Ocr {
        file: PathBuf,

        /// Only read the region "x,y,width,height"
        #[arg(long)]
        region: Option<Region>,

        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Ask a question about an image file or URL
    Image {
        /// Image file (omit when using --url)
        #[arg(required_unless_present = "url")]
        file: Option<PathBuf>,

        /// Let the daemon fetch the image from this URL instead
        #[arg(long, conflicts_with = "file")]
        url: Option<String>,

        #[arg(long, default_value = "Describe this image.")]
        prompt: String,

        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Transcribe an audio file
    Stt {
        file: PathBuf,

        /// Feed the file through a recognition stream instead of one call
        #[arg(long)]
        stream: bool,

        /// Bytes per chunk when streaming
        #[arg(long, default_value_t = 3200)]
        chunk_size: usize,

        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Synthesize speech and write the audio to a file
    Tts {
        text: String,

        /// Where to write the audio
        #[arg(short, long)]
        output: PathBuf,

        /// Collect the audio from a synthesis stream
        #[arg(long)]
        stream: bool,

        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Map a prompt onto one of the functions declared in a JSON file
    Call {
        prompt: String,

        /// JSON array of function declarations
        #[arg(long)]
        functions: PathBuf,

        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Search an application's embedded documents
    Search {
        app_id: String,
        query: String,

        /// Extension parameters passed through to the daemon (JSON)
        #[arg(long, default_value = "")]
        ext: String,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// List models known to the daemon
    Models {
        /// Only models serving this capability (e.g. Chat, OCR)
        #[arg(long, conflicts_with = "provider")]
        capability: Option<Capability>,

        /// Only models of this provider
        #[arg(long)]
        provider: Option<String>,

        #[arg(long)]
        json: bool,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = ClientConfig::from_env();
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }

    match cli.command {
        Commands::Chat {
            prompt,
            system,
            stream,
            params,
        } => run_chat(&config, prompt, system, stream, &params).await,
        Commands::Ocr {
            file,
            region,
            params,
        } => run_ocr(&config, &file, region, &params),
        Commands::Image {
            file,
            url,
            prompt,
            params,
        } => run_image(&config, file.as_deref(), url.as_deref(), &prompt, &params),
        Commands::Stt {
            file,
            stream,
            chunk_size,
            params,
        } => run_stt(&config, &file, stream, chunk_size, &params),
        Commands::Tts {
            text,
            output,
            stream,
            params,
        } => run_tts(&config, &text, &output, stream, &params).await,
        Commands::Call {
            prompt,
            functions,
            params,
        } => run_call(&config, &prompt, &functions, &params),
        Commands::Search {
            app_id,
            query,
            ext,
            json,
        } => run_search(&config, &app_id, &query, &ext, json),
        Commands::Models {
            capability,
            provider,
            json,
        } => run_models(&config, capability, provider.as_deref(), json),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "aictl", &mut io::stdout());
            Ok(())
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = io::stdout();
            man.render(&mut out)?;
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("AICTL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    // A subscriber may already be installed when embedded in a larger program.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn cli_params(pairs: &[String]) -> Result<Params> {
    params::params_from_pairs(pairs).context("invalid --param")
}

/// The daemon resolves paths itself, so relative ones are anchored here.
fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolving {}", path.display()))
}

/// Run `pump` on a blocking thread until it returns; Ctrl-C calls `stop`
/// first and then waits for `pump` to wind down.
async fn follow<T, P, S>(pump: P, stop: S) -> Result<T>
where
    T: Send + 'static,
    P: FnOnce() -> Result<T> + Send + 'static,
    S: FnOnce(),
{
    let mut task = tokio::task::spawn_blocking(pump);
    tokio::select! {
        joined = &mut task => joined.context("stream follower panicked")?,
        Ok(()) = tokio::signal::ctrl_c() => {
            stop();
            (&mut task).await.context("stream follower panicked")?
        }
    }
}

async fn run_chat(
    config: &ClientConfig,
    prompt: String,
    system: Option<String>,
    stream: bool,
    pairs: &[String],
) -> Result<()> {
    let params = cli_params(pairs)?;
    let history: Vec<ChatHistory> = system.into_iter().map(ChatHistory::system).collect();
    let client = Arc::new(ChatClient::connect(config));

    if !stream {
        let answer = client.chat(&prompt, &history, &params).context("chat failed")?;
        println!("{answer}");
        return Ok(());
    }

    client
        .chat_stream(&prompt, &history, &params)
        .context("starting chat stream")?;
    let worker = Arc::clone(&client);
    let idle_limit = config.chat_timeout;
    follow(
        move || {
            let mut out = io::stdout().lock();
            let mut last_event = Instant::now();
            loop {
                match worker.wait_event(POLL_INTERVAL) {
                    Some(ChatEvent::Output(text)) => {
                        out.write_all(text.as_bytes())?;
                        out.flush()?;
                        last_event = Instant::now();
                    }
                    Some(ChatEvent::Finished { code: 0, .. }) => {
                        writeln!(out)?;
                        return Ok(());
                    }
                    Some(ChatEvent::Finished { code, message }) => {
                        writeln!(out)?;
                        bail!("chat stream failed ({code}): {message}");
                    }
                    None if !worker.is_running() => return Ok(()),
                    None if last_event.elapsed() > idle_limit => {
                        worker.terminate();
                        bail!("chat stream stalled for {}s", idle_limit.as_secs());
                    }
                    None => {}
                }
            }
        },
        || client.terminate(),
    )
    .await
}

fn run_ocr(config: &ClientConfig, file: &Path, region: Option<Region>, pairs: &[String]) -> Result<()> {
    let params = cli_params(pairs)?;
    let file = absolute(file)?;
    let client = OcrClient::connect(config);
    let text = match region {
        Some(region) => client.recognize_region_rect(&file, region, &params),
        None => client.recognize_file(&file, &params),
    }
    .with_context(|| format!("OCR of {} failed", file.display()))?;
    println!("{text}");
    Ok(())
}

fn run_image(
    config: &ClientConfig,
    file: Option<&Path>,
    url: Option<&str>,
    prompt: &str,
    pairs: &[String],
) -> Result<()> {
    let params = cli_params(pairs)?;
    let client = ImageRecognitionClient::connect(config);
    let answer = match (file, url) {
        (_, Some(url)) => client.recognize_image_url(url, prompt, &params),
        (Some(file), None) => client.recognize_image(absolute(file)?, prompt, &params),
        (None, None) => bail!("either an image file or --url is required"),
    }
    .context("image recognition failed")?;
    println!("{answer}");
    Ok(())
}

fn run_stt(
    config: &ClientConfig,
    file: &Path,
    stream: bool,
    chunk_size: usize,
    pairs: &[String],
) -> Result<()> {
    let params = cli_params(pairs)?;
    let file = absolute(file)?;
    let client = SpeechToTextClient::connect(config);

    if !stream {
        let text = client
            .recognize_file(&file, &params)
            .with_context(|| format!("transcribing {} failed", file.display()))?;
        println!("{text}");
        return Ok(());
    }

    if chunk_size == 0 {
        bail!("--chunk-size must be positive");
    }
    let audio = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
    client
        .start_stream_recognition(&params)
        .context("starting recognition stream")?;
    for chunk in audio.chunks(chunk_size) {
        if !client.send_audio_data(chunk).context("sending audio")? {
            break;
        }
        for event in client.poll_events() {
            match event {
                RecognitionEvent::PartialResult(text) => eprintln!("{}", text.dimmed()),
                RecognitionEvent::Error { code, message } => {
                    bail!("recognition failed ({code}): {message}")
                }
                RecognitionEvent::Result(_) | RecognitionEvent::Completed(_) => {}
            }
        }
    }
    let text = client
        .end_stream_recognition()
        .context("ending recognition stream")?;
    println!("{text}");
    Ok(())
}

async fn run_tts(
    config: &ClientConfig,
    text: &str,
    output: &Path,
    stream: bool,
    pairs: &[String],
) -> Result<()> {
    let params = cli_params(pairs)?;
    let client = Arc::new(TextToSpeechClient::connect(config));

    let audio = if stream {
        client
            .start_stream_synthesis(text, &params)
            .context("starting synthesis stream")?;
        let worker = Arc::clone(&client);
        let idle_limit = config.synthesis_timeout;
        follow(
            move || {
                let mut last_event = Instant::now();
                let mut tail = Vec::new();
                loop {
                    match worker.wait_event(POLL_INTERVAL) {
                        Some(SynthesisEvent::Chunk(_)) => last_event = Instant::now(),
                        Some(SynthesisEvent::Completed(audio)) => {
                            tail = audio;
                            break;
                        }
                        Some(SynthesisEvent::Error { code, message }) => {
                            if let Err(e) = worker.end_stream_synthesis() {
                                tracing::debug!(error = %e, "ending failed synthesis stream");
                            }
                            bail!("synthesis failed ({code}): {message}")
                        }
                        None if !worker.is_running() => break,
                        None if last_event.elapsed() > idle_limit => break,
                        None => {}
                    }
                }
                // Completed or stalled, the daemon still holds the stream open.
                let ended = worker
                    .end_stream_synthesis()
                    .context("ending synthesis stream")?;
                Ok([worker.accumulated(), tail, ended]
                    .into_iter()
                    .find(|audio| !audio.is_empty())
                    .unwrap_or_default())
            },
            || client.terminate(),
        )
        .await?
    } else {
        client
            .synthesize_text(text, &params)
            .context("synthesis failed")?
    };

    if audio.is_empty() {
        bail!("daemon returned no audio");
    }
    std::fs::write(output, &audio).with_context(|| format!("writing {}", output.display()))?;
    eprintln!("wrote {} bytes to {}", audio.len(), output.display());
    Ok(())
}

fn run_call(config: &ClientConfig, prompt: &str, functions: &Path, pairs: &[String]) -> Result<()> {
    let params = cli_params(pairs)?;
    let declarations = std::fs::read_to_string(functions)
        .with_context(|| format!("reading {}", functions.display()))?;
    let client = FunctionCallingClient::connect(config);
    let call = client
        .parse(prompt, &declarations, &params)
        .context("function calling failed")?;
    println!("{call}");
    Ok(())
}

fn run_search(config: &ClientConfig, app_id: &str, query: &str, ext: &str, json: bool) -> Result<()> {
    let client = EmbeddingClient::connect(config);
    let results = client.search(app_id, query, ext).context("search failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    if results.is_empty() {
        eprintln!("no results");
        return Ok(());
    }
    for hit in &results {
        println!(
            "{} {} {}",
            format!("{:.4}", hit.distance).cyan(),
            hit.id.bold(),
            format!("#{}", hit.chunk.chunk_index).dimmed()
        );
        println!("    {}", hit.chunk.content.trim());
    }
    Ok(())
}

fn run_models(
    config: &ClientConfig,
    capability: Option<Capability>,
    provider: Option<&str>,
    json: bool,
) -> Result<()> {
    let manager = ModelManager::connect(config);
    let models = match provider {
        Some(provider) => manager.models_for_provider(provider),
        None => manager.available_models(capability),
    }
    .context("querying the model registry failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }
    for model in &models {
        let status = if model.is_available {
            "available".green()
        } else {
            "unavailable".red()
        };
        println!(
            "{} {} [{}] {}",
            model.name.bold(),
            model.provider.dimmed(),
            model.capability,
            status
        );
    }
    Ok(())
}
