use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use salesboss::audio::{CpalHost, LevelFrame, MeterSource};
use salesboss::chat::ChatClient;
use salesboss::effects::{SessionConfig, SessionEffectRunner};
use salesboss::live::{get_api_key, GeminiConnector};
use salesboss::metrics::MetricsCollector;
use salesboss::persona::WELCOME_MESSAGE;
use salesboss::settings::{default_settings_path, load_settings, save_settings, AppSettings};
use salesboss::state_machine::Event;
use salesboss::tools::{ProductDisplay, ProductRecommendation};
use salesboss::{CallController, CallStatus, Frontend, UiState};

/// Errors listed by `/status`
const RECENT_ERRORS_SHOWN: usize = 3;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Settings file (defaults to the user config directory).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Debug logging (overridden by RUST_LOG).
    #[arg(short, long)]
    verbose: bool,

    /// Show microphone and speaker levels during calls.
    #[arg(long)]
    meter: bool,

    /// Write the effective settings to the config file and exit.
    #[arg(long)]
    write_config: bool,
}

/// Prints call state and product cards to the terminal
#[derive(Default)]
struct TerminalFrontend {
    last: Mutex<Option<UiState>>,
}

impl TerminalFrontend {
    fn last_state(&self) -> Option<UiState> {
        self.last.lock().ok().and_then(|s| s.clone())
    }

    fn print_levels(&self, frame: &LevelFrame) {
        let width = (frame.level().clamp(0.0, 1.0) * 20.0).round() as usize;
        let label = match frame.source {
            MeterSource::Microphone => "mic",
            MeterSource::Speaker => "spk",
        };
        eprint!("\r{} [{:<20}]", label, "#".repeat(width));
        let _ = std::io::stderr().flush();
    }
}

impl Frontend for TerminalFrontend {
    fn emit_ui(&self, ui: &UiState) {
        let changed = self
            .last
            .lock()
            .map(|mut last| {
                let changed = last.as_ref() != Some(ui);
                *last = Some(ui.clone());
                changed
            })
            .unwrap_or(true);
        if !changed {
            return;
        }

        match (ui.status, &ui.error) {
            (CallStatus::Idle, _) => println!("[idle] type /call to talk to Sales Boss"),
            (CallStatus::Connecting, _) => println!("[connecting...]"),
            (CallStatus::Active, _) if ui.muted => println!("[on call, muted] /mute to unmute, /end to hang up"),
            (CallStatus::Active, _) => println!("[on call] /mute, /end"),
            (CallStatus::Error, Some(message)) => println!("[error] {}", message),
            (CallStatus::Error, None) => println!("[error]"),
        }
    }
}

impl ProductDisplay for TerminalFrontend {
    fn show_product(&self, product: &ProductRecommendation) -> String {
        println!();
        println!("  +-- {} ---", product.name);
        println!("  | {}  ({:.1} stars)", product.price, product.rating);
        println!("  | {}", product.description);
        println!("  | {}", product.image_url);
        println!("  +--");
        "Product displayed to user.".to_string()
    }
}

fn print_status(frontend: &TerminalFrontend, metrics: &Mutex<MetricsCollector>) {
    match frontend.last_state() {
        Some(ui) => println!(
            "status: {:?}, muted: {}, controls: {:?}",
            ui.status, ui.muted, ui.controls
        ),
        None => println!("status: unknown"),
    }

    let Ok(metrics) = metrics.lock() else {
        return;
    };
    let summary = metrics.get_summary();
    println!(
        "calls: {} ({} ok, {} failed), avg connect {}ms",
        summary.total_calls, summary.successful_calls, summary.failed_calls, summary.avg_connect_ms
    );
    for error in metrics.get_errors().iter().take(RECENT_ERRORS_SHOWN) {
        let when = chrono::DateTime::from_timestamp(error.timestamp as i64, 0)
            .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "?".to_string());
        println!("  {} {}: {}", when, error.error_type, error.message);
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    let settings_path = match args.config.clone().map(Ok).unwrap_or_else(default_settings_path) {
        Ok(path) => path,
        Err(e) => {
            log::warn!("{}; using defaults", e);
            PathBuf::from("settings.json")
        }
    };
    let mut settings: AppSettings = load_settings(&settings_path);
    if args.meter {
        settings.meter_enabled = true;
    }

    if args.write_config {
        match save_settings(&settings_path, &settings) {
            Ok(()) => println!("Wrote {}", settings_path.display()),
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let frontend = Arc::new(TerminalFrontend::default());
    let metrics = Arc::new(Mutex::new(MetricsCollector::new()));

    let connector = GeminiConnector::from_env();
    if !connector.has_api_key() {
        log::warn!("GEMINI_API_KEY is not set; calls and chat will fail");
    }

    let config = SessionConfig::from_settings(&settings);
    let host = Arc::new(CpalHost::new());
    let runner = if settings.meter_enabled {
        let meter_frontend = frontend.clone();
        SessionEffectRunner::with_meter(
            host,
            Arc::new(connector),
            frontend.clone(),
            config,
            metrics.clone(),
            Arc::new(move |frame: LevelFrame| meter_frontend.print_levels(&frame)),
        )
    } else {
        SessionEffectRunner::new(host, Arc::new(connector), frontend.clone(), config, metrics.clone())
    };

    let chat = get_api_key()
        .and_then(|key| ChatClient::new(key, settings.chat_model.clone()).ok())
        .map(Arc::new);

    println!("Sales Boss: {}", WELCOME_MESSAGE);
    let (handle, loop_task) = CallController::start(frontend.clone(), runner);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Failed to read stdin: {}", e);
                break;
            }
        };

        let event = match line.trim() {
            "" => continue,
            "/call" => Event::StartCall,
            "/end" => Event::EndCall,
            "/mute" => Event::ToggleMute,
            "/status" => {
                print_status(&frontend, &metrics);
                continue;
            }
            "/quit" | "/exit" => break,
            text => {
                let can_chat = frontend.last_state().map_or(true, |ui| ui.controls.can_chat);
                if !can_chat {
                    println!("Sales Boss: chat is off during a call; /end first");
                    continue;
                }
                let Some(chat) = chat.clone() else {
                    println!("Sales Boss: chat needs GEMINI_API_KEY");
                    continue;
                };
                let display = frontend.clone();
                let text = text.to_string();
                tokio::spawn(async move {
                    match chat.send(&text, display.as_ref()).await {
                        Ok(reply) => println!("Sales Boss: {}", reply.text),
                        Err(e) => println!("Sales Boss: (chat failed: {})", e),
                    }
                });
                continue;
            }
        };

        if handle.send(event).await.is_err() {
            log::error!("State loop is gone");
            break;
        }
    }

    let _ = handle.send(Event::Exit).await;
    let _ = loop_task.await;
}
