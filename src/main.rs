use anyhow::Context;
use appointment_watcher::config::{Config, MailSourceKind};
use appointment_watcher::dispatch::format::render_alert;
use appointment_watcher::dispatch::telegram::TelegramNotifier;
use appointment_watcher::dispatch::Dispatcher;
use appointment_watcher::error::WatcherError;
use appointment_watcher::ledger::{Ledger, SqliteLedger};
use appointment_watcher::mail::directory::{parse_fixture, DirectorySource};
use appointment_watcher::mail::gmail::GmailSource;
use appointment_watcher::mail::MailSource;
use appointment_watcher::parser::AppointmentParser;
use appointment_watcher::server;
use appointment_watcher::watcher::Watcher;
use chrono::Utc;
use clap::{Arg, Command};
use log::LevelFilter;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let matches = Command::new("appointment-watcher")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Watches a mailbox for TLScontact appointment emails and sends Telegram alerts")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("appointment-watcher.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and report missing secrets")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Parse an email fixture and print the alert it would produce")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("once")
                .long("once")
                .help("Run a single poll cycle and print its report")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("continuous")
                .long("continuous")
                .help("Poll on the configured interval until interrupted (default)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("serve")
                .long("serve")
                .help("Start the HTTP control surface (add --continuous to also poll on a timer)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show ledger statistics")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-notification")
                .long("test-notification")
                .help("Send a test message to the configured Telegram chat")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: could not load .env file: {e}");
        }
    }

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("appointment-watcher.yaml");
    let config_found = Path::new(config_path).exists();
    let mut config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };
    config.apply_env_overrides();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        config.logging.level.parse().unwrap_or(LevelFilter::Info)
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if !config_found {
        log::warn!("Configuration file '{config_path}' not found, using default configuration");
    }

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if let Some(email_file) = matches.get_one::<String>("test-email") {
        test_email_file(&config, email_file);
        return;
    }

    if matches.get_flag("stats") {
        show_stats(&config);
        return;
    }

    if matches.get_flag("test-notification") {
        send_test_notification(&config).await;
        return;
    }

    if let Err(e) = config.validate() {
        eprintln!("❌ Invalid configuration: {e:#}");
        process::exit(1);
    }

    let watcher = match build_watcher(&config) {
        Ok(watcher) => watcher,
        Err(e) => {
            eprintln!("❌ Failed to start watcher: {e:#}");
            process::exit(1);
        }
    };

    let signal_watcher = watcher.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, finishing current cycle...");
        signal_watcher.request_shutdown();
    }) {
        log::warn!("Failed to install signal handler: {e}");
    }

    if matches.get_flag("once") {
        match watcher.run_once().await {
            Ok(report) => match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(e) => log::error!("Failed to render cycle report: {e}"),
            },
            Err(e) => {
                eprintln!("❌ Poll cycle failed: {e}");
                process::exit(1);
            }
        }
        return;
    }

    if matches.get_flag("serve") {
        let poller = matches
            .get_flag("continuous")
            .then(|| tokio::spawn(run_loop(watcher.clone())));

        let shutdown_watcher = watcher.clone();
        let shutdown = async move { shutdown_watcher.shutdown_requested().await };
        if let Err(e) = server::serve(&config.server.bind, watcher.clone(), shutdown).await {
            eprintln!("❌ HTTP server failed: {e:#}");
            watcher.request_shutdown();
            process::exit(1);
        }

        if let Some(poller) = poller {
            match poller.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    eprintln!("❌ {e}");
                    process::exit(1);
                }
                Err(e) => log::error!("Polling task panicked: {e}"),
            }
        }
        return;
    }

    if let Err(e) = run_loop(watcher).await {
        eprintln!("❌ {e}");
        process::exit(1);
    }
}

async fn run_loop(watcher: Arc<Watcher>) -> Result<(), WatcherError> {
    let result = watcher.run().await;
    // A fatal error should also bring down the HTTP surface.
    watcher.request_shutdown();
    result
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if Path::new(path).exists() {
        Config::from_file(path)
    } else {
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Secrets are read from the environment or a .env file:");
            println!("  TELEGRAM_BOT_TOKEN, TELEGRAM_CHAT_ID,");
            println!("  GOOGLE_CLIENT_ID, GOOGLE_CLIENT_SECRET, GOOGLE_REFRESH_TOKEN");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    println!();

    if let Err(e) = config.validate() {
        println!("❌ Configuration validation failed:");
        println!("Error: {e:#}");
        process::exit(1);
    }

    println!("Mail source: {:?}", config.mail.source);
    println!("Sender domains: {}", config.parser.sender_domains.join(", "));
    println!(
        "Poll interval: {}s, fetch limit: {}, quota per cycle: {}",
        config.watcher.poll_interval_secs,
        config.watcher.fetch_limit,
        config.dispatch.max_sends_per_cycle
    );
    println!("Backlog policy: {:?}", config.watcher.backlog_policy);
    println!("Ledger: {}", config.ledger.path);

    let missing = config.missing_secrets();
    if missing.is_empty() {
        println!("✅ Configuration is valid and all secrets are present");
    } else {
        println!("⚠️  Configuration is valid but these secrets are missing:");
        for name in missing {
            println!("  • {name}");
        }
    }
}

fn test_email_file(config: &Config, email_file: &str) {
    println!("🧪 Testing email file: {email_file}");
    println!();

    let content = match std::fs::read_to_string(email_file) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("❌ Error reading email file: {e}");
            process::exit(1);
        }
    };
    let id = Path::new(email_file)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "test-email".to_string());
    let message = parse_fixture(&id, &content, Utc::now());

    println!("From: {}", message.sender);
    println!("Subject: {}", message.subject);
    println!("Received: {}", message.received_at);
    println!();

    let parser = AppointmentParser::new(&config.parser);
    match parser.parse(&message) {
        Ok(record) => {
            println!("✅ Appointment detected ({:?})", record.confidence);
            match &record.date {
                Some(date) => println!("  Date: {} ({})", date.date, date.raw),
                None => println!("  Date: not detected"),
            }
            println!(
                "  Location: {}",
                record.location.as_deref().unwrap_or("not detected")
            );
            println!("  Link: {}", record.link.as_deref().unwrap_or("not detected"));
            println!();
            println!("Alert preview:");
            println!("{}", render_alert(&record));
        }
        Err(reason) => println!("➖ Not an appointment: {reason}"),
    }
}

fn show_stats(config: &Config) {
    let ledger = match SqliteLedger::open(&config.ledger.path) {
        Ok(ledger) => ledger,
        Err(e) => {
            println!("❌ Failed to open ledger: {e}");
            process::exit(1);
        }
    };
    let stats = match ledger.stats() {
        Ok(stats) => stats,
        Err(e) => {
            println!("❌ Failed to read ledger statistics: {e}");
            process::exit(1);
        }
    };

    println!("📊 Appointment Watcher Statistics");
    println!("═══════════════════════════════════════");
    println!("  Messages processed: {}", stats.total);
    println!("  Notified:           {}", stats.notified);
    println!("  Not appointments:   {}", stats.not_appointment);
    println!("  Failed permanently: {}", stats.failed_permanently);
    println!("  Dropped:            {}", stats.dropped);
    match stats.latest_processed_at {
        Some(at) => println!("  Last processed:     {at}"),
        None => println!("  Last processed:     never"),
    }
    match stats.checkpoint {
        Some(cp) => println!("  Checkpoint:         {}", cp.received_at),
        None => println!("  Checkpoint:         none"),
    }
}

async fn send_test_notification(config: &Config) {
    let dispatcher = match build_dispatcher(config) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    };
    let html = format!(
        "✅ <b>appointment-watcher</b> test notification\n{}",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );
    match dispatcher.send_status(&html).await {
        Ok(sent) => println!("✅ Test notification sent ({} attempt(s))", sent.attempts),
        Err(e) => {
            eprintln!("❌ Test notification failed: {e}");
            process::exit(1);
        }
    }
}

fn build_dispatcher(config: &Config) -> anyhow::Result<Dispatcher> {
    let token = config
        .telegram
        .bot_token
        .as_deref()
        .context("TELEGRAM_BOT_TOKEN is not set")?;
    let chat_id = config
        .telegram
        .chat_id
        .as_deref()
        .context("TELEGRAM_CHAT_ID is not set")?;
    let notifier = TelegramNotifier::new(
        &config.telegram.api_base,
        token,
        Duration::from_secs(config.telegram.request_timeout_secs),
    )
    .context("Failed to build Telegram client")?;

    Ok(Dispatcher::new(
        Arc::new(notifier),
        chat_id,
        config.dispatch.max_sends_per_cycle,
        config.dispatch.retry_policy(),
        config.dispatch.attempt_timeout(),
    ))
}

fn build_watcher(config: &Config) -> anyhow::Result<Arc<Watcher>> {
    let source: Arc<dyn MailSource> = match config.mail.source {
        MailSourceKind::Gmail => Arc::new(
            GmailSource::new(
                &config.mail.gmail,
                Duration::from_secs(config.mail.request_timeout_secs),
            )
            .context("Failed to set up Gmail source")?,
        ),
        MailSourceKind::Directory => {
            log::info!("Reading mail from fixture directory {}", config.mail.directory);
            Arc::new(DirectorySource::new(&config.mail.directory))
        }
    };

    let ledger = SqliteLedger::open(&config.ledger.path)
        .with_context(|| format!("Failed to open ledger at {}", config.ledger.path))?;

    Ok(Arc::new(Watcher::new(
        source,
        AppointmentParser::new(&config.parser),
        build_dispatcher(config)?,
        Arc::new(ledger),
        config.watcher.clone(),
    )))
}
