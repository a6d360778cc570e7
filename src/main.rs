use std::path::PathBuf;

use colored::Colorize;
use kustream::{
    AppResult,
    cli::{Cli, Commands},
    config::Config,
    init_logging,
    kucoin::{CredentialProvider, RestBootstrapResolver},
    session::{StreamClient, StreamEvent},
};

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse_args();

    // Load configuration
    let mut config = Config::load_or_default(&cli.config_file);

    // Initialize logging
    let log_file = config.log.enabled.then(|| PathBuf::from(&config.log.file_path));
    let _log_guard = init_logging(&cli.effective_log_level(&config.log_level), log_file.as_deref())?;

    tracing::info!("KuStream starting...");
    tracing::debug!("CLI arguments: {:?}", cli);

    match cli.command() {
        Commands::Config { action } => {
            Config::handle_command(&action, &cli.config_file)?;
        }
        Commands::Stream {
            topics,
            private,
            sandbox,
        } => {
            if sandbox {
                config.exchange.sandbox = true;
            }
            let topics = if topics.is_empty() {
                config.topics.clone()
            } else {
                topics
            };
            run_stream(&config, topics, private).await?;
        }
    }

    Ok(())
}

async fn run_stream(config: &Config, topics: Vec<String>, private: bool) -> AppResult<()> {
    let credential = config.credential();
    if private && !credential.is_private() {
        return Err("Private topics need KUSTREAM_API_KEY, KUSTREAM_API_SECRET and KUSTREAM_API_PASSPHRASE".into());
    }
    if topics.is_empty() {
        return Err("No topics given; use --topic or set topics in the config file".into());
    }

    let resolver = RestBootstrapResolver::new(
        config.exchange.active_rest_url(),
        config.exchange.timeout(),
    );
    let (client, mut events) = StreamClient::new(config.session_config(), credential, resolver);

    println!(
        "{} {}",
        "Connecting to".bright_blue(),
        config.exchange.active_rest_url().bold()
    );
    client.start().await?;

    for topic in &topics {
        match client.subscribe(topic, private).await {
            Ok(_) => println!("{} {}", "Subscribed".green(), topic),
            Err(e) => println!("{} {}: {}", "Subscribe failed".red(), topic, e),
        }
    }

    let mut state_rx = client.watch_state();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(StreamEvent::Message(message)) => {
                    println!(
                        "{} {} {}",
                        message.topic.cyan(),
                        message.subject.yellow(),
                        message.payload
                    );
                }
                Some(StreamEvent::DeliveryError(reason)) => {
                    println!("{} {}", "Delivery error:".red(), reason);
                }
                None => break,
            },
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                println!("{} {}", "Session".bright_black(), state.to_string().magenta());
            }
            _ = tokio::signal::ctrl_c() => {
                println!("{}", "Shutting down...".bright_blue());
                break;
            }
        }
    }

    client.stop().await;
    let stats = client.stats();
    println!(
        "{} delivered={} dropped={} decode_errors={} reconnects={}",
        "Stats:".bold(),
        stats.messages_delivered,
        stats.messages_dropped,
        stats.decode_errors,
        stats.reconnects
    );

    Ok(())
}
