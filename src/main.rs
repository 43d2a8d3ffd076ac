use std::sync::Arc;

use clap::Parser;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use hangout_cards::cli::Args;
use hangout_cards::error::WidgetError;
use hangout_cards::flow::{FlowHandle, FlowState};
use hangout_cards::host::{FlowObserver, Renderer};
use hangout_cards::memory_host::MemoryHost;
use hangout_cards::mirror::LocalMirror;
use hangout_cards::sequencer::BootstrapSequencer;

/// Prints the mirror and channel messages to the terminal.
struct ConsoleRenderer;

impl Renderer for ConsoleRenderer {
    fn render(&self, mirror: &LocalMirror) {
        let players: Vec<&str> = mirror
            .participants()
            .unwrap_or_default()
            .iter()
            .map(|p| p.display_name())
            .collect();
        println!("{} {}", "players:".bright_blue().bold(), players.join(", "));
        for entry in mirror.entries() {
            println!("  {} = {}", entry.key.cyan(), entry.value);
        }
    }

    fn show_message(&self, content: &str) {
        println!("{} {}", ">>".bright_green().bold(), content);
    }
}

struct ConsoleObserver;

impl FlowObserver for ConsoleObserver {
    fn state_changed(&self, state: FlowState) {
        eprintln!("{} {}", "[flow]".dimmed(), state);
    }

    fn connected(&self) {
        eprintln!("{}", "channel open; type a line to send it".green());
    }

    fn closed(&self) {
        eprintln!("{}", "channel closed".yellow());
    }

    fn failed(&self, error: &WidgetError) {
        eprintln!("{} {}", "join failed:".red().bold(), error);
    }

    fn message_discarded(&self, error: &WidgetError) {
        eprintln!("{} {}", "discarded message:".yellow(), error);
    }
}

/// Forward stdin lines to the channel until stdin ends.
async fn forward_stdin(flow: FlowHandle) {
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    while let Some(line) = lines.next().await {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        if let Err(e) = flow.send(line) {
            eprintln!("{} {}", "not sent:".yellow(), e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = args.resolve_config()?;

    // RUST_LOG wins over the configured filter.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let host = MemoryHost::new(args.session.as_str());
    let me = host.add_person(&args.participant, &args.name);
    host.set_local_participant(&me.id);

    let sequencer = BootstrapSequencer::builder()
        .store(Arc::new(host.clone()))
        .roster(Arc::new(host.clone()))
        .renderer(Arc::new(ConsoleRenderer))
        .observer(Arc::new(ConsoleObserver))
        .join_service(config.api_client_builder().build())
        .channel_opener(config.channel_opener())
        .settings(config.flow_settings())
        .build()?;

    sequencer.attach(&host);
    host.fire_ready();

    let mut task = sequencer
        .take_join_task()
        .ok_or("join flow did not start")?;
    tokio::spawn(forward_stdin(sequencer.flow()));

    let finished = tokio::select! {
        joined = &mut task => Some(joined),
        _ = tokio::signal::ctrl_c() => None,
    };
    let outcome = match finished {
        Some(joined) => joined?,
        None => {
            sequencer.detach();
            task.await?
        }
    };
    outcome?;
    Ok(())
}
