//! `omnibridge chat`: interactive or single-message mode.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use omnibridge_agent::{AgentLoop, AgentStreamEvent, Session};
use omnibridge_backends::build_backend;
use omnibridge_config::AppConfig;
use omnibridge_core::{BackendKind, DeviceInput, DomainEvent, EventBus, Gaze, Gesture, GenerateConfig, ImageFrame, Message};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Args, Debug, Default)]
pub struct ChatArgs {
    /// Send a single message instead of entering interactive mode
    #[arg(short, long)]
    pub message: Option<String>,

    /// Recognized gesture label (e.g. point, swipe_left, thumbs_up)
    #[arg(long)]
    pub gesture: Option<String>,

    /// Gaze focus as x,y,r
    #[arg(long, allow_hyphen_values = true)]
    pub gaze: Option<String>,

    /// Image file sent with the message
    #[arg(long)]
    pub image: Option<PathBuf>,

    /// Voice transcript
    #[arg(long)]
    pub voice: Option<String>,
}

impl ChatArgs {
    fn has_device_input(&self) -> bool {
        self.gesture.is_some() || self.gaze.is_some() || self.image.is_some() || self.voice.is_some()
    }
}

/// Fold the one-shot flags into a single user message.
pub async fn build_input(args: &ChatArgs) -> anyhow::Result<Message> {
    let mut input = DeviceInput { text: args.message.clone(), voice: args.voice.clone(), ..Default::default() };
    if let Some(label) = &args.gesture {
        input = input.with_gesture(label.parse::<Gesture>()?);
    }
    if let Some(gaze) = &args.gaze {
        input = input.with_gaze(gaze.parse::<Gaze>()?);
    }
    if let Some(path) = &args.image {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading image {}", path.display()))?;
        input = input.with_image(ImageFrame::from_path_bytes(path, bytes));
    }
    Ok(input.into_message()?)
}

pub async fn build_agent(config: &AppConfig, invoker: Arc<omnibridge_mcp::ToolProtocolClient>) -> anyhow::Result<AgentLoop> {
    let backend = build_backend(&config.backend).await.context("building backend")?;

    let generate = GenerateConfig {
        temperature: config.backend.temperature,
        max_tokens: Some(config.backend.max_tokens),
        ..GenerateConfig::new(config.backend.model.clone())
    };

    let mut agent = AgentLoop::new(backend, invoker, generate).with_settings(config.agent.clone());
    if config.backend.kind == BackendKind::Prompted {
        agent = agent.with_markers(config.backend.local.markers.clone());
    }
    if config.retrieval.enabled {
        let retriever = super::open_retriever(config).await?;
        agent = agent.with_retriever(Arc::new(retriever));
    }
    Ok(agent)
}

pub async fn run(config_path: Option<&Path>, args: ChatArgs) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let tools = Arc::new(super::connect_tools(&config).await?);

    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let DomainEvent::ToolExecuted { tool_name, is_error, duration_ms, .. } = event.as_ref() {
                debug!(tool = %tool_name, is_error, duration_ms, "Tool executed");
            }
        }
    });

    let agent = match build_agent(&config, tools.clone()).await {
        Ok(agent) => agent.with_event_bus(bus),
        Err(e) => {
            tools.disconnect().await;
            return Err(e);
        }
    };
    let stream = config.agent.stream;
    let mut session = Session::new();

    let result = if args.message.is_some() || args.has_device_input() {
        match build_input(&args).await {
            Ok(input) => one_shot(&agent, &mut session, input, stream).await,
            Err(e) => Err(e),
        }
    } else {
        interactive(&agent, &mut session, &config, stream).await
    };

    tools.disconnect().await;
    result
}

async fn one_shot(agent: &AgentLoop, session: &mut Session, input: Message, stream: bool) -> anyhow::Result<()> {
    if stream {
        if let Some(notice) = streamed_turn(agent, session, input).await? {
            println!("{notice}");
        }
    } else {
        eprint!("  Thinking...");
        let outcome = agent.run_turn(session, input).await;
        eprint!("\r              \r");
        println!("{}", outcome?.answer);
    }
    Ok(())
}

/// Run a turn printing chunks as they arrive. Returns the answer if the
/// stream did not already show it.
async fn streamed_turn(agent: &AgentLoop, session: &mut Session, input: Message) -> anyhow::Result<Option<String>> {
    let (tx, mut rx) = mpsc::channel(64);
    let printer = tokio::spawn(async move {
        let mut out = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                AgentStreamEvent::Chunk { content } => {
                    let _ = write!(out, "{content}");
                    let _ = out.flush();
                }
                AgentStreamEvent::ToolCall { name, strategy, .. } => eprintln!("\n  [tool] {name} ({strategy})"),
                AgentStreamEvent::ToolResult { name, is_error: true, output, .. } => {
                    eprintln!("  [tool] {name} failed: {output}")
                }
                AgentStreamEvent::Done { truncated: true, .. } => eprintln!("\n  [turn budget exhausted]"),
                _ => {}
            }
        }
    });

    let outcome = agent.run_turn_streaming(session, input, tx).await;
    let _ = printer.await;
    let outcome = outcome?;
    println!();
    Ok(outcome.truncated.then_some(outcome.answer))
}

async fn interactive(agent: &AgentLoop, session: &mut Session, config: &AppConfig, stream: bool) -> anyhow::Result<()> {
    println!();
    println!("  OmniBridge: interactive mode");
    println!();
    println!("  Backend:   {} ({})", agent.backend().name(), config.backend.kind);
    println!("  Model:     {}", config.backend.model);
    println!("  Servers:   {}", config.tool_servers.len());
    println!("  Retrieval: {}", if config.retrieval.enabled { "enabled" } else { "disabled" });
    println!();
    println!("  Type your message and press Enter. Type 'exit' or Ctrl+D to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }

        let input = Message::user(line);
        if stream {
            print!("  Assistant > ");
            match streamed_turn(agent, session, input).await {
                Ok(Some(notice)) => println!("  {notice}"),
                Ok(None) => {}
                Err(e) => eprintln!("  [Error] {e}"),
            }
            println!();
            continue;
        }

        eprint!("  ...");
        match agent.run_turn(session, input).await {
            Ok(outcome) => {
                eprint!("\r     \r");
                for line in outcome.answer.lines() {
                    println!("  Assistant > {line}");
                }
                println!();
            }
            Err(e) => {
                eprint!("\r     \r");
                eprintln!("  [Error] {e}");
                println!();
            }
        }
    }

    println!();
    println!("  Goodbye!");
    Ok(())
}
