//! `marlin chat`: single-message or interactive chat.

use marlin_agent::{Agent, AgentEvent};
use marlin_config::{AppConfig, PersistenceKind};
use marlin_core::message::ConversationId;
use marlin_core::snapshot::SnapshotStore;
use marlin_core::tool::ToolResult;
use marlin_memory::FileSnapshotStore;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

pub async fn run(message: Option<String>, conversation: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    let provider = marlin_providers::build_from_config(&config).map_err(|e| {
        format!(
            "{e}\n  Set MARLIN_API_KEY or OPENAI_API_KEY, or add api_key to {}",
            AppConfig::config_dir().join("config.toml").display()
        )
    })?;
    let registry = marlin_tools::default_registry(&config.tools)?;

    let snapshots: Option<Arc<dyn SnapshotStore>> = match config.memory.persistence {
        PersistenceKind::None => None,
        PersistenceKind::File => Some(Arc::new(
            FileSnapshotStore::new(config.memory.resolved_snapshot_dir())
                .with_ttl(Duration::from_secs(config.memory.snapshot_ttl_secs)),
        )),
    };

    let agent = Agent::from_config(&config, provider, registry, snapshots);
    let conversation_id = conversation.map(ConversationId::from).unwrap_or_default();

    if let Some(msg) = message {
        let answered = render_turn(&agent, &conversation_id, msg).await?;
        if !answered {
            return Err("the turn did not produce an answer".into());
        }
        return Ok(());
    }

    println!();
    println!("  marlin: interactive mode");
    println!();
    println!("  Provider:      {}", config.provider.name);
    println!("  Model:         {}", config.provider.model);
    println!("  Tools:         {}", agent.agent_loop().executor().registry().names().join(", "));
    println!("  Conversation:  {conversation_id}");
    println!();
    println!("  Type your message and press Enter.");
    println!("  Type 'exit' or Ctrl+D to quit.");
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
        if line == "exit" || line == "quit" {
            break;
        }

        println!();
        print!("  Assistant > ");
        std::io::stdout().flush()?;
        render_turn(&agent, &conversation_id, line.to_string()).await?;
        println!();
    }

    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

/// Print one turn's events as they arrive. Returns whether it answered.
async fn render_turn(
    agent: &Agent,
    conversation_id: &ConversationId,
    text: String,
) -> Result<bool, Box<dyn std::error::Error>> {
    let mut events = ReceiverStream::new(agent.submit(conversation_id.clone(), text)?);
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        match event {
            AgentEvent::Content { delta } => {
                print!("{delta}");
                stdout.flush()?;
            }
            AgentEvent::ToolInvoked { name, arguments, .. } => {
                eprintln!("\n  [tool] {name} {arguments}");
            }
            AgentEvent::ToolResult { name, result, .. } => {
                eprintln!("  [tool] {name} {}", describe(&result));
            }
            AgentEvent::Error { kind, message } => {
                eprintln!("\n  [error:{kind}] {message}");
                return Ok(false);
            }
            AgentEvent::Done { usage, iterations, .. } => {
                println!();
                if let Some(usage) = usage {
                    tracing::debug!(
                        prompt_tokens = usage.prompt_tokens,
                        completion_tokens = usage.completion_tokens,
                        iterations,
                        "Turn usage"
                    );
                }
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn describe(result: &ToolResult) -> String {
    let attempts = result.metadata.get("attempts").and_then(|v| v.as_u64()).unwrap_or(1);
    let via = result
        .metadata
        .get("alternative_for")
        .and_then(|v| v.as_str())
        .and_then(|_| result.metadata.get("tool").and_then(|v| v.as_str()))
        .map(|tool| format!(" via {tool}"))
        .unwrap_or_default();
    match &result.error {
        None => format!("ok ({attempts} attempt(s){via})"),
        Some(error) => format!("failed ({attempts} attempt(s){via}): {error}"),
    }
}
