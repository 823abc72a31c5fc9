// ============================================================================
// keepsake - terminal front end for the memory-aware chat assistant
// ============================================================================
// Usage:
//   keepsake chat [--conversation ID]          Interactive chat loop
//   keepsake memory add|list|delete|clear|reindex
//   keepsake conversations list|show|rename|new
//   keepsake context --conversation ID TEXT    Print the assembled context
//   keepsake stats                             Show database statistics
// ============================================================================

use anyhow::{Context as _, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use keepsake_core::{
    Attachment, ChatClient, ChatConfig, ChatDb, ChatEngine, ContentPart, Conversation,
    EmbeddingProvider, Message, OpenAiEmbeddings,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Memory-aware chat assistant
#[derive(Parser)]
#[command(name = "keepsake", version, about = "Chat with an assistant that remembers")]
struct Cli {
    /// Path to the database file (default: ~/.keepsake/keepsake.redb)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat
    Chat {
        /// Resume an existing conversation instead of starting a new one
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Manage long-term memories
    Memory {
        #[command(subcommand)]
        action: MemoryCommand,
    },

    /// Browse and manage conversations
    Conversations {
        #[command(subcommand)]
        action: ConversationCommand,
    },

    /// Print the context that would be sent for a turn, as JSON
    Context {
        #[arg(long)]
        conversation: String,

        /// Message text (may be empty when attachments are given)
        #[arg(default_value = "")]
        text: String,

        /// Image URL (data:image/... or http(s)://), repeatable
        #[arg(long)]
        image: Vec<String>,

        /// Text file to attach, repeatable
        #[arg(long)]
        file: Vec<PathBuf>,
    },

    /// Show database statistics
    Stats,
}

#[derive(Subcommand)]
enum MemoryCommand {
    /// Remember a fact
    Add {
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// List memories, newest first
    List,
    /// Forget one memory
    Delete { id: u64 },
    /// Forget every memory
    Clear,
    /// Embed memories that have no vector from the current model
    Reindex,
}

#[derive(Subcommand)]
enum ConversationCommand {
    /// List conversations, most recently active first
    List,
    /// Print a conversation transcript
    Show { id: String },
    /// Rename a conversation
    Rename {
        id: String,
        #[arg(required = true)]
        title: Vec<String>,
    },
    /// Start an empty conversation
    New { title: Option<String> },
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

/// Load CHATBOT_ENV_FILE (default .env). Existing variables win.
fn load_env_file() {
    let path = std::env::var("CHATBOT_ENV_FILE").unwrap_or_else(|_| ".env".to_string());
    match dotenvy::from_path(&path) {
        Ok(()) => {}
        Err(e) if e.not_found() => {}
        Err(e) => eprintln!("Warning: Could not load env file {}: {}", path, e),
    }
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("keepsake=info".parse()?)
                .add_directive("keepsake_core=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn build_engine(config: ChatConfig) -> Result<ChatEngine> {
    let db_path = config.resolve_db_path()?;
    let db = ChatDb::open(&db_path)?;

    let api_key = std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|key| !key.trim().is_empty());

    let embeddings = match &api_key {
        Some(key) if config.embeddings_enabled => {
            let provider = OpenAiEmbeddings::new(
                key.clone(),
                config.embeddings_api_url.clone(),
                config.embedding_model.clone(),
                config.embedding_timeout,
            )?;
            Some(Arc::new(provider) as Arc<dyn EmbeddingProvider>)
        }
        _ => None,
    };

    let model = match api_key {
        Some(key) => Some(ChatClient::new(key, &config)?),
        None => {
            warn!("OPENAI_API_KEY is not set; chat and embeddings are unavailable");
            None
        }
    };

    let engine = ChatEngine::new(config, db, embeddings);
    Ok(match model {
        Some(model) => engine.with_model(Arc::new(model)),
        None => engine,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    init_tracing()?;

    let cli = Cli::parse();
    let mut config = ChatConfig::from_env()?;
    if let Some(path) = cli.db_path {
        config.db_path = Some(path);
    }
    let engine = build_engine(config)?;

    match cli.command {
        Commands::Chat { conversation } => cmd_chat(&engine, conversation).await,
        Commands::Memory { action } => cmd_memory(&engine, action).await,
        Commands::Conversations { action } => cmd_conversations(&engine, action),
        Commands::Context {
            conversation,
            text,
            image,
            file,
        } => cmd_context(&engine, &conversation, &text, image, file).await,
        Commands::Stats => cmd_stats(&engine),
    }
}

// ============================================================================
// Chat loop
// ============================================================================

const MEMORY_USAGE: &str = "Usage: /memory add TEXT | list | delete ID | clear";

/// A `/command` typed in the chat loop
#[derive(Debug, PartialEq)]
enum ChatCommand<'a> {
    Exit,
    Help,
    New,
    Title(&'a str),
    Conversations,
    Open(&'a str),
    MemoryAdd(&'a str),
    MemoryList,
    MemoryDelete(u64),
    MemoryClear,
    /// Known command with bad arguments
    Usage(&'static str),
    Unknown(&'a str),
}

/// `None` when the line is a message for the assistant
fn parse_chat_command(line: &str) -> Option<ChatCommand<'_>> {
    let command = line.trim().strip_prefix('/')?;
    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();

    Some(match name {
        "exit" | "quit" => ChatCommand::Exit,
        "help" => ChatCommand::Help,
        "new" => ChatCommand::New,
        "title" => ChatCommand::Title(rest),
        "conversations" => ChatCommand::Conversations,
        "open" if rest.is_empty() => ChatCommand::Usage("Usage: /open ID"),
        "open" => ChatCommand::Open(rest),
        "memory" => {
            let (action, arg) = rest.split_once(' ').unwrap_or((rest, ""));
            let arg = arg.trim();
            match action {
                "add" if arg.is_empty() => ChatCommand::Usage("Usage: /memory add TEXT"),
                "add" => ChatCommand::MemoryAdd(arg),
                "list" => ChatCommand::MemoryList,
                "delete" => match arg.parse::<u64>() {
                    Ok(id) => ChatCommand::MemoryDelete(id),
                    Err(_) => ChatCommand::Usage("Usage: /memory delete ID"),
                },
                "clear" => ChatCommand::MemoryClear,
                _ => ChatCommand::Usage(MEMORY_USAGE),
            }
        }
        other => ChatCommand::Unknown(other),
    })
}

fn print_help() {
    println!("Commands:");
    println!("  /help          Show this help");
    println!("  /new           Start a new conversation");
    println!("  /title TEXT    Rename the current conversation");
    println!("  /conversations List conversations");
    println!("  /open ID       Switch to another conversation");
    println!("  /memory add TEXT | list | delete ID | clear");
    println!("  /exit          Leave the chat");
    println!("Anything else is sent to the assistant.");
}

fn prompt() -> Result<()> {
    print!("you> ");
    std::io::stdout().flush()?;
    Ok(())
}

async fn cmd_chat(engine: &ChatEngine, conversation: Option<String>) -> Result<()> {
    let mut current = match conversation {
        Some(id) => {
            let (conversation, messages) = match engine.open_conversation(&id) {
                Ok(found) => found,
                Err(e) if e.is_not_found() => {
                    anyhow::bail!("No conversation with id '{}'. List them with `keepsake conversations list`.", id)
                }
                Err(e) => return Err(e.into()),
            };
            print_transcript(&messages);
            conversation
        }
        None => engine.create_conversation(None)?,
    };

    println!("{} ({})", current.title, current.id);
    println!("Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt()?;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();

        if line.is_empty() {
            prompt()?;
            continue;
        }

        if let Some(command) = parse_chat_command(line) {
            if command == ChatCommand::Exit {
                break;
            }
            if let Err(e) = run_chat_command(engine, &mut current, command).await {
                eprintln!("Error: {}", e);
            }
            prompt()?;
            continue;
        }

        match engine.send(&current.id, line, Vec::new()).await {
            Ok(reply) => println!("assistant> {}", reply.text()),
            Err(e) => eprintln!("Error: {}", e),
        }
        prompt()?;
    }

    Ok(())
}

async fn run_chat_command(
    engine: &ChatEngine,
    current: &mut Conversation,
    command: ChatCommand<'_>,
) -> Result<()> {
    let memory = engine.memory();

    match command {
        ChatCommand::Exit => {}
        ChatCommand::Help => print_help(),
        ChatCommand::New => {
            *current = engine.create_conversation(None)?;
            println!("{} ({})", current.title, current.id);
        }
        ChatCommand::Title(title) => {
            *current = engine.rename_conversation(&current.id, title)?;
            println!("Renamed to \"{}\"", current.title);
        }
        ChatCommand::Conversations => {
            let conversations = engine.list_conversations()?;
            if conversations.is_empty() {
                println!("No conversations found.");
            }
            for c in &conversations {
                println!("{} | {} | {}", c.id, c.title, format_timestamp(c.created_at));
            }
        }
        ChatCommand::Open(id) => match engine.open_conversation(id) {
            Ok((conversation, messages)) => {
                print_transcript(&messages);
                println!("{} ({})", conversation.title, conversation.id);
                *current = conversation;
            }
            Err(e) if e.is_not_found() => println!("Conversation not found."),
            Err(e) => return Err(e.into()),
        },
        ChatCommand::MemoryAdd(text) => {
            let stored = memory.add_memory(text).await?;
            println!("Remembered [{}] {}", stored.id, stored.content);
        }
        ChatCommand::MemoryList => {
            let memories = memory.list_memories()?;
            if memories.is_empty() {
                println!("No memories yet.");
            }
            for m in &memories {
                println!("[{}] {}", m.id, m.content);
            }
        }
        ChatCommand::MemoryDelete(id) => match memory.get_memory(id) {
            Ok(found) => {
                memory.delete_memory(id)?;
                println!("Forgot [{}] {}", found.id, found.content);
            }
            Err(e) if e.is_not_found() => println!("Memory not found."),
            Err(e) => return Err(e.into()),
        },
        ChatCommand::MemoryClear => {
            let removed = memory.clear_memories()?;
            println!("Forgot {} memories", removed);
        }
        ChatCommand::Usage(usage) => println!("{}", usage),
        ChatCommand::Unknown(name) => eprintln!("Unknown command /{} (try /help)", name),
    }
    Ok(())
}

fn print_transcript(messages: &[Message]) {
    for message in messages {
        println!("{}> {}", message.role, render(message));
    }
}

/// Message text with a placeholder for each image
fn render(message: &Message) -> String {
    message
        .parts
        .iter()
        .map(|part| match part {
            ContentPart::Text(text) => text.clone(),
            ContentPart::Image { .. } => "[image]".to_string(),
            ContentPart::FileText { name, .. } => format!("[file: {}]", name),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Memories
// ============================================================================

async fn cmd_memory(engine: &ChatEngine, action: MemoryCommand) -> Result<()> {
    let memory = engine.memory();

    match action {
        MemoryCommand::Add { text } => {
            let stored = memory.add_memory(&text.join(" ")).await?;
            println!("Remembered [{}] {}", stored.id, stored.content);
        }
        MemoryCommand::List => {
            let memories = memory.list_memories()?;
            if memories.is_empty() {
                println!("No memories yet.");
                return Ok(());
            }

            let models: HashMap<u64, String> = engine
                .db()
                .list_embeddings()?
                .into_iter()
                .map(|e| (e.memory_id, e.model))
                .collect();

            for m in &memories {
                let model = models.get(&m.id).map(String::as_str).unwrap_or("-");
                println!(
                    "[{}] {}  (added {}, embedding: {})",
                    m.id,
                    m.content,
                    format_timestamp(m.created_at),
                    model
                );
            }
            println!("\nTotal: {} memories", memories.len());
        }
        MemoryCommand::Delete { id } => {
            let found = memory.get_memory(id)?;
            memory.delete_memory(id)?;
            println!("Forgot [{}] {}", found.id, found.content);
        }
        MemoryCommand::Clear => {
            let removed = memory.clear_memories()?;
            println!("Forgot {} memories", removed);
        }
        MemoryCommand::Reindex => {
            if !memory.embeddings_active() {
                println!("Embeddings are disabled or OPENAI_API_KEY is not set.");
                return Ok(());
            }
            let embedded = memory.reconcile_embeddings().await?;
            info!("Reindex embedded {} memories", embedded);
            println!(
                "Embedded {} memories with {}",
                embedded,
                memory.embedding_model().unwrap_or("-")
            );
        }
    }

    Ok(())
}

// ============================================================================
// Conversations
// ============================================================================

fn cmd_conversations(engine: &ChatEngine, action: ConversationCommand) -> Result<()> {
    match action {
        ConversationCommand::List => {
            let conversations = engine.list_conversations()?;
            if conversations.is_empty() {
                println!("No conversations found.");
                return Ok(());
            }

            println!(
                "{:<36}  {:<24}  {:>8}  {}",
                "ID", "LAST ACTIVE", "MESSAGES", "TITLE"
            );
            println!("{}", "-".repeat(90));
            for c in &conversations {
                println!(
                    "{:<36}  {:<24}  {:>8}  {}",
                    c.id,
                    format_timestamp(c.last_active_at),
                    c.message_count,
                    c.title
                );
            }
        }
        ConversationCommand::Show { id } => {
            let (conversation, messages) = engine.open_conversation(&id)?;
            println!("=== {} ===", conversation.title);
            println!("Started {}", format_timestamp(conversation.created_at));
            println!();
            for message in &messages {
                println!("#{} {}> {}", message.position, message.role, render(message));
            }
        }
        ConversationCommand::Rename { id, title } => {
            let renamed = engine.rename_conversation(&id, &title.join(" "))?;
            println!("Renamed {} to \"{}\"", renamed.id, renamed.title);
        }
        ConversationCommand::New { title } => {
            let conversation = engine.create_conversation(title.as_deref())?;
            println!("{}", conversation.id);
        }
    }
    Ok(())
}

// ============================================================================
// Inspection
// ============================================================================

async fn cmd_context(
    engine: &ChatEngine,
    conversation: &str,
    text: &str,
    images: Vec<String>,
    files: Vec<PathBuf>,
) -> Result<()> {
    let mut attachments: Vec<Attachment> = images
        .into_iter()
        .map(|url| Attachment::Image { url })
        .collect();

    for path in files {
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        attachments.push(Attachment::File { name, text });
    }

    let context = engine.handle_turn(conversation, text, attachments).await?;
    println!("{}", serde_json::to_string_pretty(&context)?);
    Ok(())
}

fn cmd_stats(engine: &ChatEngine) -> Result<()> {
    let stats = engine.stats()?;
    let config = engine.config();

    println!("=== Keepsake Database Stats ===");
    println!("Database: {}", engine.db().path().display());
    println!();
    println!("Conversations: {}", stats.conversations);
    println!("Messages:      {}", stats.messages);
    println!("Memories:      {}", stats.memories);
    println!("Embeddings:    {}", stats.embeddings);
    for (model, count) in &stats.embedding_models {
        let marker = if *model == config.embedding_model { " (current)" } else { "" };
        println!("  {:28} {}{}", model, count, marker);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_not_a_command() {
        assert_eq!(parse_chat_command("what's for dinner?"), None);
        assert_eq!(parse_chat_command("  /quit "), Some(ChatCommand::Exit));
    }

    #[test]
    fn test_conversation_commands() {
        assert_eq!(parse_chat_command("/conversations"), Some(ChatCommand::Conversations));
        assert_eq!(parse_chat_command("/open  abc-123 "), Some(ChatCommand::Open("abc-123")));
        assert_eq!(
            parse_chat_command("/open"),
            Some(ChatCommand::Usage("Usage: /open ID"))
        );
        assert_eq!(parse_chat_command("/title Trip plans"), Some(ChatCommand::Title("Trip plans")));
    }

    #[test]
    fn test_memory_commands() {
        assert_eq!(
            parse_chat_command("/memory add User is vegetarian"),
            Some(ChatCommand::MemoryAdd("User is vegetarian"))
        );
        assert_eq!(parse_chat_command("/memory list"), Some(ChatCommand::MemoryList));
        assert_eq!(parse_chat_command("/memory delete 7"), Some(ChatCommand::MemoryDelete(7)));
        assert_eq!(parse_chat_command("/memory clear"), Some(ChatCommand::MemoryClear));
    }

    #[test]
    fn test_memory_usage_messages() {
        assert_eq!(
            parse_chat_command("/memory add"),
            Some(ChatCommand::Usage("Usage: /memory add TEXT"))
        );
        assert_eq!(
            parse_chat_command("/memory delete seven"),
            Some(ChatCommand::Usage("Usage: /memory delete ID"))
        );
        assert_eq!(parse_chat_command("/memory"), Some(ChatCommand::Usage(MEMORY_USAGE)));
        assert_eq!(parse_chat_command("/memory forget 1"), Some(ChatCommand::Usage(MEMORY_USAGE)));
        assert_eq!(parse_chat_command("/dance"), Some(ChatCommand::Unknown("dance")));
    }
}
