use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use lib::documents::UploadOutcome;
use lib::gateway::UploadFile;
use lib::models::{DocumentType, QueryMethod};
use lib::realtime::{ConnectionState, RagMode, ServerEvent};
use lib::Client;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "docchat")]
#[command(about = "Chat with your documents", long_about = None)]
struct Cli {
    /// Config file path (default: DOCCHAT_CONFIG_PATH or ~/.docchat/config.json)
    #[arg(long, short, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Log in and persist the access token.
    Login {
        #[arg(long, short)]
        username: String,

        /// Read from stdin when omitted.
        #[arg(long, short)]
        password: Option<String>,
    },

    /// Forget the stored token.
    Logout,

    /// Show the signed-in user.
    Whoami,

    /// List your documents.
    Documents {
        /// Print raw JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Upload one or more files.
    Upload {
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,

        /// Classification tag (pdf, txt, csv, docx, unknown). Detected per file when omitted.
        #[arg(long = "type", value_name = "TYPE")]
        document_type: Option<DocumentType>,
    },

    /// Delete a document.
    Delete { id: String },

    /// Ask one question about a document (no realtime channel).
    Query {
        id: String,
        question: String,

        /// rag or graph
        #[arg(long, short, default_value = "rag")]
        method: QueryMethod,
    },

    /// Interactive chat about a document over the realtime channel.
    Chat {
        id: String,

        /// traditional or graph; switch with /mode during the chat.
        #[arg(long, short, default_value = "traditional")]
        mode: RagMode,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let Some(command) = cli.command else {
        println!("Run with --help for usage");
        return;
    };
    if let Commands::Version = command {
        println!("docchat {}", env!("CARGO_PKG_VERSION"));
        return;
    }
    if let Err(e) = run(cli.config, command).await {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config_path: Option<PathBuf>, command: Commands) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;
    log::debug!("using config {}", path.display());
    let client = Client::new(config);

    match command {
        Commands::Version => Ok(()),
        Commands::Login { username, password } => {
            let password = match password {
                Some(p) => p,
                None => read_password().await?,
            };
            let user = client.auth().login(&username, &password).await?;
            println!("logged in as {}", user.display_name());
            client.channel().close().await;
            Ok(())
        }
        Commands::Logout => {
            client.auth().logout().await;
            println!("logged out");
            Ok(())
        }
        Commands::Whoami => {
            let user = require_session(&client).await?;
            println!("{} <{}> ({:?})", user.display_name(), user.email, user.role);
            Ok(())
        }
        Commands::Documents { json } => run_documents(&client, json).await,
        Commands::Upload {
            files,
            document_type,
        } => run_upload(&client, files, document_type).await,
        Commands::Delete { id } => {
            require_session(&client).await?;
            // fill the cache so the ownership check has something to go on
            client.documents().list(&client.read_policy()).await?;
            client.documents().delete(&id).await?;
            println!("deleted {}", id);
            Ok(())
        }
        Commands::Query {
            id,
            question,
            method,
        } => {
            require_session(&client).await?;
            let answer = client
                .documents()
                .query(&id, &question, method, &client.read_policy())
                .await?;
            println!("{}", answer.answer.trim());
            for source in &answer.sources {
                println!("  source: {}", source);
            }
            Ok(())
        }
        Commands::Chat { id, mode } => run_chat(&client, id, mode).await,
    }
}

/// Restore the stored session; the channel it opens is not needed for one-shot commands.
async fn require_session(client: &Client) -> anyhow::Result<lib::models::UserProfile> {
    let Some(user) = client.auth().restore().await else {
        bail!("not logged in; run `docchat login`");
    };
    client.channel().close().await;
    Ok(user)
}

async fn read_password() -> anyhow::Result<String> {
    print!("password: ");
    std::io::stdout().flush()?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let line = lines
        .next_line()
        .await?
        .context("no password given on stdin")?;
    Ok(line.trim_end().to_string())
}

async fn run_documents(client: &Client, json: bool) -> anyhow::Result<()> {
    require_session(client).await?;
    let docs = client.documents().list(&client.read_policy()).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&*docs)?);
        return Ok(());
    }
    if docs.is_empty() {
        println!("no documents");
    }
    for doc in docs.iter() {
        let created = doc
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!("{:>8}  {:<11} {:<16} {}", doc.id, format!("{:?}", doc.status), created, doc.title);
    }
    Ok(())
}

async fn run_upload(
    client: &Client,
    files: Vec<PathBuf>,
    document_type: Option<DocumentType>,
) -> anyhow::Result<()> {
    require_session(client).await?;
    let mut failed = 0;
    for path in files {
        let file = UploadFile::from_path(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let task = client
            .documents()
            .upload(&file, document_type, |t| {
                log::info!("{}: {}%", t.file_name, t.progress);
            })
            .await;
        match task.outcome {
            UploadOutcome::Success(doc) => println!("{} -> document {}", task.file_name, doc.id),
            UploadOutcome::Error(e) => {
                failed += 1;
                eprintln!("{}: {}", task.file_name, e);
            }
            UploadOutcome::Pending => {}
        }
    }
    if failed > 0 {
        bail!("{} upload(s) failed", failed);
    }
    Ok(())
}

async fn run_chat(client: &Client, document_id: String, mode: RagMode) -> anyhow::Result<()> {
    if client.auth().restore().await.is_none() {
        bail!("not logged in; run `docchat login`");
    }
    let mut state = client.channel().watch_state();
    tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| *s == ConnectionState::Open),
    )
    .await
    .context("timed out connecting to the realtime channel")?
    .context("realtime channel stopped")?;

    let mut chat = client.chat(document_id, mode);
    let mut events = client.channel().events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut streamed = false;
    println!("connected; /mode <traditional|graph> switches retrieval, /exit quits");
    prompt()?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = line.trim();
                if input.is_empty() {
                    prompt()?;
                    continue;
                }
                if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
                    break;
                }
                if let Some(mode) = input.strip_prefix("/mode ") {
                    match mode.parse::<RagMode>() {
                        Ok(m) => {
                            chat.set_rag_mode(m);
                            println!("mode: {:?}", m);
                        }
                        Err(e) => eprintln!("{}", e),
                    }
                    prompt()?;
                    continue;
                }
                if let Err(e) = chat.send(input) {
                    eprintln!("not sent: {}", e);
                    prompt()?;
                }
            }
            ev = events.recv() => {
                let ev = match ev {
                    Ok(ev) => ev,
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("skipped {} realtime events", n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if !client.dispatch(&ev, Some(&mut chat)).chat {
                    if let ServerEvent::Notification { title, message, .. } = &ev {
                        println!("[{}] {}", title.as_deref().unwrap_or("notice"), message);
                    }
                    continue;
                }
                match &ev {
                    ServerEvent::ChatPartial { content, .. } => {
                        if !streamed {
                            print!("< ");
                            streamed = true;
                        }
                        print!("{}", content);
                        std::io::stdout().flush()?;
                    }
                    ServerEvent::ChatResponse { content, .. } => {
                        if streamed {
                            println!();
                        } else {
                            println!("< {}", content.answer().trim());
                        }
                        streamed = false;
                        prompt()?;
                    }
                    _ => {}
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let now = *state.borrow_and_update();
                if now != ConnectionState::Open && chat.abandon_pending() {
                    if streamed {
                        println!();
                        streamed = false;
                    }
                    eprintln!("[connection lost before the answer; ask again once connected]");
                }
                match now {
                    ConnectionState::Reconnecting { attempt } => eprintln!("[reconnecting, attempt {}]", attempt),
                    ConnectionState::Open => eprintln!("[connected]"),
                    ConnectionState::Closed if !client.session().is_authenticated() => {
                        eprintln!("[session ended]");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    client.channel().close().await;
    Ok(())
}

fn prompt() -> anyhow::Result<()> {
    print!("> ");
    std::io::stdout().flush()?;
    Ok(())
}
