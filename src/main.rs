use std::sync::Arc;

use branchchat::accounting::HeuristicTokenCounter;
use branchchat::config::{load_config, AppConfig};
use branchchat::error::ChatError;
use branchchat::observability::init_tracing;
use branchchat::session::{event_channel, ChatSession, StreamEvent};
use branchchat::store::MemoryStore;
use branchchat::transport::{CompletionClient, FileUrls};
use branchchat::tree::types::{ContentPart, FileRef, UserId};
use branchchat::tree::MessageTree;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const CLI_USER: UserId = UserId(1);

/// The command line has no uploads to resolve.
struct NoFiles;

impl FileUrls for NoFiles {
    fn download_url(&self, file: &FileRef) -> Result<String, ChatError> {
        Err(ChatError::NotFound(format!("file {}", file.id)))
    }
}

fn main() {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = if args.first().is_some_and(|arg| arg.ends_with(".yaml") || arg.ends_with(".yml")) {
        args.remove(0)
    } else {
        DEFAULT_CONFIG_PATH.to_string()
    };
    let prompt = args.join(" ");
    if prompt.trim().is_empty() {
        eprintln!("Usage: branchchat [config.yaml] <prompt...>");
        std::process::exit(2);
    }

    let config = load_config(&config_path).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
        std::process::exit(1);
    });

    init_tracing(&config.features);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Failed to initialize Tokio runtime: {e}");
            std::process::exit(1);
        });

    let code = runtime.block_on(run(config, prompt));
    std::process::exit(code);
}

async fn run(config: AppConfig, prompt: String) -> i32 {
    let client = match CompletionClient::new(&config.provider) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            eprintln!("{err}");
            return 1;
        }
    };
    let tree = Arc::new(MessageTree::new(
        Arc::new(MemoryStore::new()),
        Arc::new(HeuristicTokenCounter),
    ));
    let chat = match tree.create_chat(CLI_USER, None) {
        Ok(chat) => chat,
        Err(err) => {
            eprintln!("{err}");
            return 1;
        }
    };
    let session = ChatSession::new(tree, client, Arc::new(NoFiles));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = event_channel(&config.chat);
    let printer = tokio::spawn(async move {
        use std::io::Write;
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Delta { text } => {
                    let _ = write!(stdout, "{text}");
                    let _ = stdout.flush();
                }
                StreamEvent::Done { message_id, usage } => {
                    println!();
                    println!(
                        "[message {message_id}] input={} output={} reliable={}",
                        usage.input_tokens, usage.output_tokens, usage.is_usage_reliable
                    );
                }
                StreamEvent::Error {
                    status,
                    message,
                    partial_message_id,
                } => {
                    println!();
                    eprintln!("[error {status}] {message}");
                    if let Some(id) = partial_message_id {
                        eprintln!("partial response kept as message {id}");
                    }
                }
            }
        }
    });

    let outcome = session
        .send(
            CLI_USER,
            chat.id,
            vec![ContentPart::text(prompt)],
            cancel,
            &tx,
        )
        .await;
    drop(tx);
    let _ = printer.await;

    match outcome {
        Ok(_) => 0,
        Err(_) => 1,
    }
}
