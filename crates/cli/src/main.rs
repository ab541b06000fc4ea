use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use handoff::conversation::ConversationKey;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "handoff")]
#[command(about = "Handoff CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config.
    Init {
        /// Config file path (default: HANDOFF_CONFIG_PATH or ~/.handoff/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the gateway (webhook, live-agent REST and WebSocket, inactivity survey).
    Gateway {
        /// Config file path (default: HANDOFF_CONFIG_PATH or ~/.handoff/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP and WebSocket port (default from config or 8080)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Print a stored conversation record as JSON (reads the last flushed store snapshot).
    Conversation {
        /// Config file path (default: HANDOFF_CONFIG_PATH or ~/.handoff/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        #[arg(long, value_name = "ID")]
        agent: String,

        #[arg(long, value_name = "ID")]
        conversation: String,
    },

    /// Join a conversation as a human representative and chat through the gateway (interactive).
    Console {
        /// Config file path (default: HANDOFF_CONFIG_PATH or ~/.handoff/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        #[arg(long, value_name = "ID")]
        agent: String,

        #[arg(long, value_name = "ID")]
        conversation: String,

        /// Representative display name shown to the user.
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("handoff {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Conversation {
            config,
            agent,
            conversation,
        }) => {
            if let Err(e) = run_conversation(config, ConversationKey::new(agent, conversation)).await {
                log::error!("conversation failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Console {
            config,
            agent,
            conversation,
            name,
        }) => {
            if let Err(e) = run_console(config, ConversationKey::new(agent, conversation), name).await {
                log::error!("console failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(handoff::config::default_config_path);
    let dir = handoff::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = handoff::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    handoff::gateway::run_gateway(config, path).await
}

async fn run_conversation(
    config_path: Option<std::path::PathBuf>,
    key: ConversationKey,
) -> anyhow::Result<()> {
    let (config, path) = handoff::config::load_config(config_path)?;
    let store_path = handoff::config::resolve_store_path(&config, &path);
    let store = handoff::store::ConversationStore::load(&store_path).await?;
    let record = store
        .get(&key)
        .await
        .ok_or_else(|| anyhow::anyhow!("conversation not found: {}", key))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Send a request and wait for its response, printing any events that arrive in between.
async fn request(
    ws: &mut WsStream,
    key: &ConversationKey,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, String> {
    let req = serde_json::json!({
        "type": "req",
        "id": id,
        "method": method,
        "params": params
    });
    ws.send(Message::Text(req.to_string()))
        .await
        .map_err(|e| e.to_string())?;

    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| e.to_string())?;
        let Message::Text(text) = msg else { continue };
        let res: serde_json::Value = serde_json::from_str(&text).map_err(|e| e.to_string())?;
        if res.get("type").and_then(|v| v.as_str()) == Some("event") {
            print_event(&res, key);
            continue;
        }
        if res.get("id").and_then(|v| v.as_str()) != Some(id) {
            continue;
        }
        if !res.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
            let err = res
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("request failed");
            return Err(err.to_string());
        }
        return Ok(res.get("payload").cloned().unwrap_or_default());
    }
    Err(format!("connection closed before {} response", method))
}

/// True when a desk event payload is about the conversation `key`.
fn concerns(payload: &serde_json::Value, key: &ConversationKey) -> bool {
    let field = |k: &str| payload.get(k).and_then(|v| v.as_str()).unwrap_or("");
    field("agentId") == key.agent_id && field("conversationId") == key.conversation_id
}

/// Print a gateway event frame if it concerns `key`. Returns true when the gateway is shutting down.
fn print_event(frame: &serde_json::Value, key: &ConversationKey) -> bool {
    match frame.get("event").and_then(|v| v.as_str()) {
        Some("shutdown") => {
            println!("* gateway shutting down");
            true
        }
        Some("desk") => {
            let payload = frame.get("payload").cloned().unwrap_or_default();
            if !concerns(&payload, key) {
                return false;
            }
            let field = |k: &str| payload.get(k).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let conv = key.to_string();
            match field("event").as_str() {
                "userMessage" => println!("< [{}] {}: {}", conv, field("displayName"), field("text")),
                "userTyping" => {
                    let typing = payload.get("isTyping").and_then(|v| v.as_bool()).unwrap_or(false);
                    if typing {
                        println!("* [{}] user is typing", conv);
                    }
                }
                "liveAgentRequested" => {
                    println!("* [{}] {} requested a live agent", conv, field("displayName"))
                }
                _ => {}
            }
            false
        }
        _ => false,
    }
}

async fn run_console(
    config_path: Option<std::path::PathBuf>,
    key: ConversationKey,
    name: String,
) -> anyhow::Result<()> {
    let (config, _) = handoff::config::load_config(config_path)?;
    let bind = match config.gateway.bind.trim() {
        "0.0.0.0" | "" => "127.0.0.1",
        "::" => "::1",
        b => b,
    };
    let token = handoff::config::resolve_gateway_token(&config);
    let ws_url = format!("ws://{}:{}/ws", bind, config.gateway.port);

    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await?;

    let mut connect_params = serde_json::json!({
        "maxProtocol": 1,
        "client": { "id": "handoff-cli", "version": env!("CARGO_PKG_VERSION") }
    });
    if let Some(ref t) = token {
        connect_params["auth"] = serde_json::json!({ "token": t });
    }
    request(&mut ws, &key, "connect", "connect", connect_params)
        .await
        .map_err(anyhow::Error::msg)?;

    let conv = serde_json::json!({
        "agentId": key.agent_id,
        "conversationId": key.conversation_id,
    });
    let mut join = conv.clone();
    join["name"] = serde_json::Value::String(name.clone());
    request(&mut ws, &key, "join", "join", join)
        .await
        .map_err(anyhow::Error::msg)?;
    println!("joined {} as {} (type /leave to hand back to the bot)", key, name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut next_id: u64 = 0;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                next_id += 1;
                let id = next_id.to_string();
                if input.eq_ignore_ascii_case("/leave") {
                    match request(&mut ws, &key, &id, "leave", conv.clone()).await {
                        Ok(_) => println!("left {}", key),
                        Err(e) => eprintln!("leave error: {}", e),
                    }
                    break;
                }
                let mut params = conv.clone();
                params["text"] = serde_json::Value::String(input.to_string());
                if let Err(e) = request(&mut ws, &key, &id, "send", params).await {
                    eprintln!("send error: {}", e);
                }
            }
            msg = ws.next() => {
                let Some(msg) = msg else { break };
                let Message::Text(text) = msg? else { continue };
                let Ok(frame) = serde_json::from_str::<serde_json::Value>(&text) else { continue };
                if frame.get("type").and_then(|v| v.as_str()) == Some("event") && print_event(&frame, &key) {
                    break;
                }
            }
        }
    }

    let _ = ws.close(None).await;
    Ok(())
}
