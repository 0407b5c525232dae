use std::env;

use log::warn;
use tokio::io::{AsyncBufReadExt, BufReader};

use studymatch_chat::client::services::api_client::AuthTokens;
use studymatch_chat::client::services::chat_service::ChatService;
use studymatch_chat::client::services::conversation_service::ConversationDirectory;
use studymatch_chat::client::session::{ClientSession, SendOutcome};
use studymatch_chat::client::utils::session_store;
use studymatch_chat::config::ClientConfig;

fn load_tokens() -> Option<AuthTokens> {
    if let Ok(access) = env::var("STUDYMATCH_TOKEN") {
        return Some(AuthTokens {
            access,
            refresh: env::var("STUDYMATCH_REFRESH_TOKEN").ok(),
        });
    }
    session_store::load_tokens().map(|(access, refresh)| AuthTokens { access, refresh })
}

fn print_directory(chat: &ChatService) {
    println!("=== Conversations ({} unread) ===", chat.directory.total_unread());
    for conv in chat.directory.conversations() {
        let other = conv
            .other_participant(chat.me())
            .map(|p| p.display_name.as_str())
            .unwrap_or("<unknown>");
        let online = if ConversationDirectory::has_online_user(conv, &chat.presence, chat.me()) {
            "online"
        } else {
            "offline"
        };
        let notice = conv
            .notice()
            .map(|n| format!(" [{:?}]", n))
            .unwrap_or_default();
        println!(
            "  {}  {} ({}) unread={}{}",
            conv.id, other, online, conv.unread_count, notice
        );
    }
}

fn print_messages(chat: &ChatService) {
    for msg in chat.messages() {
        let who = if msg.sender_id == chat.me() { "me" } else { msg.sender_id.as_str() };
        println!("  [{}] {}: {} ({:?})", msg.sent_at.format("%H:%M"), who, msg.content, msg.status);
    }
    if let Some(active) = chat.active_conversation_id() {
        if let Some(user) = chat.typing_user(active) {
            println!("  ... {} is typing", user);
        }
    }
}

fn prompt() {
    use std::io::Write;
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn print_help() {
    println!("Commands:");
    println!("  /list                 reload and show conversations");
    println!("  /open <id>            open a conversation");
    println!("  /unmatch <user> [del] remove a match, optionally deleting the chat");
    println!("  /quit                 disconnect and exit");
    println!("  anything else         send as a message to the open conversation");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = ClientConfig::from_env();

    let tokens = match load_tokens() {
        Some(tokens) => tokens,
        None => {
            eprintln!("No session found. Set STUDYMATCH_TOKEN or log in first.");
            std::process::exit(1);
        }
    };

    let mut session = ClientSession::start(config, tokens).await?;
    println!("Connected as {}", session.user_id());
    print_help();
    {
        let chat = session.chat();
        print_directory(&*chat.lock().await);
    }

    let mut active: Option<String> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        if line == "/quit" {
            break;
        } else if line == "/help" {
            print_help();
        } else if line == "/list" {
            if let Err(e) = session.reload_directory().await {
                warn!("[CLI] reload failed: {}", e);
            }
            let chat = session.chat();
            print_directory(&*chat.lock().await);
        } else if let Some(id) = line.strip_prefix("/open ") {
            let id = id.trim().to_string();
            match session.open_conversation(&id).await {
                Ok(()) => {
                    active = Some(id);
                    let chat = session.chat();
                    print_messages(&*chat.lock().await);
                }
                Err(e) => eprintln!("Could not open conversation: {}", e),
            }
        } else if let Some(rest) = line.strip_prefix("/unmatch ") {
            let mut parts = rest.split_whitespace();
            match parts.next() {
                Some(user) => {
                    let delete_chat = parts.next() == Some("del");
                    match session.remove_match(user, delete_chat).await {
                        Ok(()) => println!("Match removed."),
                        Err(e) => eprintln!("Unmatch failed: {}", e),
                    }
                }
                None => eprintln!("Usage: /unmatch <user> [del]"),
            }
        } else if line.starts_with('/') {
            eprintln!("Unknown command, try /help");
        } else {
            match &active {
                Some(conversation_id) => {
                    let conversation_id = conversation_id.clone();
                    session.on_input_change(&conversation_id, &line).await;
                    match session.send_message(&conversation_id).await {
                        SendOutcome::Sent => {
                            let chat = session.chat();
                            print_messages(&*chat.lock().await);
                        }
                        SendOutcome::Blocked => {
                            eprintln!("Messaging is unavailable in this conversation.")
                        }
                        SendOutcome::Failed(e) => eprintln!("Send failed, draft kept: {}", e),
                    }
                }
                None => eprintln!("Open a conversation first with /open <id>"),
            }
        }
        prompt();
    }

    session.shutdown().await;
    println!("Bye.");
    Ok(())
}
