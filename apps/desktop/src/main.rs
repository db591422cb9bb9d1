use anyhow::Result;
use chat_core::{ChatClient, ChatConfig, ChatEvent};
use clap::Parser;
use shared::{domain::UserId, protocol::UserProfile};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    username: String,
    #[arg(long, default_value = "")]
    email: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let current_user = UserProfile {
        id: UserId::new(args.user_id),
        username: args.username,
        email: args.email,
    };
    let client = ChatClient::new(ChatConfig::new(current_user, args.server_url))?;
    println!("Signed in as {}", client.current_user().username);

    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ChatEvent::MembersLoaded { members, .. } => {
                    let names: Vec<&str> = members.iter().map(|m| m.username.as_str()).collect();
                    println!("members: {}", names.join(", "));
                }
                ChatEvent::HistoryLoaded { messages, .. } => {
                    for message in &messages {
                        println!(
                            "[{}] {}: {}",
                            message.sent_datetime, message.from_user, message.content
                        );
                    }
                }
                ChatEvent::MessageAppended { message, .. } => {
                    println!("[{}] {}: {}", message.sent_datetime, message.from_user, message.content);
                }
                ChatEvent::ChannelStateChanged { state, .. } => {
                    println!("(live channel: {state:?})");
                }
                ChatEvent::Error(message) => {
                    eprintln!("error: {message}");
                }
                ChatEvent::ConversationsLoaded(_) => {}
            }
        }
    });

    let conversations = client.list_conversations().await?;
    if conversations.is_empty() {
        println!("No conversations for this user.");
        return Ok(());
    }
    for (index, conversation) in conversations.iter().enumerate() {
        let name = conversation
            .conversation_name
            .as_deref()
            .unwrap_or("(unnamed)");
        println!("{index}: {name} [{}]", conversation.conversation_id);
    }

    let selected = conversations[0].conversation_id.clone();
    println!("Joining conversation {selected}. Type a message and press enter; ctrl-d quits.");
    client.select_conversation(selected.clone()).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if let Err(err) = client.send_message(selected.clone(), &line).await {
            eprintln!("send failed: {err}");
        }
    }

    client.close().await;
    Ok(())
}
