//! Admin commands issued in chat.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use escalation::{ChatMessage, CommandHandler, Level, Member};
use notify::{ChatTransport, OutboundMessage};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::alertmanager::{humanize, AlertmanagerClient};
use crate::store::{Store, SubscribedChat};

const HELP: &str = "\
I relay alerts from Alertmanager and escalate them until someone acknowledges.

/start - Subscribe this chat to alerts
/stop - Unsubscribe this chat
/chats - List subscribed chats
/members - List escalation members
/nodes - List node owners
/addmember <username> <level> [node] - Add a member at level 1-3; level 1 needs a node
/rmmember <username> - Remove a member
/status - Show relay and Alertmanager status
/alerts - List alerts known to Alertmanager
/silences - List Alertmanager silences
/help - Show this help";

const UNKNOWN: &str = "Sorry, I don't understand...";
const NO_ALERTMANAGER: &str = "Alertmanager URL is not configured.";

/// A parsed admin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Help,
    Chats,
    Members,
    Nodes,
    Status,
    Alerts,
    Silences,
    AddMember {
        username: String,
        level: Level,
        node: Option<String>,
    },
    RemoveMember {
        username: String,
    },
}

/// Why a message did not parse into a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Not a command, or one addressed to another bot
    Ignored,
    Unknown,
    Usage(&'static str),
}

const ADD_USAGE: &str = "Usage: /addmember <username> <level> [node]";
const RM_USAGE: &str = "Usage: /rmmember <username>";

impl Command {
    /// Parse `text`, accepting `/cmd@bot` only when `bot` matches.
    pub fn parse(text: &str, bot: &str) -> Result<Self, ParseError> {
        let mut words = text.split_whitespace();
        let Some(head) = words.next().and_then(|w| w.strip_prefix('/')) else {
            return Err(ParseError::Ignored);
        };
        let name = match head.split_once('@') {
            Some((name, target)) if target.eq_ignore_ascii_case(bot) => name,
            Some(_) => return Err(ParseError::Ignored),
            None => head,
        };
        let args: Vec<&str> = words.collect();

        match name {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "help" => Ok(Self::Help),
            "chats" => Ok(Self::Chats),
            "members" => Ok(Self::Members),
            "nodes" => Ok(Self::Nodes),
            "status" => Ok(Self::Status),
            "alerts" => Ok(Self::Alerts),
            "silences" => Ok(Self::Silences),
            "addmember" => Self::parse_add(&args),
            "rmmember" => match args.as_slice() {
                [username] => Ok(Self::RemoveMember {
                    username: strip_at(username),
                }),
                _ => Err(ParseError::Usage(RM_USAGE)),
            },
            _ => Err(ParseError::Unknown),
        }
    }

    fn parse_add(args: &[&str]) -> Result<Self, ParseError> {
        let (username, level, node) = match args {
            [username, level] => (username, level, None),
            [username, level, node] => (username, level, Some((*node).to_string())),
            _ => return Err(ParseError::Usage(ADD_USAGE)),
        };
        let level: Level = level
            .parse()
            .map_err(|_| ParseError::Usage("Level must be 1, 2 or 3"))?;
        if level == Level::L1 && node.is_none() {
            return Err(ParseError::Usage("Level 1 members must own a node"));
        }
        Ok(Self::AddMember {
            username: strip_at(username),
            level,
            node,
        })
    }
}

fn strip_at(username: &str) -> String {
    username.trim_start_matches('@').to_string()
}

/// Handles admin commands against the store and replies in the same chat.
pub struct BotCommands {
    store: Arc<Store>,
    transport: Arc<dyn ChatTransport>,
    admins: HashSet<i64>,
    bot_username: String,
    alertmanager: Option<AlertmanagerClient>,
    started_at: DateTime<Utc>,
}

impl BotCommands {
    pub fn new(
        store: Arc<Store>,
        transport: Arc<dyn ChatTransport>,
        admins: impl IntoIterator<Item = i64>,
        bot_username: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transport,
            admins: admins.into_iter().collect(),
            bot_username: bot_username.into(),
            alertmanager: None,
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_alertmanager(mut self, client: AlertmanagerClient) -> Self {
        self.alertmanager = Some(client);
        self
    }

    /// Start time reported by `/status`.
    #[must_use]
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    async fn status(&self) -> String {
        let mut text = String::new();
        match &self.alertmanager {
            Some(client) => match client.status().await {
                Ok(status) => {
                    let _ = writeln!(
                        text,
                        "Alertmanager\nVersion: {}\nUptime: {}",
                        status.version_info.version,
                        humanize(Utc::now() - status.uptime)
                    );
                }
                Err(e) => {
                    warn!(url = client.base_url(), error = %e, "Failed to get Alertmanager status");
                    let _ = writeln!(text, "Failed to get Alertmanager status: {e:#}");
                }
            },
            None => {
                let _ = writeln!(text, "{NO_ALERTMANAGER}");
            }
        }
        let _ = write!(
            text,
            "Alert relay\nVersion: {}\nUptime: {}",
            env!("CARGO_PKG_VERSION"),
            humanize(Utc::now() - self.started_at)
        );
        text
    }

    async fn alerts(&self) -> String {
        let Some(client) = &self.alertmanager else {
            return NO_ALERTMANAGER.to_string();
        };
        match client.alerts().await {
            Ok(alerts) if alerts.is_empty() => "No alerts right now! 🎉".to_string(),
            Ok(alerts) => alerts
                .iter()
                .map(|a| a.describe())
                .collect::<Vec<_>>()
                .join("\n\n"),
            Err(e) => {
                warn!(url = client.base_url(), error = %e, "Failed to list alerts");
                format!("Failed to list alerts: {e:#}")
            }
        }
    }

    async fn silences(&self) -> String {
        let Some(client) = &self.alertmanager else {
            return NO_ALERTMANAGER.to_string();
        };
        match client.silences().await {
            Ok(silences) => {
                let live: Vec<String> = silences
                    .iter()
                    .filter(|s| !s.is_expired())
                    .map(|s| s.describe())
                    .collect();
                if live.is_empty() {
                    "No silences right now.".to_string()
                } else {
                    live.join("\n\n")
                }
            }
            Err(e) => {
                warn!(url = client.base_url(), error = %e, "Failed to list silences");
                format!("Failed to list silences: {e:#}")
            }
        }
    }

    async fn execute(&self, command: Command, message: &ChatMessage) -> Result<String> {
        let reply = match command {
            Command::Start => {
                let chat = SubscribedChat {
                    id: message.chat,
                    name: message.chat_name.clone(),
                };
                if self.store.add_chat(chat).await? {
                    info!(chat = message.chat, name = %message.chat_name, "Chat subscribed");
                    format!(
                        "Hey, {}! I will now keep you up to date!\n/help",
                        message.sender
                    )
                } else {
                    "This chat is already subscribed.".to_string()
                }
            }
            Command::Stop => {
                if self.store.remove_chat(message.chat).await? {
                    info!(chat = message.chat, "Chat unsubscribed");
                    format!(
                        "Alright, {}! I won't talk to you again.\n/help",
                        message.sender
                    )
                } else {
                    "This chat is not subscribed.".to_string()
                }
            }
            Command::Help => HELP.to_string(),
            Command::Chats => {
                let chats = self.store.chats().await;
                if chats.is_empty() {
                    "No chats have subscribed.".to_string()
                } else {
                    let mut text = String::from("Currently these chats have subscribed:");
                    for chat in chats {
                        let _ = write!(text, "\n{} ({})", chat.name, chat.id);
                    }
                    text
                }
            }
            Command::Members => {
                let mut members: Vec<Member> = self
                    .store
                    .members()
                    .await
                    .into_iter()
                    .filter(|m| m.chat == message.chat)
                    .collect();
                members.sort_by(|a, b| a.level.cmp(&b.level).then(a.username.cmp(&b.username)));
                if members.is_empty() {
                    "No members in this chat.".to_string()
                } else {
                    let mut text = String::from("Members:");
                    for m in members {
                        let _ = write!(text, "\n@{} level: {}", m.username, m.level);
                    }
                    text
                }
            }
            Command::Nodes => {
                let nodes = self.store.nodes().await;
                if nodes.is_empty() {
                    "No node owners.".to_string()
                } else {
                    let mut text = String::from("Nodes:");
                    for n in nodes {
                        let _ = write!(text, "\n{} owner: @{}", n.node, n.owner);
                    }
                    text
                }
            }
            Command::Status => self.status().await,
            Command::Alerts => self.alerts().await,
            Command::Silences => self.silences().await,
            Command::AddMember {
                username,
                level,
                node,
            } => {
                let member = Member::new(username.clone(), level, message.chat);
                self.store.add_member(member, node.as_deref()).await?;
                info!(username = %username, level = %level, node = ?node, "Member added");
                match node {
                    Some(node) => format!("Added @{username} at level {level}, owning {node}"),
                    None => format!("Added @{username} at level {level}"),
                }
            }
            Command::RemoveMember { username } => {
                if self.store.remove_member(&username).await? {
                    info!(username = %username, "Member removed");
                    format!("Removed @{username}")
                } else {
                    format!("@{username} is not a member")
                }
            }
        };
        Ok(reply)
    }

    async fn reply(&self, message: &ChatMessage, text: String) {
        if let Err(e) = self
            .transport
            .send_message(message.chat, &OutboundMessage::plain(text))
            .await
        {
            error!(chat = message.chat, error = %e, "Failed to send command reply");
        }
    }
}

#[async_trait]
impl CommandHandler for BotCommands {
    async fn handle(&self, message: ChatMessage) {
        if !self.admins.contains(&message.sender_id) {
            warn!(
                sender = %message.sender,
                sender_id = message.sender_id,
                chat = message.chat,
                "Dropped message from forbidden sender"
            );
            return;
        }

        let text = match Command::parse(&message.text, &self.bot_username) {
            Ok(command) => {
                debug!(chat = message.chat, command = ?command, "Executing command");
                match self.execute(command, &message).await {
                    Ok(text) => text,
                    Err(e) => {
                        error!(chat = message.chat, error = %e, "Command failed");
                        format!("Command failed: {e}")
                    }
                }
            }
            Err(ParseError::Ignored) => return,
            Err(ParseError::Unknown) => UNKNOWN.to_string(),
            Err(ParseError::Usage(usage)) => usage.to_string(),
        };
        self.reply(&message, text).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use escalation::Directory;
    use notify::{ChannelError, ChatId, ControlRow, MessageId};
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ADMIN: i64 = 7;

    #[derive(Default)]
    struct Replies(Mutex<Vec<(ChatId, String)>>);

    #[async_trait]
    impl ChatTransport for Replies {
        fn name(&self) -> &'static str {
            "replies"
        }

        async fn send_message(
            &self,
            chat: ChatId,
            message: &OutboundMessage,
        ) -> Result<MessageId, ChannelError> {
            self.0.lock().unwrap().push((chat, message.text.clone()));
            Ok(1)
        }

        async fn edit_controls(
            &self,
            _chat: ChatId,
            _message: MessageId,
            _controls: Option<&ControlRow>,
        ) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn answer_callback(&self, _callback_id: &str) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    fn setup() -> (BotCommands, Arc<Store>, Arc<Replies>) {
        let store = Arc::new(Store::in_memory());
        let replies = Arc::new(Replies::default());
        let commands = BotCommands::new(store.clone(), replies.clone(), [ADMIN], "relay_bot");
        (commands, store, replies)
    }

    fn message(sender_id: i64, text: &str) -> ChatMessage {
        ChatMessage {
            chat: -100,
            chat_name: "ops".to_string(),
            message: 1,
            sender_id,
            sender: "root".to_string(),
            text: text.to_string(),
        }
    }

    fn last_reply(replies: &Replies) -> String {
        replies.0.lock().unwrap().last().unwrap().1.clone()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("/start", "relay_bot"), Ok(Command::Start));
        assert_eq!(
            Command::parse("/help@relay_bot", "relay_bot"),
            Ok(Command::Help)
        );
        assert_eq!(
            Command::parse("/help@other_bot", "relay_bot"),
            Err(ParseError::Ignored)
        );
        assert_eq!(Command::parse("hello", "relay_bot"), Err(ParseError::Ignored));
        assert_eq!(Command::parse("/status", "relay_bot"), Ok(Command::Status));
        assert_eq!(
            Command::parse("/silences@relay_bot", "relay_bot"),
            Ok(Command::Silences)
        );
        assert_eq!(Command::parse("/uptime", "relay_bot"), Err(ParseError::Unknown));
        assert_eq!(
            Command::parse("/addmember @bob 2", "relay_bot"),
            Ok(Command::AddMember {
                username: "bob".into(),
                level: Level::L2,
                node: None
            })
        );
        assert_eq!(
            Command::parse("/rmmember @bob", "relay_bot"),
            Ok(Command::RemoveMember {
                username: "bob".into()
            })
        );
    }

    #[test]
    fn test_parse_addmember_validation() {
        assert_eq!(
            Command::parse("/addmember bob", "b"),
            Err(ParseError::Usage(ADD_USAGE))
        );
        assert!(matches!(
            Command::parse("/addmember bob 4 n", "b"),
            Err(ParseError::Usage(_))
        ));
        assert!(matches!(
            Command::parse("/addmember bob 1", "b"),
            Err(ParseError::Usage(_))
        ));
        assert_eq!(
            Command::parse("/addmember bob 1 node-1", "b"),
            Ok(Command::AddMember {
                username: "bob".into(),
                level: Level::L1,
                node: Some("node-1".into())
            })
        );
    }

    #[tokio::test]
    async fn test_non_admin_is_dropped() {
        let (commands, store, replies) = setup();
        commands.handle(message(99, "/start")).await;
        assert!(replies.0.lock().unwrap().is_empty());
        assert!(store.chats().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (commands, store, replies) = setup();
        commands.handle(message(ADMIN, "/start")).await;
        assert!(last_reply(&replies).starts_with("Hey, root!"));
        assert_eq!(
            store.chats().await,
            vec![SubscribedChat {
                id: -100,
                name: "ops".into()
            }]
        );

        commands.handle(message(ADMIN, "/chats")).await;
        assert!(last_reply(&replies).contains("ops (-100)"));

        commands.handle(message(ADMIN, "/stop@relay_bot")).await;
        assert!(last_reply(&replies).starts_with("Alright, root!"));
        assert!(store.chats().await.is_empty());
    }

    #[tokio::test]
    async fn test_member_management() {
        let (commands, store, replies) = setup();
        commands
            .handle(message(ADMIN, "/addmember alice 1 node-1"))
            .await;
        commands.handle(message(ADMIN, "/addmember carol 2")).await;

        assert_eq!(
            store.resolve_owner("node-1").await.unwrap().as_deref(),
            Some("alice")
        );
        commands.handle(message(ADMIN, "/members")).await;
        assert_eq!(
            last_reply(&replies),
            "Members:\n@alice level: 1\n@carol level: 2"
        );
        commands.handle(message(ADMIN, "/nodes")).await;
        assert_eq!(last_reply(&replies), "Nodes:\nnode-1 owner: @alice");

        commands.handle(message(ADMIN, "/rmmember alice")).await;
        assert_eq!(last_reply(&replies), "Removed @alice");
        commands.handle(message(ADMIN, "/rmmember alice")).await;
        assert_eq!(last_reply(&replies), "@alice is not a member");
    }

    #[tokio::test]
    async fn test_unknown_and_usage_replies() {
        let (commands, _store, replies) = setup();
        commands.handle(message(ADMIN, "/silence")).await;
        assert_eq!(last_reply(&replies), UNKNOWN);
        commands.handle(message(ADMIN, "/addmember bob")).await;
        assert_eq!(last_reply(&replies), ADD_USAGE);

        let count = replies.0.lock().unwrap().len();
        commands.handle(message(ADMIN, "just chatting")).await;
        assert_eq!(replies.0.lock().unwrap().len(), count);
    }

    #[tokio::test]
    async fn test_status_without_alertmanager() {
        let (commands, _store, replies) = setup();
        let commands = commands.with_started_at(Utc::now() - chrono::Duration::seconds(3_720));
        commands.handle(message(ADMIN, "/status")).await;
        assert_eq!(
            last_reply(&replies),
            format!(
                "{NO_ALERTMANAGER}\nAlert relay\nVersion: {}\nUptime: 1h 2m",
                env!("CARGO_PKG_VERSION")
            )
        );

        commands.handle(message(ADMIN, "/alerts")).await;
        assert_eq!(last_reply(&replies), NO_ALERTMANAGER);
    }

    #[tokio::test]
    async fn test_alertmanager_queries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "versionInfo": {"version": "0.27.0"},
                "uptime": "2024-01-01T00:00:00Z"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/alerts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/silences"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (commands, _store, replies) = setup();
        let commands =
            commands.with_alertmanager(AlertmanagerClient::new(server.uri()).unwrap());

        commands.handle(message(ADMIN, "/status")).await;
        let reply = last_reply(&replies);
        assert!(reply.starts_with("Alertmanager\nVersion: 0.27.0\nUptime: "));
        assert!(reply.contains("\nAlert relay\nVersion: "));

        commands.handle(message(ADMIN, "/alerts")).await;
        assert_eq!(last_reply(&replies), "No alerts right now! 🎉");

        commands.handle(message(ADMIN, "/silences")).await;
        assert!(last_reply(&replies).starts_with("Failed to list silences: "));
    }
}
