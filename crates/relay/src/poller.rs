//! Long-polls Telegram for updates and feeds them into the dispatch loop.

use escalation::{Callback, ChatMessage, DispatchHandle};
use notify::channels::telegram::{CallbackQuery, Message, Update};
use notify::{ChannelError, TelegramChannel};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Inbound update translated for the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(ChatMessage),
    Callback(Callback),
}

/// Translate a Telegram update. Updates that carry nothing the relay acts on
/// yield `None`.
pub fn translate(update: Update) -> Option<Inbound> {
    if let Some(query) = update.callback_query {
        return translate_callback(query).map(Inbound::Callback);
    }
    update
        .message
        .and_then(translate_message)
        .map(Inbound::Message)
}

fn translate_message(message: Message) -> Option<ChatMessage> {
    let text = message.text?;
    if !text.starts_with('/') {
        return None;
    }
    let from = message.from?;
    Some(ChatMessage {
        chat: message.chat.id,
        chat_name: message.chat.display_name(),
        message: message.message_id,
        sender_id: from.id,
        sender: from.handle().to_string(),
        text,
    })
}

fn translate_callback(query: CallbackQuery) -> Option<Callback> {
    let Some(message) = query.message else {
        debug!(query_id = %query.id, "Callback without originating message, ignored");
        return None;
    };
    Some(Callback {
        id: query.id,
        chat: message.chat.id,
        message: Some(message.message_id),
        sender: query.from.handle().to_string(),
        data: query.data,
    })
}

/// Poll until the dispatch loop stops accepting events.
pub async fn run(telegram: Arc<TelegramChannel>, handle: DispatchHandle, timeout_secs: u64) {
    let mut offset: Option<i64> = None;
    let mut backoff = INITIAL_BACKOFF;
    info!(timeout_secs, "Polling Telegram for updates");

    loop {
        let updates = match telegram.get_updates(offset, timeout_secs).await {
            Ok(updates) => {
                backoff = INITIAL_BACKOFF;
                updates
            }
            Err(ChannelError::RateLimited { retry_after_secs }) => {
                warn!(retry_after_secs, "Telegram rate limit hit while polling");
                tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
                continue;
            }
            Err(e) => {
                warn!(error = %e, backoff_secs = backoff.as_secs(), "Polling failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        for update in updates {
            offset = Some(update.update_id + 1);
            let submitted = match translate(update) {
                Some(Inbound::Message(message)) => handle.submit_message(message).await,
                Some(Inbound::Callback(callback)) => handle.submit_callback(callback).await,
                None => Ok(()),
            };
            if submitted.is_err() {
                info!("Dispatch loop closed, polling stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(json: &str) -> Update {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_command_message() {
        let inbound = translate(update(
            r#"{"update_id": 1, "message": {
                "message_id": 5,
                "from": {"id": 7, "first_name": "Root", "username": "root"},
                "chat": {"id": -100, "type": "group", "title": "ops"},
                "text": "/start"
            }}"#,
        ));
        assert_eq!(
            inbound,
            Some(Inbound::Message(ChatMessage {
                chat: -100,
                chat_name: "ops".into(),
                message: 5,
                sender_id: 7,
                sender: "root".into(),
                text: "/start".into(),
            }))
        );
    }

    #[test]
    fn test_plain_chatter_is_ignored() {
        let inbound = translate(update(
            r#"{"update_id": 1, "message": {
                "message_id": 5,
                "from": {"id": 7, "first_name": "Root"},
                "chat": {"id": -100, "type": "group"},
                "text": "is anyone looking at node-1?"
            }}"#,
        ));
        assert_eq!(inbound, None);
    }

    #[test]
    fn test_callback_query() {
        let inbound = translate(update(
            r#"{"update_id": 2, "callback_query": {
                "id": "q1",
                "from": {"id": 8, "first_name": "Bob", "username": "bob"},
                "message": {"message_id": 9, "chat": {"id": -100, "type": "group"}},
                "data": "{\"button\":\"Forward\",\"alert\":\"X\"}"
            }}"#,
        ));
        assert_eq!(
            inbound,
            Some(Inbound::Callback(Callback {
                id: "q1".into(),
                chat: -100,
                message: Some(9),
                sender: "bob".into(),
                data: Some(r#"{"button":"Forward","alert":"X"}"#.into()),
            }))
        );
    }

    #[test]
    fn test_callback_without_message_is_ignored() {
        let inbound = translate(update(
            r#"{"update_id": 3, "callback_query": {
                "id": "q2",
                "from": {"id": 8, "first_name": "Bob"}
            }}"#,
        ));
        assert_eq!(inbound, None);
    }
}
