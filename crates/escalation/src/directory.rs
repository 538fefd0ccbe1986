//! Directory Lookup: who owns a node and who answers at each level.

use async_trait::async_trait;
use notify::ChatId;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::level::Level;

/// A chat member who can be assigned alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Platform username, without the leading `@`
    pub username: String,
    /// Tier this member answers at
    pub level: Level,
    /// Chat the member is on call for
    pub chat: ChatId,
}

impl Member {
    #[must_use]
    pub fn new(username: impl Into<String>, level: Level, chat: ChatId) -> Self {
        Self {
            username: username.into(),
            level,
            chat,
        }
    }
}

/// Node name mapped to the member who owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOwnership {
    pub node: String,
    pub owner: String,
}

/// Lookup failures.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Nobody in the chat answers at the requested level
    #[error("no member at level {level} in chat {chat}")]
    NoMemberAtLevel { chat: ChatId, level: Level },

    /// Backing store could not be read
    #[error("directory storage error: {0}")]
    Storage(String),
}

/// Resolves assignees for cases.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Owner of `node`, used only for the first level-1 assignment.
    async fn resolve_owner(&self, node: &str) -> Result<Option<String>, DirectoryError>;

    /// A member of `chat` at `level`, chosen uniformly at random.
    async fn random_member_at_level(
        &self,
        chat: ChatId,
        level: Level,
    ) -> Result<Member, DirectoryError>;
}

/// Pick uniformly among the members of `chat` at `level`.
///
/// An empty candidate set is an error, never an implicit choice.
pub fn pick_member<'a>(
    members: impl IntoIterator<Item = &'a Member>,
    chat: ChatId,
    level: Level,
) -> Result<Member, DirectoryError> {
    let candidates: Vec<&Member> = members
        .into_iter()
        .filter(|m| m.chat == chat && m.level == level)
        .collect();

    candidates
        .choose(&mut rand::thread_rng())
        .map(|m| (*m).clone())
        .ok_or(DirectoryError::NoMemberAtLevel { chat, level })
}

/// Directory held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    members: RwLock<Vec<Member>>,
    owners: RwLock<HashMap<String, String>>,
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member, replacing any entry with the same username and chat.
    pub async fn add_member(&self, member: Member) {
        let mut members = self.members.write().await;
        members.retain(|m| !(m.username == member.username && m.chat == member.chat));
        members.push(member);
    }

    /// Remove every entry for `username`. Returns whether anything was removed.
    pub async fn remove_member(&self, username: &str) -> bool {
        let mut members = self.members.write().await;
        let before = members.len();
        members.retain(|m| m.username != username);
        members.len() != before
    }

    pub async fn set_owner(&self, node: impl Into<String>, owner: impl Into<String>) {
        self.owners.write().await.insert(node.into(), owner.into());
    }

    pub async fn members(&self) -> Vec<Member> {
        self.members.read().await.clone()
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn resolve_owner(&self, node: &str) -> Result<Option<String>, DirectoryError> {
        Ok(self.owners.read().await.get(node).cloned())
    }

    async fn random_member_at_level(
        &self,
        chat: ChatId,
        level: Level,
    ) -> Result<Member, DirectoryError> {
        pick_member(self.members.read().await.iter(), chat, level)
    }
}
