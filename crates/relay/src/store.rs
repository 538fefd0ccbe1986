//! JSON file store for subscribed chats, escalation members and node owners.
//!
//! The whole document is rewritten on every change. Writes go to a sibling
//! temporary file first and are renamed into place.

use anyhow::{Context, Result};
use async_trait::async_trait;
use escalation::{pick_member, Directory, DirectoryError, Level, Member, NodeOwnership};
use notify::ChatId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A chat that receives alert notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribedChat {
    pub id: ChatId,
    pub name: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    chats: Vec<SubscribedChat>,
    #[serde(default)]
    members: Vec<Member>,
    #[serde(default)]
    nodes: Vec<NodeOwnership>,
}

/// Persistent directory backing the relay.
pub struct Store {
    path: Option<PathBuf>,
    data: RwLock<StoreData>,
}

impl Store {
    /// Load the store at `path`, starting empty when the file does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse store {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Store not found, starting empty");
                StoreData::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read store {}", path.display()))
            }
        };

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    /// A store that never touches disk.
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(StoreData::default()),
        }
    }

    pub async fn chats(&self) -> Vec<SubscribedChat> {
        self.data.read().await.chats.clone()
    }

    /// Subscribe a chat. Returns false if it was already subscribed.
    pub async fn add_chat(&self, chat: SubscribedChat) -> Result<bool> {
        let mut data = self.data.write().await;
        if data.chats.iter().any(|c| c.id == chat.id) {
            return Ok(false);
        }
        data.chats.push(chat);
        self.persist(&data).await?;
        Ok(true)
    }

    /// Unsubscribe a chat. Returns false if it was not subscribed.
    pub async fn remove_chat(&self, id: ChatId) -> Result<bool> {
        let mut data = self.data.write().await;
        let before = data.chats.len();
        data.chats.retain(|c| c.id != id);
        if data.chats.len() == before {
            return Ok(false);
        }
        self.persist(&data).await?;
        Ok(true)
    }

    pub async fn members(&self) -> Vec<Member> {
        self.data.read().await.members.clone()
    }

    pub async fn nodes(&self) -> Vec<NodeOwnership> {
        self.data.read().await.nodes.clone()
    }

    /// Add a member, replacing any entry for the same username in the same chat.
    /// When `node` is given the member also becomes its owner.
    pub async fn add_member(&self, member: Member, node: Option<&str>) -> Result<()> {
        let mut data = self.data.write().await;
        data.members
            .retain(|m| !(m.username == member.username && m.chat == member.chat));
        if let Some(node) = node {
            data.nodes.retain(|n| n.node != node);
            data.nodes.push(NodeOwnership {
                node: node.to_string(),
                owner: member.username.clone(),
            });
        }
        data.members.push(member);
        self.persist(&data).await
    }

    /// Remove a member from every chat along with the nodes they own.
    /// Returns false if no such member existed.
    pub async fn remove_member(&self, username: &str) -> Result<bool> {
        let mut data = self.data.write().await;
        let before = data.members.len();
        data.members.retain(|m| m.username != username);
        if data.members.len() == before {
            return Ok(false);
        }
        data.nodes.retain(|n| n.owner != username);
        self.persist(&data).await?;
        Ok(true)
    }

    async fn persist(&self, data: &StoreData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(data)?;
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        debug!(path = %path.display(), "Store saved");
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl Directory for Store {
    async fn resolve_owner(&self, node: &str) -> Result<Option<String>, DirectoryError> {
        Ok(self
            .data
            .read()
            .await
            .nodes
            .iter()
            .find(|n| n.node == node)
            .map(|n| n.owner.clone()))
    }

    async fn random_member_at_level(
        &self,
        chat: ChatId,
        level: Level,
    ) -> Result<Member, DirectoryError> {
        pick_member(&self.data.read().await.members, chat, level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("relay.json")).await.unwrap();
        assert!(store.chats().await.is_empty());
        assert!(store.members().await.is_empty());
    }

    #[tokio::test]
    async fn test_changes_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.json");

        let store = Store::open(&path).await.unwrap();
        assert!(store
            .add_chat(SubscribedChat {
                id: -100,
                name: "ops".into()
            })
            .await
            .unwrap());
        store
            .add_member(Member::new("alice", Level::L1, -100), Some("node-1"))
            .await
            .unwrap();
        store
            .add_member(Member::new("carol", Level::L2, -100), None)
            .await
            .unwrap();
        drop(store);

        let store = Store::open(&path).await.unwrap();
        assert_eq!(store.chats().await.len(), 1);
        assert_eq!(store.members().await.len(), 2);
        assert_eq!(
            store.resolve_owner("node-1").await.unwrap().as_deref(),
            Some("alice")
        );
        assert!(!path.with_file_name("relay.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_duplicate_chat_is_ignored() {
        let store = Store::in_memory();
        let chat = SubscribedChat {
            id: 1,
            name: "ops".into(),
        };
        assert!(store.add_chat(chat.clone()).await.unwrap());
        assert!(!store.add_chat(chat).await.unwrap());
        assert!(store.remove_chat(1).await.unwrap());
        assert!(!store.remove_chat(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_member_drops_owned_nodes() {
        let store = Store::in_memory();
        store
            .add_member(Member::new("alice", Level::L1, 1), Some("node-1"))
            .await
            .unwrap();

        assert!(store.remove_member("alice").await.unwrap());
        assert!(store.nodes().await.is_empty());
        assert!(!store.remove_member("alice").await.unwrap());
        assert!(store.resolve_owner("node-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_readding_member_replaces_level() {
        let store = Store::in_memory();
        store
            .add_member(Member::new("bob", Level::L1, 1), Some("n"))
            .await
            .unwrap();
        store
            .add_member(Member::new("bob", Level::L3, 1), None)
            .await
            .unwrap();

        assert_eq!(store.members().await, vec![Member::new("bob", Level::L3, 1)]);
        let picked = store.random_member_at_level(1, Level::L3).await.unwrap();
        assert_eq!(picked.username, "bob");
        assert!(matches!(
            store.random_member_at_level(1, Level::L1).await,
            Err(DirectoryError::NoMemberAtLevel { .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Store::open(&path).await.is_err());
    }
}
