//! In-memory registry of alert cases, owned exclusively by the dispatch loop.

use chrono::{DateTime, Duration, Utc};
use notify::{ChatId, MessageId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::case::{AlertCase, CaseId};

/// How a firing notification for an already-tracked correlation ID is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Ignore the firing while an unresolved case exists for the same ID and chat
    #[default]
    FirstFiringWins,
    /// Every firing opens its own case
    Independent,
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FirstFiringWins => "first-firing-wins",
            Self::Independent => "independent",
        })
    }
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-firing-wins" => Ok(Self::FirstFiringWins),
            "independent" => Ok(Self::Independent),
            other => Err(format!(
                "unknown duplicate policy {other:?} (expected first-firing-wins or independent)"
            )),
        }
    }
}

/// Correlation ID mapped to the cases carrying it.
#[derive(Debug, Default)]
pub struct AlertRegistry {
    policy: DuplicatePolicy,
    cases: HashMap<String, Vec<AlertCase>>,
    next_id: u64,
}

impl AlertRegistry {
    #[must_use]
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            policy,
            cases: HashMap::new(),
            next_id: 1,
        }
    }

    #[must_use]
    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Whether a firing for `alert_id` in `chat` should open a new case.
    #[must_use]
    pub fn admits(&self, alert_id: &str, chat: ChatId) -> bool {
        match self.policy {
            DuplicatePolicy::Independent => true,
            DuplicatePolicy::FirstFiringWins => !self
                .cases
                .get(alert_id)
                .is_some_and(|cases| cases.iter().any(|c| c.chat == chat && !c.resolved)),
        }
    }

    /// Reserve an identity for a case about to be opened.
    pub fn allocate_id(&mut self) -> CaseId {
        let id = CaseId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        id
    }

    /// Track a new case. Under first-firing-wins a resolved case for the same
    /// ID and chat is replaced.
    pub fn insert(&mut self, case: AlertCase) {
        let cases = self.cases.entry(case.alert_id.clone()).or_default();
        if self.policy == DuplicatePolicy::FirstFiringWins {
            cases.retain(|c| c.chat != case.chat || !c.resolved);
        }
        cases.push(case);
    }

    #[must_use]
    pub fn get(&self, id: CaseId) -> Option<&AlertCase> {
        self.cases.values().flatten().find(|c| c.id == id)
    }

    pub fn get_mut(&mut self, id: CaseId) -> Option<&mut AlertCase> {
        self.cases.values_mut().flatten().find(|c| c.id == id)
    }

    /// Case a button press refers to.
    ///
    /// Prefers the case whose outward message is `message`, then the newest
    /// unresolved case in `chat`, then the newest case in `chat`.
    #[must_use]
    pub fn find_for_callback(
        &self,
        alert_id: &str,
        chat: ChatId,
        message: Option<MessageId>,
    ) -> Option<CaseId> {
        let in_chat: Vec<&AlertCase> = self
            .cases
            .get(alert_id)?
            .iter()
            .filter(|c| c.chat == chat)
            .collect();

        message
            .and_then(|m| in_chat.iter().find(|c| c.message == Some(m)))
            .or_else(|| in_chat.iter().rev().find(|c| !c.resolved))
            .or_else(|| in_chat.last())
            .map(|c| c.id)
    }

    /// Every case carrying `alert_id`, in creation order.
    #[must_use]
    pub fn ids_for(&self, alert_id: &str) -> Vec<CaseId> {
        self.cases
            .get(alert_id)
            .map(|cases| cases.iter().map(|c| c.id).collect())
            .unwrap_or_default()
    }

    /// Drop resolved cases whose last activity is older than `retention`.
    pub fn prune(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let cutoff = now - retention;
        let mut removed = 0;
        self.cases.retain(|alert_id, cases| {
            let before = cases.len();
            cases.retain(|c| !(c.resolved && c.last_activity < cutoff));
            if cases.len() != before {
                debug!(alert_id = %alert_id, count = before - cases.len(), "Pruned resolved cases");
            }
            removed += before - cases.len();
            !cases.is_empty()
        });
        removed
    }

    /// Total cases held, terminal ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cases.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.cases().filter(|c| c.is_active()).count()
    }

    pub fn cases(&self) -> impl Iterator<Item = &AlertCase> {
        self.cases.values().flatten()
    }
}
