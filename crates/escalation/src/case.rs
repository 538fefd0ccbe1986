//! Per-alert state machine.
//!
//! Transitions are pure: each returns the outbound [`Effect`]s and the
//! [`TimerCommand`] the dispatch loop must carry out. Nothing here performs I/O
//! or touches timers.

use chrono::{DateTime, Utc};
use notify::{ChatId, ControlRow, MessageId, OutboundMessage};
use serde::Serialize;
use std::fmt;
use tracing::debug;

use crate::callback::controls_for_level;
use crate::level::Level;

/// Registry-assigned identity of one case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CaseId(pub u64);

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "case-{}", self.0)
    }
}

/// Externally visible state of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaseState {
    Active(Level),
    Acknowledged,
    Resolved,
}

/// Who asked for a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// A chat member, by username
    Member(String),
    /// The escalation timer
    System,
}

impl Actor {
    #[must_use]
    pub fn member(username: impl Into<String>) -> Self {
        Self::Member(username.into())
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Member(name) => write!(f, "@{name}"),
            Self::System => f.write_str("system"),
        }
    }
}

/// Outbound action a transition requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Post a message. `track` asks for the returned reference to be
    /// recorded as the case's outward message.
    Send {
        chat: ChatId,
        message: OutboundMessage,
        track: bool,
    },
    /// Replace the control row of the outward message; `None` clears it.
    EditControls {
        chat: ChatId,
        message: MessageId,
        controls: Option<ControlRow>,
    },
}

/// What should happen to the case's escalation timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    /// Start or restart with a fresh deadline
    Restart,
    /// Cancel permanently
    Stop,
    /// Leave as is
    Keep,
}

/// Outcome of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub effects: Vec<Effect>,
    pub timer: TimerCommand,
}

impl Transition {
    fn new(effects: Vec<Effect>, timer: TimerCommand) -> Self {
        Self { effects, timer }
    }
}

/// One alert's life-cycle from creation through acknowledgment or resolution.
#[derive(Debug, Clone, Serialize)]
pub struct AlertCase {
    /// Registry identity
    pub id: CaseId,
    /// Correlation ID of the alert
    pub alert_id: String,
    /// Chat the case lives in
    pub chat: ChatId,
    /// Outward message carrying the controls, once known
    pub message: Option<MessageId>,
    /// Current responsibility tier, never decreases
    pub level: Level,
    pub acknowledged: bool,
    pub resolved: bool,
    /// Member currently assigned
    pub assignee: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Whether an escalation timer should be running
    pub escalation_active: bool,
}

impl AlertCase {
    /// Create a case at level 1 assigned to `assignee`.
    #[must_use]
    pub fn open(
        id: CaseId,
        alert_id: impl Into<String>,
        chat: ChatId,
        assignee: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            alert_id: alert_id.into(),
            chat,
            message: None,
            level: Level::L1,
            acknowledged: false,
            resolved: false,
            assignee: assignee.into(),
            created_at: now,
            last_activity: now,
            escalation_active: true,
        }
    }

    #[must_use]
    pub fn state(&self) -> CaseState {
        if self.resolved {
            CaseState::Resolved
        } else if self.acknowledged {
            CaseState::Acknowledged
        } else {
            CaseState::Active(self.level)
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.acknowledged && !self.resolved
    }

    /// Level a forward would move to, or `None` when no escalation is possible.
    #[must_use]
    pub fn escalation_target(&self) -> Option<Level> {
        if self.is_active() {
            self.level.next()
        } else {
            None
        }
    }

    /// Controls matching the current level.
    #[must_use]
    pub fn controls(&self) -> ControlRow {
        controls_for_level(&self.alert_id, self.level)
    }

    /// Record the outward message reference.
    pub fn attach_message(&mut self, message: MessageId) {
        if self.message != Some(message) {
            debug!(case = %self.id, message, "Outward message recorded");
            self.message = Some(message);
        }
    }

    /// Assignment message with full controls plus the assignee tag.
    #[must_use]
    pub fn opening(&self, alert: OutboundMessage) -> Transition {
        Transition::new(
            vec![
                Effect::Send {
                    chat: self.chat,
                    message: alert.with_controls(self.controls()),
                    track: true,
                },
                self.notice(format!("@{}", self.assignee)),
            ],
            TimerCommand::Restart,
        )
    }

    /// Move one level up and hand the case to `assignee`.
    ///
    /// The caller resolves `assignee` for [`Self::escalation_target`] first, so a
    /// failed lookup leaves the case untouched. On a case that cannot escalate
    /// this changes nothing; a member pressing a stale Forward at the last
    /// level gets the controls re-sent without Forward.
    pub fn forward(&mut self, actor: &Actor, assignee: &str, now: DateTime<Utc>) -> Transition {
        let Some(next) = self.escalation_target() else {
            return self.hold(actor);
        };

        self.level = next;
        self.assignee = assignee.to_string();
        self.last_activity = now;

        let text = match actor {
            Actor::Member(name) => format!("@{name} forward to @{assignee}"),
            Actor::System => format!("Auto forward to next level @{assignee}"),
        };

        let mut effects = vec![self.notice(text)];
        effects.extend(self.edit(Some(self.controls())));
        Transition::new(effects, TimerCommand::Restart)
    }

    fn hold(&mut self, actor: &Actor) -> Transition {
        if !self.is_active() {
            return Transition::new(vec![], TimerCommand::Keep);
        }
        match actor {
            Actor::Member(_) => Transition::new(
                self.edit(Some(self.controls())).into_iter().collect(),
                TimerCommand::Keep,
            ),
            Actor::System => {
                self.escalation_active = false;
                Transition::new(vec![], TimerCommand::Stop)
            }
        }
    }

    /// Close the case on behalf of `actor`. `None` if already terminal.
    pub fn acknowledge(&mut self, actor: &Actor, now: DateTime<Utc>) -> Option<Transition> {
        if !self.is_active() {
            return None;
        }
        self.acknowledged = true;
        self.escalation_active = false;
        self.last_activity = now;

        let mut effects = vec![self.notice(format!("Acknowledge by: {actor}"))];
        effects.extend(self.edit(None));
        Some(Transition::new(effects, TimerCommand::Stop))
    }

    /// Mark resolved from any non-resolved state. `None` if already resolved.
    pub fn resolve(&mut self, notice: OutboundMessage, now: DateTime<Utc>) -> Option<Transition> {
        if self.resolved {
            return None;
        }
        self.resolved = true;
        self.escalation_active = false;
        self.last_activity = now;

        let mut effects = vec![Effect::Send {
            chat: self.chat,
            message: notice,
            track: false,
        }];
        effects.extend(self.edit(None));
        Some(Transition::new(effects, TimerCommand::Stop))
    }

    fn notice(&self, text: String) -> Effect {
        Effect::Send {
            chat: self.chat,
            message: OutboundMessage::plain(text),
            track: false,
        }
    }

    fn edit(&self, controls: Option<ControlRow>) -> Option<Effect> {
        let Some(message) = self.message else {
            debug!(case = %self.id, "No outward message yet, skipping control edit");
            return None;
        };
        Some(Effect::EditControls {
            chat: self.chat,
            message,
            controls,
        })
    }
}
