//! The dispatch loop.
//!
//! A single consumer drains one queue fed by alert intake, inbound chat
//! messages, interactive callbacks, escalation timers and delivery receipts.
//! It is the only place case state changes, so two events for the same case
//! are never processed concurrently and no locks guard the registry.
//!
//! Outbound chat calls are fire-and-forget: a transition is committed first
//! and its effects are queued on the delivery lane of its case, so edits of
//! one message land in commit order. Delivery failures are logged; the
//! transition stands.

use async_trait::async_trait;
use chrono::Utc;
use notify::{ChatId, ChatTransport, MessageId};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertFormatter, AlertNotification, AlertStatus, PlainFormatter};
use crate::callback::{CallbackAction, CallbackData};
use crate::case::{Actor, AlertCase, CaseId, TimerCommand, Transition};
use crate::config::EscalationConfig;
use crate::delivery::Deliveries;
use crate::directory::{Directory, DirectoryError};
use crate::level::Level;
use crate::registry::AlertRegistry;
use crate::timer::TimerSet;

/// A chat message addressed to the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub chat: ChatId,
    /// Display name of the chat
    pub chat_name: String,
    pub message: MessageId,
    /// Platform user ID of the sender
    pub sender_id: i64,
    /// Sender handle, used in replies and logs
    pub sender: String,
    pub text: String,
}

/// A button press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callback {
    /// Platform query ID, answered once handled
    pub id: String,
    pub chat: ChatId,
    /// Message the button was attached to
    pub message: Option<MessageId>,
    /// Username of the member who pressed it
    pub sender: String,
    /// Opaque button payload
    pub data: Option<String>,
}

/// Everything the dispatch loop consumes.
#[derive(Debug)]
pub enum Event {
    /// Alert intake: a firing notification to open in `chat`
    Firing {
        alert: AlertNotification,
        chat: ChatId,
    },
    /// Alert intake: a resolved notification, applied to every case of the
    /// alert whatever chat it lives in
    Resolved(AlertNotification),
    /// Inbound chat message
    Message(ChatMessage),
    /// Inbound interactive callback
    Callback(Callback),
    /// An escalation deadline expired
    TimerFired { case: CaseId, generation: u64 },
    /// The outward message of a case was delivered
    MessageSent { case: CaseId, message: MessageId },
}

/// Handles chat messages (bot commands). Runs outside the dispatch loop and
/// never sees case state.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, message: ChatMessage);
}

/// The dispatch loop has stopped accepting events.
#[derive(Debug, Error)]
#[error("dispatch loop is shut down")]
pub struct DispatchClosed;

/// Cloneable submission side of the dispatch queue.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<Event>,
}

impl DispatchHandle {
    /// Submit a notification for `chat`. Resolved notifications ignore the
    /// chat; submit them once per alert.
    pub async fn submit_alert(
        &self,
        alert: AlertNotification,
        chat: ChatId,
    ) -> Result<(), DispatchClosed> {
        match alert.status {
            AlertStatus::Firing => self.submit(Event::Firing { alert, chat }).await,
            AlertStatus::Resolved => self.submit(Event::Resolved(alert)).await,
        }
    }

    /// Submit a resolved notification.
    pub async fn submit_resolved(&self, alert: AlertNotification) -> Result<(), DispatchClosed> {
        self.submit(Event::Resolved(alert)).await
    }

    pub async fn submit_message(&self, message: ChatMessage) -> Result<(), DispatchClosed> {
        self.submit(Event::Message(message)).await
    }

    pub async fn submit_callback(&self, callback: Callback) -> Result<(), DispatchClosed> {
        self.submit(Event::Callback(callback)).await
    }

    async fn submit(&self, event: Event) -> Result<(), DispatchClosed> {
        self.tx.send(event).await.map_err(|_| DispatchClosed)
    }
}

/// Single owner of the alert registry and every case in it.
pub struct Dispatcher {
    config: EscalationConfig,
    registry: AlertRegistry,
    timers: TimerSet,
    deliveries: Deliveries,
    directory: Arc<dyn Directory>,
    transport: Arc<dyn ChatTransport>,
    formatter: Arc<dyn AlertFormatter>,
    commands: Option<Arc<dyn CommandHandler>>,
    rx: mpsc::Receiver<Event>,
    closing: bool,
}

impl Dispatcher {
    /// Create the loop and the handle used to feed it.
    #[must_use]
    pub fn new(
        config: EscalationConfig,
        directory: Arc<dyn Directory>,
        transport: Arc<dyn ChatTransport>,
    ) -> (Self, DispatchHandle) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let dispatcher = Self {
            registry: AlertRegistry::new(config.duplicate_policy),
            timers: TimerSet::new(tx.clone(), config.escalation_timeout),
            deliveries: Deliveries::new(Arc::clone(&transport), tx.clone()),
            config,
            directory,
            transport,
            formatter: Arc::new(PlainFormatter),
            commands: None,
            rx,
            closing: false,
        };
        (dispatcher, DispatchHandle { tx })
    }

    #[must_use]
    pub fn with_formatter(mut self, formatter: Arc<dyn AlertFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    #[must_use]
    pub fn with_commands(mut self, commands: Arc<dyn CommandHandler>) -> Self {
        self.commands = Some(commands);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &AlertRegistry {
        &self.registry
    }

    #[must_use]
    pub fn timers(&self) -> &TimerSet {
        &self.timers
    }

    #[must_use]
    pub fn deliveries(&self) -> &Deliveries {
        &self.deliveries
    }

    /// Process events until `shutdown` completes, then drain what is queued.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        info!(
            timeout_secs = self.config.escalation_timeout.as_secs(),
            policy = %self.config.duplicate_policy,
            "Dispatch loop started"
        );
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                event = self.rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }

        self.shutdown().await;
    }

    /// Cancel every timer, stop accepting events and process what is queued.
    /// Timer fires still in the queue are discarded.
    pub async fn shutdown(&mut self) {
        self.closing = true;
        let cancelled = self.timers.len();
        self.timers.cancel_all();
        self.rx.close();

        let mut drained = 0usize;
        while let Some(event) = self.rx.recv().await {
            self.handle(event).await;
            drained += 1;
        }
        info!(cancelled, drained, "Dispatch loop stopped");
    }

    /// Handle every event already queued without waiting for more.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.handle(event).await;
            handled += 1;
        }
        handled
    }

    /// Apply one event. Never fails; problems are logged and the event dropped.
    pub async fn handle(&mut self, event: Event) {
        match event {
            Event::Firing { alert, chat } => self.on_firing(alert, chat).await,
            Event::Resolved(alert) => self.on_resolved(&alert),
            Event::Message(message) => self.on_message(message),
            Event::Callback(callback) => self.on_callback(callback).await,
            Event::TimerFired { case, generation } => self.on_timer(case, generation).await,
            Event::MessageSent { case, message } => {
                if let Some(c) = self.registry.get_mut(case) {
                    c.attach_message(message);
                }
            }
        }
    }

    async fn on_firing(&mut self, alert: AlertNotification, chat: ChatId) {
        let retention = chrono::Duration::from_std(self.config.resolved_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        self.registry.prune(Utc::now(), retention);

        let alert_id = alert.correlation_id.clone();
        if !self.registry.admits(&alert_id, chat) {
            info!(alert_id = %alert_id, chat, "Alert already tracked, ignoring duplicate firing");
            return;
        }

        let assignee = match self.initial_assignee(&alert, chat).await {
            Ok(username) => username,
            Err(e) => {
                error!(alert_id = %alert_id, chat, error = %e, "Failed to assign alert, case not opened");
                return;
            }
        };

        let id = self.registry.allocate_id();
        let case = AlertCase::open(id, alert_id.as_str(), chat, assignee.as_str(), Utc::now());
        let transition = case.opening(self.formatter.firing(&alert));
        self.registry.insert(case);
        let registry = &self.registry;
        self.deliveries.retain(|id| registry.get(id).is_some());

        info!(alert_id = %alert_id, case = %id, chat, assignee = %assignee, "Case opened");
        self.apply(id, transition);
    }

    /// Node owner when known, otherwise a random level-1 member.
    async fn initial_assignee(
        &self,
        alert: &AlertNotification,
        chat: ChatId,
    ) -> Result<String, DirectoryError> {
        if let Some(owner) = self.directory.resolve_owner(alert.node_name()).await? {
            debug!(node = alert.node_name(), owner = %owner, "Assigning to node owner");
            return Ok(owner);
        }
        let member = self
            .directory
            .random_member_at_level(chat, Level::L1)
            .await?;
        Ok(member.username)
    }

    fn on_resolved(&mut self, alert: &AlertNotification) {
        let ids = self.registry.ids_for(&alert.correlation_id);
        if ids.is_empty() {
            info!(alert_id = %alert.correlation_id, "Resolved notification for unknown alert");
            return;
        }

        for id in ids {
            let notice = self.formatter.resolved(alert);
            let Some(case) = self.registry.get_mut(id) else {
                continue;
            };
            match case.resolve(notice, Utc::now()) {
                Some(transition) => {
                    info!(alert_id = %alert.correlation_id, case = %id, "Case resolved");
                    self.apply(id, transition);
                }
                None => debug!(case = %id, "Case already resolved"),
            }
        }
    }

    fn on_message(&self, message: ChatMessage) {
        let Some(commands) = &self.commands else {
            debug!(chat = message.chat, "No command handler, dropping message");
            return;
        };
        let commands = Arc::clone(commands);
        tokio::spawn(async move { commands.handle(message).await });
    }

    async fn on_callback(&mut self, callback: Callback) {
        debug!(
            chat = callback.chat,
            sender = %callback.sender,
            data = ?callback.data,
            "Received callback"
        );
        self.answer(callback.id.clone());

        let data = match CallbackData::decode(callback.data.as_deref()) {
            Ok(data) => data,
            Err(e) => {
                warn!(chat = callback.chat, sender = %callback.sender, error = %e, "Dropping callback");
                return;
            }
        };

        let Some(id) = self
            .registry
            .find_for_callback(&data.alert_id, callback.chat, callback.message)
        else {
            warn!(alert_id = %data.alert_id, chat = callback.chat, "Callback for unknown alert");
            return;
        };

        if let (Some(message), Some(case)) = (callback.message, self.registry.get_mut(id)) {
            case.attach_message(message);
        }

        let actor = Actor::member(callback.sender);
        match data.action {
            CallbackAction::Acknowledge => self.acknowledge_case(id, &actor),
            CallbackAction::Forward => self.forward_case(id, &actor).await,
        }
    }

    async fn on_timer(&mut self, id: CaseId, generation: u64) {
        if self.closing || !self.timers.take_fire(id, generation) {
            debug!(case = %id, generation, "Discarding stale timer fire");
            return;
        }
        self.forward_case(id, &Actor::System).await;
    }

    fn acknowledge_case(&mut self, id: CaseId, actor: &Actor) {
        let Some(case) = self.registry.get_mut(id) else {
            return;
        };
        match case.acknowledge(actor, Utc::now()) {
            Some(transition) => {
                info!(alert_id = %case.alert_id, case = %id, actor = %actor, "Case acknowledged");
                self.apply(id, transition);
            }
            None => debug!(case = %id, state = ?case.state(), "Acknowledge on closed case ignored"),
        }
    }

    /// Escalate one level. The assignee is looked up before anything is
    /// committed, so a lookup failure leaves the case as it was. A failed
    /// timer-driven forward re-arms the timer and retries after another
    /// escalation window.
    async fn forward_case(&mut self, id: CaseId, actor: &Actor) {
        let Some(case) = self.registry.get(id) else {
            return;
        };
        if !case.is_active() {
            debug!(case = %id, state = ?case.state(), "Forward on closed case ignored");
            return;
        }

        let assignee = match case.escalation_target() {
            Some(level) => {
                let (chat, alert_id) = (case.chat, case.alert_id.clone());
                match self.directory.random_member_at_level(chat, level).await {
                    Ok(member) => member.username,
                    Err(e) => {
                        error!(alert_id = %alert_id, case = %id, level = %level, error = %e, "Failed to forward alert");
                        if *actor == Actor::System && !self.closing {
                            self.timers.arm(id);
                        }
                        return;
                    }
                }
            }
            None => {
                debug!(case = %id, actor = %actor, "Case already at last level");
                String::new()
            }
        };

        let Some(case) = self.registry.get_mut(id) else {
            return;
        };
        let from = case.level;
        let transition = case.forward(actor, &assignee, Utc::now());
        if case.level != from {
            info!(
                alert_id = %case.alert_id,
                case = %id,
                actor = %actor,
                level = %case.level,
                assignee = %assignee,
                "Case forwarded"
            );
        }
        self.apply(id, transition);
    }

    fn apply(&mut self, id: CaseId, transition: Transition) {
        match transition.timer {
            TimerCommand::Restart if !self.closing => {
                self.timers.arm(id);
            }
            TimerCommand::Restart | TimerCommand::Keep => {}
            TimerCommand::Stop => {
                self.timers.cancel(id);
            }
        }
        self.deliveries.push(id, transition.effects);
    }

    fn answer(&self, callback_id: String) {
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            if let Err(e) = transport.answer_callback(&callback_id).await {
                warn!(channel = transport.name(), error = %e, "Failed to answer callback");
            }
        });
    }
}
