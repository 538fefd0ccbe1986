//! Alert escalation engine.
//!
//! Each firing alert becomes an [`AlertCase`] assigned to a level-1 member.
//! Chat members acknowledge or forward it through the controls attached to
//! the alert message; if nobody acts within the escalation window the case
//! is forwarded to the next level automatically. A resolved notification
//! closes the case.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use escalation::{AlertNotification, Dispatcher, EscalationConfig, InMemoryDirectory};
//! use notify::TelegramChannel;
//!
//! # async fn run() {
//! let directory = Arc::new(InMemoryDirectory::new());
//! let transport = Arc::new(TelegramChannel::from_env());
//! let (dispatcher, handle) = Dispatcher::new(EscalationConfig::default(), directory, transport);
//!
//! let loop_task = tokio::spawn(dispatcher.run(async {
//!     tokio::signal::ctrl_c().await.ok();
//! }));
//! handle.submit_alert(AlertNotification::firing("nginx"), -1001).await.ok();
//! loop_task.await.ok();
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`Dispatcher`] owns the [`AlertRegistry`] and is the only place case
//!   state changes; everything reaches it as an [`Event`] on one queue
//! - [`AlertCase`] transitions are pure and return the [`Effect`]s to deliver
//! - [`Deliveries`] sends those effects in commit order, one lane per case
//! - [`TimerSet`] keeps one escalation deadline per active case and posts
//!   expiries back into the queue
//! - [`Directory`] resolves node owners and members per level

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod alert;
pub mod callback;
pub mod case;
pub mod config;
pub mod delivery;
pub mod directory;
pub mod dispatch;
pub mod level;
pub mod registry;
pub mod timer;

pub use alert::{AlertFormatter, AlertNotification, AlertStatus, PlainFormatter};
pub use callback::{controls_for_level, CallbackAction, CallbackData, CallbackError};
pub use case::{Actor, AlertCase, CaseId, CaseState, Effect, TimerCommand, Transition};
pub use config::EscalationConfig;
pub use delivery::Deliveries;
pub use directory::{
    pick_member, Directory, DirectoryError, InMemoryDirectory, Member, NodeOwnership,
};
pub use dispatch::{
    Callback, ChatMessage, CommandHandler, DispatchClosed, DispatchHandle, Dispatcher, Event,
};
pub use level::Level;
pub use registry::{AlertRegistry, DuplicatePolicy};
pub use timer::TimerSet;
