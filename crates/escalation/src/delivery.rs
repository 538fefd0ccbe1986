//! Ordered delivery of transition effects.
//!
//! Every case gets one lane: an unbounded queue drained by a single task.
//! Effects of one case reach the transport in the order their transitions
//! were committed, while a slow case never holds up another. Pushing never
//! blocks the dispatch loop.

use notify::ChatTransport;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::case::{CaseId, Effect};
use crate::dispatch::Event;

/// Per-case delivery lanes.
pub struct Deliveries {
    transport: Arc<dyn ChatTransport>,
    receipts: mpsc::Sender<Event>,
    lanes: HashMap<CaseId, mpsc::UnboundedSender<Vec<Effect>>>,
}

impl Deliveries {
    /// Receipts for tracked sends are posted to `receipts`.
    #[must_use]
    pub fn new(transport: Arc<dyn ChatTransport>, receipts: mpsc::Sender<Event>) -> Self {
        Self {
            transport,
            receipts,
            lanes: HashMap::new(),
        }
    }

    /// Queue `effects` behind everything already queued for `case`.
    pub fn push(&mut self, case: CaseId, effects: Vec<Effect>) {
        if effects.is_empty() {
            return;
        }
        let effects = match self.lanes.get(&case) {
            Some(lane) => match lane.send(effects) {
                Ok(()) => return,
                Err(mpsc::error::SendError(effects)) => effects,
            },
            None => effects,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // `rx` is alive, so this cannot fail.
        let _ = tx.send(effects);
        tokio::spawn(drain(
            case,
            rx,
            Arc::clone(&self.transport),
            self.receipts.clone(),
        ));
        self.lanes.insert(case, tx);
    }

    /// Close the lanes of cases for which `keep` is false. Their tasks
    /// finish what is queued and exit.
    pub fn retain(&mut self, mut keep: impl FnMut(CaseId) -> bool) {
        self.lanes.retain(|id, _| keep(*id));
    }

    /// Number of open lanes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }
}

async fn drain(
    case: CaseId,
    mut rx: mpsc::UnboundedReceiver<Vec<Effect>>,
    transport: Arc<dyn ChatTransport>,
    receipts: mpsc::Sender<Event>,
) {
    while let Some(effects) = rx.recv().await {
        for effect in effects {
            deliver_one(case, effect, transport.as_ref(), &receipts).await;
        }
    }
    debug!(case = %case, "Delivery lane closed");
}

async fn deliver_one(
    case: CaseId,
    effect: Effect,
    transport: &dyn ChatTransport,
    receipts: &mpsc::Sender<Event>,
) {
    match effect {
        Effect::Send {
            chat,
            message,
            track,
        } => match transport.send_message(chat, &message).await {
            Ok(sent) if track => {
                if receipts
                    .send(Event::MessageSent {
                        case,
                        message: sent,
                    })
                    .await
                    .is_err()
                {
                    debug!(case = %case, "Dispatch queue closed, dropping delivery receipt");
                }
            }
            Ok(_) => {}
            Err(e) => error!(
                case = %case,
                chat,
                channel = transport.name(),
                error = %e,
                "Failed to send message"
            ),
        },
        Effect::EditControls {
            chat,
            message,
            controls,
        } => {
            if let Err(e) = transport
                .edit_controls(chat, message, controls.as_ref())
                .await
            {
                error!(
                    case = %case,
                    chat,
                    message,
                    channel = transport.name(),
                    error = %e,
                    "Failed to edit controls"
                );
            }
        }
    }
}
