//! Outbound signals
//!
//! State-changing operations collect their events in an [`Outbox`] while the
//! transaction runs. The outbox is handed to an [`EventSink`] only after the
//! commit succeeded, so a rolled back attempt never leaks an event.

use crate::engine::entry::{Order, Trade, UserId};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceReason {
    FundsLocked,
    FundsReleased,
    OrderMatched,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    OrderCreated {
        order: Order,
    },
    OrderMatched {
        trade: Trade,
        buyer_id: UserId,
        seller_id: UserId,
    },
    OrderCanceled {
        order: Order,
    },
    /// Cash balance movement of one user.
    BalanceChanged {
        user_id: UserId,
        previous: Decimal,
        current: Decimal,
        reason: BalanceReason,
    },
}

impl LedgerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::OrderCreated { .. } => "order_created",
            LedgerEvent::OrderMatched { .. } => "order_matched",
            LedgerEvent::OrderCanceled { .. } => "order_canceled",
            LedgerEvent::BalanceChanged { .. } => "balance_changed",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: LedgerEvent);
}

/// Events buffered by one transaction attempt.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Outbox {
    events: Vec<LedgerEvent>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: LedgerEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn publish_to(self, sink: &dyn EventSink) {
        for event in self.events {
            sink.publish(event);
        }
    }
}

/// Forwards events to an unbounded tokio channel.
pub struct ChannelSink {
    tx: UnboundedSender<LedgerEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, UnboundedReceiver<LedgerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: LedgerEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!("event receiver gone, dropping {}", e.0.name());
        }
    }
}

/// Writes every event to the log as JSON.
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: LedgerEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!("{} {}", event.name(), json),
            Err(e) => warn!("failed to encode {} event: {}", event.name(), e),
        }
    }
}

pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: LedgerEvent) {}
}
