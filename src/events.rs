// =============================================================================
// Event Bus — in-process pub/sub fanning engine events out to WebSocket
// clients
// =============================================================================
//
// Multi-producer, multi-subscriber over tokio's broadcast channel. Every
// subscriber owns a buffered receiver; a subscriber that falls behind past
// the channel capacity observes a Lagged error and is disconnected by the
// WebSocket layer rather than slowing producers down.
//
// Sequence numbers are per-subscriber and are stamped at send time by the
// socket handler, not here.
// =============================================================================

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::store::{PositionStatus, TradeStatus};
use crate::types::Side;

/// Buffered events per subscriber before the bus drops them.
const SUBSCRIBER_BUFFER: usize = 1024;

/// Typed engine event delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    PositionUpdate {
        recorder_id: i64,
        ticker: String,
        side: Side,
        qty: i64,
        avg_price: Decimal,
        status: PositionStatus,
        unrealized_pnl: Decimal,
        worst_unrealized_pnl: Decimal,
    },
    PnlUpdate {
        account_id: i64,
        realized_today: Decimal,
        unrealized_total: Decimal,
    },
    StrategyPnlUpdate {
        recorder_id: i64,
        realized_today: Decimal,
        unrealized_total: Decimal,
    },
    TradeExecuted {
        correlation_id: String,
        trader_id: i64,
        symbol: String,
        side: String,
        qty: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        broker_order_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fill_price: Option<Decimal>,
        status: TradeStatus,
    },
    LogEntry {
        level: String,
        at: String,
        component: String,
        message: String,
        context: serde_json::Value,
    },
}

/// The engine's pub/sub fabric. Cloning is cheap; producers publish through
/// any clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self { tx }
    }

    /// Publish an event. Having zero subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Open a new subscription with its own buffer.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Convenience for structured log events mirrored onto the bus.
    pub fn log(
        &self,
        level: &str,
        component: &str,
        message: impl Into<String>,
        context: serde_json::Value,
    ) {
        self.publish(EngineEvent::LogEntry {
            level: level.to_string(),
            at: Utc::now().to_rfc3339(),
            component: component.to_string(),
            message: message.into(),
            context,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::StrategyPnlUpdate {
            recorder_id: 7,
            realized_today: dec!(40),
            unrealized_total: dec!(-12.5),
        });

        match rx.recv().await.unwrap() {
            EngineEvent::StrategyPnlUpdate {
                recorder_id,
                realized_today,
                ..
            } => {
                assert_eq!(recorder_id, 7);
                assert_eq!(realized_today, dec!(40));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.log("info", "test", "nobody listening", serde_json::json!({}));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let ev = EngineEvent::TradeExecuted {
            correlation_id: "c-1".into(),
            trader_id: 3,
            symbol: "MNQ1!".into(),
            side: "buy".into(),
            qty: 2,
            broker_order_id: Some("900123".into()),
            fill_price: None,
            status: TradeStatus::Placed,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "trade_executed");
        assert_eq!(json["qty"], 2);
        assert!(json.get("fill_price").is_none());
    }
}
