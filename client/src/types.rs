//! Wire protocol types.
//!
//! Every frame is a JSON text message `{"event": <name>, "data": <payload>}`.
//! Client → server: `auth`, `register-admin`, `register-table`.
//! Server → client: the handshake answers (`connected`, `connect_error`) and
//! the five pushed event kinds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ═══════════════════════════════════════════════════════════════
// Client → Server frames
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub(crate) enum ClientFrame<'a> {
    /// First frame on every physical connection.
    Auth { token: &'a str },
    RegisterAdmin,
    RegisterTable {
        #[serde(rename = "tableId")]
        table_id: &'a str,
    },
}

impl ClientFrame<'_> {
    pub(crate) fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ═══════════════════════════════════════════════════════════════
// Server → Client events
// ═══════════════════════════════════════════════════════════════

/// The kinds of events the server pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewOrder,
    OrderUpdated,
    OrderCreated,
    NewCustomer,
    TableStatusUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::NewOrder,
        EventKind::OrderUpdated,
        EventKind::OrderCreated,
        EventKind::NewCustomer,
        EventKind::TableStatusUpdated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewOrder => "new-order",
            Self::OrderUpdated => "order-updated",
            Self::OrderCreated => "order-created",
            Self::NewCustomer => "new-customer",
            Self::TableStatusUpdated => "table-status-updated",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A server-pushed event with its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// An order was placed (admin room).
    NewOrder(OrderData),
    OrderUpdated(OrderData),
    /// Confirmation sent to the table that placed the order.
    OrderCreated(OrderData),
    NewCustomer(CustomerData),
    TableStatusUpdated(TableStatusData),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewOrder(_) => EventKind::NewOrder,
            Self::OrderUpdated(_) => EventKind::OrderUpdated,
            Self::OrderCreated(_) => EventKind::OrderCreated,
            Self::NewCustomer(_) => EventKind::NewCustomer,
            Self::TableStatusUpdated(_) => EventKind::TableStatusUpdated,
        }
    }

    /// Shape a raw payload into the kind's type.
    pub fn decode(kind: EventKind, data: JsonValue) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EventKind::NewOrder => Self::NewOrder(serde_json::from_value(data)?),
            EventKind::OrderUpdated => Self::OrderUpdated(serde_json::from_value(data)?),
            EventKind::OrderCreated => Self::OrderCreated(serde_json::from_value(data)?),
            EventKind::NewCustomer => Self::NewCustomer(serde_json::from_value(data)?),
            EventKind::TableStatusUpdated => Self::TableStatusUpdated(serde_json::from_value(data)?),
        })
    }
}

/// Order snapshot carried by the three order events. Only `id` is required;
/// absent fields are left alone when the payload is merged into a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderData {
    pub id: String,
    #[serde(default)]
    pub table_id: Option<String>,
    #[serde(default)]
    pub items: Option<Vec<OrderItem>>,
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: String,
    pub product_name: String,
    pub quantity: u32,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Pending,
    Confirmed,
    Preparing,
    Ready,
    Delivered,
    Completed,
    Cancelled,
    /// Any status this client does not know yet.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerData {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub table_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStatusData {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<TableStatus>,
    #[serde(default)]
    pub customers: Option<Vec<CustomerData>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
    Available,
    Occupied,
    Reserved,
}

// ═══════════════════════════════════════════════════════════════
// Inbound frame parsing
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: JsonValue,
}

#[derive(Debug, Deserialize)]
struct ConnectedData {
    #[serde(default)]
    sid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConnectErrorData {
    #[serde(default)]
    message: String,
}

/// A parsed server frame.
#[derive(Debug)]
pub(crate) enum Inbound {
    Connected { sid: Option<String> },
    ConnectError { message: String },
    Event(Event),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(serde_json::Error),

    #[error("unknown event kind '{0}'")]
    UnknownKind(String),

    #[error("bad payload for {kind}: {source}")]
    BadPayload {
        kind: EventKind,
        source: serde_json::Error,
    },
}

pub(crate) fn parse_frame(text: &str) -> Result<Inbound, FrameError> {
    let raw: RawFrame = serde_json::from_str(text).map_err(FrameError::Malformed)?;
    match raw.event.as_str() {
        "connected" => {
            let data: ConnectedData = serde_json::from_value(raw.data).unwrap_or(ConnectedData { sid: None });
            Ok(Inbound::Connected { sid: data.sid })
        }
        "connect_error" => {
            let data: ConnectErrorData =
                serde_json::from_value(raw.data).unwrap_or(ConnectErrorData { message: String::new() });
            Ok(Inbound::ConnectError { message: data.message })
        }
        other => {
            let kind = EventKind::from_wire(other).ok_or_else(|| FrameError::UnknownKind(other.to_string()))?;
            Event::decode(kind, raw.data)
                .map(Inbound::Event)
                .map_err(|source| FrameError::BadPayload { kind, source })
        }
    }
}
