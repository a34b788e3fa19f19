//! Delivery records as reported by the remote tracking service.
//!
//! Records are read-only to the engine. The wire shape is camelCase JSON; the
//! service has emitted statuses both as `IN_TRANSIT` and `in_transit`, so both
//! spellings are accepted.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    #[serde(rename = "PENDING", alias = "pending")]
    Pending,
    #[serde(rename = "ASSIGNED", alias = "assigned")]
    Assigned,
    #[serde(rename = "IN_TRANSIT", alias = "in_transit")]
    InTransit,
    #[serde(rename = "DELIVERED", alias = "delivered")]
    Delivered,
    #[serde(rename = "CANCELLED", alias = "cancelled")]
    Cancelled,
}

impl DeliveryStatus {
    /// Only assigned and in-transit deliveries have a courier on the road.
    pub fn is_simulatable(self) -> bool {
        matches!(self, Self::Assigned | Self::InTransit)
    }

    /// Delivered and cancelled deliveries never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Assigned => "ASSIGNED",
            Self::InTransit => "IN_TRANSIT",
            Self::Delivered => "DELIVERED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Courier embedded in a delivery record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourierRef {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct WireLocation {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDelivery {
    id: String,
    #[serde(default)]
    courier_id: Option<String>,
    #[serde(default)]
    courier: Option<CourierRef>,
    destination_lat: f64,
    destination_lng: f64,
    #[serde(default)]
    last_known_location: Option<WireLocation>,
    status: DeliveryStatus,
}

/// One delivery as seen in the latest snapshot from the service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "WireDelivery")]
pub struct DeliveryRecord {
    pub id: String,
    pub courier_id: Option<String>,
    pub courier: Option<CourierRef>,
    pub destination: GeoPoint,
    pub last_known_location: Option<GeoPoint>,
    pub status: DeliveryStatus,
}

impl From<WireDelivery> for DeliveryRecord {
    fn from(wire: WireDelivery) -> Self {
        Self {
            id: wire.id,
            courier_id: wire.courier_id,
            courier: wire.courier,
            destination: GeoPoint::new(wire.destination_lat, wire.destination_lng),
            last_known_location: wire
                .last_known_location
                .map(|loc| GeoPoint::new(loc.latitude, loc.longitude)),
            status: wire.status,
        }
    }
}

impl DeliveryRecord {
    /// Identity (login email) of the assigned courier, if the record names one.
    pub fn courier_identity(&self) -> Option<&str> {
        self.courier.as_ref().map(|c| c.email.as_str())
    }

    /// Human-friendly courier label for logs.
    pub fn courier_label(&self) -> &str {
        self.courier
            .as_ref()
            .map(|c| c.name.as_deref().unwrap_or(c.email.as_str()))
            .unwrap_or("unassigned")
    }
}

/// Every delivery returned by one poll of the service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliverySnapshot {
    records: Vec<DeliveryRecord>,
}

impl DeliverySnapshot {
    pub fn new(records: Vec<DeliveryRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[DeliveryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, delivery_id: &str) -> Option<&DeliveryRecord> {
        self.records.iter().find(|r| r.id == delivery_id)
    }

    /// Ids of deliveries that are still in progress (not delivered or
    /// cancelled). Registry entries outside this set are eligible for pruning.
    pub fn active_ids(&self) -> HashSet<String> {
        self.records
            .iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.id.clone())
            .collect()
    }
}

/// Body of `POST /locations`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationReport<'a> {
    pub delivery_id: &'a str,
    pub latitude: f64,
    pub longitude: f64,
}

/// Body of a `201 Created` answer to a location report.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationAck {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub delivery_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}
