//! Control-channel protocol between supervisor and router
//!
//! Every message is a self-contained JSON envelope on its own line:
//!
//! ```text
//! {"type":"ADD_ROUTE","payload":{"processName":"web","hostName":"app.test","port":4000,"color":"red"}}
//! {"type":"ADD_ROUTES","payload":{"app.test":{...},"api.test":{...}}}
//! {"type":"REMOVE_ROUTES","payload":{"app.test":{...}}}
//! ```
//!
//! The router answers with human-readable text lines that the supervisor logs.

use crate::error::ProtocolError;
use colored::{ColoredString, Colorize};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Display colors handed out to processes in procfile order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Red,
    Green,
    Blue,
    Magenta,
    Cyan,
    Yellow,
}

pub const PALETTE: [Color; 6] = [
    Color::Red,
    Color::Green,
    Color::Blue,
    Color::Magenta,
    Color::Cyan,
    Color::Yellow,
];

impl Color {
    /// Round-robin over the palette
    pub fn for_index(index: usize) -> Self {
        PALETTE[index % PALETTE.len()]
    }

    pub fn paint(&self, text: &str) -> ColoredString {
        match self {
            Color::Red => text.red(),
            Color::Green => text.green(),
            Color::Blue => text.blue(),
            Color::Magenta => text.magenta(),
            Color::Cyan => text.cyan(),
            Color::Yellow => text.yellow(),
        }
    }
}

/// A hostname routed to a local backend port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub process_name: String,
    pub host_name: String,
    pub port: u16,
    pub color: Color,
}

/// Routes keyed by hostname
pub type RouteSet = BTreeMap<String, Route>;

/// A single update to the router's table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    AddRoute(Route),
    AddRoutes(RouteSet),
    RemoveRoutes(RouteSet),
}

const KNOWN_TYPES: [&str; 3] = ["ADD_ROUTE", "ADD_ROUTES", "REMOVE_ROUTES"];

impl ControlMessage {
    /// Serialize to a single JSON line (without the trailing newline)
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("control messages always serialize")
    }

    /// Parse one line received on the control channel.
    ///
    /// For the plural variants the map key is the hostname that gets routed.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let malformed = |source| ProtocolError::Malformed {
            raw: raw.to_string(),
            source,
        };

        let value: serde_json::Value = serde_json::from_str(raw).map_err(malformed)?;
        if let Some(kind) = value.get("type").and_then(|t| t.as_str()) {
            if !KNOWN_TYPES.contains(&kind) {
                return Err(ProtocolError::UnknownType(kind.to_string()));
            }
        }

        let message: ControlMessage = serde_json::from_value(value).map_err(malformed)?;
        message.normalized()
    }

    fn normalized(self) -> Result<Self, ProtocolError> {
        let check = |route: &Route| {
            if route.port == 0 {
                Err(ProtocolError::InvalidPort {
                    host: route.host_name.clone(),
                })
            } else {
                Ok(())
            }
        };

        let keyed = |routes: RouteSet| -> Result<RouteSet, ProtocolError> {
            routes
                .into_iter()
                .map(|(host, mut route)| {
                    route.host_name = host.clone();
                    check(&route)?;
                    Ok((host, route))
                })
                .collect()
        };

        match self {
            ControlMessage::AddRoute(route) => {
                check(&route)?;
                Ok(ControlMessage::AddRoute(route))
            }
            ControlMessage::AddRoutes(routes) => Ok(ControlMessage::AddRoutes(keyed(routes)?)),
            ControlMessage::RemoveRoutes(routes) => {
                Ok(ControlMessage::RemoveRoutes(keyed(routes)?))
            }
        }
    }
}

/// Build a route set from an iterator of routes
pub fn route_set<I: IntoIterator<Item = Route>>(routes: I) -> RouteSet {
    routes
        .into_iter()
        .map(|r| (r.host_name.clone(), r))
        .collect()
}
