use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a measured resource.
///
/// The analytics engine does not own resources. It only uses the identifier to scope keys.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ResourceId(pub i64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ResourceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// The kind of access that is measured.
///
/// Every operation has its own key namespace. Counts are never aggregated across operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// A resource was downloaded.
    Download,
    /// A client checked for or fetched an update of a resource.
    Update,
    /// The page of a resource was viewed.
    PageView,
}

impl Operation {
    /// All operations in a stable order.
    pub const ALL: [Self; 3] = [Self::Download, Self::Update, Self::PageView];

    /// Returns the name of the operation as used in keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Update => "update",
            Self::PageView => "page_view",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing an [`Operation`].
#[derive(Clone, Debug, thiserror::Error)]
#[error("unknown operation {0:?}, expected one of \"download\", \"update\", \"page_view\"")]
pub struct ParseOperationError(String);

impl FromStr for Operation {
    type Err = ParseOperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(Self::Download),
            "update" => Ok(Self::Update),
            "page_view" => Ok(Self::PageView),
            _ => Err(ParseOperationError(s.to_owned())),
        }
    }
}

/// A single access to a resource.
///
/// Events are created once per inbound request and consumed once by the recorder.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Event {
    /// The accessed resource.
    pub resource: ResourceId,
    /// The kind of access.
    pub operation: Operation,
    /// Identifier of the authenticated user, if any.
    ///
    /// A value of `0` is treated like an anonymous access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<i64>,
    /// Address of the client.
    pub client_ip: IpAddr,
    /// The user agent reported by the client.
    #[serde(default)]
    pub user_agent: String,
    /// Opaque token identifying anonymous visitors, for instance a cookie.
    #[serde(default)]
    pub dedup_token: String,
    /// Time at which the access happened.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Returns the authenticated user, ignoring the anonymous id `0`.
    pub fn member_id(&self) -> Option<i64> {
        self.subject_id.filter(|&id| id != 0)
    }

    /// Returns the identity of the visitor counted in the unique visitor sketch.
    ///
    /// Authenticated users are identified by their id, anonymous visitors by their token and
    /// visitors without a token by their IP address. The kind is part of the identity, so a user
    /// id never collides with a token of the same spelling.
    pub fn visitor_id(&self) -> String {
        if let Some(member) = self.member_id() {
            format!("u:{member}")
        } else if !self.dedup_token.is_empty() {
            format!("t:{}", self.dedup_token)
        } else {
            format!("ip:{}", self.client_ip)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use chrono::TimeZone;

    use super::*;

    fn event(subject_id: Option<i64>, dedup_token: &str) -> Event {
        Event {
            resource: ResourceId(42),
            operation: Operation::Download,
            subject_id,
            client_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            user_agent: "curl/8.0".to_owned(),
            dedup_token: dedup_token.to_owned(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_visitor_identity() {
        assert_eq!(event(Some(7), "abc").visitor_id(), "u:7");
        assert_eq!(event(Some(0), "abc").visitor_id(), "t:abc");
        assert_eq!(event(None, "abc").visitor_id(), "t:abc");
        assert_eq!(event(None, "").visitor_id(), "ip:10.0.0.1");
    }

    #[test]
    fn test_member_ignores_anonymous() {
        assert_eq!(event(Some(7), "").member_id(), Some(7));
        assert_eq!(event(Some(0), "").member_id(), None);
        assert_eq!(event(None, "").member_id(), None);
    }

    #[test]
    fn test_operation_parse() {
        for operation in Operation::ALL {
            assert_eq!(operation.as_str().parse::<Operation>().unwrap(), operation);
        }

        let error = "install".parse::<Operation>().unwrap_err();
        assert!(error.to_string().contains("\"install\""));
    }

    #[test]
    fn test_event_deserialize() {
        let json = r#"{
            "resource": 42,
            "operation": "page_view",
            "client_ip": "::1",
            "timestamp": "2024-03-09T12:00:00Z"
        }"#;

        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.resource, ResourceId(42));
        assert_eq!(event.operation, Operation::PageView);
        assert_eq!(event.subject_id, None);
        assert_eq!(event.visitor_id(), "ip:::1");
    }
}
