//! Wire types for the daemon's Unix-socket JSON API.
//!
//! The rule objects returned by `GET /v1/rules` are [`crate::rules::Rule`]
//! values serialized directly; everything else on the wire lives here.
//! Durations travel as integer nanoseconds (`ttl` of 0 means permanent).

use serde::{Deserialize, Serialize};

/// Request body for `POST /v1/block`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequest {
    #[serde(default)]
    pub domain: String,

    /// Rule lifetime in nanoseconds; 0 or absent blocks permanently.
    #[serde(default)]
    pub ttl: u64,
}

/// Request body for `POST /v1/unblock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnblockRequest {
    #[serde(default)]
    pub id: String,
}

/// Response body for `GET /v1/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Number of active rules.
    pub rules: usize,
    /// Daemon uptime in nanoseconds.
    pub uptime: u64,
    pub version: String,
    pub commit: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_request_defaults_missing_fields() {
        let req: BlockRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.domain, "");
        assert_eq!(req.ttl, 0);

        let req: BlockRequest =
            serde_json::from_str(r#"{"domain":"example.com","ttl":7200000000000}"#).unwrap();
        assert_eq!(req.domain, "example.com");
        assert_eq!(req.ttl, 7_200_000_000_000);
    }

    #[test]
    fn status_response_round_trips() {
        let status = StatusResponse {
            rules: 3,
            uptime: 42_000_000_000,
            version: "0.1.0".to_string(),
            commit: "abcdef0".to_string(),
        };
        let json = serde_json::to_string(&status).unwrap();
        let back: StatusResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
