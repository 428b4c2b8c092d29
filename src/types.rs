use serde::de::DeserializeOwned;

use crate::{RequestConfig, RequestError, Result};

/// Status and raw body returned by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> &str {
        &self.body
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|err| {
            RequestError::Decode(format!("invalid response JSON: {err}; body: {}", self.body))
        })
    }
}

/// Coarse link classification reported by the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinkQuality {
    Slow2g,
    TwoG,
    ThreeG,
    FourG,
    #[default]
    Unknown,
}

impl LinkQuality {
    /// Parses the host's effective connection type (`"slow-2g"`, `"2g"`, `"3g"`, `"4g"`).
    pub fn from_effective_type(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "slow-2g" => Self::Slow2g,
            "2g" => Self::TwoG,
            "3g" => Self::ThreeG,
            "4g" => Self::FourG,
            _ => Self::Unknown,
        }
    }
}

/// Snapshot of an in-flight request.
#[derive(Clone, Debug)]
pub struct PendingRequest {
    pub config: RequestConfig,
    /// Time since dispatch in milliseconds.
    pub age_ms: u64,
}

/// Outcome of one offline queue flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Requests that settled successfully.
    pub replayed: usize,
    /// Requests whose replay failed.
    pub failed: usize,
    /// Requests put back on the queue, failed or not reached.
    pub requeued: usize,
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use crate::{LinkQuality, RequestError, Response};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: u32,
    }

    #[test]
    fn json_decodes_body() {
        let response = Response::new(200, r#"{"id":3}"#);
        assert_eq!(response.json::<Item>().expect("must decode"), Item { id: 3 });
    }

    #[test]
    fn json_reports_decode_error() {
        let err = Response::new(200, "not json")
            .json::<Item>()
            .expect_err("must fail");
        assert!(matches!(err, RequestError::Decode(_)));
    }

    #[test]
    fn effective_type_parsing() {
        assert_eq!(LinkQuality::from_effective_type("4g"), LinkQuality::FourG);
        assert_eq!(LinkQuality::from_effective_type("Slow-2G"), LinkQuality::Slow2g);
        assert_eq!(LinkQuality::from_effective_type("wifi"), LinkQuality::Unknown);
    }
}
