use rand::{distributions::Alphanumeric, thread_rng, Rng};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

pub(crate) const SDK_TYPE: &str = "switchyard-rust";
pub(crate) const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Information about the SDK attached to every request and event batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkMetadata {
    pub sdk_type: String,
    pub sdk_version: String,
    pub os: String,
    pub arch: String,
    /// Random per-engine identifier.
    #[serde(rename = "sessionID")]
    pub session_id: String,
}

impl SdkMetadata {
    pub(crate) fn new() -> SdkMetadata {
        SdkMetadata {
            sdk_type: SDK_TYPE.to_owned(),
            sdk_version: SDK_VERSION.to_owned(),
            os: std::env::consts::OS.to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
            session_id: thread_rng()
                .sample_iter(&Alphanumeric)
                .take(24)
                .map(char::from)
                .collect(),
        }
    }

    /// Headers identifying the SDK to the backend.
    ///
    /// The sdk key has been validated to be a legal header value at engine construction, invalid
    /// values are skipped here.
    pub(crate) fn headers(&self, sdk_key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let pairs = [
            ("statsig-api-key", sdk_key),
            ("statsig-sdk-type", &self.sdk_type),
            ("statsig-sdk-version", &self.sdk_version),
            ("statsig-server-session-id", &self.session_id),
        ];
        for (name, value) in pairs {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::SdkMetadata;

    #[test]
    fn session_ids_differ_between_instances() {
        assert_ne!(SdkMetadata::new().session_id, SdkMetadata::new().session_id);
    }

    #[test]
    fn serializes_with_wire_names() {
        let metadata = SdkMetadata::new();
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["sdkType"], "switchyard-rust");
        assert!(json["sessionID"].is_string());
        assert_eq!(json["os"], std::env::consts::OS);
    }

    #[test]
    fn headers_carry_sdk_key() {
        let headers = SdkMetadata::new().headers("secret-key");
        assert_eq!(headers["statsig-api-key"], "secret-key");
        assert_eq!(headers["statsig-sdk-type"], "switchyard-rust");
    }
}
