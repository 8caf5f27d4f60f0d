//! Job payload codec.
//!
//! Messages on the wire are JSON envelopes naming the job and its arguments:
//!
//! ```json
//! {"class": "SendWelcomeEmail", "args": [42, "en"]}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Decoded message body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Registered job name.
    #[serde(rename = "class")]
    pub job: String,
    /// Positional arguments passed to `perform`.
    #[serde(default)]
    pub args: Vec<Value>,
}

impl JobPayload {
    pub fn new(job: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            job: job.into(),
            args,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DroverError;
    use serde_json::json;

    #[test]
    fn test_envelope_uses_class_key() {
        let payload = JobPayload::new("SendWelcomeEmail", vec![json!(42), json!("en")]);
        let encoded: Value = serde_json::from_str(&payload.encode().unwrap()).unwrap();
        assert_eq!(encoded, json!({ "class": "SendWelcomeEmail", "args": [42, "en"] }));
    }

    #[test]
    fn test_missing_args_default_to_empty() {
        let payload = JobPayload::decode(r#"{"class":"Ping"}"#).unwrap();
        assert_eq!(payload.job, "Ping");
        assert!(payload.args.is_empty());
    }

    #[test]
    fn test_garbage_is_codec_error() {
        assert!(matches!(
            JobPayload::decode("not json"),
            Err(DroverError::Codec(_))
        ));
        assert!(JobPayload::decode(r#"{"args":[]}"#).is_err());
    }
}
