//! Wire types exchanged between the broker and its agents.
//!
//! Every frame on the duplex connection is one JSON text message. The broker
//! sends a [`DispatchEnvelope`]; the agent answers with exactly one
//! [`ResultEnvelope`] echoing the same `request_id`.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::duration::{parse_duration, DurationError};

/// An HTTP call an agent performs on the broker's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub endpoint: String,
    #[serde(default)]
    pub http_method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, with = "base64_body", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
    pub timeout: String,
}

impl CommandDefinition {
    pub fn get(endpoint: impl Into<String>, timeout: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            http_method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: Vec::new(),
            timeout: timeout.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn timeout_duration(&self) -> Result<Duration, DurationError> {
        parse_duration(self.timeout.trim())
    }

    /// The method to issue; an empty method means `GET`.
    pub fn method(&self) -> &str {
        let method = self.http_method.trim();
        if method.is_empty() {
            "GET"
        } else {
            method
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    pub request_id: String,
    #[serde(rename = "def")]
    pub definition: CommandDefinition,
}

/// Decoded payload of the downstream endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointData {
    #[serde(default)]
    pub word: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tags: Vec<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl EndpointData {
    /// Decodes a target response body. Array responses yield their first
    /// element.
    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            Many(Vec<EndpointData>),
            One(EndpointData),
        }

        match serde_json::from_slice::<OneOrMany>(body)? {
            OneOrMany::Many(list) => list.into_iter().next().ok_or_else(|| {
                <serde_json::Error as serde::de::Error>::custom("endpoint returned an empty array")
            }),
            OneOrMany::One(data) => Ok(data),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub bot_id: String,
    pub request_id: String,
    #[serde(rename = "def")]
    pub definition: CommandDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_data: Option<EndpointData>,
    #[serde(default)]
    pub request_time: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,
}

impl ResultEnvelope {
    /// Starts a reply for `envelope`; fields are filled in as execution
    /// progresses.
    pub fn for_request(bot_id: impl Into<String>, envelope: &DispatchEnvelope) -> Self {
        Self {
            bot_id: bot_id.into(),
            request_id: envelope.request_id.clone(),
            definition: envelope.definition.clone(),
            endpoint_data: None,
            request_time: String::new(),
            status_code: 0,
            err: String::new(),
        }
    }

    pub fn failed(mut self, error: impl ToString) -> Self {
        self.endpoint_data = None;
        self.err = error.to_string();
        self
    }

    pub fn is_success(&self) -> bool {
        self.err.is_empty()
    }

    pub fn elapsed(&self) -> Option<Duration> {
        if self.request_time.is_empty() {
            return None;
        }
        parse_duration(&self.request_time).ok()
    }
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(body))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(text) if !text.is_empty() => {
                BASE64.decode(text.as_bytes()).map_err(serde::de::Error::custom)
            }
            _ => Ok(Vec::new()),
        }
    }
}
