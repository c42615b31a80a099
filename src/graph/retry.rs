//! One-shot recovery from "field not recognized" write rejections.
//!
//! Lists edited by hand drift away from the columns the client expects. When
//! the server names a field it does not know, that key is removed from the
//! payload and the request is sent again, once.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::graph::{ApiRequest, Transport};
use crate::normalize::norm_key;

static UNKNOWN_FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Field\s+'([^']+)'\s+is\s+not\s+recognized").expect("valid unknown-field regex")
});

/// Finds the rejected field name in raw error text, or in the `error.message`
/// of a JSON envelope embedded in that text.
pub fn extract_unknown_field_name(message: &str) -> Option<String> {
    if let Some(name) = capture_field_name(message) {
        return Some(name);
    }

    let start = message.find("{\"error\"")?;
    let envelope = serde_json::Deserializer::from_str(&message[start..])
        .into_iter::<Value>()
        .next()?
        .ok()?;
    let inner = envelope.get("error")?.get("message")?.as_str()?;
    capture_field_name(inner)
}

fn capture_field_name(text: &str) -> Option<String> {
    UNKNOWN_FIELD_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|name| name.as_str().to_string())
}

/// Decides whether an error means "the server does not know this field".
pub trait UnknownFieldClassifier {
    fn unknown_field(&self, err: &StoreError) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GraphUnknownFieldClassifier;

impl UnknownFieldClassifier for GraphUnknownFieldClassifier {
    fn unknown_field(&self, err: &StoreError) -> Option<String> {
        match err {
            StoreError::Http { body, .. } => extract_unknown_field_name(body),
            other => extract_unknown_field_name(&other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    pub response: Option<Value>,
    /// Key removed from the payload before the successful resend.
    pub dropped: Option<String>,
}

/// Sends `request`; on an unknown-field rejection strips that field and
/// resends exactly once. Any other failure, or a failure of the resend,
/// propagates unchanged.
pub async fn send_with_field_fallback<T, C>(
    transport: &T,
    classifier: &C,
    request: ApiRequest,
) -> Result<RetryOutcome, StoreError>
where
    T: Transport + Sync,
    C: UnknownFieldClassifier + Sync,
{
    let err = match transport.send(&request).await {
        Ok(response) => {
            return Ok(RetryOutcome {
                response,
                dropped: None,
            });
        }
        Err(err) => err,
    };

    let Some(field) = classifier.unknown_field(&err) else {
        return Err(err);
    };
    let mut retry = request;
    let Some(removed) = retry.body.as_mut().and_then(|body| strip_field(body, &field)) else {
        debug!(field = %field, "rejected field is not in the payload; not retrying");
        return Err(err);
    };

    warn!(field = %removed, "server rejected field; retrying without it");
    let response = transport.send(&retry).await?;
    Ok(RetryOutcome {
        response,
        dropped: Some(removed),
    })
}

/// Removes `field` from the `fields` object of `body`, or from `body` itself
/// when it has no `fields` object. Returns the removed key.
fn strip_field(body: &mut Value, field: &str) -> Option<String> {
    let target = body.as_object_mut()?;
    if let Some(Value::Object(fields)) = target.get_mut("fields") {
        return remove_matching_keys(fields, field);
    }
    remove_matching_keys(target, field)
}

fn remove_matching_keys(map: &mut Map<String, Value>, field: &str) -> Option<String> {
    if map.remove(field).is_some() {
        return Some(field.to_string());
    }

    let wanted = norm_key(field);
    let matches: Vec<String> = map
        .keys()
        .filter(|key| norm_key(key) == wanted)
        .cloned()
        .collect();
    for key in &matches {
        map.remove(key);
    }
    matches.into_iter().next()
}
