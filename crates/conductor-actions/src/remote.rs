//! Remote HTTP action endpoints.
//!
//! A remote endpoint publishes a discovery document at
//! `<base>/action_spec` mapping qualified action names to their ordered
//! parameter names. Each action is invoked with `POST <base>/<short name>`
//! and a JSON object of named arguments.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::types::{ActionError, Kwargs};

pub const SPEC_PATH: &str = "action_spec";

/// Actions whose short name ends with this are run once at load time with
/// the setup context.
pub const SETUP_SUFFIX: &str = "setup";

pub struct RemoteEndpoint {
    base_url: String,
    client: Client,
}

impl RemoteEndpoint {
    pub fn new(base_url: &str, client: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the action name → parameter order map.
    pub async fn discover(&self) -> Result<BTreeMap<String, Vec<String>>, ActionError> {
        let url = format!("{}/{}", self.base_url, SPEC_PATH);
        debug!("Fetching remote action spec from {}", url);
        let response = self.client.get(&url).send().await.map_err(|e| ActionError::Remote {
            action: SPEC_PATH.to_string(),
            status: None,
            message: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ActionError::Remote {
                action: SPEC_PATH.to_string(),
                status: Some(status.as_u16()),
                message: response.text().await.unwrap_or_default(),
            });
        }
        response.json().await.map_err(|e| ActionError::Remote {
            action: SPEC_PATH.to_string(),
            status: None,
            message: format!("invalid action spec: {}", e),
        })
    }

    /// Invoke `name` remotely. Positional args fill `params` in order, kwargs
    /// override them, and null values are left out of the request body.
    pub async fn call(
        &self,
        name: &str,
        params: &[String],
        args: &[Value],
        kwargs: &Kwargs,
        timeout: Duration,
    ) -> Result<Value, ActionError> {
        let body = request_body(params, args, kwargs);
        let url = format!("{}/{}", self.base_url, short_name(name));
        let remote_error = |status: Option<u16>, message: String| ActionError::Remote {
            action: name.to_string(),
            status,
            message,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| remote_error(None, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(remote_error(Some(status.as_u16()), text));
        }
        response
            .json()
            .await
            .map_err(|e| remote_error(None, format!("invalid response: {}", e)))
    }
}

/// Last dotted component of a qualified action name.
pub fn short_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

pub fn is_setup_action(name: &str) -> bool {
    short_name(name).ends_with(SETUP_SUFFIX)
}

fn request_body(params: &[String], args: &[Value], kwargs: &Kwargs) -> Value {
    let mut body = Kwargs::new();
    for (param, value) in params.iter().zip(args) {
        body.insert(param.clone(), value.clone());
    }
    for (key, value) in kwargs {
        body.insert(key.clone(), value.clone());
    }
    body.retain(|_, v| !v.is_null());
    Value::Object(body)
}
