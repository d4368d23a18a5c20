//! Orchestrated services provided by the binary.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use conductor_actions::ActionRuntime;
use conductor_core::{Error, Result};
use conductor_runtime::{Service, ServiceBuilder, ServiceContext};

/// Config of the `actions` service.
#[derive(Debug, Default, Deserialize)]
struct ActionSettings {
    /// Worker modules loaded when the service starts.
    #[serde(default)]
    modules: Vec<String>,
    #[serde(default)]
    remotes: Vec<RemoteSettings>,
}

#[derive(Debug, Deserialize)]
struct RemoteSettings {
    url: String,
    #[serde(default)]
    context: Value,
}

/// The action runtime as a managed service.
pub struct ActionService {
    name: String,
    runtime: Arc<ActionRuntime>,
}

impl ActionService {
    pub fn runtime(&self) -> &Arc<ActionRuntime> {
        &self.runtime
    }
}

impl Service for ActionService {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Brings up the configured modules and remote endpoints. A module still
/// initializing or failing to start fails the build, so the control loop
/// retries it on the next tick.
pub struct ActionServiceBuilder {
    runtime: Arc<ActionRuntime>,
}

impl ActionServiceBuilder {
    pub fn new(runtime: Arc<ActionRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ServiceBuilder for ActionServiceBuilder {
    async fn build(&self, ctx: &ServiceContext<'_>) -> Result<Arc<dyn Service>> {
        let settings: ActionSettings = if ctx.config.is_null() {
            ActionSettings::default()
        } else {
            serde_json::from_value(ctx.config.clone())
                .map_err(|e| Error::Config(format!("{}: {}", ctx.name, e)))?
        };

        for module in &settings.modules {
            if !self.runtime.load_module(module).await {
                return Err(Error::Service(format!("module {} is not loaded yet", module)));
            }
        }
        for remote in &settings.remotes {
            self.runtime
                .load_remote(&remote.url, &remote.context)
                .await
                .map_err(|e| Error::Service(e.to_string()))?;
        }

        info!(
            "Action service {} up: {} modules, {} remotes, {} actions",
            ctx.name,
            settings.modules.len(),
            settings.remotes.len(),
            self.runtime.list_actions().len()
        );
        Ok(Arc::new(ActionService {
            name: ctx.name.to_string(),
            runtime: self.runtime.clone(),
        }))
    }
}
