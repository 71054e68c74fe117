//! Docker engine client
//!
//! Talks to the local engine socket through bollard. The client is built once
//! by the caller and owned by the watcher.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{EventMessage, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, instrument};

use crate::error::{NetfixError, Result};
use crate::runtime::{usable_pid, ContainerRef, ContainerRuntime};

/// Container runtime backed by the Docker engine API
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect using DOCKER_HOST or the default local socket.
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()?;
        Ok(Self { client })
    }

    /// Check the engine answers before starting the watch loop.
    pub async fn ping(&self) -> Result<()> {
        self.client.ping().await?;
        Ok(())
    }
}

/// Filters selecting container start events only
fn start_event_filters() -> HashMap<String, Vec<String>> {
    HashMap::from([
        ("type".to_string(), vec!["container".to_string()]),
        ("event".to_string(), vec!["start".to_string()]),
    ])
}

/// Turn an engine event into a container reference if it is a container start.
///
/// The engine filter already restricts the stream, but the check is repeated
/// so older engines that ignore filters are handled too.
pub(crate) fn start_event_container(event: &EventMessage) -> Option<ContainerRef> {
    if event.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }
    if event.action.as_deref() != Some("start") {
        return None;
    }

    let actor = event.actor.as_ref()?;
    let id = actor.id.clone().filter(|id| !id.is_empty())?;
    let name = actor
        .attributes
        .as_ref()
        .and_then(|attrs| attrs.get("name"))
        .cloned()
        .unwrap_or_default();

    Some(ContainerRef::new(id, name))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerRef>> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let summaries = self.client.list_containers(Some(options)).await?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .unwrap_or_default();
                Some(ContainerRef::new(id, name))
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn inspect_pid(&self, id: &str) -> Result<Option<u32>> {
        let info = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        let pid = info.state.and_then(|state| state.pid);
        debug!(?pid, "Inspected container");
        Ok(usable_pid(pid))
    }

    fn start_events(&self) -> BoxStream<'_, Result<ContainerRef>> {
        let options = EventsOptions::<String> {
            filters: start_event_filters(),
            ..Default::default()
        };

        self.client
            .events(Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(event) => start_event_container(&event).map(Ok),
                    Err(e) => Some(Err(NetfixError::EventStreamClosed(e.to_string()))),
                }
            })
            .boxed()
    }
}
