//! Container engine abstraction
//!
//! The watcher only needs three things from the engine: the containers already
//! running, the pid of a container's init process, and a stream of start
//! events. Keeping them behind a trait lets the watch loop run against a fake
//! engine in tests.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

/// A container as seen by the watcher
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerRef {
    /// Engine id
    pub id: String,
    /// Human readable name, used as the log correlation id
    pub name: String,
}

impl ContainerRef {
    /// Build a reference, normalizing the engine's "/name" form.
    pub fn new(id: impl Into<String>, name: impl AsRef<str>) -> Self {
        let id = id.into();
        let name = trim_name(name.as_ref());
        let name = if name.is_empty() { id.clone() } else { name.to_string() };
        Self { id, name }
    }
}

impl std::fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Strip the leading "/" the engine puts on container names.
pub fn trim_name(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

/// Container engine operations used by the watcher
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Containers currently running
    async fn list_running(&self) -> Result<Vec<ContainerRef>>;

    /// Pid of the container's init process; `None` if it is not running
    async fn inspect_pid(&self, id: &str) -> Result<Option<u32>>;

    /// Stream of container start events. An `Err` item or the end of the
    /// stream means the subscription is lost.
    fn start_events(&self) -> BoxStream<'_, Result<ContainerRef>>;
}

/// Convert an engine pid into a usable one; zero and negatives mean "no process".
pub fn usable_pid(pid: Option<i64>) -> Option<u32> {
    pid.filter(|p| *p >= 1).and_then(|p| u32::try_from(p).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_name() {
        assert_eq!(trim_name("/web-1"), "web-1");
        assert_eq!(trim_name("web-1"), "web-1");
        assert_eq!(trim_name("//x"), "/x");
    }

    #[test]
    fn test_container_ref_falls_back_to_id() {
        let c = ContainerRef::new("abc123", "/");
        assert_eq!(c.name, "abc123");

        let c = ContainerRef::new("abc123", "/web");
        assert_eq!(c.name, "web");
        assert_eq!(c.to_string(), "web");
    }

    #[test]
    fn test_usable_pid() {
        assert_eq!(usable_pid(None), None);
        assert_eq!(usable_pid(Some(0)), None);
        assert_eq!(usable_pid(Some(-1)), None);
        assert_eq!(usable_pid(Some(4242)), Some(4242));
    }
}
