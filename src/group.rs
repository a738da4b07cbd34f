//! Consumer group lifecycle and introspection.

use std::sync::Arc;

use crate::broker::StreamBroker;
use crate::error::{Error, Result};
use crate::types::{ConsumerInfo, GroupInfo, StartId, validate_name};

/// Creates, deletes and inspects consumer groups.
#[derive(Clone)]
pub struct ConsumerGroupManager {
    broker: Arc<dyn StreamBroker>,
    auto_create_stream: bool,
}

impl ConsumerGroupManager {
    /// Manager that creates missing streams when creating a group.
    pub fn new(broker: Arc<dyn StreamBroker>) -> Self {
        Self {
            broker,
            auto_create_stream: true,
        }
    }

    /// Set whether `create_group` may create a missing stream.
    pub fn with_auto_create_stream(mut self, auto_create_stream: bool) -> Self {
        self.auto_create_stream = auto_create_stream;
        self
    }

    /// Create `group` on `stream`. Returns `Ok(false)` if the group already exists.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for an invalid stream or group name.
    /// - [`Error::StreamNotFound`] if the stream is missing and auto-creation is off.
    pub async fn create_group(&self, stream: &str, group: &str, start: StartId) -> Result<bool> {
        validate_name("stream", stream)?;
        validate_name("group", group)?;
        let created = self
            .broker
            .create_group(stream, group, start, self.auto_create_stream)
            .await?;
        if created {
            tracing::info!(stream, group, start = %start.as_arg(), "created consumer group");
        } else {
            tracing::debug!(stream, group, "consumer group already exists");
        }
        Ok(created)
    }

    /// Destroy `group`. Returns `false` if it did not exist.
    pub async fn delete_group(&self, stream: &str, group: &str) -> Result<bool> {
        let deleted = self.broker.destroy_group(stream, group).await?;
        if deleted {
            tracing::info!(stream, group, "deleted consumer group");
        }
        Ok(deleted)
    }

    /// Names of all groups on `stream`. `StreamNotFound` when the stream is absent.
    pub async fn list_groups(&self, stream: &str) -> Result<Vec<String>> {
        Ok(self
            .broker
            .group_infos(stream)
            .await?
            .into_iter()
            .map(|g| g.name)
            .collect())
    }

    /// Summary of one group.
    ///
    /// # Errors
    ///
    /// [`Error::GroupNotFound`] when the group, or the stream itself, is absent.
    pub async fn get_group_info(&self, stream: &str, group: &str) -> Result<GroupInfo> {
        let not_found = || Error::GroupNotFound {
            group: group.to_string(),
            stream: stream.to_string(),
        };
        let groups = match self.broker.group_infos(stream).await {
            Ok(groups) => groups,
            Err(Error::StreamNotFound { .. }) => return Err(not_found()),
            Err(err) => return Err(err),
        };
        groups
            .into_iter()
            .find(|g| g.name == group)
            .ok_or_else(not_found)
    }

    /// Consumers known to `group` with their pending counts and idle times.
    pub async fn list_consumers(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>> {
        self.broker.consumer_infos(stream, group).await
    }
}
