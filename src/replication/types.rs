//! Replication configuration and progress types.
//!
//! # Status Transitions
//!
//! ```text
//!            start()
//! Stopped ───────────▶ Active ◀──────────┐
//!    ▲                   │               │ new work
//!    │                   │ batcher and   │ (continuous)
//!    │ stop() / one-shot │ tasks drained │
//!    │ caught up         ▼               │
//!    └──────────────── Idle ─────────────┘
//!                        │  ▲
//!          go_offline()  ▼  │ go_online()
//!                      Offline
//! ```

use crate::auth::Authenticator;
use crate::error::CoreError;
use crate::remote::HttpClientFactory;
use crate::revision::Revision;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Filter name Sync Gateway uses for channel subscriptions.
pub const BY_CHANNEL_FILTER: &str = "sync_gateway/bychannel";

/// Which way revisions flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Remote to local.
    Pull,
    /// Local to remote.
    Push,
}

impl Direction {
    pub fn is_push(self) -> bool {
        self == Self::Push
    }

    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a replication is doing right now.
///
/// See module docs for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStatus {
    /// Not started, finished, or failed.
    Stopped,
    /// Running but disconnected on request.
    Offline,
    /// Running with nothing queued or in flight.
    Idle,
    /// Transferring revisions.
    Active,
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Offline => write!(f, "offline"),
            Self::Idle => write!(f, "idle"),
            Self::Active => write!(f, "active"),
        }
    }
}

/// Snapshot published to observers on every status or progress change.
#[derive(Debug, Clone)]
pub struct ReplicationChange {
    pub status: ReplicationStatus,
    /// Revisions transferred or found to be already present.
    pub completed_changes: u64,
    /// Revisions discovered so far.
    pub total_changes: u64,
    pub last_error: Option<Arc<CoreError>>,
}

impl Default for ReplicationChange {
    fn default() -> Self {
        Self {
            status: ReplicationStatus::Stopped,
            completed_changes: 0,
            total_changes: 0,
            last_error: None,
        }
    }
}

/// Local filter for pushes: `(revision, filter params) -> send?`.
pub type PushFilter = Arc<dyn Fn(&Revision, Option<&BTreeMap<String, Value>>) -> bool + Send + Sync>;

/// Rewrites pulled document properties before they are stored.
///
/// Returning `None` skips the revision. `_id`, `_rev` and `_revisions`
/// must be left alone.
pub type PropertyTransformer = Arc<dyn Fn(Map<String, Value>) -> Option<Map<String, Value>> + Send + Sync>;

/// How a replication is set up. Fixed once the replication is built.
#[derive(Clone, Default)]
pub struct ReplicationOptions {
    /// Keep running after catching up.
    pub continuous: bool,
    /// Push only: create the remote database first.
    pub create_target: bool,
    /// Remote filter name for pulls, local filter name for pushes.
    pub filter: Option<String>,
    pub filter_params: Option<BTreeMap<String, Value>>,
    /// Limit the replication to these documents.
    pub doc_ids: Option<Vec<String>>,
    /// Extra headers on every request.
    pub headers: BTreeMap<String, String>,
    /// Overrides credentials found in the remote URL.
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub client_factory: Option<Arc<dyn HttpClientFactory>>,
    /// Push only: the function behind `filter`.
    pub push_filter: Option<PushFilter>,
    /// Pull only: rewrite documents on their way in.
    pub property_transformer: Option<PropertyTransformer>,
}

impl fmt::Debug for ReplicationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationOptions")
            .field("continuous", &self.continuous)
            .field("create_target", &self.create_target)
            .field("filter", &self.filter)
            .field("filter_params", &self.filter_params)
            .field("doc_ids", &self.doc_ids)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("authenticator", &self.authenticator)
            .field("push_filter", &self.push_filter.is_some())
            .field("property_transformer", &self.property_transformer.is_some())
            .finish()
    }
}

impl ReplicationOptions {
    pub fn continuous() -> Self {
        Self {
            continuous: true,
            ..Self::default()
        }
    }

    /// Subscribe to Sync Gateway channels. An empty list clears the filter.
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();
        if channels.is_empty() {
            if self.filter.as_deref() == Some(BY_CHANNEL_FILTER) {
                self.filter = None;
                self.filter_params = None;
            }
            return self;
        }
        self.filter = Some(BY_CHANNEL_FILTER.to_string());
        let mut params = BTreeMap::new();
        params.insert("channels".to_string(), Value::String(channels.join(",")));
        self.filter_params = Some(params);
        self
    }

    /// Channels named by a channel filter, if that is the filter in use.
    pub fn channels(&self) -> Vec<String> {
        if self.filter.as_deref() != Some(BY_CHANNEL_FILTER) {
            return Vec::new();
        }
        self.filter_params
            .as_ref()
            .and_then(|p| p.get("channels"))
            .and_then(Value::as_str)
            .map(|s| {
                s.split(',')
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A revision waiting in the batcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingRevision {
    pub doc_id: String,
    pub rev_id: String,
    pub deleted: bool,
    /// Entry in the replication's sequence map.
    pub sequence_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channels_round_trip() {
        let opts = ReplicationOptions::default().with_channels(["news", "sports"]);
        assert_eq!(opts.filter.as_deref(), Some(BY_CHANNEL_FILTER));
        assert_eq!(opts.filter_params.as_ref().unwrap()["channels"], "news,sports");
        assert_eq!(opts.channels(), vec!["news", "sports"]);

        let cleared = opts.with_channels(Vec::<String>::new());
        assert!(cleared.filter.is_none());
        assert!(cleared.channels().is_empty());
    }

    #[test]
    fn test_empty_channels_keep_other_filters() {
        let opts = ReplicationOptions {
            filter: Some("app/mine".into()),
            ..Default::default()
        }
        .with_channels(Vec::<String>::new());
        assert_eq!(opts.filter.as_deref(), Some("app/mine"));
        assert!(opts.channels().is_empty());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ReplicationStatus::Active.to_string(), "active");
        assert_eq!(ReplicationStatus::Offline.to_string(), "offline");
        assert_eq!(Direction::Push.to_string(), "push");
    }
}
