//! Topology snapshots.
//!
//! A [`TopologySnapshot`] is an immutable view of which providers serve each
//! business, produced by service discovery outside this crate. The
//! [`TopologyHolder`] publishes the latest one; readers copy the pointer and
//! keep using their copy for as long as they need it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One backend instance serving a business.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub addr: String,
}

impl Provider {
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
        }
    }
}

/// Immutable business name to provider list view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologySnapshot {
    version: u64,
    bizs: HashMap<String, Vec<Provider>>,
}

impl TopologySnapshot {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            bizs: HashMap::new(),
        }
    }

    /// Adds (or replaces) the provider list for `biz_name`.
    pub fn with_biz(mut self, biz_name: impl Into<String>, providers: Vec<Provider>) -> Self {
        self.bizs.insert(biz_name.into(), providers);
        self
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Providers of `biz_name`; empty if the business is unknown.
    pub fn providers(&self, biz_name: &str) -> &[Provider] {
        self.bizs.get(biz_name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains_biz(&self, biz_name: &str) -> bool {
        self.bizs.contains_key(biz_name)
    }

    pub fn biz_names(&self) -> impl Iterator<Item = &str> {
        self.bizs.keys().map(String::as_str)
    }
}

/// Holds the currently published topology.
#[derive(Debug, Default)]
pub struct TopologyHolder {
    current: Mutex<Option<Arc<TopologySnapshot>>>,
}

impl TopologyHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the published snapshot (`None` withdraws it).
    pub fn publish(&self, snapshot: Option<Arc<TopologySnapshot>>) {
        *self.current.lock().unwrap() = snapshot;
    }

    /// Copies out the current snapshot pointer.
    pub fn current(&self) -> Option<Arc<TopologySnapshot>> {
        self.current.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers(n: usize) -> Vec<Provider> {
        (0..n)
            .map(|i| Provider::new(format!("p{}", i), format!("10.0.0.{}:9000", i)))
            .collect()
    }

    #[test]
    fn test_snapshot_lookup() {
        let snapshot = TopologySnapshot::new(3).with_biz("a", providers(2));
        assert_eq!(snapshot.version(), 3);
        assert_eq!(snapshot.providers("a").len(), 2);
        assert!(snapshot.providers("missing").is_empty());
        assert!(snapshot.contains_biz("a"));
        assert_eq!(snapshot.biz_names().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_holder_publish_and_withdraw() {
        let holder = TopologyHolder::new();
        assert!(holder.current().is_none());

        let first = Arc::new(TopologySnapshot::new(1));
        holder.publish(Some(first.clone()));
        let seen = holder.current().unwrap();
        assert_eq!(seen.version(), 1);

        holder.publish(Some(Arc::new(TopologySnapshot::new(2))));
        // Earlier readers keep their copy
        assert_eq!(seen.version(), 1);
        assert_eq!(holder.current().unwrap().version(), 2);

        holder.publish(None);
        assert!(holder.current().is_none());
    }
}
