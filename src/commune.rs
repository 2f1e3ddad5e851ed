//! Named aggregates of test-run state shared between statements

use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

use crate::error::{Result, StressError};

/// The latest value published for one group
#[derive(Debug)]
pub struct Commune {
    name: String,
    value: watch::Sender<Option<String>>,
}

impl Commune {
    fn new(name: impl Into<String>) -> Self {
        let (value, _) = watch::channel(None);
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the stored value
    pub fn publish(&self, value: impl Into<String>) {
        self.value.send_replace(Some(value.into()));
    }

    /// The most recently published value, if any
    pub fn latest(&self) -> Option<String> {
        self.value.borrow().clone()
    }

    /// Wait for the next value published after this call
    pub async fn changed(&self) -> Option<String> {
        let mut rx = self.value.subscribe();
        // The sender is owned by `self` and outlives the receiver.
        rx.changed().await.ok()?;
        rx.borrow_and_update().clone()
    }
}

/// Lock-protected map from group name to commune
#[derive(Debug, Default)]
pub struct CommuneRegistry {
    communes: RwLock<HashMap<String, Arc<Commune>>>,
}

impl CommuneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the named commune, creating it on first use
    pub fn get_or_create(&self, name: &str) -> Result<Arc<Commune>> {
        let mut communes = self
            .communes
            .write()
            .map_err(|_| StressError::Other("Lock poisoned".to_string()))?;

        let commune = communes.entry(name.to_string()).or_insert_with(|| {
            debug!("Creating commune '{}'", name);
            Arc::new(Commune::new(name))
        });
        Ok(Arc::clone(commune))
    }

    pub fn get(&self, name: &str) -> Result<Option<Arc<Commune>>> {
        let communes = self
            .communes
            .read()
            .map_err(|_| StressError::Other("Lock poisoned".to_string()))?;
        Ok(communes.get(name).cloned())
    }

    pub fn names(&self) -> Result<Vec<String>> {
        let communes = self
            .communes
            .read()
            .map_err(|_| StressError::Other("Lock poisoned".to_string()))?;
        let mut names: Vec<String> = communes.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_get_or_create_returns_same_commune() {
        let registry = CommuneRegistry::new();
        let a = registry.get_or_create("cpu").unwrap();
        let b = registry.get_or_create("cpu").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("mem").unwrap().is_none());
        assert_eq!(registry.names().unwrap(), vec!["cpu"]);
    }

    #[test]
    fn test_publish_replaces_latest() {
        let commune = CommuneRegistry::new().get_or_create("cpu").unwrap();
        assert_eq!(commune.latest(), None);
        commune.publish("10");
        commune.publish("11");
        assert_eq!(commune.latest().as_deref(), Some("11"));
    }

    #[tokio::test]
    async fn test_changed_waits_for_new_value() {
        let commune = CommuneRegistry::new().get_or_create("cpu").unwrap();
        commune.publish("old");

        let waiter = {
            let commune = Arc::clone(&commune);
            tokio::spawn(async move { commune.changed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        commune.publish("new");

        let value = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value.as_deref(), Some("new"));
    }
}
