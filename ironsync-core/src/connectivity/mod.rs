//! Single source of truth for network reachability. The platform flag is
//! necessary but not sufficient (captive portals), so `check_connectivity`
//! backs it with a bounded probe against the API's health endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::events::{Listeners, Subscription};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WAIT_FOR_ONLINE: Duration = Duration::from_secs(30);

pub struct ConnectivityMonitor {
    online: AtomicBool,
    listeners: Listeners<bool>,
    probe_url: String,
    client: reqwest::Client,
}

impl ConnectivityMonitor {
    /// `seed_online` is the platform-reported status at startup; `base_url`
    /// is the API root whose `/health` endpoint serves as the probe target.
    pub fn new(seed_online: bool, base_url: &str) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Arc::new(Self {
            online: AtomicBool::new(seed_online),
            listeners: Listeners::new(),
            probe_url: format!("{}/health", base_url.trim_end_matches('/')),
            client,
        }))
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record a platform-reported change. Listeners fire only on an actual
    /// transition, in registration order.
    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            info!(
                "Connectivity transition: {}",
                if online { "online" } else { "offline" }
            );
            self.listeners.emit(&online);
        }
    }

    pub fn subscribe(&self, cb: impl Fn(&bool) + Send + Sync + 'static) -> Subscription<bool> {
        self.listeners.subscribe(cb)
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }

    /// Active reachability check. Short-circuits to false without touching
    /// the network when the platform already reports offline; otherwise a
    /// HEAD against the health endpoint decides, and the result becomes the
    /// new state.
    pub async fn check_connectivity(&self) -> bool {
        if !self.is_online() {
            debug!("check_connectivity: platform reports offline, skipping probe");
            return false;
        }

        let reachable = match self.client.head(&self.probe_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("Reachability probe failed: {}", e);
                false
            }
        };
        self.set_online(reachable);
        reachable
    }

    /// Resolve true as soon as we are online, or false once `timeout`
    /// elapses. The internal subscription is released before returning.
    pub async fn wait_for_online(&self, timeout: Duration) -> bool {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = self.subscribe(move |online: &bool| {
            if *online {
                let _ = tx.send(());
            }
        });

        // Subscribed first, then re-checked, so a transition between the two
        // cannot be missed.
        if self.is_online() {
            sub.unsubscribe();
            return true;
        }

        let result = matches!(tokio::time::timeout(timeout, rx.recv()).await, Ok(Some(())));
        drop(sub);
        result
    }

    /// `wait_for_online` with the standard patience for callers that have no
    /// deadline of their own.
    pub async fn wait_for_online_default(&self) -> bool {
        self.wait_for_online(DEFAULT_WAIT_FOR_ONLINE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(seed_online: bool) -> Arc<ConnectivityMonitor> {
        ConnectivityMonitor::new(seed_online, "http://localhost:9").unwrap()
    }

    #[tokio::test]
    async fn listeners_fire_only_on_transition() {
        let m = monitor(false);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = m.subscribe(move |online| s.lock().unwrap().push(*online));

        m.set_online(false);
        m.set_online(true);
        m.set_online(true);
        m.set_online(false);

        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn check_connectivity_short_circuits_offline() {
        // Probe target is unroutable; the short-circuit means it is never hit.
        let m = monitor(false);
        assert!(!m.check_connectivity().await);
        assert!(!m.is_online());
    }

    #[tokio::test]
    async fn wait_for_online_immediate_when_online() {
        let m = monitor(true);
        assert!(m.wait_for_online(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn wait_for_online_resolves_on_transition() {
        let m = monitor(false);
        let m2 = m.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            m2.set_online(true);
        });
        assert!(m.wait_for_online(Duration::from_secs(5)).await);
        // No leaked listener once resolved.
        assert_eq!(m.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn default_wait_resolves_on_transition() {
        let m = monitor(false);
        let m2 = m.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            m2.set_online(true);
        });
        assert!(m.wait_for_online_default().await);
    }

    #[tokio::test]
    async fn wait_for_online_times_out() {
        let m = monitor(false);
        assert!(!m.wait_for_online(Duration::from_millis(30)).await);
        assert_eq!(m.subscriber_count(), 0);
    }
}
