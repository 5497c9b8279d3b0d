// agent/src/sys/volatile.rs

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::sys::environment::{AwsMeta, EnvironmentSnapshot};

/// Environment facts published to the scheduler with each heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentEnv {
    pub os: String,
    pub arch: String,
    pub ident: String,
    pub init: String,
    pub addresses: Vec<String>,
    pub public_ip: String,
    pub aws: AwsMeta,
    pub is_proxied: bool,
    pub proxy: String,
    pub modules: Vec<String>,
}

/// Read view of the volatile block.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VolatileContext {
    pub hostname: String,
    pub env: AgentEnv,
    pub refresh_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// First snapshot: initialization, not a change notification.
    Seeded,
    Changed,
    Unchanged,
}

#[derive(Default)]
struct Inner {
    view: VolatileContext,
    last: Option<EnvironmentSnapshot>,
}

/// Owner of the host facts that may drift over the agent's lifetime.
///
/// 🛡️ The fields are unreachable except through `read` and `apply*`, each of
/// which holds the lock for its whole duration, so the locking discipline is
/// enforced by construction.
#[derive(Default)]
pub struct VolatileStore {
    inner: Mutex<Inner>,
}

impl VolatileStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking reader cannot leave the block half-written: every
        // writer replaces whole fields.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read(&self) -> VolatileContext {
        self.lock().view.clone()
    }

    pub fn is_seeded(&self) -> bool {
        self.lock().last.is_some()
    }

    /// Retained copy of the last applied snapshot.
    pub fn last_snapshot(&self) -> Option<EnvironmentSnapshot> {
        self.lock().last.clone()
    }

    /// Reports drift only. Seeding a fresh store returns `false`.
    pub fn apply(&self, snapshot: EnvironmentSnapshot) -> bool {
        self.apply_snapshot(snapshot) == Applied::Changed
    }

    pub fn apply_snapshot(&self, snapshot: EnvironmentSnapshot) -> Applied {
        let mut inner = self.lock();
        let outcome = match &inner.last {
            None => Applied::Seeded,
            Some(last) if *last != snapshot => Applied::Changed,
            Some(_) => return Applied::Unchanged,
        };

        let view = &mut inner.view;
        view.hostname = snapshot.hostname.clone();
        view.env.os = snapshot.os.clone();
        view.env.arch = snapshot.arch.clone();
        view.env.ident = snapshot.ident.clone();
        view.env.init = snapshot.init.clone();
        view.env.addresses = snapshot.addresses.clone();
        view.env.public_ip = snapshot.public_ip.clone();
        view.env.aws = snapshot.aws.clone();
        view.refresh_ts = Some(Utc::now());
        inner.last = Some(snapshot);
        outcome
    }

    /// Records the relay route chosen by the broker connector.
    pub fn record_route(&self, proxy: Option<&str>) {
        let mut inner = self.lock();
        inner.view.env.is_proxied = proxy.is_some();
        inner.view.env.proxy = proxy.unwrap_or_default().to_string();
    }

    pub fn set_modules(&self, modules: Vec<String>) {
        self.lock().view.env.modules = modules;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(hostname: &str) -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            hostname: hostname.to_string(),
            os: "linux".into(),
            arch: "x86_64".into(),
            ident: "Ubuntu 24.04 LTS".into(),
            init: "systemd".into(),
            addresses: vec!["10.0.0.5".into(), "fe80::1".into()],
            public_ip: "203.0.113.7".into(),
            uid: "abcd1234".into(),
            queue_loc: "linux.web-01.abcd1234".into(),
            ..Default::default()
        }
    }

    #[test]
    fn fresh_store_seeds_without_reporting_change() {
        let store = VolatileStore::new();
        assert!(!store.is_seeded());
        assert!(!store.apply(snapshot("web-01")));
        assert!(store.is_seeded());
        assert_eq!(store.last_snapshot(), Some(snapshot("web-01")));

        let view = store.read();
        assert_eq!(view.hostname, "web-01");
        assert_eq!(view.env.public_ip, "203.0.113.7");
        assert!(view.refresh_ts.is_some());
    }

    #[test]
    fn seeding_reports_seeded_even_for_empty_snapshot() {
        let store = VolatileStore::new();
        assert_eq!(store.apply_snapshot(EnvironmentSnapshot::default()), Applied::Seeded);
        assert_eq!(store.last_snapshot(), Some(EnvironmentSnapshot::default()));
    }

    #[test]
    fn identical_snapshot_is_not_a_change_and_leaves_state_untouched() {
        let store = VolatileStore::new();
        store.apply(snapshot("web-01"));
        let before = store.read();
        assert!(!store.apply(snapshot("web-01")));
        assert_eq!(store.read(), before);
    }

    #[test]
    fn single_field_drift_is_reported_and_retained() {
        let store = VolatileStore::new();
        store.apply(snapshot("web-01"));

        let mut drifted = snapshot("web-01");
        drifted.aws.instance_id = "i-0abc".into();
        assert!(store.apply(drifted.clone()));
        assert_eq!(store.last_snapshot(), Some(drifted));
        assert_eq!(store.read().env.aws.instance_id, "i-0abc");
    }

    #[test]
    fn every_observed_field_participates_in_comparison() {
        let mutations: Vec<fn(&mut EnvironmentSnapshot)> = vec![
            |s| s.hostname.push('x'),
            |s| s.os.push('x'),
            |s| s.arch.push('x'),
            |s| s.ident.push('x'),
            |s| s.init.push('x'),
            |s| s.addresses.push("192.0.2.1".into()),
            |s| s.public_ip.push('x'),
            |s| s.aws.instance_id.push('x'),
            |s| s.aws.local_ipv4.push('x'),
            |s| s.aws.ami_id.push('x'),
            |s| s.aws.instance_type.push('x'),
        ];
        for mutate in mutations {
            let store = VolatileStore::new();
            store.apply(snapshot("web-01"));
            let mut next = snapshot("web-01");
            mutate(&mut next);
            assert!(store.apply(next));
        }
    }

    #[test]
    fn route_and_modules_are_recorded() {
        let store = VolatileStore::new();
        store.record_route(Some("10.0.0.1:3128"));
        store.set_modules(vec!["file".into(), "netstat".into()]);
        let view = store.read();
        assert!(view.env.is_proxied);
        assert_eq!(view.env.proxy, "10.0.0.1:3128");
        assert_eq!(view.env.modules.len(), 2);

        store.record_route(None);
        assert!(!store.read().env.is_proxied);
    }
}
