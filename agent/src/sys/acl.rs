// agent/src/sys/acl.rs

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::sys::logs::AgentLog;

/// One policy fragment: permission name → policy payload.
pub type Permission = BTreeMap<String, serde_json::Value>;

/// Ordered access-control list. Built once at bootstrap, immutable after.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Acl(Vec<Permission>);

impl Acl {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.0.iter()
    }

    /// Names of every permission, in fragment order.
    pub fn names(&self) -> Vec<&str> {
        self.0
            .iter()
            .flat_map(|permission| permission.keys().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum AclError {
    #[error("permission fragment #{index} is malformed: {source}")]
    Malformed {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Parses every fragment independently. A single malformed fragment aborts
/// the whole load; no partial list is ever returned.
pub fn load_acl<S: AsRef<str>>(fragments: &[S], log: &AgentLog) -> Result<Acl, AclError> {
    let mut permissions = Vec::with_capacity(fragments.len());

    for (index, fragment) in fragments.iter().enumerate() {
        let permission: Permission = serde_json::from_str(fragment.as_ref())
            .map_err(|source| AclError::Malformed { index, source })?;
        for name in permission.keys() {
            log.info(format!("Loading permission named '{}'", name));
        }
        permissions.push(permission);
    }

    Ok(Acl(permissions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::channels::Queue;
    use crate::sys::logs::LogEvent;
    use std::sync::Arc;

    fn log() -> (AgentLog, Arc<Queue<LogEvent>>) {
        let queue = Arc::new(Queue::new("log", 32).unwrap());
        (AgentLog::new(queue.clone()), queue)
    }

    #[test]
    fn preserves_length_and_order() {
        let (log, _) = log();
        let fragments = [
            r#"{"default": {"minimumweight": 2, "investigators": {"alice": {"weight": 2}}}}"#,
            r#"{"file": {"minimumweight": 1}}"#,
            r#"{"netstat": {"minimumweight": 1}}"#,
        ];
        let acl = load_acl(&fragments, &log).unwrap();
        assert_eq!(acl.len(), 3);
        assert_eq!(acl.names(), vec!["default", "file", "netstat"]);
        assert_eq!(acl.iter().next().unwrap()["default"]["minimumweight"], 2);
    }

    #[test]
    fn empty_input_yields_empty_acl() {
        let (log, _) = log();
        let acl = load_acl::<&str>(&[], &log).unwrap();
        assert!(acl.is_empty());
    }

    #[test]
    fn one_malformed_fragment_aborts_everything() {
        let (log, _) = log();
        let fragments = [
            r#"{"default": {}}"#,
            r#"{"file": "#,
            r#"{"netstat": {}}"#,
        ];
        match load_acl(&fragments, &log) {
            Err(AclError::Malformed { index, .. }) => assert_eq!(index, 1),
            Ok(acl) => panic!("partial acl installed: {:?}", acl),
        }
    }

    #[test]
    fn non_object_fragment_is_malformed() {
        let (log, _) = log();
        assert!(load_acl(&["[1, 2, 3]"], &log).is_err());
    }

    #[tokio::test]
    async fn each_permission_name_is_traced() {
        let (log, queue) = log();
        load_acl(&[r#"{"a": {}, "b": {}}"#], &log).unwrap();
        assert_eq!(queue.recv().await.unwrap().desc, "Loading permission named 'a'");
        assert_eq!(queue.recv().await.unwrap().desc, "Loading permission named 'b'");
    }
}
