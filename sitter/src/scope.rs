//! Which hosts a recording targets.

use std::collections::BTreeSet;

/// All hosts of the deployment and the subset implicated by the current
/// anomaly. Outside host mode the subset is always every host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostScope {
    all_hosts: Vec<String>,
    in_scope: BTreeSet<String>,
}

impl HostScope {
    /// Scope covering every host, in the given order.
    pub fn new(all_hosts: Vec<String>) -> Self {
        let in_scope = all_hosts.iter().cloned().collect();
        Self {
            all_hosts,
            in_scope,
        }
    }

    /// Narrow the scope to `violating` hosts that belong to the deployment.
    ///
    /// An empty key (a rule that was not counted per host) keeps every host.
    pub fn restrict<S: AsRef<str>>(&mut self, violating: &[S]) {
        if violating.iter().any(|host| host.as_ref().is_empty()) {
            self.reset();
            return;
        }
        self.in_scope = self
            .all_hosts
            .iter()
            .filter(|host| violating.iter().any(|v| v.as_ref() == host.as_str()))
            .cloned()
            .collect();
    }

    /// Back to every host.
    pub fn reset(&mut self) {
        self.in_scope = self.all_hosts.iter().cloned().collect();
    }

    /// Targeted hosts in deployment order.
    pub fn hosts(&self) -> Vec<&str> {
        self.all_hosts
            .iter()
            .filter(|host| self.in_scope.contains(host.as_str()))
            .map(String::as_str)
            .collect()
    }
}
