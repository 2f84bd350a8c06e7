//! Static facts about the monitored database instance.

use serde::Deserialize;

/// Identity and layout of the database instance being administered.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Three-character system identifier, e.g. `HB1`.
    pub sid: String,

    /// Two-digit instance number, e.g. `00`.
    pub instance_number: String,

    /// Host the tool runs on. Must be one of [`Topology::hosts`].
    pub local_host: String,

    /// Every host of the system. Defaults to just the local host.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Internal communication port of the service whose console is used
    /// (`distribute exec <host>:<port>`), e.g. `30003`.
    pub communication_port: u16,

    /// Whether the system runs several tenant databases.
    #[serde(default)]
    pub multitenant: bool,

    /// Tenant database name, used in artifact names on multitenant systems.
    #[serde(default)]
    pub tenant: Option<String>,
}

impl Topology {
    /// Fill in defaults that depend on other fields.
    ///
    /// An empty host list becomes `[local_host]`.
    pub fn normalized(mut self) -> Self {
        if self.hosts.is_empty() {
            self.hosts.push(self.local_host.clone());
        }
        self
    }

    /// Whether the system spans more than one host.
    pub fn is_scale_out(&self) -> bool {
        self.hosts.len() > 1
    }

    /// Tenant name with a trailing underscore, or empty when not multitenant.
    pub fn tenant_infix(&self) -> String {
        match (&self.tenant, self.multitenant) {
            (Some(tenant), true) if !tenant.is_empty() => format!("{tenant}_"),
            _ => String::new(),
        }
    }

    /// Validate identifiers and the host list.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.sid.len() != 3 || !self.sid.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(format!(
                "sid '{}' must be three alphanumeric characters",
                self.sid
            ));
        }
        if self.instance_number.len() != 2
            || !self.instance_number.chars().all(|c| c.is_ascii_digit())
        {
            return Err(format!(
                "instance_number '{}' must be two digits",
                self.instance_number
            ));
        }
        if self.local_host.trim().is_empty() {
            return Err("local_host must not be empty".to_owned());
        }
        if !self.hosts.is_empty() && !self.hosts.contains(&self.local_host) {
            return Err(format!(
                "local_host '{}' is not one of the hosts {:?}",
                self.local_host, self.hosts
            ));
        }
        if self.multitenant && self.tenant.as_deref().map_or(true, str::is_empty) {
            return Err("a multitenant system needs a tenant name".to_owned());
        }
        Ok(())
    }
}
