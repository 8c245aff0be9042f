//! Route table shared between the tunnel manager and the shared proxy

use crate::host::normalize_host;
use crate::{Route, RouteError, DEFAULT_SUFFIX};
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

/// Concurrency-safe mapping from domain to backend target
///
/// Both key forms of a route are written inside one write-lock section, so a
/// reader sees either neither or both.
pub struct RouteTable {
    suffix: String,
    routes: RwLock<HashMap<String, Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::with_suffix(DEFAULT_SUFFIX)
    }

    /// Table using a custom local suffix (e.g. `.test`)
    pub fn with_suffix(suffix: &str) -> Self {
        let suffix = suffix.trim().to_ascii_lowercase();
        let suffix = if suffix.starts_with('.') {
            suffix
        } else {
            format!(".{}", suffix)
        };

        Self {
            suffix,
            routes: RwLock::new(HashMap::new()),
        }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Register `route` under its suffixed and bare domain
    ///
    /// The stored route's `domain` is rewritten to the suffixed form.
    pub fn add(&self, mut route: Route) -> Result<(), RouteError> {
        let (full, bare) = self.key_forms(&route.domain)?;
        route.domain = full.clone();

        let mut routes = self.write();
        if routes.contains_key(&full) || routes.contains_key(&bare) {
            return Err(RouteError::AlreadyExists(full));
        }

        debug!(
            "Adding route {} (alias {}) -> {}",
            full,
            bare,
            route.target_authority()
        );
        routes.insert(bare, route.clone());
        routes.insert(full, route);
        Ok(())
    }

    /// Remove both key forms of `domain`
    pub fn remove(&self, domain: &str) -> Result<Route, RouteError> {
        let (full, bare) = self.key_forms(domain)?;

        let mut routes = self.write();
        let removed = routes.remove(&full);
        routes.remove(&bare);

        match removed {
            Some(route) => {
                debug!("Removed route {}", full);
                Ok(route)
            }
            None => Err(RouteError::NotFound(full)),
        }
    }

    /// Resolve a Host header value (port allowed) to its route
    pub fn lookup(&self, host: &str) -> Result<Route, RouteError> {
        let key = normalize_host(host);
        trace!("Looking up route for host: {}", key);

        self.read()
            .get(&key)
            .cloned()
            .ok_or(RouteError::NotFound(key))
    }

    /// Snapshot of all routes keyed by suffixed domain
    pub fn list(&self) -> BTreeMap<String, Route> {
        self.read()
            .iter()
            .filter(|(key, route)| **key == route.domain)
            .map(|(key, route)| (key.clone(), route.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// `(suffixed, bare)` keys for a domain
    fn key_forms(&self, domain: &str) -> Result<(String, String), RouteError> {
        let name = normalize_host(domain);
        let bare = name.strip_suffix(self.suffix.as_str()).unwrap_or(&name);

        if bare.is_empty() {
            return Err(RouteError::InvalidDomain(domain.to_string()));
        }

        Ok((format!("{}{}", bare, self.suffix), bare.to_string()))
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Route>> {
        self.routes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Route>> {
        self.routes.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
