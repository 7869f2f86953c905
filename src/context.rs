//! State accumulated over one registration run.
//!
//! Every component receives the context explicitly.  The on-disk cache, the
//! host override table and the zypper artefacts are the only shared mutable
//! state, and they are only touched through the methods here so that a set
//! current target always has a cache file and a host override behind it.

use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;

use log::{info, warn};

use crate::cache::{CacheSlot, EndpointCache};
use crate::error::Result;
use crate::hosts::HostsTable;
use crate::types::{EndpointRecord, Product};
use crate::zypp::ZyppState;

pub struct RunContext {
    pub cache: EndpointCache,
    pub hosts: HostsTable,
    pub zypp: ZyppState,
    pub current_target: Option<EndpointRecord>,
    /// Reconciled candidate list, in reconciler order.
    pub candidates: Vec<EndpointRecord>,
    /// Endpoints the base registration already failed against.
    pub failed: HashSet<EndpointRecord>,
    /// Module triplets already attempted this run.
    pub registered: BTreeSet<Product>,
}

impl RunContext {
    pub fn new(cache: EndpointCache, hosts: HostsTable, zypp: ZyppState) -> Self {
        Self {
            cache,
            hosts,
            zypp,
            current_target: None,
            candidates: Vec::new(),
            failed: HashSet::new(),
            registered: BTreeSet::new(),
        }
    }

    /// Make `record` the configured target, resolved to `addr`.
    ///
    /// The host override is rolled back when the cache write fails.
    pub fn install_target(&mut self, record: &EndpointRecord, addr: IpAddr) -> Result<()> {
        self.hosts.set_override(record, addr)?;
        if let Err(e) = self.cache.persist(record, CacheSlot::Current) {
            if let Err(rollback) = self.hosts.remove_override(&record.fqdn) {
                warn!("Could not roll back host override for {}: {}", record.fqdn, rollback);
            }
            return Err(e);
        }
        self.current_target = Some(record.clone());
        Ok(())
    }

    /// Resolve the current target's hostname to `addr`; its identity and
    /// cache entry stay the same.  The previous override is restored when
    /// the cache write fails.
    pub fn repoint_target(&mut self, target: &EndpointRecord, addr: IpAddr) -> Result<()> {
        let previous = self.hosts.lookup(&target.fqdn)?;
        self.hosts.set_override(target, addr)?;
        if let Err(e) = self.cache.persist(target, CacheSlot::Current) {
            let rollback = match previous {
                Some(previous) => self.hosts.set_override(target, previous),
                None => self.hosts.remove_override(&target.fqdn),
            };
            if let Err(rollback) = rollback {
                warn!("Could not restore host override for {}: {}", target.fqdn, rollback);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Reset the instance to an unregistered state with respect to `servers`.
    pub fn clear_registration(&mut self, servers: &[EndpointRecord]) -> Result<()> {
        self.cache.remove(CacheSlot::Current)?;
        for server in servers {
            info!("Clearing registration data for {}", server.fqdn);
            self.hosts.remove_override(&server.fqdn)?;
            self.zypp.remove_repos(&server.fqdn)?;
            self.zypp.remove_services(&server.fqdn)?;
        }
        self.zypp.remove_credentials()?;
        self.current_target = None;
        Ok(())
    }

    /// Forget the current target and every cached endpoint.
    pub fn reset(&mut self) -> Result<()> {
        let target: Vec<EndpointRecord> = self.current_target.iter().cloned().collect();
        self.clear_registration(&target)?;
        self.cache.purge_all()
    }
}
