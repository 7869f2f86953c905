//! Elect the registration server to use for this run.
//!
//! A configured target that still answers is kept as is.  A dead one is
//! replaced by an equivalent server (same certificate, different path) by
//! re-pointing the target's hostname; its identity is preserved.  Without a
//! configured target the first responsive candidate in reconciler order
//! wins.

use std::net::IpAddr;

use log::{debug, info, warn};

use crate::cache::CacheSlot;
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::probe::Prober;
use crate::types::EndpointRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorState {
    NoTarget,
    /// A target is configured but has not been probed yet.
    TargetConfigured,
    TargetAlive,
    TargetDeadNoReplacement,
    TargetDeadReplaced,
    FreshElection,
}

/// Successful outcome of an election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Election {
    TargetAlive(EndpointRecord),
    TargetDeadReplaced {
        target: EndpointRecord,
        replacement: EndpointRecord,
        addr: IpAddr,
    },
    FreshElection {
        target: EndpointRecord,
        addr: IpAddr,
    },
}

impl Election {
    pub fn target(&self) -> &EndpointRecord {
        match self {
            Election::TargetAlive(target)
            | Election::TargetDeadReplaced { target, .. }
            | Election::FreshElection { target, .. } => target,
        }
    }

    pub fn state(&self) -> SelectorState {
        match self {
            Election::TargetAlive(_) => SelectorState::TargetAlive,
            Election::TargetDeadReplaced { .. } => SelectorState::TargetDeadReplaced,
            Election::FreshElection { .. } => SelectorState::FreshElection,
        }
    }
}

impl SelectorState {
    pub fn initial(ctx: &RunContext) -> Self {
        if ctx.current_target.is_some() {
            SelectorState::TargetConfigured
        } else {
            SelectorState::NoTarget
        }
    }
}

pub async fn elect(ctx: &mut RunContext, prober: &dyn Prober) -> Result<Election> {
    debug!("Election starting from {:?}", SelectorState::initial(ctx));
    match ctx.current_target.clone() {
        Some(target) => keep_or_replace(ctx, prober, target).await,
        None => fresh_election(ctx, prober).await,
    }
}

async fn keep_or_replace(
    ctx: &mut RunContext,
    prober: &dyn Prober,
    target: EndpointRecord,
) -> Result<Election> {
    if prober.is_responsive(&target).await {
        if !ctx.cache.contains(CacheSlot::Current) {
            ctx.cache.persist(&target, CacheSlot::Current)?;
        }
        info!("Registered server {} is responsive", target);
        return Ok(Election::TargetAlive(target));
    }

    warn!("Registered server {} is not responding, looking for an equivalent", target);
    let alternates: Vec<EndpointRecord> = ctx
        .candidates
        .iter()
        .filter(|candidate| candidate.is_alternate_path_to(&target))
        .cloned()
        .collect();

    for replacement in alternates {
        let Some(addr) = prober.reachable_address(&replacement).await else {
            warn!("Equivalent server {} is not responding either", replacement);
            continue;
        };
        ctx.repoint_target(&target, addr)?;
        info!(
            "Switched {} to equivalent server {} via {}",
            target.fqdn, replacement, addr
        );
        return Ok(Election::TargetDeadReplaced {
            target,
            replacement,
            addr,
        });
    }

    debug!("Election ended in {:?}", SelectorState::TargetDeadNoReplacement);
    Err(Error::NoEquivalentReplacement { fqdn: target.fqdn })
}

async fn fresh_election(ctx: &mut RunContext, prober: &dyn Prober) -> Result<Election> {
    let mut probed = Vec::new();
    for candidate in ctx.candidates.clone() {
        if let Some(addr) = prober.reachable_address(&candidate).await {
            ctx.install_target(&candidate, addr)?;
            info!("Elected registration server {} via {}", candidate, addr);
            return Ok(Election::FreshElection {
                target: candidate,
                addr,
            });
        }
        probed.extend(candidate.addresses().iter().map(IpAddr::to_string));
    }
    Err(Error::NoResponsiveEndpoint { probed })
}
