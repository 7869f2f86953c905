//! Merge the region directory's endpoint list with the on-disk cache.
//!
//! Matching is exact-field identity only.  A cached endpoint the directory
//! no longer reports is stale; any stale entry invalidates the whole cache,
//! which is then purged and rebuilt from what the directory confirmed.

use log::{info, warn};

use crate::cache::CacheSlot;
use crate::context::RunContext;
use crate::error::Result;
use crate::types::EndpointRecord;

/// Classification of remote and cached endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    /// Reported remotely and already cached.
    pub confirmed: Vec<EndpointRecord>,
    /// Reported remotely, not cached.
    pub new: Vec<EndpointRecord>,
    /// Cached, no longer reported.
    pub stale: Vec<EndpointRecord>,
}

/// Split endpoints without touching any state.  Each cached record matches
/// at most one remote record; the first identical one wins.
pub fn partition(remote: &[EndpointRecord], cached: &[EndpointRecord]) -> Partition {
    let mut pool: Vec<EndpointRecord> = cached.to_vec();
    let mut seen: Vec<&EndpointRecord> = Vec::with_capacity(remote.len());
    let mut result = Partition::default();

    for record in remote {
        if seen.contains(&record) {
            continue;
        }
        seen.push(record);
        match pool.iter().position(|cached| cached == record) {
            Some(pos) => result.confirmed.push(pool.remove(pos)),
            None => result.new.push(record.clone()),
        }
    }
    result.stale = pool;
    result
}

/// Reconcile `remote` against `cached`, repair the cache on disk and store
/// the resulting candidate list (confirmed, then new) in the context.
pub fn reconcile(
    ctx: &mut RunContext,
    remote: &[EndpointRecord],
    cached: &[EndpointRecord],
) -> Result<Vec<EndpointRecord>> {
    let Partition {
        confirmed,
        new,
        stale,
    } = partition(remote, cached);

    let to_persist: Vec<&EndpointRecord> = if stale.is_empty() {
        new.iter().collect()
    } else {
        for record in &stale {
            info!("Cached server {} is no longer offered for this region", record);
        }
        if let Some(target) = ctx.current_target.clone() {
            if stale.iter().any(|record| target.is_equivalent(record)) {
                warn!(
                    "Registered server {} left the region, clearing registration",
                    target
                );
                ctx.clear_registration(&[target])?;
            }
        }
        ctx.cache.purge_all()?;
        if let Some(target) = &ctx.current_target {
            ctx.cache.persist(target, CacheSlot::Current)?;
        }
        confirmed.iter().chain(new.iter()).collect()
    };

    for record in to_persist {
        ctx.cache.persist_new(record)?;
    }

    let candidates: Vec<EndpointRecord> = confirmed.into_iter().chain(new).collect();
    info!("{} candidate registration server(s)", candidates.len());
    ctx.candidates = candidates.clone();
    Ok(candidates)
}
