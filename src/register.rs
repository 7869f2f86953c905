//! Drive the registration agent: the base product first, with failover
//! across candidates, then extension modules in server-declared order.

use std::path::Path;

use log::{error, info, warn};

use crate::agent::{AgentOutcome, AgentRequest, RegistrationAgent};
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::probe::Prober;
use crate::trust::TrustStore;
use crate::types::{EndpointRecord, ExtensionNode, Product, ProductInventory};

/// Register the base product against the current target, switching to the
/// next untried candidate after every agent error.
///
/// Each server is tried at most once: a failure marks every candidate
/// equivalent to the target as failed, since the target's hostname may
/// already resolve through any of them.  Returns the server the base
/// product ended up registered with.
pub async fn register_base_product(
    ctx: &mut RunContext,
    agent: &dyn RegistrationAgent,
    prober: &dyn Prober,
    trust: &dyn TrustStore,
    instance_data: Option<&Path>,
) -> Result<EndpointRecord> {
    let mut tried = Vec::new();
    let Some(mut target) = ctx.current_target.clone() else {
        return Err(Error::RegistrationExhausted { tried });
    };

    loop {
        let url = target.registration_url();
        tried.push(target.to_string());
        let request = AgentRequest {
            url: &url,
            product: None,
            instance_data,
        };

        let message = match agent.register(request).await {
            AgentOutcome::Success => {
                info!("Base product registered with {}", target);
                return Ok(target);
            }
            AgentOutcome::AgentMissing => {
                return Err(Error::AgentMissing {
                    agent: agent.describe(),
                })
            }
            AgentOutcome::AgentError(message) => message,
        };

        let same_server: Vec<EndpointRecord> = ctx
            .candidates
            .iter()
            .filter(|candidate| candidate.is_equivalent(&target))
            .cloned()
            .collect();
        ctx.failed.extend(same_server);
        ctx.failed.insert(target.clone());
        let (next, addr) = loop {
            let candidate = ctx
                .candidates
                .iter()
                .find(|candidate| !ctx.failed.contains(*candidate))
                .cloned();
            let Some(candidate) = candidate else {
                error!("Registration with {} failed: {}", target, message);
                return Err(Error::RegistrationExhausted { tried });
            };
            let addr = match prober.reachable_address(&candidate).await {
                Some(addr) => Some(addr),
                None => candidate.default_address(),
            };
            match addr {
                Some(addr) => break (candidate, addr),
                None => {
                    ctx.failed.insert(candidate);
                }
            }
        };
        warn!(
            "Registration with {} failed: {}; switching to {}",
            target, message, next
        );
        ctx.clear_registration(&[target])?;
        ctx.install_target(&next, addr)?;
        trust.import(&next, addr).await?;
        target = next;
    }
}

/// Outcome of module registration; failures never abort the walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleReport {
    pub registered: Vec<Product>,
    pub failed: Vec<(Product, String)>,
}

/// Walk `tree` depth-first, parents before children, registering every
/// installed module once.  `ctx.registered` accumulates attempted triplets
/// across the whole walk, so a module reachable along several paths is
/// attempted only the first time.  A failed parent does not stop its
/// children from being attempted.
pub async fn register_modules(
    ctx: &mut RunContext,
    agent: &dyn RegistrationAgent,
    url: &str,
    tree: &[ExtensionNode],
    inventory: &ProductInventory,
    instance_data: Option<&Path>,
) -> Result<ModuleReport> {
    let mut report = ModuleReport::default();
    let mut stack: Vec<&ExtensionNode> = tree.iter().rev().collect();

    while let Some(node) = stack.pop() {
        stack.extend(node.children.iter().rev());

        let product = node.product();
        if !inventory.contains(&product) || !ctx.registered.insert(product.clone()) {
            continue;
        }

        let request = AgentRequest {
            url,
            product: Some(&product),
            instance_data,
        };
        match agent.register(request).await {
            AgentOutcome::Success => {
                info!("Registered module {}", product);
                report.registered.push(product);
            }
            AgentOutcome::AgentError(message) => {
                warn!("Module {} registration failed: {}", product, message);
                report.failed.push((product, message));
            }
            AgentOutcome::AgentMissing => {
                return Err(Error::AgentMissing {
                    agent: agent.describe(),
                })
            }
        }
    }
    Ok(report)
}
