// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use courier_core::{CourierError, FeatureFlags, Result};

use super::{Action, Platform, SignerBackend, SignerDescriptor, SignerKind, SignerStatus};

/// Maximum nesting of `select` calls made from inside `status()`.
pub const MAX_SELECTION_DEPTH: u8 = 3;

type SelectFuture<'a> = Pin<Box<dyn Future<Output = Result<Arc<dyn SignerBackend>>> + Send + 'a>>;

/// Handed to [`SignerBackend::status`]. Carries the current selection depth
/// so a status check that itself selects a signer cannot recurse forever.
pub struct StatusProbe<'a> {
    registry: &'a SignerRegistry,
    depth: u8,
}

impl<'a> StatusProbe<'a> {
    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn select(&self, action: Action) -> SelectFuture<'a> {
        let registry = self.registry;
        let depth = self.depth + 1;
        Box::pin(async move { registry.select_at_depth(action, depth).await })
    }
}

struct Candidate {
    signer: Arc<dyn SignerBackend>,
    descriptor: SignerDescriptor,
    status: SignerStatus,
}

enum Selection {
    Selected(Arc<dyn SignerBackend>),
    Continue,
}

/// One step of the selection policy. Steps run in order; the first that
/// selects wins.
trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn pick(&self, action: Action, candidates: &[Candidate]) -> Selection;
}

/// Generic event signing goes to a connected companion app when one exists.
struct PreferredCompanion;

impl SelectionStrategy for PreferredCompanion {
    fn name(&self) -> &'static str {
        "preferred_companion"
    }

    fn pick(&self, action: Action, candidates: &[Candidate]) -> Selection {
        if action != Action::SignEvent {
            return Selection::Continue;
        }
        candidates
            .iter()
            .find(|c| {
                c.descriptor.kind == SignerKind::CompanionApp && c.status == SignerStatus::Connected
            })
            .map_or(Selection::Continue, |c| Selection::Selected(c.signer.clone()))
    }
}

/// Best-ranked non-custodian signer; registration order breaks ties.
struct RankedExternal;

impl SelectionStrategy for RankedExternal {
    fn name(&self) -> &'static str {
        "ranked_external"
    }

    fn pick(&self, _action: Action, candidates: &[Candidate]) -> Selection {
        candidates
            .iter()
            .filter(|c| c.descriptor.kind != SignerKind::Custodian)
            .filter_map(|c| c.status.rank().map(|rank| (rank, c)))
            .min_by_key(|(rank, _)| *rank)
            .map_or(Selection::Continue, |(_, c)| Selection::Selected(c.signer.clone()))
    }
}

struct CustodianFallback;

impl SelectionStrategy for CustodianFallback {
    fn name(&self) -> &'static str {
        "custodian_fallback"
    }

    fn pick(&self, _action: Action, candidates: &[Candidate]) -> Selection {
        candidates
            .iter()
            .filter(|c| c.descriptor.kind == SignerKind::Custodian)
            .filter_map(|c| c.status.rank().map(|rank| (rank, c)))
            .min_by_key(|(rank, _)| *rank)
            .map_or(Selection::Continue, |(_, c)| Selection::Selected(c.signer.clone()))
    }
}

/// Holds every registered signer and chooses one per action.
pub struct SignerRegistry {
    signers: RwLock<Vec<Arc<dyn SignerBackend>>>,
    strategies: Vec<Box<dyn SelectionStrategy>>,
    features: FeatureFlags,
    platform: Platform,
}

impl SignerRegistry {
    pub fn new(platform: Platform, features: FeatureFlags) -> Self {
        Self {
            signers: RwLock::new(Vec::new()),
            strategies: vec![
                Box::new(PreferredCompanion),
                Box::new(RankedExternal),
                Box::new(CustodianFallback),
            ],
            features,
            platform,
        }
    }

    /// Add a signer. A signer with the same id replaces the old one.
    pub fn register(&self, signer: Arc<dyn SignerBackend>) {
        let id = signer.descriptor().id;
        let mut signers = self.signers.write();
        signers.retain(|s| s.descriptor().id != id);
        debug!(signer = %id, "signer registered");
        signers.push(signer);
    }

    pub fn unregister(&self, id: &str) -> bool {
        let mut signers = self.signers.write();
        let before = signers.len();
        signers.retain(|s| s.descriptor().id != id);
        before != signers.len()
    }

    pub fn descriptors(&self) -> Vec<SignerDescriptor> {
        self.signers.read().iter().map(|s| s.descriptor()).collect()
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub async fn select(&self, action: Action) -> Result<Arc<dyn SignerBackend>> {
        self.select_at_depth(action, 0).await
    }

    async fn select_at_depth(&self, action: Action, depth: u8) -> Result<Arc<dyn SignerBackend>> {
        if depth > MAX_SELECTION_DEPTH {
            warn!(depth, %action, "signer selection recursion limit hit");
            return Err(CourierError::RecursionLimitExceeded(MAX_SELECTION_DEPTH));
        }

        let eligible: Vec<Arc<dyn SignerBackend>> = self
            .signers
            .read()
            .iter()
            .filter(|s| self.is_eligible(s.as_ref(), action))
            .cloned()
            .collect();

        let probe = StatusProbe {
            registry: self,
            depth,
        };

        let mut candidates = Vec::with_capacity(eligible.len());
        for signer in eligible {
            let descriptor = signer.descriptor();
            let status = match signer.status(&probe).await {
                Ok(status) => status,
                Err(e @ CourierError::RecursionLimitExceeded(_)) => return Err(e),
                Err(e) => {
                    warn!(signer = %descriptor.id, error = %e, "signer status check failed");
                    SignerStatus::Error
                }
            };
            candidates.push(Candidate {
                signer,
                descriptor,
                status,
            });
        }

        for strategy in &self.strategies {
            if let Selection::Selected(signer) = strategy.pick(action, &candidates) {
                debug!(
                    strategy = strategy.name(),
                    signer = %signer.descriptor().id,
                    %action,
                    "signer selected"
                );
                return Ok(signer);
            }
        }

        Err(CourierError::NoEligibleSigner(action.to_string()))
    }

    fn is_eligible(&self, signer: &dyn SignerBackend, action: Action) -> bool {
        let descriptor = signer.descriptor();
        descriptor.capabilities.contains(action.required())
            && descriptor.kind.enabled(&self.features)
            && signer.supports_platform(self.platform)
    }
}
