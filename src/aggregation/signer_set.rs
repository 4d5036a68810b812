use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::DonMemberConfig;
use crate::crypto::{address_to_public_key, DonPublicKey};
use crate::Result;

/// Keys DON members sign reports with, plus the fault tolerance of the DON.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignerSet {
    f: usize,
    signers: HashSet<DonPublicKey>,
}

impl SignerSet {
    pub fn new(f: usize, signers: impl IntoIterator<Item = DonPublicKey>) -> Self {
        SignerSet {
            f,
            signers: signers.into_iter().collect(),
        }
    }

    /// Builds the set from DON membership, preferring a member's report signer over its
    /// transport address.
    pub fn from_members(f: usize, members: &[DonMemberConfig]) -> Result<Self> {
        let mut signers = HashSet::new();
        for member in members {
            let address = member.signer.as_deref().unwrap_or(&member.address);
            signers.insert(address_to_public_key(address)?);
        }
        Ok(SignerSet { f, signers })
    }

    pub fn f(&self) -> usize {
        self.f
    }

    pub fn contains(&self, signer: &DonPublicKey) -> bool {
        self.signers.contains(signer)
    }

    pub fn len(&self) -> usize {
        self.signers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }
}

/// Source of the current [`SignerSet`], refreshed from outside (contract reader, config reload).
#[async_trait]
pub trait SignerRegistry: Send + Sync {
    async fn signer_set(&self) -> Result<Arc<SignerSet>>;
}

/// A registry whose set is swapped explicitly with [`StaticSignerRegistry::update`].
#[derive(Debug, Default)]
pub struct StaticSignerRegistry {
    signer_set_lock: RwLock<Arc<SignerSet>>,
}

impl StaticSignerRegistry {
    pub fn new(signer_set: SignerSet) -> Self {
        StaticSignerRegistry {
            signer_set_lock: RwLock::new(Arc::new(signer_set)),
        }
    }

    pub async fn update(&self, signer_set: SignerSet) {
        *self.signer_set_lock.write().await = Arc::new(signer_set);
    }
}

#[async_trait]
impl SignerRegistry for StaticSignerRegistry {
    async fn signer_set(&self) -> Result<Arc<SignerSet>> {
        Ok(self.signer_set_lock.read().await.clone())
    }
}
