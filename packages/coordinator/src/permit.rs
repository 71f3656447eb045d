//! EIP-712 permit signing
//!
//! The permit authorizes the fee-payer (spender) to pull `amount + fee` from the
//! sender without a prior on-chain approval. The domain separator binds the
//! signature to one protocol name, version, chain and verifying contract.
//!
//! Keys come from a [`KeyCustody`] collaborator; the signer never stores them.

use alloy::primitives::{Address, PrimitiveSignature, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use alloy::sol;
use alloy::sol_types::{Eip712Domain, SolStruct};
use async_trait::async_trait;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::TransferError;
use crate::types::TransferIntent;

sol! {
    /// ERC-2612 permit message
    #[derive(Debug, PartialEq, Eq)]
    struct Permit {
        address owner;
        address spender;
        uint256 value;
        uint256 nonce;
        uint256 deadline;
    }
}

/// EIP-712 domain parameters of the token contract that consumes the permit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermitDomain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    pub verifying_contract: Address,
}

impl PermitDomain {
    pub fn to_eip712(&self) -> Eip712Domain {
        Eip712Domain::new(
            Some(Cow::Owned(self.name.clone())),
            Some(Cow::Owned(self.version.clone())),
            Some(U256::from(self.chain_id)),
            Some(self.verifying_contract),
            None,
        )
    }
}

/// Access to user signing keys (wallet custody lives outside this crate)
#[async_trait]
pub trait KeyCustody: Send + Sync {
    async fn signer_for(&self, owner: Address) -> Result<PrivateKeySigner, TransferError>;
}

/// In-process key custody for local deployments and tests
#[derive(Default)]
pub struct LocalKeyCustody {
    keys: HashMap<Address, PrivateKeySigner>,
}

impl LocalKeyCustody {
    pub fn from_private_keys<S: AsRef<str>>(keys: &[S]) -> Result<Self, TransferError> {
        let mut custody = Self::default();
        for key in keys {
            let signer: PrivateKeySigner = key
                .as_ref()
                .trim()
                .parse()
                .map_err(|e| TransferError::Signing(format!("invalid private key: {}", e)))?;
            custody.keys.insert(signer.address(), signer);
        }
        Ok(custody)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.keys.keys().copied().collect()
    }
}

#[async_trait]
impl KeyCustody for LocalKeyCustody {
    async fn signer_for(&self, owner: Address) -> Result<PrivateKeySigner, TransferError> {
        self.keys
            .get(&owner)
            .cloned()
            .ok_or_else(|| TransferError::Signing(format!("no signing key available for {}", owner)))
    }
}

/// A permit with its signature
#[derive(Debug, Clone)]
pub struct SignedPermit {
    pub permit: Permit,
    pub signing_hash: B256,
    pub signature: PrimitiveSignature,
}

impl SignedPermit {
    /// 65-byte r || s || v signature, 0x-prefixed
    pub fn signature_hex(&self) -> String {
        format!("0x{}", hex::encode(self.signature.as_bytes()))
    }
}

pub struct PermitSigner {
    domain: Eip712Domain,
    spender: Address,
    max_window_secs: u64,
    custody: Arc<dyn KeyCustody>,
}

impl PermitSigner {
    pub fn new(
        domain: &PermitDomain,
        spender: Address,
        max_window_secs: u64,
        custody: Arc<dyn KeyCustody>,
    ) -> Self {
        Self {
            domain: domain.to_eip712(),
            spender,
            max_window_secs,
            custody,
        }
    }

    pub fn spender(&self) -> Address {
        self.spender
    }

    pub fn domain(&self) -> &Eip712Domain {
        &self.domain
    }

    /// Build the permit for `intent` without signing it.
    pub fn build(
        &self,
        intent: &TransferIntent,
        fee: U256,
        owner_nonce: U256,
        deadline: u64,
        now: u64,
    ) -> Result<Permit, TransferError> {
        if deadline < now {
            return Err(TransferError::Validation(format!(
                "permit deadline {} already passed (now {})",
                deadline, now
            )));
        }
        if deadline > now.saturating_add(self.max_window_secs) {
            return Err(TransferError::Validation(format!(
                "permit deadline {} is more than {}s ahead",
                deadline, self.max_window_secs
            )));
        }
        let value = intent
            .amount
            .checked_add(fee)
            .ok_or_else(|| TransferError::Validation("amount + fee overflows uint256".into()))?;

        Ok(Permit {
            owner: intent.sender,
            spender: self.spender,
            value,
            nonce: owner_nonce,
            deadline: U256::from(deadline),
        })
    }

    pub fn signing_hash(&self, permit: &Permit) -> B256 {
        permit.eip712_signing_hash(&self.domain)
    }

    /// Sign a permit over `intent.amount + fee`. `owner_nonce` must be the
    /// on-chain value read just before this call.
    pub async fn sign(
        &self,
        intent: &TransferIntent,
        fee: U256,
        owner_nonce: U256,
        deadline: u64,
        now: u64,
    ) -> Result<SignedPermit, TransferError> {
        let permit = self.build(intent, fee, owner_nonce, deadline, now)?;
        let key = self.custody.signer_for(intent.sender).await?;
        if key.address() != intent.sender {
            return Err(TransferError::Signing(format!(
                "key custody returned key for {} instead of {}",
                key.address(),
                intent.sender
            )));
        }

        let signing_hash = self.signing_hash(&permit);
        let signature = key
            .sign_hash(&signing_hash)
            .await
            .map_err(|e| TransferError::Signing(e.to_string()))?;

        debug!(
            owner = %permit.owner,
            spender = %permit.spender,
            value = %permit.value,
            nonce = %permit.nonce,
            deadline,
            "Permit signed"
        );

        Ok(SignedPermit {
            permit,
            signing_hash,
            signature,
        })
    }

    /// Recover the address that signed `signed.permit` under this domain.
    pub fn recover(&self, signed: &SignedPermit) -> Result<Address, TransferError> {
        signed
            .signature
            .recover_address_from_prehash(&self.signing_hash(&signed.permit))
            .map_err(|e| TransferError::Signing(format!("signature recovery failed: {}", e)))
    }
}
