use anyhow::Result;
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer as WalletSigner, WalletError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Signature, H256};
use std::collections::HashMap;
use std::fmt::Debug;

/// A transaction signed by its account, ready to be broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub hash: H256,
    pub raw: Bytes,
    pub signature: Signature,
}

/// Signing oracle: maps an account to signatures over its transactions.
#[async_trait]
pub trait Signer: Debug + Send + Sync {
    fn has_account(&self, account: Address) -> bool;

    async fn sign(&self, account: Address, tx: &TypedTransaction) -> Result<SignedTransaction>;
}

#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("no key for account {0:?}")]
    UnknownAccount(Address),

    #[error("wallet: {0}")]
    Wallet(#[from] WalletError),
}

/// Keystore holding local private keys.
#[derive(Debug, Default)]
pub struct LocalKeystore {
    wallets: HashMap<Address, LocalWallet>,
}

impl LocalKeystore {
    pub fn new() -> LocalKeystore {
        LocalKeystore::default()
    }

    /// Adds a wallet and returns its address.
    pub fn add(&mut self, wallet: LocalWallet) -> Address {
        let address = wallet.address();
        self.wallets.insert(address, wallet);
        address
    }

    pub fn accounts(&self) -> Vec<Address> {
        self.wallets.keys().copied().collect()
    }
}

#[async_trait]
impl Signer for LocalKeystore {
    fn has_account(&self, account: Address) -> bool {
        self.wallets.contains_key(&account)
    }

    async fn sign(&self, account: Address, tx: &TypedTransaction) -> Result<SignedTransaction> {
        let wallet = self
            .wallets
            .get(&account)
            .ok_or(KeystoreError::UnknownAccount(account))?;

        let mut tx = tx.clone();
        tx.set_from(account);
        if tx.chain_id().is_none() {
            tx.set_chain_id(wallet.chain_id());
        }

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(KeystoreError::Wallet)?;

        Ok(SignedTransaction {
            hash: tx.hash(&signature),
            raw: tx.rlp_signed(&signature),
            signature,
        })
    }
}
