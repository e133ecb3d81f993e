use anyhow::{bail, Result};
use async_trait::async_trait;
use chain_txm::signer::{SignedTransaction, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Signature, U256};
use ethers::utils::keccak256;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Signs for a fixed set of accounts. The hash is the keccak of the
/// unsigned encoding, so distinct transactions get distinct hashes.
#[derive(Debug, Default)]
pub struct MockSigner {
    accounts: HashSet<Address>,
    pub fail: AtomicBool,
    pub sign_n: AtomicUsize,
}

impl MockSigner {
    pub fn new(accounts: &[Address]) -> Self {
        Self {
            accounts: accounts.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn sign_n(&self) -> usize {
        self.sign_n.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Signer for MockSigner {
    fn has_account(&self, account: Address) -> bool {
        self.accounts.contains(&account)
    }

    async fn sign(&self, account: Address, tx: &TypedTransaction) -> Result<SignedTransaction> {
        self.sign_n.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            bail!("signer mock error");
        }
        if !self.has_account(account) {
            bail!("unknown account {:?}", account);
        }

        let raw = tx.rlp();
        Ok(SignedTransaction {
            hash: keccak256(&raw).into(),
            raw,
            signature: Signature {
                r: U256::zero(),
                s: U256::zero(),
                v: 0,
            },
        })
    }
}
