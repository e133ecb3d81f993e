use ethers::types::{Address, U256};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::RwLock;

/// Balance of an account as seen at some block. Used for one validation and
/// never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub account: Address,
    pub amount: U256, // in wei
    pub as_of: Option<u64>, // block number
}

/// Source of cached balances, preferred over querying the node.
pub trait BalanceMonitor: Debug + Send + Sync {
    /// `None` when the balance of `account` is unknown.
    fn snapshot(&self, account: Address) -> Option<BalanceSnapshot>;
}

/// In-memory balance monitor fed by whoever tracks the chain head.
#[derive(Debug, Default)]
pub struct BalanceCache {
    balances: RwLock<HashMap<Address, BalanceSnapshot>>,
}

impl BalanceCache {
    pub fn new() -> BalanceCache {
        BalanceCache::default()
    }

    pub fn update(&self, account: Address, amount: U256, as_of: Option<u64>) {
        let snapshot = BalanceSnapshot {
            account,
            amount,
            as_of,
        };
        match self.balances.write() {
            Ok(mut balances) => {
                balances.insert(account, snapshot);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(account, snapshot);
            }
        }
    }
}

impl BalanceMonitor for BalanceCache {
    fn snapshot(&self, account: Address) -> Option<BalanceSnapshot> {
        match self.balances.read() {
            Ok(balances) => balances.get(&account).copied(),
            Err(poisoned) => poisoned.into_inner().get(&account).copied(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalanceError {
    #[error("balance of {0:?} is unknown")]
    Unknown(Address),

    #[error("balance of {0:?} is zero")]
    Zero(Address),

    #[error("balance of {account:?} is too low: {balance} < {required} (amount + fee)")]
    TooLow {
        account: Address,
        balance: U256,
        required: U256,
    },

    #[error("amount {amount} + fee {fee} overflows")]
    Overflow { amount: U256, fee: U256 },
}

/// Rejects a transfer when the balance is zero or does not cover
/// `amount + fee`. With `allow_higher_amounts` only a zero balance blocks it.
pub fn check_transfer_balance(
    snapshot: &BalanceSnapshot,
    amount: U256,
    fee: U256,
    allow_higher_amounts: bool,
) -> Result<(), BalanceError> {
    if snapshot.amount.is_zero() {
        return Err(BalanceError::Zero(snapshot.account));
    }
    if allow_higher_amounts {
        return Ok(());
    }

    let required = amount
        .checked_add(fee)
        .ok_or(BalanceError::Overflow { amount, fee })?;
    if snapshot.amount < required {
        return Err(BalanceError::TooLow {
            account: snapshot.account,
            balance: snapshot.amount,
            required,
        });
    }
    Ok(())
}
