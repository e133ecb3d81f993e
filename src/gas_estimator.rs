use ethers::types::U256;
use std::sync::Arc;
use tracing::{trace, warn};

use crate::client::Reader;
use crate::config::ChainCfg;
use crate::transaction::GasQuote;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GasEstimatorError {
    #[error("gas price estimation failed and no fallback price is configured")]
    ZeroPrice,

    #[error("gas limit must be positive")]
    ZeroLimit,

    #[error("invalid gas limit multiplier {0}")]
    InvalidMultiplier(f64),

    #[error("gas limit {gas_limit} × {multiplier} overflows")]
    LimitOverflow { gas_limit: u64, multiplier: f64 },
}

/// Computes legacy gas quotes from the live network price, falling back to
/// the configured price.
#[derive(Debug)]
pub struct GasEstimator<C> {
    client: Arc<C>,
    fallback_gas_price: U256,
    gas_limit_multiplier: f64,
}

impl<C: Reader> GasEstimator<C> {
    pub fn new(client: Arc<C>, cfg: &ChainCfg) -> GasEstimator<C> {
        GasEstimator {
            client,
            fallback_gas_price: cfg.fallback_gas_price,
            gas_limit_multiplier: cfg.gas_limit_multiplier,
        }
    }

    /// Quotes `gas_limit` scaled by the multiplier and the live gas price.
    /// The live price is replaced by the fallback price when the node fails
    /// or answers zero. `hint` is a floor for the returned price.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn get_legacy_gas(
        &self,
        hint: Option<U256>,
        gas_limit: u64,
    ) -> Result<GasQuote, GasEstimatorError> {
        let limit = self.scale_limit(gas_limit)?;

        let price = match self.client.gas_price().await {
            Ok(price) if !price.is_zero() => price,
            Ok(_) => {
                warn!(
                    "Node estimated a zero gas price, using the fallback ({}).",
                    self.fallback_gas_price
                );
                self.fallback_gas_price
            }
            Err(err) => {
                warn!(
                    "Gas price estimation failed ({}), using the fallback ({}).",
                    err, self.fallback_gas_price
                );
                self.fallback_gas_price
            }
        };

        let price = match hint {
            Some(hint) if hint > price => hint,
            _ => price,
        };

        if price.is_zero() {
            return Err(GasEstimatorError::ZeroPrice);
        }

        trace!("Gas quote: price = {}, limit = {}.", price, limit);
        Ok(GasQuote { price, limit })
    }

    fn scale_limit(&self, gas_limit: u64) -> Result<u64, GasEstimatorError> {
        if gas_limit == 0 {
            return Err(GasEstimatorError::ZeroLimit);
        }

        let multiplier = self.gas_limit_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(GasEstimatorError::InvalidMultiplier(multiplier));
        }

        let scaled = (gas_limit as f64 * multiplier).ceil();
        if scaled >= u64::MAX as f64 {
            return Err(GasEstimatorError::LimitOverflow {
                gas_limit,
                multiplier,
            });
        }
        Ok(scaled as u64)
    }
}
