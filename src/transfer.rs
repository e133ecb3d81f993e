use ethers::types::{Address, U256};
use reqwest::StatusCode;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::balance::{check_transfer_balance, BalanceError, BalanceSnapshot};
use crate::chain::Chain;
use crate::chain_set::{ChainSet, ChainSetError};
use crate::client::{ClientError, NetworkClient};
use crate::gas_estimator::GasEstimatorError;
use crate::manager::TxmError;
use crate::transaction::TransactionResource;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error(transparent)]
    Chain(#[from] ChainSetError),

    #[error("withdrawal source address is missing: {0:?}")]
    MissingSource(Address),

    #[error("transaction failed: {0}")]
    Balance(#[from] BalanceError),

    #[error("transaction failed: could not read the balance: {0}")]
    BalanceQuery(ClientError),

    #[error("transaction failed: failed to estimate gas: {0}")]
    GasEstimate(GasEstimatorError),

    #[error("transaction failed: {0}")]
    Enqueue(TxmError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TransferError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TransferError::Malformed(_) | TransferError::Enqueue(_) => StatusCode::BAD_REQUEST,
            TransferError::Chain(_)
            | TransferError::MissingSource(_)
            | TransferError::Balance(_)
            | TransferError::BalanceQuery(_)
            | TransferError::GasEstimate(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TransferError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Body of a transfer request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    #[serde(
        rename = "chainID",
        default,
        deserialize_with = "deserialize_chain_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub chain_id: Option<String>,

    pub from_address: Address,
    pub destination_address: Address,

    /// In wei. Accepts a decimal string, a `0x` hex string or a number.
    #[serde(
        serialize_with = "serialize_amount",
        deserialize_with = "deserialize_amount"
    )]
    pub amount: U256,

    /// Skips the amount + fee coverage check; a zero balance still blocks.
    #[serde(default)]
    pub allow_higher_amounts: bool,
}

/// Status and JSON body answered to a transfer request.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferResponse {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl TransferResponse {
    fn resource(resource: &TransactionResource) -> TransferResponse {
        match serde_json::to_value(resource) {
            Ok(attributes) => TransferResponse {
                status: StatusCode::OK,
                body: json!({
                    "data": {
                        "type": "transactions",
                        "id": resource.id.to_string(),
                        "attributes": attributes,
                    }
                }),
            },
            Err(err) => TransferResponse::error(&TransferError::Internal(err.to_string())),
        }
    }

    fn error(err: &TransferError) -> TransferResponse {
        TransferResponse {
            status: err.status_code(),
            body: json!({ "errors": [{ "detail": err.to_string() }] }),
        }
    }
}

/// Validates transfer requests and queues them on the target chain.
#[derive(Debug)]
pub struct TransferRequestHandler<C> {
    chains: Arc<ChainSet<C>>,
}

impl<C: NetworkClient + 'static> TransferRequestHandler<C> {
    pub fn new(chains: Arc<ChainSet<C>>) -> TransferRequestHandler<C> {
        TransferRequestHandler { chains }
    }

    /// Decodes `body`, runs [`Self::create`] and renders the outcome.
    pub async fn handle(&self, body: &[u8]) -> TransferResponse {
        let request: TransferRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(err) => return TransferResponse::error(&TransferError::Malformed(err.to_string())),
        };

        match self.create(&request).await {
            Ok(resource) => TransferResponse::resource(&resource),
            Err(err) => {
                warn!("Transfer request rejected ({}): {}.", err.status_code(), err);
                TransferResponse::error(&err)
            }
        }
    }

    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn create(
        &self,
        request: &TransferRequest,
    ) -> Result<TransactionResource, TransferError> {
        let chain = self.chains.resolve(request.chain_id.as_deref())?;

        if request.from_address.is_zero() {
            return Err(TransferError::MissingSource(request.from_address));
        }

        validate_balance(&chain, request).await?;

        let tx = chain
            .msg_enqueuer()
            .enqueue(
                request.from_address,
                request.destination_address,
                request.amount,
                chain.config().gas_limit_transfer,
            )
            .await
            .map_err(TransferError::Enqueue)?;

        info!(
            chain_id = %chain.id(),
            "Transfer of {} wei from {:?} to {:?} queued as transaction {}.",
            request.amount,
            request.from_address,
            request.destination_address,
            tx.id
        );
        Ok(TransactionResource::from(&tx))
    }
}

/// Checks the source balance against `amount + price × limit`, preferring the
/// chain's balance monitor over a node query. The request is only read.
async fn validate_balance<C: NetworkClient + 'static>(
    chain: &Chain<C>,
    request: &TransferRequest,
) -> Result<(), TransferError> {
    let account = request.from_address;

    let snapshot = match chain.balance_monitor() {
        Some(monitor) => monitor
            .snapshot(account)
            .ok_or(BalanceError::Unknown(account))?,
        None => BalanceSnapshot {
            account,
            amount: chain
                .reader()
                .balance_at(account)
                .await
                .map_err(TransferError::BalanceQuery)?,
            as_of: None,
        },
    };

    if request.allow_higher_amounts {
        check_transfer_balance(&snapshot, request.amount, U256::zero(), true)?;
        return Ok(());
    }

    let quote = chain
        .txm()
        .gas_estimator()
        .get_legacy_gas(None, chain.config().gas_limit_transfer)
        .await
        .map_err(TransferError::GasEstimate)?;
    let fee = quote
        .fee()
        .ok_or_else(|| TransferError::Internal(format!("fee of {:?} overflows", quote)))?;

    check_transfer_balance(&snapshot, request.amount, fee, false)?;
    Ok(())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    String(String),
}

fn deserialize_chain_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<NumberOrString>::deserialize(deserializer)?.map(|id| match id {
            NumberOrString::Number(n) => n.to_string(),
            NumberOrString::String(s) => s,
        }),
    )
}

fn deserialize_amount<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(U256::from(n)),
        NumberOrString::String(s) => parse_amount(&s).map_err(de::Error::custom),
    }
}

fn serialize_amount<S>(amount: &U256, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&amount.to_string())
}

fn parse_amount(s: &str) -> Result<U256, String> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => U256::from_str_radix(hex, 16).map_err(|err| format!("invalid amount {}: {}", s, err)),
        None => U256::from_dec_str(s).map_err(|err| format!("invalid amount {}: {}", s, err)),
    }
}
