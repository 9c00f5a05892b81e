use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use nearswarm_models::NearSettings;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::NearError;

const YOCTO_PER_NEAR: u128 = 1_000_000_000_000_000_000_000_000;
const YOCTO_SCALE: u32 = 24;
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Balances in NEAR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub total: Decimal,
    pub staked: Decimal,
    pub available: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transaction_hash: String,
    pub receiver_id: String,
    pub amount: Decimal,
}

/// The chain operations an agent may delegate to.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn account_id(&self) -> &str;

    async fn get_balance(&self, account_id: &str) -> Result<AccountBalance, NearError>;

    async fn send_tokens(
        &self,
        receiver_id: &str,
        amount: Decimal,
    ) -> Result<TransferReceipt, NearError>;

    /// Run a view method and decode its JSON result.
    async fn call_contract(
        &self,
        contract_id: &str,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, NearError>;
}

pub fn yocto_to_near(yocto: u128) -> Result<Decimal, NearError> {
    let whole = Decimal::from_u128(yocto / YOCTO_PER_NEAR)
        .ok_or_else(|| NearError::InvalidAmount(format!("{yocto} yoctoNEAR is too large")))?;
    let fraction = Decimal::from_i128_with_scale((yocto % YOCTO_PER_NEAR) as i128, YOCTO_SCALE);
    whole
        .checked_add(fraction)
        .map(|d| d.normalize())
        .ok_or_else(|| NearError::InvalidAmount(format!("{yocto} yoctoNEAR is too large")))
}

pub fn near_to_yocto(amount: Decimal) -> Result<u128, NearError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(NearError::InvalidAmount(format!("{amount} is negative")));
    }
    let whole = amount
        .trunc()
        .to_u128()
        .and_then(|w| w.checked_mul(YOCTO_PER_NEAR))
        .ok_or_else(|| NearError::InvalidAmount(format!("{amount} NEAR is too large")))?;

    let fraction = amount.fract();
    let mantissa = fraction.mantissa().unsigned_abs();
    let scale = fraction.scale();
    let fraction_yocto = if scale <= YOCTO_SCALE {
        mantissa * 10u128.pow(YOCTO_SCALE - scale)
    } else {
        mantissa / 10u128.pow(scale - YOCTO_SCALE)
    };
    Ok(whole + fraction_yocto)
}

fn parse_yocto(field: &str, raw: Option<&str>) -> Result<u128, NearError> {
    raw.ok_or_else(|| NearError::Rpc(format!("account view has no {field}")))?
        .parse()
        .map_err(|e| NearError::Rpc(format!("bad {field}: {e}")))
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Read-only NEAR JSON-RPC client.
///
/// Tries each configured endpoint in turn, with exponential backoff between
/// rounds. Transaction signing is not implemented.
pub struct NearRpcClient {
    account_id: String,
    endpoints: Vec<String>,
    http: reqwest::Client,
}

impl NearRpcClient {
    pub fn new(settings: &NearSettings) -> Result<Self, NearError> {
        Self::with_endpoints(&settings.account_id, settings.rpc_urls())
    }

    /// Client over an explicit endpoint list, tried in order.
    pub fn with_endpoints(account_id: &str, endpoints: Vec<String>) -> Result<Self, NearError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            account_id: account_id.to_string(),
            endpoints,
            http,
        })
    }

    async fn query(&self, params: serde_json::Value) -> Result<serde_json::Value, NearError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: "nearswarm",
            method: "query",
            params,
        };

        let mut backoff = BACKOFF_BASE;
        let mut last_error = NearError::Rpc("no RPC endpoints configured".into());
        for attempt in 1..=MAX_ATTEMPTS {
            for endpoint in &self.endpoints {
                match self.post(endpoint, &request).await {
                    Ok(result) => return Ok(result),
                    // The node answered with an error; another attempt won't change that.
                    Err(NearError::Rpc(message)) => return Err(NearError::Rpc(message)),
                    Err(e) => {
                        warn!(endpoint = %endpoint, attempt, error = %e, "NEAR RPC call failed");
                        last_error = e;
                    }
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(last_error)
    }

    async fn post(
        &self,
        endpoint: &str,
        request: &RpcRequest<'_>,
    ) -> Result<serde_json::Value, NearError> {
        let response: RpcResponse = self
            .http
            .post(endpoint)
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        rpc_result(response)
    }
}

fn rpc_result(response: RpcResponse) -> Result<serde_json::Value, NearError> {
    if let Some(error) = response.error {
        return Err(NearError::Rpc(error.to_string()));
    }
    let result = response
        .result
        .ok_or_else(|| NearError::Rpc("response has neither result nor error".into()))?;
    // View calls report contract failures inside `result`.
    if let Some(error) = result.get("error").and_then(|e| e.as_str()) {
        return Err(NearError::Rpc(error.to_string()));
    }
    Ok(result)
}

fn balance_from_view(view: &serde_json::Value) -> Result<AccountBalance, NearError> {
    let amount = parse_yocto("amount", view.get("amount").and_then(|v| v.as_str()))?;
    let locked = parse_yocto("locked", view.get("locked").and_then(|v| v.as_str()))?;
    Ok(AccountBalance {
        total: yocto_to_near(amount)?,
        staked: yocto_to_near(locked)?,
        available: yocto_to_near(amount.saturating_sub(locked))?,
    })
}

fn decode_call_result(result: &serde_json::Value) -> Result<serde_json::Value, NearError> {
    let bytes: Vec<u8> = result
        .get("result")
        .and_then(|r| r.as_array())
        .ok_or_else(|| NearError::Rpc("call_function returned no result bytes".into()))?
        .iter()
        .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
        .collect::<Option<_>>()
        .ok_or_else(|| NearError::Rpc("call_function result is not a byte array".into()))?;
    if bytes.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| NearError::Rpc(format!("contract returned non-JSON output: {e}")))
}

#[async_trait]
impl ChainClient for NearRpcClient {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn get_balance(&self, account_id: &str) -> Result<AccountBalance, NearError> {
        debug!(account_id, "viewing NEAR account");
        let view = self
            .query(serde_json::json!({
                "request_type": "view_account",
                "finality": "final",
                "account_id": account_id,
            }))
            .await?;
        balance_from_view(&view)
    }

    async fn send_tokens(
        &self,
        receiver_id: &str,
        amount: Decimal,
    ) -> Result<TransferReceipt, NearError> {
        near_to_yocto(amount)?;
        warn!(receiver_id, %amount, "transfer requested but this client cannot sign");
        Err(NearError::SigningUnavailable)
    }

    async fn call_contract(
        &self,
        contract_id: &str,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, NearError> {
        let args = serde_json::to_vec(&args).map_err(|e| NearError::Rpc(e.to_string()))?;
        let result = self
            .query(serde_json::json!({
                "request_type": "call_function",
                "finality": "final",
                "account_id": contract_id,
                "method_name": method,
                "args_base64": STANDARD.encode(args),
            }))
            .await?;
        decode_call_result(&result)
    }
}
