//! Kraken REST transport.
//!
//! Public calls are plain GETs; private calls are form-encoded POSTs signed
//! with `API-Sign = base64(HMAC-SHA512(secret, path ‖ SHA256(nonce ‖ body)))`.
//! Every private call holds the nonce mutex from nonce assignment until the
//! venue has answered, so two signed requests can never interleave.

use crate::domain::entities::market::{normalize_asset_code, venue_pair, MarketLimits, OpenOrder, Ticker};
use crate::domain::entities::order::OrderSide;
use crate::domain::errors::{ExchangeError, RejectionKind};
use crate::domain::repositories::exchange_client::ExchangeResult;
use crate::infrastructure::nonce::{clock_offset_ms, NonceGenerator};
use crate::infrastructure::rate_limit::{create_rate_limiter, OutboundLimiter, RateLimiterConfig};
use crate::infrastructure::retry::{retry_when, RetryPolicy};
use crate::infrastructure::venue::{OrderFill, OrderState, VenueApi, VenueOrder};
use crate::secrets::ApiCredentials;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type HmacSha512 = Hmac<Sha512>;

pub const KRAKEN_API_BASE: &str = "https://api.kraken.com";

/// Venue error prefixes that mean the request was not processed
const TRANSIENT_VENUE_ERRORS: &[&str] = &[
    "EService:Unavailable",
    "EService:Busy",
    "EService:Deadline elapsed",
    "EGeneral:Internal error",
];

/// Prefix for transport failures where the request never left this process
const NOT_SENT: &str = "connect error";

#[derive(Debug, Clone)]
pub struct KrakenConfig {
    pub api_url: String,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimiterConfig,
}

impl Default for KrakenConfig {
    fn default() -> Self {
        Self {
            api_url: KRAKEN_API_BASE.to_string(),
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            rate_limit: RateLimiterConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    error: Vec<String>,
    result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ServerTime {
    unixtime: i64,
}

#[derive(Debug, Deserialize)]
struct TickerInfo {
    a: Vec<String>,
    b: Vec<String>,
    c: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AssetPairInfo {
    altname: String,
    pair_decimals: u32,
    lot_decimals: u32,
    #[serde(default)]
    ordermin: Option<String>,
    #[serde(default)]
    costmin: Option<String>,
    #[serde(default)]
    fees: Vec<(f64, f64)>,
    #[serde(default)]
    fees_maker: Vec<(f64, f64)>,
}

#[derive(Debug, Deserialize)]
struct BalanceExEntry {
    balance: String,
    #[serde(default)]
    hold_trade: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddOrderResult {
    #[serde(default)]
    txid: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OrderDescr {
    #[serde(default)]
    pair: String,
    #[serde(default, rename = "type")]
    side: String,
}

#[derive(Debug, Deserialize)]
struct OrderInfo {
    status: String,
    #[serde(default)]
    vol: Option<String>,
    #[serde(default)]
    vol_exec: Option<String>,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    descr: OrderDescr,
}

#[derive(Debug, Deserialize)]
struct OpenOrdersResult {
    #[serde(default)]
    open: HashMap<String, OrderInfo>,
}

/// Compute the `API-Sign` header
pub fn sign_request(path: &str, nonce: u64, post_data: &str, secret: &[u8]) -> ExchangeResult<String> {
    let mut sha = Sha256::new();
    sha.update(nonce.to_string().as_bytes());
    sha.update(post_data.as_bytes());
    let digest = sha.finalize();

    let mut mac = HmacSha512::new_from_slice(secret).map_err(|e| {
        ExchangeError::rejected(RejectionKind::Authentication, format!("HMAC error: {}", e))
    })?;
    mac.update(path.as_bytes());
    mac.update(&digest);
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Form body with the nonce first
pub fn encode_form(nonce: u64, params: &[(&str, String)]) -> String {
    let mut form = url::form_urlencoded::Serializer::new(String::new());
    form.append_pair("nonce", &nonce.to_string());
    for (key, value) in params {
        form.append_pair(key, value);
    }
    form.finish()
}

/// Unwrap `{"error": [...], "result": ...}`
pub fn parse_envelope<T: DeserializeOwned>(body: &str) -> ExchangeResult<T> {
    let envelope: Envelope = serde_json::from_str(body)
        .map_err(|e| ExchangeError::transport(1, format!("malformed response: {}", e)))?;

    if !envelope.error.is_empty() {
        let joined = envelope.error.join("; ");
        if envelope
            .error
            .iter()
            .any(|err| TRANSIENT_VENUE_ERRORS.iter().any(|t| err.starts_with(t)))
        {
            return Err(ExchangeError::transport(1, joined));
        }
        return Err(ExchangeError::rejected(RejectionKind::classify(&joined), joined));
    }

    let result = envelope
        .result
        .ok_or_else(|| ExchangeError::transport(1, "response without result"))?;
    serde_json::from_value(result)
        .map_err(|e| ExchangeError::transport(1, format!("unexpected result shape: {}", e)))
}

fn parse_num(raw: &str, field: &str) -> ExchangeResult<f64> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| ExchangeError::transport(1, format!("invalid number for {}: {:?}", field, raw)))
}

fn parse_opt_num(raw: &Option<String>, field: &str) -> ExchangeResult<f64> {
    match raw {
        Some(value) if !value.is_empty() => parse_num(value, field),
        _ => Ok(0.0),
    }
}

fn map_transport(e: reqwest::Error) -> ExchangeError {
    if e.is_connect() {
        ExchangeError::transport(1, format!("{}: {}", NOT_SENT, e))
    } else if e.is_timeout() {
        ExchangeError::transport(1, format!("request timed out: {}", e))
    } else {
        ExchangeError::transport(1, e.to_string())
    }
}

/// Order submissions are only repeated when the venue cannot have seen them
fn is_safe_to_resubmit(error: &ExchangeError) -> bool {
    match error {
        ExchangeError::Transport { message, .. } => {
            message.starts_with(NOT_SENT)
                || TRANSIENT_VENUE_ERRORS.iter().any(|t| message.starts_with(t))
        }
        _ => false,
    }
}

fn parse_ticker(result: HashMap<String, TickerInfo>) -> ExchangeResult<Ticker> {
    let info = result
        .into_values()
        .next()
        .ok_or_else(|| ExchangeError::transport(1, "empty ticker result"))?;
    let first = |values: &[String], field: &str| -> ExchangeResult<f64> {
        values
            .first()
            .ok_or_else(|| ExchangeError::transport(1, format!("missing ticker field {}", field)))
            .and_then(|raw| parse_num(raw, field))
    };
    Ok(Ticker {
        ask: first(&info.a, "a")?,
        bid: first(&info.b, "b")?,
        last: first(&info.c, "c")?,
    })
}

fn parse_limits(pair: &str, info: &AssetPairInfo) -> ExchangeResult<MarketLimits> {
    let first_tier = |tiers: &[(f64, f64)]| tiers.first().map(|(_, fee)| *fee);
    let taker = first_tier(&info.fees).unwrap_or(0.4);
    Ok(MarketLimits {
        pair: pair.to_string(),
        order_min: parse_opt_num(&info.ordermin, "ordermin")?,
        cost_min: parse_opt_num(&info.costmin, "costmin")?,
        price_decimals: info.pair_decimals,
        lot_decimals: info.lot_decimals,
        maker_fee_pct: first_tier(&info.fees_maker).unwrap_or(taker),
        taker_fee_pct: taker,
    })
}

/// Canonical balances, summing variants that map to the same asset
fn normalize_balances(raw: HashMap<String, String>) -> ExchangeResult<HashMap<String, f64>> {
    let mut balances = HashMap::new();
    for (code, amount) in raw {
        let amount = parse_num(&amount, &code)?;
        *balances.entry(normalize_asset_code(&code)).or_insert(0.0) += amount;
    }
    Ok(balances)
}

fn free_from_balance_ex(raw: HashMap<String, BalanceExEntry>) -> ExchangeResult<HashMap<String, f64>> {
    let mut balances = HashMap::new();
    for (code, entry) in raw {
        let total = parse_num(&entry.balance, &code)?;
        let held = parse_opt_num(&entry.hold_trade, &code)?;
        *balances.entry(normalize_asset_code(&code)).or_insert(0.0) += (total - held).max(0.0);
    }
    Ok(balances)
}

/// Fields for `AddOrder`
pub fn order_form(order: &VenueOrder) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("pair", venue_pair(&order.pair)),
        ("type", order.side.as_str().to_string()),
        ("ordertype", order.order_type.as_str().to_string()),
        (
            "volume",
            format!("{:.*}", order.lot_decimals as usize, order.volume),
        ),
    ];
    if let Some(price) = order.price {
        form.push(("price", format!("{:.*}", order.price_decimals as usize, price)));
    }
    if order.post_only {
        form.push(("oflags", "post".to_string()));
    }
    if let Some(stop) = order.stop_price {
        form.push(("close[ordertype]", "stop-loss".to_string()));
        form.push((
            "close[price]",
            format!("{:.*}", order.price_decimals as usize, stop),
        ));
    }
    form
}

fn order_fill(order_id: &str, info: &OrderInfo) -> ExchangeResult<OrderFill> {
    Ok(OrderFill {
        order_id: order_id.to_string(),
        state: OrderState::parse(&info.status),
        volume: parse_opt_num(&info.vol, "vol")?,
        executed: parse_opt_num(&info.vol_exec, "vol_exec")?,
        avg_price: parse_opt_num(&info.price, "price")?,
    })
}

pub struct KrakenClient {
    http: Client,
    config: KrakenConfig,
    credentials: Option<ApiCredentials>,
    nonce: Mutex<NonceGenerator>,
    limiter: OutboundLimiter,
    /// Venue altname → canonical pair, learned from `AssetPairs`
    pair_names: RwLock<HashMap<String, String>>,
}

impl KrakenClient {
    pub fn new(config: KrakenConfig, credentials: Option<ApiCredentials>) -> ExchangeResult<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("ratchet-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ExchangeError::transport(0, format!("HTTP client init failed: {}", e)))?;
        let limiter = create_rate_limiter(&config.rate_limit);
        Ok(Self {
            http,
            config,
            credentials,
            nonce: Mutex::new(NonceGenerator::new()),
            limiter,
            pair_names: RwLock::new(HashMap::new()),
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    async fn read_envelope<T: DeserializeOwned>(response: reqwest::Response) -> ExchangeResult<T> {
        let status = response.status();
        let body = response.text().await.map_err(map_transport)?;
        if status.is_server_error() {
            return Err(ExchangeError::transport(1, format!("HTTP {}", status)));
        }
        if status.as_u16() == 429 {
            return Err(ExchangeError::rejected(
                RejectionKind::RateLimited,
                format!("HTTP {}", status),
            ));
        }
        parse_envelope(&body)
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> ExchangeResult<T> {
        let url = format!("{}/0/public/{}", self.config.api_url, endpoint);
        let url = &url;
        retry_when(&self.config.retry, endpoint, ExchangeError::is_retryable, |_| async move {
            self.limiter.until_ready().await;
            let response = self
                .http
                .get(url)
                .query(query)
                .send()
                .await
                .map_err(map_transport)?;
            Self::read_envelope(response).await
        })
        .await
    }

    /// One signed request under the nonce lock, retried per `retryable`
    async fn signed_call<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
        retryable: fn(&ExchangeError) -> bool,
    ) -> ExchangeResult<T> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            ExchangeError::rejected(RejectionKind::Authentication, "no API credentials configured")
        })?;
        let secret = credentials
            .secret_bytes()
            .map_err(|e| ExchangeError::rejected(RejectionKind::Authentication, e.to_string()))?;
        let path = format!("/0/private/{}", endpoint);
        let url = format!("{}{}", self.config.api_url, path);
        let (path, url, secret) = (&path, &url, &secret);

        retry_when(&self.config.retry, endpoint, retryable, |_| async move {
            self.limiter.until_ready().await;
            let mut nonce = self.nonce.lock().await;
            let n = nonce.next();
            let body = encode_form(n, params);
            let signature = sign_request(path, n, &body, secret)?;
            debug!("POST {} nonce={}", path, n);
            let response = self
                .http
                .post(url)
                .header("API-Key", credentials.api_key())
                .header("API-Sign", signature)
                .header(
                    reqwest::header::CONTENT_TYPE,
                    "application/x-www-form-urlencoded; charset=utf-8",
                )
                .body(body)
                .send()
                .await
                .map_err(map_transport);
            drop(nonce);
            Self::read_envelope(response?).await
        })
        .await
    }

    async fn private_post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
        retryable: fn(&ExchangeError) -> bool,
    ) -> ExchangeResult<T> {
        if self.credentials.is_some() && !self.nonce.lock().await.is_calibrated() {
            self.sync_clock().await?;
        }
        match self.signed_call(endpoint, params, retryable).await {
            Err(ExchangeError::Rejected {
                kind: RejectionKind::InvalidNonce,
                reason,
            }) => {
                warn!("{} rejected nonce ({}); re-syncing clock", endpoint, reason);
                self.sync_clock().await?;
                self.signed_call(endpoint, params, retryable).await
            }
            other => other,
        }
    }

    fn canonical_pair(&self, altname: &str) -> String {
        self.pair_names
            .read()
            .ok()
            .and_then(|names| names.get(altname).cloned())
            .unwrap_or_else(|| altname.to_string())
    }
}

#[async_trait]
impl VenueApi for KrakenClient {
    async fn sync_clock(&self) -> ExchangeResult<i64> {
        let sent = Utc::now().timestamp_millis();
        let time: ServerTime = self.public_get("Time", &[]).await?;
        let received = Utc::now().timestamp_millis();
        let offset = clock_offset_ms(time.unixtime, sent, received);
        self.nonce.lock().await.calibrate(offset);
        info!("Clock handshake complete: server offset {} ms", offset);
        Ok(offset)
    }

    async fn ticker(&self, pair: &str) -> ExchangeResult<Ticker> {
        let result: HashMap<String, TickerInfo> = self
            .public_get("Ticker", &[("pair", venue_pair(pair))])
            .await?;
        parse_ticker(result)
    }

    async fn asset_pair(&self, pair: &str) -> ExchangeResult<MarketLimits> {
        let result: HashMap<String, AssetPairInfo> = self
            .public_get("AssetPairs", &[("pair", venue_pair(pair))])
            .await?;
        let (venue_key, info) = result
            .iter()
            .next()
            .ok_or_else(|| ExchangeError::rejected(RejectionKind::InvalidOrder, format!("unknown pair {}", pair)))?;
        if let Ok(mut names) = self.pair_names.write() {
            names.insert(info.altname.clone(), pair.to_string());
            names.insert(venue_key.clone(), pair.to_string());
        }
        parse_limits(pair, info)
    }

    async fn balances(&self) -> ExchangeResult<HashMap<String, f64>> {
        let raw: HashMap<String, String> = self
            .private_post("Balance", &[], ExchangeError::is_retryable)
            .await?;
        normalize_balances(raw)
    }

    async fn free_balances(&self) -> ExchangeResult<HashMap<String, f64>> {
        let extended: ExchangeResult<HashMap<String, BalanceExEntry>> = self
            .private_post("BalanceEx", &[], ExchangeError::is_retryable)
            .await;
        match extended {
            Ok(raw) => free_from_balance_ex(raw),
            Err(e @ ExchangeError::Rejected {
                kind: RejectionKind::Authentication,
                ..
            }) => Err(e),
            Err(e) => {
                warn!("BalanceEx unavailable ({}); falling back to raw Balance", e);
                self.balances().await
            }
        }
    }

    async fn add_order(&self, order: &VenueOrder) -> ExchangeResult<String> {
        let form = order_form(order);
        let result: AddOrderResult = self
            .private_post("AddOrder", &form, is_safe_to_resubmit)
            .await?;
        result.txid.into_iter().next().ok_or_else(|| {
            ExchangeError::rejected(RejectionKind::Other, "order accepted without txid")
        })
    }

    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<()> {
        let _: serde_json::Value = self
            .private_post(
                "CancelOrder",
                &[("txid", order_id.to_string())],
                ExchangeError::is_retryable,
            )
            .await?;
        Ok(())
    }

    async fn open_orders(&self) -> ExchangeResult<Vec<OpenOrder>> {
        let result: OpenOrdersResult = self
            .private_post("OpenOrders", &[], ExchangeError::is_retryable)
            .await?;
        result
            .open
            .iter()
            .map(|(txid, info)| -> ExchangeResult<OpenOrder> {
                Ok(OpenOrder {
                    order_id: txid.clone(),
                    pair: self.canonical_pair(&info.descr.pair),
                    side: if info.descr.side == "sell" {
                        OrderSide::Sell
                    } else {
                        OrderSide::Buy
                    },
                    quantity: parse_opt_num(&info.vol, "vol")?,
                    executed: parse_opt_num(&info.vol_exec, "vol_exec")?,
                })
            })
            .collect()
    }

    async fn query_order(&self, order_id: &str) -> ExchangeResult<OrderFill> {
        let result: HashMap<String, OrderInfo> = self
            .private_post(
                "QueryOrders",
                &[("txid", order_id.to_string())],
                ExchangeError::is_retryable,
            )
            .await?;
        let info = result.get(order_id).ok_or_else(|| {
            ExchangeError::rejected(RejectionKind::UnknownOrder, format!("order {} not found", order_id))
        })?;
        order_fill(order_id, info)
    }
}
