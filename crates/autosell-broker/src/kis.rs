//! KIS overseas-stock REST client.
//!
//! Numeric fields in KIS responses arrive as strings; unparsable values
//! degrade to zero rather than failing the whole row. Gateway error
//! codes (`EGW...`) are classified into the retryable/throttled/terminal
//! taxonomy the callers branch on.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use autosell_core::{AuthError, ExecutionId, FillEvent, FillSource, OrderId, TokenProvider};

use crate::api::{BrokerApi, OrderFillStatus};
use crate::error::{BrokerError, BrokerResult};

const ORDER_STATUS_PATH: &str = "/uapi/overseas-stock/v1/trading/inquire-nccs";
const EXECUTIONS_PATH: &str = "/uapi/overseas-stock/v1/trading/inquire-ccnl";
const SELL_ORDER_PATH: &str = "/uapi/overseas-stock/v1/trading/order";

const TR_ORDER_STATUS: &str = "JTTT3010R";
const TR_EXECUTIONS: &str = "TTTS3035R";
const TR_SELL_ORDER: &str = "JTTT1002U";

/// Sell side in KIS order requests.
const SELL_SIDE_CODE: &str = "01";

/// Regular US session bounds in market-local time, for the
/// extended-hours flag on order submission.
const REGULAR_OPEN: (u32, u32) = (9, 30);
const REGULAR_CLOSE: (u32, u32) = (16, 0);

/// REST client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KisApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Overseas exchange code, e.g. "NASD".
    #[serde(default = "default_exchange_code")]
    pub exchange_code: String,
    /// Order division, "00" = limit.
    #[serde(default = "default_order_division")]
    pub order_division: String,
    /// Buy-side flag value in execution rows. Config-verified against
    /// the live API.
    #[serde(default = "default_buy_side_code")]
    pub buy_side_code: String,
    #[serde(default = "default_max_submit_attempts")]
    pub max_submit_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Market-local UTC offset for the extended-hours flag (US Eastern).
    #[serde(default = "default_market_utc_offset_hours")]
    pub market_utc_offset_hours: i32,
}

fn default_base_url() -> String {
    "https://openapi.koreainvestment.com:9443".to_string()
}
fn default_request_timeout_secs() -> u64 {
    15
}
fn default_exchange_code() -> String {
    "NASD".to_string()
}
fn default_order_division() -> String {
    "00".to_string()
}
fn default_buy_side_code() -> String {
    "02".to_string()
}
fn default_max_submit_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_market_utc_offset_hours() -> i32 {
    -5
}

impl Default for KisApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            exchange_code: default_exchange_code(),
            order_division: default_order_division(),
            buy_side_code: default_buy_side_code(),
            max_submit_attempts: default_max_submit_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            market_utc_offset_hours: default_market_utc_offset_hours(),
        }
    }
}

/// App credentials and account identifiers.
#[derive(Debug, Clone)]
pub struct AccountCredentials {
    pub app_key: String,
    pub app_secret: String,
    /// 8-digit account number.
    pub cano: String,
    /// 2-digit account product code.
    pub acnt_prdt_cd: String,
}

impl AccountCredentials {
    /// Split and validate a full account number, `XXXXXXXX-XX` or
    /// `XXXXXXXXXX`.
    pub fn parse_account_no(account_no: &str) -> Result<(String, String), String> {
        let digits: String = account_no.chars().filter(|c| *c != '-').collect();
        if digits.len() != 10 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!(
                "Account number must be 10 digits (8+2, hyphen optional), got {:?}",
                account_no
            ));
        }
        Ok((digits[..8].to_string(), digits[8..].to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    rt_cd: String,
    #[serde(default)]
    msg_cd: String,
    #[serde(default)]
    msg1: String,
    #[serde(default = "Vec::new")]
    output: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    rt_cd: String,
    #[serde(default)]
    msg_cd: String,
    #[serde(default)]
    msg1: String,
    output: Option<OrderOutput>,
}

#[derive(Debug, Deserialize)]
struct OrderOutput {
    #[serde(default)]
    odno: String,
}

/// Row of the open-order status query.
#[derive(Debug, Deserialize)]
struct StatusRow {
    #[serde(default)]
    odno: String,
    #[serde(default)]
    ord_stcd: String,
    #[serde(default)]
    ccld_qty: String,
    #[serde(default)]
    ccld_unpr: String,
}

/// Row of the today's-executions query.
#[derive(Debug, Deserialize)]
struct ExecutionRow {
    #[serde(default)]
    odno: String,
    #[serde(default)]
    pdno: String,
    #[serde(default)]
    sll_buy_dvsn_cd: String,
    #[serde(default)]
    ccld_qty: String,
    #[serde(default)]
    ccld_unpr: String,
}

#[derive(Debug, Serialize)]
struct SellOrderBody<'a> {
    #[serde(rename = "CANO")]
    cano: &'a str,
    #[serde(rename = "ACNT_PRDT_CD")]
    acnt_prdt_cd: &'a str,
    #[serde(rename = "OVRS_EXCG_CD")]
    ovrs_excg_cd: &'a str,
    #[serde(rename = "PDNO")]
    pdno: &'a str,
    #[serde(rename = "ORD_DVSN")]
    ord_dvsn: &'a str,
    #[serde(rename = "ORD_QTY")]
    ord_qty: String,
    #[serde(rename = "OVRS_ORD_UNPR")]
    ovrs_ord_unpr: String,
    #[serde(rename = "SLL_BUY_DVSN_CD")]
    sll_buy_dvsn_cd: &'a str,
    #[serde(rename = "EXT_HOURS_YN")]
    ext_hours_yn: &'a str,
}

/// Production [`BrokerApi`] implementation.
pub struct KisBrokerClient {
    http: reqwest::Client,
    config: KisApiConfig,
    credentials: AccountCredentials,
    tokens: Arc<dyn TokenProvider>,
}

impl KisBrokerClient {
    pub fn new(
        config: KisApiConfig,
        credentials: AccountCredentials,
        tokens: Arc<dyn TokenProvider>,
    ) -> BrokerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(BrokerError::from)?;
        Ok(Self {
            http,
            config,
            credentials,
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn auth_headers(&self, tr_id: &str) -> Result<Vec<(&'static str, String)>, AuthError> {
        let token = self.tokens.access_token().await?;
        Ok(vec![
            ("authorization", format!("Bearer {token}")),
            ("appkey", self.credentials.app_key.clone()),
            ("appsecret", self.credentials.app_secret.clone()),
            ("tr_id", tr_id.to_string()),
            ("custtype", "P".to_string()),
        ])
    }

    async fn get_list<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        tr_id: &str,
        params: &[(&str, &str)],
    ) -> BrokerResult<Vec<T>> {
        let mut req = self.http.get(self.url(path)).query(params);
        for (k, v) in self.auth_headers(tr_id).await? {
            req = req.header(k, v);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BrokerError::Http(status.as_u16()));
        }

        let body: ListResponse<T> = resp.json().await?;
        if body.rt_cd != "0" {
            return Err(classify_rejection(&body.msg_cd, &body.msg1));
        }
        Ok(body.output)
    }

    /// Today in the schedule-independent KIS request format (local date
    /// at the market gateway is what the API expects).
    fn today_param(&self) -> String {
        Utc::now().format("%Y%m%d").to_string()
    }

    fn extended_hours_flag(&self, now: DateTime<Utc>) -> &'static str {
        let offset =
            match FixedOffset::east_opt(self.config.market_utc_offset_hours.clamp(-23, 23) * 3600)
            {
                Some(o) => o,
                None => return "N",
            };
        let local = now.with_timezone(&offset).time();
        let open = NaiveTime::from_hms_opt(REGULAR_OPEN.0, REGULAR_OPEN.1, 0);
        let close = NaiveTime::from_hms_opt(REGULAR_CLOSE.0, REGULAR_CLOSE.1, 0);
        match (open, close) {
            (Some(open), Some(close)) if local >= open && local < close => "N",
            _ => "Y",
        }
    }

    async fn submit_once(
        &self,
        ticker: &str,
        quantity: u32,
        price: Decimal,
    ) -> BrokerResult<OrderId> {
        let body = SellOrderBody {
            cano: &self.credentials.cano,
            acnt_prdt_cd: &self.credentials.acnt_prdt_cd,
            ovrs_excg_cd: &self.config.exchange_code,
            pdno: ticker,
            ord_dvsn: &self.config.order_division,
            ord_qty: quantity.to_string(),
            ovrs_ord_unpr: price.to_string(),
            sll_buy_dvsn_cd: SELL_SIDE_CODE,
            ext_hours_yn: self.extended_hours_flag(Utc::now()),
        };

        let mut req = self.http.post(self.url(SELL_ORDER_PATH)).json(&body);
        for (k, v) in self.auth_headers(TR_SELL_ORDER).await? {
            req = req.header(k, v);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BrokerError::Http(status.as_u16()));
        }

        let parsed: OrderResponse = resp.json().await?;
        if parsed.rt_cd != "0" {
            return Err(classify_rejection(&parsed.msg_cd, &parsed.msg1));
        }

        match parsed.output {
            Some(out) if !out.odno.is_empty() => Ok(OrderId::new(out.odno)),
            _ => Err(BrokerError::Parse(
                "Order accepted but no order number returned".to_string(),
            )),
        }
    }
}

#[async_trait]
impl BrokerApi for KisBrokerClient {
    async fn query_order_status(&self, order_id: &OrderId) -> BrokerResult<Option<OrderFillStatus>> {
        let today = self.today_param();
        let params = [
            ("CANO", self.credentials.cano.as_str()),
            ("ACNT_PRDT_CD", self.credentials.acnt_prdt_cd.as_str()),
            ("OVRS_EXCG_CD", self.config.exchange_code.as_str()),
            ("ORD_STRT_DT", today.as_str()),
            ("ORD_END_DT", today.as_str()),
            ("SORT_SQN", "DS"),
            ("CTX_AREA_FK200", ""),
            ("CTX_AREA_NK200", ""),
        ];

        let rows: Vec<StatusRow> = self
            .get_list(ORDER_STATUS_PATH, TR_ORDER_STATUS, &params)
            .await?;

        let found = rows.into_iter().find(|r| r.odno == order_id.as_str());
        Ok(found.map(|r| OrderFillStatus {
            status: r.ord_stcd.trim().to_string(),
            filled_quantity: parse_quantity(&r.ccld_qty),
            filled_price: parse_price(&r.ccld_unpr),
        }))
    }

    async fn fetch_today_buy_executions(&self) -> BrokerResult<Vec<FillEvent>> {
        let today = self.today_param();
        let params = [
            ("CANO", self.credentials.cano.as_str()),
            ("ACNT_PRDT_CD", self.credentials.acnt_prdt_cd.as_str()),
            ("OVRS_EXCG_CD", self.config.exchange_code.as_str()),
            ("ORD_STRT_DT", today.as_str()),
            ("ORD_END_DT", today.as_str()),
            ("SLL_BUY_DVSN", self.config.buy_side_code.as_str()),
            // Completed executions only.
            ("CCLD_NCCS_DVSN", "01"),
            ("SORT_SQN", "DS"),
            ("CTX_AREA_FK200", ""),
            ("CTX_AREA_NK200", ""),
        ];

        let rows: Vec<ExecutionRow> = self
            .get_list(EXECUTIONS_PATH, TR_EXECUTIONS, &params)
            .await?;

        let now = Utc::now();
        let buy_code = self.config.buy_side_code.trim();
        let fills = rows
            .into_iter()
            .filter(|r| r.sll_buy_dvsn_cd.trim() == buy_code)
            .filter(|r| !r.odno.is_empty() && parse_quantity(&r.ccld_qty) > 0)
            .map(|r| FillEvent {
                order_id: OrderId::new(r.odno.clone()),
                // Completed-execution rows carry no separate execution
                // number; the order number identifies the terminal fill.
                execution_id: ExecutionId::new(r.odno),
                ticker: r.pdno.trim().to_string(),
                quantity: parse_quantity(&r.ccld_qty),
                price: parse_price(&r.ccld_unpr),
                source: FillSource::Polling,
                observed_at: now,
            })
            .collect::<Vec<_>>();

        debug!(count = fills.len(), "Fetched today's buy executions");
        Ok(fills)
    }

    async fn submit_sell_order(
        &self,
        ticker: &str,
        quantity: u32,
        price: Decimal,
    ) -> BrokerResult<OrderId> {
        let mut auth_retried = false;
        let mut attempt = 1;

        loop {
            match self.submit_once(ticker, quantity, price).await {
                Ok(order_id) => {
                    info!(%order_id, ticker, quantity, %price, "Sell order accepted");
                    return Ok(order_id);
                }
                Err(BrokerError::Auth(e)) if !auth_retried => {
                    warn!(error = %e, "Sell order rejected as unauthenticated, refreshing token");
                    self.tokens.invalidate();
                    auth_retried = true;
                }
                Err(e) if e.is_transient() && attempt < self.config.max_submit_attempts => {
                    let delay = self.config.retry_base_delay_ms * 2u64.pow(attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = delay,
                        error = %e,
                        "Sell order attempt failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn classify_rejection(msg_cd: &str, msg1: &str) -> BrokerError {
    match msg_cd {
        "EGW00101" | "EGW00102" => BrokerError::RateLimited {
            code: msg_cd.to_string(),
        },
        "EGW00121" | "EGW00123" => BrokerError::Auth(AuthError(format!("{msg_cd}: {msg1}"))),
        "EGW90001" => BrokerError::Transient(format!("{msg_cd}: {msg1}")),
        _ => BrokerError::Rejected {
            code: msg_cd.to_string(),
            message: msg1.to_string(),
        },
    }
}

fn parse_quantity(s: &str) -> u32 {
    s.trim().parse().unwrap_or(0)
}

fn parse_price(s: &str) -> Decimal {
    Decimal::from_str(s.trim()).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_account_no_with_hyphen() {
        let (cano, prdt) = AccountCredentials::parse_account_no("12345678-01").unwrap();
        assert_eq!(cano, "12345678");
        assert_eq!(prdt, "01");
    }

    #[test]
    fn test_account_no_without_hyphen() {
        let (cano, prdt) = AccountCredentials::parse_account_no("1234567801").unwrap();
        assert_eq!(cano, "12345678");
        assert_eq!(prdt, "01");
    }

    #[test]
    fn test_account_no_rejects_bad_input() {
        assert!(AccountCredentials::parse_account_no("1234").is_err());
        assert!(AccountCredentials::parse_account_no("12345678-0a").is_err());
        assert!(AccountCredentials::parse_account_no("123456789012").is_err());
    }

    #[test]
    fn test_rejection_classification() {
        assert!(matches!(
            classify_rejection("EGW00101", "rate limit"),
            BrokerError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_rejection("EGW00102", "rate limit"),
            BrokerError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_rejection("EGW00123", "token expired"),
            BrokerError::Auth(_)
        ));
        assert!(matches!(
            classify_rejection("EGW90001", "gateway busy"),
            BrokerError::Transient(_)
        ));
        assert!(matches!(
            classify_rejection("APBK0013", "insufficient balance"),
            BrokerError::Rejected { .. }
        ));
    }

    #[test]
    fn test_numeric_strings_degrade_to_zero() {
        assert_eq!(parse_quantity(" 5 "), 5);
        assert_eq!(parse_quantity(""), 0);
        assert_eq!(parse_quantity("abc"), 0);
        assert_eq!(parse_price("10.30"), dec!(10.30));
        assert_eq!(parse_price(""), Decimal::ZERO);
    }

    #[test]
    fn test_list_response_parses_string_numbers() {
        let raw = r#"{
            "rt_cd": "0",
            "msg_cd": "MCA00000",
            "msg1": "ok",
            "output": [
                {"odno": "0030012345", "ord_stcd": "02", "ccld_qty": "5", "ccld_unpr": "10.0000"}
            ]
        }"#;
        let parsed: ListResponse<StatusRow> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.rt_cd, "0");
        assert_eq!(parsed.output.len(), 1);
        assert_eq!(parse_quantity(&parsed.output[0].ccld_qty), 5);
        assert_eq!(parse_price(&parsed.output[0].ccld_unpr), dec!(10.0000));
    }

    #[test]
    fn test_missing_output_defaults_empty() {
        let raw = r#"{"rt_cd": "1", "msg_cd": "EGW00101", "msg1": "throttled"}"#;
        let parsed: ListResponse<StatusRow> = serde_json::from_str(raw).unwrap();
        assert!(parsed.output.is_empty());
        assert!(matches!(
            classify_rejection(&parsed.msg_cd, &parsed.msg1),
            BrokerError::RateLimited { .. }
        ));
    }
}
