//! KIS Wire Messages
//!
//! Request and response types for the KIS Open API REST endpoints and the
//! streaming WebSocket control channel.
//!
//! Numeric fields arrive as strings on the wire and are parsed into
//! `Decimal` at the edge; rows that fail to parse are dropped with a log
//! line rather than failing the whole response.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::market::{QuoteSample, Symbol};

// =============================================================================
// Constants
// =============================================================================

/// TR id for the batched multi-price quotation endpoint.
pub const TR_MULTI_PRICE: &str = "FHKST11300006";

/// Path of the batched multi-price quotation endpoint.
pub const MULTI_PRICE_PATH: &str = "/uapi/domestic-stock/v1/quotations/intstock-multprice";

/// TR id for real-time trade ticks on the streaming socket.
pub const TR_STREAM_TICKS: &str = "H0STCNT0";

/// Customer type header value for personal API keys.
pub const CUSTTYPE: &str = "P";

/// Upstream cap on symbols per multi-price request.
pub const MULTI_PRICE_MAX_SYMBOLS: usize = 30;

/// `msg_cd` the gateway uses when it reports an expired token, sometimes
/// wrapped in an HTTP 500 instead of a 401.
pub const MSG_CD_EXPIRED_TOKEN: &str = "EGW00123";

// =============================================================================
// REST Responses
// =============================================================================

/// Envelope common to KIS REST responses.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    /// "0" on success.
    pub rt_cd: String,
    /// Gateway message code.
    #[serde(default)]
    pub msg_cd: String,
    /// Human-readable gateway message.
    #[serde(default)]
    pub msg1: String,
    /// Payload rows.
    #[serde(default = "Vec::new")]
    pub output: Vec<T>,
}

impl<T> ApiEnvelope<T> {
    /// Whether the gateway reported success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.rt_cd == "0"
    }

    /// Whether the gateway reported an expired token.
    #[must_use]
    pub fn is_expired_token(&self) -> bool {
        self.msg_cd == MSG_CD_EXPIRED_TOKEN
    }
}

/// Error body the gateway attaches to non-2xx responses.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    /// Gateway message code.
    #[serde(default)]
    pub msg_cd: String,
    /// Human-readable gateway message.
    #[serde(default)]
    pub msg1: String,
}

/// One row of the multi-price response.
#[derive(Debug, Deserialize)]
pub struct MultiPriceItem {
    /// Symbol code.
    #[serde(rename = "inter_shrn_iscd", default)]
    pub code: String,
    /// Symbol name.
    #[serde(rename = "inter_kor_isnm", default)]
    pub name: String,
    /// Last traded price.
    #[serde(rename = "inter2_prpr", default)]
    pub price: String,
    /// Session open.
    #[serde(rename = "inter2_oprc", default)]
    pub open: String,
    /// Intraday high.
    #[serde(rename = "inter2_hgpr", default)]
    pub high: String,
    /// Intraday low.
    #[serde(rename = "inter2_lwpr", default)]
    pub low: String,
    /// Reference price (previous close).
    #[serde(rename = "inter2_sdpr", default)]
    pub prev_close: String,
    /// Accumulated traded value for the session.
    #[serde(rename = "acml_tr_pbmn", default)]
    pub traded_value: String,
}

impl MultiPriceItem {
    /// Convert a wire row into a domain sample.
    ///
    /// Returns `None` for empty slots (requests are padded per index) and
    /// rows with an unparseable price.
    #[must_use]
    pub fn into_sample(self, observed_at: DateTime<Utc>) -> Option<(Symbol, QuoteSample)> {
        if self.code.is_empty() {
            return None;
        }
        let Some(price) = parse_decimal(&self.price) else {
            tracing::warn!(code = %self.code, raw = %self.price, "dropping row with unparseable price");
            return None;
        };
        let sample = QuoteSample {
            price,
            prev_close: parse_decimal(&self.prev_close).unwrap_or_default(),
            day_high: parse_decimal(&self.high).unwrap_or(price),
            day_low: parse_decimal(&self.low).unwrap_or(price),
            traded_value: parse_decimal(&self.traded_value).unwrap_or_default(),
            ma25: None,
            observed_at,
        };
        Some((self.code, sample))
    }
}

/// Build the indexed query parameters for one multi-price request.
///
/// The endpoint takes `(FID_COND_MRKT_DIV_CODE_i, FID_INPUT_ISCD_i)` pairs,
/// 1-based, at most [`MULTI_PRICE_MAX_SYMBOLS`] per request. Callers split
/// larger symbol sets into multiple requests; every symbol passed in gets a
/// pair.
#[must_use]
pub fn multi_price_params(symbols: &[Symbol]) -> Vec<(String, String)> {
    let mut params = Vec::with_capacity(symbols.len() * 2);
    for (idx, code) in symbols.iter().enumerate() {
        let i = idx + 1;
        params.push((format!("FID_COND_MRKT_DIV_CODE_{i}"), "J".to_string()));
        params.push((format!("FID_INPUT_ISCD_{i}"), code.clone()));
    }
    params
}

/// Parse a wire numeric string, tolerating empty and signed values.
#[must_use]
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse().ok()
}

// =============================================================================
// WebSocket Control Channel
// =============================================================================

/// Header of a streaming control request.
#[derive(Debug, Serialize)]
pub struct ControlHeader {
    /// Approval key issued by `/oauth2/Approval`.
    pub approval_key: String,
    /// Customer type, "P" for personal.
    pub custtype: String,
    /// "1" to subscribe, "2" to unsubscribe.
    pub tr_type: String,
    /// Fixed to "utf-8".
    #[serde(rename = "content-type")]
    pub content_type: String,
}

/// Input block naming the TR and symbol.
#[derive(Debug, Serialize)]
pub struct ControlInput {
    /// TR id of the stream being controlled.
    pub tr_id: String,
    /// Symbol code.
    pub tr_key: String,
}

/// Body of a streaming control request.
#[derive(Debug, Serialize)]
pub struct ControlBody {
    /// Input block.
    pub input: ControlInput,
}

/// A full subscribe/unsubscribe control request.
#[derive(Debug, Serialize)]
pub struct ControlRequest {
    /// Control header.
    pub header: ControlHeader,
    /// Control body.
    pub body: ControlBody,
}

impl ControlRequest {
    /// Build a subscribe request for one symbol.
    #[must_use]
    pub fn subscribe(approval_key: &str, symbol: &str) -> Self {
        Self::build(approval_key, symbol, "1")
    }

    /// Build an unsubscribe request for one symbol.
    #[must_use]
    pub fn unsubscribe(approval_key: &str, symbol: &str) -> Self {
        Self::build(approval_key, symbol, "2")
    }

    fn build(approval_key: &str, symbol: &str, tr_type: &str) -> Self {
        Self {
            header: ControlHeader {
                approval_key: approval_key.to_string(),
                custtype: CUSTTYPE.to_string(),
                tr_type: tr_type.to_string(),
                content_type: "utf-8".to_string(),
            },
            body: ControlBody {
                input: ControlInput {
                    tr_id: TR_STREAM_TICKS.to_string(),
                    tr_key: symbol.to_string(),
                },
            },
        }
    }
}

/// Header of a control-channel response.
#[derive(Debug, Deserialize)]
pub struct ControlResponseHeader {
    /// TR id; "PINGPONG" for keepalive frames.
    #[serde(default)]
    pub tr_id: String,
    /// Symbol the response refers to, when applicable.
    #[serde(default)]
    pub tr_key: String,
}

/// Result block of a control-channel response.
#[derive(Debug, Deserialize)]
pub struct ControlResponseBody {
    /// "0" on success.
    #[serde(default)]
    pub rt_cd: String,
    /// Gateway message code.
    #[serde(default)]
    pub msg_cd: String,
    /// Human-readable gateway message.
    #[serde(default)]
    pub msg1: String,
}

/// A parsed control-channel response.
#[derive(Debug, Deserialize)]
pub struct ControlResponse {
    /// Response header.
    pub header: ControlResponseHeader,
    /// Response body; keepalive frames omit it.
    #[serde(default)]
    pub body: Option<ControlResponseBody>,
}

impl ControlResponse {
    /// Whether this is a keepalive frame that must be echoed back.
    #[must_use]
    pub fn is_pingpong(&self) -> bool {
        self.header.tr_id == "PINGPONG"
    }
}
