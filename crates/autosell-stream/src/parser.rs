//! Execution-notice wire format.
//!
//! Data frames are pipe-delimited: `flag|tr_id|count|body`, where flag
//! "0" marks a plaintext payload and `count` is the number of execution
//! records packed into `body`. The body is caret-delimited with fixed
//! field positions per record. Control frames (subscription ACKs and
//! keepalives) arrive as JSON objects.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::debug;

use autosell_core::{ExecutionId, FillEvent, FillSource, OrderId};

use crate::error::{StreamError, StreamResult};

/// Execution-notice transaction id in the subscription request and in
/// inbound data frames.
pub const EXECUTION_TR_ID: &str = "H0STCNI0";

const PLAINTEXT_FLAG: &str = "0";
const KEEPALIVE_TR_ID: &str = "PINGPONG";

/// Caret-field positions within one execution record.
const FIELD_ORDER_ID: usize = 0;
const FIELD_EXECUTION_ID: usize = 1;
const FIELD_SIDE_CODE: usize = 2;
const FIELD_TICKER: usize = 3;
const FIELD_QUANTITY: usize = 4;
const FIELD_PRICE: usize = 5;
const RECORD_FIELDS: usize = 6;

/// One parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Buy-side fills extracted from a data frame. May be empty if the
    /// frame carried only sell-side records.
    Executions(Vec<FillEvent>),
    /// Server keepalive; must be echoed back verbatim.
    Keepalive,
    /// Subscription ACK or other JSON control frame.
    Control { tr_id: String, message: String },
}

/// Parser for the execution feed.
#[derive(Debug, Clone)]
pub struct ExecutionParser {
    buy_code: String,
}

impl ExecutionParser {
    pub fn new(buy_code: impl Into<String>) -> Self {
        Self {
            buy_code: buy_code.into(),
        }
    }

    pub fn parse(&self, raw: &str, now: DateTime<Utc>) -> StreamResult<StreamFrame> {
        if raw.trim_start().starts_with('{') {
            return self.parse_control(raw);
        }
        self.parse_data(raw, now)
    }

    fn parse_control(&self, raw: &str) -> StreamResult<StreamFrame> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let tr_id = value
            .pointer("/header/tr_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        if tr_id == KEEPALIVE_TR_ID {
            return Ok(StreamFrame::Keepalive);
        }

        let message = value
            .pointer("/body/msg1")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(StreamFrame::Control { tr_id, message })
    }

    fn parse_data(&self, raw: &str, now: DateTime<Utc>) -> StreamResult<StreamFrame> {
        // splitn keeps carets inside the body intact.
        let parts: Vec<&str> = raw.splitn(4, '|').collect();
        if parts.len() != 4 {
            return Err(StreamError::MalformedMessage(format!(
                "Expected 4 pipe-delimited envelope fields, got {}",
                parts.len()
            )));
        }

        if parts[0] != PLAINTEXT_FLAG {
            return Err(StreamError::MalformedMessage(format!(
                "Unsupported payload flag {:?}",
                parts[0]
            )));
        }

        let tr_id = parts[1];
        if tr_id != EXECUTION_TR_ID {
            return Ok(StreamFrame::Control {
                tr_id: tr_id.to_string(),
                message: String::new(),
            });
        }

        let count: usize = parts[2]
            .parse()
            .map_err(|_| StreamError::MalformedMessage(format!("Bad record count {:?}", parts[2])))?;

        let fields: Vec<&str> = parts[3].split('^').collect();
        if count == 0 || fields.len() != count * RECORD_FIELDS {
            return Err(StreamError::MalformedMessage(format!(
                "Expected {} caret fields for {} records, got {}",
                count * RECORD_FIELDS,
                count,
                fields.len()
            )));
        }

        let mut fills = Vec::new();
        for record in fields.chunks(RECORD_FIELDS) {
            let side = record[FIELD_SIDE_CODE].trim();
            if side != self.buy_code {
                debug!(side, "Skipping non-buy execution record");
                continue;
            }

            let quantity: u32 = record[FIELD_QUANTITY].trim().parse().map_err(|_| {
                StreamError::MalformedMessage(format!(
                    "Bad quantity {:?}",
                    record[FIELD_QUANTITY]
                ))
            })?;
            let price = Decimal::from_str(record[FIELD_PRICE].trim()).map_err(|_| {
                StreamError::MalformedMessage(format!("Bad price {:?}", record[FIELD_PRICE]))
            })?;

            fills.push(FillEvent {
                order_id: OrderId::new(record[FIELD_ORDER_ID].trim()),
                execution_id: ExecutionId::new(record[FIELD_EXECUTION_ID].trim()),
                ticker: record[FIELD_TICKER].trim().to_string(),
                quantity,
                price,
                source: FillSource::Streaming,
                observed_at: now,
            });
        }

        Ok(StreamFrame::Executions(fills))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 1, 0, 0).unwrap()
    }

    fn parser() -> ExecutionParser {
        ExecutionParser::new("02")
    }

    #[test]
    fn test_parse_buy_execution() {
        let raw = "0|H0STCNI0|1|0030012345^0000000007^02^AAPL^5^10.0000";
        let frame = parser().parse(raw, now()).unwrap();
        match frame {
            StreamFrame::Executions(fills) => {
                assert_eq!(fills.len(), 1);
                let fill = &fills[0];
                assert_eq!(fill.order_id, OrderId::new("0030012345"));
                assert_eq!(fill.execution_id, ExecutionId::new("0000000007"));
                assert_eq!(fill.ticker, "AAPL");
                assert_eq!(fill.quantity, 5);
                assert_eq!(fill.price, dec!(10.0000));
                assert_eq!(fill.source, FillSource::Streaming);
            }
            other => panic!("expected executions, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_multiple_records() {
        let raw = "0|H0STCNI0|2|\
                   O1^E1^02^AAPL^5^10.00^\
                   O2^E2^02^TSLA^1^250.50";
        let frame = parser().parse(raw, now()).unwrap();
        match frame {
            StreamFrame::Executions(fills) => {
                assert_eq!(fills.len(), 2);
                assert_eq!(fills[1].ticker, "TSLA");
            }
            other => panic!("expected executions, got {other:?}"),
        }
    }

    #[test]
    fn test_sell_side_records_are_filtered() {
        let raw = "0|H0STCNI0|1|O1^E1^01^AAPL^5^10.00";
        let frame = parser().parse(raw, now()).unwrap();
        assert_eq!(frame, StreamFrame::Executions(vec![]));
    }

    #[test]
    fn test_wrong_field_count_is_malformed() {
        let raw = "0|H0STCNI0|1|O1^E1^02^AAPL^5";
        assert!(matches!(
            parser().parse(raw, now()),
            Err(StreamError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_bad_quantity_is_malformed() {
        let raw = "0|H0STCNI0|1|O1^E1^02^AAPL^five^10.00";
        assert!(matches!(
            parser().parse(raw, now()),
            Err(StreamError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_encrypted_flag_is_rejected() {
        let raw = "1|H0STCNI0|1|garbage";
        assert!(matches!(
            parser().parse(raw, now()),
            Err(StreamError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_other_tr_id_is_control() {
        let raw = "0|H0STCNT9|1|whatever";
        let frame = parser().parse(raw, now()).unwrap();
        assert!(matches!(frame, StreamFrame::Control { tr_id, .. } if tr_id == "H0STCNT9"));
    }

    #[test]
    fn test_keepalive_frame() {
        let raw = r#"{"header":{"tr_id":"PINGPONG","datetime":"20260302100000"}}"#;
        assert_eq!(parser().parse(raw, now()).unwrap(), StreamFrame::Keepalive);
    }

    #[test]
    fn test_subscription_ack() {
        let raw = r#"{"header":{"tr_id":"H0STCNI0"},"body":{"rt_cd":"0","msg1":"SUBSCRIBE SUCCESS"}}"#;
        let frame = parser().parse(raw, now()).unwrap();
        assert_eq!(
            frame,
            StreamFrame::Control {
                tr_id: "H0STCNI0".to_string(),
                message: "SUBSCRIBE SUCCESS".to_string()
            }
        );
    }

    #[test]
    fn test_replay_parses_identically() {
        let raw = "0|H0STCNI0|1|O1^E1^02^AAPL^5^10.00";
        let p = parser();
        assert_eq!(p.parse(raw, now()).unwrap(), p.parse(raw, now()).unwrap());
    }
}
