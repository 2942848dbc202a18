//! Streaming Frame Codec
//!
//! Decodes frames from the KIS streaming socket. Two shapes arrive on the
//! same connection:
//!
//! - JSON control responses (subscription acks, errors, PINGPONG keepalives)
//! - pipe-delimited data frames: `0|TR_ID|COUNT|payload`, where the payload
//!   is `COUNT` records of caret-separated fields laid end to end
//!
//! For trade ticks the fields of interest are the symbol (0), the exchange
//! time as HHMMSS in KST (1), and the traded price (2).

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use thiserror::Error;

use crate::domain::market::Tick;
use crate::infrastructure::kis::messages::{ControlResponse, TR_STREAM_TICKS, parse_decimal};

/// Seconds east of UTC for Korea Standard Time.
const KST_OFFSET_SECS: i32 = 9 * 3600;

/// Minimum fields per tick record (symbol, time, price).
const MIN_TICK_FIELDS: usize = 3;

/// Frame decoding failure.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame did not match either expected shape.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The frame is flagged as encrypted, which this client never requests.
    #[error("unexpected encrypted frame for tr_id {0}")]
    Encrypted(String),

    /// A data frame for a TR this client does not subscribe to.
    #[error("unsupported tr_id: {0}")]
    UnsupportedTr(String),
}

/// A decoded streaming frame.
#[derive(Debug)]
pub enum KisFrame {
    /// JSON control response (ack, error, or keepalive).
    Control(ControlResponse),
    /// Batch of trade ticks from one data frame.
    Ticks(Vec<Tick>),
}

/// Decode one text frame from the streaming socket.
///
/// `now` anchors the date of the HHMMSS exchange timestamps.
pub fn decode_frame(text: &str, now: DateTime<Utc>) -> Result<KisFrame, CodecError> {
    match text.as_bytes().first() {
        Some(b'0' | b'1') if text.contains('|') => decode_data_frame(text, now),
        _ => serde_json::from_str(text)
            .map(KisFrame::Control)
            .map_err(|e| CodecError::Malformed(format!("not a control frame: {e}"))),
    }
}

fn decode_data_frame(text: &str, now: DateTime<Utc>) -> Result<KisFrame, CodecError> {
    let mut parts = text.splitn(4, '|');
    let flag = parts.next().unwrap_or_default();
    let tr_id = parts.next().unwrap_or_default();
    let count = parts.next().unwrap_or_default();
    let payload = parts
        .next()
        .ok_or_else(|| CodecError::Malformed("data frame missing payload".to_string()))?;

    if flag == "1" {
        return Err(CodecError::Encrypted(tr_id.to_string()));
    }
    if tr_id != TR_STREAM_TICKS {
        return Err(CodecError::UnsupportedTr(tr_id.to_string()));
    }

    let count: usize = count
        .parse()
        .map_err(|_| CodecError::Malformed(format!("bad record count: {count}")))?;
    if count == 0 {
        return Ok(KisFrame::Ticks(Vec::new()));
    }

    let fields: Vec<&str> = payload.split('^').collect();
    let per_record = fields.len() / count;
    if per_record < MIN_TICK_FIELDS || fields.len() % count != 0 {
        return Err(CodecError::Malformed(format!(
            "payload of {} fields does not divide into {count} records",
            fields.len()
        )));
    }

    let mut ticks = Vec::with_capacity(count);
    for record in fields.chunks(per_record) {
        let symbol = record[0];
        if symbol.is_empty() {
            continue;
        }
        let Some(price) = parse_decimal(record[2]) else {
            tracing::warn!(symbol, raw = record[2], "dropping tick with unparseable price");
            continue;
        };
        ticks.push(Tick {
            symbol: symbol.to_string(),
            price,
            timestamp: tick_timestamp(record[1], now),
        });
    }
    Ok(KisFrame::Ticks(ticks))
}

/// Resolve an HHMMSS exchange time in KST against the current date.
///
/// Falls back to `now` when the field does not parse; a delivery timestamp
/// beats losing the tick.
fn tick_timestamp(hhmmss: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let Ok(time) = NaiveTime::parse_from_str(hhmmss, "%H%M%S") else {
        return now;
    };
    let Some(kst) = FixedOffset::east_opt(KST_OFFSET_SECS) else {
        return now;
    };
    let today_kst = now.with_timezone(&kst).date_naive();
    match today_kst.and_time(time).and_local_timezone(kst) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    use super::*;

    fn now() -> DateTime<Utc> {
        // 09:30 KST on 2026-03-02.
        Utc.with_ymd_and_hms(2026, 3, 2, 0, 30, 0).unwrap()
    }

    fn tick_frame(records: &[(&str, &str, &str)]) -> String {
        let payload: Vec<String> = records
            .iter()
            .map(|(code, time, price)| format!("{code}^{time}^{price}^100^0.5"))
            .collect();
        format!("0|H0STCNT0|{}|{}", records.len(), payload.join("^"))
    }

    #[test]
    fn single_tick_frame_decodes() {
        let frame = tick_frame(&[("005930", "093015", "71200")]);
        let KisFrame::Ticks(ticks) = decode_frame(&frame, now()).unwrap() else {
            panic!("expected ticks");
        };
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].symbol, "005930");
        assert_eq!(ticks[0].price, Decimal::from(71_200));
        // 09:30:15 KST == 00:30:15 UTC.
        assert_eq!(
            ticks[0].timestamp,
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 30, 15).unwrap()
        );
    }

    #[test]
    fn multi_record_frame_decodes_in_order() {
        let frame = tick_frame(&[("005930", "093015", "71200"), ("000660", "093016", "131500")]);
        let KisFrame::Ticks(ticks) = decode_frame(&frame, now()).unwrap() else {
            panic!("expected ticks");
        };
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].symbol, "005930");
        assert_eq!(ticks[1].symbol, "000660");
        assert_eq!(ticks[1].price, Decimal::from(131_500));
    }

    #[test]
    fn control_ack_decodes_as_control() {
        let raw = r#"{"header":{"tr_id":"H0STCNT0","tr_key":"005930"},"body":{"rt_cd":"0","msg_cd":"OPSP0000","msg1":"SUBSCRIBE SUCCESS"}}"#;
        let KisFrame::Control(response) = decode_frame(raw, now()).unwrap() else {
            panic!("expected control");
        };
        assert!(!response.is_pingpong());
        assert_eq!(response.body.unwrap().rt_cd, "0");
    }

    #[test]
    fn pingpong_decodes_as_control() {
        let raw = r#"{"header":{"tr_id":"PINGPONG","datetime":"20260302093000"}}"#;
        let KisFrame::Control(response) = decode_frame(raw, now()).unwrap() else {
            panic!("expected control");
        };
        assert!(response.is_pingpong());
    }

    #[test]
    fn encrypted_frame_is_rejected() {
        let frame = "1|H0STCNT0|1|garbage";
        assert!(matches!(
            decode_frame(frame, now()),
            Err(CodecError::Encrypted(_))
        ));
    }

    #[test]
    fn unknown_tr_is_rejected() {
        let frame = "0|H0STASP0|1|005930^093015^71200";
        assert!(matches!(
            decode_frame(frame, now()),
            Err(CodecError::UnsupportedTr(_))
        ));
    }

    #[test]
    fn bad_record_count_is_malformed() {
        let frame = "0|H0STCNT0|three|005930^093015^71200";
        assert!(matches!(
            decode_frame(frame, now()),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn bad_timestamp_falls_back_to_now() {
        let frame = "0|H0STCNT0|1|005930^bogus1^71200";
        let KisFrame::Ticks(ticks) = decode_frame(&frame.to_string(), now()).unwrap() else {
            panic!("expected ticks");
        };
        assert_eq!(ticks[0].timestamp, now());
    }
}
