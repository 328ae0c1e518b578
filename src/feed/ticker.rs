//! Binance 24h ticker frame decoding.
//!
//! Only the last-price field `c` is read; the rest of the frame is skipped
//! without allocation.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Deserialize)]
struct TickerFrame<'a> {
    #[serde(rename = "c")]
    last_price: &'a str,
}

/// Current price carried by a ticker frame. `None` for anything malformed:
/// invalid JSON, missing or non-string `c`, or a value that is not a
/// positive decimal.
#[must_use]
pub fn parse_ticker(text: &str) -> Option<Decimal> {
    let frame: TickerFrame<'_> = serde_json::from_str(text).ok()?;
    let price = Decimal::from_str(frame.last_price).ok()?;
    (price > Decimal::ZERO).then_some(price)
}
