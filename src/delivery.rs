//! Per-subscriber delivery decision.
//!
//! Pure function of `(quote, subscriber, threshold)`: no clock, no I/O, no
//! dependence on other subscribers. The broadcaster executes the returned
//! [`Decision`] against the sink.

use rust_decimal::Decimal;

use crate::types::{NotificationHandle, PriceQuote, Subscriber};

/// Default minimum price move that justifies editing a notification.
pub const DEFAULT_DEDUP_THRESHOLD: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The instrument has not ticked yet.
    NoPrice,
    /// The move since the last delivery is below the threshold.
    BelowThreshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip(SkipReason),
    Create { price: Decimal },
    Edit { handle: NotificationHandle, price: Decimal },
}

#[must_use]
pub fn decide(quote: &PriceQuote, subscriber: &Subscriber, threshold: Decimal) -> Decision {
    let Some(price) = quote.price else {
        return Decision::Skip(SkipReason::NoPrice);
    };
    let Some(handle) = subscriber.notification_handle else {
        return Decision::Create { price };
    };
    match subscriber.last_delivered_price {
        Some(last) if (price - last).abs() < threshold => {
            Decision::Skip(SkipReason::BelowThreshold)
        }
        _ => Decision::Edit { handle, price },
    }
}

/// What happened to one subscriber during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Skipped(SkipReason),
    Created,
    Edited,
    /// The edit target was gone; a new notification replaced it.
    Recreated,
    /// The sink reported identical content; nothing changed.
    Unchanged,
    /// The delivery failed; state left as-is until the next price change.
    Failed,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::testutil::{instruments, price, quote};
    use crate::types::{PriceQuote, SubscriberId};

    fn subscriber(handle: Option<i64>, last: Option<&str>) -> Subscriber {
        let mut sub = Subscriber::new(SubscriberId(1), instruments().default_instrument());
        sub.active = true;
        sub.notification_handle = handle.map(NotificationHandle);
        sub.last_delivered_price = last.map(price);
        sub
    }

    #[test]
    fn default_threshold_is_one_cent() {
        assert_eq!(DEFAULT_DEDUP_THRESHOLD, price("0.01"));
    }

    #[test]
    fn no_price_skips() {
        let d = decide(&PriceQuote::default(), &subscriber(None, None), DEFAULT_DEDUP_THRESHOLD);
        assert_eq!(d, Decision::Skip(SkipReason::NoPrice));
    }

    #[test]
    fn no_handle_creates() {
        let d = decide(&quote("50000.00", 1), &subscriber(None, Some("1")), DEFAULT_DEDUP_THRESHOLD);
        assert_eq!(d, Decision::Create { price: price("50000.00") });
    }

    #[test]
    fn handle_without_last_price_edits() {
        let d = decide(&quote("50000.00", 1), &subscriber(Some(7), None), DEFAULT_DEDUP_THRESHOLD);
        assert_eq!(
            d,
            Decision::Edit { handle: NotificationHandle(7), price: price("50000.00") }
        );
    }

    #[test]
    fn sub_cent_move_skips() {
        let sub = subscriber(Some(7), Some("50000.00"));
        let d = decide(&quote("50000.005", 2), &sub, DEFAULT_DEDUP_THRESHOLD);
        assert_eq!(d, Decision::Skip(SkipReason::BelowThreshold));
        let d = decide(&quote("49999.991", 2), &sub, DEFAULT_DEDUP_THRESHOLD);
        assert_eq!(d, Decision::Skip(SkipReason::BelowThreshold));
    }

    #[test]
    fn exactly_threshold_edits() {
        let sub = subscriber(Some(7), Some("50000.00"));
        for p in ["50000.01", "49999.99", "50001.00"] {
            let d = decide(&quote(p, 3), &sub, DEFAULT_DEDUP_THRESHOLD);
            assert_eq!(d, Decision::Edit { handle: NotificationHandle(7), price: price(p) });
        }
    }

    fn arb_price() -> impl Strategy<Value = Decimal> {
        (0i64..10_000_000_000, 0u32..8).prop_map(|(m, s)| Decimal::new(m, s))
    }

    proptest! {
        #[test]
        fn decision_is_deterministic(
            current in proptest::option::of(arb_price()),
            last in proptest::option::of(arb_price()),
            handle in proptest::option::of(1i64..1_000_000),
        ) {
            let q = PriceQuote { price: current, observed_at: None };
            let mut sub = subscriber(handle, None);
            sub.last_delivered_price = last;
            let first = decide(&q, &sub, DEFAULT_DEDUP_THRESHOLD);
            for _ in 0..3 {
                prop_assert_eq!(decide(&q, &sub, DEFAULT_DEDUP_THRESHOLD), first);
            }
        }

        #[test]
        fn edits_iff_move_reaches_threshold(
            last in arb_price(),
            current in arb_price(),
        ) {
            let q = PriceQuote { price: Some(current), observed_at: None };
            let mut sub = subscriber(Some(1), None);
            sub.last_delivered_price = Some(last);
            let d = decide(&q, &sub, DEFAULT_DEDUP_THRESHOLD);
            if (current - last).abs() >= DEFAULT_DEDUP_THRESHOLD {
                prop_assert_eq!(d, Decision::Edit { handle: NotificationHandle(1), price: current });
            } else {
                prop_assert_eq!(d, Decision::Skip(SkipReason::BelowThreshold));
            }
        }
    }
}
