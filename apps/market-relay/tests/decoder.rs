//! Tick Decoder Integration Tests
//!
//! Binary frame layout, mode handling and rejection of malformed frames.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use proptest::prelude::*;
use rust_decimal::Decimal;
use test_case::test_case;

use market_relay::infrastructure::feed::codec::{DecodeError, Frame, HEADER_LEN, encode_frame};
use market_relay::{ExchangeType, FeedMode, SubscriptionKey, TickDecoder};

#[test]
fn decodes_ltp_frame() {
    let frame = encode_frame(FeedMode::Ltp, ExchangeType::Nse, 26_000, 5, 0, 2_150_050);

    let tick = TickDecoder::new().decode(&frame).unwrap();

    assert_eq!(tick.key, SubscriptionKey::new(ExchangeType::Nse, "26000"));
    assert_eq!(tick.mode, FeedMode::Ltp);
    assert_eq!(tick.sequence, 5);
    assert_eq!(tick.ltp, Decimal::new(2_150_050, 2));
    assert_eq!(tick.ltp.to_string(), "21500.50");
}

#[test]
fn ltp_mode_marks_ohlc_as_estimated() {
    let frame = encode_frame(FeedMode::Ltp, ExchangeType::Nse, 26_000, 1, 0, 10_000);

    let tick = TickDecoder::new().decode(&frame).unwrap();

    assert!(tick.ohlc_estimated);
    assert_eq!(tick.low, Some(Decimal::new(9_800, 2)));
    assert_eq!(tick.high, Some(Decimal::new(10_200, 2)));
}

#[test_case(FeedMode::Ltp, ExchangeType::Nse, 26_000 ; "ltp nse")]
#[test_case(FeedMode::Quote, ExchangeType::Bse, 500_325 ; "quote bse")]
#[test_case(FeedMode::Full, ExchangeType::Nfo, 43_650 ; "full nfo")]
#[test_case(FeedMode::Ltp, ExchangeType::Mcx, 234_230 ; "ltp mcx")]
#[test_case(FeedMode::Quote, ExchangeType::Cds, 1_394 ; "quote cds")]
fn header_fields_survive(mode: FeedMode, exchange: ExchangeType, token: u32) {
    let frame = encode_frame(mode, exchange, token, 42, 1_700_000_000_000, 100);

    let tick = TickDecoder::new().decode_binary(&frame).unwrap();

    assert_eq!(tick.mode, mode);
    assert_eq!(tick.key.exchange, exchange);
    assert_eq!(tick.key.token, token.to_string());
    assert_eq!(tick.exchange_timestamp, 1_700_000_000_000);
    assert_eq!(tick.ohlc_estimated, mode == FeedMode::Ltp);
}

#[test_case(0 ; "empty")]
#[test_case(1 ; "one byte")]
#[test_case(7 ; "just under minimum")]
fn short_frames_are_too_small(len: usize) {
    let frame = vec![1u8; len];

    let result = TickDecoder::new().decode_binary(&frame);

    assert!(matches!(result, Err(DecodeError::FrameTooSmall { .. })));
}

#[test]
fn truncated_header_is_rejected() {
    let frame = encode_frame(FeedMode::Ltp, ExchangeType::Nse, 1, 1, 0, 1);

    let result = TickDecoder::new().decode_binary(&frame[..HEADER_LEN - 1]);

    assert!(matches!(result, Err(DecodeError::TruncatedHeader { .. })));
}

#[test]
fn unknown_mode_and_exchange_bytes_are_rejected() {
    let decoder = TickDecoder::new();
    let mut frame = encode_frame(FeedMode::Ltp, ExchangeType::Nse, 1, 1, 0, 1);

    frame[0] = 9;
    assert_eq!(decoder.decode_binary(&frame), Err(DecodeError::InvalidMode(9)));
    assert!(decoder.decode(&frame).is_none());

    frame[0] = 1;
    frame[1] = 6;
    assert_eq!(
        decoder.decode_binary(&frame),
        Err(DecodeError::InvalidExchange(6))
    );
}

#[test]
fn json_frames_are_control_messages() {
    let decoder = TickDecoder::new();
    let frame = br#"{"status":"subscribed"}"#;

    assert!(matches!(decoder.classify(frame), Ok(Frame::Control(_))));
    assert!(decoder.decode(frame).is_none());
}

proptest! {
    #[test]
    fn frames_below_minimum_never_decode(bytes in proptest::collection::vec(any::<u8>(), 0..8)) {
        prop_assert!(TickDecoder::new().decode(&bytes).is_none());
    }

    #[test]
    fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = TickDecoder::new().decode(&bytes);
    }

    #[test]
    fn ltp_is_raw_paise(raw in any::<u32>(), token in any::<u32>(), sequence in any::<u64>()) {
        let frame = encode_frame(FeedMode::Quote, ExchangeType::Nse, token, sequence, 0, raw);

        let tick = TickDecoder::new().decode(&frame).unwrap();

        prop_assert_eq!(tick.ltp, Decimal::new(i64::from(raw), 2));
        prop_assert_eq!(tick.sequence, sequence);
        prop_assert_eq!(tick.key.token, token.to_string());
    }
}
