//! Tick Decoder
//!
//! Decodes upstream frames into [`Tick`]s.
//!
//! A frame that parses as UTF-8 JSON is a control or acknowledgement
//! message and never produces a tick. Anything else is a binary data frame:
//!
//! | bytes          | field                                   |
//! |----------------|-----------------------------------------|
//! | `[0]`          | mode (1 = LTP, 2 = QUOTE, 3 = FULL)     |
//! | `[1]`          | exchange code                           |
//! | `[2..6]`       | token, `u32` big-endian                 |
//! | `[6..14]`      | sequence number, `u64` big-endian       |
//! | `[14..22]`     | exchange timestamp, `u64` big-endian    |
//! | `[len-8..]`    | LTP, `u32` **little-endian**, ×100      |
//!
//! Only the header and LTP are decoded. QUOTE and FULL frames carry richer
//! fields that are left absent here and filled in by the quote poll.
//!
//! # Estimated OHLC
//!
//! LTP frames carry no OHLC. The decoder fills open/high/low/close with
//! fixed offsets from the LTP and sets [`Tick::ohlc_estimated`]. These are
//! not exchange data and consumers must not treat them as such.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use rust_decimal::Decimal;

use crate::domain::market::{ExchangeType, FeedMode, SubscriptionKey, Tick};
use crate::infrastructure::metrics;

/// Anything shorter is not a frame at all.
pub const MIN_FRAME_LEN: usize = 8;

/// Length of the fixed binary header.
pub const HEADER_LEN: usize = 22;

/// Width of the trailing LTP block.
const LTP_TRAILER_LEN: usize = 8;

/// Decoder errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Frame is too short to be anything.
    #[error("frame too small: need {need} bytes, have {have}")]
    FrameTooSmall {
        /// Minimum length.
        need: usize,
        /// Actual length.
        have: usize,
    },

    /// Frame is too short for the binary header.
    #[error("truncated header: need {need} bytes, have {have}")]
    TruncatedHeader {
        /// Header length.
        need: usize,
        /// Actual length.
        have: usize,
    },

    /// Unknown mode byte.
    #[error("invalid mode byte: {0}")]
    InvalidMode(u8),

    /// Unknown exchange code.
    #[error("invalid exchange code: {0}")]
    InvalidExchange(u8),
}

impl DecodeError {
    /// Short label for metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::FrameTooSmall { .. } => "frame_too_small",
            Self::TruncatedHeader { .. } => "truncated_header",
            Self::InvalidMode(_) => "invalid_mode",
            Self::InvalidExchange(_) => "invalid_exchange",
        }
    }
}

/// A classified upstream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// JSON control or acknowledgement message.
    Control(serde_json::Value),
    /// Binary market data.
    Tick(Tick),
}

/// Stateless decoder for upstream frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickDecoder;

impl TickDecoder {
    /// Create a decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a frame into a tick.
    ///
    /// Control messages and invalid frames yield `None`. Invalid frames are
    /// logged and counted; this never panics.
    #[must_use]
    pub fn decode(&self, frame: &[u8]) -> Option<Tick> {
        match self.classify(frame) {
            Ok(Frame::Tick(tick)) => Some(tick),
            Ok(Frame::Control(message)) => {
                tracing::debug!(%message, "Control message received");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, len = frame.len(), "Dropping undecodable frame");
                metrics::record_decode_failure(e.reason());
                None
            }
        }
    }

    /// Classify a frame as control JSON or binary tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is neither JSON nor a valid binary frame.
    pub fn classify(&self, frame: &[u8]) -> Result<Frame, DecodeError> {
        if let Some(message) = parse_json(frame) {
            return Ok(Frame::Control(message));
        }
        self.decode_binary(frame).map(Frame::Tick)
    }

    /// Decode a binary data frame.
    ///
    /// # Errors
    ///
    /// Returns an error for short frames and unknown mode or exchange bytes.
    pub fn decode_binary(&self, frame: &[u8]) -> Result<Tick, DecodeError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(DecodeError::FrameTooSmall {
                need: MIN_FRAME_LEN,
                have: frame.len(),
            });
        }
        if frame.len() < HEADER_LEN {
            return Err(DecodeError::TruncatedHeader {
                need: HEADER_LEN,
                have: frame.len(),
            });
        }

        let mode = FeedMode::from_code(frame[0]).ok_or(DecodeError::InvalidMode(frame[0]))?;
        let exchange =
            ExchangeType::from_code(frame[1]).ok_or(DecodeError::InvalidExchange(frame[1]))?;
        let token = BigEndian::read_u32(&frame[2..6]);
        let sequence = BigEndian::read_u64(&frame[6..14]);
        let exchange_timestamp = BigEndian::read_u64(&frame[14..22]);

        let trailer = frame.len() - LTP_TRAILER_LEN;
        let ltp_raw = LittleEndian::read_u32(&frame[trailer..trailer + 4]);
        let ltp = Decimal::new(i64::from(ltp_raw), 2);

        let mut tick = Tick::new(
            SubscriptionKey::new(exchange, token.to_string()),
            mode,
            sequence,
            exchange_timestamp,
            ltp,
        );

        if mode == FeedMode::Ltp {
            estimate_ohlc(&mut tick);
        }

        Ok(tick)
    }
}

fn parse_json(frame: &[u8]) -> Option<serde_json::Value> {
    let text = std::str::from_utf8(frame).ok()?;
    serde_json::from_str(text).ok()
}

fn estimate_ohlc(tick: &mut Tick) {
    let ltp = tick.ltp;
    let scaled = |factor: Decimal| (ltp * factor).round_dp(2);

    tick.low = Some(scaled(Decimal::new(98, 2)));
    tick.high = Some(scaled(Decimal::new(102, 2)));
    tick.open = Some(scaled(Decimal::new(995, 3)));
    tick.close = Some(scaled(Decimal::new(1005, 3)));
    tick.ohlc_estimated = true;
}

/// Build a binary frame with the given header and LTP.
///
/// Produces the shortest layout: header followed by the LTP trailer.
#[must_use]
pub fn encode_frame(
    mode: FeedMode,
    exchange: ExchangeType,
    token: u32,
    sequence: u64,
    exchange_timestamp: u64,
    ltp_raw: u32,
) -> Vec<u8> {
    let mut frame = vec![0u8; HEADER_LEN + LTP_TRAILER_LEN];
    frame[0] = mode.code();
    frame[1] = exchange.code();
    BigEndian::write_u32(&mut frame[2..6], token);
    BigEndian::write_u64(&mut frame[6..14], sequence);
    BigEndian::write_u64(&mut frame[14..22], exchange_timestamp);
    LittleEndian::write_u32(&mut frame[HEADER_LEN..HEADER_LEN + 4], ltp_raw);
    frame
}

// =============================================================================
// Tests
// =============================================================================
