//! Incoming bus messages and the indicator command grammar.
//!
//! Indicator commands are textual state names (`LED_OFF`, `LED_BLUE`,
//! `LED_FLASHING_RED`, `LED_PULSATING_WHITE`, ...). Matching ignores case and
//! surrounding whitespace. Anything that does not parse turns the indicator
//! off and is flagged as unrecognised.

use core::fmt;

use heapless::{String, Vec};
use winnow::ascii::{Caseless, multispace0};
use winnow::combinator::{alt, delimited, eof, preceded, terminated};
use winnow::prelude::*;

use crate::config::{MAX_TOPIC_LEN, Topics};
use crate::indicator::{Color, IndicatorState};

/// Largest payload carried through the fabric.
pub const MAX_PAYLOAD: usize = 64;

/// Action requested by an incoming bus message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BusCommand {
    TriggerUpdate,
    RequestTelemetry,
    SetIndicator {
        state: IndicatorState,
        /// `false` when the payload was not a known state name.
        recognised: bool,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandError {
    /// Message arrived on a topic the device does not handle.
    UnknownTopic,
    NotUtf8,
    UnknownIndicator,
    TopicTooLong,
    PayloadTooLong,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            CommandError::UnknownTopic => "message on unhandled topic",
            CommandError::NotUtf8 => "payload is not utf-8",
            CommandError::UnknownIndicator => "unrecognised indicator state",
            CommandError::TopicTooLong => "topic exceeds buffer",
            CommandError::PayloadTooLong => "payload exceeds buffer",
        };
        f.write_str(message)
    }
}

fn color(input: &mut &str) -> ModalResult<Color> {
    alt((
        Caseless("RED").value(Color::Red),
        Caseless("GREEN").value(Color::Green),
        Caseless("BLUE").value(Color::Blue),
        Caseless("WHITE").value(Color::White),
    ))
    .parse_next(input)
}

fn indicator_state(input: &mut &str) -> ModalResult<IndicatorState> {
    preceded(
        Caseless("LED_"),
        alt((
            Caseless("OFF").value(IndicatorState::Off),
            preceded(Caseless("FLASHING_"), color).map(IndicatorState::Flashing),
            preceded(Caseless("PULSATING_"), color).map(IndicatorState::Pulsating),
            color.map(IndicatorState::Solid),
        )),
    )
    .parse_next(input)
}

fn indicator_command(input: &mut &str) -> ModalResult<IndicatorState> {
    delimited(multispace0, indicator_state, terminated(multispace0, eof)).parse_next(input)
}

/// Parses one indicator command.
pub fn parse_indicator(text: &str) -> Result<IndicatorState, CommandError> {
    indicator_command
        .parse(text)
        .map_err(|_| CommandError::UnknownIndicator)
}

/// Maps a message on `topic` to the command it requests.
pub fn route(topics: &Topics, topic: &str, payload: &[u8]) -> Result<BusCommand, CommandError> {
    if topic == topics.update_trigger {
        return Ok(BusCommand::TriggerUpdate);
    }
    if topic == topics.telemetry_request {
        return Ok(BusCommand::RequestTelemetry);
    }
    if topic == topics.indicator {
        let parsed = core::str::from_utf8(payload)
            .map_err(|_| CommandError::NotUtf8)
            .and_then(parse_indicator);
        return Ok(match parsed {
            Ok(state) => BusCommand::SetIndicator {
                state,
                recognised: true,
            },
            Err(_) => BusCommand::SetIndicator {
                state: IndicatorState::Off,
                recognised: false,
            },
        });
    }
    Err(CommandError::UnknownTopic)
}

/// Owned copy of a bus data callback, sized for the fabric.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InboundMessage {
    pub topic: String<MAX_TOPIC_LEN>,
    pub payload: Vec<u8, MAX_PAYLOAD>,
}

impl InboundMessage {
    pub fn new(topic: &str, payload: &[u8]) -> Result<Self, CommandError> {
        let mut owned_topic = String::new();
        owned_topic
            .push_str(topic)
            .map_err(|_| CommandError::TopicTooLong)?;
        let owned_payload =
            Vec::from_slice(payload).map_err(|_| CommandError::PayloadTooLong)?;
        Ok(Self {
            topic: owned_topic,
            payload: owned_payload,
        })
    }

    pub fn route(&self, topics: &Topics) -> Result<BusCommand, CommandError> {
        route(topics, &self.topic, &self.payload)
    }
}
