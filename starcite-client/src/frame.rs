//! Parsing of websocket tail frames.
//!
//! Each text frame carries either a single event object or a non-empty array
//! of event objects, already ordered by the server. Anything else — invalid
//! JSON, an empty array, an object that misses required event fields — is a
//! server/compatibility bug: reconnecting cannot fix it, so the parser
//! reports it as a connection-level contract violation and the tail stream
//! fails without retrying.

use serde::Deserialize;
use starcite_types::api::v1::Event;

use crate::error::Error;

#[derive(Deserialize)]
#[serde(untagged)]
enum FrameShape {
    One(Box<Event>),
    Many(Vec<Event>),
}

/// Parses one websocket text frame into an ordered batch of events.
pub(crate) fn parse_frame(text: &str) -> Result<Vec<Event>, Error> {
    let shape: FrameShape = serde_json::from_str(text)
        .map_err(|err| Error::Connection(format!("tail frame did not match schema: {err}")))?;
    match shape {
        FrameShape::One(event) => Ok(vec![*event]),
        FrameShape::Many(events) => {
            if events.is_empty() {
                return Err(Error::Connection(
                    "tail frame did not match schema: empty event array".to_owned(),
                ));
            }
            Ok(events)
        }
    }
}

#[cfg(test)]
mod tests;
