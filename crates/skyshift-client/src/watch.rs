//! NDJSON watch stream decoding
//!
//! The server streams one serialized [`WatchEvent`] per line. The stream
//! stays open until either side closes; transport errors surface as
//! `Transient` so callers reconnect with their resume cursor.

use std::pin::Pin;

use futures::{Stream, StreamExt};

use skyshift_common::object::WatchEvent;
use skyshift_common::{Error, Result};

/// Ordered stream of decoded watch events from the API server
pub type ClientWatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent>> + Send>>;

/// Decode a streaming HTTP response into watch events, one JSON document
/// per line.
pub fn ndjson_events(response: reqwest::Response) -> ClientWatchStream {
    let bytes = Box::pin(response.bytes_stream());
    let events = futures::stream::unfold(
        (bytes, Vec::<u8>::new(), false),
        |(mut bytes, mut buffer, done)| async move {
            if done {
                return None;
            }
            loop {
                // Emit any complete line already buffered.
                if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = &line[..line.len() - 1];
                    if line.is_empty() {
                        continue;
                    }
                    let item = decode_line(line);
                    return Some((item, (bytes, buffer, false)));
                }

                match bytes.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(err)) => {
                        return Some((
                            Err(Error::transient("watch", err.to_string())),
                            (bytes, buffer, true),
                        ))
                    }
                    None => {
                        // Stream closed; a partial trailing line is dropped.
                        return None;
                    }
                }
            }
        },
    );
    Box::pin(events)
}

fn decode_line(line: &[u8]) -> Result<WatchEvent> {
    serde_json::from_slice::<WatchEvent>(line)
        .map_err(|e| Error::transient("watch", format!("undecodable event: {e}")))
}
