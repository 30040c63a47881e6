//! Change feed relayed over server-sent events.
//!
//! The relay endpoint streams one SSE message per row change, with the
//! JSON-encoded [`ChangeEvent`] as its data. One connection is kept per
//! subscribed table; it reconnects with backoff and closes once the last
//! receiver is gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use tokio::sync::broadcast;
use url::Url;

use concierge_core::gateway::{ChangeEvent, ChangeFeed, GatewayError, Result, Table};
use concierge_core::policy::Backoff;

use super::rest::parse_base_url;

/// Channel capacity for relayed change events.
const CHANNEL_CAPACITY: usize = 100;

type Channels = Arc<Mutex<HashMap<Table, broadcast::Sender<ChangeEvent>>>>;

/// Change feed reading from an SSE relay.
#[derive(Debug, Clone)]
pub struct SseChangeFeed {
    client: reqwest::Client,
    events_url: Url,
    api_key: String,
    reconnect: Backoff,
    channels: Channels,
}

impl SseChangeFeed {
    pub fn new(events_url: &str, api_key: impl Into<String>) -> Result<Self> {
        let mut url = parse_base_url(events_url)?;
        // The events endpoint is a resource, not a directory
        let path = url.path().trim_end_matches('/').to_string();
        url.set_path(&path);

        Ok(Self {
            client: reqwest::Client::new(),
            events_url: url,
            api_key: api_key.into(),
            reconnect: Backoff::Exponential {
                base: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
            channels: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn with_reconnect(mut self, backoff: Backoff) -> Self {
        self.reconnect = backoff;
        self
    }

    fn table_url(&self, table: Table) -> Url {
        let mut url = self.events_url.clone();
        url.query_pairs_mut().append_pair("table", table.as_str());
        url
    }

    async fn connect(&self, table: Table) -> Result<impl Stream<Item = Result<ChangeEvent>>> {
        let response = self
            .client
            .get(self.table_url(table))
            .header("Accept", "text/event-stream")
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GatewayError::Unavailable(format!(
                "change relay returned {}",
                response.status()
            )));
        }
        Ok(change_stream(response))
    }

    /// Pumps events from the relay into the table's channel until nobody
    /// listens anymore.
    async fn relay(self, table: Table, sender: broadcast::Sender<ChangeEvent>) {
        use tokio_stream::StreamExt;

        let mut attempt = 0;
        'connection: while sender.receiver_count() > 0 {
            match self.connect(table).await {
                Ok(stream) => {
                    tracing::debug!(%table, "Change relay connected");
                    attempt = 0;
                    tokio::pin!(stream);
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(event) if event.table == table => {
                                if sender.send(event).is_err() {
                                    break 'connection;
                                }
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(%table, error = %err, "Change relay interrupted");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(%table, error = %err, "Change relay connection failed");
                }
            }

            attempt += 1;
            tokio::time::sleep(self.reconnect.delay(attempt)).await;
        }

        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if channels.get(&table).is_some_and(|s| s.same_channel(&sender)) {
            channels.remove(&table);
        }
        tracing::debug!(%table, "Change relay closed");
    }
}

#[async_trait]
impl ChangeFeed for SseChangeFeed {
    async fn subscribe(&self, table: Table) -> Result<broadcast::Receiver<ChangeEvent>> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = channels.get(&table) {
            return Ok(sender.subscribe());
        }

        let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
        channels.insert(table, sender.clone());
        tokio::spawn(self.clone().relay(table, sender));
        Ok(receiver)
    }
}

/// Parses the SSE byte stream of a relay response into change events.
fn change_stream(response: reqwest::Response) -> impl Stream<Item = Result<ChangeEvent>> {
    async_stream::stream! {
        use tokio_stream::StreamExt;

        let mut byte_stream = response.bytes_stream();
        let mut buffer = MessageBuffer::default();

        while let Some(chunk_result) = byte_stream.next().await {
            match chunk_result {
                Ok(chunk) => {
                    for message in buffer.push(&chunk) {
                        if let Some(event) = parse_sse_event(&message) {
                            yield Ok(event);
                        }
                    }
                }
                Err(e) => {
                    yield Err(GatewayError::Connection(e.to_string()));
                    break;
                }
            }
        }
    }
}

/// Raw bytes of a partially received stream.
///
/// Chunks may end inside a UTF-8 sequence or between `\r` and `\n`, so
/// messages are only decoded once their blank-line terminator arrives.
#[derive(Debug, Default)]
struct MessageBuffer {
    bytes: Vec<u8>,
}

impl MessageBuffer {
    /// Appends a chunk and returns every message it completes.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        let mut messages = Vec::new();
        while let Some(pos) = self.bytes.windows(2).position(|pair| pair == b"\n\n") {
            let message: Vec<u8> = self.bytes.drain(..pos + 2).collect();
            messages.push(String::from_utf8_lossy(&message[..pos]).into_owned());
        }
        messages
    }
}

/// Parses one SSE message. Multi-line data is joined with newlines;
/// comments, keep-alives and undecodable payloads yield nothing.
fn parse_sse_event(message: &str) -> Option<ChangeEvent> {
    let mut data: Vec<&str> = Vec::new();

    for line in message.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    if data.is_empty() {
        return None;
    }
    match serde_json::from_str(&data.join("\n")) {
        Ok(event) => Some(event),
        Err(err) => {
            tracing::warn!(error = %err, "Ignoring undecodable change event");
            None
        }
    }
}
