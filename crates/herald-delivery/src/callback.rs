//! Asynchronous callback delivery.
//!
//! When a caller asks for deferred results, the aggregated response is
//! POSTed to their URL by a [`CallbackItem`] running on the callback pool.
//! Delivery is at-least-once with a bounded ladder: up to 10 attempts,
//! sleeping 5 s and doubling between them. A 4xx answer counts as
//! delivered — a caller-side bug must not wedge the pipeline — and after
//! the last attempt the item is dropped; there is no dead-letter.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use herald_core::{Clock, Response};
use reqwest::header;
use tracing::{debug, error, warn};

use crate::pool::WorkItem;

/// Maximum delivery attempts per callback.
pub const MAX_ATTEMPTS: u32 = 10;

/// Sleep before the second attempt; doubles for each one after.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(5);

/// One deferred response delivery.
pub struct CallbackItem {
    url: String,
    response: Response,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl CallbackItem {
    /// Creates a callback delivery for `response` toward `url`.
    ///
    /// `timeout` bounds each individual POST attempt.
    pub fn new(
        url: impl Into<String>,
        response: Response,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { url: url.into(), response, timeout, clock }
    }

    async fn deliver(&self) -> bool {
        let body = match serde_json::to_vec(&self.response) {
            Ok(body) => body,
            Err(serialize_error) => {
                error!(url = %self.url, error = %serialize_error, "couldn't marshal callback response");
                return false;
            },
        };
        // The callback client is built per item; callbacks are rare and the
        // per-attempt timeout is caller-configurable.
        let client = match reqwest::Client::builder().timeout(self.timeout).build() {
            Ok(client) => client,
            Err(build_error) => {
                error!(url = %self.url, error = %build_error, "couldn't build callback client");
                return false;
            },
        };

        let mut wait = INITIAL_BACKOFF;
        for attempt in 1..=MAX_ATTEMPTS {
            match client
                .post(&self.url)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.clone())
                .send()
                .await
            {
                Ok(callback_response) => {
                    let status = callback_response.status().as_u16();
                    let _ = callback_response.bytes().await;
                    if status < 400 {
                        debug!(url = %self.url, attempt, status, "callback delivered");
                        return true;
                    }
                    if status < 500 {
                        // Client-side errors are not worth retrying.
                        warn!(url = %self.url, attempt, status, "callback answered 4xx, not retrying");
                        return true;
                    }
                    warn!(url = %self.url, attempt, status, "callback endpoint errored");
                },
                Err(transport_error) => {
                    warn!(url = %self.url, attempt, error = %transport_error, "couldn't reach callback endpoint");
                },
            }

            if attempt < MAX_ATTEMPTS {
                self.clock.sleep(wait).await;
                wait *= 2;
            }
        }

        warn!(url = %self.url, attempts = MAX_ATTEMPTS, "callback abandoned");
        false
    }
}

#[async_trait]
impl WorkItem for CallbackItem {
    async fn execute(self: Box<Self>) -> bool {
        self.deliver().await
    }
}
