//! Request fan-out shared by both providers.
//!
//! One producer task walks the request cursor and enqueues one work item
//! per device into the shared pool; the calling task consumes exactly
//! `count()` results from a channel sized to the device count. Completion
//! order is whatever order the workers finish in; only the count is
//! guaranteed.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use herald_core::{Clock, DeviceResponse, Message, Request, RequestCursor, Response};
use tokio::sync::mpsc;
use tracing::warn;

use crate::{
    error::DeliveryError,
    pool::{WorkItem, WorkerPool},
};

/// Per-provider processing contract: one request in, one aggregated
/// response out. Implemented by the APNS and FCM services.
#[async_trait]
pub trait PushService: Send + Sync {
    /// Dispatches every device in the request and aggregates the outcomes.
    async fn process(&self, request: Request) -> Response;
}

/// Aggregated fan-out result, folded into the provider's response.
pub(crate) struct FanOut {
    pub devices: Vec<DeviceResponse>,
    pub success: i64,
    pub failure: i64,
}

impl FanOut {
    /// Moves the tallies into a response.
    pub(crate) fn apply(self, response: &mut Response) {
        response.devices = self.devices;
        response.success = self.success;
        response.failure = self.failure;
    }
}

/// Milliseconds elapsed on the injected clock since `started`.
pub(crate) fn elapsed_ms(clock: &dyn Clock, started: Instant) -> u64 {
    clock.now().duration_since(started).as_millis() as u64
}

/// Fans a request out into the pool and collects one result per device.
///
/// `make_item` builds the provider-specific work item for each message;
/// every item must eventually send exactly one [`DeviceResponse`] through
/// the channel it is given. If the pool refuses an item (shutdown race)
/// the producer sends a synthetic code-503 failure in its place, so the
/// consumer still sees one result per device. An early `None` from the
/// channel (pool stopped and queued items dropped) ends collection with
/// whatever arrived.
pub(crate) async fn fan_out<F>(pool: Arc<WorkerPool>, request: Request, mut make_item: F) -> FanOut
where
    F: FnMut(Message, mpsc::Sender<DeviceResponse>) -> Box<dyn WorkItem> + Send + 'static,
{
    let count = RequestCursor::new(&request).count();
    let (results, mut collector) = mpsc::channel::<DeviceResponse>(count.max(1));

    tokio::spawn(async move {
        let mut cursor = RequestCursor::new(&request);
        while cursor.next() {
            let Some(message) = cursor.value() else { break };
            let token = message.token.clone();
            let item = make_item(message, results.clone());
            if !pool.enqueue(item).await {
                warn!(token = %token, "worker pool refused item, reporting failure");
                let refused = DeviceResponse {
                    should_retry: true,
                    ..DeviceResponse::undelivered(
                        token,
                        DeliveryError::PoolClosed.to_push_error(),
                    )
                };
                if results.send(refused).await.is_err() {
                    break;
                }
            }
        }
    });

    let mut outcome = FanOut { devices: Vec::with_capacity(count), success: 0, failure: 0 };
    for _ in 0..count {
        let Some(device) = collector.recv().await else {
            // All senders gone before the count was reached; the pool was
            // stopped out from under this request.
            break;
        };
        if device.delivered {
            outcome.success += 1;
        } else {
            outcome.failure += 1;
        }
        outcome.devices.push(device);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use herald_core::{Multiplexed, PushError};
    use serde_json::value::RawValue;

    use super::*;

    struct EchoItem {
        message: Message,
        delivered: bool,
        results: mpsc::Sender<DeviceResponse>,
    }

    #[async_trait]
    impl WorkItem for EchoItem {
        async fn execute(self: Box<Self>) -> bool {
            let response = if self.delivered {
                DeviceResponse::delivered(self.message.token)
            } else {
                DeviceResponse::undelivered(self.message.token, PushError::new(500, "boom"))
            };
            let _ = self.results.send(response).await;
            self.delivered
        }
    }

    fn multiplexed_request(devices: &[&str]) -> Request {
        Request {
            multiplexed: Some(Multiplexed {
                devices: devices.iter().map(ToString::to_string).collect(),
                payload: RawValue::from_string("{}".into()).expect("valid JSON"),
            }),
            ..Request::default()
        }
    }

    #[tokio::test]
    async fn collects_one_result_per_device() {
        let pool = Arc::new(WorkerPool::new(4));
        pool.start();

        let request = multiplexed_request(&["a", "b", "c"]);
        let outcome = fan_out(pool.clone(), request, |message, results| {
            Box::new(EchoItem { message, delivered: true, results }) as Box<dyn WorkItem>
        })
        .await;

        assert_eq!(outcome.devices.len(), 3);
        assert_eq!(outcome.success, 3);
        assert_eq!(outcome.failure, 0);

        pool.stop().await;
    }

    #[tokio::test]
    async fn tallies_mixed_outcomes() {
        let pool = Arc::new(WorkerPool::new(2));
        pool.start();

        let request = multiplexed_request(&["ok", "bad", "ok2", "bad2"]);
        let outcome = fan_out(pool.clone(), request, |message, results| {
            let delivered = message.token.starts_with("ok");
            Box::new(EchoItem { message, delivered, results }) as Box<dyn WorkItem>
        })
        .await;

        assert_eq!(outcome.devices.len(), 4);
        assert_eq!(outcome.success, 2);
        assert_eq!(outcome.failure, 2);
        assert_eq!(outcome.success + outcome.failure, outcome.devices.len() as i64);

        pool.stop().await;
    }

    #[tokio::test]
    async fn stopped_pool_yields_synthetic_failures() {
        let pool = Arc::new(WorkerPool::new(2));
        pool.start();
        pool.stop().await;

        let request = multiplexed_request(&["a", "b"]);
        let outcome = fan_out(pool.clone(), request, |message, results| {
            Box::new(EchoItem { message, delivered: true, results }) as Box<dyn WorkItem>
        })
        .await;

        assert_eq!(outcome.devices.len(), 2);
        assert_eq!(outcome.failure, 2);
        for device in &outcome.devices {
            assert!(device.should_retry);
            assert_eq!(device.error.as_ref().expect("error set").code, 503);
        }
    }
}
