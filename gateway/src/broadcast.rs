use std::sync::Arc;

use metrics::{counter, gauge};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{error, info_span, warn, Instrument};

use crate::publisher::{envelope, Publisher};

/// Hands final messages over to the publisher without making the request wait.
///
/// Every message is published from its own detached task. Without a concurrency
/// limit the number of in-flight tasks is unbounded; with one, messages arriving
/// while all permits are taken are dropped.
#[derive(Clone)]
pub struct Broadcaster {
    publisher: Arc<dyn Publisher + Send + Sync>,
    inflight: Option<Arc<Semaphore>>,
}

impl Broadcaster {
    pub fn new(
        publisher: Arc<dyn Publisher + Send + Sync>,
        concurrency_limit: Option<usize>,
    ) -> Self {
        Broadcaster {
            publisher,
            inflight: concurrency_limit.map(|limit| Arc::new(Semaphore::new(limit))),
        }
    }

    /// Spawns the publish of a message and returns immediately. Failures are logged and
    /// counted, never reported to the caller. Returns false if the message was dropped
    /// because too many publishes are in flight.
    pub fn dispatch(&self, message: Value) -> bool {
        let permit = match &self.inflight {
            None => None,
            Some(inflight) => match inflight.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    counter!("gateway_publish_dropped_total", "cause" => "saturated").increment(1);
                    warn!("too many publishes in flight, dropping message");
                    return false;
                }
            },
        };

        let publisher = self.publisher.clone();
        tokio::spawn(
            async move {
                gauge!("gateway_publish_inflight").increment(1.0);
                publish(publisher.as_ref(), &message).await;
                gauge!("gateway_publish_inflight").decrement(1.0);
                drop(permit);
            }
            .instrument(info_span!("publish")),
        );

        true
    }
}

async fn publish(publisher: &(dyn Publisher + Send + Sync), message: &Value) {
    let frame = match envelope(message) {
        Ok(frame) => frame,
        Err(e) => {
            counter!("gateway_publish_errors_total").increment(1);
            error!("failed to build publish frame: {}", e);
            return;
        }
    };

    if let Err(e) = publisher.publish(frame).await {
        counter!("gateway_publish_errors_total").increment(1);
        error!("failed to publish message: {}", e);
    }
}
