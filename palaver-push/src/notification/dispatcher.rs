//! Push dispatch.
//!
//! Every targeted device gets its own task so a slow or failing endpoint never
//! delays the others. Tasks are tracked for shutdown and hang off a per-account
//! cancellation token that is a child of the dispatcher's root token.
//!
//! Tasks run on the runtime the dispatcher was built in, so [`Dispatcher::dispatch`]
//! may be called from threads outside that runtime. A dispatcher built without
//! one falls back to the caller's runtime and drops deliveries when there is none.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::events::NotificationEvent;
use super::payload::PushPayload;
use super::push::{HttpPushTransport, PushRequest, PushTransport};
use super::retry::{DeliveryOutcome, RetryPolicy, retry_with_backoff};
use crate::Result;
use crate::config::PushConfig;
use crate::logging::redact;
use crate::registry::{DeviceKey, DeviceRecord};

/// Final outcome for one device of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub device: DeviceKey,
    pub attempts: u32,
    pub outcome: DeliveryOutcome,
}

/// Returned as soon as all deliveries of an event have been started.
#[derive(Debug)]
pub struct DispatchReceipt {
    targeted: usize,
    handles: Vec<JoinHandle<DeliveryReport>>,
}

impl DispatchReceipt {
    /// A receipt for a dispatch that targeted nothing.
    pub fn empty() -> Self {
        Self {
            targeted: 0,
            handles: Vec::new(),
        }
    }

    /// Fold another dispatch into this receipt.
    pub fn merge(&mut self, other: DispatchReceipt) {
        self.targeted += other.targeted;
        self.handles.extend(other.handles);
    }

    /// Number of devices targeted.
    pub fn targeted(&self) -> usize {
        self.targeted
    }

    /// Acknowledgement sent back to the user who triggered the dispatch.
    pub fn ack_line(&self) -> String {
        format!("Notification sent to {} clients.", self.targeted)
    }

    /// Wait for every delivery to finish.
    pub async fn wait(self) -> Vec<DeliveryReport> {
        let mut reports = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => warn!("Delivery task failed: {}", e),
            }
        }
        reports
    }
}

/// Dispatch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Deliveries started.
    pub dispatched: u64,
    pub delivered: u64,
    pub rejected: u64,
    pub exhausted: u64,
    pub cancelled: u64,
    pub unroutable: u64,
    /// Deliveries still running.
    pub in_flight: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    delivered: AtomicU64,
    rejected: AtomicU64,
    exhausted: AtomicU64,
    cancelled: AtomicU64,
    unroutable: AtomicU64,
    in_flight: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Delivered => &self.delivered,
            DeliveryOutcome::Rejected(_) => &self.rejected,
            DeliveryOutcome::Exhausted(_) => &self.exhausted,
            DeliveryOutcome::Cancelled => &self.cancelled,
            DeliveryOutcome::Unroutable => &self.unroutable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct Dispatcher {
    transport: Arc<dyn PushTransport>,
    policy: RetryPolicy,
    runtime: Option<Handle>,
    tracker: TaskTracker,
    cancellation_token: CancellationToken,
    account_tokens: DashMap<String, CancellationToken>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    /// Dispatcher bound to the current runtime, if there is one.
    pub fn new(transport: Arc<dyn PushTransport>, policy: RetryPolicy) -> Self {
        Self::build(transport, policy, Handle::try_current().ok())
    }

    /// Dispatcher whose deliveries run on `runtime`.
    pub fn with_runtime(
        transport: Arc<dyn PushTransport>,
        policy: RetryPolicy,
        runtime: Handle,
    ) -> Self {
        Self::build(transport, policy, Some(runtime))
    }

    /// Dispatcher backed by the HTTP transport, bound to the current runtime.
    pub fn from_config(config: &PushConfig) -> Result<Self> {
        let transport = HttpPushTransport::new(&config.host, config.request_timeout())?;
        Ok(Self::new(Arc::new(transport), config.retry.clone()))
    }

    fn build(transport: Arc<dyn PushTransport>, policy: RetryPolicy, runtime: Option<Handle>) -> Self {
        Self {
            transport,
            policy,
            runtime,
            tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
            account_tokens: DashMap::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Start one delivery per record and return without waiting for any of them.
    ///
    /// The records must already carry the badge to deliver.
    pub fn dispatch(
        &self,
        event: &NotificationEvent,
        records: Vec<Arc<DeviceRecord>>,
    ) -> DispatchReceipt {
        if records.is_empty() {
            return DispatchReceipt::empty();
        }

        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            error!(
                account = %event.account,
                dropped = records.len(),
                "No async runtime available, dropping notification"
            );
            self.counters
                .unroutable
                .fetch_add(records.len() as u64, Ordering::Relaxed);
            return DispatchReceipt::empty();
        };

        let targeted = records.len();
        let token = self.account_token(&event.account);

        debug!(
            account = %event.account,
            scope = event.scope.as_str(),
            targeted,
            "Dispatching notification"
        );

        let handles = records
            .into_iter()
            .map(|record| {
                let payload = PushPayload::build(event, &record);
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                self.counters.in_flight.fetch_add(1, Ordering::Relaxed);
                self.tracker.spawn_on(
                    deliver(
                        self.transport.clone(),
                        self.policy.clone(),
                        token.clone(),
                        self.counters.clone(),
                        record,
                        payload,
                    ),
                    &runtime,
                )
            })
            .collect();

        DispatchReceipt { targeted, handles }
    }

    /// Abandon every in-flight delivery for `account`.
    pub fn cancel_account(&self, account: &str) {
        if let Some((_, token)) = self.account_tokens.remove(account) {
            debug!(account, "Cancelling in-flight deliveries");
            token.cancel();
        }
    }

    pub fn stats(&self) -> DispatchStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DispatchStats {
            dispatched: load(&self.counters.dispatched),
            delivered: load(&self.counters.delivered),
            rejected: load(&self.counters.rejected),
            exhausted: load(&self.counters.exhausted),
            cancelled: load(&self.counters.cancelled),
            unroutable: load(&self.counters.unroutable),
            in_flight: load(&self.counters.in_flight),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Cancel every delivery and wait for the tasks to finish.
    pub async fn shutdown(&self) {
        info!("Stopping push dispatcher");
        self.cancellation_token.cancel();
        self.account_tokens.clear();

        self.tracker.close();
        self.tracker.wait().await;

        info!("Push dispatcher stopped");
    }

    fn account_token(&self, account: &str) -> CancellationToken {
        let mut entry = self
            .account_tokens
            .entry(account.to_string())
            .or_insert_with(|| self.cancellation_token.child_token());
        if entry.is_cancelled() && !self.cancellation_token.is_cancelled() {
            *entry = self.cancellation_token.child_token();
        }
        entry.clone()
    }
}

async fn deliver(
    transport: Arc<dyn PushTransport>,
    policy: RetryPolicy,
    token: CancellationToken,
    counters: Arc<Counters>,
    record: Arc<DeviceRecord>,
    payload: PushPayload,
) -> DeliveryReport {
    let device = record.key.clone();

    let (outcome, attempts) = match PushRequest::new(&record, &payload) {
        Ok(request) => {
            let transport = transport.as_ref();
            let request = &request;
            let device = &device;
            retry_with_backoff(&policy, &token, move |attempt| {
                debug!(
                    device = %device,
                    attempt,
                    token = %redact(&request.bearer),
                    "Sending push"
                );
                transport.send(request)
            })
            .await
        }
        Err(e) => {
            warn!(device = %device, "Skipping device: {}", e);
            (DeliveryOutcome::Unroutable, 0)
        }
    };

    match &outcome {
        DeliveryOutcome::Delivered => debug!(device = %device, attempts, "Push delivered"),
        DeliveryOutcome::Rejected(status) => {
            warn!(device = %device, status, "Push endpoint rejected notification")
        }
        DeliveryOutcome::Exhausted(reason) => {
            warn!(device = %device, attempts, "Push failed after retries: {}", reason)
        }
        DeliveryOutcome::Cancelled => debug!(device = %device, attempts, "Push cancelled"),
        DeliveryOutcome::Unroutable => {}
    }

    counters.record(&outcome);

    DeliveryReport {
        device,
        attempts,
        outcome,
    }
}
