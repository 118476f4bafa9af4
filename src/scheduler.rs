//! Background polling for handlers with an interval.
//!
//! Each scheduled handler gets its own loop that sleeps for the
//! handler's interval, then runs its scheduled entry point on the worker
//! pool and waits for it to finish before sleeping again. The next tick
//! is therefore measured from completion, so a slow tick delays the
//! schedule instead of stacking ticks behind it.

use crate::handlers::{BotContext, HandlerDescriptor, Registry};
use crate::worker::WorkerPool;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Drives scheduled handler ticks.
pub struct Scheduler {
    workers: WorkerPool,
    ctx: Arc<BotContext>,
}

impl Scheduler {
    pub fn new(workers: WorkerPool, ctx: Arc<BotContext>) -> Self {
        Self { workers, ctx }
    }

    /// Start a polling loop for every enabled handler with an interval.
    pub fn start(&self, registry: &Registry) {
        for descriptor in registry.all_scheduled() {
            self.schedule(descriptor);
        }
    }

    /// Start one polling loop. Safe to call again for the same descriptor;
    /// the in-flight guard keeps overlapping loops from double-running a
    /// tick.
    pub fn schedule(&self, descriptor: Arc<HandlerDescriptor>) {
        let Some(interval) = descriptor.handler.poll_interval() else {
            return;
        };
        info!(
            handler = descriptor.name,
            interval_secs = interval.as_secs(),
            "Scheduling background poll"
        );

        let workers = self.workers.clone();
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if !descriptor.enabled() {
                    debug!(handler = descriptor.name, "Skipping tick, handler disabled");
                    continue;
                }
                if descriptor.tick_in_flight.swap(true, Ordering::SeqCst) {
                    warn!(
                        handler = descriptor.name,
                        "Skipping tick, previous tick still running"
                    );
                    continue;
                }

                let tick_descriptor = Arc::clone(&descriptor);
                let tick_ctx = Arc::clone(&ctx);
                let handle = workers.spawn(async move {
                    run_tick(&tick_descriptor, &tick_ctx).await;
                });
                if let Err(e) = handle.await {
                    error!(handler = descriptor.name, error = %e, "Scheduled tick task failed");
                }
                descriptor.tick_in_flight.store(false, Ordering::SeqCst);
            }
        });
    }
}

/// Run one tick. A failing or panicking tick is logged and the schedule
/// keeps going; scheduled work is never fatal to the handler.
async fn run_tick(descriptor: &HandlerDescriptor, ctx: &BotContext) {
    let outcome = AssertUnwindSafe(descriptor.handler.execute_scheduled(ctx))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(handler = descriptor.name, error = %e, "Scheduled tick failed");
        }
        Err(_) => {
            error!(handler = descriptor.name, "Scheduled tick panicked");
        }
    }
}
