// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Dispatch loop: wakes on new submissions and freed slots.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::Supervisor;

/// Fallback wake-up in case a notification is ever missed.
const DISPATCH_TICK: Duration = Duration::from_secs(1);

pub(super) async fn run(supervisor: Arc<Supervisor>, mut shutdown: watch::Receiver<bool>) {
    let wake = supervisor.registry.wake_handle();
    let mut tick = tokio::time::interval(DISPATCH_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        limit = supervisor.config.max_concurrent,
        stall_secs = supervisor.config.stall_timeout.as_secs(),
        "Dispatcher started"
    );

    loop {
        let started = supervisor.dispatch_ready();
        if started > 0 {
            debug!(started, "Dispatched queued jobs");
        }

        tokio::select! {
            _ = wake.notified() => {}
            _ = tick.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Dispatcher stopped");
}
