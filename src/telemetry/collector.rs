/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{ResourceSampler, SampleTargets, TelemetryGap, TelemetryLog, TelemetrySample};
use anyhow::Context;
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;

enum Reading {
    Sample(TelemetrySample),
    Gap(TelemetryGap),
}

/// Returned by [`start_sampling`]. Dropping it without calling `stop` leaves the tasks running
/// until the runtime shuts down.
pub struct SamplingHandle {
    token: CancellationToken,
    sampler: JoinHandle<()>,
    drainer: JoinHandle<TelemetryLog>,
}
impl SamplingHandle {
    /// Cancels the sampler, lets a sample already in flight finish, waits for the channel to drain
    /// and hands back everything collected.
    pub async fn stop(self) -> anyhow::Result<TelemetryLog> {
        self.token.cancel();

        // the sampler owns the only sender, the drainer ends once it is dropped
        self.sampler.await.context("Sampler task did not shut down cleanly")?;
        let log = self
            .drainer
            .await
            .context("Telemetry drain task did not shut down cleanly")?;

        debug!(
            "telemetry stopped with {} samples and {} gaps",
            log.samples.len(),
            log.gaps.len()
        );
        Ok(log)
    }
}

/// Starts sampling `targets` every `interval` on a background task.
///
/// Readings flow through a bounded channel to a second task that owns the log, so nothing reads
/// the log while it is still being written. Sampler failures are stored as gaps and sampling
/// carries on.
pub fn start_sampling(
    sampler: Arc<dyn ResourceSampler>,
    targets: SampleTargets,
    interval: Duration,
) -> SamplingHandle {
    let token = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<Reading>(CHANNEL_CAPACITY);

    let sampler_token = token.clone();
    let sampler = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sampler_token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // a sample that has started is always finished and kept
            let reading = match sampler.sample(&targets).await {
                Ok(sample) => Reading::Sample(sample),
                Err(err) => {
                    warn!("telemetry sample failed: {:#}", err);
                    Reading::Gap(TelemetryGap {
                        at: Utc::now(),
                        reason: format!("{:#}", err),
                    })
                }
            };

            if tx.send(reading).await.is_err() {
                break;
            }
        }
    });

    let drainer = tokio::spawn(async move {
        let mut log = TelemetryLog::default();
        while let Some(reading) = rx.recv().await {
            match reading {
                Reading::Sample(sample) => log.samples.push(sample),
                Reading::Gap(gap) => log.gaps.push(gap),
            }
        }
        log
    });

    SamplingHandle {
        token,
        sampler,
        drainer,
    }
}
