/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    error::TrialError,
    persistence::{ResultsStore, TrialRecord},
    resources::ResourceConfiguration,
    search::Evaluator,
    thresholds::ThresholdSet,
    trial::{TrialResult, TrialRunner, TrialTarget},
    verdict::{self, Verdict},
};
use async_trait::async_trait;
use colored::Colorize;
use tracing::warn;

/// One stack and one workload, evaluated configuration by configuration.
pub struct Experiment {
    runner: TrialRunner,
    target: TrialTarget,
    thresholds: ThresholdSet,
    repetitions: u32,
    store: ResultsStore,
}
impl Experiment {
    pub fn new(
        runner: TrialRunner,
        target: TrialTarget,
        thresholds: ThresholdSet,
        repetitions: u32,
        store: ResultsStore,
    ) -> Self {
        Self {
            runner,
            target,
            thresholds,
            repetitions: repetitions.max(1),
            store,
        }
    }

    fn report(&self, result: &TrialResult) {
        let progress = format!("{}/{}", result.repetition, self.repetitions);
        match &result.error {
            None => println!(
                "> repetition {} at {}\t{} ({:.1}s)",
                progress,
                result.configuration.to_string().green(),
                "✓".green(),
                result.duration_secs()
            ),
            Some(err) => println!(
                "> repetition {} at {}\t{} {}: {}",
                progress,
                result.configuration.to_string().green(),
                "✗".red(),
                err.stage(),
                err
            ),
        }
    }

    fn persist(&self, result: &TrialResult) {
        let record = TrialRecord::from_result(result, &self.target.workload);
        if let Err(err) = self.store.save_trial(&record) {
            warn!("could not save trial {}: {:#}", result.name, err);
        }
    }
}

#[async_trait]
impl Evaluator for Experiment {
    async fn evaluate(&self, configuration: ResourceConfiguration) -> Result<Verdict, TrialError> {
        let mut results = Vec::with_capacity(self.repetitions as usize);
        for repetition in 1..=self.repetitions {
            let result = self
                .runner
                .run_trial(&self.target, configuration, repetition)
                .await;
            self.report(&result);
            self.persist(&result);
            if let Some(err) = result.halted() {
                return Err(err.clone());
            }
            results.push(result);
        }
        Ok(verdict::aggregate(&results, &self.thresholds))
    }
}
