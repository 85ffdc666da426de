/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    resources::Component,
    search::{Evaluation, SearchOutcome, SearchState},
    thresholds::{ThresholdSet, ThresholdSource},
    verdict::{StopRule, Verdict},
};
use colored::*;
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};

fn fmt_opt(value: Option<f64>, precision: usize, unit: &str) -> String {
    value
        .map(|v| format!("{v:.precision$}{unit}"))
        .unwrap_or("--".to_string())
}

fn usage(verdict: &Verdict, component: Component) -> String {
    let usage = &verdict.component(component).usage;
    format!(
        "{} / {}",
        fmt_opt(usage.cpu_pct, 1, "%"),
        fmt_opt(usage.mem_mb, 0, "MB")
    )
}

/// One row per evaluated configuration, in evaluation order.
pub fn evaluations_table(evaluations: &[Evaluation]) -> Table {
    let mut rows = rows![row![
        TableCell::builder("#".bold()).build(),
        TableCell::builder("Configuration".bold()).build(),
        TableCell::builder("Error rate".bold()).build(),
        TableCell::builder("Latency p95".bold()).build(),
        TableCell::builder("A cpu / mem".bold()).build(),
        TableCell::builder("B cpu / mem".bold()).build(),
        TableCell::builder("Failed".bold()).build(),
        TableCell::builder("Decision".bold()).build()
    ]];

    for (i, evaluation) in evaluations.iter().enumerate() {
        let verdict = &evaluation.verdict;
        let p95 = verdict.latency.get("latency_p95").copied().flatten();
        rows.push(row![
            TableCell::new(i + 1),
            TableCell::new(evaluation.configuration.label()),
            TableCell::new(fmt_opt(verdict.error_rate.map(|r| r * 100.0), 2, "%")),
            TableCell::new(fmt_opt(p95, 1, "ms")),
            TableCell::new(usage(verdict, Component::ComponentA)),
            TableCell::new(usage(verdict, Component::ComponentB)),
            TableCell::new(format!(
                "{}/{}",
                verdict.failed_repetitions, verdict.repetitions
            )),
            TableCell::new(evaluation.decision.to_string())
        ]);
    }

    Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build()
}

pub fn print_search_summary(stack: &str, outcome: &SearchOutcome) {
    println!("\n{}", format!(" Summary: {stack} ").reversed().green());
    println!("{}", evaluations_table(&outcome.history).render());

    match outcome.final_state {
        SearchState::Passed(_) => println!(
            "{} minimal configuration {} after {} iterations",
            "✓".green(),
            outcome.final_configuration.to_string().green(),
            outcome.iterations()
        ),
        _ => println!(
            "{} no configuration up to {} met the thresholds ({} iterations)",
            "✗".red(),
            outcome.final_configuration.to_string().red(),
            outcome.iterations()
        ),
    }
}

pub fn print_sweep_summary(
    stack: &str,
    evaluations: &[Evaluation],
    rule: &StopRule,
    searched: &[Component],
) {
    println!("\n{}", format!(" Sweep: {stack} ").reversed().green());
    println!("{}", evaluations_table(evaluations).render());

    let passing = evaluations
        .iter()
        .filter(|e| e.verdict.passed(rule, searched))
        .map(|e| e.configuration.label())
        .collect::<Vec<_>>();
    if passing.is_empty() {
        println!("{} no configuration passed", "✗".red());
    } else {
        println!("{} passed: {}", "✓".green(), passing.join(", ").green());
    }
}

pub fn print_thresholds(thresholds: &ThresholdSet) {
    let source = match thresholds.source() {
        ThresholdSource::Script => "from script".green(),
        ThresholdSource::Defaults => "defaults, nothing recognised in script".yellow(),
    };
    println!("Thresholds ({source}):");
    for (_, threshold) in thresholds.iter() {
        println!("\t{threshold}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        resources::{Allocation, ResourceConfiguration},
        search::Decision,
        verdict::aggregate,
    };

    #[test]
    fn table_has_one_row_per_evaluation() {
        let configuration = ResourceConfiguration::new(
            Allocation::from_cores(1.0, 1024),
            Allocation::from_cores(1.0, 1024),
        );
        let evaluation = Evaluation {
            configuration,
            verdict: aggregate(&[], &ThresholdSet::defaults()),
            decision: Decision::Recorded,
        };

        let rendered = evaluations_table(&[evaluation.clone(), evaluation]).render();

        assert_eq!(rendered.matches("a1_1024-b1_1024").count(), 2);
        assert!(rendered.contains("recorded"));
        assert!(rendered.contains("--"));
    }
}
