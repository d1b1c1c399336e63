use baton_agent::RetryPolicy;
use baton_core::config::AppConfig;
use baton_core::types::ConsensusAlgorithm;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

/// Print one line per check. Returns false when any check failed.
pub fn run_doctor(config: &AppConfig) -> bool {
    let checks = vec![
        check_validation(config),
        check_retry_budget(config),
        check_circuit_breaker(config),
        check_consensus(config),
        check_hooks(config),
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count == 0
}

fn check_validation(config: &AppConfig) -> CheckResult {
    let issues = config.handoff.issues();
    if issues.is_empty() {
        CheckResult {
            label: "Handoff config".into(),
            ok: true,
            detail: "All values within range".into(),
        }
    } else {
        CheckResult {
            label: "Handoff config".into(),
            ok: false,
            detail: issues.join("; "),
        }
    }
}

/// Worst-case time spent sleeping between retries of one handoff.
fn check_retry_budget(config: &AppConfig) -> CheckResult {
    let handoff = &config.handoff;
    let policy = RetryPolicy::from_config(handoff);
    let worst_ms: u64 = (0..policy.max_attempts.saturating_sub(1))
        .map(|retry| policy.nominal_delay(retry).as_millis() as u64 * 12 / 10)
        .sum();

    CheckResult {
        label: "Retry budget".into(),
        ok: true,
        detail: if worst_ms > handoff.latency_target_ms {
            format!(
                "{} attempts may wait up to {}ms, above the {}ms latency target",
                policy.max_attempts, worst_ms, handoff.latency_target_ms
            )
        } else {
            format!(
                "{} attempts, up to {}ms of backoff",
                policy.max_attempts, worst_ms
            )
        },
    }
}

fn check_circuit_breaker(config: &AppConfig) -> CheckResult {
    let handoff = &config.handoff;
    if !handoff.enable_circuit_breaker {
        return CheckResult {
            label: "Circuit breaker".into(),
            ok: true,
            detail: "Disabled".into(),
        };
    }
    let ok = handoff.circuit_breaker_failure_threshold > 0 && handoff.circuit_breaker_timeout_ms > 0;
    CheckResult {
        label: "Circuit breaker".into(),
        ok,
        detail: format!(
            "Opens after {} failures, probes after {}ms",
            handoff.circuit_breaker_failure_threshold, handoff.circuit_breaker_timeout_ms
        ),
    }
}

fn check_consensus(config: &AppConfig) -> CheckResult {
    let handoff = &config.handoff;
    if !handoff.enable_consensus_escalation {
        return CheckResult {
            label: "Consensus escalation".into(),
            ok: true,
            detail: "Disabled".into(),
        };
    }
    let uses_threshold = matches!(
        handoff.consensus_algorithm,
        ConsensusAlgorithm::Supermajority | ConsensusAlgorithm::ConsensusThreshold
    );
    let detail = if uses_threshold {
        format!(
            "{} at {:.0}%, within {:.2} confidence",
            handoff.consensus_algorithm,
            handoff.consensus_threshold * 100.0,
            handoff.disagreement_margin
        )
    } else {
        format!(
            "{}, within {:.2} confidence",
            handoff.consensus_algorithm, handoff.disagreement_margin
        )
    };
    CheckResult {
        label: "Consensus escalation".into(),
        ok: handoff.consensus_threshold > 0.0 && handoff.consensus_threshold <= 1.0,
        detail,
    }
}

fn check_hooks(config: &AppConfig) -> CheckResult {
    match &config.hooks {
        Some(hooks) if !hooks.is_empty() => {
            let blank = hooks
                .on_handoff_start
                .iter()
                .chain(&hooks.on_handoff_complete)
                .chain(&hooks.on_handoff_error)
                .filter(|cmd| cmd.trim().is_empty())
                .count();
            let total = hooks.on_handoff_start.len()
                + hooks.on_handoff_complete.len()
                + hooks.on_handoff_error.len();
            CheckResult {
                label: "Hooks".into(),
                ok: blank == 0,
                detail: if blank == 0 {
                    format!("{} command(s) configured", total)
                } else {
                    format!("{} of {} hook command(s) are blank", blank, total)
                },
            }
        }
        _ => CheckResult {
            label: "Hooks".into(),
            ok: true,
            detail: "None configured".into(),
        },
    }
}
