//! Override valve auto-control.
//!
//! The override relay opens the fast supply into the tank. The controller
//! turns it on below `on_threshold` and off at or above
//! `shutoff_threshold`, re-checking both every tick. If a person turns
//! override back on while the tank is still above the shutoff level, the
//! next tick turns it off again.
//!
//! Without a tank reading the controller cannot tell whether the tank is
//! about to overflow. After `max_consecutive_failures` failed reads in a
//! row it turns override off as a safety action. One or two failures do
//! nothing, so a short network blip never closes the valve. While the
//! outage lasts, override seen on again (by hand, or on when the outage
//! began with override off) is shut off again with another urgent event.

use crate::config::OverrideConfig;
use crate::model::{Event, EventKind, RelayAction, RelayCommand, RelayState, RelayTarget, Severity};
use crate::relay::RelayActuator;
use crate::state::FailureCounter;
use chrono::{DateTime, Utc};

/// A command the controller issued this tick and how it went.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCommand {
    pub command: RelayCommand,
    pub result: Result<(), String>,
}

#[derive(Debug, Default)]
pub struct ControlOutcome {
    pub events: Vec<Event>,
    pub commands: Vec<IssuedCommand>,
}

/// Runs one tick of the controller.
///
/// `relays` is the observed relay state going in and the state after any
/// successful command coming out. `failures` is updated in place.
pub fn run_override_control(
    gallons: Option<f64>,
    config: &OverrideConfig,
    relays: &mut RelayState,
    failures: &mut FailureCounter,
    actuator: &mut dyn RelayActuator,
    now: DateTime<Utc>,
) -> ControlOutcome {
    let mut outcome = ControlOutcome::default();

    match gallons {
        Some(g) => {
            if failures.consecutive_failures > 0 {
                if failures.safety_triggered {
                    outcome.events.push(Event::new(
                        EventKind::TankReadingsRestored {
                            after_failures: failures.consecutive_failures,
                        },
                        Severity::Info,
                        format!(
                            "Tank readings restored after {} failed reads (now {:.0} gal)",
                            failures.consecutive_failures, g
                        ),
                        now,
                    ));
                }
                *failures = FailureCounter::default();
            }

            if !config.enabled {
                return outcome;
            }

            if !relays.override_on {
                if let Some(on) = config.on_threshold.filter(|on| g < *on) {
                    let command = RelayCommand {
                        target: RelayTarget::Override,
                        action: RelayAction::On,
                        reason: format!("tank at {:.0} gal, below {:.0}", g, on),
                    };
                    if apply(command, actuator, relays, &mut outcome, now) {
                        outcome.events.push(Event::new(
                            EventKind::OverrideOn {
                                gallons: g,
                                threshold: on,
                            },
                            Severity::Info,
                            format!("Override turned ON: tank at {:.0} gal (below {:.0})", g, on),
                            now,
                        ));
                    }
                }
            } else if g >= config.shutoff_threshold {
                let off = config.shutoff_threshold;
                let command = RelayCommand {
                    target: RelayTarget::Override,
                    action: RelayAction::Off,
                    reason: format!("tank at {:.0} gal, at or above {:.0}", g, off),
                };
                if apply(command, actuator, relays, &mut outcome, now) {
                    outcome.events.push(Event::new(
                        EventKind::OverrideOff {
                            gallons: g,
                            threshold: off,
                        },
                        Severity::Info,
                        format!("Override turned OFF: tank at {:.0} gal (shutoff {:.0})", g, off),
                        now,
                    ));
                }
            }
        }
        None => {
            failures.consecutive_failures = failures.consecutive_failures.saturating_add(1);
            let count = failures.consecutive_failures;

            if count < config.max_consecutive_failures {
                tracing::debug!(consecutive_failures = count, "tank read failed");
                return outcome;
            }

            // `safety_triggered` only quiets the gate while override is off.
            // Override seen on again mid-outage is shut off again.
            if config.enabled && relays.override_on {
                let command = RelayCommand {
                    target: RelayTarget::Override,
                    action: RelayAction::Off,
                    reason: format!("safety shutoff after {} failed tank reads", count),
                };
                if apply(command, actuator, relays, &mut outcome, now) {
                    failures.safety_triggered = true;
                    outcome.events.push(Event::new(
                        EventKind::SafetyShutoff {
                            consecutive_failures: count,
                        },
                        Severity::Urgent,
                        format!(
                            "Safety shutoff: override turned OFF after {} consecutive failed tank reads",
                            count
                        ),
                        now,
                    ));
                }
            } else if relays.override_on {
                // Auto-control disabled: nothing to actuate, but never silent.
                if !failures.safety_triggered {
                    failures.safety_triggered = true;
                    outcome.events.push(Event::new(
                        EventKind::TankReadingsUnavailable {
                            consecutive_failures: count,
                        },
                        Severity::Urgent,
                        format!(
                            "Tank readings unavailable for {} consecutive polls with override ON and auto-control disabled",
                            count
                        ),
                        now,
                    ));
                }
            } else if !failures.safety_triggered {
                failures.safety_triggered = true;
                outcome.events.push(Event::new(
                    EventKind::TankReadingsUnavailable {
                        consecutive_failures: count,
                    },
                    Severity::Warning,
                    format!("Tank readings unavailable for {} consecutive polls", count),
                    now,
                ));
            } else {
                tracing::debug!(consecutive_failures = count, "tank read failed, outage already reported");
            }
        }
    }

    outcome
}

/// Sends `command`, recording the result. Returns whether it took effect.
fn apply(
    command: RelayCommand,
    actuator: &mut dyn RelayActuator,
    relays: &mut RelayState,
    outcome: &mut ControlOutcome,
    now: DateTime<Utc>,
) -> bool {
    let result = actuator.actuate(&command);
    let applied = result.is_ok();

    match &result {
        Ok(()) => {
            let on = command.action == RelayAction::On;
            match command.target {
                RelayTarget::Override => relays.override_on = on,
                RelayTarget::Bypass => relays.bypass = on,
            }
        }
        Err(e) => {
            tracing::error!(
                relay = %command.target,
                action = %command.action,
                error = %e,
                "relay actuation failed, will re-evaluate next tick"
            );
            outcome.events.push(Event::new(
                EventKind::RelayActuationFailed {
                    target: command.target,
                    action: command.action,
                    error: e.to_string(),
                },
                Severity::Urgent,
                format!(
                    "Failed to turn {} {}: {} (wanted because {})",
                    command.target, command.action, e, command.reason
                ),
                now,
            ));
        }
    }

    outcome.commands.push(IssuedCommand {
        command,
        result: result.map_err(|e| e.to_string()),
    });
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RelayError;
    use crate::relay::DryRunActuator;

    struct BrokenActuator;

    impl RelayActuator for BrokenActuator {
        fn actuate(&mut self, _command: &RelayCommand) -> Result<(), RelayError> {
            Err(RelayError::Hardware("GPIO write failed".into()))
        }
    }

    fn config() -> OverrideConfig {
        OverrideConfig {
            enabled: true,
            on_threshold: Some(1350.0),
            shutoff_threshold: 1410.0,
            max_consecutive_failures: 3,
        }
    }

    fn kinds(outcome: &ControlOutcome) -> Vec<&'static str> {
        outcome.events.iter().map(|e| e.kind.name()).collect()
    }

    // --- Level-driven control -----------------------------------------------

    #[test]
    fn test_below_on_threshold_turns_override_on() {
        let mut relays = RelayState::default();
        let mut failures = FailureCounter::default();
        let mut actuator = DryRunActuator::new();
        let outcome = run_override_control(Some(1340.0), &config(), &mut relays, &mut failures, &mut actuator, Utc::now());
        assert!(relays.override_on);
        assert_eq!(kinds(&outcome), vec!["override_on"]);
        assert_eq!(actuator.issued()[0].action, RelayAction::On);
    }

    #[test]
    fn test_disabled_on_threshold_never_turns_on() {
        let mut cfg = config();
        cfg.on_threshold = None;
        let mut relays = RelayState::default();
        let mut failures = FailureCounter::default();
        let mut actuator = DryRunActuator::new();
        run_override_control(Some(200.0), &cfg, &mut relays, &mut failures, &mut actuator, Utc::now());
        assert!(!relays.override_on);
        assert!(actuator.issued().is_empty());
    }

    #[test]
    fn test_at_shutoff_turns_override_off() {
        let mut relays = RelayState {
            override_on: true,
            bypass: false,
        };
        let mut failures = FailureCounter::default();
        let mut actuator = DryRunActuator::new();
        let outcome = run_override_control(Some(1410.0), &config(), &mut relays, &mut failures, &mut actuator, Utc::now());
        assert!(!relays.override_on);
        assert_eq!(kinds(&outcome), vec!["override_off"]);
    }

    #[test]
    fn test_between_thresholds_holds_state() {
        let mut failures = FailureCounter::default();
        let mut actuator = DryRunActuator::new();
        for on in [false, true] {
            let mut relays = RelayState {
                override_on: on,
                bypass: false,
            };
            run_override_control(Some(1380.0), &config(), &mut relays, &mut failures, &mut actuator, Utc::now());
            assert_eq!(relays.override_on, on);
        }
        assert!(actuator.issued().is_empty());
    }

    // --- Failure gate -------------------------------------------------------

    #[test]
    fn test_two_failures_then_success_never_trips_safety() {
        let mut relays = RelayState {
            override_on: true,
            bypass: false,
        };
        let mut failures = FailureCounter::default();
        let mut actuator = DryRunActuator::new();
        for g in [None, None, Some(1380.0)] {
            run_override_control(g, &config(), &mut relays, &mut failures, &mut actuator, Utc::now());
        }
        assert!(relays.override_on);
        assert!(actuator.issued().is_empty());
        assert_eq!(failures.consecutive_failures, 0);
    }

    #[test]
    fn test_third_failure_trips_safety_exactly_once() {
        let mut relays = RelayState {
            override_on: true,
            bypass: false,
        };
        let mut failures = FailureCounter::default();
        let mut actuator = DryRunActuator::new();
        let mut urgent = 0;
        for _ in 0..6 {
            let outcome = run_override_control(None, &config(), &mut relays, &mut failures, &mut actuator, Utc::now());
            urgent += outcome.events.iter().filter(|e| e.severity == Severity::Urgent).count();
        }
        assert_eq!(urgent, 1);
        assert_eq!(actuator.issued().len(), 1);
        assert!(!relays.override_on);
        assert_eq!(failures.consecutive_failures, 6);
    }

    #[test]
    fn test_outage_with_override_off_warns_once() {
        let mut relays = RelayState::default();
        let mut failures = FailureCounter::default();
        let mut actuator = DryRunActuator::new();
        let mut seen = Vec::new();
        for _ in 0..5 {
            let outcome = run_override_control(None, &config(), &mut relays, &mut failures, &mut actuator, Utc::now());
            seen.extend(kinds(&outcome));
        }
        assert_eq!(seen, vec!["tank_readings_unavailable"]);

        let outcome = run_override_control(Some(1380.0), &config(), &mut relays, &mut failures, &mut actuator, Utc::now());
        assert_eq!(kinds(&outcome), vec!["tank_readings_restored"]);
    }

    #[test]
    fn test_manual_reenable_mid_outage_is_shut_off_again() {
        let mut relays = RelayState {
            override_on: true,
            bypass: false,
        };
        let mut failures = FailureCounter::default();
        let mut actuator = DryRunActuator::new();
        for _ in 0..3 {
            run_override_control(None, &config(), &mut relays, &mut failures, &mut actuator, Utc::now());
        }
        assert!(!relays.override_on);

        relays.override_on = true;
        let outcome = run_override_control(None, &config(), &mut relays, &mut failures, &mut actuator, Utc::now());
        assert_eq!(kinds(&outcome), vec!["safety_shutoff"]);
        assert_eq!(outcome.events[0].severity, Severity::Urgent);
        assert_eq!(actuator.issued().len(), 2);
        assert!(!relays.override_on);
    }

    #[test]
    fn test_override_on_after_outage_warning_is_shut_off() {
        let mut relays = RelayState::default();
        let mut failures = FailureCounter::default();
        let mut actuator = DryRunActuator::new();
        let mut seen = Vec::new();
        for tick in 0..6 {
            if tick == 4 {
                relays.override_on = true;
            }
            let outcome = run_override_control(None, &config(), &mut relays, &mut failures, &mut actuator, Utc::now());
            seen.extend(kinds(&outcome));
        }
        assert_eq!(seen, vec!["tank_readings_unavailable", "safety_shutoff"]);
        assert_eq!(actuator.issued().len(), 1);
        assert!(!relays.override_on);
    }

    #[test]
    fn test_outage_with_control_disabled_and_override_on_is_urgent() {
        let mut cfg = config();
        cfg.enabled = false;
        let mut relays = RelayState {
            override_on: true,
            bypass: false,
        };
        let mut failures = FailureCounter::default();
        let mut actuator = DryRunActuator::new();
        let mut urgent = 0;
        for _ in 0..5 {
            let outcome = run_override_control(None, &cfg, &mut relays, &mut failures, &mut actuator, Utc::now());
            urgent += outcome.events.iter().filter(|e| e.severity == Severity::Urgent).count();
        }
        assert_eq!(urgent, 1);
        assert!(actuator.issued().is_empty());
    }

    // --- Actuation failure --------------------------------------------------

    #[test]
    fn test_failed_actuation_keeps_state_and_reports_urgent() {
        let mut relays = RelayState {
            override_on: true,
            bypass: false,
        };
        let mut failures = FailureCounter::default();
        let outcome = run_override_control(Some(1420.0), &config(), &mut relays, &mut failures, &mut BrokenActuator, Utc::now());
        assert!(relays.override_on, "state must reflect the physical relay");
        assert_eq!(kinds(&outcome), vec!["relay_actuation_failed"]);
        assert_eq!(outcome.events[0].severity, Severity::Urgent);
        assert!(outcome.commands[0].result.is_err());
    }

    #[test]
    fn test_failed_safety_shutoff_retries_next_tick() {
        let mut relays = RelayState {
            override_on: true,
            bypass: false,
        };
        let mut failures = FailureCounter::default();
        for _ in 0..3 {
            run_override_control(None, &config(), &mut relays, &mut failures, &mut BrokenActuator, Utc::now());
        }
        assert!(!failures.safety_triggered);

        let mut actuator = DryRunActuator::new();
        let outcome = run_override_control(None, &config(), &mut relays, &mut failures, &mut actuator, Utc::now());
        assert_eq!(kinds(&outcome), vec!["safety_shutoff"]);
        assert!(failures.safety_triggered);
        assert!(!relays.override_on);
    }
}
