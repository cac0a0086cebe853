//! Simulated PVs that generate a signal on a fixed period
//!
//! Supported names, with the defaults used when no arguments are given:
//!
//! | Name                                 | Default                    |
//! |--------------------------------------|----------------------------|
//! | `sim://sine(min, max, steps, period)`| `sine(-5, 5, 10, 1)`       |
//! | `sim://ramp(min, max, step, period)` | `ramp(-5, 5, 1, 1)`        |
//! | `sim://noise(center, std_dev, period)`| `noise(0, 1, 1)`          |
//! | `sim://flipflop(period)`             | `flipflop(1)`              |
//!
//! Periods are in seconds. Every PV runs its own task on the tokio runtime that
//! was current when the PV was created, and stops when the PV is closed.

use std::{f64::consts::PI, sync::Arc, time::Duration};

use nom::{
    IResult, Parser,
    character::complete::{char, multispace0},
    combinator::{all_consuming, opt},
    multi::separated_list0,
    number::complete::double,
    sequence::delimited,
};
use tokio::{
    runtime::Handle,
    select,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{PvFactory, initializer::identifier};
use crate::{
    PvError, PvPool,
    pv::{Pv, PvBackend, PvCore},
    vtype::{VType, Value},
};

pub const SIM_TYPE: &str = "sim";

/// Longest update period, keeping tick deadlines well inside `Instant`'s range
const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Clone, Copy, Debug, Default)]
pub struct SimFactory;

/// The state of one generated signal
#[derive(Clone, Debug, PartialEq)]
enum Signal {
    Sine {
        min: f64,
        max: f64,
        steps: f64,
        step: u64,
    },
    Ramp {
        min: f64,
        max: f64,
        step: f64,
        value: f64,
    },
    Noise {
        center: f64,
        std_dev: f64,
    },
    FlipFlop {
        state: bool,
    },
}

impl Signal {
    fn next_value(&mut self) -> Value {
        match self {
            Signal::Sine {
                min,
                max,
                steps,
                step,
            } => {
                let phase = 2.0 * PI * (*step as f64) / *steps;
                *step = step.wrapping_add(1);
                let amplitude = (*max - *min) / 2.0;
                Value::Double(*min + amplitude + amplitude * phase.sin())
            }
            Signal::Ramp {
                min,
                max,
                step,
                value,
            } => {
                let current = *value;
                *value += *step;
                if *value > *max {
                    *value = *min;
                } else if *value < *min {
                    *value = *max;
                }
                Value::Double(current)
            }
            Signal::Noise { center, std_dev } => {
                // Box-Muller
                let u1: f64 = 1.0 - rand::random::<f64>();
                let u2: f64 = rand::random();
                let gaussian = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
                Value::Double(*center + *std_dev * gaussian)
            }
            Signal::FlipFlop { state } => {
                let current = *state;
                *state = !current;
                Value::Boolean(current)
            }
        }
    }
}

fn arguments(input: &str) -> IResult<&str, Option<Vec<f64>>> {
    opt(delimited(
        char('('),
        separated_list0(char(','), delimited(multispace0, double, multispace0)),
        char(')'),
    ))
    .parse(input)
}

/// Parse a simulation name into its signal and update period
fn parse_sim_name(base_name: &str) -> Result<(Signal, Duration), PvError> {
    let invalid = |reason: String| PvError::InvalidName {
        name: base_name.to_owned(),
        reason,
    };
    let (_, (kind, args)) = all_consuming((identifier, arguments))
        .parse(base_name)
        .map_err(|_: nom::Err<nom::error::Error<&str>>| {
            invalid("Expected 'signal' or 'signal(numbers, ...)'".into())
        })?;
    let args = args.unwrap_or_default();
    let wrong_count = |expected: &str| {
        invalid(format!(
            "'{kind}' takes {expected} arguments, got {}",
            args.len()
        ))
    };
    let (signal, period) = match kind {
        "sine" => match args[..] {
            [] => (sine(-5.0, 5.0, 10.0), 1.0),
            [min, max, steps, period] => (sine(min, max, steps), period),
            _ => return Err(wrong_count("0 or 4")),
        },
        "ramp" => match args[..] {
            [] => (ramp(-5.0, 5.0, 1.0), 1.0),
            [min, max, step, period] => (ramp(min, max, step), period),
            _ => return Err(wrong_count("0 or 4")),
        },
        "noise" => match args[..] {
            [] => (Signal::Noise { center: 0.0, std_dev: 1.0 }, 1.0),
            [center, std_dev, period] => (Signal::Noise { center, std_dev }, period),
            _ => return Err(wrong_count("0 or 3")),
        },
        "flipflop" => match args[..] {
            [] => (Signal::FlipFlop { state: false }, 1.0),
            [period] => (Signal::FlipFlop { state: false }, period),
            _ => return Err(wrong_count("0 or 1")),
        },
        other => return Err(invalid(format!("Unknown simulation '{other}'"))),
    };
    if let Signal::Sine { steps, .. } = signal
        && steps < 1.0
    {
        return Err(invalid("Sine needs at least one step".into()));
    }
    match Duration::try_from_secs_f64(period) {
        Ok(duration) if !duration.is_zero() && duration <= MAX_PERIOD => Ok((signal, duration)),
        _ => Err(invalid(format!("Invalid update period {period}"))),
    }
}

fn sine(min: f64, max: f64, steps: f64) -> Signal {
    Signal::Sine {
        min,
        max,
        steps: steps.trunc(),
        step: 0,
    }
}

fn ramp(min: f64, max: f64, step: f64) -> Signal {
    Signal::Ramp {
        min,
        max,
        step,
        value: if step < 0.0 { max } else { min },
    }
}

impl PvFactory for SimFactory {
    fn pv_type(&self) -> &str {
        SIM_TYPE
    }

    fn create_pv(&self, _pool: &PvPool, name: &str, base_name: &str) -> Result<Arc<Pv>, PvError> {
        let (mut signal, period) = parse_sim_name(base_name)?;
        let runtime = Handle::try_current().map_err(|_| PvError::NoRuntime(name.to_owned()))?;

        let core = PvCore::new(name, true);
        core.notify_listeners_of_value(VType::new(signal.next_value()));

        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let weak_core = Arc::downgrade(&core);
        let task_name = name.to_owned();
        runtime.spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                select! {
                    _ = task_stop.cancelled() => break,
                    _ = ticks.tick() => {
                        let Some(core) = weak_core.upgrade() else {
                            break;
                        };
                        core.notify_listeners_of_value(VType::new(signal.next_value()));
                    }
                }
            }
            trace!("Simulation '{task_name}' stopped");
        });
        debug!("Started simulation '{name}' every {period:?}");
        Ok(Pv::new(core, SimBackend { stop }))
    }
}

struct SimBackend {
    stop: CancellationToken,
}

impl PvBackend for SimBackend {
    fn close(&self, _core: &PvCore) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[test]
    fn parse_names() {
        let (signal, period) = parse_sim_name("sine").unwrap();
        assert_eq!(signal, sine(-5.0, 5.0, 10.0));
        assert_eq!(period, Duration::from_secs(1));

        let (signal, period) = parse_sim_name("ramp(0, 10, 2, 0.5)").unwrap();
        assert_eq!(signal, ramp(0.0, 10.0, 2.0));
        assert_eq!(period, Duration::from_millis(500));

        assert!(parse_sim_name("noise(1, 2)").is_err());
        assert!(parse_sim_name("flipflop(0)").is_err());
        assert!(parse_sim_name("sine(0, 1, 0, 1)").is_err());
        assert!(parse_sim_name("square").is_err());
        assert!(parse_sim_name("sine(1, 2").is_err());
    }

    #[test]
    fn unrepresentable_periods() {
        for name in [
            "sine(0, 1, 10, 1e300)",
            "flipflop(-1)",
            "flipflop(1e-12)",
            "ramp(0, 1, 1, 1e20)",
            "noise(0, 1, 1e10)",
        ] {
            assert!(
                matches!(parse_sim_name(name), Err(PvError::InvalidName { .. })),
                "{name}"
            );
        }
    }

    #[tokio::test]
    async fn huge_period_through_pool() {
        let pool = PvPool::builder().build();
        assert!(matches!(
            pool.get_pv("sim://sine(0, 1, 10, 1e300)"),
            Err(PvError::Create { .. })
        ));
        assert!(pool.pv_references().is_empty());
        let pv = pool.get_pv("sim://sine(0, 1, 10, 1)").unwrap();
        pool.release_pv(&pv);
    }

    #[test]
    fn ramp_wraps() {
        let mut signal = ramp(0.0, 2.0, 1.0);
        let values: Vec<_> = (0..5).map(|_| signal.next_value()).collect();
        assert_eq!(
            values,
            [0.0, 1.0, 2.0, 0.0, 1.0].map(Value::Double).to_vec()
        );
        let mut signal = ramp(0.0, 2.0, -1.0);
        assert_eq!(signal.next_value(), Value::Double(2.0));
    }

    #[test]
    fn sine_stays_in_range() {
        let mut signal = sine(-1.0, 3.0, 8.0);
        for _ in 0..16 {
            let Value::Double(v) = signal.next_value() else {
                panic!("Expected a double");
            };
            assert!((-1.0 - 1e-9..=3.0 + 1e-9).contains(&v), "{v}");
        }
        assert_eq!(sine(-1.0, 3.0, 8.0).next_value(), Value::Double(1.0));
    }

    #[test]
    fn flipflop_alternates() {
        let mut signal = Signal::FlipFlop { state: false };
        assert_eq!(signal.next_value(), Value::Boolean(false));
        assert_eq!(signal.next_value(), Value::Boolean(true));
        assert_eq!(signal.next_value(), Value::Boolean(false));
    }

    #[test]
    fn needs_runtime() {
        let pool = PvPool::builder().build();
        assert!(matches!(
            SimFactory.create_pv(&pool, "sim://sine", "sine"),
            Err(PvError::NoRuntime(_))
        ));
    }

    #[tokio::test]
    async fn publishes_until_closed() {
        let pool = PvPool::builder().build();
        let pv = SimFactory
            .create_pv(&pool, "sim://flipflop(0.05)", "flipflop(0.05)")
            .unwrap();
        assert!(pv.is_readonly());
        assert_eq!(pv.read().unwrap().value, Value::Boolean(false));
        let mut values = pv.on_value_event(crate::Backpressure::Unbounded);
        assert_eq!(values.recv().await.unwrap().value, Value::Boolean(false));
        assert_eq!(values.recv().await.unwrap().value, Value::Boolean(true));
        assert_eq!(values.recv().await.unwrap().value, Value::Boolean(false));
        pv.close();
        // At most a tick that raced the close
        let remaining = values.into_stream().count().await;
        assert!(remaining <= 1);
    }
}
