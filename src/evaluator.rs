use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

/// Value reported for `f` when an evaluation fails.
pub const FAILED_F: f64 = f64::NAN;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
    pub f: f64,
    pub ok: bool,
}

impl Evaluation {
    pub fn ok(f: f64) -> Self {
        Self { f, ok: true }
    }

    pub fn failed() -> Self {
        Self {
            f: FAILED_F,
            ok: false,
        }
    }
}

/// The expensive scalar function workers run. Implementations report their
/// own failures through `ok = false` rather than panicking.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, x: f64) -> Evaluation;
}

impl<F> Evaluator for F
where
    F: Fn(f64) -> Evaluation + Send + Sync,
{
    fn evaluate(&self, x: f64) -> Evaluation {
        self(x)
    }
}

/// Placeholder evaluator: truncates toward zero and never fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct Truncate;

impl Evaluator for Truncate {
    fn evaluate(&self, x: f64) -> Evaluation {
        Evaluation::ok(x.trunc())
    }
}

/// Runs `evaluator`, turning a panic into a failed evaluation so workers
/// always have something to send back.
pub fn evaluate_guarded<E: Evaluator + ?Sized>(
    evaluator: &E,
    x: f64,
) -> Evaluation {
    catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(x))).unwrap_or_else(
        |_| {
            warn!(x, "evaluator panicked, reporting a failed evaluation");
            Evaluation::failed()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_drops_the_fraction() {
        assert_eq!(Truncate.evaluate(42.37), Evaluation::ok(42.0));
        assert_eq!(Truncate.evaluate(0.99), Evaluation::ok(0.0));
        assert_eq!(Truncate.evaluate(-2.7), Evaluation::ok(-2.0));
    }

    #[test]
    fn truncate_is_pure() {
        let first = Truncate.evaluate(42.37);
        for _ in 0..10 {
            assert_eq!(Truncate.evaluate(42.37), first);
        }
    }

    #[test]
    fn closures_are_evaluators() {
        let square = |x: f64| Evaluation::ok(x * x);
        assert_eq!(evaluate_guarded(&square, 3.0), Evaluation::ok(9.0));
    }

    #[test]
    fn panics_become_failures() {
        let broken = |_: f64| -> Evaluation { panic!("diverged") };
        let outcome = evaluate_guarded(&broken, 1.0);
        assert!(!outcome.ok);
        assert!(outcome.f.is_nan());
    }
}
