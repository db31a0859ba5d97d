use serde::Serialize;
use std::time::Instant;

/// Output below this magnitude counts as "near zero" for the rate limiter
const RATE_LIMIT_NEAR_ZERO: f64 = 0.05;
/// Step allowed away from a near-zero output
const RATE_LIMIT_MIN_STEP: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidSettings {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub setpoint: f64,
    pub min_output: f64,
    pub max_output: f64,
    /// Limit each step to ±ratio × |previous output|
    pub max_change_ratio: Option<f64>,
}

/// One evaluation of the loop, all in kW.
///
/// `p + i + d` always equals `unclamped`; `output` is that sum after the
/// rate limiter and the output bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PidTerms {
    pub error: f64,
    pub p: f64,
    pub i: f64,
    pub d: f64,
    pub unclamped: f64,
    pub output: f64,
}

/// PID with integral rollback anti-windup and an optional rate limiter.
///
/// The first update only seeds the clock and returns a zero output.
#[derive(Debug, Clone)]
pub struct PidController {
    settings: PidSettings,
    integral: f64,
    last_error: f64,
    last_time: Option<Instant>,
    last_output: f64,
}

impl PidController {
    pub fn new(settings: PidSettings) -> Self {
        Self {
            settings,
            integral: 0.0,
            last_error: 0.0,
            last_time: None,
            last_output: 0.0,
        }
    }

    pub fn settings(&self) -> &PidSettings {
        &self.settings
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn last_output(&self) -> f64 {
        self.last_output
    }

    pub fn is_seeded(&self) -> bool {
        self.last_time.is_some()
    }

    /// Forget all history; the next update seeds again
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = 0.0;
        self.last_time = None;
        self.last_output = 0.0;
    }

    pub fn update(&mut self, measured: f64) -> PidTerms {
        self.update_at(measured, Instant::now())
    }

    pub fn update_at(&mut self, measured: f64, now: Instant) -> PidTerms {
        let s = self.settings;
        let error = measured - s.setpoint;

        let Some(last_time) = self.last_time else {
            self.last_time = Some(now);
            self.last_error = error;
            self.last_output = 0.0;
            return PidTerms {
                error,
                ..PidTerms::default()
            };
        };

        let dt = now.saturating_duration_since(last_time).as_secs_f64();
        self.integral += error * dt;
        let derivative = if dt > 0.0 {
            (error - self.last_error) / dt
        } else {
            0.0
        };

        let p = s.kp * error;
        let i = s.ki * self.integral;
        let d = s.kd * derivative;
        let unclamped = p + i + d;
        let mut output = unclamped;

        // Saturated: undo this step's accumulation so the integral cannot wind up
        if output > s.max_output || output < s.min_output {
            self.integral -= error * dt;
        }

        if let Some(ratio) = s.max_change_ratio {
            let max_change = if self.last_output.abs() < RATE_LIMIT_NEAR_ZERO {
                RATE_LIMIT_MIN_STEP
            } else {
                self.last_output.abs() * ratio
            };
            output = output.clamp(self.last_output - max_change, self.last_output + max_change);
        }

        output = output.clamp(s.min_output, s.max_output);

        self.last_error = error;
        self.last_time = Some(now);
        self.last_output = output;

        PidTerms {
            error,
            p,
            i,
            d,
            unclamped,
            output,
        }
    }
}
