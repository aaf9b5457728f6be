//! Four-function calculator.
//!
//! [`Calculator`] is the key-press state machine of a pocket calculator:
//! operators chain left to right (`2+3*4=` is 20), `=` applies the pending
//! operator, `C` clears. Division by zero shows `Error` until the next key.
//!
//! [`CalculatorApp`] feeds every byte of a request on [`tags::CALCULATOR`]
//! through the machine and replies with the display.

use std::time::Duration;

use mmos_core::{App, AppContext, AppManifest, Endpoint};
use serde::{Deserialize, Serialize};

use crate::tags;

pub(crate) fn manifest() -> AppManifest {
    AppManifest::new(crate::CALCULATOR, "Calculator")
        .with_description("Basic arithmetic calculator with a simple interface")
}

/// Arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    /// `+`
    Add,
    /// `-`
    Subtract,
    /// `*` or `×`
    Multiply,
    /// `/` or `÷`
    Divide,
}

impl Operator {
    fn apply(self, lhs: f64, rhs: f64) -> Option<f64> {
        match self {
            Self::Add => Some(lhs + rhs),
            Self::Subtract => Some(lhs - rhs),
            Self::Multiply => Some(lhs * rhs),
            Self::Divide if rhs == 0.0 => None,
            Self::Divide => Some(lhs / rhs),
        }
    }
}

/// One calculator key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    /// `0`..=`9`
    Digit(u8),
    /// `.`
    Decimal,
    /// An operator key
    Operator(Operator),
    /// `=`
    Equals,
    /// `C`
    Clear,
}

impl Key {
    /// Key for a typed character. Whitespace and unknown characters map to
    /// `None`.
    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            '0'..='9' => Self::Digit(c as u8 - b'0'),
            '.' => Self::Decimal,
            '+' => Self::Operator(Operator::Add),
            '-' => Self::Operator(Operator::Subtract),
            '*' | '×' | 'x' => Self::Operator(Operator::Multiply),
            '/' | '÷' => Self::Operator(Operator::Divide),
            '=' => Self::Equals,
            'C' | 'c' => Self::Clear,
            _ => return None,
        })
    }
}

/// Calculator state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calculator {
    display: String,
    accumulator: f64,
    pending: Option<Operator>,
    fresh: bool,
}

impl Default for Calculator {
    fn default() -> Self {
        Self { display: "0".to_string(), accumulator: 0.0, pending: None, fresh: true }
    }
}

impl Calculator {
    /// Cleared calculator showing `0`.
    pub fn new() -> Self {
        Self::default()
    }

    /// What the display shows.
    pub fn display(&self) -> &str {
        &self.display
    }

    /// Press one key.
    pub fn press(&mut self, key: Key) {
        match key {
            Key::Clear => *self = Self::default(),
            Key::Digit(d) => {
                let digit = char::from(b'0' + d.min(9));
                if self.fresh || self.display == "0" || self.display == "Error" {
                    self.display = digit.to_string();
                } else {
                    self.display.push(digit);
                }
                self.fresh = false;
            },
            Key::Decimal => {
                if self.fresh || self.display == "Error" {
                    self.display = "0.".to_string();
                } else if !self.display.contains('.') {
                    self.display.push('.');
                }
                self.fresh = false;
            },
            Key::Operator(op) => {
                if self.pending.is_some() && !self.fresh {
                    self.evaluate();
                }
                if self.display != "Error" {
                    self.accumulator = self.value();
                    self.pending = Some(op);
                }
                self.fresh = true;
            },
            Key::Equals => self.evaluate(),
        }
    }

    /// Press every key in `input`, skipping characters that are not keys.
    pub fn type_str(&mut self, input: &str) {
        for key in input.chars().filter_map(Key::from_char) {
            self.press(key);
        }
    }

    fn value(&self) -> f64 {
        self.display.parse().unwrap_or(0.0)
    }

    fn evaluate(&mut self) {
        let Some(op) = self.pending.take() else {
            return;
        };

        match op.apply(self.accumulator, self.value()) {
            Some(result) => {
                self.accumulator = result;
                self.display = format_number(result);
            },
            None => {
                self.accumulator = 0.0;
                self.display = "Error".to_string();
            },
        }
        self.fresh = true;
    }
}

/// Whole numbers print without a fraction.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Calculator app.
#[derive(Debug, Default)]
pub struct CalculatorApp {
    endpoint: Option<Endpoint>,
    calculator: Calculator,
}

impl App for CalculatorApp {
    fn on_start(&mut self, ctx: &mut AppContext<'_>) {
        self.endpoint = crate::open(ctx, tags::CALCULATOR);
    }

    fn on_tick(&mut self, ctx: &mut AppContext<'_>, _elapsed: Duration) {
        let Some(endpoint) = self.endpoint else { return };
        for request in crate::drain(ctx, &endpoint) {
            self.calculator.type_str(&String::from_utf8_lossy(request.payload()));
            let display = self.calculator.display().to_string();
            crate::answer(ctx, &endpoint, &request, display);
        }
    }

    fn save_state(&self) -> Option<serde_json::Value> {
        serde_json::to_value(&self.calculator).ok()
    }

    fn restore_state(&mut self, state: &serde_json::Value) {
        match Calculator::deserialize(state) {
            Ok(calculator) => self.calculator = calculator,
            Err(error) => tracing::warn!(%error, "ignoring unreadable calculator state"),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::testing::Device;

    fn run(input: &str) -> String {
        let mut calc = Calculator::new();
        calc.type_str(input);
        calc.display().to_string()
    }

    #[test]
    fn arithmetic() {
        assert_eq!(run("12+30="), "42");
        assert_eq!(run("7-10="), "-3");
        assert_eq!(run("6×7="), "42");
        assert_eq!(run("1/4="), "0.25");
        assert_eq!(run("1.5*2="), "3");
    }

    #[test]
    fn operators_chain_left_to_right() {
        assert_eq!(run("2+3*4="), "20");
        assert_eq!(run("2+3*"), "5");
    }

    #[test]
    fn division_by_zero_shows_error_until_next_entry() {
        assert_eq!(run("5/0="), "Error");
        assert_eq!(run("5/0=7"), "7");
        assert_eq!(run("5/0=C"), "0");
    }

    #[test]
    fn decimal_point_once() {
        assert_eq!(run("1..2"), "1.2");
        assert_eq!(run(".5"), "0.5");
        assert_eq!(run("00"), "0");
    }

    #[test]
    fn equals_without_operator_keeps_display() {
        assert_eq!(run("9="), "9");
        assert_eq!(run("="), "0");
    }

    #[test]
    fn app_replies_with_display_and_keeps_state() {
        let mut device = Device::boot(None);
        device.kernel.launch(crate::CALCULATOR).unwrap();

        assert_eq!(device.request(tags::CALCULATOR, "12+"), ["12"]);
        assert_eq!(device.request(tags::CALCULATOR, "30="), ["42"]);

        let events = device.kernel.go_back().unwrap();
        assert!(matches!(
            &events[0],
            mmos_core::LifecycleEvent::Stopped { saved_state: Some(_), .. }
        ));

        device.kernel.launch(crate::CALCULATOR).unwrap();
        assert_eq!(device.request(tags::CALCULATOR, "+1="), ["43"]);
    }

    proptest! {
        #[test]
        fn addition_matches_integers(a in 0u32..100_000, b in 0u32..100_000) {
            prop_assert_eq!(run(&format!("{a}+{b}=")), (u64::from(a) + u64::from(b)).to_string());
        }

        #[test]
        fn any_input_leaves_a_readable_display(input in "[0-9+*/=.C-]{0,32}") {
            let display = run(&input);
            prop_assert!(display == "Error" || display.parse::<f64>().is_ok(), "{}", display);
        }
    }
}
