//! Interactive calibration prompts on the terminal.

use std::io::{self, BufRead, Write};

use irrigator_config::{MassUnit, ScaleKey};
use irrigator_core::{CalibrationProvider, IrrigationError};

/// Asks the operator to empty each scale, then to load it and type the mass.
pub struct ConsoleProvider<R, W> {
    input: R,
    output: W,
    unit: &'static str,
}

impl ConsoleProvider<io::StdinLock<'static>, io::Stderr> {
    pub fn stdio(unit: MassUnit) -> Self {
        Self::new(io::stdin().lock(), io::stderr(), unit)
    }
}

impl<R: BufRead, W: Write> ConsoleProvider<R, W> {
    pub fn new(input: R, output: W, unit: MassUnit) -> Self {
        let unit = match unit {
            MassUnit::G => "g",
            MassUnit::Kg => "kg",
        };
        Self {
            input,
            output,
            unit,
        }
    }

    fn say(&mut self, msg: &str) -> Result<(), IrrigationError> {
        write!(self.output, "{msg}")
            .and_then(|()| self.output.flush())
            .map_err(|e| IrrigationError::Io(format!("prompt: {e}")))
    }

    fn line(&mut self) -> Result<String, IrrigationError> {
        let mut buf = String::new();
        let n = self
            .input
            .read_line(&mut buf)
            .map_err(|e| IrrigationError::Io(format!("operator input: {e}")))?;
        if n == 0 {
            return Err(IrrigationError::Io("operator input closed".into()));
        }
        Ok(buf.trim().to_string())
    }
}

impl<R: BufRead, W: Write> CalibrationProvider for ConsoleProvider<R, W> {
    fn prepare_zero(&mut self, key: ScaleKey) -> Result<(), IrrigationError> {
        self.say(&format!("Remove all mass from scale {key}, then press Enter: "))?;
        self.line().map(drop)
    }

    fn reference_mass(&mut self, key: ScaleKey) -> Result<f64, IrrigationError> {
        loop {
            let unit = self.unit;
            self.say(&format!("Put a known mass on scale {key}. Mass in {unit}? "))?;
            let answer = self.line()?;
            match answer.parse::<f64>() {
                Ok(m) if m.is_finite() && m > 0.0 => return Ok(m),
                _ => self.say(&format!("Not a positive number: {answer:?}\n"))?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn key() -> ScaleKey {
        "0x70-2".parse().unwrap()
    }

    #[test]
    fn reprompts_until_a_positive_mass() {
        let input = Cursor::new("\nabc\n-1\n0.5\n");
        let mut out = Vec::new();
        let mut p = ConsoleProvider::new(input, &mut out, MassUnit::Kg);
        p.prepare_zero(key()).unwrap();
        assert_eq!(p.reference_mass(key()).unwrap(), 0.5);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Remove all mass from scale 0x70-2"));
        assert_eq!(text.matches("Mass in kg?").count(), 3);
    }

    #[test]
    fn closed_input_is_an_error() {
        let mut p = ConsoleProvider::new(Cursor::new(""), Vec::new(), MassUnit::G);
        assert!(matches!(p.prepare_zero(key()), Err(IrrigationError::Io(_))));
        assert!(matches!(p.reference_mass(key()), Err(IrrigationError::Io(_))));
    }
}
