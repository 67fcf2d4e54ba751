//! Named linear contrasts over design coefficients.

use crate::data::DesignMatrix;
use crate::error::{PbError, Result};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// A named linear combination of design coefficients.
///
/// Built either from an expression such as
/// `(severe_DC3 - severe_DC2) - (healthy_DC3 - healthy_DC2)` or from an
/// explicit weight vector. Weights are only checked against a design by
/// [`Contrast::to_vector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contrast {
    pub name: String,
    pub expression: String,
    /// Coefficient name and weight, in first-mention order.
    weights: Vec<(String, f64)>,
    /// Explicit positional weights, when given instead of an expression.
    positional: Option<Vec<f64>>,
}

impl Contrast {
    /// Parse a contrast expression.
    ///
    /// Grammar: `expr := term (('+'|'-') term)*`,
    /// `term := [number '*'] factor`, `factor := name | '(' expr ')' | '-' factor`.
    /// `(Intercept)` is accepted as a name.
    pub fn parse(name: &str, expression: &str) -> Result<Self> {
        let mut parser = Parser::new(expression);
        let mut weights = Vec::new();
        parser.expr(1.0, &mut weights)?;
        parser.skip_ws();
        if parser.pos < parser.chars.len() {
            return Err(PbError::ContrastParse(format!(
                "unexpected '{}' at position {} in '{}'",
                parser.chars[parser.pos], parser.pos, expression
            )));
        }
        Ok(Self {
            name: name.to_string(),
            expression: expression.to_string(),
            weights,
            positional: None,
        })
    }

    /// Contrast given as one weight per design coefficient.
    pub fn from_vector(name: &str, weights: Vec<f64>) -> Self {
        let expression = format!("{:?}", weights);
        Self {
            name: name.to_string(),
            expression,
            weights: Vec::new(),
            positional: Some(weights),
        }
    }

    /// Named weights, with terms mentioned more than once already combined.
    pub fn weights(&self) -> &[(String, f64)] {
        &self.weights
    }

    fn invalid(&self, reason: String) -> PbError {
        PbError::InvalidContrast {
            contrast: self.name.clone(),
            reason,
        }
    }

    /// Resolve against a design, yielding one weight per coefficient.
    ///
    /// Unknown coefficient names, a length mismatch for positional weights,
    /// and an all-zero result are `InvalidContrast` errors.
    pub fn to_vector(&self, design: &DesignMatrix) -> Result<DVector<f64>> {
        let n_coef = design.n_coefficients();
        let vector = match &self.positional {
            Some(values) => {
                if values.len() != n_coef {
                    return Err(self.invalid(format!(
                        "{} weights for {} coefficients",
                        values.len(),
                        n_coef
                    )));
                }
                DVector::from_column_slice(values)
            }
            None => {
                let unknown: Vec<&str> = self
                    .weights
                    .iter()
                    .filter(|(n, _)| design.coefficient_index(n).is_none())
                    .map(|(n, _)| n.as_str())
                    .collect();
                if !unknown.is_empty() {
                    return Err(self.invalid(format!(
                        "unknown coefficient(s) {}; design has: {}",
                        unknown.join(", "),
                        design.coefficient_names().join(", ")
                    )));
                }
                let mut v = DVector::zeros(n_coef);
                for (n, w) in &self.weights {
                    if let Some(idx) = design.coefficient_index(n) {
                        v[idx] += w;
                    }
                }
                v
            }
        };
        if vector.iter().all(|w| w.abs() < 1e-12) {
            return Err(self.invalid("contrast has all-zero weights".to_string()));
        }
        Ok(vector)
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.get(self.pos).copied()
    }

    fn error(&self, msg: &str) -> PbError {
        let text: String = self.chars.iter().collect();
        PbError::ContrastParse(format!("{} at position {} in '{}'", msg, self.pos, text))
    }

    fn expr(&mut self, scale: f64, out: &mut Vec<(String, f64)>) -> Result<()> {
        self.term(scale, out)?;
        loop {
            match self.peek() {
                Some('+') => {
                    self.pos += 1;
                    self.term(scale, out)?;
                }
                Some('-') => {
                    self.pos += 1;
                    self.term(-scale, out)?;
                }
                _ => return Ok(()),
            }
        }
    }

    fn term(&mut self, scale: f64, out: &mut Vec<(String, f64)>) -> Result<()> {
        let scale = match self.peek() {
            Some(c) if c.is_ascii_digit() || c == '.' => {
                let coef = self.number()?;
                if self.peek() != Some('*') {
                    return Err(self.error("expected '*' after number"));
                }
                self.pos += 1;
                scale * coef
            }
            _ => scale,
        };
        self.factor(scale, out)
    }

    fn factor(&mut self, scale: f64, out: &mut Vec<(String, f64)>) -> Result<()> {
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                self.factor(-scale, out)
            }
            Some('(') if !self.at_intercept() => {
                self.pos += 1;
                self.expr(scale, out)?;
                if self.peek() != Some(')') {
                    return Err(self.error("expected ')'"));
                }
                self.pos += 1;
                Ok(())
            }
            Some(_) => {
                let name = self.name()?;
                match out.iter_mut().find(|(n, _)| *n == name) {
                    Some(entry) => entry.1 += scale,
                    None => out.push((name, scale)),
                }
                Ok(())
            }
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn at_intercept(&self) -> bool {
        let rest: String = self.chars[self.pos..].iter().take(11).collect();
        rest == "(Intercept)"
    }

    fn name(&mut self) -> Result<String> {
        if self.at_intercept() {
            self.pos += 11;
            return Ok("(Intercept)".to_string());
        }
        let start = self.pos;
        while self.pos < self.chars.len() {
            let c = self.chars[self.pos];
            if c.is_alphanumeric() || c == '_' || c == '.' || c == ':' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.error("expected coefficient name"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn number(&mut self) -> Result<f64> {
        let start = self.pos;
        while self.pos < self.chars.len()
            && (self.chars[self.pos].is_ascii_digit() || self.chars[self.pos] == '.')
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map_err(|_| self.error(&format!("invalid number '{}'", text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn cell_means_design() -> DesignMatrix {
        let names: Vec<String> = ["healthy_DC2", "healthy_DC3", "severe_DC2", "severe_DC3"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let samples: Vec<String> = (0..8).map(|i| format!("p{}", i)).collect();
        let x = DMatrix::from_fn(8, 4, |r, c| if r / 2 == c { 1.0 } else { 0.0 });
        DesignMatrix::from_matrix(x, names, samples).unwrap()
    }

    #[test]
    fn test_single_coefficient() {
        let c = Contrast::parse("covid_vs_healthy", "diseasecovid").unwrap();
        assert_eq!(c.weights(), &[("diseasecovid".to_string(), 1.0)]);
    }

    #[test]
    fn test_difference_of_differences() {
        let c = Contrast::parse(
            "interaction",
            "(severe_DC3 - severe_DC2) - (healthy_DC3 - healthy_DC2)",
        )
        .unwrap();
        let v = c.to_vector(&cell_means_design()).unwrap();
        assert_eq!(v.as_slice(), &[1.0, -1.0, -1.0, 1.0]);
    }

    #[test]
    fn test_scaled_average() {
        let c = Contrast::parse("avg", "0.5*severe_DC3 + 0.5*severe_DC2 - healthy_DC2").unwrap();
        let v = c.to_vector(&cell_means_design()).unwrap();
        assert_relative_eq!(v[0], -1.0);
        assert_relative_eq!(v[2], 0.5);
        assert_relative_eq!(v[3], 0.5);
    }

    #[test]
    fn test_intercept_name() {
        let c = Contrast::parse("i", "(Intercept) + -groupB").unwrap();
        assert_eq!(
            c.weights(),
            &[("(Intercept)".to_string(), 1.0), ("groupB".to_string(), -1.0)]
        );
    }

    #[test]
    fn test_unknown_name_is_invalid_contrast() {
        let c = Contrast::parse("bad", "severe_DC9 - severe_DC2").unwrap();
        let err = c.to_vector(&cell_means_design()).unwrap_err();
        assert_eq!(err.reason_code(), "INVALID_CONTRAST");
        assert!(err.to_string().contains("severe_DC9"));
    }

    #[test]
    fn test_zero_and_length_mismatch() {
        let c = Contrast::parse("zero", "severe_DC2 - severe_DC2").unwrap();
        assert!(matches!(
            c.to_vector(&cell_means_design()),
            Err(PbError::InvalidContrast { .. })
        ));
        let v = Contrast::from_vector("short", vec![1.0, -1.0]);
        assert!(matches!(
            v.to_vector(&cell_means_design()),
            Err(PbError::InvalidContrast { .. })
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Contrast::parse("x", "a - (b").is_err());
        assert!(Contrast::parse("x", "a -").is_err());
        assert!(Contrast::parse("x", "2 a").is_err());
        assert!(Contrast::parse("x", "a b").is_err());
    }
}
