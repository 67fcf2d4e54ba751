//! Model formulas over profile metadata.

use crate::error::{PbError, Result};
use serde::{Deserialize, Serialize};

/// A term in a formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Term {
    /// Main effect of a variable.
    Main(String),
    /// Interaction between two variables.
    Interaction(String, String),
}

impl Term {
    /// Variable names involved in this term.
    pub fn variables(&self) -> Vec<&str> {
        match self {
            Term::Main(v) => vec![v.as_str()],
            Term::Interaction(v1, v2) => vec![v1.as_str(), v2.as_str()],
        }
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Term::Main(v) => write!(f, "{}", v),
            Term::Interaction(v1, v2) => write!(f, "{}:{}", v1, v2),
        }
    }
}

/// A parsed right-hand-side formula.
///
/// Supported syntax:
/// - `~ disease` intercept + disease
/// - `~ disease + batch` additive covariates
/// - `~ disease * subset` main effects plus `disease:subset`
/// - `~ 0 + severity_subset` cell-means coding without intercept
/// - `~ severity_subset - 1` same as above
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Formula {
    pub intercept: bool,
    /// Terms excluding the intercept, in first-mention order.
    pub terms: Vec<Term>,
    pub formula_str: String,
}

fn check_name(name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(name.to_string())
    } else {
        Err(PbError::FormulaParse(format!("Invalid variable name '{}'", name)))
    }
}

fn push_unique(terms: &mut Vec<Term>, term: Term) {
    if !terms.contains(&term) {
        terms.push(term);
    }
}

impl Formula {
    /// Parse a formula string.
    ///
    /// # Examples
    /// ```
    /// use pseudobulk_de::data::Formula;
    /// let f = Formula::parse("~ disease + batch").unwrap();
    /// assert!(f.intercept);
    /// assert_eq!(f.terms.len(), 2);
    /// ```
    pub fn parse(formula: &str) -> Result<Self> {
        let formula_str = formula.to_string();
        let rhs = formula
            .trim()
            .strip_prefix('~')
            .ok_or_else(|| PbError::FormulaParse("Formula must start with '~'".to_string()))?
            .trim();
        if rhs.is_empty() {
            return Err(PbError::FormulaParse(
                "Formula right-hand side is empty".to_string(),
            ));
        }

        let mut intercept = true;
        let mut terms = Vec::new();

        // Split on '+' and '-' keeping the sign of each piece
        let mut pieces: Vec<(bool, String)> = Vec::new();
        let mut current = String::new();
        let mut negative = false;
        for ch in rhs.chars() {
            if ch == '+' || ch == '-' {
                pieces.push((negative, current.trim().to_string()));
                current.clear();
                negative = ch == '-';
            } else {
                current.push(ch);
            }
        }
        pieces.push((negative, current.trim().to_string()));

        for (idx, (negative, piece)) in pieces.into_iter().enumerate() {
            if piece.is_empty() {
                // A leading sign produces an empty first piece
                if idx == 0 {
                    continue;
                }
                return Err(PbError::FormulaParse(format!(
                    "Dangling operator in '{}'",
                    formula_str
                )));
            }
            if negative {
                if piece == "1" {
                    intercept = false;
                    continue;
                }
                return Err(PbError::FormulaParse(format!(
                    "Only the intercept can be removed, found '- {}'",
                    piece
                )));
            }
            match piece.as_str() {
                "0" => intercept = false,
                "1" => {}
                _ if piece.contains('*') => {
                    let parts: Vec<&str> = piece.split('*').map(str::trim).collect();
                    if parts.len() != 2 {
                        return Err(PbError::FormulaParse(format!(
                            "Invalid interaction term: {}",
                            piece
                        )));
                    }
                    let v1 = check_name(parts[0])?;
                    let v2 = check_name(parts[1])?;
                    push_unique(&mut terms, Term::Main(v1.clone()));
                    push_unique(&mut terms, Term::Main(v2.clone()));
                    push_unique(&mut terms, Term::Interaction(v1, v2));
                }
                _ if piece.contains(':') => {
                    let parts: Vec<&str> = piece.split(':').map(str::trim).collect();
                    if parts.len() != 2 {
                        return Err(PbError::FormulaParse(format!(
                            "Invalid interaction term: {}",
                            piece
                        )));
                    }
                    push_unique(
                        &mut terms,
                        Term::Interaction(check_name(parts[0])?, check_name(parts[1])?),
                    );
                }
                _ => push_unique(&mut terms, Term::Main(check_name(&piece)?)),
            }
        }

        if terms.is_empty() && !intercept {
            return Err(PbError::FormulaParse(
                "Formula must have at least one term".to_string(),
            ));
        }

        Ok(Self {
            intercept,
            terms,
            formula_str,
        })
    }

    /// All variable names used in the formula, sorted and deduplicated.
    pub fn variables(&self) -> Vec<&str> {
        let mut vars: Vec<&str> = self.terms.iter().flat_map(|t| t.variables()).collect();
        vars.sort();
        vars.dedup();
        vars
    }
}

impl std::fmt::Display for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "~ ")?;
        if !self.intercept {
            write!(f, "0 + ")?;
        }
        let term_strs: Vec<String> = self.terms.iter().map(|t| t.to_string()).collect();
        if term_strs.is_empty() {
            write!(f, "1")
        } else {
            write!(f, "{}", term_strs.join(" + "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_additive_covariates() {
        let f = Formula::parse("~ disease + batch").unwrap();
        assert!(f.intercept);
        assert_eq!(
            f.terms,
            vec![Term::Main("disease".into()), Term::Main("batch".into())]
        );
    }

    #[test]
    fn test_parse_cell_means() {
        let f = Formula::parse("~ 0 + severity_subset").unwrap();
        assert!(!f.intercept);
        assert_eq!(f.terms, vec![Term::Main("severity_subset".into())]);

        let g = Formula::parse("~ severity_subset - 1").unwrap();
        assert!(!g.intercept);
        assert_eq!(g.terms, f.terms);
    }

    #[test]
    fn test_parse_star_expansion() {
        let f = Formula::parse("~ disease * subset").unwrap();
        assert_eq!(f.terms.len(), 3);
        assert!(f.terms.contains(&Term::Interaction("disease".into(), "subset".into())));
    }

    #[test]
    fn test_intercept_only_and_variables() {
        let f = Formula::parse("~ 1").unwrap();
        assert!(f.intercept);
        assert!(f.terms.is_empty());

        let g = Formula::parse("~ donor + disease + disease:donor").unwrap();
        assert_eq!(g.variables(), vec!["disease", "donor"]);
    }

    #[test]
    fn test_invalid_formula() {
        assert!(Formula::parse("disease").is_err());
        assert!(Formula::parse("~").is_err());
        assert!(Formula::parse("~ 0").is_err());
        assert!(Formula::parse("~ disease - batch").is_err());
        assert!(Formula::parse("~ disease + ").is_err());
        assert!(Formula::parse("~ a$b").is_err());
    }
}
