//! Outcome likelihoods accepted by a scan.

use crate::error::QtlError;
use crate::solver::Family;
use ndarray::{Array1, ArrayView2};

/// A likelihood as the caller names it, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum LikelihoodDescriptor {
    Name(String),
    WithTrials(String, Vec<f64>),
}

impl From<&str> for LikelihoodDescriptor {
    fn from(name: &str) -> Self {
        LikelihoodDescriptor::Name(name.to_string())
    }
}

impl From<String> for LikelihoodDescriptor {
    fn from(name: String) -> Self {
        LikelihoodDescriptor::Name(name)
    }
}

impl From<(&str, Vec<u64>)> for LikelihoodDescriptor {
    fn from((name, trials): (&str, Vec<u64>)) -> Self {
        LikelihoodDescriptor::WithTrials(
            name.to_string(),
            trials.into_iter().map(|t| t as f64).collect(),
        )
    }
}

impl From<(&str, Vec<f64>)> for LikelihoodDescriptor {
    fn from((name, trials): (&str, Vec<f64>)) -> Self {
        LikelihoodDescriptor::WithTrials(name.to_string(), trials)
    }
}

impl From<(&str, Array1<f64>)> for LikelihoodDescriptor {
    fn from((name, trials): (&str, Array1<f64>)) -> Self {
        LikelihoodDescriptor::WithTrials(name.to_string(), trials.to_vec())
    }
}

/// A validated outcome likelihood.
#[derive(Debug, Clone, PartialEq)]
pub enum Likelihood {
    Normal,
    Bernoulli,
    Probit,
    /// Per-sample number of trials, in the phenotype's row order.
    Binomial { trials: Array1<f64> },
    Poisson,
}

impl Likelihood {
    pub fn name(&self) -> &'static str {
        match self {
            Likelihood::Normal => "normal",
            Likelihood::Bernoulli => "bernoulli",
            Likelihood::Probit => "probit",
            Likelihood::Binomial { .. } => "binomial",
            Likelihood::Poisson => "poisson",
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, Likelihood::Normal)
    }

    /// GLMM family for non-normal likelihoods.
    pub fn family(&self) -> Option<Family> {
        match self {
            Likelihood::Normal => None,
            Likelihood::Bernoulli => Some(Family::Bernoulli),
            Likelihood::Probit => Some(Family::Probit),
            Likelihood::Binomial { trials } => Some(Family::Binomial {
                trials: trials.clone(),
            }),
            Likelihood::Poisson => Some(Family::Poisson),
        }
    }

    /// Reorders per-sample trials to follow conformed samples; `origin[i]` is
    /// the original phenotype row of sample `i`.
    pub fn aligned(&self, origin: &[usize]) -> Likelihood {
        match self {
            Likelihood::Binomial { trials } => Likelihood::Binomial {
                trials: origin.iter().map(|&row| trials[row]).collect(),
            },
            other => other.clone(),
        }
    }

    /// Checks that aligned outcomes lie in the likelihood's support.
    pub fn validate_outcome(&self, y: ArrayView2<f64>) -> Result<(), QtlError> {
        match self {
            Likelihood::Normal => Ok(()),
            Likelihood::Bernoulli | Likelihood::Probit => {
                if y.iter().all(|&v| v == 0.0 || v == 1.0) {
                    Ok(())
                } else {
                    Err(QtlError::InvalidOutcome(format!(
                        "{} outcomes must be 0 or 1",
                        self.name()
                    )))
                }
            }
            Likelihood::Poisson => {
                if y.iter().all(|&v| v >= 0.0) {
                    Ok(())
                } else {
                    Err(QtlError::InvalidOutcome(
                        "poisson outcomes must be non-negative counts".to_string(),
                    ))
                }
            }
            Likelihood::Binomial { trials } => {
                if trials.len() != y.nrows() {
                    return Err(QtlError::ShapeOrLabelMismatch(format!(
                        "{} binomial trials were given for {} samples",
                        trials.len(),
                        y.nrows()
                    )));
                }
                let within = y
                    .rows()
                    .into_iter()
                    .zip(trials.iter())
                    .all(|(row, &n)| row.iter().all(|&v| v >= 0.0 && v <= n));
                if within {
                    Ok(())
                } else {
                    Err(QtlError::InvalidOutcome(
                        "binomial outcomes must lie between 0 and the number of trials".to_string(),
                    ))
                }
            }
        }
    }
}

/// Turns a descriptor into a validated [`Likelihood`]; `nrows` is the number of
/// phenotype rows the trials must match.
pub fn normalize_likelihood(
    descriptor: &LikelihoodDescriptor,
    nrows: usize,
) -> Result<Likelihood, QtlError> {
    match descriptor {
        LikelihoodDescriptor::Name(name) => match name.to_lowercase().as_str() {
            "normal" => Ok(Likelihood::Normal),
            "bernoulli" => Ok(Likelihood::Bernoulli),
            "probit" => Ok(Likelihood::Probit),
            "poisson" => Ok(Likelihood::Poisson),
            "binomial" => Err(QtlError::UnknownLikelihood(
                "the binomial likelihood requires the number of trials".to_string(),
            )),
            other => Err(QtlError::UnknownLikelihood(format!("'{other}'"))),
        },
        LikelihoodDescriptor::WithTrials(name, trials) => {
            let name = name.to_lowercase();
            if name != "binomial" {
                return Err(QtlError::UnknownLikelihood(format!(
                    "'{name}' does not take a number of trials"
                )));
            }
            if trials.len() != nrows {
                return Err(QtlError::ShapeOrLabelMismatch(format!(
                    "{} binomial trials were given for {nrows} phenotype rows",
                    trials.len()
                )));
            }
            if trials.iter().any(|&t| !(t > 0.0) || !t.is_finite()) {
                return Err(QtlError::InvalidOutcome(
                    "the number of binomial trials must be positive".to_string(),
                ));
            }
            Ok(Likelihood::Binomial {
                trials: Array1::from(trials.clone()),
            })
        }
    }
}
