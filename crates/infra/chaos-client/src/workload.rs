//! Transaction mix driven against the chaos chaincode.

use std::{fmt, path::Path, str::FromStr};

use eyre::WrapErr;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a transaction is ordered or only evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Endorsed, ordered and committed.
    #[serde(rename = "submit")]
    Submit,
    /// Evaluated against a peer, never ordered.
    #[serde(rename = "eval", alias = "evaluate")]
    Evaluate,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submit => f.write_str("submit"),
            Self::Evaluate => f.write_str("eval"),
        }
    }
}

/// One transaction to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDescriptor {
    /// Submit or evaluate.
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    /// Chaincode function name.
    pub name: String,
    /// Function arguments.
    #[serde(rename = "params", default)]
    pub args: Vec<String>,
}

impl TransactionDescriptor {
    /// Creates a submit descriptor.
    pub fn submit(name: impl Into<String>, args: &[&str]) -> Self {
        Self {
            kind: TransactionKind::Submit,
            name: name.into(),
            args: args.iter().map(|arg| (*arg).to_owned()).collect(),
        }
    }

    /// Creates an evaluate descriptor.
    pub fn evaluate(name: impl Into<String>, args: &[&str]) -> Self {
        Self { kind: TransactionKind::Evaluate, ..Self::submit(name, args) }
    }
}

impl fmt::Display for TransactionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.name, self.args)
    }
}

/// Which transactions the driver picks from the workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionType {
    /// Any descriptor.
    #[default]
    Random,
    /// Submit descriptors only.
    Submit,
    /// Evaluate descriptors only.
    Eval,
}

impl TransactionType {
    const fn admits(self, kind: TransactionKind) -> bool {
        match self {
            Self::Random => true,
            Self::Submit => matches!(kind, TransactionKind::Submit),
            Self::Eval => matches!(kind, TransactionKind::Evaluate),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Random => f.write_str("random"),
            Self::Submit => f.write_str("submit"),
            Self::Eval => f.write_str("eval"),
        }
    }
}

impl FromStr for TransactionType {
    type Err = WorkloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "submit" => Ok(Self::Submit),
            "eval" | "evaluate" => Ok(Self::Eval),
            _ => Err(WorkloadError::UnknownType(s.to_owned())),
        }
    }
}

/// Errors building a workload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkloadError {
    /// The workload has no descriptors.
    #[error("workload contains no transactions")]
    Empty,
    /// Filtering by type left nothing to run.
    #[error("workload contains no {0} transactions")]
    NoneOfType(TransactionType),
    /// Unrecognised transaction type name.
    #[error("unknown transaction type {0:?}, expected random, submit or eval")]
    UnknownType(String),
}

/// A non-empty set of transaction descriptors to pick from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    descriptors: Vec<TransactionDescriptor>,
}

impl Workload {
    /// Creates a workload, rejecting an empty descriptor list.
    pub fn new(descriptors: Vec<TransactionDescriptor>) -> Result<Self, WorkloadError> {
        if descriptors.is_empty() {
            return Err(WorkloadError::Empty);
        }
        Ok(Self { descriptors })
    }

    /// The standard chaos chaincode mix.
    pub fn chaos_default() -> Self {
        Self {
            descriptors: vec![
                // add or update assets 1 to 2000
                TransactionDescriptor::submit("addUpdateAssets", &["1", "2000"]),
                // read state for ids 1 to 2000
                TransactionDescriptor::evaluate("longRunningEvaluate", &["1", "2000"]),
                // query all assets, repeated 1000 times
                TransactionDescriptor::evaluate("longRunningQuery", &["1000"]),
                TransactionDescriptor::submit("createUpdateChaosAsset", &["cd1", "99"]),
                TransactionDescriptor::evaluate("readChaosAsset", &["cd1"]),
            ],
        }
    }

    /// Loads a workload from a JSON array of descriptors.
    pub fn from_file(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read workload file {}", path.display()))?;
        let descriptors: Vec<TransactionDescriptor> = serde_json::from_str(&data)
            .wrap_err_with(|| format!("failed to parse workload file {}", path.display()))?;
        Ok(Self::new(descriptors)?)
    }

    /// Returns the descriptors admitted by `ty`.
    pub fn select(&self, ty: TransactionType) -> Result<Self, WorkloadError> {
        let descriptors: Vec<_> =
            self.descriptors.iter().filter(|d| ty.admits(d.kind)).cloned().collect();
        if descriptors.is_empty() {
            return Err(WorkloadError::NoneOfType(ty));
        }
        Ok(Self { descriptors })
    }

    /// Picks a descriptor uniformly at random.
    pub fn pick(&self) -> &TransactionDescriptor {
        let index = rand::rng().random_range(0..self.descriptors.len());
        &self.descriptors[index]
    }

    /// All descriptors in the workload.
    pub fn descriptors(&self) -> &[TransactionDescriptor] {
        &self.descriptors
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn default_mix_has_both_kinds() {
        let workload = Workload::chaos_default();
        assert_eq!(workload.descriptors().len(), 5);
        assert_eq!(workload.select(TransactionType::Submit).unwrap().descriptors().len(), 2);
        assert_eq!(workload.select(TransactionType::Eval).unwrap().descriptors().len(), 3);
        assert_eq!(workload.select(TransactionType::Random).unwrap(), workload);
    }

    #[test]
    fn pick_respects_selection() {
        let submits = Workload::chaos_default().select(TransactionType::Submit).unwrap();
        for _ in 0..50 {
            assert_eq!(submits.pick().kind, TransactionKind::Submit);
        }
    }

    #[test]
    fn empty_selection_is_rejected() {
        let evals_only =
            Workload::new(vec![TransactionDescriptor::evaluate("readChaosAsset", &["cd1"])])
                .unwrap();
        assert_eq!(
            evals_only.select(TransactionType::Submit).unwrap_err(),
            WorkloadError::NoneOfType(TransactionType::Submit)
        );
        assert_eq!(Workload::new(Vec::new()).unwrap_err(), WorkloadError::Empty);
    }

    #[test]
    fn transaction_type_parses_config_names() {
        assert_eq!("random".parse::<TransactionType>().unwrap(), TransactionType::Random);
        assert_eq!("Submit".parse::<TransactionType>().unwrap(), TransactionType::Submit);
        assert_eq!("eval".parse::<TransactionType>().unwrap(), TransactionType::Eval);
        assert!("query".parse::<TransactionType>().is_err());
    }

    #[test]
    fn loads_descriptors_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"type": "submit", "name": "createUpdateChaosAsset", "params": ["cd1", "99"]}},
                {{"type": "eval", "name": "readChaosAsset", "params": ["cd1"]}},
                {{"type": "evaluate", "name": "longRunningQuery"}}
            ]"#
        )
        .unwrap();

        let workload = Workload::from_file(file.path()).unwrap();
        assert_eq!(
            workload.descriptors(),
            &[
                TransactionDescriptor::submit("createUpdateChaosAsset", &["cd1", "99"]),
                TransactionDescriptor::evaluate("readChaosAsset", &["cd1"]),
                TransactionDescriptor::evaluate("longRunningQuery", &[]),
            ]
        );
    }

    #[test]
    fn empty_workload_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[]").unwrap();
        let err = Workload::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("no transactions"));
    }

    #[test]
    fn descriptor_display_lists_arguments() {
        let descriptor = TransactionDescriptor::submit("addUpdateAssets", &["1", "2000"]);
        assert_eq!(descriptor.to_string(), r#"addUpdateAssets(["1", "2000"])"#);
    }
}
