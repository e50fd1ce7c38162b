//! Dataset identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DataError;

/// Identifies one dataset or parameter exposed by one provider.
///
/// The provider name is lower-cased on creation; the path is kept verbatim
/// because archives treat parameter ids case-sensitively. The textual form is
/// `provider/path`, for example `amda/imf`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId {
    provider: String,
    path: String,
}

impl DatasetId {
    /// Creates a new dataset id.
    #[must_use]
    pub fn new(provider: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            provider: provider.into().to_lowercase(),
            path: path.into(),
        }
    }

    /// Name of the provider this dataset belongs to.
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Provider-local dataset or parameter path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.path)
    }
}

impl FromStr for DatasetId {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((provider, path)) if !provider.is_empty() && !path.is_empty() => {
                Ok(Self::new(provider, path))
            }
            _ => Err(DataError::InvalidParameter(format!(
                "dataset id must look like provider/path, got {s:?}"
            ))),
        }
    }
}
