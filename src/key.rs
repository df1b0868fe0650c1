use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::ArcStr;
use crate::error::KeyError;

const SEPARATOR: &str = "__";
const NIL: &str = "nil";

/// Identity of one memoized result: `(data type, model, dataset)`.
///
/// Rendered as `type__model__dataset`, with `nil` standing in for an absent
/// model or dataset. Components are validated on construction so that
/// parsing the rendered form always gives back the same triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey {
    data_type: ArcStr,
    model: Option<ArcStr>,
    dataset: Option<ArcStr>,
}

fn validate(component: &str) -> Result<(), KeyError> {
    if component.is_empty() {
        return Err(KeyError::Empty);
    }
    if component == NIL {
        return Err(KeyError::Reserved(component.into()));
    }
    if component.contains(SEPARATOR) || component.starts_with('_') || component.ends_with('_') {
        return Err(KeyError::Separator(component.into()));
    }
    Ok(())
}

impl CacheKey {
    pub fn new(
        data_type: impl Into<ArcStr>,
        model: Option<impl Into<ArcStr>>,
        dataset: Option<impl Into<ArcStr>>,
    ) -> Result<Self, KeyError> {
        let data_type = data_type.into();
        let model = model.map(Into::into);
        let dataset = dataset.map(Into::into);

        validate(&data_type)?;
        if let Some(model) = &model {
            validate(model)?;
        }
        if let Some(dataset) = &dataset {
            validate(dataset)?;
        }

        Ok(Self {
            data_type,
            model,
            dataset,
        })
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn dataset(&self) -> Option<&str> {
        self.dataset.as_deref()
    }

    pub fn components(&self) -> (&str, Option<&str>, Option<&str>) {
        (self.data_type(), self.model(), self.dataset())
    }

    /// Same type and model, different dataset. Used to look up the parent of
    /// a sub-dataset.
    pub(crate) fn with_dataset(&self, dataset: ArcStr) -> Self {
        Self {
            data_type: self.data_type.clone(),
            model: self.model.clone(),
            dataset: Some(dataset),
        }
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.data_type,
            self.model.as_deref().unwrap_or(NIL),
            self.dataset.as_deref().unwrap_or(NIL),
        )
    }
}

impl FromStr for CacheKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(SEPARATOR).collect();
        let [data_type, model, dataset] = parts[..] else {
            return Err(KeyError::Malformed(s.into()));
        };

        let optional = |part: &str| (part != NIL).then(|| part.to_string());

        CacheKey::new(data_type, optional(model), optional(dataset))
            .map_err(|_| KeyError::Malformed(s.into()))
    }
}

impl TryFrom<String> for CacheKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CacheKey> for String {
    fn from(value: CacheKey) -> Self {
        value.to_string()
    }
}
