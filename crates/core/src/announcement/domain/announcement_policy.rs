use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::shared::detection::Detection;

/// Which detected classes are eligible for a spoken announcement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AnnouncementPolicy {
    /// Announce every class the detector reports.
    #[default]
    AllClasses,
    /// Announce only the listed classes.
    AllowList { classes: BTreeSet<String> },
}

impl AnnouncementPolicy {
    pub fn allow_list<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AllowList {
            classes: classes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn permits(&self, class_name: &str) -> bool {
        match self {
            Self::AllClasses => true,
            Self::AllowList { classes } => classes.contains(class_name),
        }
    }

    /// Distinct, sorted class names from `detections` that this policy permits.
    pub fn eligible_classes<'a>(&self, detections: &'a [Detection]) -> BTreeSet<&'a str> {
        Detection::distinct_classes(detections)
            .into_iter()
            .filter(|name| self.permits(name))
            .collect()
    }
}

impl fmt::Display for AnnouncementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllClasses => write!(f, "ALL"),
            Self::AllowList { classes } => {
                let names: Vec<&str> = classes.iter().map(String::as_str).collect();
                write!(f, "{}", names.join(", "))
            }
        }
    }
}
