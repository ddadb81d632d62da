//! Choosing the two revisions a self-diff compares.
//!
//! | diff arguments | compared revisions                     |
//! |----------------|----------------------------------------|
//! | none           | `CSV~1` and `CSV~0`                    |
//! | `+...`         | picked interactively from the list     |
//! | `X`            | `X` and `CSV~0`                        |
//! | `X Y`          | `X` and `Y`                            |
//! | three or more  | `CSV~1` and `CSV~0`                    |

use tracing::debug;

use crate::address::CURRENT;
use crate::backend::{Backend, VersionSelector};
use crate::error::BackendResult;
use crate::revision::RevisionRecord;

/// Address of the revision before the current one.
pub const PREVIOUS: &str = "CSV~1";

/// How a diff's two revision addresses are obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffPlan {
    /// Addresses are known from the arguments.
    Specs([String; 2]),
    /// The user picks from the revision list.
    Pick,
}

fn default_pair() -> [String; 2] {
    [PREVIOUS.to_string(), CURRENT.to_string()]
}

/// Classify diff arguments.
pub fn plan(args: &[String]) -> DiffPlan {
    match args {
        [] => DiffPlan::Specs(default_pair()),
        [only] if only.starts_with('+') => DiffPlan::Pick,
        [only] => DiffPlan::Specs([only.clone(), CURRENT.to_string()]),
        [first, second] => DiffPlan::Specs([first.clone(), second.clone()]),
        _ => DiffPlan::Specs(default_pair()),
    }
}

/// Addresses for an interactive pick. Nothing picked means nothing to diff;
/// exactly two picked compares them oldest first; anything else falls back
/// to the default pair.
pub fn picked_specs(picked: &[RevisionRecord]) -> Option<[String; 2]> {
    match picked {
        [] => None,
        [newer, older] => Some([older.id.clone(), newer.id.clone()]),
        _ => Some(default_pair()),
    }
}

/// Resolve `args` to two addresses, consulting `selector` when asked to pick.
pub async fn diff_specs<B>(
    backend: &mut B,
    args: &[String],
    selector: &dyn VersionSelector,
) -> BackendResult<Option<[String; 2]>>
where
    B: Backend + ?Sized,
{
    match plan(args) {
        DiffPlan::Specs(specs) => Ok(Some(specs)),
        DiffPlan::Pick => {
            let records = backend.state_versions(None).await?;
            let picked = selector.select(&records);
            debug!("selected {} versions", picked.len());
            Ok(picked_specs(&picked))
        }
    }
}

/// Fetch the two documents a self-diff compares.
pub async fn diff_states<B>(
    backend: &mut B,
    args: &[String],
    selector: &dyn VersionSelector,
) -> BackendResult<Option<Vec<Vec<u8>>>>
where
    B: Backend + ?Sized,
{
    let Some(specs) = diff_specs(backend, args, selector).await? else {
        return Ok(None);
    };
    backend.states(&specs).await.map(Some)
}
