use tracing::{error, info};

use crate::domain::{ContainerType, Hierarchy, RunLevel};
use crate::platform::ContainerLookup;

/// Resolves the run level and ancestor labels of `destination_id`.
///
/// Never fails: every problem is logged at error level and yields a
/// hierarchy whose run level is [`RunLevel::NoDestination`]. The resolved
/// hierarchy is logged once at info level.
pub fn resolve<L: ContainerLookup + ?Sized>(lookup: &L, destination_id: &str) -> Hierarchy {
    let hierarchy = resolve_inner(lookup, destination_id).unwrap_or_default();
    info!("Gear run level and hierarchy labels: {hierarchy:?}");
    hierarchy
}

fn resolve_inner<L: ContainerLookup + ?Sized>(
    lookup: &L,
    destination_id: &str,
) -> Option<Hierarchy> {
    let destination = match lookup.get(destination_id) {
        Ok(container) => container,
        Err(err) => {
            error!("The destination_id does not reference a valid analysis container.\n{err}");
            return None;
        }
    };

    if destination.container_type != ContainerType::Analysis {
        error!(
            "The destination_id must reference an analysis container (got {}).",
            destination.container_type
        );
        return None;
    }

    let Some(parent) = &destination.parent else {
        error!("run_level = no_parent: the analysis {destination_id} has no parent container");
        return None;
    };
    let Some(run_level) = parent.container_type.run_level() else {
        error!(
            "The analysis parent is a {} container, not a project, subject, session or acquisition",
            parent.container_type
        );
        return None;
    };

    let mut hierarchy = Hierarchy {
        run_level,
        group: destination.parents.group.clone(),
        ..Hierarchy::default()
    };

    // Levels below the run level stay unset.
    let depth = RunLevel::ANCESTORS
        .iter()
        .position(|level| *level == run_level)
        .map_or(0, |index| index + 1);
    for level in RunLevel::ANCESTORS.into_iter().take(depth) {
        let Some(id) = destination.parents.get(level) else {
            continue;
        };
        let container = match lookup.get(id) {
            Ok(container) => container,
            Err(err) => {
                error!("Unable to look up the {level} ({id}) of the destination.\n{err}");
                return None;
            }
        };
        let label = container.label.unwrap_or_default();
        if level == run_level {
            hierarchy.run_label = label.clone();
        }
        hierarchy.set_label(level, label);
    }

    Some(hierarchy)
}
