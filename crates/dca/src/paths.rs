//! Classification of cache and trace paths.

use std::path::{Component, Path};

/// Directory that holds logs collected from containers.
pub const CONTAINERS_FOLDER: &str = "Containers";

/// Marker file: the container's logs are still being processed.
pub const PROCESS_CONTAINER_LOG_MARKER: &str = "ProcessContainerLog.txt";

/// Marker file: the container is gone and its log folder may be removed.
pub const REMOVE_CONTAINER_LOG_MARKER: &str = "RemoveContainerLog.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerMarker {
    Process,
    Remove,
}

/// Returns `true` if any segment of `path` is the containers folder.
pub fn is_container_log_path(path: &Path) -> bool {
    segments(path).any(|s| s == CONTAINERS_FOLDER)
}

pub fn container_marker(file_name: &str) -> Option<ContainerMarker> {
    match file_name {
        PROCESS_CONTAINER_LOG_MARKER => Some(ContainerMarker::Process),
        REMOVE_CONTAINER_LOG_MARKER => Some(ContainerMarker::Remove),
        _ => None,
    }
}

/// First segment of the form `<AppTypeName>_App<digits>`, e.g. `CalcType_App12`.
pub fn application_id(path: &Path) -> Option<&str> {
    segments(path).find(|s| is_application_id(s))
}

/// Subfolder tag for a trace path: its application id, or empty.
pub fn subfolder_for(path: &Path) -> String {
    application_id(path).unwrap_or_default().to_string()
}

fn is_application_id(segment: &str) -> bool {
    match segment.rsplit_once("_App") {
        Some((app_type, instance)) => {
            !app_type.is_empty() && !instance.is_empty() && instance.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

fn segments(path: &Path) -> impl Iterator<Item = &str> {
    path.components().filter_map(|c| match c {
        Component::Normal(s) => s.to_str(),
        _ => None,
    })
}
