use super::resource::MountMode;
use super::resource::MountRequest;

/// Whether a pod in `current` mode may take `request`.
///
/// An unmounted pod accepts anything. A mounted pod only accepts requests of
/// the same mode, so whole-device and fractional mounts never mix.
pub fn can_mount(current: MountMode, request: &MountRequest) -> bool {
    match current {
        MountMode::Unmounted => true,
        mounted => mounted == request.mode(),
    }
}
