//! Typed BOSH deployment manifests.
//!
//! Besides the data model this crate contains the operations working purely on a manifest:
//! canonical serialization, release and stemcell lookups, addon placement and discovery of
//! implicit variables.

pub mod addon;
pub mod instance_group;
pub mod manifest;
pub mod merge;
pub mod names;
pub mod variables;
pub mod yaml;

pub use addon::{AddOn, PlacementContext};
pub use instance_group::{InstanceGroup, InstanceGroupType, Job};
pub use manifest::{DESIRED_MANIFEST_KEY_NAME, Manifest};

pub(crate) fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}
