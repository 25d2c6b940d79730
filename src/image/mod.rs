//! Image references and import into the cluster's internal image store.
mod provisioner;
mod reference;

pub use provisioner::{ImageProvisioner, ImageRequests, ImportOutcome, ImportReport, ImportSource};
pub use reference::{DEFAULT_REGISTRY, ImageReference, normalize};
