//! Subject loading: split manifest, npy files, intensity normalization and
//! crop/pad to the canonical shape.

pub mod io;
mod manifest;
pub mod preprocess;
mod store;
mod subject;

pub use manifest::SplitManifest;
pub use store::{Preprocessor, VolumeStore};
pub use subject::{LabelMap, Partition, Provenance, Subject, Volume};
