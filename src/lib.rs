//! Build, apply, revert and chain-resolve directory-tree patches.
//!
//! A patch is a manifest of ordered operations plus a forward-only payload
//! stream, stored in a `PATCH` container. Applying one is journaled so an
//! interrupted session can be resumed or reverted.

pub mod apply;
pub mod binary_diff;
pub mod binary_patch;
pub mod container;
pub mod create;
pub mod error;
pub mod interrupt;
pub mod journal;
pub mod patch_format;
pub mod progress;
pub mod resolver;
pub mod rolling_hash;
pub mod util;
pub mod version;

pub use apply::{ApplyReport, Patcher, ReplacementRecord};
pub use container::{open_container, write_container, Compression, ContainerCipher, PatchReader};
pub use create::{build_manifest, create_patch, BuildOptions};
pub use error::{PatchError, Result};
pub use interrupt::Interrupter;
pub use journal::SubCase;
pub use patch_format::{
    ApplySummary, FileRef, FileType, Operation, OperationKind, PatchKind, PatchManifest,
    ValidationFile, VersionFrom, VersionRange,
};
pub use progress::{LogProgress, NoProgress, ProgressSink};
pub use resolver::{load_catalog, resolve_chain, CatalogEdge};
pub use version::Version;
