//! Manifest resolver: renders cluster-resource templates against configuration.
//!
//! Templates are raw text carrying `$g{..}`, `$a{..}` and `$d{..}`
//! placeholders. Rendering works on text, not on parsed YAML, so that
//! array and map expansion keeps the template's indentation exactly.
//! Rendered files are then parsed into a [`ResolvedManifest`] for
//! reconciliation and diffing.

pub mod manifest;
pub mod placeholder;
pub mod resolver;

pub use manifest::{ResolvedManifest, ResourceKey};
pub use placeholder::{Placeholder, PlaceholderKind, Substitution};
pub use resolver::{resolve, resolve_text, view, ManifestView, PlaceholderInfo, Resolution};
