//! OCI image support for imirror.
//!
//! Parses image references and pulls a single architecture of a tagged
//! image into a staging OCI image layout, which the export worker then
//! archives.

pub mod reference;
pub mod source;

pub use reference::ImageReference;
pub use source::{ImageSource, OciImageSource, PulledImage};
