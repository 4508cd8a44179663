//! Repackaging engine for file and directory payloads.
//!
//! Takes an input file or directory and produces a container holding it:
//! ZIP, 7z, ISO 9660 image, Microsoft cabinet, PDF with attachments, or a
//! VHD/VHDX virtual disk. Containers can be built fresh or merged into an
//! existing one (backdoor mode), optionally with hidden entries and a password.
//!
//! - **Formats** - one [`artifact::FormatAdapter`] per [`spec::FormatKind`]
//! - **Attributes** - hidden/read-only flags patched into finished artifacts
//! - **Virtual disks** - diskpart driven sessions behind a host seam
//! - **Preflight checks** - host tool validation before anything is written
//!
//! # Architecture
//!
//! ```text
//! ContainerSpec ──► pipeline::package
//!                      │
//!                      ├── validate options, preflight tools
//!                      ├── entry::collect_entries + namespace checks
//!                      ├── FormatAdapter::build / merge
//!                      │       └── vhd ──► disk::VhdSessionManager ──► DiskHost
//!                      ├── attributes::hide_stage, attribute_pass
//!                      └── FormatAdapter::apply_password
//!                   ──► PackagingResult
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use repackager::pipeline::package;
//! use repackager::spec::ContainerSpec;
//!
//! let spec = ContainerSpec::for_output("payload.exe", "invoice.zip")
//!     .unwrap()
//!     .with_rename("invoice.pdf.exe");
//! let result = package(&spec);
//! assert!(result.success);
//! ```

pub mod artifact;
pub mod attributes;
pub mod config;
pub mod context;
pub mod entry;
pub mod error;
pub mod pattern;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod result;
pub mod spec;

pub use context::{ContextSettings, Degradation, PackContext};
pub use error::{ErrorKind, PackError, Result};
pub use pipeline::{package, package_with};
pub use result::PackagingResult;
pub use spec::{ContainerSpec, FormatKind};
