//! Image scan orchestration.

pub mod bom;
pub mod handler;
pub mod layers;

pub use bom::{generate_bom, normalize_full_tag, Bom, BuiltinCataloger, PackageCataloger};
pub use handler::{ScanHandler, ScannedImage, Status};
pub use layers::{reconstruct_layers, ExecutableFile, FileCategory, LayerRecord};

/// Tunables for a single scan submission.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Ask the backend to rescan even if a report already exists.
    pub force_scan: bool,
    /// Polling timeout override in seconds.
    pub timeout: Option<u64>,
}
