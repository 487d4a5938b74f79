use camino::Utf8PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BackfillError {
    #[error("failed to read catalog file at {0}")]
    #[diagnostic(help("pass --catalog <path> or create targets.json in the working directory"))]
    CatalogRead(Utf8PathBuf),

    #[error("failed to parse catalog: {0}")]
    CatalogParse(String),

    #[error("unsupported catalog schema version {found} (supported: {supported})")]
    CatalogSchema { found: u32, supported: u32 },

    #[error("invalid target id: {0}")]
    InvalidTargetId(String),

    #[error("invalid coordinates for target {id}: latitude={latitude}, longitude={longitude}")]
    InvalidCoordinates {
        id: String,
        latitude: f64,
        longitude: f64,
    },

    #[error("duplicate target id in catalog: {0}")]
    DuplicateTarget(String),

    #[error("catalog group name must not be empty")]
    EmptyGroupName,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("unsupported database schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("backfill run stopped early: {0}")]
    #[diagnostic(help("progress up to the failed unit is saved; rerun to resume"))]
    RunAborted(String),
}

impl BackfillError {
    /// Catalog and configuration problems are detected before any network activity.
    pub fn is_startup_error(&self) -> bool {
        matches!(
            self,
            BackfillError::CatalogRead(_)
                | BackfillError::CatalogParse(_)
                | BackfillError::CatalogSchema { .. }
                | BackfillError::InvalidTargetId(_)
                | BackfillError::InvalidCoordinates { .. }
                | BackfillError::DuplicateTarget(_)
                | BackfillError::EmptyGroupName
                | BackfillError::Config(_)
        )
    }
}
