use thiserror::Error;

/// Why a results page could not be turned into records.
#[derive(Debug, Error)]
pub enum PageError {
    /// No structured-data block on the page: there is nothing left to scrape.
    #[error("no structured data block on page")]
    NoStructuredData,

    #[error("structured data block is not valid JSON: {0}")]
    MalformedStructuredData(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("browser error: {0:#}")]
    Browser(#[from] anyhow::Error),
}

impl PageError {
    /// Terminal conditions end the walk cleanly rather than stalling it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PageError::NoStructuredData
                | PageError::MalformedStructuredData(_)
                | PageError::Navigation(_)
        )
    }
}
