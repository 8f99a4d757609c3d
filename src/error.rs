use std::io;

use reqwest::StatusCode;

use crate::config::Key;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Bad configuration value for {0:?}: {1}")]
    Configuration(Key, String),

    #[error("{}", describe_extraction(*.0, .1))]
    Extraction(ExtractionFailure, String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{url} answered {status}")]
    Status { url: String, status: StatusCode },

    #[error("Gave up on {url} after {attempts} attempts")]
    Exhausted { url: String, attempts: u32 },

    #[error("{}", describe_unsupported(*.0, .1))]
    Unsupported(UnsupportedError, String),

    #[error("Bad url: {0}")]
    Url(#[from] url::ParseError),

    #[error("Undecodable image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Bad json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Errors that should stop the whole run rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Configuration(..) | Error::Io(_) | Error::Unsupported(..) | Error::Url(_)
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExtractionFailure {
    Metadata,
    ImageUrl,
    DownloadLink,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UnsupportedError {
    Domain,
    Route,
}

fn describe_extraction(kind: ExtractionFailure, url: &str) -> String {
    match kind {
        ExtractionFailure::Metadata => format!("Unable to extract album metadata at {}", url),
        ExtractionFailure::ImageUrl => format!("Unable to extract image urls at {}", url),
        ExtractionFailure::DownloadLink => format!("Unable to extract download link at {}", url),
    }
}

fn describe_unsupported(kind: UnsupportedError, url: &str) -> String {
    match kind {
        UnsupportedError::Domain => format!("Unsupported domain: {}", url),
        UnsupportedError::Route => format!("Unsupported object type: {}", url),
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ExtractionFailure};
    use crate::config::Key;

    #[test]
    fn fatal_errors_are_setup_errors() {
        assert!(Error::Configuration(Key::AlbumWorkers, "zero".into()).is_fatal());
        assert!(!Error::Cancelled.is_fatal());
        assert!(!Error::Extraction(ExtractionFailure::ImageUrl, "x".into()).is_fatal());
    }

    #[test]
    fn extraction_message_names_the_url() {
        let e = Error::Extraction(ExtractionFailure::ImageUrl, "https://foo.bar/albums/1".into());
        assert_eq!(
            "Unable to extract image urls at https://foo.bar/albums/1",
            e.to_string()
        );
    }
}
