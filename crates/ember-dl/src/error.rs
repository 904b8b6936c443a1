use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum DownloadError {
    #[error("Invalid URL: {url}")]
    #[diagnostic(code(ember_dl::invalid_url))]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Network request failed")]
    #[diagnostic(
        code(ember_dl::network),
        help("Check your internet connection or try again later")
    )]
    Network(#[from] Box<ureq::Error>),

    #[error("HTTP {status}: {url}")]
    #[diagnostic(code(ember_dl::http_error))]
    HttpError { status: u16, url: String },

    #[error("I/O error: {0}")]
    #[diagnostic(code(ember_dl::io))]
    Io(#[from] std::io::Error),

    #[error("Transfer of '{name}' was canceled")]
    #[diagnostic(code(ember_dl::canceled))]
    Canceled { name: String },

    #[error("Source '{path}' was not found")]
    #[diagnostic(
        code(ember_dl::source_missing),
        help("Provide the file locally or supply a download URL")
    )]
    SourceMissing { path: String },
}

impl From<ureq::Error> for DownloadError {
    fn from(e: ureq::Error) -> Self {
        Self::Network(Box::new(e))
    }
}
