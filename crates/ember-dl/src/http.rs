use once_cell::sync::Lazy;
use tracing::{debug, trace};
use ureq::{http::Response, Agent, Body};

use crate::error::DownloadError;

static SHARED_AGENT: Lazy<Agent> = Lazy::new(|| {
    ureq::Agent::config_builder()
        .user_agent("emberinstall/ember")
        .build()
        .into()
});

pub struct Http;

impl Http {
    /// Fetches a GET response for the given URL, failing on any
    /// non-success status.
    pub fn fetch(url: &str) -> Result<Response<Body>, DownloadError> {
        debug!("GET {}", url);
        let resp = SHARED_AGENT.get(url).call()?;
        let status = resp.status();
        trace!(status = status.as_u16(), "GET response received");

        if !status.is_success() {
            return Err(DownloadError::HttpError {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp)
    }
}
