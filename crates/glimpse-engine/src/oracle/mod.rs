mod client;
mod response;
mod retry;
mod transport;

use anyhow::Result;
use glimpse_contracts::SearchRegion;
use image::DynamicImage;

use crate::cancel::CancelToken;

pub use client::OracleClient;
pub use response::ParsedOracleResponse;
pub use retry::retry_with_backoff;
pub use transport::{
    is_retryable_error, EncodedImage, OpenAiVisionTransport, OracleHttpError, OracleRequest,
    OracleTransport,
};

/// What is being looked for.
#[derive(Debug, Clone, Default)]
pub struct Target {
    pub query: String,
    pub context: Option<String>,
    /// Picture of the element, sent next to each region in element mode.
    pub reference: Option<DynamicImage>,
}

impl Target {
    pub fn text(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.context = Some(context).filter(|value| !value.trim().is_empty());
        self
    }

    pub fn with_reference(mut self, reference: DynamicImage) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref().filter(|value| !value.trim().is_empty())
    }
}

/// A cropped region of the screenshot together with where it sits in the
/// full image.
#[derive(Debug, Clone, Copy)]
pub struct RegionView<'a> {
    pub image: &'a DynamicImage,
    pub region: SearchRegion,
}

/// The recognition service as seen by the search engine.
pub trait Oracle: Send + Sync {
    fn is_present(&self, view: &RegionView<'_>, target: &Target, cancel: &CancelToken)
        -> Result<bool>;

    /// Likelihood in 0–100 that the region contains the target.
    fn confidence(&self, view: &RegionView<'_>, target: &Target, cancel: &CancelToken)
        -> Result<u8>;

    /// Free-text summary of a whole screen, stored with remembered elements.
    fn describe_screen(&self, _screen: &DynamicImage, _cancel: &CancelToken) -> Result<String> {
        Ok(String::new())
    }
}
