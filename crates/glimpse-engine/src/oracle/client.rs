use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::DynamicImage;

use crate::cancel::CancelToken;
use crate::config::{OracleConfig, RetryPolicy};
use crate::oracle::response::ParsedOracleResponse;
use crate::oracle::retry::retry_with_backoff;
use crate::oracle::transport::{EncodedImage, OpenAiVisionTransport, OracleRequest, OracleTransport};
use crate::oracle::{Oracle, RegionView, Target};

const PRESENCE_MAX_TOKENS: u32 = 10;
const CONFIDENCE_MAX_TOKENS: u32 = 10;

/// `Oracle` over any transport: prompt construction, throttling, retries and
/// defensive parsing.
pub struct OracleClient {
    transport: Box<dyn OracleTransport>,
    retry: RetryPolicy,
    throttle: Duration,
    max_output_tokens: u32,
    last_call: Mutex<Option<Instant>>,
    calls: AtomicU64,
}

impl OracleClient {
    pub fn new(transport: impl OracleTransport + 'static, config: &OracleConfig) -> Self {
        Self {
            transport: Box::new(transport),
            retry: config.retry.clone(),
            throttle: config.throttle,
            max_output_tokens: config.max_output_tokens,
            last_call: Mutex::new(None),
            calls: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &OracleConfig) -> Result<Self> {
        Ok(Self::new(OpenAiVisionTransport::new(config)?, config))
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Requests sent, retries included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn ask(
        &self,
        label: &str,
        prompt: String,
        images: Vec<EncodedImage>,
        max_output_tokens: u32,
        cancel: &CancelToken,
    ) -> Result<String> {
        let request = OracleRequest {
            prompt,
            images,
            max_output_tokens,
        };
        retry_with_backoff(&self.retry, cancel, label, |attempt| {
            self.wait_for_throttle(cancel)?;
            self.calls.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "oracle {label} via {} (attempt {attempt})",
                self.transport.name()
            );
            self.transport.complete(&request)
        })
    }

    fn wait_for_throttle(&self, cancel: &CancelToken) -> Result<()> {
        let mut last_call = self
            .last_call
            .lock()
            .map_err(|_| anyhow!("oracle throttle lock poisoned"))?;
        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < self.throttle {
                cancel.sleep(self.throttle - elapsed)?;
            }
        }
        *last_call = Some(Instant::now());
        Ok(())
    }

    fn region_images(view: &RegionView<'_>, target: &Target) -> Result<Vec<EncodedImage>> {
        let mut images = vec![EncodedImage::png(view.image)?];
        if let Some(reference) = target.reference.as_ref() {
            images.push(EncodedImage::png(reference)?);
        }
        Ok(images)
    }
}

impl Oracle for OracleClient {
    fn is_present(
        &self,
        view: &RegionView<'_>,
        target: &Target,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let prompt = presence_prompt(target);
        let images = Self::region_images(view, target)?;
        let text = self.ask("presence check", prompt, images, PRESENCE_MAX_TOKENS, cancel)?;
        let parsed = ParsedOracleResponse::parse(&text);
        if parsed.presence().is_none() {
            log::debug!("ambiguous presence answer {:?}; treating as absent", parsed.raw());
        }
        Ok(parsed.is_present())
    }

    fn confidence(
        &self,
        view: &RegionView<'_>,
        target: &Target,
        cancel: &CancelToken,
    ) -> Result<u8> {
        let prompt = confidence_prompt(target);
        let images = Self::region_images(view, target)?;
        let text = self.ask("confidence", prompt, images, CONFIDENCE_MAX_TOKENS, cancel)?;
        let parsed = ParsedOracleResponse::parse(&text);
        if parsed.percentage().is_none() {
            log::debug!("no percentage in answer {:?}; using 0", parsed.raw());
        }
        Ok(parsed.confidence())
    }

    fn describe_screen(&self, screen: &DynamicImage, cancel: &CancelToken) -> Result<String> {
        let prompt = "Describe this screenshot in one or two sentences: which application \
                      or page is shown and what its main visible sections are. \
                      Answer with the description only."
            .to_string();
        let images = vec![EncodedImage::png(screen)?];
        let text = self.ask("describe screen", prompt, images, self.max_output_tokens, cancel)?;
        Ok(text.trim().to_string())
    }
}

fn context_line(target: &Target) -> String {
    match target.context() {
        Some(context) => format!("Context: {context}.\n"),
        None => String::new(),
    }
}

pub(crate) fn presence_prompt(target: &Target) -> String {
    if target.reference.is_some() {
        return format!(
            "The first image is part of a screenshot. The second image shows the UI element '{}'.\n\
             {}Is that element visible anywhere in the first image?\n\
             Answer only YES or NO.",
            target.query,
            context_line(target)
        );
    }
    format!(
        "Look at this image and tell me if it contains '{}'.\n\
         {}I am looking for the element itself, not just any incidental mention of the text.\n\
         Answer only YES or NO.",
        target.query,
        context_line(target)
    )
}

pub(crate) fn confidence_prompt(target: &Target) -> String {
    if target.reference.is_some() {
        return format!(
            "The first image is part of a screenshot. The second image shows the UI element '{}'.\n\
             {}Rate how much of that element is contained in the first image.\n\
             Give your answer ONLY as a percentage between 0-100, for example \"75\".\n\
             Give 100 only if the whole element is clearly inside the image.",
            target.query,
            context_line(target)
        );
    }
    format!(
        "Look at this image and rate how likely it contains '{}'.\n\
         {}Give your answer ONLY as a percentage between 0-100.\n\
         For example: \"75\", \"20\", \"100\".\n\
         Give 100 only if it is clearly the element being looked for.\n\
         Give 0 if the text is absent or only an unrelated mention.",
        target.query,
        context_line(target)
    )
}
