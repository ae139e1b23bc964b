//! Document loaders: turn an upload or a URL into text fragments.
//!
//! | Loader | Source | Extraction |
//! |--------|--------|------------|
//! | [`PdfLoader`] | PDF bytes | `pdf-extract`, off the async runtime |
//! | [`WebPageLoader`] | `http(s)` URL | `reqwest` fetch + `html2text` |
//! | [`TextLoader`] | fixed fragments | none |
//!
//! Loaders never touch the relational store; the ingestion pipeline decides
//! what to record. Blank fragments are dropped, so an empty result means
//! "nothing usable".

use async_trait::async_trait;

use crate::error::{Error, Result};

pub const PDF_MIME: &str = "application/pdf";
pub const HTML_MIME: &str = "text/html";

/// Extracted website text shorter than this is rejected.
pub const MIN_WEBSITE_CHARS: usize = 100;

const HTML_WIDTH: usize = 120;

#[async_trait]
pub trait DocumentLoader: Send + Sync {
    /// Text fragments in source order. Empty when the source had no text.
    async fn load(&self) -> Result<Vec<String>>;
}

fn non_blank(fragments: impl IntoIterator<Item = String>) -> Vec<String> {
    fragments
        .into_iter()
        .filter(|f| !f.trim().is_empty())
        .collect()
}

/// Fragments supplied up front.
pub struct TextLoader {
    fragments: Vec<String>,
}

impl TextLoader {
    pub fn new(fragments: Vec<String>) -> Self {
        Self { fragments }
    }
}

#[async_trait]
impl DocumentLoader for TextLoader {
    async fn load(&self) -> Result<Vec<String>> {
        Ok(non_blank(self.fragments.iter().cloned()))
    }
}

/// Text of a PDF held in memory.
pub struct PdfLoader {
    bytes: Vec<u8>,
}

impl PdfLoader {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

#[async_trait]
impl DocumentLoader for PdfLoader {
    async fn load(&self) -> Result<Vec<String>> {
        let bytes = self.bytes.clone();
        // pdf-extract is CPU bound and panics on some malformed files.
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await
            .map_err(|_| Error::invalid("could not read PDF"))?
            .map_err(|e| Error::invalid(format!("could not read PDF: {}", e)))?;
        Ok(non_blank([text.trim().to_string()]))
    }
}

/// Reject uploads that are too large or not PDFs.
///
/// Runs before anything is written, so a rejected upload leaves no trace.
pub fn validate_pdf_upload(
    content_type: Option<&str>,
    bytes: &[u8],
    max_bytes: usize,
) -> Result<()> {
    if bytes.len() > max_bytes {
        return Err(Error::invalid(format!(
            "file is {} bytes; the limit is {} bytes",
            bytes.len(),
            max_bytes
        )));
    }
    let declared_pdf = content_type
        .map(|ct| ct.split(';').next().unwrap_or("").trim().eq_ignore_ascii_case(PDF_MIME))
        .unwrap_or(false);
    if !declared_pdf && !bytes.starts_with(b"%PDF-") {
        return Err(Error::invalid("only PDF files are supported"));
    }
    Ok(())
}

/// A fetched and converted web page.
#[derive(Debug, Clone)]
pub struct WebPage {
    pub url: String,
    pub title: Option<String>,
    pub text: String,
}

impl WebPage {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

#[async_trait]
impl DocumentLoader for WebPage {
    async fn load(&self) -> Result<Vec<String>> {
        Ok(non_blank([self.text.clone()]))
    }
}

pub struct WebPageLoader {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl WebPageLoader {
    /// Fails with [`Error::InvalidInput`] unless `url` is an absolute
    /// `http` or `https` URL.
    pub fn new(client: reqwest::Client, url: &str) -> Result<Self> {
        let parsed =
            reqwest::Url::parse(url).map_err(|e| Error::invalid(format!("invalid URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::invalid(format!(
                "unsupported URL scheme: {}",
                parsed.scheme()
            )));
        }
        Ok(Self {
            client,
            url: parsed,
        })
    }

    pub async fn fetch(&self) -> Result<WebPage> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| Error::invalid(format!("failed to fetch {}: {}", self.url, e)))?;
        if !response.status().is_success() {
            return Err(Error::invalid(format!(
                "failed to fetch {}: HTTP {}",
                self.url,
                response.status()
            )));
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("html"))
            .unwrap_or(true);
        let body = response.bytes().await?;

        let (title, text) = if is_html {
            let text = html2text::from_read(&body[..], HTML_WIDTH)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).to_string());
            (extract_title(&String::from_utf8_lossy(&body)), text)
        } else {
            (None, String::from_utf8_lossy(&body).to_string())
        };

        tracing::debug!(url = %self.url, chars = text.len(), "fetched web page");
        Ok(WebPage {
            url: self.url.to_string(),
            title,
            text: text.trim().to_string(),
        })
    }
}

#[async_trait]
impl DocumentLoader for WebPageLoader {
    async fn load(&self) -> Result<Vec<String>> {
        self.fetch().await?.load().await
    }
}

/// Contents of the first `<title>` element, whitespace collapsed.
fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let start = open + lower[open..].find('>')? + 1;
    let end = start + lower[start..].find("</title")?;
    let title = html[start..end].split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}
