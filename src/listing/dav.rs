use std::time::Duration;

use anyhow::{Context, Result};
use percent_encoding::percent_decode_str;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use reqwest::{Method, StatusCode};

use super::{ListedEntry, ListingService};
use crate::config::{AccountConfig, GeneralConfig};
use crate::util::BoxFuture;
use crate::util::path::join_remote;

/// Properties requested for every listed directory.
const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
    <d:quota-used-bytes/>
  </d:prop>
</d:propfind>"#;

/// Lists sub-folders with a `Depth: 1` WebDAV PROPFIND.
pub struct DavListing {
    http: reqwest::Client,
    username: Option<String>,
    password: Option<String>,
    max_retries: u32,
}

impl DavListing {
    pub fn new(account: &AccountConfig, general: &GeneralConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(general.request_timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            username: account.username.clone(),
            password: account.password()?,
            max_retries: general.max_listing_retries,
        })
    }

    /// Send the PROPFIND, retrying on rate limits (429).
    async fn propfind(&self, url: &str) -> Result<String> {
        let method = Method::from_bytes(b"PROPFIND").context("Invalid HTTP method")?;

        for attempt in 0..=self.max_retries {
            let mut request = self
                .http
                .request(method.clone(), url)
                .header("Depth", "1")
                .header("Content-Type", "application/xml; charset=utf-8")
                .body(PROPFIND_BODY);
            if let Some(ref user) = self.username {
                request = request.basic_auth(user, self.password.as_deref());
            }

            let resp = request
                .send()
                .await
                .with_context(|| format!("PROPFIND {url} failed"))?;

            match resp.status() {
                s if s.is_success() => {
                    return resp
                        .text()
                        .await
                        .with_context(|| format!("Failed to read listing of {url}"));
                }

                StatusCode::TOO_MANY_REQUESTS if attempt < self.max_retries => {
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(2);
                    let wait = Duration::from_secs(retry_after) + jitter();
                    tracing::warn!(
                        url,
                        retry_after,
                        attempt = attempt + 1,
                        "rate limited, waiting {wait:?}"
                    );
                    tokio::time::sleep(wait).await;
                }

                StatusCode::TOO_MANY_REQUESTS => break,

                status => {
                    let body = resp.text().await.unwrap_or_default();
                    anyhow::bail!("WebDAV error ({status}) listing {url}: {body}");
                }
            }
        }

        anyhow::bail!(
            "Rate limited listing {url}, exhausted {} retries",
            self.max_retries
        )
    }
}

impl ListingService for DavListing {
    fn list<'a>(
        &'a self,
        base_url: &'a str,
        relative_path: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ListedEntry>>> {
        Box::pin(async move {
            let url = join_remote(base_url, relative_path);
            tracing::debug!(%url, "listing remote folder");

            let body = self.propfind(&url).await?;
            let responses = parse_multistatus(&body)
                .with_context(|| format!("Failed to parse listing of {url}"))?;

            let requested = href_path(&url);
            Ok(directories_first_self(&requested, responses))
        })
    }
}

/// One `<d:response>` of a multistatus body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DavResponse {
    pub href: String,
    pub is_collection: bool,
    pub size: u64,
}

pub(crate) fn parse_multistatus(xml: &str) -> Result<Vec<DavResponse>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut responses = Vec::new();
    let mut current: Option<DavResponse> = None;
    let mut in_href = false;
    let mut in_size = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"response" => current = Some(DavResponse::default()),
                b"href" => in_href = true,
                b"quota-used-bytes" => in_size = true,
                b"collection" => {
                    if let Some(ref mut r) = current {
                        r.is_collection = true;
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"collection"
                    && let Some(ref mut r) = current
                {
                    r.is_collection = true;
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().context("Invalid XML text")?;
                if let Some(ref mut r) = current {
                    if in_href {
                        r.href.push_str(&text);
                    } else if in_size {
                        r.size = text.trim().parse().unwrap_or(0);
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"response" => {
                    if let Some(r) = current.take() {
                        responses.push(r);
                    }
                }
                b"href" => in_href = false,
                b"quota-used-bytes" => in_size = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => anyhow::bail!("XML parsing error at {}: {e}", reader.buffer_position()),
            _ => {}
        }
        buf.clear();
    }

    Ok(responses)
}

/// Decoded path component of an href, which may be a full URL.
fn href_path(href: &str) -> String {
    let raw = match url::Url::parse(href) {
        Ok(url) => url.path().to_string(),
        Err(_) => href.to_string(),
    };
    percent_decode_str(&raw).decode_utf8_lossy().into_owned()
}

/// Keep collections only, with the requested directory as the first entry.
fn directories_first_self(requested: &str, responses: Vec<DavResponse>) -> Vec<ListedEntry> {
    let wanted = requested.trim_end_matches('/');
    let mut own: Option<ListedEntry> = None;
    let mut subfolders = Vec::new();

    for r in responses.into_iter().filter(|r| r.is_collection) {
        let path = href_path(&r.href);
        if path.trim_end_matches('/') == wanted {
            own = Some(ListedEntry::new(path, r.size));
        } else {
            subfolders.push(ListedEntry::new(path, r.size));
        }
    }

    let mut entries = Vec::with_capacity(subfolders.len() + 1);
    entries.push(own.unwrap_or_else(|| ListedEntry::new(requested, 0)));
    entries.extend(subfolders);
    entries
}

fn jitter() -> Duration {
    let ms: u64 = rand::random::<u64>() % 1000;
    Duration::from_millis(ms)
}
