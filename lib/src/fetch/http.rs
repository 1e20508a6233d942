//! HTTP(S) install trees.

use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8Path;
use indicatif::ProgressBar;
use reqwest::blocking::Client;
use reqwest::StatusCode;

use super::{Fetcher, FetcherBase, Location};
use crate::Error;

#[derive(Debug)]
pub(crate) struct HttpFetcher {
    base: FetcherBase,
    client: Client,
}

fn is_proxy_gateway(status: StatusCode) -> bool {
    status == StatusCode::BAD_GATEWAY
}

impl HttpFetcher {
    pub(crate) fn new(base: FetcherBase) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("vinstall/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Creating HTTP client")?;
        Ok(Self { base, client })
    }

    fn probe(&self, url: &str) -> Result<bool> {
        let r = match self.client.head(url).send() {
            Ok(resp) if is_proxy_gateway(resp.status()) => {
                return Err(Error::ProxyGateway {
                    url: url.to_string(),
                    status: resp.status().as_u16(),
                }
                .into());
            }
            Ok(resp) => {
                let st = resp.status();
                if !st.is_success() {
                    tracing::debug!("HTTP hasFile request failed: {url}: {st}");
                }
                st.is_success()
            }
            Err(e) => {
                tracing::debug!("HTTP hasFile request failed: {e}");
                false
            }
        };
        tracing::debug!("hasFile({url}) returning {r}");
        Ok(r)
    }
}

impl Fetcher for HttpFetcher {
    fn location(&self) -> &Location {
        &self.base.location
    }

    fn scratchdir(&self) -> &Utf8Path {
        &self.base.scratchdir
    }

    fn has_file(&self, relpath: &str) -> Result<bool> {
        self.probe(&self.base.location.join(relpath))
    }

    fn copy_to(&self, relpath: &str, w: &mut dyn Write) -> Result<u64> {
        let url = self.base.location.join(relpath);
        tracing::debug!("Fetching URI: {url}");
        let fetch_err = |reason: String| Error::Fetch {
            url: url.clone(),
            reason,
        };
        let mut resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| fetch_err(e.to_string()))?;
        let st = resp.status();
        if is_proxy_gateway(st) {
            return Err(Error::ProxyGateway {
                url: url.clone(),
                status: st.as_u16(),
            }
            .into());
        }
        if !st.is_success() {
            return Err(fetch_err(st.to_string()).into());
        }
        if let Some(len) = resp.content_length() {
            self.base.progress.set_length(len);
        }
        let n = resp.copy_to(w).map_err(|e| fetch_err(e.to_string()))?;
        Ok(n)
    }

    fn can_access(&self) -> bool {
        matches!(self.probe(self.base.location.as_str()), Ok(true))
    }

    fn progress(&self) -> &ProgressBar {
        &self.base.progress
    }
}
