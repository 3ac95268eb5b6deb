use std::sync::Arc;
use std::time::Duration;

use reqwest::redirect::Policy;
use thiserror::Error;
use url::{Host, Url};

use crate::{is_global_ipv4, PublicIpResolver};

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("webhook target refused: {0}")]
    Forbidden(&'static str),
    #[error("webhook target does not parse: {0}")]
    Invalid(#[from] url::ParseError),
    #[error("{0}")]
    Http(#[from] reqwest::Error),
}

/// Static checks on a delivery target, applied again at send time even
/// though admission vetted the URL when the job was submitted. The DNS side
/// (rebinding) is handled by the resolver; this covers everything visible
/// in the URL itself.
pub fn vet_target(url: &Url) -> Result<(), TargetError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(TargetError::Forbidden("scheme must be http or https"));
    }
    // Credentials smuggled into the URL would leak into request lines and
    // proxies; deliveries authenticate through the signature header instead.
    if !url.username().is_empty() || url.password().is_some() {
        return Err(TargetError::Forbidden("userinfo is not allowed"));
    }
    match url.host() {
        None => Err(TargetError::Forbidden("target has no host")),
        Some(Host::Ipv4(ip)) if !is_global_ipv4(&ip) => {
            Err(TargetError::Forbidden("address is not publicly routable"))
        }
        Some(Host::Ipv6(_)) => Err(TargetError::Forbidden("ipv6 targets are not supported")),
        Some(_) => Ok(()),
    }
}

/// Outbound HTTP client for webhook deliveries.
///
/// Differences from a stock client, all in service of the dispatcher:
/// - the target is re-vetted on every send (`vet_target`), so a record that
///   was clean at admission cannot be redirected-by-data later;
/// - name resolution goes through [`PublicIpResolver`], which means the
///   address actually dialed is public even if DNS answers changed since
///   admission (rebinding defense);
/// - redirects are never followed. A 3xx from a webhook target is just a
///   non-2xx delivery outcome; chasing it would reopen the rebinding
///   surface and hide misconfigured endpoints from the owner.
///
/// `guarded: false` drops the resolver and the URL vetting for tests that
/// deliver to a local mock server; production construction always guards.
#[derive(Clone)]
pub struct WebhookClient {
    inner: reqwest::Client,
    guarded: bool,
}

pub struct WebhookClientBuilder {
    guarded: bool,
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    default_headers: reqwest::header::HeaderMap,
}

impl WebhookClientBuilder {
    pub fn new(guarded: bool) -> Self {
        Self {
            guarded,
            timeout: None,
            connect_timeout: None,
            default_headers: reqwest::header::HeaderMap::new(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn default_headers(mut self, headers: reqwest::header::HeaderMap) -> Self {
        self.default_headers = headers;
        self
    }

    pub fn build(self) -> Result<WebhookClient, TargetError> {
        let mut builder = reqwest::Client::builder().redirect(Policy::none());

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(connect_timeout) = self.connect_timeout {
            builder = builder.connect_timeout(connect_timeout);
        }
        if !self.default_headers.is_empty() {
            builder = builder.default_headers(self.default_headers);
        }
        if self.guarded {
            builder = builder.dns_resolver(Arc::new(PublicIpResolver));
        }

        Ok(WebhookClient {
            inner: builder.build()?,
            guarded: self.guarded,
        })
    }
}

impl WebhookClient {
    pub fn new(guarded: bool) -> Result<Self, TargetError> {
        WebhookClientBuilder::new(guarded).build()
    }

    pub fn builder(guarded: bool) -> WebhookClientBuilder {
        WebhookClientBuilder::new(guarded)
    }

    /// Start a delivery POST. Fails before any connection is attempted when
    /// the target does not pass vetting.
    pub fn post(&self, url: &str) -> Result<reqwest::RequestBuilder, TargetError> {
        let parsed: Url = url.parse()?;
        if self.guarded {
            vet_target(&parsed)?;
        }
        Ok(self.inner.post(parsed))
    }
}
