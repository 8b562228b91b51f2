//! Conditional-GET HTTP client with size/content-type gating and manual
//! redirect handling (spec §4.C). One shared `reqwest::Client` per crawler,
//! with `reqwest`'s own redirect follower disabled so scheme downgrades can
//! be rejected and the hop count enforced explicitly.

use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};

use crate::config::MimeGlobList;
use crate::error::{ErrorType, FetchError};

/// Per-request parameters; everything that varies call to call lives here
/// so the shared [`Client`] stays immutable and connection-pooled.
#[derive(Debug, Clone, Default)]
pub struct FetchParams<'a> {
    pub if_none_match: Option<&'a str>,
    pub if_modified_since: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct ResponseHeaders {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub date: Option<String>,
    pub retry_after: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

/// The outcome of one fetch attempt (spec §4.C "Output").
#[derive(Debug, Clone)]
pub struct HttpResult {
    pub status: u16,
    pub headers: ResponseHeaders,
    pub body: Option<Vec<u8>>,
    pub elapsed_ms: u64,
    pub final_url: String,
    pub error: Option<FetchError>,
}

impl HttpResult {
    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && self.error.is_none()
    }
}

pub struct HttpClient {
    client: Client,
    user_agent: String,
    max_redirects: u8,
}

impl HttpClient {
    /// `compress` controls whether `gzip`/`deflate`/`brotli` are negotiated
    /// at all (spec §6 `compress` option). This has to be decided at client
    /// construction rather than per request: `reqwest` only performs its
    /// transparent `Content-Encoding` decoding when it is the one to set the
    /// `Accept-Encoding` header, so a hand-inserted header on individual
    /// requests would silently defeat the decoder and leave compressed
    /// bytes in the stored body.
    pub fn new(user_agent: impl Into<String>, timeout: Duration, compress: bool) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .gzip(compress)
            .deflate(compress)
            .brotli(compress)
            .build()?;
        Ok(Self {
            client,
            user_agent: user_agent.into(),
            max_redirects: 10,
        })
    }

    pub fn with_max_redirects(mut self, n: u8) -> Self {
        self.max_redirects = n;
        self
    }

    /// Issues a `GET`, following up to `max_redirects` same-or-upgraded-scheme
    /// hops, gating on size and content-type, and classifying any failure.
    #[tracing::instrument(skip(self, params), fields(url = %url))]
    pub async fn fetch(
        &self,
        url: &str,
        params: FetchParams<'_>,
        max_bytes: u64,
        accept: &MimeGlobList,
        reject: &MimeGlobList,
    ) -> HttpResult {
        let started = Instant::now();
        let mut current = url.to_string();

        for hop in 0..=self.max_redirects {
            let headers = self.build_headers(&params);
            let resp = match self.client.get(&current).headers(headers).send().await {
                Ok(r) => r,
                Err(e) => return Self::classify_send_error(e, started, current),
            };

            let status = resp.status();
            if status.is_redirection() {
                if hop == self.max_redirects {
                    return HttpResult {
                        status: status.as_u16(),
                        headers: ResponseHeaders::default(),
                        body: None,
                        elapsed_ms: elapsed_ms(started),
                        final_url: current,
                        error: Some(FetchError::new(ErrorType::RedirectLoop, "too many redirects")),
                    };
                }
                let Some(location) = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Self::terminal_from_status(resp, started, current).await;
                };
                let next = match reqwest::Url::parse(&current)
                    .and_then(|base| base.join(location))
                {
                    Ok(u) => u,
                    Err(_) => {
                        return HttpResult {
                            status: status.as_u16(),
                            headers: ResponseHeaders::default(),
                            body: None,
                            elapsed_ms: elapsed_ms(started),
                            final_url: current,
                            error: Some(FetchError::new(
                                ErrorType::Unknown,
                                "unresolvable redirect location",
                            )),
                        }
                    }
                };
                let downgrade = reqwest::Url::parse(&current)
                    .map(|cur| cur.scheme() == "https" && next.scheme() == "http")
                    .unwrap_or(false);
                if downgrade {
                    return HttpResult {
                        status: status.as_u16(),
                        headers: ResponseHeaders::default(),
                        body: None,
                        elapsed_ms: elapsed_ms(started),
                        final_url: current,
                        error: Some(FetchError::new(
                            ErrorType::Unknown,
                            "refused https to http redirect downgrade",
                        )),
                    };
                }
                current = next.to_string();
                continue;
            }

            return self
                .finish_response(resp, status, started, current, max_bytes, accept, reject)
                .await;
        }

        unreachable!("redirect loop exits via return")
    }

    fn build_headers(&self, params: &FetchParams<'_>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_str(&self.user_agent).unwrap_or(HeaderValue::from_static("bot")),
        );
        if let Some(v) = params.if_none_match {
            if let Ok(hv) = HeaderValue::from_str(v) {
                headers.insert(IF_NONE_MATCH, hv);
            }
        }
        if let Some(v) = params.if_modified_since {
            if let Ok(hv) = HeaderValue::from_str(v) {
                headers.insert(IF_MODIFIED_SINCE, hv);
            }
        }
        headers
    }

    async fn finish_response(
        &self,
        resp: reqwest::Response,
        status: StatusCode,
        started: Instant,
        final_url: String,
        max_bytes: u64,
        accept: &MimeGlobList,
        reject: &MimeGlobList,
    ) -> HttpResult {
        let headers = extract_headers(&resp);

        if status == StatusCode::NOT_MODIFIED {
            return HttpResult {
                status: status.as_u16(),
                headers,
                body: None,
                elapsed_ms: elapsed_ms(started),
                final_url,
                error: None,
            };
        }

        if let Some(len) = headers.content_length {
            if len > max_bytes {
                return HttpResult {
                    status: status.as_u16(),
                    headers,
                    body: None,
                    elapsed_ms: elapsed_ms(started),
                    final_url,
                    error: Some(FetchError::new(
                        ErrorType::ContentTooLarge,
                        format!("content-length {len} exceeds {max_bytes}"),
                    )),
                };
            }
        }

        if status.is_success() {
            if let Some(ct) = &headers.content_type {
                if !accept.is_empty() && !accept.matches(ct) {
                    return HttpResult {
                        status: status.as_u16(),
                        headers,
                        body: None,
                        elapsed_ms: elapsed_ms(started),
                        final_url,
                        error: Some(FetchError::new(
                            ErrorType::ContentTypeRejected,
                            format!("content-type `{ct}` not in accept list"),
                        )),
                    };
                }
                if reject.matches(ct) {
                    return HttpResult {
                        status: status.as_u16(),
                        headers,
                        body: None,
                        elapsed_ms: elapsed_ms(started),
                        final_url,
                        error: Some(FetchError::new(
                            ErrorType::ContentTypeRejected,
                            format!("content-type `{ct}` is rejected"),
                        )),
                    };
                }
            }
        }

        let body = match Self::read_bounded(resp, max_bytes).await {
            Ok(b) => b,
            Err(e) => {
                return HttpResult {
                    status: status.as_u16(),
                    headers,
                    body: None,
                    elapsed_ms: elapsed_ms(started),
                    final_url,
                    error: Some(e),
                }
            }
        };

        let error = if status.is_client_error() {
            let promoted = matches!(status.as_u16(), 408 | 425);
            if status == StatusCode::TOO_MANY_REQUESTS {
                Some(FetchError::new(ErrorType::HttpRateLimited, status.to_string()))
            } else if promoted {
                Some(FetchError::new(ErrorType::NetworkTimeout, status.to_string()))
            } else {
                Some(FetchError::new(ErrorType::HttpClientError, status.to_string()))
            }
        } else if status.is_server_error() {
            if status == StatusCode::SERVICE_UNAVAILABLE && headers.retry_after.is_some() {
                Some(FetchError::new(ErrorType::HttpRateLimited, status.to_string()))
            } else {
                Some(FetchError::new(ErrorType::HttpServerError, status.to_string()))
            }
        } else {
            None
        };

        HttpResult {
            status: status.as_u16(),
            headers,
            body: Some(body),
            elapsed_ms: elapsed_ms(started),
            final_url,
            error,
        }
    }

    /// Reads the response body in chunks, aborting as soon as the
    /// cumulative size exceeds `max_bytes` even when `Content-Length` was
    /// absent or understated (spec §4.C streamed-size cap).
    async fn read_bounded(resp: reqwest::Response, max_bytes: u64) -> Result<Vec<u8>, FetchError> {
        use futures::StreamExt;
        let mut stream = resp.bytes_stream();
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                FetchError::new(ErrorType::NetworkTimeout, format!("stream error: {e}"))
            })?;
            buf.extend_from_slice(&chunk);
            if buf.len() as u64 > max_bytes {
                return Err(FetchError::new(
                    ErrorType::ContentTooLarge,
                    format!("body exceeded {max_bytes} bytes"),
                ));
            }
        }
        Ok(buf)
    }

    async fn terminal_from_status(
        resp: reqwest::Response,
        started: Instant,
        final_url: String,
    ) -> HttpResult {
        let status = resp.status();
        let headers = extract_headers(&resp);
        HttpResult {
            status: status.as_u16(),
            headers,
            body: None,
            elapsed_ms: elapsed_ms(started),
            final_url,
            error: Some(FetchError::new(
                ErrorType::Unknown,
                "redirect with no Location header",
            )),
        }
    }

    fn classify_send_error(e: reqwest::Error, started: Instant, final_url: String) -> HttpResult {
        let error_type = if e.is_timeout() {
            ErrorType::NetworkTimeout
        } else if e.is_connect() {
            // reqwest doesn't distinguish DNS vs. refused at this layer;
            // inspect the error chain for a hint.
            let msg = e.to_string();
            if msg.contains("dns") || msg.contains("resolve") || msg.contains("lookup") {
                ErrorType::NetworkDnsFailure
            } else {
                ErrorType::NetworkConnectionRefused
            }
        } else if e.to_string().to_ascii_lowercase().contains("ssl")
            || e.to_string().to_ascii_lowercase().contains("tls")
            || e.to_string().to_ascii_lowercase().contains("certificate")
        {
            ErrorType::NetworkSslError
        } else {
            ErrorType::Unknown
        };

        HttpResult {
            status: 0,
            headers: ResponseHeaders::default(),
            body: None,
            elapsed_ms: elapsed_ms(started),
            final_url,
            error: Some(FetchError::new(error_type, e.to_string())),
        }
    }
}

fn extract_headers(resp: &reqwest::Response) -> ResponseHeaders {
    let h = resp.headers();
    ResponseHeaders {
        etag: h
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        last_modified: h
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        date: h
            .get(reqwest::header::DATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        retry_after: h
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        content_type: h
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        content_length: h
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Parses a `Retry-After` header value: either a delay in seconds or an
/// HTTP-date. Only the seconds form is supported here; an HTTP-date value
/// that fails to parse as an integer is treated as absent.
pub fn parse_retry_after_seconds(v: &str) -> Option<u64> {
    v.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client() -> HttpClient {
        HttpClient::new("TestBot/1.0", Duration::from_secs(5), true).unwrap()
    }

    #[tokio::test]
    async fn fetches_ok_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let c = client().await;
        let result = c
            .fetch(
                &format!("{}/ok", server.uri()),
                FetchParams::default(),
                1024,
                &MimeGlobList::default(),
                &MimeGlobList::default(),
            )
            .await;

        assert!(result.is_success());
        assert_eq!(result.body.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn content_length_over_cap_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("x".repeat(100))
                    .insert_header("content-length", "100"),
            )
            .mount(&server)
            .await;

        let c = client().await;
        let result = c
            .fetch(
                &format!("{}/big", server.uri()),
                FetchParams::default(),
                10,
                &MimeGlobList::default(),
                &MimeGlobList::default(),
            )
            .await;

        assert_eq!(
            result.error.map(|e| e.error_type),
            Some(ErrorType::ContentTooLarge)
        );
    }

    #[tokio::test]
    async fn content_type_accept_list_rejects_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("binary")
                    .insert_header("content-type", "image/png"),
            )
            .mount(&server)
            .await;

        let c = client().await;
        let accept = MimeGlobList::parse("text/html");
        let result = c
            .fetch(
                &format!("{}/img", server.uri()),
                FetchParams::default(),
                1024,
                &accept,
                &MimeGlobList::default(),
            )
            .await;

        assert_eq!(
            result.error.map(|e| e.error_type),
            Some(ErrorType::ContentTypeRejected)
        );
    }

    #[tokio::test]
    async fn rate_limited_status_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let c = client().await;
        let result = c
            .fetch(
                &format!("{}/limited", server.uri()),
                FetchParams::default(),
                1024,
                &MimeGlobList::default(),
                &MimeGlobList::default(),
            )
            .await;

        assert_eq!(
            result.error.map(|e| e.error_type),
            Some(ErrorType::HttpRateLimited)
        );
    }

    #[tokio::test]
    async fn not_modified_has_no_body_and_no_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cached"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let c = client().await;
        let result = c
            .fetch(
                &format!("{}/cached", server.uri()),
                FetchParams {
                    if_none_match: Some("\"abc\""),
                    if_modified_since: None,
                },
                1024,
                &MimeGlobList::default(),
                &MimeGlobList::default(),
            )
            .await;

        assert!(result.is_not_modified());
        assert!(result.error.is_none());
        assert!(result.body.is_none());
    }

    #[test]
    fn retry_after_parses_seconds() {
        assert_eq!(parse_retry_after_seconds("2"), Some(2));
        assert_eq!(parse_retry_after_seconds("not-a-number"), None);
    }
}
