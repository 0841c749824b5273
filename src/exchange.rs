//! The per-call exchange value and its tag-typed constructors.
//!
//! An [`HttpExchange`] owns everything one HTTP round-trip needs: the URL,
//! the request side (method, headers, body), the response once it arrives,
//! a proxy handle, timeout, and the redirect/raw-target flags. It threads
//! through an [`IO`] chain by value; configuration steps mutate it in `map`
//! combinators and the invoker hands it back with the response filled in.
//!
//! ```no_run
//! use tidewater::exchange::{http_io, GetString};
//! use url::Url;
//!
//! let url = Url::parse("https://api.example.com/users?page=1").unwrap();
//! let io = http_io::<GetString>(url).map(|mut exchange| {
//!     exchange.set_query_param("limit", "10");
//!     exchange
//! });
//! ```

use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::{codes, Error};
use crate::io::IO;
use crate::proxy::ProxySetting;
use crate::result::{ApiResult, VoidResult};

/// Default per-exchange timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_PREVIEW_BYTES: usize = 512;

/// Compile-time mapping from a request tag to its verb, default headers,
/// and response body mode.
pub trait RequestTag: Send + Sync + 'static {
    /// The HTTP verb for this tag.
    const METHOD: Method;
    /// When true the response body is written to
    /// [`HttpExchange::response_file`] instead of being kept in memory.
    const RESPONSE_TO_FILE: bool = false;
    /// Default request headers for this tag.
    fn decorate(_headers: &mut HeaderMap) {}
}

/// GET returning a text body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetString;
impl RequestTag for GetString {
    const METHOD: Method = Method::GET;
}

/// HEAD used for its status only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetStatus;
impl RequestTag for GetStatus {
    const METHOD: Method = Method::HEAD;
}

/// HEAD used for its headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetHeader;
impl RequestTag for GetHeader {
    const METHOD: Method = Method::HEAD;
}

/// GET whose response body is streamed to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetFile;
impl RequestTag for GetFile {
    const METHOD: Method = Method::GET;
    const RESPONSE_TO_FILE: bool = true;
}

/// POST with a JSON body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostJson;
impl RequestTag for PostJson {
    const METHOD: Method = Method::POST;
    fn decorate(headers: &mut HeaderMap) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
}

/// DELETE with an empty body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delete;
impl RequestTag for Delete {
    const METHOD: Method = Method::DELETE;
}

/// The response side of a completed round-trip.
#[derive(Debug, Clone)]
pub struct ExchangeResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body. Empty for file-mode downloads after the body has been
    /// written out.
    pub body: Bytes,
}

impl ExchangeResponse {
    /// The body decoded as UTF-8, lossily.
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// A header value as text, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// The success envelope `{"data": ...}` used by
/// [`HttpExchange::parse_json_response_result`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiDataResponse<T> {
    /// The payload under the `data` field.
    pub data: T,
}

/// Truncates a body to the first 512 bytes for error context, appending
/// `"..."` when cut. Never splits a UTF-8 sequence.
pub fn make_preview(text: &str) -> String {
    if text.len() <= MAX_PREVIEW_BYTES {
        return text.to_string();
    }
    let mut end = MAX_PREVIEW_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Joins cookie pairs as `k1=v1; k2=v2` for a `Cookie` request header.
pub fn create_request_cookie<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Per-call state for one HTTP exchange, parameterized by its request tag.
#[derive(Debug)]
pub struct HttpExchange<Tag: RequestTag> {
    /// Absolute request URL, owned.
    pub url: Url,
    /// HTTP verb; seeded from the tag.
    pub method: Method,
    /// Request headers; seeded from the tag's decoration.
    pub headers: HeaderMap,
    /// Text request body, if any.
    pub body: Option<String>,
    /// Populated after the round-trip.
    pub response: Option<ExchangeResponse>,
    /// Proxy to route through; when `None` the invoker borrows one from the
    /// manager's pool.
    pub proxy: Option<Arc<ProxySetting>>,
    /// When set, the request body is read from this file.
    pub body_file: Option<PathBuf>,
    /// Target for file-mode downloads (`GetFile`).
    pub response_file: Option<PathBuf>,
    /// Whether the manager follows redirects for this exchange.
    pub follow_redirect: bool,
    /// When true the invoker must not rewrite the request target, Host, or
    /// User-Agent; used for bit-exact signed URLs.
    pub no_modify_req: bool,
    /// The raw origin-form target recorded by
    /// [`set_host_target_raw`](Self::set_host_target_raw).
    pub raw_target: Option<String>,
    /// Round-trip timeout.
    pub timeout: Duration,
    /// Time the round-trip took, filled in by the invoker.
    pub latency: Option<Duration>,
    _tag: PhantomData<Tag>,
}

impl<Tag: RequestTag> Clone for HttpExchange<Tag> {
    fn clone(&self) -> Self {
        HttpExchange {
            url: self.url.clone(),
            method: self.method.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            response: self.response.clone(),
            proxy: self.proxy.clone(),
            body_file: self.body_file.clone(),
            response_file: self.response_file.clone(),
            follow_redirect: self.follow_redirect,
            no_modify_req: self.no_modify_req,
            raw_target: self.raw_target.clone(),
            timeout: self.timeout,
            latency: self.latency,
            _tag: PhantomData,
        }
    }
}

impl<Tag: RequestTag> HttpExchange<Tag> {
    /// Creates an exchange with the tag's default request and no response.
    pub fn new(url: Url) -> Self {
        let mut headers = HeaderMap::new();
        Tag::decorate(&mut headers);
        HttpExchange {
            url,
            method: Tag::METHOD,
            headers,
            body: None,
            response: None,
            proxy: None,
            body_file: None,
            response_file: None,
            follow_redirect: true,
            no_modify_req: false,
            raw_target: None,
            timeout: DEFAULT_TIMEOUT,
            latency: None,
            _tag: PhantomData,
        }
    }

    /// Sets (replacing) a request header.
    pub fn set_request_header(&mut self, name: &str, value: &str) -> VoidResult {
        let name = HeaderName::try_from(name).map_err(|err| {
            Error::new(codes::INVALID_ARGUMENT, format!("Invalid header name: {err}"))
        })?;
        let value = HeaderValue::try_from(value).map_err(|err| {
            Error::new(codes::INVALID_ARGUMENT, format!("Invalid header value: {err}"))
        })?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Sets several request headers.
    pub fn add_request_headers<K, V>(
        &mut self,
        headers: impl IntoIterator<Item = (K, V)>,
    ) -> VoidResult
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in headers {
            self.set_request_header(name.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    /// Replaces the value of `key` in the URL query, or appends the pair if
    /// the key is not present. Other pairs keep their order.
    pub fn set_query_param(&mut self, key: &str, value: &str) {
        let mut pairs: Vec<(String, String)> = self
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        match pairs.iter_mut().find(|(existing, _)| existing == key) {
            Some(pair) => pair.1 = value.to_string(),
            None => pairs.push((key.to_string(), value.to_string())),
        }
        let mut serializer = self.url.query_pairs_mut();
        serializer.clear();
        for (k, v) in &pairs {
            serializer.append_pair(k, v);
        }
        drop(serializer);
    }

    /// Sets `Content-Type: application/json`.
    pub fn content_type_json(&mut self) {
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }

    /// Uses an already-serialized JSON string as the request body.
    pub fn set_request_json_body_from_string(&mut self, json_text: impl Into<String>) {
        self.body = Some(json_text.into());
        self.content_type_json();
    }

    /// Serializes a JSON value as the request body.
    pub fn set_request_json_body(&mut self, body: &Value) {
        self.body = Some(body.to_string());
        self.content_type_json();
    }

    /// Finds `name` in the response's `Set-Cookie` headers, stripping
    /// surrounding quotes from the value.
    pub fn get_response_cookie(&self, name: &str) -> Option<String> {
        let response = self.response.as_ref()?;
        for header_value in response.headers.get_all(header::SET_COOKIE) {
            let Ok(cookie_header) = header_value.to_str() else {
                continue;
            };
            for part in cookie_header.split(';') {
                let part = part.trim();
                if let Some(value) = part.strip_prefix(name) {
                    if let Some(value) = value.strip_prefix('=') {
                        let value = value
                            .strip_prefix('"')
                            .and_then(|v| v.strip_suffix('"'))
                            .unwrap_or(value);
                        return Some(value.to_string());
                    }
                }
            }
        }
        None
    }

    /// Pins the request target to the URL's encoded path and query,
    /// byte-for-byte, and sets the Host header to `host[:port]`.
    ///
    /// Companion to [`no_modify_req`](Self::no_modify_req) for signed URLs
    /// whose reserved characters must survive untouched.
    pub fn set_host_target_raw(&mut self) -> VoidResult {
        let mut target = if self.url.path().is_empty() {
            "/".to_string()
        } else {
            self.url.path().to_string()
        };
        if let Some(query) = self.url.query() {
            if !query.is_empty() {
                target.push('?');
                target.push_str(query);
            }
        }
        self.raw_target = Some(target);

        let mut host_header = self.url.host_str().unwrap_or_default().to_string();
        if let Some(port) = self.url.port() {
            host_header.push(':');
            host_header.push_str(&port.to_string());
        }
        let value = HeaderValue::try_from(host_header.as_str()).map_err(|err| {
            Error::new(codes::INVALID_ARGUMENT, format!("Invalid host header: {err}"))
        })?;
        self.headers.insert(header::HOST, value);
        Ok(())
    }

    /// Ok when the response arrived with a 2xx status. No response at all
    /// is `Err(400, "Response is not available")`; any other status
    /// becomes the error code.
    pub fn expect_2xx(&self) -> VoidResult {
        let Some(response) = &self.response else {
            return Err(Error::new(
                codes::INVALID_ARGUMENT,
                "Response is not available",
            ));
        };
        let status = i32::from(response.status.as_u16());
        if !(200..300).contains(&status) {
            return Err(
                Error::new(status, format!("Expected 2xx response, got {status}"))
                    .with_status(status),
            );
        }
        Ok(())
    }

    /// True when a response arrived with a 2xx status.
    pub fn is_2xx(&self) -> bool {
        self.response
            .as_ref()
            .is_some_and(|response| response.status.is_success())
    }

    /// True when there is no response or its status is not 2xx.
    pub fn not_2xx(&self) -> bool {
        !self.is_2xx()
    }

    fn json_error(&self, code: i32, what: impl Into<String>) -> Error {
        let mut err = Error::new(code, what);
        match &self.response {
            Some(response) => {
                err.response_status = i32::from(response.status.as_u16());
                err.params.insert(
                    "response_body_preview".to_string(),
                    Value::String(make_preview(&response.body_string())),
                );
            }
            None => err.response_status = 0,
        }
        err
    }

    /// Parses the response body as a JSON value.
    ///
    /// No response is code 9001, an empty body 9000, a parse failure 9001;
    /// every error carries the status and a body preview.
    pub fn get_json_response(&self) -> ApiResult<Value> {
        let Some(response) = &self.response else {
            return Err(self.json_error(
                codes::JSON_DECODE,
                "Failed to decode/parse JSON (low-level): response is not available",
            ));
        };
        let body = response.body_string();
        if body.is_empty() {
            return Err(self.json_error(
                codes::JSON_MALFORMED,
                "Malformed JSON text: response body is empty",
            ));
        }
        serde_json::from_str(&body).map_err(|err| {
            tracing::error!(error = %err, "failed to parse JSON response");
            self.json_error(
                codes::JSON_DECODE,
                format!("Failed to decode/parse JSON (low-level): {err}"),
            )
        })
    }

    /// Parses the whole response body as `T`.
    pub fn parse_json_response<T: DeserializeOwned>(&self) -> ApiResult<T> {
        let value = self.get_json_response()?;
        serde_json::from_value(value).map_err(|err| {
            self.json_error(
                codes::JSON_TYPE_MISMATCH,
                format!("JSON type mismatch: {err}"),
            )
        })
    }

    /// Parses the `data` field of an object response body as `T`.
    pub fn parse_json_data_response<T: DeserializeOwned>(&self) -> ApiResult<T> {
        let value = self.get_json_response()?;
        let Some(object) = value.as_object() else {
            return Err(self.json_error(
                codes::JSON_INVALID_SCHEMA,
                "JSON does not conform to expected schema",
            ));
        };
        let Some(data) = object.get("data") else {
            return Err(self.json_error(
                codes::JSON_MISSING_FIELD,
                "Required JSON field missing: 'data'",
            ));
        };
        serde_json::from_value(data.clone()).map_err(|err| {
            self.json_error(
                codes::JSON_TYPE_MISMATCH,
                format!("JSON type mismatch: {err}"),
            )
        })
    }

    /// Decodes a success/error envelope: `{"error": {...}}` resolves to
    /// that error, `{"data": ...}` to `ApiDataResponse<T>`, anything else
    /// to a 9005 schema error.
    pub fn parse_json_response_result<T: DeserializeOwned>(
        &self,
    ) -> ApiResult<ApiDataResponse<T>> {
        let value = self.get_json_response()?;
        let Some(object) = value.as_object() else {
            return Err(self.json_error(
                codes::JSON_INVALID_SCHEMA,
                "ApiResponse is not an object",
            ));
        };
        if let Some(error_value) = object.get("error") {
            return Err(serde_json::from_value::<Error>(error_value.clone()).unwrap_or_else(
                |err| {
                    self.json_error(
                        codes::JSON_INVALID_SCHEMA,
                        format!("JSON does not conform to expected schema: {err}"),
                    )
                },
            ));
        }
        if object.contains_key("data") {
            return serde_json::from_value(value.clone()).map_err(|err| {
                self.json_error(
                    codes::JSON_INVALID_SCHEMA,
                    format!("JSON does not conform to expected schema: {err}"),
                )
            });
        }
        Err(self.json_error(
            codes::JSON_INVALID_SCHEMA,
            "Neither data nor error field found in ApiResponse",
        ))
    }
}

/// An IO that, when run, constructs a fresh exchange for `url` with the
/// tag's default request.
pub fn http_io<Tag: RequestTag>(url: Url) -> IO<HttpExchange<Tag>> {
    IO::new(move || {
        let url = url.clone();
        async move { Ok(HttpExchange::<Tag>::new(url)) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange_with_response(status: u16, body: &str) -> HttpExchange<GetString> {
        let mut exchange =
            HttpExchange::<GetString>::new(Url::parse("https://api.example.com/x").unwrap());
        exchange.response = Some(ExchangeResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::copy_from_slice(body.as_bytes()),
        });
        exchange
    }

    #[test]
    fn tags_seed_method_and_headers() {
        let url = Url::parse("https://api.example.com/x").unwrap();
        assert_eq!(HttpExchange::<GetString>::new(url.clone()).method, Method::GET);
        assert_eq!(HttpExchange::<GetStatus>::new(url.clone()).method, Method::HEAD);
        assert_eq!(HttpExchange::<Delete>::new(url.clone()).method, Method::DELETE);

        let post = HttpExchange::<PostJson>::new(url);
        assert_eq!(post.method, Method::POST);
        assert_eq!(
            post.headers.get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert!(GetFile::RESPONSE_TO_FILE);
        assert!(!PostJson::RESPONSE_TO_FILE);
    }

    #[tokio::test]
    async fn http_io_builds_a_fresh_exchange_per_run() {
        let url = Url::parse("https://api.example.com/x").unwrap();
        let io = http_io::<GetString>(url).map(|mut exchange| {
            exchange.set_query_param("page", "1");
            exchange
        });
        let first = io.run().await.unwrap();
        let second = io.run().await.unwrap();
        assert_eq!(first.url.as_str(), second.url.as_str());
        assert!(first.follow_redirect);
        assert_eq!(first.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn set_query_param_replaces_or_appends() {
        let mut exchange = HttpExchange::<GetString>::new(
            Url::parse("https://api.example.com/x?a=1&b=2").unwrap(),
        );
        exchange.set_query_param("a", "9");
        assert_eq!(exchange.url.query(), Some("a=9&b=2"));
        exchange.set_query_param("c", "3");
        assert_eq!(exchange.url.query(), Some("a=9&b=2&c=3"));
    }

    #[test]
    fn json_body_helpers_set_content_type() {
        let mut exchange =
            HttpExchange::<PostJson>::new(Url::parse("https://api.example.com/x").unwrap());
        exchange.set_request_json_body(&serde_json::json!({ "a": 1 }));
        assert_eq!(exchange.body.as_deref(), Some(r#"{"a":1}"#));
        assert_eq!(
            exchange.headers.get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn cookie_helpers() {
        let mut exchange = exchange_with_response(200, "");
        let response = exchange.response.as_mut().unwrap();
        response.headers.append(
            header::SET_COOKIE,
            HeaderValue::from_static("session=\"abc123\"; Path=/; HttpOnly"),
        );
        response.headers.append(
            header::SET_COOKIE,
            HeaderValue::from_static("other=zzz"),
        );

        assert_eq!(exchange.get_response_cookie("session").unwrap(), "abc123");
        assert_eq!(exchange.get_response_cookie("other").unwrap(), "zzz");
        assert!(exchange.get_response_cookie("missing").is_none());

        assert_eq!(
            create_request_cookie([("a", "1"), ("b", "2")]),
            "a=1; b=2"
        );
    }

    #[test]
    fn raw_target_preserves_encoded_path_and_query() {
        let mut exchange = HttpExchange::<GetString>::new(
            Url::parse("https://host.example:8443/assets%2Fone?sig=a%2Fb").unwrap(),
        );
        exchange.set_host_target_raw().unwrap();
        exchange.no_modify_req = true;
        assert_eq!(
            exchange.raw_target.as_deref(),
            Some("/assets%2Fone?sig=a%2Fb")
        );
        assert_eq!(
            exchange.headers.get(header::HOST).unwrap(),
            "host.example:8443"
        );
    }

    #[test]
    fn expect_2xx_paths() {
        let no_response =
            HttpExchange::<GetString>::new(Url::parse("https://api.example.com/x").unwrap());
        let err = no_response.expect_2xx().unwrap_err();
        assert_eq!(err.code, 400);
        assert_eq!(err.what, "Response is not available");
        assert!(no_response.not_2xx());

        let ok = exchange_with_response(204, "");
        assert!(ok.expect_2xx().is_ok());
        assert!(ok.is_2xx());

        let not_found = exchange_with_response(404, "missing");
        let err = not_found.expect_2xx().unwrap_err();
        assert_eq!(err.code, 404);
        assert!(err.what.contains("Expected 2xx response, got 404"));
    }

    #[test]
    fn preview_truncates_on_utf8_boundaries() {
        assert_eq!(make_preview("short"), "short");

        let long = "x".repeat(600);
        let preview = make_preview(&long);
        assert_eq!(preview.len(), MAX_PREVIEW_BYTES + 3);
        assert!(preview.ends_with("..."));

        // multi-byte character straddling the cut point
        let mut tricky = "y".repeat(MAX_PREVIEW_BYTES - 1);
        tricky.push_str("日本語");
        let preview = make_preview(&tricky);
        assert!(preview.ends_with("..."));
        assert!(preview.len() <= MAX_PREVIEW_BYTES + 3);
    }

    #[test]
    fn json_error_codes() {
        let empty = exchange_with_response(200, "");
        let err = empty.get_json_response().unwrap_err();
        assert_eq!(err.code, codes::JSON_MALFORMED);
        assert_eq!(err.response_status, 200);

        let invalid = exchange_with_response(200, "not json");
        let err = invalid.get_json_response().unwrap_err();
        assert_eq!(err.code, codes::JSON_DECODE);
        assert_eq!(
            err.params["response_body_preview"],
            Value::String("not json".to_string())
        );

        let no_response =
            HttpExchange::<GetString>::new(Url::parse("https://api.example.com/x").unwrap());
        let err = no_response.get_json_response().unwrap_err();
        assert_eq!(err.code, codes::JSON_DECODE);
        assert_eq!(err.response_status, 0);

        let mismatch = exchange_with_response(200, r#"{"value": "text"}"#);
        #[derive(Debug, Deserialize)]
        struct Typed {
            #[allow(dead_code)]
            value: i32,
        }
        let err = mismatch.parse_json_response::<Typed>().unwrap_err();
        assert_eq!(err.code, codes::JSON_TYPE_MISMATCH);

        let not_object = exchange_with_response(200, "[1,2]");
        let err = not_object.parse_json_data_response::<i32>().unwrap_err();
        assert_eq!(err.code, codes::JSON_INVALID_SCHEMA);

        let missing_data = exchange_with_response(200, r#"{"other": 1}"#);
        let err = missing_data.parse_json_data_response::<i32>().unwrap_err();
        assert_eq!(err.code, codes::JSON_MISSING_FIELD);
    }

    #[test]
    fn data_response_parses_the_data_field() {
        let exchange = exchange_with_response(200, r#"{"data": 123, "extra": true}"#);
        assert_eq!(exchange.parse_json_data_response::<i32>().unwrap(), 123);
    }

    #[test]
    fn envelope_decoding() {
        let success = exchange_with_response(200, r#"{"data": 123}"#);
        let decoded = success.parse_json_response_result::<i32>().unwrap();
        assert_eq!(decoded, ApiDataResponse { data: 123 });

        let failure = exchange_with_response(400, r#"{"error": {"code": 409, "what": "Conflict"}}"#);
        let err = failure.parse_json_response_result::<i32>().unwrap_err();
        assert_eq!(err.code, 409);
        assert!(err.what.contains("Conflict"));

        let neither = exchange_with_response(200, r#"{"unrelated": 1}"#);
        let err = neither.parse_json_response_result::<i32>().unwrap_err();
        assert_eq!(err.code, codes::JSON_INVALID_SCHEMA);
        assert!(err.what.contains("Neither data nor error"));
    }
}
