//! The client manager: pooled request dispatch, TLS assembly, proxy
//! rotation, redirect following, and the IO invoker glue.
//!
//! [`HttpClientManager`] owns one base `reqwest` client (connection pool,
//! TLS context) plus a lazily-built client per distinct proxy, a
//! [`ProxyPool`] seeded from the selected profile, and, when constructed
//! outside a tokio runtime, its own sized multi-thread runtime.
//! [`http_request_io`] bridges an [`HttpExchange`] into one managed
//! round-trip inside an [`IO`] chain.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use url::Url;

use crate::config::{HttpClientConfigProvider, HttpclientConfig};
use crate::error::{codes, Error};
use crate::exchange::{ExchangeResponse, HttpExchange, RequestTag, DEFAULT_TIMEOUT};
use crate::io::IO;
use crate::proxy::{no_proxy_matches, ProxyPool, ProxySetting, DEFAULT_BLACKLIST_TIMEOUT};
use crate::result::ApiResult;

const MAX_REDIRECTS: u32 = 5;

fn default_user_agent() -> HeaderValue {
    HeaderValue::from_static(concat!("tidewater/", env!("CARGO_PKG_VERSION")))
}

/// Per-request dispatch parameters.
#[derive(Debug, Clone)]
pub struct HttpRequestParams {
    /// When set, the request body is read from this file.
    pub body_file: Option<PathBuf>,
    /// Whether the manager follows redirects for this request.
    pub follow_redirect: bool,
    /// When true the request headers pass through untouched (no default
    /// User-Agent, caller-pinned Host respected).
    pub no_modify_req: bool,
    /// Round-trip timeout.
    pub timeout: Duration,
}

impl Default for HttpRequestParams {
    fn default() -> Self {
        HttpRequestParams {
            body_file: None,
            follow_redirect: true,
            no_modify_req: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// The body handed to one dispatch.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// No body.
    Empty,
    /// In-memory text body.
    Text(String),
    /// Body read from a file at dispatch time.
    File(PathBuf),
}

/// TLS material resolved from a config profile, kept so proxied clients can
/// be built lazily with the same context.
struct TlsAssembly {
    min_version: Option<reqwest::tls::Version>,
    root_certificates: Vec<reqwest::Certificate>,
    builtin_roots: bool,
    insecure_skip_verify: bool,
}

impl TlsAssembly {
    fn from_config(config: &HttpclientConfig) -> ApiResult<Self> {
        let mut root_certificates = Vec::new();

        for entry in &config.certificates {
            let certificate = match entry.file_format.as_str() {
                "der" => reqwest::Certificate::from_der(entry.cert_content.as_bytes()),
                _ => reqwest::Certificate::from_pem(entry.cert_content.as_bytes()),
            };
            root_certificates.push(certificate.map_err(|err| {
                Error::new(
                    codes::INVALID_ARGUMENT,
                    format!("Invalid embedded certificate: {err}"),
                )
            })?);
        }

        for entry in &config.certificate_files {
            let content = std::fs::read(&entry.cert_path).map_err(|err| {
                Error::new(
                    codes::CONFIG_UNREADABLE,
                    format!(
                        "Failed to read certificate file {}: {err}",
                        entry.cert_path.display()
                    ),
                )
            })?;
            let certificate = match entry.file_format.as_str() {
                "der" => reqwest::Certificate::from_der(&content),
                _ => reqwest::Certificate::from_pem(&content),
            };
            root_certificates.push(certificate.map_err(|err| {
                Error::new(
                    codes::INVALID_ARGUMENT,
                    format!(
                        "Invalid certificate file {}: {err}",
                        entry.cert_path.display()
                    ),
                )
            })?);
        }

        for dir in &config.verify_paths {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(path = %dir.display(), error = %err, "skipping unreadable verify path");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let is_pem = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("pem") || ext.eq_ignore_ascii_case("crt"));
                if !is_pem {
                    continue;
                }
                match std::fs::read(&path) {
                    Ok(content) => match reqwest::Certificate::from_pem(&content) {
                        Ok(certificate) => root_certificates.push(certificate),
                        Err(err) => {
                            tracing::warn!(path = %path.display(), error = %err, "skipping invalid certificate")
                        }
                    },
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "skipping unreadable certificate")
                    }
                }
            }
        }

        Ok(TlsAssembly {
            min_version: config.ssl_method.min_tls_version(),
            root_certificates,
            builtin_roots: config.default_verify_path,
            insecure_skip_verify: config.insecure_skip_verify,
        })
    }

    fn apply(&self, mut builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        if let Some(version) = self.min_version {
            builder = builder.min_tls_version(version);
        }
        for certificate in &self.root_certificates {
            builder = builder.add_root_certificate(certificate.clone());
        }
        builder = builder.tls_built_in_root_certs(self.builtin_roots);
        if self.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        builder
    }
}

fn map_transport_error(err: reqwest::Error) -> Error {
    let code = if err.is_timeout() {
        codes::CONNECTION_TIMEOUT
    } else if err.is_connect() {
        codes::CONNECTION_REFUSED
    } else {
        codes::HOST_UNREACHABLE
    };
    tracing::warn!(error = %err, code, "transport failure");
    Error::new(code, format!("HTTP request failed: {err}"))
}

fn is_redirect_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// Resolves a `Location` header against the current URL.
///
/// `Url::join` implements the RFC 3986 reference-resolution rules this
/// needs: absolute URIs parse as-is, `//host/...` inherits the scheme,
/// `/...` inherits the origin, and relative paths resolve against the
/// base's directory.
fn resolve_redirect_url(base: &Url, location: &str) -> Option<Url> {
    if location.is_empty() {
        return None;
    }
    base.join(location).ok()
}

/// Connection-pool-backed request dispatch with proxy rotation and
/// redirect following.
pub struct HttpClientManager {
    base_client: reqwest::Client,
    proxied_clients: Mutex<HashMap<ProxySetting, reqwest::Client>>,
    tls: TlsAssembly,
    proxy_pool: ProxyPool,
    profile_name: String,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    stopped: AtomicBool,
}

impl HttpClientManager {
    /// Builds a manager from the named profile (default profile when
    /// `None`).
    ///
    /// Outside a tokio runtime this also starts a multi-thread runtime
    /// sized by the profile's `threads_num`; inside one, the ambient
    /// runtime serves and none is created.
    pub fn new(
        provider: &HttpClientConfigProvider,
        profile: Option<&str>,
    ) -> ApiResult<Self> {
        let profile_name = profile
            .map(str::to_string)
            .unwrap_or_else(|| provider.default_name().to_string());
        let config = provider.get_profile(&profile_name)?;

        let tls = TlsAssembly::from_config(config)?;
        let base_client = Self::build_client(&tls, None)?;
        let proxy_pool = ProxyPool::new(config.proxy_pool.clone());

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(_) => None,
            Err(_) => Some(
                tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(config.effective_threads())
                    .enable_all()
                    .build()
                    .map_err(|err| {
                        Error::new(
                            codes::INVALID_ARGUMENT,
                            format!("Failed to start executor: {err}"),
                        )
                    })?,
            ),
        };

        tracing::info!(
            profile = %profile_name,
            threads = config.effective_threads(),
            proxies = config.proxy_pool.len(),
            "http client manager started"
        );

        Ok(HttpClientManager {
            base_client,
            proxied_clients: Mutex::new(HashMap::new()),
            tls,
            proxy_pool,
            profile_name,
            runtime: Mutex::new(runtime),
            stopped: AtomicBool::new(false),
        })
    }

    fn build_client(tls: &TlsAssembly, proxy: Option<&ProxySetting>) -> ApiResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
        builder = tls.apply(builder);
        if let Some(setting) = proxy {
            let mut proxy = reqwest::Proxy::all(format!("http://{}", setting.endpoint()))
                .map_err(|err| {
                    Error::new(
                        codes::INVALID_ARGUMENT,
                        format!("Invalid proxy {}: {err}", setting.endpoint()),
                    )
                })?;
            if !setting.username.is_empty() {
                proxy = proxy.basic_auth(&setting.username, &setting.password);
            }
            builder = builder.proxy(proxy);
        }
        builder.build().map_err(|err| {
            Error::new(
                codes::INVALID_ARGUMENT,
                format!("Failed to build HTTP client: {err}"),
            )
        })
    }

    fn client_for(&self, proxy: Option<&ProxySetting>) -> ApiResult<reqwest::Client> {
        let Some(setting) = proxy else {
            return Ok(self.base_client.clone());
        };
        let mut cache = self
            .proxied_clients
            .lock()
            .expect("proxied client cache mutex poisoned");
        if let Some(client) = cache.get(setting) {
            return Ok(client.clone());
        }
        let client = Self::build_client(&self.tls, Some(setting))?;
        cache.insert(setting.clone(), client.clone());
        Ok(client)
    }

    /// Stops the owned runtime, if any. Idempotent; also called on drop.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(runtime) = self
            .runtime
            .lock()
            .expect("runtime mutex poisoned")
            .take()
        {
            runtime.shutdown_background();
        }
        tracing::info!(profile = %self.profile_name, "http client manager stopped");
    }

    /// Handle to the owned runtime, when the manager started one.
    pub fn runtime_handle(&self) -> Option<tokio::runtime::Handle> {
        self.runtime
            .lock()
            .expect("runtime mutex poisoned")
            .as_ref()
            .map(|runtime| runtime.handle().clone())
    }

    /// The profile this manager was built from.
    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    /// Borrows the next proxy from the pool.
    pub fn borrow_proxy(&self) -> Option<Arc<ProxySetting>> {
        self.proxy_pool.next()
    }

    /// Blacklists a proxy; `None` means the default 300 s.
    pub fn blacklist_proxy(&self, proxy: &ProxySetting, timeout: Option<Duration>) {
        self.proxy_pool
            .blacklist(proxy, timeout.unwrap_or(DEFAULT_BLACKLIST_TIMEOUT));
    }

    /// Clears the proxy blacklist.
    pub fn reset_proxy_blacklist(&self) {
        self.proxy_pool.reset_blacklist();
    }

    /// True when the pool has at least one entry.
    pub fn has_proxy_pool(&self) -> bool {
        !self.proxy_pool.is_empty()
    }

    /// Direct access to the pool for entry management.
    pub fn proxy_pool(&self) -> &ProxyPool {
        &self.proxy_pool
    }

    /// High-level dispatch: one pooled round-trip per hop, following up to
    /// five redirects for GET and HEAD.
    ///
    /// Redirect statuses are 301, 302, 303, 307, and 308. A missing or
    /// unresolvable `Location` returns the redirect response itself, as
    /// does a 3xx on any other method.
    pub async fn request(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: RequestBody,
        params: &HttpRequestParams,
        proxy: Option<Arc<ProxySetting>>,
    ) -> ApiResult<ExchangeResponse> {
        let mut url = url;
        let mut redirects_left = MAX_REDIRECTS;
        loop {
            let response = self
                .request_pooled(
                    method.clone(),
                    url.clone(),
                    headers.clone(),
                    body.clone(),
                    params,
                    proxy.clone(),
                )
                .await?;

            if !params.follow_redirect
                || redirects_left == 0
                || (method != Method::GET && method != Method::HEAD)
                || !is_redirect_status(response.status)
            {
                return Ok(response);
            }
            let Some(location) = response.header("location").map(str::to_string) else {
                return Ok(response);
            };
            let Some(next) = resolve_redirect_url(&url, &location) else {
                return Ok(response);
            };
            tracing::debug!(from = %url, to = %next, status = response.status.as_u16(), "following redirect");
            url = next;
            redirects_left -= 1;
        }
    }

    /// One pooled round-trip, no redirect handling.
    ///
    /// The NO_PROXY bypass applies here, and only to proxies flagged
    /// `from_env`; explicitly configured proxies are always used. Unless
    /// `no_modify_req` is set, a default User-Agent is added.
    pub async fn request_pooled(
        &self,
        method: Method,
        url: Url,
        mut headers: HeaderMap,
        body: RequestBody,
        params: &HttpRequestParams,
        proxy: Option<Arc<ProxySetting>>,
    ) -> ApiResult<ExchangeResponse> {
        let proxy = proxy.filter(|setting| {
            !(setting.from_env
                && url
                    .host_str()
                    .map(no_proxy_matches)
                    .unwrap_or(false))
        });
        let client = self.client_for(proxy.as_deref())?;

        if !params.no_modify_req && !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, default_user_agent());
        }

        let mut request = client
            .request(method.clone(), url.clone())
            .headers(headers)
            .timeout(params.timeout);
        request = match body {
            RequestBody::Empty => request,
            RequestBody::Text(text) => request.body(text),
            RequestBody::File(path) => {
                let content = tokio::fs::read(&path).await.map_err(|err| {
                    Error::new(
                        codes::INVALID_ARGUMENT,
                        format!("Failed to read body file {}: {err}", path.display()),
                    )
                })?;
                request.body(content)
            }
        };

        tracing::debug!(
            method = %method,
            url = %url,
            proxied = proxy.is_some(),
            "executing HTTP request"
        );

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let response_headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_transport_error)?;

        tracing::debug!(status = status.as_u16(), bytes = body.len(), "received HTTP response");

        Ok(ExchangeResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}

impl Drop for HttpClientManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bridges an exchange into one managed round-trip.
///
/// Returns a function suitable for [`IO::then`]: it fills in request
/// parameters from the exchange, borrows a proxy from the pool when the
/// exchange has none, dispatches, records latency, writes file-mode bodies
/// out, and re-emits the exchange with its response populated.
pub fn http_request_io<Tag: RequestTag>(
    manager: Arc<HttpClientManager>,
) -> impl Fn(HttpExchange<Tag>) -> IO<HttpExchange<Tag>> {
    move |exchange| {
        let manager = Arc::clone(&manager);
        IO::new(move || {
            let manager = Arc::clone(&manager);
            let mut exchange = exchange.clone();
            async move {
                let params = HttpRequestParams {
                    body_file: exchange.body_file.clone(),
                    follow_redirect: exchange.follow_redirect,
                    no_modify_req: exchange.no_modify_req,
                    timeout: exchange.timeout,
                };
                let proxy = match &exchange.proxy {
                    Some(proxy) => Some(Arc::clone(proxy)),
                    None => manager.borrow_proxy(),
                };
                let body = if let Some(path) = &params.body_file {
                    RequestBody::File(path.clone())
                } else if let Some(text) = &exchange.body {
                    RequestBody::Text(text.clone())
                } else {
                    RequestBody::Empty
                };

                let started = Instant::now();
                let response = manager
                    .request(
                        exchange.method.clone(),
                        exchange.url.clone(),
                        exchange.headers.clone(),
                        body,
                        &params,
                        proxy,
                    )
                    .await
                    .map_err(|err| {
                        tracing::error!(code = err.code, url = %exchange.url, "http request io failed");
                        err
                    })?;
                exchange.latency = Some(started.elapsed());

                if Tag::RESPONSE_TO_FILE {
                    if let Some(path) = &exchange.response_file {
                        tokio::fs::write(path, &response.body).await.map_err(|err| {
                            Error::new(
                                codes::INVALID_ARGUMENT,
                                format!(
                                    "Failed to write response file {}: {err}",
                                    path.display()
                                ),
                            )
                        })?;
                        exchange.response = Some(ExchangeResponse {
                            status: response.status,
                            headers: response.headers,
                            body: Bytes::new(),
                        });
                        return Ok(exchange);
                    }
                }
                exchange.response = Some(response);
                Ok(exchange)
            }
        })
    }
}
