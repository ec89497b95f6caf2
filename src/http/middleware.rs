//! Admission middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, Request as HttpRequest, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, field, instrument, Span};

use crate::config::ServerConfig;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Decision, IdentityKey, RateLimiter, Tier, UNKNOWN_CLIENT};

/// Body of a 429 response.
pub const RATE_LIMITED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Body of a 500 response caused by an unreachable counter store.
pub const STORE_FAILURE_MESSAGE: &str = "Internal Server Error";

/// Limiters and header names used to admit requests.
///
/// Install with [`axum::middleware::from_fn_with_state`] and [`admit`]:
///
/// ```ignore
/// let app = Router::new()
///     .route("/", get(handler))
///     .layer(axum::middleware::from_fn_with_state(admission, admit));
/// ```
#[derive(Clone)]
pub struct Admission {
    ip_limiter: Arc<RateLimiter>,
    token_limiter: Arc<RateLimiter>,
    token_header: HeaderName,
    forwarded_header: HeaderName,
}

impl Admission {
    /// Create an admission check with the `API_KEY` and `X-Forwarded-For` headers.
    pub fn new(ip_limiter: Arc<RateLimiter>, token_limiter: Arc<RateLimiter>) -> Self {
        Self {
            ip_limiter,
            token_limiter,
            token_header: HeaderName::from_static("api_key"),
            forwarded_header: HeaderName::from_static("x-forwarded-for"),
        }
    }

    /// Create an admission check using the header names from `config`.
    pub fn from_config(
        config: &ServerConfig,
        ip_limiter: Arc<RateLimiter>,
        token_limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        Ok(Self::new(ip_limiter, token_limiter)
            .with_token_header(parse_header_name(&config.token_header)?)
            .with_forwarded_header(parse_header_name(&config.forwarded_header)?))
    }

    /// Set the header that carries API tokens.
    pub fn with_token_header(mut self, name: HeaderName) -> Self {
        self.token_header = name;
        self
    }

    /// Set the header that carries forwarded client addresses.
    pub fn with_forwarded_header(mut self, name: HeaderName) -> Self {
        self.forwarded_header = name;
        self
    }

    /// The limiter governing `tier`.
    pub fn limiter(&self, tier: Tier) -> &RateLimiter {
        match tier {
            Tier::Ip => &self.ip_limiter,
            Tier::Token => &self.token_limiter,
        }
    }

    /// Derive the identity a request is counted against.
    ///
    /// A non-empty token header wins. Otherwise the client address is the
    /// first forwarded entry, falling back to the peer address of the
    /// connection, with any port removed.
    pub fn identify<B>(&self, request: &HttpRequest<B>) -> IdentityKey {
        let headers = request.headers();

        if let Some(token) = header_value(headers, &self.token_header) {
            return IdentityKey::token(token);
        }

        let forwarded = header_value(headers, &self.forwarded_header)
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|addr| !addr.is_empty());
        if let Some(addr) = forwarded {
            return IdentityKey::client_addr(addr);
        }

        match request.extensions().get::<ConnectInfo<SocketAddr>>() {
            Some(ConnectInfo(peer)) => IdentityKey::new(Tier::Ip, &peer.ip().to_string()),
            None => IdentityKey::new(Tier::Ip, UNKNOWN_CLIENT),
        }
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("ip_policy", &self.ip_limiter.policy())
            .field("token_policy", &self.token_limiter.policy())
            .field("token_header", &self.token_header)
            .field("forwarded_header", &self.forwarded_header)
            .finish()
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    HeaderName::try_from(name)
        .map_err(|e| TurnstileError::Config(format!("invalid header name `{}`: {}", name, e)))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Admit or reject a request before it reaches the wrapped handler.
///
/// Admitted requests are forwarded unchanged and the downstream response is
/// returned as-is. Rejections answer 429; a store failure answers 500 so that
/// "unknown" is never reported to the client as "over the limit".
#[instrument(name = "admission", skip_all, fields(tier = field::Empty, key = field::Empty))]
pub async fn admit(State(admission): State<Admission>, request: Request, next: Next) -> Response {
    let key = admission.identify(&request);

    let span = Span::current();
    span.record("tier", key.tier().as_str());
    span.record("key", field::display(&key));

    match admission.limiter(key.tier()).allow(&key).await {
        Ok(decision) if decision.is_allowed() => next.run(request).await,
        Ok(decision) => {
            debug!(count = decision.count, limit = decision.limit, "Request rejected");
            rate_limited(&decision)
        }
        Err(error) => {
            debug!(error = %error, "Admission check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                STORE_FAILURE_MESSAGE,
            )
                .into_response()
        }
    }
}

fn rate_limited(decision: &Decision) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                HeaderName::from_static("x-ratelimit-limit"),
                decision.limit.to_string(),
            ),
            (
                HeaderName::from_static("x-ratelimit-remaining"),
                decision.remaining().to_string(),
            ),
        ],
        RATE_LIMITED_MESSAGE,
    )
        .into_response()
}
