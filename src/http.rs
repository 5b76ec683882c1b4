//! HTTP API for the grid
//!
//! ## Grid API
//! - `GET /health` - Liveness and grid counters
//! - `GET /grid` - Full grid projection
//! - `GET /market?sort=index|price_asc|price_desc` - Unowned cells
//! - `GET /history` - The caller's purchases
//!
//! ## Cell API (requires `x-wallet-identity`)
//! - `POST /cells/{id}/purchase` - Buy a cell
//! - `PUT /cells/{id}/image` - Attach an image (body = bytes, `Content-Type` = mime)
//!
//! ## Assets
//! - `GET /assets/{path}` - Serve an uploaded image
//!
//! ## Example Usage
//!
//! ```bash
//! # Cheapest cells first
//! curl 'http://localhost:8080/market?sort=price_asc'
//!
//! # Buy a cell
//! curl -X POST -H "x-wallet-identity: 7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU" \
//!      http://localhost:8080/cells/5f0c.../purchase
//!
//! # Attach an image
//! curl -X PUT -H "x-wallet-identity: 7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU" \
//!      -H "Content-Type: image/png" --data-binary @logo.png \
//!      http://localhost:8080/cells/5f0c.../image
//! ```

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::error::{BlobError, GridError};
use crate::identity::{IdentityProvider, RequestIdentity, IDENTITY_HEADER};
use crate::services::Services;
use crate::types::CellId;
use crate::view::{self, SortKey};

/// `?sort=` query parameters
#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    sort: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: String,
    kind: &'a str,
    retryable: bool,
}

/// HTTP status for an engine error
pub fn status_for(error: &GridError) -> StatusCode {
    match error {
        GridError::NotAuthenticated => StatusCode::UNAUTHORIZED,
        GridError::NotFound(_) => StatusCode::NOT_FOUND,
        GridError::AlreadySold { .. } | GridError::Conflict(_) => StatusCode::CONFLICT,
        GridError::NotOwner => StatusCode::FORBIDDEN,
        GridError::InvalidImage(_) => StatusCode::BAD_REQUEST,
        GridError::UploadFailed(_) | GridError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_kind(error: &GridError) -> &'static str {
    match error {
        GridError::NotAuthenticated => "not_authenticated",
        GridError::NotFound(_) => "not_found",
        GridError::AlreadySold { .. } => "already_sold",
        GridError::NotOwner => "not_owner",
        GridError::InvalidImage(_) => "invalid_image",
        GridError::UploadFailed(_) => "upload_failed",
        GridError::StoreUnavailable(_) => "store_unavailable",
        GridError::Conflict(_) => "conflict",
    }
}

fn response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => response(status, "application/json", Bytes::from(bytes)),
        Err(e) => {
            error!(error = %e, "Failed to encode response");
            response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                Bytes::from_static(b"Internal Server Error"),
            )
        }
    }
}

fn error_response(error: &GridError) -> Response<Full<Bytes>> {
    if error.is_business_outcome() {
        debug!(error = %error, "Request rejected");
    } else {
        error!(error = %error, "Request failed");
    }
    json_response(
        status_for(error),
        &ErrorBody {
            error: error.to_string(),
            kind: error_kind(error),
            retryable: error.is_retryable(),
        },
    )
}

fn bad_request(status: StatusCode, message: String) -> Response<Full<Bytes>> {
    debug!(status = %status, message = %message, "Bad request");
    json_response(
        status,
        &ErrorBody {
            error: message,
            kind: "bad_request",
            retryable: false,
        },
    )
}

fn not_found() -> Response<Full<Bytes>> {
    response(StatusCode::NOT_FOUND, "text/plain", Bytes::from_static(b"Not Found"))
}

fn parse_sort(query: Option<&str>) -> Result<SortKey, String> {
    let query: ListQuery = match query {
        Some(q) => serde_urlencoded::from_str(q).map_err(|e| format!("invalid query: {}", e))?,
        None => ListQuery::default(),
    };
    match query.sort {
        None => Ok(SortKey::default()),
        Some(raw) => SortKey::parse(&raw).ok_or_else(|| format!("unknown sort '{}'", raw)),
    }
}

fn request_identity<B>(req: &Request<B>) -> RequestIdentity {
    RequestIdentity::from_header(
        req.headers()
            .get(IDENTITY_HEADER)
            .and_then(|v| v.to_str().ok()),
    )
}

/// HTTP server state
pub struct HttpServer {
    services: Arc<Services>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(services: Arc<Services>, bind_addr: SocketAddr) -> Self {
        Self {
            services,
            bind_addr,
        }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle_request(req).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route a request to its handler
    pub async fn handle_request<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        let query = req.uri().query().map(str::to_string);
        let identity = request_identity(&req);

        debug!(method = %method, path = %path, "Incoming request");

        match (method, path.as_str()) {
            (Method::GET, "/health") => self.handle_health().await,
            (Method::GET, "/grid") => self.handle_grid(query.as_deref(), &identity).await,
            (Method::GET, "/market") => self.handle_market(query.as_deref(), &identity).await,
            (Method::GET, "/history") => self.handle_history(&identity).await,

            (Method::GET, p) if p.starts_with("/assets/") => {
                let asset = p.strip_prefix("/assets/").unwrap_or("");
                self.handle_get_asset(asset).await
            }

            (method, p) if p.starts_with("/cells/") => {
                let rest = p.strip_prefix("/cells/").unwrap_or("");
                match rest.split_once('/') {
                    Some((id, "purchase")) if method == Method::POST => {
                        self.handle_purchase(&identity, id).await
                    }
                    Some((id, "image")) if method == Method::PUT => {
                        let id = id.to_string();
                        self.handle_attach_image(req, &identity, &id).await
                    }
                    _ => not_found(),
                }
            }

            _ => not_found(),
        }
    }

    /// GET /health
    async fn handle_health(&self) -> Response<Full<Bytes>> {
        let counts = async {
            let snapshot = self.services.cells.snapshot().await?;
            let purchases = self.services.cells.purchase_count().await?;
            Ok::<_, GridError>((snapshot.cells().len(), snapshot.owned_count(), purchases))
        };

        match counts.await {
            Ok((cells, owned, purchases)) => json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "status": "ok",
                    "cells": cells,
                    "owned": owned,
                    "purchase_count": purchases,
                    "pricing": self.services.purchases.policy(),
                }),
            ),
            Err(e) => error_response(&e),
        }
    }

    /// GET /grid
    async fn handle_grid(&self, query: Option<&str>, identity: &RequestIdentity) -> Response<Full<Bytes>> {
        let sort = match parse_sort(query) {
            Ok(sort) => sort,
            Err(message) => return bad_request(StatusCode::BAD_REQUEST, message),
        };
        let caller = identity.current_identity();

        match self.services.cells.snapshot().await {
            Ok(snapshot) => json_response(
                StatusCode::OK,
                &view::project(&snapshot, caller.as_ref(), sort),
            ),
            Err(e) => error_response(&e.into()),
        }
    }

    /// GET /market
    async fn handle_market(&self, query: Option<&str>, identity: &RequestIdentity) -> Response<Full<Bytes>> {
        let sort = match parse_sort(query) {
            Ok(sort) => sort,
            Err(message) => return bad_request(StatusCode::BAD_REQUEST, message),
        };
        let caller = identity.current_identity();

        match self.services.cells.snapshot().await {
            Ok(snapshot) => {
                let projection = view::project(&snapshot, caller.as_ref(), sort);
                json_response(
                    StatusCode::OK,
                    &serde_json::json!({
                        "sort": sort,
                        "count": projection.available.len(),
                        "cells": projection.available,
                    }),
                )
            }
            Err(e) => error_response(&e.into()),
        }
    }

    /// GET /history
    async fn handle_history(&self, identity: &RequestIdentity) -> Response<Full<Bytes>> {
        let identity = match identity.require_identity() {
            Ok(identity) => identity,
            Err(e) => return error_response(&e),
        };

        match self.services.cells.list_owned_by(&identity).await {
            Ok(owned) => {
                let entries = view::history(&owned);
                json_response(
                    StatusCode::OK,
                    &serde_json::json!({
                        "owner": identity,
                        "owner_short": identity.short(),
                        "count": entries.len(),
                        "purchases": entries,
                    }),
                )
            }
            Err(e) => error_response(&e.into()),
        }
    }

    /// POST /cells/{id}/purchase
    async fn handle_purchase(&self, identity: &RequestIdentity, id: &str) -> Response<Full<Bytes>> {
        let cell_id: CellId = match id.parse() {
            Ok(id) => id,
            Err(_) => return error_response(&GridError::NotFound(id.to_string())),
        };

        match self.services.purchases.purchase_as(identity, cell_id).await {
            Ok(receipt) => json_response(StatusCode::OK, &receipt),
            Err(e) => error_response(&e),
        }
    }

    /// PUT /cells/{id}/image
    async fn handle_attach_image<B>(
        &self,
        req: Request<B>,
        identity: &RequestIdentity,
        id: &str,
    ) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let cell_id: CellId = match id.parse() {
            Ok(id) => id,
            Err(_) => return error_response(&GridError::NotFound(id.to_string())),
        };
        let caller = identity.current_identity();
        let mime = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let max_bytes = self.services.assets.limits().max_bytes;
        let body = match Limited::new(req.into_body(), max_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return bad_request(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("image exceeds limit of {} bytes", max_bytes),
                );
            }
            Err(e) => {
                return bad_request(StatusCode::BAD_REQUEST, format!("failed to read body: {}", e));
            }
        };

        match self
            .services
            .assets
            .attach_image(cell_id, caller.as_ref(), &body, &mime)
            .await
        {
            Ok(asset) => json_response(StatusCode::CREATED, &asset),
            Err(e) => error_response(&e),
        }
    }

    /// GET /assets/{path}
    async fn handle_get_asset(&self, path: &str) -> Response<Full<Bytes>> {
        match self.services.blobs.read(path).await {
            Ok(blob) => {
                let content_type = HeaderValue::from_str(&blob.content_type)
                    .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
                let mut response = response(StatusCode::OK, "application/octet-stream", blob.data);
                response.headers_mut().insert(header::CONTENT_TYPE, content_type);
                response
            }
            Err(BlobError::NotFound(_)) | Err(BlobError::InvalidPath(_)) => not_found(),
            Err(e) => {
                error!(path = %path, error = %e, "Failed to read asset");
                response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "text/plain",
                    Bytes::from_static(b"Asset unavailable"),
                )
            }
        }
    }
}
