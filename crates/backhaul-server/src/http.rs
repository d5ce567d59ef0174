//! HTTP surface of the bridge
//!
//! Every inbound request, any method and path, is handed to the bridge.
//! The agent's response is replayed verbatim; every failure collapses to
//! one uniform 400 page so nothing about the tunnel leaks to callers.

use crate::bridge::{Bridge, BridgeError};
use backhaul_proto::TunneledRequest;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Fixed error page returned for every failed exchange
const ERROR_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>400 Bad Request</title></head>\n<body>\n<h1>Bad Request</h1>\n<p>The tunnel was unable to service this request.</p>\n</body>\n</html>\n";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to read request body: {0}")]
    Body(#[from] hyper::Error),

    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("invalid agent response: {0}")]
    Response(#[from] http::Error),
}

/// Hyper service entry point; never fails the connection itself
pub async fn proxy(
    req: Request<Incoming>,
    bridge: Arc<Bridge>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    info!("{} {}", req.method(), req.uri());

    match bridge_request(req, &bridge).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!("exchange failed: {}", e);
            Ok(bad_request())
        }
    }
}

async fn bridge_request(
    req: Request<Incoming>,
    bridge: &Bridge,
) -> Result<Response<Full<Bytes>>, ProxyError> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();

    let headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let request = TunneledRequest {
        method: parts.method.as_str().to_string(),
        uri: parts.uri.to_string(),
        headers,
        body: body.to_vec(),
    };

    let tunneled = bridge.exchange(&request).await?;

    let mut builder = Response::builder().status(tunneled.status);
    for (name, value) in &tunneled.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    Ok(builder.body(Full::new(Bytes::from(tunneled.body)))?)
}

/// The uniform failure response: fixed HTML body, no error details
pub fn bad_request() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .header(X_CONTENT_TYPE_OPTIONS, "nosniff")
        .body(Full::new(Bytes::from_static(ERROR_PAGE.as_bytes())))
        .expect("static response is always valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_request_shape() {
        let response = bad_request();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            response.headers().get(X_CONTENT_TYPE_OPTIONS).unwrap(),
            "nosniff"
        );
    }

    #[test]
    fn test_agent_response_replayed_verbatim() {
        let tunneled = backhaul_proto::TunneledResponse {
            status: 418,
            headers: vec![
                ("x-flavor".to_string(), "earl-grey".to_string()),
                ("x-flavor".to_string(), "oolong".to_string()),
            ],
            body: b"short and stout".to_vec(),
        };

        let mut builder = Response::builder().status(tunneled.status);
        for (name, value) in &tunneled.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder
            .body(Full::new(Bytes::from(tunneled.body.clone())))
            .unwrap();

        assert_eq!(response.status().as_u16(), 418);
        let flavors: Vec<_> = response.headers().get_all("x-flavor").iter().collect();
        assert_eq!(flavors, ["earl-grey", "oolong"]);
    }
}
