//! HTTP relay: one outbound request, response streamed back to the client.
//!
//! The transport client is scoped to the request so the TLS policy,
//! deadline, and redirect behavior of one request can never bleed into
//! another. The response body is never buffered; chunks flow from the
//! target to the client as they arrive, and a client disconnect drops the
//! stream, which aborts the upstream transfer within the current chunk.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{body::Body, response::Response};
use bytes::Bytes;
use futures_util::stream::Stream;
use http::Method;

use super::RelayParams;
use crate::{error::ProxyError, headers};

/// Execute the outbound request and stream the response back.
pub async fn proxy_http(params: RelayParams) -> Result<Response, ProxyError> {
    let RelayParams {
        method,
        body,
        instance,
        mut target,
        outbound,
        bypass,
        follow_redirects,
        deadline,
        overrides,
    } = params;

    // A ws/wss target on a plain request is relayed over HTTP.
    let converted = match target.scheme() {
        "ws" => target.set_scheme("http"),
        "wss" => target.set_scheme("https"),
        _ => Ok(()),
    };
    if converted.is_err() {
        return Err(ProxyError::InvalidUrl("scheme conversion failed".to_string()));
    }

    let redirect_policy = if follow_redirects {
        reqwest::redirect::Policy::limited(10)
    } else {
        reqwest::redirect::Policy::none()
    };

    let tls_config = bypass
        .client_config()
        .map_err(|e| ProxyError::Internal(e.to_string()))?;

    let client = reqwest::Client::builder()
        .use_preconfigured_tls(tls_config)
        .redirect(redirect_policy)
        .timeout(deadline)
        .build()
        .map_err(|e| ProxyError::Internal(format!("failed to build HTTP client: {e}")))?;

    let mut builder = client.request(method.clone(), target.clone()).headers(outbound);
    if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
        builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let upstream = builder.send().await.map_err(map_send_error)?;

    let status = upstream.status();
    let response_headers = headers::rewrite_response_headers(upstream.headers(), &overrides);

    tracing::debug!(
        instance = %instance.name,
        target = %target,
        status = %status,
        "Upstream responded, streaming body"
    );

    let relay_body = RelayBody {
        inner: Box::pin(upstream.bytes_stream()),
        instance: instance.name.clone(),
        target: target.to_string(),
        bytes_sent: 0,
        finished: false,
    };

    let mut response = Response::new(Body::from_stream(relay_body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

fn map_send_error(error: reqwest::Error) -> ProxyError {
    if error.is_timeout() {
        ProxyError::DeadlineExceeded
    } else if error.is_body() {
        ProxyError::BadRequestBody(error.to_string())
    } else {
        ProxyError::Upstream(error.to_string())
    }
}

/// Body stream that accounts for relayed bytes.
///
/// Dropping the stream before it finished means the client went away; the
/// partial transfer is recorded, never reported as an error.
struct RelayBody {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    instance: String,
    target: String,
    bytes_sent: u64,
    finished: bool,
}

impl Stream for RelayBody {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.bytes_sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                this.finished = true;
                if error.is_timeout() {
                    tracing::warn!(
                        instance = %this.instance,
                        target = %this.target,
                        bytes = this.bytes_sent,
                        "Deadline expired mid-stream, closing connection"
                    );
                } else {
                    tracing::warn!(
                        instance = %this.instance,
                        target = %this.target,
                        bytes = this.bytes_sent,
                        error = %error,
                        "Upstream read failed mid-stream, closing connection"
                    );
                }
                Poll::Ready(Some(Err(io::Error::other(error))))
            }
            Poll::Ready(None) => {
                this.finished = true;
                tracing::debug!(
                    instance = %this.instance,
                    target = %this.target,
                    bytes = this.bytes_sent,
                    "Relay complete"
                );
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        if !self.finished {
            tracing::info!(
                instance = %self.instance,
                target = %self.target,
                bytes = self.bytes_sent,
                status = "cancelled",
                "Client disconnected before relay completion"
            );
        }
    }
}
