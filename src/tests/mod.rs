//! Consolidated end-to-end tests that exercise the full request lifecycle.


use std::{net::SocketAddr, sync::Arc};

use axum::{Router, body::Body, extract::connect_info::ConnectInfo, http::Request};

use crate::{
    AppState, build_app, config::InstanceConfig, registry::InstanceRegistry,
    resolve::StaticResolver,
};

/// Build an app with a single installed instance and a fixed-table resolver.
pub fn app_with_instance(name: &str, config: InstanceConfig, resolver: StaticResolver) -> Router {
    let registry = Arc::new(InstanceRegistry::new());
    registry
        .setup(name, &config)
        .expect("test instance config is valid");

    let state = AppState {
        registry,
        resolver: Arc::new(resolver),
    };
    build_app(state, "proxy")
}

pub fn instance_with_tokens(tokens: &[&str]) -> InstanceConfig {
    InstanceConfig {
        tokens: tokens.iter().map(|t| t.to_string()).collect(),
        ..Default::default()
    }
}

/// Remote peer used for requests driven through `oneshot`.
pub fn test_peer() -> SocketAddr {
    "198.51.100.7:40000".parse().unwrap()
}

/// A GET request to the proxy with the connect-info extension the handler
/// expects from a real listener.
pub fn proxy_request(path_and_query: &str) -> Request<Body> {
    let mut request = Request::builder()
        .uri(path_and_query)
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(ConnectInfo(test_peer()));
    request
}
