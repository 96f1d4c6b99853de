//! Client configuration pointed at a local mock server

use std::time::Duration;
use nozomi_dl::config::{EndpointConfig, RetryConfig};
use nozomi_dl::{Config, NozomiClient};
use wiremock::MockServer;

/// Configuration whose index host is `server`, with millisecond retry delays
pub fn mock_config(server: &MockServer) -> Config {
    Config {
        endpoints: EndpointConfig {
            index_domain: server.address().to_string(),
            scheme: "http".to_string(),
            ..Default::default()
        },
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 1.5,
            jitter: false,
        },
        ..Default::default()
    }
}

/// HTTP client talking to `server`
pub fn mock_client(server: &MockServer) -> NozomiClient {
    NozomiClient::new(mock_config(server)).expect("valid test config")
}
