//! gRPC transport to a node's stats API.

use std::time::Duration;

use async_trait::async_trait;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};

use crate::registry::Node;
use crate::stats::proto::{QueryStatsRequest, QueryStatsResponse, Stat, QUERY_STATS_PATH};
use crate::stats::{ProbeError, StatsClient};

pub struct GrpcStatsClient {
    timeout: Duration,
}

impl GrpcStatsClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn channel(&self, node: &Node) -> Result<Channel, ProbeError> {
        let endpoint = Endpoint::from_shared(endpoint_uri(&node.address, node.api_port))
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?
            .connect_timeout(self.timeout)
            .timeout(self.timeout);

        match tokio::time::timeout(self.timeout, endpoint.connect()).await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(e)) => Err(ProbeError::Unreachable(e.to_string())),
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl StatsClient for GrpcStatsClient {
    async fn connect(&self, node: &Node) -> Result<(), ProbeError> {
        self.channel(node).await.map(|_| ())
    }

    async fn query_stats(&self, node: &Node, pattern: &str) -> Result<Vec<Stat>, ProbeError> {
        let channel = self.channel(node).await?;
        let mut grpc = tonic::client::Grpc::new(channel);

        let call = async {
            grpc.ready()
                .await
                .map_err(|e| ProbeError::Unreachable(e.to_string()))?;
            let request = QueryStatsRequest {
                pattern: pattern.to_string(),
                reset: false,
            };
            let response: tonic::Response<QueryStatsResponse> = grpc
                .unary(
                    tonic::Request::new(request),
                    PathAndQuery::from_static(QUERY_STATS_PATH),
                    tonic::codec::ProstCodec::default(),
                )
                .await
                .map_err(|status| ProbeError::Rpc(status.message().to_string()))?;
            Ok::<_, ProbeError>(response.into_inner().stat)
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }
}

fn endpoint_uri(address: &str, port: u16) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("http://[{address}]:{port}")
    } else {
        format!("http://{address}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16) -> Node {
        Node {
            id: 1,
            name: "edge-1".into(),
            address: "127.0.0.1".into(),
            port: 12345,
            protocol: "vless".into(),
            api_port: port,
            is_connected: true,
            last_checked: None,
        }
    }

    #[test]
    fn test_ipv6_addresses_are_bracketed() {
        assert_eq!(endpoint_uri("10.0.0.1", 54321), "http://10.0.0.1:54321");
        assert_eq!(endpoint_uri("::1", 54321), "http://[::1]:54321");
        assert_eq!(endpoint_uri("[::1]", 54321), "http://[::1]:54321");
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable_within_bound() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = GrpcStatsClient::new(Duration::from_secs(2));
        let started = std::time::Instant::now();
        assert!(client.connect(&node(port)).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
