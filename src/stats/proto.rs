//! Wire messages of `xray.app.stats.command.StatsService`.

/// Fully qualified path of the unary QueryStats method.
pub const QUERY_STATS_PATH: &str = "/xray.app.stats.command.StatsService/QueryStats";

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryStatsRequest {
    /// Substring matched against counter names.
    #[prost(string, tag = "1")]
    pub pattern: String,
    #[prost(bool, tag = "2")]
    pub reset: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Stat {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "2")]
    pub value: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryStatsResponse {
    #[prost(message, repeated, tag = "1")]
    pub stat: Vec<Stat>,
}
