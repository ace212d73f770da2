/// Config of deferred query batching, shared by all batches of a Registry.
#[derive(Debug, Clone, PartialEq, Eq, clap::Args, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Merge deferred queries of a connection into one combined command.
    /// When false, each deferred query runs on its own, though all of a
    /// batch's queries still run together when any one is materialized.
    #[clap(
        long = "allow-batching",
        env = "QUERY_FUTURE_ALLOW_BATCHING",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub allow_batching: bool,
    /// Run a batch holding a single query directly, rather than as a
    /// combined command of one.
    #[clap(
        long = "bypass-single",
        env = "QUERY_FUTURE_BYPASS_SINGLE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub bypass_single: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allow_batching: true,
            bypass_single: true,
        }
    }
}
