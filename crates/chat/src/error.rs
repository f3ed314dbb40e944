use std::time::Duration;

use {
    corral_agents::AgentError, corral_sandbox::PoolError, thiserror::Error,
};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("no runner freed up within {}s", .0.as_secs())]
    QueueTimeout(Duration),

    #[error(transparent)]
    Agent(#[from] AgentError),
}
