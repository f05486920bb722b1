use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to launch instance on port {port}: {source}")]
    InstanceLaunch {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("instance limit of {0} reached")]
    InstanceLimit(usize),
    #[error("this server cannot launch instances")]
    InstancesDisabled,
}
