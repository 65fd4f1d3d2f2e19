use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("no auth info provided")]
    NoAuthMethod,

    #[error("SSH connection error: {0}")]
    Connect(String),

    #[error("SSH session error: {0}")]
    Session(String),

    #[error("{0}")]
    Exec(String),

    #[error("{0}")]
    Copy(String),

    /// A task manager only runs once; its cursor and result stream are spent.
    #[error("Task manager has already been started")]
    AlreadyStarted,

    #[error("SSH protocol error: {0}")]
    SshProtocol(#[from] russh::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;
