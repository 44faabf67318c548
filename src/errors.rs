use std::{fmt, io};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Backing errors for all lookups, SSH sessions and file transfers.
#[derive(Error, Debug)]
pub enum Error {
    #[error("one of key_pair, ssh_agent or override_ssh_agent must be set for SshAuth")]
    NoAuthMethod,
    #[error("only one of key_pair, ssh_agent or override_ssh_agent should be specified in SshAuth")]
    MultipleAuthMethods,
    #[error("auto scaling group '{asg_name}' not found in region {region}")]
    AsgNotFound { asg_name: String, region: String },
    #[error("public IP for EC2 instance '{instance_id}' not found in region {region}")]
    IpNotFound { instance_id: String, region: String },
    #[error("failed API {message}")]
    Api { message: String },
    #[error("failed to set up AWS client: {message}")]
    Client { message: String },
    #[error("command '{command}' on {host} exited with status {exit_status}: {stderr}")]
    Command {
        host: String,
        command: String,
        exit_status: i32,
        stderr: String,
    },
    #[error("failed to authenticate as '{user}' on {host}: {message}")]
    Auth {
        host: String,
        user: String,
        message: String,
    },
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid specification: {0}")]
    InvalidSpec(String),
    #[error(transparent)]
    Multiple(#[from] MultiError),
}

/// Errors collected across a batch of independent operations.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Returns `Ok(())` if nothing was collected.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Multiple(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.errors.len())?;
        for e in &self.errors {
            write!(f, "\n* {}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
