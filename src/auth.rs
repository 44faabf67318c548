use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// OpenSSH-formatted key material held in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct KeyPair {
    #[serde(default)]
    pub public_key: String,
    pub private_key: String,
}

impl KeyPair {
    pub fn new(public_key: &str, private_key: &str) -> Self {
        Self {
            public_key: public_key.to_string(),
            private_key: private_key.to_string(),
        }
    }

    /// Reads the private key (and optionally its public half) from disk.
    pub fn load(private_key_path: &str, public_key_path: Option<&str>) -> Result<Self> {
        log::info!("loading private key from {}", private_key_path);
        let private_key = fs::read_to_string(Path::new(private_key_path))?;
        let public_key = match public_key_path {
            Some(p) => fs::read_to_string(Path::new(p))?,
            None => String::new(),
        };
        Ok(Self {
            public_key,
            private_key,
        })
    }
}

/// An EC2 key pair registered in a region.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Ec2Keypair {
    pub name: String,
    pub region: String,
    pub key_pair: KeyPair,
}

/// Keyring used in place of the agent at `SSH_AUTH_SOCK`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SshAgent {
    #[serde(default)]
    pub keys: Vec<KeyPair>,
}

impl SshAgent {
    pub fn new(keys: Vec<KeyPair>) -> Self {
        Self { keys }
    }

    pub fn add_key(&mut self, key: KeyPair) {
        self.keys.push(key);
    }
}

/// Exactly one of the fields must be set, which `validate` checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SshAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pair: Option<Ec2Keypair>,
    /// Use the agent started outside this process (`SSH_AUTH_SOCK`).
    #[serde(default)]
    pub ssh_agent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_ssh_agent: Option<SshAgent>,
}

/// The single enabled authentication method of a validated `SshAuth`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AuthMethod {
    KeyPair(KeyPair),
    SshAgent,
    OverrideSshAgent(SshAgent),
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::KeyPair(_) => "keypair",
            AuthMethod::SshAgent => "sshagent",
            AuthMethod::OverrideSshAgent(_) => "overridesshagent",
        }
    }
}

impl SshAuth {
    pub fn with_key_pair(key_pair: Ec2Keypair) -> Self {
        Self {
            key_pair: Some(key_pair),
            ..Default::default()
        }
    }

    pub fn with_ssh_agent() -> Self {
        Self {
            ssh_agent: true,
            ..Default::default()
        }
    }

    pub fn with_override_ssh_agent(agent: SshAgent) -> Self {
        Self {
            override_ssh_agent: Some(agent),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<AuthMethod> {
        let enabled = [
            self.key_pair.is_some(),
            self.ssh_agent,
            self.override_ssh_agent.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        match enabled {
            0 => return Err(Error::NoAuthMethod),
            1 => {}
            _ => return Err(Error::MultipleAuthMethods),
        }

        if let Some(kp) = &self.key_pair {
            return Ok(AuthMethod::KeyPair(kp.key_pair.clone()));
        }
        if let Some(agent) = &self.override_ssh_agent {
            return Ok(AuthMethod::OverrideSshAgent(agent.clone()));
        }
        Ok(AuthMethod::SshAgent)
    }
}
