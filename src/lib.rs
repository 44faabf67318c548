//! Test helpers that pull files from the EC2 instances of Auto Scaling
//! Groups over SSH.
//!
//! ```no_run
//! use asg_files::{Ec2Inventory, Fetcher, SshAuth, SshShell};
//!
//! let fetcher = Fetcher::new(Ec2Inventory::new("us-west-2")?, SshShell::default());
//! let hostnames = fetcher.fetch_contents_of_file_from_asg(
//!     "ubuntu",
//!     &SshAuth::with_ssh_agent(),
//!     "web-asg",
//!     false,
//!     "/etc/hostname",
//! )?;
//! for (instance_id, hostname) in hostnames {
//!     println!("{} -> {}", instance_id, hostname.trim());
//! }
//! # Ok::<(), asg_files::Error>(())
//! ```

pub mod auth;
pub mod ec2;
pub mod errors;
pub mod files;
pub mod ssh;

pub use auth::{AuthMethod, Ec2Keypair, KeyPair, SshAgent, SshAuth};
pub use ec2::{Ec2Inventory, Inventory};
pub use errors::{Error, MultiError, Result};
pub use files::{local_destination_dir, remote_dir_base_name, Fetcher, RemoteFileSpecification};
pub use ssh::{Host, RemoteShell, ScpDownloadOptions, Session, SshShell};
