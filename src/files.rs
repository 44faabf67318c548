use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::auth::SshAuth;
use crate::ec2::Inventory;
use crate::errors::{Error, MultiError, Result};
use crate::ssh::{Host, RemoteShell, ScpDownloadOptions};

/// Which files to pull from which ASGs, and where to store them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RemoteFileSpecification {
    pub asg_names: Vec<String>,
    /// Remote directory to the name filters (bash-style wildcards) of the
    /// files to fetch from it.
    pub remote_path_to_file_filter: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub use_sudo: bool,
    pub ssh_user: String,
    pub ssh_auth: SshAuth,
    /// Files land in `<local_destination_dir>/<public ip>/<remote dir name>`.
    pub local_destination_dir: String,
}

impl RemoteFileSpecification {
    pub fn load(file_path: &str) -> Result<Self> {
        log::info!("loading RemoteFileSpecification from {}", file_path);

        if !Path::new(file_path).exists() {
            return Err(Error::InvalidSpec(format!(
                "file {} does not exists",
                file_path
            )));
        }

        let f = File::open(file_path)?;
        Ok(serde_yaml::from_reader(f)?)
    }

    pub fn sync(&self, file_path: &str) -> Result<()> {
        log::info!("syncing RemoteFileSpecification to '{}'", file_path);

        let path = Path::new(file_path);
        if let Some(parent_dir) = path.parent() {
            fs::create_dir_all(parent_dir)?;
        }

        let d = serde_yaml::to_string(self)?;
        let mut f = File::create(file_path)?;
        f.write_all(d.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ssh_user.is_empty() {
            return Err(Error::InvalidSpec("'ssh_user' cannot be empty".to_string()));
        }
        if self.asg_names.is_empty() {
            return Err(Error::InvalidSpec("'asg_names' cannot be empty".to_string()));
        }
        if self.remote_path_to_file_filter.is_empty() {
            return Err(Error::InvalidSpec(
                "'remote_path_to_file_filter' cannot be empty".to_string(),
            ));
        }
        if self.local_destination_dir.is_empty() {
            return Err(Error::InvalidSpec(
                "'local_destination_dir' cannot be empty".to_string(),
            ));
        }
        self.ssh_auth.validate()?;
        Ok(())
    }
}

/// Last element of a remote POSIX path, ignoring trailing slashes.
/// Returns "/" for the root and "." for an empty path.
pub fn remote_dir_base_name(remote_dir: &str) -> &str {
    if remote_dir.is_empty() {
        return ".";
    }
    let trimmed = remote_dir.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// `<local_dir>/<public_ip>/<base name of remote_dir>`
pub fn local_destination_dir(local_dir: &str, public_ip: &str, remote_dir: &str) -> PathBuf {
    let mut p = Path::new(local_dir).join(public_ip);
    match remote_dir_base_name(remote_dir) {
        "/" | "." => {}
        base => p.push(base),
    }
    p
}

/// Fetches remote files from EC2 instances found through `I`, over `R`.
pub struct Fetcher<I, R> {
    inventory: I,
    shell: R,
}

impl<I, R> Fetcher<I, R>
where
    I: Inventory,
    R: RemoteShell,
{
    pub fn new(inventory: I, shell: R) -> Self {
        Fetcher { inventory, shell }
    }

    pub fn shell(&self) -> &R {
        &self.shell
    }

    fn host_for_instance(&self, ssh_user: &str, auth: &SshAuth, instance_id: &str) -> Result<Host> {
        let method = auth.validate()?;
        let public_ip = self.inventory.public_ip_of_instance(instance_id)?;
        log::info!(
            "instance {} resolved to {} (auth {})",
            instance_id,
            public_ip,
            method.name()
        );
        Ok(Host::new(&public_ip, ssh_user, method))
    }

    /// Returns the contents of `file_path` on the instance.
    pub fn fetch_contents_of_file_from_instance(
        &self,
        ssh_user: &str,
        auth: &SshAuth,
        instance_id: &str,
        use_sudo: bool,
        file_path: &str,
    ) -> Result<String> {
        let host = self.host_for_instance(ssh_user, auth, instance_id)?;
        self.shell.fetch_contents_of_file(&host, use_sudo, file_path)
    }

    /// Returns file path to contents for every path on the instance.
    pub fn fetch_contents_of_files_from_instance(
        &self,
        ssh_user: &str,
        auth: &SshAuth,
        instance_id: &str,
        use_sudo: bool,
        file_paths: &[&str],
    ) -> Result<HashMap<String, String>> {
        let host = self.host_for_instance(ssh_user, auth, instance_id)?;
        self.shell.fetch_contents_of_files(&host, use_sudo, file_paths)
    }

    /// Returns instance ID to the contents of `file_path`, failing on the
    /// first instance that errors.
    pub fn fetch_contents_of_file_from_asg(
        &self,
        ssh_user: &str,
        auth: &SshAuth,
        asg_name: &str,
        use_sudo: bool,
        file_path: &str,
    ) -> Result<HashMap<String, String>> {
        let instance_ids = self.inventory.instance_ids_for_asg(asg_name)?;

        let mut contents = HashMap::new();
        for instance_id in instance_ids {
            let c = self.fetch_contents_of_file_from_instance(
                ssh_user,
                auth,
                &instance_id,
                use_sudo,
                file_path,
            )?;
            contents.insert(instance_id, c);
        }
        Ok(contents)
    }

    /// Returns instance ID to file path to contents, failing on the first
    /// instance that errors.
    pub fn fetch_contents_of_files_from_asg(
        &self,
        ssh_user: &str,
        auth: &SshAuth,
        asg_name: &str,
        use_sudo: bool,
        file_paths: &[&str],
    ) -> Result<HashMap<String, HashMap<String, String>>> {
        let instance_ids = self.inventory.instance_ids_for_asg(asg_name)?;

        let mut contents = HashMap::new();
        for instance_id in instance_ids {
            let c = self.fetch_contents_of_files_from_instance(
                ssh_user,
                auth,
                &instance_id,
                use_sudo,
                file_paths,
            )?;
            contents.insert(instance_id, c);
        }
        Ok(contents)
    }

    /// Downloads the files in `remote_dir` matching `file_name_filters` to
    /// `<local_dir>/<public ip>/<remote dir name>`.
    #[allow(clippy::too_many_arguments)]
    pub fn fetch_files_from_instance(
        &self,
        ssh_user: &str,
        auth: &SshAuth,
        instance_id: &str,
        use_sudo: bool,
        remote_dir: &str,
        local_dir: &str,
        file_name_filters: &[String],
    ) -> Result<()> {
        let host = self.host_for_instance(ssh_user, auth, instance_id)?;

        let dest = local_destination_dir(local_dir, &host.hostname, remote_dir);
        if !dest.exists() {
            log::info!("creating local dir '{}'", dest.display());
            fs::create_dir_all(&dest)?;
        }

        let opts = ScpDownloadOptions {
            remote_host: host,
            remote_dir: remote_dir.to_string(),
            local_dir: dest,
            file_name_filters: file_name_filters.to_vec(),
            max_file_size_mb: 0,
        };
        self.shell.scp_dir_from(&opts, use_sudo)
    }

    /// Downloads the files named in `spec` from every instance of every ASG
    /// in it. Failures are collected and reported together.
    pub fn fetch_files_from_asgs(&self, spec: &RemoteFileSpecification) -> Result<()> {
        spec.ssh_auth.validate()?;

        let mut errs = MultiError::new();
        for asg_name in &spec.asg_names {
            let instance_ids = match self.inventory.instance_ids_for_asg(asg_name) {
                Ok(ids) => ids,
                Err(e) => {
                    log::warn!("failed to list instances of ASG '{}' ({})", asg_name, e);
                    errs.push(e);
                    continue;
                }
            };

            for (remote_dir, filters) in &spec.remote_path_to_file_filter {
                for instance_id in &instance_ids {
                    if let Err(e) = self.fetch_files_from_instance(
                        &spec.ssh_user,
                        &spec.ssh_auth,
                        instance_id,
                        spec.use_sudo,
                        remote_dir,
                        &spec.local_destination_dir,
                        filters,
                    ) {
                        log::warn!(
                            "failed to fetch '{}' from {} ({})",
                            remote_dir,
                            instance_id,
                            e
                        );
                        errs.push(e);
                    }
                }
            }
        }
        errs.into_result()
    }
}
