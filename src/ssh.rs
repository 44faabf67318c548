use std::collections::HashMap;
use std::convert::TryFrom;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::{AuthMethod, KeyPair};
use crate::errors::{Error, MultiError, Result};

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A remote host and how to log into it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Host {
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub auth: AuthMethod,
}

impl Host {
    pub fn new(hostname: &str, user: &str, auth: AuthMethod) -> Self {
        Host {
            hostname: hostname.to_string(),
            port: DEFAULT_PORT,
            user: user.to_string(),
            auth,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

pub struct Session {
    ssh: ssh2::Session,
    addr: String,
}

impl Session {
    pub fn connect(host: &Host, timeout: Duration) -> Result<Self> {
        let addr = host.addr();
        log::info!("connecting to {} as '{}'", addr, host.user);

        let mut last_err = None;
        let mut tcp = None;
        for a in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&a, timeout) {
                Ok(s) => {
                    tcp = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let tcp = match tcp {
            Some(s) => s,
            None => {
                return Err(last_err
                    .unwrap_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("no address resolved for {}", addr),
                        )
                    })
                    .into())
            }
        };

        let mut sess = ssh2::Session::new()?;
        sess.set_tcp_stream(tcp);
        sess.set_timeout(timeout_millis(timeout));
        sess.handshake()?;

        let mut sess = Session { ssh: sess, addr };
        sess.authenticate(&host.user, &host.auth)?;
        Ok(sess)
    }

    fn authenticate(&mut self, user: &str, auth: &AuthMethod) -> Result<()> {
        log::debug!("authenticating on {} with {}", self.addr, auth.name());
        match auth {
            AuthMethod::KeyPair(kp) => self.userauth_key_pair(user, kp)?,
            AuthMethod::SshAgent => self.userauth_agent(user)?,
            AuthMethod::OverrideSshAgent(agent) => {
                let sess = &*self;
                let i = authenticate_with_keyring(&sess.addr, user, &agent.keys, |kp| {
                    sess.userauth_key_pair(user, kp)?;
                    Ok(sess.authenticated())
                })?;
                log::debug!("key {} accepted on {}", i, self.addr);
            }
        }

        if !self.authenticated() {
            return Err(Error::Auth {
                host: self.addr.clone(),
                user: user.to_string(),
                message: format!("{} auth was not accepted", auth.name()),
            });
        }
        Ok(())
    }

    fn userauth_key_pair(&self, user: &str, kp: &KeyPair) -> Result<()> {
        let public_key = if kp.public_key.trim().is_empty() {
            None
        } else {
            Some(kp.public_key.as_str())
        };
        self.ssh
            .userauth_pubkey_memory(user, public_key, &kp.private_key, None)?;
        Ok(())
    }

    /// Runs the command and returns its stdout.
    pub fn cmd(&mut self, cmd: &str) -> Result<String> {
        let mut out = Vec::new();
        self.cmd_to_writer(cmd, &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Runs the command, streaming its stdout into `w`.
    pub fn cmd_to_writer<W: Write>(&mut self, cmd: &str, w: &mut W) -> Result<u64> {
        log::debug!("running '{}' on {}", cmd, self.addr);
        let mut channel = self.ssh.channel_session()?;
        channel.exec(cmd)?;
        let n = io::copy(&mut channel, w)?;

        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;
        channel.wait_close()?;

        let exit_status = channel.exit_status()?;
        if exit_status != 0 {
            return Err(Error::Command {
                host: self.addr.clone(),
                command: cmd.to_string(),
                exit_status,
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(n)
    }
}

impl Deref for Session {
    type Target = ssh2::Session;
    fn deref(&self) -> &Self::Target {
        &self.ssh
    }
}

impl DerefMut for Session {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ssh
    }
}

/// Where to copy remote files from and to.
#[derive(Debug, Clone)]
pub struct ScpDownloadOptions {
    pub remote_host: Host,
    pub remote_dir: String,
    pub local_dir: PathBuf,
    /// Bash-style wildcards matched against file names. Empty matches all.
    pub file_name_filters: Vec<String>,
    /// Skips files this large or larger when non-zero.
    pub max_file_size_mb: u64,
}

/// Reads and copies files from remote hosts.
pub trait RemoteShell {
    fn fetch_contents_of_file(&self, host: &Host, use_sudo: bool, file_path: &str)
        -> Result<String>;

    fn fetch_contents_of_files(
        &self,
        host: &Host,
        use_sudo: bool,
        file_paths: &[&str],
    ) -> Result<HashMap<String, String>> {
        let mut contents = HashMap::new();
        for p in file_paths {
            let c = self.fetch_contents_of_file(host, use_sudo, p)?;
            contents.insert(p.to_string(), c);
        }
        Ok(contents)
    }

    /// Copies the matching files directly under `remote_dir` into `local_dir`.
    fn scp_dir_from(&self, opts: &ScpDownloadOptions, use_sudo: bool) -> Result<()>;
}

/// `RemoteShell` over libssh2, opening one session per operation.
#[derive(Debug, Clone)]
pub struct SshShell {
    connect_timeout: Duration,
}

impl Default for SshShell {
    fn default() -> Self {
        SshShell {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl SshShell {
    pub fn new(connect_timeout: Duration) -> Self {
        SshShell { connect_timeout }
    }
}

impl RemoteShell for SshShell {
    fn fetch_contents_of_file(
        &self,
        host: &Host,
        use_sudo: bool,
        file_path: &str,
    ) -> Result<String> {
        let mut sess = Session::connect(host, self.connect_timeout)?;
        sess.cmd(&with_sudo(use_sudo, &format!("cat {}", shell_quote(file_path))))
    }

    fn fetch_contents_of_files(
        &self,
        host: &Host,
        use_sudo: bool,
        file_paths: &[&str],
    ) -> Result<HashMap<String, String>> {
        let mut sess = Session::connect(host, self.connect_timeout)?;
        let mut contents = HashMap::new();
        for p in file_paths {
            let c = sess.cmd(&with_sudo(use_sudo, &format!("cat {}", shell_quote(p))))?;
            contents.insert(p.to_string(), c);
        }
        Ok(contents)
    }

    fn scp_dir_from(&self, opts: &ScpDownloadOptions, use_sudo: bool) -> Result<()> {
        let mut sess = Session::connect(&opts.remote_host, self.connect_timeout)?;

        let listed = sess.cmd(&find_files_command(opts, use_sudo))?;
        let remote_files = parse_file_list(&listed);
        log::info!(
            "found {} file(s) to copy in '{}' on {}",
            remote_files.len(),
            opts.remote_dir,
            opts.remote_host.hostname
        );

        copy_listed_files(&remote_files, &opts.local_dir, |remote_path, local_path| {
            copy_file_from_remote(&mut sess, remote_path, local_path, use_sudo)
        })
    }
}

/// Tries each key in order until `try_key` reports it accepted, returning
/// the index of that key.
fn authenticate_with_keyring<F>(
    host: &str,
    user: &str,
    keys: &[KeyPair],
    mut try_key: F,
) -> Result<usize>
where
    F: FnMut(&KeyPair) -> Result<bool>,
{
    if keys.is_empty() {
        return Err(Error::Auth {
            host: host.to_string(),
            user: user.to_string(),
            message: "agent holds no keys".to_string(),
        });
    }

    let mut errs = Vec::new();
    for (i, kp) in keys.iter().enumerate() {
        match try_key(kp) {
            Ok(true) => return Ok(i),
            Ok(false) => errs.push(format!("key {}: rejected", i)),
            Err(e) => errs.push(format!("key {}: {}", i, e)),
        }
    }
    Err(Error::Auth {
        host: host.to_string(),
        user: user.to_string(),
        message: errs.join("; "),
    })
}

/// Copies every listed remote file into `local_dir` with `copy`, keeping
/// on after failures. A file whose copy failed is removed locally.
fn copy_listed_files<F>(remote_files: &[String], local_dir: &Path, mut copy: F) -> Result<()>
where
    F: FnMut(&str, &Path) -> Result<()>,
{
    let mut errs = MultiError::new();
    for remote_path in remote_files {
        let local_path = local_dir.join(remote_file_name(remote_path));
        log::info!(
            "copying remote file '{}' to '{}'",
            remote_path,
            local_path.display()
        );
        if let Err(e) = copy(remote_path, &local_path) {
            log::warn!("failed to copy '{}' ({})", remote_path, e);
            let _ = fs::remove_file(&local_path);
            errs.push(e);
        }
    }
    errs.into_result()
}

fn copy_file_from_remote(
    sess: &mut Session,
    remote_path: &str,
    local_path: &Path,
    use_sudo: bool,
) -> Result<()> {
    let mut f = File::create(local_path)?;
    let cmd = with_sudo(use_sudo, &format!("dd if={}", shell_quote(remote_path)));
    let n = sess.cmd_to_writer(&cmd, &mut f)?;
    f.flush()?;
    log::debug!("copied {} bytes to '{}'", n, local_path.display());
    Ok(())
}

fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn with_sudo(use_sudo: bool, cmd: &str) -> String {
    if use_sudo {
        format!("sudo {}", cmd)
    } else {
        cmd.to_string()
    }
}

/// Quotes a word so a POSIX shell passes it through literally.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Builds the `find` invocation listing the regular files to copy.
pub fn find_files_command(opts: &ScpDownloadOptions, use_sudo: bool) -> String {
    let mut args = vec![
        "find".to_string(),
        shell_quote(&opts.remote_dir),
        "-maxdepth 1".to_string(),
        "-type f".to_string(),
    ];
    if opts.max_file_size_mb != 0 {
        args.push(format!("-size -{}M", opts.max_file_size_mb));
    }
    if !opts.file_name_filters.is_empty() {
        args.push(r"\(".to_string());
        for (i, filter) in opts.file_name_filters.iter().enumerate() {
            if i > 0 {
                args.push("-o".to_string());
            }
            args.push(format!("-name {}", shell_quote(filter)));
        }
        args.push(r"\)".to_string());
    }
    with_sudo(use_sudo, &args.join(" "))
}

fn parse_file_list(out: &str) -> Vec<String> {
    out.lines()
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

fn remote_file_name(remote_path: &str) -> &str {
    remote_path.rsplit('/').next().unwrap_or(remote_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(filters: &[&str], max_file_size_mb: u64) -> ScpDownloadOptions {
        ScpDownloadOptions {
            remote_host: Host::new("10.0.0.1", "ubuntu", AuthMethod::SshAgent),
            remote_dir: "/var/log".to_string(),
            local_dir: PathBuf::from("/tmp/out"),
            file_name_filters: filters.iter().map(|s| s.to_string()).collect(),
            max_file_size_mb,
        }
    }

    #[test]
    fn test_host() {
        let host = Host::new("1.2.3.4", "ec2-user", AuthMethod::SshAgent);
        assert_eq!(host.port, 22);
        assert_eq!(host.addr(), "1.2.3.4:22");
        assert_eq!(host.with_port(2222).addr(), "1.2.3.4:2222");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/var/log/syslog"), "'/var/log/syslog'");
        assert_eq!(shell_quote("*.log"), "'*.log'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_find_files_command() {
        assert_eq!(
            find_files_command(&opts(&[], 0), false),
            "find '/var/log' -maxdepth 1 -type f"
        );
        assert_eq!(
            find_files_command(&opts(&["*.log", "syslog"], 0), true),
            r"sudo find '/var/log' -maxdepth 1 -type f \( -name '*.log' -o -name 'syslog' \)"
        );
        assert_eq!(
            find_files_command(&opts(&["*.txt"], 5), false),
            r"find '/var/log' -maxdepth 1 -type f -size -5M \( -name '*.txt' \)"
        );
    }

    #[test]
    fn test_parse_file_list() {
        assert!(parse_file_list("").is_empty());
        assert_eq!(
            parse_file_list("/var/log/a.log\n/var/log/b.log\n\n"),
            vec!["/var/log/a.log", "/var/log/b.log"]
        );
        // spaces are part of the file name
        assert_eq!(
            parse_file_list("/var/log/ spaced.log \n/var/log/c.log\n"),
            vec!["/var/log/ spaced.log ", "/var/log/c.log"]
        );
    }

    #[test]
    fn test_timeout_millis() {
        assert_eq!(timeout_millis(Duration::from_secs(30)), 30_000);
        assert_eq!(timeout_millis(Duration::from_secs(u64::MAX)), u32::MAX);
    }

    #[test]
    fn test_copy_listed_files_keeps_going() {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempfile::tempdir().unwrap();
        let remote_files = vec![
            "/var/log/a.log".to_string(),
            "/var/log/b.log".to_string(),
            "/var/log/c.log".to_string(),
        ];
        let mut copied = Vec::new();
        let err = copy_listed_files(&remote_files, dir.path(), |remote_path, local_path| {
            copied.push(remote_path.to_string());
            // the failing copy leaves a partial file behind
            fs::write(local_path, remote_path)?;
            if remote_path.ends_with("b.log") {
                return Err(Error::Command {
                    host: "10.0.0.1:22".to_string(),
                    command: format!("dd if={}", shell_quote(remote_path)),
                    exit_status: 1,
                    stderr: "Permission denied".to_string(),
                });
            }
            Ok(())
        })
        .unwrap_err();

        assert_eq!(copied, remote_files);
        match err {
            Error::Multiple(errs) => {
                assert_eq!(errs.len(), 1);
                assert!(matches!(errs.errors()[0], Error::Command { .. }));
            }
            e => panic!("unexpected error {:?}", e),
        }
        assert_eq!(
            fs::read_to_string(dir.path().join("a.log")).unwrap(),
            "/var/log/a.log"
        );
        assert!(dir.path().join("c.log").exists());
        assert!(!dir.path().join("b.log").exists());
    }

    #[test]
    fn test_copy_listed_files_empty() {
        let dir = tempfile::tempdir().unwrap();
        copy_listed_files(&[], dir.path(), |_, _| panic!("nothing to copy")).unwrap();
    }

    #[test]
    fn test_keyring_empty() {
        let err =
            authenticate_with_keyring("10.0.0.1:22", "ubuntu", &[], |_| Ok(true)).unwrap_err();
        match err {
            Error::Auth { user, message, .. } => {
                assert_eq!(user, "ubuntu");
                assert_eq!(message, "agent holds no keys");
            }
            e => panic!("unexpected error {:?}", e),
        }
    }

    #[test]
    fn test_keyring_tries_keys_in_order() {
        let keys = vec![
            KeyPair::new("", "K0"),
            KeyPair::new("", "K1"),
            KeyPair::new("", "K2"),
        ];
        let mut tried = Vec::new();
        let i = authenticate_with_keyring("10.0.0.1:22", "ubuntu", &keys, |kp| {
            tried.push(kp.private_key.clone());
            Ok(kp.private_key == "K1")
        })
        .unwrap();
        assert_eq!(i, 1);
        assert_eq!(tried, vec!["K0", "K1"]);
    }

    #[test]
    fn test_keyring_all_rejected() {
        let keys = vec![KeyPair::new("", "K0"), KeyPair::new("", "K1")];
        let err = authenticate_with_keyring("10.0.0.1:22", "ubuntu", &keys, |kp| {
            if kp.private_key == "K0" {
                Ok(false)
            } else {
                Err(Error::InvalidSpec("bad key".to_string()))
            }
        })
        .unwrap_err();
        match err {
            Error::Auth { message, .. } => {
                assert!(message.starts_with("key 0: rejected; key 1: "), "{}", message);
            }
            e => panic!("unexpected error {:?}", e),
        }
    }

    #[test]
    fn test_remote_file_name() {
        assert_eq!(remote_file_name("/var/log/syslog"), "syslog");
        assert_eq!(remote_file_name("syslog"), "syslog");
    }

    #[test]
    fn test_with_sudo() {
        assert_eq!(with_sudo(true, "cat 'x'"), "sudo cat 'x'");
        assert_eq!(with_sudo(false, "cat 'x'"), "cat 'x'");
    }

    #[test]
    fn test_connect_refused() {
        let _ = env_logger::builder().is_test(true).try_init();

        // bind then drop to get a port nothing listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let host = Host::new("127.0.0.1", "nobody", AuthMethod::SshAgent).with_port(port);
        let err = SshShell::new(Duration::from_secs(2))
            .fetch_contents_of_file(&host, false, "/etc/hostname")
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{:?}", err);
    }
}
