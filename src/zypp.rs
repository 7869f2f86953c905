//! Registration artefacts left on the system by the registration agent:
//! repository and service definitions named after the server, and the
//! credentials file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::info;

use crate::error::{Error, Result};

const CREDENTIAL_FILES: [&str; 2] = ["SCCcredentials", "NCCcredentials"];

/// Basic-auth credentials issued at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn parse(content: &str) -> Option<Self> {
        let mut username = None;
        let mut password = None;
        for line in content.lines() {
            match line.split_once('=') {
                Some((key, value)) if key.trim() == "username" => {
                    username = Some(value.trim().to_string())
                }
                Some((key, value)) if key.trim() == "password" => {
                    password = Some(value.trim().to_string())
                }
                _ => {}
            }
        }
        Some(Self {
            username: username?,
            password: password?,
        })
    }
}

pub struct ZyppState {
    root: PathBuf,
}

impl ZyppState {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn credentials_dir(&self) -> PathBuf {
        self.root.join("credentials.d")
    }

    pub fn has_credentials(&self) -> bool {
        CREDENTIAL_FILES
            .iter()
            .any(|name| self.credentials_dir().join(name).is_file())
    }

    pub fn load_credentials(&self) -> Result<Credentials> {
        let path = self.credentials_dir().join(CREDENTIAL_FILES[0]);
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Credentials(format!("{}: {}", path.display(), e)))?;
        Credentials::parse(&content).ok_or_else(|| {
            Error::Credentials(format!("{} lacks username or password", path.display()))
        })
    }

    pub fn has_repos(&self, fqdn: &str) -> Result<bool> {
        Ok(!matching_files(&self.root.join("repos.d"), fqdn)?.is_empty())
    }

    pub fn remove_repos(&self, fqdn: &str) -> Result<()> {
        remove_matching(&self.root.join("repos.d"), fqdn, "repo")
    }

    pub fn remove_services(&self, fqdn: &str) -> Result<()> {
        remove_matching(&self.root.join("services.d"), fqdn, "service")
    }

    pub fn remove_credentials(&self) -> Result<()> {
        for name in CREDENTIAL_FILES {
            let path = self.credentials_dir().join(name);
            match fs::remove_file(&path) {
                Ok(()) => info!("Removing credentials: {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(Error::state_io(path, e)),
            }
        }
        Ok(())
    }

    /// Whether the instance is registered against `fqdn`.
    ///
    /// Registration needs both credentials and repositories; when only one
    /// of them exists the leftover is removed.
    pub fn check_registration(&self, fqdn: &str) -> Result<bool> {
        let credentials = self.has_credentials();
        let repos = self.has_repos(fqdn)?;
        match (credentials, repos) {
            (true, true) => return Ok(true),
            (false, true) => self.remove_repos(fqdn)?,
            (true, false) => self.remove_credentials()?,
            (false, false) => {}
        }
        Ok(false)
    }
}

fn server_tag(fqdn: &str) -> String {
    fqdn.replace('.', "_")
}

fn matching_files(dir: &Path, fqdn: &str) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::state_io(dir, e)),
    };
    let tag = server_tag(fqdn);
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::state_io(dir, e))?;
        if entry.file_name().to_string_lossy().contains(&tag) {
            found.push(entry.path());
        }
    }
    Ok(found)
}

fn remove_matching(dir: &Path, fqdn: &str, kind: &str) -> Result<()> {
    for path in matching_files(dir, fqdn)? {
        info!("Removing {}: {}", kind, path.display());
        fs::remove_file(&path).map_err(|e| Error::state_io(&path, e))?;
    }
    Ok(())
}
