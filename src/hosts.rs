//! Host-resolution override table.
//!
//! The resolver consults `/etc/hosts`, so pointing a registration server's
//! FQDN at a particular address is done by writing an entry there.  Every
//! entry we own is preceded by a marker comment; lines we did not write are
//! preserved verbatim.

use std::fs;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::PathBuf;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::types::EndpointRecord;

pub const MARKER: &str = "# Added by SMT registration do not remove, retain comment as well";

pub struct HostsTable {
    path: PathBuf,
}

impl HostsTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Address currently overriding `fqdn`, if we own an entry for it.
    pub fn lookup(&self, fqdn: &str) -> Result<Option<IpAddr>> {
        let lines = self.read_lines()?;
        let mut owned = false;
        for line in &lines {
            if line.trim() == MARKER {
                owned = true;
                continue;
            }
            if owned {
                if let Some(addr) = entry_addr_for(line, fqdn) {
                    return Ok(Some(addr));
                }
            }
            owned = false;
        }
        Ok(None)
    }

    /// Point `record`'s hostname at `addr`, replacing any entry we own for it.
    pub fn set_override(&self, record: &EndpointRecord, addr: IpAddr) -> Result<()> {
        let mut lines = strip_owned(self.read_lines()?, &record.fqdn);
        lines.push(MARKER.to_string());
        lines.push(format!("{}\t{}\t{}", addr, record.fqdn, record.name()));
        self.write_lines(&lines)?;
        info!("Host override {} -> {}", record.fqdn, addr);
        Ok(())
    }

    /// Drop the entry we own for `fqdn`, marker included.
    pub fn remove_override(&self, fqdn: &str) -> Result<()> {
        let lines = self.read_lines()?;
        let before = lines.len();
        let lines = strip_owned(lines, fqdn);
        if lines.len() != before {
            self.write_lines(&lines)?;
            debug!("Removed host override for {}", fqdn);
        }
        Ok(())
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::hosts_io(&self.path, e)),
        }
    }

    // Written in place: /etc/hosts is frequently a bind mount that cannot be
    // replaced by rename.
    fn write_lines(&self, lines: &[String]) -> Result<()> {
        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(&self.path, content).map_err(|e| Error::hosts_io(&self.path, e))
    }
}

fn entry_addr_for(line: &str, fqdn: &str) -> Option<IpAddr> {
    let mut fields = line.split_whitespace();
    let addr = fields.next()?.parse().ok()?;
    fields.any(|name| name == fqdn).then_some(addr)
}

fn strip_owned(lines: Vec<String>, fqdn: &str) -> Vec<String> {
    let mut out = Vec::with_capacity(lines.len());
    let mut pending_marker: Option<String> = None;
    for line in lines {
        if line.trim() == MARKER {
            if let Some(marker) = pending_marker.take() {
                out.push(marker);
            }
            pending_marker = Some(line);
            continue;
        }
        match pending_marker.take() {
            Some(_) if entry_addr_for(&line, fqdn).is_some() => {}
            Some(marker) => {
                out.push(marker);
                out.push(line);
            }
            None => out.push(line),
        }
    }
    if let Some(marker) = pending_marker {
        out.push(marker);
    }
    out
}
