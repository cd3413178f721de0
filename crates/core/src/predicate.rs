//! Boolean environment queries against a container
//!
//! A [`Predicate`] asks a read-only question about a container's filesystem,
//! packages, sockets or process table. Evaluation yields `true` or `false`;
//! anything that prevents a clean answer (unexpected exit code, unreadable
//! `/proc` data) is a [`HarnessError::Probe`], never `false`.
//!
//! Socket and process checks read `/proc` directly and parse it here, so the
//! image needs nothing beyond a POSIX shell and coreutils.

use crate::container::RunningContainer;
use crate::errors::{HarnessError, Result};
use crate::runtime::ContainerRuntime;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Transport protocol of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    /// `/proc/net` tables holding this protocol's sockets
    fn proc_tables(&self) -> [&'static str; 2] {
        match self {
            Self::Tcp => ["/proc/net/tcp", "/proc/net/tcp6"],
            Self::Udp => ["/proc/net/udp", "/proc/net/udp6"],
        }
    }

    /// Kernel state code of a listening socket (TCP_LISTEN / TCP_CLOSE for unconnected UDP)
    fn listen_state(&self) -> &'static str {
        match self {
            Self::Tcp => "0A",
            Self::Udp => "07",
        }
    }
}

/// Socket to look for, written like `tcp://0.0.0.0:8123`, `tcp://8123` or
/// `udp://[::]:53`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketSpec {
    pub protocol: Protocol,
    /// `None` matches any local address
    pub address: Option<IpAddr>,
    pub port: u16,
}

impl SocketSpec {
    pub fn tcp(port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            address: None,
            port,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            protocol: Protocol::Udp,
            address: None,
            port,
        }
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Whether a listener bound to `local` satisfies this spec
    ///
    /// A wildcard spec address accepts listeners on either wildcard (`0.0.0.0`
    /// or `::`); a concrete address also accepts its family's wildcard.
    fn accepts(&self, local: &IpAddr) -> bool {
        let Some(wanted) = self.address else {
            return true;
        };
        if wanted.is_unspecified() {
            return local.is_unspecified();
        }
        if local == &wanted {
            return true;
        }
        if let (IpAddr::V6(v6), IpAddr::V4(v4)) = (local, wanted) {
            if v6.to_ipv4_mapped() == Some(v4) {
                return true;
            }
        }
        local.is_unspecified() && local.is_ipv4() == wanted.is_ipv4()
    }
}

impl FromStr for SocketSpec {
    type Err = HarnessError;

    fn from_str(spec: &str) -> Result<Self> {
        let invalid = |reason: &str| HarnessError::InvalidArgument {
            message: format!("invalid socket spec '{}': {}", spec, reason),
        };

        let (scheme, rest) = spec
            .split_once("://")
            .ok_or_else(|| invalid("expected <tcp|udp>://[address:]port"))?;
        let protocol = match scheme.to_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            _ => return Err(invalid("protocol must be tcp or udp")),
        };

        let (address, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, port) = bracketed
                .split_once("]:")
                .ok_or_else(|| invalid("expected [ipv6]:port"))?;
            let host: Ipv6Addr = host.parse().map_err(|_| invalid("bad IPv6 address"))?;
            (Some(IpAddr::V6(host)), port)
        } else if let Some((host, port)) = rest.rsplit_once(':') {
            let host: Ipv4Addr = host.parse().map_err(|_| invalid("bad IPv4 address"))?;
            (Some(IpAddr::V4(host)), port)
        } else {
            (None, rest)
        };

        let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;
        if port == 0 {
            return Err(invalid("port must be non-zero"));
        }

        Ok(Self {
            protocol,
            address,
            port,
        })
    }
}

impl fmt::Display for SocketSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            None => write!(f, "{}://{}", self.protocol.as_str(), self.port),
            Some(IpAddr::V4(addr)) => write!(f, "{}://{}:{}", self.protocol.as_str(), addr, self.port),
            Some(IpAddr::V6(addr)) => {
                write!(f, "{}://[{}]:{}", self.protocol.as_str(), addr, self.port)
            }
        }
    }
}

/// One entry of a `/proc/net/{tcp,udp}[6]` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub local: IpAddr,
    pub port: u16,
    /// Kernel state code as printed (e.g. `0A`)
    pub state: String,
}

/// Parse a `/proc/net` socket table; header lines are skipped
pub fn parse_proc_net(table: &str) -> Result<Vec<SocketEntry>> {
    let mut entries = Vec::new();
    for line in table.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Data rows start with "<n>:"
        if fields.len() < 4 || !fields[0].ends_with(':') || fields[0] == "sl" {
            continue;
        }
        if fields[0].trim_end_matches(':').parse::<u32>().is_err() {
            continue;
        }

        let (addr_hex, port_hex) = fields[1].split_once(':').ok_or_else(|| {
            probe_error("socket table", format!("malformed local address '{}'", fields[1]))
        })?;
        let local = parse_proc_addr(addr_hex)?;
        let port = u16::from_str_radix(port_hex, 16)
            .map_err(|_| probe_error("socket table", format!("malformed port '{}'", port_hex)))?;

        entries.push(SocketEntry {
            local,
            port,
            state: fields[3].to_uppercase(),
        });
    }
    Ok(entries)
}

/// Addresses are printed as native-endian 32-bit words
fn parse_proc_addr(hex: &str) -> Result<IpAddr> {
    let word = |chunk: &str| {
        u32::from_str_radix(chunk, 16)
            .map(u32::to_le_bytes)
            .map_err(|_| probe_error("socket table", format!("malformed address '{}'", hex)))
    };

    match hex.len() {
        8 => Ok(IpAddr::V4(Ipv4Addr::from(word(hex)?))),
        32 => {
            let mut octets = [0u8; 16];
            for i in 0..4 {
                let chunk = hex
                    .get(i * 8..(i + 1) * 8)
                    .ok_or_else(|| probe_error("socket table", format!("malformed address '{}'", hex)))?;
                octets[i * 4..(i + 1) * 4].copy_from_slice(&word(chunk)?);
            }
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => Err(probe_error(
            "socket table",
            format!("unexpected address length in '{}'", hex),
        )),
    }
}

/// Process table row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Executable name from `/proc/<pid>/comm`
    pub comm: String,
    /// Command line with arguments joined by spaces
    pub args: String,
}

/// Walks `/proc` printing `pid<TAB>comm<TAB>args`
const PROCESS_LISTING: &str = r#"for d in /proc/[0-9]*; do c=$(cat "$d/comm" 2>/dev/null) || continue; a=$(tr '\000' ' ' < "$d/cmdline" 2>/dev/null); printf '%s\t%s\t%s\n' "${d#/proc/}" "$c" "$a"; done"#;

pub fn parse_process_listing(listing: &str) -> Vec<ProcessInfo> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, '\t');
            let pid = fields.next()?.trim().parse().ok()?;
            let comm = fields.next()?.trim().to_string();
            let args = fields.next().unwrap_or("").trim().to_string();
            Some(ProcessInfo { pid, comm, args })
        })
        .collect()
}

/// Read the container's process table
pub async fn list_processes<R: ContainerRuntime>(
    container: &RunningContainer<R>,
) -> Result<Vec<ProcessInfo>> {
    let result = container.run(PROCESS_LISTING).await?;
    if result.exit_code != 0 {
        return Err(probe_error(
            "process listing",
            format!("exit code {}: {}", result.exit_code, result.stderr.trim()),
        ));
    }
    Ok(parse_process_listing(&result.stdout))
}

fn probe_error(predicate: impl Into<String>, message: impl Into<String>) -> HarnessError {
    HarnessError::Probe {
        predicate: predicate.into(),
        message: message.into(),
    }
}

/// Read-only boolean query against a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    FileExists(String),
    IsFile(String),
    IsDirectory(String),
    /// Package known to rpm (or dpkg where rpm is absent)
    PackageInstalled(String),
    Listening(SocketSpec),
    /// A process with this `comm`, optionally with an argument substring
    ProcessRunning {
        comm: String,
        args_contains: Option<String>,
    },
    /// Shell snippet: exit 0 is true, exit 1 is false
    Shell(String),
}

impl Predicate {
    pub fn file_exists(path: impl Into<String>) -> Self {
        Self::FileExists(path.into())
    }

    pub fn is_file(path: impl Into<String>) -> Self {
        Self::IsFile(path.into())
    }

    pub fn is_directory(path: impl Into<String>) -> Self {
        Self::IsDirectory(path.into())
    }

    pub fn package_installed(name: impl Into<String>) -> Self {
        Self::PackageInstalled(name.into())
    }

    /// Parse a `tcp://...`/`udp://...` socket spec
    pub fn listening(spec: &str) -> Result<Self> {
        Ok(Self::Listening(spec.parse()?))
    }

    pub fn process_running(comm: impl Into<String>, args_contains: Option<&str>) -> Self {
        Self::ProcessRunning {
            comm: comm.into(),
            args_contains: args_contains.map(str::to_string),
        }
    }

    pub fn shell(script: impl Into<String>) -> Self {
        Self::Shell(script.into())
    }

    /// Command whose exit status (0 true, 1 false) answers the predicate
    fn status_command(&self) -> Option<String> {
        let quote = |s: &str| shell_words::quote(s).into_owned();
        match self {
            Self::FileExists(path) => Some(format!("test -e {}", quote(path))),
            Self::IsFile(path) => Some(format!("test -f {}", quote(path))),
            Self::IsDirectory(path) => Some(format!("test -d {}", quote(path))),
            Self::PackageInstalled(name) => {
                let name = quote(name);
                Some(format!(
                    "if command -v rpm >/dev/null 2>&1; then rpm -q --quiet {name} || exit 1; \
                     elif command -v dpkg-query >/dev/null 2>&1; then \
                     dpkg-query -W -f='${{Status}}' {name} 2>/dev/null | grep -q 'ok installed' || exit 1; \
                     else echo 'neither rpm nor dpkg-query found' >&2; exit 127; fi"
                ))
            }
            Self::Shell(script) => Some(script.clone()),
            Self::Listening(_) | Self::ProcessRunning { .. } => None,
        }
    }

    fn validate(&self) -> Result<()> {
        let empty = match self {
            Self::FileExists(s) | Self::IsFile(s) | Self::IsDirectory(s) => s.is_empty(),
            Self::PackageInstalled(s) | Self::Shell(s) => s.trim().is_empty(),
            Self::ProcessRunning { comm, .. } => comm.is_empty(),
            Self::Listening(_) => false,
        };
        if empty {
            return Err(HarnessError::InvalidArgument {
                message: format!("predicate `{}` has an empty argument", self),
            });
        }
        Ok(())
    }

    /// Evaluate against a ready container
    pub async fn evaluate<R: ContainerRuntime>(
        &self,
        container: &RunningContainer<R>,
    ) -> Result<bool> {
        self.validate()?;

        if let Some(command) = self.status_command() {
            let result = container.run(command).await?;
            return match result.exit_code {
                0 => Ok(true),
                1 => Ok(false),
                code => Err(probe_error(
                    self.to_string(),
                    format!("exit code {}: {}", code, result.stderr.trim()),
                )),
            };
        }

        match self {
            Self::Listening(spec) => self.evaluate_listening(container, spec).await,
            Self::ProcessRunning {
                comm,
                args_contains,
            } => {
                let processes = list_processes(container).await?;
                Ok(processes.iter().any(|p| {
                    p.comm == *comm
                        && args_contains
                            .as_deref()
                            .map_or(true, |needle| p.args.contains(needle))
                }))
            }
            _ => Err(probe_error(self.to_string(), "no evaluation strategy")),
        }
    }

    async fn evaluate_listening<R: ContainerRuntime>(
        &self,
        container: &RunningContainer<R>,
        spec: &SocketSpec,
    ) -> Result<bool> {
        let [v4, v6] = spec.protocol.proc_tables();
        // The IPv6 table is absent when IPv6 is disabled
        let result = container
            .run(format!("cat {v4} && {{ cat {v6} 2>/dev/null || true; }}"))
            .await?;
        if result.exit_code != 0 {
            return Err(probe_error(
                self.to_string(),
                format!("cannot read {}: {}", v4, result.stderr.trim()),
            ));
        }

        let entries = parse_proc_net(&result.stdout).map_err(|e| match e {
            HarnessError::Probe { message, .. } => probe_error(self.to_string(), message),
            other => other,
        })?;
        let listen_state = spec.protocol.listen_state();
        Ok(entries
            .iter()
            .any(|e| e.state == listen_state && e.port == spec.port && spec.accepts(&e.local)))
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileExists(path) => write!(f, "file exists {}", path),
            Self::IsFile(path) => write!(f, "is file {}", path),
            Self::IsDirectory(path) => write!(f, "is directory {}", path),
            Self::PackageInstalled(name) => write!(f, "package installed {}", name),
            Self::Listening(spec) => write!(f, "listening {}", spec),
            Self::ProcessRunning {
                comm,
                args_contains: Some(needle),
            } => write!(f, "process {} with args containing '{}'", comm, needle),
            Self::ProcessRunning { comm, .. } => write!(f, "process {}", comm),
            Self::Shell(script) => write!(f, "shell `{}`", script),
        }
    }
}
