use crate::errors::ToolError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};

static SEPARATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&&|\|\||[;|]").expect("valid separator regex"));
static ENV_ASSIGNMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").expect("valid env regex"));
static WRITE_REDIRECT_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"[^2]>\s*[^&]", r"^>\s*", r">>\s*"]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("valid redirect regex"))
        .collect()
});

const READ_ONLY_COMMANDS: &[&str] = &[
    // files
    "cat", "head", "tail", "less", "more",
    "grep", "find", "locate", "which", "type",
    "ls", "pwd", "tree",
    // system
    "whoami", "uname", "hostname", "date", "id", "uptime", "w", "who", "last",
    "ps", "top", "htop", "pgrep", "pstree",
    "mpstat", "sar", "iostat", "vmstat", "nmon", "iotop", "pidstat",
    "test", "[",
    "df", "du", "free", "lsblk",
    // network
    "netstat", "ss", "ip", "ifconfig", "ping", "traceroute", "dig", "nslookup", "host",
    "env", "printenv", "echo",
    "wc", "sort", "uniq", "cut", "awk", "sed", "tr", "diff", "comm",
    "stat", "file", "md5sum", "sha256sum",
    "journalctl", "dmesg",
    // narrowed by subcommand
    "docker", "kubectl", "systemctl", "dpkg", "rpm", "apt", "yum",
];

const DANGEROUS_PATTERNS: &[&str] = &[
    "rm ", "rm\t", "rmdir ", "shred ",
    "mv ", "mv\t", "cp ", "cp\t",
    "chmod ", "chown ", "chgrp ",
    "kill ", "killall ", "pkill ",
    "shutdown", "reboot", "halt", "poweroff", "init ",
    "dd ", "mkfs", "fdisk ", "parted ", "mount ", "umount ",
    // "passwd " keeps /etc/passwd readable
    "useradd", "userdel", "usermod", "passwd ", "groupadd",
    "apt install", "apt remove", "apt purge", "apt-get install", "apt-get remove",
    "yum install", "yum remove", "yum erase",
    "dnf install", "dnf remove",
    "pip install", "pip uninstall",
    "npm install", "npm uninstall",
    "systemctl start", "systemctl stop", "systemctl restart",
    "systemctl enable", "systemctl disable",
    "service start", "service stop", "service restart",
    "iptables", "firewall-cmd", "ufw ",
    ":(){ :|:& };:",
    "mkfifo", "mknod",
    "sudo ", "su ",
    "docker rm", "docker rmi", "docker stop", "docker kill",
    "docker exec", "docker run", "docker start",
    "kubectl delete", "kubectl apply", "kubectl create",
    "kubectl exec", "kubectl edit", "kubectl patch",
];

const ALLOWED_SUBCOMMANDS: &[(&str, &[&str])] = &[
    (
        "docker",
        &[
            "ps", "images", "logs", "inspect", "stats", "top", "info", "version",
            "network ls", "volume ls",
        ],
    ),
    (
        "kubectl",
        &["get", "describe", "logs", "top", "version", "config view", "cluster-info"],
    ),
    (
        "systemctl",
        &["status", "is-active", "is-enabled", "list-units", "list-unit-files", "show"],
    ),
    ("apt", &["list", "show", "search", "policy"]),
    ("yum", &["list", "info", "search"]),
    ("dpkg", &["-l", "-L", "-s", "--list", "--listfiles", "--status"]),
    ("rpm", &["-qa", "-qi", "-ql", "--query"]),
];

const ALLOWED_REFERENCE: &str = "Allowed commands in read-only mode:
  File viewing: cat, head, tail, less, more
  Search: grep, find, locate, which
  Directory: ls, pwd, tree
  System info: whoami, uname, hostname, date, id, uptime
  Processes: ps, top, htop, pgrep, pstree
  Performance: mpstat, sar, iostat, vmstat, pidstat, nmon, iotop
  Resources: df, du, free, lsblk
  Network: netstat, ss, ip, ping, dig, traceroute
  Text processing: wc, sort, uniq, cut, awk, sed, tr
  File info: stat, file, md5sum, sha256sum
  Logs: journalctl, dmesg
  Containers: docker ps/images/logs/inspect/stats, kubectl get/describe/logs

To allow write commands, enable 'Allow Write Commands' for this host.";

/// Read-only shell policy applied to every remote command unless the host opts out.
///
/// Matching is textual, not a shell parse: dangerous substrings are checked
/// against the whole command, then each `;`, `|`, `&&`, `||` segment must start
/// with an allow-listed base command (and an allowed subcommand where one is
/// required).
#[derive(Debug, Clone)]
pub struct CommandValidator {
    read_only_commands: HashSet<String>,
    dangerous_patterns: Vec<String>,
    allowed_subcommands: HashMap<String, Vec<String>>,
}

impl CommandValidator {
    pub fn new() -> Self {
        Self {
            read_only_commands: READ_ONLY_COMMANDS.iter().map(|c| c.to_string()).collect(),
            dangerous_patterns: DANGEROUS_PATTERNS.iter().map(|p| p.to_string()).collect(),
            allowed_subcommands: ALLOWED_SUBCOMMANDS
                .iter()
                .map(|(base, subs)| {
                    (
                        base.to_string(),
                        subs.iter().map(|s| s.to_string()).collect(),
                    )
                })
                .collect(),
        }
    }

    pub fn validate(&self, command: &str, allow_write_commands: bool) -> Result<(), ToolError> {
        if allow_write_commands {
            return Ok(());
        }
        let cmd = command.trim();

        if let Some(pattern) = self
            .dangerous_patterns
            .iter()
            .find(|pattern| cmd.contains(pattern.as_str()))
        {
            return Err(blocked_error(&format!(
                "contains dangerous pattern '{}'",
                pattern.trim()
            )));
        }

        if cmd.contains(['\n', '\r']) {
            return Err(blocked_error("contains a line break"));
        }
        if contains_background_operator(cmd) {
            return Err(blocked_error("contains background operator '&'"));
        }

        if contains_write_redirect(cmd) {
            return Err(blocked_error("contains file output redirect '>'"));
        }

        for segment in split_command_chain(cmd) {
            self.validate_segment(segment)?;
        }
        Ok(())
    }

    fn validate_segment(&self, segment: &str) -> Result<(), ToolError> {
        let Some((base, rest)) = split_base_command(segment) else {
            return Ok(());
        };
        if !self.read_only_commands.contains(base) {
            return Err(blocked_error(&format!(
                "'{}' is not in the allowed command list",
                base
            )));
        }
        if let Some(subs) = self.allowed_subcommands.get(base) {
            let rest = rest.trim();
            if !subs.iter().any(|sub| rest.starts_with(sub.as_str())) {
                return Err(blocked_error(&format!("'{}' subcommand is not allowed", base)));
            }
        }
        Ok(())
    }
}

impl Default for CommandValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Rejects empty commands and embedded NUL bytes before any policy check.
pub fn clean_command(command: &str) -> Result<String, ToolError> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(ToolError::invalid_params("command is required"));
    }
    if trimmed.contains('\0') {
        return Err(ToolError::invalid_params("Command contains null bytes"));
    }
    Ok(trimmed.to_string())
}

/// Splits on `;`, `|`, `&&` and `||`, dropping empty segments.
pub fn split_command_chain(command: &str) -> Vec<&str> {
    SEPARATOR_RE
        .split(command)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect()
}

pub fn extract_base_command(segment: &str) -> Option<&str> {
    split_base_command(segment).map(|(base, _)| base)
}

// Returns the base command (path stripped) and the text following its token.
fn split_base_command(segment: &str) -> Option<(&str, &str)> {
    let mut cmd = segment.trim();
    cmd = cmd.strip_prefix("$(").unwrap_or(cmd);
    cmd = cmd.strip_suffix(')').unwrap_or(cmd);
    cmd = cmd.strip_prefix('`').unwrap_or(cmd);
    cmd = cmd.strip_suffix('`').unwrap_or(cmd);

    let mut rest = cmd.trim_start();
    loop {
        let token_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let token = &rest[..token_end];
        if token.is_empty() {
            return None;
        }
        let remainder = &rest[token_end..];
        if ENV_ASSIGNMENT_RE.is_match(token) {
            rest = remainder.trim_start();
            continue;
        }
        let base = token.rsplit('/').next().unwrap_or(token);
        return Some((base, remainder));
    }
}

/// True for an `&` that is neither part of `&&` nor a `>&` descriptor redirect.
pub fn contains_background_operator(command: &str) -> bool {
    let bytes = command.as_bytes();
    bytes.iter().enumerate().any(|(i, &b)| {
        if b != b'&' {
            return false;
        }
        let prev = i.checked_sub(1).map(|j| bytes[j]);
        let next = bytes.get(i + 1).copied();
        !(prev == Some(b'&') || next == Some(b'&') || prev == Some(b'>'))
    })
}

pub fn contains_write_redirect(command: &str) -> bool {
    WRITE_REDIRECT_RES.iter().any(|re| re.is_match(command))
}

fn blocked_error(reason: &str) -> ToolError {
    ToolError::denied(format!(
        "Command blocked: {} (read-only mode is enabled).\n\n{}",
        reason, ALLOWED_REFERENCE
    ))
    .with_hint("Use a read-only command, or enable 'Allow Write Commands' for this host.")
    .with_details(serde_json::json!({ "reason": reason }))
}
