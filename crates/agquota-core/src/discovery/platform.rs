//! Per-OS commands for listing language server processes and their
//! listening ports, and parsers for their output.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use super::runner::ShellCommand;
use super::ProcessCandidate;

static PORT_ARG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"--extension_server_port[=\s]+(\d+)").expect("Invalid port argument regex")
});

static TOKEN_ARG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"--csrf_token[=\s]+([a-zA-Z0-9\-_.]+)").expect("Invalid token argument regex")
});

static PS_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s+(\d+)\s+(.+)$").expect("Invalid ps line regex"));

static NETSTAT_LISTEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):(\d+)\s+\S+\s+LISTENING")
        .expect("Invalid netstat regex")
});

static LSOF_LISTEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:TCP|UDP)\s+(?:\*|[\d.]+|\[[\da-f:]+\]):(\d+)\s+\(LISTEN\)")
        .expect("Invalid lsof regex")
});

static SS_LISTEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)LISTEN\s+\d+\s+\d+\s+(?:\*|[\d.]+|\[[\da-f:]*\]):(\d+)")
        .expect("Invalid ss regex")
});

/// Operating system family, selecting the discovery commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    /// Platform of the running process
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    /// Language server executable name for this platform and CPU
    pub fn process_name(&self, arch: &str) -> String {
        let arm = arch == "aarch64" || arch == "arm64" || arch == "arm";
        match self {
            Platform::Windows => "language_server_windows_x64.exe".to_string(),
            Platform::MacOs if arm => "language_server_macos_arm".to_string(),
            Platform::MacOs => "language_server_macos".to_string(),
            Platform::Linux if arm => "language_server_linux_arm".to_string(),
            Platform::Linux => "language_server_linux_x64".to_string(),
        }
    }

    /// Command listing processes whose command line mentions `process_name`
    pub fn process_list_command(&self, process_name: &str) -> ShellCommand {
        match self {
            Platform::Windows => ShellCommand::powershell(format!(
                "Get-CimInstance Win32_Process -Filter \"name='{}'\" | \
                 Select-Object ProcessId,ParentProcessId,CommandLine | ConvertTo-Json",
                process_name
            )),
            Platform::MacOs | Platform::Linux => {
                // Bracketing the first letter keeps grep from matching itself
                let mut chars = process_name.chars();
                let pattern = match chars.next() {
                    Some(first) => format!("[{}]{}", first, chars.as_str()),
                    None => String::new(),
                };
                ShellCommand::sh(format!(
                    "ps -A -ww -o pid,ppid,command | grep \"{}\"",
                    pattern
                ))
            }
        }
    }

    /// Parse process listing output into candidates.
    ///
    /// Entries without a CSRF token are skipped. A missing port argument
    /// yields port 0.
    pub fn parse_process_list(&self, stdout: &str) -> Vec<ProcessCandidate> {
        match self {
            Platform::Windows => parse_cim_processes(stdout),
            Platform::MacOs | Platform::Linux => parse_ps_processes(stdout),
        }
    }

    /// Command listing TCP ports `pid` listens on
    pub fn port_list_command(&self, pid: u32) -> ShellCommand {
        match self {
            Platform::Windows => ShellCommand::cmd(format!(
                "netstat -ano | findstr \"{}\" | findstr \"LISTENING\"",
                pid
            )),
            Platform::MacOs => ShellCommand::sh(lsof_command(pid)),
            Platform::Linux => ShellCommand::sh(format!(
                "ss -tlnp 2>/dev/null | grep \"pid={}\" || {}",
                pid,
                lsof_command(pid)
            )),
        }
    }

    /// Parse listening ports for `pid`, deduplicated and sorted ascending
    pub fn parse_listening_ports(&self, stdout: &str, pid: u32) -> Vec<u16> {
        let ports = match self {
            Platform::Windows => parse_netstat_ports(stdout, pid),
            Platform::MacOs => parse_lsof_ports(stdout, pid),
            Platform::Linux => {
                let ss = capture_ports(&SS_LISTEN, stdout);
                if ss.is_empty() {
                    parse_lsof_ports(stdout, pid)
                } else {
                    ss
                }
            }
        };
        ports.into_iter().collect()
    }

    /// Command printing the parent pid of `pid`
    pub fn parent_pid_command(&self, pid: u32) -> ShellCommand {
        match self {
            Platform::Windows => ShellCommand::powershell(format!(
                "(Get-CimInstance Win32_Process -Filter \"ProcessId={}\").ParentProcessId",
                pid
            )),
            Platform::MacOs | Platform::Linux => ShellCommand::new(
                "ps",
                ["-o".to_string(), "ppid=".to_string(), "-p".to_string(), pid.to_string()],
            ),
        }
    }

    /// Parse the output of [`Platform::parent_pid_command`]
    pub fn parse_parent_pid(&self, stdout: &str) -> Option<u32> {
        stdout.trim().parse().ok()
    }
}

fn lsof_command(pid: u32) -> String {
    format!("lsof -iTCP -sTCP:LISTEN -n -P -p {}", pid)
}

fn candidate_from_command_line(
    pid: u32,
    ppid: Option<u32>,
    command_line: &str,
) -> Option<ProcessCandidate> {
    let csrf_token = TOKEN_ARG.captures(command_line)?.get(1)?.as_str().to_string();
    let extension_port = PORT_ARG
        .captures(command_line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);

    Some(ProcessCandidate {
        pid,
        ppid,
        extension_port,
        csrf_token,
    })
}

fn parse_ps_processes(stdout: &str) -> Vec<ProcessCandidate> {
    stdout
        .lines()
        .filter_map(|line| {
            let caps = PS_LINE.captures(line.trim_end())?;
            let pid = caps.get(1)?.as_str().parse().ok()?;
            let ppid = caps.get(2)?.as_str().parse().ok();
            candidate_from_command_line(pid, ppid, caps.get(3)?.as_str())
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CimProcess {
    process_id: u32,
    #[serde(default)]
    parent_process_id: Option<u32>,
    #[serde(default)]
    command_line: Option<String>,
}

/// `ConvertTo-Json` emits a bare object for a single result
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<CimProcess>),
    One(CimProcess),
}

fn parse_cim_processes(stdout: &str) -> Vec<ProcessCandidate> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let processes = match serde_json::from_str::<OneOrMany>(trimmed) {
        Ok(OneOrMany::Many(list)) => list,
        Ok(OneOrMany::One(single)) => vec![single],
        Err(e) => {
            tracing::debug!("Unparseable process listing: {}", e);
            return Vec::new();
        }
    };

    processes
        .into_iter()
        .filter_map(|p| {
            let command_line = p.command_line?;
            candidate_from_command_line(p.process_id, p.parent_process_id, &command_line)
        })
        .collect()
}

fn capture_ports(re: &Regex, stdout: &str) -> BTreeSet<u16> {
    re.captures_iter(stdout)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect()
}

/// `findstr` matches substrings, so the trailing PID column is checked here
fn parse_netstat_ports(stdout: &str, pid: u32) -> BTreeSet<u16> {
    let pid = pid.to_string();
    stdout
        .lines()
        .filter(|line| line.split_whitespace().last() == Some(pid.as_str()))
        .filter_map(|line| NETSTAT_LISTEN.captures(line)?.get(1)?.as_str().parse().ok())
        .collect()
}

fn parse_lsof_ports(stdout: &str, pid: u32) -> BTreeSet<u16> {
    let pid = pid.to_string();
    stdout
        .lines()
        .filter(|line| line.split_whitespace().nth(1) == Some(pid.as_str()))
        .filter_map(|line| LSOF_LISTEN.captures(line)?.get(1)?.as_str().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_process_names() {
        assert_eq!(
            Platform::Windows.process_name("x86_64"),
            "language_server_windows_x64.exe"
        );
        assert_eq!(Platform::MacOs.process_name("aarch64"), "language_server_macos_arm");
        assert_eq!(Platform::MacOs.process_name("x86_64"), "language_server_macos");
        assert_eq!(Platform::Linux.process_name("aarch64"), "language_server_linux_arm");
        assert_eq!(Platform::Linux.process_name("x86_64"), "language_server_linux_x64");
    }

    #[test]
    fn test_unix_list_command_excludes_grep() {
        let cmd = Platform::Linux.process_list_command("language_server_linux_x64");
        assert_eq!(cmd.program, "sh");
        assert!(cmd.args[1].contains("grep \"[l]anguage_server_linux_x64\""));
    }

    #[test]
    fn test_parse_ps_output() {
        let stdout = "\
  4242   100 /opt/ag/language_server_linux_x64 --csrf_token abc-123.x --extension_server_port=42100 --random_port
  4243   100 /opt/ag/language_server_linux_x64 --extension_server_port 42101
  4244   101 /opt/ag/language_server_linux_x64 --csrf_token=zzz
";
        let candidates = Platform::Linux.parse_process_list(stdout);

        assert_eq!(
            candidates,
            vec![
                ProcessCandidate {
                    pid: 4242,
                    ppid: Some(100),
                    extension_port: 42100,
                    csrf_token: "abc-123.x".to_string(),
                },
                ProcessCandidate {
                    pid: 4244,
                    ppid: Some(101),
                    extension_port: 0,
                    csrf_token: "zzz".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_parse_cim_single_object() {
        let stdout = r#"{"ProcessId": 900, "ParentProcessId": 12,
            "CommandLine": "C:\\ag\\language_server_windows_x64.exe --csrf_token tok --extension_server_port 5000"}"#;
        let candidates = Platform::Windows.parse_process_list(stdout);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].pid, 900);
        assert_eq!(candidates[0].ppid, Some(12));
        assert_eq!(candidates[0].extension_port, 5000);
    }

    #[test]
    fn test_parse_cim_array_skips_missing_command_line() {
        let stdout = r#"[
            {"ProcessId": 1, "ParentProcessId": 2, "CommandLine": null},
            {"ProcessId": 3, "ParentProcessId": 2, "CommandLine": "x --csrf_token t1"}
        ]"#;
        let candidates = Platform::Windows.parse_process_list(stdout);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].pid, 3);
        assert!(Platform::Windows.parse_process_list("not json").is_empty());
    }

    #[test]
    fn test_parse_netstat() {
        let stdout = "\
  TCP    127.0.0.1:52000        0.0.0.0:0              LISTENING       900
  TCP    0.0.0.0:51000          0.0.0.0:0              LISTENING       900
  TCP    [::1]:52000            [::]:0                 LISTENING       900
  TCP    127.0.0.1:53000        127.0.0.1:1            ESTABLISHED     900
  TCP    127.0.0.1:54000        0.0.0.0:0              LISTENING       9001
  TCP    127.0.0.1:55000        0.0.0.0:0              LISTENING       1900
";
        assert_eq!(
            Platform::Windows.parse_listening_ports(stdout, 900),
            vec![51000, 52000]
        );
    }

    #[test]
    fn test_parse_lsof_filters_pid() {
        let stdout = "\
COMMAND     PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME
language_ 4242 me   12u  IPv4 0x1      0t0  TCP 127.0.0.1:42101 (LISTEN)
language_ 4242 me   13u  IPv6 0x2      0t0  TCP [::1]:42100 (LISTEN)
other     9999 me   14u  IPv4 0x3      0t0  TCP *:8080 (LISTEN)
";
        assert_eq!(
            Platform::MacOs.parse_listening_ports(stdout, 4242),
            vec![42100, 42101]
        );
    }

    #[test]
    fn test_parse_ss_with_lsof_fallback() {
        let ss = "LISTEN 0      4096       127.0.0.1:42102      0.0.0.0:*    users:((\"language_server\",pid=4242,fd=9))\n";
        assert_eq!(Platform::Linux.parse_listening_ports(ss, 4242), vec![42102]);

        let lsof = "language_ 4242 me 12u IPv4 0x1 0t0 TCP *:42103 (LISTEN)\n";
        assert_eq!(Platform::Linux.parse_listening_ports(lsof, 4242), vec![42103]);
    }

    #[test]
    fn test_parse_parent_pid() {
        assert_eq!(Platform::Linux.parse_parent_pid("  314\n"), Some(314));
        assert_eq!(Platform::Linux.parse_parent_pid(""), None);
    }
}
