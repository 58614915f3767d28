// Listening-socket queries for the well-known sidecar port.
use async_trait::async_trait;
use serde::Serialize;
use std::io;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerProcess {
    pub pid: u32,
    /// Full command line, empty when it could not be read.
    pub command: String,
}

/// Finds and signals processes bound to a TCP port.
#[async_trait]
pub trait PortInspector: Send + Sync {
    async fn listeners(&self, port: u16) -> Vec<ListenerProcess>;

    fn terminate(&self, pid: u32) -> io::Result<()>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// `lsof` + `ps` on Unix, `netstat` + PowerShell on Windows. Every failure
/// degrades to "no listeners".
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortInspector;

#[async_trait]
impl PortInspector for SystemPortInspector {
    async fn listeners(&self, port: u16) -> Vec<ListenerProcess> {
        let pids = listening_pids(port).await;
        let mut out = Vec::with_capacity(pids.len());
        for pid in pids {
            out.push(ListenerProcess {
                pid,
                command: command_line(pid).await.unwrap_or_default(),
            });
        }
        out
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        crate::process::terminate_pid(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        crate::process::pid_is_alive(pid)
    }
}

async fn run_capture(program: &str, args: &[&str]) -> Option<String> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    match cmd.output().await {
        Ok(output) => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
        Err(e) => {
            tracing::debug!("{} unavailable: {}", program, e);
            None
        }
    }
}

#[cfg(not(windows))]
async fn listening_pids(port: u16) -> Vec<u32> {
    let filter = format!("-iTCP:{port}");
    // lsof exits 1 when nothing matches; stdout is still authoritative.
    run_capture("lsof", &["-nP", &filter, "-sTCP:LISTEN", "-t"])
        .await
        .map(|out| parse_lsof_pids(&out))
        .unwrap_or_default()
}

#[cfg(windows)]
async fn listening_pids(port: u16) -> Vec<u32> {
    run_capture("netstat", &["-ano", "-p", "TCP"])
        .await
        .map(|out| parse_netstat_listeners(&out, port))
        .unwrap_or_default()
}

#[cfg(not(windows))]
async fn command_line(pid: u32) -> Option<String> {
    let pid = pid.to_string();
    run_capture("ps", &["-o", "command=", "-p", &pid])
        .await
        .map(|out| out.trim().to_string())
        .filter(|cmd| !cmd.is_empty())
}

#[cfg(windows)]
async fn command_line(pid: u32) -> Option<String> {
    let query = format!("(Get-CimInstance Win32_Process -Filter \"ProcessId={pid}\").CommandLine");
    run_capture("powershell", &["-NoProfile", "-Command", &query])
        .await
        .map(|out| out.trim().to_string())
        .filter(|cmd| !cmd.is_empty())
}

pub(crate) fn parse_lsof_pids(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Picks the owning pid of `LISTENING` rows whose local address ends in `:port`.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn parse_netstat_listeners(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 || !cols[0].eq_ignore_ascii_case("TCP") {
                return None;
            }
            if !cols[3].eq_ignore_ascii_case("LISTENING") || !cols[1].ends_with(&suffix) {
                return None;
            }
            cols[4].parse().ok()
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsof_terse_output_yields_unique_pids() {
        assert_eq!(parse_lsof_pids("4312\n 977\n4312\n\n"), vec![977, 4312]);
        assert!(parse_lsof_pids("").is_empty());
    }

    #[test]
    fn netstat_rows_filtered_by_port_and_state() {
        let out = "\
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    127.0.0.1:39741        0.0.0.0:0              LISTENING       5120
  TCP    127.0.0.1:397410       0.0.0.0:0              LISTENING       6000
  TCP    127.0.0.1:52311        127.0.0.1:39741        ESTABLISHED     7000
  TCP    [::1]:39741            [::]:0                 LISTENING       5120
";
        assert_eq!(parse_netstat_listeners(out, 39741), vec![5120]);
    }
}
