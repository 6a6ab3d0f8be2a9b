// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Daemon control protocol
//
// One newline-terminated, comma-separated line per connection:
//   HTTP,<port>,<localHost>,<siteID>
//   PS
//   STOP,<tunnelID>

use uuid::Uuid;

use crate::error::ProtocolError;
use crate::network::DEFAULT_LOCAL_HOST;

pub const DEFAULT_DAEMON_PORT: u16 = 9977;

pub const TUNNEL_STARTED: &str = "Tunnel started\n";
pub const TUNNEL_STOPPED: &str = "Tunnel stopped\n";
pub const PS_HEADER: &str = "TunnelID\tSiteID\n";
pub const NO_RUNNING_TUNNELS: &str = "There are no running tunnels\n";
pub const UNKNOWN_MESSAGE: &str = "Unknown message";

/// A command understood by the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonCommand {
    /// Start an HTTP tunnel to `local_host:port`
    Http {
        port: u16,
        local_host: String,
        site_id: Option<String>,
    },
    /// List running tunnels
    Ps,
    /// Stop a running tunnel
    Stop { tunnel_id: Uuid },
}

impl DaemonCommand {
    /// Parse a single request line
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(ProtocolError::Empty);
        }

        let mut fields = line.split(',');
        let command = fields.next().unwrap_or_default();

        match command {
            "HTTP" => {
                let port = fields.next().unwrap_or_default().trim();
                let port: u16 = port.parse().map_err(|_| ProtocolError::Malformed {
                    command: "HTTP".to_string(),
                    reason: format!("invalid port '{}'", port),
                })?;
                if port == 0 {
                    return Err(ProtocolError::Malformed {
                        command: "HTTP".to_string(),
                        reason: "port cannot be 0".to_string(),
                    });
                }

                let local_host = match fields.next().map(str::trim) {
                    Some(host) if !host.is_empty() => host.to_string(),
                    _ => DEFAULT_LOCAL_HOST.to_string(),
                };

                let site_id = fields
                    .next()
                    .map(str::trim)
                    .filter(|site| !site.is_empty())
                    .map(str::to_string);

                Ok(DaemonCommand::Http {
                    port,
                    local_host,
                    site_id,
                })
            }
            "PS" => Ok(DaemonCommand::Ps),
            "STOP" => {
                let raw = fields.next().unwrap_or_default().trim();
                let tunnel_id = Uuid::parse_str(raw).map_err(|_| ProtocolError::Malformed {
                    command: "STOP".to_string(),
                    reason: format!("invalid tunnel ID '{}'", raw),
                })?;
                Ok(DaemonCommand::Stop { tunnel_id })
            }
            other => Err(ProtocolError::Unknown(other.to_string())),
        }
    }

    /// Encode as a request line, newline included
    pub fn to_line(&self) -> String {
        match self {
            DaemonCommand::Http {
                port,
                local_host,
                site_id,
            } => format!(
                "HTTP,{},{},{}\n",
                port,
                local_host,
                site_id.as_deref().unwrap_or("")
            ),
            DaemonCommand::Ps => "PS\n".to_string(),
            DaemonCommand::Stop { tunnel_id } => format!("STOP,{}\n", tunnel_id),
        }
    }
}

/// Render the PS response for `(tunnelID, siteID)` pairs
pub fn format_ps<'a, I>(tunnels: I) -> String
where
    I: IntoIterator<Item = (&'a Uuid, &'a str)>,
{
    let mut out = String::from(PS_HEADER);
    let mut any = false;
    for (tunnel_id, site_id) in tunnels {
        any = true;
        out.push_str(&format!("{}\t{}\n", tunnel_id, site_id));
    }
    if !any {
        return NO_RUNNING_TUNNELS.to_string();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http() {
        let cmd = DaemonCommand::parse("HTTP,3000,127.0.0.1,alpha1\n").unwrap();
        assert_eq!(
            cmd,
            DaemonCommand::Http {
                port: 3000,
                local_host: "127.0.0.1".into(),
                site_id: Some("alpha1".into()),
            }
        );
    }

    #[test]
    fn test_parse_http_defaults() {
        let cmd = DaemonCommand::parse("HTTP,8080,,\r\n").unwrap();
        assert_eq!(
            cmd,
            DaemonCommand::Http {
                port: 8080,
                local_host: DEFAULT_LOCAL_HOST.into(),
                site_id: None,
            }
        );

        let short = DaemonCommand::parse("HTTP,8080").unwrap();
        assert_eq!(short, cmd);
    }

    #[test]
    fn test_parse_http_rejects_bad_port() {
        assert!(matches!(
            DaemonCommand::parse("HTTP,abc,localhost,"),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            DaemonCommand::parse("HTTP,0,localhost,"),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            DaemonCommand::parse("HTTP"),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn test_parse_ps_and_stop() {
        assert_eq!(DaemonCommand::parse("PS\n").unwrap(), DaemonCommand::Ps);

        let id = Uuid::new_v4();
        assert_eq!(
            DaemonCommand::parse(&format!("STOP,{}\n", id)).unwrap(),
            DaemonCommand::Stop { tunnel_id: id }
        );
        assert!(DaemonCommand::parse("STOP,nope").is_err());
    }

    #[test]
    fn test_parse_unknown_and_empty() {
        assert_eq!(
            DaemonCommand::parse("HELLO,1,2"),
            Err(ProtocolError::Unknown("HELLO".into()))
        );
        assert_eq!(DaemonCommand::parse("\n"), Err(ProtocolError::Empty));
    }

    #[test]
    fn test_to_line_parses_back() {
        let cmd = DaemonCommand::Http {
            port: 3000,
            local_host: "localhost".into(),
            site_id: None,
        };
        assert_eq!(cmd.to_line(), "HTTP,3000,localhost,\n");
        assert_eq!(DaemonCommand::parse(&cmd.to_line()).unwrap(), cmd);
    }

    #[test]
    fn test_format_ps() {
        let none: Vec<(&Uuid, &str)> = Vec::new();
        assert_eq!(format_ps(none), NO_RUNNING_TUNNELS);

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let out = format_ps(vec![(&a, "alpha"), (&b, "beta")]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "TunnelID\tSiteID");
        assert_eq!(lines.len(), 3);
        assert!(lines.contains(&format!("{}\talpha", a).as_str()));
        assert!(lines.contains(&format!("{}\tbeta", b).as_str()));
    }
}
