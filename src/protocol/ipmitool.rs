//! ipmitool subprocess transport.
//! Each exchange spawns `ipmitool ... raw <netfn> <cmd> <data>` on a tokio task
//! and resolves the scheduler's completion with the parsed response.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::config::types::{IpmiSettings, LinkSettings};
use crate::error::TransportError;

use super::{Bridge, Completion, CompletionCode, Request, Response, Transport};

/// Something that can carry one request to a CM and wait for its answer.
#[async_trait]
pub trait IpmiLink: Send + Sync {
    async fn exchange(&self, request: &Request) -> Result<Response, TransportError>;
}

pub struct IpmitoolLink {
    program: String,
    link: LinkSettings,
    timeout: Duration,
}

impl IpmitoolLink {
    pub fn new(link: LinkSettings, settings: &IpmiSettings) -> Self {
        Self {
            program: settings.ipmitool_path.clone(),
            link,
            timeout: Duration::from_millis(settings.command_timeout_ms),
        }
    }

    /// Build the ipmitool command line for `request`: interface flags, bridge
    /// flags, then `raw` with every byte as a `0x..` argument.
    pub fn build_command(&self, request: &Request) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);

        match &self.link {
            LinkSettings::Lanplus { host, port, user, password } => {
                cmd.args(["-I", "lanplus", "-H", host, "-p", &port.to_string(), "-U", user, "-P", password]);
            }
            LinkSettings::Serial { device, baud } => {
                cmd.args(["-I", "serial-terminal", "-D", &format!("{}:{}", device, baud)]);
            }
            LinkSettings::Open => {
                cmd.args(["-I", "open"]);
            }
        }

        match request.bridge {
            Some(Bridge::Single { addr, channel }) => {
                cmd.args(["-b", &channel.to_string(), "-t", &format!("0x{:02x}", addr)]);
            }
            Some(Bridge::Dual { transit_addr, transit_channel, addr, channel }) => {
                cmd.args(["-B", &transit_channel.to_string(), "-T", &format!("0x{:02x}", transit_addr)]);
                cmd.args(["-b", &channel.to_string(), "-t", &format!("0x{:02x}", addr)]);
            }
            None => {}
        }

        cmd.arg("raw");
        cmd.arg(format!("0x{:02x}", request.netfn));
        cmd.arg(format!("0x{:02x}", request.cmd));
        for byte in &request.data {
            cmd.arg(format!("0x{:02x}", byte));
        }

        cmd
    }
}

#[async_trait]
impl IpmiLink for IpmitoolLink {
    async fn exchange(&self, request: &Request) -> Result<Response, TransportError> {
        let cmd = self.build_command(request);
        trace!("Executing: {} {:?}", self.program, cmd.get_args().collect::<Vec<_>>());

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| TransportError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|source| TransportError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            // A device-level rejection still carries the completion code
            if let Some(code) = parse_completion_code(&stderr) {
                debug!(%request, code = %CompletionCode(code), "ipmitool raw rejected");
                return Ok(Response::error(code));
            }
            return Err(TransportError::Exit {
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        let data = parse_raw_output(&String::from_utf8_lossy(&output.stdout))?;
        Ok(Response::ok(data))
    }
}

/// Parse `ipmitool raw` stdout: whitespace separated hex bytes, possibly
/// wrapped over several lines.
pub fn parse_raw_output(stdout: &str) -> Result<Vec<u8>, TransportError> {
    stdout
        .split_whitespace()
        .map(|token| {
            let digits = token.trim_start_matches("0x");
            u8::from_str_radix(digits, 16).map_err(|_| TransportError::Parse(token.to_string()))
        })
        .collect()
}

/// Pull the completion code out of an ipmitool error line such as
/// `Unable to send RAW command (channel=0x0 netfn=0x38 lun=0x0 cmd=0x1 rsp=0xc1): Invalid command`.
pub fn parse_completion_code(stderr: &str) -> Option<u8> {
    let start = stderr.find("rsp=0x")? + "rsp=0x".len();
    let digits: String = stderr[start..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    u8::from_str_radix(&digits, 16).ok()
}

/// Transport that runs each exchange on its own tokio task over the link
/// configured for the CM unit.
pub struct LinkTransport {
    links: Vec<Arc<dyn IpmiLink>>,
}

impl LinkTransport {
    /// `links[i]` serves scheduler unit `i`.
    pub fn new(links: Vec<Arc<dyn IpmiLink>>) -> Self {
        Self { links }
    }
}

impl Transport for LinkTransport {
    fn dispatch(&self, request: Request, completion: Completion) {
        let unit = completion.tag().unit;
        let Some(link) = self.links.get(unit).cloned() else {
            completion.complete(Err(TransportError::UnknownUnit(unit)));
            return;
        };

        tokio::spawn(async move {
            let result = link.exchange(&request).await;
            completion.complete(result);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Tag, NETFN_CM};
    use tokio::sync::mpsc::unbounded_channel;

    fn args(cmd: &std::process::Command) -> Vec<String> {
        cmd.get_args().map(|a| a.to_string_lossy().to_string()).collect()
    }

    fn lan_link() -> IpmitoolLink {
        IpmitoolLink::new(
            LinkSettings::Lanplus {
                host: "10.1.0.5".to_string(),
                port: 623,
                user: "admin".to_string(),
                password: "pw".to_string(),
            },
            &IpmiSettings::default(),
        )
    }

    #[test]
    fn test_lanplus_raw_arguments() {
        let request = Request::cm(0x06).with_data(vec![2]);
        let cmd = lan_link().build_command(&request);
        assert_eq!(
            args(&cmd),
            vec!["-I", "lanplus", "-H", "10.1.0.5", "-p", "623", "-U", "admin", "-P", "pw", "raw", "0x38", "0x06", "0x02"]
        );
    }

    #[test]
    fn test_dual_bridge_arguments() {
        let link = IpmitoolLink::new(LinkSettings::Open, &IpmiSettings::default());
        let request = Request::cm(0x0D).bridged(Bridge::through_tray(3));
        assert_eq!(
            args(&link.build_command(&request)),
            vec!["-I", "open", "-B", "2", "-T", "0x10", "-b", "4", "-t", "0x24", "raw", "0x38", "0x0d"]
        );
    }

    #[test]
    fn test_serial_interface_arguments() {
        let link = IpmitoolLink::new(
            LinkSettings::Serial { device: "/dev/ttyS0".to_string(), baud: 115_200 },
            &IpmiSettings::default(),
        );
        let request = Request::new(0x06, 0x01).bridged(Bridge::to_drawer(1));
        assert_eq!(
            args(&link.build_command(&request)),
            vec!["-I", "serial-terminal", "-D", "/dev/ttyS0:115200", "-b", "0", "-t", "0x24", "raw", "0x06", "0x01"]
        );
    }

    #[test]
    fn test_parse_raw_output_multiline() {
        let stdout = " 20 01 03 45 02 bf\n 57 01 00\n";
        assert_eq!(
            parse_raw_output(stdout).expect("parses"),
            vec![0x20, 0x01, 0x03, 0x45, 0x02, 0xbf, 0x57, 0x01, 0x00]
        );
        assert!(parse_raw_output("zz").is_err());
        assert_eq!(parse_raw_output("").expect("parses"), Vec::<u8>::new());
    }

    #[test]
    fn test_parse_completion_code() {
        let stderr = "Unable to send RAW command (channel=0x0 netfn=0x38 lun=0x0 cmd=0x1 rsp=0xc1): Invalid command";
        assert_eq!(parse_completion_code(stderr), Some(0xc1));
        assert_eq!(parse_completion_code("Error: Unable to establish IPMI v2 / RMCP+ session"), None);
    }

    struct FixedLink(Response);

    #[async_trait]
    impl IpmiLink for FixedLink {
        async fn exchange(&self, _request: &Request) -> Result<Response, TransportError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_link_transport_resolves_completion() {
        let (tx, mut rx) = unbounded_channel();
        let transport = LinkTransport::new(vec![Arc::new(FixedLink(Response::ok(vec![0x05])))]);

        let tag = Tag { unit: 0, generation: 3 };
        transport.dispatch(Request::cm(0x04), Completion::new(tag, tx.clone()));
        let event = rx.recv().await.expect("completion");
        assert_eq!(event.tag, tag);
        assert_eq!(event.result.expect("ok").data, vec![0x05]);

        let missing = Tag { unit: 9, generation: 1 };
        transport.dispatch(Request::new(NETFN_CM, 0x04), Completion::new(missing, tx));
        let event = rx.recv().await.expect("completion");
        assert!(matches!(event.result, Err(TransportError::UnknownUnit(9))));
    }
}
