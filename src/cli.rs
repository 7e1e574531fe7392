use std::net::{IpAddr, SocketAddr};

use axum::http;
use conf::{Conf, Subcommands, anstyle::AnsiColor};
use listenfd::ListenFd;

#[derive(Conf, Clone)]
pub struct RpcCredentials {
    #[conf(long, env)]
    username: String,
    #[conf(long, env)]
    password: String,
}

impl std::fmt::Debug for RpcCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcCredentials")
            .field("username", &self.username)
            .field("password", &"REDACTED")
            .finish()
    }
}

impl From<RpcCredentials> for (String, String) {
    fn from(val: RpcCredentials) -> Self {
        (val.username, val.password)
    }
}

#[derive(Debug, Conf, Clone)]
pub struct RunConfig {
    #[conf(long, env, default_value = "::")]
    /// Address to expose the service
    pub bind: String,

    #[conf(long, env, default(8080))]
    /// Port to expose the service
    pub port: u16,

    #[conf(long, env, default_value = "http://localhost:5001/api/v0")]
    /// Address to the IPFS Node RPC endpoints (often a Kubo service)
    pub rpc_address: http::Uri,

    #[conf(flatten, prefix)]
    /// Optional username and password to access the IPFS Node
    pub rpc_credentials: Option<RpcCredentials>,

    #[conf(long, env)]
    /// Enable POST/PUT/DELETE. Every successful write answers with the new
    /// root CID in the IPFS-Hash header
    pub writable: bool,

    #[conf(repeat, long, env)]
    /// "Name: Value" header merged into every response (CORS lives here).
    /// Flag can be used multiple times
    pub header: Vec<String>,

    #[conf(repeat, long, env)]
    /// Allowed values for the legacy X-Ipfs-Gateway-Prefix header.
    /// Flag can be used multiple times
    pub path_prefix: Vec<String>,

    #[conf(long, env, default_value = "/gateway-scratch")]
    /// MFS directory used to stage writable sessions on the IPFS Node
    pub scratch_prefix: String,
}

impl RunConfig {
    /// Provides support for socket activation - such as systemd-socket or `systemfd` hot-reloading utility
    ///
    /// If no socket is passed, it will use the [`RunConfig`] `host` and `port` to build a listener
    pub async fn listen_socket(&self) -> tokio::net::TcpListener {
        let mut listenfd = ListenFd::from_env();

        if let Ok(Some(l)) = listenfd.take_tcp_listener(0) {
            tracing::info!(addr = ?l, "Using socket from listenfd");
            let () = l
                .set_nonblocking(true)
                .expect("Could not make convert listenfd to a non-blocking socket");
            tokio::net::TcpListener::from_std(l).expect("Failed to convert listenfd to tokio")
        } else {
            // Allow changing the default fallback address using environment variables
            let addr = match self.bind.parse::<IpAddr>() {
                Ok(ip) => SocketAddr::from((ip, self.port)),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to parse HOST address");
                    std::process::exit(1);
                }
            };

            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    tracing::info!(?addr, "Listening on address");
                    listener
                }
                Err(e) => {
                    tracing::error!(error = %e, ?addr, "Failed to bind to address");
                    std::process::exit(1);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn test() -> Self {
        RunConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            rpc_address: http::Uri::from_static("http://localhost:5001/api/v0"),
            rpc_credentials: None,
            writable: false,
            header: Vec::new(),
            path_prefix: Vec::new(),
            scratch_prefix: "/gateway-scratch".to_string(),
        }
    }
}

#[derive(Debug, Subcommands)]
pub enum CliOperations {
    /// Start the gateway. [Default]
    Run(RunConfig),
    /// Dump parsed configuration
    Config(RunConfig),
}

const HELP_STYLES: conf::Styles = conf::Styles::styled()
    .header(AnsiColor::Blue.on_default().bold())
    .usage(AnsiColor::Blue.on_default().bold())
    .literal(AnsiColor::White.on_default())
    .placeholder(AnsiColor::Green.on_default());

#[derive(Conf, Debug)]
#[conf(
    name = "ipiranga",
    about = "HTTP gateway that serves IPFS content-addressed storage as a browser-friendly web surface.",
    styles = HELP_STYLES
)]
pub struct Cli {
    #[conf(subcommands)]
    pub command: Option<CliOperations>,

    #[conf(flatten)]
    pub config: RunConfig,
}
