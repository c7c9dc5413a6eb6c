use clap::{Args, Parser, Subcommand};
use collab_hub_core::policy::DEFAULT_CACHE_TIMEOUT;
use collab_hub_core::session::DEFAULT_ROOM_CAPACITY;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "collab-hub")]
#[command(about = "Real-time collaborative document hub")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP and WebSocket server
    Serve(ServeConfig),

    /// Print a bearer token for local development
    Token {
        /// User id placed in the `sub` claim
        #[arg(long)]
        user_id: String,

        /// Display name used for presence and chat
        #[arg(long)]
        username: String,

        #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
        jwt_secret: String,

        /// Lifetime in seconds
        #[arg(long, default_value_t = 86_400)]
        ttl: u64,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ServeConfig {
    /// Listen address
    #[arg(long, env = "HUB_ADDR", default_value = "127.0.0.1:4000")]
    pub addr: SocketAddr,

    /// HS256 secret used to verify bearer tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// Redis for presence and chat; kept in process memory when absent
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Directory holding one content file per document
    #[arg(long, env = "HUB_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// SQLite file for documents, grants, invitations and users;
    /// `<data-dir>/hub.db` when absent
    #[arg(long, env = "HUB_DATABASE")]
    pub database: Option<PathBuf>,

    /// Buffered events per document room before slow receivers lag
    #[arg(long, default_value_t = DEFAULT_ROOM_CAPACITY)]
    pub broadcast_capacity: usize,

    /// Deadline in milliseconds for each presence or chat cache call
    #[arg(long, default_value_t = DEFAULT_CACHE_TIMEOUT.as_millis() as u64)]
    pub cache_timeout_ms: u64,

    /// Seconds to wait for open sockets to disconnect on shutdown
    #[arg(long, default_value_t = 10)]
    pub shutdown_grace_secs: u64,
}

impl ServeConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.data_dir.join("hub.db"))
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["collab-hub", "serve", "--jwt-secret", "s3cret"]).unwrap();
        let Command::Serve(cfg) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(cfg.addr, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(cfg.data_dir, PathBuf::from("data"));
        assert_eq!(cfg.broadcast_capacity, DEFAULT_ROOM_CAPACITY);
        assert_eq!(cfg.database_path(), PathBuf::from("data/hub.db"));
        assert_eq!(cfg.cache_timeout(), DEFAULT_CACHE_TIMEOUT);
    }

    #[test]
    fn explicit_database_and_timeout() {
        let cli = Cli::try_parse_from([
            "collab-hub",
            "serve",
            "--jwt-secret",
            "s",
            "--database",
            "/var/lib/hub/access.db",
            "--cache-timeout-ms",
            "250",
        ])
        .unwrap();
        let Command::Serve(cfg) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(cfg.database_path(), PathBuf::from("/var/lib/hub/access.db"));
        assert_eq!(cfg.cache_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn token_requires_identity() {
        assert!(Cli::try_parse_from(["collab-hub", "token", "--jwt-secret", "s"]).is_err());
        let cli = Cli::try_parse_from([
            "collab-hub", "token", "--user-id", "u1", "--username", "ann", "--jwt-secret", "s",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Token { ttl: 86_400, .. }));
    }
}
