use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::Parser;

/// A networked task queue and pub/sub broker for distributing work across
/// untrusted, unreliable workers.
#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Key namespace prefix for everything this broker writes to Redis/Mongo.
    #[arg(long, env = "ZAKU_PREFIX", default_value = "Zaku-task-queues")]
    pub prefix: String,

    /// Address to listen on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub host: IpAddr,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 9001)]
    pub port: u16,

    /// If set, binds an OS-assigned free port instead of failing when `port`
    /// is already in use.
    #[arg(long, default_value_t)]
    pub free_port: bool,

    /// Comma-separated list of allowed CORS origins, or `*` for any.
    #[arg(long, default_value = "*")]
    pub cors: String,

    /// TLS certificate (optional; plaintext HTTP if omitted).
    #[arg(long)]
    pub cert: Option<PathBuf>,
    #[arg(long)]
    pub key: Option<PathBuf>,
    #[arg(long)]
    pub ca_cert: Option<PathBuf>,

    /// Maximum accepted request body size, in bytes.
    #[arg(long, env = "WEBSOCKET_MAX_SIZE", default_value_t = 100_000_000)]
    pub request_max_size: u64,

    /// Directory served at `GET /static/{path}`.
    #[arg(long, default_value = ".")]
    pub static_root: PathBuf,

    /// Enables human-friendly (non-JSON) logging.
    #[arg(short, long, default_value_t)]
    pub verbose: bool,

    #[arg(long, env = "REDIS_HOST", default_value = "localhost")]
    pub redis_host: String,
    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,
    #[arg(long, env = "REDIS_PASSWORD")]
    pub redis_password: Option<String>,
    #[arg(long, env = "REDIS_DB", default_value_t = 0)]
    pub redis_db: i64,

    /// Comma-separated `host:port` sentinel list; enables sentinel mode.
    #[arg(long, env = "SENTINEL_HOSTS")]
    pub sentinel_hosts: Option<String>,
    #[arg(long, env = "SENTINEL_PASSWORD")]
    pub sentinel_password: Option<String>,
    #[arg(long, env = "SENTINEL_CLUSTER_NAME", default_value = "mymaster")]
    pub sentinel_cluster_name: String,
    #[arg(long, default_value_t)]
    pub redis_shuffle: bool,

    #[arg(long, env = "MONGO_HOST", default_value = "localhost")]
    pub mongo_host: String,
    #[arg(long, env = "MONGO_PORT", default_value_t = 27017)]
    pub mongo_port: u16,
    #[arg(long, env = "MONGO_USERNAME")]
    pub mongo_username: Option<String>,
    #[arg(long, env = "MONGO_PASSWORD")]
    pub mongo_password: Option<String>,
    #[arg(long, env = "MONGO_DATABASE", default_value = "zaku")]
    pub mongo_database: String,
    #[arg(long, env = "MONGO_AUTH_SOURCE", default_value = "admin")]
    pub mongo_auth_source: String,
    /// Full connection URI; overrides host/port/username/password when set
    /// (required for replica sets).
    #[arg(long, env = "MONGO_URI")]
    pub mongo_uri: Option<String>,
}

impl From<Args> for zaku_broker::config::RawArgs {
    fn from(args: Args) -> Self {
        zaku_broker::config::RawArgs {
            prefix: args.prefix,
            host: args.host,
            port: args.port,
            cors: args.cors,
            cert: args.cert,
            key: args.key,
            ca_cert: args.ca_cert,
            request_max_size: args.request_max_size,
            free_port: args.free_port,
            static_root: args.static_root,
            verbose: args.verbose,
            redis_host: args.redis_host,
            redis_port: args.redis_port,
            redis_password: args.redis_password,
            redis_db: args.redis_db,
            sentinel_hosts: args.sentinel_hosts,
            sentinel_password: args.sentinel_password,
            sentinel_cluster_name: args.sentinel_cluster_name,
            redis_shuffle: args.redis_shuffle,
            mongo_host: args.mongo_host,
            mongo_port: args.mongo_port,
            mongo_username: args.mongo_username,
            mongo_password: args.mongo_password,
            mongo_database: args.mongo_database,
            mongo_auth_source: args.mongo_auth_source,
            mongo_uri: args.mongo_uri,
        }
    }
}
