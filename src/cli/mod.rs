use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Server Args ---
    /// Host address and port for the WebSocket server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Port for the HTTP API server.
    #[arg(long, env = "HTTP_PORT", default_value = "4100")]
    pub http_port: u16,

    // --- Chatroom Store Args ---
    /// Chatroom store type (memory, redis)
    #[arg(long, env = "STORE_TYPE", default_value = "memory")]
    pub store_type: String,

    /// Chatroom store endpoint (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "STORE_URL", default_value = "redis://127.0.0.1:6379")]
    pub store_url: String,

    /// Prefix for Redis chatroom keys.
    #[arg(long, env = "STORE_KEY_PREFIX", default_value = "chat:")]
    pub store_key_prefix: String,

    // --- Listing Service Args ---
    /// Listing directory type (http, memory). The memory directory is a
    /// seedable stand-in for tests and embedding.
    #[arg(long, env = "LISTING_DIRECTORY", default_value = "http")]
    pub listing_directory: String,

    /// Base URL of the marketplace listing API.
    #[arg(long, env = "LISTING_API_URL", default_value = "http://127.0.0.1:3000")]
    pub listing_api_url: String,

    // --- Auth Args ---
    /// Shared secret for HMAC request signing. If unset, the declared
    /// user id is trusted as-is (development only).
    #[arg(long, env = "AUTH_SECRET")]
    pub auth_secret: Option<String>,

    // --- TLS Args ---
    /// Optional path to the TLS certificate file (PEM format) for enabling WSS. Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format) for enabling WSS. Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}
