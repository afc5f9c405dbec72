pub mod api;
pub mod websocket;

use chrono::Utc;
use hmac::{ Hmac, Mac };
use sha2::Sha256;
use std::error::Error;
use std::sync::Arc;

use crate::cli::Args;
use crate::engine::ChatEngine;

type HmacSha256 = Hmac<Sha256>;

/// How far a request timestamp may drift from server time, in seconds.
const AUTH_WINDOW_SECS: i64 = 300;

/// Identity check shared by the WebSocket handshake and the REST
/// surface. The marketplace session layer signs
/// `"{user}:{ts}"` with the shared secret; without a configured secret
/// the declared user is trusted as-is (development mode).
pub struct AuthGuard {
    secret: Option<String>,
}

impl AuthGuard {
    pub fn new(secret: Option<String>) -> Self {
        AuthGuard {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    /// Returns the authenticated user id, or the reason the credentials
    /// were rejected.
    pub fn verify(
        &self,
        user: Option<&str>,
        ts: Option<&str>,
        sig: Option<&str>
    ) -> Result<String, String> {
        let user = match user {
            Some(u) if !u.is_empty() => u,
            _ => {
                return Err("missing user".to_string());
            }
        };

        let secret = match &self.secret {
            Some(s) => s,
            None => {
                return Ok(user.to_string());
            }
        };

        let (ts, sig) = match (ts, sig) {
            (Some(ts), Some(sig)) => (ts, sig),
            _ => {
                return Err("missing ts/sig".to_string());
            }
        };

        let now = Utc::now().timestamp();
        let ts_i: i64 = ts.parse().unwrap_or(0);
        if (now - ts_i).abs() > AUTH_WINDOW_SECS {
            return Err("timestamp out of range".to_string());
        }

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}:{}", user, ts).as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        if expected == sig {
            Ok(user.to_string())
        } else {
            Err("bad signature".to_string())
        }
    }
}

pub struct Server {
    addr: String,
    engine: Arc<ChatEngine>,
    auth: Arc<AuthGuard>,
    args: Args,
}

impl Server {
    pub fn new(addr: String, engine: Arc<ChatEngine>, args: Args) -> Self {
        let auth = Arc::new(AuthGuard::new(args.auth_secret.clone()));
        Self {
            addr,
            engine,
            auth,
            args,
        }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.start_http_server(self.args.http_port).await?;

        self.start_ws_server().await?;

        Ok(())
    }

    async fn start_http_server(&self, http_port: u16) -> Result<(), Box<dyn Error + Send + Sync>> {
        api::start_http_server(
            http_port,
            self.engine.clone(),
            self.auth.clone(),
            self.args.clone()
        ).await
    }

    async fn start_ws_server(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        websocket::start_ws_server(
            &self.addr,
            self.engine.clone(),
            self.auth.clone(),
            self.args.clone()
        ).await
    }
}
