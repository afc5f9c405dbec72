use crate::cli::Args;
use crate::engine::ChatEngine;
use crate::error::ChatError;
use crate::models::events::{ ClientEvent, ServerEvent };
use crate::server::AuthGuard;

use std::collections::HashMap;
use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tokio_tungstenite::{ accept_hdr_async, WebSocketStream };
use tokio_tungstenite::tungstenite::handshake::server::{ ErrorResponse, Request, Response };
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_rustls::TlsAcceptor;

use rustls::ServerConfig;
use rustls::pki_types::{ CertificateDer, PrivateKeyDer };
use rustls_pemfile::{ certs, pkcs8_private_keys };

use lazy_static::lazy_static;
use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };

use url::form_urlencoded;

use log::{ error, info, warn };
use futures::{ SinkExt, StreamExt };

const MAX_MESSAGE_SIZE: usize = 1 * 1024 * 1024;

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap()));
}

fn load_tls_config(
    cert_path: &str,
    key_path: &str
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let mut keys = pkcs8_private_keys(&mut key_reader);
    let key = match keys.next() {
        Some(Ok(k)) => PrivateKeyDer::Pkcs8(k),
        Some(Err(e)) => {
            return Err(format!("Error reading private key: {}", e).into());
        }
        None => {
            return Err("No PKCS8 private key found in key file".into());
        }
    };

    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

pub async fn start_ws_server(
    addr: &str,
    engine: Arc<ChatEngine>,
    auth: Arc<AuthGuard>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    let protocol = if
        args.enable_tls &&
        args.tls_cert_path.is_some() &&
        args.tls_key_path.is_some()
    {
        "wss"
    } else {
        "ws"
    };
    info!("{} server listening on: {}", protocol.to_uppercase(), addr);

    let tls_acceptor = if args.enable_tls {
        match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert_path), Some(key_path)) => {
                info!(
                    "TLS enabled. Loading certificate from '{}' and key from '{}'",
                    cert_path,
                    key_path
                );
                let config = load_tls_config(cert_path, key_path)?;
                Some(TlsAcceptor::from(config))
            }
            (Some(_), None) | (None, Some(_)) => {
                error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                return Err("Missing TLS certificate or key path".into());
            }
            (None, None) => {
                error!("--enable-tls was set but no certificate/key paths provided.");
                return Err("TLS enabled without cert/key".into());
            }
        }
    } else {
        info!("TLS not enabled. Running plain WebSocket (WS) server.");
        None
    };

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let engine_clone = Arc::clone(&engine);
        let auth_clone = Arc::clone(&auth);
        let tls_acceptor_clone = tls_acceptor.clone();

        tokio::spawn(async move {
            let process_result = if let Some(acceptor) = tls_acceptor_clone {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        info!("TLS handshake successful for {}", peer);
                        process_connection(peer, tls_stream, engine_clone, auth_clone).await
                    }
                    Err(e) => {
                        error!("TLS handshake error for {}: {}", peer, e);
                        Err(Box::new(e) as Box<dyn Error + Send + Sync>)
                    }
                }
            } else {
                process_connection(peer, stream, engine_clone, auth_clone).await
            };

            if let Err(e) = process_result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

fn unauthorized(reason: &str) -> ErrorResponse {
    let res = Response::builder()
        .status(401)
        .body(Some(reason.to_string()))
        .unwrap();
    ErrorResponse::from(res)
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    engine: Arc<ChatEngine>,
    auth: Arc<AuthGuard>
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let mut authed_user: Option<String> = None;
    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let qs = req.uri().query().unwrap_or("");
        let params: HashMap<String, String> = form_urlencoded
            ::parse(qs.as_bytes())
            .into_owned()
            .collect();

        let user = params.get("user").map(|s| s.as_str());
        let ts = params.get("ts").map(|s| s.as_str());
        let sig = params.get("sig").map(|s| s.as_str());

        match auth.verify(user, ts, sig) {
            Ok(user_id) => {
                authed_user = Some(user_id);
                Ok(response)
            }
            Err(reason) => {
                warn!("Rejected WebSocket handshake from {}: {}", peer, reason);
                Err(unauthorized(&reason))
            }
        }
    };

    match accept_hdr_async(stream, auth_callback).await {
        Ok(ws) => {
            match authed_user {
                Some(user_id) => {
                    handle_connection(peer, ws, engine, user_id).await;
                    Ok(())
                }
                None => Err("Handshake completed without an authenticated user".into()),
            }
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as _)
        }
    }
}

pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    engine: Arc<ChatEngine>,
    user_id: String
)
    where S: AsyncRead + AsyncWrite + Unpin
{
    info!("New WebSocket connection: {} (user {})", peer, user_id);

    let (mut tx, mut rx) = websocket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let connection_id = engine.registry().register(&user_id, outbound_tx);

    'conn: loop {
        tokio::select! {
            queued = outbound_rx.recv() => {
                let event = match queued {
                    Some(event) => event,
                    None => break 'conn,
                };
                let json = serde_json::to_string(&event).unwrap();
                if let Err(e) = tx.send(Message::Text(json)).await {
                    error!("Error forwarding event to {}: {}", peer, e);
                    break 'conn;
                }
            }
            incoming = rx.next() => {
                let msg = match incoming {
                    Some(msg) => msg,
                    None => break 'conn,
                };
                match msg {
                    Ok(message) => {
                        if message.len() > MAX_MESSAGE_SIZE {
                            warn!(
                                "Message from {} exceeds size limit ({} > {})",
                                peer,
                                message.len(),
                                MAX_MESSAGE_SIZE
                            );
                            let err = ChatError::Validation("message too large".to_string());
                            let json = serde_json::to_string(
                                &ServerEvent::from_error(&err, None)
                            ).unwrap();
                            if tx.send(Message::Text(json)).await.is_err() {
                                error!("Failed to send size limit error to {}", peer);
                            }
                            break 'conn;
                        }

                        match message {
                            Message::Text(text) => {
                                match serde_json::from_str::<ClientEvent>(&text) {
                                    Ok(event) => {
                                        let replies = engine.handle_event(
                                            &connection_id,
                                            &user_id,
                                            event
                                        ).await;
                                        for reply in replies {
                                            let json = serde_json::to_string(&reply).unwrap();
                                            if let Err(e) = tx.send(Message::Text(json)).await {
                                                error!("Error sending reply to {}: {}", peer, e);
                                                break 'conn;
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        warn!("Failed to parse event from {}: {}", peer, e);
                                        let err = ChatError::Validation(
                                            format!("could not parse event: {}", e)
                                        );
                                        let json = serde_json::to_string(
                                            &ServerEvent::from_error(&err, None)
                                        ).unwrap();
                                        if tx.send(Message::Text(json)).await.is_err() {
                                            error!("Error sending parse error to {}", peer);
                                            break 'conn;
                                        }
                                    }
                                }
                            }
                            Message::Close(_) => {
                                info!("Received close frame from {}", peer);
                                break 'conn;
                            }
                            Message::Ping(ping_data) => {
                                if tx.send(Message::Pong(ping_data)).await.is_err() {
                                    error!("Failed to send pong to {}", peer);
                                    break 'conn;
                                }
                            }
                            Message::Pong(_) => {/* Usually ignore pongs */}
                            Message::Binary(_) => {
                                warn!("Ignoring binary message from {}", peer);
                            }
                            Message::Frame(_) => {/* Usually ignore raw frames */}
                        }
                    }
                    Err(e) => {
                        match e {
                            | tokio_tungstenite::tungstenite::Error::ConnectionClosed
                            | tokio_tungstenite::tungstenite::Error::Protocol(_)
                            | tokio_tungstenite::tungstenite::Error::Utf8 => {
                                info!("WebSocket connection closed or protocol error for {}: {}", peer, e);
                            }
                            tokio_tungstenite::tungstenite::Error::Io(ref io_err) if
                                io_err.kind() == std::io::ErrorKind::ConnectionReset
                            => {
                                info!("WebSocket connection reset by peer {}", peer);
                            }
                            tokio_tungstenite::tungstenite::Error::Capacity(ref cap_err) => {
                                error!("WebSocket capacity error for {}: {}", peer, cap_err);
                                let err = ChatError::Validation("server capacity error".to_string());
                                let json = serde_json::to_string(
                                    &ServerEvent::from_error(&err, None)
                                ).unwrap();
                                let _ = tx.send(Message::Text(json)).await;
                            }
                            _ => {
                                error!("Error receiving message from {}: {}", peer, e);
                            }
                        }
                        break 'conn;
                    }
                }
            }
        }
    }

    // The connection drops out of every channel; chatroom state and
    // any send already past the store stay as they are.
    engine.registry().disconnect(&connection_id);
    info!("WebSocket connection closed for {} (user {})", peer, user_id);
}
