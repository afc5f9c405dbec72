use crate::cli::Args;
use crate::engine::ChatEngine;
use crate::error::ChatError;
use crate::server::AuthGuard;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    routing::{ get, post },
    Router,
    extract::{ Path, State },
    http::{ HeaderMap, StatusCode },
    response::IntoResponse,
    Json,
};
use serde::{ Deserialize, Serialize };
use tower_http::cors::{ Any, CorsLayer };
use log::{ error, info };

#[derive(Deserialize)]
pub struct OpenChatroomRequest {
    pub listing_id: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
    retryable: bool,
}

#[derive(Serialize)]
struct SoldResponse {
    listing_id: String,
    chatrooms_notified: usize,
}

#[derive(Clone)]
struct AppState {
    engine: Arc<ChatEngine>,
    auth: Arc<AuthGuard>,
}

pub async fn start_http_server(
    http_port: u16,
    engine: Arc<ChatEngine>,
    auth: Arc<AuthGuard>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", http_port).parse::<SocketAddr>()?;
    info!("Starting HTTP API server on: http://{}", addr);

    let app_state = AppState {
        engine,
        auth,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/chatrooms", get(list_chatrooms_handler).post(open_chatroom_handler))
        .route("/api/chatrooms/{id}/messages", get(chatroom_messages_handler))
        .route("/api/listings/{id}/sold", post(listing_sold_handler))
        .layer(cors)
        .with_state(app_state);

    if args.enable_tls && args.tls_cert_path.is_some() && args.tls_key_path.is_some() {
        let cert_path = args.tls_cert_path.as_ref().unwrap();
        let key_path = args.tls_key_path.as_ref().unwrap();

        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            cert_path,
            key_path
        ).await?;

        tokio::spawn(async move {
            let result = axum_server
                ::bind_rustls(addr, tls_config)
                .serve(app.into_make_service()).await;

            if let Err(e) = result {
                error!("HTTPS server error: {}", e);
            }
        });

        info!("HTTPS server started with TLS enabled");
    } else {
        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                        error!("HTTP server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
                }
            }
        });

        info!("HTTP server started");
    }

    Ok(())
}

/// Resolves the caller from the auth headers the marketplace session
/// layer attaches to every request.
fn authed_user(state: &AppState, headers: &HeaderMap) -> Result<String, axum::response::Response> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    };
    state.auth
        .verify(header("x-user-id"), header("x-auth-ts"), header("x-auth-sign"))
        .map_err(|reason| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    error: "unauthorized".to_string(),
                    message: reason,
                    retryable: false,
                }),
            ).into_response()
        })
}

fn error_response(err: ChatError) -> axum::response::Response {
    let status = match &err {
        ChatError::Validation(_) => StatusCode::BAD_REQUEST,
        ChatError::Authorization(_) => StatusCode::FORBIDDEN,
        ChatError::NotFound(_) => StatusCode::NOT_FOUND,
        ChatError::Store(_) | ChatError::Directory(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status,
        Json(ErrorBody {
            error: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.retryable(),
        }),
    ).into_response()
}

async fn list_chatrooms_handler(
    State(state): State<AppState>,
    headers: HeaderMap
) -> impl IntoResponse {
    let user = match authed_user(&state, &headers) {
        Ok(user) => user,
        Err(resp) => {
            return resp;
        }
    };
    match state.engine.list_chatrooms(&user).await {
        Ok(rooms) => (StatusCode::OK, Json(rooms)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn open_chatroom_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<OpenChatroomRequest>
) -> impl IntoResponse {
    let user = match authed_user(&state, &headers) {
        Ok(user) => user,
        Err(resp) => {
            return resp;
        }
    };
    match state.engine.open_chatroom(&req.listing_id, &user).await {
        Ok(room) => (StatusCode::OK, Json(room)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn chatroom_messages_handler(
    State(state): State<AppState>,
    Path(chatroom_id): Path<String>,
    headers: HeaderMap
) -> impl IntoResponse {
    let user = match authed_user(&state, &headers) {
        Ok(user) => user,
        Err(resp) => {
            return resp;
        }
    };
    match state.engine.chatroom_messages(&chatroom_id, &user).await {
        Ok(messages) => (StatusCode::OK, Json(messages)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn listing_sold_handler(
    State(state): State<AppState>,
    Path(listing_id): Path<String>,
    headers: HeaderMap
) -> impl IntoResponse {
    let user = match authed_user(&state, &headers) {
        Ok(user) => user,
        Err(resp) => {
            return resp;
        }
    };
    match state.engine.listing_sold(&listing_id, &user).await {
        Ok(notified) =>
            (
                StatusCode::OK,
                Json(SoldResponse {
                    listing_id,
                    chatrooms_notified: notified,
                }),
            ).into_response(),
        Err(e) => error_response(e),
    }
}
