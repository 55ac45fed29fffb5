use std::sync::Arc;

use log::{error, info, warn};
use warp::http::Response;
use warp::Filter;

use okr_chat::server::Server;
use okr_chat::{InMemoryBackend, Settings};

#[tokio::main]
async fn main() {
    env_logger::init();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load settings: {e}");
            std::process::exit(1);
        }
    };

    let backend = Arc::new(InMemoryBackend::new(settings.max_attachment_bytes));
    let server = Server::new(backend, settings.page_size);

    let ws_server = server.clone();
    let ws_route = warp::path("ws")
        .and(warp::ws())
        .map(move |ws: warp::ws::Ws| {
            let server = ws_server.clone();
            ws.on_upgrade(move |socket| async move {
                server.handle_connection(socket).await;
            })
        });

    let attachments = warp::path!("attachments" / String)
        .and(warp::any().map(move || server.clone()))
        .and_then(|id: String, server: Server| async move {
            match server.attachment(&id).await {
                Some((attachment, content)) => Ok(Response::builder()
                    .header("content-type", "application/octet-stream")
                    .header(
                        "content-disposition",
                        format!("attachment; filename=\"{}\"", attachment.name),
                    )
                    .body(content.to_vec())),
                None => Err(warp::reject::not_found()),
            }
        });

    let static_files = warp::fs::dir(settings.static_dir.clone());

    let routes = ws_route
        .or(attachments)
        .or(static_files)
        .with(warp::cors().allow_any_origin());

    let addr = settings.bind_address;
    match settings.tls_paths() {
        Some((cert, key)) if cert.exists() && key.exists() => {
            info!("Starting secure chat server (HTTPS/WSS) on {addr}");
            warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .run(addr)
                .await;
        }
        Some((cert, key)) => {
            warn!(
                "TLS files {} / {} not found, falling back to HTTP/WS",
                cert.display(),
                key.display()
            );
            info!("Starting chat server (HTTP/WS) on {addr}");
            warp::serve(routes).run(addr).await;
        }
        None => {
            info!("Starting chat server (HTTP/WS) on {addr}");
            warp::serve(routes).run(addr).await;
        }
    }
}
