/*
 *  vmdev web framebuffer plugin - HTTP stream fan-out
 */

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{header, Body, Method, Request, Response, StatusCode};
use log::{debug, error, warn};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::broadcaster::multipart_part;

/// Accept viewers until the device closes. Each connection becomes its
/// own task on the same single-threaded loop, so listener attach/detach
/// and frame fan-out are serialized by construction — no shared listener
/// list, no lock between encode and network code.
pub(crate) async fn serve(
    listener: std::net::TcpListener,
    frames: watch::Receiver<Bytes>,
    closing: watch::Receiver<bool>,
    clients: Arc<AtomicUsize>,
) {
    if let Err(err) = listener.set_nonblocking(true) {
        error!("stream listener setup failed: {}", err);
        return;
    }
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            error!("stream listener registration failed: {}", err);
            return;
        }
    };

    let mut closing_accept = closing.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("viewer connected from {}", peer);
                    tokio::spawn(handle_connection(
                        stream,
                        frames.clone(),
                        closing.clone(),
                        Arc::clone(&clients),
                    ));
                }
                Err(err) => warn!("viewer accept failed: {}", err),
            },
            _ = wait_closing(&mut closing_accept) => break,
        }
    }
    debug!("stream listener closed");
}

async fn handle_connection(
    stream: TcpStream,
    frames: watch::Receiver<Bytes>,
    closing: watch::Receiver<bool>,
    clients: Arc<AtomicUsize>,
) {
    let mut closing_conn = closing.clone();
    let service = service_fn(move |req: Request<Body>| {
        let frames = frames.clone();
        let closing = closing.clone();
        let clients = Arc::clone(&clients);
        async move { Ok::<_, Infallible>(route(&req, frames, closing, clients)) }
    });

    let connection = Http::new().serve_connection(stream, service);
    tokio::select! {
        result = connection => {
            if let Err(err) = result {
                debug!("viewer connection ended: {}", err);
            }
        }
        _ = wait_closing(&mut closing_conn) => {}
    }
}

fn route(
    req: &Request<Body>,
    frames: watch::Receiver<Bytes>,
    closing: watch::Receiver<bool>,
    clients: Arc<AtomicUsize>,
) -> Response<Body> {
    if req.method() == Method::GET && req.uri().path() == "/stream" {
        stream_response(frames, closing, clients)
    } else {
        status_response(StatusCode::NOT_FOUND)
    }
}

/// Open-ended multipart response. The body is fed by a pump task holding
/// a frame receiver; joining is "from now on" — the pump only forwards
/// frames published after this point, never a replay.
fn stream_response(
    frames: watch::Receiver<Bytes>,
    closing: watch::Receiver<bool>,
    clients: Arc<AtomicUsize>,
) -> Response<Body> {
    let (sender, body) = Body::channel();
    tokio::spawn(pump_frames(sender, frames, closing, clients));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=--frame")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::PRAGMA, "no-cache")
        .body(body)
        .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

/// Forward each newly published frame as one complete part. The watch
/// channel holds only the newest frame, so a viewer that cannot keep up
/// skips frames — there is no per-viewer queue to grow.
async fn pump_frames(
    mut sender: hyper::body::Sender,
    mut frames: watch::Receiver<Bytes>,
    mut closing: watch::Receiver<bool>,
    clients: Arc<AtomicUsize>,
) {
    let viewers = clients.fetch_add(1, Ordering::SeqCst) + 1;
    debug!("viewer joined the stream ({} active)", viewers);

    loop {
        tokio::select! {
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let frame = frames.borrow_and_update().clone();
                if frame.is_empty() {
                    continue;
                }
                if sender.send_data(multipart_part(&frame)).await.is_err() {
                    // Viewer went away mid-write; it removes itself here.
                    break;
                }
            }
            changed = closing.changed() => {
                if changed.is_err() || *closing.borrow() {
                    break;
                }
            }
        }
    }

    let viewers = clients.fetch_sub(1, Ordering::SeqCst) - 1;
    debug!("viewer left the stream ({} active)", viewers);
}

async fn wait_closing(closing: &mut watch::Receiver<bool>) {
    loop {
        if *closing.borrow() {
            return;
        }
        if closing.changed().await.is_err() {
            // Device gone entirely; treat as closing.
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::{timeout, Duration};

    async fn read_headers(stream: &mut TcpStream, collected: &mut Vec<u8>) -> String {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(pos) = find_double_crlf(collected) {
                let head = String::from_utf8_lossy(&collected[..pos]).into_owned();
                collected.drain(..pos + 4);
                return head;
            }
            let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .expect("read timed out")
                .expect("read failed");
            assert!(n > 0, "connection closed early");
            collected.extend_from_slice(&buf[..n]);
        }
    }

    async fn read_exact_bytes(stream: &mut TcpStream, collected: &mut Vec<u8>, want: usize) -> Vec<u8> {
        let mut buf = [0u8; 1024];
        while collected.len() < want {
            let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .expect("read timed out")
                .expect("read failed");
            assert!(n > 0, "connection closed early");
            collected.extend_from_slice(&buf[..n]);
        }
        collected.drain(..want).collect()
    }

    fn find_double_crlf(data: &[u8]) -> Option<usize> {
        data.windows(4).position(|w| w == b"\r\n\r\n")
    }

    #[tokio::test]
    async fn viewer_receives_complete_parts_for_each_frame() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let (frame_tx, frame_rx) = watch::channel(Bytes::new());
        let (closing_tx, closing_rx) = watch::channel(false);
        let clients = Arc::new(AtomicUsize::new(0));

        tokio::spawn(serve(listener, frame_rx, closing_rx, Arc::clone(&clients)));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /stream HTTP/1.1\r\nHost: test\r\n\r\n")
            .await
            .unwrap();

        let mut collected = Vec::new();
        let head = read_headers(&mut stream, &mut collected).await;
        assert!(head.starts_with("HTTP/1.1 200"));
        assert!(head.contains("multipart/x-mixed-replace; boundary=--frame"));

        // Viewer is attached; publish two frames and read both parts.
        frame_tx.send_replace(Bytes::from_static(b"FRAME-ONE"));
        let part_head = read_headers(&mut stream, &mut collected).await;
        assert!(part_head.contains("--frame"));
        assert!(part_head.contains("Content-Type: image/jpeg"));
        assert!(part_head.contains(&format!("Content-Length: {}", b"FRAME-ONE".len())));
        let payload = read_exact_bytes(&mut stream, &mut collected, b"FRAME-ONE".len() + 2).await;
        assert_eq!(&payload[..b"FRAME-ONE".len()], b"FRAME-ONE");

        frame_tx.send_replace(Bytes::from_static(b"SECOND"));
        let part_head = read_headers(&mut stream, &mut collected).await;
        assert!(part_head.contains(&format!("Content-Length: {}", b"SECOND".len())));
        let payload = read_exact_bytes(&mut stream, &mut collected, b"SECOND".len() + 2).await;
        assert_eq!(&payload[..b"SECOND".len()], b"SECOND");

        assert_eq!(clients.load(Ordering::SeqCst), 1);

        // Shutdown closes the viewer and the listener.
        closing_tx.send_replace(true);
        let mut rest = Vec::new();
        let _ = timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(clients.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn other_paths_get_a_404() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let (_frame_tx, frame_rx) = watch::channel(Bytes::new());
        let (_closing_tx, closing_rx) = watch::channel(false);
        let clients = Arc::new(AtomicUsize::new(0));

        tokio::spawn(serve(listener, frame_rx, closing_rx, clients));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /snapshot HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .expect("read timed out")
            .expect("read failed");
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 404"));
    }
}
