//! Read-only static file responses over HTTP/1.1
//!
//! Connections are driven by hyper's `http1` server, one request per
//! connection. Only `GET` and `HEAD` are served. Paths are resolved below the
//! serving root; `..` segments and symlinks that lead outside it are refused.

use camino::{Utf8Path, Utf8PathBuf};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Upper bound on buffered request bytes (hyper answers 431 beyond it)
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Where a request path leads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    File(Utf8PathBuf),
    NotFound,
    Forbidden,
}

/// Resolve a request target against a canonical serving root
pub fn resolve(root: &Utf8Path, target: &str) -> Resolution {
    let path = target.split(['?', '#']).next().unwrap_or("");
    let Some(decoded) = percent_decode(path) else {
        return Resolution::Forbidden;
    };

    let mut candidate = root.to_path_buf();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Resolution::Forbidden,
            s if s.contains('\\') || s.contains('\0') => return Resolution::Forbidden,
            s => candidate.push(s),
        }
    }

    if candidate.is_dir() {
        candidate.push("index.html");
    }

    match candidate.canonicalize_utf8() {
        Ok(real) if !real.starts_with(root) => Resolution::Forbidden,
        Ok(real) if real.is_file() => Resolution::File(real),
        _ => Resolution::NotFound,
    }
}

/// Decode `%XX` escapes; `None` for malformed escapes or non UTF-8 results
pub fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).ok()
}

/// Content type by extension
pub fn content_type(path: &Utf8Path) -> &'static str {
    match path.extension().map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("wasm") => "application/wasm",
        Some("css") => "text/css; charset=utf-8",
        Some("json" | "map") => "application/json",
        Some("data") => "application/octet-stream",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Serve one connection until its single request is answered
pub async fn serve_connection<S>(stream: S, root: Arc<Utf8PathBuf>) -> hyper::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let root = root.clone();
        let method = req.method().clone();
        let target = req.uri().path().to_string();
        async move { Ok::<_, Infallible>(respond(&root, &method, &target).await) }
    });

    http1::Builder::new()
        .keep_alive(false)
        .max_buf_size(MAX_HEAD_BYTES)
        .serve_connection(TokioIo::new(stream), service)
        .await
}

/// Answer a request for `target` from the files below `root`
pub async fn respond(root: &Utf8Path, method: &Method, target: &str) -> Response<Full<Bytes>> {
    let head_only = match *method {
        Method::GET => false,
        Method::HEAD => true,
        _ => {
            let mut response = status(StatusCode::METHOD_NOT_ALLOWED);
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
            return response;
        }
    };

    match resolve(root, target) {
        Resolution::File(path) => match tokio::fs::read(&path).await {
            Ok(contents) => {
                tracing::debug!("{} {} -> 200 ({} bytes)", method, target, contents.len());
                let len = contents.len();
                let body = if head_only {
                    Bytes::new()
                } else {
                    Bytes::from(contents)
                };
                let mut response = Response::new(Full::new(body));
                let headers = response.headers_mut();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(content_type(&path)),
                );
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
                headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                response
            }
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", path, e);
                status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        },
        Resolution::NotFound => {
            tracing::debug!("{} {} -> 404", method, target);
            status(StatusCode::NOT_FOUND)
        }
        Resolution::Forbidden => {
            tracing::warn!("Refused request outside the served directory: {}", target);
            status(StatusCode::FORBIDDEN)
        }
    }
}

fn status(code: StatusCode) -> Response<Full<Bytes>> {
    let body = format!(
        "{} {}\n",
        code.as_u16(),
        code.canonical_reason().unwrap_or("")
    );
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = code;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::fs;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn served_root() -> (TempDir, Utf8PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let base = Utf8Path::from_path(temp_dir.path())
            .unwrap()
            .canonicalize_utf8()
            .unwrap();
        let root = base.join("build");
        fs::create_dir_all(root.join("assets")).unwrap();
        fs::write(root.join("main.html"), "<html></html>").unwrap();
        fs::write(root.join("main.wasm"), [0u8, 97, 115, 109]).unwrap();
        fs::write(root.join("index.html"), "index").unwrap();
        fs::write(root.join("assets/my font.ttf"), "font").unwrap();
        fs::write(base.join("secret.txt"), "secret").unwrap();
        (temp_dir, root)
    }

    async fn body(response: Response<Full<Bytes>>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[test]
    fn test_resolve_files() {
        let (_temp, root) = served_root();

        assert_eq!(
            resolve(&root, "/main.html?v=2"),
            Resolution::File(root.join("main.html"))
        );
        assert_eq!(resolve(&root, "/"), Resolution::File(root.join("index.html")));
        assert_eq!(
            resolve(&root, "/assets/my%20font.ttf"),
            Resolution::File(root.join("assets/my font.ttf"))
        );
        assert_eq!(resolve(&root, "/missing.js"), Resolution::NotFound);
    }

    #[test]
    fn test_resolve_refuses_traversal() {
        let (_temp, root) = served_root();

        assert_eq!(resolve(&root, "/../secret.txt"), Resolution::Forbidden);
        assert_eq!(resolve(&root, "/%2e%2e/secret.txt"), Resolution::Forbidden);
        assert_eq!(resolve(&root, "/assets/..%2f..%2fsecret.txt"), Resolution::Forbidden);
        assert_eq!(resolve(&root, "/bad%zz"), Resolution::Forbidden);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_refuses_symlink_escape() {
        let (_temp, root) = served_root();
        std::os::unix::fs::symlink(root.parent().unwrap().join("secret.txt"), root.join("link.txt"))
            .unwrap();

        assert_eq!(resolve(&root, "/link.txt"), Resolution::Forbidden);
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type(Utf8Path::new("main.wasm")), "application/wasm");
        assert_eq!(content_type(Utf8Path::new("main.JS")), "text/javascript; charset=utf-8");
        assert_eq!(content_type(Utf8Path::new("blob")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_get_and_head() {
        let (_temp, root) = served_root();

        let get = respond(&root, &Method::GET, "/main.html").await;
        assert_eq!(get.status(), StatusCode::OK);
        assert_eq!(get.headers()[header::CONTENT_TYPE], "text/html; charset=utf-8");
        assert_eq!(get.headers()[header::CONTENT_LENGTH], "13");
        assert_eq!(body(get).await, "<html></html>");

        let head = respond(&root, &Method::HEAD, "/main.wasm").await;
        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(head.headers()[header::CONTENT_TYPE], "application/wasm");
        assert_eq!(head.headers()[header::CONTENT_LENGTH], "4");
        assert!(body(head).await.is_empty());
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (_temp, root) = served_root();

        let missing = respond(&root, &Method::GET, "/nope").await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let post = respond(&root, &Method::POST, "/main.html").await;
        assert_eq!(post.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(post.headers()[header::ALLOW], "GET, HEAD");

        let escape = respond(&root, &Method::GET, "/../secret.txt").await;
        assert_eq!(escape.status(), StatusCode::FORBIDDEN);
        assert!(!String::from_utf8_lossy(&body(escape).await).contains("secret"));
    }

    #[tokio::test]
    async fn test_connection_answers_once_and_closes() {
        let (_temp, root) = served_root();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let connection = tokio::spawn(serve_connection(server, Arc::new(root)));

        client
            .write_all(b"GET /main.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.to_ascii_lowercase().contains("connection: close"));
        assert!(response.ends_with("<html></html>"));
        connection.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unterminated_request_line_is_bounded() {
        let (_temp, root) = served_root();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let connection = tokio::spawn(serve_connection(server, Arc::new(root)));

        // Far more than the head limit and never a newline
        let flood = vec![b'A'; MAX_HEAD_BYTES * 4];
        let _ = client.write_all(&flood).await;
        let mut response = Vec::new();
        let _ = client.read_to_end(&mut response).await;

        // The connection ends with an error instead of buffering forever
        let finished = tokio::time::timeout(std::time::Duration::from_secs(5), connection)
            .await
            .unwrap();
        assert!(finished.unwrap().is_err());
        let response = String::from_utf8_lossy(&response);
        assert!(response.is_empty() || response.starts_with("HTTP/1.1 4"));
    }
}
