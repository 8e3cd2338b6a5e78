//! Loopback HTTP server with canned responses, for exercising the real
//! reqwest paths in unit tests.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub(crate) struct StubHttp {
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl StubHttp {
    /// Serve `responses` in order, one per connection; once they run out
    /// every request gets a 500.
    pub async fn start(responses: Vec<(u16, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(Mutex::new(VecDeque::from(responses)));

        let seen = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let next = queue.lock().pop_front().unwrap_or((500, String::new()));
                let seen = seen.clone();
                tokio::spawn(serve(stream, next, seen));
            }
        });
        Self { base_url, requests }
    }

    /// `METHOD /path?query` for each request, in arrival order.
    pub fn request_lines(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

// Records the request line before answering so the log order matches the
// order the client saw responses in.
async fn serve(mut stream: TcpStream, (status, body): (u16, String), seen: Arc<Mutex<Vec<String>>>) -> Option<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let request_line = head.lines().next().unwrap_or_default();
    let line = request_line.rsplit_once(' ').map(|(l, _)| l).unwrap_or(request_line).to_string();
    seen.lock().push(line);
    let response = format!(
        "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await.ok()?;
    let _ = stream.shutdown().await;
    Some(())
}
