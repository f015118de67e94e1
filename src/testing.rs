//! Loopback HTTP/1.1 origin for tests: HEAD, ranged GET, and a few knobs for
//! misbehaving on purpose.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

struct Hold {
    after: usize,
    release: Arc<Notify>,
}

pub struct ServerState {
    body: Vec<u8>,
    advertise_length: AtomicBool,
    honor_ranges: AtomicBool,
    answer_gets: AtomicBool,
    /// Range start -> bytes sent before the connection is dropped.
    cuts: Mutex<HashMap<u64, usize>>,
    /// Range start -> one-shot hold for the next request at that start.
    holds: Mutex<HashMap<u64, Hold>>,
    ranges: Mutex<Vec<(u64, u64)>>,
}

impl ServerState {
    pub fn set_advertise_length(&self, on: bool) {
        self.advertise_length.store(on, Ordering::SeqCst);
    }

    pub fn set_honor_ranges(&self, on: bool) {
        self.honor_ranges.store(on, Ordering::SeqCst);
    }

    /// GETs are recorded and then left without a response.
    pub fn set_answer_gets(&self, on: bool) {
        self.answer_gets.store(on, Ordering::SeqCst);
    }

    /// Every request whose range begins at `start` is cut short after `keep` bytes.
    pub fn cut_range(&self, start: u64, keep: usize) {
        self.cuts.lock().insert(start, keep);
    }

    pub fn clear_cuts(&self) {
        self.cuts.lock().clear();
    }

    /// The next ranged GET starting at `start` pauses after `after` bytes
    /// until the returned notify fires. If it never fires the response stalls
    /// forever.
    pub fn hold_range(&self, start: u64, after: usize) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        self.holds.lock().insert(
            start,
            Hold {
                after,
                release: release.clone(),
            },
        );
        release
    }

    pub fn requested_ranges(&self) -> Vec<(u64, u64)> {
        self.ranges.lock().clone()
    }

    pub fn clear_requests(&self) {
        self.ranges.lock().clear();
    }
}

pub struct TestServer {
    addr: SocketAddr,
    pub state: Arc<ServerState>,
}

impl TestServer {
    pub async fn start(body: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState {
            body,
            advertise_length: AtomicBool::new(true),
            honor_ranges: AtomicBool::new(true),
            answer_gets: AtomicBool::new(true),
            cuts: Mutex::new(HashMap::new()),
            holds: Mutex::new(HashMap::new()),
            ranges: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, state).await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}/files/archive.bin", self.addr)
    }
}

async fn serve(mut stream: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut scratch = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut scratch).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&scratch[..n]);
    }

    let head = String::from_utf8_lossy(&buf).to_string();
    let mut lines = head.split("\r\n");
    let method = lines
        .next()
        .and_then(|l| l.split_whitespace().next())
        .unwrap_or("GET")
        .to_string();
    let range = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("range"))
        .and_then(|(_, v)| parse_range(v.trim()));

    let total = state.body.len() as u64;

    if method == "HEAD" {
        let response = if state.advertise_length.load(Ordering::SeqCst) {
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
                total
            )
        } else {
            "HTTP/1.1 200 OK\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n".to_string()
        };
        stream.write_all(response.as_bytes()).await?;
        return stream.shutdown().await;
    }

    if let Some(range) = range {
        state.ranges.lock().push(range);
    }
    if !state.answer_gets.load(Ordering::SeqCst) {
        // Keep the connection open without ever sending a status line.
        return std::future::pending().await;
    }

    let (from, to) = match range {
        Some((from, to)) if state.honor_ranges.load(Ordering::SeqCst) && from < total => {
            (from, to.min(total - 1))
        }
        _ => {
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                total
            );
            stream.write_all(header.as_bytes()).await?;
            stream.write_all(&state.body).await?;
            return stream.shutdown().await;
        }
    };

    let slice = &state.body[from as usize..=to as usize];
    let header = format!(
        "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {}-{}/{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        from,
        to,
        total,
        slice.len()
    );
    stream.write_all(header.as_bytes()).await?;

    let cut = state.cuts.lock().get(&from).copied();
    if let Some(keep) = cut {
        stream.write_all(&slice[..keep.min(slice.len())]).await?;
        stream.flush().await?;
        return stream.shutdown().await;
    }

    let hold = state.holds.lock().remove(&from);
    if let Some(hold) = hold {
        let split = hold.after.min(slice.len());
        stream.write_all(&slice[..split]).await?;
        stream.flush().await?;
        hold.release.notified().await;
        stream.write_all(&slice[split..]).await?;
    } else {
        stream.write_all(slice).await?;
    }
    stream.flush().await?;
    stream.shutdown().await
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let range = value.strip_prefix("bytes=")?;
    let (from, to) = range.split_once('-')?;
    Some((from.trim().parse().ok()?, to.trim().parse().ok()?))
}
