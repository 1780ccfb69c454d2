use etude_core::{Config, EtudeResult, Server, ServerMetrics};
use std::fs;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tempfile::TempDir;

const INDEX: &str = "<html><body>etude</body></html>";

struct TestServer {
    addr: SocketAddr,
    metrics: Arc<ServerMetrics>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<EtudeResult<()>>>,
    _root: TempDir,
}

impl TestServer {
    fn start(tweak: impl FnOnce(&mut Config)) -> Self {
        let root = TempDir::new().unwrap();
        for (name, body) in [("index.html", INDEX), ("hello.txt", "hello world\n")] {
            let path = root.path().join(name);
            fs::write(&path, body).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        }

        let mut config = Config {
            port: 0,
            doc_root: root.path().to_path_buf(),
            workers: 2,
            max_connections: 64,
            ..Config::default()
        };
        tweak(&mut config);

        let server = Server::new(config).unwrap();
        let addr = server.local_addr().unwrap();
        let metrics = server.metrics();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.serve());

        Self {
            addr,
            metrics,
            shutdown,
            handle: Some(handle),
            _root: root,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    fn stop(&mut self) -> EtudeResult<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle.join().unwrap(),
            None => Ok(()),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Read one response off a kept-alive stream: the head, then exactly
/// Content-Length body bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let mut body = vec![0; len];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

#[test]
fn serves_index_and_closes() {
    let server = TestServer::start(|_| {});
    let mut stream = server.connect();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(res.contains("Connection: close\r\n"));
    assert!(res.contains(&format!("Content-Length: {}\r\n", INDEX.len())));
    assert!(res.ends_with(INDEX));
}

#[test]
fn keep_alive_serves_several_requests_on_one_connection() {
    let server = TestServer::start(|_| {});
    let mut stream = server.connect();

    for path in ["/hello.txt", "/index.html", "/missing.html"] {
        let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n");
        stream.write_all(req.as_bytes()).unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.contains("Connection: keep-alive\r\n"), "{head}");
        match path {
            "/hello.txt" => assert_eq!(body, b"hello world\n"),
            "/index.html" => assert_eq!(body, INDEX.as_bytes()),
            _ => assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n")),
        }
    }
}

#[test]
fn malformed_request_gets_400_and_close() {
    let server = TestServer::start(|_| {});
    let mut stream = server.connect();
    stream
        .write_all(b"FETCH / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();

    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(res.contains("Connection: close\r\n"));
}

#[test]
fn request_split_across_writes() {
    let server = TestServer::start(|_| {});
    let mut stream = server.connect();
    stream.set_nodelay(true).unwrap();

    stream.write_all(b"GET /hello.txt HTTP/1.1\r").unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"\nConnection: close\r\n").unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"\r\n").unwrap();

    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(res.ends_with("hello world\n"));
}

#[test]
fn half_closed_client_still_gets_its_response() {
    let server = TestServer::start(|_| {});
    let mut stream = server.connect();
    stream.write_all(b"GET /hello.txt HTTP/1.1\r\n\r\n").unwrap();
    stream.shutdown(Shutdown::Write).unwrap();

    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(res.ends_with("hello world\n"));
}

#[test]
fn half_closed_client_gets_a_body_larger_than_the_send_buffer() {
    let body: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let server = TestServer::start(|config| {
        let path = config.doc_root.join("big.bin");
        fs::write(&path, &body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
    });
    let mut stream = server.connect();
    stream.write_all(b"GET /big.bin HTTP/1.1\r\n\r\n").unwrap();
    stream.shutdown(Shutdown::Write).unwrap();
    // Let the server fill the send buffer before the client drains it.
    thread::sleep(Duration::from_millis(500));

    let mut res = Vec::new();
    stream.read_to_end(&mut res).unwrap();
    let split = res.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let head = String::from_utf8_lossy(&res[..split]);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains(&format!("Content-Length: {}\r\n", body.len())));
    assert_eq!(res.len() - split, body.len());
    assert!(res[split..] == body[..]);
}

#[test]
fn idle_connections_are_pruned() {
    let server = TestServer::start(|config| config.idle_timeout_secs = 1);
    let mut stream = server.connect();

    thread::sleep(Duration::from_millis(2500));
    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
    assert_eq!(server.metrics.live(), 0);
}

#[test]
fn shutdown_stops_serve_cleanly() {
    let mut server = TestServer::start(|_| {});
    let _open = server.connect();
    thread::sleep(Duration::from_millis(50));
    assert!(server.stop().is_ok());
    assert_eq!(server.metrics.live(), 0);
}
