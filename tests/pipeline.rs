//! End-to-end pipeliner scenarios against a scripted federation server
//! built from this crate's own acceptor.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};

use fedlink::client::{Client, Request, RequestOpts};
use fedlink::exec::{self, Runtime, SpawnOpts};
use fedlink::net::{AcceptorOpts, CloseOpts, CloseType, HostPort, Listener, Socket};
use fedlink::Config;

fn client_config() -> Config {
    let mut config = Config::default();
    // the scripted server's certificate is self-signed
    config.verify_certificate = false;
    config
}

fn run<T: 'static>(config: Config, main: impl Future<Output = T> + 'static) -> T {
    Runtime::new(config).expect("runtime").run(main)
}

fn acceptor_opts() -> AcceptorOpts {
    let ck = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let mut opts = AcceptorOpts::from_config(&Config::default());
    opts.certificate_pem = Some(ck.cert.pem().into_bytes());
    opts.private_key_pem = Some(ck.key_pair.serialize_pem().into_bytes());
    opts
}

/// Rolling request reader for one accepted connection. Read failures
/// surface as `None`/`false` so a handler outliving the client just
/// returns.
struct Conn {
    sock: Rc<Socket>,
    buf: Vec<u8>,
}

impl Conn {
    fn new(sock: Rc<Socket>) -> Conn {
        Conn {
            sock,
            buf: Vec::new(),
        }
    }

    /// Await one complete request head; returns it as text.
    async fn next_head(&mut self) -> Option<String> {
        loop {
            if let Some(head) = self.take_head() {
                return Some(head);
            }
            let mut tmp = [0u8; 2048];
            match self.sock.read_few(&mut tmp).await {
                Ok(n) => self.buf.extend_from_slice(&tmp[..n]),
                Err(_) => return None,
            }
        }
    }

    /// Drain whatever has arrived and count complete heads consumed.
    fn drain_heads(&mut self) -> usize {
        let mut tmp = [0u8; 4096];
        loop {
            match self.sock.read_any(&mut tmp) {
                Ok(0) | Err(_) => break,
                Ok(n) => self.buf.extend_from_slice(&tmp[..n]),
            }
        }
        let mut count = 0;
        while self.take_head().is_some() {
            count += 1;
        }
        count
    }

    /// Take `want` body bytes (head leftovers first).
    async fn eat_body(&mut self, want: usize) -> bool {
        let mut have = self.buf.len().min(want);
        self.buf.drain(..have);
        let mut tmp = [0u8; 2048];
        while have < want {
            match self.sock.read_few(&mut tmp[..(want - have).min(2048)]).await {
                Ok(n) => have += n,
                Err(_) => return false,
            }
        }
        true
    }

    fn take_head(&mut self) -> Option<String> {
        let end = self
            .buf
            .windows(4)
            .position(|window| window == b"\r\n\r\n")?;
        let head: Vec<u8> = self.buf.drain(..end + 4).collect();
        Some(String::from_utf8_lossy(&head).into_owned())
    }

    async fn send(&self, bytes: &[u8]) -> bool {
        self.sock.write_all(bytes).await.is_ok()
    }
}

fn serve<F, Fut>(handler: F) -> (Listener, HostPort)
where
    F: Fn(Conn) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    let handler = Rc::new(handler);
    let listener = Listener::new(
        "mock",
        "127.0.0.1:0".parse().unwrap(),
        acceptor_opts(),
        Box::new(move |sock| {
            let handler = handler.clone();
            exec::spawn(SpawnOpts::default().detached(), async move {
                (*handler)(Conn::new(sock)).await;
            })
            .detach();
        }),
        None,
    )
    .expect("listener");
    let addr = listener.local_addr().unwrap();
    (listener, HostPort::new(addr.ip().to_string(), addr.port()))
}

fn get_request(path: &str) -> Request {
    Request::new(format!(
        "GET {} HTTP/1.1\r\nHost: mock\r\nUser-Agent: fedlink-test\r\n\r\n",
        path
    ))
}

#[test]
fn healthy_get() {
    run(client_config(), async {
        let (listener, hostport) = serve(|mut conn| async move {
            let head = conn.next_head().await.unwrap();
            assert!(head.starts_with("GET /path HTTP/1.1"));
            conn.send(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await;
        });

        let client = Client::new(client_config()).unwrap();
        let response = client
            .submit(&hostport, get_request("/path"))
            .get()
            .await
            .unwrap();
        assert_eq!(response.status.as_u16(), 200);
        assert_eq!(&response.content[..], b"hello");

        client.shutdown().await;
        listener.close().await.unwrap();
    });
}

#[test]
fn chunked_into_contiguous_buffer() {
    run(client_config(), async {
        let (listener, hostport) = serve(|mut conn| async move {
            conn.next_head().await.unwrap();
            conn.send(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
            )
            .await;
        });

        let client = Client::new(client_config()).unwrap();
        let request = get_request("/chunked").in_content(11);
        let response = client.submit(&hostport, request).get().await.unwrap();
        assert_eq!(response.status.as_u16(), 200);
        assert_eq!(&response.content[..], b"hello world");
        assert!(response.chunks.is_empty());

        client.shutdown().await;
        listener.close().await.unwrap();
    });
}

#[test]
fn chunked_dynamic_modes() {
    run(client_config(), async {
        let hits = Rc::new(Cell::new(0));
        let server_hits = hits.clone();
        let (listener, hostport) = serve(move |mut conn| {
            let hits = server_hits.clone();
            async move {
                while conn.next_head().await.is_some() {
                    hits.set(hits.get() + 1);
                    if !conn
                        .send(
                            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
                        )
                        .await
                    {
                        return;
                    }
                }
            }
        });

        let client = Client::new(client_config()).unwrap();

        // chunk vector preserved
        let response = client
            .submit(&hostport, get_request("/a"))
            .get()
            .await
            .unwrap();
        assert!(response.content.is_empty());
        assert_eq!(response.chunks.len(), 2);
        assert_eq!(&response.chunks[0][..], b"hello");
        assert_eq!(&response.chunks[1][..], b" world");

        // concatenated at completion
        let mut opts = RequestOpts::default();
        opts.contiguous_content = true;
        let request = get_request("/b").opt(opts);
        let response = client.submit(&hostport, request).get().await.unwrap();
        assert_eq!(&response.content[..], b"hello world");
        assert!(response.chunks.is_empty());

        assert_eq!(hits.get(), 2);
        client.shutdown().await;
        listener.close().await.unwrap();
    });
}

#[test]
fn upstream_failure_latches_the_peer() {
    run(client_config(), async {
        let (listener, hostport) = serve(|mut conn| async move {
            conn.next_head().await.unwrap();
            conn.send(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                .await;
        });

        let client = Client::new(client_config()).unwrap();

        // the 502 itself is delivered normally
        let response = client
            .submit(&hostport, get_request("/first"))
            .get()
            .await
            .unwrap();
        assert_eq!(response.status.as_u16(), 502);
        assert!(client.errant(&hostport));

        // inside the cool-down a new submission is refused immediately
        let before = Instant::now();
        let err = client
            .submit(&hostport, get_request("/second"))
            .get()
            .await
            .unwrap_err();
        assert!(err.is_unavailable(), "got {:?}", err);
        assert!(before.elapsed() < Duration::from_secs(1));

        client.shutdown().await;
        listener.close().await.unwrap();
    });
}

#[test]
fn http_exceptions_turn_statuses_into_errors() {
    run(client_config(), async {
        let (listener, hostport) = serve(|mut conn| async move {
            conn.next_head().await.unwrap();
            conn.send(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await;
        });

        let client = Client::new(client_config()).unwrap();
        let mut opts = RequestOpts::default();
        opts.http_exceptions = true;
        let err = client
            .submit(&hostport, get_request("/missing").opt(opts))
            .get()
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));

        client.shutdown().await;
        listener.close().await.unwrap();
    });
}

#[test]
fn pipeline_preserves_order_on_one_link() {
    let mut config = client_config();
    config.link_max = 1;
    run(config.clone(), async move {
        let (listener, hostport) = serve(|mut conn| async move {
            for i in 0..3 {
                let head = conn.next_head().await.unwrap();
                assert!(head.contains(&format!("/req{}", i)), "order broken: {}", head);
                conn.send(
                    format!("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nr{}", i).as_bytes(),
                )
                .await;
            }
        });

        let client = Client::new(config).unwrap();
        let handles: Vec<_> = (0..3)
            .map(|i| client.submit(&hostport, get_request(&format!("/req{}", i))))
            .collect();
        assert!(client.link_count() <= 1);

        for (i, handle) in handles.into_iter().enumerate() {
            let response = handle.get().await.unwrap();
            assert_eq!(response.content, format!("r{}", i));
        }
        assert!(client.link_count() <= 1);

        client.shutdown().await;
        listener.close().await.unwrap();
    });
}

#[test]
fn commit_cap_paces_the_pipeline() {
    let mut config = client_config();
    config.link_max = 1;
    run(config.clone(), async move {
        let first_wave = Rc::new(Cell::new(0usize));
        let wave = first_wave.clone();
        let (listener, hostport) = serve(move |mut conn| {
            let wave = wave.clone();
            async move {
                // let the writer drain as far as the pipeline cap allows
                exec::sleep(Duration::from_millis(300)).await.unwrap();
                let heads = conn.drain_heads();
                wave.set(heads);
                for i in 0..heads {
                    conn.send(
                        format!("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nw{}", i)
                            .as_bytes(),
                    )
                    .await;
                }
                // completions free capacity; the rest arrive now
                let mut served = heads;
                while served < 5 {
                    if conn.next_head().await.is_none() {
                        return;
                    }
                    conn.send(
                        format!("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nw{}", served)
                            .as_bytes(),
                    )
                    .await;
                    served += 1;
                }
            }
        });

        let client = Client::new(config).unwrap();
        let handles: Vec<_> = (0..5)
            .map(|i| client.submit(&hostport, get_request(&format!("/cap{}", i))))
            .collect();
        for handle in handles {
            handle.get().await.unwrap();
        }
        // only tag_commit_max requests may be on the wire before any
        // response arrives
        assert_eq!(first_wave.get(), 3);

        client.shutdown().await;
        listener.close().await.unwrap();
    });
}

#[test]
fn canceled_committed_request_drains_invisibly() {
    let mut config = client_config();
    config.link_max = 1;
    run(config.clone(), async move {
        let (listener, hostport) = serve(|mut conn| async move {
            let first = conn.next_head().await.unwrap();
            assert!(first.contains("/doomed"));
            let second = conn.next_head().await.unwrap();
            assert!(second.contains("/survivor"));
            conn.send(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\ndiscard")
                .await;
            conn.send(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nkept")
                .await;
        });

        let client = Client::new(config).unwrap();
        let mut doomed = client.submit(&hostport, get_request("/doomed"));
        let survivor = client.submit(&hostport, get_request("/survivor"));

        while !doomed.committed() {
            exec::yield_now().await.unwrap();
        }
        doomed.cancel();
        let err = doomed.get().await.unwrap_err();
        assert!(err.is_canceled());

        // the canceled response is consumed off the wire without touching
        // its successor
        let response = survivor.get().await.unwrap();
        assert_eq!(&response.content[..], b"kept");

        client.shutdown().await;
        listener.close().await.unwrap();
    });
}

#[test]
fn fully_canceled_pipeline_resets_the_link() {
    let mut config = client_config();
    config.link_max = 1;
    run(config.clone(), async move {
        let (listener, hostport) = serve(|mut conn| async move {
            // read the head, answer nothing; tolerate the reset
            let mut tmp = [0u8; 1024];
            while conn.sock.read_few(&mut tmp).await.is_ok() {}
            let _ = conn
                .sock
                .disconnect(CloseOpts {
                    r#type: CloseType::Rst,
                    timeout: Duration::from_secs(1),
                })
                .await;
        });

        let client = Client::new(config).unwrap();
        let mut handle = client.submit(&hostport, get_request("/only"));
        while !handle.committed() {
            exec::yield_now().await.unwrap();
        }
        handle.cancel();
        let err = handle.get().await.unwrap_err();
        assert!(err.is_canceled());

        // with nothing but canceled tags the link is cut short
        let deadline = Instant::now() + Duration::from_secs(5);
        while client.link_count() > 0 && Instant::now() < deadline {
            exec::sleep(Duration::from_millis(10)).await.unwrap();
        }
        assert_eq!(client.link_count(), 0);

        client.shutdown().await;
        listener.close().await.unwrap();
    });
}

#[test]
fn server_banner_is_captured_once() {
    run(client_config(), async {
        let (listener, hostport) = serve(|mut conn| async move {
            while conn.next_head().await.is_some() {
                if !conn
                    .send(
                        b"HTTP/1.1 200 OK\r\nServer: synapse/1.99\r\nContent-Length: 0\r\n\r\n",
                    )
                    .await
                {
                    return;
                }
            }
        });

        let client = Client::new(client_config()).unwrap();
        assert!(client.server_version(&hostport).is_none());
        client
            .submit(&hostport, get_request("/v"))
            .get()
            .await
            .unwrap();
        assert_eq!(
            client.server_version(&hostport).as_deref(),
            Some("synapse/1.99")
        );

        client.shutdown().await;
        listener.close().await.unwrap();
    });
}

#[test]
fn response_header_lookup() {
    run(client_config(), async {
        let (listener, hostport) = serve(|mut conn| async move {
            conn.next_head().await.unwrap();
            conn.send(
                b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}",
            )
            .await;
        });

        let client = Client::new(client_config()).unwrap();
        let response = client
            .submit(&hostport, get_request("/json"))
            .get()
            .await
            .unwrap();
        assert_eq!(
            response.header("content-type").as_deref(),
            Some("application/json")
        );
        assert_eq!(response.body(), b"{}");

        client.shutdown().await;
        listener.close().await.unwrap();
    });
}

#[test]
fn write_progress_callback_sees_the_content() {
    run(client_config(), async {
        let (listener, hostport) = serve(|mut conn| async move {
            conn.next_head().await.unwrap();
            if !conn.eat_body(8).await {
                return;
            }
            conn.send(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        });

        let client = Client::new(client_config()).unwrap();
        let progressed: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
        let seen = progressed.clone();
        let mut request = Request::new(
            "PUT /send HTTP/1.1\r\nHost: mock\r\nContent-Length: 8\r\n\r\n",
        )
        .content("fedlink!");
        request.progress = Some(Box::new(move |_slice, total| {
            seen.borrow_mut().push(total);
        }));

        let response = client.submit(&hostport, request).get().await.unwrap();
        assert_eq!(response.status.as_u16(), 200);
        let progressed = progressed.borrow();
        assert_eq!(*progressed.last().unwrap(), 8);

        client.shutdown().await;
        listener.close().await.unwrap();
    });
}
