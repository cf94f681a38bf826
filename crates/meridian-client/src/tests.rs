//! End-to-end tests against an in-process mock database.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use meridian_wire::{
    ClientData, Procedure, StatusCode, Value, WireType, CONNECTION_LOST_MESSAGE,
};

use crate::{callback, Client, ClientConfig, ClientError, StatusListener};

use mock::{Action, MockServer, PASSWORD, USERNAME};

/// A minimal scriptable database node: accepts one connection, answers the
/// login handshake, then feeds every invocation to a behavior closure.
mod mock {
    use std::io::{Read, Write};
    use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
    use std::thread::{self, JoinHandle};

    use bytes::{BufMut, Bytes, BytesMut};
    use sha1::{Digest, Sha1};

    use meridian_wire::{put_string, ByteBuffer, Value, WireType};

    pub const USERNAME: &str = "ops";
    pub const PASSWORD: &str = "secret";

    /// One decoded invocation request.
    pub struct Invocation {
        pub procedure: String,
        pub client_data: i64,
        pub params: Vec<Value>,
    }

    /// What the server does after reading an invocation.
    pub enum Action {
        /// Write these framed bytes to the client.
        Reply(Vec<Bytes>),
        /// Say nothing and keep reading.
        Stay,
        /// Close the socket.
        Close,
    }

    pub struct MockServer {
        addr: SocketAddr,
        _handle: JoinHandle<()>,
    }

    impl MockServer {
        pub fn start<F>(mut behavior: F) -> Self
        where
            F: FnMut(Invocation) -> Action + Send + 'static,
        {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let handle = thread::spawn(move || {
                let Ok((mut socket, _)) = listener.accept() else {
                    return;
                };
                if !handshake(&mut socket) {
                    return;
                }
                loop {
                    let Some(frame) = read_frame(&mut socket) else {
                        return;
                    };
                    match behavior(parse_invocation(frame)) {
                        Action::Reply(frames) => {
                            for frame in frames {
                                if socket.write_all(&frame).is_err() {
                                    return;
                                }
                            }
                        }
                        Action::Stay => {}
                        Action::Close => {
                            let _ = socket.shutdown(Shutdown::Both);
                            return;
                        }
                    }
                }
            });
            Self {
                addr,
                _handle: handle,
            }
        }

        pub fn port(&self) -> u16 {
            self.addr.port()
        }
    }

    /// Validates the login request and answers it. Returns `false` when the
    /// credentials were rejected.
    fn handshake(socket: &mut TcpStream) -> bool {
        let Some(frame) = read_frame(socket) else {
            return false;
        };
        let mut buf = ByteBuffer::new(frame.clone());
        assert_eq!(buf.get_i8().unwrap(), 1);
        assert_eq!(buf.get_string().unwrap().as_deref(), Some("database"));
        let _service = buf.get_string().unwrap().unwrap();
        let username = buf.get_string().unwrap().unwrap();
        assert_eq!(buf.remaining(), 20);

        let expected: [u8; 20] = Sha1::digest(PASSWORD.as_bytes()).into();
        let accepted = username == USERNAME && frame[frame.len() - 20..] == expected;

        let mut payload = BytesMut::new();
        payload.put_i8(0); // version
        payload.put_i8(if accepted { 0 } else { -1 });
        payload.put_i32(3); // host id
        payload.put_i64(42); // connection id
        payload.put_i64(1_700_000_000_000); // cluster start timestamp
        payload.put_i32(0); // leader ip
        put_string(&mut payload, Some("mock-9.9"));
        let _ = socket.write_all(&frame_up(payload));
        accepted
    }

    fn read_frame(socket: &mut TcpStream) -> Option<Bytes> {
        let mut prefix = [0u8; 4];
        socket.read_exact(&mut prefix).ok()?;
        let len = i32::from_be_bytes(prefix);
        assert!(len >= 0);
        let mut payload = vec![0u8; len as usize];
        socket.read_exact(&mut payload).ok()?;
        Some(Bytes::from(payload))
    }

    fn parse_invocation(frame: Bytes) -> Invocation {
        let mut buf = ByteBuffer::new(frame);
        assert_eq!(buf.get_i8().unwrap(), 0);
        let procedure = buf.get_string().unwrap().unwrap();
        let client_data = buf.get_i64().unwrap();
        let count = buf.get_i16().unwrap();
        let mut params = Vec::with_capacity(count as usize);
        for _ in 0..count {
            params.push(Value::decode_tagged(&mut buf).unwrap());
        }
        assert!(buf.is_exhausted());
        Invocation {
            procedure,
            client_data,
            params,
        }
    }

    fn frame_up(payload: BytesMut) -> Bytes {
        let mut framed = BytesMut::with_capacity(4 + payload.len());
        framed.put_i32(payload.len() as i32);
        framed.put_slice(&payload);
        framed.freeze()
    }

    /// Builds a framed invocation response.
    pub fn response(
        client_data: i64,
        status: i8,
        status_string: Option<&str>,
        tables: &[Bytes],
    ) -> Bytes {
        let mut present = 0u8;
        if status_string.is_some() {
            present |= 1 << 5;
        }

        let mut payload = BytesMut::new();
        payload.put_i8(0); // version
        payload.put_i64(client_data);
        payload.put_u8(present);
        payload.put_i8(status);
        if let Some(s) = status_string {
            put_string(&mut payload, Some(s));
        }
        payload.put_i8(i8::MIN); // app status
        payload.put_i32(1); // cluster round trip time
        payload.put_i16(tables.len() as i16);
        for table in tables {
            payload.put_i32(table.len() as i32);
            payload.put_slice(table);
        }
        frame_up(payload)
    }

    pub fn success(client_data: i64) -> Bytes {
        response(client_data, 1, None, &[])
    }

    /// Builds a table payload in the server's layout.
    pub fn table(columns: &[(&str, WireType)], rows: &[Vec<Value>]) -> Bytes {
        let mut meta = BytesMut::new();
        meta.put_i8(-128);
        meta.put_i16(columns.len() as i16);
        for (_, ty) in columns {
            meta.put_i8(ty.code());
        }
        for (name, _) in columns {
            put_string(&mut meta, Some(name));
        }

        let mut buf = BytesMut::new();
        buf.put_i32(meta.len() as i32);
        buf.put_slice(&meta);
        buf.put_i32(rows.len() as i32);
        for row in rows {
            let mut body = BytesMut::new();
            for value in row {
                match value {
                    Value::Integer(v) => body.put_i32(*v),
                    Value::BigInt(v) => body.put_i64(*v),
                    Value::Text(v) => put_string(&mut body, Some(v)),
                    other => panic!("unsupported test column {other:?}"),
                }
            }
            buf.put_i32(body.len() as i32);
            buf.put_slice(&body);
        }
        buf.freeze()
    }

    /// A frame whose declared length is above the protocol maximum.
    pub fn oversized_frame() -> Bytes {
        let mut framed = BytesMut::new();
        framed.put_i32(60_000_000);
        framed.put_slice(b"garbage");
        framed.freeze()
    }
}

/// Records every listener notification for later assertions.
#[derive(Default)]
struct Recorder {
    backpressure_events: Vec<bool>,
    lost: Vec<(String, usize)>,
    exceptions: Vec<String>,
    /// When set, the recorder asks `submit` to reject instead of block.
    reject: bool,
}

impl StatusListener for Recorder {
    fn connection_lost(&mut self, hostname: &str, connections_left: usize) {
        self.lost.push((hostname.to_string(), connections_left));
    }

    fn backpressure(&mut self, active: bool) -> bool {
        self.backpressure_events.push(active);
        !self.reject
    }

    fn uncaught_exception(&mut self, message: &str, _handle: ClientData) {
        self.exceptions.push(message.to_string());
    }
}

fn connect(server: &MockServer) -> Client {
    let mut client = Client::new().unwrap();
    client
        .create_connection("127.0.0.1", server.port(), USERNAME, PASSWORD)
        .unwrap();
    client
}

fn connect_with(server: &MockServer, recorder: Rc<RefCell<Recorder>>, config: ClientConfig) -> Client {
    let listener: crate::SharedListener = recorder;
    let mut client = Client::with_config(Some(listener), config).unwrap();
    client
        .create_connection("127.0.0.1", server.port(), USERNAME, PASSWORD)
        .unwrap();
    client
}

#[test]
fn ping_round_trip() {
    let server = MockServer::start(|inv| {
        assert_eq!(inv.procedure, "@Ping");
        assert!(inv.params.is_empty());
        Action::Reply(vec![mock::success(inv.client_data)])
    });
    let mut client = connect(&server);

    let response = client.invoke(&Procedure::new("@Ping", 0)).unwrap();
    assert!(response.success());
    assert_eq!(response.status_code(), 1);
    assert_eq!(response.status_string(), "");
    assert!(response.results().is_empty());
}

#[test]
fn echo_returns_the_submitted_row() {
    let server = MockServer::start(|inv| {
        assert_eq!(inv.procedure, "Echo");
        let table = mock::table(
            &[("A", WireType::Integer), ("B", WireType::Text)],
            &[vec![inv.params[0].clone(), inv.params[1].clone()]],
        );
        Action::Reply(vec![mock::response(inv.client_data, 1, None, &[table])])
    });
    let mut client = connect(&server);

    let mut echo = Procedure::new("Echo", 2);
    echo.set_param(0, Value::Integer(42)).unwrap();
    echo.set_param(1, Value::Text("hi".into())).unwrap();

    let response = client.invoke(&echo).unwrap();
    assert!(response.success());
    assert_eq!(response.results().len(), 1);

    let rows: Vec<_> = response.results()[0]
        .rows()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].values(),
        &[Value::Integer(42), Value::Text("hi".into())]
    );
}

#[test]
fn graceful_failure_carries_the_status_string() {
    let server = MockServer::start(|inv| {
        Action::Reply(vec![mock::response(
            inv.client_data,
            -2,
            Some("constraint"),
            &[],
        )])
    });
    let mut client = connect(&server);

    let response = client.invoke(&Procedure::new("Bad", 0)).unwrap();
    assert!(response.failure());
    assert_eq!(response.status(), StatusCode::GracefulFailure);
    assert_eq!(response.status_string(), "constraint");
    assert!(response.results().is_empty());
}

#[test]
fn unbound_parameters_fail_before_submission() {
    let server = MockServer::start(|_| Action::Stay);
    let mut client = connect(&server);

    let proc = Procedure::new("Insert", 2);
    assert!(matches!(
        client.invoke(&proc),
        Err(ClientError::UninitializedParams)
    ));
}

#[test]
fn backpressure_blocks_the_next_submission_until_a_response_arrives() {
    let server = MockServer::start(|inv| Action::Reply(vec![mock::success(inv.client_data)]));
    let recorder = Rc::new(RefCell::new(Recorder::default()));
    let mut client = connect_with(&server, recorder.clone(), ClientConfig::default());

    let delivered = Rc::new(Cell::new(0usize));
    let proc = Procedure::new("@Ping", 0);
    for _ in 0..1000 {
        let delivered = delivered.clone();
        client
            .submit(
                &proc,
                callback(move |_client, response| {
                    assert!(response.success());
                    delivered.set(delivered.get() + 1);
                    false
                }),
            )
            .unwrap();
    }
    // Nothing has been pumped yet: all 1000 are outstanding.
    assert_eq!(client.outstanding_count(), 1000);
    assert_eq!(delivered.get(), 0);

    // Call 1001 hits the high-water mark and suspends until at least one
    // response has been processed.
    {
        let delivered = delivered.clone();
        client
            .submit(
                &proc,
                callback(move |_client, _response| {
                    delivered.set(delivered.get() + 1);
                    false
                }),
            )
            .unwrap();
    }
    assert!(delivered.get() >= 1);
    assert_eq!(recorder.borrow().backpressure_events, vec![true]);

    assert!(client.drain().unwrap());
    assert_eq!(delivered.get(), 1001);
    assert_eq!(client.outstanding_count(), 0);

    // The off edge fired exactly once, when everything drained.
    let events = recorder.borrow().backpressure_events.clone();
    assert_eq!(events.iter().filter(|&&e| !e).count(), 1);
    assert_eq!(events.last(), Some(&false));
}

#[test]
fn listener_may_reject_instead_of_blocking() {
    let server = MockServer::start(|_| Action::Stay);
    let recorder = Rc::new(RefCell::new(Recorder {
        reject: true,
        ..Recorder::default()
    }));
    let config = ClientConfig {
        max_outstanding_per_connection: 2,
        ..ClientConfig::default()
    };
    let mut client = connect_with(&server, recorder.clone(), config);

    let proc = Procedure::new("Slow", 0);
    client.submit(&proc, callback(|_, _| false)).unwrap();
    client.submit(&proc, callback(|_, _| false)).unwrap();
    assert!(matches!(
        client.submit(&proc, callback(|_, _| false)),
        Err(ClientError::BackpressureRejected)
    ));
    // Repeated rejections in the same episode reuse the decision; the on
    // edge is reported exactly once.
    assert!(matches!(
        client.submit(&proc, callback(|_, _| false)),
        Err(ClientError::BackpressureRejected)
    ));
    assert_eq!(recorder.borrow().backpressure_events, vec![true]);
}

#[test]
fn connection_loss_synthesizes_responses_in_submission_order() {
    let server = MockServer::start({
        let mut seen = 0;
        move |_inv| {
            seen += 1;
            if seen == 3 {
                Action::Close
            } else {
                Action::Stay
            }
        }
    });
    let recorder = Rc::new(RefCell::new(Recorder::default()));
    let mut client = connect_with(&server, recorder.clone(), ClientConfig::default());

    let order = Rc::new(RefCell::new(Vec::new()));
    let proc = Procedure::new("@Ping", 0);
    for i in 0..3 {
        let order = order.clone();
        client
            .submit(
                &proc,
                callback(move |_client, response| {
                    assert_eq!(response.status(), StatusCode::ConnectionLost);
                    assert_eq!(response.status_code(), -4);
                    assert_eq!(response.status_string(), CONNECTION_LOST_MESSAGE);
                    order.borrow_mut().push(i);
                    false
                }),
            )
            .unwrap();
    }

    assert!(client.drain().unwrap());
    assert_eq!(*order.borrow(), vec![0, 1, 2]);
    assert_eq!(client.connection_count(), 0);
    assert_eq!(recorder.borrow().lost, vec![("127.0.0.1".to_string(), 0)]);

    // With the only connection gone the loop has nothing to run on.
    assert!(matches!(client.run(), Err(ClientError::NoConnections)));
}

#[test]
fn break_leaves_the_remaining_callback_for_the_next_run() {
    let server = MockServer::start({
        let mut held = Vec::new();
        move |inv| {
            held.push(inv.client_data);
            if held.len() == 2 {
                Action::Reply(held.drain(..).map(mock::success).collect())
            } else {
                Action::Stay
            }
        }
    });
    let mut client = connect(&server);

    let delivered = Rc::new(RefCell::new(Vec::new()));
    let proc = Procedure::new("@Ping", 0);
    for i in 0..2 {
        let delivered = delivered.clone();
        client
            .submit(
                &proc,
                callback(move |_client, _response| {
                    delivered.borrow_mut().push(i);
                    true // break the loop
                }),
            )
            .unwrap();
    }

    client.run().unwrap();
    assert_eq!(*delivered.borrow(), vec![0]);

    client.run().unwrap();
    assert_eq!(*delivered.borrow(), vec![0, 1]);
}

#[test]
fn invoke_absorbs_a_break_from_an_earlier_callback() {
    // Both responses are released together, the breaking call's first, so
    // its frame is dispatched while invoke is still waiting for its own.
    let server = MockServer::start({
        let mut held = Vec::new();
        move |inv| {
            held.push(inv.client_data);
            if held.len() == 2 {
                Action::Reply(held.drain(..).map(mock::success).collect())
            } else {
                Action::Stay
            }
        }
    });
    let mut client = connect(&server);

    let first_done = Rc::new(Cell::new(false));
    {
        let first_done = first_done.clone();
        client
            .submit(
                &Procedure::new("@Ping", 0),
                callback(move |_client, _response| {
                    first_done.set(true);
                    true // request a break while invoke is waiting
                }),
            )
            .unwrap();
    }

    let response = client.invoke(&Procedure::new("@Ping", 0)).unwrap();
    assert!(response.success());
    assert!(first_done.get());
}

#[test]
fn run_once_consumes_a_break_and_delivers_the_rest_later() {
    let server = MockServer::start({
        let mut held = Vec::new();
        move |inv| {
            held.push(inv.client_data);
            if held.len() == 2 {
                Action::Reply(held.drain(..).map(mock::success).collect())
            } else {
                Action::Stay
            }
        }
    });
    let mut client = connect(&server);

    let delivered = Rc::new(RefCell::new(Vec::new()));
    let proc = Procedure::new("@Ping", 0);
    for i in 0..2 {
        let delivered = delivered.clone();
        client
            .submit(
                &proc,
                callback(move |_client, _response| {
                    delivered.borrow_mut().push(i);
                    true
                }),
            )
            .unwrap();
    }

    // The first break stops a pump early; later pumps must still deliver
    // the remaining buffered response.
    while delivered.borrow().len() < 2 {
        client.run_once().unwrap();
    }
    assert_eq!(*delivered.borrow(), vec![0, 1]);
}

#[test]
fn handles_are_unique_and_callbacks_fire_in_submission_order() {
    let server = MockServer::start(|inv| Action::Reply(vec![mock::success(inv.client_data)]));
    let mut client = connect(&server);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let proc = Procedure::new("@Ping", 0);
    for _ in 0..20 {
        let seen = seen.clone();
        client
            .submit(
                &proc,
                callback(move |_client, response| {
                    seen.borrow_mut().push(response.client_data().as_i64());
                    false
                }),
            )
            .unwrap();
    }
    assert!(client.drain().unwrap());

    let seen = seen.borrow();
    assert_eq!(seen.len(), 20);
    // Monotonic handles echoed in submission order imply both uniqueness
    // and ordered delivery.
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn response_with_unknown_handle_is_dropped_and_reported() {
    let server = MockServer::start(|inv| {
        Action::Reply(vec![
            mock::success(987_654_321),
            mock::success(inv.client_data),
        ])
    });
    let recorder = Rc::new(RefCell::new(Recorder::default()));
    let mut client = connect_with(&server, recorder.clone(), ClientConfig::default());

    let response = client.invoke(&Procedure::new("@Ping", 0)).unwrap();
    assert!(response.success());

    let exceptions = recorder.borrow().exceptions.clone();
    assert_eq!(exceptions.len(), 1);
    assert!(exceptions[0].contains("unknown handle"));
    // The bogus response did not disturb the connection.
    assert_eq!(client.connection_count(), 1);
}

#[test]
fn oversized_frame_is_a_protocol_error_that_closes_the_connection() {
    let server = MockServer::start(|_inv| Action::Reply(vec![mock::oversized_frame()]));
    let recorder = Rc::new(RefCell::new(Recorder::default()));
    let mut client = connect_with(&server, recorder.clone(), ClientConfig::default());

    let status = Rc::new(RefCell::new(None));
    {
        let status = status.clone();
        client
            .submit(
                &Procedure::new("@Ping", 0),
                callback(move |_client, response| {
                    *status.borrow_mut() = Some(response.status());
                    false
                }),
            )
            .unwrap();
    }

    assert!(client.drain().unwrap());
    assert_eq!(*status.borrow(), Some(StatusCode::ConnectionLost));
    assert_eq!(client.connection_count(), 0);
    assert_eq!(recorder.borrow().lost.len(), 1);
}

#[test]
fn panicking_callback_is_reported_and_the_loop_survives() {
    let server = MockServer::start(|inv| Action::Reply(vec![mock::success(inv.client_data)]));
    let recorder = Rc::new(RefCell::new(Recorder::default()));
    let mut client = connect_with(&server, recorder.clone(), ClientConfig::default());

    let proc = Procedure::new("@Ping", 0);
    client
        .submit(&proc, callback(|_client, _response| panic!("boom")))
        .unwrap();

    let second_done = Rc::new(Cell::new(false));
    {
        let second_done = second_done.clone();
        client
            .submit(
                &proc,
                callback(move |_client, _response| {
                    second_done.set(true);
                    false
                }),
            )
            .unwrap();
    }

    assert!(client.drain().unwrap());
    assert!(second_done.get());
    assert_eq!(recorder.borrow().exceptions, vec!["boom".to_string()]);
}

#[test]
fn reentrant_submit_from_a_callback_is_supported() {
    let server = MockServer::start(|inv| Action::Reply(vec![mock::success(inv.client_data)]));
    let mut client = connect(&server);

    let chained = Rc::new(Cell::new(false));
    let proc = Procedure::new("@Ping", 0);
    {
        let chained = chained.clone();
        let proc = proc.clone();
        client
            .submit(
                &proc.clone(),
                callback(move |client, _response| {
                    let chained = chained.clone();
                    client
                        .submit(
                            &proc,
                            callback(move |_client, response| {
                                assert!(response.success());
                                chained.set(true);
                                false
                            }),
                        )
                        .unwrap();
                    false
                }),
            )
            .unwrap();
    }

    assert!(client.drain().unwrap());
    assert!(chained.get());
}

#[test]
fn reentering_the_event_loop_from_a_callback_is_misuse() {
    let server = MockServer::start(|inv| Action::Reply(vec![mock::success(inv.client_data)]));
    let mut client = connect(&server);

    let saw_misuse = Rc::new(Cell::new(false));
    {
        let saw_misuse = saw_misuse.clone();
        client
            .submit(
                &Procedure::new("@Ping", 0),
                callback(move |client, _response| {
                    saw_misuse.set(matches!(client.run(), Err(ClientError::Misuse(_))));
                    false
                }),
            )
            .unwrap();
    }

    assert!(client.drain().unwrap());
    assert!(saw_misuse.get());
}

#[test]
fn draining_connection_refuses_submissions_then_closes_cleanly() {
    let server = MockServer::start(|inv| Action::Reply(vec![mock::success(inv.client_data)]));
    let recorder = Rc::new(RefCell::new(Recorder::default()));
    let mut client = connect_with(&server, recorder.clone(), ClientConfig::default());

    let done = Rc::new(Cell::new(false));
    {
        let done = done.clone();
        client
            .submit(
                &Procedure::new("@Ping", 0),
                callback(move |_client, response| {
                    assert!(response.success());
                    done.set(true);
                    false
                }),
            )
            .unwrap();
    }

    assert!(client.begin_drain("127.0.0.1"));
    assert!(matches!(
        client.submit(&Procedure::new("@Ping", 0), callback(|_, _| false)),
        Err(ClientError::NoConnections)
    ));

    // The in-flight call still completes, after which the connection goes
    // away without counting as lost.
    assert!(client.drain().unwrap());
    assert!(done.get());
    assert_eq!(client.connection_count(), 0);
    assert!(recorder.borrow().lost.is_empty());
}

#[test]
fn operations_without_connections_fail_fast() {
    let mut client = Client::new().unwrap();
    assert!(matches!(
        client.submit(&Procedure::new("@Ping", 0), callback(|_, _| false)),
        Err(ClientError::NoConnections)
    ));
    assert!(matches!(
        client.invoke(&Procedure::new("@Ping", 0)),
        Err(ClientError::NoConnections)
    ));
    assert!(matches!(client.run(), Err(ClientError::NoConnections)));
    assert!(matches!(client.run_once(), Err(ClientError::NoConnections)));
    assert!(matches!(client.drain(), Err(ClientError::NoConnections)));
}

#[test]
fn bad_credentials_fail_the_handshake() {
    let server = MockServer::start(|_| Action::Stay);
    let mut client = Client::new().unwrap();
    let err = client
        .create_connection("127.0.0.1", server.port(), USERNAME, "wrong-password")
        .unwrap_err();
    assert!(matches!(err, ClientError::ConnectFailure(_)));
    assert_eq!(client.connection_count(), 0);
}

#[test]
fn connecting_to_a_dead_port_fails() {
    // Grab a port the OS considers free, then close it again.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let mut client = Client::new().unwrap();
    let err = client
        .create_connection("127.0.0.1", port, USERNAME, PASSWORD)
        .unwrap_err();
    assert!(matches!(err, ClientError::ConnectFailure(_)));
}
